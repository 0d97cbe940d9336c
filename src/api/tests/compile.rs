use std::collections::HashSet;
use std::path::Path;

use crate::annotate::{Backend, Purity};
use crate::api::{compile, CompileOptions, Program};
use crate::diagnostic::Diagnostic;
use crate::ir::ExprKind;

fn compile_ok(source: &str) -> Program {
    compile(source, Path::new("test.weft"), &CompileOptions::default()).unwrap_or_else(|errs| {
        panic!(
            "compile errors: {:?}",
            errs.iter().map(|e| &e.message).collect::<Vec<_>>()
        )
    })
}

fn compile_err(source: &str) -> Vec<Diagnostic> {
    compile(source, Path::new("test.weft"), &CompileOptions::default())
        .err()
        .expect("expected compile errors")
}

// ─── Scenarios ────────────────────────────────────────────────────

#[test]
fn test_scenario_visual_gradient() {
    let program = compile_ok("display[r, g, b] = [me.x, me.y, fract(me.t)]");
    let display = &program.bundles["display"];
    assert_eq!(display.width(), 3);
    assert_eq!(
        program.order,
        vec![crate::ir::ExecEntry {
            bundle: "display".to_string(),
            strands: vec![0, 1, 2],
        }]
    );
    let ann = &program.annotations["display"];
    assert_eq!(ann.backend, Backend::Visual);
    let domain: Vec<&str> = ann.domain.iter().map(|s| s.as_str()).collect();
    assert_eq!(domain, vec!["t", "x", "y"]);
}

#[test]
fn test_scenario_audio_sine() {
    let program = compile_ok("play[0] = sin(me.i / me.sampleRate * 440 * 6.28318) * 0.3");
    assert_eq!(program.width_of("play"), 1);
    let ann = &program.annotations["play"];
    assert_eq!(ann.backend, Backend::Audio);
    assert!(ann.domain.contains("i"));
    assert!(ann.domain.contains("sampleRate"));
    assert_eq!(ann.purity, Purity::Pure);
}

#[test]
fn test_scenario_cache() {
    let program = compile_ok("trail.v = cache(current.v, 2, 1, me.t)\ncurrent.v = me.x");
    assert_eq!(program.cache_descriptors.len(), 1);
    let d = &program.cache_descriptors[0];
    assert_eq!(d.history_size, 2);
    assert_eq!(d.domain, Backend::Visual);
    assert!(matches!(
        program.bundles["trail"].strands[0].expr.kind,
        ExprKind::CacheRead { .. }
    ));
    let order: Vec<&str> = program.order.iter().map(|e| e.bundle.as_str()).collect();
    assert_eq!(order, vec!["current", "trail"]);
}

#[test]
fn test_scenario_tags() {
    let program = compile_ok("a[x, y] = [me.x * $speed(2), me.y * $speed]");
    let speed = &program.bundles["$speed"];
    assert_eq!(speed.width(), 1);
    assert!(matches!(speed.strands[0].expr.kind, ExprKind::Num(n) if n == 2.0));
}

#[test]
fn test_scenario_unknown_bundle() {
    let errs = compile_err("display[r, g, b] = [missing.0, 0, 0]");
    assert!(errs[0].message.contains("unknown bundle 'missing'"));
    let loc = errs[0].location(&crate::preprocess::SourceMap::default());
    assert_eq!(loc.file, "<unknown>");
}

#[test]
fn test_scenario_spindle_widths() {
    compile_ok("spindle f(a, b) { return = [a + b] }\ng[0] = f(1, 2)");
    let errs = compile_err("spindle f(a, b) { return = [a + b] }\ng[0, 1] = f(1, 2)");
    assert!(errs[0].message.contains("width mismatch"));
}

// ─── Invariants ───────────────────────────────────────────────────

#[test]
fn test_execution_order_is_topological() {
    let program = compile_ok(
        "display[r, g, b] = [glow.0, base.0, 0]\nglow = base.0 * 0.5\nbase = me.x + me.y",
    );
    // Every read points at a strand scheduled earlier.
    let mut seen: HashSet<(String, u32)> = HashSet::new();
    for entry in &program.order {
        let bundle = &program.bundles[&entry.bundle];
        for &index in &entry.strands {
            bundle.strands[index as usize].expr.walk(&mut |e| {
                if let ExprKind::Index { bundle, index } = &e.kind {
                    if bundle != "me" {
                        if let crate::ir::IndexKey::Pos(pos) = index {
                            assert!(
                                seen.contains(&(bundle.clone(), *pos)),
                                "{}.{} read before being scheduled",
                                bundle,
                                pos
                            );
                        }
                    }
                }
            });
            seen.insert((entry.bundle.clone(), index));
        }
    }
}

#[test]
fn test_strand_names_match_outputs() {
    let program = compile_ok("pos[x, y] = [me.x, me.y]\ncolor[r, g, b] = [pos.x, pos.y, 0]");
    let pos = &program.bundles["pos"];
    assert_eq!(pos.strands[0].name, "x");
    assert_eq!(pos.strands[1].name, "y");
    for (i, strand) in pos.strands.iter().enumerate() {
        assert_eq!(strand.index, i as u32);
    }
}

#[test]
fn test_every_cache_read_has_descriptor() {
    let program = compile_ok(
        "a.v = cache(me.x, 4, 1, me.t)\nb.v = cache(a.v, 2, 1, me.t) + cache(me.y, 8, 2, me.t)",
    );
    for bundle in program.bundles.values() {
        for strand in &bundle.strands {
            strand.expr.walk(&mut |e| {
                if let ExprKind::CacheRead { id, .. } = &e.kind {
                    assert!(
                        program.cache_descriptors.iter().any(|d| &d.id == id),
                        "missing descriptor for '{}'",
                        id
                    );
                }
            });
        }
    }
}

#[test]
fn test_resource_channels_are_contiguous() {
    let program = compile_ok("display[r, g, b] = texture(\"img.png\", me.x, me.y)");
    assert_eq!(program.resources, vec!["img.png"]);
    let display = &program.bundles["display"];
    for (expected, strand) in display.strands.iter().enumerate() {
        match &strand.expr.kind {
            ExprKind::Builtin { args, .. } => {
                match args.last().map(|a| &a.kind) {
                    Some(ExprKind::Num(n)) => assert_eq!(*n, expected as f64),
                    other => panic!("expected channel literal, got {:?}", other),
                }
            }
            other => panic!("expected builtin, got {:?}", other),
        }
    }
}

#[test]
fn test_annotations_deterministic() {
    let source = "a = me.x\nplay[0] = sin(me.i)\ndisplay[r, g, b] = [a.0, me.y, me.t]";
    let first = compile_ok(source);
    let second = compile_ok(source);
    assert_eq!(first.annotations, second.annotations);
    assert_eq!(first.order, second.order);
    for (u1, u2) in first.units.iter().zip(&second.units) {
        assert_eq!(u1.fingerprint, u2.fingerprint);
    }
}

// ─── Boundaries ───────────────────────────────────────────────────

#[test]
fn test_empty_source() {
    let program = compile_ok("");
    assert!(program.bundles.is_empty());
    assert!(program.order.is_empty());
    assert!(program.units.is_empty());
}

#[test]
fn test_scalar_inferred_width() {
    let program = compile_ok("level = 0.5");
    assert_eq!(program.width_of("level"), 1);
}

#[test]
fn test_zero_size_range() {
    let program = compile_ok("empty = me.x | [.0 * (0..0)]");
    assert_eq!(program.width_of("empty"), 0);
}

#[test]
fn test_negative_range_is_error() {
    let errs = compile_err("x = me.x | [.0 * (0..-2)]");
    assert!(errs[0].message.contains("negative size"));
}

#[test]
fn test_circular_dependency_is_error() {
    let errs = compile_err("a.v = b.v\nb.v = a.v");
    assert!(errs[0].message.contains("circular dependency"));
}

#[test]
fn test_cache_breaks_circularity() {
    // The same shape compiles once one edge goes through a cache.
    compile_ok("a.v = cache(b.v, 2, 1, me.t)\nb.v = a.v * 0.5");
}

// ─── Full pipeline output ─────────────────────────────────────────

#[test]
fn test_mixed_program_units_and_summary() {
    let program = compile_ok(
        "scope[v] = sin(me.i * 0.01)\nplay[0] = scope.v * 0.2\ndisplay[r, g, b] = [scope.v, me.x, me.y]",
    );
    assert_eq!(program.units.len(), 2);
    let summary = program.summary_json();
    assert!(summary.contains("\"display\""));
    assert!(summary.contains("\"backend\": \"visual\""));
    assert!(summary.contains("\"backend\": \"audio\""));
    assert!(summary.contains("\"order\""));
}

#[test]
fn test_kernel_and_audio_outputs_present() {
    let program =
        compile_ok("display[r, g, b] = [me.x, me.y, 0]\nplay[0] = sin(me.i * 0.02) * 0.1");
    let visual = program
        .units
        .iter()
        .find(|u| u.backend == Backend::Visual)
        .expect("visual unit");
    assert!(visual.kernel.as_ref().unwrap().contains("@compute"));
    let audio = program
        .units
        .iter()
        .find(|u| u.backend == Backend::Audio)
        .expect("audio unit");
    assert!(audio.audio.is_some());
}

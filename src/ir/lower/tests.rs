use super::lower;
use crate::desugar::desugar;
use crate::diagnostic::Diagnostic;
use crate::ir::{BuiltinFn, ExprKind, IndexKey};
use crate::lexer::Lexer;
use crate::parser::Parser;

fn lower_src(source: &str) -> super::Lowered {
    let (tokens, diags) = Lexer::new(source).tokenize();
    assert!(diags.is_empty(), "lex errors: {:?}", diags);
    let file = Parser::new(tokens).parse_file().expect("parse");
    let file = desugar(file).expect("desugar");
    lower(&file).unwrap_or_else(|errs| {
        panic!(
            "lowering errors: {:?}",
            errs.iter().map(|e| &e.message).collect::<Vec<_>>()
        )
    })
}

fn lower_err(source: &str) -> Vec<Diagnostic> {
    let (tokens, diags) = Lexer::new(source).tokenize();
    assert!(diags.is_empty(), "lex errors: {:?}", diags);
    let file = Parser::new(tokens).parse_file().expect("parse");
    let file = desugar(file).expect("desugar");
    lower(&file).err().expect("expected lowering errors")
}

// ─── Widths and strand layout ─────────────────────────────────────

#[test]
fn test_scalar_inferred_width() {
    let lowered = lower_src("level = 0.5");
    let bundle = &lowered.program.bundles["level"];
    assert_eq!(bundle.width(), 1);
    assert_eq!(bundle.strands[0].name, "0");
    assert_eq!(bundle.strands[0].index, 0);
}

#[test]
fn test_display_bundle_layout() {
    let lowered = lower_src("display[r, g, b] = [me.x, me.y, fract(me.t)]");
    let display = &lowered.program.bundles["display"];
    assert_eq!(display.width(), 3);
    for (i, name) in ["r", "g", "b"].iter().enumerate() {
        assert_eq!(display.strands[i].name, *name);
        assert_eq!(display.strands[i].index, i as u32);
    }
    match &display.strands[0].expr.kind {
        ExprKind::Index { bundle, index } => {
            assert_eq!(bundle, "me");
            assert_eq!(*index, IndexKey::Field("x".to_string()));
        }
        other => panic!("expected me.x read, got {:?}", other),
    }
    match &display.strands[2].expr.kind {
        ExprKind::Builtin { name, args } => {
            assert_eq!(*name, BuiltinFn::Fract);
            assert_eq!(args.len(), 1);
        }
        other => panic!("expected fract call, got {:?}", other),
    }
}

#[test]
fn test_every_strand_is_scalar() {
    let lowered = lower_src(
        "display[r, g, b] = [me.x, me.y, 0]\nwide = [me.x, me.y]\nplay[0] = sin(me.t)",
    );
    for bundle in lowered.program.bundles.values() {
        for strand in &bundle.strands {
            // A strand expression is one scalar tree; tuple structure was
            // flattened during lowering.
            assert!(strand.expr.node_count() >= 1);
        }
    }
    assert_eq!(lowered.program.bundles["wide"].width(), 2);
}

#[test]
fn test_bundle_identifier_expands_to_width() {
    let lowered = lower_src("src[a, b] = [me.x, me.y]\ncopy[p, q] = src");
    let copy = &lowered.program.bundles["copy"];
    assert_eq!(copy.width(), 2);
    match &copy.strands[1].expr.kind {
        ExprKind::Index { bundle, index } => {
            assert_eq!(bundle, "src");
            assert_eq!(*index, IndexKey::Pos(1));
        }
        other => panic!("expected src.1 read, got {:?}", other),
    }
}

#[test]
fn test_broadcast_scalar_over_bundle() {
    let lowered = lower_src("src[a, b] = [me.x, me.y]\nhalf[p, q] = src * 0.5");
    assert_eq!(lowered.program.bundles["half"].width(), 2);
}

#[test]
fn test_error_width_mismatch_outputs() {
    let errs = lower_err("pair[a, b] = [1, 2, 3]");
    assert!(errs[0].message.contains("width mismatch"));
}

#[test]
fn test_error_operand_width_mismatch() {
    let errs = lower_err("a[x, y] = [1, 2]\nb[x, y, z] = [1, 2, 3]\nbad = a + b");
    assert!(errs[0].message.contains("width mismatch"));
}

#[test]
fn test_error_strand_index_out_of_position() {
    let errs = lower_err("b.1 = me.x");
    assert!(errs[0].message.contains("does not match its position"));
}

// ─── Name resolution ──────────────────────────────────────────────

#[test]
fn test_me_aliases_normalize() {
    let lowered = lower_src("a = me.u + me.v + me.rate");
    let mut fields = Vec::new();
    lowered.program.bundles["a"].strands[0].expr.walk(&mut |e| {
        if let ExprKind::Index { bundle, index } = &e.kind {
            if bundle == "me" {
                fields.push(index.to_string());
            }
        }
    });
    assert_eq!(fields, vec!["x", "y", "sampleRate"]);
}

#[test]
fn test_error_unknown_me_field() {
    let errs = lower_err("a = me.q");
    assert!(errs[0].message.contains("unknown coordinate 'me.q'"));
    assert!(errs[0].help.is_some());
}

#[test]
fn test_error_unknown_bundle() {
    let errs = lower_err("display[r, g, b] = [nothere.0, 0, 0]");
    assert!(errs[0].message.contains("unknown bundle 'nothere'"));
}

#[test]
fn test_error_unknown_strand() {
    let errs = lower_err("src[a, b] = [1, 2]\nx = src.c");
    assert!(errs[0].message.contains("unknown strand 'c'"));
}

#[test]
fn test_forward_reference_by_strand_name() {
    let lowered = lower_src("first = later.v * 2\nlater.v = me.t");
    assert_eq!(lowered.program.bundles["first"].width(), 1);
}

#[test]
fn test_param_resolves_before_global() {
    let lowered = lower_src("x = 1\nspindle f(x) { return = [x + 1] }\nout = f(2)");
    let spindle = &lowered.program.spindles["f"];
    let mut saw_param = false;
    spindle.returns[0].walk(&mut |e| {
        if matches!(&e.kind, ExprKind::Param(p) if p == "x") {
            saw_param = true;
        }
    });
    assert!(saw_param, "parameter should shadow the global bundle");
}

// ─── Spindles ─────────────────────────────────────────────────────

#[test]
fn test_spindle_call_and_extract() {
    let lowered = lower_src("spindle f(a, b) { return = [a + b] }\ng[0] = f(1, 2)");
    let g = &lowered.program.bundles["g"];
    match &g.strands[0].expr.kind {
        ExprKind::Extract { call, index } => {
            assert_eq!(*index, 0);
            assert!(matches!(&call.kind, ExprKind::Call { spindle, .. } if spindle == "f"));
        }
        other => panic!("expected extract of call, got {:?}", other),
    }
}

#[test]
fn test_error_spindle_width_mismatch() {
    // Scenario 6: one return, two outputs.
    let errs = lower_err("spindle f(a, b) { return = [a + b] }\ng[0, 1] = f(1, 2)");
    assert!(errs[0].message.contains("width mismatch"));
}

#[test]
fn test_spindle_indexed_returns() {
    let lowered = lower_src("spindle swap(a, b) { return.0 = b\nreturn.1 = a }\np[x, y] = swap(1, 2)");
    assert_eq!(lowered.program.spindles["swap"].width(), 2);
    assert_eq!(lowered.program.bundles["p"].width(), 2);
}

#[test]
fn test_error_missing_return_index() {
    let errs = lower_err("spindle f(a) { return.1 = a }\nx = f(1)");
    assert!(errs
        .iter()
        .any(|e| e.message.contains("missing return index 0")));
}

#[test]
fn test_error_duplicate_spindle() {
    let errs = lower_err("spindle f(a) { return = [a] }\nspindle f(b) { return = [b] }");
    assert!(errs[0].message.contains("duplicate spindle 'f'"));
}

#[test]
fn test_error_wrong_argument_count() {
    let errs = lower_err("spindle f(a, b) { return = [a + b] }\nx = f(1)");
    assert!(errs[0].message.contains("takes 2 arguments"));
}

#[test]
fn test_error_recursive_spindle() {
    let errs =
        lower_err("spindle f(a) { return = [g(a)] }\nspindle g(b) { return = [f(b)] }");
    assert!(errs[0].message.contains("recursive spindle call"));
}

#[test]
fn test_spindle_local_bundles() {
    let lowered = lower_src(
        "spindle norm(v) { scaled = v * 2\nreturn = [scaled.0 + 1] }\nout = norm(me.x)",
    );
    let spindle = &lowered.program.spindles["norm"];
    assert_eq!(spindle.locals.len(), 1);
    assert_eq!(spindle.locals[0].name, "scaled");
}

// ─── Chains, patterns, ranges ─────────────────────────────────────

#[test]
fn test_chain_inline_pattern() {
    let lowered = lower_src("x = me.x | [.0 * 2, .0 + 1]");
    assert_eq!(lowered.program.bundles["x"].width(), 2);
}

#[test]
fn test_chain_named_slots_from_bundle() {
    let lowered = lower_src("pos[x, y] = [me.x, me.y]\nswapped = pos | [.y, .x]");
    assert_eq!(lowered.program.bundles["swapped"].width(), 2);
    match &lowered.program.bundles["swapped"].strands[0].expr.kind {
        ExprKind::Index { bundle, index } => {
            assert_eq!(bundle, "pos");
            assert_eq!(*index, IndexKey::Pos(1));
        }
        other => panic!("expected pos.1, got {:?}", other),
    }
}

#[test]
fn test_chain_body_pattern_with_forward_reference() {
    let lowered = lower_src(
        "x = me.x | { a = b.0 * 2\nb = .0 + 1\nreturn = [a.0] }",
    );
    assert_eq!(lowered.program.bundles["x"].width(), 1);
}

#[test]
fn test_error_circular_pattern_locals() {
    let errs = lower_err("x = me.x | { a = b.0\nb = a.0\nreturn = [a.0] }");
    assert!(errs[0]
        .message
        .contains("circular reference between pattern locals"));
}

#[test]
fn test_pattern_locals_do_not_survive() {
    let errs = lower_err("x = me.x | { t = .0 * 2\nreturn = [t.0] } | [.0 + t.0]");
    assert!(errs[0].message.contains("unknown bundle 't'"));
}

#[test]
fn test_range_unrolls() {
    let lowered = lower_src("x = me.x | [.0 * (0..3)]");
    let x = &lowered.program.bundles["x"];
    assert_eq!(x.width(), 3);
    for (i, strand) in x.strands.iter().enumerate() {
        let mut found = false;
        strand.expr.walk(&mut |e| {
            if matches!(e.kind, ExprKind::Num(n) if n == i as f64) {
                found = true;
            }
        });
        assert!(found, "strand {} should contain its unrolled index", i);
    }
}

#[test]
fn test_range_of_zero_size_produces_no_strands() {
    let lowered = lower_src("x = me.x | [.0 * (0..0)]");
    assert_eq!(lowered.program.bundles["x"].width(), 0);
}

#[test]
fn test_error_negative_range() {
    let errs = lower_err("x = me.x | [.0 * (0..-1)]");
    assert!(errs[0].message.contains("negative size"));
}

#[test]
fn test_error_mismatched_range_sizes() {
    let errs = lower_err("x = me.x | [(0..2) + (0..3)]");
    assert!(errs[0].message.contains("same size"));
}

#[test]
fn test_error_range_outside_pattern() {
    let errs = lower_err("x = 0..3");
    assert!(errs[0].message.contains("range outside a chain pattern"));
}

#[test]
fn test_error_bare_access_outside_pattern() {
    let errs = lower_err("x = .0 + 1");
    assert!(errs[0]
        .message
        .contains("bare strand access outside a chain pattern"));
}

// ─── Resources and dynamic access ─────────────────────────────────

#[test]
fn test_resource_registration_and_channels() {
    let lowered = lower_src("img = texture(\"photo.png\", me.x, me.y)");
    assert_eq!(lowered.program.resources, vec!["photo.png"]);
    let img = &lowered.program.bundles["img"];
    assert_eq!(img.width(), 3);
    for (ch, strand) in img.strands.iter().enumerate() {
        match &strand.expr.kind {
            ExprKind::Builtin { name, args } => {
                assert_eq!(*name, BuiltinFn::Texture);
                // id, u, v, channel
                assert_eq!(args.len(), 4);
                assert!(matches!(args[0].kind, ExprKind::Num(n) if n == 0.0));
                assert!(
                    matches!(args[3].kind, ExprKind::Num(n) if n == ch as f64),
                    "channel argument should be {}",
                    ch
                );
            }
            other => panic!("expected texture builtin, got {:?}", other),
        }
    }
}

#[test]
fn test_resource_dedup_by_path() {
    let lowered = lower_src(
        "a = texture(\"p.png\", me.x, me.y)\nb = texture(\"p.png\", me.y, me.x)\nc = texture(\"q.png\", 0, 0)",
    );
    assert_eq!(lowered.program.resources, vec!["p.png", "q.png"]);
}

#[test]
fn test_text_resource_table() {
    let lowered = lower_src("t = text(\"hello\", me.x, me.y)");
    assert_eq!(lowered.program.text_resources, vec!["hello"]);
    assert!(lowered.program.resources.is_empty());
    assert_eq!(lowered.program.bundles["t"].width(), 1);
}

#[test]
fn test_camera_expands_per_channel() {
    let lowered = lower_src("cam = camera(me.x, me.y)");
    let cam = &lowered.program.bundles["cam"];
    assert_eq!(cam.width(), 3);
    match &cam.strands[2].expr.kind {
        ExprKind::Builtin { name, args } => {
            assert_eq!(*name, BuiltinFn::Camera);
            assert!(matches!(args.last().unwrap().kind, ExprKind::Num(n) if n == 2.0));
        }
        other => panic!("expected camera builtin, got {:?}", other),
    }
}

#[test]
fn test_error_computed_resource_path() {
    let errs = lower_err("img = texture(me.x, 0, 0)");
    assert!(errs[0].message.contains("string literal"));
}

#[test]
fn test_dynamic_access_becomes_select() {
    let lowered = lower_src("src[a, b] = [me.x, me.y]\npick = src.(me.t)");
    match &lowered.program.bundles["pick"].strands[0].expr.kind {
        ExprKind::Builtin { name, args } => {
            assert_eq!(*name, BuiltinFn::Select);
            // index + one argument per strand of src
            assert_eq!(args.len(), 3);
        }
        other => panic!("expected select, got {:?}", other),
    }
}

// ─── Remap ────────────────────────────────────────────────────────

#[test]
fn test_remap_keys_and_temporal_flag() {
    let lowered = lower_src(
        "pos[x, y] = [me.x, me.y]\nshift = pos.x[pos.x ~ me.x + 0.1]\necho = pos.x[me.t ~ me.t - 1]",
    );
    match &lowered.program.bundles["shift"].strands[0].expr.kind {
        ExprKind::Remap { subs, temporal, .. } => {
            assert!(!temporal);
            assert_eq!(subs[0].0, "pos.0");
        }
        other => panic!("expected remap, got {:?}", other),
    }
    match &lowered.program.bundles["echo"].strands[0].expr.kind {
        ExprKind::Remap { subs, temporal, .. } => {
            assert!(temporal);
            assert_eq!(subs[0].0, "me.t");
        }
        other => panic!("expected remap, got {:?}", other),
    }
}

#[test]
fn test_error_remap_unknown_key() {
    let errs = lower_err("a = me.x[ghost.q ~ 1]");
    assert!(errs[0].message.contains("invalid remap argument"));
}

// ─── Tags and sinks ───────────────────────────────────────────────

#[test]
fn test_tag_bundle_after_desugar() {
    // Scenario 4.
    let lowered = lower_src("a[x, y] = [me.x * $speed(2), me.y * $speed]");
    let speed = &lowered.program.bundles["$speed"];
    assert_eq!(speed.width(), 1);
    assert!(matches!(speed.strands[0].expr.kind, ExprKind::Num(n) if n == 2.0));
    let a = &lowered.program.bundles["a"];
    let mut reads = 0;
    for strand in &a.strands {
        strand.expr.walk(&mut |e| {
            if matches!(&e.kind, ExprKind::Index { bundle, .. } if bundle == "$speed") {
                reads += 1;
            }
        });
    }
    assert_eq!(reads, 2);
}

#[test]
fn test_error_display_wrong_width() {
    let errs = lower_err("display[r, g] = [1, 2]");
    assert!(errs[0].message.contains("width 3"));
}

#[test]
fn test_error_play_wrong_width() {
    let errs = lower_err("play[a, b, c] = [1, 2, 3]");
    assert!(errs[0].message.contains("width 1 (mono) or 2 (stereo)"));
}

#[test]
fn test_scope_sink_any_width() {
    let lowered = lower_src("scope[a, b, c, d] = [1, 2, 3, 4]");
    assert_eq!(lowered.program.bundles["scope"].width(), 4);
}

#[test]
fn test_empty_source_compiles_to_empty_program() {
    let lowered = lower_src("");
    assert!(lowered.program.bundles.is_empty());
    assert!(lowered.entries.is_empty());
}

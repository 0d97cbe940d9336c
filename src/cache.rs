//! Cache extraction: `cache(value, size, tap, signal)` → `CacheRead`.
//!
//! Each cache site declares a host-owned ring buffer. The extractor
//! replaces the site with a read of that buffer and records a descriptor
//! carrying the producer expression. The host evaluates the producer
//! during the tick and pushes it after the tick completes, so the current
//! tick always reads previous values. Cycles of the form "a depends on
//! its own previous value" disappear because `CacheRead` declares no
//! current-tick dependency.

use std::collections::BTreeMap;

use crate::annotate::{collect_reads, Annotation, Backend, DomainWalker};
use crate::diagnostic::{Diagnostic, Stage};
use crate::ir::{BuiltinFn, Expr, ExprKind, Program};

/// Metadata for one host-owned history buffer.
#[derive(Clone, Debug)]
pub struct CacheDescriptor {
    /// Stable id: `{owner}.{strand}#{ordinal}`.
    pub id: String,
    pub owner: String,
    pub strand_index: u32,
    pub history_size: u32,
    /// Which tick domain pushes this buffer.
    pub domain: Backend,
    /// True when the producer reads the owner bundle itself.
    pub has_self_ref: bool,
    /// The extracted value expression, evaluated each tick and pushed
    /// after the tick completes.
    pub producer: Expr,
}

/// Rewrite every cache site in the program. The annotations decide a
/// descriptor's domain when its signal argument alone is ambiguous.
pub fn extract(
    program: &mut Program,
    annotations: &BTreeMap<String, Annotation>,
) -> Result<Vec<CacheDescriptor>, Vec<Diagnostic>> {
    let mut diagnostics = Vec::new();

    // Spindle bodies are shared across call sites, so a cache there has no
    // single owner strand to derive a stable id from.
    for spindle in program.spindles.values() {
        let mut check = |expr: &Expr| {
            expr.walk(&mut |e| {
                if matches!(
                    e.kind,
                    ExprKind::Builtin {
                        name: BuiltinFn::Cache,
                        ..
                    }
                ) {
                    diagnostics.push(
                        Diagnostic::error(
                            Stage::Lowering,
                            format!("'cache' inside spindle '{}'", spindle.name),
                            e.span,
                        )
                        .with_help(
                            "history buffers belong to a strand; hoist the cache into the \
                             bundle declaration that calls this spindle"
                                .to_string(),
                        ),
                    );
                }
            });
        };
        for ret in &spindle.returns {
            check(ret);
        }
        for local in &spindle.locals {
            for strand in &local.strands {
                check(&strand.expr);
            }
        }
    }
    if !diagnostics.is_empty() {
        return Err(diagnostics);
    }

    // The pre-extraction snapshot answers domain queries while the live
    // program is being rewritten.
    let snapshot = program.clone();
    let mut walker = DomainWalker::new(&snapshot);
    let mut descriptors = Vec::new();

    let names: Vec<String> = program.bundles.keys().cloned().collect();
    for name in names {
        let bundle = program.bundles.get_mut(&name).expect("bundle exists");
        for strand in &mut bundle.strands {
            let mut ordinal = 0;
            rewrite(
                &mut strand.expr,
                &name,
                strand.index,
                &mut ordinal,
                &snapshot,
                &mut walker,
                annotations,
                &mut descriptors,
                &mut diagnostics,
            );
        }
    }

    if diagnostics.is_empty() {
        Ok(descriptors)
    } else {
        Err(diagnostics)
    }
}

#[allow(clippy::too_many_arguments)]
fn rewrite(
    expr: &mut Expr,
    owner: &str,
    strand_index: u32,
    ordinal: &mut u32,
    snapshot: &Program,
    walker: &mut DomainWalker,
    annotations: &BTreeMap<String, Annotation>,
    descriptors: &mut Vec<CacheDescriptor>,
    diagnostics: &mut Vec<Diagnostic>,
) {
    // Children first, so nested caches extract inside-out and the
    // producer stored on the descriptor is already rewritten.
    match &mut expr.kind {
        ExprKind::Num(_) | ExprKind::Param(_) | ExprKind::Index { .. } => {}
        ExprKind::Binary { lhs, rhs, .. } => {
            rewrite(lhs, owner, strand_index, ordinal, snapshot, walker, annotations, descriptors, diagnostics);
            rewrite(rhs, owner, strand_index, ordinal, snapshot, walker, annotations, descriptors, diagnostics);
        }
        ExprKind::Unary { operand, .. } => {
            rewrite(operand, owner, strand_index, ordinal, snapshot, walker, annotations, descriptors, diagnostics);
        }
        ExprKind::Call { args, .. } | ExprKind::Builtin { args, .. } => {
            for arg in args {
                rewrite(arg, owner, strand_index, ordinal, snapshot, walker, annotations, descriptors, diagnostics);
            }
        }
        ExprKind::Extract { call, .. } => {
            rewrite(call, owner, strand_index, ordinal, snapshot, walker, annotations, descriptors, diagnostics);
        }
        ExprKind::Remap { base, subs, .. } => {
            rewrite(base, owner, strand_index, ordinal, snapshot, walker, annotations, descriptors, diagnostics);
            for (_, value) in subs {
                rewrite(value, owner, strand_index, ordinal, snapshot, walker, annotations, descriptors, diagnostics);
            }
        }
        ExprKind::CacheRead { tap, .. } => {
            rewrite(tap, owner, strand_index, ordinal, snapshot, walker, annotations, descriptors, diagnostics);
        }
    }

    let is_cache = matches!(
        &expr.kind,
        ExprKind::Builtin {
            name: BuiltinFn::Cache,
            ..
        }
    );
    if !is_cache {
        return;
    }

    let span = expr.span;
    let args = match &mut expr.kind {
        ExprKind::Builtin { args, .. } => std::mem::take(args),
        _ => unreachable!(),
    };
    let mut args = args.into_iter();
    let value = args.next().expect("cache arity checked during lowering");
    let size = args.next().expect("cache arity checked during lowering");
    let tap = args.next().expect("cache arity checked during lowering");
    let signal = args.next().expect("cache arity checked during lowering");

    let history_size = match size.kind {
        ExprKind::Num(n) if n.fract() == 0.0 && n >= 1.0 => n as u32,
        _ => {
            diagnostics.push(
                Diagnostic::error(
                    Stage::Lowering,
                    "cache history size must be a positive number literal".to_string(),
                    size.span,
                )
                .with_help("the host allocates the ring buffer before the first tick".to_string()),
            );
            // Keep rewriting so later sites still get stable ordinals.
            1
        }
    };

    let id = format!("{}.{}#{}", owner, strand_index, ordinal);
    *ordinal += 1;

    // Signal domain decides the tick cadence; an ambiguous signal (t only)
    // falls back to the owner bundle's backend.
    let signal_domain = walker.domain_of_expr(&signal);
    let domain = if signal_domain.contains("x") || signal_domain.contains("y") {
        Backend::Visual
    } else if signal_domain.contains("i") {
        Backend::Audio
    } else {
        annotations
            .get(owner)
            .map(|a| a.backend)
            .unwrap_or(Backend::Visual)
    };

    let mut reads = std::collections::BTreeSet::new();
    collect_reads(&value, None, snapshot, &mut reads);
    let has_self_ref = reads.contains(owner);

    descriptors.push(CacheDescriptor {
        id: id.clone(),
        owner: owner.to_string(),
        strand_index,
        history_size,
        domain,
        has_self_ref,
        producer: value,
    });

    *expr = Expr::new(
        ExprKind::CacheRead {
            id,
            tap: Box::new(tap),
        },
        span,
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annotate::annotate;
    use crate::desugar::desugar;
    use crate::ir::lower::lower;
    use crate::lexer::Lexer;
    use crate::parser::Parser;

    fn extracted(source: &str) -> (Program, Vec<CacheDescriptor>) {
        let (tokens, diags) = Lexer::new(source).tokenize();
        assert!(diags.is_empty());
        let file = Parser::new(tokens).parse_file().expect("parse");
        let file = desugar(file).expect("desugar");
        let lowered = lower(&file).expect("lower");
        let mut program = lowered.program;
        let annotations = annotate(&program).expect("annotate");
        let descriptors = extract(&mut program, &annotations).unwrap_or_else(|errs| {
            panic!(
                "extraction errors: {:?}",
                errs.iter().map(|e| &e.message).collect::<Vec<_>>()
            )
        });
        (program, descriptors)
    }

    #[test]
    fn test_scenario_descriptor() {
        // Scenario 3.
        let (program, descriptors) =
            extracted("trail.v = cache(current.v, 2, 1, me.t)\ncurrent.v = me.x");
        assert_eq!(descriptors.len(), 1);
        let d = &descriptors[0];
        assert_eq!(d.id, "trail.0#0");
        assert_eq!(d.owner, "trail");
        assert_eq!(d.strand_index, 0);
        assert_eq!(d.history_size, 2);
        assert_eq!(d.domain, Backend::Visual);
        assert!(!d.has_self_ref);

        // The strand is now a CacheRead with the literal tap.
        match &program.bundles["trail"].strands[0].expr.kind {
            ExprKind::CacheRead { id, tap } => {
                assert_eq!(id, "trail.0#0");
                assert!(matches!(tap.kind, ExprKind::Num(n) if n == 1.0));
            }
            other => panic!("expected CacheRead, got {:?}", other),
        }
    }

    #[test]
    fn test_every_read_has_a_descriptor() {
        let (program, descriptors) = extracted(
            "a.v = cache(me.x, 4, 0, me.t)\nb.v = cache(me.y, 8, 1, me.t) + cache(a.v, 2, 0, me.t)",
        );
        let mut read_ids = Vec::new();
        for bundle in program.bundles.values() {
            for strand in &bundle.strands {
                strand.expr.walk(&mut |e| {
                    if let ExprKind::CacheRead { id, .. } = &e.kind {
                        read_ids.push(id.clone());
                    }
                });
            }
        }
        assert_eq!(read_ids.len(), 3);
        for id in read_ids {
            assert!(
                descriptors.iter().any(|d| d.id == id),
                "no descriptor for cache read '{}'",
                id
            );
        }
    }

    #[test]
    fn test_ordinals_are_stable_per_strand() {
        let (_, descriptors) =
            extracted("w.v = cache(me.x, 2, 0, me.t) + cache(me.y, 2, 0, me.t)");
        let ids: Vec<&str> = descriptors.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["w.0#0", "w.0#1"]);
    }

    #[test]
    fn test_self_reference_flag() {
        let (_, descriptors) = extracted("fb.v = cache(fb.v, 4, 1, me.t) * 0.9 + me.x");
        assert_eq!(descriptors.len(), 1);
        assert!(descriptors[0].has_self_ref);
    }

    #[test]
    fn test_audio_domain_from_signal() {
        let (_, descriptors) = extracted("play[0] = cache(sin(me.i), 128, 0, me.i) * 0.5");
        assert_eq!(descriptors[0].domain, Backend::Audio);
    }

    #[test]
    fn test_producer_retained() {
        let (_, descriptors) = extracted("trail.v = cache(current.v, 2, 1, me.t)\ncurrent.v = me.x");
        let producer = &descriptors[0].producer;
        assert!(matches!(
            &producer.kind,
            ExprKind::Index { bundle, .. } if bundle == "current"
        ));
    }

    #[test]
    fn test_no_cache_builtin_survives() {
        let (program, _) = extracted("a.v = cache(cache(me.x, 2, 0, me.t), 4, 1, me.t)");
        for bundle in program.bundles.values() {
            for strand in &bundle.strands {
                strand.expr.walk(&mut |e| {
                    assert!(!matches!(
                        e.kind,
                        ExprKind::Builtin {
                            name: BuiltinFn::Cache,
                            ..
                        }
                    ));
                });
            }
        }
    }

    #[test]
    fn test_error_dynamic_history_size() {
        let (tokens, _) = Lexer::new("a.v = cache(me.x, me.t, 0, me.t)").tokenize();
        let file = Parser::new(tokens).parse_file().expect("parse");
        let file = desugar(file).expect("desugar");
        let lowered = lower(&file).expect("lower");
        let mut program = lowered.program;
        let annotations = annotate(&program).expect("annotate");
        let errs = extract(&mut program, &annotations).expect_err("expected error");
        assert!(errs[0].message.contains("positive number literal"));
    }

    #[test]
    fn test_error_cache_in_spindle() {
        let (tokens, _) =
            Lexer::new("spindle f(a) { return = [cache(a, 2, 0, me.t)] }\nx = f(me.x)").tokenize();
        let file = Parser::new(tokens).parse_file().expect("parse");
        let file = desugar(file).expect("desugar");
        let lowered = lower(&file).expect("lower");
        let mut program = lowered.program;
        let annotations = annotate(&program).expect("annotate");
        let errs = extract(&mut program, &annotations).expect_err("expected error");
        assert!(errs[0].message.contains("inside spindle"));
    }
}

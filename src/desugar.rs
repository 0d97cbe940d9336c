//! Desugarer: eliminates `$tag` expressions.
//!
//! The first `$name(expr)` site encountered defines the tag; every later
//! site is a use. Each tag becomes a synthetic single-strand bundle
//! `$name[0] = definition`, and all occurrences rewrite to `$name.0`.
//! After this pass no `Tag` node remains anywhere in the AST.

use std::collections::HashMap;

use crate::ast::*;
use crate::diagnostic::{Diagnostic, Stage};
use crate::span::{Span, Spanned};

pub fn desugar(file: SourceFile) -> Result<SourceFile, Vec<Diagnostic>> {
    let mut d = Desugarer::default();

    // Collect definitions in source order.
    for decl in &file.decls {
        match &decl.node {
            Decl::Bundle(b) => d.collect_expr(&b.value),
            Decl::Spindle(s) => d.collect_body(&s.body),
        }
    }

    // Rewrite uses, in the collected definitions first (tags may nest).
    let mut defs = std::mem::take(&mut d.defs);
    for (_, def) in defs.iter_mut() {
        d.rewrite_expr(def);
    }

    let mut decls: Vec<Spanned<Decl>> = Vec::with_capacity(file.decls.len() + defs.len());
    for (name, def) in defs {
        let span = def.span;
        decls.push(Spanned::new(
            Decl::Bundle(BundleDecl {
                name: Spanned::new(format!("${}", name), span),
                target: BundleTarget::Outputs(vec![Spanned::new(OutputName::Index(0), span)]),
                value: def,
            }),
            span,
        ));
    }
    for mut decl in file.decls {
        match &mut decl.node {
            Decl::Bundle(b) => d.rewrite_expr(&mut b.value),
            Decl::Spindle(s) => d.rewrite_body(&mut s.body),
        }
        decls.push(decl);
    }

    if d.diagnostics.is_empty() {
        Ok(SourceFile { decls })
    } else {
        Err(d.diagnostics)
    }
}

#[derive(Default)]
struct Desugarer {
    /// Tag definitions in first-encounter order.
    defs: Vec<(String, Spanned<Expr>)>,
    index: HashMap<String, usize>,
    def_spans: HashMap<String, Span>,
    diagnostics: Vec<Diagnostic>,
}

impl Desugarer {
    // ─── Collection ───────────────────────────────────────────────

    fn collect_expr(&mut self, expr: &Spanned<Expr>) {
        match &expr.node {
            Expr::Tag { name, arg } => {
                if let Some(arg) = arg {
                    if let Some(&i) = self.index.get(&name.node) {
                        // A later definition site must agree with the first.
                        if !expr_eq(&self.defs[i].1.node, &arg.node) {
                            self.diagnostics.push(
                                Diagnostic::error(
                                    Stage::Lowering,
                                    format!(
                                        "tag '${}' is redefined with a different expression",
                                        name.node
                                    ),
                                    name.span,
                                )
                                .with_note(format!(
                                    "the first definition is authoritative (offset {})",
                                    self.def_spans[&name.node].start
                                ))
                                .with_help(
                                    "give every definition site of a tag the same expression, \
                                     or use the bare form `$name` after the first"
                                        .to_string(),
                                ),
                            );
                        }
                    } else {
                        self.index.insert(name.node.clone(), self.defs.len());
                        self.def_spans.insert(name.node.clone(), name.span);
                        self.defs.push((name.node.clone(), (**arg).clone()));
                    }
                    self.collect_expr(arg);
                }
            }
            Expr::Number(_) | Expr::Str(_) | Expr::Ident(_) | Expr::Me(_) => {}
            Expr::Access { base, sel } => {
                if let Some(base) = base {
                    self.collect_expr(base);
                }
                if let Selector::Dynamic(e) = sel {
                    self.collect_expr(e);
                }
            }
            Expr::Binary { lhs, rhs, .. } => {
                self.collect_expr(lhs);
                self.collect_expr(rhs);
            }
            Expr::Unary { operand, .. } => self.collect_expr(operand),
            Expr::Call { args, .. } => {
                for arg in args {
                    self.collect_expr(arg);
                }
            }
            Expr::Tuple(items) => {
                for item in items {
                    self.collect_expr(item);
                }
            }
            Expr::Chain { base, patterns } => {
                self.collect_expr(base);
                for pattern in patterns {
                    match &pattern.node {
                        ChainPattern::Inline(outs) => {
                            for out in outs {
                                self.collect_expr(out);
                            }
                        }
                        ChainPattern::Body(body) => self.collect_body(body),
                    }
                }
            }
            Expr::Remap { base, subs } => {
                self.collect_expr(base);
                for arm in subs {
                    self.collect_expr(&arm.value);
                }
            }
            Expr::Range { start, end } => {
                self.collect_expr(start);
                self.collect_expr(end);
            }
        }
    }

    fn collect_body(&mut self, body: &Body) {
        for item in &body.items {
            match &item.node {
                BodyItem::Local(b) => self.collect_expr(&b.value),
                BodyItem::ReturnIndexed { value, .. } | BodyItem::Return { value } => {
                    self.collect_expr(value)
                }
            }
        }
    }

    // ─── Rewriting ────────────────────────────────────────────────

    fn rewrite_expr(&mut self, expr: &mut Spanned<Expr>) {
        match &mut expr.node {
            Expr::Tag { name, .. } => {
                if !self.index.contains_key(&name.node) {
                    self.diagnostics.push(
                        Diagnostic::error(
                            Stage::Lowering,
                            format!("tag '${}' is never defined", name.node),
                            name.span,
                        )
                        .with_help(format!(
                            "define it at some use site: `${}(expr)`",
                            name.node
                        )),
                    );
                }
                let span = expr.span;
                expr.node = Expr::Access {
                    base: Some(Box::new(Spanned::new(
                        Expr::Ident(format!("${}", name.node)),
                        span,
                    ))),
                    sel: Selector::Index(0),
                };
            }
            Expr::Number(_) | Expr::Str(_) | Expr::Ident(_) | Expr::Me(_) => {}
            Expr::Access { base, sel } => {
                if let Some(base) = base {
                    self.rewrite_expr(base);
                }
                if let Selector::Dynamic(e) = sel {
                    self.rewrite_expr(e);
                }
            }
            Expr::Binary { lhs, rhs, .. } => {
                self.rewrite_expr(lhs);
                self.rewrite_expr(rhs);
            }
            Expr::Unary { operand, .. } => self.rewrite_expr(operand),
            Expr::Call { args, .. } => {
                for arg in args {
                    self.rewrite_expr(arg);
                }
            }
            Expr::Tuple(items) => {
                for item in items {
                    self.rewrite_expr(item);
                }
            }
            Expr::Chain { base, patterns } => {
                self.rewrite_expr(base);
                for pattern in patterns {
                    match &mut pattern.node {
                        ChainPattern::Inline(outs) => {
                            for out in outs {
                                self.rewrite_expr(out);
                            }
                        }
                        ChainPattern::Body(body) => self.rewrite_body(body),
                    }
                }
            }
            Expr::Remap { base, subs } => {
                self.rewrite_expr(base);
                for arm in subs {
                    self.rewrite_expr(&mut arm.value);
                }
            }
            Expr::Range { start, end } => {
                self.rewrite_expr(start);
                self.rewrite_expr(end);
            }
        }
    }

    fn rewrite_body(&mut self, body: &mut Body) {
        for item in &mut body.items {
            match &mut item.node {
                BodyItem::Local(b) => self.rewrite_expr(&mut b.value),
                BodyItem::ReturnIndexed { value, .. } | BodyItem::Return { value } => {
                    self.rewrite_expr(value)
                }
            }
        }
    }
}

/// Structural equality of surface expressions, ignoring spans.
fn expr_eq(a: &Expr, b: &Expr) -> bool {
    match (a, b) {
        (Expr::Number(x), Expr::Number(y)) => x == y,
        (Expr::Str(x), Expr::Str(y)) => x == y,
        (Expr::Ident(x), Expr::Ident(y)) => x == y,
        (Expr::Me(x), Expr::Me(y)) => x.node == y.node,
        (Expr::Tag { name: na, arg: aa }, Expr::Tag { name: nb, arg: ab }) => {
            na.node == nb.node
                && match (aa, ab) {
                    (Some(x), Some(y)) => expr_eq(&x.node, &y.node),
                    (None, None) => true,
                    _ => false,
                }
        }
        (Expr::Access { base: ba, sel: sa }, Expr::Access { base: bb, sel: sb }) => {
            let bases = match (ba, bb) {
                (Some(x), Some(y)) => expr_eq(&x.node, &y.node),
                (None, None) => true,
                _ => false,
            };
            bases
                && match (sa, sb) {
                    (Selector::Index(x), Selector::Index(y)) => x == y,
                    (Selector::Name(x), Selector::Name(y)) => x == y,
                    (Selector::Dynamic(x), Selector::Dynamic(y)) => expr_eq(&x.node, &y.node),
                    _ => false,
                }
        }
        (
            Expr::Binary {
                op: oa,
                lhs: la,
                rhs: ra,
            },
            Expr::Binary {
                op: ob,
                lhs: lb,
                rhs: rb,
            },
        ) => oa == ob && expr_eq(&la.node, &lb.node) && expr_eq(&ra.node, &rb.node),
        (
            Expr::Unary {
                op: oa,
                operand: xa,
            },
            Expr::Unary {
                op: ob,
                operand: xb,
            },
        ) => oa == ob && expr_eq(&xa.node, &xb.node),
        (Expr::Call { name: na, args: aa }, Expr::Call { name: nb, args: ab }) => {
            na.node == nb.node
                && aa.len() == ab.len()
                && aa
                    .iter()
                    .zip(ab)
                    .all(|(x, y)| expr_eq(&x.node, &y.node))
        }
        (Expr::Tuple(xa), Expr::Tuple(xb)) => {
            xa.len() == xb.len()
                && xa
                    .iter()
                    .zip(xb)
                    .all(|(x, y)| expr_eq(&x.node, &y.node))
        }
        (
            Expr::Range {
                start: sa,
                end: ea,
            },
            Expr::Range {
                start: sb,
                end: eb,
            },
        ) => expr_eq(&sa.node, &sb.node) && expr_eq(&ea.node, &eb.node),
        // Chains and remaps compare by their printed structure rarely enough
        // that a conservative false keeps the error honest.
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::Lexer;
    use crate::parser::Parser;

    fn parse(source: &str) -> SourceFile {
        let (tokens, diags) = Lexer::new(source).tokenize();
        assert!(diags.is_empty());
        Parser::new(tokens).parse_file().expect("parse")
    }

    fn desugar_ok(source: &str) -> SourceFile {
        desugar(parse(source)).unwrap_or_else(|errs| {
            panic!(
                "desugar errors: {:?}",
                errs.iter().map(|e| &e.message).collect::<Vec<_>>()
            )
        })
    }

    fn has_tag(expr: &Expr) -> bool {
        match expr {
            Expr::Tag { .. } => true,
            Expr::Number(_) | Expr::Str(_) | Expr::Ident(_) | Expr::Me(_) => false,
            Expr::Access { base, sel } => {
                base.as_ref().is_some_and(|b| has_tag(&b.node))
                    || matches!(sel, Selector::Dynamic(e) if has_tag(&e.node))
            }
            Expr::Binary { lhs, rhs, .. } => has_tag(&lhs.node) || has_tag(&rhs.node),
            Expr::Unary { operand, .. } => has_tag(&operand.node),
            Expr::Call { args, .. } => args.iter().any(|a| has_tag(&a.node)),
            Expr::Tuple(items) => items.iter().any(|i| has_tag(&i.node)),
            Expr::Chain { base, patterns } => {
                has_tag(&base.node)
                    || patterns.iter().any(|p| match &p.node {
                        ChainPattern::Inline(outs) => outs.iter().any(|o| has_tag(&o.node)),
                        ChainPattern::Body(body) => body.items.iter().any(|i| match &i.node {
                            BodyItem::Local(b) => has_tag(&b.value.node),
                            BodyItem::ReturnIndexed { value, .. }
                            | BodyItem::Return { value } => has_tag(&value.node),
                        }),
                    })
            }
            Expr::Remap { base, subs } => {
                has_tag(&base.node) || subs.iter().any(|s| has_tag(&s.value.node))
            }
            Expr::Range { start, end } => has_tag(&start.node) || has_tag(&end.node),
        }
    }

    #[test]
    fn test_tag_becomes_synthetic_bundle() {
        let file = desugar_ok("a[x, y] = [me.x * $speed(2), me.y * $speed]");
        // Synthetic bundle first, then the user declaration.
        assert_eq!(file.decls.len(), 2);
        let synth = match &file.decls[0].node {
            Decl::Bundle(b) => b,
            _ => panic!("expected bundle"),
        };
        assert_eq!(synth.name.node, "$speed");
        match &synth.target {
            BundleTarget::Outputs(outs) => {
                assert_eq!(outs.len(), 1);
                assert_eq!(outs[0].node, OutputName::Index(0));
            }
            other => panic!("expected outputs, got {:?}", other),
        }
        assert!(matches!(synth.value.node, Expr::Number(n) if n == 2.0));
    }

    #[test]
    fn test_all_uses_rewritten() {
        let file = desugar_ok("a[x, y] = [me.x * $speed(2), me.y * $speed]");
        for decl in &file.decls {
            if let Decl::Bundle(b) = &decl.node {
                assert!(!has_tag(&b.value.node), "tag survived desugaring");
            }
        }
    }

    #[test]
    fn test_rewrite_is_strand_access() {
        let file = desugar_ok("a = $k(1) + $k");
        let b = match &file.decls[1].node {
            Decl::Bundle(b) => b,
            _ => panic!(),
        };
        match &b.value.node {
            Expr::Binary { lhs, rhs, .. } => {
                for side in [&lhs.node, &rhs.node] {
                    match side {
                        Expr::Access { base: Some(base), sel: Selector::Index(0) } => {
                            assert!(
                                matches!(&base.node, Expr::Ident(n) if n == "$k"),
                                "expected $k.0 access"
                            );
                        }
                        other => panic!("expected $k.0 access, got {:?}", other),
                    }
                }
            }
            other => panic!("expected binary, got {:?}", other),
        }
    }

    #[test]
    fn test_nested_tags() {
        let file = desugar_ok("a = $outer($inner(3) + 1)");
        assert_eq!(file.decls.len(), 3);
        let names: Vec<_> = file
            .decls
            .iter()
            .filter_map(|d| match &d.node {
                Decl::Bundle(b) => Some(b.name.node.clone()),
                _ => None,
            })
            .collect();
        assert!(names.contains(&"$outer".to_string()));
        assert!(names.contains(&"$inner".to_string()));
        for decl in &file.decls {
            if let Decl::Bundle(b) = &decl.node {
                assert!(!has_tag(&b.value.node));
            }
        }
    }

    #[test]
    fn test_tags_inside_spindles() {
        let file = desugar_ok("spindle f(p) { return = [p * $gain(0.5)] }\nout = f(1)");
        assert_eq!(file.decls.len(), 3);
        assert!(matches!(&file.decls[0].node, Decl::Bundle(b) if b.name.node == "$gain"));
    }

    #[test]
    fn test_desugar_is_idempotent() {
        let once = desugar_ok("a[x, y] = [me.x * $speed(2), me.y * $speed]");
        let count = once.decls.len();
        let twice = desugar(once).expect("second desugar");
        assert_eq!(twice.decls.len(), count, "no new bundles on re-desugar");
    }

    #[test]
    fn test_error_undefined_tag() {
        let err = desugar(parse("a = $ghost")).unwrap_err();
        assert!(err[0].message.contains("never defined"));
    }

    #[test]
    fn test_error_conflicting_redefinition() {
        let err = desugar(parse("a = $k(1)\nb = $k(2)")).unwrap_err();
        assert!(err[0].message.contains("redefined"));
    }

    #[test]
    fn test_matching_redefinition_is_a_use() {
        let file = desugar_ok("a = $k(1)\nb = $k(1)");
        let synth: Vec<_> = file
            .decls
            .iter()
            .filter(|d| matches!(&d.node, Decl::Bundle(b) if b.name.node.starts_with('$')))
            .collect();
        assert_eq!(synth.len(), 1);
    }
}

//! Chain lowering: `base | pattern | pattern ...`.
//!
//! Each step's outputs become the next pattern's positional slots. Pattern
//! locals are inline-substituted and do not survive their pattern; full
//! bodies register local names up front so forward references resolve.
//! Ranges in pattern outputs unroll one strand per index.

use std::collections::BTreeMap;

use super::{Env, Lowerer, PatternScope, Slots};
use crate::ast;
use crate::ast::{BundleTarget, ChainPattern};
use crate::ir::Expr;
use crate::span::Spanned;

impl Lowerer {
    pub(crate) fn lower_chain(
        &mut self,
        base: &Spanned<ast::Expr>,
        patterns: &[Spanned<ChainPattern>],
        env: &Env,
    ) -> Option<Vec<Expr>> {
        let exprs = self.lower_expr_multi(base, env)?;
        let names = self.slot_names_for(base, env);
        let mut slots = Slots { exprs, names };

        for pattern in patterns {
            slots = self.lower_pattern(pattern, slots, env)?;
        }

        Some(slots.exprs)
    }

    /// Strand names for the chain's base, when the producer has them.
    fn slot_names_for(&self, base: &Spanned<ast::Expr>, env: &Env) -> Option<Vec<String>> {
        let name = match &base.node {
            ast::Expr::Ident(name) => name,
            _ => return None,
        };
        if let Some(pattern) = &env.pattern {
            if let Some((names, _)) = pattern.lowered.get(name) {
                return Some(names.clone());
            }
        }
        if let Some(local) = env.spindle_locals.iter().find(|b| &b.name == name) {
            return Some(local.strands.iter().map(|s| s.name.clone()).collect());
        }
        self.bundle_sig_names(name)
    }

    fn lower_pattern(
        &mut self,
        pattern: &Spanned<ChainPattern>,
        slots: Slots,
        outer: &Env,
    ) -> Option<Slots> {
        let mut env = outer.clone();
        env.slots = Some(slots);
        env.pattern = None;
        env.range_index = None;

        match &pattern.node {
            ChainPattern::Inline(outputs) => {
                let mut exprs = Vec::new();
                for output in outputs {
                    exprs.extend(self.lower_output(output, &env)?);
                }
                Some(Slots { exprs, names: None })
            }
            ChainPattern::Body(body) => self.lower_pattern_body(body, env, pattern.span),
        }
    }

    fn lower_pattern_body(
        &mut self,
        body: &ast::Body,
        mut env: Env,
        span: crate::span::Span,
    ) -> Option<Slots> {
        // Pass 1: register local names so forward references resolve.
        let mut scope = PatternScope::default();
        let mut local_decls: Vec<&ast::BundleDecl> = Vec::new();
        for item in &body.items {
            if let ast::BodyItem::Local(local) = &item.node {
                scope.names.insert(local.name.node.clone());
                local_decls.push(local);
            }
        }

        // Pass 2: lower locals in dependency order. Groups that only
        // reference already-lowered locals go first; if a pass makes no
        // progress the leftovers form a cycle.
        let mut groups: BTreeMap<String, Vec<&ast::BundleDecl>> = BTreeMap::new();
        let mut group_order: Vec<String> = Vec::new();
        for local in local_decls.iter().copied() {
            let entry = groups.entry(local.name.node.clone()).or_default();
            if entry.is_empty() {
                group_order.push(local.name.node.clone());
            }
            entry.push(local);
        }

        let mut remaining = group_order.clone();
        while !remaining.is_empty() {
            let mut progressed = false;
            let mut next_remaining = Vec::new();

            for name in &remaining {
                let decls = &groups[name];
                let ready = decls.iter().all(|d| {
                    local_refs(&d.value.node, &scope.names)
                        .iter()
                        .all(|r| r == name || scope.lowered.contains_key(r))
                });
                if !ready {
                    next_remaining.push(name.clone());
                    continue;
                }

                for decl in decls.iter().copied() {
                    env.pattern = Some(scope.clone());
                    self.lower_pattern_local(decl, &env, &mut scope);
                }
                progressed = true;
            }

            if !progressed {
                self.error(
                    span,
                    format!(
                        "circular reference between pattern locals: {}",
                        next_remaining.join(", ")
                    ),
                );
                return None;
            }
            remaining = next_remaining;
        }

        env.pattern = Some(scope);

        // Returns: indexed and contiguous, or a single plain return.
        let mut indexed: BTreeMap<u32, Vec<Expr>> = BTreeMap::new();
        let mut plain: Option<Vec<Expr>> = None;
        let mut saw_indexed = false;
        let mut saw_plain = false;

        for item in &body.items {
            match &item.node {
                ast::BodyItem::Local(_) => {}
                ast::BodyItem::ReturnIndexed { index, value } => {
                    saw_indexed = true;
                    if saw_plain {
                        self.error(
                            item.span,
                            "pattern mixes `return = [...]` with `return.N = ...`".to_string(),
                        );
                        continue;
                    }
                    if indexed.contains_key(index) {
                        self.error(
                            item.span,
                            format!("duplicate return index {} in pattern", index),
                        );
                        continue;
                    }
                    if let Some(values) = self.lower_output(value, &env) {
                        indexed.insert(*index, values);
                    }
                }
                ast::BodyItem::Return { value } => {
                    saw_plain = true;
                    if saw_indexed {
                        self.error(
                            item.span,
                            "pattern mixes `return = [...]` with `return.N = ...`".to_string(),
                        );
                        continue;
                    }
                    if let Some(values) = self.lower_output(value, &env) {
                        plain = Some(values);
                    }
                }
            }
        }

        let exprs = if let Some(values) = plain {
            values
        } else if saw_indexed {
            let width = indexed.keys().max().map(|m| *m + 1).unwrap_or(0);
            let mut exprs = Vec::new();
            for i in 0..width {
                match indexed.remove(&i) {
                    Some(values) => exprs.extend(values),
                    None => {
                        self.error(
                            span,
                            format!("pattern is missing return index {}", i),
                        );
                        return None;
                    }
                }
            }
            exprs
        } else {
            self.error(
                span,
                "pattern body has no return statement".to_string(),
            );
            return None;
        };

        Some(Slots { exprs, names: None })
    }

    fn lower_pattern_local(
        &mut self,
        decl: &ast::BundleDecl,
        env: &Env,
        scope: &mut PatternScope,
    ) {
        let values = match self.lower_expr_multi(&decl.value, env) {
            Some(v) => v,
            None => return,
        };

        let entry = scope
            .lowered
            .entry(decl.name.node.clone())
            .or_insert_with(|| (Vec::new(), Vec::new()));

        let labels: Vec<String> = match &decl.target {
            BundleTarget::Outputs(outs) => {
                if outs.len() != values.len() {
                    self.error(
                        decl.value.span,
                        format!(
                            "width mismatch: '{}' declares {} outputs but the expression has width {}",
                            decl.name.node,
                            outs.len(),
                            values.len()
                        ),
                    );
                    return;
                }
                outs.iter().map(|o| o.node.strand_name()).collect()
            }
            BundleTarget::Strand(out) => {
                if values.len() != 1 {
                    self.error(
                        decl.value.span,
                        format!(
                            "width mismatch: '{}.{}' declares one strand but the expression has width {}",
                            decl.name.node,
                            out.node.strand_name(),
                            values.len()
                        ),
                    );
                    return;
                }
                vec![out.node.strand_name()]
            }
            BundleTarget::Inferred => {
                let base = entry.0.len();
                (0..values.len()).map(|i| (base + i).to_string()).collect()
            }
        };

        for (label, value) in labels.into_iter().zip(values) {
            if entry.0.contains(&label) {
                self.error(
                    decl.name.span,
                    format!(
                        "duplicate strand '{}' in pattern local '{}'",
                        label, decl.name.node
                    ),
                );
                continue;
            }
            entry.0.push(label);
            entry.1.push(value);
        }
    }

    /// Lower one pattern output, unrolling any ranges it contains. All
    /// ranges in a single output must share the same size; each iteration
    /// yields the output with every range replaced by its concrete index.
    pub(crate) fn lower_output(
        &mut self,
        output: &Spanned<ast::Expr>,
        env: &Env,
    ) -> Option<Vec<Expr>> {
        let mut ranges = Vec::new();
        collect_ranges(output, &mut ranges);

        if ranges.is_empty() {
            return self.lower_expr_multi(output, env);
        }

        let mut size: Option<i64> = None;
        for range in &ranges {
            let (lo, hi) = self.range_bounds(range)?;
            let this = hi - lo;
            match size {
                None => size = Some(this),
                Some(prev) if prev != this => {
                    self.error_with_help(
                        range.span,
                        format!(
                            "ranges in one output must have the same size (found {} and {})",
                            prev, this
                        ),
                        "every `a..b` in a single output unrolls in lockstep",
                    );
                    return None;
                }
                Some(_) => {}
            }
        }

        let size = size.unwrap_or(0);
        let mut out = Vec::new();
        for i in 0..size {
            let mut env = env.clone();
            env.range_index = Some(i);
            out.extend(self.lower_expr_multi(output, &env)?);
        }
        Some(out)
    }

    /// Declared strand names of a registered bundle, if its width is settled.
    fn bundle_sig_names(&self, name: &str) -> Option<Vec<String>> {
        match self.bundle_ref_width(name) {
            Ok(width) => {
                let names: Vec<String> = (0..width as u32)
                    .filter_map(|i| self.strand_name_at(name, i))
                    .collect();
                if names.len() == width {
                    Some(names)
                } else {
                    None
                }
            }
            Err(_) => None,
        }
    }
}

/// Names of pattern locals referenced by an expression (shallow scan; inner
/// chains resolve their own patterns).
fn local_refs(expr: &ast::Expr, names: &std::collections::HashSet<String>) -> Vec<String> {
    let mut out = Vec::new();
    collect_local_refs(expr, names, &mut out);
    out
}

fn collect_local_refs(
    expr: &ast::Expr,
    names: &std::collections::HashSet<String>,
    out: &mut Vec<String>,
) {
    match expr {
        ast::Expr::Ident(name) => {
            if names.contains(name) {
                out.push(name.clone());
            }
        }
        ast::Expr::Number(_) | ast::Expr::Str(_) | ast::Expr::Me(_) => {}
        ast::Expr::Tag { arg, .. } => {
            if let Some(arg) = arg {
                collect_local_refs(&arg.node, names, out);
            }
        }
        ast::Expr::Access { base, sel } => {
            if let Some(base) = base {
                collect_local_refs(&base.node, names, out);
            }
            if let ast::Selector::Dynamic(e) = sel {
                collect_local_refs(&e.node, names, out);
            }
        }
        ast::Expr::Binary { lhs, rhs, .. } => {
            collect_local_refs(&lhs.node, names, out);
            collect_local_refs(&rhs.node, names, out);
        }
        ast::Expr::Unary { operand, .. } => collect_local_refs(&operand.node, names, out),
        ast::Expr::Call { args, .. } => {
            for arg in args {
                collect_local_refs(&arg.node, names, out);
            }
        }
        ast::Expr::Tuple(items) => {
            for item in items {
                collect_local_refs(&item.node, names, out);
            }
        }
        ast::Expr::Chain { base, .. } => collect_local_refs(&base.node, names, out),
        ast::Expr::Remap { base, subs } => {
            collect_local_refs(&base.node, names, out);
            for arm in subs {
                collect_local_refs(&arm.value.node, names, out);
            }
        }
        ast::Expr::Range { start, end } => {
            collect_local_refs(&start.node, names, out);
            collect_local_refs(&end.node, names, out);
        }
    }
}

/// Collect range nodes in a pattern output. Inner chains are skipped; their
/// patterns unroll independently.
fn collect_ranges<'a>(expr: &'a Spanned<ast::Expr>, out: &mut Vec<&'a Spanned<ast::Expr>>) {
    match &expr.node {
        ast::Expr::Range { .. } => out.push(expr),
        ast::Expr::Number(_)
        | ast::Expr::Str(_)
        | ast::Expr::Ident(_)
        | ast::Expr::Me(_) => {}
        ast::Expr::Tag { arg, .. } => {
            if let Some(arg) = arg {
                collect_ranges(arg, out);
            }
        }
        ast::Expr::Access { base, sel } => {
            if let Some(base) = base {
                collect_ranges(base, out);
            }
            if let ast::Selector::Dynamic(e) = sel {
                collect_ranges(e, out);
            }
        }
        ast::Expr::Binary { lhs, rhs, .. } => {
            collect_ranges(lhs, out);
            collect_ranges(rhs, out);
        }
        ast::Expr::Unary { operand, .. } => collect_ranges(operand, out),
        ast::Expr::Call { args, .. } => {
            for arg in args {
                collect_ranges(arg, out);
            }
        }
        ast::Expr::Tuple(items) => {
            for item in items {
                collect_ranges(item, out);
            }
        }
        ast::Expr::Chain { .. } => {}
        ast::Expr::Remap { base, subs } => {
            collect_ranges(base, out);
            for arm in subs {
                collect_ranges(&arm.value, out);
            }
        }
    }
}

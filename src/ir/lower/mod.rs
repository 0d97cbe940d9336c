//! Lowering: surface AST → per-strand scalar IR.
//!
//! Two passes. Pass 1 registers every bundle's declared strand labels and
//! every spindle's declared width, so later declarations can reference
//! earlier names and vice versa. Pass 2 lowers each declaration's
//! expression to a vector of width-1 IR trees, expanding chains, patterns,
//! ranges, resources, and dynamic accesses along the way.

mod chain;
mod expr;
#[cfg(test)]
mod tests;

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::ast;
use crate::ast::{BundleTarget, Decl, OutputName};
use crate::diagnostic::{Diagnostic, Stage};
use crate::ir::{Bundle, Expr, ExprKind, Program, Spindle, Strand};
use crate::span::Span;

/// One lowered source declaration: which strands of which bundle it
/// produced. The scheduler permutes these into execution order.
#[derive(Clone, Debug)]
pub struct DeclEntry {
    pub bundle: String,
    pub strands: Vec<u32>,
    pub span: Span,
}

/// The lowered program plus its declaration entries (pre-scheduling).
#[derive(Clone, Debug)]
pub struct Lowered {
    pub program: Program,
    pub entries: Vec<DeclEntry>,
}

pub fn lower(file: &ast::SourceFile) -> Result<Lowered, Vec<Diagnostic>> {
    let mut lw = Lowerer::default();
    lw.register_declarations(file);
    if !lw.diagnostics.is_empty() {
        return Err(lw.diagnostics);
    }
    lw.lower_declarations(file);
    lw.finish()
}

/// Declared shape of a bundle, accumulated across its declarations.
struct BundleSig {
    /// Strand names in declaration order (explicit labels; inferred
    /// declarations append their positional names when lowered).
    names: Vec<String>,
    /// Inferred-width declarations not yet lowered. While nonzero the
    /// bundle's total width is unknown.
    inferred_pending: usize,
    span: Span,
}

impl Default for BundleSig {
    fn default() -> Self {
        Self {
            names: Vec::new(),
            inferred_pending: 0,
            span: Span::dummy(),
        }
    }
}

/// Declared shape of a spindle (pass 1; width firms up when lowered).
struct SpindleSig {
    params: usize,
    width: Option<usize>,
}

/// Scalar expressions produced by the previous chain step, addressable
/// inside the next pattern as `.0` / `.N` / `.field`.
#[derive(Clone, Debug, Default)]
pub(crate) struct Slots {
    pub exprs: Vec<Expr>,
    /// Set when the producing step has named strands.
    pub names: Option<Vec<String>>,
}

/// A pattern body's local scope: names registered up front (two-pass, so
/// forward references resolve), expressions filled in dependency order.
#[derive(Clone, Debug, Default)]
pub(crate) struct PatternScope {
    pub names: HashSet<String>,
    pub lowered: HashMap<String, (Vec<String>, Vec<Expr>)>,
}

/// Lowering environment: the scopes visible to the expression under
/// translation. Cloned freely; everything here is small or shared.
#[derive(Clone, Debug, Default)]
pub(crate) struct Env {
    pub params: Vec<String>,
    pub spindle_name: Option<String>,
    /// Spindle locals lowered so far (sequential scope).
    pub spindle_locals: Vec<Bundle>,
    pub slots: Option<Slots>,
    pub pattern: Option<PatternScope>,
    /// Concrete iteration index while unrolling a range-bearing output.
    pub range_index: Option<i64>,
}

#[derive(Default)]
pub(crate) struct Lowerer {
    pub(crate) program: Program,
    pub(crate) diagnostics: Vec<Diagnostic>,
    entries: Vec<DeclEntry>,
    bundle_sigs: BTreeMap<String, BundleSig>,
    spindle_sigs: BTreeMap<String, SpindleSig>,
    /// `bundle.N` accesses seen while the bundle's width was still open;
    /// validated once all declarations have lowered.
    deferred_index_checks: Vec<(String, u32, Span)>,
}

impl Lowerer {
    // ─── Pass 1: registration ─────────────────────────────────────

    fn register_declarations(&mut self, file: &ast::SourceFile) {
        for decl in &file.decls {
            match &decl.node {
                Decl::Bundle(b) => self.register_bundle_decl(b),
                Decl::Spindle(s) => self.register_spindle_decl(s),
            }
        }
    }

    fn register_bundle_decl(&mut self, b: &ast::BundleDecl) {
        let sig = self
            .bundle_sigs
            .entry(b.name.node.clone())
            .or_insert_with(|| BundleSig {
                span: b.name.span,
                ..BundleSig::default()
            });
        match &b.target {
            BundleTarget::Outputs(outs) => {
                for out in outs {
                    let name = out.node.strand_name();
                    if sig.names.contains(&name) {
                        self.diagnostics.push(
                            Diagnostic::error(
                                Stage::Lowering,
                                format!(
                                    "duplicate strand '{}' in bundle '{}'",
                                    name, b.name.node
                                ),
                                out.span,
                            )
                            .with_help("strand names must be unique within a bundle".to_string()),
                        );
                        continue;
                    }
                    // An explicit index label must match the position it lands at.
                    if let OutputName::Index(n) = out.node {
                        if n as usize != sig.names.len() {
                            self.diagnostics.push(Diagnostic::error(
                                Stage::Lowering,
                                format!(
                                    "strand index {} does not match its position {} in bundle '{}'",
                                    n,
                                    sig.names.len(),
                                    b.name.node
                                ),
                                out.span,
                            ));
                        }
                    }
                    sig.names.push(name);
                }
            }
            BundleTarget::Strand(out) => {
                let name = out.node.strand_name();
                if sig.names.contains(&name) {
                    self.diagnostics.push(Diagnostic::error(
                        Stage::Lowering,
                        format!("duplicate strand '{}' in bundle '{}'", name, b.name.node),
                        out.span,
                    ));
                } else {
                    if let OutputName::Index(n) = out.node {
                        if n as usize != sig.names.len() {
                            self.diagnostics.push(Diagnostic::error(
                                Stage::Lowering,
                                format!(
                                    "strand index {} does not match its position {} in bundle '{}'",
                                    n,
                                    sig.names.len(),
                                    b.name.node
                                ),
                                out.span,
                            ));
                        }
                    }
                    sig.names.push(name);
                }
            }
            BundleTarget::Inferred => {
                sig.inferred_pending += 1;
            }
        }
    }

    fn register_spindle_decl(&mut self, s: &ast::SpindleDecl) {
        if self.spindle_sigs.contains_key(&s.name.node) {
            self.diagnostics.push(
                Diagnostic::error(
                    Stage::Lowering,
                    format!("duplicate spindle '{}'", s.name.node),
                    s.name.span,
                )
                .with_help("each spindle may be defined only once".to_string()),
            );
            return;
        }

        // Best-effort width from the return statements; a bare
        // `return = expr` stays open until the body lowers.
        let mut max_indexed: Option<u32> = None;
        let mut tuple_width: Option<usize> = None;
        for item in &s.body.items {
            match &item.node {
                ast::BodyItem::ReturnIndexed { index, .. } => {
                    max_indexed = Some(max_indexed.map_or(*index, |m: u32| m.max(*index)));
                }
                ast::BodyItem::Return { value } => {
                    if let ast::Expr::Tuple(items) = &value.node {
                        tuple_width = Some(items.len());
                    }
                }
                ast::BodyItem::Local(_) => {}
            }
        }
        let width = tuple_width.or(max_indexed.map(|m| m as usize + 1));

        self.spindle_sigs.insert(
            s.name.node.clone(),
            SpindleSig {
                params: s.params.len(),
                width,
            },
        );
    }

    // ─── Pass 2: lowering ─────────────────────────────────────────

    fn lower_declarations(&mut self, file: &ast::SourceFile) {
        for decl in &file.decls {
            match &decl.node {
                Decl::Bundle(b) => self.lower_bundle_decl(b, decl.span),
                Decl::Spindle(s) => self.lower_spindle_decl(s),
            }
        }
    }

    fn lower_bundle_decl(&mut self, b: &ast::BundleDecl, span: Span) {
        let env = Env::default();
        let values = match self.lower_expr_multi(&b.value, &env) {
            Some(v) => v,
            None => return,
        };

        let (labels, was_inferred): (Vec<String>, bool) = match &b.target {
            BundleTarget::Outputs(outs) => {
                if outs.len() != values.len() {
                    self.diagnostics.push(
                        Diagnostic::error(
                            Stage::Lowering,
                            format!(
                                "width mismatch: '{}' declares {} outputs but the expression has width {}",
                                b.name.node,
                                outs.len(),
                                values.len()
                            ),
                            b.value.span,
                        )
                        .with_help(
                            "the output list and the expression must agree in width".to_string(),
                        ),
                    );
                    return;
                }
                (outs.iter().map(|o| o.node.strand_name()).collect(), false)
            }
            BundleTarget::Strand(out) => {
                if values.len() != 1 {
                    self.diagnostics.push(Diagnostic::error(
                        Stage::Lowering,
                        format!(
                            "width mismatch: '{}.{}' declares one strand but the expression has width {}",
                            b.name.node,
                            out.node.strand_name(),
                            values.len()
                        ),
                        b.value.span,
                    ));
                    return;
                }
                (vec![out.node.strand_name()], false)
            }
            BundleTarget::Inferred => {
                let base = self
                    .program
                    .bundles
                    .get(&b.name.node)
                    .map(|bu| bu.width())
                    .unwrap_or(0);
                (
                    (0..values.len()).map(|i| (base + i).to_string()).collect(),
                    true,
                )
            }
        };

        if was_inferred {
            let sig = self.bundle_sigs.entry(b.name.node.clone()).or_default();
            sig.inferred_pending = sig.inferred_pending.saturating_sub(1);
            sig.names.extend(labels.iter().cloned());
        }

        self.append_strands(&b.name.node, b.name.span, labels, values, span);
    }

    fn append_strands(
        &mut self,
        bundle_name: &str,
        name_span: Span,
        labels: Vec<String>,
        values: Vec<Expr>,
        decl_span: Span,
    ) {
        let bundle = self
            .program
            .bundles
            .entry(bundle_name.to_string())
            .or_insert_with(|| Bundle {
                name: bundle_name.to_string(),
                strands: Vec::new(),
                span: name_span,
            });

        let mut indices = Vec::with_capacity(labels.len());
        for (label, value) in labels.into_iter().zip(values) {
            let index = bundle.strands.len() as u32;
            // Duplicates were reported during registration; skip quietly.
            if bundle.strands.iter().any(|s| s.name == label) {
                continue;
            }
            bundle.strands.push(Strand {
                name: label,
                index,
                expr: value,
            });
            indices.push(index);
        }

        self.entries.push(DeclEntry {
            bundle: bundle_name.to_string(),
            strands: indices,
            span: decl_span,
        });
    }

    fn lower_spindle_decl(&mut self, s: &ast::SpindleDecl) {
        let mut env = Env {
            params: s.params.iter().map(|p| p.node.clone()).collect(),
            spindle_name: Some(s.name.node.clone()),
            ..Env::default()
        };

        // Parameter names must be distinct.
        for (i, p) in s.params.iter().enumerate() {
            if s.params[..i].iter().any(|q| q.node == p.node) {
                self.diagnostics.push(Diagnostic::error(
                    Stage::Lowering,
                    format!("duplicate parameter '{}' in spindle '{}'", p.node, s.name.node),
                    p.span,
                ));
            }
        }

        let mut indexed: BTreeMap<u32, Expr> = BTreeMap::new();
        let mut tuple_returns: Option<Vec<Expr>> = None;
        let mut saw_indexed = false;
        let mut saw_plain = false;

        for item in &s.body.items {
            match &item.node {
                ast::BodyItem::Local(local) => {
                    self.lower_spindle_local(local, &mut env);
                }
                ast::BodyItem::ReturnIndexed { index, value } => {
                    saw_indexed = true;
                    if saw_plain {
                        let d = self.mixed_return_error(&s.name.node, item.span);
                        self.diagnostics.push(d);
                        continue;
                    }
                    if indexed.contains_key(index) {
                        self.diagnostics.push(Diagnostic::error(
                            Stage::Lowering,
                            format!(
                                "duplicate return index {} in spindle '{}'",
                                index, s.name.node
                            ),
                            item.span,
                        ));
                        continue;
                    }
                    if let Some(values) = self.lower_expr_multi(value, &env) {
                        if values.len() != 1 {
                            self.diagnostics.push(Diagnostic::error(
                                Stage::Lowering,
                                format!(
                                    "width mismatch: return.{} takes one value but the expression has width {}",
                                    index,
                                    values.len()
                                ),
                                value.span,
                            ));
                            continue;
                        }
                        indexed.insert(*index, values.into_iter().next().unwrap());
                    }
                }
                ast::BodyItem::Return { value } => {
                    saw_plain = true;
                    if saw_indexed {
                        let d = self.mixed_return_error(&s.name.node, item.span);
                        self.diagnostics.push(d);
                        continue;
                    }
                    if let Some(values) = self.lower_expr_multi(value, &env) {
                        tuple_returns = Some(values);
                    }
                }
            }
        }

        let returns = if let Some(returns) = tuple_returns {
            returns
        } else if saw_indexed {
            let width = indexed.keys().max().map(|m| *m as usize + 1).unwrap_or(0);
            let mut returns = Vec::with_capacity(width);
            let mut complete = true;
            for i in 0..width as u32 {
                match indexed.remove(&i) {
                    Some(e) => returns.push(e),
                    None => {
                        complete = false;
                        self.diagnostics.push(
                            Diagnostic::error(
                                Stage::Lowering,
                                format!(
                                    "spindle '{}' is missing return index {}",
                                    s.name.node, i
                                ),
                                s.name.span,
                            )
                            .with_help(
                                "return indices must cover 0..max without gaps".to_string(),
                            ),
                        );
                    }
                }
            }
            if !complete {
                return;
            }
            returns
        } else {
            self.diagnostics.push(
                Diagnostic::error(
                    Stage::Lowering,
                    format!("spindle '{}' has no return statement", s.name.node),
                    s.name.span,
                )
                .with_help(
                    "every spindle body needs `return = [...]` or `return.N = expr`".to_string(),
                ),
            );
            return;
        };

        if returns.is_empty() {
            self.diagnostics.push(Diagnostic::error(
                Stage::Lowering,
                format!("spindle '{}' returns nothing", s.name.node),
                s.name.span,
            ));
            return;
        }

        if let Some(sig) = self.spindle_sigs.get_mut(&s.name.node) {
            sig.width = Some(returns.len());
        }

        self.program.spindles.insert(
            s.name.node.clone(),
            Spindle {
                name: s.name.node.clone(),
                params: s.params.iter().map(|p| p.node.clone()).collect(),
                locals: env.spindle_locals,
                returns,
                span: s.name.span,
            },
        );
    }

    fn mixed_return_error(&self, spindle: &str, span: Span) -> Diagnostic {
        Diagnostic::error(
            Stage::Lowering,
            format!(
                "spindle '{}' mixes `return = [...]` with `return.N = ...`",
                spindle
            ),
            span,
        )
        .with_help("use one return form per spindle".to_string())
    }

    /// Lower one local bundle declaration inside a spindle body.
    fn lower_spindle_local(&mut self, local: &ast::BundleDecl, env: &mut Env) {
        let values = match self.lower_expr_multi(&local.value, env) {
            Some(v) => v,
            None => return,
        };

        let labels: Vec<String> = match &local.target {
            BundleTarget::Outputs(outs) => {
                if outs.len() != values.len() {
                    self.diagnostics.push(Diagnostic::error(
                        Stage::Lowering,
                        format!(
                            "width mismatch: '{}' declares {} outputs but the expression has width {}",
                            local.name.node,
                            outs.len(),
                            values.len()
                        ),
                        local.value.span,
                    ));
                    return;
                }
                outs.iter().map(|o| o.node.strand_name()).collect()
            }
            BundleTarget::Strand(out) => {
                if values.len() != 1 {
                    self.diagnostics.push(Diagnostic::error(
                        Stage::Lowering,
                        format!(
                            "width mismatch: '{}.{}' declares one strand but the expression has width {}",
                            local.name.node,
                            out.node.strand_name(),
                            values.len()
                        ),
                        local.value.span,
                    ));
                    return;
                }
                vec![out.node.strand_name()]
            }
            BundleTarget::Inferred => (0..values.len()).map(|i| i.to_string()).collect(),
        };

        // Locals with the same name accumulate strands, like globals.
        if let Some(existing) = env
            .spindle_locals
            .iter_mut()
            .find(|b| b.name == local.name.node)
        {
            for (label, value) in labels.into_iter().zip(values) {
                if existing.strands.iter().any(|s| s.name == label) {
                    self.diagnostics.push(Diagnostic::error(
                        Stage::Lowering,
                        format!(
                            "duplicate strand '{}' in local bundle '{}'",
                            label, local.name.node
                        ),
                        local.name.span,
                    ));
                    continue;
                }
                let index = existing.strands.len() as u32;
                existing.strands.push(Strand {
                    name: label,
                    index,
                    expr: value,
                });
            }
        } else {
            let strands = labels
                .into_iter()
                .zip(values)
                .enumerate()
                .map(|(i, (label, value))| Strand {
                    name: label,
                    index: i as u32,
                    expr: value,
                })
                .collect();
            env.spindle_locals.push(Bundle {
                name: local.name.node.clone(),
                strands,
                span: local.name.span,
            });
        }
    }

    // ─── Finishing checks ─────────────────────────────────────────

    fn finish(mut self) -> Result<Lowered, Vec<Diagnostic>> {
        self.check_deferred_indices();
        self.check_sink_widths();
        self.check_spindle_recursion();

        if self.diagnostics.is_empty() {
            Ok(Lowered {
                program: self.program,
                entries: self.entries,
            })
        } else {
            Err(self.diagnostics)
        }
    }

    fn check_deferred_indices(&mut self) {
        let checks = std::mem::take(&mut self.deferred_index_checks);
        for (bundle, index, span) in checks {
            let width = self
                .program
                .bundles
                .get(&bundle)
                .map(|b| b.width())
                .unwrap_or(0);
            if index as usize >= width {
                self.diagnostics.push(Diagnostic::error(
                    Stage::Lowering,
                    format!(
                        "strand index {} is out of bounds for bundle '{}' (width {})",
                        index, bundle, width
                    ),
                    span,
                ));
            }
        }
    }

    fn check_sink_widths(&mut self) {
        if let Some(display) = self.program.bundles.get("display") {
            if display.width() != 3 {
                self.diagnostics.push(
                    Diagnostic::error(
                        Stage::Lowering,
                        format!(
                            "sink 'display' must have width 3 (r, g, b), found width {}",
                            display.width()
                        ),
                        display.span,
                    )
                    .with_help("declare it as `display[r, g, b] = ...`".to_string()),
                );
            }
        }
        if let Some(play) = self.program.bundles.get("play") {
            let w = play.width();
            if w != 1 && w != 2 {
                self.diagnostics.push(
                    Diagnostic::error(
                        Stage::Lowering,
                        format!(
                            "sink 'play' must have width 1 (mono) or 2 (stereo), found width {}",
                            w
                        ),
                        play.span,
                    )
                    .with_help("declare it as `play[0] = ...` or `play[l, r] = ...`".to_string()),
                );
            }
        }
    }

    /// Spindles may call each other but never recursively.
    fn check_spindle_recursion(&mut self) {
        fn calls_of(spindle: &Spindle) -> Vec<String> {
            let mut out = Vec::new();
            let mut collect = |e: &Expr| {
                if let ExprKind::Call { spindle, .. } = &e.kind {
                    out.push(spindle.clone());
                }
            };
            for r in &spindle.returns {
                r.walk(&mut collect);
            }
            for local in &spindle.locals {
                for strand in &local.strands {
                    strand.expr.walk(&mut collect);
                }
            }
            out
        }

        let mut visited: HashSet<String> = HashSet::new();
        for name in self.program.spindles.keys().cloned().collect::<Vec<_>>() {
            if visited.contains(&name) {
                continue;
            }
            let mut stack: Vec<String> = Vec::new();
            let mut on_stack: HashSet<String> = HashSet::new();
            self.recursion_dfs(&name, &mut visited, &mut stack, &mut on_stack, &calls_of);
        }
    }

    fn recursion_dfs(
        &mut self,
        name: &str,
        visited: &mut HashSet<String>,
        stack: &mut Vec<String>,
        on_stack: &mut HashSet<String>,
        calls_of: &dyn Fn(&Spindle) -> Vec<String>,
    ) {
        if on_stack.contains(name) {
            let cycle: Vec<&str> = stack
                .iter()
                .skip_while(|n| n.as_str() != name)
                .map(|n| n.as_str())
                .chain(std::iter::once(name))
                .collect();
            let span = self
                .program
                .spindles
                .get(name)
                .map(|s| s.span)
                .unwrap_or_else(Span::dummy);
            self.diagnostics.push(
                Diagnostic::error(
                    Stage::Lowering,
                    format!("recursive spindle call: {}", cycle.join(" -> ")),
                    span,
                )
                .with_help("spindles cannot call themselves, directly or indirectly".to_string()),
            );
            return;
        }
        if visited.contains(name) {
            return;
        }
        visited.insert(name.to_string());
        on_stack.insert(name.to_string());
        stack.push(name.to_string());

        let callees = self
            .program
            .spindles
            .get(name)
            .map(|s| calls_of(s))
            .unwrap_or_default();
        for callee in callees {
            self.recursion_dfs(&callee, visited, stack, on_stack, calls_of);
        }

        stack.pop();
        on_stack.remove(name);
    }

    // ─── Shared lookups (used by expr/chain lowering) ─────────────

    /// Width of a bundle referenced as a whole, if it can be known here.
    pub(crate) fn bundle_ref_width(&self, name: &str) -> Result<usize, WidthError> {
        match self.bundle_sigs.get(name) {
            None => Err(WidthError::Unknown),
            Some(sig) if sig.inferred_pending > 0 => Err(WidthError::NotYetKnown),
            Some(sig) => Ok(sig.names.len()),
        }
    }

    /// Resolve a strand name within a bundle to its position.
    pub(crate) fn strand_position(&self, bundle: &str, strand: &str) -> Option<u32> {
        self.bundle_sigs
            .get(bundle)?
            .names
            .iter()
            .position(|n| n == strand)
            .map(|i| i as u32)
    }

    /// Declared name of the strand at a position, if registered.
    pub(crate) fn strand_name_at(&self, bundle: &str, index: u32) -> Option<String> {
        self.bundle_sigs
            .get(bundle)?
            .names
            .get(index as usize)
            .cloned()
    }

    pub(crate) fn bundle_exists(&self, name: &str) -> bool {
        self.bundle_sigs.contains_key(name)
    }

    pub(crate) fn spindle_call_info(&self, name: &str) -> Option<(usize, Option<usize>)> {
        self.spindle_sigs.get(name).map(|s| (s.params, s.width))
    }

    pub(crate) fn defer_index_check(&mut self, bundle: &str, index: u32, span: Span) {
        self.deferred_index_checks
            .push((bundle.to_string(), index, span));
    }

    pub(crate) fn error(&mut self, span: Span, message: String) {
        self.diagnostics
            .push(Diagnostic::error(Stage::Lowering, message, span));
    }

    pub(crate) fn error_with_help(&mut self, span: Span, message: String, help: &str) {
        self.diagnostics.push(
            Diagnostic::error(Stage::Lowering, message, span).with_help(help.to_string()),
        );
    }
}

/// Why a bundle's width could not be produced at a reference site.
pub(crate) enum WidthError {
    Unknown,
    NotYetKnown,
}

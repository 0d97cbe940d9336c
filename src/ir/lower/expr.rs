//! Expression lowering: AST expressions → vectors of width-1 IR trees.
//!
//! The width of a surface expression is the length of the vector it lowers
//! to. Name resolution order inside a spindle is parameter, then spindle
//! local, then global; pattern locals shadow everything within their
//! pattern.

use super::{Env, Lowerer, WidthError};
use crate::ast;
use crate::ast::{OutputName, Selector};
use crate::ir::{intern, BuiltinFn, Expr, ExprKind, IndexKey};
use crate::span::{Span, Spanned};

/// Reserved `me` coordinates, after alias normalization.
const ME_FIELDS: &[&str] = &[
    "x", "y", "w", "h", "t", "i", "sampleRate", "duration",
];

/// Canonicalize a `me` field name, resolving aliases.
pub(crate) fn me_field(name: &str) -> Option<&'static str> {
    match name {
        "u" => Some("x"),
        "v" => Some("y"),
        "rate" => Some("sampleRate"),
        other => ME_FIELDS.iter().find(|f| **f == other).copied(),
    }
}

impl Lowerer {
    /// Lower an expression to one IR tree per component.
    /// Returns `None` after recording a diagnostic.
    pub(crate) fn lower_expr_multi(
        &mut self,
        expr: &Spanned<ast::Expr>,
        env: &Env,
    ) -> Option<Vec<Expr>> {
        let span = expr.span;
        match &expr.node {
            ast::Expr::Number(n) => Some(vec![Expr::num(*n, span)]),

            ast::Expr::Str(_) => {
                self.error_with_help(
                    span,
                    "string literal outside a resource argument".to_string(),
                    "strings are only valid as the path of texture/load/sample or the \
                     content of text",
                );
                None
            }

            ast::Expr::Ident(name) => self.lower_ident(name, span, env),

            ast::Expr::Me(field) => {
                let canonical = match me_field(&field.node) {
                    Some(c) => c,
                    None => {
                        self.error_with_help(
                            field.span,
                            format!("unknown coordinate 'me.{}'", field.node),
                            "reserved coordinates are x, y, u, v, w, h, t, i, rate, \
                             sampleRate, duration",
                        );
                        return None;
                    }
                };
                Some(vec![Expr::new(
                    ExprKind::Index {
                        bundle: "me".to_string(),
                        index: IndexKey::Field(canonical.to_string()),
                    },
                    span,
                )])
            }

            ast::Expr::Tag { name, .. } => {
                self.error(
                    name.span,
                    format!("tag '${}' survived desugaring", name.node),
                );
                None
            }

            ast::Expr::Access { base, sel } => match base {
                Some(base) => self.lower_access(base, sel, span, env),
                None => self.lower_slot_access(sel, span, env),
            },

            ast::Expr::Binary { op, lhs, rhs } => {
                let lhs = self.lower_expr_multi(lhs, env)?;
                let rhs = self.lower_expr_multi(rhs, env)?;
                let (lhs, rhs) = match broadcast(lhs, rhs) {
                    Some(pair) => pair,
                    None => {
                        self.error_with_help(
                            span,
                            "width mismatch between operands".to_string(),
                            "operands must have the same width, or one side must be scalar",
                        );
                        return None;
                    }
                };
                Some(
                    lhs.into_iter()
                        .zip(rhs)
                        .map(|(l, r)| {
                            Expr::new(
                                ExprKind::Binary {
                                    op: *op,
                                    lhs: Box::new(l),
                                    rhs: Box::new(r),
                                },
                                span,
                            )
                        })
                        .collect(),
                )
            }

            ast::Expr::Unary { op, operand } => {
                let operand = self.lower_expr_multi(operand, env)?;
                Some(
                    operand
                        .into_iter()
                        .map(|o| {
                            Expr::new(
                                ExprKind::Unary {
                                    op: *op,
                                    operand: Box::new(o),
                                },
                                span,
                            )
                        })
                        .collect(),
                )
            }

            ast::Expr::Call { name, args } => self.lower_call(name, args, span, env),

            ast::Expr::Tuple(items) => {
                let mut out = Vec::new();
                for item in items {
                    out.extend(self.lower_expr_multi(item, env)?);
                }
                Some(out)
            }

            ast::Expr::Chain { base, patterns } => self.lower_chain(base, patterns, env),

            ast::Expr::Remap { base, subs } => self.lower_remap(base, subs, span, env),

            ast::Expr::Range { .. } => match env.range_index {
                Some(i) => {
                    let (start, _end) = self.range_bounds(expr)?;
                    Some(vec![Expr::num((start + i) as f64, span)])
                }
                None => {
                    self.error_with_help(
                        span,
                        "range outside a chain pattern".to_string(),
                        "`a..b` can only appear in the outputs of a chain pattern, where it \
                         unrolls one strand per index",
                    );
                    None
                }
            },
        }
    }

    /// Lower a single-component expression, reporting a width error otherwise.
    pub(crate) fn lower_expr_scalar(
        &mut self,
        expr: &Spanned<ast::Expr>,
        env: &Env,
        what: &str,
    ) -> Option<Expr> {
        let values = self.lower_expr_multi(expr, env)?;
        if values.len() != 1 {
            self.error(
                expr.span,
                format!("{} must be scalar, found width {}", what, values.len()),
            );
            return None;
        }
        values.into_iter().next()
    }

    /// Integer bounds of a range expression; both ends must be number
    /// literals (unary minus allowed). Negative-count ranges are errors.
    pub(crate) fn range_bounds(&mut self, expr: &Spanned<ast::Expr>) -> Option<(i64, i64)> {
        let (start, end) = match &expr.node {
            ast::Expr::Range { start, end } => (start, end),
            _ => return None,
        };
        let lo = match const_int(&start.node) {
            Some(n) => n,
            None => {
                self.error(start.span, "range bounds must be number literals".to_string());
                return None;
            }
        };
        let hi = match const_int(&end.node) {
            Some(n) => n,
            None => {
                self.error(end.span, "range bounds must be number literals".to_string());
                return None;
            }
        };
        if hi < lo {
            self.error(
                expr.span,
                format!("range {}..{} has negative size", lo, hi),
            );
            return None;
        }
        Some((lo, hi))
    }

    // ─── Identifier resolution ────────────────────────────────────

    fn lower_ident(&mut self, name: &str, span: Span, env: &Env) -> Option<Vec<Expr>> {
        // Pattern locals shadow everything inside their pattern.
        if let Some(pattern) = &env.pattern {
            if pattern.names.contains(name) {
                match pattern.lowered.get(name) {
                    Some((_, exprs)) => return Some(exprs.clone()),
                    None => {
                        self.error(
                            span,
                            format!("circular reference to pattern local '{}'", name),
                        );
                        return None;
                    }
                }
            }
        }

        if env.params.iter().any(|p| p.as_str() == name) {
            return Some(vec![Expr::new(ExprKind::Param(name.to_string()), span)]);
        }

        if let Some(local) = env.spindle_locals.iter().find(|b| b.name == name) {
            return Some(
                (0..local.width() as u32)
                    .map(|i| {
                        Expr::new(
                            ExprKind::Index {
                                bundle: name.to_string(),
                                index: IndexKey::Pos(i),
                            },
                            span,
                        )
                    })
                    .collect(),
            );
        }

        match self.bundle_ref_width(name) {
            Ok(width) => Some(
                (0..width as u32)
                    .map(|i| {
                        Expr::new(
                            ExprKind::Index {
                                bundle: name.to_string(),
                                index: IndexKey::Pos(i),
                            },
                            span,
                        )
                    })
                    .collect(),
            ),
            Err(WidthError::NotYetKnown) => {
                self.error_with_help(
                    span,
                    format!("width of bundle '{}' is not known here", name),
                    "declare the bundle's outputs explicitly, or move its declaration \
                     before this use",
                );
                None
            }
            Err(WidthError::Unknown) => {
                let what = if env.spindle_name.is_some() {
                    "identifier"
                } else {
                    "bundle"
                };
                self.error(span, format!("unknown {} '{}'", what, name));
                None
            }
        }
    }

    // ─── Strand access ────────────────────────────────────────────

    fn lower_access(
        &mut self,
        base: &Spanned<ast::Expr>,
        sel: &Selector,
        span: Span,
        env: &Env,
    ) -> Option<Vec<Expr>> {
        // `bundle.sel` resolves by name so a single strand can be read even
        // while the bundle's total width is still open.
        if let ast::Expr::Ident(name) = &base.node {
            return self.lower_named_access(name, base.span, sel, span, env);
        }

        // Any other base: lower it and select a component.
        let components = self.lower_expr_multi(base, env)?;
        match sel {
            Selector::Index(n) => {
                if *n as usize >= components.len() {
                    self.error(
                        span,
                        format!(
                            "component {} is out of bounds (width {})",
                            n,
                            components.len()
                        ),
                    );
                    return None;
                }
                Some(vec![components[*n as usize].clone()])
            }
            Selector::Name(field) => {
                self.error(
                    span,
                    format!("named access '.{}' requires a bundle", field),
                );
                None
            }
            Selector::Dynamic(index) => {
                let index = self.lower_expr_scalar(index, env, "dynamic strand index")?;
                Some(vec![make_select(index, components, span)])
            }
        }
    }

    fn lower_named_access(
        &mut self,
        name: &str,
        name_span: Span,
        sel: &Selector,
        span: Span,
        env: &Env,
    ) -> Option<Vec<Expr>> {
        // Pattern local?
        if let Some(pattern) = &env.pattern {
            if pattern.names.contains(name) {
                let (strand_names, exprs) = match pattern.lowered.get(name) {
                    Some(entry) => entry.clone(),
                    None => {
                        self.error(
                            span,
                            format!("circular reference to pattern local '{}'", name),
                        );
                        return None;
                    }
                };
                return self.select_component(&exprs, Some(&strand_names), sel, span, env);
            }
        }

        if env.params.iter().any(|p| p.as_str() == name) {
            self.error(
                span,
                format!("parameter '{}' is scalar and has no strands", name),
            );
            return None;
        }

        // Spindle local?
        if let Some(local) = env.spindle_locals.iter().find(|b| b.name == name) {
            let names: Vec<String> = local.strands.iter().map(|s| s.name.clone()).collect();
            let width = local.width() as u32;
            let reads: Vec<Expr> = (0..width)
                .map(|i| {
                    Expr::new(
                        ExprKind::Index {
                            bundle: name.to_string(),
                            index: IndexKey::Pos(i),
                        },
                        span,
                    )
                })
                .collect();
            return self.select_component(&reads, Some(&names), sel, span, env);
        }

        // Global bundle.
        if !self.bundle_exists(name) {
            self.error(name_span, format!("unknown bundle '{}'", name));
            return None;
        }

        match sel {
            Selector::Name(field) => match self.strand_position(name, field) {
                Some(pos) => Some(vec![Expr::new(
                    ExprKind::Index {
                        bundle: name.to_string(),
                        index: IndexKey::Pos(pos),
                    },
                    span,
                )]),
                None => {
                    self.error(
                        span,
                        format!("unknown strand '{}' in bundle '{}'", field, name),
                    );
                    None
                }
            },
            Selector::Index(n) => {
                match self.bundle_ref_width(name) {
                    Ok(width) => {
                        if *n as usize >= width {
                            self.error(
                                span,
                                format!(
                                    "strand index {} is out of bounds for bundle '{}' (width {})",
                                    n, name, width
                                ),
                            );
                            return None;
                        }
                    }
                    // Width still open: validate once every declaration lowered.
                    Err(_) => self.defer_index_check(name, *n, span),
                }
                Some(vec![Expr::new(
                    ExprKind::Index {
                        bundle: name.to_string(),
                        index: IndexKey::Pos(*n),
                    },
                    span,
                )])
            }
            Selector::Dynamic(index) => {
                let width = match self.bundle_ref_width(name) {
                    Ok(w) => w,
                    Err(_) => {
                        self.error_with_help(
                            span,
                            format!(
                                "dynamic access needs the full width of bundle '{}', which is \
                                 not known here",
                                name
                            ),
                            "declare the bundle's outputs explicitly, or move its declaration \
                             before this use",
                        );
                        return None;
                    }
                };
                let index = self.lower_expr_scalar(index, env, "dynamic strand index")?;
                let reads: Vec<Expr> = (0..width as u32)
                    .map(|i| {
                        Expr::new(
                            ExprKind::Index {
                                bundle: name.to_string(),
                                index: IndexKey::Pos(i),
                            },
                            span,
                        )
                    })
                    .collect();
                Some(vec![make_select(index, reads, span)])
            }
        }
    }

    /// Bare `.field` / `.N` / `.(expr)`: resolve against the pattern slots.
    fn lower_slot_access(
        &mut self,
        sel: &Selector,
        span: Span,
        env: &Env,
    ) -> Option<Vec<Expr>> {
        let slots = match &env.slots {
            Some(slots) => slots.clone(),
            None => {
                self.error_with_help(
                    span,
                    "bare strand access outside a chain pattern".to_string(),
                    "`.0`, `.name`, and `.(expr)` refer to the previous chain step and are \
                     only valid inside a pattern",
                );
                return None;
            }
        };
        self.select_component(&slots.exprs, slots.names.as_deref(), sel, span, env)
    }

    /// Shared selection over an already-lowered component list.
    fn select_component(
        &mut self,
        components: &[Expr],
        names: Option<&[String]>,
        sel: &Selector,
        span: Span,
        env: &Env,
    ) -> Option<Vec<Expr>> {
        match sel {
            Selector::Index(n) => {
                if *n as usize >= components.len() {
                    self.error(
                        span,
                        format!(
                            "strand index {} is out of bounds (width {})",
                            n,
                            components.len()
                        ),
                    );
                    return None;
                }
                Some(vec![components[*n as usize].clone()])
            }
            Selector::Name(field) => {
                let pos = names.and_then(|ns| ns.iter().position(|n| n == field));
                match pos {
                    Some(pos) => Some(vec![components[pos].clone()]),
                    None => {
                        self.error(
                            span,
                            format!("no strand named '{}' at this point in the chain", field),
                        );
                        None
                    }
                }
            }
            Selector::Dynamic(index) => {
                let index = self.lower_expr_scalar(index, env, "dynamic strand index")?;
                Some(vec![make_select(index, components.to_vec(), span)])
            }
        }
    }

    // ─── Calls and builtins ───────────────────────────────────────

    fn lower_call(
        &mut self,
        name: &Spanned<String>,
        args: &[Spanned<ast::Expr>],
        span: Span,
        env: &Env,
    ) -> Option<Vec<Expr>> {
        // User spindles shadow builtins.
        if let Some((param_count, declared_width)) = self.spindle_call_info(&name.node) {
            if args.len() != param_count {
                self.error(
                    span,
                    format!(
                        "spindle '{}' takes {} arguments, found {}",
                        name.node,
                        param_count,
                        args.len()
                    ),
                );
                return None;
            }
            let mut lowered_args = Vec::with_capacity(args.len());
            for arg in args {
                lowered_args.push(self.lower_expr_scalar(arg, env, "spindle argument")?);
            }
            let width = declared_width.or_else(|| {
                self.program.spindles.get(&name.node).map(|s| s.width())
            });
            let width = match width {
                Some(w) => w,
                None => {
                    self.error_with_help(
                        span,
                        format!("return width of spindle '{}' is not known here", name.node),
                        "give the spindle a `return = [...]` tuple or indexed returns, or \
                         move its definition before this call",
                    );
                    return None;
                }
            };
            let call = Expr::new(
                ExprKind::Call {
                    spindle: name.node.clone(),
                    args: lowered_args,
                },
                span,
            );
            return Some(
                (0..width as u32)
                    .map(|i| {
                        Expr::new(
                            ExprKind::Extract {
                                call: Box::new(call.clone()),
                                index: i,
                            },
                            span,
                        )
                    })
                    .collect(),
            );
        }

        let builtin = match BuiltinFn::from_name(&name.node) {
            Some(b) => b,
            None => {
                self.error(
                    name.span,
                    format!("unknown spindle or builtin '{}'", name.node),
                );
                return None;
            }
        };
        self.lower_builtin(builtin, args, span, env)
    }

    fn lower_builtin(
        &mut self,
        builtin: BuiltinFn,
        args: &[Spanned<ast::Expr>],
        span: Span,
        env: &Env,
    ) -> Option<Vec<Expr>> {
        let (min, max) = builtin.arity();
        if args.len() < min || args.len() > max {
            let expected = if min == max {
                format!("{}", min)
            } else if max == usize::MAX {
                format!("at least {}", min)
            } else {
                format!("{} to {}", min, max)
            };
            self.error(
                span,
                format!(
                    "builtin '{}' takes {} arguments, found {}",
                    builtin.as_str(),
                    expected,
                    args.len()
                ),
            );
            return None;
        }

        // `load` takes a bare path or a path with both coordinates.
        if builtin == BuiltinFn::Load && args.len() == 2 {
            self.error_with_help(
                span,
                "'load' takes a path alone or a path with u and v".to_string(),
                "use `load(\"img.png\")` or `load(\"img.png\", u, v)`",
            );
            return None;
        }

        // Resource builtins intern their leading string argument.
        if builtin.is_resource() {
            let path = match &args[0].node {
                ast::Expr::Str(s) => s.clone(),
                _ => {
                    self.error_with_help(
                        args[0].span,
                        format!(
                            "the first argument of '{}' must be a string literal",
                            builtin.as_str()
                        ),
                        "resource paths are resolved at compile time and cannot be computed",
                    );
                    return None;
                }
            };
            if path.is_empty() {
                self.error(args[0].span, "empty resource path".to_string());
                return None;
            }
            let id = if builtin == BuiltinFn::Text {
                intern(&mut self.program.text_resources, &path)
            } else {
                intern(&mut self.program.resources, &path)
            };

            let mut rest = Vec::with_capacity(args.len() - 1);
            for arg in &args[1..] {
                rest.push(self.lower_expr_scalar(arg, env, "builtin argument")?);
            }

            let width = builtin.width();
            return Some(
                (0..width)
                    .map(|ch| {
                        let mut call_args = vec![Expr::num(id as f64, span)];
                        call_args.extend(rest.iter().cloned());
                        call_args.push(Expr::num(ch as f64, span));
                        Expr::new(
                            ExprKind::Builtin {
                                name: builtin,
                                args: call_args,
                            },
                            span,
                        )
                    })
                    .collect(),
            );
        }

        let mut lowered = Vec::with_capacity(args.len());
        for arg in args {
            lowered.push(self.lower_expr_scalar(arg, env, "builtin argument")?);
        }

        // Hardware inputs expand per channel like resources do.
        let width = builtin.width();
        if width > 1 {
            return Some(
                (0..width)
                    .map(|ch| {
                        let mut call_args = lowered.clone();
                        call_args.push(Expr::num(ch as f64, span));
                        Expr::new(
                            ExprKind::Builtin {
                                name: builtin,
                                args: call_args,
                            },
                            span,
                        )
                    })
                    .collect(),
            );
        }

        Some(vec![Expr::new(
            ExprKind::Builtin {
                name: builtin,
                args: lowered,
            },
            span,
        )])
    }

    // ─── Remap ────────────────────────────────────────────────────

    fn lower_remap(
        &mut self,
        base: &Spanned<ast::Expr>,
        subs: &[ast::RemapArm],
        span: Span,
        env: &Env,
    ) -> Option<Vec<Expr>> {
        let mut lowered_subs: Vec<(String, Expr)> = Vec::with_capacity(subs.len());
        let mut temporal = false;

        for arm in subs {
            let key = if arm.bundle.node == "me" {
                let field = match &arm.sel.node {
                    OutputName::Name(f) => f.clone(),
                    OutputName::Index(_) => {
                        self.error(
                            arm.sel.span,
                            "coordinates of 'me' are addressed by name".to_string(),
                        );
                        return None;
                    }
                };
                let canonical = match me_field(&field) {
                    Some(c) => c,
                    None => {
                        self.error(
                            arm.sel.span,
                            format!("unknown coordinate 'me.{}'", field),
                        );
                        return None;
                    }
                };
                if canonical == "t" {
                    temporal = true;
                }
                format!("me.{}", canonical)
            } else {
                let bundle = &arm.bundle.node;
                if !self.bundle_exists(bundle) {
                    self.error_with_help(
                        arm.bundle.span,
                        format!("invalid remap argument: unknown bundle '{}'", bundle),
                        "remap keys are qualified strand names like `pos.x` or `me.t`",
                    );
                    return None;
                }
                let pos = match &arm.sel.node {
                    OutputName::Index(n) => *n,
                    OutputName::Name(field) => match self.strand_position(bundle, field) {
                        Some(pos) => pos,
                        None => {
                            self.error(
                                arm.sel.span,
                                format!(
                                    "invalid remap argument: unknown strand '{}' in bundle '{}'",
                                    field, bundle
                                ),
                            );
                            return None;
                        }
                    },
                };
                format!("{}.{}", bundle, pos)
            };

            let value = self.lower_expr_scalar(&arm.value, env, "remap value")?;
            lowered_subs.push((key, value));
        }

        let components = self.lower_expr_multi(base, env)?;
        Some(
            components
                .into_iter()
                .map(|component| {
                    Expr::new(
                        ExprKind::Remap {
                            base: Box::new(component),
                            subs: lowered_subs.clone(),
                            temporal,
                        },
                        span,
                    )
                })
                .collect(),
        )
    }
}

/// `select(i, v0, ..., vN)` over explicit components.
pub(crate) fn make_select(index: Expr, components: Vec<Expr>, span: Span) -> Expr {
    let mut args = Vec::with_capacity(components.len() + 1);
    args.push(index);
    args.extend(components);
    Expr::new(
        ExprKind::Builtin {
            name: BuiltinFn::Select,
            args,
        },
        span,
    )
}

/// Broadcast two component lists to a common width, if possible.
fn broadcast(lhs: Vec<Expr>, rhs: Vec<Expr>) -> Option<(Vec<Expr>, Vec<Expr>)> {
    if lhs.len() == rhs.len() {
        return Some((lhs, rhs));
    }
    if lhs.len() == 1 {
        let l = lhs.into_iter().next().unwrap();
        let lhs = vec![l; rhs.len()];
        return Some((lhs, rhs));
    }
    if rhs.len() == 1 {
        let r = rhs.into_iter().next().unwrap();
        let rhs = vec![r; lhs.len()];
        return Some((lhs, rhs));
    }
    None
}

/// Evaluate an integer constant from the surface syntax (`3`, `-2`).
fn const_int(expr: &ast::Expr) -> Option<i64> {
    match expr {
        ast::Expr::Number(n) if n.fract() == 0.0 => Some(*n as i64),
        ast::Expr::Unary {
            op: ast::UnOp::Neg,
            operand,
        } => const_int(&operand.node).map(|n| -n),
        _ => None,
    }
}

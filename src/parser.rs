use crate::ast::*;
use crate::diagnostic::{Diagnostic, Stage};
use crate::lexeme::Lexeme;
use crate::span::{Span, Spanned};

const MAX_NESTING_DEPTH: u32 = 256;

pub struct Parser {
    tokens: Vec<Spanned<Lexeme>>,
    pos: usize,
    diagnostics: Vec<Diagnostic>,
    depth: u32,
}

impl Parser {
    pub fn new(tokens: Vec<Spanned<Lexeme>>) -> Self {
        Self {
            tokens,
            pos: 0,
            diagnostics: Vec::new(),
            depth: 0,
        }
    }

    pub fn parse_file(mut self) -> Result<SourceFile, Vec<Diagnostic>> {
        let mut decls = Vec::new();
        while !self.at(&Lexeme::Eof) {
            let start = self.current_span();
            let before = self.pos;
            match self.parse_decl() {
                Some(decl) => {
                    let span = start.merge(self.prev_span());
                    decls.push(Spanned::new(decl, span));
                }
                None => {
                    // Error recovery: make sure we always make progress.
                    if self.pos == before && !self.at(&Lexeme::Eof) {
                        self.advance();
                    }
                }
            }
        }

        if self.diagnostics.is_empty() {
            Ok(SourceFile { decls })
        } else {
            Err(self.diagnostics)
        }
    }

    fn parse_decl(&mut self) -> Option<Decl> {
        if self.at(&Lexeme::Spindle) {
            return self.parse_spindle().map(Decl::Spindle);
        }
        if self.at(&Lexeme::Ident(String::new())) {
            return self.parse_bundle_decl().map(Decl::Bundle);
        }
        self.error_with_help(
            &format!(
                "expected declaration, found {}",
                self.peek().description()
            ),
            "top-level items are bundle declarations (`name = expr`) or spindle \
             definitions (`spindle name(params) { ... }`)",
        );
        None
    }

    /// `spindle name(p1, p2) { body }`
    fn parse_spindle(&mut self) -> Option<SpindleDecl> {
        self.expect(&Lexeme::Spindle);
        let name = self.expect_ident();

        self.expect(&Lexeme::LParen);
        let mut params = Vec::new();
        if !self.at(&Lexeme::RParen) {
            loop {
                params.push(self.expect_ident());
                if !self.eat(&Lexeme::Comma) {
                    break;
                }
            }
        }
        self.expect(&Lexeme::RParen);

        let body = self.parse_body()?;
        Some(SpindleDecl { name, params, body })
    }

    /// `{ (bundle_decl | return_stmt)* }`
    fn parse_body(&mut self) -> Option<Body> {
        if !self.enter_nesting() {
            return None;
        }
        self.expect(&Lexeme::LBrace);
        let mut items = Vec::new();
        while !self.at(&Lexeme::RBrace) && !self.at(&Lexeme::Eof) {
            let start = self.current_span();
            let before = self.pos;
            let item = if self.at(&Lexeme::Return) {
                self.parse_return()
            } else if self.at(&Lexeme::Ident(String::new())) {
                self.parse_bundle_decl().map(BodyItem::Local)
            } else {
                self.error_with_help(
                    &format!(
                        "expected declaration or return, found {}",
                        self.peek().description()
                    ),
                    "body items are bundle declarations or `return.N = expr` / `return = [...]`",
                );
                None
            };
            match item {
                Some(item) => {
                    let span = start.merge(self.prev_span());
                    items.push(Spanned::new(item, span));
                }
                None => {
                    if self.pos == before && !self.at(&Lexeme::Eof) {
                        self.advance();
                    }
                }
            }
        }
        self.expect(&Lexeme::RBrace);
        self.exit_nesting();
        Some(Body { items })
    }

    /// `return = expr` or `return.N = expr`
    fn parse_return(&mut self) -> Option<BodyItem> {
        self.expect(&Lexeme::Return);
        if self.eat(&Lexeme::Dot) {
            let index = self.expect_index();
            self.expect(&Lexeme::Eq);
            let value = self.parse_expr()?;
            Some(BodyItem::ReturnIndexed { index, value })
        } else {
            self.expect(&Lexeme::Eq);
            let value = self.parse_expr()?;
            Some(BodyItem::Return { value })
        }
    }

    /// `name = expr`, `name[outputs] = expr`, or `name.strand = expr`
    fn parse_bundle_decl(&mut self) -> Option<BundleDecl> {
        let name = self.expect_ident();

        let target = if self.eat(&Lexeme::LBracket) {
            let mut outputs = Vec::new();
            if !self.at(&Lexeme::RBracket) {
                loop {
                    outputs.push(self.parse_output_name()?);
                    if !self.eat(&Lexeme::Comma) {
                        break;
                    }
                }
            }
            self.expect(&Lexeme::RBracket);
            BundleTarget::Outputs(outputs)
        } else if self.eat(&Lexeme::Dot) {
            BundleTarget::Strand(self.parse_output_name()?)
        } else {
            BundleTarget::Inferred
        };

        self.expect(&Lexeme::Eq);
        let value = self.parse_expr()?;
        Some(BundleDecl {
            name,
            target,
            value,
        })
    }

    fn parse_output_name(&mut self) -> Option<Spanned<OutputName>> {
        let span = self.current_span();
        match self.peek().clone() {
            Lexeme::Ident(name) => {
                self.advance();
                Some(Spanned::new(OutputName::Name(name), span))
            }
            Lexeme::Number(n) => {
                self.advance();
                if n.fract() != 0.0 || n < 0.0 {
                    self.error_at(span, "strand index must be a non-negative integer");
                    return None;
                }
                Some(Spanned::new(OutputName::Index(n as u32), span))
            }
            other => {
                self.error_at_current(&format!(
                    "expected strand name or index, found {}",
                    other.description()
                ));
                None
            }
        }
    }

    // ─── Expressions ──────────────────────────────────────────────

    /// Full expression: a chain of `|`-separated patterns over a base.
    fn parse_expr(&mut self) -> Option<Spanned<Expr>> {
        if !self.enter_nesting() {
            return None;
        }
        let base = self.parse_range_expr();
        let result = match base {
            Some(base) if self.at(&Lexeme::Pipe) => {
                let mut patterns = Vec::new();
                while self.eat(&Lexeme::Pipe) {
                    match self.parse_chain_pattern() {
                        Some(p) => patterns.push(p),
                        None => break,
                    }
                }
                let span = base.span.merge(self.prev_span());
                Some(Spanned::new(
                    Expr::Chain {
                        base: Box::new(base),
                        patterns,
                    },
                    span,
                ))
            }
            other => other,
        };
        self.exit_nesting();
        result
    }

    fn parse_chain_pattern(&mut self) -> Option<Spanned<ChainPattern>> {
        let start = self.current_span();
        if self.at(&Lexeme::LBrace) {
            let body = self.parse_body()?;
            let span = start.merge(self.prev_span());
            return Some(Spanned::new(ChainPattern::Body(body), span));
        }
        // An inline pattern: a tuple literal spreads into outputs, any other
        // expression is a single-output pattern.
        let expr = self.parse_range_expr()?;
        let span = expr.span;
        let outputs = match expr.node {
            Expr::Tuple(items) => items,
            other => vec![Spanned::new(other, span)],
        };
        Some(Spanned::new(ChainPattern::Inline(outputs), span))
    }

    /// `a..b` sits just above the binary operators.
    fn parse_range_expr(&mut self) -> Option<Spanned<Expr>> {
        let lhs = self.parse_binary_expr(0)?;
        if self.eat(&Lexeme::DotDot) {
            let rhs = self.parse_binary_expr(0)?;
            let span = lhs.span.merge(rhs.span);
            return Some(Spanned::new(
                Expr::Range {
                    start: Box::new(lhs),
                    end: Box::new(rhs),
                },
                span,
            ));
        }
        Some(lhs)
    }

    fn parse_binary_expr(&mut self, min_bp: u8) -> Option<Spanned<Expr>> {
        if !self.enter_nesting() {
            return None;
        }
        let mut lhs = match self.parse_unary_expr() {
            Some(e) => e,
            None => {
                self.exit_nesting();
                return None;
            }
        };

        loop {
            let op = match binop_for(self.peek()) {
                Some(op) => op,
                None => break,
            };
            let (l_bp, r_bp) = op_binding_power(op);
            if l_bp < min_bp {
                break;
            }
            self.advance();
            let rhs = match self.parse_binary_expr(r_bp) {
                Some(e) => e,
                None => break,
            };
            let span = lhs.span.merge(rhs.span);
            lhs = Spanned::new(
                Expr::Binary {
                    op,
                    lhs: Box::new(lhs),
                    rhs: Box::new(rhs),
                },
                span,
            );
        }

        self.exit_nesting();
        Some(lhs)
    }

    fn parse_unary_expr(&mut self) -> Option<Spanned<Expr>> {
        let start = self.current_span();
        let op = if self.eat(&Lexeme::Minus) {
            Some(UnOp::Neg)
        } else if self.eat(&Lexeme::Bang) {
            Some(UnOp::Not)
        } else {
            None
        };
        match op {
            Some(op) => {
                let operand = self.parse_unary_expr()?;
                let span = start.merge(operand.span);
                Some(Spanned::new(
                    Expr::Unary {
                        op,
                        operand: Box::new(operand),
                    },
                    span,
                ))
            }
            None => self.parse_postfix_expr(),
        }
    }

    fn parse_postfix_expr(&mut self) -> Option<Spanned<Expr>> {
        let mut expr = self.parse_primary()?;

        loop {
            if self.at(&Lexeme::Dot) {
                // `.` only binds as strand access when followed by a selector;
                // this keeps `0..3` intact (DotDot is its own token).
                self.advance();
                let sel = self.parse_selector()?;
                let span = expr.span.merge(self.prev_span());
                expr = Spanned::new(
                    Expr::Access {
                        base: Some(Box::new(expr)),
                        sel,
                    },
                    span,
                );
            } else if self.at(&Lexeme::LBracket) {
                self.advance();
                let subs = self.parse_remap_arms()?;
                self.expect(&Lexeme::RBracket);
                let span = expr.span.merge(self.prev_span());
                expr = Spanned::new(
                    Expr::Remap {
                        base: Box::new(expr),
                        subs,
                    },
                    span,
                );
            } else {
                break;
            }
        }

        Some(expr)
    }

    fn parse_selector(&mut self) -> Option<Selector> {
        let span = self.current_span();
        match self.peek().clone() {
            Lexeme::Ident(name) => {
                self.advance();
                Some(Selector::Name(name))
            }
            Lexeme::Number(n) => {
                self.advance();
                if n.fract() != 0.0 || n < 0.0 {
                    self.error_at(span, "strand index must be a non-negative integer");
                    return None;
                }
                Some(Selector::Index(n as u32))
            }
            Lexeme::LParen => {
                self.advance();
                let expr = self.parse_expr()?;
                self.expect(&Lexeme::RParen);
                Some(Selector::Dynamic(Box::new(expr)))
            }
            other => {
                self.error_with_help(
                    &format!("expected strand selector, found {}", other.description()),
                    "strand access is `.name`, `.0`, or `.(expr)`",
                );
                None
            }
        }
    }

    /// `key ~ value, key ~ value, ...` — keys are `bundle.field` or `me.t`.
    fn parse_remap_arms(&mut self) -> Option<Vec<RemapArm>> {
        let mut arms = Vec::new();
        loop {
            let bundle = if self.at(&Lexeme::Me) {
                let span = self.current_span();
                self.advance();
                Spanned::new("me".to_string(), span)
            } else {
                self.expect_ident()
            };
            self.expect(&Lexeme::Dot);
            let sel = self.parse_output_name()?;
            self.expect(&Lexeme::Tilde);
            let value = self.parse_range_expr()?;
            arms.push(RemapArm { bundle, sel, value });
            if !self.eat(&Lexeme::Comma) {
                break;
            }
        }
        Some(arms)
    }

    fn parse_primary(&mut self) -> Option<Spanned<Expr>> {
        let span = self.current_span();
        match self.peek().clone() {
            Lexeme::Number(n) => {
                self.advance();
                Some(Spanned::new(Expr::Number(n), span))
            }
            Lexeme::Str(s) => {
                self.advance();
                Some(Spanned::new(Expr::Str(s), span))
            }
            Lexeme::Me => {
                self.advance();
                self.expect(&Lexeme::Dot);
                let field = self.expect_ident();
                let full = span.merge(field.span);
                Some(Spanned::new(Expr::Me(field), full))
            }
            Lexeme::Dollar => {
                self.advance();
                let name = self.expect_ident();
                let arg = if self.eat(&Lexeme::LParen) {
                    let inner = self.parse_expr()?;
                    self.expect(&Lexeme::RParen);
                    Some(Box::new(inner))
                } else {
                    None
                };
                let full = span.merge(self.prev_span());
                Some(Spanned::new(Expr::Tag { name, arg }, full))
            }
            Lexeme::Ident(name) => {
                self.advance();
                if self.eat(&Lexeme::LParen) {
                    let mut args = Vec::new();
                    if !self.at(&Lexeme::RParen) {
                        loop {
                            args.push(self.parse_expr()?);
                            if !self.eat(&Lexeme::Comma) {
                                break;
                            }
                        }
                    }
                    self.expect(&Lexeme::RParen);
                    let full = span.merge(self.prev_span());
                    Some(Spanned::new(
                        Expr::Call {
                            name: Spanned::new(name, span),
                            args,
                        },
                        full,
                    ))
                } else {
                    Some(Spanned::new(Expr::Ident(name), span))
                }
            }
            Lexeme::LParen => {
                self.advance();
                let inner = self.parse_expr()?;
                self.expect(&Lexeme::RParen);
                Some(inner)
            }
            Lexeme::LBracket => {
                self.advance();
                let mut items = Vec::new();
                if !self.at(&Lexeme::RBracket) {
                    loop {
                        items.push(self.parse_expr()?);
                        if !self.eat(&Lexeme::Comma) {
                            break;
                        }
                    }
                }
                self.expect(&Lexeme::RBracket);
                let full = span.merge(self.prev_span());
                Some(Spanned::new(Expr::Tuple(items), full))
            }
            Lexeme::Dot => {
                // Bare pattern-slot access: `.0`, `.field`, `.(expr)`.
                self.advance();
                let sel = self.parse_selector()?;
                let full = span.merge(self.prev_span());
                Some(Spanned::new(Expr::Access { base: None, sel }, full))
            }
            other => {
                self.error_with_help(
                    &format!("expected expression, found {}", other.description()),
                    "expressions are numbers, strings, identifiers, `me.field`, calls, \
                     tuples `[...]`, tags `$name`, or parenthesized expressions",
                );
                None
            }
        }
    }

    // ─── Token helpers ────────────────────────────────────────────

    fn enter_nesting(&mut self) -> bool {
        self.depth += 1;
        if self.depth > MAX_NESTING_DEPTH {
            self.error_with_help(
                "nesting depth exceeded (maximum 256 levels)",
                "simplify the expression by splitting it across bundle declarations",
            );
            return false;
        }
        true
    }

    fn exit_nesting(&mut self) {
        self.depth -= 1;
    }

    fn peek(&self) -> &Lexeme {
        &self.tokens[self.pos].node
    }

    fn current_span(&self) -> Span {
        self.tokens[self.pos].span
    }

    fn prev_span(&self) -> Span {
        if self.pos > 0 {
            self.tokens[self.pos - 1].span
        } else {
            self.current_span()
        }
    }

    fn advance(&mut self) -> &Spanned<Lexeme> {
        let tok = &self.tokens[self.pos];
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        tok
    }

    fn at(&self, token: &Lexeme) -> bool {
        std::mem::discriminant(self.peek()) == std::mem::discriminant(token)
    }

    fn eat(&mut self, token: &Lexeme) -> bool {
        if self.at(token) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: &Lexeme) -> Span {
        if self.at(token) {
            let span = self.current_span();
            self.advance();
            span
        } else {
            self.error_at_current(&format!(
                "expected {}, found {}",
                token.description(),
                self.peek().description()
            ));
            self.current_span()
        }
    }

    fn expect_ident(&mut self) -> Spanned<String> {
        if let Lexeme::Ident(name) = self.peek().clone() {
            let span = self.current_span();
            self.advance();
            Spanned::new(name, span)
        } else {
            self.error_at_current(&format!(
                "expected identifier, found {}",
                self.peek().description()
            ));
            Spanned::new("_error_".to_string(), self.current_span())
        }
    }

    fn expect_index(&mut self) -> u32 {
        if let Lexeme::Number(n) = *self.peek() {
            self.advance();
            if n.fract() == 0.0 && n >= 0.0 {
                return n as u32;
            }
            self.error_at(self.prev_span(), "return index must be a non-negative integer");
            0
        } else {
            self.error_at_current(&format!(
                "expected return index, found {}",
                self.peek().description()
            ));
            0
        }
    }

    fn error_at_current(&mut self, msg: &str) {
        self.diagnostics.push(Diagnostic::error(
            Stage::Parser,
            msg.to_string(),
            self.current_span(),
        ));
    }

    fn error_at(&mut self, span: Span, msg: &str) {
        self.diagnostics
            .push(Diagnostic::error(Stage::Parser, msg.to_string(), span));
    }

    fn error_with_help(&mut self, msg: &str, help: &str) {
        self.diagnostics.push(
            Diagnostic::error(Stage::Parser, msg.to_string(), self.current_span())
                .with_help(help.to_string()),
        );
    }
}

fn binop_for(token: &Lexeme) -> Option<BinOp> {
    match token {
        Lexeme::Plus => Some(BinOp::Add),
        Lexeme::Minus => Some(BinOp::Sub),
        Lexeme::Star => Some(BinOp::Mul),
        Lexeme::Slash => Some(BinOp::Div),
        Lexeme::Percent => Some(BinOp::Rem),
        Lexeme::Caret => Some(BinOp::Pow),
        Lexeme::Lt => Some(BinOp::Lt),
        Lexeme::Gt => Some(BinOp::Gt),
        Lexeme::Le => Some(BinOp::Le),
        Lexeme::Ge => Some(BinOp::Ge),
        Lexeme::EqEq => Some(BinOp::Eq),
        Lexeme::Ne => Some(BinOp::Ne),
        Lexeme::AndAnd => Some(BinOp::And),
        Lexeme::OrOr => Some(BinOp::Or),
        _ => None,
    }
}

/// Returns (left, right) binding power. Higher = tighter. `^` is
/// right-associative, everything else left-associative.
fn op_binding_power(op: BinOp) -> (u8, u8) {
    match op {
        BinOp::Or => (1, 2),
        BinOp::And => (3, 4),
        BinOp::Eq | BinOp::Ne => (5, 6),
        BinOp::Lt | BinOp::Gt | BinOp::Le | BinOp::Ge => (7, 8),
        BinOp::Add | BinOp::Sub => (9, 10),
        BinOp::Mul | BinOp::Div | BinOp::Rem => (11, 12),
        BinOp::Pow => (14, 13),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::Lexer;

    fn parse(source: &str) -> SourceFile {
        let (tokens, lex_diags) = Lexer::new(source).tokenize();
        assert!(lex_diags.is_empty(), "lex errors: {:?}", lex_diags);
        Parser::new(tokens).parse_file().unwrap_or_else(|errs| {
            panic!(
                "parse errors: {:?}",
                errs.iter().map(|e| &e.message).collect::<Vec<_>>()
            )
        })
    }

    fn parse_err(source: &str) -> Vec<Diagnostic> {
        let (tokens, _lex_diags) = Lexer::new(source).tokenize();
        Parser::new(tokens)
            .parse_file()
            .err()
            .expect("expected parse errors")
    }

    fn first_bundle(file: &SourceFile) -> &BundleDecl {
        match &file.decls[0].node {
            Decl::Bundle(b) => b,
            other => panic!("expected bundle, got {:?}", other),
        }
    }

    #[test]
    fn test_bundle_with_named_outputs() {
        let file = parse("display[r, g, b] = [me.x, me.y, 0]");
        let b = first_bundle(&file);
        assert_eq!(b.name.node, "display");
        match &b.target {
            BundleTarget::Outputs(outs) => {
                assert_eq!(outs.len(), 3);
                assert_eq!(outs[0].node, OutputName::Name("r".into()));
            }
            other => panic!("expected outputs, got {:?}", other),
        }
        assert!(matches!(b.value.node, Expr::Tuple(_)));
    }

    #[test]
    fn test_bundle_with_indexed_outputs() {
        let file = parse("play[0] = 0.5");
        let b = first_bundle(&file);
        match &b.target {
            BundleTarget::Outputs(outs) => {
                assert_eq!(outs[0].node, OutputName::Index(0));
            }
            other => panic!("expected outputs, got {:?}", other),
        }
    }

    #[test]
    fn test_bundle_inferred_width() {
        let file = parse("level = 0.5");
        let b = first_bundle(&file);
        assert!(matches!(b.target, BundleTarget::Inferred));
    }

    #[test]
    fn test_single_strand_declaration() {
        let file = parse("trail.v = me.x");
        let b = first_bundle(&file);
        match &b.target {
            BundleTarget::Strand(s) => assert_eq!(s.node, OutputName::Name("v".into())),
            other => panic!("expected strand target, got {:?}", other),
        }
    }

    #[test]
    fn test_spindle_definition() {
        let file = parse("spindle f(a, b) { return = [a + b] }");
        let sp = match &file.decls[0].node {
            Decl::Spindle(s) => s,
            other => panic!("expected spindle, got {:?}", other),
        };
        assert_eq!(sp.name.node, "f");
        assert_eq!(sp.params.len(), 2);
        assert_eq!(sp.body.items.len(), 1);
        assert!(matches!(sp.body.items[0].node, BodyItem::Return { .. }));
    }

    #[test]
    fn test_spindle_indexed_returns() {
        let file = parse("spindle g(x) { return.0 = x\nreturn.1 = x * 2 }");
        let sp = match &file.decls[0].node {
            Decl::Spindle(s) => s,
            _ => panic!(),
        };
        assert!(matches!(
            sp.body.items[0].node,
            BodyItem::ReturnIndexed { index: 0, .. }
        ));
        assert!(matches!(
            sp.body.items[1].node,
            BodyItem::ReturnIndexed { index: 1, .. }
        ));
    }

    #[test]
    fn test_spindle_with_local() {
        let file = parse("spindle h(x) { tmp = x * 2\nreturn = [tmp.0 + 1] }");
        let sp = match &file.decls[0].node {
            Decl::Spindle(s) => s,
            _ => panic!(),
        };
        assert!(matches!(sp.body.items[0].node, BodyItem::Local(_)));
    }

    #[test]
    fn test_operator_precedence() {
        let file = parse("x = 1 + 2 * 3");
        let b = first_bundle(&file);
        match &b.value.node {
            Expr::Binary { op: BinOp::Add, rhs, .. } => {
                assert!(matches!(rhs.node, Expr::Binary { op: BinOp::Mul, .. }));
            }
            other => panic!("expected 1 + (2 * 3), got {:?}", other),
        }
    }

    #[test]
    fn test_power_right_associative() {
        let file = parse("x = 2 ^ 3 ^ 4");
        let b = first_bundle(&file);
        match &b.value.node {
            Expr::Binary { op: BinOp::Pow, rhs, .. } => {
                assert!(matches!(rhs.node, Expr::Binary { op: BinOp::Pow, .. }));
            }
            other => panic!("expected 2 ^ (3 ^ 4), got {:?}", other),
        }
    }

    #[test]
    fn test_comparison_below_arithmetic() {
        let file = parse("x = a.0 + 1 < b.0 * 2");
        let b = first_bundle(&file);
        assert!(matches!(
            b.value.node,
            Expr::Binary { op: BinOp::Lt, .. }
        ));
    }

    #[test]
    fn test_me_access() {
        let file = parse("x = me.t");
        let b = first_bundle(&file);
        match &b.value.node {
            Expr::Me(field) => assert_eq!(field.node, "t"),
            other => panic!("expected me access, got {:?}", other),
        }
    }

    #[test]
    fn test_strand_access_forms() {
        let file = parse("x = pos.y + pos.0 + pos.(me.t % 3)");
        let b = first_bundle(&file);
        // Just verify it parses into a binary tree of accesses.
        assert!(matches!(b.value.node, Expr::Binary { .. }));
    }

    #[test]
    fn test_bare_slot_access() {
        let file = parse("x = me.x | .0 * 2");
        let b = first_bundle(&file);
        match &b.value.node {
            Expr::Chain { patterns, .. } => {
                assert_eq!(patterns.len(), 1);
                match &patterns[0].node {
                    ChainPattern::Inline(outs) => {
                        assert_eq!(outs.len(), 1);
                        assert!(matches!(
                            outs[0].node,
                            Expr::Binary { op: BinOp::Mul, .. }
                        ));
                    }
                    other => panic!("expected inline pattern, got {:?}", other),
                }
            }
            other => panic!("expected chain, got {:?}", other),
        }
    }

    #[test]
    fn test_chain_with_tuple_pattern() {
        let file = parse("x = me.x | [.0, .0 + 1] | [.1, .0]");
        let b = first_bundle(&file);
        match &b.value.node {
            Expr::Chain { patterns, .. } => {
                assert_eq!(patterns.len(), 2);
                match &patterns[0].node {
                    ChainPattern::Inline(outs) => assert_eq!(outs.len(), 2),
                    other => panic!("expected inline, got {:?}", other),
                }
            }
            other => panic!("expected chain, got {:?}", other),
        }
    }

    #[test]
    fn test_chain_with_body_pattern() {
        let file = parse("x = me.x | { half = .0 / 2\nreturn = [half.0] }");
        let b = first_bundle(&file);
        match &b.value.node {
            Expr::Chain { patterns, .. } => {
                assert!(matches!(patterns[0].node, ChainPattern::Body(_)));
            }
            other => panic!("expected chain, got {:?}", other),
        }
    }

    #[test]
    fn test_range_in_pattern() {
        let file = parse("x = me.x | [.0 * (0..3)]");
        let b = first_bundle(&file);
        match &b.value.node {
            Expr::Chain { patterns, .. } => match &patterns[0].node {
                ChainPattern::Inline(outs) => {
                    assert!(matches!(outs[0].node, Expr::Binary { .. }));
                }
                other => panic!("expected inline, got {:?}", other),
            },
            other => panic!("expected chain, got {:?}", other),
        }
    }

    #[test]
    fn test_remap() {
        let file = parse("x = blur.0[pos.x ~ me.x + 0.01, me.t ~ me.t - 1]");
        let b = first_bundle(&file);
        match &b.value.node {
            Expr::Remap { subs, .. } => {
                assert_eq!(subs.len(), 2);
                assert_eq!(subs[0].bundle.node, "pos");
                assert_eq!(subs[1].bundle.node, "me");
                assert_eq!(subs[1].sel.node, OutputName::Name("t".into()));
            }
            other => panic!("expected remap, got {:?}", other),
        }
    }

    #[test]
    fn test_tag_forms() {
        let file = parse("a[x, y] = [me.x * $speed(2), me.y * $speed]");
        let b = first_bundle(&file);
        match &b.value.node {
            Expr::Tuple(items) => {
                let find_tag = |e: &Expr| -> bool {
                    match e {
                        Expr::Binary { rhs, .. } => matches!(rhs.node, Expr::Tag { .. }),
                        _ => false,
                    }
                };
                assert!(find_tag(&items[0].node));
                assert!(find_tag(&items[1].node));
            }
            other => panic!("expected tuple, got {:?}", other),
        }
    }

    #[test]
    fn test_call_with_string_arg() {
        let file = parse("img = texture(\"photo.png\", me.x, me.y)");
        let b = first_bundle(&file);
        match &b.value.node {
            Expr::Call { name, args } => {
                assert_eq!(name.node, "texture");
                assert_eq!(args.len(), 3);
                assert!(matches!(args[0].node, Expr::Str(_)));
            }
            other => panic!("expected call, got {:?}", other),
        }
    }

    #[test]
    fn test_empty_source() {
        let file = parse("");
        assert!(file.decls.is_empty());
    }

    // --- Error path tests ---

    #[test]
    fn test_error_missing_eq() {
        let diags = parse_err("display[r] me.x");
        assert!(!diags.is_empty());
        assert!(diags[0].message.contains("expected"));
        assert!(diags[0].message.contains("found"));
    }

    #[test]
    fn test_error_bare_number_at_top_level() {
        let diags = parse_err("42");
        assert!(!diags.is_empty());
        assert!(diags[0].message.contains("expected declaration"));
        assert!(diags[0].help.is_some());
    }

    #[test]
    fn test_error_fractional_strand_index() {
        let diags = parse_err("oops[0.5] = 1");
        assert!(diags
            .iter()
            .any(|d| d.message.contains("non-negative integer")));
    }

    #[test]
    fn test_error_unclosed_body() {
        let diags = parse_err("spindle f(a) { return = [a]");
        assert!(!diags.is_empty());
    }
}

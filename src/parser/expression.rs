//! Expression parser for the Python subset.
//! Implements precedence climbing, one function per precedence level.

use super::{BinaryOp, Expr, ExprKind, Keyword, Parser, Span, SubscriptItem, UnaryOp};
use crate::diagnostics::{codes, Diagnostic};
use crate::lexer::TokenKind;

/// Trait extension for expression parsing
pub trait ExpressionParser {
    fn expression(&mut self) -> Option<Expr>;

    /// Comma separated expressions; more than one becomes a tuple.
    fn expression_list(&mut self) -> Option<Expr>;
}

impl<'a> ExpressionParser for Parser<'a> {
    fn expression(&mut self) -> Option<Expr> {
        self.parse_conditional()
    }

    fn expression_list(&mut self) -> Option<Expr> {
        let first = self.expression()?;
        if !self.check(TokenKind::Comma) {
            return Some(first);
        }

        let mut items = vec![first];
        while self.match_token(TokenKind::Comma) {
            if self.ends_expression_list() {
                break;
            }
            items.push(self.expression()?);
        }
        let span = items[0].span.merge(&Span::new(self.previous().offset, self.previous().length));
        Some(Expr::new(ExprKind::Tuple(items), span))
    }
}

impl<'a> Parser<'a> {
    fn ends_expression_list(&self) -> bool {
        matches!(
            self.peek().kind,
            TokenKind::Newline | TokenKind::Equal | TokenKind::Semicolon | TokenKind::Eof
                | TokenKind::RightParen | TokenKind::Colon
        ) || self.peek().kind.is_augmented_assignment()
    }

    /// Parse `body if test else orelse` (lowest precedence)
    fn parse_conditional(&mut self) -> Option<Expr> {
        if self.check(TokenKind::Lambda) {
            return self.lambda_expression();
        }

        let body = self.parse_or()?;

        if self.match_token(TokenKind::If) {
            let test = self.parse_or()?;
            self.expect(TokenKind::Else, "expected 'else' in conditional expression")?;
            let orelse = self.parse_conditional()?;
            let span = body.span.merge(&orelse.span);
            return Some(Expr::new(
                ExprKind::IfExp {
                    test: Box::new(test),
                    body: Box::new(body),
                    orelse: Box::new(orelse),
                },
                span,
            ));
        }

        Some(body)
    }

    fn lambda_expression(&mut self) -> Option<Expr> {
        let start = self.advance().offset; // consume 'lambda'
        while !self.check(TokenKind::Colon) && !self.check(TokenKind::Newline) && !self.is_at_end() {
            self.advance();
        }
        self.expect(TokenKind::Colon, "expected ':' in lambda expression")?;
        let body = self.parse_conditional()?;
        let span = Span::new(start, body.span.offset + body.span.length - start);
        Some(Expr::new(ExprKind::Unsupported("lambda expression".to_string()), span))
    }

    fn binary(left: Expr, op: BinaryOp, right: Expr) -> Expr {
        let span = left.span.merge(&right.span);
        Expr::new(
            ExprKind::Binary {
                left: Box::new(left),
                op,
                right: Box::new(right),
            },
            span,
        )
    }

    /// Parse logical OR: a or b
    fn parse_or(&mut self) -> Option<Expr> {
        let mut expr = self.parse_and()?;

        while self.match_token(TokenKind::Or) {
            let right = self.parse_and()?;
            expr = Self::binary(expr, BinaryOp::Or, right);
        }

        Some(expr)
    }

    /// Parse logical AND: a and b
    fn parse_and(&mut self) -> Option<Expr> {
        let mut expr = self.parse_not()?;

        while self.match_token(TokenKind::And) {
            let right = self.parse_not()?;
            expr = Self::binary(expr, BinaryOp::And, right);
        }

        Some(expr)
    }

    fn parse_not(&mut self) -> Option<Expr> {
        if self.check(TokenKind::Not) {
            let start = self.advance().offset;
            let operand = self.parse_not()?;
            let span = Span::new(start, operand.span.offset + operand.span.length - start);
            return Some(Expr::new(
                ExprKind::Unary {
                    op: UnaryOp::Not,
                    operand: Box::new(operand),
                },
                span,
            ));
        }
        self.parse_comparison()
    }

    /// Comparison chains `a < b < c` become `(a < b) and (b < c)`
    fn parse_comparison(&mut self) -> Option<Expr> {
        let first = self.parse_bitor()?;
        let Some(op) = self.match_comparison_op() else {
            return Some(first);
        };

        let right = self.parse_bitor()?;
        let mut left = right.clone();
        let mut expr = Self::binary(first, op, right);
        while let Some(op) = self.match_comparison_op() {
            let right = self.parse_bitor()?;
            let link = Self::binary(left, op, right.clone());
            expr = Self::binary(expr, BinaryOp::And, link);
            left = right;
        }
        Some(expr)
    }

    fn match_comparison_op(&mut self) -> Option<BinaryOp> {
        let op = match self.peek().kind {
            TokenKind::EqualEqual => BinaryOp::Eq,
            TokenKind::BangEqual => BinaryOp::NotEq,
            TokenKind::Less => BinaryOp::Lt,
            TokenKind::LessEqual => BinaryOp::LtE,
            TokenKind::Greater => BinaryOp::Gt,
            TokenKind::GreaterEqual => BinaryOp::GtE,
            TokenKind::Is => {
                self.advance();
                if self.match_token(TokenKind::Not) {
                    return Some(BinaryOp::IsNot);
                }
                return Some(BinaryOp::Is);
            }
            _ => return None,
        };
        self.advance();
        Some(op)
    }

    /// Parse bitwise OR: a | b
    pub(crate) fn parse_bitor(&mut self) -> Option<Expr> {
        let mut expr = self.parse_bitxor()?;

        while self.match_token(TokenKind::Pipe) {
            let right = self.parse_bitxor()?;
            expr = Self::binary(expr, BinaryOp::BitOr, right);
        }

        Some(expr)
    }

    /// Parse bitwise XOR: a ^ b
    fn parse_bitxor(&mut self) -> Option<Expr> {
        let mut expr = self.parse_bitand()?;

        while self.match_token(TokenKind::Caret) {
            let right = self.parse_bitand()?;
            expr = Self::binary(expr, BinaryOp::BitXor, right);
        }

        Some(expr)
    }

    /// Parse bitwise AND: a & b
    fn parse_bitand(&mut self) -> Option<Expr> {
        let mut expr = self.parse_shift()?;

        while self.match_token(TokenKind::Ampersand) {
            let right = self.parse_shift()?;
            expr = Self::binary(expr, BinaryOp::BitAnd, right);
        }

        Some(expr)
    }

    /// Parse shift: a << b, a >> b
    fn parse_shift(&mut self) -> Option<Expr> {
        let mut expr = self.parse_additive()?;

        loop {
            let op = match self.peek().kind {
                TokenKind::LessLess => BinaryOp::Shl,
                TokenKind::GreaterGreater => BinaryOp::Shr,
                _ => break,
            };
            self.advance();
            let right = self.parse_additive()?;
            expr = Self::binary(expr, op, right);
        }

        Some(expr)
    }

    /// Parse additive: a + b, a - b
    fn parse_additive(&mut self) -> Option<Expr> {
        let mut expr = self.parse_multiplicative()?;

        loop {
            let op = match self.peek().kind {
                TokenKind::Plus => BinaryOp::Add,
                TokenKind::Minus => BinaryOp::Sub,
                _ => break,
            };
            self.advance();
            let right = self.parse_multiplicative()?;
            expr = Self::binary(expr, op, right);
        }

        Some(expr)
    }

    /// Parse multiplicative: a * b, a / b, a // b, a % b, a @ b
    fn parse_multiplicative(&mut self) -> Option<Expr> {
        let mut expr = self.parse_unary()?;

        loop {
            let op = match self.peek().kind {
                TokenKind::Star => BinaryOp::Mul,
                TokenKind::Slash => BinaryOp::Div,
                TokenKind::SlashSlash => BinaryOp::FloorDiv,
                TokenKind::Percent => BinaryOp::Mod,
                TokenKind::At => BinaryOp::MatMul,
                _ => break,
            };
            self.advance();
            let right = self.parse_unary()?;
            expr = Self::binary(expr, op, right);
        }

        Some(expr)
    }

    /// Parse unary: -x, +x, ~x
    fn parse_unary(&mut self) -> Option<Expr> {
        let op = match self.peek().kind {
            TokenKind::Minus => UnaryOp::Neg,
            TokenKind::Plus => UnaryOp::Pos,
            TokenKind::Tilde => UnaryOp::Invert,
            _ => return self.parse_power(),
        };
        let start = self.advance().offset;
        let operand = self.parse_unary()?;
        let span = Span::new(start, operand.span.offset + operand.span.length - start);

        // Fold negative numeric literals so `-1` stays a literal index
        let kind = match (op, &operand.kind) {
            (UnaryOp::Neg, ExprKind::Int(value)) => ExprKind::Int(value.wrapping_neg()),
            (UnaryOp::Neg, ExprKind::Float(value)) => ExprKind::Float(-value),
            _ => ExprKind::Unary {
                op,
                operand: Box::new(operand),
            },
        };
        Some(Expr::new(kind, span))
    }

    /// Parse power: a ** b (right associative, binds tighter than unary on the left)
    fn parse_power(&mut self) -> Option<Expr> {
        let base = self.parse_postfix()?;

        if self.match_token(TokenKind::StarStar) {
            let exponent = self.parse_unary()?;
            return Some(Self::binary(base, BinaryOp::Pow, exponent));
        }

        Some(base)
    }

    /// Parse postfix: calls, subscripts, attribute access
    fn parse_postfix(&mut self) -> Option<Expr> {
        let mut expr = self.parse_primary()?;

        loop {
            match self.peek().kind {
                TokenKind::LeftParen => {
                    self.advance();
                    expr = self.finish_call(expr)?;
                }
                TokenKind::LeftBracket => {
                    self.advance();
                    expr = self.finish_subscript(expr)?;
                }
                TokenKind::Dot => {
                    self.advance();
                    let (attr, attr_span) = self.expect_identifier_with_span("expected attribute name after '.'")?;
                    let span = expr.span.merge(&attr_span);
                    expr = Expr::new(
                        ExprKind::Attribute {
                            value: Box::new(expr),
                            attr,
                        },
                        span,
                    );
                }
                _ => break,
            }
        }

        Some(expr)
    }

    fn finish_call(&mut self, func: Expr) -> Option<Expr> {
        let mut args = Vec::new();
        let mut keywords = Vec::new();

        while !self.check(TokenKind::RightParen) && !self.is_at_end() {
            if self.check(TokenKind::Star) || self.check(TokenKind::StarStar) {
                let token = self.advance().clone();
                self.expression()?;
                args.push(Expr::new(
                    ExprKind::Unsupported("argument unpacking".to_string()),
                    Span::new(token.offset, self.previous_end() - token.offset),
                ));
            } else if self.check(TokenKind::Identifier) && self.peek_next().kind == TokenKind::Equal {
                let (name, name_span) = self.expect_identifier_with_span("expected keyword name")?;
                self.advance(); // consume '='
                let value = self.expression()?;
                let span = name_span.merge(&value.span);
                keywords.push(Keyword { name, value, span });
            } else {
                let arg = self.expression()?;
                if self.check(TokenKind::For) {
                    let unsupported = self.skip_comprehension(arg.span.offset, TokenKind::RightParen, "generator expression");
                    args.push(unsupported);
                    break;
                }
                if !keywords.is_empty() {
                    self.report_at(
                        Diagnostic::error(codes::UNEXPECTED_TOKEN, "positional argument follows keyword argument"),
                        arg.span,
                    );
                }
                args.push(arg);
            }

            if !self.match_token(TokenKind::Comma) {
                break;
            }
        }

        self.expect(TokenKind::RightParen, "expected ')' after arguments")?;
        let span = func.span.merge(&Span::new(self.previous().offset, 1));
        Some(Expr::new(
            ExprKind::Call {
                func: Box::new(func),
                args,
                keywords,
            },
            span,
        ))
    }

    fn finish_subscript(&mut self, value: Expr) -> Option<Expr> {
        let mut indices = Vec::new();

        loop {
            indices.push(self.subscript_item()?);
            if !self.match_token(TokenKind::Comma) || self.check(TokenKind::RightBracket) {
                break;
            }
        }

        self.expect(TokenKind::RightBracket, "expected ']' after index")?;
        let span = value.span.merge(&Span::new(self.previous().offset, 1));
        Some(Expr::new(
            ExprKind::Subscript {
                value: Box::new(value),
                indices,
            },
            span,
        ))
    }

    fn subscript_item(&mut self) -> Option<SubscriptItem> {
        let lower = if self.check(TokenKind::Colon) {
            None
        } else {
            let expr = self.expression()?;
            if !self.check(TokenKind::Colon) {
                return Some(SubscriptItem::Index(expr));
            }
            Some(expr)
        };

        self.expect(TokenKind::Colon, "expected ':' in slice")?;
        let upper = if self.slice_part_ends() { None } else { Some(self.expression()?) };
        let step = if self.match_token(TokenKind::Colon) && !self.slice_part_ends() {
            Some(self.expression()?)
        } else {
            None
        };

        Some(SubscriptItem::Slice { lower, upper, step })
    }

    fn slice_part_ends(&self) -> bool {
        matches!(self.peek().kind, TokenKind::Colon | TokenKind::Comma | TokenKind::RightBracket)
    }

    /// Parse primary expressions: literals, names, parenthesized expressions
    fn parse_primary(&mut self) -> Option<Expr> {
        let token = self.peek().clone();
        let span = Span::new(token.offset, token.length);

        let kind = match token.kind {
            TokenKind::IntLiteral => {
                self.advance();
                ExprKind::Int(self.int_value(&token.lexeme, span))
            }
            TokenKind::FloatLiteral => {
                self.advance();
                ExprKind::Float(self.float_value(&token.lexeme, span))
            }
            TokenKind::ImaginaryLiteral => {
                self.advance();
                let digits = &token.lexeme[..token.lexeme.len() - 1];
                ExprKind::Imaginary(self.float_value(digits, span))
            }
            TokenKind::StringLiteral => return self.string_literal(),
            TokenKind::True => {
                self.advance();
                ExprKind::Bool(true)
            }
            TokenKind::False => {
                self.advance();
                ExprKind::Bool(false)
            }
            TokenKind::None => {
                self.advance();
                ExprKind::None
            }
            TokenKind::Ellipsis => {
                self.advance();
                ExprKind::Ellipsis
            }
            TokenKind::Identifier => {
                self.advance();
                ExprKind::Name(token.lexeme.clone())
            }
            TokenKind::LeftParen => return self.parenthesized(),
            TokenKind::LeftBracket => return self.list_display(),
            TokenKind::LeftBrace => {
                self.advance();
                return Some(self.skip_comprehension(token.offset, TokenKind::RightBrace, "dict or set display"));
            }
            TokenKind::Await | TokenKind::Yield => {
                self.advance();
                let operand = self.parse_unary()?;
                let span = span.merge(&operand.span);
                return Some(Expr::new(ExprKind::Unsupported(format!("{} expression", token.lexeme)), span));
            }
            _ => {
                self.error_at_current(codes::EXPECTED_EXPRESSION, "expected expression");
                return None;
            }
        };

        Some(Expr::new(kind, span))
    }

    fn parenthesized(&mut self) -> Option<Expr> {
        let start = self.advance().offset; // consume '('

        if self.match_token(TokenKind::RightParen) {
            return Some(Expr::new(ExprKind::Tuple(Vec::new()), Span::new(start, 2)));
        }

        let first = self.expression()?;
        if self.check(TokenKind::For) {
            return Some(self.skip_comprehension(start, TokenKind::RightParen, "generator expression"));
        }

        if !self.check(TokenKind::Comma) {
            self.expect(TokenKind::RightParen, "expected ')' after expression")?;
            let mut inner = first;
            inner.span = Span::new(start, self.previous_end() - start);
            return Some(inner);
        }

        let mut items = vec![first];
        while self.match_token(TokenKind::Comma) {
            if self.check(TokenKind::RightParen) {
                break;
            }
            items.push(self.expression()?);
        }
        self.expect(TokenKind::RightParen, "expected ')' after tuple")?;
        Some(Expr::new(ExprKind::Tuple(items), Span::new(start, self.previous_end() - start)))
    }

    fn list_display(&mut self) -> Option<Expr> {
        let start = self.advance().offset; // consume '['
        let mut items = Vec::new();

        while !self.check(TokenKind::RightBracket) && !self.is_at_end() {
            let item = self.expression()?;
            if self.check(TokenKind::For) {
                return Some(self.skip_comprehension(start, TokenKind::RightBracket, "list comprehension"));
            }
            items.push(item);
            if !self.match_token(TokenKind::Comma) {
                break;
            }
        }

        self.expect(TokenKind::RightBracket, "expected ']' after list elements")?;
        Some(Expr::new(ExprKind::List(items), Span::new(start, self.previous_end() - start)))
    }

    /// Consume up to and including the closing bracket of a construct that is
    /// only recognised, not translated.
    fn skip_comprehension(&mut self, start: usize, closing: TokenKind, construct: &str) -> Expr {
        let mut depth = 0usize;
        while !self.is_at_end() {
            let kind = self.peek().kind;
            match kind {
                TokenKind::LeftParen | TokenKind::LeftBracket | TokenKind::LeftBrace => depth += 1,
                k if k == closing && depth == 0 => {
                    self.advance();
                    break;
                }
                TokenKind::RightParen | TokenKind::RightBracket | TokenKind::RightBrace => {
                    depth = depth.saturating_sub(1)
                }
                _ => {}
            }
            self.advance();
        }
        Expr::new(
            ExprKind::Unsupported(construct.to_string()),
            Span::new(start, self.previous_end().saturating_sub(start)),
        )
    }

    /// Adjacent string literals are concatenated
    fn string_literal(&mut self) -> Option<Expr> {
        let start = self.peek().offset;
        let mut value = String::new();
        while self.check(TokenKind::StringLiteral) {
            let lexeme = self.advance().lexeme.clone();
            value.push_str(&unescape(strip_quotes(&lexeme)));
        }
        Some(Expr::new(ExprKind::Str(value), Span::new(start, self.previous_end() - start)))
    }

    fn int_value(&mut self, lexeme: &str, span: Span) -> i64 {
        let digits: String = lexeme.chars().filter(|c| *c != '_').collect();
        let lower = digits.to_ascii_lowercase();
        let parsed = if let Some(hex) = lower.strip_prefix("0x") {
            i64::from_str_radix(hex, 16)
        } else if let Some(oct) = lower.strip_prefix("0o") {
            i64::from_str_radix(oct, 8)
        } else if let Some(bin) = lower.strip_prefix("0b") {
            i64::from_str_radix(bin, 2)
        } else {
            digits.parse::<i64>()
        };
        parsed.unwrap_or_else(|_| {
            self.report_at(
                Diagnostic::error(codes::INVALID_NUMBER, "integer literal does not fit in 64 bits").with_symbol(lexeme),
                span,
            );
            0
        })
    }

    fn float_value(&mut self, lexeme: &str, span: Span) -> f64 {
        let digits: String = lexeme.chars().filter(|c| *c != '_').collect();
        digits.parse::<f64>().unwrap_or_else(|_| {
            self.report_at(
                Diagnostic::error(codes::INVALID_NUMBER, "invalid float literal").with_symbol(lexeme),
                span,
            );
            0.0
        })
    }
}

fn strip_quotes(lexeme: &str) -> &str {
    for quotes in ["\"\"\"", "'''", "\"", "'"] {
        if lexeme.len() >= 2 * quotes.len() && lexeme.starts_with(quotes) && lexeme.ends_with(quotes) {
            return &lexeme[quotes.len()..lexeme.len() - quotes.len()];
        }
    }
    lexeme
}

fn unescape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('0') => out.push('\0'),
            Some('\\') => out.push('\\'),
            Some('\'') => out.push('\''),
            Some('"') => out.push('"'),
            Some('\n') => {}
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::DiagnosticReporter;
    use crate::parser::{parse_source, StmtKind};

    fn expr(source: &str) -> Expr {
        let mut reporter = DiagnosticReporter::new("test.py", source);
        let module = parse_source(source, &mut reporter);
        assert!(!reporter.has_errors(), "{:?}", reporter.diagnostics());
        match module.body.into_iter().next().map(|s| s.kind) {
            Some(StmtKind::Expr(e)) => e,
            other => panic!("expected expression statement, got {:?}", other),
        }
    }

    #[test]
    fn multiplication_binds_tighter_than_addition() {
        let e = expr("1 + 2 * 3");
        match e.kind {
            ExprKind::Binary { op: BinaryOp::Add, right, .. } => {
                assert!(matches!(right.kind, ExprKind::Binary { op: BinaryOp::Mul, .. }))
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn power_is_right_associative_and_beats_negation() {
        let e = expr("-2 ** 2");
        assert!(matches!(e.kind, ExprKind::Unary { op: UnaryOp::Neg, .. }));
        let e = expr("2 ** 3 ** 2");
        match e.kind {
            ExprKind::Binary { op: BinaryOp::Pow, right, .. } => {
                assert!(matches!(right.kind, ExprKind::Binary { op: BinaryOp::Pow, .. }))
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn comparison_chain_is_lowered_to_and() {
        let e = expr("0 <= i < n");
        match e.kind {
            ExprKind::Binary { op: BinaryOp::And, left, right } => {
                assert!(matches!(left.kind, ExprKind::Binary { op: BinaryOp::LtE, .. }));
                assert!(matches!(right.kind, ExprKind::Binary { op: BinaryOp::Lt, .. }));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn calls_with_keywords_and_slices() {
        let e = expr("np.zeros((n, 3), dtype=float)[1:, ::2]");
        let ExprKind::Subscript { value, indices } = e.kind else {
            panic!("expected subscript");
        };
        assert_eq!(indices.len(), 2);
        assert!(matches!(indices[1], SubscriptItem::Slice { lower: None, upper: None, step: Some(_) }));
        let ExprKind::Call { func, args, keywords } = value.kind else {
            panic!("expected call");
        };
        assert_eq!(func.dotted_name().as_deref(), Some("np.zeros"));
        assert!(matches!(args[0].kind, ExprKind::Tuple(ref items) if items.len() == 2));
        assert_eq!(keywords[0].name, "dtype");
    }

    #[test]
    fn negative_literals_are_folded() {
        assert!(matches!(expr("-3").kind, ExprKind::Int(-3)));
    }

    #[test]
    fn strings_concatenate_and_unescape() {
        assert!(matches!(expr("'a\\n' \"b\"").kind, ExprKind::Str(ref s) if s == "a\nb"));
    }

    #[test]
    fn comprehensions_are_marked_unsupported() {
        assert!(matches!(expr("[i for i in range(3)]").kind, ExprKind::Unsupported(_)));
        assert!(matches!(expr("{1: 2}").kind, ExprKind::Unsupported(_)));
    }

    #[test]
    fn conditional_expression() {
        assert!(matches!(expr("a if c else b").kind, ExprKind::IfExp { .. }));
    }
}

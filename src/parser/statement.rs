//! Statement parser for the Python subset.

use super::expression::ExpressionParser;
use super::{BinaryOp, Decorator, Expr, ExprKind, Parser, Pragma, PragmaFamily, Span, Stmt, StmtKind};
use crate::diagnostics::{codes, Diagnostic};
use crate::lexer::TokenKind;

/// Trait extension for statement parsing
pub trait StatementParser {
    /// Parse one logical line or compound statement. Simple statements
    /// separated by ';' yield several nodes.
    fn statement(&mut self) -> Option<Vec<Stmt>>;
}

impl<'a> StatementParser for Parser<'a> {
    fn statement(&mut self) -> Option<Vec<Stmt>> {
        self.parse_statement()
    }
}

impl<'a> Parser<'a> {
    pub(crate) fn parse_statement(&mut self) -> Option<Vec<Stmt>> {
        let kind = self.peek().kind;
        if kind.is_unsupported_keyword() {
            return Some(vec![self.unsupported_statement()]);
        }

        match kind {
            TokenKind::Def => Some(vec![self.function_definition(Vec::new())?]),
            TokenKind::At => Some(vec![self.decorated_definition()?]),
            TokenKind::If => Some(vec![self.if_statement()?]),
            TokenKind::For => Some(vec![self.for_statement(None)?]),
            TokenKind::While => Some(vec![self.while_statement()?]),
            TokenKind::Pragma => self.pragma_statement(),
            _ => self.simple_statements(),
        }
    }

    /// Simple statements up to the end of the line
    pub(crate) fn simple_statements(&mut self) -> Option<Vec<Stmt>> {
        let mut statements = Vec::new();
        loop {
            statements.push(self.simple_statement()?);
            if !self.match_token(TokenKind::Semicolon) || self.check(TokenKind::Newline) {
                break;
            }
        }
        if !self.is_at_end() {
            self.expect(TokenKind::Newline, "expected end of line after statement")?;
        }
        Some(statements)
    }

    fn simple_statement(&mut self) -> Option<Stmt> {
        let token = self.peek().clone();
        let single = |kind| Some(Stmt::new(kind, Span::new(token.offset, token.length)));

        match token.kind {
            TokenKind::Pass => {
                self.advance();
                single(StmtKind::Pass)
            }
            TokenKind::Break => {
                self.advance();
                single(StmtKind::Break)
            }
            TokenKind::Continue => {
                self.advance();
                single(StmtKind::Continue)
            }
            TokenKind::Return => self.return_statement(),
            TokenKind::Import => self.import_statement(),
            TokenKind::From => self.from_import_statement(),
            _ => self.assignment_or_expression(),
        }
    }

    fn return_statement(&mut self) -> Option<Stmt> {
        let start = self.advance().offset; // consume 'return'
        let value = if self.check(TokenKind::Newline) || self.check(TokenKind::Semicolon) || self.is_at_end() {
            None
        } else {
            Some(self.expression_list()?)
        };
        let span = Span::new(start, self.previous_end().saturating_sub(start));
        Some(Stmt::new(StmtKind::Return(value), span))
    }

    /// Assignment, annotated assignment, augmented assignment, or a bare
    /// expression statement.
    fn assignment_or_expression(&mut self) -> Option<Stmt> {
        let target = self.expression_list()?;
        let start = target.span.offset;

        if self.match_token(TokenKind::Colon) {
            if target.as_name().is_none() {
                self.report_at(
                    Diagnostic::error(codes::INVALID_TARGET, "only a plain name can carry an annotation"),
                    target.span,
                );
            }
            let annotation_expr = self.expression()?;
            let annotation = self.annotation_from_expr(&annotation_expr)?;
            let value = if self.match_token(TokenKind::Equal) {
                Some(self.expression_list()?)
            } else {
                None
            };
            let span = Span::new(start, self.previous_end().saturating_sub(start));
            return Some(Stmt::new(StmtKind::AnnAssign { target, annotation, value }, span));
        }

        if self.peek().kind.is_augmented_assignment() {
            let op = augmented_operator(self.advance().kind)?;
            self.check_target(&target);
            let value = self.expression_list()?;
            let span = Span::new(start, self.previous_end().saturating_sub(start));
            return Some(Stmt::new(StmtKind::AugAssign { target, op, value }, span));
        }

        if self.match_token(TokenKind::Equal) {
            self.check_target(&target);
            let value = self.expression_list()?;
            if self.check(TokenKind::Equal) {
                self.skip_to_line_end();
                let span = Span::new(start, self.previous_end().saturating_sub(start));
                return Some(Stmt::new(StmtKind::Unsupported("chained assignment".to_string()), span));
            }
            let span = Span::new(start, self.previous_end().saturating_sub(start));
            return Some(Stmt::new(StmtKind::Assign { target, value }, span));
        }

        let span = target.span;
        Some(Stmt::new(StmtKind::Expr(target), span))
    }

    fn check_target(&mut self, target: &Expr) {
        match &target.kind {
            ExprKind::Name(_) | ExprKind::Subscript { .. } | ExprKind::Attribute { .. } => {}
            ExprKind::Tuple(items) | ExprKind::List(items) => {
                for item in items {
                    self.check_target(item);
                }
            }
            _ => self.report_at(
                Diagnostic::error(codes::INVALID_TARGET, "cannot assign to expression"),
                target.span,
            ),
        }
    }

    fn skip_to_line_end(&mut self) {
        while !self.check(TokenKind::Newline) && !self.is_at_end() {
            self.advance();
        }
    }

    fn decorated_definition(&mut self) -> Option<Stmt> {
        let mut decorators = Vec::new();
        while self.check(TokenKind::At) {
            let start = self.advance().offset;
            let expr = self.expression()?;
            let callee = match &expr.kind {
                ExprKind::Call { func, .. } => func.dotted_name(),
                _ => expr.dotted_name(),
            };
            match callee {
                Some(name) => decorators.push(Decorator {
                    name,
                    span: Span::new(start, self.previous_end().saturating_sub(start)),
                }),
                None => self.report_at(
                    Diagnostic::error(codes::UNEXPECTED_TOKEN, "decorator must be a name"),
                    expr.span,
                ),
            }
            self.expect(TokenKind::Newline, "expected end of line after decorator")?;
        }

        if !self.check(TokenKind::Def) {
            self.error_at_current(codes::EXPECTED_STATEMENT, "expected a function definition after decorators");
            return None;
        }
        self.function_definition(decorators)
    }

    /// Parse if statement with its `elif` / `else` clauses
    fn if_statement(&mut self) -> Option<Stmt> {
        let start = self.advance().offset; // consume 'if'

        let mut branches = Vec::new();
        let condition = self.expression()?;
        let body = self.block()?;
        branches.push((condition, body));

        while self.check(TokenKind::Elif) {
            self.advance();
            let condition = self.expression()?;
            let body = self.block()?;
            branches.push((condition, body));
        }

        let orelse = if self.match_token(TokenKind::Else) {
            self.block()?
        } else {
            Vec::new()
        };

        let span = Span::new(start, self.previous_end().saturating_sub(start));
        Some(Stmt::new(StmtKind::If { branches, orelse }, span))
    }

    /// Parse `for target in iter: body`
    fn for_statement(&mut self, pragma: Option<Pragma>) -> Option<Stmt> {
        let start = self.advance().offset; // consume 'for'

        let target = self.target_list()?;
        self.expect(TokenKind::In, "expected 'in' after loop variable")?;
        let iter = self.expression_list()?;
        let body = self.block()?;

        if self.check(TokenKind::Else) {
            let token = self.advance().clone();
            self.block()?;
            return Some(Stmt::new(
                StmtKind::Unsupported("for-else clause".to_string()),
                Span::new(token.offset, token.length),
            ));
        }

        let span = Span::new(start, self.previous_end().saturating_sub(start));
        Some(Stmt::new(StmtKind::For { target, iter, body, pragma }, span))
    }

    /// Loop targets stop before 'in', so they cannot use the full
    /// expression grammar.
    fn target_list(&mut self) -> Option<Expr> {
        let first = self.parse_bitor()?;
        if !self.check(TokenKind::Comma) {
            return Some(first);
        }
        let mut items = vec![first];
        while self.match_token(TokenKind::Comma) {
            if self.check(TokenKind::In) {
                break;
            }
            items.push(self.parse_bitor()?);
        }
        let span = items[0].span.merge(&items[items.len() - 1].span);
        Some(Expr::new(ExprKind::Tuple(items), span))
    }

    fn while_statement(&mut self) -> Option<Stmt> {
        let start = self.advance().offset; // consume 'while'
        let condition = self.expression()?;
        let body = self.block()?;
        let span = Span::new(start, self.previous_end().saturating_sub(start));
        Some(Stmt::new(StmtKind::While { condition, body }, span))
    }

    /// `#$ omp ...` / `#$ acc ...`. Loop directives attach to a directly
    /// following `for`; anything else stands alone.
    fn pragma_statement(&mut self) -> Option<Vec<Stmt>> {
        let token = self.advance().clone();
        let span = Span::new(token.offset, token.length);
        self.match_token(TokenKind::Newline);

        let mut words = token.lexeme.splitn(2, char::is_whitespace);
        let family = match words.next() {
            Some("omp") => PragmaFamily::OpenMp,
            Some("acc") => PragmaFamily::OpenAcc,
            _ => {
                self.report_at(
                    Diagnostic::warning(codes::IGNORED_DIRECTIVE, "ignoring unknown directive")
                        .with_symbol(token.lexeme.clone()),
                    span,
                );
                return Some(Vec::new());
            }
        };
        let directive = words.next().unwrap_or("").trim().to_string();
        if directive.is_empty() {
            self.report_at(Diagnostic::error(codes::EXPECTED_TOKEN, "directive is missing its body"), span);
            return Some(Vec::new());
        }

        let pragma = Pragma { family, directive, span };
        if pragma.is_loop_directive() && self.check(TokenKind::For) {
            return Some(vec![self.for_statement(Some(pragma))?]);
        }
        Some(vec![Stmt::new(StmtKind::Pragma(pragma), span)])
    }

    /// Statements the grammar knows but the compiler does not translate.
    fn unsupported_statement(&mut self) -> Stmt {
        let token = self.peek().clone();
        let construct = match token.kind {
            TokenKind::Class => "class definition",
            TokenKind::Lambda => "lambda expression",
            TokenKind::With => "with statement",
            TokenKind::Try => "try statement",
            TokenKind::Except => "except clause",
            TokenKind::Finally => "finally clause",
            TokenKind::Raise => "raise statement",
            TokenKind::Global => "global declaration",
            TokenKind::Nonlocal => "nonlocal declaration",
            TokenKind::Del => "del statement",
            TokenKind::Yield => "yield statement",
            TokenKind::Assert => "assert statement",
            TokenKind::Async => "async definition",
            _ => "await expression",
        };
        self.skip_statement();
        Stmt::new(
            StmtKind::Unsupported(construct.to_string()),
            Span::new(token.offset, token.length),
        )
    }
}

fn augmented_operator(kind: TokenKind) -> Option<BinaryOp> {
    let op = match kind {
        TokenKind::PlusEqual => BinaryOp::Add,
        TokenKind::MinusEqual => BinaryOp::Sub,
        TokenKind::StarEqual => BinaryOp::Mul,
        TokenKind::StarStarEqual => BinaryOp::Pow,
        TokenKind::SlashEqual => BinaryOp::Div,
        TokenKind::SlashSlashEqual => BinaryOp::FloorDiv,
        TokenKind::PercentEqual => BinaryOp::Mod,
        TokenKind::AmpersandEqual => BinaryOp::BitAnd,
        TokenKind::PipeEqual => BinaryOp::BitOr,
        TokenKind::CaretEqual => BinaryOp::BitXor,
        TokenKind::LessLessEqual => BinaryOp::Shl,
        TokenKind::GreaterGreaterEqual => BinaryOp::Shr,
        _ => return None,
    };
    Some(op)
}

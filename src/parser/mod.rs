//! Parser module for building the AST from tokens.

mod annotation;
mod ast;
mod expression;
mod statement;

pub use annotation::parse_annotation_text;
pub use ast::*;
pub use expression::ExpressionParser;
pub use statement::StatementParser;

use crate::diagnostics::{codes, Diagnostic, DiagnosticReporter};
use crate::lexer::{Scanner, Token, TokenKind};

/// Tokenize and parse a whole source file. Syntax errors land in `reporter`.
pub fn parse_source(source: &str, reporter: &mut DiagnosticReporter) -> Module {
    let tokens = Scanner::new(source, reporter).scan_tokens();
    Parser::new(tokens, reporter).parse()
}

/// Recursive descent parser for the Python subset
pub struct Parser<'a> {
    tokens: Vec<Token>,
    current: usize,
    reporter: &'a mut DiagnosticReporter,
    panic_mode: bool,
}

impl<'a> Parser<'a> {
    pub fn new(mut tokens: Vec<Token>, reporter: &'a mut DiagnosticReporter) -> Self {
        if tokens.last().map_or(true, |t| t.kind != TokenKind::Eof) {
            let offset = tokens.last().map_or(0, |t| t.offset + t.length);
            tokens.push(Token::eof(offset));
        }
        Self {
            tokens,
            current: 0,
            reporter,
            panic_mode: false,
        }
    }

    /// Parse the entire module
    pub fn parse(&mut self) -> Module {
        let mut body = Vec::new();

        while !self.is_at_end() {
            // Stray layout tokens left behind by error recovery
            if self.match_token(TokenKind::Newline) || self.match_token(TokenKind::Dedent) {
                continue;
            }
            self.statement_or_recover(&mut body);
        }

        Module { body }
    }

    /// Parse the suite after a ':': an indented block or simple statements
    /// on the same line.
    pub(crate) fn block(&mut self) -> Option<Vec<Stmt>> {
        self.expect(TokenKind::Colon, "expected ':'")?;

        if !self.match_token(TokenKind::Newline) {
            return self.simple_statements();
        }

        if !self.check(TokenKind::Indent) {
            self.error_at_current(codes::EXPECTED_INDENT, "expected an indented block");
            return None;
        }
        self.advance();

        let mut statements = Vec::new();
        while !self.check(TokenKind::Dedent) && !self.is_at_end() {
            if self.match_token(TokenKind::Newline) {
                continue;
            }
            self.statement_or_recover(&mut statements);
        }
        self.match_token(TokenKind::Dedent);

        Some(statements)
    }

    /// Parse one statement into `out`. On failure, resynchronize and make
    /// sure at least one token was consumed.
    fn statement_or_recover(&mut self, out: &mut Vec<Stmt>) {
        if self.check(TokenKind::Indent) {
            self.error_at_current(codes::UNEXPECTED_TOKEN, "unexpected indent");
            self.skip_block();
            self.panic_mode = false;
            return;
        }
        let start = self.current;
        match self.statement() {
            Some(stmts) => out.extend(stmts),
            None => {
                self.synchronize();
                if self.current == start && !self.is_at_end() && !self.check(TokenKind::Dedent) {
                    self.advance();
                }
            }
        }
    }

    /// Parse `def name(params) [-> annotation]: body`
    pub(crate) fn function_definition(&mut self, decorators: Vec<Decorator>) -> Option<Stmt> {
        let start = self.advance().offset; // consume 'def'
        let (name, name_span) = self.expect_identifier_with_span("expected function name after 'def'")?;
        self.expect(TokenKind::LeftParen, "expected '(' after function name")?;

        let mut params = Vec::new();
        while !self.check(TokenKind::RightParen) && !self.is_at_end() {
            if self.check(TokenKind::Star) || self.check(TokenKind::StarStar) || self.check(TokenKind::Slash) {
                let token = self.advance().clone();
                self.reporter.report(
                    Diagnostic::error(codes::UNSUPPORTED_CONSTRUCT, "variadic and positional-only parameters are not supported"),
                    token.offset,
                    token.length,
                );
                if self.check(TokenKind::Identifier) {
                    self.advance();
                }
            } else {
                params.push(self.parameter()?);
            }

            if !self.match_token(TokenKind::Comma) {
                break;
            }
        }
        self.expect(TokenKind::RightParen, "expected ')' after parameters")?;

        let returns = if self.match_token(TokenKind::Arrow) {
            let expr = self.expression()?;
            Some(self.annotation_from_expr(&expr)?)
        } else {
            None
        };

        let body = self.block()?;
        let end = self.previous_end();

        Some(Stmt::new(
            StmtKind::FunctionDef(FunctionDef {
                name,
                name_span,
                params,
                returns,
                body,
                decorators,
            }),
            Span::new(start, end.saturating_sub(start)),
        ))
    }

    fn parameter(&mut self) -> Option<Param> {
        let (name, span) = self.expect_identifier_with_span("expected parameter name")?;

        let annotation = if self.match_token(TokenKind::Colon) {
            let expr = self.expression()?;
            Some(self.annotation_from_expr(&expr)?)
        } else {
            None
        };

        let default = if self.match_token(TokenKind::Equal) {
            Some(self.expression()?)
        } else {
            None
        };

        Some(Param {
            name,
            span,
            annotation,
            default,
        })
    }

    /// Turn an annotation expression into an [`Annotation`], reporting
    /// malformed annotations at the expression.
    pub(crate) fn annotation_from_expr(&mut self, expr: &Expr) -> Option<Annotation> {
        match annotation::annotation_from_expr(expr) {
            Ok(annotation) => Some(annotation),
            Err(message) => {
                self.reporter.report(
                    Diagnostic::error(codes::INVALID_ANNOTATION, "invalid type annotation").with_symbol(message),
                    expr.span.offset,
                    expr.span.length,
                );
                None
            }
        }
    }

    /// Parse `import a [as b], ...`
    pub(crate) fn import_statement(&mut self) -> Option<Stmt> {
        let start = self.advance().offset; // consume 'import'
        let mut names = Vec::new();
        loop {
            names.push(self.import_alias(true)?);
            if !self.match_token(TokenKind::Comma) {
                break;
            }
        }
        let span = Span::new(start, self.previous_end().saturating_sub(start));
        Some(Stmt::new(StmtKind::Import(names), span))
    }

    /// Parse `from m import a [as b], ...`
    pub(crate) fn from_import_statement(&mut self) -> Option<Stmt> {
        let start = self.advance().offset; // consume 'from'
        let module = self.dotted_name()?;
        self.expect(TokenKind::Import, "expected 'import' after module name")?;

        let parenthesized = self.match_token(TokenKind::LeftParen);
        let mut names = Vec::new();
        if self.check(TokenKind::Star) {
            let token = self.advance().clone();
            self.reporter.report(
                Diagnostic::error(codes::UNSUPPORTED_CONSTRUCT, "wildcard imports are not supported"),
                token.offset,
                token.length,
            );
        } else {
            loop {
                names.push(self.import_alias(false)?);
                if !self.match_token(TokenKind::Comma) || (parenthesized && self.check(TokenKind::RightParen)) {
                    break;
                }
            }
        }
        if parenthesized {
            self.expect(TokenKind::RightParen, "expected ')' after imported names")?;
        }

        let span = Span::new(start, self.previous_end().saturating_sub(start));
        Some(Stmt::new(StmtKind::FromImport { module, names }, span))
    }

    fn import_alias(&mut self, dotted: bool) -> Option<ImportAlias> {
        let start = self.peek().offset;
        let name = if dotted {
            self.dotted_name()?
        } else {
            self.expect_identifier("expected imported name")?
        };
        let alias = if self.match_token(TokenKind::As) {
            Some(self.expect_identifier("expected alias after 'as'")?)
        } else {
            None
        };
        Some(ImportAlias {
            name,
            alias,
            span: Span::new(start, self.previous_end().saturating_sub(start)),
        })
    }

    fn dotted_name(&mut self) -> Option<String> {
        let mut name = self.expect_identifier("expected module name")?;
        while self.match_token(TokenKind::Dot) {
            name.push('.');
            name.push_str(&self.expect_identifier("expected name after '.'")?);
        }
        Some(name)
    }

    /// Skip an unsupported statement and any block that belongs to it
    pub(crate) fn skip_statement(&mut self) {
        let mut depth = 0usize;
        while !self.is_at_end() {
            match self.peek().kind {
                TokenKind::Newline if depth == 0 => {
                    self.advance();
                    break;
                }
                TokenKind::LeftParen | TokenKind::LeftBracket | TokenKind::LeftBrace => depth += 1,
                TokenKind::RightParen | TokenKind::RightBracket | TokenKind::RightBrace => {
                    depth = depth.saturating_sub(1)
                }
                _ => {}
            }
            self.advance();
        }
        if self.check(TokenKind::Indent) {
            self.skip_block();
        }
    }

    fn skip_block(&mut self) {
        let mut depth = 0usize;
        while !self.is_at_end() {
            match self.advance().kind {
                TokenKind::Indent => depth += 1,
                TokenKind::Dedent => {
                    depth = depth.saturating_sub(1);
                    if depth == 0 {
                        return;
                    }
                }
                _ => {}
            }
        }
    }

    // === Helper methods ===

    pub(crate) fn peek(&self) -> &Token {
        &self.tokens[self.current.min(self.tokens.len() - 1)]
    }

    pub(crate) fn peek_next(&self) -> &Token {
        &self.tokens[(self.current + 1).min(self.tokens.len() - 1)]
    }

    pub(crate) fn previous(&self) -> &Token {
        &self.tokens[self.current.saturating_sub(1)]
    }

    /// Byte offset just past the previous token
    pub(crate) fn previous_end(&self) -> usize {
        let token = self.previous();
        token.offset + token.length
    }

    pub(crate) fn is_at_end(&self) -> bool {
        self.peek().kind == TokenKind::Eof
    }

    pub(crate) fn advance(&mut self) -> &Token {
        if !self.is_at_end() {
            self.current += 1;
        }
        self.previous()
    }

    pub(crate) fn check(&self, kind: TokenKind) -> bool {
        self.peek().kind == kind
    }

    pub(crate) fn match_token(&mut self, kind: TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    pub(crate) fn expect(&mut self, kind: TokenKind, message: &str) -> Option<&Token> {
        if self.check(kind) {
            Some(self.advance())
        } else {
            self.error_at_current(codes::EXPECTED_TOKEN, message);
            None
        }
    }

    pub(crate) fn expect_identifier(&mut self, message: &str) -> Option<String> {
        if self.check(TokenKind::Identifier) {
            Some(self.advance().lexeme.clone())
        } else {
            self.error_at_current(codes::EXPECTED_IDENTIFIER, message);
            None
        }
    }

    pub(crate) fn expect_identifier_with_span(&mut self, message: &str) -> Option<(String, Span)> {
        if self.check(TokenKind::Identifier) {
            let token = self.advance();
            Some((token.lexeme.clone(), Span::new(token.offset, token.length)))
        } else {
            self.error_at_current(codes::EXPECTED_IDENTIFIER, message);
            None
        }
    }

    pub(crate) fn error_at_current(&mut self, code: &str, message: &str) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;

        let token = self.peek();
        let found = match token.kind {
            TokenKind::Newline => "end of line".to_string(),
            TokenKind::Eof => "end of file".to_string(),
            TokenKind::Indent => "indent".to_string(),
            TokenKind::Dedent => "dedent".to_string(),
            _ => format!("'{}'", token.lexeme),
        };
        let (offset, length) = (token.offset, token.length.max(1));
        let diag = Diagnostic::error(code, message).with_note(format!("found {}", found));
        self.reporter.report(diag, offset, length);
    }

    pub(crate) fn report_at(&mut self, diagnostic: Diagnostic, span: Span) {
        self.reporter.report(diagnostic, span.offset, span.length.max(1));
    }

    /// Error recovery: skip tokens until we find a synchronization point
    fn synchronize(&mut self) {
        self.panic_mode = false;

        while !self.is_at_end() {
            // After a newline, we're at the start of a new statement
            if self.previous().kind == TokenKind::Newline {
                return;
            }

            if matches!(self.peek().kind, TokenKind::Dedent | TokenKind::Indent) {
                return;
            }

            self.advance();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_ok(source: &str) -> Module {
        let mut reporter = DiagnosticReporter::new("test.py", source);
        let module = parse_source(source, &mut reporter);
        assert!(!reporter.has_errors(), "{:?}", reporter.diagnostics());
        module
    }

    fn parse_err(source: &str) -> Vec<Diagnostic> {
        let mut reporter = DiagnosticReporter::new("test.py", source);
        parse_source(source, &mut reporter);
        assert!(reporter.has_errors());
        reporter.take_diagnostics()
    }

    #[test]
    fn parses_annotated_function() {
        let module = parse_ok("def f(x: 'float[:]', n: int = 3) -> float:\n    return x[0]\n");
        let StmtKind::FunctionDef(def) = &module.body[0].kind else {
            panic!("expected a function definition");
        };
        assert_eq!(def.name, "f");
        assert_eq!(def.params.len(), 2);
        let x = def.params[0].annotation.as_ref().map(|a| a.alternatives[0].clone());
        assert_eq!(x.map(|t| (t.dtype, t.rank)), Some(("float".to_string(), 1)));
        assert!(def.params[1].default.is_some());
        assert_eq!(def.returns.as_ref().map(|a| a.alternatives[0].dtype.clone()).as_deref(), Some("float"));
    }

    #[test]
    fn parses_imports() {
        let module = parse_ok("import numpy as np\nfrom math import sqrt, pi as PI\n");
        match &module.body[0].kind {
            StmtKind::Import(names) => assert_eq!(names[0].bound_name(), "np"),
            other => panic!("unexpected {:?}", other),
        }
        match &module.body[1].kind {
            StmtKind::FromImport { module, names } => {
                assert_eq!(module, "math");
                assert_eq!(names[1].bound_name(), "PI");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn nested_blocks_follow_indentation() {
        let module = parse_ok("def f(n: int) -> int:\n    s = 0\n    for i in range(n):\n        if i % 2 == 0:\n            s += i\n        else:\n            s -= 1\n    return s\n");
        let StmtKind::FunctionDef(def) = &module.body[0].kind else {
            panic!("expected a function definition");
        };
        assert_eq!(def.body.len(), 3);
        let StmtKind::For { body, .. } = &def.body[1].kind else {
            panic!("expected a for loop");
        };
        assert!(matches!(body[0].kind, StmtKind::If { ref orelse, .. } if orelse.len() == 1));
    }

    #[test]
    fn missing_colon_reports_location() {
        let diags = parse_err("def f(x)\n    return x\n");
        let location = diags[0].location.clone().map(|l| (l.line, l.column));
        assert_eq!(diags[0].code, codes::EXPECTED_TOKEN);
        assert_eq!(location, Some((1, 9)));
    }

    #[test]
    fn unexpected_indent_inside_a_block_is_skipped() {
        let diags = parse_err("def f():\n    x\n        pass\n    return 1\ny = 2\n");
        assert_eq!(diags.len(), 1, "{:?}", diags);
        assert!(diags[0].message.contains("unexpected indent"));
    }

    #[test]
    fn unsupported_statements_are_kept_for_semantic_stage() {
        let module = parse_ok("class A:\n    x = 1\ny = 2\n");
        assert!(matches!(module.body[0].kind, StmtKind::Unsupported(_)));
        assert!(matches!(module.body[1].kind, StmtKind::Assign { .. }));
    }

    #[test]
    fn loop_pragma_attaches_to_for() {
        let module = parse_ok("def f(n: int):\n    #$ omp parallel for\n    for i in range(n):\n        pass\n    #$ omp barrier\n");
        let StmtKind::FunctionDef(def) = &module.body[0].kind else {
            panic!("expected a function definition");
        };
        match &def.body[0].kind {
            StmtKind::For { pragma: Some(p), .. } => assert_eq!(p.directive, "parallel for"),
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(def.body[1].kind, StmtKind::Pragma(_)));
    }

    #[test]
    fn stub_bodies_are_detected() {
        let module = parse_ok("def f(x: int) -> int: ...\ndef g(x: int) -> int:\n    return x\n");
        let stubs: Vec<bool> = module
            .body
            .iter()
            .filter_map(|s| match &s.kind {
                StmtKind::FunctionDef(def) => Some(def.is_stub()),
                _ => None,
            })
            .collect();
        assert_eq!(stubs, vec![true, false]);
    }
}

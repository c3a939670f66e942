//! Indentation-aware scanner for Python-subset source code.

use super::token::{lookup_keyword, Token, TokenKind};
use crate::diagnostics::{codes, Diagnostic, DiagnosticReporter};

const TAB_WIDTH: usize = 8;

/// Scanner that produces tokens from source code.
///
/// Block structure is reported through NEWLINE / INDENT / DEDENT tokens.
/// Line breaks inside brackets and after a backslash are joined.
pub struct Scanner<'a> {
    source: &'a str,
    chars: std::iter::Peekable<std::str::CharIndices<'a>>,
    current_offset: usize,
    start_offset: usize,
    indent_stack: Vec<usize>,
    bracket_depth: usize,
    reporter: &'a mut DiagnosticReporter,
}

impl<'a> Scanner<'a> {
    pub fn new(source: &'a str, reporter: &'a mut DiagnosticReporter) -> Self {
        Self {
            source,
            chars: source.char_indices().peekable(),
            current_offset: 0,
            start_offset: 0,
            indent_stack: vec![0],
            bracket_depth: 0,
            reporter,
        }
    }

    /// Tokenize the entire source
    pub fn scan_tokens(mut self) -> Vec<Token> {
        let mut tokens = Vec::new();
        let mut at_line_start = true;

        loop {
            if at_line_start {
                self.scan_indentation(&mut tokens);
                at_line_start = false;
            }

            let token = self.scan_token();
            match token.kind {
                TokenKind::Eof => {
                    self.finish(&mut tokens, token.offset);
                    break;
                }
                TokenKind::Newline => {
                    tokens.push(token);
                    at_line_start = true;
                }
                TokenKind::Error => {}
                _ => tokens.push(token),
            }
        }

        tokens
    }

    /// Close the last logical line and every open block
    fn finish(&mut self, tokens: &mut Vec<Token>, offset: usize) {
        let needs_newline = tokens
            .last()
            .map_or(false, |t| !matches!(t.kind, TokenKind::Newline | TokenKind::Dedent));
        if needs_newline {
            tokens.push(Token::layout(TokenKind::Newline, offset));
        }
        while self.indent_stack.len() > 1 {
            self.indent_stack.pop();
            tokens.push(Token::layout(TokenKind::Dedent, offset));
        }
        tokens.push(Token::eof(offset));
    }

    /// Measure the indentation of the next logical line, skipping blank and
    /// comment-only lines. Pragma lines count as logical lines.
    fn scan_indentation(&mut self, tokens: &mut Vec<Token>) {
        loop {
            let mut width = 0;
            while let Some(c) = self.peek() {
                match c {
                    ' ' => width += 1,
                    '\t' => width = (width / TAB_WIDTH + 1) * TAB_WIDTH,
                    '\x0c' => width = 0,
                    _ => break,
                }
                self.advance();
            }

            match self.peek() {
                None => return,
                Some('\n') | Some('\r') => {
                    self.advance();
                }
                Some('#') if !self.is_pragma_start() => self.skip_comment(),
                Some(_) => {
                    let top = self.current_indent();
                    if width > top {
                        self.indent_stack.push(width);
                        tokens.push(Token::layout(TokenKind::Indent, self.current_offset));
                    } else if width < top {
                        self.dedent_to(width, tokens);
                    }
                    return;
                }
            }
        }
    }

    fn current_indent(&self) -> usize {
        self.indent_stack.last().copied().unwrap_or(0)
    }

    fn dedent_to(&mut self, width: usize, tokens: &mut Vec<Token>) {
        while width < self.current_indent() {
            self.indent_stack.pop();
            tokens.push(Token::layout(TokenKind::Dedent, self.current_offset));
        }
        if width != self.current_indent() {
            self.reporter.report(
                Diagnostic::error(
                    codes::INCONSISTENT_INDENT,
                    "unindent does not match any outer indentation level",
                ),
                self.current_offset,
                1,
            );
        }
    }

    /// A `#$` comment is a pragma only when it is the first thing on its line.
    fn is_pragma_start(&self) -> bool {
        let line_start = self.source[..self.current_offset].rfind('\n').map_or(0, |i| i + 1);
        self.source[self.current_offset..].starts_with("#$")
            && self.source[line_start..self.current_offset].trim().is_empty()
    }

    /// Scan a single token
    fn scan_token(&mut self) -> Token {
        self.skip_whitespace_and_comments();
        self.start_offset = self.current_offset;

        match self.advance() {
            None => Token::eof(self.current_offset),
            Some((offset, c)) => {
                self.start_offset = offset;
                self.current_offset = offset + c.len_utf8();

                match c {
                    '\n' => self.make_token(TokenKind::Newline),

                    '(' => self.open_bracket(TokenKind::LeftParen),
                    '[' => self.open_bracket(TokenKind::LeftBracket),
                    '{' => self.open_bracket(TokenKind::LeftBrace),
                    ')' => self.close_bracket(TokenKind::RightParen),
                    ']' => self.close_bracket(TokenKind::RightBracket),
                    '}' => self.close_bracket(TokenKind::RightBrace),
                    ',' => self.make_token(TokenKind::Comma),
                    ';' => self.make_token(TokenKind::Semicolon),
                    ':' => self.make_token(TokenKind::Colon),
                    '~' => self.make_token(TokenKind::Tilde),
                    '@' => self.make_token(TokenKind::At),

                    '+' => self.match_compound(&[('=', TokenKind::PlusEqual)], TokenKind::Plus),

                    '-' => self.match_compound(&[
                        ('=', TokenKind::MinusEqual),
                        ('>', TokenKind::Arrow),
                    ], TokenKind::Minus),

                    '*' => {
                        if self.match_char('*') {
                            self.match_compound(&[('=', TokenKind::StarStarEqual)], TokenKind::StarStar)
                        } else {
                            self.match_compound(&[('=', TokenKind::StarEqual)], TokenKind::Star)
                        }
                    }

                    '/' => {
                        if self.match_char('/') {
                            self.match_compound(&[('=', TokenKind::SlashSlashEqual)], TokenKind::SlashSlash)
                        } else {
                            self.match_compound(&[('=', TokenKind::SlashEqual)], TokenKind::Slash)
                        }
                    }

                    '%' => self.match_compound(&[('=', TokenKind::PercentEqual)], TokenKind::Percent),
                    '&' => self.match_compound(&[('=', TokenKind::AmpersandEqual)], TokenKind::Ampersand),
                    '|' => self.match_compound(&[('=', TokenKind::PipeEqual)], TokenKind::Pipe),
                    '^' => self.match_compound(&[('=', TokenKind::CaretEqual)], TokenKind::Caret),
                    '=' => self.match_compound(&[('=', TokenKind::EqualEqual)], TokenKind::Equal),

                    '!' => {
                        if self.match_char('=') {
                            self.make_token(TokenKind::BangEqual)
                        } else {
                            self.error_token(c)
                        }
                    }

                    '<' => {
                        if self.match_char('<') {
                            self.match_compound(&[('=', TokenKind::LessLessEqual)], TokenKind::LessLess)
                        } else {
                            self.match_compound(&[('=', TokenKind::LessEqual)], TokenKind::Less)
                        }
                    }

                    '>' => {
                        if self.match_char('>') {
                            self.match_compound(&[('=', TokenKind::GreaterGreaterEqual)], TokenKind::GreaterGreater)
                        } else {
                            self.match_compound(&[('=', TokenKind::GreaterEqual)], TokenKind::Greater)
                        }
                    }

                    '.' => {
                        if self.peek().map_or(false, |c| c.is_ascii_digit()) {
                            self.scan_fraction()
                        } else if self.source[self.current_offset..].starts_with("..") {
                            self.advance();
                            self.advance();
                            self.make_token(TokenKind::Ellipsis)
                        } else {
                            self.make_token(TokenKind::Dot)
                        }
                    }

                    '#' => self.scan_pragma(),

                    '"' | '\'' => self.scan_string(c),

                    '0'..='9' => self.scan_number(c),

                    c if is_ident_start(c) => self.scan_identifier(c),

                    _ => self.error_token(c),
                }
            }
        }
    }

    fn skip_whitespace_and_comments(&mut self) {
        loop {
            match self.peek() {
                Some(' ' | '\t' | '\r' | '\x0c') => {
                    self.advance();
                }
                // Implicit line joining inside brackets
                Some('\n') if self.bracket_depth > 0 => {
                    self.advance();
                }
                // Explicit line joining
                Some('\\') => {
                    let mut chars = self.chars.clone();
                    chars.next();
                    match chars.peek() {
                        Some((_, '\n')) => {
                            self.advance();
                            self.advance();
                        }
                        Some((_, '\r')) => {
                            self.advance();
                            self.advance();
                            self.match_char('\n');
                        }
                        _ => break,
                    }
                }
                Some('#') if self.bracket_depth > 0 || !self.is_pragma_start() => self.skip_comment(),
                _ => break,
            }
        }
    }

    fn skip_comment(&mut self) {
        while self.peek().map_or(false, |c| c != '\n') {
            self.advance();
        }
    }

    fn advance(&mut self) -> Option<(usize, char)> {
        let result = self.chars.next();
        if let Some((_, c)) = result {
            self.current_offset += c.len_utf8();
        }
        result
    }

    fn peek(&mut self) -> Option<char> {
        self.chars.peek().map(|(_, c)| *c)
    }

    fn match_char(&mut self, expected: char) -> bool {
        if self.peek() == Some(expected) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn match_compound(&mut self, options: &[(char, TokenKind)], default: TokenKind) -> Token {
        for (c, kind) in options {
            if self.match_char(*c) {
                return self.make_token(*kind);
            }
        }
        self.make_token(default)
    }

    fn open_bracket(&mut self, kind: TokenKind) -> Token {
        self.bracket_depth += 1;
        self.make_token(kind)
    }

    fn close_bracket(&mut self, kind: TokenKind) -> Token {
        self.bracket_depth = self.bracket_depth.saturating_sub(1);
        self.make_token(kind)
    }

    fn make_token(&self, kind: TokenKind) -> Token {
        let lexeme = &self.source[self.start_offset..self.current_offset];
        Token::new(kind, lexeme, self.start_offset, self.current_offset - self.start_offset)
    }

    fn error_token(&mut self, c: char) -> Token {
        self.reporter.report(
            Diagnostic::error(codes::UNEXPECTED_CHARACTER, format!("unexpected character '{}'", c)),
            self.start_offset,
            c.len_utf8(),
        );
        Token::new(TokenKind::Error, c, self.start_offset, c.len_utf8())
    }

    /// `#$ omp parallel for` becomes a single pragma token; the lexeme is the
    /// text after the `#$` marker.
    fn scan_pragma(&mut self) -> Token {
        self.advance(); // '$'
        let body_start = self.current_offset;
        self.skip_comment();
        let body = self.source[body_start..self.current_offset].trim();
        Token::new(
            TokenKind::Pragma,
            body,
            self.start_offset,
            self.current_offset - self.start_offset,
        )
    }

    fn scan_identifier(&mut self, first: char) -> Token {
        let mut ident = String::new();
        ident.push(first);

        while let Some(c) = self.peek() {
            if is_ident_continue(c) {
                ident.push(c);
                self.advance();
            } else {
                break;
            }
        }

        let kind = lookup_keyword(&ident).unwrap_or(TokenKind::Identifier);
        self.make_token(kind)
    }

    fn consume_digits(&mut self, radix: u32) {
        while let Some(c) = self.peek() {
            if c.is_digit(radix) || c == '_' {
                self.advance();
            } else {
                break;
            }
        }
    }

    fn scan_number(&mut self, first: char) -> Token {
        if first == '0' {
            let radix = match self.peek() {
                Some('x' | 'X') => Some(16),
                Some('o' | 'O') => Some(8),
                Some('b' | 'B') => Some(2),
                _ => None,
            };
            if let Some(radix) = radix {
                self.advance();
                self.consume_digits(radix);
                if self.current_offset - self.start_offset == 2 {
                    return self.invalid_number();
                }
                return self.make_token(TokenKind::IntLiteral);
            }
        }

        self.consume_digits(10);

        let mut is_float = false;
        if self.peek() == Some('.') {
            let mut chars = self.chars.clone();
            chars.next();
            // `1.` is a float unless an attribute name follows
            if !chars.peek().map_or(false, |(_, c)| is_ident_start(*c) && *c != 'e' && *c != 'j') {
                self.advance();
                is_float = true;
                self.consume_digits(10);
            }
        }

        self.finish_number(is_float)
    }

    fn scan_fraction(&mut self) -> Token {
        self.consume_digits(10);
        self.finish_number(true)
    }

    /// Exponent and imaginary suffix shared by all decimal literals
    fn finish_number(&mut self, mut is_float: bool) -> Token {
        if let Some('e' | 'E') = self.peek() {
            self.advance();
            is_float = true;
            if let Some('+' | '-') = self.peek() {
                self.advance();
            }
            if !self.peek().map_or(false, |c| c.is_ascii_digit()) {
                return self.invalid_number();
            }
            self.consume_digits(10);
        }

        if let Some('j' | 'J') = self.peek() {
            self.advance();
            return self.make_token(TokenKind::ImaginaryLiteral);
        }

        if self.peek().map_or(false, is_ident_continue) {
            return self.invalid_number();
        }

        self.make_token(if is_float { TokenKind::FloatLiteral } else { TokenKind::IntLiteral })
    }

    fn invalid_number(&mut self) -> Token {
        while self.peek().map_or(false, is_ident_continue) {
            self.advance();
        }
        let lexeme = &self.source[self.start_offset..self.current_offset];
        self.reporter.report(
            Diagnostic::error(codes::INVALID_NUMBER, format!("invalid number literal '{}'", lexeme)),
            self.start_offset,
            self.current_offset - self.start_offset,
        );
        Token::new(TokenKind::Error, "", self.start_offset, 0)
    }

    /// Single, double and triple quoted strings. The lexeme keeps its quotes.
    fn scan_string(&mut self, quote: char) -> Token {
        let triple: String = std::iter::repeat(quote).take(3).collect();
        let is_triple = self.source[self.start_offset..].starts_with(&triple);
        if is_triple {
            self.advance();
            self.advance();
        }

        while let Some(c) = self.peek() {
            match c {
                '\\' => {
                    self.advance();
                    self.advance();
                }
                c if c == quote => {
                    if !is_triple {
                        self.advance();
                        return self.make_token(TokenKind::StringLiteral);
                    }
                    if self.source[self.current_offset..].starts_with(&triple) {
                        for _ in 0..3 {
                            self.advance();
                        }
                        return self.make_token(TokenKind::StringLiteral);
                    }
                    self.advance();
                }
                '\n' if !is_triple => {
                    self.reporter.report(
                        Diagnostic::error(codes::UNTERMINATED_STRING, "unterminated string literal")
                            .with_help("use a triple-quoted string to span several lines"),
                        self.start_offset,
                        self.current_offset - self.start_offset,
                    );
                    return Token::new(TokenKind::Error, "", self.start_offset, 0);
                }
                _ => {
                    self.advance();
                }
            }
        }

        self.reporter.report(
            Diagnostic::error(codes::UNTERMINATED_STRING, "unterminated string literal")
                .with_help(format!("add a closing {} at the end of the string", if is_triple { &triple[..] } else { &triple[..1] })),
            self.start_offset,
            self.current_offset - self.start_offset,
        );
        Token::new(TokenKind::Error, "", self.start_offset, 0)
    }
}

fn is_ident_start(c: char) -> bool {
    c == '_' || unicode_xid::UnicodeXID::is_xid_start(c)
}

fn is_ident_continue(c: char) -> bool {
    c == '_' || unicode_xid::UnicodeXID::is_xid_continue(c)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        let mut reporter = DiagnosticReporter::new("test.py", source);
        let tokens = Scanner::new(source, &mut reporter).scan_tokens();
        assert!(!reporter.has_errors(), "{:?}", reporter.diagnostics());
        tokens.into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn indentation_produces_layout_tokens() {
        use TokenKind::*;
        let source = "def f(x):\n    if x:\n        return 1\n    return 2\n";
        assert_eq!(
            kinds(source),
            vec![
                Def, Identifier, LeftParen, Identifier, RightParen, Colon, Newline,
                Indent, If, Identifier, Colon, Newline,
                Indent, Return, IntLiteral, Newline,
                Dedent, Return, IntLiteral, Newline,
                Dedent, Eof,
            ]
        );
    }

    #[test]
    fn brackets_join_lines_and_comments_are_skipped() {
        use TokenKind::*;
        let source = "a = [1,\n     2]  # trailing\n\n# only a comment\nb = 3";
        assert_eq!(
            kinds(source),
            vec![
                Identifier, Equal, LeftBracket, IntLiteral, Comma, IntLiteral, RightBracket, Newline,
                Identifier, Equal, IntLiteral, Newline, Eof,
            ]
        );
    }

    #[test]
    fn pragma_lines_become_tokens() {
        let source = "def f(n: int):\n    #$ omp parallel for\n    for i in range(n):\n        pass\n";
        let mut reporter = DiagnosticReporter::new("test.py", source);
        let tokens = Scanner::new(source, &mut reporter).scan_tokens();
        let pragma = tokens.iter().find(|t| t.kind == TokenKind::Pragma).map(|t| t.lexeme.clone());
        assert_eq!(pragma.as_deref(), Some("omp parallel for"));
        let indent_count = tokens.iter().filter(|t| t.kind == TokenKind::Indent).count();
        assert_eq!(indent_count, 2);
    }

    #[test]
    fn number_literals() {
        use TokenKind::*;
        assert_eq!(
            kinds("1 2.5 1e3 3j 0x1F .5 1_000"),
            vec![IntLiteral, FloatLiteral, FloatLiteral, ImaginaryLiteral, IntLiteral, FloatLiteral, IntLiteral, Newline, Eof]
        );
    }

    #[test]
    fn operators_are_longest_match() {
        use TokenKind::*;
        assert_eq!(
            kinds("a **= b // c -> d != e"),
            vec![Identifier, StarStarEqual, Identifier, SlashSlash, Identifier, Arrow, Identifier, BangEqual, Identifier, Newline, Eof]
        );
    }

    #[test]
    fn triple_quoted_docstring_spans_lines() {
        use TokenKind::*;
        assert_eq!(kinds("\"\"\"doc\nstring\"\"\"\nx = 1\n"), vec![StringLiteral, Newline, Identifier, Equal, IntLiteral, Newline, Eof]);
    }

    #[test]
    fn bad_dedent_is_reported() {
        let source = "if x:\n        a = 1\n    b = 2\n";
        let mut reporter = DiagnosticReporter::new("test.py", source);
        Scanner::new(source, &mut reporter).scan_tokens();
        assert!(reporter.has_errors());
        assert_eq!(reporter.diagnostics()[0].code, codes::INCONSISTENT_INDENT);
    }

    #[test]
    fn unterminated_string_is_reported() {
        let source = "s = 'abc\n";
        let mut reporter = DiagnosticReporter::new("test.py", source);
        Scanner::new(source, &mut reporter).scan_tokens();
        assert_eq!(reporter.error_count(), 1);
    }
}

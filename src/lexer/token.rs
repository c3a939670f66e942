//! Token definitions for the Python-subset lexer.

use std::fmt;

/// A token with its kind, lexeme, and position
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub lexeme: String,
    pub offset: usize,
    pub length: usize,
}

impl Token {
    pub fn new(kind: TokenKind, lexeme: impl Into<String>, offset: usize, length: usize) -> Self {
        Self {
            kind,
            lexeme: lexeme.into(),
            offset,
            length,
        }
    }

    pub fn eof(offset: usize) -> Self {
        Self::new(TokenKind::Eof, "", offset, 0)
    }

    /// Zero-width layout token (NEWLINE / INDENT / DEDENT)
    pub fn layout(kind: TokenKind, offset: usize) -> Self {
        Self::new(kind, "", offset, 0)
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}('{}')", self.kind, self.lexeme)
    }
}

/// All token kinds of the supported Python subset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenKind {
    // Literals
    IntLiteral,
    FloatLiteral,
    ImaginaryLiteral,
    StringLiteral,

    Identifier,

    // Keywords
    Def,
    Return,
    If,
    Elif,
    Else,
    For,
    In,
    While,
    Break,
    Continue,
    Pass,
    Import,
    From,
    As,
    And,
    Or,
    Not,
    Is,
    True,
    False,
    None,

    // Keywords that parse but are rejected later
    Class,
    Lambda,
    With,
    Try,
    Except,
    Finally,
    Raise,
    Global,
    Nonlocal,
    Del,
    Yield,
    Assert,
    Async,
    Await,

    // Operators
    Plus,           // +
    Minus,          // -
    Star,           // *
    StarStar,       // **
    Slash,          // /
    SlashSlash,     // //
    Percent,        // %
    At,             // @
    Ampersand,      // &
    Pipe,           // |
    Caret,          // ^
    Tilde,          // ~
    LessLess,       // <<
    GreaterGreater, // >>
    Less,           // <
    Greater,        // >
    LessEqual,      // <=
    GreaterEqual,   // >=
    EqualEqual,     // ==
    BangEqual,      // !=
    Equal,          // =
    Arrow,          // ->

    // Augmented assignment
    PlusEqual,
    MinusEqual,
    StarEqual,
    StarStarEqual,
    SlashEqual,
    SlashSlashEqual,
    PercentEqual,
    AmpersandEqual,
    PipeEqual,
    CaretEqual,
    LessLessEqual,
    GreaterGreaterEqual,

    // Delimiters
    LeftParen,
    RightParen,
    LeftBracket,
    RightBracket,
    LeftBrace,
    RightBrace,
    Colon,
    Comma,
    Dot,
    Semicolon,
    Ellipsis,

    // Layout
    Newline,
    Indent,
    Dedent,

    /// `#$ omp ...` / `#$ acc ...` comment line
    Pragma,

    // Special
    Eof,
    Error,
}

impl TokenKind {
    /// Check if this is an augmented assignment operator
    pub fn is_augmented_assignment(&self) -> bool {
        matches!(self,
            TokenKind::PlusEqual | TokenKind::MinusEqual | TokenKind::StarEqual |
            TokenKind::StarStarEqual | TokenKind::SlashEqual | TokenKind::SlashSlashEqual |
            TokenKind::PercentEqual | TokenKind::AmpersandEqual | TokenKind::PipeEqual |
            TokenKind::CaretEqual | TokenKind::LessLessEqual | TokenKind::GreaterGreaterEqual
        )
    }

    /// Keywords recognised by the grammar but outside the compiled subset
    pub fn is_unsupported_keyword(&self) -> bool {
        matches!(self,
            TokenKind::Class | TokenKind::Lambda | TokenKind::With | TokenKind::Try |
            TokenKind::Except | TokenKind::Finally | TokenKind::Raise | TokenKind::Global |
            TokenKind::Nonlocal | TokenKind::Del | TokenKind::Yield | TokenKind::Assert |
            TokenKind::Async | TokenKind::Await
        )
    }
}

/// Map string to keyword token kind
pub fn lookup_keyword(ident: &str) -> Option<TokenKind> {
    match ident {
        "def" => Some(TokenKind::Def),
        "return" => Some(TokenKind::Return),
        "if" => Some(TokenKind::If),
        "elif" => Some(TokenKind::Elif),
        "else" => Some(TokenKind::Else),
        "for" => Some(TokenKind::For),
        "in" => Some(TokenKind::In),
        "while" => Some(TokenKind::While),
        "break" => Some(TokenKind::Break),
        "continue" => Some(TokenKind::Continue),
        "pass" => Some(TokenKind::Pass),
        "import" => Some(TokenKind::Import),
        "from" => Some(TokenKind::From),
        "as" => Some(TokenKind::As),
        "and" => Some(TokenKind::And),
        "or" => Some(TokenKind::Or),
        "not" => Some(TokenKind::Not),
        "is" => Some(TokenKind::Is),
        "True" => Some(TokenKind::True),
        "False" => Some(TokenKind::False),
        "None" => Some(TokenKind::None),

        "class" => Some(TokenKind::Class),
        "lambda" => Some(TokenKind::Lambda),
        "with" => Some(TokenKind::With),
        "try" => Some(TokenKind::Try),
        "except" => Some(TokenKind::Except),
        "finally" => Some(TokenKind::Finally),
        "raise" => Some(TokenKind::Raise),
        "global" => Some(TokenKind::Global),
        "nonlocal" => Some(TokenKind::Nonlocal),
        "del" => Some(TokenKind::Del),
        "yield" => Some(TokenKind::Yield),
        "assert" => Some(TokenKind::Assert),
        "async" => Some(TokenKind::Async),
        "await" => Some(TokenKind::Await),

        _ => None,
    }
}

//! Lexer module for tokenizing Python-subset source code.

mod token;
mod scanner;

pub use token::{Token, TokenKind};
pub use scanner::Scanner;

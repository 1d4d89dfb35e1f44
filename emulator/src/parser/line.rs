//! Line classification
//!
//! Splits one tokenized line into an optional label, an optional mnemonic
//! and its operand lexemes. The ambiguity between a label and a mnemonic
//! at the start of a line is resolved by indentation and by a lookup in
//! the instruction table: an indented line must start with a mnemonic,
//! a flush-left line may start with a label.

use thiserror::Error;

use super::lexer::{LexError, Lexer, Token, TokenKind};
use crate::assembler::table;

/// One classified source line
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SourceLine {
    pub label: Option<String>,
    pub mnemonic: Option<String>,
    pub operands: Vec<String>,
    /// 1-based line number in the source text
    pub number: usize,
}

impl SourceLine {
    pub fn is_empty(&self) -> bool {
        self.label.is_none() && self.mnemonic.is_none() && self.operands.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LineError {
    #[error(transparent)]
    Lex(#[from] LexError),

    #[error("expected instruction after leading whitespace, got \"{0}\"")]
    ExpectedMnemonic(String),

    #[error("expected label or instruction, got \"{0}\"")]
    ExpectedLabel(String),

    #[error("expected value after =")]
    ExpectedLiteralValue,

    #[error("unexpected \"{0}\"")]
    UnexpectedToken(String),
}

/// Classify a single line
pub fn parse_line(text: &str, number: usize) -> Result<SourceLine, LineError> {
    let mut lexer = Lexer::new(text, number);
    let mut tokens: Vec<Token> = Vec::new();
    let mut indented = false;
    let mut first = true;

    loop {
        let token = lexer.next_token()?;
        match token.kind {
            TokenKind::Eof | TokenKind::Newline | TokenKind::Comment => break,
            TokenKind::Whitespace => {
                if first {
                    indented = true;
                }
            }
            _ => {
                first = false;
                tokens.push(token);
            }
        }
    }

    let mut line = SourceLine {
        number,
        ..Default::default()
    };

    if tokens.is_empty() {
        return Ok(line);
    }

    let mut pos = 0;

    if indented {
        match tokens[0] {
            Token {
                kind: TokenKind::Ident,
                text,
                ..
            } if table::is_mnemonic(text) => {
                line.mnemonic = Some(text.to_string());
                pos = 1;
            }
            token => return Err(LineError::ExpectedMnemonic(token.text.to_string())),
        }
    } else {
        match tokens[0] {
            Token {
                kind: TokenKind::Ident,
                text,
                ..
            } => {
                if table::is_mnemonic(text) {
                    line.mnemonic = Some(text.to_string());
                } else {
                    line.label = Some(text.to_string());
                    // The identifier after a label, if any, is the mnemonic;
                    // pass 1 rejects it when it is not in the table.
                    if let Some(Token {
                        kind: TokenKind::Ident,
                        text,
                        ..
                    }) = tokens.get(1)
                    {
                        line.mnemonic = Some((*text).to_string());
                        pos = 1;
                    }
                }
                pos += 1;
            }
            token => return Err(LineError::ExpectedLabel(token.text.to_string())),
        }
    }

    // Operands: comma-separated lexemes, `=` merged with the value after it
    while pos < tokens.len() {
        let token = tokens[pos];
        match token.kind {
            TokenKind::Comma => pos += 1,
            TokenKind::Equals => {
                let value = tokens.get(pos + 1).ok_or(LineError::ExpectedLiteralValue)?;
                match value.kind {
                    TokenKind::Number | TokenKind::Hex | TokenKind::Str | TokenKind::Ident => {
                        line.operands.push(format!("={}", value.text));
                        pos += 2;
                    }
                    _ => return Err(LineError::ExpectedLiteralValue),
                }
            }
            TokenKind::Ident
            | TokenKind::Register(_)
            | TokenKind::Number
            | TokenKind::Hex
            | TokenKind::Str => {
                line.operands.push(token.text.to_string());
                pos += 1;
            }
            _ => return Err(LineError::UnexpectedToken(token.text.to_string())),
        }
    }

    Ok(line)
}

/// Strip the quotes of a string lexeme and collapse doubled quotes
pub(crate) fn unquote(lexeme: &str) -> Option<String> {
    let inner = lexeme
        .strip_prefix('\'')
        .and_then(|s| s.strip_suffix('\''))?;
    Some(inner.replace("''", "'"))
}

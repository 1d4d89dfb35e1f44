//! Token-level scanner for CASL II lines
//!
//! The scanner walks one line character by character. Whitespace is a
//! token rather than being skipped: a line that starts with whitespace
//! must start with a mnemonic, so the line parser needs to see it.

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Eof,
    Newline,
    Whitespace,
    Comment,
    Comma,
    Equals,
    /// A label or a mnemonic; which one is decided by the line parser
    Ident,
    /// One of GR0..GR7
    Register(u8),
    /// Decimal number, with an optional leading sign
    Number,
    /// `#` followed by hex digits
    Hex,
    /// Single-quoted string, `''` escaping a quote
    Str,
}

/// A token, holding a slice of the original line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Token<'a> {
    pub kind: TokenKind,
    pub text: &'a str,
    pub line: usize,
    pub column: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LexError {
    #[error("unexpected character {0:?}")]
    UnexpectedCharacter(char),

    #[error("unterminated string")]
    UnterminatedString,

    #[error("incomplete hex number")]
    IncompleteHexNumber,
}

fn is_letter(c: char) -> bool {
    c.is_ascii_alphabetic() || matches!(c, '$' | '%' | '_' | '.')
}

fn is_label_char(c: char) -> bool {
    is_letter(c) || c.is_ascii_digit()
}

fn is_blank(c: char) -> bool {
    c == ' ' || c == '\t'
}

pub struct Lexer<'a> {
    src: &'a str,
    pos: usize,
    line: usize,
    column: usize,
}

impl<'a> Lexer<'a> {
    pub fn new(src: &'a str, line: usize) -> Self {
        Lexer {
            src,
            pos: 0,
            line,
            column: 1,
        }
    }

    fn peek(&self) -> Option<char> {
        self.src[self.pos..].chars().next()
    }

    fn peek_at(&self, n: usize) -> Option<char> {
        self.src[self.pos..].chars().nth(n)
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        self.column += 1;
        Some(c)
    }

    fn token(&self, kind: TokenKind, start: usize, column: usize) -> Token<'a> {
        Token {
            kind,
            text: &self.src[start..self.pos],
            line: self.line,
            column,
        }
    }

    /// Scan the next token. After [`TokenKind::Eof`] or
    /// [`TokenKind::Newline`] the line is exhausted.
    pub fn next_token(&mut self) -> Result<Token<'a>, LexError> {
        let start = self.pos;
        let column = self.column;

        let Some(c) = self.peek() else {
            return Ok(self.token(TokenKind::Eof, start, column));
        };

        if is_blank(c) {
            while self.peek().is_some_and(is_blank) {
                self.bump();
            }
            return Ok(self.token(TokenKind::Whitespace, start, column));
        }

        if c == '\n' || c == '\r' {
            self.bump();
            if c == '\r' && self.peek() == Some('\n') {
                self.bump();
            }
            return Ok(self.token(TokenKind::Newline, start, column));
        }

        if c == ';' {
            while !matches!(self.peek(), None | Some('\n') | Some('\r')) {
                self.bump();
            }
            return Ok(self.token(TokenKind::Comment, start, column));
        }

        if c == ',' {
            self.bump();
            return Ok(self.token(TokenKind::Comma, start, column));
        }

        if c == '=' {
            self.bump();
            return Ok(self.token(TokenKind::Equals, start, column));
        }

        if c == '\'' {
            return self.scan_string(start, column);
        }

        if c == '#' {
            self.bump();
            if !self.peek().is_some_and(|c| c.is_ascii_hexdigit()) {
                return Err(LexError::IncompleteHexNumber);
            }
            while self.peek().is_some_and(|c| c.is_ascii_hexdigit()) {
                self.bump();
            }
            return Ok(self.token(TokenKind::Hex, start, column));
        }

        if c.is_ascii_digit()
            || ((c == '+' || c == '-') && self.peek_at(1).is_some_and(|c| c.is_ascii_digit()))
        {
            self.bump();
            while self.peek().is_some_and(|c| c.is_ascii_digit()) {
                self.bump();
            }
            return Ok(self.token(TokenKind::Number, start, column));
        }

        if is_letter(c) {
            return Ok(self.scan_identifier(start, column));
        }

        Err(LexError::UnexpectedCharacter(c))
    }

    fn scan_string(&mut self, start: usize, column: usize) -> Result<Token<'a>, LexError> {
        self.bump(); // opening quote
        loop {
            match self.bump() {
                None => return Err(LexError::UnterminatedString),
                Some('\'') => {
                    // A doubled quote stays inside the string
                    if self.peek() == Some('\'') {
                        self.bump();
                    } else {
                        return Ok(self.token(TokenKind::Str, start, column));
                    }
                }
                Some(_) => {}
            }
        }
    }

    fn scan_identifier(&mut self, start: usize, column: usize) -> Token<'a> {
        // GR0..GR7 is a register only when the next character cannot
        // continue an identifier; GR1X stays a plain identifier.
        if self.peek() == Some('G') && self.peek_at(1) == Some('R') {
            if let Some(digit) = self.peek_at(2).filter(|c| ('0'..='7').contains(c)) {
                if !self.peek_at(3).is_some_and(is_label_char) {
                    self.bump();
                    self.bump();
                    self.bump();
                    let number = digit as u8 - b'0';
                    return self.token(TokenKind::Register(number), start, column);
                }
            }
        }

        while self.peek().is_some_and(is_label_char) {
            self.bump();
        }
        self.token(TokenKind::Ident, start, column)
    }
}

/// Check that a string is usable as a label
pub fn is_valid_label(s: &str) -> bool {
    let mut chars = s.chars();
    chars.next().is_some_and(is_letter) && chars.all(is_label_char)
}

/// Parse a register name (GR0..GR7), case-insensitively
pub fn register_number(s: &str) -> Option<u8> {
    let bytes = s.as_bytes();
    if bytes.len() == 3
        && bytes[0].eq_ignore_ascii_case(&b'G')
        && bytes[1].eq_ignore_ascii_case(&b'R')
        && (b'0'..=b'7').contains(&bytes[2])
    {
        Some(bytes[2] - b'0')
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn kinds(src: &str) -> Vec<(TokenKind, &str)> {
        let mut lexer = Lexer::new(src, 1);
        let mut out = Vec::new();
        loop {
            let token = lexer.next_token().unwrap();
            if token.kind == TokenKind::Eof {
                return out;
            }
            out.push((token.kind, token.text));
        }
    }

    #[test]
    fn scan_instruction_line_test() {
        use TokenKind::*;
        assert_eq!(
            kinds("     LD    GR0,=10"),
            vec![
                (Whitespace, "     "),
                (Ident, "LD"),
                (Whitespace, "    "),
                (Register(0), "GR0"),
                (Comma, ","),
                (Equals, "="),
                (Number, "10"),
            ]
        );
    }

    #[test]
    fn scan_label_line_test() {
        use TokenKind::*;
        assert_eq!(
            kinds("MAIN START ; entry"),
            vec![
                (Ident, "MAIN"),
                (Whitespace, " "),
                (Ident, "START"),
                (Whitespace, " "),
                (Comment, "; entry"),
            ]
        );
    }

    #[test]
    fn register_needs_boundary_test() {
        use TokenKind::*;
        assert_eq!(kinds("GR1X"), vec![(Ident, "GR1X")]);
        assert_eq!(kinds("GR8"), vec![(Ident, "GR8")]);
        assert_eq!(
            kinds("GR1,GR2"),
            vec![(Register(1), "GR1"), (Comma, ","), (Register(2), "GR2")]
        );
    }

    #[test]
    fn scan_numbers_test() {
        use TokenKind::*;
        assert_eq!(
            kinds("-10 +3 #00FF"),
            vec![
                (Number, "-10"),
                (Whitespace, " "),
                (Number, "+3"),
                (Whitespace, " "),
                (Hex, "#00FF"),
            ]
        );
        let mut lexer = Lexer::new("#", 1);
        assert_eq!(lexer.next_token(), Err(LexError::IncompleteHexNumber));
    }

    #[test]
    fn scan_string_test() {
        use TokenKind::*;
        assert_eq!(kinds("'it''s'"), vec![(Str, "'it''s'")]);
        let mut lexer = Lexer::new("'open", 1);
        assert_eq!(lexer.next_token(), Err(LexError::UnterminatedString));
    }

    #[test]
    fn token_positions_test() {
        let mut lexer = Lexer::new("  DC 1", 7);
        let token = lexer.next_token().unwrap();
        assert_eq!((token.line, token.column), (7, 1));
        let token = lexer.next_token().unwrap();
        assert_eq!((token.kind, token.line, token.column), (TokenKind::Ident, 7, 3));
    }

    #[test]
    fn label_helpers_test() {
        assert!(is_valid_label("LOOP2"));
        assert!(is_valid_label("$buf"));
        assert!(!is_valid_label("1ST"));
        assert!(!is_valid_label(""));
        assert_eq!(register_number("gr3"), Some(3));
        assert_eq!(register_number("GR9"), None);
        assert_eq!(register_number("GR"), None);
    }
}

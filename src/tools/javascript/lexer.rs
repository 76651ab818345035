//! Tokenizer for the script subset.

use super::ScriptError;

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Number(f64),
    Str(String),
    /// Cooked string pieces and the raw source of each `${}` hole.
    Template {
        quasis: Vec<String>,
        holes: Vec<String>,
    },
    Ident(String),
    Punct(&'static str),
    Eof,
}

#[derive(Debug, Clone)]
pub struct Spanned {
    pub token: Token,
    pub line: usize,
    /// A line break separates this token from the previous one.
    pub newline_before: bool,
}

const PUNCTUATORS: &[&str] = &[
    ">>>=", "...", "===", "!==", "**=", "<<=", ">>=", ">>>", "&&=", "||=", "??=", "=>", "==", "!=",
    "<=", ">=", "&&", "||", "??", "?.", "++", "--", "+=", "-=", "*=", "/=", "%=", "&=", "|=", "^=",
    "**", "<<", ">>", "{", "}", "(", ")", "[", "]", ";", ",", "<", ">", "+", "-", "*", "/", "%",
    "&", "|", "^", "!", "~", "?", ":", "=", ".",
];

pub fn tokenize(source: &str) -> Result<Vec<Spanned>, ScriptError> {
    Lexer::new(source).run()
}

struct Lexer {
    chars: Vec<char>,
    pos: usize,
    line: usize,
}

impl Lexer {
    fn new(source: &str) -> Self {
        Self {
            chars: source.chars().collect(),
            pos: 0,
            line: 1,
        }
    }

    fn error(&self, message: impl Into<String>) -> ScriptError {
        ScriptError::Syntax {
            message: message.into(),
            line: self.line,
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += 1;
        if c == '\n' {
            self.line += 1;
        }
        Some(c)
    }

    fn starts_with(&self, text: &str) -> bool {
        text.chars()
            .enumerate()
            .all(|(i, c)| self.peek_at(i) == Some(c))
    }

    fn run(mut self) -> Result<Vec<Spanned>, ScriptError> {
        let mut tokens = Vec::new();
        loop {
            let newline_before = self.skip_trivia()?;
            let line = self.line;
            let Some(c) = self.peek() else {
                tokens.push(Spanned {
                    token: Token::Eof,
                    line,
                    newline_before: true,
                });
                return Ok(tokens);
            };

            let token = if c.is_ascii_digit()
                || (c == '.' && self.peek_at(1).is_some_and(|d| d.is_ascii_digit()))
            {
                self.number()?
            } else if c == '"' || c == '\'' {
                self.string(c)?
            } else if c == '`' {
                self.template()?
            } else if is_ident_start(c) {
                self.ident()
            } else {
                self.punct()?
            };

            tokens.push(Spanned {
                token,
                line,
                newline_before,
            });
        }
    }

    /// Skip whitespace and comments; report whether a line break was seen.
    fn skip_trivia(&mut self) -> Result<bool, ScriptError> {
        let mut newline = false;
        while let Some(c) = self.peek() {
            if c == '\n' {
                newline = true;
                self.bump();
            } else if c.is_whitespace() {
                self.bump();
            } else if self.starts_with("//") {
                while self.peek().is_some_and(|c| c != '\n') {
                    self.bump();
                }
            } else if self.starts_with("/*") {
                let start = self.line;
                self.pos += 2;
                loop {
                    if self.starts_with("*/") {
                        self.pos += 2;
                        break;
                    }
                    match self.bump() {
                        Some('\n') => newline = true,
                        Some(_) => {}
                        None => {
                            return Err(ScriptError::Syntax {
                                message: "Unterminated comment".to_string(),
                                line: start,
                            })
                        }
                    }
                }
            } else {
                break;
            }
        }
        Ok(newline)
    }

    fn number(&mut self) -> Result<Token, ScriptError> {
        if self.peek() == Some('0') {
            let radix = match self.peek_at(1) {
                Some('x' | 'X') => Some(16),
                Some('b' | 'B') => Some(2),
                Some('o' | 'O') => Some(8),
                _ => None,
            };
            if let Some(radix) = radix {
                self.pos += 2;
                let start = self.pos;
                while self.peek().is_some_and(|c| c.is_digit(radix) || c == '_') {
                    self.pos += 1;
                }
                let digits: String = self.chars[start..self.pos]
                    .iter()
                    .filter(|c| **c != '_')
                    .collect();
                let value = u64::from_str_radix(&digits, radix)
                    .map_err(|_| self.error("Invalid number literal"))?;
                return Ok(Token::Number(value as f64));
            }
        }

        let start = self.pos;
        while self.peek().is_some_and(|c| c.is_ascii_digit() || c == '_') {
            self.pos += 1;
        }
        if self.peek() == Some('.') {
            self.pos += 1;
            while self.peek().is_some_and(|c| c.is_ascii_digit() || c == '_') {
                self.pos += 1;
            }
        }
        if matches!(self.peek(), Some('e' | 'E')) {
            let sign = usize::from(matches!(self.peek_at(1), Some('+' | '-')));
            if self.peek_at(1 + sign).is_some_and(|c| c.is_ascii_digit()) {
                self.pos += 1 + sign;
                while self.peek().is_some_and(|c| c.is_ascii_digit()) {
                    self.pos += 1;
                }
            }
        }
        if self.peek().is_some_and(is_ident_start) {
            return Err(self.error("Invalid or unexpected token"));
        }

        let text: String = self.chars[start..self.pos]
            .iter()
            .filter(|c| **c != '_')
            .collect();
        text.parse::<f64>()
            .map(Token::Number)
            .map_err(|_| self.error(format!("Invalid number literal '{}'", text)))
    }

    fn escape(&mut self) -> Result<Option<char>, ScriptError> {
        let Some(c) = self.bump() else {
            return Err(self.error("Invalid or unexpected token"));
        };
        let decoded = match c {
            'n' => '\n',
            't' => '\t',
            'r' => '\r',
            'b' => '\u{8}',
            'f' => '\u{c}',
            'v' => '\u{b}',
            '0' if !self.peek().is_some_and(|d| d.is_ascii_digit()) => '\0',
            'x' => self.hex_escape(2)?,
            'u' if self.peek() == Some('{') => {
                self.bump();
                let start = self.pos;
                while self.peek().is_some_and(|c| c != '}') {
                    self.pos += 1;
                }
                let digits: String = self.chars[start..self.pos].iter().collect();
                self.bump();
                code_point(&digits).ok_or_else(|| self.error("Invalid Unicode escape sequence"))?
            }
            'u' => self.hex_escape(4)?,
            '\r' => {
                if self.peek() == Some('\n') {
                    self.bump();
                }
                return Ok(None);
            }
            '\n' | '\u{2028}' | '\u{2029}' => return Ok(None),
            other => other,
        };
        Ok(Some(decoded))
    }

    fn hex_escape(&mut self, len: usize) -> Result<char, ScriptError> {
        let end = (self.pos + len).min(self.chars.len());
        let digits: String = self.chars[self.pos..end].iter().collect();
        self.pos = end;
        if digits.len() != len {
            return Err(self.error("Invalid hexadecimal escape sequence"));
        }
        // Lone surrogates become U+FFFD.
        code_point(&digits)
            .or_else(|| u32::from_str_radix(&digits, 16).ok().map(|_| '\u{fffd}'))
            .ok_or_else(|| self.error("Invalid hexadecimal escape sequence"))
    }

    fn string(&mut self, quote: char) -> Result<Token, ScriptError> {
        self.bump();
        let mut value = String::new();
        loop {
            match self.bump() {
                Some(c) if c == quote => return Ok(Token::Str(value)),
                Some('\\') => {
                    if let Some(c) = self.escape()? {
                        value.push(c);
                    }
                }
                Some('\n') | None => return Err(self.error("Invalid or unexpected token")),
                Some(c) => value.push(c),
            }
        }
    }

    fn template(&mut self) -> Result<Token, ScriptError> {
        self.bump();
        let mut quasis = Vec::new();
        let mut holes = Vec::new();
        let mut current = String::new();
        loop {
            match self.bump() {
                Some('`') => {
                    quasis.push(current);
                    return Ok(Token::Template { quasis, holes });
                }
                Some('\\') => {
                    if let Some(c) = self.escape()? {
                        current.push(c);
                    }
                }
                Some('$') if self.peek() == Some('{') => {
                    self.bump();
                    quasis.push(std::mem::take(&mut current));
                    holes.push(self.template_hole()?);
                }
                Some(c) => current.push(c),
                None => return Err(self.error("Unterminated template literal")),
            }
        }
    }

    /// Raw source of a `${ ... }` hole, up to its matching brace.
    fn template_hole(&mut self) -> Result<String, ScriptError> {
        let start = self.pos;
        let mut depth = 0usize;
        loop {
            match self.peek() {
                None => return Err(self.error("Unterminated template literal")),
                Some('}') if depth == 0 => {
                    let hole = self.slice(start, self.pos);
                    self.bump();
                    return Ok(hole);
                }
                Some('}') => {
                    depth -= 1;
                    self.bump();
                }
                Some('{') => {
                    depth += 1;
                    self.bump();
                }
                Some(q @ ('"' | '\'')) => {
                    self.string(q)?;
                }
                Some('`') => {
                    self.template()?;
                }
                Some(_) => {
                    self.bump();
                }
            }
        }
    }

    fn slice(&self, start: usize, end: usize) -> String {
        self.chars[start..end].iter().collect()
    }

    fn ident(&mut self) -> Token {
        let start = self.pos;
        while self.peek().is_some_and(is_ident_part) {
            self.pos += 1;
        }
        Token::Ident(self.slice(start, self.pos))
    }

    fn punct(&mut self) -> Result<Token, ScriptError> {
        for p in PUNCTUATORS {
            if self.starts_with(p) {
                // `a?.5:b` is a conditional, not optional chaining.
                if *p == "?." && self.peek_at(2).is_some_and(|c| c.is_ascii_digit()) {
                    continue;
                }
                self.pos += p.chars().count();
                return Ok(Token::Punct(p));
            }
        }
        let c = self.peek().unwrap_or_default();
        Err(self.error(format!("Invalid or unexpected token '{}'", c)))
    }
}

fn code_point(hex: &str) -> Option<char> {
    u32::from_str_radix(hex, 16).ok().and_then(char::from_u32)
}

fn is_ident_start(c: char) -> bool {
    c.is_alphabetic() || c == '_' || c == '$'
}

fn is_ident_part(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '$'
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(source: &str) -> Vec<Token> {
        tokenize(source).unwrap().into_iter().map(|t| t.token).collect()
    }

    #[test]
    fn longest_punctuator_wins() {
        assert_eq!(
            tokens("a >>>= b === c"),
            vec![
                Token::Ident("a".into()),
                Token::Punct(">>>="),
                Token::Ident("b".into()),
                Token::Punct("==="),
                Token::Ident("c".into()),
                Token::Eof,
            ]
        );
    }

    #[test]
    fn numbers_and_strings() {
        assert_eq!(
            tokens("0x1F 1_000 .5 2e3 'a\\nb'"),
            vec![
                Token::Number(31.0),
                Token::Number(1000.0),
                Token::Number(0.5),
                Token::Number(2000.0),
                Token::Str("a\nb".into()),
                Token::Eof,
            ]
        );
    }

    #[test]
    fn template_holes_keep_source() {
        assert_eq!(
            tokens("`x=${ {a:1}.a } y=${`n${1}`}`"),
            vec![
                Token::Template {
                    quasis: vec!["x=".into(), " y=".into(), "".into()],
                    holes: vec![" {a:1}.a ".into(), "`n${1}`".into()],
                },
                Token::Eof,
            ]
        );
    }

    #[test]
    fn tracks_line_breaks() {
        let spanned = tokenize("a // note\n/* x\n */ b").unwrap();
        assert!(!spanned[0].newline_before);
        assert!(spanned[1].newline_before);
        assert_eq!(spanned[1].line, 3);
    }

    #[test]
    fn rejects_unterminated_string() {
        assert!(matches!(tokenize("'abc"), Err(ScriptError::Syntax { .. })));
    }
}

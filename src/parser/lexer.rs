use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Keyword {
    All,
    And,
    Any,
    As,
    Asc,
    Between,
    By,
    Case,
    Cast,
    Coalesce,
    Create,
    Cross,
    Deallocate,
    Delete,
    Desc,
    Distinct,
    Drop,
    Else,
    End,
    Except,
    Execute,
    Exists,
    False,
    First,
    From,
    Full,
    Group,
    Having,
    If,
    ILike,
    In,
    Inner,
    Insert,
    Intersect,
    Into,
    Is,
    Join,
    Last,
    Left,
    Like,
    Limit,
    Not,
    Null,
    Nulls,
    Offset,
    On,
    Or,
    Order,
    Outer,
    Prepare,
    Right,
    Select,
    Set,
    Table,
    Then,
    True,
    Union,
    Update,
    Values,
    When,
    Where,
}

impl Keyword {
    fn from_ident(ident: &str) -> Option<Self> {
        match ident {
            "all" => Some(Self::All),
            "and" => Some(Self::And),
            "any" => Some(Self::Any),
            "as" => Some(Self::As),
            "asc" => Some(Self::Asc),
            "between" => Some(Self::Between),
            "by" => Some(Self::By),
            "case" => Some(Self::Case),
            "cast" => Some(Self::Cast),
            "coalesce" => Some(Self::Coalesce),
            "create" => Some(Self::Create),
            "cross" => Some(Self::Cross),
            "deallocate" => Some(Self::Deallocate),
            "delete" => Some(Self::Delete),
            "desc" => Some(Self::Desc),
            "distinct" => Some(Self::Distinct),
            "drop" => Some(Self::Drop),
            "else" => Some(Self::Else),
            "end" => Some(Self::End),
            "except" => Some(Self::Except),
            "execute" => Some(Self::Execute),
            "exists" => Some(Self::Exists),
            "false" => Some(Self::False),
            "first" => Some(Self::First),
            "from" => Some(Self::From),
            "full" => Some(Self::Full),
            "group" => Some(Self::Group),
            "having" => Some(Self::Having),
            "if" => Some(Self::If),
            "ilike" => Some(Self::ILike),
            "in" => Some(Self::In),
            "inner" => Some(Self::Inner),
            "insert" => Some(Self::Insert),
            "intersect" => Some(Self::Intersect),
            "into" => Some(Self::Into),
            "is" => Some(Self::Is),
            "join" => Some(Self::Join),
            "last" => Some(Self::Last),
            "left" => Some(Self::Left),
            "like" => Some(Self::Like),
            "limit" => Some(Self::Limit),
            "not" => Some(Self::Not),
            "null" => Some(Self::Null),
            "nulls" => Some(Self::Nulls),
            "offset" => Some(Self::Offset),
            "on" => Some(Self::On),
            "or" => Some(Self::Or),
            "order" => Some(Self::Order),
            "outer" => Some(Self::Outer),
            "prepare" => Some(Self::Prepare),
            "right" => Some(Self::Right),
            "select" => Some(Self::Select),
            "set" => Some(Self::Set),
            "table" => Some(Self::Table),
            "then" => Some(Self::Then),
            "true" => Some(Self::True),
            "union" => Some(Self::Union),
            "update" => Some(Self::Update),
            "values" => Some(Self::Values),
            "when" => Some(Self::When),
            "where" => Some(Self::Where),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Eof,
    Keyword(Keyword),
    /// Unquoted identifiers are lowercased; quoted identifiers keep their
    /// case with the quotes stripped.
    Identifier(String),
    String(String),
    Integer(i64),
    Float(String),
    Parameter(i32),
    Comma,
    LParen,
    RParen,
    Dot,
    Semicolon,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Less,
    Greater,
    Equal,
    Typecast,
    LessEquals,
    GreaterEquals,
    NotEquals,
    Operator(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub start: usize,
    pub end: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LexError {
    pub message: String,
    pub position: usize,
}

impl fmt::Display for LexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at byte {}", self.message, self.position)
    }
}

impl std::error::Error for LexError {}

pub fn lex_sql(input: &str) -> Result<Vec<Token>, LexError> {
    Lexer::new(input).lex_all()
}

struct Lexer<'a> {
    input: &'a [u8],
    idx: usize,
}

impl<'a> Lexer<'a> {
    fn new(input: &'a str) -> Self {
        Self {
            input: input.as_bytes(),
            idx: 0,
        }
    }

    fn lex_all(mut self) -> Result<Vec<Token>, LexError> {
        let mut tokens = Vec::new();
        loop {
            self.skip_whitespace_and_comments()?;
            let start = self.idx;
            let Some(byte) = self.peek() else {
                tokens.push(Token {
                    kind: TokenKind::Eof,
                    start,
                    end: start,
                });
                return Ok(tokens);
            };
            let kind = self.lex_token(byte)?;
            tokens.push(Token {
                kind,
                start,
                end: self.idx,
            });
        }
    }

    fn lex_token(&mut self, byte: u8) -> Result<TokenKind, LexError> {
        match byte {
            b'\'' => self.lex_string(),
            b'"' => self.lex_quoted_identifier(),
            b'0'..=b'9' => self.lex_number(),
            b'.' if self.peek_at(1).is_some_and(|b| b.is_ascii_digit()) => self.lex_number(),
            b'$' => self.lex_parameter(),
            b'a'..=b'z' | b'A'..=b'Z' | b'_' => Ok(self.lex_identifier()),
            _ => self.lex_symbol(byte),
        }
    }

    fn lex_symbol(&mut self, byte: u8) -> Result<TokenKind, LexError> {
        self.idx += 1;
        let kind = match byte {
            b',' => TokenKind::Comma,
            b'(' => TokenKind::LParen,
            b')' => TokenKind::RParen,
            b'.' => TokenKind::Dot,
            b';' => TokenKind::Semicolon,
            b'+' => TokenKind::Plus,
            b'-' => TokenKind::Minus,
            b'*' => TokenKind::Star,
            b'/' => TokenKind::Slash,
            b'%' => TokenKind::Percent,
            b'=' => TokenKind::Equal,
            b'<' => match self.peek() {
                Some(b'=') => {
                    self.idx += 1;
                    TokenKind::LessEquals
                }
                Some(b'>') => {
                    self.idx += 1;
                    TokenKind::NotEquals
                }
                _ => TokenKind::Less,
            },
            b'>' => {
                if self.peek() == Some(b'=') {
                    self.idx += 1;
                    TokenKind::GreaterEquals
                } else {
                    TokenKind::Greater
                }
            }
            b'!' => {
                if self.peek() == Some(b'=') {
                    self.idx += 1;
                    TokenKind::NotEquals
                } else if self.peek() == Some(b'~') {
                    // !~~ and !~~* (NOT LIKE / NOT ILIKE in operator form)
                    let mut op = String::from("!");
                    while matches!(self.peek(), Some(b'~') | Some(b'*')) {
                        op.push(self.peek().expect("peeked") as char);
                        self.idx += 1;
                    }
                    TokenKind::Operator(op)
                } else {
                    return Err(self.error("unexpected character '!'"));
                }
            }
            b':' => {
                if self.peek() == Some(b':') {
                    self.idx += 1;
                    TokenKind::Typecast
                } else {
                    return Err(self.error("unexpected character ':'"));
                }
            }
            b'|' => {
                if self.peek() == Some(b'|') {
                    self.idx += 1;
                    TokenKind::Operator("||".to_string())
                } else {
                    return Err(self.error("unexpected character '|'"));
                }
            }
            b'~' => {
                let mut op = String::from("~");
                while matches!(self.peek(), Some(b'~') | Some(b'*')) {
                    op.push(self.peek().expect("peeked") as char);
                    self.idx += 1;
                }
                TokenKind::Operator(op)
            }
            other => {
                return Err(self.error(&format!("unexpected character '{}'", other as char)));
            }
        };
        Ok(kind)
    }

    fn lex_string(&mut self) -> Result<TokenKind, LexError> {
        // Opening quote already peeked.
        self.idx += 1;
        let mut value = String::new();
        loop {
            match self.peek() {
                None => return Err(self.error("unterminated string literal")),
                Some(b'\'') => {
                    if self.peek_at(1) == Some(b'\'') {
                        value.push('\'');
                        self.idx += 2;
                    } else {
                        self.idx += 1;
                        return Ok(TokenKind::String(value));
                    }
                }
                Some(_) => {
                    let ch = self.next_char()?;
                    value.push(ch);
                }
            }
        }
    }

    fn lex_quoted_identifier(&mut self) -> Result<TokenKind, LexError> {
        self.idx += 1;
        let mut value = String::new();
        loop {
            match self.peek() {
                None => return Err(self.error("unterminated quoted identifier")),
                Some(b'"') => {
                    if self.peek_at(1) == Some(b'"') {
                        value.push('"');
                        self.idx += 2;
                    } else {
                        self.idx += 1;
                        return Ok(TokenKind::Identifier(value));
                    }
                }
                Some(_) => {
                    let ch = self.next_char()?;
                    value.push(ch);
                }
            }
        }
    }

    fn lex_number(&mut self) -> Result<TokenKind, LexError> {
        let start = self.idx;
        let mut saw_dot = false;
        let mut saw_exp = false;
        while let Some(byte) = self.peek() {
            match byte {
                b'0'..=b'9' => self.idx += 1,
                b'.' if !saw_dot && !saw_exp => {
                    // Leave `1..2` style ranges alone (not valid here anyway).
                    saw_dot = true;
                    self.idx += 1;
                }
                b'e' | b'E' if !saw_exp => {
                    saw_exp = true;
                    self.idx += 1;
                    if matches!(self.peek(), Some(b'+') | Some(b'-')) {
                        self.idx += 1;
                    }
                }
                _ => break,
            }
        }
        let text = std::str::from_utf8(&self.input[start..self.idx])
            .expect("number bytes are ascii")
            .to_string();
        if !saw_dot && !saw_exp {
            match text.parse::<i64>() {
                Ok(value) => Ok(TokenKind::Integer(value)),
                Err(_) => Ok(TokenKind::Float(text)),
            }
        } else {
            Ok(TokenKind::Float(text))
        }
    }

    fn lex_parameter(&mut self) -> Result<TokenKind, LexError> {
        self.idx += 1;
        let start = self.idx;
        while self.peek().is_some_and(|b| b.is_ascii_digit()) {
            self.idx += 1;
        }
        if start == self.idx {
            return Err(self.error("expected digits after '$'"));
        }
        let text = std::str::from_utf8(&self.input[start..self.idx]).expect("digits are ascii");
        let value: i32 = text
            .parse()
            .map_err(|_| self.error("parameter number is out of range"))?;
        Ok(TokenKind::Parameter(value))
    }

    fn lex_identifier(&mut self) -> TokenKind {
        let start = self.idx;
        while self
            .peek()
            .is_some_and(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'$')
        {
            self.idx += 1;
        }
        let text = std::str::from_utf8(&self.input[start..self.idx])
            .expect("identifier bytes are ascii")
            .to_ascii_lowercase();
        match Keyword::from_ident(&text) {
            Some(keyword) => TokenKind::Keyword(keyword),
            None => TokenKind::Identifier(text),
        }
    }

    fn skip_whitespace_and_comments(&mut self) -> Result<(), LexError> {
        loop {
            match self.peek() {
                Some(b) if b.is_ascii_whitespace() => self.idx += 1,
                Some(b'-') if self.peek_at(1) == Some(b'-') => {
                    while self.peek().is_some_and(|b| b != b'\n') {
                        self.idx += 1;
                    }
                }
                Some(b'/') if self.peek_at(1) == Some(b'*') => {
                    let start = self.idx;
                    self.idx += 2;
                    loop {
                        match self.peek() {
                            None => {
                                return Err(LexError {
                                    message: "unterminated block comment".to_string(),
                                    position: start,
                                });
                            }
                            Some(b'*') if self.peek_at(1) == Some(b'/') => {
                                self.idx += 2;
                                break;
                            }
                            Some(_) => self.idx += 1,
                        }
                    }
                }
                _ => return Ok(()),
            }
        }
    }

    fn next_char(&mut self) -> Result<char, LexError> {
        let rest = std::str::from_utf8(&self.input[self.idx..])
            .map_err(|_| self.error("input is not valid utf8"))?;
        let ch = rest.chars().next().ok_or_else(|| self.error("unexpected end of input"))?;
        self.idx += ch.len_utf8();
        Ok(ch)
    }

    fn peek(&self) -> Option<u8> {
        self.input.get(self.idx).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<u8> {
        self.input.get(self.idx + offset).copied()
    }

    fn error(&self, message: &str) -> LexError {
        LexError {
            message: message.to_string(),
            position: self.idx,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(sql: &str) -> Vec<TokenKind> {
        lex_sql(sql)
            .expect("lex should succeed")
            .into_iter()
            .map(|t| t.kind)
            .collect()
    }

    #[test]
    fn lexes_keywords_and_identifiers() {
        assert_eq!(
            kinds("SELECT Name FROM Users"),
            vec![
                TokenKind::Keyword(Keyword::Select),
                TokenKind::Identifier("name".to_string()),
                TokenKind::Keyword(Keyword::From),
                TokenKind::Identifier("users".to_string()),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn quoted_identifiers_keep_case() {
        assert_eq!(
            kinds("\"MixedCase\""),
            vec![
                TokenKind::Identifier("MixedCase".to_string()),
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn strings_support_doubled_quotes() {
        assert_eq!(
            kinds("'it''s'"),
            vec![TokenKind::String("it's".to_string()), TokenKind::Eof]
        );
    }

    #[test]
    fn numbers_and_parameters() {
        assert_eq!(
            kinds("42 4.5 1e3 $2"),
            vec![
                TokenKind::Integer(42),
                TokenKind::Float("4.5".to_string()),
                TokenKind::Float("1e3".to_string()),
                TokenKind::Parameter(2),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn comments_are_skipped() {
        assert_eq!(
            kinds("1 -- trailing\n/* block\n*/ 2"),
            vec![TokenKind::Integer(1), TokenKind::Integer(2), TokenKind::Eof]
        );
    }

    #[test]
    fn multi_byte_operators() {
        assert_eq!(
            kinds("<> != <= >= :: ||"),
            vec![
                TokenKind::NotEquals,
                TokenKind::NotEquals,
                TokenKind::LessEquals,
                TokenKind::GreaterEquals,
                TokenKind::Typecast,
                TokenKind::Operator("||".to_string()),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn unterminated_string_is_an_error() {
        assert!(lex_sql("'oops").is_err());
    }
}

//! SQL tokenizer for the DDL subset the differ needs.
//!
//! Works on chars, not bytes: backticked identifiers may contain arbitrary
//! non-ASCII. Version-gated comments (`/*!50100 … */`) are lexed as if the
//! wrapper were absent.

use common::err::osc_error::OscError;
use common::err::OResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    /// Bare word: keyword, identifier, function name.
    Word,
    /// 反引号标识符, 内容已去掉引号并还原 `` 转义
    QuotedIdent,
    /// Quoted string, content unescaped.
    Str,
    Number,
    Symbol,
}

#[derive(Debug, Clone)]
pub struct Token {
    pub kind: TokenKind,
    pub text: String,
    pub line: usize,
    pub col: usize,
}

impl Token {
    /// Case-insensitive keyword match; never matches quoted identifiers.
    pub fn is_word(&self, word: &str) -> bool {
        self.kind == TokenKind::Word && self.text.eq_ignore_ascii_case(word)
    }

    pub fn is_symbol(&self, ch: char) -> bool {
        self.kind == TokenKind::Symbol && self.text.len() == ch.len_utf8() && self.text.starts_with(ch)
    }
}

struct Lexer {
    chars: Vec<char>,
    pos: usize,
    line: usize,
    col: usize,
    /// 当前处于多少层 /*! ... */ 包装之内
    versioned_depth: usize,
}

pub fn tokenize(input: &str) -> OResult<Vec<Token>> {
    let mut lexer = Lexer {
        chars: input.chars().collect(),
        pos: 0,
        line: 1,
        col: 1,
        versioned_depth: 0,
    };
    lexer.run()
}

impl Lexer {
    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let ch = self.chars.get(self.pos).copied()?;
        self.pos += 1;
        if ch == '\n' {
            self.line += 1;
            self.col = 1;
        } else {
            self.col += 1;
        }
        Some(ch)
    }

    fn error(&self, msg: &str) -> OscError {
        OscError::Parse {
            line: self.line,
            column: self.col,
            msg: msg.to_string(),
        }
    }

    fn run(&mut self) -> OResult<Vec<Token>> {
        let mut tokens = Vec::new();

        while let Some(ch) = self.peek() {
            if ch.is_whitespace() {
                self.bump();
                continue;
            }

            // line comments
            if ch == '#' || (ch == '-' && self.peek_at(1) == Some('-')) {
                while let Some(c) = self.peek() {
                    if c == '\n' {
                        break;
                    }
                    self.bump();
                }
                continue;
            }

            // block comment / version gate
            if ch == '/' && self.peek_at(1) == Some('*') {
                if self.peek_at(2) == Some('!') {
                    // /*!50100 → 脱掉包装, 内部当作正常 SQL
                    self.bump();
                    self.bump();
                    self.bump();
                    while matches!(self.peek(), Some(c) if c.is_ascii_digit()) {
                        self.bump();
                    }
                    self.versioned_depth += 1;
                    continue;
                }
                self.bump();
                self.bump();
                loop {
                    match self.peek() {
                        None => return Err(self.error("unterminated comment")),
                        Some('*') if self.peek_at(1) == Some('/') => {
                            self.bump();
                            self.bump();
                            break;
                        }
                        _ => {
                            self.bump();
                        }
                    }
                }
                continue;
            }

            // closing of a version gate
            if ch == '*' && self.peek_at(1) == Some('/') && self.versioned_depth > 0 {
                self.versioned_depth -= 1;
                self.bump();
                self.bump();
                continue;
            }

            let line = self.line;
            let col = self.col;

            if ch == '`' {
                let text = self.lex_quoted_ident()?;
                tokens.push(Token {
                    kind: TokenKind::QuotedIdent,
                    text,
                    line,
                    col,
                });
                continue;
            }

            if ch == '\'' || ch == '"' {
                let text = self.lex_string(ch)?;
                tokens.push(Token {
                    kind: TokenKind::Str,
                    text,
                    line,
                    col,
                });
                continue;
            }

            if ch.is_ascii_digit() {
                let mut text = String::new();
                while let Some(c) = self.peek() {
                    if c.is_ascii_digit() || c == '.' {
                        text.push(c);
                        self.bump();
                    } else {
                        break;
                    }
                }
                tokens.push(Token {
                    kind: TokenKind::Number,
                    text,
                    line,
                    col,
                });
                continue;
            }

            if ch.is_alphanumeric() || ch == '_' || ch == '$' {
                let mut text = String::new();
                while let Some(c) = self.peek() {
                    if c.is_alphanumeric() || c == '_' || c == '$' {
                        text.push(c);
                        self.bump();
                    } else {
                        break;
                    }
                }
                tokens.push(Token {
                    kind: TokenKind::Word,
                    text,
                    line,
                    col,
                });
                continue;
            }

            self.bump();
            tokens.push(Token {
                kind: TokenKind::Symbol,
                text: ch.to_string(),
                line,
                col,
            });
        }

        Ok(tokens)
    }

    fn lex_quoted_ident(&mut self) -> OResult<String> {
        self.bump(); // opening backtick
        let mut text = String::new();
        loop {
            match self.peek() {
                None => return Err(self.error("unterminated quoted identifier")),
                Some('`') => {
                    self.bump();
                    if self.peek() == Some('`') {
                        // `` 转义为一个反引号
                        text.push('`');
                        self.bump();
                    } else {
                        return Ok(text);
                    }
                }
                Some(c) => {
                    text.push(c);
                    self.bump();
                }
            }
        }
    }

    fn lex_string(&mut self, quote: char) -> OResult<String> {
        self.bump(); // opening quote
        let mut text = String::new();
        loop {
            match self.peek() {
                None => return Err(self.error("unterminated string literal")),
                Some('\\') => {
                    self.bump();
                    match self.bump() {
                        None => return Err(self.error("unterminated string literal")),
                        Some('n') => text.push('\n'),
                        Some('t') => text.push('\t'),
                        Some('r') => text.push('\r'),
                        Some('0') => text.push('\0'),
                        Some(c) => text.push(c),
                    }
                }
                Some(c) if c == quote => {
                    self.bump();
                    if self.peek() == Some(quote) {
                        text.push(quote);
                        self.bump();
                    } else {
                        return Ok(text);
                    }
                }
                Some(c) => {
                    text.push(c);
                    self.bump();
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::{tokenize, TokenKind};

    #[test]
    fn test_words_and_symbols() {
        let tokens = tokenize("CREATE TABLE t1 (id INT);").unwrap();
        assert!(tokens[0].is_word("create"));
        assert!(tokens[1].is_word("TABLE"));
        assert!(tokens[3].is_symbol('('));
        assert!(tokens.last().unwrap().is_symbol(';'));
    }

    #[test]
    fn test_backtick_ident_with_unicode_and_escape() {
        let tokens = tokenize("`(╯°□°）╯︵ ┻━┻` `a``b`").unwrap();
        assert_eq!(tokens[0].kind, TokenKind::QuotedIdent);
        assert_eq!(tokens[0].text, "(╯°□°）╯︵ ┻━┻");
        assert_eq!(tokens[1].text, "a`b");
    }

    #[test]
    fn test_version_gated_comment_unwrapped() {
        let tokens =
            tokenize("/*!50100 PARTITION BY HASH (id) PARTITIONS 2 */").unwrap();
        assert!(tokens[0].is_word("partition"));
        assert!(tokens[1].is_word("by"));
        assert_eq!(tokens.last().unwrap().text, "2");
    }

    #[test]
    fn test_comments_skipped() {
        let tokens = tokenize("a -- trailing\n# hash\n/* block */ b").unwrap();
        assert_eq!(tokens.len(), 2);
        assert!(tokens[1].is_word("b"));
        assert_eq!(tokens[1].line, 3);
    }

    #[test]
    fn test_string_escapes() {
        let tokens = tokenize(r#"'it''s' "a\nb""#).unwrap();
        assert_eq!(tokens[0].text, "it's");
        assert_eq!(tokens[1].text, "a\nb");
    }

    #[test]
    fn test_unterminated_ident_errors() {
        let err = tokenize("`oops").unwrap_err();
        assert_eq!(err.exit_code(), 1);
    }
}

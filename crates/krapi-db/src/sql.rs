//! Minimal SQL lexer.
//!
//! Splits a statement into words, positional placeholders and punctuation so
//! that placeholder rewriting and table-name routing can skip over string
//! literals, quoted identifiers and comments. This is not a parser: nesting
//! and statement structure are never interpreted.

use std::ops::Range;

/// The kind of a lexed token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind<'a> {
    /// A bare or quoted identifier, keyword or number. Quotes are stripped.
    Word(&'a str),
    /// A `$<n>` placeholder. `None` when the digits do not fit in a `usize`.
    Placeholder(Option<usize>),
    /// A single-quoted string literal, quotes included.
    Literal(&'a str),
    /// Any other single character.
    Symbol(char),
}

/// A token and its byte span in the source statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token<'a> {
    /// What was lexed.
    pub kind: TokenKind<'a>,
    /// Byte range of the token in the source text.
    pub span: Range<usize>,
}

impl Token<'_> {
    /// Returns `true` if this token is the word `keyword` (case-insensitive).
    pub fn is_keyword(&self, keyword: &str) -> bool {
        matches!(self.kind, TokenKind::Word(w) if w.eq_ignore_ascii_case(keyword))
    }
}

/// Iterator over the tokens of a SQL statement.
pub struct Lexer<'a> {
    src: &'a str,
    pos: usize,
}

impl<'a> Lexer<'a> {
    /// Creates a lexer over `src`.
    pub fn new(src: &'a str) -> Self {
        Self { src, pos: 0 }
    }

    fn peek_byte(&self, offset: usize) -> Option<u8> {
        self.src.as_bytes().get(self.pos + offset).copied()
    }

    fn skip_trivia(&mut self) {
        loop {
            match (self.peek_byte(0), self.peek_byte(1)) {
                (Some(b), _) if b.is_ascii_whitespace() => self.pos += 1,
                (Some(b'-'), Some(b'-')) => {
                    self.pos = match self.src[self.pos..].find('\n') {
                        Some(nl) => self.pos + nl + 1,
                        None => self.src.len(),
                    };
                }
                (Some(b'/'), Some(b'*')) => {
                    self.pos = match self.src[self.pos + 2..].find("*/") {
                        Some(end) => self.pos + 2 + end + 2,
                        None => self.src.len(),
                    };
                }
                _ => return,
            }
        }
    }

    /// Consumes a delimited run starting at the current opening delimiter and
    /// returns the index just past the closing one. A doubled closing
    /// delimiter is an escape.
    fn delimited_end(&self, close: u8) -> usize {
        let bytes = self.src.as_bytes();
        let mut i = self.pos + 1;
        while i < bytes.len() {
            if bytes[i] == close {
                if bytes.get(i + 1) == Some(&close) && close != b']' {
                    i += 2;
                    continue;
                }
                return i + 1;
            }
            i += 1;
        }
        bytes.len()
    }
}

fn is_word_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b >= 0x80
}

impl<'a> Iterator for Lexer<'a> {
    type Item = Token<'a>;

    fn next(&mut self) -> Option<Token<'a>> {
        self.skip_trivia();
        let start = self.pos;
        let first = self.peek_byte(0)?;

        let kind = match first {
            b'\'' => {
                self.pos = self.delimited_end(b'\'');
                TokenKind::Literal(&self.src[start..self.pos])
            }
            b'"' | b'`' | b'[' => {
                let close = match first {
                    b'[' => b']',
                    other => other,
                };
                self.pos = self.delimited_end(close);
                let inner_end = if self.pos > start + 1 && self.src.as_bytes()[self.pos - 1] == close
                {
                    self.pos - 1
                } else {
                    self.pos
                };
                TokenKind::Word(&self.src[start + 1..inner_end])
            }
            b'$' if self.peek_byte(1).is_some_and(|b| b.is_ascii_digit()) => {
                let mut end = start + 1;
                let bytes = self.src.as_bytes();
                while end < bytes.len() && bytes[end].is_ascii_digit() {
                    end += 1;
                }
                self.pos = end;
                TokenKind::Placeholder(self.src[start + 1..end].parse().ok())
            }
            b if is_word_byte(b) => {
                let bytes = self.src.as_bytes();
                let mut end = start;
                while end < bytes.len() && is_word_byte(bytes[end]) {
                    end += 1;
                }
                self.pos = end;
                TokenKind::Word(&self.src[start..end])
            }
            _ => {
                let ch = self.src[start..].chars().next()?;
                self.pos += ch.len_utf8();
                TokenKind::Symbol(ch)
            }
        };

        Some(Token {
            kind,
            span: start..self.pos,
        })
    }
}

/// Returns the first keyword of a statement, skipping leading comments and
/// parentheses.
pub fn leading_keyword(sql: &str) -> Option<&str> {
    Lexer::new(sql).find_map(|token| match token.kind {
        TokenKind::Word(w) => Some(w),
        _ => None,
    })
}

/// Returns `true` if the statement yields a result set: it starts with a
/// read keyword or carries a `RETURNING` clause.
pub fn is_read_statement(sql: &str) -> bool {
    const READ_KEYWORDS: &[&str] = &["SELECT", "WITH", "PRAGMA", "EXPLAIN", "VALUES"];

    let starts_with_read = leading_keyword(sql)
        .is_some_and(|kw| READ_KEYWORDS.iter().any(|r| kw.eq_ignore_ascii_case(r)));

    starts_with_read || Lexer::new(sql).any(|t| t.is_keyword("RETURNING"))
}

/// Splits a script into individual statements on top-level `;`.
///
/// Semicolons inside literals, quoted identifiers and comments do not split.
/// Empty statements are dropped and each statement is trimmed.
pub fn split_statements(script: &str) -> Vec<&str> {
    let mut statements = Vec::new();
    let mut start = 0;
    for token in Lexer::new(script) {
        if token.kind == TokenKind::Symbol(';') {
            statements.push(&script[start..token.span.start]);
            start = token.span.end;
        }
    }
    statements.push(&script[start..]);

    statements
        .into_iter()
        .map(str::trim)
        .filter(|s| Lexer::new(s).next().is_some())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(sql: &str) -> Vec<TokenKind<'_>> {
        Lexer::new(sql).map(|t| t.kind).collect()
    }

    #[test]
    fn lexes_words_placeholders_and_symbols() {
        assert_eq!(
            kinds("SELECT * FROM t WHERE id = $12"),
            vec![
                TokenKind::Word("SELECT"),
                TokenKind::Symbol('*'),
                TokenKind::Word("FROM"),
                TokenKind::Word("t"),
                TokenKind::Word("WHERE"),
                TokenKind::Word("id"),
                TokenKind::Symbol('='),
                TokenKind::Placeholder(Some(12)),
            ]
        );
    }

    #[test]
    fn placeholders_inside_literals_and_comments_are_ignored() {
        let sql = "SELECT '$1 it''s' -- $2\n, /* $3 */ $4";
        let placeholders: Vec<_> = kinds(sql)
            .into_iter()
            .filter(|k| matches!(k, TokenKind::Placeholder(_)))
            .collect();
        assert_eq!(placeholders, vec![TokenKind::Placeholder(Some(4))]);
    }

    #[test]
    fn quoted_identifiers_are_unwrapped() {
        assert_eq!(
            kinds(r#""documents" `files` [folders]"#),
            vec![
                TokenKind::Word("documents"),
                TokenKind::Word("files"),
                TokenKind::Word("folders"),
            ]
        );
    }

    #[test]
    fn spans_cover_source_text() {
        let sql = "a = $3";
        let token = Lexer::new(sql).last().expect("should lex placeholder");
        assert_eq!(&sql[token.span], "$3");
    }

    #[test]
    fn splits_scripts_on_top_level_semicolons() {
        let script = "-- header\nCREATE TABLE a (x TEXT DEFAULT ';');\n\n/* trailing */\nCREATE TABLE b (y);\n-- done\n";
        let statements = split_statements(script);
        assert_eq!(statements.len(), 2);
        assert!(statements[0].ends_with("DEFAULT ';')"));
        assert_eq!(statements[1], "/* trailing */\nCREATE TABLE b (y)");
    }

    #[test]
    fn read_statement_detection() {
        assert!(is_read_statement("  select 1"));
        assert!(is_read_statement("/* hint */ WITH x AS (SELECT 1) SELECT * FROM x"));
        assert!(is_read_statement("PRAGMA table_info(documents)"));
        assert!(is_read_statement(
            "INSERT INTO documents (id) VALUES ($1) RETURNING id"
        ));
        assert!(!is_read_statement("UPDATE documents SET data = $1"));
        assert!(!is_read_statement("DELETE FROM files WHERE id = $1"));
        assert!(!is_read_statement("INSERT INTO t (note) VALUES ('returning')"));
    }
}

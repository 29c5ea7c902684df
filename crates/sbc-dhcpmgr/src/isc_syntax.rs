//! Lexer and statement tree for the ISC brace grammar shared by
//! `dhcpd.conf` and `dhcpd.leases`.

/// One `words...;` statement or `words... { ... }` block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statement {
    pub words: Vec<String>,
    pub block: Option<Vec<Statement>>,
    /// 1-based line the statement started on.
    pub line: usize,
}

impl Statement {
    pub fn keyword(&self) -> &str {
        self.words.first().map(String::as_str).unwrap_or_default()
    }

    /// Words after the keyword.
    pub fn args(&self) -> &[String] {
        self.words.get(1..).unwrap_or_default()
    }

    /// True if the statement starts with exactly `prefix`.
    pub fn starts_with(&self, prefix: &[&str]) -> bool {
        self.words.len() >= prefix.len() && self.words.iter().zip(prefix).all(|(w, p)| w == p)
    }
}

#[derive(Debug, PartialEq)]
enum Token {
    Word(String),
    Semi,
    Open,
    Close,
}

/// Tokens up to the first lexical error, and that error.
fn lex(text: &str) -> (Vec<(Token, usize)>, Option<String>) {
    let mut tokens = Vec::new();
    let mut line = 1;
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\n' => line += 1,
            '#' => {
                while let Some(&n) = chars.peek() {
                    if n == '\n' {
                        break;
                    }
                    chars.next();
                }
            }
            ';' => tokens.push((Token::Semi, line)),
            '{' => tokens.push((Token::Open, line)),
            '}' => tokens.push((Token::Close, line)),
            ',' => {}
            '"' => {
                let start = line;
                let mut word = String::new();
                let mut closed = false;
                for n in chars.by_ref() {
                    match n {
                        '"' => {
                            closed = true;
                            break;
                        }
                        '\n' => {
                            line += 1;
                            word.push(n);
                        }
                        _ => word.push(n),
                    }
                }
                if !closed {
                    return (tokens, Some(format!("line {}: unterminated string", start)));
                }
                tokens.push((Token::Word(word), start));
            }
            c if c.is_whitespace() => {}
            c => {
                let mut word = String::from(c);
                while let Some(&n) = chars.peek() {
                    if n.is_whitespace() || matches!(n, ';' | '{' | '}' | ',' | '"' | '#') {
                        break;
                    }
                    word.push(n);
                    chars.next();
                }
                tokens.push((Token::Word(word), line));
            }
        }
    }
    (tokens, None)
}

/// Appends complete statements to `statements` until the block closes.
fn parse_block<I>(
    tokens: &mut I,
    nested: bool,
    statements: &mut Vec<Statement>,
) -> Result<(), String>
where
    I: Iterator<Item = (Token, usize)>,
{
    let mut words = Vec::new();
    let mut start = 0;

    while let Some((token, line)) = tokens.next() {
        match token {
            Token::Word(w) => {
                if words.is_empty() {
                    start = line;
                }
                words.push(w);
            }
            Token::Semi => {
                if !words.is_empty() {
                    statements.push(Statement {
                        words: std::mem::take(&mut words),
                        block: None,
                        line: start,
                    });
                }
            }
            Token::Open => {
                let mut block = Vec::new();
                parse_block(tokens, true, &mut block)?;
                statements.push(Statement {
                    words: std::mem::take(&mut words),
                    block: Some(block),
                    line: if start == 0 { line } else { start },
                });
                start = 0;
            }
            Token::Close => {
                if !nested {
                    return Err(format!("line {}: unbalanced '}}'", line));
                }
                if !words.is_empty() {
                    statements.push(Statement {
                        words: std::mem::take(&mut words),
                        block: None,
                        line: start,
                    });
                }
                return Ok(());
            }
        }
    }

    if nested {
        return Err("unterminated block".to_string());
    }
    if !words.is_empty() {
        statements.push(Statement {
            words,
            block: None,
            line: start,
        });
    }
    Ok(())
}

/// Parses a whole file into top-level statements.
///
/// Fails only on structural errors (unbalanced braces, unterminated strings).
pub fn parse_statements(text: &str) -> Result<Vec<Statement>, String> {
    match parse_statements_partial(text) {
        (statements, None) => Ok(statements),
        (_, Some(e)) => Err(e),
    }
}

/// Parses the complete top-level statements that precede the first
/// structural error, and returns that error alongside them.
///
/// A block cut off by the error is dropped.
pub fn parse_statements_partial(text: &str) -> (Vec<Statement>, Option<String>) {
    let (tokens, lex_error) = lex(text);
    let mut statements = Vec::new();
    let parse_error = parse_block(&mut tokens.into_iter(), false, &mut statements).err();
    (statements, lex_error.or(parse_error))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nested_blocks() {
        let text = r#"
# global
default-lease-time 600;
subnet 10.0.0.0 netmask 255.255.255.0 {
    range 10.0.0.10 10.0.0.20;
    option domain-name-servers 1.1.1.1, 8.8.8.8;
    option domain-name "lab local";
}
"#;
        let stmts = parse_statements(text).unwrap();
        assert_eq!(stmts.len(), 2);
        assert_eq!(stmts[0].keyword(), "default-lease-time");
        assert_eq!(stmts[0].line, 3);

        let subnet = &stmts[1];
        assert!(subnet.starts_with(&["subnet", "10.0.0.0"]));
        let body = subnet.block.as_ref().unwrap();
        assert_eq!(body[1].args(), &["domain-name-servers", "1.1.1.1", "8.8.8.8"]);
        assert_eq!(body[2].words.last().unwrap(), "lab local");
    }

    #[test]
    fn test_structural_errors() {
        assert!(parse_statements("subnet 10.0.0.0 {").is_err());
        assert!(parse_statements("}").is_err());
        assert!(parse_statements("option domain-name \"open").is_err());
    }

    #[test]
    fn test_partial_keeps_complete_statements() {
        let text = "authoritative;\nhost a { fixed-address 10.0.0.5; }\nhost b {\n  fixed-address";
        let (stmts, err) = parse_statements_partial(text);
        assert_eq!(err.as_deref(), Some("unterminated block"));
        assert_eq!(stmts.len(), 2);
        assert!(stmts[1].starts_with(&["host", "a"]));

        let (stmts, err) =
            parse_statements_partial("default-lease-time 600;\noption domain-name \"open");
        assert_eq!(err.as_deref(), Some("line 2: unterminated string"));
        assert_eq!(stmts[0].keyword(), "default-lease-time");
    }
}

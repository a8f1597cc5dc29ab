//! Compound target expressions: a boolean algebra over typed atoms.
//!
//! Grammar, loosest to tightest binding:
//! ```text
//! expr  := and_e ( "or" and_e )*
//! and_e := unary ( "and" unary )*
//! unary := "not" unary | "(" expr ")" | atom
//! ```
//! An atom is `<prefix>@<pattern>` selecting an engine, or a bare word
//! matched as a glob. `and` is inserted implicitly before `not` when it
//! follows an atom or a closing paren.

use crate::Matcher;
use std::fmt;

/// A typed atom of a compound expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Atom {
    Glob(String),
    Regex(String),
    List(String),
    Tree { pattern: String, delim: Option<char> },
    TreeRegex { pattern: String, delim: Option<char> },
    Config { pattern: String, delim: Option<char> },
    ConfigRegex { pattern: String, delim: Option<char> },
    IpCidr(String),
    Range(String),
}

impl Atom {
    pub fn evaluate(&self, matcher: &Matcher) -> bool {
        let delim = |d: &Option<char>| {
            d.map(|c| c.to_string())
                .unwrap_or_else(|| crate::DEFAULT_TARGET_DELIM.to_string())
        };
        match self {
            Atom::Glob(p) => matcher.glob(p),
            Atom::Regex(p) => matcher.regex(p),
            Atom::List(p) => matcher.list(&serde_json::Value::String(p.clone())),
            Atom::Tree { pattern, delim: d } => matcher.tree(pattern, &delim(d)),
            Atom::TreeRegex { pattern, delim: d } => matcher.tree_regex(pattern, &delim(d)),
            Atom::Config { pattern, delim: d } => matcher.config(pattern, &delim(d)),
            Atom::ConfigRegex { pattern, delim: d } => matcher.config_regex(pattern, &delim(d)),
            Atom::IpCidr(p) => matcher.ipcidr(p),
            Atom::Range(p) => matcher.range(p),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Open,
    Close,
    And,
    Or,
    Not,
    Atom(Atom),
}

#[derive(Debug)]
pub struct ParseError(String);

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for ParseError {}

fn err<T>(msg: impl Into<String>) -> Result<T, ParseError> {
    Err(ParseError(msg.into()))
}

/// Evaluate a compound expression against the matcher.
pub fn evaluate(matcher: &Matcher, expr: &str) -> Result<bool, ParseError> {
    let tokens = tokenize(expr)?;
    if tokens.is_empty() {
        return err("empty expression");
    }
    let mut parser = Parser {
        matcher,
        tokens: &tokens,
        pos: 0,
    };
    let result = parser.expr()?;
    if parser.pos != tokens.len() {
        return err(format!("trailing tokens at position {}", parser.pos));
    }
    Ok(result)
}

/// Split on whitespace, classify operators, parse typed atoms, and
/// apply the normalization rules (implicit `and` before `not`, no
/// leading binary operator, no binary operator right after `(`).
fn tokenize(expr: &str) -> Result<Vec<Token>, ParseError> {
    let mut tokens: Vec<Token> = Vec::new();
    for word in expr.split_whitespace() {
        let token = match word {
            "(" => Token::Open,
            ")" => Token::Close,
            "and" => Token::And,
            "or" => Token::Or,
            "not" => Token::Not,
            _ => Token::Atom(parse_atom(word)?),
        };

        match &token {
            Token::And | Token::Or => match tokens.last() {
                None => return err(format!("expression begins with binary operator {word:?}")),
                Some(Token::Open) => {
                    return err(format!("binary operator {word:?} directly after \"(\""))
                }
                _ => {}
            },
            Token::Not => {
                // `x not y` reads as `x and not y`
                if matches!(tokens.last(), Some(Token::Atom(_)) | Some(Token::Close)) {
                    tokens.push(Token::And);
                }
            }
            _ => {}
        }
        tokens.push(token);
    }
    Ok(tokens)
}

/// Parse one word into a typed atom. `<engine>@<pattern>` selects an
/// engine; `G`, `P`, `I` and `J` may carry a one-character delimiter
/// between the engine letter and the `@`. A bare word is a glob.
fn parse_atom(word: &str) -> Result<Atom, ParseError> {
    let bytes = word.as_bytes();
    let engine = bytes.first().copied();
    let engine_delim = |word: &str| -> (Option<char>, Option<usize>) {
        // e.g. "G@os:Linux" (no delim) or "G|@os|Linux" (delim '|')
        match word[1..].find('@') {
            Some(0) => (None, Some(2)),
            Some(1) => (word[1..].chars().next(), Some(3)),
            _ => (None, None),
        }
    };

    if let Some(letter) = engine {
        let letter = letter as char;
        if matches!(letter, 'G' | 'P' | 'I' | 'J') {
            if let (delim, Some(rest)) = engine_delim(word) {
                let pattern = word[rest..].to_string();
                return Ok(match letter {
                    'G' => Atom::Tree { pattern, delim },
                    'P' => Atom::TreeRegex { pattern, delim },
                    'I' => Atom::Config { pattern, delim },
                    'J' => Atom::ConfigRegex { pattern, delim },
                    _ => unreachable!(),
                });
            }
        } else if matches!(letter, 'L' | 'S' | 'E' | 'R' | 'N') && bytes.get(1) == Some(&b'@') {
            let pattern = word[2..].to_string();
            return match letter {
                'L' => Ok(Atom::List(pattern)),
                'S' => Ok(Atom::IpCidr(pattern)),
                'E' => Ok(Atom::Regex(pattern)),
                'R' => Ok(Atom::Range(pattern)),
                // Nodegroups are expanded before publication; seeing one
                // here means expansion failed upstream.
                'N' => err(format!("unexpanded nodegroup in target: {word:?}")),
                _ => unreachable!(),
            };
        }
    }
    Ok(Atom::Glob(word.to_string()))
}

struct Parser<'a> {
    matcher: &'a Matcher,
    tokens: &'a [Token],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&'a Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<&'a Token> {
        let token = self.tokens.get(self.pos);
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn expr(&mut self) -> Result<bool, ParseError> {
        let mut value = self.and_expr()?;
        while matches!(self.peek(), Some(Token::Or)) {
            self.next();
            let rhs = self.and_expr()?;
            value = value || rhs;
        }
        Ok(value)
    }

    fn and_expr(&mut self) -> Result<bool, ParseError> {
        let mut value = self.unary()?;
        while matches!(self.peek(), Some(Token::And)) {
            self.next();
            let rhs = self.unary()?;
            value = value && rhs;
        }
        Ok(value)
    }

    fn unary(&mut self) -> Result<bool, ParseError> {
        let token = self.next();
        match token {
            Some(Token::Not) => Ok(!self.unary()?),
            Some(Token::Open) => {
                let value = self.expr()?;
                match self.next() {
                    Some(Token::Close) => Ok(value),
                    _ => err("unbalanced parenthesis"),
                }
            }
            Some(Token::Atom(atom)) => Ok(atom.evaluate(self.matcher)),
            Some(token) => err(format!("unexpected token {token:?}")),
            None => err("expression ends mid-term"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MatcherContext;
    use serde_json::json;
    use std::sync::Arc;

    fn matcher() -> Matcher {
        Matcher::new(Arc::new(MatcherContext {
            id: "web-01".to_string(),
            grains: json!({
                "os": "Linux",
                "ipv4": ["10.0.4.7"],
                "ipv6": [],
            }),
            pillar: json!({"role": "web"}),
            range_server: None,
        }))
    }

    fn eval(expr: &str) -> bool {
        matcher().compound(expr)
    }

    #[test]
    fn bare_words_are_globs() {
        assert!(eval("web-*"));
        assert!(!eval("db-*"));
    }

    #[test]
    fn typed_atoms() {
        assert!(eval("G@os:Linux"));
        assert!(!eval("G@os:Windows"));
        assert!(eval("P@os:Lin.x"));
        assert!(eval("I@role:web"));
        assert!(eval("J@role:w.b"));
        assert!(eval("L@db-01,web-01"));
        assert!(eval("S@10.0.4.0/24"));
        assert!(eval("E@web-\\d+"));
        assert!(!eval("R@%cluster"));
    }

    #[test]
    fn custom_delimiter_atoms() {
        assert!(eval("G|@os|Linux"));
        assert!(!eval("G|@os|Windows"));
    }

    #[test]
    fn boolean_precedence() {
        // and binds tighter than or
        assert!(eval("db-* or web-* and G@os:Linux"));
        assert!(!eval("( db-* or web-* ) and G@os:Windows"));
        assert!(eval("not db-*"));
        assert!(eval("not ( db-* and G@os:Windows )"));
    }

    #[test]
    fn implicit_and_before_not() {
        assert!(eval("web-* not db-*"));
        assert!(!eval("web-* not web-*"));
        assert!(eval("( web-* ) not db-*"));
    }

    #[test]
    fn spec_scenario_compound_reject() {
        let m = Matcher::new(Arc::new(MatcherContext {
            id: "db-01".to_string(),
            grains: json!({"os": "Linux"}),
            pillar: json!({}),
            range_server: None,
        }));
        assert!(!m.compound("G@os:Windows and web-*"));
        assert!(m.compound("G@os:Linux and db-*"));
    }

    #[test]
    fn malformed_expressions_fail_closed() {
        assert!(!eval("and web-*"));
        assert!(!eval("or web-*"));
        assert!(!eval("( and web-* )"));
        assert!(!eval("web-* and"));
        assert!(!eval("( web-*"));
        assert!(!eval("web-* )"));
        assert!(!eval(""));
        assert!(!eval("N@group1"));
    }

    #[test]
    fn truth_table_equivalence() {
        // TRUE := web-*, FALSE := db-*
        let t = "web-*";
        let f = "db-*";
        for (expr, expected) in [
            (format!("{t} and {t}"), true),
            (format!("{t} and {f}"), false),
            (format!("{f} or {t}"), true),
            (format!("{f} or {f}"), false),
            (format!("not {f}"), true),
            (format!("not {t} or {t}"), true),
            (format!("not ( {t} or {f} )"), false),
            (format!("{f} or not {f} and {t}"), true),
        ] {
            assert_eq!(eval(&expr), expected, "{expr}");
        }
    }
}

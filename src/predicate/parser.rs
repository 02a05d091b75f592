//! Tokenizer and recursive-descent parser for filter expressions
//!
//! ```text
//! expr   := clause ('||' clause)*
//! clause := ['('] term ('&&' term)* [')']
//! term   := 'url' '.' 'includes' '(' STRING ')'
//! ```
//!
//! Parsing never fails as a whole. A clause that does not fit the grammar is
//! kept as [`Clause::Malformed`] so its siblings can still match.

use std::iter::Peekable;
use std::str::CharIndices;

/// Lexical token of the filter language
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    /// Bare identifier (`url`, `includes`, anything else)
    Ident(String),
    /// Quoted literal without its quotes
    Str(String),
    /// `.`
    Dot,
    /// `(`
    LParen,
    /// `)`
    RParen,
    /// `&&`
    And,
    /// `||`
    Or,
    /// Anything the language does not know, including unterminated strings
    Invalid(String),
}

/// Split an expression into tokens
pub fn tokenize(source: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut chars = source.char_indices().peekable();

    while let Some((start, ch)) = chars.next() {
        let token = match ch {
            c if c.is_whitespace() => continue,
            '.' => Token::Dot,
            '(' => Token::LParen,
            ')' => Token::RParen,
            '&' | '|' => {
                if chars.next_if(|&(_, next)| next == ch).is_some() {
                    if ch == '&' {
                        Token::And
                    } else {
                        Token::Or
                    }
                } else {
                    Token::Invalid(ch.to_string())
                }
            }
            '\'' | '"' => lex_string(source, start, ch, &mut chars),
            c if is_ident_char(c) => {
                let mut end = start + c.len_utf8();
                while let Some((index, next)) = chars.next_if(|&(_, next)| is_ident_char(next)) {
                    end = index + next.len_utf8();
                }
                Token::Ident(source[start..end].to_string())
            }
            other => Token::Invalid(other.to_string()),
        };
        tokens.push(token);
    }

    tokens
}

fn lex_string(
    source: &str,
    start: usize,
    quote: char,
    chars: &mut Peekable<CharIndices<'_>>,
) -> Token {
    let body_start = start + quote.len_utf8();
    for (index, ch) in chars.by_ref() {
        if ch == quote {
            return Token::Str(source[body_start..index].to_string());
        }
    }
    Token::Invalid(source[start..].to_string())
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '$'
}

/// Parsed filter expression: a disjunction of clauses
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expr {
    /// Clauses in source order
    pub clauses: Vec<Clause>,
}

/// A conjunction of `url.includes(...)` terms
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Clause {
    /// Needles that must all be contained in the URL
    Terms(Vec<String>),
    /// Clause outside the grammar; always false
    Malformed,
}

/// Parse a trimmed expression into clauses
pub fn parse(source: &str) -> Expr {
    let tokens = tokenize(source);
    let clauses = tokens
        .split(|token| *token == Token::Or)
        .map(parse_clause)
        .collect();

    Expr { clauses }
}

fn parse_clause(tokens: &[Token]) -> Clause {
    let mut parser = ClauseParser { tokens, pos: 0 };
    parser.clause().map_or(Clause::Malformed, Clause::Terms)
}

struct ClauseParser<'a> {
    tokens: &'a [Token],
    pos: usize,
}

impl ClauseParser<'_> {
    fn clause(&mut self) -> Option<Vec<String>> {
        self.eat(&Token::LParen);

        let mut needles = vec![self.term()?];
        while self.eat(&Token::And) {
            needles.push(self.term()?);
        }

        self.eat(&Token::RParen);
        (self.pos == self.tokens.len()).then_some(needles)
    }

    fn term(&mut self) -> Option<String> {
        self.ident("url")?;
        self.expect(&Token::Dot)?;
        self.ident("includes")?;
        self.expect(&Token::LParen)?;
        let needle = match self.tokens.get(self.pos) {
            Some(Token::Str(literal)) => literal.clone(),
            _ => return None,
        };
        self.pos += 1;
        self.expect(&Token::RParen)?;
        Some(needle)
    }

    fn ident(&mut self, name: &str) -> Option<()> {
        match self.tokens.get(self.pos) {
            Some(Token::Ident(ident)) if ident == name => {
                self.pos += 1;
                Some(())
            }
            _ => None,
        }
    }

    fn expect(&mut self, token: &Token) -> Option<()> {
        self.eat(token).then_some(())
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.tokens.get(self.pos) == Some(token) {
            self.pos += 1;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokenize_term() {
        assert_eq!(
            tokenize("url.includes('vrf=')"),
            vec![
                Token::Ident("url".to_string()),
                Token::Dot,
                Token::Ident("includes".to_string()),
                Token::LParen,
                Token::Str("vrf=".to_string()),
                Token::RParen,
            ]
        );
    }

    #[test]
    fn test_tokenize_operators_inside_strings() {
        let tokens = tokenize(r#"url.includes("a||b") && url.includes('c&&d')"#);
        assert!(tokens.contains(&Token::Str("a||b".to_string())));
        assert!(tokens.contains(&Token::Str("c&&d".to_string())));
        assert_eq!(tokens.iter().filter(|t| **t == Token::And).count(), 1);
        assert!(!tokens.contains(&Token::Or));
    }

    #[test]
    fn test_tokenize_invalid() {
        assert_eq!(tokenize("a & b")[1], Token::Invalid("&".to_string()));
        assert_eq!(
            tokenize("url.includes('open")[4],
            Token::Invalid("'open".to_string())
        );
    }

    #[test]
    fn test_parse_clauses() {
        let expr = parse("url.includes('a') && url.includes('b') || (url.includes(\"c\"))");
        assert_eq!(
            expr.clauses,
            vec![
                Clause::Terms(vec!["a".to_string(), "b".to_string()]),
                Clause::Terms(vec!["c".to_string()]),
            ]
        );
    }

    #[test]
    fn test_parse_whitespace_inside_call() {
        let expr = parse("url.includes( 'a' )");
        assert_eq!(expr.clauses, vec![Clause::Terms(vec!["a".to_string()])]);
    }

    #[test]
    fn test_parse_malformed_clause_is_isolated() {
        let expr = parse("url.startsWith('a') || url.includes('b')");
        assert_eq!(
            expr.clauses,
            vec![Clause::Malformed, Clause::Terms(vec!["b".to_string()])]
        );
    }

    #[test]
    fn test_parse_rejects_trailing_garbage() {
        assert_eq!(parse("url.includes('a') + 1").clauses, vec![Clause::Malformed]);
        assert_eq!(parse("url.includes('a') ||").clauses[1], Clause::Malformed);
        assert_eq!(parse("url.includes(a)").clauses, vec![Clause::Malformed]);
    }
}

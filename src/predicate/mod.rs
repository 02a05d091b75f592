//! Filter predicates over candidate request URLs
//!
//! A filter is written as a script body such as
//! `return url.includes('/ajax/') && url.includes('vrf=');`. The script is never
//! executed: only the expression after its last `return` is parsed and
//! interpreted, so evaluation is deterministic and free of side effects.

mod parser;

pub use parser::{parse, tokenize, Clause, Expr, Token};

use tracing::{debug, trace};

/// Keyword that introduces the evaluated expression
const RETURN_KEYWORD: &str = "return";

/// Compiled filter predicate
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Predicate {
    /// No usable expression: every URL matches
    Always,
    /// Single `url.includes(...)` term, tested directly
    Includes(String),
    /// General disjunction of clauses
    Expr(Expr),
}

impl Predicate {
    /// Compile the expression carried by a filter script
    ///
    /// Scripts without a `return`, or whose returned expression is empty,
    /// compile to [`Predicate::Always`].
    #[must_use]
    pub fn compile(script: &str) -> Self {
        let Some(source) = extract_expression(script) else {
            debug!("Filter script has no return expression, capturing everything");
            return Self::Always;
        };

        let expr = parse(source);
        let malformed = expr
            .clauses
            .iter()
            .filter(|clause| **clause == Clause::Malformed)
            .count();
        if malformed > 0 {
            debug!(
                "Filter expression '{}' has {} clause(s) outside the grammar",
                source, malformed
            );
        }

        match expr.clauses.as_slice() {
            [Clause::Terms(needles)] if needles.len() == 1 => Self::Includes(needles[0].clone()),
            _ => Self::Expr(expr),
        }
    }

    /// Evaluate the predicate against a request URL
    pub fn matches(&self, url: &str) -> bool {
        let matched = match self {
            Self::Always => true,
            Self::Includes(needle) => url.contains(needle.as_str()),
            Self::Expr(expr) => expr.clauses.iter().any(|clause| match clause {
                Clause::Terms(needles) => needles.iter().all(|needle| url.contains(needle.as_str())),
                Clause::Malformed => false,
            }),
        };
        trace!("Predicate {} for {}", if matched { "MATCH" } else { "MISS" }, url);
        matched
    }

    /// Whether the predicate accepts every URL
    #[must_use]
    pub fn is_permissive(&self) -> bool {
        matches!(self, Self::Always)
    }
}

/// Compile `script` and evaluate it against `url` in one step
pub fn evaluate(script: &str, url: &str) -> bool {
    Predicate::compile(script).matches(url)
}

/// Text after the last `return`, minus one trailing `;`, trimmed
///
/// Returns `None` when there is no `return` or nothing follows it.
pub fn extract_expression(script: &str) -> Option<&str> {
    let index = script.rfind(RETURN_KEYWORD)?;
    let after = script[index + RETURN_KEYWORD.len()..].trim();
    let expr = after.strip_suffix(';').map_or(after, str::trim);
    (!expr.is_empty()).then_some(expr)
}

//! Module for the dependency expression parser.
//!
//! A recursive-descent parser over the [`Lexer`]; precedence is
//! `OR < AND < NOT`, with parentheses for grouping. Comparisons are
//! `name=STATUS`, `name!=STATUS`, `name IN (STATUS, …)`, and
//! `name NOT IN (STATUS, …)`.

use std::str::FromStr;

use thiserror::Error;

use joblet_core::JobStatus;

use crate::lexer::Lexer;
use crate::lexer::Token;
use crate::requirement::CompareOp;
use crate::requirement::Expr;
use crate::requirement::Requirement;

/// Error type for requirement parsing.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    /// The lexer hit a character it does not recognise.
    #[error("unrecognised input at offset {offset}")]
    Unrecognised {
        /// The byte offset of the bad input.
        offset: usize,
    },
    /// A token appeared where another was expected.
    #[error("expected {expected} at offset {offset}, found {found}")]
    Unexpected {
        /// What the parser expected.
        expected: &'static str,
        /// A description of what it found.
        found: &'static str,
        /// The byte offset of the unexpected token.
        offset: usize,
    },
    /// The expression ended where more input was expected.
    #[error("expected {expected}, found the end of the expression")]
    UnexpectedEnd {
        /// What the parser expected.
        expected: &'static str,
    },
    /// A status literal is not a job status.
    #[error("`{literal}` is not a job status")]
    InvalidStatus {
        /// The offending literal.
        literal: String,
    },
}

/// Parses a requirement expression.
///
/// A bare `name=STATUS` comparison parses to the simple requirement
/// variant; everything else parses to an expression tree.
pub fn parse_requirement(source: &str) -> Result<Requirement, ParseError> {
    let expr = parse_expression(source)?;
    Ok(match expr {
        Expr::Comparison {
            job,
            op: CompareOp::Is(status),
        } => Requirement::Simple { job, status },
        expr => Requirement::Expression(expr),
    })
}

/// Parses a requirement expression into its tree form.
pub fn parse_expression(source: &str) -> Result<Expr, ParseError> {
    let mut parser = Parser {
        lexer: Lexer::new(source),
    };
    let expr = parser.or_expr()?;

    match parser.lexer.next_token() {
        None => Ok(expr),
        Some((Ok(token), span)) => Err(ParseError::Unexpected {
            expected: "the end of the expression",
            found: token.describe(),
            offset: span.start,
        }),
        Some((Err(()), span)) => Err(ParseError::Unrecognised { offset: span.start }),
    }
}

/// The recursive-descent parser state.
struct Parser<'a> {
    /// The token stream.
    lexer: Lexer<'a>,
}

impl<'a> Parser<'a> {
    /// Parses an `OR` chain (lowest precedence).
    fn or_expr(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.and_expr()?;
        while self.eat(Token::Or)? {
            let right = self.and_expr()?;
            expr = Expr::Or(Box::new(expr), Box::new(right));
        }
        Ok(expr)
    }

    /// Parses an `AND` chain.
    fn and_expr(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.not_expr()?;
        while self.eat(Token::And)? {
            let right = self.not_expr()?;
            expr = Expr::And(Box::new(expr), Box::new(right));
        }
        Ok(expr)
    }

    /// Parses a `NOT` prefix (highest operator precedence).
    fn not_expr(&mut self) -> Result<Expr, ParseError> {
        if self.eat(Token::Not)? {
            let inner = self.not_expr()?;
            return Ok(Expr::Not(Box::new(inner)));
        }

        self.primary()
    }

    /// Parses a parenthesised expression or a comparison.
    fn primary(&mut self) -> Result<Expr, ParseError> {
        if self.eat(Token::OpenParen)? {
            let expr = self.or_expr()?;
            self.expect(Token::CloseParen, "`)`")?;
            return Ok(expr);
        }

        self.comparison()
    }

    /// Parses one comparison: `name=STATUS`, `name!=STATUS`,
    /// `name IN (…)`, or `name NOT IN (…)`.
    fn comparison(&mut self) -> Result<Expr, ParseError> {
        let job = self.ident("a job name")?;

        let (token, span) = match self.lexer.next_token() {
            Some((Ok(token), span)) => (token, span),
            Some((Err(()), span)) => return Err(ParseError::Unrecognised { offset: span.start }),
            None => {
                return Err(ParseError::UnexpectedEnd {
                    expected: "a comparison operator",
                });
            }
        };

        let op = match token {
            Token::Equals => CompareOp::Is(self.status()?),
            Token::NotEquals => CompareOp::IsNot(self.status()?),
            Token::In => CompareOp::In(self.status_list()?),
            Token::Not => {
                self.expect(Token::In, "`IN`")?;
                CompareOp::NotIn(self.status_list()?)
            }
            token => {
                return Err(ParseError::Unexpected {
                    expected: "a comparison operator",
                    found: token.describe(),
                    offset: span.start,
                });
            }
        };

        Ok(Expr::Comparison { job, op })
    }

    /// Parses a parenthesised, comma-separated status list.
    fn status_list(&mut self) -> Result<Vec<JobStatus>, ParseError> {
        self.expect(Token::OpenParen, "`(`")?;

        let mut statuses = vec![self.status()?];
        while self.eat(Token::Comma)? {
            statuses.push(self.status()?);
        }

        self.expect(Token::CloseParen, "`)`")?;
        Ok(statuses)
    }

    /// Parses one status literal.
    fn status(&mut self) -> Result<JobStatus, ParseError> {
        let literal = self.ident("a job status")?;
        JobStatus::from_str(&literal).map_err(|_| ParseError::InvalidStatus { literal })
    }

    /// Parses one identifier, returning its text.
    fn ident(&mut self, expected: &'static str) -> Result<String, ParseError> {
        match self.lexer.next_token() {
            Some((Ok(Token::Ident), span)) => Ok(self.lexer.source()[span].to_string()),
            Some((Ok(token), span)) => Err(ParseError::Unexpected {
                expected,
                found: token.describe(),
                offset: span.start,
            }),
            Some((Err(()), span)) => Err(ParseError::Unrecognised { offset: span.start }),
            None => Err(ParseError::UnexpectedEnd { expected }),
        }
    }

    /// Consumes the next token if it matches.
    fn eat(&mut self, token: Token) -> Result<bool, ParseError> {
        match self.lexer.peek() {
            Some((Ok(peeked), _)) if peeked == token => {
                self.lexer.next_token();
                Ok(true)
            }
            Some((Err(()), span)) => Err(ParseError::Unrecognised { offset: span.start }),
            _ => Ok(false),
        }
    }

    /// Consumes the next token, requiring it to match.
    fn expect(&mut self, token: Token, expected: &'static str) -> Result<(), ParseError> {
        match self.lexer.next_token() {
            Some((Ok(found), _)) if found == token => Ok(()),
            Some((Ok(found), span)) => Err(ParseError::Unexpected {
                expected,
                found: found.describe(),
                offset: span.start,
            }),
            Some((Err(()), span)) => Err(ParseError::Unrecognised { offset: span.start }),
            None => Err(ParseError::UnexpectedEnd { expected }),
        }
    }
}

#[cfg(test)]
mod test {
    use std::collections::HashMap;

    use pretty_assertions::assert_eq;

    use super::*;

    /// Parses an expression, panicking on failure.
    fn parse(source: &str) -> Expr {
        parse_expression(source).expect("expression should parse")
    }

    #[test]
    fn bare_equality_is_the_simple_variant() {
        assert_eq!(
            parse_requirement("build=COMPLETED").unwrap(),
            Requirement::Simple {
                job: "build".to_string(),
                status: joblet_core::JobStatus::Completed,
            }
        );

        assert!(matches!(
            parse_requirement("build!=FAILED").unwrap(),
            Requirement::Expression(_)
        ));
    }

    #[test]
    fn or_binds_loosest() {
        // a=COMPLETED OR b=COMPLETED AND NOT c=FAILED
        // parses as a=COMPLETED OR (b=COMPLETED AND (NOT c=FAILED)).
        let expr = parse("a=COMPLETED OR b=COMPLETED AND NOT c=FAILED");
        match expr {
            Expr::Or(_, right) => match *right {
                Expr::And(_, not) => assert!(matches!(*not, Expr::Not(_))),
                other => panic!("expected AND on the right, got {other:?}"),
            },
            other => panic!("expected OR at the root, got {other:?}"),
        }
    }

    #[test]
    fn parentheses_override_precedence() {
        let expr = parse("(a=COMPLETED OR b=COMPLETED) AND c=COMPLETED");
        assert!(matches!(expr, Expr::And(..)));
    }

    #[test]
    fn not_in_parses_as_one_operator() {
        let expr = parse("a NOT IN (FAILED, CANCELED, STOPPED)");
        match expr {
            Expr::Comparison { job, op } => {
                assert_eq!(job, "a");
                assert_eq!(
                    op,
                    CompareOp::NotIn(vec![
                        joblet_core::JobStatus::Failed,
                        joblet_core::JobStatus::Canceled,
                        joblet_core::JobStatus::Stopped,
                    ])
                );
            }
            other => panic!("expected a comparison, got {other:?}"),
        }
    }

    #[test]
    fn parse_errors_carry_positions() {
        assert_eq!(
            parse_expression("a="),
            Err(ParseError::UnexpectedEnd {
                expected: "a job status"
            })
        );
        assert_eq!(
            parse_expression("a=RUNNING b=RUNNING"),
            Err(ParseError::Unexpected {
                expected: "the end of the expression",
                found: "identifier",
                offset: 10,
            })
        );
        assert_eq!(
            parse_expression("a=GREAT"),
            Err(ParseError::InvalidStatus {
                literal: "GREAT".to_string()
            })
        );
        assert!(matches!(
            parse_expression("a = %"),
            Err(ParseError::Unrecognised { .. })
        ));
    }

    #[test]
    fn display_round_trips_through_the_parser() {
        for source in [
            "a=COMPLETED",
            "a!=FAILED",
            "a IN (COMPLETED, STOPPED)",
            "a NOT IN (FAILED, CANCELED)",
            "a=COMPLETED AND b=COMPLETED",
            "a=COMPLETED OR b=COMPLETED AND c=COMPLETED",
            "(a=COMPLETED OR b=COMPLETED) AND c=COMPLETED",
            "NOT (a=FAILED OR b=FAILED)",
            "NOT a=FAILED AND b=COMPLETED",
        ] {
            let parsed = parse(source);
            let reparsed = parse(&parsed.to_string());
            assert_eq!(parsed, reparsed, "round-trip failed for `{source}`");
        }
    }

    #[test]
    fn evaluation_matches_a_reference_implementation() {
        use joblet_core::JobStatus::*;

        /// The reference evaluator: a direct truth-table walk.
        fn reference(expr: &Expr, statuses: &HashMap<String, joblet_core::JobStatus>) -> bool {
            match expr {
                Expr::Comparison { job, op } => {
                    let status = statuses.get(job).copied().unwrap_or(Pending);
                    match op {
                        CompareOp::Is(s) => status == *s,
                        CompareOp::IsNot(s) => status != *s,
                        CompareOp::In(set) => set.iter().any(|s| *s == status),
                        CompareOp::NotIn(set) => set.iter().all(|s| *s != status),
                    }
                }
                Expr::Not(e) => !reference(e, statuses),
                Expr::And(l, r) => reference(l, statuses) && reference(r, statuses),
                Expr::Or(l, r) => reference(l, statuses) || reference(r, statuses),
            }
        }

        let expr = parse("(a=COMPLETED OR b IN (COMPLETED, STOPPED)) AND NOT c=FAILED");
        for a in [Pending, Running, Completed, Failed] {
            for b in [Pending, Completed, Stopped, Canceled] {
                for c in [Pending, Completed, Failed] {
                    let statuses: HashMap<_, _> = [
                        ("a".to_string(), a),
                        ("b".to_string(), b),
                        ("c".to_string(), c),
                    ]
                    .into_iter()
                    .collect();
                    assert_eq!(expr.evaluate(&statuses), reference(&expr, &statuses));
                }
            }
        }
    }
}

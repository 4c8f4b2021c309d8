//! Module for the dependency expression lexer.

use logos::Logos;

/// Represents a token in a dependency requirement expression.
///
/// Keywords are matched case-insensitively in their common spellings;
/// anything identifier-shaped that is not a keyword is an [`Ident`]
/// (a job name or a status literal).
///
/// [`Ident`]: Token::Ident
#[derive(Logos, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[logos(skip r"[ \t\r\n]+")]
pub enum Token {
    /// The `AND` keyword.
    #[token("AND")]
    #[token("and")]
    And,

    /// The `OR` keyword.
    #[token("OR")]
    #[token("or")]
    Or,

    /// The `NOT` keyword.
    #[token("NOT")]
    #[token("not")]
    Not,

    /// The `IN` keyword.
    #[token("IN")]
    #[token("in")]
    In,

    /// A `(` symbol.
    #[token("(")]
    OpenParen,

    /// A `)` symbol.
    #[token(")")]
    CloseParen,

    /// A `,` symbol.
    #[token(",")]
    Comma,

    /// A `=` symbol.
    #[token("=")]
    Equals,

    /// A `!=` symbol.
    #[token("!=")]
    NotEquals,

    /// A job name or status literal.
    #[regex(r"[A-Za-z_][A-Za-z0-9_.\-]*")]
    Ident,
}

impl Token {
    /// Describes the token for error messages.
    pub fn describe(self) -> &'static str {
        match self {
            Self::And => "`AND` keyword",
            Self::Or => "`OR` keyword",
            Self::Not => "`NOT` keyword",
            Self::In => "`IN` keyword",
            Self::OpenParen => "`(` symbol",
            Self::CloseParen => "`)` symbol",
            Self::Comma => "`,` symbol",
            Self::Equals => "`=` symbol",
            Self::NotEquals => "`!=` symbol",
            Self::Ident => "identifier",
        }
    }
}

/// A lexer over a requirement expression.
///
/// Wraps the generated [`logos`] lexer with single-token lookahead for
/// the recursive-descent parser.
#[derive(Debug, Clone)]
pub struct Lexer<'a> {
    /// The underlying generated lexer.
    inner: logos::Lexer<'a, Token>,
    /// The peeked token, if lookahead has occurred.
    peeked: Option<Option<(Result<Token, ()>, std::ops::Range<usize>)>>,
}

impl<'a> Lexer<'a> {
    /// Creates a lexer over the given source.
    pub fn new(source: &'a str) -> Self {
        Self {
            inner: Token::lexer(source),
            peeked: None,
        }
    }

    /// Gets the source being lexed.
    pub fn source(&self) -> &'a str {
        self.inner.source()
    }

    /// Peeks at the next token without consuming it.
    pub fn peek(&mut self) -> Option<(Result<Token, ()>, std::ops::Range<usize>)> {
        if self.peeked.is_none() {
            self.peeked = Some(self.advance());
        }

        // SAFETY: just populated above.
        self.peeked.as_ref().unwrap().clone()
    }

    /// Consumes and returns the next token.
    pub fn next_token(&mut self) -> Option<(Result<Token, ()>, std::ops::Range<usize>)> {
        match self.peeked.take() {
            Some(peeked) => peeked,
            None => self.advance(),
        }
    }

    /// Advances the underlying lexer.
    fn advance(&mut self) -> Option<(Result<Token, ()>, std::ops::Range<usize>)> {
        self.inner.next().map(|token| (token, self.inner.span()))
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;

    /// Lexes a source into its tokens, panicking on lexer errors.
    fn lex(source: &str) -> Vec<(Token, &str)> {
        let mut lexer = Lexer::new(source);
        let mut tokens = Vec::new();
        while let Some((token, span)) = lexer.next_token() {
            tokens.push((token.expect("token should lex"), &source[span]));
        }
        tokens
    }

    #[test]
    fn lexes_a_simple_comparison() {
        assert_eq!(
            lex("build=COMPLETED"),
            vec![
                (Token::Ident, "build"),
                (Token::Equals, "="),
                (Token::Ident, "COMPLETED"),
            ]
        );
    }

    #[test]
    fn lexes_keywords_and_sets() {
        assert_eq!(
            lex("a NOT IN (FAILED, CANCELED) and b != STOPPED"),
            vec![
                (Token::Ident, "a"),
                (Token::Not, "NOT"),
                (Token::In, "IN"),
                (Token::OpenParen, "("),
                (Token::Ident, "FAILED"),
                (Token::Comma, ","),
                (Token::Ident, "CANCELED"),
                (Token::CloseParen, ")"),
                (Token::And, "and"),
                (Token::Ident, "b"),
                (Token::NotEquals, "!="),
                (Token::Ident, "STOPPED"),
            ]
        );
    }

    #[test]
    fn job_names_may_contain_dashes_and_dots() {
        assert_eq!(
            lex("train-model.v2"),
            vec![(Token::Ident, "train-model.v2")]
        );
    }

    #[test]
    fn unknown_characters_are_lexer_errors() {
        let mut lexer = Lexer::new("a = %");
        assert!(lexer.next_token().unwrap().0.is_ok());
        assert!(lexer.next_token().unwrap().0.is_ok());
        assert!(lexer.next_token().unwrap().0.is_err());
    }
}

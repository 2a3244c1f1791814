use std::fmt::Display;

use nom::error::{self, ParseError};
use nom::Parser;

use crate::{IResult, Span};

pub trait NomErrorExt<E> {
    fn is_failure(&self) -> bool;
    fn map_err<O: FnOnce(E) -> E>(self, op: O) -> nom::Err<E>;
    fn map_fail<O: FnOnce(E) -> E>(self, op: O) -> nom::Err<E>;
}

impl<E> NomErrorExt<E> for nom::Err<E> {
    fn is_failure(&self) -> bool {
        matches!(self, Self::Failure(_))
    }

    fn map_err<O: FnOnce(E) -> E>(self, op: O) -> nom::Err<E> {
        match self {
            e @ Self::Failure(_) => e,
            e => e.map(op),
        }
    }

    fn map_fail<O: FnOnce(E) -> E>(self, op: O) -> nom::Err<E> {
        match self {
            e @ Self::Error(_) => e,
            e => e.map(op),
        }
    }
}

/// cut a parser and map the error
pub fn cut_with_err<'a, O>(
    mut parser: impl FnMut(Span<'a>) -> IResult<'a, O>,
    mut with: impl FnMut(Error<'a>) -> Error<'a>,
) -> impl FnMut(Span<'a>) -> IResult<'a, O> {
    move |input| match parser.parse(input) {
        Err(nom::Err::Error(e)) => Err(nom::Err::Failure(with(e))),
        rest => rest,
    }
}

#[derive(Debug)]
pub struct Error<'a> {
    context: Span<'a>,
    kind: ErrorKind,
}

#[derive(Debug)]
pub enum ErrorKind {
    UnexpectedChar(char),
    ExpectedFieldColon,
    ExpectedValue,
    MissingClosingBrace,
    MissingClosingParen,
    MissingClosingBracket,
    MissingClosingQuote,
    ExpectedRangeSeparator,
    InvalidNumber(String),
    EmptyRange,
    InvalidTagWildcard,
    NumericNeedsField,
    TagNeedsField,
    EmptyOrLeftSide,
    EmptyTextToken,
    EmptyQuotedPhrase,
    WildcardOnlyToken,
    DepthLimitReached,
    TooManyNodes,
    ExpectedEof,
    Char(char),
    InternalError(error::ErrorKind),
}

impl<'a> Error<'a> {
    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    pub fn context(&self) -> &Span<'a> {
        &self.context
    }

    pub fn new_from_kind(context: Span<'a>, kind: ErrorKind) -> Self {
        Self { context, kind }
    }

    pub fn failure_from_kind(context: Span<'a>, kind: ErrorKind) -> nom::Err<Self> {
        nom::Err::Failure(Self::new_from_kind(context, kind))
    }

    pub fn char(self) -> char {
        match self.kind {
            ErrorKind::Char(c) => c,
            error => panic!("Internal filter parser error: {:?}", error),
        }
    }
}

impl<'a> ParseError<Span<'a>> for Error<'a> {
    fn from_error_kind(input: Span<'a>, kind: error::ErrorKind) -> Self {
        let kind = match kind {
            error::ErrorKind::Eof => ErrorKind::ExpectedEof,
            kind => ErrorKind::InternalError(kind),
        };
        Self { context: input, kind }
    }

    fn append(_input: Span<'a>, _kind: error::ErrorKind, other: Self) -> Self {
        other
    }

    fn from_char(input: Span<'a>, c: char) -> Self {
        Self { context: input, kind: ErrorKind::Char(c) }
    }
}

impl<'a> Display for Error<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let input = self.context.fragment();
        let escaped_input = input.escape_debug();

        match &self.kind {
            ErrorKind::UnexpectedChar(c) => {
                writeln!(f, "Unexpected character `{}`.", c.escape_debug())?
            }
            ErrorKind::ExpectedFieldColon => {
                writeln!(f, "Was expecting `:` after the field name.")?
            }
            ErrorKind::ExpectedValue if input.trim().is_empty() => {
                writeln!(f, "Was expecting a value but instead got nothing.")?
            }
            ErrorKind::ExpectedValue => {
                writeln!(f, "Was expecting a value but instead got `{}`.", escaped_input)?
            }
            ErrorKind::MissingClosingBrace => {
                writeln!(f, "Missing closing tag bracket `}}`.")?
            }
            ErrorKind::MissingClosingParen => {
                writeln!(f, "Expression `{}` is missing a closing `)`.", escaped_input)?
            }
            ErrorKind::MissingClosingBracket => {
                writeln!(f, "Was expecting `]` to close the numeric range.")?
            }
            ErrorKind::MissingClosingQuote => {
                writeln!(f, "Expression `{}` is missing a closing `\"`.", escaped_input)?
            }
            ErrorKind::ExpectedRangeSeparator => {
                writeln!(
                    f,
                    "Expected a space or `,` between the start and end values of a numeric range."
                )?
            }
            ErrorKind::InvalidNumber(n) => writeln!(f, "Invalid number: `{}`.", n)?,
            ErrorKind::EmptyRange => {
                writeln!(f, "Start and end values of a numeric range indicate an empty range.")?
            }
            ErrorKind::InvalidTagWildcard => {
                writeln!(f, "A tag prefix must end with a single `*`.")?
            }
            ErrorKind::NumericNeedsField => {
                writeln!(f, "A numeric range must follow an explicit `@field:`.")?
            }
            ErrorKind::TagNeedsField => {
                writeln!(f, "A tag list must follow an explicit `@field:`.")?
            }
            ErrorKind::EmptyOrLeftSide => writeln!(f, "Empty left side of OR `|`.")?,
            ErrorKind::EmptyTextToken => writeln!(f, "Empty text token.")?,
            ErrorKind::EmptyQuotedPhrase => writeln!(f, "Empty quoted string.")?,
            ErrorKind::WildcardOnlyToken => {
                writeln!(f, "Wildcard token must contain at least one character besides `*`.")?
            }
            ErrorKind::DepthLimitReached | ErrorKind::TooManyNodes => {
                writeln!(f, "Query string is too complex.")?
            }
            ErrorKind::ExpectedEof => {
                writeln!(f, "Found unexpected characters at the end of the query: `{}`.", escaped_input)?
            }
            ErrorKind::Char(c) => {
                panic!("Tried to display a char error with `{}`", c)
            }
            ErrorKind::InternalError(kind) => writeln!(
                f,
                "Encountered an internal `{:?}` error while parsing your query. Please fill an issue",
                kind
            )?,
        }
        let base_column = self.context.get_utf8_column();
        let size = self.context.fragment().chars().count();

        write!(f, "{}:{} {}", base_column, base_column + size, self.context.extra)
    }
}

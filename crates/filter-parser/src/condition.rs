use nom::bytes::complete::take_while1;
use nom::character::complete::{char, multispace0};
use nom::{InputIter, Slice};

use crate::value::unescape_tag;
use crate::{Error, ErrorKind, IResult, Span, Token};

/// One endpoint-qualified numeric range, already validated to be non-empty.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NumericRange {
    pub start: f64,
    pub end: f64,
    pub inclusive_start: bool,
    pub inclusive_end: bool,
}

impl NumericRange {
    pub fn contains(&self, v: f64) -> bool {
        let above = v > self.start || (v == self.start && self.inclusive_start);
        let below = v < self.end || (v == self.end && self.inclusive_end);
        above && below
    }
}

/// A single tag pattern from a `{...}` list. The value is unescaped; a
/// trailing `*` turns the pattern into a prefix match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagPattern {
    pub value: String,
    pub is_prefix: bool,
}

fn is_number_char(c: char) -> bool {
    c.is_ascii_digit() || c == '.' || c == '-' || c == '+' || c == 'e' || c == 'E'
}

fn parse_number(input: Span) -> IResult<f64> {
    let (input, _) = multispace0(input)?;
    for (keyword, value) in
        [("-inf", f64::NEG_INFINITY), ("+inf", f64::INFINITY), ("inf", f64::INFINITY)]
    {
        let frag = *input.fragment();
        if frag.len() >= keyword.len() && frag[..keyword.len()].eq_ignore_ascii_case(keyword) {
            return Ok((input.slice(keyword.len()..), value));
        }
    }
    let (rest, number) = take_while1(is_number_char)(input).map_err(|e: nom::Err<Error>| {
        e.map(|_| Error::new_from_kind(input, ErrorKind::InvalidNumber(peek_word(input))))
    })?;
    match number.fragment().parse::<f64>() {
        Ok(v) if !v.is_nan() => Ok((rest, v)),
        _ => Err(Error::failure_from_kind(
            number,
            ErrorKind::InvalidNumber(number.fragment().to_string()),
        )),
    }
}

fn peek_word(input: Span) -> String {
    input.fragment().split_whitespace().next().unwrap_or("").to_string()
}

/// Parses a numeric range body. The input must be positioned right after the
/// opening `[`. Grammar: `'('? num (' '|',') '('? num ']'` where a leading
/// `(` makes the endpoint exclusive.
pub fn parse_numeric_range(input: Span) -> IResult<NumericRange> {
    let start_span = input;
    let (input, _) = multispace0(input)?;
    let (input, open) = nom::combinator::opt(char('('))(input)?;
    let inclusive_start = open.is_none();
    let (input, start) = parse_number(input)?;

    let (input, sep) = nom::combinator::opt(nom::branch::alt((char(' '), char(','))))(input)?;
    let input = if sep.is_some() {
        input
    } else {
        // a run of whitespace also separates the endpoints
        let (rest, ws) = multispace0(input)?;
        if ws.fragment().is_empty() {
            return Err(Error::failure_from_kind(input, ErrorKind::ExpectedRangeSeparator));
        }
        rest
    };

    let (input, _) = multispace0(input)?;
    let (input, open) = nom::combinator::opt(char('('))(input)?;
    let inclusive_end = open.is_none();
    let (input, end) = parse_number(input)?;
    let (input, _) = multispace0(input)?;
    let (input, _) = char(']')(input).map_err(|e: nom::Err<Error>| {
        e.map(|_| Error::new_from_kind(input, ErrorKind::MissingClosingBracket))
    })?;

    if start > end || (start == end && !(inclusive_start && inclusive_end)) {
        return Err(Error::failure_from_kind(start_span, ErrorKind::EmptyRange));
    }
    Ok((input, NumericRange { start, end, inclusive_start, inclusive_end }))
}

/// Parses a tag list body. The input must be positioned right after the
/// opening `{`. The list always splits on `|`; `\|` and `\\` escape a
/// literal pipe and backslash inside a value. Prefix patterns shorter than
/// two characters are silently dropped.
pub fn parse_tag_list(input: Span) -> IResult<(Token, Vec<TagPattern>)> {
    let close = input
        .iter_indices()
        .find(|&(_, c)| c == '}')
        .map(|(idx, _)| idx)
        .ok_or_else(|| Error::failure_from_kind(input, ErrorKind::MissingClosingBrace))?;
    let raw_span = input.slice(..close);
    let rest = input.slice(close + 1..);

    let mut patterns = Vec::new();
    for piece in split_tags(raw_span.fragment()) {
        let piece = piece.trim();
        if piece.is_empty() {
            continue;
        }
        if let Some(stripped) = piece.strip_suffix('*') {
            if stripped.ends_with('*') {
                return Err(Error::failure_from_kind(raw_span, ErrorKind::InvalidTagWildcard));
            }
            let value = unescape_tag(stripped);
            // prefixes below the two-character floor never match anything
            if value.chars().count() < 2 {
                continue;
            }
            patterns.push(TagPattern { value, is_prefix: true });
        } else {
            patterns.push(TagPattern { value: unescape_tag(piece), is_prefix: false });
        }
    }
    Ok((rest, (raw_span.into(), patterns)))
}

/// Split on unescaped `|`, leaving the escapes in place for [`unescape_tag`].
fn split_tags(raw: &str) -> Vec<&str> {
    let mut pieces = Vec::new();
    let mut start = 0;
    let mut escaped = false;
    for (idx, c) in raw.char_indices() {
        if escaped {
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else if c == '|' {
            pieces.push(&raw[start..idx]);
            start = idx + 1;
        }
    }
    pieces.push(&raw[start..]);
    pieces
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(s: &str) -> Result<NumericRange, String> {
        let span = Span::new_extra(s, s);
        match parse_numeric_range(span) {
            Ok((_, r)) => Ok(r),
            Err(nom::Err::Error(e) | nom::Err::Failure(e)) => Err(e.to_string()),
            Err(e) => Err(e.to_string()),
        }
    }

    fn tags(s: &str) -> Vec<TagPattern> {
        let span = Span::new_extra(s, s);
        parse_tag_list(span).unwrap().1 .1
    }

    #[test]
    fn ranges() {
        let r = range("1 10]").unwrap();
        assert_eq!((r.start, r.end), (1.0, 10.0));
        assert!(r.inclusive_start && r.inclusive_end);

        let r = range("(1 10]").unwrap();
        assert!(!r.inclusive_start && r.inclusive_end);

        let r = range("1,(10]").unwrap();
        assert!(r.inclusive_start && !r.inclusive_end);

        let r = range("-inf +inf]").unwrap();
        assert_eq!((r.start, r.end), (f64::NEG_INFINITY, f64::INFINITY));

        let r = range("inf inf]").unwrap();
        assert_eq!((r.start, r.end), (f64::INFINITY, f64::INFINITY));

        let r = range("-1.5 -0.5]").unwrap();
        assert_eq!((r.start, r.end), (-1.5, -0.5));
    }

    #[test]
    fn range_inclusivity() {
        assert!(range("[5 5]").is_err()); // '[' is not consumed by this parser
        let r = range("5 5]").unwrap();
        assert!(r.contains(5.0));
        assert!(range("(5 5]").is_err());
        assert!(range("5 (5]").is_err());
        assert!(range("10 1]").is_err());

        let r = range("(1 10)]").is_err();
        assert!(r); // ')' is not a valid exclusive marker on the right

        let r = range("(1 (10]").unwrap();
        assert!(!r.contains(1.0));
        assert!(!r.contains(10.0));
        assert!(r.contains(1.0000001));
    }

    #[test]
    fn range_errors() {
        assert!(range("nan 10]").is_err());
        assert!(range("1 10").is_err());
        assert!(range("abc 10]").is_err());
    }

    #[test]
    fn tag_lists() {
        assert_eq!(
            tags("a|b}"),
            vec![
                TagPattern { value: "a".into(), is_prefix: false },
                TagPattern { value: "b".into(), is_prefix: false }
            ]
        );
        assert_eq!(tags(r"a\|b}"), vec![TagPattern { value: "a|b".into(), is_prefix: false }]);
        assert_eq!(
            tags(r"a\\|b}"),
            vec![
                TagPattern { value: r"a\".into(), is_prefix: false },
                TagPattern { value: "b".into(), is_prefix: false }
            ]
        );
        assert_eq!(tags(r"a\\\|b}"), vec![TagPattern { value: r"a\|b".into(), is_prefix: false }]);
        assert_eq!(tags("dis*}"), vec![TagPattern { value: "dis".into(), is_prefix: true }]);
        // below the two-character prefix floor: silently dropped
        assert_eq!(tags("d*}"), vec![]);
        // double trailing star is malformed
        let span = Span::new_extra("dis**}", "dis**}");
        assert!(parse_tag_list(span).is_err());
    }

    #[test]
    fn tag_list_requires_close() {
        let span = Span::new_extra("a|b", "a|b");
        assert!(parse_tag_list(span).is_err());
    }
}

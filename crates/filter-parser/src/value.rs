use nom::bytes::complete::take_while1;
use nom::{InputIter, InputLength, Slice};

use crate::{Error, ErrorKind, IResult, Span, TextToken, Token};

/// A bare token stops on whitespace and on every character that carries
/// query-language syntax.
pub fn is_bare_token_char(c: char) -> bool {
    !c.is_whitespace() && !['(', ')', '|', '@', '{', '['].contains(&c)
}

pub fn parse_bare_token(input: Span) -> IResult<Token> {
    let (input, word) = take_while1(is_bare_token_char)(input)
        .map_err(|e: nom::Err<Error>| e.map(|_| Error::new_from_kind(input, ErrorKind::EmptyTextToken)))?;
    Ok((input, word.into()))
}

fn leading_run(s: &str, marker: char) -> usize {
    s.chars().take_while(|&c| c == marker).count()
}

fn trailing_run(s: &str, marker: char) -> usize {
    s.chars().rev().take_while(|&c| c == marker).count()
}

/// Classifies a raw token into its text-operation kind.
///
/// A leading and/or trailing `*` makes the token a suffix / prefix / infix
/// pattern. Equal-length runs of 1..=3 `%` on both sides make it fuzzy with
/// the run length as the allowed edit distance. Everything else is a term.
pub fn classify_token(token: Token) -> Result<TextToken, nom::Err<Error>> {
    let span = token.original_span();
    let frag = *span.fragment();

    let starts = frag.starts_with('*');
    let ends = frag.ends_with('*');
    if starts || ends {
        let from = usize::from(starts);
        let to = frag.len() - usize::from(ends && frag.len() > from);
        if from >= to {
            return Err(Error::failure_from_kind(span, ErrorKind::WildcardOnlyToken));
        }
        let inner: Token = span.slice(from..to).into();
        return Ok(match (starts, ends) {
            (true, true) => TextToken::Infix(inner),
            (true, false) => TextToken::Suffix(inner),
            (false, true) => TextToken::Prefix(inner),
            (false, false) => unreachable!(),
        });
    }

    if frag.len() >= 3 {
        let lead = leading_run(frag, '%');
        let tail = trailing_run(frag, '%');
        if lead == tail && (1..=3).contains(&lead) && lead + tail < frag.len() {
            let inner: Token = span.slice(lead..frag.len() - tail).into();
            return Ok(TextToken::Fuzzy(inner, lead as u8));
        }
    }

    Ok(TextToken::Term(token))
}

/// Parses the body of a quoted phrase. The input must be positioned right
/// after the opening `"`. Whitespace splits the phrase into tokens, each of
/// which is classified like a bare token.
pub fn parse_quoted_phrase(input: Span) -> IResult<Vec<TextToken>> {
    let mut terms = Vec::new();
    let mut start = None;
    for (idx, c) in input.iter_indices() {
        if c == '"' {
            if let Some(s) = start {
                terms.push(classify_token(input.slice(s..idx).into())?);
            }
            if terms.is_empty() {
                return Err(Error::failure_from_kind(input, ErrorKind::EmptyQuotedPhrase));
            }
            return Ok((input.slice(idx + 1..), terms));
        } else if c.is_whitespace() {
            if let Some(s) = start.take() {
                terms.push(classify_token(input.slice(s..idx).into())?);
            }
        } else if start.is_none() {
            start = Some(idx);
        }
    }
    Err(Error::failure_from_kind(input.slice(input.input_len()..), ErrorKind::MissingClosingQuote))
}

/// Unescape `\|` and `\\` inside a tag value.
pub fn unescape_tag(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some(next @ ('|' | '\\')) => out.push(next),
                Some(next) => {
                    out.push(c);
                    out.push(next);
                }
                None => out.push(c),
            }
        } else {
            out.push(c);
        }
    }
    out
}

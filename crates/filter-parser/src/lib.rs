//! BNF grammar:
//!
//! ```text
//! query      = WS* '*' (WS* '(' WS* '*' WS* ')')? WS* EOF   -- match all
//!            | expression EOF
//! expression = or
//! or         = and (WS* '|' and)*
//! and        = unary+                                        -- implicit AND
//! unary      = WS* '-'? ( '(' expression ')' | atom )
//! atom       = field ':' ( '[' numRange | '{' tagList | textGroup )
//!            | textGroup
//! field      = '@' ident
//! numRange   = '('? num (' '|','|WS+) '('? num WS* ']'
//! num        = float | 'inf' | '+inf' | '-inf'
//! tagList    = tag ('|' tag)* '}'       -- '\|' and '\\' escape inside a tag
//! textGroup  = textAtom ( WS+ textAtom | field ':'? textAtom
//!            | field ':' ('[' numRange | '{' tagList) )*
//! textAtom   = '"' phrase '"' | bareToken
//! bareToken  = [^ \t()|@{[]+ with:
//!                leading/trailing '*'            -> suffix/prefix/infix
//!                balanced '%' runs of 1..3       -> fuzzy(distance = run)
//! ```
//!
//! The parser is schema-free: it produces an untyped, span-carrying AST that
//! the engine later types and validates against an index schema. Depth and
//! node-count budgets are enforced while parsing so a hostile query cannot
//! blow the stack or allocate an unbounded tree.

mod condition;
mod error;
mod value;

use std::cell::Cell;
use std::fmt::Debug;

pub use condition::{parse_numeric_range, parse_tag_list, NumericRange, TagPattern};
pub use error::{Error, ErrorKind};
use nom::character::complete::multispace0;
use nom::{InputLength, Slice};
use nom_locate::LocatedSpan;
pub use value::{classify_token, parse_bare_token, parse_quoted_phrase, unescape_tag};

pub type Span<'a> = LocatedSpan<&'a str, &'a str>;

type IResult<'a, Ret> = nom::IResult<Span<'a>, Ret, Error<'a>>;

#[derive(Debug, Clone, Eq)]
pub struct Token<'a> {
    /// The token in the original input, it should be used when possible.
    span: Span<'a>,
    /// If you need to modify the original input you can use the `value` field
    /// to store your modified input.
    value: Option<String>,
}

impl<'a> PartialEq for Token<'a> {
    fn eq(&self, other: &Self) -> bool {
        self.span.fragment() == other.span.fragment()
    }
}

impl<'a> Token<'a> {
    pub fn new(span: Span<'a>, value: Option<String>) -> Self {
        Self { span, value }
    }

    /// Return the string contained in the token.
    pub fn value(&self) -> &str {
        self.value.as_ref().map_or(&self.span, |value| value)
    }

    /// Returns a copy of the span this token was created with.
    pub fn original_span(&self) -> Span<'a> {
        self.span
    }
}

impl<'a> From<Span<'a>> for Token<'a> {
    fn from(span: Span<'a>) -> Self {
        Self { span, value: None }
    }
}

/// Allow [Token] to be constructed from &[str]
impl<'a> From<&'a str> for Token<'a> {
    fn from(s: &'a str) -> Self {
        Token::from(Span::new_extra(s, s))
    }
}

/// One classified text token.
#[derive(Debug, Clone, PartialEq)]
pub enum TextToken<'a> {
    Term(Token<'a>),
    Prefix(Token<'a>),
    Suffix(Token<'a>),
    Infix(Token<'a>),
    Fuzzy(Token<'a>, u8),
}

impl<'a> TextToken<'a> {
    pub fn token(&self) -> &Token<'a> {
        match self {
            TextToken::Term(t)
            | TextToken::Prefix(t)
            | TextToken::Suffix(t)
            | TextToken::Infix(t)
            | TextToken::Fuzzy(t, _) => t,
        }
    }
}

/// One atom of a text group, either a single token or a quoted phrase, with
/// the field scope that was active when the atom was parsed.
#[derive(Debug, Clone, PartialEq)]
pub enum TextAtom<'a> {
    Token { field: Option<Token<'a>>, token: TextToken<'a> },
    Phrase { field: Option<Token<'a>>, terms: Vec<TextToken<'a>> },
}

impl<'a> TextAtom<'a> {
    pub fn field(&self) -> Option<&Token<'a>> {
        match self {
            TextAtom::Token { field, .. } | TextAtom::Phrase { field, .. } => field.as_ref(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FilterAst<'a> {
    And(Vec<Self>),
    Or(Vec<Self>),
    Not(Box<Self>),
    Numeric { field: Token<'a>, range: NumericRange },
    Tag { field: Token<'a>, raw: Token<'a>, patterns: Vec<TagPattern> },
    TextGroup { atoms: Vec<TextAtom<'a>> },
}

/// Budgets enforced while parsing.
#[derive(Debug, Clone, Copy)]
pub struct ParserLimits {
    pub max_depth: u32,
    pub max_nodes: u32,
}

impl Default for ParserLimits {
    fn default() -> Self {
        Self { max_depth: 1000, max_nodes: 16 }
    }
}

impl<'a> FilterAst<'a> {
    /// Parses a query string. Returns `Ok(None)` for the match-all special
    /// form (`*`, optionally wrapped in one balanced pair of parentheses).
    pub fn parse(input: &'a str, limits: ParserLimits) -> Result<Option<Self>, Error<'a>> {
        let span = Span::new_extra(input, input);
        match is_match_all(span) {
            Ok(true) => return Ok(None),
            Ok(false) => (),
            Err(nom::Err::Error(e) | nom::Err::Failure(e)) => return Err(e),
            Err(nom::Err::Incomplete(_)) => unreachable!("complete input"),
        }
        let parser = FilterParser { limits, node_count: Cell::new(0) };
        match parser.parse_expression(span, 0) {
            Ok((rest, ast)) => {
                let (rest, _) = multispace0::<_, Error>(rest).expect("multispace0 is infallible");
                if rest.input_len() != 0 {
                    return Err(Error::new_from_kind(rest, ErrorKind::ExpectedEof));
                }
                Ok(Some(ast))
            }
            Err(nom::Err::Error(e) | nom::Err::Failure(e)) => Err(e),
            Err(nom::Err::Incomplete(_)) => unreachable!("complete input"),
        }
    }
}

/// Recognizes `*` with at most one balanced pair of parentheses around it.
/// Anything else that starts like the special form but does not finish it is
/// a positional error; a leading `((` falls back to regular parsing.
fn is_match_all(input: Span) -> Result<bool, nom::Err<Error>> {
    let mut input = input;
    let mut open_bracket = false;
    let mut close_bracket = false;
    let mut found_asterisk = false;
    loop {
        let (rest, _) = multispace0::<_, Error>(input)?;
        input = rest;
        let Some(c) = input.fragment().chars().next() else { break };
        match c {
            '*' => {
                if found_asterisk || close_bracket {
                    return Err(Error::failure_from_kind(input, ErrorKind::UnexpectedChar('*')));
                }
                found_asterisk = true;
            }
            '(' => {
                if found_asterisk || close_bracket {
                    return Err(Error::failure_from_kind(input, ErrorKind::UnexpectedChar('(')));
                }
                if open_bracket {
                    return Ok(false);
                }
                open_bracket = true;
            }
            ')' => {
                if !close_bracket && found_asterisk && open_bracket {
                    close_bracket = true;
                } else {
                    return Err(Error::failure_from_kind(input, ErrorKind::UnexpectedChar(')')));
                }
            }
            _ => break,
        }
        input = input.slice(c.len_utf8()..);
    }
    if !found_asterisk {
        return Ok(false);
    }
    if input.input_len() == 0 {
        if open_bracket == close_bracket {
            return Ok(true);
        }
        return Err(Error::failure_from_kind(input, ErrorKind::MissingClosingParen));
    }
    let c = input.fragment().chars().next().unwrap();
    Err(Error::failure_from_kind(input, ErrorKind::UnexpectedChar(c)))
}

struct FilterParser {
    limits: ParserLimits,
    node_count: Cell<u32>,
}

fn peek_char(input: Span) -> Option<char> {
    input.fragment().chars().next()
}

fn is_field_char(c: char) -> bool {
    !c.is_whitespace() && !['(', ')', '|', '@', '{', '[', ':', '"'].contains(&c)
}

/// field = '@' ident, optionally followed by ':' (mandatory at the atom
/// position, optional when the field re-scopes a running text group).
fn parse_field_name(input: Span, require_colon: bool) -> IResult<Token> {
    let (input, _) = nom::character::complete::char('@')(input)?;
    let (input, name) = nom::bytes::complete::take_while1(is_field_char)(input)
        .map_err(|e: nom::Err<Error>| e.map(|_| Error::new_from_kind(input, ErrorKind::ExpectedValue)))?;
    let (input, _) = multispace0(input)?;
    match nom::character::complete::char::<_, Error>(':')(input) {
        Ok((input, _)) => Ok((input, name.into())),
        Err(_) if !require_colon => Ok((input, name.into())),
        Err(_) => Err(Error::failure_from_kind(input, ErrorKind::ExpectedFieldColon)),
    }
}

impl FilterParser {
    fn bump_node_count<'a>(&self, at: Span<'a>) -> Result<(), nom::Err<Error<'a>>> {
        let count = self.node_count.get() + 1;
        self.node_count.set(count);
        if count > self.limits.max_nodes {
            return Err(Error::failure_from_kind(at, ErrorKind::TooManyNodes));
        }
        Ok(())
    }

    /// expression = and (WS* '|' and)*, with the AND level inlined: members
    /// accumulate by juxtaposition and `|` flushes them into an OR branch.
    fn parse_expression<'a>(&self, input: Span<'a>, depth: u32) -> IResult<'a, FilterAst<'a>> {
        if depth >= self.limits.max_depth {
            return Err(Error::failure_from_kind(input, ErrorKind::DepthLimitReached));
        }
        let mut input = input;
        let mut and_members: Vec<FilterAst<'a>> = Vec::new();
        let mut or_groups: Vec<FilterAst<'a>> = Vec::new();
        let mut last_text_field: Option<Token<'a>> = None;

        loop {
            let (rest, _) = multispace0(input)?;
            input = rest;
            match peek_char(input) {
                None | Some(')') => break,
                Some('|') => {
                    if and_members.is_empty() {
                        return Err(Error::failure_from_kind(input, ErrorKind::EmptyOrLeftSide));
                    }
                    input = input.slice(1..);
                    or_groups.push(fold_and(std::mem::take(&mut and_members)));
                    continue;
                }
                _ => (),
            }

            let (rest, negate) =
                nom::combinator::opt(nom::character::complete::char('-'))(input)?;
            input = rest;
            let (rest, _) = multispace0(input)?;
            input = rest;

            let node = if let Some('(') = peek_char(input) {
                let (rest, node) = self.parse_expression(input.slice(1..), depth + 1)?;
                let (rest, _) = multispace0(rest)?;
                match peek_char(rest) {
                    Some(')') => {
                        input = rest.slice(1..);
                        self.bump_node_count(input)?;
                        node
                    }
                    _ => {
                        return Err(Error::failure_from_kind(input, ErrorKind::MissingClosingParen))
                    }
                }
            } else {
                let field = if let Some('@') = peek_char(input) {
                    let (rest, field) = parse_field_name(input, true)?;
                    input = rest;
                    Some(field)
                } else {
                    None
                };
                let (rest, _) = multispace0(input)?;
                input = rest;
                match peek_char(input) {
                    Some('[') => {
                        let field = field.ok_or_else(|| {
                            Error::failure_from_kind(input, ErrorKind::NumericNeedsField)
                        })?;
                        let (rest, range) = parse_numeric_range(input.slice(1..))?;
                        input = rest;
                        self.bump_node_count(input)?;
                        FilterAst::Numeric { field, range }
                    }
                    Some('{') => {
                        let field = field.ok_or_else(|| {
                            Error::failure_from_kind(input, ErrorKind::TagNeedsField)
                        })?;
                        let (rest, (raw, patterns)) = parse_tag_list(input.slice(1..))?;
                        input = rest;
                        self.bump_node_count(input)?;
                        FilterAst::Tag { field, raw, patterns }
                    }
                    Some(_) => {
                        let initial = field.clone().or_else(|| last_text_field.clone());
                        if let Some(f) = field {
                            last_text_field = Some(f);
                        }
                        let (rest, node) = self.parse_text_group(input, initial)?;
                        input = rest;
                        node
                    }
                    None => return Err(Error::failure_from_kind(input, ErrorKind::ExpectedValue)),
                }
            };

            and_members.push(if negate.is_some() { FilterAst::Not(Box::new(node)) } else { node });
        }

        if !or_groups.is_empty() {
            if and_members.is_empty() {
                return Err(Error::failure_from_kind(input, ErrorKind::ExpectedValue));
            }
            or_groups.push(fold_and(and_members));
            for _ in &or_groups {
                self.bump_node_count(input)?;
            }
            return Ok((input, FilterAst::Or(or_groups)));
        }
        if and_members.is_empty() {
            return Err(nom::Err::Error(Error::new_from_kind(input, ErrorKind::ExpectedValue)));
        }
        Ok((input, fold_and(and_members)))
    }

    /// textGroup = textAtom (textAtom | field textAtom | field:range | field:tags)*
    ///
    /// A `@field` in the middle re-scopes the following atoms; a mid-group
    /// numeric or tag predicate is AND-ed next to the group.
    fn parse_text_group<'a>(
        &self,
        input: Span<'a>,
        initial_field: Option<Token<'a>>,
    ) -> IResult<'a, FilterAst<'a>> {
        let mut input = input;
        let mut atoms: Vec<TextAtom<'a>> = Vec::new();
        let mut extras: Vec<FilterAst<'a>> = Vec::new();
        let mut current_field = initial_field;

        loop {
            let (rest, _) = multispace0(input)?;
            input = rest;
            match peek_char(input) {
                None | Some('|') | Some(')') | Some('(') => break,
                Some('@') => {
                    let (rest, field) = parse_field_name(input, false)?;
                    input = rest;
                    let (rest, _) = multispace0(input)?;
                    input = rest;
                    match peek_char(input) {
                        Some('[') => {
                            let (rest, range) = parse_numeric_range(input.slice(1..))?;
                            input = rest;
                            self.bump_node_count(input)?;
                            extras.push(FilterAst::Numeric { field, range });
                            continue;
                        }
                        Some('{') => {
                            let (rest, (raw, patterns)) = parse_tag_list(input.slice(1..))?;
                            input = rest;
                            self.bump_node_count(input)?;
                            extras.push(FilterAst::Tag { field, raw, patterns });
                            continue;
                        }
                        _ => current_field = Some(field),
                    }
                }
                _ => (),
            }

            let (rest, atom) = self.parse_text_atom(input, current_field.clone())?;
            input = rest;
            atoms.push(atom);
        }

        if atoms.is_empty() {
            return Err(Error::failure_from_kind(input, ErrorKind::EmptyTextToken));
        }
        self.bump_node_count(input)?;
        let group = FilterAst::TextGroup { atoms };
        if extras.is_empty() {
            Ok((input, group))
        } else {
            let mut members = Vec::with_capacity(1 + extras.len());
            members.push(group);
            members.extend(extras);
            Ok((input, FilterAst::And(members)))
        }
    }

    fn parse_text_atom<'a>(
        &self,
        input: Span<'a>,
        field: Option<Token<'a>>,
    ) -> IResult<'a, TextAtom<'a>> {
        if let Some('"') = peek_char(input) {
            let (rest, terms) = parse_quoted_phrase(input.slice(1..))?;
            return Ok((rest, TextAtom::Phrase { field, terms }));
        }
        let (rest, token) = parse_bare_token(input)?;
        let token = classify_token(token)?;
        Ok((rest, TextAtom::Token { field, token }))
    }
}

fn fold_and(mut members: Vec<FilterAst>) -> FilterAst {
    if members.len() == 1 {
        members.pop().unwrap()
    } else {
        FilterAst::And(members)
    }
}

impl<'a> std::fmt::Display for FilterAst<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FilterAst::And(els) => {
                write!(f, "AND[")?;
                for el in els {
                    write!(f, "{el}, ")?;
                }
                write!(f, "]")
            }
            FilterAst::Or(els) => {
                write!(f, "OR[")?;
                for el in els {
                    write!(f, "{el}, ")?;
                }
                write!(f, "]")
            }
            FilterAst::Not(inner) => write!(f, "NOT({inner})"),
            FilterAst::Numeric { field, range } => {
                write!(
                    f,
                    "{{{}}}:[{}{} {}{}]",
                    field.value(),
                    if range.inclusive_start { "" } else { "(" },
                    range.start,
                    if range.inclusive_end { "" } else { "(" },
                    range.end
                )
            }
            FilterAst::Tag { field, patterns, .. } => {
                write!(f, "{{{}}}:{{", field.value())?;
                for (i, p) in patterns.iter().enumerate() {
                    if i > 0 {
                        write!(f, "|")?;
                    }
                    write!(f, "{}{}", p.value, if p.is_prefix { "*" } else { "" })?;
                }
                write!(f, "}}")
            }
            FilterAst::TextGroup { atoms } => {
                write!(f, "TEXT[")?;
                for atom in atoms {
                    match atom {
                        TextAtom::Token { field, token } => {
                            write_field(f, field)?;
                            write!(f, "{token}, ")?;
                        }
                        TextAtom::Phrase { field, terms } => {
                            write_field(f, field)?;
                            write!(f, "\"")?;
                            for term in terms {
                                write!(f, "{term} ")?;
                            }
                            write!(f, "\", ")?;
                        }
                    }
                }
                write!(f, "]")
            }
        }
    }
}

fn write_field(f: &mut std::fmt::Formatter<'_>, field: &Option<Token<'_>>) -> std::fmt::Result {
    match field {
        Some(field) => write!(f, "@{}:", field.value()),
        None => Ok(()),
    }
}

impl<'a> std::fmt::Display for TextToken<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TextToken::Term(t) => write!(f, "{{{}}}", t.value()),
            TextToken::Prefix(t) => write!(f, "{{{}}}*", t.value()),
            TextToken::Suffix(t) => write!(f, "*{{{}}}", t.value()),
            TextToken::Infix(t) => write!(f, "*{{{}}}*", t.value()),
            TextToken::Fuzzy(t, d) => write!(f, "fuzzy({{{}}}, {d})", t.value()),
        }
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;

    #[track_caller]
    fn p(s: &str) -> impl std::fmt::Display + '_ {
        FilterAst::parse(s, ParserLimits::default()).unwrap().unwrap()
    }

    #[track_caller]
    fn perr(s: &str) -> String {
        FilterAst::parse(s, ParserLimits::default()).unwrap_err().to_string()
    }

    #[test]
    fn match_all() {
        for q in ["*", " * ", "(*)", "( * )", " (  *)"] {
            assert!(
                FilterAst::parse(q, ParserLimits::default()).unwrap().is_none(),
                "{q:?} should be match-all"
            );
        }
        for q in ["**", "(*", "*)", "(*))", "(* x"] {
            assert!(FilterAst::parse(q, ParserLimits::default()).is_err(), "{q:?} should fail");
        }
        // double parens fall back to the regular parser and fail there
        assert!(FilterAst::parse("((*))", ParserLimits::default()).is_err());
    }

    #[test]
    fn parse() {
        insta::assert_snapshot!(p("@num:[6 12]"), @"{num}:[6 12]");
        insta::assert_snapshot!(p("@num:[(6 12]"), @"{num}:[(6 12]");
        insta::assert_snapshot!(p("@num:[-inf +inf]"), @"{num}:[-inf inf]");
        insta::assert_snapshot!(p("@tag:{a|b}"), @"{tag}:{a|b}");
        insta::assert_snapshot!(p(r"@tag:{a\|b}"), @"{tag}:{a|b}");
        insta::assert_snapshot!(p("@tag:{dis*}"), @"{tag}:{dis*}");
        insta::assert_snapshot!(p("@t:hello"), @"TEXT[@t:{hello}, ]");
        insta::assert_snapshot!(p("@t:hello world"), @"TEXT[@t:{hello}, @t:{world}, ]");
        insta::assert_snapshot!(p("@t:\"hello world\""), @r###"TEXT[@t:"{hello} {world} ", ]"###);
        insta::assert_snapshot!(p("@t:foo* @t2:*bar %baz%"), @"TEXT[@t:{foo}*, @t2:*{bar}, @t2:fuzzy({baz}, 1), ]");
        insta::assert_snapshot!(p("-@num:[1 2]"), @"NOT({num}:[1 2])");
        insta::assert_snapshot!(p("@a:[1 2] @b:{x}"), @"AND[{a}:[1 2], {b}:{x}, ]");
        insta::assert_snapshot!(p("@a:[1 2] | @b:{x}"), @"OR[{a}:[1 2], {b}:{x}, ]");
        insta::assert_snapshot!(p("@a:[1 2] @b:{x} | @c:[3 4]"), @"OR[AND[{a}:[1 2], {b}:{x}, ], {c}:[3 4], ]");
        insta::assert_snapshot!(p("(@a:[1 2] | @b:{x}) @c:[3 4]"), @"AND[OR[{a}:[1 2], {b}:{x}, ], {c}:[3 4], ]");
        insta::assert_snapshot!(p("-(@a:[1 2] @b:{x})"), @"NOT(AND[{a}:[1 2], {b}:{x}, ])");
        insta::assert_snapshot!(p("--@a:[1 2]"), @"NOT(NOT({a}:[1 2]))");
    }

    #[test]
    fn text_group_field_scoping() {
        // a @field mid-group re-scopes the following atoms
        insta::assert_snapshot!(p("@t:hello @u world"), @"TEXT[@t:{hello}, @u:{world}, ]");
        // a mid-group numeric is AND-ed next to the group
        insta::assert_snapshot!(
            p("@t:hello @num:[1 2] world"),
            @"AND[TEXT[@t:{hello}, @t:{world}, ], {num}:[1 2], ]"
        );
        // the sticky text field does not leak into parenthesized sub-expressions
        insta::assert_snapshot!(p("@t:hello (world)"), @"AND[TEXT[@t:{hello}, ], TEXT[{world}, ], ]");
        // but it does stick across sibling nodes of the same expression
        insta::assert_snapshot!(p("@t:hello @n:[1 2] world"), @"AND[TEXT[@t:{hello}, @t:{world}, ], {n}:[1 2], ]");
    }

    #[test]
    fn errors() {
        insta::assert_snapshot!(perr("@num:[6 12"), @r###"
        Was expecting `]` to close the numeric range.
        11:11 @num:[6 12
        "###);
        insta::assert_snapshot!(perr("@num:[12 6]"), @r###"
        Start and end values of a numeric range indicate an empty range.
        7:12 @num:[12 6]
        "###);
        insta::assert_snapshot!(perr("@num:[(5 5]"), @r###"
        Start and end values of a numeric range indicate an empty range.
        7:12 @num:[(5 5]
        "###);
        insta::assert_snapshot!(perr("@tag:{a|b"), @r###"
        Missing closing tag bracket `}`.
        7:10 @tag:{a|b
        "###);
        insta::assert_snapshot!(perr("| @a:[1 2]"), @r###"
        Empty left side of OR `|`.
        1:11 | @a:[1 2]
        "###);
        insta::assert_snapshot!(perr("(@a:[1 2]"), @r###"
        Expression `(@a:[1 2]` is missing a closing `)`.
        1:10 (@a:[1 2]
        "###);
        insta::assert_snapshot!(perr("@a [1 2]"), @r###"
        Was expecting `:` after the field name.
        4:9 @a [1 2]
        "###);
        insta::assert_snapshot!(perr("@t:*"), @r###"
        Wildcard token must contain at least one character besides `*`.
        4:5 @t:*
        "###);
        insta::assert_snapshot!(perr("@t:\"\""), @r###"
        Empty quoted string.
        5:6 @t:""
        "###);
        insta::assert_snapshot!(perr("@a:[1 2] )"), @r###"
        Found unexpected characters at the end of the query: `)`.
        10:11 @a:[1 2] )
        "###);
    }

    #[test]
    fn depth_limit() {
        let query = format!("{}@a:[1 2]{}", "(".repeat(40), ")".repeat(40));
        let limits = ParserLimits { max_depth: 10, max_nodes: 1000 };
        let err = FilterAst::parse(&query, limits).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::DepthLimitReached));
        let limits = ParserLimits { max_depth: 100, max_nodes: 1000 };
        assert!(FilterAst::parse(&query, limits).is_ok());
    }

    #[test]
    fn node_limit() {
        let query = (0..20).map(|_| "@a:[1 2]").collect::<Vec<_>>().join(" ");
        let limits = ParserLimits { max_nodes: 16, ..ParserLimits::default() };
        let err = FilterAst::parse(&query, limits).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::TooManyNodes));
    }

    #[test]
    fn or_branch_counting() {
        // 8 branches + 8 leaf nodes = 16 fits, one more branch does not
        let query = (0..8).map(|_| "@a:[1 2]").collect::<Vec<_>>().join(" | ");
        let limits = ParserLimits { max_nodes: 16, ..ParserLimits::default() };
        assert!(FilterAst::parse(&query, limits).is_ok());
        let query = (0..9).map(|_| "@a:[1 2]").collect::<Vec<_>>().join(" | ");
        assert!(FilterAst::parse(&query, limits).is_err());
    }
}

//! Dynamically-typed values for the aggregate expression language.

use std::sync::Arc;

use time::{Date, Month, OffsetDateTime, Time};

/// Total-order comparison result. `Unordered` only appears when exactly one
/// side is Nil.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ordering {
    Less,
    Equal,
    Greater,
    Unordered,
}

#[derive(Clone, Debug)]
pub enum Value {
    Nil(&'static str),
    Bool(bool),
    Num(f64),
    Str(Arc<str>),
}

const SIGN_BIT_MASK: u64 = 0x8000_0000_0000_0000;

impl Value {
    pub fn nil(reason: &'static str) -> Self {
        Value::Nil(reason)
    }

    /// NaN results are normalized to Nil so they never escape into replies.
    pub fn num(d: f64) -> Self {
        if d.is_nan() {
            Value::Nil("Computation was not a number")
        } else {
            Value::Num(d)
        }
    }

    pub fn str(s: impl Into<Arc<str>>) -> Self {
        Value::Str(s.into())
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil(_))
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Nil(_) => None,
            Value::Bool(b) => Some(f64::from(*b)),
            Value::Num(d) => Some(*d),
            Value::Str(s) => match s.trim().parse::<f64>() {
                Ok(v) if !v.is_nan() => Some(v),
                _ => None,
            },
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Nil(_) => None,
            Value::Bool(b) => Some(*b),
            Value::Num(d) => Some(*d != 0.0),
            Value::Str(_) => self.as_f64().map(|d| d != 0.0),
        }
    }

    pub fn as_string(&self) -> String {
        match self {
            Value::Nil(_) => String::new(),
            Value::Bool(b) => if *b { "1" } else { "0" }.to_string(),
            Value::Num(d) => format_num(*d),
            Value::Str(s) => s.to_string(),
        }
    }

    /// FILTER truth: non-nil, non-zero number, non-empty string.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Nil(_) => false,
            Value::Bool(b) => *b,
            Value::Num(d) => *d != 0.0,
            Value::Str(s) => !s.is_empty(),
        }
    }
}

pub fn format_num(d: f64) -> String {
    if d.is_infinite() {
        if d > 0.0 { "inf".to_string() } else { "-inf".to_string() }
    } else {
        format!("{d}")
    }
}

/// Strict structural equality: used for GROUPBY keys and COUNT_DISTINCT,
/// where no cross-type coercion is wanted. `-0` and `+0` are one value.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Nil(_), Value::Nil(_)) => true,
            (Value::Bool(l), Value::Bool(r)) => l == r,
            (Value::Num(l), Value::Num(r)) => normalize_bits(*l) == normalize_bits(*r),
            (Value::Str(l), Value::Str(r)) => l == r,
            _ => false,
        }
    }
}

impl Eq for Value {}

impl std::hash::Hash for Value {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Value::Nil(_) => (),
            Value::Bool(b) => b.hash(state),
            Value::Num(d) => normalize_bits(*d).hash(state),
            Value::Str(s) => s.hash(state),
        }
    }
}

fn normalize_bits(d: f64) -> u64 {
    let bits = d.to_bits();
    if bits == SIGN_BIT_MASK {
        0
    } else {
        bits
    }
}

/// Bitwise double compare so ±0 and ±∞ order consistently even under fast
/// float modes.
fn compare_doubles(l: f64, r: f64) -> Ordering {
    let mut lu = normalize_bits(l);
    let mut ru = normalize_bits(r);
    let li = lu as i64;
    let ri = ru as i64;
    if (li ^ ri) < 0 {
        return if li < 0 { Ordering::Less } else { Ordering::Greater };
    }
    if li < 0 {
        // both negative: two's complement flips them into ascending order
        lu = lu.wrapping_neg();
        ru = ru.wrapping_neg();
    }
    match lu.cmp(&ru) {
        std::cmp::Ordering::Equal => Ordering::Equal,
        std::cmp::Ordering::Less => Ordering::Less,
        std::cmp::Ordering::Greater => Ordering::Greater,
    }
}

fn compare_strings(l: &str, r: &str) -> Ordering {
    match l.as_bytes().cmp(r.as_bytes()) {
        std::cmp::Ordering::Less => Ordering::Less,
        std::cmp::Ordering::Equal => Ordering::Equal,
        std::cmp::Ordering::Greater => Ordering::Greater,
    }
}

pub fn compare(l: &Value, r: &Value) -> Ordering {
    if l.is_nil() || r.is_nil() {
        return if l.is_nil() && r.is_nil() { Ordering::Equal } else { Ordering::Unordered };
    }
    if let (Value::Num(l), Value::Num(r)) = (l, r) {
        return compare_doubles(*l, *r);
    }
    if let (Value::Str(l), Value::Str(r)) = (l, r) {
        return compare_strings(l, r);
    }
    // mixed types promote to double when both sides convert
    if let (Some(ld), Some(rd)) = (l.as_f64(), r.as_f64()) {
        return compare_doubles(ld, rd);
    }
    compare_strings(&l.as_string(), &r.as_string())
}

macro_rules! arith {
    ($name:ident, $op:tt, $reason:literal) => {
        pub fn $name(l: &Value, r: &Value) -> Value {
            match (l.as_f64(), r.as_f64()) {
                (Some(l), Some(r)) => Value::num(l $op r),
                _ => Value::nil($reason),
            }
        }
    };
}

arith!(func_add, +, "Add requires numeric operands");
arith!(func_sub, -, "Subtract requires numeric operands");
arith!(func_mul, *, "Multiply requires numeric operands");
// x/0 is ±inf per IEEE; 0/0 is NaN and collapses to Nil in Value::num
arith!(func_div, /, "Divide requires numeric operands");

pub fn func_lt(l: &Value, r: &Value) -> Value {
    Value::Bool(compare(l, r) == Ordering::Less)
}

pub fn func_le(l: &Value, r: &Value) -> Value {
    Value::Bool(matches!(compare(l, r), Ordering::Less | Ordering::Equal))
}

pub fn func_eq(l: &Value, r: &Value) -> Value {
    Value::Bool(compare(l, r) == Ordering::Equal)
}

pub fn func_ne(l: &Value, r: &Value) -> Value {
    Value::Bool(compare(l, r) != Ordering::Equal)
}

pub fn func_gt(l: &Value, r: &Value) -> Value {
    Value::Bool(compare(l, r) == Ordering::Greater)
}

pub fn func_ge(l: &Value, r: &Value) -> Value {
    Value::Bool(matches!(compare(l, r), Ordering::Greater | Ordering::Equal))
}

pub fn func_lor(l: &Value, r: &Value) -> Value {
    match (l.as_bool(), r.as_bool()) {
        (Some(l), Some(r)) => Value::Bool(l || r),
        _ => Value::nil("lor requires booleans"),
    }
}

pub fn func_land(l: &Value, r: &Value) -> Value {
    match (l.as_bool(), r.as_bool()) {
        (Some(l), Some(r)) => Value::Bool(l && r),
        _ => Value::nil("land requires booleans"),
    }
}

macro_rules! monadic_math {
    ($name:ident, $func:expr, $reason:literal) => {
        pub fn $name(o: &Value) -> Value {
            match o.as_f64() {
                Some(d) => Value::num($func(d)),
                None => Value::nil($reason),
            }
        }
    };
}

monadic_math!(func_abs, f64::abs, "abs couldn't convert to a double");
monadic_math!(func_ceil, f64::ceil, "ceil couldn't convert to a double");
monadic_math!(func_floor, f64::floor, "floor couldn't convert to a double");
monadic_math!(func_exp, f64::exp, "exp couldn't convert to a double");
monadic_math!(func_log, f64::ln, "log couldn't convert to a double");
monadic_math!(func_log2, f64::log2, "log2 couldn't convert to a double");
monadic_math!(func_sqrt, f64::sqrt, "sqrt couldn't convert to a double");

pub fn func_exists(o: &Value) -> Value {
    Value::Bool(!o.is_nil())
}

pub fn func_lower(o: &Value) -> Value {
    Value::str(o.as_string().to_lowercase())
}

pub fn func_upper(o: &Value) -> Value {
    Value::str(o.as_string().to_uppercase())
}

pub fn func_strlen(o: &Value) -> Value {
    Value::num(o.as_string().len() as f64)
}

pub fn func_startswith(l: &Value, r: &Value) -> Value {
    Value::Bool(l.as_string().starts_with(&r.as_string()))
}

/// Counts the non-overlapping occurrences of `r` in `l`. An empty needle
/// counts every gap, matching the original semantics.
pub fn func_contains(l: &Value, r: &Value) -> Value {
    let haystack = l.as_string();
    let needle = r.as_string();
    if needle.is_empty() {
        return Value::num((haystack.len() + 1) as f64);
    }
    let mut count = 0usize;
    let mut pos = 0usize;
    while let Some(found) = haystack[pos..].find(&needle) {
        count += 1;
        pos += found + needle.len();
    }
    Value::num(count as f64)
}

pub fn func_substr(l: &Value, m: &Value, r: &Value) -> Value {
    let s = l.as_string();
    let (Some(offset), Some(length)) = (m.as_f64(), r.as_f64()) else {
        return Value::nil("substr requires numbers for offset and length");
    };
    // negative offsets count from the end; negative length means "to the end"
    let offset =
        if offset >= 0.0 { offset as i64 } else { offset as i64 + s.len() as i64 };
    let length = if length >= 0.0 { length as i64 } else { s.len() as i64 };
    if offset < 0 || length < 0 {
        return Value::nil("Substr position or length out of range");
    }
    let (offset, length) = (offset as usize, length as usize);
    if offset > s.len() || offset + length > s.len() {
        return Value::nil("Substr position or length out of range");
    }
    Value::str(&s[offset..offset + length])
}

fn datetime(v: &Value) -> Option<OffsetDateTime> {
    let ts = v.as_f64()?;
    OffsetDateTime::from_unix_timestamp(ts as i64).ok()
}

macro_rules! time_field {
    ($name:ident, $extract:expr, $reason:literal) => {
        pub fn $name(t: &Value) -> Value {
            match datetime(t) {
                Some(dt) => Value::num($extract(dt)),
                None => Value::nil($reason),
            }
        }
    };
}

time_field!(
    func_dayofweek,
    |dt: OffsetDateTime| f64::from(dt.weekday().number_days_from_sunday()),
    "timestamp not a number"
);
time_field!(func_dayofmonth, |dt: OffsetDateTime| f64::from(dt.day()), "timestamp not a number");
time_field!(
    func_dayofyear,
    |dt: OffsetDateTime| f64::from(dt.ordinal() - 1),
    "timestamp not a number"
);
time_field!(
    func_monthofyear,
    |dt: OffsetDateTime| f64::from(dt.month() as u8 - 1),
    "timestamp not a number"
);
time_field!(func_year, |dt: OffsetDateTime| f64::from(dt.year()), "timestamp not a number");

macro_rules! time_round {
    ($name:ident, $trunc:expr) => {
        pub fn $name(t: &Value) -> Value {
            match datetime(t) {
                Some(dt) => {
                    let truncated: OffsetDateTime = $trunc(dt);
                    Value::num(truncated.unix_timestamp() as f64)
                }
                None => Value::nil(concat!(stringify!($name), ": timestamp not a number")),
            }
        }
    };
}

time_round!(func_minute, |dt: OffsetDateTime| dt
    .replace_time(Time::from_hms(dt.hour(), dt.minute(), 0).expect("valid h:m:0")));
time_round!(func_hour, |dt: OffsetDateTime| dt
    .replace_time(Time::from_hms(dt.hour(), 0, 0).expect("valid h:0:0")));
time_round!(func_day, |dt: OffsetDateTime| dt.replace_time(Time::MIDNIGHT));
time_round!(func_month, |dt: OffsetDateTime| dt
    .replace_day(1)
    .expect("day one always valid")
    .replace_time(Time::MIDNIGHT));

pub const DEFAULT_TIME_FORMAT: &str = "%FT%TZ";

/// strftime-style formatter over the subset of specifiers the expression
/// language documents: %Y %m %d %H %M %S %j %F %T %%. Anything else passes
/// through verbatim.
pub fn func_timefmt(ts: &Value, fmt: &Value) -> Value {
    let Some(dt) = datetime(ts) else {
        return Value::nil("timefmt: timestamp was not a number");
    };
    let fmt = fmt.as_string();
    let mut out = String::with_capacity(fmt.len() + 16);
    let mut chars = fmt.chars();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('Y') => out.push_str(&dt.year().to_string()),
            Some('m') => out.push_str(&format!("{:02}", dt.month() as u8)),
            Some('d') => out.push_str(&format!("{:02}", dt.day())),
            Some('H') => out.push_str(&format!("{:02}", dt.hour())),
            Some('M') => out.push_str(&format!("{:02}", dt.minute())),
            Some('S') => out.push_str(&format!("{:02}", dt.second())),
            Some('j') => out.push_str(&format!("{:03}", dt.ordinal())),
            Some('F') => out.push_str(&format!(
                "{}-{:02}-{:02}",
                dt.year(),
                dt.month() as u8,
                dt.day()
            )),
            Some('T') => {
                out.push_str(&format!("{:02}:{:02}:{:02}", dt.hour(), dt.minute(), dt.second()))
            }
            Some('%') => out.push('%'),
            Some(other) => {
                out.push('%');
                out.push(other);
            }
            None => out.push('%'),
        }
    }
    Value::str(out)
}

pub fn func_parsetime(s: &Value, fmt: &Value) -> Value {
    let text = s.as_string();
    let fmt = fmt.as_string();
    match parse_time(&text, &fmt) {
        Some(ts) => Value::num(ts as f64),
        None => Value::nil("parsetime could not parse the input"),
    }
}

fn parse_time(text: &str, fmt: &str) -> Option<i64> {
    let mut year: i32 = 1970;
    let mut month: u8 = 1;
    let mut day: u8 = 1;
    let mut hour: u8 = 0;
    let mut minute: u8 = 0;
    let mut second: u8 = 0;
    let mut ordinal: Option<u16> = None;

    let mut input = text.chars().peekable();
    let mut fmt_chars = fmt.chars();

    fn digits(input: &mut std::iter::Peekable<std::str::Chars>, max: usize) -> Option<i64> {
        let mut n: i64 = 0;
        let mut seen = 0;
        while seen < max {
            match input.peek() {
                Some(c) if c.is_ascii_digit() => {
                    n = n * 10 + i64::from(input.next().unwrap() as u8 - b'0');
                    seen += 1;
                }
                _ => break,
            }
        }
        (seen > 0).then_some(n)
    }

    while let Some(c) = fmt_chars.next() {
        if c != '%' {
            if input.next()? != c {
                return None;
            }
            continue;
        }
        match fmt_chars.next()? {
            'Y' => year = digits(&mut input, 4)? as i32,
            'm' => month = digits(&mut input, 2)? as u8,
            'd' => day = digits(&mut input, 2)? as u8,
            'H' => hour = digits(&mut input, 2)? as u8,
            'M' => minute = digits(&mut input, 2)? as u8,
            'S' => second = digits(&mut input, 2)? as u8,
            'j' => ordinal = Some(digits(&mut input, 3)? as u16),
            'F' => {
                year = digits(&mut input, 4)? as i32;
                if input.next()? != '-' {
                    return None;
                }
                month = digits(&mut input, 2)? as u8;
                if input.next()? != '-' {
                    return None;
                }
                day = digits(&mut input, 2)? as u8;
            }
            'T' => {
                hour = digits(&mut input, 2)? as u8;
                if input.next()? != ':' {
                    return None;
                }
                minute = digits(&mut input, 2)? as u8;
                if input.next()? != ':' {
                    return None;
                }
                second = digits(&mut input, 2)? as u8;
            }
            '%' => {
                if input.next()? != '%' {
                    return None;
                }
            }
            _ => return None,
        }
    }

    let date = match ordinal {
        Some(ordinal) => Date::from_ordinal_date(year, ordinal).ok()?,
        None => Date::from_calendar_date(year, Month::try_from(month).ok()?, day).ok()?,
    };
    let time = Time::from_hms(hour, minute, second).ok()?;
    let dt = OffsetDateTime::UNIX_EPOCH.replace_date(date).replace_time(time);
    Some(dt.unix_timestamp())
}

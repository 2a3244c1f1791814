//! Generic expression compiler and evaluator for aggregate pipelines.
//!
//! An expression is compiled once into an AST; the AST is then evaluated
//! against every record of the run. Attribute references are resolved at
//! compile time into integer slots of the record's field vector, so
//! evaluation never does a per-record string lookup.

pub mod value;

use std::collections::HashMap;

use once_cell::sync::Lazy;
pub use value::{compare, Ordering, Value};

use crate::error::{Error, Result, UserError};

/// Resolves `@name` references at compile time. The aggregate parameters
/// implement this over their attribute→slot map; other contexts may refuse
/// unknown names or allocate new slots.
pub trait CompileContext {
    fn resolve_attribute(&mut self, name: &str) -> Option<usize>;
}

/// Supplies field values at evaluation time, addressed by compiled slot.
pub trait RecordFields {
    fn field(&self, slot: usize) -> Value;
}

type FunctionImpl = fn(&[Value]) -> Value;
type DyadicImpl = fn(&Value, &Value) -> Value;

pub enum Expr {
    Const(Value),
    Attr { name: String, slot: usize },
    Dyadic { name: &'static str, func: DyadicImpl, left: Box<Expr>, right: Box<Expr> },
    Call { name: String, func: FunctionImpl, args: Vec<Expr> },
}

impl Expr {
    pub fn compile(ctx: &mut dyn CompileContext, input: &str) -> Result<Expr> {
        let mut compiler = Compiler { scanner: Scanner::new(input), ctx };
        let expr = compiler.expression()?.ok_or_else(|| syntax("Empty expression", 0))?;
        compiler.scanner.skip_whitespace();
        if !compiler.scanner.done() {
            return Err(syntax("Extra characters", compiler.scanner.position()));
        }
        Ok(expr)
    }

    pub fn evaluate(&self, record: &dyn RecordFields) -> Value {
        match self {
            Expr::Const(v) => v.clone(),
            Expr::Attr { slot, .. } => record.field(*slot),
            Expr::Dyadic { func, left, right, .. } => {
                let l = left.evaluate(record);
                let r = right.evaluate(record);
                func(&l, &r)
            }
            Expr::Call { func, args, .. } => {
                let values: Vec<Value> = args.iter().map(|a| a.evaluate(record)).collect();
                func(&values)
            }
        }
    }
}

impl std::fmt::Debug for Expr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Expr::Const(v) => write!(f, "Constant({v:?})"),
            Expr::Attr { name, .. } => write!(f, "@{name}"),
            Expr::Dyadic { name, left, right, .. } => write!(f, "({left:?}{name}{right:?})"),
            Expr::Call { name, args, .. } => {
                write!(f, "{name}(")?;
                for (i, a) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{a:?}")?;
                }
                write!(f, ")")
            }
        }
    }
}

struct FunctionEntry {
    min_argc: usize,
    max_argc: usize,
    func: FunctionImpl,
}

macro_rules! monadic {
    ($func:path) => {
        (|args: &[Value]| $func(&args[0])) as FunctionImpl
    };
}
macro_rules! dyadic {
    ($func:path) => {
        (|args: &[Value]| $func(&args[0], &args[1])) as FunctionImpl
    };
}

fn call_timefmt(args: &[Value]) -> Value {
    let fmt =
        args.get(1).cloned().unwrap_or_else(|| Value::str(value::DEFAULT_TIME_FORMAT));
    value::func_timefmt(&args[0], &fmt)
}

fn call_parsetime(args: &[Value]) -> Value {
    let fmt =
        args.get(1).cloned().unwrap_or_else(|| Value::str(value::DEFAULT_TIME_FORMAT));
    value::func_parsetime(&args[0], &fmt)
}

fn call_substr(args: &[Value]) -> Value {
    value::func_substr(&args[0], &args[1], &args[2])
}

static FUNCTION_TABLE: Lazy<HashMap<&'static str, FunctionEntry>> = Lazy::new(|| {
    let mut table = HashMap::new();
    let mut insert = |name, min_argc, max_argc, func| {
        table.insert(name, FunctionEntry { min_argc, max_argc, func });
    };
    insert("exists", 1, 1, monadic!(value::func_exists));

    insert("abs", 1, 1, monadic!(value::func_abs));
    insert("ceil", 1, 1, monadic!(value::func_ceil));
    insert("exp", 1, 1, monadic!(value::func_exp));
    insert("floor", 1, 1, monadic!(value::func_floor));
    insert("log", 1, 1, monadic!(value::func_log));
    insert("log2", 1, 1, monadic!(value::func_log2));
    insert("sqrt", 1, 1, monadic!(value::func_sqrt));

    insert("startswith", 2, 2, dyadic!(value::func_startswith));
    insert("contains", 2, 2, dyadic!(value::func_contains));
    insert("lower", 1, 1, monadic!(value::func_lower));
    insert("upper", 1, 1, monadic!(value::func_upper));
    insert("strlen", 1, 1, monadic!(value::func_strlen));
    insert("substr", 3, 3, call_substr as FunctionImpl);

    insert("dayofweek", 1, 1, monadic!(value::func_dayofweek));
    insert("dayofmonth", 1, 1, monadic!(value::func_dayofmonth));
    insert("dayofyear", 1, 1, monadic!(value::func_dayofyear));
    insert("monthofyear", 1, 1, monadic!(value::func_monthofyear));
    insert("year", 1, 1, monadic!(value::func_year));
    insert("minute", 1, 1, monadic!(value::func_minute));
    insert("hour", 1, 1, monadic!(value::func_hour));
    insert("day", 1, 1, monadic!(value::func_day));
    insert("month", 1, 1, monadic!(value::func_month));

    insert("timefmt", 1, 2, call_timefmt as FunctionImpl);
    insert("parsetime", 1, 2, call_parsetime as FunctionImpl);
    table
});

fn lookup_and_validate(name: &str, argc: usize) -> Result<FunctionImpl> {
    let entry = FUNCTION_TABLE
        .get(name)
        .ok_or_else(|| Error::from(UserError::UnknownFunction(name.to_string())))?;
    if argc < entry.min_argc || argc > entry.max_argc {
        return Err(UserError::BadFunctionArity {
            name: name.to_string(),
            min: entry.min_argc,
            max: entry.max_argc,
            got: argc,
        }
        .into());
    }
    Ok(entry.func)
}

fn syntax(message: &str, position: usize) -> Error {
    UserError::ExprSyntax { message: message.to_string(), position }.into()
}

/// Byte-position scanner over the expression source.
#[derive(Clone)]
struct Scanner<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Scanner<'a> {
    fn new(input: &'a str) -> Self {
        Self { input, pos: 0 }
    }

    fn done(&self) -> bool {
        self.pos >= self.input.len()
    }

    fn position(&self) -> usize {
        self.pos
    }

    fn peek(&self) -> Option<char> {
        self.input[self.pos..].chars().next()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    fn pop_char(&mut self, expected: char) -> bool {
        if self.peek() == Some(expected) {
            self.pos += expected.len_utf8();
            true
        } else {
            false
        }
    }

    fn skip_whitespace(&mut self) {
        while let Some(c) = self.peek() {
            if !c.is_whitespace() {
                break;
            }
            self.pos += c.len_utf8();
        }
    }

    /// Consumes `word` if the input starts with it (after whitespace).
    fn skip_whitespace_pop_word(&mut self, word: &str) -> bool {
        self.skip_whitespace();
        if self.input[self.pos..].starts_with(word) {
            self.pos += word.len();
            true
        } else {
            false
        }
    }

    fn pop_identifier(&mut self) -> String {
        let mut ident = String::new();
        while matches!(self.peek(), Some(c) if c.is_alphanumeric() || c == '_') {
            ident.push(self.bump().unwrap());
        }
        ident
    }

    fn pop_double(&mut self) -> Option<f64> {
        let rest = &self.input[self.pos..];
        let mut len = 0;
        let bytes = rest.as_bytes();
        if len < bytes.len() && (bytes[len] == b'+' || bytes[len] == b'-') {
            len += 1;
        }
        let digits_start = len;
        while len < bytes.len() && (bytes[len].is_ascii_digit() || bytes[len] == b'.') {
            len += 1;
        }
        if len == digits_start {
            return None;
        }
        if len < bytes.len() && (bytes[len] == b'e' || bytes[len] == b'E') {
            let mut exp_len = len + 1;
            if exp_len < bytes.len() && (bytes[exp_len] == b'+' || bytes[exp_len] == b'-') {
                exp_len += 1;
            }
            let exp_digits = exp_len;
            while exp_len < bytes.len() && bytes[exp_len].is_ascii_digit() {
                exp_len += 1;
            }
            if exp_len > exp_digits {
                len = exp_len;
            }
        }
        match rest[..len].parse::<f64>() {
            Ok(v) => {
                self.pos += len;
                Some(v)
            }
            Err(_) => None,
        }
    }
}

struct Compiler<'a, 'c> {
    scanner: Scanner<'a>,
    ctx: &'c mut dyn CompileContext,
}

type DyadicOp = (&'static str, DyadicImpl);

impl<'a, 'c> Compiler<'a, 'c> {
    /// Parses one precedence level: `sub (op sub)*`, left-associative.
    fn do_dyadic(
        &mut self,
        sub: fn(&mut Self) -> Result<Option<Expr>>,
        ops: &[DyadicOp],
    ) -> Result<Option<Expr>> {
        let Some(mut left) = sub(self)? else { return Ok(None) };
        'chain: loop {
            for (name, func) in ops {
                if self.scanner.skip_whitespace_pop_word(name) {
                    let right = sub(self)?.ok_or_else(|| {
                        syntax(
                            &format!("Invalid or missing expression after {name}"),
                            self.scanner.position(),
                        )
                    })?;
                    left = Expr::Dyadic {
                        name,
                        func: *func,
                        left: Box::new(left),
                        right: Box::new(right),
                    };
                    continue 'chain;
                }
            }
            return Ok(Some(left));
        }
    }

    fn expression(&mut self) -> Result<Option<Expr>> {
        self.lor_op()
    }

    fn lor_op(&mut self) -> Result<Option<Expr>> {
        self.do_dyadic(Self::and_op, &[("||", value::func_lor)])
    }

    fn and_op(&mut self) -> Result<Option<Expr>> {
        self.do_dyadic(Self::cmp_op, &[("&&", value::func_land)])
    }

    fn cmp_op(&mut self) -> Result<Option<Expr>> {
        // longest operators first so `<=` never half-matches as `<`
        self.do_dyadic(
            Self::add_op,
            &[
                ("<=", value::func_le),
                (">=", value::func_ge),
                ("==", value::func_eq),
                ("!=", value::func_ne),
                ("<", value::func_lt),
                (">", value::func_gt),
            ],
        )
    }

    fn add_op(&mut self) -> Result<Option<Expr>> {
        self.do_dyadic(Self::mul_op, &[("+", value::func_add), ("-", value::func_sub)])
    }

    fn mul_op(&mut self) -> Result<Option<Expr>> {
        self.do_dyadic(Self::primary, &[("*", value::func_mul), ("/", value::func_div)])
    }

    fn primary(&mut self) -> Result<Option<Expr>> {
        self.scanner.skip_whitespace();
        match self.scanner.peek() {
            Some('(') => {
                self.scanner.bump();
                let result = self.lor_op()?;
                self.scanner.skip_whitespace();
                if !self.scanner.pop_char(')') {
                    return Err(syntax("Expected `)`", self.scanner.position()));
                }
                Ok(result)
            }
            Some('+' | '-' | '.' | '0'..='9') => Ok(self.number()),
            Some('@') => self.attribute().map(Some),
            Some('\'' | '"') => self.quoted_string().map(Some),
            None => Ok(None),
            Some(_) => self.function_call(),
        }
    }

    fn number(&mut self) -> Option<Expr> {
        self.scanner.pop_double().map(|d| Expr::Const(Value::num(d)))
    }

    fn attribute(&mut self) -> Result<Expr> {
        assert!(self.scanner.pop_char('@'));
        let position = self.scanner.position();
        let name = self.scanner.pop_identifier();
        match self.ctx.resolve_attribute(&name) {
            Some(slot) => Ok(Expr::Attr { name, slot }),
            None => Err(UserError::UnknownExprAttribute { name, position }.into()),
        }
    }

    fn quoted_string(&mut self) -> Result<Expr> {
        let quote = self.scanner.bump().expect("caller peeked a quote");
        let mut text = String::new();
        loop {
            match self.scanner.bump() {
                Some(c) if c == quote => break,
                Some('\\') => match self.scanner.bump() {
                    Some(escaped) => text.push(escaped),
                    None => return Err(syntax("Missing trailing quote", self.scanner.position())),
                },
                Some(c) => text.push(c),
                None => return Err(syntax("Missing trailing quote", self.scanner.position())),
            }
        }
        Ok(Expr::Const(Value::str(text)))
    }

    fn function_call(&mut self) -> Result<Option<Expr>> {
        let saved = self.scanner.clone();
        let name = self.scanner.pop_identifier();
        if name.is_empty() || !self.scanner.skip_whitespace_pop_word("(") {
            self.scanner = saved;
            return Ok(None);
        }
        let mut args = Vec::new();
        loop {
            self.scanner.skip_whitespace();
            if self.scanner.pop_char(')') {
                let func = lookup_and_validate(&name, args.len())?;
                return Ok(Some(Expr::Call { name, func, args }));
            }
            if !args.is_empty() && !self.scanner.pop_char(',') {
                return Err(syntax("Expected `,` or `)`", self.scanner.position()));
            }
            let arg = self.expression()?.ok_or_else(|| {
                syntax("Expected `,` or `)`", self.scanner.position())
            })?;
            args.push(arg);
        }
    }
}

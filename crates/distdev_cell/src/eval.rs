//! Tree-walking interpreter.
//!
//! An [`Interpreter`] owns the global namespace of one worker. Cells run
//! directly in that namespace so their bindings persist between calls;
//! script callables run in a fresh local scope layered over it.

use crate::ast::{Expr, Program, Statement};
use crate::error::{CellError, CellResult};
use crate::parser::parse;
use crate::value::{self, MAX_SEQUENCE_LEN};
use indexmap::IndexMap;
use serde_json::{Map, Value};

/// Resolver for functions the language does not define itself
pub trait Host {
    /// Call `name` with positional `args`.
    ///
    /// Returns `None` when the host does not know the name.
    fn call(&self, name: &str, args: &[Value]) -> Option<CellResult<Value>>;
}

/// Host that resolves nothing
#[derive(Debug, Clone, Copy, Default)]
pub struct NoHost;

impl Host for NoHost {
    fn call(&self, _name: &str, _args: &[Value]) -> Option<CellResult<Value>> {
        None
    }
}

/// Names handled by the interpreter before consulting the host
pub const BUILTINS: &[&str] = &[
    "log", "print", "warn", "error", "len", "str", "int", "float", "range", "sum", "fail",
];

/// Cell interpreter with a persistent global namespace
#[derive(Debug, Clone, Default)]
pub struct Interpreter {
    globals: IndexMap<String, Value>,
}

impl Interpreter {
    /// Create an interpreter with an empty namespace
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style global binding
    #[must_use]
    pub fn with_global(mut self, name: impl Into<String>, value: Value) -> Self {
        self.set_global(name, value);
        self
    }

    /// Bind a global
    pub fn set_global(&mut self, name: impl Into<String>, value: Value) {
        self.globals.insert(name.into(), value);
    }

    /// Look up a global
    #[must_use]
    pub fn global(&self, name: &str) -> Option<&Value> {
        self.globals.get(name)
    }

    /// All globals in binding order
    #[must_use]
    pub fn globals(&self) -> &IndexMap<String, Value> {
        &self.globals
    }

    /// Parse and execute `source` in the global namespace
    ///
    /// # Errors
    ///
    /// Returns the first syntax or evaluation error
    pub fn run_source(&mut self, source: &str, host: &dyn Host) -> CellResult<Option<Value>> {
        let program = parse(source)?;
        self.execute(&program, host)
    }

    /// Execute `program` in the global namespace.
    ///
    /// Returns `Some` with the value of the final statement when it is a
    /// bare expression. Bindings made before an error are kept.
    ///
    /// # Errors
    ///
    /// Returns the first evaluation error
    pub fn execute(&mut self, program: &Program, host: &dyn Host) -> CellResult<Option<Value>> {
        let mut scope = Scope::Global(&mut self.globals);
        run(&mut scope, program, host)
    }

    /// Run a script callable in a fresh local scope.
    ///
    /// `args` and `kwargs` are bound as locals; names not bound locally are
    /// read from the globals, which the script cannot modify. Returns the
    /// value of the final bare expression, or `none`.
    ///
    /// # Errors
    ///
    /// Returns the first evaluation error
    pub fn call_script(
        &self,
        program: &Program,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
        host: &dyn Host,
    ) -> CellResult<Value> {
        let mut locals = IndexMap::new();
        locals.insert("args".to_string(), Value::Array(args));
        locals.insert("kwargs".to_string(), Value::Object(kwargs));
        let mut scope = Scope::Local {
            globals: &self.globals,
            locals,
        };
        Ok(run(&mut scope, program, host)?.unwrap_or(Value::Null))
    }
}

enum Scope<'a> {
    Global(&'a mut IndexMap<String, Value>),
    Local {
        globals: &'a IndexMap<String, Value>,
        locals: IndexMap<String, Value>,
    },
}

impl Scope<'_> {
    fn lookup(&self, name: &str) -> Option<&Value> {
        match self {
            Scope::Global(globals) => globals.get(name),
            Scope::Local { globals, locals } => locals.get(name).or_else(|| globals.get(name)),
        }
    }

    fn assign(&mut self, name: &str, value: Value) {
        match self {
            Scope::Global(globals) => globals.insert(name.to_string(), value),
            Scope::Local { locals, .. } => locals.insert(name.to_string(), value),
        };
    }
}

fn run(scope: &mut Scope<'_>, program: &Program, host: &dyn Host) -> CellResult<Option<Value>> {
    let mut last = None;
    for statement in &program.statements {
        last = match statement {
            Statement::Assign { name, value } => {
                let value = eval(scope, value, host)?;
                scope.assign(name, value);
                None
            }
            Statement::Expr(expr) => Some(eval(scope, expr, host)?),
        };
    }
    Ok(last)
}

fn eval(scope: &Scope<'_>, expr: &Expr, host: &dyn Host) -> CellResult<Value> {
    match expr {
        Expr::Literal(value) => Ok(value.clone()),
        Expr::Name(name) => scope
            .lookup(name)
            .cloned()
            .ok_or_else(|| CellError::Name(name.clone())),
        Expr::List(items) => items
            .iter()
            .map(|item| eval(scope, item, host))
            .collect::<CellResult<Vec<_>>>()
            .map(Value::Array),
        Expr::Neg(inner) => value::negate(&eval(scope, inner, host)?),
        Expr::Not(inner) => Ok(Value::Bool(!value::truthy(&eval(scope, inner, host)?))),
        Expr::And(left, right) => {
            let left = eval(scope, left, host)?;
            if value::truthy(&left) {
                eval(scope, right, host)
            } else {
                Ok(left)
            }
        }
        Expr::Or(left, right) => {
            let left = eval(scope, left, host)?;
            if value::truthy(&left) {
                Ok(left)
            } else {
                eval(scope, right, host)
            }
        }
        Expr::Binary { op, left, right } => {
            let left = eval(scope, left, host)?;
            let right = eval(scope, right, host)?;
            value::binary(*op, &left, &right)
        }
        Expr::Index { target, index } => {
            let target = eval(scope, target, host)?;
            let index = eval(scope, index, host)?;
            value::index(&target, &index)
        }
        Expr::Call { function, args } => {
            let args = args
                .iter()
                .map(|arg| eval(scope, arg, host))
                .collect::<CellResult<Vec<_>>>()?;
            call(function, &args, host)
        }
    }
}

fn call(function: &str, args: &[Value], host: &dyn Host) -> CellResult<Value> {
    match function {
        "log" | "print" => {
            tracing::info!("{}", join(args));
            Ok(Value::Null)
        }
        "warn" => {
            tracing::warn!("{}", join(args));
            Ok(Value::Null)
        }
        "error" => {
            tracing::error!("{}", join(args));
            Ok(Value::Null)
        }
        "fail" => Err(CellError::Raised(if args.is_empty() {
            "failed".to_string()
        } else {
            join(args)
        })),
        "len" => builtin_len(single(function, args)?),
        "str" => Ok(Value::String(value::display(single(function, args)?))),
        "int" => builtin_int(single(function, args)?),
        "float" => builtin_float(single(function, args)?),
        "range" => builtin_range(args),
        "sum" => builtin_sum(single(function, args)?),
        _ => host
            .call(function, args)
            .unwrap_or_else(|| Err(CellError::Name(function.to_string()))),
    }
}

fn join(args: &[Value]) -> String {
    args.iter().map(value::display).collect::<Vec<_>>().join(" ")
}

fn single<'a>(function: &str, args: &'a [Value]) -> CellResult<&'a Value> {
    match args {
        [only] => Ok(only),
        _ => Err(CellError::Type(format!(
            "{}() takes exactly one argument ({} given)",
            function,
            args.len()
        ))),
    }
}

fn builtin_len(value: &Value) -> CellResult<Value> {
    let len = match value {
        Value::String(s) => s.chars().count(),
        Value::Array(items) => items.len(),
        Value::Object(map) => map.len(),
        other => {
            return Err(CellError::Type(format!(
                "object of type '{}' has no len()",
                value::type_name(other)
            )));
        }
    };
    Ok(Value::from(len))
}

fn builtin_int(value: &Value) -> CellResult<Value> {
    match value {
        Value::Bool(b) => Ok(Value::from(i64::from(*b))),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                return Ok(Value::from(i));
            }
            let f = n.as_f64().unwrap_or(f64::NAN).trunc();
            if f.is_finite() && f >= i64::MIN as f64 && f < i64::MAX as f64 {
                Ok(Value::from(f as i64))
            } else {
                Err(CellError::Arithmetic(format!("cannot convert {} to int", n)))
            }
        }
        Value::String(s) => s
            .trim()
            .parse::<i64>()
            .map(Value::from)
            .map_err(|_| CellError::Type(format!("invalid literal for int(): {:?}", s))),
        other => Err(CellError::Type(format!(
            "int() argument must be a number or string, not '{}'",
            value::type_name(other)
        ))),
    }
}

fn builtin_float(value: &Value) -> CellResult<Value> {
    let f = match value {
        Value::Bool(b) => f64::from(u8::from(*b)),
        Value::Number(n) => n.as_f64().unwrap_or(f64::NAN),
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .map_err(|_| CellError::Type(format!("could not convert string to float: {:?}", s)))?,
        other => {
            return Err(CellError::Type(format!(
                "float() argument must be a number or string, not '{}'",
                value::type_name(other)
            )));
        }
    };
    value::float(f)
}

fn int_arg(function: &str, value: &Value) -> CellResult<i64> {
    value.as_i64().ok_or_else(|| {
        CellError::Type(format!(
            "{}() expects integers, got '{}'",
            function,
            value::type_name(value)
        ))
    })
}

fn builtin_range(args: &[Value]) -> CellResult<Value> {
    let ints = args
        .iter()
        .map(|arg| int_arg("range", arg))
        .collect::<CellResult<Vec<_>>>()?;
    let (start, stop, step) = match ints.as_slice() {
        [stop] => (0, *stop, 1),
        [start, stop] => (*start, *stop, 1),
        [start, stop, step] => (*start, *stop, *step),
        _ => {
            return Err(CellError::Type(format!(
                "range() takes 1 to 3 arguments ({} given)",
                args.len()
            )));
        }
    };
    if step == 0 {
        return Err(CellError::Arithmetic("range() step must not be zero".to_string()));
    }

    let span = if step > 0 {
        i128::from(stop) - i128::from(start)
    } else {
        i128::from(start) - i128::from(stop)
    };
    let step_abs = i128::from(step).abs();
    let count = if span <= 0 { 0 } else { (span + step_abs - 1) / step_abs };
    if count > MAX_SEQUENCE_LEN as i128 {
        return Err(CellError::Arithmetic(format!(
            "range of {} elements exceeds the limit of {}",
            count, MAX_SEQUENCE_LEN
        )));
    }

    let items = (0..count)
        .map(|i| Value::from((i128::from(start) + i * i128::from(step)) as i64))
        .collect();
    Ok(Value::Array(items))
}

fn builtin_sum(value: &Value) -> CellResult<Value> {
    let Value::Array(items) = value else {
        return Err(CellError::Type(format!(
            "sum() expects a list, got '{}'",
            value::type_name(value)
        )));
    };
    items.iter().try_fold(Value::from(0), |total, item| {
        value::binary(crate::ast::BinOp::Add, &total, item)
    })
}

//! Name resolution for callables invoked by the master.
//!
//! A function path such as `["tools", "hello"]` is resolved against three
//! layers in order: the slave's own commands, globals registered at run
//! time, and the built-in module functions. The first segment picks a
//! symbol, the remaining segments walk nested namespaces.

use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::rc::Rc;

use rcmd_proto::{BaseCmd, Value};

use super::Slave;

/// Result of invoking a [`Callable`].
pub type CallResult = Result<Value, CallError>;

/// Failure raised by a callable, reported to the master as a traceback.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct CallError {
    /// Error class, e.g. `TypeError` or `OSError`.
    pub kind: String,
    /// Human readable description.
    pub message: String,
}

impl CallError {
    /// Creates an error of the given class.
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// Wrong or missing argument.
    pub fn type_error(message: impl Into<String>) -> Self {
        Self::new("TypeError", message)
    }

    /// Unknown key, e.g. a command id.
    pub fn key_error(message: impl Into<String>) -> Self {
        Self::new("KeyError", message)
    }

    /// Unresolvable name.
    pub fn name_error(name: &str) -> Self {
        Self::new("NameError", format!("name '{name}' is not defined"))
    }
}

impl From<io::Error> for CallError {
    fn from(e: io::Error) -> Self {
        Self::new("OSError", e.to_string())
    }
}

/// Positional and keyword arguments of one call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Args {
    /// Positional arguments.
    pub args: Vec<Value>,
    /// Keyword arguments.
    pub kargs: BTreeMap<String, Value>,
}

impl Args {
    /// Bundles arguments.
    pub const fn new(args: Vec<Value>, kargs: BTreeMap<String, Value>) -> Self {
        Self { args, kargs }
    }

    /// Copies the arguments of a command record.
    pub fn from_cmd(cmd: &BaseCmd) -> Self {
        Self::new(cmd.args.clone(), cmd.kargs.clone())
    }

    /// Looks an argument up by keyword, then by position.
    pub fn get(&self, index: usize, name: &str) -> Option<&Value> {
        self.kargs.get(name).or_else(|| self.args.get(index))
    }

    /// Like [`Args::get`] but a missing argument is a `TypeError`.
    pub fn value(&self, index: usize, name: &str) -> Result<&Value, CallError> {
        self.get(index, name)
            .ok_or_else(|| CallError::type_error(format!("missing required argument '{name}'")))
    }

    /// String argument.
    pub fn str(&self, index: usize, name: &str) -> Result<&str, CallError> {
        let v = self.value(index, name)?;
        v.as_str().ok_or_else(|| mismatch(name, "str", v))
    }

    /// Integer argument.
    pub fn int(&self, index: usize, name: &str) -> Result<i64, CallError> {
        let v = self.value(index, name)?;
        v.as_int().ok_or_else(|| mismatch(name, "int", v))
    }

    /// Numeric argument, integers are widened.
    pub fn float(&self, index: usize, name: &str) -> Result<f64, CallError> {
        let v = self.value(index, name)?;
        v.as_float().ok_or_else(|| mismatch(name, "float", v))
    }

    /// Byte argument, strings are accepted as their UTF-8 bytes.
    pub fn bytes(&self, index: usize, name: &str) -> Result<&[u8], CallError> {
        let v = self.value(index, name)?;
        v.as_bytes().ok_or_else(|| mismatch(name, "bytes", v))
    }

    /// Command record argument.
    pub fn cmd(&self, index: usize, name: &str) -> Result<&BaseCmd, CallError> {
        let v = self.value(index, name)?;
        v.as_cmd().ok_or_else(|| mismatch(name, "cmd", v))
    }
}

fn mismatch(name: &str, want: &str, got: &Value) -> CallError {
    CallError::type_error(format!(
        "argument '{name}' must be {want}, not {}",
        got.type_name()
    ))
}

/// Something the master can invoke by name.
///
/// Callables run inside the slave process for `manage` commands and inside
/// a forked child otherwise; in the child, `slave` is detached from the
/// master and only useful for resolving further names.
pub trait Callable {
    /// Invokes the callable.
    fn call(&self, slave: &mut Slave, args: Args) -> CallResult;
}

impl<F> Callable for F
where
    F: Fn(&mut Slave, Args) -> CallResult,
{
    fn call(&self, slave: &mut Slave, args: Args) -> CallResult {
        self(slave, args)
    }
}

/// Entry of a [`Namespace`].
#[derive(Clone)]
#[non_exhaustive]
pub enum Symbol {
    /// An invocable function.
    Func(Rc<dyn Callable>),
    /// A nested namespace.
    Namespace(Namespace),
}

impl fmt::Debug for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Func(_) => f.write_str("Func(..)"),
            Self::Namespace(ns) => f.debug_tuple("Namespace").field(ns).finish(),
        }
    }
}

/// A set of named symbols.
#[derive(Debug, Clone, Default)]
pub struct Namespace {
    entries: BTreeMap<String, Symbol>,
}

impl Namespace {
    /// Creates an empty namespace.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a symbol.
    pub fn insert(&mut self, name: impl Into<String>, symbol: Symbol) {
        self.entries.insert(name.into(), symbol);
    }

    /// Adds or replaces a function.
    pub fn insert_fn(&mut self, name: impl Into<String>, f: impl Callable + 'static) {
        self.insert(name, Symbol::Func(Rc::new(f)));
    }

    /// Looks up a direct member.
    pub fn get(&self, name: &str) -> Option<&Symbol> {
        self.entries.get(name)
    }

    /// Names of all direct members.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Number of direct members.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if the namespace has no members.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// The three resolution layers of a slave.
#[derive(Debug, Clone, Default)]
pub struct Scope {
    /// Commands of the slave instance.
    pub commands: Namespace,
    /// Functions and namespaces installed at run time.
    pub globals: Namespace,
    /// Built-in module functions.
    pub module: Namespace,
}

impl Scope {
    /// Resolves a function path to a callable.
    pub fn resolve(&self, path: &[String]) -> Result<Rc<dyn Callable>, CallError> {
        let Some((head, rest)) = path.split_first() else {
            return Err(CallError::new("NameError", "empty function path"));
        };
        let mut symbol = [&self.commands, &self.globals, &self.module]
            .into_iter()
            .find_map(|ns| ns.get(head))
            .ok_or_else(|| CallError::name_error(head))?;

        for (depth, segment) in rest.iter().enumerate() {
            let Symbol::Namespace(ns) = symbol else {
                return Err(CallError::new(
                    "AttributeError",
                    format!("'{}' has no attribute '{segment}'", path[..=depth].join(".")),
                ));
            };
            symbol = ns.get(segment).ok_or_else(|| {
                CallError::new(
                    "AttributeError",
                    format!("'{}' has no attribute '{segment}'", path[..=depth].join(".")),
                )
            })?;
        }
        match symbol {
            Symbol::Func(f) => Ok(Rc::clone(f)),
            Symbol::Namespace(_) => Err(CallError::type_error(format!(
                "'{}' is a namespace, not a callable",
                path.join(".")
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn constant(v: i64) -> impl Fn(&mut Slave, Args) -> CallResult {
        move |_, _| Ok(Value::Int(v))
    }

    fn path(s: &str) -> Vec<String> {
        s.split('.').map(str::to_owned).collect()
    }

    fn scope() -> Scope {
        let mut scope = Scope::default();
        scope.commands.insert_fn("shell", constant(1));
        scope.globals.insert_fn("shell", constant(2));
        scope.globals.insert_fn("greet", constant(3));
        scope.module.insert_fn("greet", constant(4));
        scope.module.insert_fn("echo", constant(5));
        let mut tools = Namespace::new();
        tools.insert_fn("hello", constant(6));
        scope.globals.insert("tools", Symbol::Namespace(tools));
        scope
    }

    fn call(scope: &Scope, name: &str) -> Value {
        let f = scope.resolve(&path(name)).unwrap();
        f.call(&mut Slave::detached(), Args::default()).unwrap()
    }

    #[test]
    fn layers_resolve_in_order() {
        let s = scope();
        assert_eq!(call(&s, "shell"), Value::Int(1));
        assert_eq!(call(&s, "greet"), Value::Int(3));
        assert_eq!(call(&s, "echo"), Value::Int(5));
    }

    #[test]
    fn nested_namespaces() {
        let s = scope();
        assert_eq!(call(&s, "tools.hello"), Value::Int(6));
        let e = s.resolve(&path("tools.missing")).err().unwrap();
        assert_eq!(e.kind, "AttributeError");
        let e = s.resolve(&path("echo.deeper")).err().unwrap();
        assert_eq!(e.kind, "AttributeError");
        let e = s.resolve(&path("tools")).err().unwrap();
        assert_eq!(e.kind, "TypeError");
    }

    #[test]
    fn unknown_name() {
        let e = scope().resolve(&path("nope")).err().unwrap();
        assert_eq!(e.kind, "NameError");
        assert!(e.message.contains("nope"));
        assert!(scope().resolve(&[]).is_err());
    }

    #[test]
    fn args_by_position_and_keyword() {
        let mut kargs = BTreeMap::new();
        kargs.insert("b".to_owned(), Value::from("kw"));
        let a = Args::new(vec![Value::Int(1), Value::from("pos")], kargs);
        assert_eq!(a.int(0, "a").unwrap(), 1);
        assert_eq!(a.str(1, "b").unwrap(), "kw");
        assert_eq!(a.bytes(1, "b").unwrap(), b"kw");
        assert_eq!(a.float(0, "a").unwrap(), 1.0);
        assert_eq!(a.str(0, "a").unwrap_err().kind, "TypeError");
        assert!(a.value(5, "c").unwrap_err().message.contains("'c'"));
    }

    #[test]
    fn io_errors_become_os_errors() {
        let e = CallError::from(io::Error::from(io::ErrorKind::NotFound));
        assert_eq!(e.kind, "OSError");
    }
}

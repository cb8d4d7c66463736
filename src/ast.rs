//! Abstract syntax tree for schedule scripts

use std::fmt;

/// A complete script consisting of statements
#[derive(Debug, Clone, PartialEq)]
pub struct Script {
    pub statements: Vec<Statement>,
}

/// `[target =] [receiver.]method(args)`
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub target: Option<String>,
    pub call: Invocation,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    /// Schedule handle the method is called on: `s` in `s.split(..)`
    pub receiver: Option<String>,
    pub method: String,
    pub args: Vec<Argument>,
}

impl Invocation {
    /// Positional arguments, in order
    pub fn positional(&self) -> impl Iterator<Item = &Value> {
        self.args.iter().filter(|a| a.name.is_none()).map(|a| &a.value)
    }

    pub fn keyword(&self, name: &str) -> Option<&Value> {
        self.args
            .iter()
            .find(|a| a.name.as_deref() == Some(name))
            .map(|a| &a.value)
    }
}

/// Positional (`name == None`) or keyword argument
#[derive(Debug, Clone, PartialEq)]
pub struct Argument {
    pub name: Option<String>,
    pub value: Value,
}

/// Argument values
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i64),
    /// Identifier or dotted path: `A`, `i.inner`
    Path(String),
    Str(String),
    List(Vec<Value>),
}

impl Value {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Text of a path or string literal; integers are accepted as names too
    pub fn as_name(&self) -> Option<String> {
        match self {
            Value::Path(s) | Value::Str(s) => Some(s.clone()),
            Value::Int(v) => Some(v.to_string()),
            Value::List(_) => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(v) => write!(f, "{}", v),
            Value::Path(p) => write!(f, "{}", p),
            Value::Str(s) => write!(f, "\"{}\"", s),
            Value::List(items) => {
                let items: Vec<String> = items.iter().map(|i| i.to_string()).collect();
                write!(f, "[{}]", items.join(", "))
            }
        }
    }
}

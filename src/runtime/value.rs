use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::cmp::Ordering;
use std::rc::Rc;

/// Runtime value on the operand stack.
///
/// Collections are shared handles: storing a list under two names aliases
/// one underlying sequence, so method calls through either name observe
/// the same contents. Booleans are plain 0/1 integers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// 32-bit signed integer (two's complement arithmetic).
    Int(i32),

    /// 64-bit signed integer.
    Long(i64),

    /// 64-bit IEEE-754 float.
    Float(f64),

    /// UTF-8 string.
    Str(String),

    /// Ordered sequence.
    List(Rc<RefCell<Vec<Value>>>),

    /// Unordered unique membership (insertion-ordered storage).
    Set(Rc<RefCell<Vec<Value>>>),

    /// Key/value mapping (association list; insertion order kept).
    Dict(Rc<RefCell<Vec<(Value, Value)>>>),

    /// Guest function: a bytecode offset.
    Function(usize),

    /// Host function: a syscall id.
    HostFn(u8),

    /// Explicit iteration state produced by FOR_ITER.
    Iter(Rc<RefCell<ValueIter>>),

    Null,
}

/// Iterator over an immutable snapshot of a sequence.
///
/// The snapshot is taken when the iterator is created, so mutating the
/// source collection mid-loop does not disturb the walk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueIter {
    pub items: Rc<Vec<Value>>,
    pub index: usize,
}

impl ValueIter {
    pub fn next(&mut self) -> Option<Value> {
        let item = self.items.get(self.index).cloned();
        if item.is_some() {
            self.index += 1;
        }
        item
    }
}

impl Value {
    pub fn list(items: Vec<Value>) -> Value {
        Value::List(Rc::new(RefCell::new(items)))
    }

    pub fn set(items: Vec<Value>) -> Value {
        Value::Set(Rc::new(RefCell::new(items)))
    }

    pub fn dict(entries: Vec<(Value, Value)>) -> Value {
        Value::Dict(Rc::new(RefCell::new(entries)))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Int(_) => "int",
            Value::Long(_) => "long",
            Value::Float(_) => "float",
            Value::Str(_) => "string",
            Value::List(_) => "list",
            Value::Set(_) => "set",
            Value::Dict(_) => "dict",
            Value::Function(_) => "function",
            Value::HostFn(_) => "hostfn",
            Value::Iter(_) => "iterator",
            Value::Null => "null",
        }
    }

    pub fn truthy(&self) -> bool {
        match self {
            Value::Int(n) => *n != 0,
            Value::Long(n) => *n != 0,
            Value::Float(n) => *n != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::List(items) | Value::Set(items) => !items.borrow().is_empty(),
            Value::Dict(entries) => !entries.borrow().is_empty(),
            Value::Function(_) | Value::HostFn(_) | Value::Iter(_) => true,
            Value::Null => false,
        }
    }

    /// Best-effort 64-bit integer view (string parses, float truncates).
    pub fn coerce_i64(&self) -> i64 {
        match self {
            Value::Int(n) => *n as i64,
            Value::Long(n) => *n,
            Value::Float(n) => *n as i64,
            Value::Str(s) => s.trim().parse::<i64>().unwrap_or(0),
            Value::Null => 0,
            _ => 0,
        }
    }

    pub fn coerce_i32(&self) -> i32 {
        self.coerce_i64() as i32
    }

    pub fn coerce_f64(&self) -> f64 {
        match self {
            Value::Int(n) => *n as f64,
            Value::Long(n) => *n as f64,
            Value::Float(n) => *n,
            Value::Str(s) => s.trim().parse::<f64>().unwrap_or(0.0),
            _ => 0.0,
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, Value::Int(_) | Value::Long(_) | Value::Float(_))
    }

    /// Equality as observed by the guest: numerics compare across widths,
    /// collections compare element-wise.
    pub fn loose_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (a, b) if a.is_numeric() && b.is_numeric() => a.coerce_f64() == b.coerce_f64(),
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Null, Value::Null) => true,
            (Value::List(a), Value::List(b)) | (Value::Set(a), Value::Set(b)) => {
                let a = a.borrow();
                let b = b.borrow();
                a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x.loose_eq(y))
            }
            (Value::Function(a), Value::Function(b)) => a == b,
            _ => false,
        }
    }

    /// Ordering for comparisons and sorts. Numerics order numerically,
    /// strings lexicographically; anything else is unordered.
    pub fn loose_cmp(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (a, b) if a.is_numeric() && b.is_numeric() => {
                a.coerce_f64().partial_cmp(&b.coerce_f64())
            }
            (Value::Str(a), Value::Str(b)) => Some(a.cmp(b)),
            (Value::List(a), Value::List(b)) => {
                let a = a.borrow();
                let b = b.borrow();
                for (x, y) in a.iter().zip(b.iter()) {
                    match x.loose_cmp(y) {
                        Some(Ordering::Equal) => continue,
                        other => return other,
                    }
                }
                Some(a.len().cmp(&b.len()))
            }
            _ => None,
        }
    }

    /// Snapshot view used when converting a value into an iterator.
    /// Strings iterate per character, dicts per key.
    pub fn iteration_items(&self) -> Option<Vec<Value>> {
        match self {
            Value::List(items) | Value::Set(items) => Some(items.borrow().clone()),
            Value::Dict(entries) => {
                Some(entries.borrow().iter().map(|(k, _)| k.clone()).collect())
            }
            Value::Str(s) => Some(s.chars().map(|c| Value::Str(c.to_string())).collect()),
            _ => None,
        }
    }

    /// Source-syntax rendering: strings keep their quotes.
    pub fn repr(&self) -> String {
        match self {
            Value::Str(s) => format!("{:?}", s),
            other => other.to_string(),
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Int(n) => write!(f, "{}", n),
            Value::Long(n) => write!(f, "{}", n),
            Value::Float(n) => write!(f, "{}", n),
            Value::Str(s) => write!(f, "{}", s),
            Value::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.borrow().iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item.repr())?;
                }
                write!(f, "]")
            }
            Value::Set(items) => {
                write!(f, "{{")?;
                for (i, item) in items.borrow().iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item.repr())?;
                }
                write!(f, "}}")
            }
            Value::Dict(entries) => {
                write!(f, "{{")?;
                for (i, (k, v)) in entries.borrow().iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", k.repr(), v.repr())?;
                }
                write!(f, "}}")
            }
            Value::Function(offset) => write!(f, "<function @{}>", offset),
            Value::HostFn(id) => write!(f, "<builtin 0x{:02X}>", id),
            Value::Iter(_) => write!(f, "<iterator>"),
            Value::Null => write!(f, "None"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truthiness() {
        assert!(Value::Int(1).truthy());
        assert!(!Value::Int(0).truthy());
        assert!(!Value::Str(String::new()).truthy());
        assert!(Value::Str("x".into()).truthy());
        assert!(!Value::Null.truthy());
        assert!(!Value::list(vec![]).truthy());
        assert!(Value::list(vec![Value::Int(1)]).truthy());
    }

    #[test]
    fn test_loose_eq_across_numeric_widths() {
        assert!(Value::Int(5).loose_eq(&Value::Long(5)));
        assert!(Value::Int(5).loose_eq(&Value::Float(5.0)));
        assert!(!Value::Int(5).loose_eq(&Value::Str("5".into())));
    }

    #[test]
    fn test_list_display_uses_repr() {
        let v = Value::list(vec![Value::Int(1), Value::Str("a".into())]);
        assert_eq!(v.to_string(), "[1, \"a\"]");
    }

    #[test]
    fn test_iterator_snapshot_is_stable() {
        let list = Value::list(vec![Value::Int(1), Value::Int(2)]);
        let items = Rc::new(list.iteration_items().unwrap());
        let mut iter = ValueIter { items, index: 0 };
        if let Value::List(inner) = &list {
            inner.borrow_mut().push(Value::Int(3));
        }
        assert_eq!(iter.next(), Some(Value::Int(1)));
        assert_eq!(iter.next(), Some(Value::Int(2)));
        assert_eq!(iter.next(), None);
    }

    #[test]
    fn test_string_iteration_per_char() {
        let items = Value::Str("ab".into()).iteration_items().unwrap();
        assert_eq!(items, vec![Value::Str("a".into()), Value::Str("b".into())]);
    }

    #[test]
    fn test_coercions() {
        assert_eq!(Value::Str(" 42 ".into()).coerce_i64(), 42);
        assert_eq!(Value::Float(3.9).coerce_i64(), 3);
        assert_eq!(Value::Null.coerce_i64(), 0);
    }
}

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use indexmap::IndexMap;
use tamarin_code::Instructions;
use tamarin_syntax::{Block, Ident};

/// Uppercase type tags, used verbatim in runtime error messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    Integer,
    Boolean,
    Null,
    Str,
    Array,
    Hash,
    Function,
    CompiledFunction,
    Closure,
    Builtin,
    Return,
    Error,
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ValueKind::Integer => "INTEGER",
            ValueKind::Boolean => "BOOLEAN",
            ValueKind::Null => "NULL",
            ValueKind::Str => "STRING",
            ValueKind::Array => "ARRAY",
            ValueKind::Hash => "HASH",
            ValueKind::Function => "FUNCTION",
            ValueKind::CompiledFunction => "COMPILED_FUNCTION",
            ValueKind::Closure => "CLOSURE",
            ValueKind::Builtin => "BUILTIN",
            ValueKind::Return => "RETURN_VALUE",
            ValueKind::Error => "ERROR",
        };
        f.write_str(text)
    }
}

/// Key type for hash values. Only integers, booleans, and strings hash;
/// strings take the 64-bit FNV-1a of their UTF-8 bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HashKey {
    pub kind: ValueKind,
    pub value: u64,
}

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

fn fnv1a(bytes: &[u8]) -> u64 {
    bytes.iter().fold(FNV_OFFSET_BASIS, |hash, byte| {
        (hash ^ u64::from(*byte)).wrapping_mul(FNV_PRIME)
    })
}

/// Hash entries keep the original key value so `inspect` can render it.
#[derive(Debug, Clone, PartialEq)]
pub struct HashPair {
    pub key: Value,
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompiledFunction {
    pub instructions: Instructions,
    pub num_locals: usize,
    pub num_parameters: usize,
}

/// A compiled function bundled with the values it captured at creation.
#[derive(Debug, Clone, PartialEq)]
pub struct Closure {
    pub func: Rc<CompiledFunction>,
    pub free: Vec<Value>,
}

/// Tree-walker function value: parameters and body straight from the AST,
/// plus the environment captured at definition time.
#[derive(Clone)]
pub struct Function {
    pub parameters: Vec<Ident>,
    pub body: Block,
    pub env: Env,
}

// The captured environment can point back at this function, so the derived
// impl would recurse forever.
impl fmt::Debug for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Function")
            .field("parameters", &self.parameters)
            .finish_non_exhaustive()
    }
}

// Identity comparison. Environments form reference cycles through
// self-referential bindings, so structural equality cannot terminate.
impl PartialEq for Function {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self, other)
    }
}

pub type BuiltinFn = fn(&[Value]) -> Value;

#[derive(Debug, PartialEq)]
pub struct Builtin {
    pub name: &'static str,
    pub func: BuiltinFn,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Integer(i64),
    Boolean(bool),
    Null,
    Str(Rc<String>),
    Array(Rc<Vec<Value>>),
    Hash(Rc<IndexMap<HashKey, HashPair>>),
    CompiledFunction(Rc<CompiledFunction>),
    Closure(Rc<Closure>),
    Function(Rc<Function>),
    Builtin(&'static Builtin),
    Return(Rc<Value>),
    Error(String),
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Integer(_) => ValueKind::Integer,
            Value::Boolean(_) => ValueKind::Boolean,
            Value::Null => ValueKind::Null,
            Value::Str(_) => ValueKind::Str,
            Value::Array(_) => ValueKind::Array,
            Value::Hash(_) => ValueKind::Hash,
            Value::CompiledFunction(_) => ValueKind::CompiledFunction,
            Value::Closure(_) => ValueKind::Closure,
            Value::Function(_) => ValueKind::Function,
            Value::Builtin(_) => ValueKind::Builtin,
            Value::Return(_) => ValueKind::Return,
            Value::Error(_) => ValueKind::Error,
        }
    }

    pub fn hash_key(&self) -> Option<HashKey> {
        match self {
            Value::Integer(value) => Some(HashKey {
                kind: ValueKind::Integer,
                value: *value as u64,
            }),
            Value::Boolean(value) => Some(HashKey {
                kind: ValueKind::Boolean,
                value: u64::from(*value),
            }),
            Value::Str(value) => Some(HashKey {
                kind: ValueKind::Str,
                value: fnv1a(value.as_bytes()),
            }),
            _ => None,
        }
    }

    /// `false` and `null` are falsy; every other value is truthy.
    pub fn is_truthy(&self) -> bool {
        !matches!(self, Value::Boolean(false) | Value::Null)
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Value::Error(_))
    }

    pub fn inspect(&self) -> String {
        match self {
            Value::Integer(value) => value.to_string(),
            Value::Boolean(value) => value.to_string(),
            Value::Null => "null".to_string(),
            Value::Str(value) => value.to_string(),
            Value::Array(elements) => {
                let rendered: Vec<_> = elements.iter().map(Value::inspect).collect();
                format!("[{}]", rendered.join(", "))
            }
            Value::Hash(pairs) => {
                let rendered: Vec<_> = pairs
                    .values()
                    .map(|pair| format!("{}: {}", pair.key.inspect(), pair.value.inspect()))
                    .collect();
                format!("{{{}}}", rendered.join(", "))
            }
            Value::CompiledFunction(func) => {
                format!("CompiledFunction[{:p}]", Rc::as_ptr(func))
            }
            Value::Closure(closure) => format!("Closure[{:p}]", Rc::as_ptr(closure)),
            Value::Function(func) => {
                let params: Vec<_> = func.parameters.iter().map(Ident::to_string).collect();
                format!("fn({}) {{\n{}\n}}", params.join(", "), func.body)
            }
            Value::Builtin(_) => "builtin function".to_string(),
            Value::Return(value) => value.inspect(),
            Value::Error(message) => format!("ERROR: {message}"),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.inspect())
    }
}

pub type Env = Rc<RefCell<Environment>>;

/// Name bindings for the tree-walking backend. Lookups walk outward through
/// the captured chain; definitions always land in the innermost scope.
#[derive(Debug, Default)]
pub struct Environment {
    store: HashMap<String, Value>,
    outer: Option<Env>,
}

impl Environment {
    pub fn new() -> Env {
        Rc::new(RefCell::new(Environment::default()))
    }

    pub fn new_enclosed(outer: Env) -> Env {
        Rc::new(RefCell::new(Environment {
            store: HashMap::new(),
            outer: Some(outer),
        }))
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        match self.store.get(name) {
            Some(value) => Some(value.clone()),
            None => self
                .outer
                .as_ref()
                .and_then(|outer| outer.borrow().get(name)),
        }
    }

    pub fn set(&mut self, name: impl Into<String>, value: Value) {
        self.store.insert(name.into(), value);
    }
}

/// Host-provided functions, in registry order. A builtin's position here is
/// the operand of `OpGetBuiltin`.
pub static BUILTINS: &[Builtin] = &[
    Builtin {
        name: "len",
        func: builtin_len,
    },
    Builtin {
        name: "first",
        func: builtin_first,
    },
    Builtin {
        name: "last",
        func: builtin_last,
    },
    Builtin {
        name: "rest",
        func: builtin_rest,
    },
    Builtin {
        name: "push",
        func: builtin_push,
    },
    Builtin {
        name: "puts",
        func: builtin_puts,
    },
];

pub fn builtin_by_name(name: &str) -> Option<&'static Builtin> {
    BUILTINS.iter().find(|builtin| builtin.name == name)
}

fn wrong_arity(got: usize, want: usize) -> Value {
    Value::Error(format!("wrong number of arguments. got={got}, want={want}"))
}

fn builtin_len(args: &[Value]) -> Value {
    if args.len() != 1 {
        return wrong_arity(args.len(), 1);
    }
    match &args[0] {
        // Byte length, not character count.
        Value::Str(value) => Value::Integer(value.len() as i64),
        Value::Array(elements) => Value::Integer(elements.len() as i64),
        other => Value::Error(format!(
            "argument to `len` not supported, got {}",
            other.kind()
        )),
    }
}

fn builtin_first(args: &[Value]) -> Value {
    if args.len() != 1 {
        return wrong_arity(args.len(), 1);
    }
    match &args[0] {
        Value::Array(elements) => elements.first().cloned().unwrap_or(Value::Null),
        other => Value::Error(format!(
            "argument to `first` must be ARRAY, got {}",
            other.kind()
        )),
    }
}

fn builtin_last(args: &[Value]) -> Value {
    if args.len() != 1 {
        return wrong_arity(args.len(), 1);
    }
    match &args[0] {
        Value::Array(elements) => elements.last().cloned().unwrap_or(Value::Null),
        other => Value::Error(format!(
            "argument to `last` must be ARRAY, got {}",
            other.kind()
        )),
    }
}

fn builtin_rest(args: &[Value]) -> Value {
    if args.len() != 1 {
        return wrong_arity(args.len(), 1);
    }
    match &args[0] {
        Value::Array(elements) => {
            if elements.is_empty() {
                Value::Null
            } else {
                Value::Array(Rc::new(elements[1..].to_vec()))
            }
        }
        other => Value::Error(format!(
            "argument to `rest` must be ARRAY, got {}",
            other.kind()
        )),
    }
}

fn builtin_push(args: &[Value]) -> Value {
    if args.len() != 2 {
        return wrong_arity(args.len(), 2);
    }
    match &args[0] {
        Value::Array(elements) => {
            let mut next = elements.as_ref().clone();
            next.push(args[1].clone());
            Value::Array(Rc::new(next))
        }
        other => Value::Error(format!(
            "argument to `push` must be ARRAY, got {}",
            other.kind()
        )),
    }
}

fn builtin_puts(args: &[Value]) -> Value {
    for arg in args {
        println!("{}", arg.inspect());
    }
    Value::Null
}

#[cfg(test)]
mod tests {
    use super::*;

    fn string(text: &str) -> Value {
        Value::Str(Rc::new(text.to_string()))
    }

    fn array(elements: Vec<Value>) -> Value {
        Value::Array(Rc::new(elements))
    }

    #[test]
    fn string_hash_keys_depend_only_on_content() {
        let hello1 = string("Hello World");
        let hello2 = string("Hello World");
        let diff1 = string("My name is johnny");
        let diff2 = string("My name is johnny");
        assert_eq!(hello1.hash_key(), hello2.hash_key());
        assert_eq!(diff1.hash_key(), diff2.hash_key());
        assert_ne!(hello1.hash_key(), diff1.hash_key());
    }

    #[test]
    fn integer_and_boolean_hash_keys() {
        assert_eq!(
            Value::Integer(-1).hash_key(),
            Some(HashKey {
                kind: ValueKind::Integer,
                value: (-1i64) as u64,
            })
        );
        assert_eq!(
            Value::Boolean(true).hash_key(),
            Some(HashKey {
                kind: ValueKind::Boolean,
                value: 1,
            })
        );
        assert_eq!(
            Value::Boolean(false).hash_key(),
            Some(HashKey {
                kind: ValueKind::Boolean,
                value: 0,
            })
        );
    }

    #[test]
    fn unhashable_kinds_have_no_hash_key() {
        assert_eq!(array(vec![]).hash_key(), None);
        assert_eq!(Value::Null.hash_key(), None);
    }

    #[test]
    fn structurally_equal_keys_collide_across_representations() {
        // Same content through different allocations.
        let mut pairs = IndexMap::new();
        let key = string("one");
        pairs.insert(
            key.hash_key().expect("hashable"),
            HashPair {
                key: key.clone(),
                value: Value::Integer(1),
            },
        );
        let probe = string("one");
        assert!(pairs.contains_key(&probe.hash_key().expect("hashable")));
    }

    #[test]
    fn inspect_renders_composites() {
        let value = array(vec![
            Value::Integer(1),
            string("two"),
            Value::Boolean(true),
            Value::Null,
        ]);
        assert_eq!(value.inspect(), "[1, two, true, null]");

        let mut pairs = IndexMap::new();
        let key = string("one");
        pairs.insert(
            key.hash_key().expect("hashable"),
            HashPair {
                key,
                value: Value::Integer(1),
            },
        );
        assert_eq!(Value::Hash(Rc::new(pairs)).inspect(), "{one: 1}");
    }

    #[test]
    fn truthiness_matches_conditional_semantics() {
        assert!(Value::Integer(0).is_truthy());
        assert!(string("").is_truthy());
        assert!(Value::Boolean(true).is_truthy());
        assert!(!Value::Boolean(false).is_truthy());
        assert!(!Value::Null.is_truthy());
    }

    #[test]
    fn len_counts_bytes_and_elements() {
        let len = builtin_by_name("len").expect("registered").func;
        assert_eq!(len(&[string("")]), Value::Integer(0));
        assert_eq!(len(&[string("four")]), Value::Integer(4));
        assert_eq!(len(&[string("hello world")]), Value::Integer(11));
        assert_eq!(
            len(&[array(vec![Value::Integer(1), Value::Integer(2)])]),
            Value::Integer(2)
        );
        assert_eq!(
            len(&[Value::Integer(1)]),
            Value::Error("argument to `len` not supported, got INTEGER".to_string())
        );
        assert_eq!(
            len(&[string("a"), string("b")]),
            Value::Error("wrong number of arguments. got=2, want=1".to_string())
        );
    }

    #[test]
    fn first_last_rest_handle_empty_arrays() {
        let first = builtin_by_name("first").expect("registered").func;
        let last = builtin_by_name("last").expect("registered").func;
        let rest = builtin_by_name("rest").expect("registered").func;
        let empty = array(vec![]);
        let items = array(vec![
            Value::Integer(1),
            Value::Integer(2),
            Value::Integer(3),
        ]);
        assert_eq!(first(&[empty.clone()]), Value::Null);
        assert_eq!(last(&[empty.clone()]), Value::Null);
        assert_eq!(rest(&[empty]), Value::Null);
        assert_eq!(first(&[items.clone()]), Value::Integer(1));
        assert_eq!(last(&[items.clone()]), Value::Integer(3));
        assert_eq!(
            rest(&[items]),
            array(vec![Value::Integer(2), Value::Integer(3)])
        );
        assert_eq!(
            rest(&[array(vec![Value::Integer(1)])]),
            array(vec![])
        );
    }

    #[test]
    fn push_leaves_the_original_array_untouched() {
        let push = builtin_by_name("push").expect("registered").func;
        let original = array(vec![Value::Integer(1)]);
        let extended = push(&[original.clone(), Value::Integer(2)]);
        assert_eq!(
            extended,
            array(vec![Value::Integer(1), Value::Integer(2)])
        );
        assert_eq!(original, array(vec![Value::Integer(1)]));
        assert_eq!(
            push(&[Value::Integer(1), Value::Integer(2)]),
            Value::Error("argument to `push` must be ARRAY, got INTEGER".to_string())
        );
    }

    #[test]
    fn environments_resolve_through_outer_scopes() {
        let outer = Environment::new();
        outer.borrow_mut().set("a", Value::Integer(1));
        let inner = Environment::new_enclosed(outer.clone());
        inner.borrow_mut().set("b", Value::Integer(2));
        assert_eq!(inner.borrow().get("a"), Some(Value::Integer(1)));
        assert_eq!(inner.borrow().get("b"), Some(Value::Integer(2)));
        assert_eq!(inner.borrow().get("c"), None);
        // Inner definitions shadow without touching the outer binding.
        inner.borrow_mut().set("a", Value::Integer(3));
        assert_eq!(outer.borrow().get("a"), Some(Value::Integer(1)));
    }

    #[test]
    fn builtin_registry_order_is_stable() {
        let names: Vec<_> = BUILTINS.iter().map(|builtin| builtin.name).collect();
        assert_eq!(names, ["len", "first", "last", "rest", "push", "puts"]);
    }
}

// File: src/object.rs
//
// The heap object family: strings, functions, closures, upvalue cells,
// natives, classes, instances, and bound methods. Everything is shared via
// `Rc` rather than `Arc`/`Mutex` — the VM is strictly single-threaded, so
// atomic refcounting and locking would be pure overhead. The object graph
// closures/classes/instances form can be cyclic; plain `Rc` tolerates that
// structurally (no crash, just a leak until process exit) without needing
// a tracing GC.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use ahash::AHashMap;

use crate::chunk::Chunk;
use crate::value::Value;

pub struct LoxFunction {
    pub arity: u8,
    pub upvalue_count: u8,
    pub chunk: Chunk,
    /// `None` for the implicit top-level script function.
    pub name: Option<Rc<str>>,
}

impl LoxFunction {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("script")
    }
}

pub type NativeFn = fn(&[Value]) -> Result<Value, String>;

pub struct NativeFunction {
    pub name: Rc<str>,
    pub arity: u8,
    pub func: NativeFn,
}

/// Either an open cell pointing at a live stack slot, or a closed cell that
/// owns its captured value. Transitions open -> closed exactly once.
pub enum Upvalue {
    Open(usize),
    Closed(Value),
}

pub struct Closure {
    pub function: Rc<LoxFunction>,
    pub upvalues: Vec<Rc<RefCell<Upvalue>>>,
}

pub struct Class {
    pub name: Rc<str>,
    pub methods: RefCell<AHashMap<Rc<str>, Rc<Closure>>>,
}

impl Class {
    pub fn new(name: Rc<str>) -> Self {
        Class { name, methods: RefCell::new(AHashMap::default()) }
    }
}

pub struct Instance {
    pub class: Rc<Class>,
    pub fields: RefCell<AHashMap<Rc<str>, Value>>,
}

impl Instance {
    pub fn new(class: Rc<Class>) -> Self {
        Instance { class, fields: RefCell::new(AHashMap::default()) }
    }
}

pub struct BoundMethod {
    pub receiver: Value,
    pub method: Rc<Closure>,
}

#[derive(Clone)]
pub enum Obj {
    String(Rc<str>),
    Function(Rc<LoxFunction>),
    Native(Rc<NativeFunction>),
    Closure(Rc<Closure>),
    Class(Rc<Class>),
    Instance(Rc<Instance>),
    BoundMethod(Rc<BoundMethod>),
}

impl Obj {
    pub fn type_name(&self) -> &'static str {
        match self {
            Obj::String(_) => "string",
            Obj::Function(_) => "function",
            Obj::Native(_) => "native function",
            Obj::Closure(_) => "function",
            Obj::Class(_) => "class",
            Obj::Instance(_) => "instance",
            Obj::BoundMethod(_) => "bound method",
        }
    }

    pub fn as_string(&self) -> Option<&Rc<str>> {
        match self {
            Obj::String(s) => Some(s),
            _ => None,
        }
    }
}

/// Identity equality for every variant except strings, where pointer
/// equality coincides with content equality because of interning.
impl PartialEq for Obj {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Obj::String(a), Obj::String(b)) => Rc::ptr_eq(a, b) || a == b,
            (Obj::Function(a), Obj::Function(b)) => Rc::ptr_eq(a, b),
            (Obj::Native(a), Obj::Native(b)) => Rc::ptr_eq(a, b),
            (Obj::Closure(a), Obj::Closure(b)) => Rc::ptr_eq(a, b),
            (Obj::Class(a), Obj::Class(b)) => Rc::ptr_eq(a, b),
            (Obj::Instance(a), Obj::Instance(b)) => Rc::ptr_eq(a, b),
            (Obj::BoundMethod(a), Obj::BoundMethod(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Display for Obj {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Obj::String(s) => write!(f, "{}", s),
            Obj::Function(func) => match &func.name {
                Some(name) => write!(f, "<fn {}>", name),
                None => write!(f, "<script>"),
            },
            Obj::Native(_) => write!(f, "<native fn>"),
            Obj::Closure(closure) => match &closure.function.name {
                Some(name) => write!(f, "<fn {}>", name),
                None => write!(f, "<script>"),
            },
            Obj::Class(class) => write!(f, "{}", class.name),
            Obj::Instance(instance) => write!(f, "{} instance", instance.class.name),
            Obj::BoundMethod(bound) => match &bound.method.function.name {
                Some(name) => write!(f, "<fn {}>", name),
                None => write!(f, "<script>"),
            },
        }
    }
}

// File: src/vm.rs
//
// Stack-based bytecode VM. Owns the value stack, the call frame stack, the
// open-upvalue list, the global table, and the string-intern table the
// compiler writes into during `interpret`. One `Vm` executes to completion
// on the calling thread; nothing here is `Send`/`Sync`, which is exactly
// the single-threaded contract this VM keeps.

use std::cell::RefCell;
use std::io::Write;
use std::rc::Rc;

use ahash::AHashMap;

use crate::chunk::Instr;
use crate::compiler;
use crate::errors::{CompileError, RuntimeError, TraceFrame};
use crate::natives::NATIVES;
use crate::object::{
    BoundMethod, Class, Closure, Instance, LoxFunction, NativeFn, NativeFunction, Obj, Upvalue,
};
use crate::value::{Interner, Value};

/// Call-frame ceiling; exceeding it is the "Stack overflow." runtime error.
const MAX_FRAMES: usize = 64;

struct CallFrame {
    closure: Rc<Closure>,
    ip: usize,
    base: usize,
}

pub enum InterpretError {
    Compile(CompileError),
    Runtime(RuntimeError),
}

pub struct Vm {
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    globals: AHashMap<Rc<str>, Value>,
    /// Sorted by strictly decreasing stack index, so closing upvalues at
    /// or above a given slot can stop at the first one below it.
    open_upvalues: Vec<Rc<RefCell<Upvalue>>>,
    interner: Interner,
    init_name: Rc<str>,
    output: Rc<RefCell<dyn Write>>,
}

impl Vm {
    pub fn new() -> Self {
        Self::with_output(Rc::new(RefCell::new(std::io::stdout())))
    }

    /// Builds a VM that writes `print` output through `output` instead of
    /// stdout; used by integration tests to capture program output.
    pub fn with_output(output: Rc<RefCell<dyn Write>>) -> Self {
        let mut interner = Interner::new();
        let init_name = interner.intern("init");
        let mut vm = Vm {
            stack: Vec::with_capacity(MAX_FRAMES * 256),
            frames: Vec::with_capacity(MAX_FRAMES),
            globals: AHashMap::default(),
            open_upvalues: Vec::new(),
            interner,
            init_name,
            output,
        };
        for (name, arity, func) in NATIVES {
            vm.define_native(name, *arity, *func);
        }
        vm
    }

    fn define_native(&mut self, name: &str, arity: u8, func: NativeFn) {
        let interned = self.interner.intern(name);
        let native = Rc::new(NativeFunction { name: interned.clone(), arity, func });
        self.globals.insert(interned, Value::Obj(Obj::Native(native)));
    }

    /// Compiles and runs one source string to completion. On compile
    /// failure the VM is never entered.
    pub fn interpret(&mut self, source: &str) -> Result<(), InterpretError> {
        let function =
            compiler::compile(source, &mut self.interner).map_err(InterpretError::Compile)?;
        let closure = Rc::new(Closure { function, upvalues: Vec::new() });
        self.stack.push(Value::Obj(Obj::Closure(closure.clone())));
        self.call(closure, 0).map_err(InterpretError::Runtime)?;
        self.run().map_err(InterpretError::Runtime)
    }

    fn peek(&self, distance: usize) -> &Value {
        &self.stack[self.stack.len() - 1 - distance]
    }

    fn runtime_error(&self, message: impl Into<String>) -> RuntimeError {
        let mut err = RuntimeError::new(message);
        err.frames = self
            .frames
            .iter()
            .rev()
            .map(|f| {
                let line = f.closure.function.chunk.lines[f.ip.saturating_sub(1)];
                TraceFrame { name: f.closure.function.display_name().to_string(), line }
            })
            .collect();
        err
    }

    fn run(&mut self) -> Result<(), RuntimeError> {
        loop {
            let frame_idx = self.frames.len() - 1;
            let ip = self.frames[frame_idx].ip;
            // Cloning the Rc (not the chunk) lets us read the current
            // instruction by reference without holding a borrow of `self`
            // across the stack/global mutations the opcode needs.
            let function = self.frames[frame_idx].closure.function.clone();
            self.frames[frame_idx].ip += 1;
            let instr = &function.chunk.code[ip];

            match instr {
                Instr::Constant(idx) => {
                    let v = function.chunk.constants[*idx as usize].clone();
                    self.stack.push(v);
                }
                Instr::Nil => self.stack.push(Value::Nil),
                Instr::True => self.stack.push(Value::Bool(true)),
                Instr::False => self.stack.push(Value::Bool(false)),
                Instr::Pop => {
                    self.stack.pop();
                }
                Instr::GetLocal(slot) => {
                    let base = self.frames[frame_idx].base;
                    let v = self.stack[base + *slot as usize].clone();
                    self.stack.push(v);
                }
                Instr::SetLocal(slot) => {
                    let base = self.frames[frame_idx].base;
                    let v = self.peek(0).clone();
                    self.stack[base + *slot as usize] = v;
                }
                Instr::GetGlobal(idx) => {
                    let name = Self::read_string_constant(&function, *idx);
                    match self.globals.get(&name) {
                        Some(v) => {
                            let v = v.clone();
                            self.stack.push(v);
                        }
                        None => {
                            return Err(self.runtime_error(format!("Undefined variable '{}'.", name)))
                        }
                    }
                }
                Instr::SetGlobal(idx) => {
                    let name = Self::read_string_constant(&function, *idx);
                    if !self.globals.contains_key(&name) {
                        return Err(self.runtime_error(format!("Undefined variable '{}'.", name)));
                    }
                    let v = self.peek(0).clone();
                    self.globals.insert(name, v);
                }
                Instr::DefineGlobal(idx) => {
                    let name = Self::read_string_constant(&function, *idx);
                    let v = self.stack.pop().expect("define-global needs a value on the stack");
                    self.globals.insert(name, v);
                }
                Instr::GetUpvalue(idx) => {
                    let cell = self.frames[frame_idx].closure.upvalues[*idx as usize].clone();
                    self.stack.push(self.read_upvalue(&cell));
                }
                Instr::SetUpvalue(idx) => {
                    let cell = self.frames[frame_idx].closure.upvalues[*idx as usize].clone();
                    let v = self.peek(0).clone();
                    self.write_upvalue(&cell, v);
                }
                Instr::GetProperty(idx) => {
                    let name = Self::read_string_constant(&function, *idx);
                    let receiver = self.peek(0).clone();
                    let instance = match &receiver {
                        Value::Obj(Obj::Instance(inst)) => inst.clone(),
                        _ => return Err(self.runtime_error("Only instances have properties.")),
                    };
                    if let Some(v) = instance.fields.borrow().get(&name).cloned() {
                        self.stack.pop();
                        self.stack.push(v);
                    } else if let Some(method) = instance.class.methods.borrow().get(&name).cloned() {
                        self.stack.pop();
                        let bound = Rc::new(BoundMethod { receiver, method });
                        self.stack.push(Value::Obj(Obj::BoundMethod(bound)));
                    } else {
                        return Err(
                            self.runtime_error(format!("Undefined property '{}'.", name))
                        );
                    }
                }
                Instr::SetProperty(idx) => {
                    let name = Self::read_string_constant(&function, *idx);
                    let value = self.peek(0).clone();
                    let target = self.peek(1).clone();
                    let instance = match &target {
                        Value::Obj(Obj::Instance(inst)) => inst.clone(),
                        _ => return Err(self.runtime_error("Only instances have fields.")),
                    };
                    instance.fields.borrow_mut().insert(name, value.clone());
                    self.stack.pop();
                    self.stack.pop();
                    self.stack.push(value);
                }
                Instr::Equal => {
                    let b = self.stack.pop().expect("equal needs two operands");
                    let a = self.stack.pop().expect("equal needs two operands");
                    self.stack.push(Value::Bool(a == b));
                }
                Instr::Greater => {
                    let (a, b) = self.numeric_operands()?;
                    self.stack.pop();
                    self.stack.pop();
                    self.stack.push(Value::Bool(a > b));
                }
                Instr::Less => {
                    let (a, b) = self.numeric_operands()?;
                    self.stack.pop();
                    self.stack.pop();
                    self.stack.push(Value::Bool(a < b));
                }
                Instr::Add => self.add()?,
                Instr::Subtract => {
                    let (a, b) = self.numeric_operands()?;
                    self.stack.pop();
                    self.stack.pop();
                    self.stack.push(Value::Number(a - b));
                }
                Instr::Multiply => {
                    let (a, b) = self.numeric_operands()?;
                    self.stack.pop();
                    self.stack.pop();
                    self.stack.push(Value::Number(a * b));
                }
                Instr::Divide => {
                    let (a, b) = self.numeric_operands()?;
                    self.stack.pop();
                    self.stack.pop();
                    // Division by zero yields IEEE infinity, not an error.
                    self.stack.push(Value::Number(a / b));
                }
                Instr::Not => {
                    let v = self.stack.pop().expect("not needs an operand");
                    self.stack.push(Value::Bool(v.is_falsey()));
                }
                Instr::Negate => match self.peek(0) {
                    Value::Number(_) => {
                        if let Some(Value::Number(n)) = self.stack.pop() {
                            self.stack.push(Value::Number(-n));
                        }
                    }
                    _ => return Err(self.runtime_error("Operand must be a number.")),
                },
                Instr::Print => {
                    let v = self.stack.pop().expect("print needs a value");
                    let _ = writeln!(self.output.borrow_mut(), "{}", v);
                }
                Instr::Jump(target) => {
                    self.frames[frame_idx].ip = *target;
                }
                Instr::JumpIfFalse(target) => {
                    if self.peek(0).is_falsey() {
                        self.frames[frame_idx].ip = *target;
                    }
                }
                Instr::Loop(target) => {
                    self.frames[frame_idx].ip = *target;
                }
                Instr::Call(argc) => {
                    let argc = *argc;
                    let callee = self.peek(argc as usize).clone();
                    self.call_value(callee, argc)?;
                }
                Instr::Closure(fn_idx, upvalue_refs) => {
                    let func_val = function.chunk.constants[*fn_idx as usize].clone();
                    let inner_fn = match func_val {
                        Value::Obj(Obj::Function(f)) => f,
                        _ => unreachable!("closure constant must be a function"),
                    };
                    let base = self.frames[frame_idx].base;
                    let mut cells = Vec::with_capacity(upvalue_refs.len());
                    for uv in upvalue_refs {
                        if uv.is_local {
                            cells.push(self.capture_upvalue(base + uv.index as usize));
                        } else {
                            cells.push(self.frames[frame_idx].closure.upvalues[uv.index as usize].clone());
                        }
                    }
                    let closure = Rc::new(Closure { function: inner_fn, upvalues: cells });
                    self.stack.push(Value::Obj(Obj::Closure(closure)));
                }
                Instr::CloseUpvalue => {
                    let top = self.stack.len() - 1;
                    self.close_upvalues(top);
                    self.stack.pop();
                }
                Instr::Return => {
                    let result = self.stack.pop().expect("return needs a value");
                    let base = self.frames[frame_idx].base;
                    self.close_upvalues(base);
                    self.frames.pop();
                    if self.frames.is_empty() {
                        self.stack.pop();
                        return Ok(());
                    }
                    self.stack.truncate(base);
                    self.stack.push(result);
                }
                Instr::Class(idx) => {
                    let name = Self::read_string_constant(&function, *idx);
                    self.stack.push(Value::Obj(Obj::Class(Rc::new(Class::new(name)))));
                }
                Instr::Inherit => {
                    let superclass_val = self.peek(1).clone();
                    let superclass = match &superclass_val {
                        Value::Obj(Obj::Class(c)) => c.clone(),
                        _ => return Err(self.runtime_error("Superclass must be a class.")),
                    };
                    let subclass_val = self.peek(0).clone();
                    let subclass = match &subclass_val {
                        Value::Obj(Obj::Class(c)) => c.clone(),
                        _ => unreachable!("subclass slot must hold a class"),
                    };
                    for (name, method) in superclass.methods.borrow().iter() {
                        subclass.methods.borrow_mut().insert(name.clone(), method.clone());
                    }
                    self.stack.pop();
                }
                Instr::Method(idx) => {
                    let name = Self::read_string_constant(&function, *idx);
                    let method_val = self.peek(0).clone();
                    let closure = match &method_val {
                        Value::Obj(Obj::Closure(c)) => c.clone(),
                        _ => unreachable!("method slot must hold a closure"),
                    };
                    let class_val = self.peek(1).clone();
                    let class = match &class_val {
                        Value::Obj(Obj::Class(c)) => c.clone(),
                        _ => unreachable!("class slot must hold a class"),
                    };
                    class.methods.borrow_mut().insert(name, closure);
                    self.stack.pop();
                }
                Instr::Invoke(idx, argc) => {
                    let name = Self::read_string_constant(&function, *idx);
                    self.invoke(&name, *argc)?;
                }
                Instr::SuperInvoke(idx, argc) => {
                    let argc = *argc;
                    let name = Self::read_string_constant(&function, *idx);
                    let superclass_val = self.stack.pop().expect("super-invoke needs a superclass");
                    let superclass = match &superclass_val {
                        Value::Obj(Obj::Class(c)) => c.clone(),
                        _ => return Err(self.runtime_error("Superclass must be a class.")),
                    };
                    let method = superclass
                        .methods
                        .borrow()
                        .get(&name)
                        .cloned()
                        .ok_or_else(|| self.runtime_error(format!("Undefined property '{}'.", name)))?;
                    self.call(method, argc)?;
                }
                Instr::GetSuper(idx) => {
                    let name = Self::read_string_constant(&function, *idx);
                    let superclass_val = self.stack.pop().expect("get-super needs a superclass");
                    let superclass = match &superclass_val {
                        Value::Obj(Obj::Class(c)) => c.clone(),
                        _ => return Err(self.runtime_error("Superclass must be a class.")),
                    };
                    let method = superclass
                        .methods
                        .borrow()
                        .get(&name)
                        .cloned()
                        .ok_or_else(|| self.runtime_error(format!("Undefined property '{}'.", name)))?;
                    let receiver = self.stack.pop().expect("get-super needs a receiver");
                    let bound = Rc::new(BoundMethod { receiver, method });
                    self.stack.push(Value::Obj(Obj::BoundMethod(bound)));
                }
            }
        }
    }

    fn read_string_constant(function: &Rc<LoxFunction>, idx: u8) -> Rc<str> {
        match &function.chunk.constants[idx as usize] {
            Value::Obj(Obj::String(s)) => s.clone(),
            _ => unreachable!("constant at this index must be a string"),
        }
    }

    fn numeric_operands(&self) -> Result<(f64, f64), RuntimeError> {
        match (self.peek(1), self.peek(0)) {
            (Value::Number(a), Value::Number(b)) => Ok((*a, *b)),
            _ => Err(self.runtime_error("Operands must be numbers.")),
        }
    }

    fn add(&mut self) -> Result<(), RuntimeError> {
        let result = match (self.peek(1), self.peek(0)) {
            (Value::Number(a), Value::Number(b)) => Value::Number(a + b),
            (Value::Obj(Obj::String(a)), Value::Obj(Obj::String(b))) => {
                let mut concatenated = String::with_capacity(a.len() + b.len());
                concatenated.push_str(a);
                concatenated.push_str(b);
                Value::Obj(Obj::String(self.interner.intern(&concatenated)))
            }
            _ => return Err(self.runtime_error("Operands must be two numbers or two strings.")),
        };
        self.stack.pop();
        self.stack.pop();
        self.stack.push(result);
        Ok(())
    }

    fn call_value(&mut self, callee: Value, argc: u8) -> Result<(), RuntimeError> {
        match callee {
            Value::Obj(Obj::Closure(closure)) => self.call(closure, argc),
            Value::Obj(Obj::Native(native)) => {
                if native.arity != argc {
                    return Err(self.runtime_error(format!(
                        "Expected {} arguments but got {}.",
                        native.arity, argc
                    )));
                }
                let start = self.stack.len() - argc as usize;
                let args: Vec<Value> = self.stack[start..].to_vec();
                match (native.func)(&args) {
                    Ok(result) => {
                        self.stack.truncate(start - 1);
                        self.stack.push(result);
                        Ok(())
                    }
                    Err(msg) => Err(self.runtime_error(msg)),
                }
            }
            Value::Obj(Obj::Class(class)) => {
                let instance = Rc::new(Instance::new(class.clone()));
                let slot = self.stack.len() - argc as usize - 1;
                self.stack[slot] = Value::Obj(Obj::Instance(instance));
                if let Some(initializer) = class.methods.borrow().get(&self.init_name).cloned() {
                    self.call(initializer, argc)
                } else if argc != 0 {
                    Err(self.runtime_error(format!("Expected 0 arguments but got {}.", argc)))
                } else {
                    Ok(())
                }
            }
            Value::Obj(Obj::BoundMethod(bound)) => {
                let slot = self.stack.len() - argc as usize - 1;
                self.stack[slot] = bound.receiver.clone();
                self.call(bound.method.clone(), argc)
            }
            _ => Err(self.runtime_error("Can only call functions and classes.")),
        }
    }

    fn call(&mut self, closure: Rc<Closure>, argc: u8) -> Result<(), RuntimeError> {
        if closure.function.arity != argc {
            return Err(self.runtime_error(format!(
                "Expected {} arguments but got {}.",
                closure.function.arity, argc
            )));
        }
        if self.frames.len() >= MAX_FRAMES {
            return Err(self.runtime_error("Stack overflow."));
        }
        let base = self.stack.len() - argc as usize - 1;
        self.frames.push(CallFrame { closure, ip: 0, base });
        Ok(())
    }

    /// Fused get-property + call: a field with the same name as a method
    /// shadows it, checked exactly once here so field-vs-method precedence
    /// is observable at the call site.
    fn invoke(&mut self, name: &Rc<str>, argc: u8) -> Result<(), RuntimeError> {
        let receiver = self.peek(argc as usize).clone();
        let instance = match &receiver {
            Value::Obj(Obj::Instance(inst)) => inst.clone(),
            _ => return Err(self.runtime_error("Only instances have methods.")),
        };
        if let Some(field) = instance.fields.borrow().get(name).cloned() {
            let slot = self.stack.len() - 1 - argc as usize;
            self.stack[slot] = field.clone();
            return self.call_value(field, argc);
        }
        let method = instance
            .class
            .methods
            .borrow()
            .get(name)
            .cloned()
            .ok_or_else(|| self.runtime_error(format!("Undefined property '{}'.", name)))?;
        self.call(method, argc)
    }

    fn capture_upvalue(&mut self, slot: usize) -> Rc<RefCell<Upvalue>> {
        if let Some(existing) = self.open_upvalues.iter().find(|u| match &*u.borrow() {
            Upvalue::Open(s) => *s == slot,
            Upvalue::Closed(_) => false,
        }) {
            return existing.clone();
        }
        let cell = Rc::new(RefCell::new(Upvalue::Open(slot)));
        let insert_at = self
            .open_upvalues
            .iter()
            .position(|u| match &*u.borrow() {
                Upvalue::Open(s) => *s < slot,
                Upvalue::Closed(_) => false,
            })
            .unwrap_or(self.open_upvalues.len());
        self.open_upvalues.insert(insert_at, cell.clone());
        cell
    }

    fn close_upvalues(&mut self, limit: usize) {
        while let Some(cell) = self.open_upvalues.first() {
            let slot = match &*cell.borrow() {
                Upvalue::Open(s) => *s,
                Upvalue::Closed(_) => unreachable!("closed cells are removed from open_upvalues"),
            };
            if slot < limit {
                break;
            }
            let value = self.stack[slot].clone();
            *cell.borrow_mut() = Upvalue::Closed(value);
            self.open_upvalues.remove(0);
        }
    }

    fn read_upvalue(&self, cell: &Rc<RefCell<Upvalue>>) -> Value {
        match &*cell.borrow() {
            Upvalue::Open(slot) => self.stack[*slot].clone(),
            Upvalue::Closed(v) => v.clone(),
        }
    }

    fn write_upvalue(&self, cell: &Rc<RefCell<Upvalue>>, value: Value) {
        let slot = match &*cell.borrow() {
            Upvalue::Open(s) => Some(*s),
            Upvalue::Closed(_) => None,
        };
        match slot {
            Some(s) => self.stack[s] = value,
            None => *cell.borrow_mut() = Upvalue::Closed(value),
        }
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(source: &str) -> String {
        let output = Rc::new(RefCell::new(Vec::new()));
        let mut vm = Vm::with_output(output.clone());
        match vm.interpret(source) {
            Ok(()) => {}
            Err(InterpretError::Compile(_)) => panic!("unexpected compile error in {:?}", source),
            Err(InterpretError::Runtime(e)) => panic!("unexpected runtime error: {}", e),
        }
        let bytes = output.borrow();
        String::from_utf8(bytes.clone()).unwrap()
    }

    #[test]
    fn arithmetic_precedence() {
        assert_eq!(run("print 1 + 2 * 3;"), "7\n");
    }

    #[test]
    fn string_concatenation_interns() {
        assert_eq!(run("print \"a\" + \"b\";"), "ab\n");
    }

    #[test]
    fn while_loop_counts_up() {
        assert_eq!(run("var i = 0; while (i < 3) { print i; i = i + 1; }"), "0\n1\n2\n");
    }

    #[test]
    fn closures_capture_mutable_state() {
        let src = "fun make() { var x = 1; fun inc() { x = x + 1; return x; } return inc; } \
                   var f = make(); print f(); print f(); print f();";
        assert_eq!(run(src), "2\n3\n4\n");
    }

    #[test]
    fn methods_see_this() {
        let src = r#"class A { greet() { print "hi " + this.name; } }
                     var a = A(); a.name = "lox"; a.greet();"#;
        assert_eq!(run(src), "hi lox\n");
    }

    #[test]
    fn inheritance_and_super() {
        let src = r#"class A { greet() { print "hi " + this.name; } }
                     class B < A { greet() { super.greet(); print "!"; } }
                     var b = B(); b.name = "sub"; b.greet();"#;
        assert_eq!(run(src), "hi sub\n!\n");
    }

    #[test]
    fn field_shadows_method_at_call_site() {
        let src = r#"class A { speak() { return "method"; } }
                     var a = A();
                     fun field() { return "field"; }
                     a.speak = field;
                     print a.speak();"#;
        assert_eq!(run(src), "field\n");
    }

    #[test]
    fn division_by_zero_is_infinity_not_an_error() {
        assert_eq!(run("print 1 / 0;"), "inf\n");
    }

    #[test]
    fn adding_string_and_number_is_a_runtime_error() {
        let output = Rc::new(RefCell::new(Vec::new()));
        let mut vm = Vm::with_output(output);
        match vm.interpret("\"a\" - 1;") {
            Err(InterpretError::Runtime(e)) => {
                assert_eq!(e.message, "Operands must be numbers.");
                assert_eq!(e.frames.len(), 1);
            }
            other => panic!("expected a runtime error, got {:?}", other.is_ok()),
        }
    }

    #[test]
    fn deep_recursion_overflows_the_frame_stack() {
        let output = Rc::new(RefCell::new(Vec::new()));
        let mut vm = Vm::with_output(output);
        let src = "fun f() { return f(); } f();";
        match vm.interpret(src) {
            Err(InterpretError::Runtime(e)) => assert_eq!(e.message, "Stack overflow."),
            other => panic!("expected stack overflow, got {:?}", other.is_ok()),
        }
    }

    #[test]
    fn string_equality_matches_content() {
        assert_eq!(run("print (\"ab\" + \"c\") == \"abc\";"), "true\n");
    }
}

//! The stack-based bytecode VM: call frames, the value stack, method
//! dispatch, and the native function library. Owns the [`heap::Heap`] that
//! the GC runs over.

pub mod error;
pub mod heap;
mod natives;
pub mod object;
pub mod value;

use compiler::chunk::OpCode;
use compiler::value::Constant;
use error::{Backtrace, BacktraceFrame, RuntimeError};
use heap::Heap;
use object::{ClosureObj, NativeFn, Obj, Table, UpvalueState};
use std::io::{Read, Write};
use std::time::Instant;
use value::{ObjHandle, Value};

const MAX_FRAMES: usize = 64;

struct CallFrame {
    closure: ObjHandle,
    ip: usize,
    base: usize,
}

/// The result of running a complete program through the core entry point.
pub enum ExitStatus {
    Ok,
    CompileError,
    RuntimeError,
}

/// The bytecode interpreter. Borrows its standard streams for the duration
/// of a run so tests can substitute in-memory buffers for stdout/stderr/
/// stdin instead of the process's real handles.
pub struct Vm<'io> {
    pub heap: Heap,
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    globals: Table,
    open_upvalues: Vec<ObjHandle>,
    pub stdout: &'io mut dyn Write,
    pub stderr: &'io mut dyn Write,
    pub stdin: &'io mut dyn Read,
    pub started_at: Instant,
}

/// Compiles and runs `source`, writing program output to `stdout`, error
/// diagnostics to `stderr`, and reading `getc()` bytes from `stdin`.
pub fn run_string(
    source: &str,
    stdout: &mut dyn Write,
    stderr: &mut dyn Write,
    stdin: &mut dyn Read,
    stress_gc: bool,
) -> ExitStatus {
    match compiler::compile(source) {
        Err(errors) => {
            for error in &errors {
                let _ = writeln!(stderr, "{error}");
            }
            ExitStatus::CompileError
        }
        Ok(function) => {
            let mut vm = Vm::new(stdout, stderr, stdin, stress_gc);
            vm.define_natives();
            match vm.interpret(function) {
                Ok(()) => ExitStatus::Ok,
                Err(err) => {
                    let _ = writeln!(vm.stderr, "{err}");
                    ExitStatus::RuntimeError
                }
            }
        }
    }
}

impl<'io> Vm<'io> {
    pub fn new(
        stdout: &'io mut dyn Write,
        stderr: &'io mut dyn Write,
        stdin: &'io mut dyn Read,
        stress_gc: bool,
    ) -> Self {
        Self {
            heap: Heap::new(stress_gc),
            stack: Vec::with_capacity(256),
            frames: Vec::with_capacity(MAX_FRAMES),
            globals: Table::new(),
            open_upvalues: Vec::new(),
            stdout,
            stderr,
            stdin,
            started_at: Instant::now(),
        }
    }

    fn define_natives(&mut self) {
        self.define_native("clock", 0, natives::clock);
        self.define_native("exit", 1, natives::exit);
        self.define_native("getc", 0, natives::getc);
        self.define_native("chr", 1, natives::chr);
        self.define_native("ord", 1, natives::ord);
        self.define_native("print_error", 1, natives::print_error);

        let name = self.heap.intern_str("Object");
        let class = self.heap.alloc_class(name);
        self.globals.insert(name, Value::Obj(class));
    }

    fn define_native(&mut self, name: &str, arity: u8, func: NativeFn) {
        let handle = self.heap.alloc_native(name, arity, func);
        let name_handle = self.heap.intern_str(name);
        self.globals.insert(name_handle, Value::Obj(handle));
    }

    /// Runs the compiled top-level script function to completion.
    pub fn interpret(&mut self, function: std::rc::Rc<compiler::chunk::Function>) -> Result<(), RuntimeError> {
        let closure = self.heap.alloc_closure(ClosureObj {
            function,
            upvalues: Vec::new(),
        });
        self.stack.push(Value::Obj(closure));
        self.call_closure(closure, 0)?;
        self.run()
    }

    // ---- stack helpers ----

    fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    fn pop(&mut self) -> Value {
        self.stack.pop().expect("pop on an empty stack is a compiler bug")
    }

    fn peek(&self, distance: usize) -> Value {
        self.stack[self.stack.len() - 1 - distance]
    }

    // ---- bytecode cursor ----

    fn chunk_of(&self, closure: ObjHandle) -> &compiler::chunk::Chunk {
        match self.heap.get(closure) {
            Obj::Closure(c) => &c.function.chunk,
            _ => unreachable!("frame closure handle did not resolve to a closure"),
        }
    }

    fn read_byte(&mut self) -> u8 {
        let (closure, ip) = {
            let frame = self.frames.last_mut().expect("instruction fetch with no active frame");
            let values = (frame.closure, frame.ip);
            frame.ip += 1;
            values
        };
        self.chunk_of(closure).code()[ip]
    }

    fn read_u16(&mut self) -> u16 {
        let hi = self.read_byte();
        let lo = self.read_byte();
        u16::from_be_bytes([hi, lo])
    }

    fn read_constant(&mut self, index: u16) -> Constant {
        let closure = self.frames.last().unwrap().closure;
        self.chunk_of(closure).constant(index).clone()
    }

    fn constant_to_value(&mut self, constant: Constant) -> Value {
        match constant {
            Constant::Number(n) => Value::Number(n),
            Constant::Str(s) => Value::Obj(self.heap.intern_str(&s)),
            Constant::Function(_) => unreachable!("function constants are only read via OP_CLOSURE"),
        }
    }

    fn read_name_handle(&mut self) -> ObjHandle {
        let idx = self.read_u16();
        let constant = self.read_constant(idx);
        match constant {
            Constant::Str(s) => self.heap.intern_str(&s),
            _ => unreachable!("name operand was not a string constant"),
        }
    }

    // ---- errors ----

    fn runtime_error(&self, message: impl Into<String>) -> RuntimeError {
        let mut error = RuntimeError::new(message);
        error.backtrace = self.build_backtrace();
        error
    }

    fn build_backtrace(&self) -> Backtrace {
        let mut frames = Vec::new();
        for frame in self.frames.iter().rev() {
            let chunk = self.chunk_of(frame.closure);
            let line = if frame.ip > 0 {
                chunk.line_at(frame.ip - 1)
            } else {
                chunk.line_at(0)
            };
            let name = match self.heap.get(frame.closure) {
                Obj::Closure(c) => c.function.name.as_ref().map(|n| n.to_string()),
                _ => None,
            };
            frames.push(BacktraceFrame { line, name });
        }
        Backtrace { frames }
    }

    // ---- upvalues ----

    fn capture_upvalue(&mut self, stack_slot: usize) -> ObjHandle {
        for &handle in &self.open_upvalues {
            if let Obj::Upvalue(u) = self.heap.get(handle) {
                if let UpvalueState::Open(slot) = u.state {
                    if slot == stack_slot {
                        return handle;
                    }
                }
            }
        }
        let handle = self.heap.alloc_open_upvalue(stack_slot);
        self.open_upvalues.push(handle);
        handle
    }

    fn close_upvalues(&mut self, from_slot: usize) {
        let mut i = 0;
        while i < self.open_upvalues.len() {
            let handle = self.open_upvalues[i];
            let open_slot = match self.heap.get(handle) {
                Obj::Upvalue(u) => match u.state {
                    UpvalueState::Open(slot) => Some(slot),
                    UpvalueState::Closed => None,
                },
                _ => None,
            };
            match open_slot {
                Some(slot) if slot >= from_slot => {
                    let value = self.stack[slot];
                    if let Obj::Upvalue(u) = self.heap.get_mut(handle) {
                        u.state = UpvalueState::Closed;
                        u.closed = value;
                    }
                    self.open_upvalues.remove(i);
                }
                _ => i += 1,
            }
        }
    }

    // ---- calling ----

    fn call_closure(&mut self, handle: ObjHandle, argc: u8) -> Result<(), RuntimeError> {
        let arity = match self.heap.get(handle) {
            Obj::Closure(c) => c.function.arity,
            _ => unreachable!("call_closure on a non-closure handle"),
        };
        if argc != arity {
            return Err(self.runtime_error(format!(
                "Expected {arity} arguments but got {argc}."
            )));
        }
        if self.frames.len() >= MAX_FRAMES {
            return Err(self.runtime_error("Stack overflow."));
        }
        let base = self.stack.len() - argc as usize - 1;
        self.frames.push(CallFrame {
            closure: handle,
            ip: 0,
            base,
        });
        Ok(())
    }

    fn find_method(&self, class_handle: ObjHandle, name: ObjHandle) -> Option<ObjHandle> {
        match self.heap.get(class_handle) {
            Obj::Class(c) => c.methods.get(&name).and_then(Value::as_obj),
            _ => None,
        }
    }

    fn call_value(&mut self, callee: Value, argc: u8) -> Result<(), RuntimeError> {
        let handle = match callee.as_obj() {
            Some(h) => h,
            None => return Err(self.runtime_error("Can only call functions and classes.")),
        };
        match self.heap.get(handle) {
            Obj::Closure(_) => self.call_closure(handle, argc),
            Obj::Native(n) => {
                let (func, arity) = (n.func, n.arity);
                if argc != arity {
                    return Err(self.runtime_error(format!(
                        "Expected {arity} arguments but got {argc}."
                    )));
                }
                let args_start = self.stack.len() - argc as usize;
                let args: Vec<Value> = self.stack[args_start..].to_vec();
                let result = func(self, &args).map_err(|m| self.runtime_error(m))?;
                self.stack.truncate(args_start - 1);
                self.push(result);
                Ok(())
            }
            Obj::Class(_) => {
                let instance = self.heap.alloc_instance(handle);
                let slot = self.stack.len() - 1 - argc as usize;
                self.stack[slot] = Value::Obj(instance);
                let init_name = self.heap.init_string;
                match self.find_method(handle, init_name) {
                    Some(init) => self.call_closure(init, argc),
                    None => {
                        if argc != 0 {
                            return Err(self.runtime_error(format!(
                                "Expected 0 arguments but got {argc}."
                            )));
                        }
                        Ok(())
                    }
                }
            }
            Obj::BoundMethod(b) => {
                let (method, receiver) = (b.method, b.receiver);
                let slot = self.stack.len() - 1 - argc as usize;
                self.stack[slot] = receiver;
                self.call_closure(method, argc)
            }
            _ => Err(self.runtime_error("Can only call functions and classes.")),
        }
    }

    // ---- garbage collection ----

    fn maybe_collect(&mut self) {
        if self.heap.should_collect() {
            self.collect_garbage();
        }
    }

    fn collect_garbage(&mut self) {
        let mut roots = Vec::new();
        for value in &self.stack {
            if let Some(handle) = value.as_obj() {
                roots.push(handle);
            }
        }
        for frame in &self.frames {
            roots.push(frame.closure);
        }
        roots.extend(self.open_upvalues.iter().copied());
        roots.extend(self.globals.keys().copied());
        for value in self.globals.values() {
            if let Some(handle) = value.as_obj() {
                roots.push(handle);
            }
        }
        roots.push(self.heap.init_string);
        self.heap.collect(&roots);
    }

    // ---- dispatch loop ----

    fn run(&mut self) -> Result<(), RuntimeError> {
        loop {
            self.maybe_collect();
            let byte = self.read_byte();
            let op = OpCode::try_from(byte).expect("well-formed chunk has only valid opcodes");
            match op {
                OpCode::Constant => {
                    let idx = self.read_u16();
                    let constant = self.read_constant(idx);
                    let value = self.constant_to_value(constant);
                    self.push(value);
                }
                OpCode::Nil => self.push(Value::Nil),
                OpCode::True => self.push(Value::Bool(true)),
                OpCode::False => self.push(Value::Bool(false)),
                OpCode::Pop => {
                    self.pop();
                }
                OpCode::GetLocal => {
                    let slot = self.read_byte() as usize;
                    let base = self.frames.last().unwrap().base;
                    self.push(self.stack[base + slot]);
                }
                OpCode::SetLocal => {
                    let slot = self.read_byte() as usize;
                    let base = self.frames.last().unwrap().base;
                    self.stack[base + slot] = self.peek(0);
                }
                OpCode::GetGlobal => {
                    let name = self.read_name_handle();
                    match self.globals.get(&name) {
                        Some(value) => self.push(*value),
                        None => {
                            let msg = format!(
                                "Undefined variable '{}'.",
                                self.heap.as_string(name).unwrap_or("?")
                            );
                            return Err(self.runtime_error(msg));
                        }
                    }
                }
                OpCode::DefineGlobal => {
                    let name = self.read_name_handle();
                    let value = self.pop();
                    self.globals.insert(name, value);
                }
                OpCode::SetGlobal => {
                    let name = self.read_name_handle();
                    if !self.globals.contains_key(&name) {
                        let msg = format!(
                            "Undefined variable '{}'.",
                            self.heap.as_string(name).unwrap_or("?")
                        );
                        return Err(self.runtime_error(msg));
                    }
                    self.globals.insert(name, self.peek(0));
                }
                OpCode::GetUpvalue => {
                    let slot = self.read_byte() as usize;
                    let closure = self.frames.last().unwrap().closure;
                    let upvalue_handle = match self.heap.get(closure) {
                        Obj::Closure(c) => c.upvalues[slot],
                        _ => unreachable!(),
                    };
                    let value = match self.heap.get(upvalue_handle) {
                        Obj::Upvalue(u) => match u.state {
                            UpvalueState::Open(stack_slot) => self.stack[stack_slot],
                            UpvalueState::Closed => u.closed,
                        },
                        _ => unreachable!(),
                    };
                    self.push(value);
                }
                OpCode::SetUpvalue => {
                    let slot = self.read_byte() as usize;
                    let closure = self.frames.last().unwrap().closure;
                    let upvalue_handle = match self.heap.get(closure) {
                        Obj::Closure(c) => c.upvalues[slot],
                        _ => unreachable!(),
                    };
                    let value = self.peek(0);
                    let stack_slot = match self.heap.get(upvalue_handle) {
                        Obj::Upvalue(u) => match u.state {
                            UpvalueState::Open(s) => Some(s),
                            UpvalueState::Closed => None,
                        },
                        _ => unreachable!(),
                    };
                    match stack_slot {
                        Some(s) => self.stack[s] = value,
                        None => {
                            if let Obj::Upvalue(u) = self.heap.get_mut(upvalue_handle) {
                                u.closed = value;
                            }
                        }
                    }
                }
                OpCode::GetProperty => {
                    let name = self.read_name_handle();
                    let receiver = self.peek(0);
                    let instance = self.expect_instance(receiver, "Only instances have properties.")?;
                    let field = match self.heap.get(instance) {
                        Obj::Instance(i) => i.fields.get(&name).copied(),
                        _ => unreachable!(),
                    };
                    match field {
                        Some(value) => {
                            self.pop();
                            self.push(value);
                        }
                        None => {
                            let class = match self.heap.get(instance) {
                                Obj::Instance(i) => i.class,
                                _ => unreachable!(),
                            };
                            match self.find_method(class, name) {
                                Some(method) => {
                                    let bound = self.heap.alloc_bound_method(receiver, method);
                                    self.pop();
                                    self.push(Value::Obj(bound));
                                }
                                None => return Err(self.undefined_property(name)),
                            }
                        }
                    }
                }
                OpCode::SetProperty => {
                    let name = self.read_name_handle();
                    let value = self.pop();
                    let receiver = self.pop();
                    let instance = self.expect_instance(receiver, "Only instances have fields.")?;
                    if let Obj::Instance(i) = self.heap.get_mut(instance) {
                        i.fields.insert(name, value);
                    }
                    self.push(value);
                }
                OpCode::GetSuper => {
                    let name = self.read_name_handle();
                    let superclass = self.pop().as_obj().expect("superclass operand must be an object");
                    let receiver = self.pop();
                    match self.find_method(superclass, name) {
                        Some(method) => {
                            let bound = self.heap.alloc_bound_method(receiver, method);
                            self.push(Value::Obj(bound));
                        }
                        None => return Err(self.undefined_property(name)),
                    }
                }
                OpCode::Equal => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::Bool(a == b));
                }
                OpCode::Greater => self.number_comparison(|a, b| a > b)?,
                OpCode::Less => self.number_comparison(|a, b| a < b)?,
                OpCode::Add => self.add()?,
                OpCode::Subtract => self.arithmetic(|a, b| a - b)?,
                OpCode::Multiply => self.arithmetic(|a, b| a * b)?,
                OpCode::Divide => self.arithmetic(|a, b| a / b)?,
                OpCode::Not => {
                    let value = self.pop();
                    self.push(Value::Bool(!value.is_truthy()));
                }
                OpCode::Negate => {
                    let value = self.pop();
                    match value {
                        Value::Number(n) => self.push(Value::Number(-n)),
                        _ => return Err(self.runtime_error("Operand must be a number.")),
                    }
                }
                OpCode::Print => {
                    let value = self.pop();
                    let rendered = self.heap.display(&value);
                    let _ = writeln!(self.stdout, "{rendered}");
                }
                OpCode::Jump => {
                    let offset = self.read_u16();
                    self.frames.last_mut().unwrap().ip += offset as usize;
                }
                OpCode::JumpIfFalse => {
                    let offset = self.read_u16();
                    if !self.peek(0).is_truthy() {
                        self.frames.last_mut().unwrap().ip += offset as usize;
                    }
                }
                OpCode::Loop => {
                    let offset = self.read_u16();
                    self.frames.last_mut().unwrap().ip -= offset as usize;
                }
                OpCode::Call => {
                    let argc = self.read_byte();
                    let callee = self.peek(argc as usize);
                    self.call_value(callee, argc)?;
                }
                OpCode::Invoke => {
                    let name = self.read_name_handle();
                    let argc = self.read_byte();
                    let receiver = self.peek(argc as usize);
                    let instance = self.expect_instance(receiver, "Only instances have methods.")?;
                    let field = match self.heap.get(instance) {
                        Obj::Instance(i) => i.fields.get(&name).copied(),
                        _ => unreachable!(),
                    };
                    match field {
                        Some(value) => {
                            let slot = self.stack.len() - 1 - argc as usize;
                            self.stack[slot] = value;
                            self.call_value(value, argc)?;
                        }
                        None => {
                            let class = match self.heap.get(instance) {
                                Obj::Instance(i) => i.class,
                                _ => unreachable!(),
                            };
                            let method = self
                                .find_method(class, name)
                                .ok_or_else(|| self.undefined_property(name))?;
                            self.call_closure(method, argc)?;
                        }
                    }
                }
                OpCode::SuperInvoke => {
                    let name = self.read_name_handle();
                    let argc = self.read_byte();
                    let superclass = self.pop().as_obj().expect("superclass operand must be an object");
                    let method = self
                        .find_method(superclass, name)
                        .ok_or_else(|| self.undefined_property(name))?;
                    self.call_closure(method, argc)?;
                }
                OpCode::Closure => {
                    let idx = self.read_u16();
                    let constant = self.read_constant(idx);
                    let function = match constant {
                        Constant::Function(f) => f,
                        _ => unreachable!("closure operand was not a function constant"),
                    };
                    let upvalue_count = function.upvalue_count as usize;
                    let current_closure = self.frames.last().unwrap().closure;
                    let base = self.frames.last().unwrap().base;
                    let mut upvalues = Vec::with_capacity(upvalue_count);
                    for _ in 0..upvalue_count {
                        let is_local = self.read_byte() != 0;
                        let index = self.read_byte() as usize;
                        let handle = if is_local {
                            self.capture_upvalue(base + index)
                        } else {
                            match self.heap.get(current_closure) {
                                Obj::Closure(c) => c.upvalues[index],
                                _ => unreachable!(),
                            }
                        };
                        upvalues.push(handle);
                    }
                    let closure = self.heap.alloc_closure(ClosureObj { function, upvalues });
                    self.push(Value::Obj(closure));
                }
                OpCode::CloseUpvalue => {
                    let top = self.stack.len() - 1;
                    self.close_upvalues(top);
                    self.pop();
                }
                OpCode::Return => {
                    let result = self.pop();
                    let returning = self.frames.pop().expect("return with no active frame");
                    self.close_upvalues(returning.base);
                    self.stack.truncate(returning.base);
                    self.push(result);
                    if self.frames.is_empty() {
                        return Ok(());
                    }
                }
                OpCode::Class => {
                    let name = self.read_name_handle();
                    let class = self.heap.alloc_class(name);
                    self.push(Value::Obj(class));
                }
                OpCode::Inherit => {
                    let subclass = self.pop().as_obj().expect("subclass operand must be an object");
                    let superclass = self.peek(0);
                    let super_handle = match superclass {
                        Value::Obj(h) if matches!(self.heap.get(h), Obj::Class(_)) => h,
                        _ => return Err(self.runtime_error("Superclass must be a class.")),
                    };
                    self.pop();
                    let methods: Vec<(ObjHandle, Value)> = match self.heap.get(super_handle) {
                        Obj::Class(c) => c.methods.iter().map(|(k, v)| (*k, *v)).collect(),
                        _ => unreachable!(),
                    };
                    if let Obj::Class(sub) = self.heap.get_mut(subclass) {
                        for (k, v) in methods {
                            sub.methods.insert(k, v);
                        }
                    }
                }
                OpCode::Method => {
                    let name = self.read_name_handle();
                    let method = self.pop();
                    let class = self.peek(0).as_obj().expect("class operand must be an object");
                    if let Obj::Class(c) = self.heap.get_mut(class) {
                        c.methods.insert(name, method);
                    }
                }
            }
        }
    }

    fn expect_instance(&self, value: Value, message: &'static str) -> Result<ObjHandle, RuntimeError> {
        match value {
            Value::Obj(h) if matches!(self.heap.get(h), Obj::Instance(_)) => Ok(h),
            _ => Err(self.runtime_error(message)),
        }
    }

    fn undefined_property(&self, name: ObjHandle) -> RuntimeError {
        self.runtime_error(format!(
            "Undefined property '{}'.",
            self.heap.as_string(name).unwrap_or("?")
        ))
    }

    fn number_comparison(&mut self, cmp: fn(f64, f64) -> bool) -> Result<(), RuntimeError> {
        let b = self.pop();
        let a = self.pop();
        match (a, b) {
            (Value::Number(x), Value::Number(y)) => {
                self.push(Value::Bool(cmp(x, y)));
                Ok(())
            }
            _ => Err(self.runtime_error("Operands must be numbers.")),
        }
    }

    fn arithmetic(&mut self, op: fn(f64, f64) -> f64) -> Result<(), RuntimeError> {
        let b = self.pop();
        let a = self.pop();
        match (a, b) {
            (Value::Number(x), Value::Number(y)) => {
                self.push(Value::Number(op(x, y)));
                Ok(())
            }
            _ => Err(self.runtime_error("Operands must be numbers.")),
        }
    }

    fn add(&mut self) -> Result<(), RuntimeError> {
        let b = self.pop();
        let a = self.pop();
        match (a, b) {
            (Value::Number(x), Value::Number(y)) => {
                self.push(Value::Number(x + y));
                Ok(())
            }
            (Value::Obj(ha), Value::Obj(hb))
                if self.heap.as_string(ha).is_some() && self.heap.as_string(hb).is_some() =>
            {
                let mut joined = String::new();
                joined.push_str(self.heap.as_string(ha).unwrap());
                joined.push_str(self.heap.as_string(hb).unwrap());
                let handle = self.heap.intern_str(&joined);
                self.push(Value::Obj(handle));
                Ok(())
            }
            _ => Err(self.runtime_error("Operands must be two numbers or two strings.")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(source: &str) -> (ExitStatus, String, String) {
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut stdin: &[u8] = &[];
        let status = run_string(source, &mut stdout, &mut stderr, &mut stdin, false);
        (
            status,
            String::from_utf8(stdout).unwrap(),
            String::from_utf8(stderr).unwrap(),
        )
    }

    fn run_stress(source: &str) -> String {
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut stdin: &[u8] = &[];
        run_string(source, &mut stdout, &mut stderr, &mut stdin, true);
        String::from_utf8(stdout).unwrap()
    }

    #[test]
    fn prints_arithmetic_result() {
        let (status, out, _) = run("print 1 + 2;");
        assert!(matches!(status, ExitStatus::Ok));
        assert_eq!(out, "3\n");
    }

    #[test]
    fn calls_function_with_return_value() {
        let (_, out, _) = run("fun f(x) { return x * x; } print f(5);");
        assert_eq!(out, "25\n");
    }

    #[test]
    fn closures_capture_mutable_upvalue() {
        let source = "fun make() { var x = 0; fun inc() { x = x + 1; return x; } return inc; } \
                      var c = make(); print c(); print c(); print c();";
        let (_, out, _) = run(source);
        assert_eq!(out, "1\n2\n3\n");
    }

    #[test]
    fn inheritance_and_super_dispatch() {
        let source = "class A { greet() { print \"A\"; } } \
                      class B < A { greet() { super.greet(); print \"B\"; } } \
                      B().greet();";
        let (_, out, _) = run(source);
        assert_eq!(out, "A\nB\n");
    }

    #[test]
    fn adding_number_and_string_is_a_runtime_error() {
        let (status, _, err) = run("print 1 + \"a\";");
        assert!(matches!(status, ExitStatus::RuntimeError));
        assert!(err.contains("Operands must be two numbers or two strings."));
    }

    #[test]
    fn undefined_global_is_a_runtime_error() {
        let (status, _, err) = run("print x;");
        assert!(matches!(status, ExitStatus::RuntimeError));
        assert!(err.contains("Undefined variable 'x'."));
    }

    #[test]
    fn stack_is_empty_after_normal_termination() {
        let source = "fun f() { return 1; } f(); f(); print \"done\";";
        let (status, out, _) = run(source);
        assert!(matches!(status, ExitStatus::Ok));
        assert_eq!(out, "done\n");
    }

    #[test]
    fn stress_gc_does_not_change_program_output() {
        let source = "class Node { init(v) { this.v = v; } } \
                      fun make(n) { var i = 0; var last = nil; while (i < n) { var node = Node(i); last = node; i = i + 1; } return last; } \
                      print make(50).v;";
        let (_, normal_out, _) = run(source);
        let stressed_out = run_stress(source);
        assert_eq!(normal_out, stressed_out);
    }

    #[test]
    fn init_with_wrong_arity_is_a_runtime_error() {
        let source = "class A { init(x) {} } A();";
        let (status, _, err) = run(source);
        assert!(matches!(status, ExitStatus::RuntimeError));
        assert!(err.contains("Expected 1 arguments but got 0."));
    }

    #[test]
    fn compile_error_is_reported_and_nothing_runs() {
        let (status, out, err) = run("print 1 +;");
        assert!(matches!(status, ExitStatus::CompileError));
        assert!(out.is_empty());
        assert!(err.contains("Error"));
    }
}

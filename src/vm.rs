use std::cell::RefCell;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Instant;

use hashbrown::HashMap;
use rand::rngs::SmallRng;
use rand::SeedableRng;

use crate::bytecode::OpCode;
use crate::compiler::Compiler;
use crate::dispatcher::Dispatcher;
use crate::stack::{Stack, FRAMES_MAX};
use crate::table::Table;
use crate::value::{
    GcObj, Heap, InternedString, ObjBoundMethod, ObjClass, ObjClosure, ObjInstance, ObjList,
    ObjUpvalue, Value,
};

pub mod error;
pub mod natives;

use self::error::{InterpretError, RuntimeError, RuntimeErrorKind};
use self::natives::NativeCtx;

/// Program output sink, cloneable so sibling VMs on other threads write to
/// the same place their parent does.
#[derive(Clone)]
pub struct SharedWriter(Arc<Mutex<dyn io::Write + Send>>);

impl SharedWriter {
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }

    pub fn new<W: io::Write + Send + 'static>(writer: W) -> Self {
        Self(Arc::new(Mutex::new(writer)))
    }

    pub fn from_shared(writer: Arc<Mutex<dyn io::Write + Send>>) -> Self {
        Self(writer)
    }
}

impl io::Write for SharedWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .flush()
    }
}

impl std::fmt::Debug for SharedWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SharedWriter")
    }
}

/// One entry of the call stack: the closure being executed, the resume
/// offset into its chunk, and the base of its stack window.
#[derive(Debug, Clone, Copy)]
pub struct CallFrame {
    pub closure: GcObj<ObjClosure>,
    pub ip: usize,
    pub slots: usize,
}

/// The interpreter. Owns its heap, stack and globals outright; sibling VMs
/// spawned for `async` blocks get deep copies, never references.
#[derive(Debug)]
pub struct Vm {
    pub(crate) heap: Heap,
    globals: Table,
    frames: Vec<CallFrame>,
    stack: Stack,
    /// Upvalues still aliasing live stack slots, sorted by descending slot.
    open_upvalues: Vec<GcObj<RefCell<ObjUpvalue>>>,
    init_string: InternedString,

    src: Arc<str>,
    /// Offset of the instruction currently executing, for error spans.
    op_start: usize,

    output: SharedWriter,
    pub(crate) dispatcher: Arc<Dispatcher>,
    pub(crate) failure: Arc<AtomicBool>,
    /// Thread handles of spawned children, grouped by enclosing `finish`
    /// block. The bottom group catches children spawned outside any block
    /// and is joined when interpretation ends.
    finish_groups: Vec<Vec<JoinHandle<()>>>,

    started_at: Instant,
    rng: SmallRng,
    is_child: bool,
}

impl Vm {
    pub fn new() -> Self {
        Self::with_output(SharedWriter::stdout())
    }

    pub fn with_output(output: SharedWriter) -> Self {
        Self::with_parts(output, Dispatcher::new())
    }

    fn with_parts(output: SharedWriter, dispatcher: Arc<Dispatcher>) -> Self {
        let mut heap = Heap::new();
        let init_string = heap.intern("init");
        let mut globals = Table::new();
        natives::register(&mut globals, &mut heap);

        Vm {
            heap,
            globals,
            frames: Vec::with_capacity(FRAMES_MAX),
            stack: Stack::new(),
            open_upvalues: Vec::new(),
            init_string,
            src: Arc::from(""),
            op_start: 0,
            output,
            dispatcher,
            failure: Arc::new(AtomicBool::new(false)),
            finish_groups: vec![Vec::new()],
            started_at: Instant::now(),
            rng: SmallRng::from_entropy(),
            is_child: false,
        }
    }

    /// Deep-copies this VM into a sibling: same frames and stack snapshot,
    /// fresh heap, fresh intern table, fresh globals with the natives bound
    /// again. Writes on either side stay invisible to the other.
    pub(crate) fn fork(&self, failure: Arc<AtomicBool>) -> Vm {
        let mut heap = Heap::new();
        let mut memo = HashMap::new();

        let mut stack = Stack::new();
        for value in self.stack.iter() {
            let value = heap.adopt_value(*value, &mut memo);
            stack.push(value).expect("child stack mirrors parent size");
        }

        let frames = self
            .frames
            .iter()
            .map(|frame| CallFrame {
                closure: heap.adopt_closure(frame.closure, &mut memo),
                ip: frame.ip,
                slots: frame.slots,
            })
            .collect();

        let open_upvalues = self
            .open_upvalues
            .iter()
            .map(|upvalue| heap.adopt_upvalue(*upvalue, &mut memo))
            .collect();

        let init_string = heap.intern("init");
        let mut globals = Table::new();
        natives::register(&mut globals, &mut heap);

        Vm {
            heap,
            globals,
            frames,
            stack,
            open_upvalues,
            init_string,
            src: Arc::clone(&self.src),
            op_start: self.op_start,
            output: self.output.clone(),
            dispatcher: Arc::clone(&self.dispatcher),
            failure,
            finish_groups: vec![Vec::new()],
            started_at: self.started_at,
            rng: SmallRng::from_entropy(),
            is_child: true,
        }
    }

    pub fn interpret<'a>(&mut self, source: &'a str) -> Result<(), InterpretError<'a>> {
        self.src = Arc::from(source);
        self.stack.truncate(0);
        self.frames.clear();
        self.open_upvalues.clear();

        let fun = Compiler::new(source, &mut self.heap)
            .compile()
            .map_err(InterpretError::Static)?;

        // No collection can run between these allocations and the push, so
        // the fresh function cannot be swept while unreachable.
        let closure = self.heap.gc.new_object_inner(ObjClosure::new(fun));
        self.stack
            .push(Value::new_object(closure.into()))
            .expect("the stack is empty");
        self.call_closure(closure, 0)
            .expect("the script takes no arguments");

        // reachable for failure propagation from sibling VMs
        let thread_id = std::thread::current().id();
        self.dispatcher
            .set_active(thread_id, Arc::clone(&self.failure));

        let result = self.run();

        // children spawned outside any finish block, plus any group left
        // unjoined by an error mid-block, are joined before the program is
        // allowed to end
        let stragglers: Vec<_> = self.finish_groups.drain(..).flatten().collect();
        self.join_children(stragglers);
        self.finish_groups.push(Vec::new());

        self.dispatcher.free_active(thread_id);

        match result {
            Ok(()) => {
                if self.failure.swap(false, Ordering::SeqCst) {
                    return Err(self.error(RuntimeErrorKind::Terminated).into());
                }
                Ok(())
            }
            Err(err) => {
                self.stack.truncate(0);
                self.frames.clear();
                self.open_upvalues.clear();
                self.failure.store(false, Ordering::SeqCst);
                Err(err.into())
            }
        }
    }

    /// The dispatch loop. Also the entry point for sibling VMs, which start
    /// mid-function on their snapshot frames.
    pub(crate) fn run(&mut self) -> Result<(), RuntimeError> {
        if self.frames.is_empty() {
            return Ok(());
        }

        loop {
            self.op_start = self.frame().ip;
            let op = OpCode::try_from_u8(self.read_u8())
                .expect("the compiler only emits valid opcodes");

            #[cfg(feature = "debug_trace")]
            self.trace_instruction();

            match op {
                OpCode::Constant => {
                    let value = self.read_constant();
                    self.push(value)?;
                }
                OpCode::Nil => self.push(Value::NIL)?,
                OpCode::True => self.push(Value::TRUE)?,
                OpCode::False => self.push(Value::FALSE)?,
                OpCode::Pop => {
                    self.pop();
                }
                OpCode::GetLocal => {
                    let slot = self.read_u8() as usize;
                    let value = self.stack[self.frame().slots + slot];
                    self.push(value)?;
                }
                OpCode::SetLocal => {
                    let slot = self.read_u8() as usize;
                    let value = *self.stack.last().expect("assignment has a value");
                    let base = self.frame().slots;
                    self.stack[base + slot] = value;
                }
                OpCode::DefineGlobal => {
                    let name = self.read_string();
                    let value = *self.stack.last().expect("definition has a value");
                    self.globals.set(name, value);
                    self.pop();
                }
                OpCode::GetGlobal => {
                    let name = self.read_string();
                    match self.globals.get(name) {
                        Some(value) => self.push(value)?,
                        None => {
                            let kind = RuntimeErrorKind::UndefinedVariable {
                                name: name.as_str().to_string(),
                            };
                            return Err(self.error(kind));
                        }
                    }
                }
                OpCode::SetGlobal => {
                    let name = self.read_string();
                    let value = *self.stack.last().expect("assignment has a value");
                    if self.globals.set(name, value) {
                        // assignment must not create the variable
                        self.globals.delete(name);
                        let kind = RuntimeErrorKind::UndefinedVariable {
                            name: name.as_str().to_string(),
                        };
                        return Err(self.error(kind));
                    }
                }
                OpCode::GetUpvalue => {
                    let slot = self.read_u8() as usize;
                    let upvalue = self.frame().closure.upvalues.borrow()[slot];
                    let value = match &*upvalue.borrow() {
                        ObjUpvalue::Open(slot) => self.stack[*slot],
                        ObjUpvalue::Closed(value) => *value,
                    };
                    self.push(value)?;
                }
                OpCode::SetUpvalue => {
                    let slot = self.read_u8() as usize;
                    let value = *self.stack.last().expect("assignment has a value");
                    let upvalue = self.frame().closure.upvalues.borrow()[slot];
                    let mut upvalue = upvalue.borrow_mut();
                    match &mut *upvalue {
                        ObjUpvalue::Open(slot) => {
                            let slot = *slot;
                            drop(upvalue);
                            self.stack[slot] = value;
                        }
                        ObjUpvalue::Closed(closed) => *closed = value,
                    }
                }
                OpCode::GetProperty => {
                    let name = self.read_string();
                    let receiver = self.peek(0);
                    let Some(instance) = receiver.try_as_instance() else {
                        let kind = RuntimeErrorKind::PropertyOnNonInstance {
                            found: receiver.type_name(),
                        };
                        return Err(self.error(kind));
                    };

                    let field = instance.borrow().fields.get(name);
                    match field {
                        Some(value) => {
                            self.pop();
                            self.push(value)?;
                        }
                        None => {
                            let class = instance.borrow().class;
                            self.bind_method(class, name)?;
                        }
                    }
                }
                OpCode::SetProperty => {
                    let name = self.read_string();
                    let receiver = self.peek(1);
                    let Some(instance) = receiver.try_as_instance() else {
                        let kind = RuntimeErrorKind::PropertyOnNonInstance {
                            found: receiver.type_name(),
                        };
                        return Err(self.error(kind));
                    };

                    let value = self.peek(0);
                    instance.borrow_mut().fields.set(name, value);
                    let value = self.pop();
                    self.pop(); // the instance
                    self.push(value)?;
                }
                OpCode::GetSuper => {
                    let name = self.read_string();
                    let superclass = self
                        .pop()
                        .try_as_class()
                        .expect("the compiler puts the superclass on top");
                    self.bind_method(superclass, name)?;
                }
                OpCode::Equal => {
                    let rhs = self.pop();
                    let lhs = self.pop();
                    self.push(Value::new_bool(lhs == rhs))?;
                }
                OpCode::Greater => self.binary_cmp_op(|lhs, rhs| lhs > rhs)?,
                OpCode::Less => self.binary_cmp_op(|lhs, rhs| lhs < rhs)?,
                OpCode::Add => self.run_binary_add()?,
                OpCode::Subtract => self.binary_arithmetic_op(|lhs, rhs| lhs - rhs)?,
                OpCode::Multiply => self.binary_arithmetic_op(|lhs, rhs| lhs * rhs)?,
                OpCode::Divide => self.binary_arithmetic_op(|lhs, rhs| lhs / rhs)?,
                OpCode::Modulo => self.binary_arithmetic_op(|lhs, rhs| lhs % rhs)?,
                OpCode::Not => {
                    let value = self.pop();
                    self.push(Value::new_bool(value.is_falsey()))?;
                }
                OpCode::Negate => {
                    let value = self.peek(0);
                    match value.try_as_number() {
                        Some(n) => {
                            self.pop();
                            self.push(Value::new_number(-n))?;
                        }
                        None => {
                            let kind = RuntimeErrorKind::InvalidOperand {
                                expected: "number",
                                found: value.type_name(),
                            };
                            return Err(self.error(kind));
                        }
                    }
                }
                OpCode::Print => {
                    let value = self.pop();
                    use io::Write;
                    writeln!(&mut self.output, "{}", value).ok();
                }
                OpCode::Jump => {
                    let offset = self.read_u16() as usize;
                    self.frame_mut().ip += offset;
                }
                OpCode::JumpIfFalse => {
                    let offset = self.read_u16() as usize;
                    if self.peek(0).is_falsey() {
                        self.frame_mut().ip += offset;
                    }
                }
                OpCode::Loop => {
                    let offset = self.read_u16() as usize;
                    self.check_failure()?;
                    self.frame_mut().ip -= offset;
                }
                OpCode::Call => {
                    let arg_count = self.read_u8() as usize;
                    self.check_failure()?;
                    let callee = self.peek(arg_count);
                    self.call_value(callee, arg_count)?;
                }
                OpCode::Invoke => {
                    let name = self.read_string();
                    let arg_count = self.read_u8() as usize;
                    self.check_failure()?;
                    self.invoke(name, arg_count)?;
                }
                OpCode::SuperInvoke => {
                    let name = self.read_string();
                    let arg_count = self.read_u8() as usize;
                    self.check_failure()?;
                    let superclass = self
                        .pop()
                        .try_as_class()
                        .expect("the compiler puts the superclass on top");
                    self.invoke_from_class(superclass, name, arg_count)?;
                }
                OpCode::Closure => {
                    let fun = self
                        .read_constant()
                        .try_as_function()
                        .expect("CLOSURE operand is a function constant");

                    self.maybe_gc();
                    let closure = self.heap.gc.new_object_inner(ObjClosure::new(fun));
                    // rooted before the upvalues are captured, so the
                    // capture allocations can collect safely
                    self.push(Value::new_object(closure.into()))?;

                    for _ in 0..fun.upvalue_count {
                        let is_local = self.read_u8() != 0;
                        let index = self.read_u8() as usize;
                        let upvalue = if is_local {
                            let slot = self.frame().slots + index;
                            self.capture_upvalue(slot)
                        } else {
                            self.frame().closure.upvalues.borrow()[index]
                        };
                        closure.upvalues.borrow_mut().push(upvalue);
                    }
                }
                OpCode::CloseUpvalue => {
                    self.close_upvalues(self.stack.len() - 1);
                    self.pop();
                }
                OpCode::Return => {
                    let result = self.pop();
                    let frame = self.frames.pop().expect("a frame is active");
                    self.close_upvalues(frame.slots);
                    self.stack.truncate(frame.slots);

                    if self.frames.is_empty() {
                        return Ok(());
                    }
                    self.push(result)?;
                }
                OpCode::Class => {
                    let name = self.read_string();
                    self.maybe_gc();
                    let class = self.heap.gc.new_value(RefCell::new(ObjClass::new(name)));
                    self.push(class)?;
                }
                OpCode::Inherit => {
                    let superclass = self.peek(1);
                    let Some(superclass) = superclass.try_as_class() else {
                        let kind = RuntimeErrorKind::SuperclassNotClass {
                            found: superclass.type_name(),
                        };
                        return Err(self.error(kind));
                    };
                    let subclass = self
                        .peek(0)
                        .try_as_class()
                        .expect("the compiler puts the new class on top");

                    subclass
                        .borrow_mut()
                        .methods
                        .add_all(&superclass.borrow().methods);
                    self.pop(); // the subclass; the superclass stays as `super`
                }
                OpCode::Method => {
                    let name = self.read_string();
                    let method = self.peek(0);
                    let class = self
                        .peek(1)
                        .try_as_class()
                        .expect("the compiler puts the class below the method");
                    class.borrow_mut().methods.set(name, method);
                    self.pop();
                }
                OpCode::BuildList => {
                    let count = self.read_u8() as usize;
                    self.maybe_gc();
                    // items stay on the stack, and thus reachable, until the
                    // list owns them
                    let items = self.stack.slice_from(self.stack.len() - count).to_vec();
                    let list = self.heap.gc.new_value(RefCell::new(ObjList { items }));
                    self.stack.pop_n(count);
                    self.push(list)?;
                }
                OpCode::IndexGet => self.run_index_get()?,
                OpCode::IndexSet => self.run_index_set()?,
                OpCode::FinishBegin => {
                    self.finish_groups.push(Vec::new());
                }
                OpCode::FinishEnd => {
                    let group = self
                        .finish_groups
                        .pop()
                        .expect("the compiler balances finish blocks");
                    self.join_children(group);
                    self.check_failure()?;
                }
                OpCode::AsyncBegin => {
                    let offset = self.read_u16() as usize;
                    // ip now rests on the first instruction of the block,
                    // which is exactly where the snapshot child resumes
                    let dispatcher = Arc::clone(&self.dispatcher);
                    let handle = dispatcher.spawn_async(self);
                    self.finish_groups
                        .last_mut()
                        .expect("the bottom group always exists")
                        .push(handle);
                    self.frame_mut().ip += offset;
                }
                OpCode::AsyncEnd => {
                    debug_assert!(self.is_child, "parents jump over ASYNC_END");
                    return Ok(());
                }
            }
        }
    }

    #[inline]
    fn frame(&self) -> &CallFrame {
        self.frames.last().expect("a frame is active")
    }

    #[inline]
    fn frame_mut(&mut self) -> &mut CallFrame {
        self.frames.last_mut().expect("a frame is active")
    }

    #[inline]
    fn read_u8(&mut self) -> u8 {
        let frame = self.frames.last_mut().expect("a frame is active");
        let closure = frame.closure;
        let byte = closure.fun.chunk.code[frame.ip];
        frame.ip += 1;
        byte
    }

    #[inline]
    fn read_u16(&mut self) -> u16 {
        let lo = self.read_u8();
        let hi = self.read_u8();
        u16::from_le_bytes([lo, hi])
    }

    #[inline]
    fn read_constant(&mut self) -> Value {
        let idx = self.read_u8() as usize;
        let closure = self.frame().closure;
        closure.fun.chunk.constants[idx]
    }

    #[inline]
    fn read_string(&mut self) -> InternedString {
        self.read_constant()
            .try_as_string()
            .expect("constant is a name string")
    }

    #[inline]
    fn push(&mut self, value: Value) -> Result<(), RuntimeError> {
        self.stack
            .push(value)
            .map_err(|()| self.error(RuntimeErrorKind::StackOverflow))
    }

    #[inline]
    fn pop(&mut self) -> Value {
        self.stack.pop().expect("popping an empty stack is a compiler bug")
    }

    #[inline]
    fn peek(&self, distance: usize) -> Value {
        *self
            .stack
            .peek(distance)
            .expect("peeking past the stack is a compiler bug")
    }

    fn call_value(&mut self, callee: Value, arg_count: usize) -> Result<(), RuntimeError> {
        if let Some(closure) = callee.try_as_closure() {
            return self.call_closure(closure, arg_count);
        }
        if let Some(bound) = callee.try_as_bound_method() {
            let slot = self.stack.len() - arg_count - 1;
            self.stack[slot] = bound.receiver;
            return self.call_closure(bound.method, arg_count);
        }
        if let Some(class) = callee.try_as_class() {
            self.maybe_gc();
            let instance = self
                .heap
                .gc
                .new_value(RefCell::new(ObjInstance::new(class)));
            let slot = self.stack.len() - arg_count - 1;
            self.stack[slot] = instance;

            let init = class.borrow().methods.get(self.init_string);
            return match init {
                Some(init) => {
                    let init = init.try_as_closure().expect("methods are closures");
                    self.call_closure(init, arg_count)
                }
                None if arg_count != 0 => {
                    let kind = RuntimeErrorKind::WrongNumberOfArguments {
                        expected: 0,
                        got: arg_count,
                    };
                    Err(self.error(kind))
                }
                None => Ok(()),
            };
        }
        if let Some(native) = callee.try_as_native_fn() {
            let args_start = self.stack.len() - arg_count;
            let args = self.stack.slice_from(args_start).to_vec();
            let mut ctx = NativeCtx {
                heap: &mut self.heap,
                started_at: self.started_at,
                rng: &mut self.rng,
            };
            return match (native.function)(&mut ctx, &args) {
                Ok(value) => {
                    self.stack.pop_n(arg_count + 1);
                    self.push(value)
                }
                Err(msg) => Err(self.error(RuntimeErrorKind::Native(msg))),
            };
        }

        let kind = RuntimeErrorKind::NotCallable {
            found: callee.type_name(),
        };
        Err(self.error(kind))
    }

    fn call_closure(
        &mut self,
        closure: GcObj<ObjClosure>,
        arg_count: usize,
    ) -> Result<(), RuntimeError> {
        if arg_count != closure.fun.arity {
            let kind = RuntimeErrorKind::WrongNumberOfArguments {
                expected: closure.fun.arity,
                got: arg_count,
            };
            return Err(self.error(kind));
        }

        if self.frames.len() == FRAMES_MAX {
            return Err(self.error(RuntimeErrorKind::StackOverflow));
        }

        self.frames.push(CallFrame {
            closure,
            ip: 0,
            slots: self.stack.len() - arg_count - 1,
        });

        Ok(())
    }

    /// Fused property access + call. Fields shadow methods, so a callable
    /// stored in a field wins over a method of the same name.
    fn invoke(&mut self, name: InternedString, arg_count: usize) -> Result<(), RuntimeError> {
        let receiver = self.peek(arg_count);
        let Some(instance) = receiver.try_as_instance() else {
            let kind = RuntimeErrorKind::PropertyOnNonInstance {
                found: receiver.type_name(),
            };
            return Err(self.error(kind));
        };

        let field = instance.borrow().fields.get(name);
        if let Some(field) = field {
            let slot = self.stack.len() - arg_count - 1;
            self.stack[slot] = field;
            return self.call_value(field, arg_count);
        }

        let class = instance.borrow().class;
        self.invoke_from_class(class, name, arg_count)
    }

    fn invoke_from_class(
        &mut self,
        class: GcObj<RefCell<ObjClass>>,
        name: InternedString,
        arg_count: usize,
    ) -> Result<(), RuntimeError> {
        let method = class.borrow().methods.get(name);
        let Some(method) = method else {
            let kind = RuntimeErrorKind::UndefinedProperty {
                name: name.as_str().to_string(),
            };
            return Err(self.error(kind));
        };

        let method = method.try_as_closure().expect("methods are closures");
        self.call_closure(method, arg_count)
    }

    /// Replaces the instance on top of the stack with `name` bound to it.
    fn bind_method(
        &mut self,
        class: GcObj<RefCell<ObjClass>>,
        name: InternedString,
    ) -> Result<(), RuntimeError> {
        let method = class.borrow().methods.get(name);
        let Some(method) = method else {
            let kind = RuntimeErrorKind::UndefinedProperty {
                name: name.as_str().to_string(),
            };
            return Err(self.error(kind));
        };
        let method = method.try_as_closure().expect("methods are closures");

        self.maybe_gc();
        let receiver = self.peek(0);
        let bound = self.heap.gc.new_value(ObjBoundMethod::new(receiver, method));
        self.pop();
        self.push(bound)?;
        Ok(())
    }

    /// Returns the open upvalue aliasing `slot`, inserting a fresh one in
    /// descending-slot order if none exists. No two open upvalues ever alias
    /// the same slot.
    fn capture_upvalue(&mut self, slot: usize) -> GcObj<RefCell<ObjUpvalue>> {
        let mut insert_at = self.open_upvalues.len();
        for (i, existing) in self.open_upvalues.iter().enumerate() {
            let existing_slot = match &*existing.borrow() {
                ObjUpvalue::Open(slot) => *slot,
                ObjUpvalue::Closed(_) => unreachable!("open list holds only open upvalues"),
            };
            if existing_slot == slot {
                return *existing;
            }
            if existing_slot < slot {
                insert_at = i;
                break;
            }
        }

        self.maybe_gc();
        let upvalue = self
            .heap
            .gc
            .new_object_inner(RefCell::new(ObjUpvalue::Open(slot)));
        self.open_upvalues.insert(insert_at, upvalue);
        upvalue
    }

    /// Closes every open upvalue at or above `last`: the live value moves
    /// into the upvalue itself, which leaves the open list.
    fn close_upvalues(&mut self, last: usize) {
        while let Some(first) = self.open_upvalues.first() {
            let slot = match &*first.borrow() {
                ObjUpvalue::Open(slot) => *slot,
                ObjUpvalue::Closed(_) => unreachable!("open list holds only open upvalues"),
            };
            if slot < last {
                break;
            }

            let value = self.stack[slot];
            *first.borrow_mut() = ObjUpvalue::Closed(value);
            self.open_upvalues.remove(0);
        }
    }

    fn run_binary_add(&mut self) -> Result<(), RuntimeError> {
        let rhs = self.peek(0);
        let lhs = self.peek(1);

        if let (Some(lhs), Some(rhs)) = (lhs.try_as_number(), rhs.try_as_number()) {
            self.stack.pop_n(2);
            return self.push(Value::new_number(lhs + rhs));
        }

        if let (Some(lhs), Some(rhs)) = (lhs.try_as_string(), rhs.try_as_string()) {
            // operands stay on the stack during the allocation
            self.maybe_gc();
            let mut result = String::with_capacity(lhs.len() + rhs.len());
            result.push_str(&lhs);
            result.push_str(&rhs);
            let result = Value::new_string(self.heap.intern(result));
            self.stack.pop_n(2);
            return self.push(result);
        }

        let kind = RuntimeErrorKind::InvalidOperands {
            expected: "two numbers or two strings",
        };
        Err(self.error(kind))
    }

    #[inline]
    fn binary_arithmetic_op(&mut self, op: impl Fn(f64, f64) -> f64) -> Result<(), RuntimeError> {
        let rhs = self.peek(0);
        let lhs = self.peek(1);
        match (lhs.try_as_number(), rhs.try_as_number()) {
            (Some(lhs), Some(rhs)) => {
                self.stack.pop_n(2);
                self.push(Value::new_number(op(lhs, rhs)))
            }
            _ => {
                let kind = RuntimeErrorKind::InvalidOperands { expected: "numbers" };
                Err(self.error(kind))
            }
        }
    }

    #[inline]
    fn binary_cmp_op(&mut self, op: impl Fn(f64, f64) -> bool) -> Result<(), RuntimeError> {
        let rhs = self.peek(0);
        let lhs = self.peek(1);
        match (lhs.try_as_number(), rhs.try_as_number()) {
            (Some(lhs), Some(rhs)) => {
                self.stack.pop_n(2);
                self.push(Value::new_bool(op(lhs, rhs)))
            }
            _ => {
                let kind = RuntimeErrorKind::InvalidOperands { expected: "numbers" };
                Err(self.error(kind))
            }
        }
    }

    fn run_index_get(&mut self) -> Result<(), RuntimeError> {
        let index = self.peek(0);
        let target = self.peek(1);

        if let Some(list) = target.try_as_list() {
            let list = list.borrow();
            let idx = self.check_index(index, list.items.len())?;
            let value = list.items[idx];
            drop(list);
            self.stack.pop_n(2);
            return self.push(value);
        }

        if let Some(s) = target.try_as_string() {
            let len = s.chars().count();
            let idx = self.check_index(index, len)?;
            let c = s.chars().nth(idx).expect("index checked above");
            self.maybe_gc();
            let value = Value::new_string(self.heap.intern(String::from(c)));
            self.stack.pop_n(2);
            return self.push(value);
        }

        let kind = RuntimeErrorKind::NotIndexable {
            found: target.type_name(),
        };
        Err(self.error(kind))
    }

    fn run_index_set(&mut self) -> Result<(), RuntimeError> {
        let value = self.peek(0);
        let index = self.peek(1);
        let target = self.peek(2);

        if let Some(list) = target.try_as_list() {
            let len = list.borrow().items.len();
            let idx = self.check_index(index, len)?;
            list.borrow_mut().items[idx] = value;
            self.stack.pop_n(3);
            return self.push(value);
        }

        if target.is_string() {
            return Err(self.error(RuntimeErrorKind::StringIndexAssignment));
        }

        let kind = RuntimeErrorKind::NotIndexable {
            found: target.type_name(),
        };
        Err(self.error(kind))
    }

    fn check_index(&self, index: Value, len: usize) -> Result<usize, RuntimeError> {
        let Some(index) = index.try_as_number() else {
            let kind = RuntimeErrorKind::IndexNotNumber {
                found: index.type_name(),
            };
            return Err(self.error(kind));
        };

        if index.fract() != 0.0 || index < 0.0 || index >= len as f64 {
            return Err(self.error(RuntimeErrorKind::IndexOutOfBounds { index, len }));
        }

        Ok(index as usize)
    }

    fn join_children(&mut self, group: Vec<JoinHandle<()>>) {
        for handle in group {
            if handle.join().is_err() {
                tracing::warn!("async worker thread panicked");
            }
        }
    }

    #[inline]
    fn check_failure(&self) -> Result<(), RuntimeError> {
        if self.failure.load(Ordering::Relaxed) {
            return Err(self.error(RuntimeErrorKind::Terminated));
        }
        Ok(())
    }

    /// Collects if the allocation counter crossed the threshold (always,
    /// under `stress_gc`). Called right before the VM allocates, while every
    /// live object is reachable from a root.
    fn maybe_gc(&mut self) {
        if !self.heap.gc.should_collect() {
            return;
        }

        let gc = &mut self.heap.gc;
        for value in self.stack.iter() {
            gc.mark_value(value);
        }
        for frame in &self.frames {
            gc.mark_closure(frame.closure);
        }
        for upvalue in &self.open_upvalues {
            gc.mark_upvalue(*upvalue);
        }
        self.globals.mark(gc);
        gc.mark_string(self.init_string);

        gc.trace_references();
        // purged before the sweep so the intern table never dangles
        self.heap.strings.remove_unmarked();
        // SAFETY: every root was marked and traced above, and the intern
        // table no longer holds unmarked keys
        unsafe { self.heap.gc.sweep() };
    }

    fn error(&self, kind: RuntimeErrorKind) -> RuntimeError {
        let span = self
            .frames
            .last()
            .and_then(|frame| frame.closure.fun.chunk.span_at(self.op_start))
            .cloned()
            .map(Into::into);

        RuntimeError {
            src: self.src.to_string(),
            span,
            kind,
            trace: self.backtrace(),
        }
    }

    fn backtrace(&self) -> Option<String> {
        if self.frames.is_empty() {
            return None;
        }

        let mut out = String::new();
        for frame in self.frames.iter().rev() {
            let fun = frame.closure.fun;
            let line = fun
                .chunk
                .span_for_ip(frame.ip.saturating_sub(1))
                .map(|span| span.line)
                .unwrap_or(0);
            match fun.name {
                Some(name) => out.push_str(&format!("[line {}] in {}()\n", line, name)),
                None => out.push_str(&format!("[line {}] in script\n", line)),
            }
        }

        Some(out.trim_end().to_string())
    }

    /// Renders a runtime error to stderr; used by worker threads, which have
    /// no caller to hand the error to.
    pub(crate) fn report_runtime_error(&self, err: &RuntimeError) {
        eprintln!("{:?}", miette::Report::new(err.clone()));
    }

    #[cfg(feature = "debug_trace")]
    fn trace_instruction(&self) {
        use crate::bytecode::{ByteCursor, Instruction};

        let frame = self.frame();
        let closure = frame.closure;
        let chunk = &closure.fun.chunk;
        let mut cursor = ByteCursor::new(&chunk.code[self.op_start..]);
        if let Ok(instruction) = Instruction::from_bytes(&mut cursor, &chunk.constants) {
            let stack: Vec<String> = self.stack.iter().map(|v| format!("{}", v)).collect();
            eprintln!("[{:>4}] {:24} [{}]", self.op_start, instruction.to_string(), stack.join(", "));
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

    fn run(source: &str) -> Result<String, String> {
        let buffer: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
        let mut vm = Vm::with_output(SharedWriter::from_shared(buffer.clone()));
        let result = vm.interpret(source).map(|_| ()).map_err(|err| err.to_string());
        assert!(vm.stack.is_empty(), "the stack must be neutral after a run");

        result?;
        let out = buffer.lock().unwrap().clone();
        Ok(String::from_utf8(out).unwrap())
    }

    #[test]
    fn arithmetic() {
        assert_eq!(run("print 1 + 2 * 3;").unwrap(), "7\n");
        assert_eq!(run("print (1 + 2) * 3;").unwrap(), "9\n");
        assert_eq!(run("print 7 % 3;").unwrap(), "1\n");
        assert_eq!(run("print -2 + 1;").unwrap(), "-1\n");
    }

    #[test]
    fn string_concat_interns() {
        assert_eq!(
            run("var a = \"he\"; var b = \"llo\"; print a + b == \"hello\";").unwrap(),
            "true\n"
        );
    }

    #[test]
    fn globals_persist_across_interprets() {
        let mut vm = Vm::with_output(SharedWriter::new(Vec::new()));
        vm.interpret("var shared = 41;").unwrap();
        vm.interpret("shared = shared + 1;").unwrap();
        assert!(vm.interpret("print shared;").is_ok());
    }

    #[test]
    fn undefined_variable_is_a_runtime_error() {
        let err = run("print missing;").unwrap_err();
        assert!(err.contains("undefined variable"), "{err}");
    }

    #[test]
    fn assignment_cannot_create_globals() {
        let err = run("missing = 1;").unwrap_err();
        assert!(err.contains("undefined variable"), "{err}");
        // and the failed assignment must not have defined it
        let err = run("missing = 1; print missing;").unwrap_err();
        assert!(err.contains("undefined variable"), "{err}");
    }

    #[test]
    fn add_type_mismatch() {
        let err = run("print 1 + nil;").unwrap_err();
        assert!(err.contains("invalid operands"), "{err}");
        let err = run("print \"a\" + 1;").unwrap_err();
        assert!(err.contains("invalid operands"), "{err}");
    }

    #[test]
    fn deep_recursion_overflows_frames() {
        let err = run("fun f() { f(); } f();").unwrap_err();
        assert!(err.contains("stack overflow"), "{err}");
    }

    #[test]
    fn closures_capture_and_close() {
        let out = run(
            "var c = 0;\
             fun mk() { fun inc() { c = c + 1; return c; } return inc; }\
             var f = mk();\
             print f(); print f(); print f();",
        )
        .unwrap();
        assert_eq!(out, "1\n2\n3\n");
    }

    #[test]
    fn sibling_closures_share_a_captured_slot() {
        let out = run(
            "fun pair() {\
               var n = 0;\
               fun get() { return n; }\
               fun bump() { n = n + 1; }\
               bump(); bump();\
               print get();\
             }\
             pair();",
        )
        .unwrap();
        assert_eq!(out, "2\n");
    }

    #[test]
    fn classes_and_inheritance() {
        let out = run(
            "class C { init(x) { this.x = x; } g() { return this.x + 1; } }\
             print C(41).g();",
        )
        .unwrap();
        assert_eq!(out, "42\n");

        let out = run(
            "class A { greet() { print \"A\"; } }\
             class B < A { greet() { super.greet(); print \"B\"; } }\
             B().greet();",
        )
        .unwrap();
        assert_eq!(out, "A\nB\n");
    }

    #[test]
    fn fields_shadow_methods_in_invoke() {
        let out = run(
            "fun shadow() { return \"field\"; }\
             class C { m() { return \"method\"; } }\
             var c = C();\
             print c.m();\
             c.m = shadow;\
             print c.m();",
        )
        .unwrap();
        assert_eq!(out, "method\nfield\n");
    }

    #[test]
    fn lists_index_and_mutate() {
        let out = run(
            "var xs = [10, 20, 30];\
             print xs[1];\
             xs[1] = 99;\
             print xs[1];\
             print len(xs);",
        )
        .unwrap();
        assert_eq!(out, "20\n99\n3\n");
    }

    #[test]
    fn list_bounds_are_checked() {
        let err = run("var xs = [1]; print xs[1];").unwrap_err();
        assert!(err.contains("out of bounds"), "{err}");
        let err = run("var xs = [1]; print xs[-1];").unwrap_err();
        assert!(err.contains("out of bounds"), "{err}");
        let err = run("var xs = [1]; print xs[0.5];").unwrap_err();
        assert!(err.contains("out of bounds"), "{err}");
    }

    #[test]
    fn string_indexing_reads_but_never_writes() {
        assert_eq!(run("print \"abc\"[1];").unwrap(), "b\n");
        let err = run("\"abc\"[1] = \"x\";").unwrap_err();
        assert!(err.contains("immutable"), "{err}");
    }

    #[test]
    fn calling_a_number_fails() {
        let err = run("var x = 3; x();").unwrap_err();
        assert!(err.contains("can only call functions and classes"), "{err}");
    }

    #[test]
    fn wrong_arity_fails() {
        let err = run("fun f(a, b) {} f(1);").unwrap_err();
        assert!(err.contains("wrong number of arguments"), "{err}");
    }

    #[test]
    fn properties_require_instances() {
        let err = run("var x = 1; print x.y;").unwrap_err();
        assert!(err.contains("only instances have properties"), "{err}");
    }

    #[test]
    fn class_without_init_rejects_arguments() {
        let err = run("class C {} C(1);").unwrap_err();
        assert!(err.contains("wrong number of arguments"), "{err}");
    }

    #[test]
    fn while_and_for_loops() {
        assert_eq!(
            run("var i = 0; while (i < 3) { print i; i = i + 1; }").unwrap(),
            "0\n1\n2\n"
        );
        assert_eq!(
            run("for (var i = 0; i < 3; i = i + 1) print i;").unwrap(),
            "0\n1\n2\n"
        );
    }

    #[test]
    fn fib_recursion() {
        let out = run(
            "fun fib(n) { if (n < 2) return n; return fib(n - 1) + fib(n - 2); }\
             print fib(10);",
        )
        .unwrap();
        assert_eq!(out, "55\n");
    }

    #[test]
    fn logic_operators_short_circuit() {
        assert_eq!(run("print nil or 2;").unwrap(), "2\n");
        assert_eq!(run("print 1 and 2;").unwrap(), "2\n");
        assert_eq!(run("print nil and 2;").unwrap(), "nil\n");
        assert_eq!(run("print false or false;").unwrap(), "false\n");
        assert_eq!(run("print !nil;").unwrap(), "true\n");
    }

    #[test]
    fn async_blocks_join_at_finish_end() {
        let out = run("finish { async { print \"a\"; } async { print \"b\"; } } print \"c\";")
            .unwrap();
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 3);
        // the async bodies run in either order, but always before "c"
        assert!(lines[..2].contains(&"a"));
        assert!(lines[..2].contains(&"b"));
        assert_eq!(lines[2], "c");
    }

    #[test]
    fn async_sees_a_snapshot_of_locals() {
        // the child copies the stack at spawn time, so the parent's later
        // write is invisible to it
        let out = run(
            "{\
               var x = 1;\
               finish { async { print x; } x = 2; }\
               print x;\
             }",
        )
        .unwrap();
        assert_eq!(out, "1\n2\n");
    }

    #[test]
    fn nested_finish_blocks() {
        let out = run(
            "finish {\
               async { finish { async { print \"inner\"; } } print \"outer\"; }\
             }\
             print \"done\";",
        )
        .unwrap();
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.last(), Some(&"done"));
        assert!(lines.contains(&"inner"));
        assert!(lines.contains(&"outer"));
        // the child's own finish joins before its trailing print
        assert!(
            lines.iter().position(|l| *l == "inner").unwrap()
                < lines.iter().position(|l| *l == "outer").unwrap()
        );
    }

    #[test]
    fn child_failure_cancels_the_parent() {
        let err = run(
            "finish {\
               async { var x = 1 + nil; }\
               var i = 0;\
               while (i < 10000000) { i = i + 1; }\
             }",
        )
        .unwrap_err();
        assert!(err.contains("terminated") || err.contains("invalid operands"), "{err}");
    }

    #[test]
    fn native_clock_and_rand() {
        assert_eq!(run("print clock() >= 0;").unwrap(), "true\n");
        assert_eq!(run("print rand() >= 0;").unwrap(), "true\n");
    }

    #[test]
    fn native_arity_errors_are_runtime_errors() {
        let err = run("clock(1);").unwrap_err();
        assert!(err.contains("argument"), "{err}");
    }
}

use core::fmt;
use std::borrow::Cow;
use std::cell::{Cell, RefCell};
use std::marker::PhantomData;
use std::ops::Deref;
use std::{mem, ptr};

use hashbrown::HashMap;

use crate::bytecode::Chunk;
use crate::table::Table;
use crate::vm::natives::NativeCtx;

/// Runtime value, NaN-boxed into a single 64-bit word.
#[repr(C)]
pub union Value {
    raw: usize,
    number: f64,
    obj: Object,
}

impl Value {
    // Everything that is not a plain f64 lives inside a quiet NaN. The sign
    // bit and the three lowest bits together select the variant; for heap
    // variants the remaining bits hold the pointer, which fits because
    // pointers are 48 bits in practice and allocations are 8-byte aligned so
    // the low tag bits are zero.
    //
    // # General safety comments:
    //
    // Number, bool and nil are stored inline; every other variant is a
    // pointer to a GcBox allocation. A Value is only created through one of
    // the new_.. constructors, which take a valid object. The underlying
    // allocation stays valid for as long as the garbage collector keeps the
    // object reachable; the sweep's safety contract forwards that requirement
    // to its caller.
    //
    // Reading any union field is always in-bounds (same size, same
    // alignment, no invalid bit patterns); interpreting the payload of a
    // specific variant must be preceded by a tag check.

    const QNAN: usize = 0x7ffc_0000_0000_0000;
    const SIGN_BIT: usize = 0x8000_0000_0000_0000;

    pub const TAG_NIL: usize = 0b001 | Self::QNAN;
    pub const TAG_FALSE: usize = 0b010 | Self::QNAN;
    pub const TAG_TRUE: usize = 0b011 | Self::QNAN;
    pub const TAG_STRING: usize = 0b100 | Self::QNAN;
    pub const TAG_FUNCTION: usize = 0b101 | Self::QNAN;
    pub const TAG_NATIVE_FN: usize = 0b110 | Self::QNAN;
    pub const TAG_CLOSURE: usize = 0b111 | Self::QNAN;
    pub const TAG_FUTURE: usize = 0b001 | Self::QNAN | Self::SIGN_BIT;
    pub const TAG_UPVALUE: usize = 0b010 | Self::QNAN | Self::SIGN_BIT;
    pub const TAG_CLASS: usize = 0b011 | Self::QNAN | Self::SIGN_BIT;
    pub const TAG_INSTANCE: usize = 0b100 | Self::QNAN | Self::SIGN_BIT;
    pub const TAG_LIST: usize = 0b101 | Self::QNAN | Self::SIGN_BIT;
    pub const TAG_BOUND_METHOD: usize = 0b110 | Self::QNAN | Self::SIGN_BIT;
    pub const TAG_BITS: usize = 0b111 | Self::QNAN | Self::SIGN_BIT;

    const NIL_VALUE: usize = Self::TAG_NIL;
    const FALSE_VALUE: usize = Self::TAG_FALSE;
    const TRUE_VALUE: usize = Self::TAG_TRUE;

    pub const TRUE: Self = Self {
        raw: Self::TRUE_VALUE,
    };
    pub const FALSE: Self = Self {
        raw: Self::FALSE_VALUE,
    };
    pub const NIL: Self = Self {
        raw: Self::NIL_VALUE,
    };

    pub fn new_number(n: f64) -> Self {
        Self { number: n }
    }

    pub fn new_bool(b: bool) -> Self {
        if b {
            Self::TRUE
        } else {
            Self::FALSE
        }
    }

    pub fn new_object(obj: Object) -> Self {
        Self { obj }
    }

    pub fn new_string(obj: InternedString) -> Self {
        Self {
            obj: Object::new_string(obj),
        }
    }

    #[inline]
    fn as_raw(&self) -> usize {
        // SAFETY: this is always safe
        unsafe { self.raw }
    }

    #[inline]
    pub fn is_number(&self) -> bool {
        (self.as_raw() & Self::QNAN) != Self::QNAN
    }

    #[inline]
    pub fn is_nil(&self) -> bool {
        self.as_raw() == Self::NIL_VALUE
    }

    #[inline]
    pub fn is_bool(&self) -> bool {
        (self.as_raw() | 1) == Self::TRUE_VALUE
    }

    #[inline]
    pub fn try_as_number(&self) -> Option<f64> {
        if !self.is_number() {
            return None;
        }

        Some(unsafe { self.number })
    }

    #[inline]
    pub fn is_object(&self) -> bool {
        !self.is_number() && !self.is_bool() && !self.is_nil()
    }

    #[inline]
    pub fn try_as_object(&self) -> Option<Object> {
        if !self.is_object() {
            return None;
        }

        Some(unsafe { self.obj })
    }

    /// # Safety
    ///
    /// `self` must hold a heap object.
    #[inline]
    pub(crate) unsafe fn as_object_unchecked(&self) -> Object {
        unsafe { self.obj }
    }

    #[inline]
    pub fn is_string(&self) -> bool {
        self.is_object_of_kind(Self::TAG_STRING)
    }

    #[inline]
    pub fn try_as_string(self) -> Option<InternedString> {
        if !self.is_string() {
            return None;
        }

        Some(unsafe { self.obj.as_string_unchecked() })
    }

    #[inline]
    pub fn is_function(&self) -> bool {
        self.is_object_of_kind(Self::TAG_FUNCTION)
    }

    #[inline]
    pub fn try_as_function(&self) -> Option<GcObj<ObjFunction>> {
        if !self.is_function() {
            return None;
        }

        Some(unsafe { self.obj.as_function_unchecked() })
    }

    #[inline]
    pub fn is_native_fn(&self) -> bool {
        self.is_object_of_kind(Self::TAG_NATIVE_FN)
    }

    #[inline]
    pub fn try_as_native_fn(self) -> Option<GcObj<ObjNative>> {
        if !self.is_native_fn() {
            return None;
        }

        Some(unsafe { self.obj.as_native_fn_unchecked() })
    }

    #[inline]
    pub fn is_closure(&self) -> bool {
        self.is_object_of_kind(Self::TAG_CLOSURE)
    }

    #[inline]
    pub fn try_as_closure(self) -> Option<GcObj<ObjClosure>> {
        if !self.is_closure() {
            return None;
        }

        Some(unsafe { self.obj.as_closure_unchecked() })
    }

    #[inline]
    pub fn is_class(&self) -> bool {
        self.is_object_of_kind(Self::TAG_CLASS)
    }

    #[inline]
    pub fn try_as_class(self) -> Option<GcObj<RefCell<ObjClass>>> {
        if !self.is_class() {
            return None;
        }

        Some(unsafe { self.obj.as_class_unchecked() })
    }

    #[inline]
    pub fn is_instance(&self) -> bool {
        self.is_object_of_kind(Self::TAG_INSTANCE)
    }

    #[inline]
    pub fn try_as_instance(&self) -> Option<GcObj<RefCell<ObjInstance>>> {
        if !self.is_instance() {
            return None;
        }

        Some(unsafe { self.obj.as_instance_unchecked() })
    }

    #[inline]
    pub fn is_bound_method(&self) -> bool {
        self.is_object_of_kind(Self::TAG_BOUND_METHOD)
    }

    #[inline]
    pub fn try_as_bound_method(self) -> Option<GcObj<ObjBoundMethod>> {
        if !self.is_bound_method() {
            return None;
        }

        Some(unsafe { self.obj.as_bound_method_unchecked() })
    }

    #[inline]
    pub fn is_list(&self) -> bool {
        self.is_object_of_kind(Self::TAG_LIST)
    }

    #[inline]
    pub fn try_as_list(&self) -> Option<GcObj<RefCell<ObjList>>> {
        if !self.is_list() {
            return None;
        }

        Some(unsafe { self.obj.as_list_unchecked() })
    }

    #[inline]
    pub fn is_future(&self) -> bool {
        self.is_object_of_kind(Self::TAG_FUTURE)
    }

    #[inline]
    pub fn try_as_future(&self) -> Option<GcObj<ObjFuture>> {
        if !self.is_future() {
            return None;
        }

        Some(unsafe { self.obj.as_future_unchecked() })
    }

    #[inline]
    fn is_object_of_kind(&self, tag: usize) -> bool {
        self.as_raw() & Self::TAG_BITS == tag
    }

    #[inline]
    pub fn get_tag(&self) -> usize {
        self.as_raw() & Self::TAG_BITS
    }

    /// `nil` and `false` are falsey, everything else is truthy.
    #[inline]
    pub fn is_falsey(&self) -> bool {
        self.as_raw() == Self::NIL_VALUE || self.as_raw() == Self::FALSE_VALUE
    }

    /// Human-readable name of the variant, for error messages.
    pub fn type_name(&self) -> &'static str {
        if self.is_number() {
            return "number";
        }

        match self.get_tag() {
            Self::TAG_NIL => "nil",
            Self::TAG_FALSE | Self::TAG_TRUE => "bool",
            Self::TAG_STRING => "string",
            Self::TAG_FUNCTION | Self::TAG_CLOSURE => "function",
            Self::TAG_NATIVE_FN => "native function",
            Self::TAG_UPVALUE => "upvalue",
            Self::TAG_CLASS => "class",
            Self::TAG_INSTANCE => "instance",
            Self::TAG_BOUND_METHOD => "method",
            Self::TAG_LIST => "list",
            Self::TAG_FUTURE => "future",
            _ => unreachable!(),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        // check numbers specifically so that we get NaN != NaN
        if let (Some(s), Some(o)) = (self.try_as_number(), other.try_as_number()) {
            return s == o;
        }

        // objects compare by identity; string interning makes this the same
        // as content equality for strings
        self.as_raw() == other.as_raw()
    }
}

impl Clone for Value {
    fn clone(&self) -> Self {
        *self
    }
}

impl Copy for Value {}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_number() {
            return write!(f, "{}", self.try_as_number().unwrap());
        }

        match self.get_tag() {
            Self::TAG_FALSE => write!(f, "false"),
            Self::TAG_TRUE => write!(f, "true"),
            Self::TAG_NIL => write!(f, "nil"),
            _ => write!(f, "{}", unsafe { self.obj }),
        }
    }
}

/// A tagged pointer to one of the heap object variants.
#[repr(C)]
pub union Object {
    raw: usize,
    // Access to the mark flag and intrusive next pointer without knowing the
    // payload type. The internal GcBox must be repr(C) for this to work.
    common_obj: gc::TaggedGcObjCommon,
    string: TaggedGcObj<ObjString, { Value::TAG_STRING }>,
    function: TaggedGcObj<ObjFunction, { Value::TAG_FUNCTION }>,
    native_fn: TaggedGcObj<ObjNative, { Value::TAG_NATIVE_FN }>,
    closure: TaggedGcObj<ObjClosure, { Value::TAG_CLOSURE }>,
    upvalue: TaggedGcObj<RefCell<ObjUpvalue>, { Value::TAG_UPVALUE }>,
    class: TaggedGcObj<RefCell<ObjClass>, { Value::TAG_CLASS }>,
    instance: TaggedGcObj<RefCell<ObjInstance>, { Value::TAG_INSTANCE }>,
    list: TaggedGcObj<RefCell<ObjList>, { Value::TAG_LIST }>,
    bound_method: TaggedGcObj<ObjBoundMethod, { Value::TAG_BOUND_METHOD }>,
    future: TaggedGcObj<ObjFuture, { Value::TAG_FUTURE }>,
}

impl Copy for Object {}

impl Clone for Object {
    fn clone(&self) -> Self {
        *self
    }
}

impl Object {
    pub fn new_string(obj: InternedString) -> Self {
        Self {
            string: TaggedGcObj::new(obj.0),
        }
    }

    #[inline]
    fn as_raw(&self) -> usize {
        // SAFETY: this is always safe
        unsafe { self.raw }
    }

    #[inline]
    pub fn get_tag(&self) -> usize {
        self.as_raw() & Value::TAG_BITS
    }

    /// # Safety
    ///
    /// Underlying type of self must be `ObjString`.
    #[inline]
    pub(crate) unsafe fn as_string_unchecked(self) -> InternedString {
        InternedString(unsafe { self.string.untag() })
    }

    /// # Safety
    ///
    /// Underlying type of self must be `ObjFunction`.
    #[inline]
    pub(crate) unsafe fn as_function_unchecked(self) -> GcObj<ObjFunction> {
        unsafe { self.function.untag() }
    }

    /// # Safety
    ///
    /// Underlying type of self must be `ObjNative`.
    #[inline]
    pub(crate) unsafe fn as_native_fn_unchecked(self) -> GcObj<ObjNative> {
        unsafe { self.native_fn.untag() }
    }

    /// # Safety
    ///
    /// Underlying type of self must be `ObjClosure`.
    #[inline]
    pub(crate) unsafe fn as_closure_unchecked(self) -> GcObj<ObjClosure> {
        unsafe { self.closure.untag() }
    }

    /// # Safety
    ///
    /// Underlying type of self must be `RefCell<ObjUpvalue>`.
    #[inline]
    pub(crate) unsafe fn as_upvalue_unchecked(self) -> GcObj<RefCell<ObjUpvalue>> {
        unsafe { self.upvalue.untag() }
    }

    /// # Safety
    ///
    /// Underlying type of self must be `RefCell<ObjClass>`.
    #[inline]
    pub(crate) unsafe fn as_class_unchecked(self) -> GcObj<RefCell<ObjClass>> {
        unsafe { self.class.untag() }
    }

    /// # Safety
    ///
    /// Underlying type of self must be `RefCell<ObjInstance>`.
    #[inline]
    pub(crate) unsafe fn as_instance_unchecked(self) -> GcObj<RefCell<ObjInstance>> {
        unsafe { self.instance.untag() }
    }

    /// # Safety
    ///
    /// Underlying type of self must be `RefCell<ObjList>`.
    #[inline]
    pub(crate) unsafe fn as_list_unchecked(self) -> GcObj<RefCell<ObjList>> {
        unsafe { self.list.untag() }
    }

    /// # Safety
    ///
    /// Underlying type of self must be `ObjBoundMethod`.
    #[inline]
    pub(crate) unsafe fn as_bound_method_unchecked(self) -> GcObj<ObjBoundMethod> {
        unsafe { self.bound_method.untag() }
    }

    /// # Safety
    ///
    /// Underlying type of self must be `ObjFuture`.
    #[inline]
    pub(crate) unsafe fn as_future_unchecked(self) -> GcObj<ObjFuture> {
        unsafe { self.future.untag() }
    }

    pub(crate) fn alloc_addr(&self) -> usize {
        unsafe {
            match self.get_tag() {
                Value::TAG_STRING => self.as_string_unchecked().0.alloc_addr(),
                Value::TAG_FUNCTION => self.as_function_unchecked().alloc_addr(),
                Value::TAG_NATIVE_FN => self.as_native_fn_unchecked().alloc_addr(),
                Value::TAG_CLOSURE => self.as_closure_unchecked().alloc_addr(),
                Value::TAG_UPVALUE => self.as_upvalue_unchecked().alloc_addr(),
                Value::TAG_CLASS => self.as_class_unchecked().alloc_addr(),
                Value::TAG_INSTANCE => self.as_instance_unchecked().alloc_addr(),
                Value::TAG_LIST => self.as_list_unchecked().alloc_addr(),
                Value::TAG_BOUND_METHOD => self.as_bound_method_unchecked().alloc_addr(),
                Value::TAG_FUTURE => self.as_future_unchecked().alloc_addr(),
                _ => unreachable!(),
            }
        }
    }
}

impl fmt::Debug for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:#x}] {}", self.alloc_addr(), self)
    }
}

impl fmt::Pointer for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.alloc_addr())
    }
}

impl fmt::Display for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        unsafe {
            match self.get_tag() {
                Value::TAG_STRING => write!(f, "{}", self.as_string_unchecked()),
                Value::TAG_FUNCTION => write!(f, "{}", *self.as_function_unchecked()),
                Value::TAG_NATIVE_FN => write!(f, "<native fun>"),
                Value::TAG_CLOSURE => write!(f, "{}", *self.as_closure_unchecked()),
                Value::TAG_UPVALUE => {
                    let obj = self.as_upvalue_unchecked();
                    let obj = RefCell::borrow(&obj);
                    write!(f, "{}", obj)
                }
                Value::TAG_CLASS => {
                    let obj = self.as_class_unchecked();
                    let obj = RefCell::borrow(&obj);
                    write!(f, "{}", obj)
                }
                Value::TAG_INSTANCE => {
                    let obj = self.as_instance_unchecked();
                    let obj = RefCell::borrow(&obj);
                    write!(f, "{}", obj)
                }
                Value::TAG_LIST => {
                    let obj = self.as_list_unchecked();
                    let obj = RefCell::borrow(&obj);
                    write!(f, "{}", obj)
                }
                Value::TAG_BOUND_METHOD => write!(f, "{}", *self.as_bound_method_unchecked()),
                Value::TAG_FUTURE => write!(f, "{}", *self.as_future_unchecked()),
                _ => unreachable!(),
            }
        }
    }
}

impl PartialEq for Object {
    fn eq(&self, other: &Self) -> bool {
        self.as_raw() == other.as_raw()
    }
}

impl From<GcObj<ObjString>> for Object {
    fn from(s: GcObj<ObjString>) -> Self {
        Object::new_string(InternedString(s))
    }
}

impl From<GcObj<ObjFunction>> for Object {
    fn from(fun: GcObj<ObjFunction>) -> Self {
        Self {
            function: TaggedGcObj::new(fun),
        }
    }
}

impl From<GcObj<ObjNative>> for Object {
    fn from(fun: GcObj<ObjNative>) -> Self {
        Self {
            native_fn: TaggedGcObj::new(fun),
        }
    }
}

impl From<GcObj<ObjClosure>> for Object {
    fn from(closure: GcObj<ObjClosure>) -> Self {
        Self {
            closure: TaggedGcObj::new(closure),
        }
    }
}

impl From<GcObj<RefCell<ObjUpvalue>>> for Object {
    fn from(upvalue: GcObj<RefCell<ObjUpvalue>>) -> Self {
        Self {
            upvalue: TaggedGcObj::new(upvalue),
        }
    }
}

impl From<GcObj<RefCell<ObjClass>>> for Object {
    fn from(class: GcObj<RefCell<ObjClass>>) -> Self {
        Self {
            class: TaggedGcObj::new(class),
        }
    }
}

impl From<GcObj<RefCell<ObjInstance>>> for Object {
    fn from(instance: GcObj<RefCell<ObjInstance>>) -> Self {
        Self {
            instance: TaggedGcObj::new(instance),
        }
    }
}

impl From<GcObj<RefCell<ObjList>>> for Object {
    fn from(list: GcObj<RefCell<ObjList>>) -> Self {
        Self {
            list: TaggedGcObj::new(list),
        }
    }
}

impl From<GcObj<ObjBoundMethod>> for Object {
    fn from(bm: GcObj<ObjBoundMethod>) -> Self {
        Self {
            bound_method: TaggedGcObj::new(bm),
        }
    }
}

impl From<GcObj<ObjFuture>> for Object {
    fn from(future: GcObj<ObjFuture>) -> Self {
        Self {
            future: TaggedGcObj::new(future),
        }
    }
}

/// FNV-1a over the raw bytes. This is the primary hash stored on every
/// string object and the one the table probes with.
pub(crate) fn hash_str(s: &str) -> u32 {
    let mut hash: u32 = 2166136261;
    for byte in s.bytes() {
        hash ^= byte as u32;
        hash = hash.wrapping_mul(16777619);
    }
    hash
}

/// Heap-allocated string with its hash precomputed at creation.
#[derive(Debug)]
pub struct ObjString {
    hash: u32,
    value: String,
}

impl ObjString {
    fn new(value: String) -> Self {
        let hash = hash_str(&value);
        Self { hash, value }
    }
}

impl fmt::Display for ObjString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.value)
    }
}

/// Handle to an interned [`ObjString`]. Because creation always goes through
/// the intern table, pointer equality is content equality.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct InternedString(GcObj<ObjString>);

impl InternedString {
    pub fn hash(&self) -> u32 {
        self.0.hash
    }

    pub fn as_str(&self) -> &str {
        &self.0.value
    }

    pub(crate) fn is_marked(&self) -> bool {
        Object::new_string(*self).is_marked()
    }
}

impl Deref for InternedString {
    type Target = str;
    fn deref(&self) -> &Self::Target {
        &self.0.value
    }
}

impl AsRef<str> for InternedString {
    fn as_ref(&self) -> &str {
        &self.0.value
    }
}

impl fmt::Debug for InternedString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:p}] {:?}", self.0, self.0.value)
    }
}

impl fmt::Display for InternedString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.value)
    }
}

#[derive(Debug)]
pub struct ObjFunction {
    pub arity: usize,
    pub upvalue_count: usize,
    pub chunk: Chunk,
    /// `None` for the top-level script.
    pub name: Option<InternedString>,
}

impl fmt::Display for ObjFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name {
            Some(name) => write!(f, "<fun {}>", name),
            None => write!(f, "<script>"),
        }
    }
}

/// Host callable. Arity and argument types are checked by the callable
/// itself; a returned error becomes a runtime error, never a host panic.
pub type NativeFn = fn(&mut NativeCtx<'_>, &[Value]) -> Result<Value, Cow<'static, str>>;

#[derive(Debug)]
pub struct ObjNative {
    pub function: NativeFn,
}

#[derive(Debug)]
pub struct ObjClosure {
    pub fun: GcObj<ObjFunction>,
    /// Filled in right after allocation, while the closure already sits on
    /// the VM stack; that ordering keeps the upvalues reachable while they
    /// are captured one by one.
    pub upvalues: RefCell<Vec<GcObj<RefCell<ObjUpvalue>>>>,
}

impl ObjClosure {
    pub fn new(fun: GcObj<ObjFunction>) -> Self {
        Self {
            fun,
            upvalues: RefCell::new(Vec::new()),
        }
    }
}

impl fmt::Display for ObjClosure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", *self.fun)
    }
}

/// A captured variable: open while its slot is still live on the stack,
/// closed (owning the value) afterwards.
#[derive(Debug, Clone, PartialEq)]
pub enum ObjUpvalue {
    Open(usize),
    Closed(Value),
}

impl fmt::Display for ObjUpvalue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObjUpvalue::Open(slot) => write!(f, "<upvalue (open) {}>", slot),
            ObjUpvalue::Closed(v) => write!(f, "<upvalue (closed) {}>", v),
        }
    }
}

#[derive(Debug)]
pub struct ObjClass {
    pub name: InternedString,
    pub methods: Table,
}

impl ObjClass {
    pub fn new(name: InternedString) -> Self {
        Self {
            name,
            methods: Table::new(),
        }
    }
}

impl fmt::Display for ObjClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<class {}>", self.name)
    }
}

#[derive(Debug)]
pub struct ObjInstance {
    pub class: GcObj<RefCell<ObjClass>>,
    pub fields: Table,
}

impl ObjInstance {
    pub fn new(class: GcObj<RefCell<ObjClass>>) -> Self {
        Self {
            class,
            fields: Table::new(),
        }
    }
}

impl fmt::Display for ObjInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<instance {}>", RefCell::borrow(&self.class).name)
    }
}

#[derive(Debug)]
pub struct ObjBoundMethod {
    pub receiver: Value,
    pub method: GcObj<ObjClosure>,
}

impl ObjBoundMethod {
    pub fn new(receiver: Value, method: GcObj<ObjClosure>) -> Self {
        Self { receiver, method }
    }
}

impl fmt::Display for ObjBoundMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", *self.method)
    }
}

#[derive(Debug, Default)]
pub struct ObjList {
    pub items: Vec<Value>,
}

impl fmt::Display for ObjList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, item) in self.items.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", item)?;
        }
        write!(f, "]")
    }
}

/// Handle to a computation running on a sibling VM; holds the pool slot of
/// the VM computing the result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjFuture {
    pub vm_id: usize,
}

impl fmt::Display for ObjFuture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<future {}>", self.vm_id)
    }
}

/// Per-VM heap: the garbage collector plus the intern table. Sibling VMs
/// never share one.
#[derive(Debug)]
pub struct Heap {
    pub gc: Gc,
    pub strings: Table,
}

impl Heap {
    pub fn new() -> Self {
        Self {
            gc: Gc::new(),
            strings: Table::new(),
        }
    }

    /// Returns the canonical string object for `s`, allocating one only if
    /// no string of equal content has been interned before.
    pub fn intern(&mut self, s: impl Into<String> + AsRef<str>) -> InternedString {
        let hash = hash_str(s.as_ref());
        match self.strings.find_string(s.as_ref(), hash) {
            Some(existing) => existing,
            None => {
                let obj = self.gc.new_object_inner(ObjString::new(s.into()));
                let new = InternedString(obj);
                self.strings.set(new, Value::NIL);
                new
            }
        }
    }

    /// Deep-copies `value` into this heap. `memo` maps source allocation
    /// addresses to already-adopted objects so aliasing and cycles carry
    /// over; one memo must be used for an entire snapshot.
    pub fn adopt_value(&mut self, value: Value, memo: &mut HashMap<usize, Object>) -> Value {
        match value.try_as_object() {
            Some(obj) => Value::new_object(self.adopt_object(obj, memo)),
            None => value,
        }
    }

    pub fn adopt_object(&mut self, obj: Object, memo: &mut HashMap<usize, Object>) -> Object {
        if let Some(copied) = memo.get(&obj.alloc_addr()) {
            return *copied;
        }

        let copied = unsafe {
            match obj.get_tag() {
                Value::TAG_STRING => {
                    let s = obj.as_string_unchecked();
                    Object::new_string(self.intern(s.as_str()))
                }
                Value::TAG_FUNCTION => {
                    let fun = obj.as_function_unchecked();
                    Object::from(self.adopt_function(fun, memo))
                }
                Value::TAG_NATIVE_FN => {
                    let native = obj.as_native_fn_unchecked();
                    self.gc.new_object(ObjNative {
                        function: native.function,
                    })
                }
                Value::TAG_CLOSURE => {
                    let closure = obj.as_closure_unchecked();
                    let fun = self.adopt_function(closure.fun, memo);
                    let copy = self.gc.new_object_inner(ObjClosure::new(fun));
                    // memoized before the upvalues are filled in, so a
                    // closure reachable from its own upvalues resolves to
                    // the copy instead of recursing forever
                    memo.insert(obj.alloc_addr(), Object::from(copy));
                    let upvalues: Vec<_> = closure
                        .upvalues
                        .borrow()
                        .iter()
                        .map(|upvalue| self.adopt_upvalue(*upvalue, memo))
                        .collect();
                    *copy.upvalues.borrow_mut() = upvalues;
                    return Object::from(copy);
                }
                Value::TAG_UPVALUE => {
                    return Object::from(self.adopt_upvalue(obj.as_upvalue_unchecked(), memo))
                }
                Value::TAG_CLASS => {
                    let class = obj.as_class_unchecked();
                    let name = self.intern(class.borrow().name.as_str());
                    let copy = self.gc.new_object_inner(RefCell::new(ObjClass::new(name)));
                    memo.insert(obj.alloc_addr(), Object::from(copy));
                    let methods: Vec<_> = class.borrow().methods.iter().collect();
                    for (key, value) in methods {
                        let key = self.intern(key.as_str());
                        let value = self.adopt_value(value, memo);
                        copy.borrow_mut().methods.set(key, value);
                    }
                    return Object::from(copy);
                }
                Value::TAG_INSTANCE => {
                    let instance = obj.as_instance_unchecked();
                    let class_obj =
                        self.adopt_object(Object::from(instance.borrow().class), memo);
                    // adopting the class may have reached this instance
                    // through a captured upvalue and copied it already
                    if let Some(copied) = memo.get(&obj.alloc_addr()) {
                        return *copied;
                    }
                    let class = class_obj.as_class_unchecked();
                    let copy = self
                        .gc
                        .new_object_inner(RefCell::new(ObjInstance::new(class)));
                    memo.insert(obj.alloc_addr(), Object::from(copy));
                    let fields: Vec<_> = instance.borrow().fields.iter().collect();
                    for (key, value) in fields {
                        let key = self.intern(key.as_str());
                        let value = self.adopt_value(value, memo);
                        copy.borrow_mut().fields.set(key, value);
                    }
                    return Object::from(copy);
                }
                Value::TAG_LIST => {
                    let list = obj.as_list_unchecked();
                    let copy = self.gc.new_object_inner(RefCell::new(ObjList::default()));
                    memo.insert(obj.alloc_addr(), Object::from(copy));
                    let items: Vec<_> = list.borrow().items.clone();
                    for item in items {
                        let item = self.adopt_value(item, memo);
                        copy.borrow_mut().items.push(item);
                    }
                    return Object::from(copy);
                }
                Value::TAG_BOUND_METHOD => {
                    let bm = obj.as_bound_method_unchecked();
                    let receiver = self.adopt_value(bm.receiver, memo);
                    let method_obj = self.adopt_object(Object::from(bm.method), memo);
                    let method = method_obj.as_closure_unchecked();
                    self.gc.new_object(ObjBoundMethod::new(receiver, method))
                }
                Value::TAG_FUTURE => {
                    let future = obj.as_future_unchecked();
                    self.gc.new_object(*future)
                }
                _ => unreachable!(),
            }
        };

        // a recursive adoption (e.g. through a bound method's receiver) may
        // have copied this object in the meantime; the first copy wins so
        // aliasing stays intact
        *memo.entry(obj.alloc_addr()).or_insert(copied)
    }

    pub fn adopt_closure(
        &mut self,
        closure: GcObj<ObjClosure>,
        memo: &mut HashMap<usize, Object>,
    ) -> GcObj<ObjClosure> {
        let obj = self.adopt_object(Object::from(closure), memo);
        // SAFETY: adoption preserves the variant
        unsafe { obj.as_closure_unchecked() }
    }

    pub fn adopt_upvalue(
        &mut self,
        upvalue: GcObj<RefCell<ObjUpvalue>>,
        memo: &mut HashMap<usize, Object>,
    ) -> GcObj<RefCell<ObjUpvalue>> {
        let addr = Object::from(upvalue).alloc_addr();
        if let Some(copied) = memo.get(&addr) {
            return unsafe { copied.as_upvalue_unchecked() };
        }

        // placeholder first: a closed upvalue can reach back to this very
        // upvalue through a closure
        let copy = self
            .gc
            .new_object_inner(RefCell::new(ObjUpvalue::Open(0)));
        memo.insert(addr, Object::from(copy));

        let adopted = match &*upvalue.borrow() {
            ObjUpvalue::Open(slot) => ObjUpvalue::Open(*slot),
            ObjUpvalue::Closed(v) => ObjUpvalue::Closed(self.adopt_value(*v, memo)),
        };
        *copy.borrow_mut() = adopted;

        copy
    }

    fn adopt_function(
        &mut self,
        fun: GcObj<ObjFunction>,
        memo: &mut HashMap<usize, Object>,
    ) -> GcObj<ObjFunction> {
        let addr = Object::from(fun).alloc_addr();
        if let Some(copied) = memo.get(&addr) {
            return unsafe { copied.as_function_unchecked() };
        }

        let mut chunk = Chunk {
            code: fun.chunk.code.clone(),
            constants: Vec::with_capacity(fun.chunk.constants.len()),
            spans: fun.chunk.spans.clone(),
        };
        for constant in &fun.chunk.constants {
            let adopted = self.adopt_value(*constant, memo);
            chunk.constants.push(adopted);
        }

        let name = fun.name.map(|name| self.intern(name.as_str()));
        let copy = self.gc.new_object_inner(ObjFunction {
            arity: fun.arity,
            upvalue_count: fun.upvalue_count,
            chunk,
            name,
        });
        memo.insert(addr, Object::from(copy));
        copy
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

pub use gc::{Gc, GcObj};

use self::gc::TaggedGcObj;

mod gc {
    use std::num::NonZero;
    use std::ops;

    use super::*;

    /// Helper functions on Object that are only relevant to the garbage
    /// collector.
    impl Object {
        fn set_mark(&self) {
            #[cfg(feature = "debug_gc")]
            tracing::trace!(target: "gc", "marked {:?}", self);
            unsafe {
                self.common_obj.untag().set_mark();
            }
        }

        pub(crate) fn is_marked(&self) -> bool {
            unsafe { self.common_obj.untag().is_marked() }
        }

        fn clean_mark(&self) {
            unsafe {
                self.common_obj.untag().clean_mark();
            }
        }

        /// Frees the underlying allocation and returns the number of bytes
        /// that were freed.
        ///
        /// # Safety
        ///
        /// The caller must ensure that no Object pointing to this allocation
        /// is ever used again.
        unsafe fn free(self) -> usize {
            #[cfg(feature = "debug_gc")]
            tracing::trace!(target: "gc", "free {:#x}", self.alloc_addr());
            // SAFETY: forwarded to this function's caller
            unsafe {
                match self.get_tag() {
                    Value::TAG_STRING => self.as_string_unchecked().0.free(),
                    Value::TAG_FUNCTION => self.as_function_unchecked().free(),
                    Value::TAG_NATIVE_FN => self.as_native_fn_unchecked().free(),
                    Value::TAG_CLOSURE => self.as_closure_unchecked().free(),
                    Value::TAG_UPVALUE => self.as_upvalue_unchecked().free(),
                    Value::TAG_CLASS => self.as_class_unchecked().free(),
                    Value::TAG_INSTANCE => self.as_instance_unchecked().free(),
                    Value::TAG_LIST => self.as_list_unchecked().free(),
                    Value::TAG_BOUND_METHOD => self.as_bound_method_unchecked().free(),
                    Value::TAG_FUTURE => self.as_future_unchecked().free(),
                    _ => unreachable!(),
                }
            }
        }

        fn alloc_size(&self) -> usize {
            unsafe {
                match self.get_tag() {
                    Value::TAG_STRING => self.as_string_unchecked().0.alloc_size(),
                    Value::TAG_FUNCTION => self.as_function_unchecked().alloc_size(),
                    Value::TAG_NATIVE_FN => self.as_native_fn_unchecked().alloc_size(),
                    Value::TAG_CLOSURE => self.as_closure_unchecked().alloc_size(),
                    Value::TAG_UPVALUE => self.as_upvalue_unchecked().alloc_size(),
                    Value::TAG_CLASS => self.as_class_unchecked().alloc_size(),
                    Value::TAG_INSTANCE => self.as_instance_unchecked().alloc_size(),
                    Value::TAG_LIST => self.as_list_unchecked().alloc_size(),
                    Value::TAG_BOUND_METHOD => self.as_bound_method_unchecked().alloc_size(),
                    Value::TAG_FUTURE => self.as_future_unchecked().alloc_size(),
                    _ => unreachable!(),
                }
            }
        }

        /// # Safety
        ///
        /// `obj` must not already be in the linked list of objects; a cycle
        /// would make the sweep loop forever or touch freed memory.
        unsafe fn set_next_obj(&self, obj: Option<Object>) {
            unsafe { self.common_obj.untag().set_next_obj(obj) }
        }

        fn next_obj(&self) -> Option<Object> {
            unsafe { self.common_obj.untag().next_obj() }
        }
    }

    /// Tri-color mark-sweep collector over an intrusive list of every
    /// allocation it has made. The gray worklist is an ordinary host-side
    /// `Vec`, deliberately outside the collected arena.
    #[derive(Debug)]
    pub struct Gc {
        gray_stack: Vec<Object>,
        bytes_allocated: usize,
        next_gc: usize,
        first_object: Option<Object>,
    }

    impl Gc {
        const FIRST_GC_BYTES: usize = 1024 * 1024;
        const GROWTH_FACTOR: usize = 2;

        pub fn new() -> Self {
            Self {
                gray_stack: Vec::new(),
                first_object: None,
                bytes_allocated: 0,
                next_gc: Self::FIRST_GC_BYTES,
            }
        }

        pub fn bytes_allocated(&self) -> usize {
            self.bytes_allocated
        }

        pub fn new_value<T>(&mut self, value: T) -> Value
        where
            GcObj<T>: Into<Object>,
        {
            Value::new_object(self.new_object(value))
        }

        pub fn new_object<T>(&mut self, value: T) -> Object
        where
            GcObj<T>: Into<Object>,
        {
            self.new_object_inner(value).into()
        }

        pub fn new_object_inner<T>(&mut self, value: T) -> GcObj<T>
        where
            GcObj<T>: Into<Object>,
        {
            let obj = GcObj::new(value);
            self.add_object(obj.into());
            obj
        }

        /// Links a fresh allocation at the head of the object list.
        fn add_object(&mut self, obj: Object) {
            unsafe { obj.set_next_obj(self.first_object) };
            self.first_object = Some(obj);
            self.bytes_allocated += obj.alloc_size();

            #[cfg(feature = "debug_gc")]
            tracing::trace!(
                target: "gc",
                "added {:?}, {} bytes live",
                obj,
                self.bytes_allocated
            );
        }

        pub fn should_collect(&self) -> bool {
            if cfg!(feature = "stress_gc") {
                return true;
            }
            self.bytes_allocated > self.next_gc
        }

        pub fn mark_value(&mut self, v: &Value) {
            if v.is_object() {
                self.mark_obj(unsafe { v.as_object_unchecked() });
            }
        }

        pub fn mark_string(&mut self, s: InternedString) {
            self.mark_obj(Object::new_string(s));
        }

        pub fn mark_closure(&mut self, closure: GcObj<ObjClosure>) {
            self.mark_obj(Object::from(closure));
        }

        pub fn mark_upvalue(&mut self, upvalue: GcObj<RefCell<ObjUpvalue>>) {
            self.mark_obj(Object::from(upvalue));
        }

        pub fn mark_obj(&mut self, obj: Object) {
            if obj.is_marked() {
                return;
            }
            obj.set_mark();
            self.gray_stack.push(obj);
        }

        /// Drains the gray worklist, blackening every reachable object.
        pub fn trace_references(&mut self) {
            while let Some(obj) = self.gray_stack.pop() {
                self.blacken_obj(obj);
            }
        }

        fn blacken_obj(&mut self, obj: Object) {
            match obj.get_tag() {
                Value::TAG_STRING | Value::TAG_NATIVE_FN | Value::TAG_FUTURE => {}
                Value::TAG_FUNCTION => {
                    let fun = unsafe { obj.as_function_unchecked() };
                    if let Some(name) = fun.name {
                        self.mark_string(name);
                    }
                    for constant in fun.chunk.constants.iter() {
                        self.mark_value(constant);
                    }
                }
                Value::TAG_CLOSURE => {
                    let closure = unsafe { obj.as_closure_unchecked() };
                    self.mark_obj(Object::from(closure.fun));
                    for upvalue in closure.upvalues.borrow().iter() {
                        self.mark_obj(Object::from(*upvalue));
                    }
                }
                Value::TAG_UPVALUE => {
                    let upvalue = unsafe { obj.as_upvalue_unchecked() };
                    let upvalue = upvalue.borrow();
                    if let ObjUpvalue::Closed(v) = upvalue.deref() {
                        self.mark_value(v);
                    }
                }
                Value::TAG_CLASS => {
                    let class = unsafe { obj.as_class_unchecked() };
                    let class = class.borrow();
                    self.mark_string(class.name);
                    for (key, value) in class.methods.iter() {
                        self.mark_string(key);
                        self.mark_value(&value);
                    }
                }
                Value::TAG_INSTANCE => {
                    let instance = unsafe { obj.as_instance_unchecked() };
                    let instance = instance.borrow();
                    self.mark_obj(Object::from(instance.class));
                    for (key, value) in instance.fields.iter() {
                        self.mark_string(key);
                        self.mark_value(&value);
                    }
                }
                Value::TAG_LIST => {
                    let list = unsafe { obj.as_list_unchecked() };
                    for item in list.borrow().items.iter() {
                        self.mark_value(item);
                    }
                }
                Value::TAG_BOUND_METHOD => {
                    let bm = unsafe { obj.as_bound_method_unchecked() };
                    self.mark_value(&bm.receiver);
                    self.mark_obj(Object::from(bm.method));
                }
                _ => unreachable!(),
            }
        }

        /// Frees every unmarked object, resets survivors to white and sets
        /// the next collection threshold.
        ///
        /// # Safety
        ///
        /// All reachable objects must be marked: roots marked via the
        /// `mark_..` methods, then [`Gc::trace_references`] run to
        /// completion. Any intern-table purge must already have happened.
        pub unsafe fn sweep(&mut self) {
            #[cfg(feature = "debug_gc")]
            let before = self.bytes_allocated;

            let mut last_kept: Option<Object> = None;
            let mut first_kept: Option<Object> = None;
            let mut next_to_check = self.first_object;
            while let Some(obj) = next_to_check {
                next_to_check = obj.next_obj();

                if !obj.is_marked() {
                    let bytes = unsafe { obj.free() };
                    self.bytes_allocated -= bytes;
                } else {
                    obj.clean_mark();
                    unsafe { obj.set_next_obj(None) };
                    if let Some(last) = last_kept {
                        unsafe { last.set_next_obj(Some(obj)) };
                    }
                    last_kept = Some(obj);
                    if first_kept.is_none() {
                        first_kept = Some(obj);
                    }
                }
            }

            self.first_object = first_kept;
            self.next_gc =
                usize::max(self.bytes_allocated * Self::GROWTH_FACTOR, Self::FIRST_GC_BYTES);

            #[cfg(feature = "debug_gc")]
            tracing::debug!(
                target: "gc",
                "swept {} -> {} bytes, next at {}",
                before,
                self.bytes_allocated,
                self.next_gc
            );
        }
    }

    impl Default for Gc {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Drop for Gc {
        fn drop(&mut self) {
            let mut next_to_check = self.first_object;
            while let Some(obj) = next_to_check {
                next_to_check = obj.next_obj();
                unsafe { obj.free() };
            }
        }
    }

    #[repr(transparent)]
    pub struct TaggedGcObj<T, const TAG: usize> {
        ptr: ptr::NonNull<GcBox<T>>,
        marker: PhantomData<GcBox<T>>,
    }

    #[repr(transparent)]
    pub(super) struct TaggedGcObjCommon {
        // IMPORTANT: must have the same layout as TaggedGcObj<T>, the Object
        // union casts between them
        ptr: ptr::NonNull<GcBoxCommon>,
        marker: PhantomData<GcBoxCommon>,
    }

    impl<T, const TAG: usize> TaggedGcObj<T, TAG> {
        pub fn new(data: GcObj<T>) -> Self {
            Self {
                ptr: data.ptr.map_addr(|a| a | TAG),
                marker: PhantomData,
            }
        }

        pub fn untag(self) -> GcObj<T> {
            GcObj {
                ptr: self
                    .ptr
                    .map_addr(|a| unsafe { NonZero::new_unchecked(a.get() & !TAG) }),
                marker: PhantomData,
            }
        }
    }

    impl<T, const N: usize> Copy for TaggedGcObj<T, N> {}

    impl<T, const N: usize> Clone for TaggedGcObj<T, N> {
        fn clone(&self) -> Self {
            *self
        }
    }

    impl TaggedGcObjCommon {
        pub(super) fn untag(self) -> GcObjCommon {
            GcObjCommon {
                ptr: self
                    .ptr
                    .map_addr(|a| unsafe { NonZero::new_unchecked(a.get() & !Value::TAG_BITS) }),
            }
        }
    }

    impl Copy for TaggedGcObjCommon {}

    impl Clone for TaggedGcObjCommon {
        fn clone(&self) -> Self {
            *self
        }
    }

    /// Unmanaged pointer to a garbage-collected allocation. Copying it never
    /// touches a refcount; the collector alone decides lifetime.
    #[repr(transparent)]
    pub struct GcObj<T> {
        ptr: ptr::NonNull<GcBox<T>>,
        marker: PhantomData<GcBox<T>>,
    }

    #[repr(transparent)]
    pub(super) struct GcObjCommon {
        ptr: ptr::NonNull<GcBoxCommon>,
    }

    impl<T> GcObj<T> {
        fn new(data: T) -> Self {
            let inner = GcBox::new(data);
            let ptr = Box::into_raw(Box::new(inner));

            GcObj {
                ptr: unsafe { ptr::NonNull::new_unchecked(ptr) },
                marker: PhantomData,
            }
        }

        #[inline(always)]
        fn as_inner(&self) -> &GcBox<T> {
            // SAFETY:
            //   The allocation is only ever released through self.free, whose
            //   caller promises no GcObj pointing at it is used afterwards,
            //   so at this point it is still alive. We also never hand out
            //   mutable references to the GcBox itself, so a shared reference
            //   is always valid to create.
            unsafe { self.ptr.as_ref() }
        }

        /// Frees the underlying allocation and returns the number of bytes
        /// that were freed.
        ///
        /// # Safety
        ///
        /// The caller must ensure that no GcObj pointing to this allocation
        /// is ever used again.
        pub(super) unsafe fn free(self) -> usize {
            let _ = unsafe { Box::from_raw(self.ptr.as_ptr()) };
            self.alloc_size()
        }

        const fn alloc_size(&self) -> usize {
            mem::size_of::<GcBox<T>>()
        }

        pub(crate) fn alloc_addr(&self) -> usize {
            self.ptr.as_ptr() as usize
        }
    }

    impl<T> ops::Deref for GcObj<T> {
        type Target = T;

        fn deref(&self) -> &T {
            &self.as_inner().value
        }
    }

    impl<T> Clone for GcObj<T> {
        fn clone(&self) -> Self {
            *self
        }
    }

    impl<T> Copy for GcObj<T> {}


    impl<T> fmt::Debug for GcObj<T>
    where
        T: fmt::Debug,
    {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.debug_struct("GcObj")
                .field("ptr", &self.ptr)
                .field("value", self.deref())
                .finish()
        }
    }

    impl<T> fmt::Pointer for GcObj<T> {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{:p}", self.ptr)
        }
    }

    impl<T> PartialEq for GcObj<T> {
        fn eq(&self, other: &Self) -> bool {
            self.ptr == other.ptr
        }
    }

    impl<T> Eq for GcObj<T> {}

    impl GcObjCommon {
        /// # Safety
        ///
        /// `next_obj` must not already be in the linked list of objects, a
        /// cycle would break the sweep.
        unsafe fn set_next_obj(&self, next_obj: Option<Object>) {
            self.as_inner().next_obj.set(next_obj);
        }

        fn next_obj(&self) -> Option<Object> {
            self.as_inner().next_obj.get()
        }

        #[inline(always)]
        fn as_inner(&self) -> &GcBoxCommon {
            // SAFETY: same argument as GcObj::as_inner
            unsafe { self.ptr.as_ref() }
        }

        fn set_mark(&self) {
            self.as_inner().is_marked.set(true);
        }

        fn is_marked(&self) -> bool {
            self.as_inner().is_marked.get()
        }

        fn clean_mark(&self) {
            self.as_inner().is_marked.set(false);
        }
    }

    // IMPORTANT: a pointer to GcBox<T> must also be a valid pointer to
    // GcBoxCommon: both are repr(C) and common is the first field.
    #[repr(C)]
    struct GcBox<T> {
        common: GcBoxCommon,
        value: T,
    }

    #[repr(C)]
    struct GcBoxCommon {
        is_marked: Cell<bool>,
        next_obj: Cell<Option<Object>>,
    }

    impl<T> GcBox<T> {
        fn new(value: T) -> Self {
            Self {
                common: GcBoxCommon {
                    is_marked: Cell::new(false),
                    next_obj: Cell::new(None),
                },
                value,
            }
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn gc_box_layout() {
            let b = GcObj::new(ObjList::default());

            // common must be the first field of GcBox
            assert_eq!(
                unsafe { ptr::addr_of!((*b.ptr.as_ptr()).common) },
                b.ptr.as_ptr() as *const GcBoxCommon
            );

            unsafe { b.free() };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect_with_roots(heap: &mut Heap, roots: &[Value]) {
        for root in roots {
            heap.gc.mark_value(root);
        }
        heap.gc.trace_references();
        heap.strings.remove_unmarked();
        // SAFETY: roots were marked and traced above, intern table purged
        unsafe { heap.gc.sweep() };
    }

    #[test]
    fn interning_returns_same_pointer() {
        let mut heap = Heap::new();
        let a = heap.intern("hello");
        let b = heap.intern(String::from("hello"));
        assert_eq!(a, b);
        assert_eq!(Value::new_string(a), Value::new_string(b));
    }

    #[test]
    fn collect_frees_unreachable_strings() {
        let mut heap = Heap::new();
        heap.intern("garbage");
        assert!(heap.gc.bytes_allocated() > 0);

        collect_with_roots(&mut heap, &[]);
        assert_eq!(heap.gc.bytes_allocated(), 0);

        // the intern table was purged, so this is a fresh object, not a
        // dangling reuse
        heap.intern("garbage");
        assert!(heap.gc.bytes_allocated() > 0);
    }

    #[test]
    fn rooted_values_survive() {
        let mut heap = Heap::new();
        let s = heap.intern("kept");
        let root = Value::new_string(s);
        let bytes = heap.gc.bytes_allocated();

        collect_with_roots(&mut heap, &[root]);
        assert_eq!(heap.gc.bytes_allocated(), bytes);
        assert_eq!(heap.intern("kept"), s);
    }

    #[test]
    fn repeated_collects_are_stable() {
        let mut heap = Heap::new();
        let kept = Value::new_string(heap.intern("kept"));
        heap.intern("dropped");

        collect_with_roots(&mut heap, &[kept]);
        let bytes = heap.gc.bytes_allocated();
        collect_with_roots(&mut heap, &[kept]);
        assert_eq!(heap.gc.bytes_allocated(), bytes);
    }

    #[test]
    fn list_items_are_traced() {
        let mut heap = Heap::new();
        let item = Value::new_string(heap.intern("item"));
        let list = heap.gc.new_value(RefCell::new(ObjList { items: vec![item] }));

        collect_with_roots(&mut heap, &[list]);

        // the item is still interned, proving it survived through the list
        let list = list.try_as_list().unwrap();
        assert_eq!(list.borrow().items[0].try_as_string().unwrap().as_str(), "item");
    }

    #[test]
    fn values_compare_by_identity_and_number() {
        let mut heap = Heap::new();
        assert_eq!(Value::new_number(1.5), Value::new_number(1.5));
        assert_ne!(Value::new_number(f64::NAN), Value::new_number(f64::NAN));
        assert_eq!(Value::NIL, Value::NIL);
        assert_ne!(Value::TRUE, Value::FALSE);

        let a = Value::new_string(heap.intern("x"));
        let b = Value::new_string(heap.intern("x"));
        assert_eq!(a, b);
    }

    #[test]
    fn adopt_preserves_aliasing() {
        let mut parent = Heap::new();
        let shared = parent.gc.new_value(RefCell::new(ObjList::default()));
        let outer = parent.gc.new_value(RefCell::new(ObjList {
            items: vec![shared, shared],
        }));

        let mut child = Heap::new();
        let mut memo = HashMap::new();
        let adopted = child.adopt_value(outer, &mut memo);

        let adopted = adopted.try_as_list().unwrap();
        let adopted = adopted.borrow();
        assert_eq!(adopted.items[0], adopted.items[1]);
        // and it is a copy, not the parent's object
        assert_ne!(adopted.items[0], shared);
    }

    #[test]
    fn adopt_reinterns_strings() {
        let mut parent = Heap::new();
        let s = Value::new_string(parent.intern("shared"));

        let mut child = Heap::new();
        let mut memo = HashMap::new();
        let adopted = child.adopt_value(s, &mut memo);

        assert_ne!(adopted.try_as_string().unwrap(), s.try_as_string().unwrap());
        assert_eq!(adopted.try_as_string().unwrap(), child.intern("shared"));
    }
}

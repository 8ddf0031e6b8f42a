//! Call dispatcher: bridges intercepted native calls into user callbacks.
//!
//! A hook's signature is declared once, as an ordered list of [`ValueKind`]s,
//! and drives two adapters built through libffi: a call interface over the
//! trampoline so the original behavior stays invokable ([`OriginalFn`]), and
//! a native-callable closure whose entry address gets patched into the
//! target's prologue ([`DispatchStub`]).
//!
//! Arguments and results cross the boundary as tagged [`Value`]s, never as
//! untyped words. A declared signature that does not match the real
//! function's calling convention is undefined behavior at the machine-code
//! boundary; that contract is the caller's, nothing here can check it.

use std::ffi::c_void;
use std::mem::ManuallyDrop;
use std::panic::{self, AssertUnwindSafe};

use libffi::low::ffi_cif;
use libffi::middle::{Arg, Cif, Closure, CodePtr, Type};
use log::error;

/// The primitive kinds a hooked function's parameters and return value can
/// take. `Void` is only valid as a return kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ValueKind {
    Void,
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    F32,
    F64,
    Pointer,
}

impl ValueKind {
    fn ffi_type(self) -> Type {
        match self {
            ValueKind::Void => Type::void(),
            ValueKind::I8 => Type::i8(),
            ValueKind::U8 => Type::u8(),
            ValueKind::I16 => Type::i16(),
            ValueKind::U16 => Type::u16(),
            ValueKind::I32 => Type::i32(),
            ValueKind::U32 => Type::u32(),
            ValueKind::I64 => Type::i64(),
            ValueKind::U64 => Type::u64(),
            ValueKind::F32 => Type::f32(),
            ValueKind::F64 => Type::f64(),
            ValueKind::Pointer => Type::pointer(),
        }
    }

    /// The value returned to a native caller when the user callback fails:
    /// zero, null or 0.0 as appropriate.
    pub fn default_value(self) -> Value {
        match self {
            ValueKind::Void => Value::Void,
            ValueKind::I8 => Value::I8(0),
            ValueKind::U8 => Value::U8(0),
            ValueKind::I16 => Value::I16(0),
            ValueKind::U16 => Value::U16(0),
            ValueKind::I32 => Value::I32(0),
            ValueKind::U32 => Value::U32(0),
            ValueKind::I64 => Value::I64(0),
            ValueKind::U64 => Value::U64(0),
            ValueKind::F32 => Value::F32(0.0),
            ValueKind::F64 => Value::F64(0.0),
            ValueKind::Pointer => Value::Pointer(0),
        }
    }
}

/// A tagged native value crossing the dispatch boundary.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Value {
    Void,
    I8(i8),
    U8(u8),
    I16(i16),
    U16(u16),
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    F32(f32),
    F64(f64),
    Pointer(usize),
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Void => ValueKind::Void,
            Value::I8(_) => ValueKind::I8,
            Value::U8(_) => ValueKind::U8,
            Value::I16(_) => ValueKind::I16,
            Value::U16(_) => ValueKind::U16,
            Value::I32(_) => ValueKind::I32,
            Value::U32(_) => ValueKind::U32,
            Value::I64(_) => ValueKind::I64,
            Value::U64(_) => ValueKind::U64,
            Value::F32(_) => ValueKind::F32,
            Value::F64(_) => ValueKind::F64,
            Value::Pointer(_) => ValueKind::Pointer,
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Value::I32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::I64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::F64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_pointer(&self) -> Option<usize> {
        match self {
            Value::Pointer(v) => Some(*v),
            _ => None,
        }
    }

    fn as_ffi_arg(&self) -> Arg {
        match self {
            // Never passed as a real argument; kept total for the compiler.
            Value::Void => Arg::new(&()),
            Value::I8(v) => Arg::new(v),
            Value::U8(v) => Arg::new(v),
            Value::I16(v) => Arg::new(v),
            Value::U16(v) => Arg::new(v),
            Value::I32(v) => Arg::new(v),
            Value::U32(v) => Arg::new(v),
            Value::I64(v) => Arg::new(v),
            Value::U64(v) => Arg::new(v),
            Value::F32(v) => Arg::new(v),
            Value::F64(v) => Arg::new(v),
            Value::Pointer(v) => Arg::new(v),
        }
    }
}

/// Parameter and return kinds of a hooked function, declared once at
/// installation time.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CallSignature {
    params: Vec<ValueKind>,
    ret: ValueKind,
}

impl CallSignature {
    pub fn new(params: impl Into<Vec<ValueKind>>, ret: ValueKind) -> CallSignature {
        let params = params.into();
        debug_assert!(
            !params.contains(&ValueKind::Void),
            "Void is not a parameter kind"
        );
        CallSignature { params, ret }
    }

    pub fn params(&self) -> &[ValueKind] {
        &self.params
    }

    pub fn ret(&self) -> ValueKind {
        self.ret
    }

    pub(crate) fn cif(&self) -> Cif {
        Cif::new(
            self.params.iter().map(|kind| kind.ffi_type()),
            self.ret.ffi_type(),
        )
    }
}

/// A callable view of the original, unpatched behavior (the trampoline).
pub struct OriginalFn {
    cif: Cif,
    code: CodePtr,
    signature: CallSignature,
}

impl OriginalFn {
    pub(crate) fn new(address: u64, signature: &CallSignature) -> OriginalFn {
        OriginalFn {
            cif: signature.cif(),
            code: CodePtr(address as *mut c_void),
            signature: signature.clone(),
        }
    }

    pub fn address(&self) -> u64 {
        self.code.0 as u64
    }

    /// Invokes the original code path with `args`, which may be the real
    /// intercepted arguments or substitutes.
    pub fn call(&self, args: &[Value]) -> Value {
        debug_assert_eq!(args.len(), self.signature.params().len());
        let ffi_args: Vec<Arg> = args.iter().map(Value::as_ffi_arg).collect();
        unsafe {
            match self.signature.ret() {
                ValueKind::Void => {
                    self.cif.call::<()>(self.code, &ffi_args);
                    Value::Void
                }
                ValueKind::I8 => Value::I8(self.cif.call(self.code, &ffi_args)),
                ValueKind::U8 => Value::U8(self.cif.call(self.code, &ffi_args)),
                ValueKind::I16 => Value::I16(self.cif.call(self.code, &ffi_args)),
                ValueKind::U16 => Value::U16(self.cif.call(self.code, &ffi_args)),
                ValueKind::I32 => Value::I32(self.cif.call(self.code, &ffi_args)),
                ValueKind::U32 => Value::U32(self.cif.call(self.code, &ffi_args)),
                ValueKind::I64 => Value::I64(self.cif.call(self.code, &ffi_args)),
                ValueKind::U64 => Value::U64(self.cif.call(self.code, &ffi_args)),
                ValueKind::F32 => Value::F32(self.cif.call(self.code, &ffi_args)),
                ValueKind::F64 => Value::F64(self.cif.call(self.code, &ffi_args)),
                ValueKind::Pointer => {
                    Value::Pointer(self.cif.call::<*mut c_void>(self.code, &ffi_args) as usize)
                }
            }
        }
    }
}

/// User hook logic: receives the original code path and the intercepted
/// arguments, returns the value handed back to the native caller.
pub type HookCallback = Box<dyn Fn(&OriginalFn, &[Value]) -> Value + Send + Sync>;

struct HookContext {
    signature: CallSignature,
    original: OriginalFn,
    callback: HookCallback,
}

/// The native-callable entry a hooked prologue jumps to.
///
/// Owns the libffi closure plus its context. The context is leaked into a
/// raw pointer so the closure can borrow it for `'static`; `Drop` reverses
/// the leak after tearing the closure down.
pub(crate) struct DispatchStub {
    closure: ManuallyDrop<Closure<'static>>,
    context: *mut HookContext,
    entry: u64,
}

// The context is only touched by native callers routed through the closure
// and by Drop; the closure itself is immutable generated code.
unsafe impl Send for DispatchStub {}

impl DispatchStub {
    pub(crate) fn new(
        signature: &CallSignature,
        trampoline_address: u64,
        callback: HookCallback,
    ) -> DispatchStub {
        let context = Box::into_raw(Box::new(HookContext {
            signature: signature.clone(),
            original: OriginalFn::new(trampoline_address, signature),
            callback,
        }));
        let context_ref: &'static HookContext = unsafe { &*context };
        let closure = Closure::new(signature.cif(), dispatch_raw, context_ref);
        let entry = (*closure.code_ptr()) as usize as u64;
        DispatchStub {
            closure: ManuallyDrop::new(closure),
            context,
            entry,
        }
    }

    /// Address native callers are redirected to.
    pub(crate) fn entry_address(&self) -> u64 {
        self.entry
    }
}

impl Drop for DispatchStub {
    fn drop(&mut self) {
        unsafe {
            // The closure borrows the context; tear it down first.
            ManuallyDrop::drop(&mut self.closure);
            drop(Box::from_raw(self.context));
        }
    }
}

/// Generic handler entered from the libffi closure whenever a hooked
/// function is called.
///
/// Marshals the raw argument slots into tagged values, runs the user
/// callback, and writes its result into the libffi return buffer. Panics
/// are stopped here: nothing may unwind into the native caller's stack, so
/// a panicking callback is reported and replaced by the return kind's safe
/// default. The marshaled argument vector is released when this returns,
/// whatever the callback did.
unsafe extern "C" fn dispatch_raw(
    _cif: &ffi_cif,
    result: &mut u64,
    args: *const *const c_void,
    context: &HookContext,
) {
    let values = read_args(context.signature.params(), args);
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        (context.callback)(&context.original, &values)
    }));
    let value = match outcome {
        Ok(value) => value,
        Err(_) => {
            error!(
                "hook callback for target {:#x} panicked; returning {:?} default",
                context.original.address(),
                context.signature.ret()
            );
            context.signature.ret().default_value()
        }
    };
    write_result(context.signature.ret(), value, result as *mut u64 as *mut c_void);
}

unsafe fn read_args(kinds: &[ValueKind], args: *const *const c_void) -> Vec<Value> {
    kinds
        .iter()
        .enumerate()
        .map(|(i, kind)| {
            let slot = *args.add(i);
            match kind {
                ValueKind::Void => Value::Void,
                ValueKind::I8 => Value::I8(*(slot as *const i8)),
                ValueKind::U8 => Value::U8(*(slot as *const u8)),
                ValueKind::I16 => Value::I16(*(slot as *const i16)),
                ValueKind::U16 => Value::U16(*(slot as *const u16)),
                ValueKind::I32 => Value::I32(*(slot as *const i32)),
                ValueKind::U32 => Value::U32(*(slot as *const u32)),
                ValueKind::I64 => Value::I64(*(slot as *const i64)),
                ValueKind::U64 => Value::U64(*(slot as *const u64)),
                ValueKind::F32 => Value::F32(*(slot as *const f32)),
                ValueKind::F64 => Value::F64(*(slot as *const f64)),
                ValueKind::Pointer => Value::Pointer(*(slot as *const usize)),
            }
        })
        .collect()
}

/// Writes `value` into a libffi closure return buffer. Integral kinds
/// narrower than a machine word are widened to `ffi_arg` as the closure ABI
/// requires; floats are written at their own width.
unsafe fn write_result(kind: ValueKind, value: Value, out: *mut c_void) {
    match (kind, value) {
        (ValueKind::Void, _) => {}
        (ValueKind::I8, Value::I8(v)) => *(out as *mut u64) = v as i64 as u64,
        (ValueKind::U8, Value::U8(v)) => *(out as *mut u64) = v as u64,
        (ValueKind::I16, Value::I16(v)) => *(out as *mut u64) = v as i64 as u64,
        (ValueKind::U16, Value::U16(v)) => *(out as *mut u64) = v as u64,
        (ValueKind::I32, Value::I32(v)) => *(out as *mut u64) = v as i64 as u64,
        (ValueKind::U32, Value::U32(v)) => *(out as *mut u64) = v as u64,
        (ValueKind::I64, Value::I64(v)) => *(out as *mut u64) = v as u64,
        (ValueKind::U64, Value::U64(v)) => *(out as *mut u64) = v,
        (ValueKind::F32, Value::F32(v)) => *(out as *mut f32) = v,
        (ValueKind::F64, Value::F64(v)) => *(out as *mut f64) = v,
        (ValueKind::Pointer, Value::Pointer(v)) => *(out as *mut usize) = v,
        (kind, other) => {
            error!(
                "hook callback returned {:?} where {kind:?} was declared; substituting default",
                other.kind()
            );
            write_result(kind, kind.default_value(), out);
        }
    }
}

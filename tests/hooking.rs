//! Live install/uninstall tests against functions in this test binary.
//!
//! The targets are defined in assembly with NOP-padded prologues so the
//! captured jump-code window always ends on an instruction boundary,
//! keeping trampoline execution well defined on every supported
//! architecture.

#![cfg(all(target_os = "linux", any(target_arch = "x86_64", target_arch = "aarch64")))]

use std::sync::{Mutex, MutexGuard};

use nativehook::{Arch, CallSignature, HookError, Value, ValueKind};

#[cfg(target_arch = "x86_64")]
macro_rules! define_add_target {
    ($name:literal) => {
        core::arch::global_asm!(concat!(
            ".text\n",
            ".balign 16\n",
            ".globl ",
            $name,
            "\n",
            $name,
            ":\n",
            ".rept 16\n",
            "nop\n",
            ".endr\n",
            "lea eax, [rdi + rsi]\n",
            "ret\n",
        ));
    };
}

#[cfg(target_arch = "aarch64")]
macro_rules! define_add_target {
    ($name:literal) => {
        core::arch::global_asm!(concat!(
            ".text\n",
            ".balign 4\n",
            ".globl ",
            $name,
            "\n",
            $name,
            ":\n",
            "nop\n",
            "nop\n",
            "nop\n",
            "nop\n",
            "add w0, w0, w1\n",
            "ret\n",
        ));
    };
}

define_add_target!("tgt_override");
define_add_target!("tgt_substitute");
define_add_target!("tgt_restore");
define_add_target!("tgt_unique");
define_add_target!("tgt_panic");
define_add_target!("tgt_reinstall");
define_add_target!("tgt_bulk_a");
define_add_target!("tgt_bulk_b");

extern "C" {
    fn tgt_override(a: i32, b: i32) -> i32;
    fn tgt_substitute(a: i32, b: i32) -> i32;
    fn tgt_restore(a: i32, b: i32) -> i32;
    fn tgt_unique(a: i32, b: i32) -> i32;
    fn tgt_panic(a: i32, b: i32) -> i32;
    fn tgt_reinstall(a: i32, b: i32) -> i32;
    fn tgt_bulk_a(a: i32, b: i32) -> i32;
    fn tgt_bulk_b(a: i32, b: i32) -> i32;
}

/// Hooks mutate process-global code; run one test at a time.
static LOCK: Mutex<()> = Mutex::new(());

fn serial() -> MutexGuard<'static, ()> {
    LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn add_signature() -> CallSignature {
    CallSignature::new([ValueKind::I32, ValueKind::I32], ValueKind::I32)
}

fn prologue_of(address: u64) -> Vec<u8> {
    let len = Arch::current().unwrap().jump_code_size();
    unsafe { std::slice::from_raw_parts(address as *const u8, len).to_vec() }
}

#[test]
fn callback_replaces_the_returned_value() {
    let _serial = serial();
    assert_eq!(unsafe { tgt_override(5, 7) }, 12);

    let handle = nativehook::install_at(
        tgt_override as usize as u64,
        add_signature(),
        |_original, args| {
            let a = args[0].as_i32().unwrap();
            let b = args[1].as_i32().unwrap();
            Value::I32(a * b)
        },
    )
    .unwrap();

    assert_eq!(unsafe { tgt_override(5, 7) }, 35);
    nativehook::uninstall(handle).unwrap();
    assert_eq!(unsafe { tgt_override(5, 7) }, 12);
}

#[test]
fn substituted_arguments_reach_the_original_through_the_trampoline() {
    let _serial = serial();
    let handle = nativehook::install_at(
        tgt_substitute as usize as u64,
        add_signature(),
        |original, _args| original.call(&[Value::I32(1), Value::I32(1)]),
    )
    .unwrap();

    assert_eq!(unsafe { tgt_substitute(5, 7) }, 2);
    nativehook::uninstall(handle).unwrap();
    assert_eq!(unsafe { tgt_substitute(5, 7) }, 12);
}

#[test]
fn uninstall_restores_the_exact_original_bytes() {
    let _serial = serial();
    let target = tgt_restore as usize as u64;
    let before = prologue_of(target);

    let handle =
        nativehook::install_at(target, add_signature(), |_o, _a| Value::I32(0)).unwrap();
    assert_ne!(prologue_of(target), before, "prologue was not patched");
    assert_eq!(nativehook::original_bytes(handle).unwrap(), before);

    nativehook::uninstall(handle).unwrap();
    assert_eq!(prologue_of(target), before);

    // second uninstall through the same handle: no-op, no error
    nativehook::uninstall(handle).unwrap();
    assert_eq!(prologue_of(target), before);
}

#[test]
fn a_second_hook_at_the_same_address_is_refused() {
    let _serial = serial();
    let target = tgt_unique as usize as u64;
    let handle = nativehook::install_at(target, add_signature(), |_o, args| {
        Value::I32(args[0].as_i32().unwrap() * args[1].as_i32().unwrap())
    })
    .unwrap();

    let second = nativehook::install_at(target, add_signature(), |_o, _a| Value::I32(-1));
    assert!(matches!(second, Err(HookError::AlreadyInstalled(addr)) if addr == target));

    // the first hook stays active
    assert_eq!(unsafe { tgt_unique(5, 7) }, 35);
    nativehook::uninstall(handle).unwrap();
    assert_eq!(unsafe { tgt_unique(5, 7) }, 12);
}

#[test]
fn a_panicking_callback_yields_the_declared_default() {
    let _serial = serial();
    let handle = nativehook::install_at(
        tgt_panic as usize as u64,
        add_signature(),
        |_original, _args| panic!("intercepted call went sideways"),
    )
    .unwrap();

    assert_eq!(unsafe { tgt_panic(5, 7) }, 0);
    nativehook::uninstall(handle).unwrap();
    assert_eq!(unsafe { tgt_panic(5, 7) }, 12);
}

#[test]
fn reinstalling_after_uninstall_creates_a_fresh_hook() {
    let _serial = serial();
    let target = tgt_reinstall as usize as u64;

    let first = nativehook::install_at(target, add_signature(), |_o, _a| Value::I32(100)).unwrap();
    assert_eq!(unsafe { tgt_reinstall(5, 7) }, 100);
    nativehook::uninstall(first).unwrap();

    let second = nativehook::install_at(target, add_signature(), |_o, _a| Value::I32(200)).unwrap();
    assert_eq!(unsafe { tgt_reinstall(5, 7) }, 200);
    nativehook::uninstall(second).unwrap();
    assert_eq!(unsafe { tgt_reinstall(5, 7) }, 12);
}

#[test]
fn uninstall_all_tears_down_every_active_hook() {
    let _serial = serial();
    nativehook::install_at(tgt_bulk_a as usize as u64, add_signature(), |_o, _a| {
        Value::I32(1)
    })
    .unwrap();
    nativehook::install_at(tgt_bulk_b as usize as u64, add_signature(), |_o, _a| {
        Value::I32(2)
    })
    .unwrap();
    assert_eq!(unsafe { tgt_bulk_a(5, 7) }, 1);
    assert_eq!(unsafe { tgt_bulk_b(5, 7) }, 2);

    let failures = nativehook::uninstall_all();
    assert!(failures.is_empty(), "uninstall failures: {failures:?}");
    assert_eq!(unsafe { tgt_bulk_a(5, 7) }, 12);
    assert_eq!(unsafe { tgt_bulk_b(5, 7) }, 12);
}

#[test]
fn declared_signature_is_kept_with_the_hook() {
    let _serial = serial();
    let handle = nativehook::install_at(
        tgt_override as usize as u64,
        add_signature(),
        |original, args| original.call(args),
    )
    .unwrap();
    let signature = nativehook::signature_of(handle).unwrap();
    assert_eq!(signature.params(), &[ValueKind::I32, ValueKind::I32]);
    assert_eq!(signature.ret(), ValueKind::I32);
    assert_eq!(unsafe { tgt_override(3, 4) }, 7);
    nativehook::uninstall(handle).unwrap();
}

/// Full resolution pipeline against a real loaded library. x86_64 only:
/// `labs` is long enough there that the patch window stays inside the
/// function.
#[test]
#[cfg(target_arch = "x86_64")]
fn symbol_resolution_hooks_a_real_library_export() {
    let _serial = serial();
    let name = std::ffi::CString::new("labs").unwrap();
    let addr = unsafe { libc::dlsym(libc::RTLD_DEFAULT, name.as_ptr()) } as u64;
    assert_ne!(addr, 0);

    let library = nativehook::module_containing(addr).expect("labs has no containing module");
    assert!(library.base_address <= addr);

    let signature = CallSignature::new([ValueKind::I64], ValueKind::I64);
    let handle = nativehook::install(&library.name, "labs", signature, |_original, _args| {
        Value::I64(-42)
    })
    .unwrap();
    assert_eq!(handle.address(), addr);

    assert_eq!(unsafe { libc::labs(5) }, -42);
    nativehook::uninstall(handle).unwrap();
    assert_eq!(unsafe { libc::labs(-5) }, 5);
}

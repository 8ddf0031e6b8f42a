//! In-process trampoline hooks for native functions.
//!
//! `nativehook` intercepts calls into compiled functions living in shared
//! libraries already mapped into the current process, without touching
//! on-disk binaries and without elevated privileges. A target is named by
//! library + exported symbol (or a raw address), its prologue is replaced
//! with a jump into a dispatch stub, and the displaced bytes are replayed
//! by a trampoline so the original behavior stays callable. Every hook can
//! be reversed at any time, restoring the exact original bytes.
//!
//! ```no_run
//! use nativehook::{CallSignature, Value, ValueKind};
//!
//! let signature = CallSignature::new([ValueKind::I32, ValueKind::I32], ValueKind::I32);
//! let handle = nativehook::install("libtest.so", "add", signature, |original, args| {
//!     // run the real implementation, then tamper with its result
//!     match original.call(args) {
//!         Value::I32(sum) => Value::I32(sum * 10),
//!         other => other,
//!     }
//! })?;
//! nativehook::uninstall(handle)?;
//! # Ok::<(), nativehook::HookError>(())
//! ```
//!
//! The byte-level patch window is not synchronized against threads already
//! executing inside the first few instructions of the target; install hooks
//! before the code path becomes hot, or accept that race.

mod arch;
mod dispatch;
mod elf;
mod error;
mod hook;
mod modules;
mod patch;
mod registry;

pub use arch::Arch;
pub use dispatch::{CallSignature, HookCallback, OriginalFn, Value, ValueKind};
pub use elf::{all_symbols, function_symbols, SymbolInfo, SymbolKind};
pub use error::HookError;
pub use hook::HookState;
pub use modules::{base_address_of, module_containing, path_of, LibraryInfo};
pub use registry::{
    install, install_at, original_bytes, signature_of, uninstall, uninstall_all, HookHandle,
};

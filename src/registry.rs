//! Process-wide hook table.
//!
//! Owns every [`HookDescriptor`] keyed by target address and enforces the
//! uniqueness rule: at most one active hook per address. Install and
//! uninstall may race with calls into already-hooked functions from other
//! threads; the table itself is lock-guarded, while the byte-patch window
//! is documented as unsynchronized (see `patch::write_code`).

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use log::warn;
use once_cell::sync::Lazy;

use crate::dispatch::{CallSignature, OriginalFn, Value};
use crate::elf::{self, SymbolInfo, SymbolKind};
use crate::error::HookError;
use crate::hook::{HookDescriptor, HookState};
use crate::modules::{self, ModuleRecord};

/// Opaque reference to an installed hook, used to uninstall it later.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HookHandle {
    address: u64,
}

impl HookHandle {
    /// The absolute target address this hook patched.
    pub fn address(self) -> u64 {
        self.address
    }
}

static REGISTRY: Lazy<Mutex<HashMap<u64, HookDescriptor>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Resolves `symbol` inside `module` to an absolute call address, range
/// checking it against the module's loadable span.
fn resolve_symbol(
    module: &ModuleRecord,
    symbols: &[SymbolInfo],
    library: &str,
    symbol: &str,
) -> Result<u64, HookError> {
    let info = symbols
        .iter()
        .find(|sym| sym.name == symbol && sym.kind == SymbolKind::Function)
        .or_else(|| symbols.iter().find(|sym| sym.name == symbol))
        .ok_or_else(|| HookError::SymbolNotFound {
            library: library.to_string(),
            symbol: symbol.to_string(),
        })?;
    if module.mapped_span != 0 && info.relative_address + info.size > module.mapped_span {
        return Err(HookError::AddressOutOfRange {
            symbol: symbol.to_string(),
            address: info.relative_address,
            span: module.mapped_span,
        });
    }
    Ok(module.base_address + info.relative_address)
}

/// Installs a hook on `symbol` exported by the loaded library named
/// `library` (final path component, e.g. `"libc.so.6"`).
///
/// Resolution failures surface before anything is patched.
pub fn install<F>(
    library: &str,
    symbol: &str,
    signature: CallSignature,
    callback: F,
) -> Result<HookHandle, HookError>
where
    F: Fn(&OriginalFn, &[Value]) -> Value + Send + Sync + 'static,
{
    let module = modules::find_module(library)
        .ok_or_else(|| HookError::ModuleNotFound(library.to_string()))?;
    let symbols = elf::all_symbols(Path::new(&module.path));
    let address = resolve_symbol(&module, &symbols, library, symbol)?;
    install_at(address, signature, callback)
}

/// Installs a hook directly at an absolute address.
///
/// Installing at an address that already carries an active hook is refused;
/// the existing hook stays untouched.
pub fn install_at<F>(
    address: u64,
    signature: CallSignature,
    callback: F,
) -> Result<HookHandle, HookError>
where
    F: Fn(&OriginalFn, &[Value]) -> Value + Send + Sync + 'static,
{
    if address == 0 {
        return Err(HookError::UnmappedAddress(0));
    }
    let mut table = REGISTRY.lock().unwrap();
    if let Some(existing) = table.get(&address) {
        if existing.state() == HookState::Installed {
            warn!("refusing to stack a second hook at {address:#x}");
            return Err(HookError::AlreadyInstalled(address));
        }
    }
    let descriptor = HookDescriptor::install(address, signature, Box::new(callback))?;
    table.insert(address, descriptor);
    Ok(HookHandle { address })
}

/// Removes the hook behind `handle`, restoring the original prologue.
///
/// Uninstalling a handle twice is a no-op the second time. A handle that
/// never referred to a hook is an error.
pub fn uninstall(handle: HookHandle) -> Result<(), HookError> {
    let mut table = REGISTRY.lock().unwrap();
    match table.get_mut(&handle.address) {
        None => Err(HookError::NotInstalled(handle.address)),
        Some(descriptor) => descriptor.uninstall(),
    }
}

/// Tears down every active hook, attempting all of them even when some
/// fail. Returns the failures, one per target address.
pub fn uninstall_all() -> Vec<(u64, HookError)> {
    let mut table = REGISTRY.lock().unwrap();
    let mut failures = Vec::new();
    for descriptor in table.values_mut() {
        if let Err(err) = descriptor.uninstall() {
            failures.push((descriptor.target_address(), err));
        }
    }
    failures
}

/// Captured prologue bytes of the hook at `handle`, while the descriptor is
/// known to the registry.
pub fn original_bytes(handle: HookHandle) -> Option<Vec<u8>> {
    REGISTRY
        .lock()
        .unwrap()
        .get(&handle.address)
        .map(|descriptor| descriptor.original_bytes().to_vec())
}

/// Declared call signature of the hook at `handle`.
pub fn signature_of(handle: HookHandle) -> Option<CallSignature> {
    REGISTRY
        .lock()
        .unwrap()
        .get(&handle.address)
        .map(|descriptor| descriptor.signature().clone())
}

//! Hook records: prologue capture, trampoline synthesis and the
//! install/uninstall state machine for a single target address.

use log::{info, warn};

use crate::arch::Arch;
use crate::dispatch::{CallSignature, DispatchStub, HookCallback};
use crate::error::HookError;
use crate::patch::{self, CodeBlock};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HookState {
    Installed,
    Uninstalled,
}

/// Resources that exist only while the hook is active.
struct LiveHook {
    /// Executable block replaying the captured prologue, then jumping back
    /// into the unmodified remainder of the target.
    trampoline: CodeBlock,
    stub: DispatchStub,
}

/// One installed (or since-removed) hook.
///
/// State machine: `install` produces `Installed`; `uninstall` is the only
/// transition out and restores the captured bytes. Re-installation at the
/// same address goes through a fresh descriptor.
pub(crate) struct HookDescriptor {
    target_address: u64,
    jump_code_size: usize,
    original_bytes: Vec<u8>,
    signature: CallSignature,
    state: HookState,
    live: Option<LiveHook>,
}

impl HookDescriptor {
    /// Captures the target's prologue, builds the trampoline and dispatch
    /// stub, then patches the prologue with a jump to the stub.
    ///
    /// Nothing is written until every fallible preparation step has
    /// succeeded, and a failed protection change aborts before the first
    /// byte: there is no observable partially-patched state on error.
    pub(crate) fn install(
        target_address: u64,
        signature: CallSignature,
        callback: HookCallback,
    ) -> Result<HookDescriptor, HookError> {
        let arch = Arch::current()?;
        let jump_code_size = arch.jump_code_size();

        patch::ensure_mapped(target_address, jump_code_size)?;
        let original_bytes = unsafe { patch::read_bytes(target_address, jump_code_size) };

        // Saved prologue followed by a jump to the first unmodified
        // instruction after it.
        let mut trampoline_code = original_bytes.clone();
        trampoline_code.extend(arch.jump_code(target_address + jump_code_size as u64));
        let trampoline = CodeBlock::new(&trampoline_code)?;

        let stub = DispatchStub::new(&signature, trampoline.address(), callback);
        let jump_to_stub = arch.jump_code(stub.entry_address());

        unsafe {
            patch::write_code(target_address, &jump_to_stub)?;
        }
        info!(
            "hook installed at {target_address:#x} (stub {:#x}, trampoline {:#x})",
            stub.entry_address(),
            trampoline.address()
        );

        Ok(HookDescriptor {
            target_address,
            jump_code_size,
            original_bytes,
            signature,
            state: HookState::Installed,
            live: Some(LiveHook { trampoline, stub }),
        })
    }

    /// Restores the captured prologue and releases the trampoline and stub.
    ///
    /// A no-op on an already-uninstalled descriptor. If the protection
    /// change fails the hook is left fully installed; a partially reversed
    /// hook would be worse than a still-active one.
    pub(crate) fn uninstall(&mut self) -> Result<(), HookError> {
        if self.state == HookState::Uninstalled {
            return Ok(());
        }
        if let Err(err) = unsafe { patch::write_code(self.target_address, &self.original_bytes) } {
            warn!("leaving hook at {:#x} installed: {err}", self.target_address);
            return Err(err);
        }
        self.live = None;
        self.state = HookState::Uninstalled;
        info!("hook at {:#x} uninstalled", self.target_address);
        Ok(())
    }

    pub(crate) fn state(&self) -> HookState {
        self.state
    }

    pub(crate) fn target_address(&self) -> u64 {
        self.target_address
    }

    pub(crate) fn signature(&self) -> &CallSignature {
        &self.signature
    }

    pub(crate) fn original_bytes(&self) -> &[u8] {
        debug_assert_eq!(self.original_bytes.len(), self.jump_code_size);
        &self.original_bytes
    }
}

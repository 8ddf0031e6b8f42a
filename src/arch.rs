//! Architecture-specific jump-code patterns.
//!
//! Generation is a pure function of (architecture, target address) so it can
//! be tested without touching live memory. The emitted sequence for every
//! architecture is an absolute jump: position-independent, safe to place both
//! over a function prologue and at the end of a trampoline.

use crate::error::HookError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Arch {
    Arm64,
    X86_64,
    Arm,
    X86,
}

impl Arch {
    /// The architecture this process is running on, or
    /// [`HookError::UnsupportedArchitecture`] if no jump-code pattern exists
    /// for it.
    pub fn current() -> Result<Arch, HookError> {
        if cfg!(target_arch = "aarch64") {
            Ok(Arch::Arm64)
        } else if cfg!(target_arch = "x86_64") {
            Ok(Arch::X86_64)
        } else if cfg!(target_arch = "arm") {
            Ok(Arch::Arm)
        } else if cfg!(target_arch = "x86") {
            Ok(Arch::X86)
        } else {
            Err(HookError::UnsupportedArchitecture)
        }
    }

    /// Number of bytes an absolute jump occupies. This is also the number of
    /// prologue bytes captured and overwritten when a hook is installed.
    pub fn jump_code_size(self) -> usize {
        match self {
            Arch::Arm64 => 16,
            Arch::X86_64 => 13,
            Arch::Arm => 12,
            Arch::X86 => 7,
        }
    }

    /// Machine code for an absolute jump to `target`. The returned sequence
    /// is always exactly [`jump_code_size`](Arch::jump_code_size) bytes.
    pub fn jump_code(self, target: u64) -> Vec<u8> {
        match self {
            Arch::Arm64 => {
                // LDR X16, #8 ; BR X16 ; .quad target
                let mut code = vec![0x50, 0x00, 0x00, 0x58, 0x00, 0x02, 0x1f, 0xd6];
                code.extend_from_slice(&target.to_le_bytes());
                code
            }
            Arch::X86_64 => {
                // MOVABS R11, target ; JMP R11
                // R11 is caller-saved scratch in the SysV ABI, so clobbering
                // it at a function entry is safe.
                let mut code = vec![0x49, 0xbb];
                code.extend_from_slice(&target.to_le_bytes());
                code.extend_from_slice(&[0x41, 0xff, 0xe3]);
                code
            }
            Arch::Arm => {
                // LDR R12, [PC] ; BX R12 ; .word target
                // PC reads as instruction address + 8, which is exactly where
                // the literal sits.
                let mut code = vec![0x00, 0xc0, 0x9f, 0xe5, 0x1c, 0xff, 0x2f, 0xe1];
                code.extend_from_slice(&(target as u32).to_le_bytes());
                code
            }
            Arch::X86 => {
                // MOV EAX, target ; JMP EAX
                let mut code = vec![0xb8];
                code.extend_from_slice(&(target as u32).to_le_bytes());
                code.extend_from_slice(&[0xff, 0xe0]);
                code
            }
        }
    }
}

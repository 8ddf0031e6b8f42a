//! Raw memory plumbing for the trampoline builder: page-protection toggling
//! around code writes, executable block allocation, instruction-cache flush
//! and a pre-read validity probe for target addresses.

use std::ffi::c_void;
use std::{io, ptr, slice};

use log::warn;
use once_cell::sync::Lazy;

use crate::error::HookError;

static PAGE_SIZE: Lazy<usize> =
    Lazy::new(|| unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize });

/// Page-aligned start and covering length for `len` bytes at `address`.
fn page_range(address: u64, len: usize) -> (usize, usize) {
    let page = address as usize & !(*PAGE_SIZE - 1);
    let end = address as usize + len;
    (page, end - page)
}

/// Checks that every page covering `len` bytes at `address` is mapped,
/// without reading any of them.
pub(crate) fn ensure_mapped(address: u64, len: usize) -> Result<(), HookError> {
    let (page, span) = page_range(address, len);
    let rc = unsafe { libc::msync(page as *mut c_void, span, libc::MS_ASYNC) };
    if rc != 0 {
        return Err(HookError::UnmappedAddress(address));
    }
    Ok(())
}

fn protect(address: u64, len: usize, prot: libc::c_int) -> Result<(), HookError> {
    let (page, span) = page_range(address, len);
    let rc = unsafe { libc::mprotect(page as *mut c_void, span, prot) };
    if rc != 0 {
        return Err(HookError::ProtectionChangeFailed {
            address,
            errno: io::Error::last_os_error().raw_os_error().unwrap_or(0),
        });
    }
    Ok(())
}

/// Copies `len` bytes out of live memory.
///
/// # Safety
/// The range must be mapped readable; callers validate it with
/// [`ensure_mapped`] first.
pub(crate) unsafe fn read_bytes(address: u64, len: usize) -> Vec<u8> {
    slice::from_raw_parts(address as *const u8, len).to_vec()
}

/// Overwrites code at `address`, widening the containing pages to RWX for
/// the duration of the write and restoring them to RX afterwards.
///
/// If the initial protection change fails nothing is written. The write is
/// not synchronized against other threads executing inside the patched
/// window; callers install hooks before the target becomes hot or accept
/// the race.
///
/// # Safety
/// `address` must point at `bytes.len()` bytes of mapped code.
pub(crate) unsafe fn write_code(address: u64, bytes: &[u8]) -> Result<(), HookError> {
    protect(
        address,
        bytes.len(),
        libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
    )?;
    ptr::copy_nonoverlapping(bytes.as_ptr(), address as *mut u8, bytes.len());
    flush_instruction_cache(address as *const u8, bytes.len());
    if let Err(err) = protect(address, bytes.len(), libc::PROT_READ | libc::PROT_EXEC) {
        // The code is fully written and executable at this point; a failed
        // narrowing leaves the page writable but the hook intact.
        warn!("could not restore page protection at {address:#x}: {err}");
    }
    Ok(())
}

/// An anonymous, executable memory block owning generated code.
pub(crate) struct CodeBlock {
    ptr: *mut u8,
    len: usize,
}

// The block is only ever written during construction; afterwards it is
// immutable code shared with the CPU.
unsafe impl Send for CodeBlock {}

impl CodeBlock {
    pub(crate) fn new(code: &[u8]) -> Result<CodeBlock, HookError> {
        let len = code.len().max(1);
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(HookError::AllocationFailed {
                size: len,
                errno: io::Error::last_os_error().raw_os_error().unwrap_or(0),
            });
        }
        unsafe {
            ptr::copy_nonoverlapping(code.as_ptr(), ptr as *mut u8, code.len());
            flush_instruction_cache(ptr as *const u8, code.len());
        }
        Ok(CodeBlock {
            ptr: ptr as *mut u8,
            len,
        })
    }

    pub(crate) fn address(&self) -> u64 {
        self.ptr as u64
    }
}

impl Drop for CodeBlock {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr as *mut c_void, self.len);
        }
    }
}

#[cfg(target_arch = "aarch64")]
pub(crate) fn flush_instruction_cache(addr: *const u8, len: usize) {
    // Clean data cache to the point of unification, invalidate the
    // instruction cache, then synchronize. 64-byte lines are the common
    // case; smaller lines only make the loop redundant, not wrong.
    const LINE: usize = 64;
    let start = addr as usize & !(LINE - 1);
    let end = addr as usize + len;
    unsafe {
        let mut line = start;
        while line < end {
            core::arch::asm!("dc cvau, {0}", in(reg) line, options(nostack));
            line += LINE;
        }
        core::arch::asm!("dsb ish", options(nostack));
        let mut line = start;
        while line < end {
            core::arch::asm!("ic ivau, {0}", in(reg) line, options(nostack));
            line += LINE;
        }
        core::arch::asm!("dsb ish", "isb", options(nostack));
    }
}

#[cfg(not(target_arch = "aarch64"))]
pub(crate) fn flush_instruction_cache(_addr: *const u8, _len: usize) {
    // x86 keeps instruction and data caches coherent.
}

//! Loaded-module resolver.
//!
//! Walks the process's shared-object list through `dl_iterate_phdr` and
//! answers two questions: where is a library mapped, and which library
//! contains a given address. Base addresses never change while an object
//! stays mapped, so name lookups are cached for the process lifetime
//! (unloading is not modeled).
//!
//! The iteration callback hands us raw, size-unannotated name pointers;
//! every read of one is re-derived as a bounded view and capped at
//! [`MAX_NAME_SCAN`] bytes so a missing terminator can never walk off the
//! end of mapped memory.

use std::collections::HashMap;
use std::ffi::c_void;
use std::slice;
use std::sync::Mutex;

use log::debug;
use once_cell::sync::Lazy;

const MAX_NAME_SCAN: usize = 4096;

/// A shared object mapped into the current process.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LibraryInfo {
    /// Final path component of the object's file name.
    pub name: String,
    pub base_address: u64,
}

#[derive(Clone, Debug)]
pub(crate) struct ModuleRecord {
    pub(crate) path: String,
    pub(crate) base_address: u64,
    /// Upper bound of the object's loadable segments relative to its base:
    /// max over `PT_LOAD` of `p_vaddr + p_memsz`.
    pub(crate) mapped_span: u64,
}

static BASE_CACHE: Lazy<Mutex<HashMap<String, Option<ModuleRecord>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Reads a NUL-terminated name from an unsized pointer, scanning at most
/// `MAX_NAME_SCAN` bytes.
unsafe fn bounded_name(ptr: *const libc::c_char) -> Option<String> {
    if ptr.is_null() {
        return None;
    }
    let window = slice::from_raw_parts(ptr as *const u8, MAX_NAME_SCAN);
    let len = memchr::memchr(0, window)?;
    if len == 0 {
        return None;
    }
    Some(String::from_utf8_lossy(&window[..len]).into_owned())
}

fn final_component(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

unsafe fn mapped_span(info: &libc::dl_phdr_info) -> u64 {
    let phdrs = slice::from_raw_parts(info.dlpi_phdr, info.dlpi_phnum as usize);
    phdrs
        .iter()
        .filter(|phdr| phdr.p_type == libc::PT_LOAD)
        .map(|phdr| phdr.p_vaddr as u64 + phdr.p_memsz as u64)
        .max()
        .unwrap_or(0)
}

struct NameLookup<'a> {
    target: &'a str,
    found: Option<ModuleRecord>,
}

unsafe extern "C" fn name_lookup_cb(
    info: *mut libc::dl_phdr_info,
    _size: libc::size_t,
    data: *mut c_void,
) -> libc::c_int {
    let ctx = &mut *(data as *mut NameLookup);
    let Some(path) = bounded_name((*info).dlpi_name) else {
        return 0;
    };
    if final_component(&path) != ctx.target {
        return 0;
    }
    ctx.found = Some(ModuleRecord {
        path,
        base_address: (*info).dlpi_addr as u64,
        mapped_span: mapped_span(&*info),
    });
    1 // stop iterating, first match wins
}

pub(crate) fn find_module(name: &str) -> Option<ModuleRecord> {
    if let Some(hit) = BASE_CACHE.lock().unwrap().get(name) {
        return hit.clone();
    }

    let mut ctx = NameLookup { target: name, found: None };
    unsafe {
        libc::dl_iterate_phdr(Some(name_lookup_cb), &mut ctx as *mut NameLookup as *mut c_void);
    }
    match &ctx.found {
        Some(module) => debug!(
            "{name} is {} at base {:#x} (span {:#x})",
            module.path, module.base_address, module.mapped_span
        ),
        None => debug!("{name} is not loaded"),
    }

    BASE_CACHE
        .lock()
        .unwrap()
        .entry(name.to_string())
        .or_insert(ctx.found)
        .clone()
}

/// Load base of the library whose file name is `name`, if it is mapped.
pub fn base_address_of(name: &str) -> Option<u64> {
    find_module(name).map(|module| module.base_address)
}

/// Full on-disk path of the library whose file name is `name`.
pub fn path_of(name: &str) -> Option<String> {
    find_module(name).map(|module| module.path)
}

struct AddrLookup {
    target: u64,
    best_base: u64,
    best_name: Option<String>,
}

unsafe extern "C" fn addr_lookup_cb(
    info: *mut libc::dl_phdr_info,
    _size: libc::size_t,
    data: *mut c_void,
) -> libc::c_int {
    let ctx = &mut *(data as *mut AddrLookup);
    let base = (*info).dlpi_addr as u64;
    if base == 0 || base > ctx.target {
        return 0;
    }
    // Loaded objects do not overlap, so the owner of the address is the one
    // with the largest base that still starts below it.
    if ctx.best_name.is_some() && base <= ctx.best_base {
        return 0;
    }
    ctx.best_base = base;
    ctx.best_name = Some(
        bounded_name((*info).dlpi_name)
            .map(|path| final_component(&path).to_string())
            .unwrap_or_default(),
    );
    0
}

/// Nearest-below match of `address` against the loaded-object list.
///
/// Not cached: address-to-module queries are one-off diagnostics.
pub fn module_containing(address: u64) -> Option<LibraryInfo> {
    if address == 0 {
        return None;
    }
    let mut ctx = AddrLookup { target: address, best_base: 0, best_name: None };
    unsafe {
        libc::dl_iterate_phdr(Some(addr_lookup_cb), &mut ctx as *mut AddrLookup as *mut c_void);
    }
    ctx.best_name.map(|name| LibraryInfo {
        name,
        base_address: ctx.best_base,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elf::{self, SymbolKind};
    use std::ffi::CString;
    use std::path::Path;

    fn libc_function_address(name: &str) -> u64 {
        let symbol = CString::new(name).unwrap();
        let addr = unsafe { libc::dlsym(libc::RTLD_DEFAULT, symbol.as_ptr()) };
        assert!(!addr.is_null(), "dlsym failed for {name}");
        addr as u64
    }

    #[test]
    fn unknown_library_resolves_to_none() {
        assert_eq!(base_address_of("libdoesnotexist-nativehook.so"), None);
        // negative results are cached too
        assert_eq!(base_address_of("libdoesnotexist-nativehook.so"), None);
    }

    #[test]
    fn module_containing_agrees_with_name_lookup() {
        let addr = libc_function_address("getpid");
        let library = module_containing(addr).expect("getpid has no containing module");
        assert!(library.base_address <= addr);
        assert!(!library.name.is_empty());

        assert_eq!(base_address_of(&library.name), Some(library.base_address));
    }

    #[test]
    fn module_containing_rejects_null_and_unmapped_low_addresses() {
        assert_eq!(module_containing(0), None);
    }

    #[test]
    fn symbol_table_round_trip_through_the_loaded_libc() {
        let addr = libc_function_address("getpid");
        let library = module_containing(addr).unwrap();
        let module = find_module(&library.name).unwrap();

        let symbols = elf::all_symbols(Path::new(&module.path));
        let getpid = symbols
            .iter()
            .find(|sym| sym.name == "getpid" && sym.kind == SymbolKind::Function)
            .expect("libc exports getpid");
        assert_eq!(module.base_address + getpid.relative_address, addr);
    }

    #[test]
    fn function_symbols_stay_inside_the_mapped_span() {
        let addr = libc_function_address("getpid");
        let library = module_containing(addr).unwrap();
        let module = find_module(&library.name).unwrap();

        for sym in elf::function_symbols(Path::new(&module.path)) {
            // Imported functions carry a zero value; defined ones must land
            // inside the library's loadable segments.
            if sym.relative_address != 0 {
                assert!(
                    sym.relative_address + sym.size <= module.mapped_span,
                    "{} at {:#x}+{:#x} exceeds span {:#x}",
                    sym.name,
                    sym.relative_address,
                    sym.size,
                    module.mapped_span
                );
            }
        }
    }
}

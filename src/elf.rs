//! Dynamic symbol table reader.
//!
//! Reads the `.dynsym`/`.dynstr` pair of an on-disk shared-library image and
//! turns it into [`SymbolInfo`] records. Results are cached per canonical
//! path for the lifetime of the process; a library's export table does not
//! change while it stays mapped.
//!
//! Lookup here is advisory: callers must treat "not found" uniformly whether
//! the image was absent, unreadable or malformed, so every parse failure
//! degrades to an empty symbol list instead of an error.

use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use goblin::container::{Container, Ctx};
use goblin::elf::section_header::{SHT_DYNSYM, SHT_STRTAB};
use goblin::elf::sym::{self, Symtab};
use goblin::elf::Elf;
use goblin::strtab::Strtab;
use log::{debug, warn};
use memmap2::Mmap;
use once_cell::sync::Lazy;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SymbolKind {
    Function,
    Object,
    NoType,
    Other,
}

impl SymbolKind {
    fn from_st_type(st_type: u8) -> SymbolKind {
        match st_type {
            sym::STT_FUNC => SymbolKind::Function,
            sym::STT_OBJECT => SymbolKind::Object,
            sym::STT_NOTYPE => SymbolKind::NoType,
            _ => SymbolKind::Other,
        }
    }
}

/// One entry of a library's dynamic symbol table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SymbolInfo {
    pub name: String,
    pub kind: SymbolKind,
    /// Offset of the symbol relative to the library's load base.
    pub relative_address: u64,
    pub size: u64,
}

impl SymbolInfo {
    /// Whether the name carries the Itanium C++ mangling prefix.
    pub fn is_mangled(&self) -> bool {
        self.name.starts_with("_Z")
    }
}

static SYMBOL_CACHE: Lazy<Mutex<HashMap<PathBuf, Arc<Vec<SymbolInfo>>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// All dynamic symbols exported by the image at `path`.
///
/// Returns an empty list for images without a `.dynsym`/`.dynstr` pair and
/// for images that cannot be opened or parsed.
pub fn all_symbols(path: &Path) -> Arc<Vec<SymbolInfo>> {
    let key = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    if let Some(cached) = SYMBOL_CACHE.lock().unwrap().get(&key) {
        return Arc::clone(cached);
    }

    let symbols = match parse_symbols(&key) {
        Ok(symbols) => {
            debug!("parsed {} dynamic symbols from {}", symbols.len(), key.display());
            symbols
        }
        Err(err) => {
            warn!("failed to read symbols from {}: {err}", key.display());
            Vec::new()
        }
    };

    Arc::clone(
        SYMBOL_CACHE
            .lock()
            .unwrap()
            .entry(key)
            .or_insert_with(|| Arc::new(symbols)),
    )
}

/// The subset of [`all_symbols`] classified as functions.
pub fn function_symbols(path: &Path) -> Vec<SymbolInfo> {
    all_symbols(path)
        .iter()
        .filter(|sym| sym.kind == SymbolKind::Function)
        .cloned()
        .collect()
}

fn parse_symbols(path: &Path) -> Result<Vec<SymbolInfo>, goblin::error::Error> {
    let file = File::open(path).map_err(goblin::error::Error::IO)?;
    let image = unsafe { Mmap::map(&file) }.map_err(goblin::error::Error::IO)?;
    let elf = Elf::parse(&image)?;
    if !elf.is_64 {
        // Only the 64-bit layout is supported.
        return Ok(Vec::new());
    }

    let mut dynsym = None;
    let mut dynstr = None;
    for shdr in &elf.section_headers {
        match elf.shdr_strtab.get_at(shdr.sh_name) {
            Some(".dynsym") if shdr.sh_type == SHT_DYNSYM => dynsym = Some(shdr),
            Some(".dynstr") if shdr.sh_type == SHT_STRTAB => dynstr = Some(shdr),
            _ => {}
        }
    }
    let (Some(dynsym), Some(dynstr)) = (dynsym, dynstr) else {
        return Ok(Vec::new());
    };

    let count = dynsym.sh_size as usize / sym::sym64::SIZEOF_SYM;
    let ctx = Ctx::new(Container::Big, elf.header.endianness()?);
    let symtab = Symtab::parse(&image, dynsym.sh_offset as usize, count, ctx)?;
    let strtab = Strtab::parse(&image, dynstr.sh_offset as usize, dynstr.sh_size as usize, 0)?;

    let mut symbols = Vec::with_capacity(count);
    for entry in symtab.iter() {
        // Anonymous/reserved entries carry no name.
        if entry.st_name == 0 {
            continue;
        }
        let Some(name) = strtab.get_at(entry.st_name) else {
            continue;
        };
        symbols.push(SymbolInfo {
            name: name.to_string(),
            kind: SymbolKind::from_st_type(entry.st_type()),
            relative_address: entry.st_value,
            size: entry.st_size,
        });
    }
    Ok(symbols)
}

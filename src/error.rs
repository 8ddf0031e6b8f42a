use thiserror::Error;

/// Everything that can go wrong while resolving, installing or removing a hook.
#[derive(Debug, Error)]
pub enum HookError {
    #[error("symbol `{symbol}` not found in `{library}`")]
    SymbolNotFound { library: String, symbol: String },

    #[error("library `{0}` is not loaded in this process")]
    ModuleNotFound(String),

    #[error("symbol `{symbol}` at offset {address:#x} lies outside its library's mapped span ({span:#x})")]
    AddressOutOfRange {
        symbol: String,
        address: u64,
        span: u64,
    },

    #[error("changing page protection at {address:#x} failed (errno {errno})")]
    ProtectionChangeFailed { address: u64, errno: i32 },

    #[error("no jump-code pattern for this architecture")]
    UnsupportedArchitecture,

    #[error("a hook is already installed at {0:#x}")]
    AlreadyInstalled(u64),

    #[error("no hook was installed at {0:#x}")]
    NotInstalled(u64),

    #[error("target address {0:#x} is not mapped memory")]
    UnmappedAddress(u64),

    #[error("allocating {size} bytes of executable memory failed (errno {errno})")]
    AllocationFailed { size: usize, errno: i32 },
}

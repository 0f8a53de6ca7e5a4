use thiserror::Error;

/// The `Error` type for the crate.
#[derive(Debug, Error)]
pub enum Error {
    /// The executable code arena is full and could not accept another block.
    #[error("code cache exhausted")]
    CodeCacheFull,
    /// An instruction word could not be classified.
    #[error("unknown instruction {word:#010x} at {addr:#010x}")]
    UnknownInstruction { addr: u32, word: u32 },
    /// A new MMIO window overlaps one that is already registered.
    #[error("MMIO registration at {base:#010x} overlaps an existing window")]
    MmioOverlap { base: u32 },
    /// No MMIO window is registered at the given base.
    #[error("no MMIO window registered at {base:#010x}")]
    MmioNotRegistered { base: u32 },
    /// The host refused the fastmem reservation or a page commit inside it.
    #[error("fastmem mapping failed: {0}")]
    FastmemSetup(String),
    /// A handle does not name a live kernel object.
    #[error("invalid handle {0:#010x}")]
    InvalidHandle(u32),
    /// A handle was closed twice.
    #[error("handle {0:#010x} already closed")]
    AlreadyClosed(u32),
    /// A guest memory region conflicts with an existing allocation.
    #[error("guest region at {base:#010x} conflicts with an existing allocation")]
    RegionConflict { base: u32 },
    /// The engine is shutting down and refused new work.
    #[error("engine is shutting down")]
    ShuttingDown,
    /// A persisted-state stream is malformed.
    #[error("bad save state: {0}")]
    BadSaveState(&'static str),
    /// Wraps [`std::io::Error`].
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

//! Error types for the runtime substrate

use thiserror::Error;

/// Main error type for the substrate
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("Memory error: {0}")]
    Memory(#[from] MemoryError),

    #[error("Image error: {0}")]
    Image(#[from] ImageError),

    #[error("Fault handler error: {0}")]
    Fault(#[from] FaultError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config error: {0}")]
    Config(String),
}

/// Memory-related errors
#[derive(Error, Debug)]
pub enum MemoryError {
    /// The 4 GiB guest reservation could not be obtained. Fatal: there is
    /// no guest without an address space.
    #[error("Failed to reserve guest address space (platform error {code})")]
    ReservationFailed { code: i32 },

    #[error("Failed to commit page at host 0x{addr:016x} (platform error {code})")]
    CommitFailed { addr: u64, code: i32 },

    #[error("Guest access out of bounds: 0x{addr:08x} (+{len})")]
    OutOfBounds { addr: u64, len: usize },
}

/// Errors while loading a pre-extracted guest image
#[derive(Error, Debug)]
pub enum ImageError {
    #[error("Image of {size} bytes does not fit the image region ({max} bytes)")]
    TooLarge { size: u64, max: u64 },

    #[error("Memory error: {0}")]
    Memory(#[from] MemoryError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Fault observer registration errors
#[derive(Error, Debug)]
pub enum FaultError {
    #[error("Fault observer chain is already installed")]
    AlreadyInstalled,

    #[error("Failed to register platform fault handler (platform error {code})")]
    RegistrationFailed { code: i32 },
}

/// Kind of memory access
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    Read,
    Write,
    Execute,
}

impl std::fmt::Display for AccessKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Read => write!(f, "read"),
            Self::Write => write!(f, "write"),
            Self::Execute => write!(f, "execute"),
        }
    }
}

/// Result type alias for substrate operations
pub type Result<T> = std::result::Result<T, RuntimeError>;

//! Contains all error types that can be returned by this crate.

use std::alloc;
use std::error;
use std::fmt;
use std::io;

/// Convenient `Result` type for custom errors.
pub type Result<T> = std::result::Result<T, Error>;

// -----------------------------------------------------------------------------------------------
// Errors - General
// -----------------------------------------------------------------------------------------------

/// Main error structure which is just a simple wrapper for all errors that can be returned by the
/// explorer.
///
/// Faults raised by candidate instructions inside the sandbox are *not* errors: they are returned
/// as data ([`TrapFrame`](crate::exceptions::TrapFrame),
/// [`ExecutionAttempt`](crate::oracle::ExecutionAttempt)). Everything that ends up in this enum
/// is either a setup problem or a kernel-fatal condition.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Error {
    /// Core-related errors.
    Core(CoreError),
    /// Configuration-related errors.
    Config(ConfigError),
    /// Exception-related errors.
    Exception(ExceptionError),
    /// Hypervisor-related errors.
    Hypervisor(kvm_ioctls::Error),
    /// Memory-related errors.
    Memory(MemoryError),
    /// Generic user-defined errors.
    Generic(String),
}

impl error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Core(e) => write!(f, "[Core error] {}", e),
            Error::Config(e) => write!(f, "[Config error] {}", e),
            Error::Exception(e) => write!(f, "[Exception error] {}", e),
            Error::Memory(e) => write!(f, "[Memory error] {}", e),
            Error::Hypervisor(e) => write!(f, "[Hypervisor error] {}", e),
            Error::Generic(e) => write!(f, "[Error] {}", e),
        }
    }
}

impl From<CoreError> for Error {
    fn from(error: CoreError) -> Self {
        Error::Core(error)
    }
}

impl From<ConfigError> for Error {
    fn from(error: ConfigError) -> Self {
        Error::Config(error)
    }
}

impl From<ExceptionError> for Error {
    fn from(error: ExceptionError) -> Self {
        Error::Exception(error)
    }
}

impl From<MemoryError> for Error {
    fn from(error: MemoryError) -> Self {
        Error::Memory(error)
    }
}

impl From<kvm_ioctls::Error> for Error {
    fn from(error: kvm_ioctls::Error) -> Self {
        Error::Hypervisor(error)
    }
}

impl From<alloc::LayoutError> for Error {
    fn from(error: alloc::LayoutError) -> Self {
        Error::Memory(MemoryError::LayoutError(error))
    }
}

impl From<std::fmt::Error> for Error {
    fn from(error: std::fmt::Error) -> Self {
        Error::Core(CoreError::FmtError(error))
    }
}

impl From<io::Error> for Error {
    fn from(error: io::Error) -> Self {
        Error::Core(CoreError::IoError(format!("{}", error)))
    }
}

// -----------------------------------------------------------------------------------------------
// Errors - Core
// -----------------------------------------------------------------------------------------------

/// Core-related errors.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum CoreError {
    /// A fault was taken outside of the sandbox, or without a pending continuation. Stores the
    /// title of the fatal report.
    Fatal(String),
    /// The machine is halted after a fatal fault and can't execute anything anymore.
    Halted,
    /// One of the start-up self tests failed.
    SelfTestFailed(String),
    /// A format error occured.
    FmtError(std::fmt::Error),
    /// An I/O error occured while writing the output stream or a report.
    IoError(String),
    /// User-defined core error.
    Generic(String),
}

impl error::Error for CoreError {}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoreError::Fatal(t) => write!(f, "fatal fault: {}", t),
            CoreError::Halted => write!(f, "the machine is halted"),
            CoreError::SelfTestFailed(t) => write!(f, "self test failed: {}", t),
            CoreError::FmtError(e) => write!(f, "{}", e),
            CoreError::IoError(e) => write!(f, "{}", e),
            CoreError::Generic(e) => write!(f, "{}", e),
        }
    }
}

// -----------------------------------------------------------------------------------------------
// Errors - Config
// -----------------------------------------------------------------------------------------------

/// Configuration-related errors.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ConfigError {
    /// The value given for a known key could not be parsed. Stores the key and the value.
    InvalidValue(String, String),
    /// User-defined config error.
    Generic(String),
}

impl error::Error for ConfigError {}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::InvalidValue(k, v) => write!(f, "invalid value for {}: {:?}", k, v),
            ConfigError::Generic(e) => write!(f, "{}", e),
        }
    }
}

// -----------------------------------------------------------------------------------------------
// Errors - Exception
// -----------------------------------------------------------------------------------------------

/// Exception-related errors.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ExceptionError {
    /// The vector is outside of the architectural exception range.
    InvalidVector(u64),
    /// An exception stub could not be assembled.
    Assembly(String),
    /// An exception stub is larger than its slot in the stub table.
    StubTooLarge(usize),
}

impl error::Error for ExceptionError {}

impl fmt::Display for ExceptionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExceptionError::InvalidVector(v) => write!(f, "invalid exception vector ({:#x})", v),
            ExceptionError::Assembly(e) => write!(f, "could not assemble stub: {}", e),
            ExceptionError::StubTooLarge(s) => write!(f, "exception stub too large ({:#x})", s),
        }
    }
}

// -----------------------------------------------------------------------------------------------
// Errors - Memory
// -----------------------------------------------------------------------------------------------

/// Memory-related errors.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum MemoryError {
    /// The size is invalid.
    InvalidSize(usize),
    /// Wrapper for `alloc::LayoutError`.
    LayoutError(alloc::LayoutError),
    /// The host ran out of memory while allocating guest memory.
    OutOfMemory,
    /// The operation between an address and a size resulted in an overflow.
    Overflow(u64, usize),
    /// An access fell outside of guest memory.
    OutOfBounds(u64, usize),
}

impl error::Error for MemoryError {}

impl fmt::Display for MemoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryError::InvalidSize(s) => write!(f, "invalid size: {:#x}", s),
            MemoryError::LayoutError(e) => write!(f, "layout error: {}", e),
            MemoryError::OutOfMemory => write!(f, "the allocator ran out of memory"),
            MemoryError::Overflow(a, s) => write!(f, "an overflow occured: {:#x}, {:#x}", a, s),
            MemoryError::OutOfBounds(a, s) => {
                write!(f, "access out of guest memory at {:#x} ({:#x} bytes)", a, s)
            }
        }
    }
}

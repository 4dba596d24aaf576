use thiserror::Error;

/// What exactly is wrong with a dump that failed to parse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Corruption {
    /// A read needed more bytes than the source has left.
    Truncated { needed: u64, available: u64 },
    BadMagic,
    InvalidIdSize(u32),
    UnknownSubRecord(u8),
    BadBasicType(u8),
    /// A heap record references a class that was never dumped.
    MissingClass(u64),
    /// Instance data is shorter than the class field layout requires.
    FieldOverrun { instance: u64 },
    /// The record at an indexed offset is not of the indexed kind
    UnexpectedRecord,
}

impl std::fmt::Display for Corruption {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Corruption::Truncated { needed, available } => write!(
                f,
                "truncated, needed {} bytes but only {} remain",
                needed, available
            ),
            Corruption::BadMagic => write!(f, "not a heap dump (bad magic header)"),
            Corruption::InvalidIdSize(s) => write!(f, "invalid identifier size {}", s),
            Corruption::UnknownSubRecord(t) => write!(f, "unknown heap sub-record tag 0x{:x}", t),
            Corruption::BadBasicType(t) => write!(f, "unknown basic type {}", t),
            Corruption::MissingClass(id) => write!(f, "reference to undumped class 0x{:x}", id),
            Corruption::FieldOverrun { instance } => {
                write!(f, "instance 0x{:x} is shorter than its field layout", instance)
            }
            Corruption::UnexpectedRecord => write!(f, "record does not match the index"),
        }
    }
}

#[derive(Debug, Error)]
pub enum HeapError {
    #[error("corrupt heap dump at offset {offset}: {kind}")]
    CorruptDump { offset: u64, kind: Corruption },

    #[error("unsupported heap dump version {found:?}")]
    UnsupportedVersion { found: String },

    #[error("no instance with id 0x{0:x}")]
    NoSuchInstance(u64),

    #[error("no class with id 0x{0:x}")]
    NoSuchClass(u64),

    #[error("dominators did not converge within {iterations} iterations")]
    NotConverged { iterations: u32 },

    #[error("operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl HeapError {
    pub(crate) fn corrupt(offset: u64, kind: Corruption) -> Self {
        HeapError::CorruptDump { offset, kind }
    }

    /// A copy for each waiter of a shared computation
    pub(crate) fn replicate(&self) -> HeapError {
        match self {
            HeapError::CorruptDump { offset, kind } => HeapError::CorruptDump {
                offset: *offset,
                kind: kind.clone(),
            },
            HeapError::UnsupportedVersion { found } => HeapError::UnsupportedVersion {
                found: found.clone(),
            },
            HeapError::NoSuchInstance(id) => HeapError::NoSuchInstance(*id),
            HeapError::NoSuchClass(id) => HeapError::NoSuchClass(*id),
            HeapError::NotConverged { iterations } => HeapError::NotConverged {
                iterations: *iterations,
            },
            HeapError::Cancelled => HeapError::Cancelled,
            HeapError::Io(e) => HeapError::Io(std::io::Error::new(e.kind(), e.to_string())),
        }
    }

    pub fn is_truncation(&self) -> bool {
        matches!(
            self,
            HeapError::CorruptDump {
                kind: Corruption::Truncated { .. },
                ..
            }
        )
    }
}

pub type Result<T> = std::result::Result<T, HeapError>;

pub mod error;
pub mod file;
pub mod memory;

pub use error::{CoreError, Result};
pub use file::{FileRecord, IndexStats, ScanReport, ScanWarning};
pub use memory::{
    CleanupLevel, CleanupOutcome, LimitViolations, LimitsPatch, MemoryLimits, MemoryProfile,
    MemorySnapshot,
};

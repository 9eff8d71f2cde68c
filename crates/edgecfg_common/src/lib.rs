//! edgecfg common - Shared types for the cache configuration agent v0.4
//!
//! Everything that crosses a process or file boundary lives here:
//! control-plane records, the generated config snapshot, run modes,
//! exit codes and the run metadata file.

pub mod exit_code;
pub mod metadata;
pub mod records;
pub mod run_mode;

pub use exit_code::*;
pub use metadata::*;
pub use records::*;
pub use run_mode::*;

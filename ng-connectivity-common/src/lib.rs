//! Process-level helpers shared by binaries embedding the connectivity core.
//!
//! - **Logging**: console plus optional daily-rolling file output with a runtime-adjustable level
mod logger;

pub use logger::Logger;
pub use ng_connectivity_error::{NGError, NGResult};

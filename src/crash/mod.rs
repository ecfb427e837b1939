//! Crash reporting: crash records, the panic hook and the stall watchdog.

pub mod report;
pub mod reporter;
pub mod watchdog;

pub use report::{CrashReport, ANR_TYPE};
pub use reporter::{panic_description, CrashReporter};
pub use watchdog::{StallWatchdog, STALL_CHECKS};

//! Hop execution, lease maintenance and the polling dispatcher.

mod dispatcher;
mod executor;
mod lease;

pub use dispatcher::{Dispatcher, DispatcherConfig, HopReport, TickReport};
pub use executor::{Executed, HopOutcome, Runtime};
pub use lease::{LeaseTracker, spawn_lease_heartbeat};

/// Page kinds raised by the runtime, recorded under `details.kind`.
pub mod page_kinds {
    pub use super::executor::{
        PAGE_CONFIGURATION as CONFIGURATION, PAGE_DEADLINE as DEADLINE, PAGE_FATAL as FATAL,
        PAGE_PANIC as PANIC, PAGE_RETRIES_EXHAUSTED as RETRIES_EXHAUSTED,
    };
}

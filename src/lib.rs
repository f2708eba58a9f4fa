//! Strand - durable, lease-scheduled workflow runtime.
//!
//! Workflows are progs: named tables of label handlers. Each running instance
//! is a persisted strand that workers claim under a lease, advance by one hop,
//! and release with its next state.

pub mod backends;
pub mod config;
pub mod db;
pub mod engine;
pub mod failure;
pub mod garbage_collector;
pub mod observability;
pub mod page;
pub mod prog;
pub mod runtime;
pub mod semaphore;
pub mod strand;
pub mod worker;

pub use backends::{Backend, BackendError, BackendResult, MemoryBackend, PostgresBackend};
pub use config::{Config, get_config, try_get_config};
pub use engine::{Engine, EngineError, EngineResult};
pub use failure::{HopError, RetryPolicy};
pub use observability::obs;
pub use page::Page;
pub use prog::{Directive, HopContext, Prog, ProgRegistry};
pub use runtime::{Dispatcher, DispatcherConfig, Runtime};
pub use semaphore::{Semaphore, SemaphoreKind};
pub use strand::{Frame, NewStrand, Strand, StrandId};
pub use worker::run_worker;

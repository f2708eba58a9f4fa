//! Backend implementations for strand persistence.

mod base;
mod memory;
mod postgres;

pub use base::{
    Backend, BackendError, BackendResult, GarbageCollectionResult, GarbageCollectorBackend,
    InspectionBackend, PageBackend, SemaphoreBackend, SharedBackend, StrandBackend, StrandFilter,
    Transition,
};
pub use memory::MemoryBackend;
pub use postgres::PostgresBackend;

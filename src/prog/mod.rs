//! Prog definitions: label handlers, the directives they return, and the
//! context they run against.

mod context;
mod directive;
mod registry;

pub use context::{HopContext, HopEffects};
pub use directive::{Directive, FAIL_REASON_KEY, FrameUpdate};
pub use registry::{LabelHandler, Prog, ProgBuilder, ProgRegistry, RegistryError};

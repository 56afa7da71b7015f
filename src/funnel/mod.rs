//! The sales funnel: stages, their static catalog, and the forward-only
//! transition rules.

pub mod catalog;
pub mod guard;
pub mod stage;

pub use catalog::{StageCatalog, StageDefinition};
pub use guard::{GuardVerdict, TransitionGuard};
pub use stage::Stage;

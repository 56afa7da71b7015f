pub mod base;
pub mod factory;
pub mod openai_compat;
pub mod retry;

pub use base::{ModelClient, ModelFactory};
pub use factory::{ProviderModelFactory, ProviderSpec};

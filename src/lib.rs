//! leadbot - a lead-qualification chatbot that walks prospects through a
//! five-stage sales funnel with one LLM call per turn.

pub mod agent;
pub mod config;
pub mod errors;
pub mod funnel;
pub mod providers;
pub mod store;
pub mod utils;

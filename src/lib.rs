// Library exports for stepwise
// This allows the modules to be imported in tests and external code

pub mod config;
pub mod llm;
pub mod memory;
pub mod orchestrator;
pub mod project;
pub mod workers;

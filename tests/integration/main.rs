//! Integration tests for stepwise
//!
//! These tests drive the orchestrator end to end with scripted models and
//! recording workers, exercise the provider clients against a mock HTTP
//! server, and run the built-in workers against temporary projects.

// Test utilities and common setup
mod common;

mod llm_tests;
mod orchestrator_tests;
mod worker_tests;

// Re-export common utilities for use by test modules
pub use common::*;

//! sessionlens - asynchronous multi-provider session analysis
//!
//! sessionlens accepts "analyze this session" jobs, fans each one out to
//! several AI providers, merges their partial outputs into a fixed-shape
//! report, scores its completeness, and retries only the missing fields
//! until the report is complete or the retry budget runs out.
//!
//! # Architecture
//!
//! - **commands**: CLI command implementations (init, analyze, serve, status, schema, score)
//! - **core**: Pipeline (provider clients, orchestrator, validator, retry engine, job queue, stores)
//! - **models**: Data structures (config, schema, report, job, provider results)
//! - **error**: Error types

pub mod commands;
pub mod core;
pub mod error;
pub mod models;

pub use error::{AnalyzerError, Result};

//! Core types and utilities for the market data plane
//!
//! This crate provides shared types used across all components:
//! - Price source ranking and update values
//! - Provider/pool/cache configurations
//! - Error taxonomy
//! - Wall-clock helpers (unix-seconds timestamps)

pub mod config;
pub mod errors;
pub mod types;

pub use config::*;
pub use errors::*;
pub use types::*;

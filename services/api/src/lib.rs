//! services/api/src/lib.rs
//!
//! The story service: concrete adapters for the core ports, the generation
//! worker pool and the REST layer. The binaries in `src/bin` wire these together.

pub mod adapters;
pub mod config;
pub mod error;
pub mod web;
pub mod worker;

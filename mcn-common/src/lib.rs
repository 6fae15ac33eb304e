//! # MCN Common Library
//!
//! Shared code for the MCN affiliation sync tools including:
//! - Durable key/value store (the only state shared between contexts)
//! - Dataset and cache envelope types
//! - Configuration loading and root folder resolution
//! - Utility functions

pub mod config;
pub mod dataset;
pub mod error;
pub mod store;
pub mod time;

pub use dataset::{CacheEnvelope, Dataset, Record};
pub use error::{Error, Result};
pub use store::PersistentStore;

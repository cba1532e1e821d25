//! Coordspace Common - Shared types and utilities
//!
//! This crate provides the value model, identifiers, space references,
//! configuration and the base error type used across all coordspace crates.

pub mod config;
pub mod error;
pub mod types;
pub mod value;

pub use config::SpaceConfig;
pub use error::{Error, Result};
pub use types::*;
pub use value::{Entry, OrderedFloat, Reference, Value};

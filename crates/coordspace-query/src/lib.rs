//! Coordspace Query - predicates, indices and the property value cache
//!
//! - [`Matchmaker`] / [`Query`]: predicate tree plus kind restriction and limit
//! - [`parse_query`]: small filter language compiling to a [`Query`]
//! - [`IndexManager`]: basic (hash) and extended (ordered) indices per path
//! - [`PropertyValueCache`]: two-level cache of extracted property values

pub mod error;
pub mod index;
pub mod matchmaker;
pub mod parser;
pub mod property;
pub mod property_cache;

pub use error::{QueryParseError, QueryParseResult};
pub use index::{IndexManager, IndexResult, IndexSpec, IndexType, IndexedKinds};
pub use matchmaker::{CompareOp, Matchmaker, Query};
pub use parser::parse_query;
pub use property::PropertyPath;
pub use property_cache::{CacheLookup, PropertyValueCache};

pub mod checksum;
pub mod coordinator;
pub mod domain;
pub mod engine;
pub mod error;
pub mod index;
pub mod query;
pub mod registry;
pub mod store;

pub use coordinator::{BatchOutcome, IngestionCoordinator, Rejection};
pub use engine::{Engine, EngineConfig};
pub use error::{EngineError, ErrorKind, Result};
pub use index::AggregationIndex;
pub use query::QueryEngine;
pub use store::ReadingStore;

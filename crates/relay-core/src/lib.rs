//! Core of the snowrelay Nostr relay: signature verification, durable event
//! storage with replaceable-kind semantics, filter compilation, and a
//! cache-aside query engine.

pub mod cache;
pub mod error;
pub mod event;
pub mod filter;
pub mod ingest;
pub mod message;
pub mod pool;
pub mod query;
pub mod store;
pub mod verify;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use cache::{MemoryCache, ResultCache};
pub use error::{CacheError, StoreError};
pub use event::{Event, Tag};
pub use filter::{compile, CompiledFilter, Predicate};
pub use ingest::{IngestOutcome, IngestionPipeline, Rejection};
pub use message::RelayMessage;
pub use query::{QueryEngine, QueryOptions, Subscription};
pub use store::{EventStore, StoreOptions, Stored};
pub use verify::SignatureVerifier;

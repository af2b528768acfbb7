//! `neuros-memory` – the three leaf stores behind the fusion layer.
//!
//! # Modules
//!
//! - [`record_store`] – [`RecordStore`][record_store::RecordStore] and its
//!   SQLite realisation: the authoritative home of canonical records, their
//!   provenance edges and the change feed.
//! - [`vector_index`] – [`VectorIndex`][vector_index::VectorIndex]: cosine
//!   nearest-neighbour lookup over record embeddings, version-aware.
//! - [`analytics`] – [`AnalyticalProjector`][analytics::AnalyticalProjector]:
//!   recency/frequency aggregates rebuilt from the change feed.

pub mod analytics;
pub mod record_store;
pub mod vector_index;

pub use analytics::{AnalyticalProjector, ProjectionSnapshot};
pub use record_store::{RecordStore, SqliteRecordStore, StoreCounts, StoreError};
pub use vector_index::{InMemoryVectorIndex, IndexError, VectorHit, VectorIndex};

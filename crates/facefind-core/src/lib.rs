//! facefind-core — Incremental face-encoding cache and photo retrieval.
//!
//! Keeps one embedding store per photo collection, reconciles it against the
//! subfolders a request names, matches a selfie embedding against the result
//! and exports the matching photos for the requesting user.

pub mod collection;
pub mod materialize;
pub mod matcher;
pub mod provider;
pub mod query;
pub mod scan;
pub mod store;
pub mod types;

pub use materialize::{Materialized, MaterializeError, ResultMaterializer};
pub use matcher::{EuclideanMatcher, Matcher, DEFAULT_TOLERANCE};
pub use provider::{EmbeddingProvider, ProviderError};
pub use query::{FaceFinder, QueryError, QueryOutcome, Scope};
pub use scan::{ScanCoordinator, ScanError, ScanOptions, ScanReport};
pub use store::{CorruptPolicy, EncodingStore, StoreError, SubfolderState, WorkingSet};
pub use types::{Embedding, EncodingRecord, MatchEntry, MatchResult, PhotoId};

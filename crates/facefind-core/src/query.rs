//! The request pipeline: encode selfie, reconcile scope, match, export.

use crate::collection;
use crate::materialize::{MaterializeError, ResultMaterializer};
use crate::matcher::{EuclideanMatcher, Matcher};
use crate::provider::{EmbeddingProvider, ProviderError};
use crate::scan::{ScanCoordinator, ScanError, ScanReport};
use crate::types::MatchResult;
use std::collections::BTreeSet;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum QueryError {
    #[error("selfie could not be processed: {0}")]
    Selfie(#[source] ProviderError),
    #[error("tolerance must be a finite, non-negative distance, got {0}")]
    InvalidTolerance(f32),
    #[error("selfie embedding has {actual} dimensions, store holds {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("collection root {}: {source}", path.display())]
    Collection {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Scan(#[from] ScanError),
    #[error(transparent)]
    Materialize(#[from] MaterializeError),
}

/// Subfolders a request covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    /// Every subfolder currently under the collection root.
    All,
    Subfolders(BTreeSet<String>),
}

impl Scope {
    pub fn resolve(&self, root: &Path) -> Result<BTreeSet<String>, QueryError> {
        match self {
            Scope::All => collection::list_subfolders(root).map_err(|source| QueryError::Collection {
                path: root.to_path_buf(),
                source,
            }),
            Scope::Subfolders(names) => Ok(names.clone()),
        }
    }
}

/// Non-error outcomes of a query. No face and no match are deliberately
/// separate: one means the search could not run, the other that it found nobody.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryOutcome {
    Found {
        matches: MatchResult,
        previews: Vec<PathBuf>,
        archive: PathBuf,
    },
    NoFaceDetected,
    EmptyResult,
}

pub struct FaceFinder<P, M = EuclideanMatcher> {
    coordinator: ScanCoordinator<P>,
    matcher: M,
    materializer: ResultMaterializer,
}

impl<P: EmbeddingProvider> FaceFinder<P> {
    pub fn new(coordinator: ScanCoordinator<P>, materializer: ResultMaterializer) -> Self {
        Self::with_matcher(coordinator, EuclideanMatcher, materializer)
    }
}

impl<P: EmbeddingProvider, M: Matcher> FaceFinder<P, M> {
    pub fn with_matcher(coordinator: ScanCoordinator<P>, matcher: M, materializer: ResultMaterializer) -> Self {
        Self {
            coordinator,
            matcher,
            materializer,
        }
    }

    pub fn coordinator(&self) -> &ScanCoordinator<P> {
        &self.coordinator
    }

    /// Bring the store up to date for `scope` without running a query.
    pub fn scan(&self, scope: &Scope, force_rescan: bool) -> Result<ScanReport, QueryError> {
        let scope = scope.resolve(self.coordinator.root())?;
        Ok(self.coordinator.ensure_scope(&scope, force_rescan)?.report)
    }

    /// Find every photo of the person in `selfie` and export them for `user_key`.
    pub fn run_query(
        &self,
        scope: &Scope,
        force_rescan: bool,
        selfie: &Path,
        user_key: &str,
        tolerance: f32,
    ) -> Result<QueryOutcome, QueryError> {
        if !tolerance.is_finite() || tolerance < 0.0 {
            return Err(QueryError::InvalidTolerance(tolerance));
        }

        let query = self
            .coordinator
            .with_provider(|p| p.encode_selfie(selfie))?
            .map_err(QueryError::Selfie)?;
        let Some(query) = query else {
            tracing::info!(selfie = %selfie.display(), "no face detected in selfie");
            return Ok(QueryOutcome::NoFaceDetected);
        };

        let scope = scope.resolve(self.coordinator.root())?;
        if scope.is_empty() {
            tracing::info!(root = %self.coordinator.root().display(), "collection is empty, nothing to search");
            self.materializer.clear(user_key)?;
            return Ok(QueryOutcome::EmptyResult);
        }

        let outcome = self.coordinator.ensure_scope(&scope, force_rescan)?;
        if let Some(expected) = self.coordinator.snapshot().dimension() {
            if !outcome.working_set.is_empty() && expected != query.dimension() {
                return Err(QueryError::DimensionMismatch {
                    expected,
                    actual: query.dimension(),
                });
            }
        }

        let matches = self.matcher.compare(&query, &outcome.working_set, tolerance);
        tracing::info!(
            candidates = outcome.working_set.len(),
            matched = matches.len(),
            tolerance,
            "query complete"
        );
        if matches.is_empty() {
            self.materializer.clear(user_key)?;
            return Ok(QueryOutcome::EmptyResult);
        }

        let exported = self
            .materializer
            .materialize(user_key, &matches, self.coordinator.root())?;
        Ok(QueryOutcome::Found {
            matches,
            previews: exported.previews,
            archive: exported.archive,
        })
    }
}

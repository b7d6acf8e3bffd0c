//! Reconciles a requested scope against the encoding store.
//!
//! Subfolders the store has never recorded (or every subfolder, when forced)
//! get a full pass. Subfolders already recorded get an incremental pass: the
//! directory is listed, records of photos still present are kept, vanished
//! photos are dropped, and only photos without a record are sent to the
//! provider. Photos that failed or had no face therefore get retried, and an
//! unchanged subfolder costs no inference at all.

use crate::collection::{self, PhotoFilter};
use crate::provider::{EmbeddingProvider, ProviderError};
use crate::store::{CorruptPolicy, EncodingStore, ScanSummary, StoreError, SubfolderState, WorkingSet};
use crate::types::{validate_component, Embedding, EncodingRecord, PhotoId};
use chrono::Utc;
use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ScanError {
    #[error("subfolder {subfolder:?} could not be scanned: {source}")]
    Subfolder {
        subfolder: String,
        #[source]
        source: io::Error,
    },
    #[error("invalid subfolder name {0:?}")]
    InvalidSubfolder(String),
    #[error("no embedding provider configured")]
    NoProvider,
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ScanError {
    /// Subfolder to retry, when the failure is tied to one.
    pub fn subfolder(&self) -> Option<&str> {
        match self {
            ScanError::Subfolder { subfolder, .. } => Some(subfolder),
            ScanError::InvalidSubfolder(name) => Some(name),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ScanOptions {
    pub filter: PhotoFilter,
    /// Never retry photos in which no face was detected.
    pub permanent_no_face: bool,
}

/// How one subfolder is reconciled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanMode {
    Full,
    Incremental,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SkipReason {
    NoFace,
    Unreadable(String),
    Provider(String),
    BadEmbedding(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Skip {
    pub id: PhotoId,
    pub reason: SkipReason,
}

/// What one call to [`ScanCoordinator::ensure_scope`] did.
#[derive(Debug, Clone, Default)]
pub struct ScanReport {
    /// Subfolders whose store entry was rewritten.
    pub merged: BTreeSet<String>,
    /// Provider invocations.
    pub encoded: usize,
    /// Photos whose stored faces were kept without re-encoding.
    pub reused: usize,
    pub skipped: Vec<Skip>,
}

#[derive(Debug)]
pub struct ScanOutcome {
    pub working_set: WorkingSet,
    pub report: ScanReport,
}

/// Work planned for one subfolder before any inference runs.
struct SubfolderPlan {
    name: String,
    mode: ScanMode,
    photos: Vec<String>,
    kept: Vec<EncodingRecord>,
    jobs: Vec<PhotoId>,
    /// No-face photos left alone under `permanent_no_face`.
    no_face: BTreeSet<String>,
}

/// Owns the store snapshot and the provider pool for one collection root.
///
/// Scans are serialised through the pool mutex, so two concurrent requests
/// can never merge divergent results. Readers take the current snapshot,
/// which is swapped only after a successful persist.
pub struct ScanCoordinator<P> {
    root: PathBuf,
    options: ScanOptions,
    store: RwLock<Arc<EncodingStore>>,
    workers: Mutex<Vec<P>>,
}

impl<P: EmbeddingProvider> ScanCoordinator<P> {
    /// `workers` is the provider pool; its size is the encoding parallelism.
    pub fn new(root: impl Into<PathBuf>, store: EncodingStore, workers: Vec<P>, options: ScanOptions) -> Self {
        Self {
            root: root.into(),
            options,
            store: RwLock::new(Arc::new(store)),
            workers: Mutex::new(workers),
        }
    }

    /// Load the store at `store_path` and build a coordinator over `root`.
    pub fn open(
        root: impl Into<PathBuf>,
        store_path: impl Into<PathBuf>,
        policy: CorruptPolicy,
        workers: Vec<P>,
        options: ScanOptions,
    ) -> Result<Self, StoreError> {
        let store = EncodingStore::load_with_policy(store_path, policy)?;
        Ok(Self::new(root, store, workers, options))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Current store state. Never reflects a half-applied scan.
    pub fn snapshot(&self) -> Arc<EncodingStore> {
        self.store
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn working_set(&self, scope: &BTreeSet<String>) -> WorkingSet {
        self.snapshot().working_set(scope)
    }

    /// Run `f` with one provider from the pool, waiting for any scan in flight.
    pub fn with_provider<R>(&self, f: impl FnOnce(&mut P) -> R) -> Result<R, ScanError> {
        let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
        let provider = workers.first_mut().ok_or(ScanError::NoProvider)?;
        Ok(f(provider))
    }

    /// Bring the store up to date for `scope` and return its working set.
    ///
    /// Subfolders that cannot be listed are reported as
    /// [`ScanError::Subfolder`], but only after every other subfolder in the
    /// scope has been merged and persisted.
    pub fn ensure_scope(&self, scope: &BTreeSet<String>, force: bool) -> Result<ScanOutcome, ScanError> {
        for name in scope {
            validate_component(name).map_err(|_| ScanError::InvalidSubfolder(name.clone()))?;
        }

        let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
        let base = self.snapshot();
        let mut report = ScanReport::default();

        let mut plans = Vec::new();
        let mut failure = None;
        for name in scope {
            match self.plan_subfolder(&base, name, force) {
                Ok(Some(plan)) => plans.push(plan),
                Ok(None) => tracing::debug!(subfolder = %name, "subfolder up to date"),
                Err(source) => {
                    tracing::error!(subfolder = %name, error = %source, "subfolder scan failed");
                    failure.get_or_insert(ScanError::Subfolder {
                        subfolder: name.clone(),
                        source,
                    });
                }
            }
        }

        if !plans.is_empty() {
            let jobs: Vec<PhotoId> = plans.iter().flat_map(|p| p.jobs.iter().cloned()).collect();
            if !jobs.is_empty() && workers.is_empty() {
                return Err(ScanError::NoProvider);
            }
            report.encoded = jobs.len();
            let results = encode_batch(&mut workers, &self.root, jobs);

            let expected_dim = expected_dimension(&base, &plans, &results);
            let (records, summaries) = self.collect(plans, results, expected_dim, &mut report);

            let mut next = (*base).clone();
            next.merge(records, summaries)?;
            next.persist()?;
            *self.store.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(next);
        }

        tracing::info!(
            scope = scope.len(),
            merged = report.merged.len(),
            encoded = report.encoded,
            reused = report.reused,
            skipped = report.skipped.len(),
            "scope reconciled"
        );

        if let Some(err) = failure {
            return Err(err);
        }
        Ok(ScanOutcome {
            working_set: self.working_set(scope),
            report,
        })
    }

    /// Decide what a subfolder needs. `None` means nothing changed.
    fn plan_subfolder(&self, base: &EncodingStore, name: &str, force: bool) -> io::Result<Option<SubfolderPlan>> {
        let photos = collection::list_photos(&self.root, name, &self.options.filter)?;
        let summary = match base.subfolder_state(name) {
            SubfolderState::Scanned(summary) if !force => summary,
            _ => {
                tracing::info!(subfolder = name, photos = photos.len(), force, "full scan");
                let jobs = photos
                    .iter()
                    .filter_map(|p| PhotoId::new(name, p.as_str()).ok())
                    .collect();
                return Ok(Some(SubfolderPlan {
                    name: name.to_string(),
                    mode: ScanMode::Full,
                    photos,
                    kept: Vec::new(),
                    jobs,
                    no_face: BTreeSet::new(),
                }));
            }
        };

        let present: BTreeSet<&str> = photos.iter().map(String::as_str).collect();
        let mut stored: BTreeMap<&str, &[Embedding]> = BTreeMap::new();
        let mut vanished = 0usize;
        for (id, faces) in base.records_in(name) {
            if present.contains(id.file_name()) {
                stored.insert(id.file_name(), faces);
            } else {
                vanished += 1;
            }
        }

        let mut kept = Vec::new();
        let mut jobs = Vec::new();
        let mut no_face = BTreeSet::new();
        for photo in &photos {
            let Ok(id) = PhotoId::new(name, photo.as_str()) else {
                continue;
            };
            if let Some(faces) = stored.get(photo.as_str()) {
                kept.extend(faces.iter().map(|e| EncodingRecord {
                    id: id.clone(),
                    embedding: e.clone(),
                }));
            } else if self.options.permanent_no_face && summary.no_face.contains(photo) {
                no_face.insert(photo.clone());
            } else {
                jobs.push(id);
            }
        }

        if jobs.is_empty() && vanished == 0 && summary.photos == photos.len() {
            return Ok(None);
        }
        tracing::info!(
            subfolder = name,
            photos = photos.len(),
            to_encode = jobs.len(),
            vanished,
            "incremental scan"
        );
        Ok(Some(SubfolderPlan {
            name: name.to_string(),
            mode: ScanMode::Incremental,
            photos,
            kept,
            jobs,
            no_face,
        }))
    }

    /// Turn provider results into records and per-subfolder summaries.
    fn collect(
        &self,
        plans: Vec<SubfolderPlan>,
        mut results: BTreeMap<PhotoId, Result<Vec<Embedding>, ProviderError>>,
        expected_dim: Option<usize>,
        report: &mut ScanReport,
    ) -> (Vec<EncodingRecord>, BTreeMap<String, ScanSummary>) {
        let now = Utc::now();
        let mut records = Vec::new();
        let mut summaries = BTreeMap::new();

        for plan in plans {
            let mut summary = ScanSummary {
                scanned_at: now,
                photos: plan.photos.len(),
                failed: BTreeSet::new(),
                no_face: plan.no_face,
            };
            report.reused += plan.kept.iter().map(|r| &r.id).collect::<BTreeSet<_>>().len();
            records.extend(plan.kept);

            for id in plan.jobs {
                let result = results
                    .remove(&id)
                    .unwrap_or_else(|| Err(ProviderError::Inference("no result from worker".into())));
                let reason = match result {
                    Ok(faces) if faces.is_empty() => SkipReason::NoFace,
                    Ok(faces) => match check_faces(&faces, expected_dim) {
                        Ok(()) => {
                            tracing::debug!(%id, faces = faces.len(), "encoded");
                            records.extend(faces.into_iter().map(|embedding| EncodingRecord {
                                id: id.clone(),
                                embedding,
                            }));
                            continue;
                        }
                        Err(why) => SkipReason::BadEmbedding(why),
                    },
                    Err(ProviderError::UnreadableImage { reason, .. }) => SkipReason::Unreadable(reason),
                    Err(e) => SkipReason::Provider(e.to_string()),
                };

                let file = id.file_name().to_string();
                if reason == SkipReason::NoFace {
                    tracing::info!(%id, "no face detected");
                    summary.no_face.insert(file);
                } else {
                    tracing::warn!(%id, reason = ?reason, "photo skipped, will retry on next scan");
                    summary.failed.insert(file);
                }
                report.skipped.push(Skip { id, reason });
            }

            tracing::info!(
                subfolder = %plan.name,
                mode = ?plan.mode,
                photos = summary.photos,
                failed = summary.failed.len(),
                no_face = summary.no_face.len(),
                "subfolder scanned"
            );
            report.merged.insert(plan.name.clone());
            summaries.insert(plan.name, summary);
        }

        (records, summaries)
    }
}

fn check_faces(faces: &[Embedding], expected: Option<usize>) -> Result<(), String> {
    let dim = expected.unwrap_or(faces[0].dimension());
    for face in faces {
        if face.dimension() != dim || dim == 0 {
            return Err(format!("embedding has {} dimensions, expected {dim}", face.dimension()));
        }
        if !face.is_finite() {
            return Err("embedding contains non-finite values".into());
        }
    }
    Ok(())
}

/// Dimension every new record must have: that of the records surviving the
/// merge, or else of the first successful encoding.
fn expected_dimension(
    base: &EncodingStore,
    plans: &[SubfolderPlan],
    results: &BTreeMap<PhotoId, Result<Vec<Embedding>, ProviderError>>,
) -> Option<usize> {
    let touched: BTreeSet<&str> = plans.iter().map(|p| p.name.as_str()).collect();
    let untouched_kept = base
        .scanned_subfolders()
        .filter(|(name, _)| !touched.contains(name))
        .find_map(|(name, _)| base.records_in(name).find_map(|(_, faces)| faces.first().map(Embedding::dimension)));
    untouched_kept
        .or_else(|| plans.iter().find_map(|p| p.kept.first().map(|r| r.embedding.dimension())))
        .or_else(|| {
            results
                .values()
                .find_map(|r| r.as_ref().ok().and_then(|faces| faces.first()).map(Embedding::dimension))
        })
}

/// Encode `jobs` across the provider pool. Result order is independent of
/// which worker finished first.
fn encode_batch<P: EmbeddingProvider>(
    workers: &mut [P],
    root: &Path,
    jobs: Vec<PhotoId>,
) -> BTreeMap<PhotoId, Result<Vec<Embedding>, ProviderError>> {
    if jobs.is_empty() {
        return BTreeMap::new();
    }
    let parallelism = workers.len().min(jobs.len());
    let (job_tx, job_rx) = crossbeam_channel::unbounded::<PhotoId>();
    for id in jobs {
        let _ = job_tx.send(id);
    }
    drop(job_tx);

    let (result_tx, result_rx) = crossbeam_channel::unbounded();
    std::thread::scope(|s| {
        for provider in workers.iter_mut().take(parallelism) {
            let job_rx = job_rx.clone();
            let result_tx = result_tx.clone();
            s.spawn(move || {
                for id in job_rx.iter() {
                    let result = provider.detect_and_encode(&id.source_path(root));
                    if result_tx.send((id, result)).is_err() {
                        break;
                    }
                }
            });
        }
    });
    drop(result_tx);
    result_rx.iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Reads the "embedding" out of the file: comma-separated floats, one face
    /// per line. `noface` means no face, `broken` means unreadable.
    struct ScriptedProvider {
        calls: Arc<AtomicUsize>,
    }

    impl EmbeddingProvider for ScriptedProvider {
        fn detect_and_encode(&mut self, image: &Path) -> Result<Vec<Embedding>, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let text = fs::read_to_string(image).map_err(|e| ProviderError::UnreadableImage {
                path: image.to_path_buf(),
                reason: e.to_string(),
            })?;
            match text.trim() {
                "noface" => Ok(Vec::new()),
                "broken" => Err(ProviderError::UnreadableImage {
                    path: image.to_path_buf(),
                    reason: "truncated".into(),
                }),
                body => Ok(body
                    .lines()
                    .map(|l| Embedding::new(l.split(',').map(|v| v.trim().parse().unwrap()).collect()))
                    .collect()),
            }
        }
    }

    struct Fixture {
        dir: tempfile::TempDir,
        calls: Arc<AtomicUsize>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                dir: tempfile::tempdir().unwrap(),
                calls: Arc::new(AtomicUsize::new(0)),
            }
        }

        fn root(&self) -> PathBuf {
            self.dir.path().join("photos")
        }

        fn photo(&self, id: &str, content: &str) {
            let path = self.root().join(id);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, content).unwrap();
        }

        fn coordinator(&self, workers: usize, options: ScanOptions) -> ScanCoordinator<ScriptedProvider> {
            let providers = (0..workers)
                .map(|_| ScriptedProvider { calls: self.calls.clone() })
                .collect();
            ScanCoordinator::open(
                self.root(),
                self.dir.path().join("enc.json"),
                CorruptPolicy::Abort,
                providers,
                options,
            )
            .unwrap()
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    fn scope(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    fn id(s: &str) -> PhotoId {
        s.parse().unwrap()
    }

    #[test]
    fn test_second_unforced_scan_does_no_inference() {
        let fx = Fixture::new();
        fx.photo("A/1.jpg", "1,0");
        fx.photo("A/2.jpg", "0,1");
        let coord = fx.coordinator(2, ScanOptions::default());

        let first = coord.ensure_scope(&scope(&["A"]), false).unwrap();
        assert_eq!(fx.calls(), 2);
        let second = coord.ensure_scope(&scope(&["A"]), false).unwrap();
        assert_eq!(fx.calls(), 2);
        assert_eq!(second.report.encoded, 0);
        assert!(second.report.merged.is_empty());
        assert_eq!(first.working_set, second.working_set);
    }

    #[test]
    fn test_scanning_b_leaves_a_untouched() {
        let fx = Fixture::new();
        fx.photo("A/1.jpg", "1,0");
        fx.photo("B/3.jpg", "0,1");
        let coord = fx.coordinator(1, ScanOptions::default());

        let a_before = coord.ensure_scope(&scope(&["A"]), false).unwrap().working_set;
        coord.ensure_scope(&scope(&["B"]), true).unwrap();
        assert_eq!(coord.working_set(&scope(&["A"])), a_before);
        assert_eq!(coord.working_set(&scope(&["A", "B"])).len(), 2);
    }

    #[test]
    fn test_force_rescan_honours_deletion() {
        let fx = Fixture::new();
        fx.photo("A/1.jpg", "1,0");
        fx.photo("A/2.jpg", "0,1");
        let coord = fx.coordinator(1, ScanOptions::default());
        coord.ensure_scope(&scope(&["A"]), false).unwrap();

        fs::remove_file(fx.root().join("A/2.jpg")).unwrap();
        let outcome = coord.ensure_scope(&scope(&["A"]), true).unwrap();
        assert!(outcome.working_set.get(&id("A/2.jpg")).is_none());
        assert_eq!(outcome.report.encoded, 1);

        let reloaded = EncodingStore::load(fx.dir.path().join("enc.json")).unwrap();
        assert_eq!(reloaded.photo_count(), 1);
    }

    #[test]
    fn test_incremental_scan_picks_up_new_and_drops_vanished() {
        let fx = Fixture::new();
        fx.photo("A/1.jpg", "1,0");
        fx.photo("A/2.jpg", "0,1");
        let coord = fx.coordinator(1, ScanOptions::default());
        coord.ensure_scope(&scope(&["A"]), false).unwrap();

        fs::remove_file(fx.root().join("A/1.jpg")).unwrap();
        fx.photo("A/3.jpg", "1,1");
        let outcome = coord.ensure_scope(&scope(&["A"]), false).unwrap();
        assert_eq!(outcome.report.encoded, 1);
        assert_eq!(outcome.report.reused, 1);
        assert!(outcome.working_set.get(&id("A/1.jpg")).is_none());
        assert!(outcome.working_set.get(&id("A/3.jpg")).is_some());
        assert_eq!(fx.calls(), 3);
    }

    #[test]
    fn test_failed_photo_retried_until_success() {
        let fx = Fixture::new();
        fx.photo("A/1.jpg", "1,0");
        fx.photo("A/bad.jpg", "broken");
        let coord = fx.coordinator(1, ScanOptions::default());

        let first = coord.ensure_scope(&scope(&["A"]), false).unwrap();
        assert!(first.working_set.get(&id("A/bad.jpg")).is_none());
        assert!(matches!(first.report.skipped[0].reason, SkipReason::Unreadable(_)));

        let second = coord.ensure_scope(&scope(&["A"]), false).unwrap();
        assert_eq!(second.report.encoded, 1);
        assert!(second.working_set.get(&id("A/bad.jpg")).is_none());

        fx.photo("A/bad.jpg", "0,1");
        let third = coord.ensure_scope(&scope(&["A"]), false).unwrap();
        assert!(third.working_set.get(&id("A/bad.jpg")).is_some());
        assert!(third.report.skipped.is_empty());
        match coord.snapshot().subfolder_state("A") {
            SubfolderState::Scanned(s) => assert!(s.failed.is_empty()),
            SubfolderState::Unscanned => panic!("A should be scanned"),
        }

        let fourth = coord.ensure_scope(&scope(&["A"]), false).unwrap();
        assert_eq!(fourth.report.encoded, 0);
    }

    #[test]
    fn test_no_face_retried_unless_permanent() {
        let fx = Fixture::new();
        fx.photo("A/crowd.jpg", "noface");

        let coord = fx.coordinator(1, ScanOptions::default());
        coord.ensure_scope(&scope(&["A"]), false).unwrap();
        coord.ensure_scope(&scope(&["A"]), false).unwrap();
        assert_eq!(fx.calls(), 2);

        let options = ScanOptions {
            permanent_no_face: true,
            ..ScanOptions::default()
        };
        let coord = fx.coordinator(1, options);
        let outcome = coord.ensure_scope(&scope(&["A"]), false).unwrap();
        assert_eq!(outcome.report.encoded, 0);
        assert_eq!(fx.calls(), 2);
    }

    #[test]
    fn test_permanent_no_face_survives_incremental_scan() {
        let fx = Fixture::new();
        fx.photo("A/crowd.jpg", "noface");
        let options = ScanOptions {
            permanent_no_face: true,
            ..ScanOptions::default()
        };
        let coord = fx.coordinator(1, options);
        coord.ensure_scope(&scope(&["A"]), false).unwrap();

        fx.photo("A/new.jpg", "1,0");
        coord.ensure_scope(&scope(&["A"]), false).unwrap();
        assert_eq!(fx.calls(), 2);
        match coord.snapshot().subfolder_state("A") {
            SubfolderState::Scanned(s) => assert!(s.no_face.contains("crowd.jpg")),
            SubfolderState::Unscanned => panic!("A should be scanned"),
        }

        fx.photo("A/newer.jpg", "0,1");
        coord.ensure_scope(&scope(&["A"]), false).unwrap();
        assert_eq!(fx.calls(), 3);
    }

    #[test]
    fn test_multiple_faces_become_multiple_records() {
        let fx = Fixture::new();
        fx.photo("A/group.jpg", "1,0\n0,1\n1,1");
        let coord = fx.coordinator(1, ScanOptions::default());
        let outcome = coord.ensure_scope(&scope(&["A"]), false).unwrap();
        assert_eq!(outcome.working_set.get(&id("A/group.jpg")).unwrap().len(), 3);
    }

    #[cfg(unix)]
    #[test]
    fn test_dangling_symlink_does_not_fail_subfolder() {
        let fx = Fixture::new();
        fx.photo("A/1.jpg", "1,0");
        std::os::unix::fs::symlink(fx.root().join("A/missing.jpg"), fx.root().join("A/link.jpg")).unwrap();
        let coord = fx.coordinator(1, ScanOptions::default());

        let outcome = coord.ensure_scope(&scope(&["A"]), false).unwrap();
        assert!(outcome.working_set.get(&id("A/1.jpg")).is_some());
        assert_eq!(outcome.report.encoded, 1);
        assert!(matches!(coord.snapshot().subfolder_state("A"), SubfolderState::Scanned(_)));
    }

    /// Tracks how many `detect_and_encode` calls are running at once.
    struct GaugedProvider {
        in_flight: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
        calls: Arc<AtomicUsize>,
    }

    impl EmbeddingProvider for GaugedProvider {
        fn detect_and_encode(&mut self, _image: &Path) -> Result<Vec<Embedding>, ProviderError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            self.calls.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(std::time::Duration::from_millis(2));
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(vec![Embedding::new(vec![1.0, 0.0])])
        }
    }

    #[test]
    fn test_concurrent_forced_scans_are_serialised() {
        let fx = Fixture::new();
        for i in 0..30 {
            fx.photo(&format!("A/{i:02}.jpg"), "1,0");
        }
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let calls = Arc::new(AtomicUsize::new(0));
        let pool = 2;
        let providers = (0..pool)
            .map(|_| GaugedProvider {
                in_flight: in_flight.clone(),
                peak: peak.clone(),
                calls: calls.clone(),
            })
            .collect();
        let coord = ScanCoordinator::open(
            fx.root(),
            fx.dir.path().join("enc.json"),
            CorruptPolicy::Abort,
            providers,
            ScanOptions::default(),
        )
        .unwrap();

        let (a, b) = std::thread::scope(|s| {
            let a = s.spawn(|| coord.ensure_scope(&scope(&["A"]), true));
            let b = s.spawn(|| coord.ensure_scope(&scope(&["A"]), true));
            (a.join().unwrap(), b.join().unwrap())
        });
        let (a, b) = (a.unwrap(), b.unwrap());

        // Both scans did their full share of work, but never at the same time.
        assert_eq!(calls.load(Ordering::SeqCst), 60);
        assert!(peak.load(Ordering::SeqCst) <= pool);
        assert_eq!(a.working_set.len(), 30);
        assert_eq!(a.working_set, b.working_set);

        let reloaded = EncodingStore::load(fx.dir.path().join("enc.json")).unwrap();
        assert_eq!(reloaded.photo_count(), 30);
        assert_eq!(reloaded.face_count(), 30);
    }

    #[test]
    fn test_wrong_dimension_is_skipped() {
        let fx = Fixture::new();
        fx.photo("A/1.jpg", "1,0");
        let coord = fx.coordinator(1, ScanOptions::default());
        coord.ensure_scope(&scope(&["A"]), false).unwrap();

        fx.photo("B/odd.jpg", "1,0,0");
        let outcome = coord.ensure_scope(&scope(&["B"]), false).unwrap();
        assert!(outcome.working_set.is_empty());
        assert!(matches!(outcome.report.skipped[0].reason, SkipReason::BadEmbedding(_)));
    }

    #[test]
    fn test_missing_subfolder_reported_after_others_merge() {
        let fx = Fixture::new();
        fx.photo("A/1.jpg", "1,0");
        let coord = fx.coordinator(1, ScanOptions::default());

        let err = coord.ensure_scope(&scope(&["A", "Z"]), false).err().unwrap();
        assert_eq!(err.subfolder(), Some("Z"));
        assert!(matches!(coord.snapshot().subfolder_state("A"), SubfolderState::Scanned(_)));
        assert_eq!(coord.snapshot().subfolder_state("Z"), SubfolderState::Unscanned);
    }

    #[test]
    fn test_invalid_subfolder_name() {
        let fx = Fixture::new();
        let coord = fx.coordinator(1, ScanOptions::default());
        let err = coord.ensure_scope(&scope(&["../etc"]), false).err().unwrap();
        assert!(matches!(err, ScanError::InvalidSubfolder(_)));
    }

    #[test]
    fn test_parallel_scan_matches_serial_scan() {
        let serial = Fixture::new();
        let parallel = Fixture::new();
        for i in 0..20 {
            let content = format!("{i},{}", 20 - i);
            serial.photo(&format!("A/{i:02}.jpg"), &content);
            parallel.photo(&format!("A/{i:02}.jpg"), &content);
        }
        let a = serial.coordinator(1, ScanOptions::default()).ensure_scope(&scope(&["A"]), false).unwrap();
        let b = parallel.coordinator(4, ScanOptions::default()).ensure_scope(&scope(&["A"]), false).unwrap();
        assert_eq!(a.working_set, b.working_set);
    }

    #[test]
    fn test_empty_pool_with_work_is_an_error() {
        let fx = Fixture::new();
        fx.photo("A/1.jpg", "1,0");
        let coord = fx.coordinator(0, ScanOptions::default());
        assert!(matches!(coord.ensure_scope(&scope(&["A"]), false), Err(ScanError::NoProvider)));
    }
}

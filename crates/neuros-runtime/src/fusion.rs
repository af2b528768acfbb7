//! Memory Fusion coordinator.
//!
//! One canonical record per piece of knowledge, three representations:
//!
//! | view        | backing                   | consistency                |
//! |-------------|---------------------------|----------------------------|
//! | structured  | [`RecordStore`]           | authoritative, synchronous |
//! | vector      | [`VectorIndex`]           | eventual, via fanout       |
//! | analytical  | [`AnalyticalProjector`]   | eventual, via change feed  |
//!
//! ## Write path
//!
//! `write` commits to the record store (the durability point) and returns.
//! Embedding and projection are queued on an mpsc channel; a dispatcher
//! spawns one task per job, so slow embeddings never hold up writers or
//! each other. Failed jobs retry with exponential backoff; an embedding that
//! exhausts its attempts marks the record `degraded`, which leaves it
//! queryable structurally but absent from similarity results.
//!
//! `update` and `delete` evict the superseded vector synchronously before
//! returning. An embedding job that finishes after its record moved on is
//! discarded: the store only attaches an embedding for the current content
//! version, and the index copy is removed again if the version changed
//! between attach and upsert.
//!
//! ## Query path
//!
//! `hybrid_query` runs the three legs concurrently, each under its own
//! timeout. A failed or timed-out leg is dropped and the result flagged
//! `degraded`. The fused score is the weighted sum of the leg scores under
//! the current parameter snapshot; ties order by ascending id. A vector hit
//! only counts when its content version matches the structured row, so a
//! query racing an update never scores the new row with the old vector.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use neuros_memory::{AnalyticalProjector, RecordStore, StoreError, VectorHit, VectorIndex};
use neuros_types::{
    Content, Context, Embedding, Filter, MemoryRecord, NeurosError, NewRecord, ParameterSnapshot,
    QueryResult, RecordId, RecordPatch, ScoreBreakdown, ScoredRecord, Source,
};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex as AsyncMutex, Notify, mpsc, watch};
use tokio::time::{error::Elapsed, timeout};
use tracing::{debug, info, warn};

use crate::config::NeurosConfig;
use crate::embedding::{EmbeddingProvider, tokenize};

const PROJECTION_BATCH: usize = 512;

// ─────────────────────────────────────────────────────────────────────────────
// Settings and reports
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct FusionSettings {
    /// Minimum number of nearest neighbours fetched per query.
    pub candidate_pool: usize,
    pub leg_timeout: Duration,
    /// Lag beyond which hits carry an as-of marker.
    pub staleness: Duration,
    pub fanout_attempts: u32,
    /// Delay before the second attempt; doubles each retry.
    pub fanout_backoff: Duration,
    /// Per-attempt limit for one embedding or projection job.
    pub fanout_timeout: Duration,
    pub tombstone_grace: chrono::Duration,
}

impl Default for FusionSettings {
    fn default() -> Self {
        Self::from(&NeurosConfig::in_memory())
    }
}

impl From<&NeurosConfig> for FusionSettings {
    fn from(cfg: &NeurosConfig) -> Self {
        Self {
            candidate_pool: cfg.candidate_pool,
            leg_timeout: cfg.leg_timeout(),
            staleness: cfg.staleness(),
            fanout_attempts: cfg.fanout_attempts,
            fanout_backoff: cfg.fanout_backoff(),
            fanout_timeout: cfg.embedding_timeout(),
            tombstone_grace: cfg.tombstone_grace(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FusionStats {
    pub live: u64,
    pub tombstoned: u64,
    pub degraded: u64,
    /// Live records without a current embedding.
    pub pending_embeddings: u64,
    /// Vectors held by the index.
    pub indexed: usize,
    /// Fanout jobs queued or running.
    pub pending_fanout: usize,
    pub projector_watermark: u64,
    pub latest_change: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileReport {
    /// Stored embeddings loaded straight into the index.
    pub loaded: usize,
    /// Records queued for (re-)embedding.
    pub requeued: usize,
}

// ─────────────────────────────────────────────────────────────────────────────
// Internals
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
enum FanoutJob {
    Embed { id: RecordId, version: u64 },
    Project,
}

#[derive(Debug)]
enum EmbedOutcome {
    Indexed,
    Superseded,
}

struct AnalyticalView {
    scores: BTreeMap<RecordId, f32>,
    as_of: Option<DateTime<Utc>>,
    oldest_unapplied: Option<DateTime<Utc>>,
}

/// Run a synchronous store call on the blocking pool.
async fn blocking<T, E, F>(f: F) -> Result<T, NeurosError>
where
    F: FnOnce() -> Result<T, E> + Send + 'static,
    T: Send + 'static,
    E: Into<NeurosError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| NeurosError::Storage(format!("blocking task failed: {e}")))?
        .map_err(Into::into)
}

fn lexical_score(record: &MemoryRecord, terms: &BTreeSet<String>) -> f32 {
    if terms.is_empty() {
        return 1.0;
    }
    let mut words: BTreeSet<String> = tokenize(&record.content.payload).into_iter().collect();
    for tag in record.tags() {
        words.extend(tokenize(&tag));
    }
    let matched = terms.iter().filter(|t| words.contains(*t)).count();
    matched as f32 / terms.len() as f32
}

fn settle<T>(
    leg: Source,
    outcome: Result<Result<T, NeurosError>, Elapsed>,
    dropped: &mut Vec<Source>,
) -> Option<T> {
    match outcome {
        Ok(Ok(value)) => Some(value),
        Ok(Err(e)) => {
            warn!(leg = %leg, error = %e, "query leg failed, dropping it");
            dropped.push(leg);
            None
        }
        Err(_) => {
            warn!(leg = %leg, error = %NeurosError::QueryLegTimeout(leg), "dropping query leg");
            dropped.push(leg);
            None
        }
    }
}

struct Shared {
    store: Arc<dyn RecordStore>,
    index: Arc<dyn VectorIndex>,
    projector: Arc<AnalyticalProjector>,
    embedder: Arc<dyn EmbeddingProvider>,
    params: watch::Receiver<Arc<ParameterSnapshot>>,
    settings: FusionSettings,
    pending: AtomicUsize,
    idle: Notify,
    /// Embeddings not yet acknowledged: record → (content version, first queued).
    unembedded: Mutex<BTreeMap<RecordId, (u64, DateTime<Utc>)>>,
    projection: AsyncMutex<()>,
}

impl Shared {
    fn unembedded(&self) -> MutexGuard<'_, BTreeMap<RecordId, (u64, DateTime<Utc>)>> {
        self.unembedded.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn job_done(&self) {
        if self.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        self.settings
            .fanout_backoff
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
    }

    async fn run(&self, job: FanoutJob) {
        match job {
            FanoutJob::Embed { id, version } => {
                self.embed(id, version).await;
                let mut unembedded = self.unembedded();
                if unembedded.get(&id).is_some_and(|(v, _)| *v == version) {
                    unembedded.remove(&id);
                }
            }
            FanoutJob::Project => self.project().await,
        }
    }

    async fn embed(&self, id: RecordId, version: u64) {
        let attempts = self.settings.fanout_attempts.max(1);
        for attempt in 1..=attempts {
            match self.try_embed(id, version).await {
                Ok(outcome) => {
                    debug!(record = %id, version, ?outcome, "embedding fanout acknowledged");
                    return;
                }
                Err(e) => warn!(record = %id, version, attempt, error = %e, "embedding fanout failed"),
            }
            if attempt < attempts {
                tokio::time::sleep(self.backoff(attempt)).await;
            }
        }

        let store = self.store.clone();
        match blocking(move || store.mark_degraded(id, version)).await {
            Ok(true) => warn!(record = %id, version, attempts, "embedding degraded after retries"),
            Ok(false) => debug!(record = %id, version, "record moved on before degradation"),
            Err(e) => warn!(record = %id, error = %e, "could not mark embedding degraded"),
        }
    }

    async fn try_embed(&self, id: RecordId, version: u64) -> Result<EmbedOutcome, NeurosError> {
        let store = self.store.clone();
        let Some(record) = blocking(move || store.get(id)).await? else {
            return Ok(EmbedOutcome::Superseded);
        };
        if record.version != version {
            return Ok(EmbedOutcome::Superseded);
        }

        let vector = timeout(
            self.settings.fanout_timeout,
            self.embedder.embed(&record.content.payload),
        )
        .await
        .map_err(|_| NeurosError::EmbeddingTimeout(id))?
        .map_err(|e| NeurosError::Storage(format!("embedding provider: {e}")))?;
        let embedding = Embedding {
            vector,
            model_version: self.embedder.model_version().to_string(),
            content_version: version,
        };

        let store = self.store.clone();
        let attached = embedding.clone();
        if !blocking(move || store.attach_embedding(id, &attached)).await? {
            return Ok(EmbedOutcome::Superseded);
        }
        self.index.upsert(id, &embedding)?;

        // The record may have changed between attach and upsert.
        let store = self.store.clone();
        let current = blocking(move || store.get(id)).await?;
        if current.is_none_or(|r| r.version != version) {
            self.index.remove_if_version(id, version);
            return Ok(EmbedOutcome::Superseded);
        }
        Ok(EmbedOutcome::Indexed)
    }

    async fn project(&self) {
        let _serial = self.projection.lock().await;
        let attempts = self.settings.fanout_attempts.max(1);
        for attempt in 1..=attempts {
            match timeout(self.settings.fanout_timeout, self.pump()).await {
                Ok(Ok(applied)) => {
                    if applied > 0 {
                        debug!(applied, watermark = self.projector.watermark(), "projection advanced");
                    }
                    return;
                }
                Ok(Err(e)) => warn!(attempt, error = %e, "projection fanout failed"),
                Err(_) => warn!(
                    attempt,
                    error = %NeurosError::ProjectionTimeout(self.projector.watermark()),
                    "projection fanout timed out"
                ),
            }
            if attempt < attempts {
                tokio::time::sleep(self.backoff(attempt)).await;
            }
        }
        warn!(
            watermark = self.projector.watermark(),
            "projection lagging, next fanout resumes from the watermark"
        );
    }

    async fn pump(&self) -> Result<usize, NeurosError> {
        let mut applied = 0;
        loop {
            let store = self.store.clone();
            let after = self.projector.watermark();
            let events = blocking(move || store.changes_since(after, PROJECTION_BATCH)).await?;
            if events.is_empty() {
                return Ok(applied);
            }
            applied += self.projector.apply(&events);
        }
    }

    async fn vector_leg(&self, text: &str, m: usize) -> Result<Vec<VectorHit>, NeurosError> {
        let query = self
            .embedder
            .embed(text)
            .await
            .map_err(|e| NeurosError::Storage(format!("embedding provider: {e}")))?;
        Ok(self.index.search(&query, self.embedder.model_version(), m)?)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// FusionCoordinator
// ─────────────────────────────────────────────────────────────────────────────

pub struct FusionCoordinator {
    shared: Arc<Shared>,
    fanout: mpsc::UnboundedSender<FanoutJob>,
}

impl FusionCoordinator {
    /// Wire the stores together and start the fanout dispatcher on the
    /// current Tokio runtime.
    pub fn new(
        store: Arc<dyn RecordStore>,
        index: Arc<dyn VectorIndex>,
        projector: Arc<AnalyticalProjector>,
        embedder: Arc<dyn EmbeddingProvider>,
        params: watch::Receiver<Arc<ParameterSnapshot>>,
        settings: FusionSettings,
    ) -> Self {
        let shared = Arc::new(Shared {
            store,
            index,
            projector,
            embedder,
            params,
            settings,
            pending: AtomicUsize::new(0),
            idle: Notify::new(),
            unembedded: Mutex::new(BTreeMap::new()),
            projection: AsyncMutex::new(()),
        });

        let (fanout, mut jobs) = mpsc::unbounded_channel::<FanoutJob>();
        let dispatcher = shared.clone();
        tokio::spawn(async move {
            while let Some(job) = jobs.recv().await {
                let shared = dispatcher.clone();
                tokio::spawn(async move {
                    shared.run(job).await;
                    shared.job_done();
                });
            }
            debug!("fanout dispatcher stopped");
        });

        Self { shared, fanout }
    }

    fn enqueue(&self, job: FanoutJob) {
        if let FanoutJob::Embed { id, version } = job {
            self.shared
                .unembedded()
                .entry(id)
                .and_modify(|e| e.0 = version)
                .or_insert((version, Utc::now()));
        }
        self.shared.pending.fetch_add(1, Ordering::SeqCst);
        if self.fanout.send(job).is_err() {
            warn!(?job, "fanout dispatcher is gone, dropping job");
            self.shared.job_done();
        }
    }

    fn enqueue_write(&self, id: RecordId, version: u64) {
        self.enqueue(FanoutJob::Embed { id, version });
        self.enqueue(FanoutJob::Project);
    }

    /// The parameter snapshot queries currently rank with.
    pub fn parameters(&self) -> Arc<ParameterSnapshot> {
        self.shared.params.borrow().clone()
    }

    pub fn embedding_model(&self) -> &str {
        self.shared.embedder.model_version()
    }

    pub fn projector(&self) -> &AnalyticalProjector {
        &self.shared.projector
    }

    // ── writes ───────────────────────────────────────────────────────────────

    pub async fn write(&self, content: impl Into<Content>, context: Context) -> Result<RecordId, NeurosError> {
        Ok(self.write_record(NewRecord::new(content, context)).await?.id)
    }

    /// Persist `record` and queue its fanout. Returns once the record is
    /// durable and visible to structured queries.
    pub async fn write_record(&self, record: NewRecord) -> Result<MemoryRecord, NeurosError> {
        let store = self.shared.store.clone();
        let record = blocking(move || store.insert(record)).await?;
        self.enqueue_write(record.id, record.version);
        info!(record = %record.id, importance = record.importance, "record written");
        Ok(record)
    }

    /// Optimistic update. The superseded vector is evicted before this
    /// returns.
    pub async fn update(
        &self,
        id: RecordId,
        expected_version: u64,
        patch: RecordPatch,
    ) -> Result<MemoryRecord, NeurosError> {
        let store = self.shared.store.clone();
        let record = blocking(move || store.update(id, expected_version, patch)).await?;
        if record.version == expected_version {
            return Ok(record);
        }
        self.shared.index.remove(id);
        self.enqueue_write(id, record.version);
        info!(record = %id, version = record.version, "record updated");
        Ok(record)
    }

    /// Tombstone a record. It leaves query results and the vector index
    /// immediately and stays resolvable until purged.
    pub async fn delete(&self, id: RecordId, expected_version: u64) -> Result<MemoryRecord, NeurosError> {
        let store = self.shared.store.clone();
        let grace = self.shared.settings.tombstone_grace;
        let record = blocking(move || store.delete(id, expected_version, grace)).await?;
        self.shared.index.remove(id);
        self.enqueue(FanoutJob::Project);
        info!(record = %id, purge_after = ?record.purge_after, "record tombstoned");
        Ok(record)
    }

    pub async fn link(&self, child: RecordId, parent: RecordId) -> Result<(), NeurosError> {
        let store = self.shared.store.clone();
        blocking(move || store.add_edge(child, parent)).await?;
        debug!(child = %child, parent = %parent, "provenance edge added");
        Ok(())
    }

    /// Physically remove tombstones past their grace period.
    pub async fn purge_expired(&self) -> Result<Vec<RecordId>, NeurosError> {
        let store = self.shared.store.clone();
        let purged = blocking(move || store.purge_expired(Utc::now())).await?;
        for id in &purged {
            self.shared.index.remove(*id);
        }
        if !purged.is_empty() {
            info!(count = purged.len(), "tombstones purged");
        }
        Ok(purged)
    }

    // ── reads ────────────────────────────────────────────────────────────────

    pub async fn get(&self, id: RecordId) -> Result<Option<MemoryRecord>, NeurosError> {
        let store = self.shared.store.clone();
        blocking(move || store.get(id)).await
    }

    pub async fn records(&self, include_deleted: bool) -> Result<Vec<MemoryRecord>, NeurosError> {
        let store = self.shared.store.clone();
        blocking(move || store.list(include_deleted)).await
    }

    /// Rank live records for `text` under `filter`; see the module docs.
    pub async fn hybrid_query(
        &self,
        text: &str,
        filter: &Filter,
        k: usize,
    ) -> Result<QueryResult, NeurosError> {
        if k == 0 {
            return Ok(QueryResult::default());
        }
        let weights = self.parameters().weights.normalized();
        let leg_timeout = self.shared.settings.leg_timeout;
        let pool = self.shared.settings.candidate_pool.max(k.saturating_mul(4));
        let terms: BTreeSet<String> = tokenize(text).into_iter().collect();

        let structured = {
            let store = self.shared.store.clone();
            let filter = filter.clone();
            timeout(
                leg_timeout,
                blocking(move || {
                    store.query(&filter).map(|records| {
                        records
                            .iter()
                            .map(|r| (r.id, (lexical_score(r, &terms), r.version)))
                            .collect::<BTreeMap<_, _>>()
                    })
                }),
            )
        };
        let vector = timeout(leg_timeout, self.shared.vector_leg(text, pool));
        let analytical = {
            let store = self.shared.store.clone();
            let projector = self.shared.projector.clone();
            timeout(
                leg_timeout,
                blocking(move || {
                    let oldest_unapplied = store
                        .changes_since(projector.watermark(), 1)?
                        .first()
                        .map(|e| e.at);
                    Ok::<_, StoreError>(AnalyticalView {
                        scores: projector.scores(),
                        as_of: projector.as_of(),
                        oldest_unapplied,
                    })
                }),
            )
        };
        let (structured, vector, analytical) = tokio::join!(structured, vector, analytical);

        let mut dropped = Vec::new();
        let structured = settle(Source::Structured, structured, &mut dropped);
        let vector = settle(Source::Vector, vector, &mut dropped);
        let analytical = settle(Source::Analytical, analytical, &mut dropped);

        let mut rows: BTreeMap<RecordId, ScoreBreakdown> = BTreeMap::new();
        if let Some(matches) = &structured {
            for (id, (score, _)) in matches {
                rows.entry(*id).or_default().set(Source::Structured, *score);
            }
        }
        if let Some(hits) = &vector {
            for hit in hits {
                // Without the structured leg the filter cannot be checked.
                // A vector computed from a superseded version never scores
                // the current row.
                let admissible = structured
                    .as_ref()
                    .is_none_or(|m| m.get(&hit.id).is_some_and(|(_, v)| *v == hit.content_version));
                if admissible {
                    rows.entry(hit.id)
                        .or_default()
                        .set(Source::Vector, hit.similarity.max(0.0));
                }
            }
        }
        if let Some(view) = &analytical {
            for (id, breakdown) in rows.iter_mut() {
                if let Some(score) = view.scores.get(id) {
                    breakdown.set(Source::Analytical, *score);
                }
            }
        }

        let now = Utc::now();
        let bound = chrono::Duration::from_std(self.shared.settings.staleness)
            .unwrap_or(chrono::Duration::MAX);
        let mut lagging = Vec::new();
        if vector.is_some()
            && let Some(since) = self.shared.unembedded().values().map(|(_, at)| *at).min()
            && now - since > bound
        {
            lagging.push(since);
        }
        if let Some(view) = &analytical
            && let Some(since) = view.oldest_unapplied
            && now - since > bound
        {
            lagging.push(view.as_of.unwrap_or(since));
        }
        let as_of = lagging.into_iter().min();

        let mut hits: Vec<ScoredRecord> = rows
            .into_iter()
            .map(|(id, breakdown)| {
                let score = Source::ALL
                    .iter()
                    .map(|s| weights.get(*s) * breakdown.get(*s).unwrap_or(0.0))
                    .sum();
                ScoredRecord {
                    id,
                    score,
                    breakdown,
                    as_of,
                }
            })
            .collect();
        hits.sort_by(|a, b| b.score.total_cmp(&a.score).then(a.id.cmp(&b.id)));
        hits.truncate(k);

        debug!(
            k,
            hits = hits.len(),
            dropped = dropped.len(),
            stale = as_of.is_some(),
            "hybrid query"
        );
        Ok(QueryResult {
            hits,
            degraded: !dropped.is_empty(),
            dropped_legs: dropped,
            as_of,
        })
    }

    // ── maintenance ──────────────────────────────────────────────────────────

    /// Rebuild the derived views from the record store.
    ///
    /// Stored embeddings of the current model and content version go
    /// straight into the index; every other live record (missing, degraded
    /// or produced by another model) is queued for embedding. The projector
    /// catches up from its watermark.
    pub async fn reconcile(&self) -> Result<ReconcileReport, NeurosError> {
        let records = self.records(false).await?;
        let model = self.embedding_model().to_string();
        let mut report = ReconcileReport::default();
        for record in records {
            let loaded = match &record.embedding {
                Some(e) if e.model_version == model && e.content_version == record.version => {
                    match self.shared.index.upsert(record.id, e) {
                        Ok(_) => true,
                        Err(err) => {
                            warn!(record = %record.id, error = %err, "stored embedding rejected by index");
                            false
                        }
                    }
                }
                _ => false,
            };
            if loaded {
                report.loaded += 1;
            } else {
                self.enqueue(FanoutJob::Embed {
                    id: record.id,
                    version: record.version,
                });
                report.requeued += 1;
            }
        }
        self.enqueue(FanoutJob::Project);
        info!(loaded = report.loaded, requeued = report.requeued, model = %model, "reconciled derived views");
        Ok(report)
    }

    /// Wait until every queued fanout job has been acknowledged.
    pub async fn flush(&self) {
        loop {
            let idle = self.shared.idle.notified();
            tokio::pin!(idle);
            idle.as_mut().enable();
            if self.shared.pending.load(Ordering::SeqCst) == 0 {
                return;
            }
            idle.await;
        }
    }

    pub async fn stats(&self) -> Result<FusionStats, NeurosError> {
        let store = self.shared.store.clone();
        let (counts, latest_change) =
            blocking(move || Ok::<_, StoreError>((store.counts()?, store.latest_seq()?))).await?;
        Ok(FusionStats {
            live: counts.live,
            tombstoned: counts.tombstoned,
            degraded: counts.degraded,
            pending_embeddings: counts.pending,
            indexed: self.shared.index.len(),
            pending_fanout: self.shared.pending.load(Ordering::SeqCst),
            projector_watermark: self.shared.projector.watermark(),
            latest_change,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::{EmbeddingError, HashingEmbedder};
    use async_trait::async_trait;
    use neuros_memory::{InMemoryVectorIndex, SqliteRecordStore};
    use neuros_types::{EmbeddingStatus, RankingWeights};
    use serde_json::json;

    fn ctx(value: serde_json::Value) -> Context {
        serde_json::from_value(value).unwrap()
    }

    fn coordinator_on(
        store: Arc<dyn RecordStore>,
        embedder: Arc<dyn EmbeddingProvider>,
        settings: FusionSettings,
        weights: RankingWeights,
    ) -> FusionCoordinator {
        let index = Arc::new(InMemoryVectorIndex::new(embedder.dimension()));
        let projector = Arc::new(AnalyticalProjector::new(chrono::Duration::days(7)));
        let (_tx, rx) = watch::channel(Arc::new(ParameterSnapshot::new(weights)));
        FusionCoordinator::new(store, index, projector, embedder, rx, settings)
    }

    fn coordinator_with(embedder: Arc<dyn EmbeddingProvider>, settings: FusionSettings) -> FusionCoordinator {
        let store = Arc::new(SqliteRecordStore::open_in_memory().unwrap());
        coordinator_on(store, embedder, settings, RankingWeights::default())
    }

    fn coordinator() -> FusionCoordinator {
        coordinator_with(Arc::new(HashingEmbedder::default()), FusionSettings::default())
    }

    fn quick_settings() -> FusionSettings {
        FusionSettings {
            fanout_attempts: 2,
            fanout_backoff: Duration::from_millis(1),
            fanout_timeout: Duration::from_millis(50),
            leg_timeout: Duration::from_millis(50),
            ..FusionSettings::default()
        }
    }

    struct FailingEmbedder;

    #[async_trait]
    impl EmbeddingProvider for FailingEmbedder {
        fn model_version(&self) -> &str {
            "failing"
        }
        fn dimension(&self) -> usize {
            4
        }
        async fn embed(&self, _text: &str) -> Result<Vec<f32>, EmbeddingError> {
            Err(EmbeddingError::BadResponse("provider down".into()))
        }
    }

    /// Hangs on one specific text, hashes everything else.
    struct StallOn(&'static str, HashingEmbedder);

    #[async_trait]
    impl EmbeddingProvider for StallOn {
        fn model_version(&self) -> &str {
            self.1.model_version()
        }
        fn dimension(&self) -> usize {
            self.1.dimension()
        }
        async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
            if text == self.0 {
                tokio::time::sleep(Duration::from_secs(30)).await;
            }
            Ok(self.1.vector(text))
        }
    }

    // ── write path ──────────────────────────────────────────────────────────

    #[tokio::test]
    async fn write_is_visible_to_filter_queries_immediately() {
        let fusion = coordinator();
        let id = fusion
            .write("Meeting notes: Project X timeline extended to Q2", ctx(json!({"project": "X"})))
            .await
            .unwrap();
        assert_eq!(id, RecordId(1));

        let result = fusion
            .hybrid_query("", &Filter::new().eq("project", json!("X")), 10)
            .await
            .unwrap();
        assert_eq!(result.ids(), vec![id]);
        assert!(!result.degraded);
    }

    #[tokio::test]
    async fn flush_indexes_and_projects() {
        let fusion = coordinator();
        let id = fusion.write("alpha beta", Context::new()).await.unwrap();
        fusion.flush().await;

        let stats = fusion.stats().await.unwrap();
        assert_eq!(stats.indexed, 1);
        assert_eq!(stats.pending_fanout, 0);
        assert_eq!(stats.pending_embeddings, 0);
        assert_eq!(stats.projector_watermark, stats.latest_change);

        let record = fusion.get(id).await.unwrap().unwrap();
        assert_eq!(record.embedding_status, EmbeddingStatus::Ready);
        assert!(record.embedding_is_current());
    }

    #[tokio::test]
    async fn related_record_ranks_above_unrelated_after_flush() {
        let fusion = coordinator();
        fusion.write("Grocery list: apples and bread", Context::new()).await.unwrap();
        let r = fusion
            .write("Meeting notes: Project X timeline extended to Q2", ctx(json!({"project": "X"})))
            .await
            .unwrap();
        fusion.write("Dentist appointment on Friday", Context::new()).await.unwrap();
        fusion.flush().await;

        let result = fusion.hybrid_query("project X timeline", &Filter::new(), 3).await.unwrap();
        assert_eq!(result.hits[0].id, r);
        assert!(result.hits[0].breakdown.vector.unwrap() > 0.0);
        assert!(result.hits[0].score > result.hits[1].score);
    }

    #[tokio::test]
    async fn repeated_queries_are_identical() {
        let fusion = coordinator();
        for text in ["rust borrow checker", "tokio runtime", "borrowed references"] {
            fusion.write(text, Context::new()).await.unwrap();
        }
        fusion.flush().await;
        let a = fusion.hybrid_query("borrow", &Filter::new(), 3).await.unwrap();
        let b = fusion.hybrid_query("borrow", &Filter::new(), 3).await.unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn equal_scores_order_by_ascending_id() {
        let store = Arc::new(SqliteRecordStore::open_in_memory().unwrap());
        let fusion = coordinator_on(
            store,
            Arc::new(HashingEmbedder::default()),
            FusionSettings::default(),
            RankingWeights::new(1.0, 0.0, 0.0),
        );
        let a = fusion.write("same words here", Context::new()).await.unwrap();
        let b = fusion.write("same words here", Context::new()).await.unwrap();
        fusion.write("nothing alike", Context::new()).await.unwrap();

        let result = fusion.hybrid_query("same words", &Filter::new(), 3).await.unwrap();
        assert_eq!(result.hits[0].score, result.hits[1].score);
        assert_eq!(&result.ids()[..2], &[a, b]);
    }

    #[tokio::test]
    async fn filter_excludes_vector_hits_outside_it() {
        let fusion = coordinator();
        fusion.write("project timeline", ctx(json!({"project": "Y"}))).await.unwrap();
        let x = fusion.write("unrelated words", ctx(json!({"project": "X"}))).await.unwrap();
        fusion.flush().await;

        let result = fusion
            .hybrid_query("project timeline", &Filter::new().eq("project", json!("X")), 5)
            .await
            .unwrap();
        assert_eq!(result.ids(), vec![x]);
    }

    // ── update / delete ─────────────────────────────────────────────────────

    #[tokio::test]
    async fn update_evicts_superseded_vector_before_returning() {
        let fusion = coordinator();
        let id = fusion.write("first draft", Context::new()).await.unwrap();
        fusion.flush().await;
        assert_eq!(fusion.shared.index.content_version(id), Some(1));

        let patch = RecordPatch {
            content: Some(Content::text("second draft")),
            ..RecordPatch::default()
        };
        let updated = fusion.update(id, 1, patch).await.unwrap();
        assert_eq!(updated.version, 2);
        assert_eq!(fusion.shared.index.content_version(id), None);

        fusion.flush().await;
        assert_eq!(fusion.shared.index.content_version(id), Some(2));
    }

    #[tokio::test]
    async fn vector_of_superseded_version_does_not_score_committed_update() {
        let store = Arc::new(SqliteRecordStore::open_in_memory().unwrap());
        let fusion = coordinator_on(
            store.clone(),
            Arc::new(HashingEmbedder::default()),
            FusionSettings::default(),
            RankingWeights::default(),
        );
        let id = fusion.write("first draft", Context::new()).await.unwrap();
        fusion.flush().await;

        // Committed, but the index still holds the version 1 vector.
        let patch = RecordPatch {
            content: Some(Content::text("second draft")),
            ..RecordPatch::default()
        };
        store.update(id, 1, patch).unwrap();
        assert_eq!(fusion.shared.index.content_version(id), Some(1));

        let result = fusion.hybrid_query("first draft", &Filter::new(), 5).await.unwrap();
        assert_eq!(result.ids(), vec![id]);
        assert_eq!(result.hits[0].breakdown.get(Source::Vector), None);
    }

    #[tokio::test]
    async fn stale_update_is_a_write_conflict() {
        let fusion = coordinator();
        let id = fusion.write("v1", Context::new()).await.unwrap();
        fusion
            .update(id, 1, RecordPatch { importance: Some(5), ..RecordPatch::default() })
            .await
            .unwrap();
        let err = fusion
            .update(id, 1, RecordPatch { importance: Some(9), ..RecordPatch::default() })
            .await
            .unwrap_err();
        assert!(matches!(err, NeurosError::WriteConflict { expected: 1, actual: 2, .. }));
        assert_eq!(fusion.get(id).await.unwrap().unwrap().importance, 5);
    }

    #[tokio::test]
    async fn deleted_record_leaves_results_and_index() {
        let fusion = coordinator();
        let id = fusion.write("ephemeral thought", Context::new()).await.unwrap();
        fusion.flush().await;
        fusion.delete(id, 1).await.unwrap();

        assert_eq!(fusion.shared.index.content_version(id), None);
        let result = fusion.hybrid_query("ephemeral thought", &Filter::new(), 5).await.unwrap();
        assert!(result.hits.is_empty());
        assert!(fusion.get(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn purge_respects_grace_period() {
        let settings = FusionSettings {
            tombstone_grace: chrono::Duration::zero(),
            ..FusionSettings::default()
        };
        let fusion = coordinator_with(Arc::new(HashingEmbedder::default()), settings);
        let id = fusion.write("short lived", Context::new()).await.unwrap();
        fusion.delete(id, 1).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(fusion.purge_expired().await.unwrap(), vec![id]);
        assert!(fusion.records(true).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn provenance_cycle_is_rejected() {
        let fusion = coordinator();
        let a = fusion.write("source", Context::new()).await.unwrap();
        let b = fusion
            .write_record(NewRecord::new("summary", Context::new()).derived_from([a]))
            .await
            .unwrap()
            .id;
        let err = fusion.link(a, b).await.unwrap_err();
        assert!(matches!(err, NeurosError::ProvenanceCycle { .. }));
    }

    // ── failure handling ────────────────────────────────────────────────────

    #[tokio::test]
    async fn exhausted_embedding_marks_record_degraded() {
        let fusion = coordinator_with(Arc::new(FailingEmbedder), quick_settings());
        let id = fusion.write("cannot embed", ctx(json!({"tags": ["t"]}))).await.unwrap();
        fusion.flush().await;

        let stats = fusion.stats().await.unwrap();
        assert_eq!(stats.degraded, 1);
        assert_eq!(stats.indexed, 0);

        // Still reachable structurally; the vector leg fails and is dropped.
        let result = fusion.hybrid_query("cannot", &Filter::new().tag("t"), 5).await.unwrap();
        assert_eq!(result.ids(), vec![id]);
        assert!(result.degraded);
        assert_eq!(result.dropped_legs, vec![Source::Vector]);
    }

    #[tokio::test]
    async fn slow_vector_leg_is_dropped() {
        let embedder = Arc::new(StallOn("stall query", HashingEmbedder::new(16)));
        let fusion = coordinator_with(embedder, quick_settings());
        let id = fusion.write("fine content", Context::new()).await.unwrap();
        fusion.flush().await;

        let result = fusion.hybrid_query("stall query", &Filter::new(), 5).await.unwrap();
        assert!(result.degraded);
        assert_eq!(result.dropped_legs, vec![Source::Vector]);
        assert_eq!(result.ids(), vec![id]);
        assert!(result.hits[0].breakdown.vector.is_none());
    }

    #[tokio::test]
    async fn lagging_embedding_sets_as_of_marker() {
        let embedder = Arc::new(StallOn("stuck content", HashingEmbedder::new(16)));
        let settings = FusionSettings {
            staleness: Duration::ZERO,
            ..FusionSettings::default()
        };
        let fusion = coordinator_with(embedder, settings);
        fusion.write("stuck content", Context::new()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        let result = fusion.hybrid_query("content", &Filter::new(), 5).await.unwrap();
        assert!(result.is_stale());
        assert!(result.hits.iter().all(|h| h.as_of.is_some()));
    }

    #[tokio::test]
    async fn fresh_views_carry_no_marker() {
        let fusion = coordinator();
        fusion.write("settled content", Context::new()).await.unwrap();
        fusion.flush().await;
        let result = fusion.hybrid_query("content", &Filter::new(), 5).await.unwrap();
        assert!(!result.is_stale());
    }

    // ── reconcile ───────────────────────────────────────────────────────────

    #[tokio::test]
    async fn reconcile_reembeds_on_model_change() {
        let store: Arc<dyn RecordStore> = Arc::new(SqliteRecordStore::open_in_memory().unwrap());
        let old = coordinator_on(
            store.clone(),
            Arc::new(HashingEmbedder::new(16)),
            FusionSettings::default(),
            RankingWeights::default(),
        );
        let id = old.write("carried over", Context::new()).await.unwrap();
        old.flush().await;

        let same = coordinator_on(
            store.clone(),
            Arc::new(HashingEmbedder::new(16)),
            FusionSettings::default(),
            RankingWeights::default(),
        );
        let report = same.reconcile().await.unwrap();
        assert_eq!(report, ReconcileReport { loaded: 1, requeued: 0 });

        let new = coordinator_on(
            store,
            Arc::new(HashingEmbedder::new(32)),
            FusionSettings::default(),
            RankingWeights::default(),
        );
        let report = new.reconcile().await.unwrap();
        assert_eq!(report, ReconcileReport { loaded: 0, requeued: 1 });
        new.flush().await;
        let record = new.get(id).await.unwrap().unwrap();
        assert_eq!(record.embedding.unwrap().model_version, "hashing-v1-32");
        assert_eq!(new.stats().await.unwrap().projector_watermark, 1);
    }

    #[tokio::test]
    async fn zero_k_returns_nothing() {
        let fusion = coordinator();
        fusion.write("anything", Context::new()).await.unwrap();
        assert!(fusion.hybrid_query("anything", &Filter::new(), 0).await.unwrap().hits.is_empty());
    }
}

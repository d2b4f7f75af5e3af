use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use serde_json::Value as Json;
use uuid::Uuid;

use crate::bitmap::live_set::LiveSet;
use crate::core::config::Config;
use crate::core::error::{Error, ErrorKind, Result};
use crate::core::stats::{CollectionStats, FallbackDiagnostic, HealthStatus};
use crate::core::types::{Delta, DeltaBatch, Rid, RowId};
use crate::core::value::Document;
use crate::index::dimension::Dimension;
use crate::index::trigram::{TrigramIndex, TrigramPrefilter};
use crate::ingest::ring::RingBuffer;
use crate::ingest::scheduler::AdaptiveScheduler;
use crate::memory::pool::MemoryPool;
use crate::ops::graph::OperatorGraph;
use crate::pipeline::fuser::fuse;
use crate::pipeline::oneshot;
use crate::pipeline::stage::{ClassifyError, Stage, StandardEngine, classify};
use crate::query::plan::{self, ScanPlan};
use crate::query::predicate::Predicate;

/// A streaming collection: the document store, its lazily built
/// dimensions, the installed operator graph, and the ring buffer and
/// scheduler that feed it. One collection is one single-producer,
/// single-consumer context; independent collections share nothing.
pub struct Collection {
    pub id: Uuid,
    config: Config,

    store: BTreeMap<u64, Document>,
    live: LiveSet,
    next_row: u64,
    seq: u64,

    dims: HashMap<String, Arc<RwLock<Dimension>>>,
    trigram: TrigramPrefilter,

    pipeline: Option<Vec<Json>>,
    graph: Option<OperatorGraph>,
    fallback_engine: Option<Box<dyn StandardEngine>>,
    fallback_diag: Option<FallbackDiagnostic>,

    ring: RingBuffer,
    scheduler: AdaptiveScheduler,
    pool: MemoryPool,

    deltas_in: u64,
    poisoned: Option<String>,
}

impl Collection {
    pub fn new(initial_docs: Vec<Document>) -> Self {
        Self::with_config(initial_docs, Config::default())
    }

    pub fn with_config(initial_docs: Vec<Document>, config: Config) -> Self {
        let ring = RingBuffer::new(
            config.ring_capacity_pow2(),
            config.max_batch_size,
            config.backpressure_high,
            config.backpressure_low,
        );
        let scheduler = AdaptiveScheduler::new(&config);
        let mut pool = MemoryPool::new(config.pool_capacity);
        // The ring's slot storage is charged against the pool up front.
        let _ = pool.acquire(config.pool_chunk_size.min(64 * 1024 * 1024));

        let mut collection = Collection {
            id: Uuid::new_v4(),
            trigram: TrigramPrefilter::new(
                config.trigram_activation_threshold,
                config.trigram_idle_expiry,
                config.trigram_max_patterns,
            ),
            config,
            store: BTreeMap::new(),
            live: LiveSet::new(),
            next_row: 0,
            seq: 0,
            dims: HashMap::new(),
            pipeline: None,
            graph: None,
            fallback_engine: None,
            fallback_diag: None,
            ring,
            scheduler,
            pool,
            deltas_in: 0,
            poisoned: None,
        };
        for doc in initial_docs {
            // Seeding cannot fail: no pipeline is installed yet.
            let _ = collection.insert(doc);
        }
        collection
    }

    pub fn from_json(initial_docs: &[Json]) -> Result<Self> {
        let docs: Result<Vec<Document>> = initial_docs.iter().map(Document::from_json).collect();
        Ok(Self::new(docs?))
    }

    fn check_poisoned(&self) -> Result<()> {
        match &self.poisoned {
            Some(context) => Err(Error::new(ErrorKind::InvalidState, context.clone())),
            None => Ok(()),
        }
    }

    fn poison(&mut self, context: String) {
        self.ring.poison();
        self.poisoned = Some(context);
    }

    /// Supply the external one-shot engine used when a pipeline falls
    /// outside the incremental set.
    pub fn set_fallback_engine(&mut self, engine: Box<dyn StandardEngine>) {
        self.fallback_engine = Some(engine);
    }

    pub fn fallback_diagnostic(&self) -> Option<&FallbackDiagnostic> {
        self.fallback_diag.as_ref()
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    /// Install a pipeline. Parse errors surface immediately with the
    /// offending stage index; an unsupported stage records a fallback
    /// diagnostic instead and later materializations delegate to the
    /// external engine. The incremental path is never partially applied.
    pub fn install(&mut self, pipeline: &[Json]) -> Result<()> {
        self.check_poisoned()?;
        self.drain_ring_fully()?;
        self.fallback_diag = None;
        self.graph = None;
        self.pipeline = Some(pipeline.to_vec());

        let stages = match classify(pipeline) {
            Ok(stages) => stages,
            Err(err) if err.is_unsupported() => {
                self.record_fallback(err);
                return Ok(());
            }
            Err(err) => return Err(err.into_error()),
        };
        self.register_dimensions(&stages);
        let plan = match fuse(stages, &self.config) {
            Ok(plan) => plan,
            Err(err) if err.kind == ErrorKind::Unsupported => {
                self.fallback_diag = Some(FallbackDiagnostic {
                    stage_index: 0,
                    stage_name: "$sort".to_string(),
                    reason: err.context,
                });
                return Ok(());
            }
            Err(err) => return Err(err),
        };

        let mut graph = OperatorGraph::build(plan);
        // Seed with the current store contents.
        let mut batch = DeltaBatch::with_capacity(self.store.len());
        for (row, doc) in &self.store {
            self.seq += 1;
            batch.push(Delta::insert(Rid::source(RowId(*row)), doc.clone(), self.seq));
        }
        if let Err(err) = graph.push(batch) {
            self.poison(err.context.clone());
            return Err(err);
        }
        self.graph = Some(graph);
        Ok(())
    }

    fn record_fallback(&mut self, err: ClassifyError) {
        self.fallback_diag = Some(FallbackDiagnostic {
            stage_index: err.stage_index,
            stage_name: err.stage_name.clone(),
            reason: err.error.context,
        });
    }

    /// Build dimensions for every field path the pipeline's match stages
    /// probe; one dimension per path, shared by identity.
    fn register_dimensions(&mut self, stages: &[Stage]) {
        let mut paths = Vec::new();
        for stage in stages {
            if let Stage::Match(pred) = stage {
                pred.referenced_paths(&mut paths);
            }
        }
        for path in paths {
            self.ensure_dimension(&path);
        }
    }

    fn ensure_dimension(&mut self, path: &str) -> Arc<RwLock<Dimension>> {
        if let Some(dim) = self.dims.get(path) {
            return Arc::clone(dim);
        }
        let mut dim = Dimension::new(path, self.config.zone_map_chunk_rows);
        for (row, doc) in &self.store {
            dim.add_document(RowId(*row), doc);
        }
        let dim = Arc::new(RwLock::new(dim));
        self.dims.insert(path.to_string(), Arc::clone(&dim));
        dim
    }

    // ---- delta ingestion -------------------------------------------------

    pub fn insert(&mut self, doc: Document) -> Result<RowId> {
        self.check_poisoned()?;
        let row = RowId(self.next_row);
        self.next_row += 1;
        self.seq += 1;
        let delta = Delta::insert(Rid::source(row), doc, self.seq);
        self.commit(delta)?;
        Ok(row)
    }

    /// Insert under a caller-chosen row id.
    pub fn insert_with_id(&mut self, row: RowId, doc: Document) -> Result<()> {
        self.check_poisoned()?;
        if self.store.contains_key(&row.0) {
            return Err(Error::new(
                ErrorKind::InvalidArgument,
                format!("row {} already exists", row.0),
            ));
        }
        self.next_row = self.next_row.max(row.0 + 1);
        self.seq += 1;
        let delta = Delta::insert(Rid::source(row), doc, self.seq);
        self.commit(delta)
    }

    pub fn insert_batch(&mut self, docs: Vec<Document>) -> Result<Vec<RowId>> {
        let mut rows = Vec::with_capacity(docs.len());
        for doc in docs {
            rows.push(self.insert(doc)?);
        }
        Ok(rows)
    }

    pub fn update(&mut self, row: RowId, doc: Document) -> Result<bool> {
        self.check_poisoned()?;
        let Some(before) = self.store.get(&row.0).cloned() else {
            return Ok(false);
        };
        self.seq += 1;
        let delta = Delta::update(Rid::source(row), before, doc, self.seq);
        self.commit(delta)?;
        Ok(true)
    }

    pub fn remove(&mut self, row: RowId) -> Result<bool> {
        self.check_poisoned()?;
        let Some(before) = self.store.get(&row.0).cloned() else {
            return Ok(false);
        };
        self.seq += 1;
        let delta = Delta::delete(Rid::source(row), before, self.seq);
        self.commit(delta)?;
        Ok(true)
    }

    /// Apply a delta to the store and every index as one unit, then hand
    /// it to the ring. Store, live set, dimensions, and trigram indexes
    /// all observe the delta or none of them do.
    fn commit(&mut self, delta: Delta) -> Result<()> {
        let row = RowId(delta.rid.base);
        let trigram_fields = self.trigram.indexed_fields();
        if let Some(before) = &delta.before {
            self.store.remove(&row.0);
            self.live.clear(row.0 as usize);
            for dim in self.dims.values() {
                dim.write().remove_document(row);
            }
            for field in &trigram_fields {
                if let Some(value) = crate::core::path::resolve(before, field) {
                    self.trigram.remove_document(row, field, &value);
                }
            }
        }
        if let Some(after) = &delta.after {
            self.store.insert(row.0, after.clone());
            self.live.set(row.0 as usize);
            for dim in self.dims.values() {
                dim.write().add_document(row, after);
            }
            for field in &trigram_fields {
                if let Some(value) = crate::core::path::resolve(after, field) {
                    self.trigram.add_document(row, field, &value);
                }
            }
        }
        self.deltas_in += 1;

        if self.graph.is_none() {
            return Ok(());
        }

        // Enqueue for the operator graph. In the cooperative model the
        // producer and consumer share this thread, so backpressure is
        // relieved by draining in place and retrying once.
        let mut batch = DeltaBatch::with_capacity(1);
        batch.push(delta);
        if !self.ring.produce(&mut batch) {
            self.drain_ring_fully()?;
            if !self.ring.produce(&mut batch) {
                return Err(Error::new(
                    ErrorKind::Backpressure,
                    "ring buffer rejected the delta".to_string(),
                ));
            }
        }
        self.pump()
    }

    /// Drain as many batches as the scheduler allows right now.
    fn pump(&mut self) -> Result<()> {
        loop {
            let now = Instant::now();
            if !self.scheduler.should_emit(now, self.ring.utilization(), self.ring.is_empty()) {
                return Ok(());
            }
            self.drain_one_batch(now)?;
        }
    }

    /// Assemble one scheduler-sized batch from the ring and run it
    /// through the graph.
    fn drain_one_batch(&mut self, now: Instant) -> Result<()> {
        let target = self.scheduler.batch_size();
        let mut assembled = DeltaBatch::with_capacity(target);
        let mut slot = DeltaBatch::new();
        while assembled.len() < target && self.ring.consume(&mut slot) {
            assembled.deltas.append(&mut slot.deltas);
        }
        if assembled.is_empty() {
            return Ok(());
        }
        self.scheduler.note_emit(now, assembled.len());
        let started = Instant::now();
        let pushed = match &mut self.graph {
            Some(graph) => graph.push(assembled),
            None => Ok(()),
        };
        if let Err(err) = pushed {
            self.poison(err.context.clone());
            return Err(err);
        }
        self.scheduler.record_latency(started.elapsed(), self.ring.utilization());
        Ok(())
    }

    /// Flush the ring completely, ignoring the cadence gate. Used before
    /// materialization so the result reflects every accepted delta.
    fn drain_ring_fully(&mut self) -> Result<()> {
        while !self.ring.is_empty() {
            self.drain_one_batch(Instant::now())?;
        }
        Ok(())
    }

    // ---- queries ---------------------------------------------------------

    /// Current result of the installed pipeline.
    pub fn materialize(&mut self) -> Result<Vec<Document>> {
        self.check_poisoned()?;
        if self.graph.is_some() {
            self.drain_ring_fully()?;
            return Ok(self.graph.as_ref().map(|g| g.materialize()).unwrap_or_default());
        }
        let Some(pipeline) = self.pipeline.clone() else {
            return Ok(self.store.values().cloned().collect());
        };
        let docs: Vec<Document> = self.store.values().cloned().collect();
        match &self.fallback_engine {
            Some(engine) => engine.evaluate(&pipeline, &docs),
            None => Err(Error::new(
                ErrorKind::Unsupported,
                self.fallback_diag
                    .as_ref()
                    .map(|d| format!("stage {} ({}): {}", d.stage_index, d.stage_name, d.reason))
                    .unwrap_or_else(|| "no fallback engine installed".to_string()),
            )),
        }
    }

    /// One-shot convenience: evaluate a pipeline against the current
    /// store without touching the installed one.
    pub fn aggregate(&mut self, pipeline: &[Json]) -> Result<Vec<Document>> {
        self.check_poisoned()?;
        self.drain_ring_fully()?;

        let result = match classify(pipeline) {
            Ok(stages) => {
                // An index-assisted scan answers a leading $match before
                // the rest of the pipeline runs.
                if let Some(Stage::Match(pred)) = stages.first() {
                    let pred = pred.clone();
                    let docs = self.scan_match(&pred);
                    oneshot::evaluate(&pipeline[1..], &docs, &self.config)
                } else {
                    let docs: Vec<Document> = self.store.values().cloned().collect();
                    oneshot::evaluate(pipeline, &docs, &self.config)
                }
            }
            Err(err) => Err(err.into_error()),
        };
        match result {
            Err(err) if err.kind == ErrorKind::Unsupported => {
                let docs: Vec<Document> = self.store.values().cloned().collect();
                match &self.fallback_engine {
                    Some(engine) => engine.evaluate(pipeline, &docs),
                    None => Err(err),
                }
            }
            other => other,
        }
    }

    /// Evaluate a match predicate over the store through the cheapest
    /// access path: dimension probes, trigram prefilter for substring
    /// patterns, zone-map chunk skipping, or a plain scan.
    fn scan_match(&mut self, pred: &Predicate) -> Vec<Document> {
        // Track substring probes; build the trigram index for a field
        // once its session crosses the activation threshold.
        let mut substrings = Vec::new();
        plan::literal_substrings(pred, &mut substrings);
        for (field, _) in &substrings {
            if self.trigram.note_query(field) {
                let mut index = TrigramIndex::new(self.trigram.max_grams());
                for (row, doc) in &self.store {
                    if let Some(crate::core::value::Value::Str(text)) =
                        crate::core::path::resolve(doc, field)
                    {
                        index.add(RowId(*row), &text);
                    }
                }
                self.trigram.install(field, index);
            }
        }

        match plan::plan(pred, &self.dims) {
            ScanPlan::Candidates { rows, exact } => rows
                .iter()
                .filter_map(|row| self.store.get(&row))
                .filter(|doc| exact || pred.matches(doc))
                .cloned()
                .collect(),
            ScanPlan::Full => {
                // A single substring probe with a live trigram index
                // narrows the scan to its candidate rows.
                if let [(field, pattern)] = substrings.as_slice() {
                    if let Some(candidates) = self.trigram.candidates(field, pattern) {
                        return candidates
                            .iter()
                            .filter_map(|row| self.store.get(&row))
                            .filter(|doc| pred.matches(doc))
                            .cloned()
                            .collect();
                    }
                }
                self.scan_with_zone_maps(pred)
            }
        }
    }

    fn scan_with_zone_maps(&self, pred: &Predicate) -> Vec<Document> {
        let skip = plan::skippable_cmp(pred).and_then(|(path, op)| {
            self.dims.get(path).map(|dim| (Arc::clone(dim), op))
        });
        match skip {
            Some((dim, op)) => {
                let dim = dim.read();
                let chunk_rows = dim.zone_map().chunk_rows() as u64;
                self.store
                    .iter()
                    .filter(|(row, _)| {
                        !dim.zone_map().can_skip((**row / chunk_rows) as usize, &op)
                    })
                    .filter(|(_, doc)| pred.matches(doc))
                    .map(|(_, doc)| doc.clone())
                    .collect()
            }
            None => self
                .store
                .values()
                .filter(|doc| pred.matches(doc))
                .cloned()
                .collect(),
        }
    }

    // ---- lifecycle -------------------------------------------------------

    pub fn stats(&self) -> CollectionStats {
        CollectionStats {
            collection_id: self.id,
            deltas_in: self.deltas_in,
            batches_out: self.scheduler.batches_out(),
            backpressure_events: self.ring.backpressure_events(),
            queue_utilization: self.ring.utilization(),
            avg_batch_size: self.scheduler.avg_batch_size(),
            avg_latency_ms: self.scheduler.avg_latency_ms(),
            live_documents: self.store.len(),
            dimension_count: self.dims.len(),
            current_batch_size: self.scheduler.batch_size(),
            ewma_latency_ms: self.scheduler.ewma_latency_ms(),
            pool: self.pool.stats(),
            health: match &self.poisoned {
                Some(context) => HealthStatus::Poisoned(context.clone()),
                None => HealthStatus::Healthy,
            },
        }
    }

    /// Tear the collection down: discard queued deltas, release state,
    /// and reject all further operations. In-flight producers observe
    /// the ring's poison flag.
    pub fn destroy(&mut self) {
        self.ring.poison();
        self.ring.drain_discard();
        if let Some(graph) = &mut self.graph {
            graph.reset();
        }
        self.graph = None;
        self.pipeline = None;
        self.dims.clear();
        self.store.clear();
        self.live.clear_all();
        self.pool.clear();
        self.poisoned = Some("collection destroyed".to_string());
    }
}

impl std::fmt::Debug for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collection")
            .field("id", &self.id)
            .field("documents", &self.store.len())
            .field("dimensions", &self.dims.len())
            .field("installed", &self.pipeline.is_some())
            .field("poisoned", &self.poisoned)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::value::Value;

    fn doc(json: &str) -> Document {
        Document::from_json(&serde_json::from_str(json).unwrap()).unwrap()
    }

    fn docs(jsons: &[&str]) -> Vec<Document> {
        jsons.iter().map(|j| doc(j)).collect()
    }

    fn pipeline(json: &str) -> Vec<Json> {
        serde_json::from_str(json).unwrap()
    }

    fn sorted(mut out: Vec<Document>) -> Vec<Document> {
        out.sort_by(|a, b| a.as_value().cmp(&b.as_value()));
        out
    }

    fn d1() -> Vec<Document> {
        docs(&[r#"{"c": "a", "v": 10}"#, r#"{"c": "b", "v": 20}"#, r#"{"c": "a", "v": 30}"#])
    }

    #[test]
    fn test_projection_passthrough_scenario() {
        let mut coll = Collection::new(d1());
        coll.install(&pipeline(r#"[{"$project": {"v": 1, "_id": 0}}]"#)).unwrap();
        assert_eq!(
            sorted(coll.materialize().unwrap()),
            sorted(docs(&[r#"{"v": 10}"#, r#"{"v": 20}"#, r#"{"v": 30}"#]))
        );
    }

    #[test]
    fn test_grouped_sum_and_incremental_delete() {
        let mut coll = Collection::new(d1());
        coll.install(&pipeline(r#"[{"$group": {"_id": "$c", "s": {"$sum": "$v"}}}]"#)).unwrap();
        assert_eq!(
            sorted(coll.materialize().unwrap()),
            sorted(docs(&[r#"{"_id": "a", "s": 40}"#, r#"{"_id": "b", "s": 20}"#]))
        );

        // Remove {c:"a", v:10}, inserted first so it holds row id 0.
        assert!(coll.remove(RowId(0)).unwrap());
        assert_eq!(
            sorted(coll.materialize().unwrap()),
            sorted(docs(&[r#"{"_id": "a", "s": 30}"#, r#"{"_id": "b", "s": 20}"#]))
        );
    }

    #[test]
    fn test_match_update_emits_insert_only() {
        let mut coll = Collection::new(vec![doc(r#"{"age": 17}"#)]);
        coll.install(&pipeline(r#"[{"$match": {"age": {"$gte": 18}}}]"#)).unwrap();
        assert!(coll.materialize().unwrap().is_empty());

        coll.update(RowId(0), doc(r#"{"age": 19}"#)).unwrap();
        assert_eq!(coll.materialize().unwrap(), docs(&[r#"{"age": 19}"#]));
    }

    #[test]
    fn test_topk_scenario_in_order() {
        let mut coll = Collection::new(docs(&[
            r#"{"x": 5}"#, r#"{"x": 1}"#, r#"{"x": 9}"#, r#"{"x": 3}"#, r#"{"x": 7}"#,
        ]));
        coll.install(&pipeline(r#"[{"$sort": {"x": -1}}, {"$limit": 2}]"#)).unwrap();
        assert_eq!(coll.materialize().unwrap(), docs(&[r#"{"x": 9}"#, r#"{"x": 7}"#]));

        // A new best row displaces the tail incrementally.
        coll.insert(doc(r#"{"x": 8}"#)).unwrap();
        assert_eq!(coll.materialize().unwrap(), docs(&[r#"{"x": 9}"#, r#"{"x": 8}"#]));
    }

    #[test]
    fn test_aggregate_leaves_installed_pipeline_alone() {
        let mut coll = Collection::new(d1());
        coll.install(&pipeline(r#"[{"$project": {"v": 1, "_id": 0}}]"#)).unwrap();
        let grouped = coll
            .aggregate(&pipeline(r#"[{"$group": {"_id": "$c", "s": {"$sum": "$v"}}}]"#))
            .unwrap();
        assert_eq!(
            sorted(grouped),
            sorted(docs(&[r#"{"_id": "a", "s": 40}"#, r#"{"_id": "b", "s": 20}"#]))
        );
        // Installed projection still answers materialize().
        assert_eq!(coll.materialize().unwrap().len(), 3);
    }

    #[test]
    fn test_aggregate_uses_dimension_for_leading_match() {
        let mut coll = Collection::new(d1());
        // Install a match so the dimension on "c" exists.
        coll.install(&pipeline(r#"[{"$match": {"c": "a"}}]"#)).unwrap();
        assert_eq!(coll.stats().dimension_count, 1);

        let out = coll
            .aggregate(&pipeline(r#"[{"$match": {"c": "a"}}, {"$project": {"v": 1, "_id": 0}}]"#))
            .unwrap();
        assert_eq!(sorted(out), sorted(docs(&[r#"{"v": 10}"#, r#"{"v": 30}"#])));
    }

    #[test]
    fn test_ivm_equivalence_random_mutations() {
        use rand::Rng;
        let mut rng = rand::thread_rng();
        let pipelines = [
            r#"[{"$match": {"v": {"$gte": 10}}}, {"$project": {"c": 1, "v": 1, "_id": 0}}]"#,
            r#"[{"$group": {"_id": "$c", "s": {"$sum": "$v"}, "n": {"$sum": 1}, "lo": {"$min": "$v"}, "hi": {"$max": "$v"}}}]"#,
            r#"[{"$unwind": "$tags"}, {"$group": {"_id": "$tags", "n": {"$sum": 1}}}]"#,
            r#"[{"$sort": {"v": -1}}, {"$limit": 4}]"#,
        ];
        for pipe in pipelines {
            let pipe = pipeline(pipe);
            let mut coll = Collection::new(Vec::new());
            coll.install(&pipe).unwrap();
            let mut live: Vec<RowId> = Vec::new();
            for i in 0..300u64 {
                let action = rng.gen_range(0..10);
                if action < 6 || live.is_empty() {
                    let json = format!(
                        r#"{{"c": "g{}", "v": {}, "tags": ["t{}", "t{}"]}}"#,
                        rng.gen_range(0..4),
                        rng.gen_range(0..50),
                        rng.gen_range(0..3),
                        rng.gen_range(0..3)
                    );
                    live.push(coll.insert(doc(&json)).unwrap());
                } else if action < 8 {
                    let idx = rng.gen_range(0..live.len());
                    let row = live.swap_remove(idx);
                    assert!(coll.remove(row).unwrap());
                } else {
                    let idx = rng.gen_range(0..live.len());
                    let json = format!(
                        r#"{{"c": "g{}", "v": {}, "tags": ["t{}"]}}"#,
                        rng.gen_range(0..4),
                        rng.gen_range(0..50),
                        rng.gen_range(0..3)
                    );
                    assert!(coll.update(live[idx], doc(&json)).unwrap());
                }
                if i % 50 == 49 {
                    let incremental = sorted(coll.materialize().unwrap());
                    let batch = sorted(coll.aggregate(&pipe).unwrap());
                    assert_eq!(incremental, batch, "divergence after {} mutations", i + 1);
                }
            }
        }
    }

    #[test]
    fn test_fallback_diagnostic_without_engine() {
        let mut coll = Collection::new(d1());
        coll.install(&pipeline(r#"[{"$match": {"v": 1}}, {"$lookup": {"from": "x"}}]"#)).unwrap();
        let diag = coll.fallback_diagnostic().unwrap();
        assert_eq!(diag.stage_index, 1);
        assert_eq!(diag.stage_name, "$lookup");

        let err = coll.materialize().unwrap_err();
        assert_eq!(err.kind, ErrorKind::Unsupported);
    }

    #[test]
    fn test_fallback_engine_is_consulted() {
        struct Fixed;
        impl StandardEngine for Fixed {
            fn evaluate(&self, _: &[Json], docs: &[Document]) -> Result<Vec<Document>> {
                Ok(docs.to_vec())
            }
        }
        let mut coll = Collection::new(d1());
        coll.set_fallback_engine(Box::new(Fixed));
        coll.install(&pipeline(r#"[{"$lookup": {"from": "x"}}]"#)).unwrap();
        assert_eq!(coll.materialize().unwrap().len(), 3);
    }

    #[test]
    fn test_install_parse_error_names_stage() {
        let mut coll = Collection::new(Vec::new());
        let err = coll
            .install(&pipeline(r#"[{"$match": {"v": 1}}, {"$limit": "three"}]"#))
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Parse);
        assert!(err.context.contains("stage 1"));
    }

    #[test]
    fn test_trigram_session_activates_for_repeated_substring_queries() {
        let jsons: Vec<String> = (0..20)
            .map(|i| format!(r#"{{"name": "item number {}", "v": {}}}"#, i, i))
            .collect();
        let mut coll =
            Collection::new(jsons.iter().map(|j| doc(j)).collect::<Vec<Document>>());
        let probe = pipeline(r#"[{"$match": {"name": {"$regex": "number 1"}}}]"#);
        // Default activation threshold is 4 queries on the same field.
        for _ in 0..6 {
            let out = coll.aggregate(&probe).unwrap();
            assert_eq!(out.len(), 11); // "number 1" and "number 1x"
        }
    }

    #[test]
    fn test_destroy_poisons() {
        let mut coll = Collection::new(d1());
        coll.destroy();
        assert!(coll.insert(doc(r#"{"x": 1}"#)).is_err());
        assert!(coll.materialize().is_err());
        assert_eq!(coll.stats().health, HealthStatus::Poisoned("collection destroyed".to_string()));
    }

    #[test]
    fn test_insert_with_id_and_conflict() {
        let mut coll = Collection::new(Vec::new());
        coll.insert_with_id(RowId(7), doc(r#"{"v": 1}"#)).unwrap();
        assert!(coll.insert_with_id(RowId(7), doc(r#"{"v": 2}"#)).is_err());
        // Fresh inserts allocate past the explicit id.
        let row = coll.insert(doc(r#"{"v": 3}"#)).unwrap();
        assert_eq!(row, RowId(8));
    }

    #[test]
    fn test_stats_track_ingestion() {
        let mut coll = Collection::new(Vec::new());
        coll.install(&pipeline(r#"[{"$match": {"v": {"$gte": 0}}}]"#)).unwrap();
        for i in 0..100 {
            coll.insert(doc(&format!(r#"{{"v": {}}}"#, i))).unwrap();
        }
        coll.materialize().unwrap();
        let stats = coll.stats();
        assert_eq!(stats.deltas_in, 100);
        assert!(stats.batches_out >= 1);
        assert!(stats.avg_batch_size >= 1.0);
        assert_eq!(stats.live_documents, 100);
        assert!(stats.health.is_healthy());
        assert!(stats.pool.allocated_bytes > 0);
    }

    #[test]
    fn test_group_key_canonicalization_unifies_numerics() {
        let mut coll = Collection::new(docs(&[r#"{"k": 1, "v": 1}"#, r#"{"k": 1.0, "v": 2}"#]));
        coll.install(&pipeline(r#"[{"$group": {"_id": "$k", "s": {"$sum": "$v"}}}]"#)).unwrap();
        let out = coll.materialize().unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].get("s"), Some(&Value::Int(3)));
    }
}

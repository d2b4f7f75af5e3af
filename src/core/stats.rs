use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Collection-level statistics for monitoring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionStats {
    pub collection_id: Uuid,

    // Ingestion
    pub deltas_in: u64,
    pub batches_out: u64,
    pub backpressure_events: u64,
    pub queue_utilization: f64,
    pub avg_batch_size: f64,
    pub avg_latency_ms: f64,

    // Store
    pub live_documents: usize,
    pub dimension_count: usize,

    // Scheduler internals
    pub current_batch_size: usize,
    pub ewma_latency_ms: f64,

    // Memory
    pub pool: PoolStats,

    pub health: HealthStatus,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct PoolStats {
    pub allocated_bytes: usize,
    pub used_bytes: usize,
    pub capacity_bytes: usize,
    pub chunk_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum HealthStatus {
    Healthy,
    Degraded(String),
    Poisoned(String),
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }
}

/// Emitted when a pipeline cannot run on the incremental path and the
/// collection delegates to the external one-shot engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FallbackDiagnostic {
    pub stage_index: usize,
    pub stage_name: String,
    pub reason: String,
}

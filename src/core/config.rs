use std::time::Duration;

/// Engine configuration. One flat struct per collection; every subsystem
/// reads its knobs from here.
#[derive(Debug, Clone)]
pub struct Config {
    // Ring buffer / scheduler
    pub ring_capacity: usize,              // slots, rounded up to a power of two
    pub min_batch_size: usize,
    pub max_batch_size: usize,
    pub initial_batch_size: usize,
    pub target_batch_latency: Duration,    // EWMA target per drained batch
    pub latency_ewma_alpha: f64,
    pub min_emit_cadence: Duration,        // no two batches closer than this
    pub backpressure_high: f64,            // reject producers at this utilization
    pub backpressure_low: f64,             // resume below this utilization
    pub grow_utilization: f64,             // queue pressure needed to grow batches

    // Memory pool
    pub pool_chunk_size: usize,            // per-chunk allocation size
    pub pool_capacity: usize,              // overall cap across chunks

    // Fuser guardrails
    pub fuse_max_stages: usize,
    pub fuse_max_tokens: usize,
    pub fuse_min_speedup: f64,

    // Index substrate
    pub zone_map_chunk_rows: usize,
    pub bloom_false_positive_rate: f64,
    pub bloom_min_in_list: usize,          // $in lists at least this long get a bloom prefilter
    pub trigram_activation_threshold: usize,
    pub trigram_idle_expiry: Duration,
    pub trigram_max_patterns: usize,       // LRU bound on cached candidate sets
}

impl Default for Config {
    fn default() -> Self {
        Config {
            ring_capacity: 64,
            min_batch_size: 256,
            max_batch_size: 4096,
            initial_batch_size: 256,
            target_batch_latency: Duration::from_millis(5),
            latency_ewma_alpha: 0.1,
            min_emit_cadence: Duration::from_millis(10),
            backpressure_high: 0.8,
            backpressure_low: 0.4,
            grow_utilization: 0.6,

            pool_chunk_size: 1024 * 1024,            // 1MB chunks
            pool_capacity: 256 * 1024 * 1024,        // 256MB per collection

            fuse_max_stages: 5,
            fuse_max_tokens: 10_000,
            fuse_min_speedup: 1.2,

            zone_map_chunk_rows: 1024,
            bloom_false_positive_rate: 0.01,
            bloom_min_in_list: 16,
            trigram_activation_threshold: 4,
            trigram_idle_expiry: Duration::from_secs(300),
            trigram_max_patterns: 128,
        }
    }
}

impl Config {
    /// Ring capacity normalized to a power of two (the ring requires it
    /// for cheap modular cursor arithmetic).
    pub fn ring_capacity_pow2(&self) -> usize {
        self.ring_capacity.next_power_of_two().max(2)
    }
}

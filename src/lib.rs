pub mod core;
pub mod bitmap;
pub mod index;
pub mod expr;
pub mod kernel;
pub mod ingest;
pub mod ops;
pub mod pipeline;
pub mod query;
pub mod memory;

/*
┌─────────────────────────────────────────────────────────────────────────────┐
│                         TORVANE ENGINE ARCHITECTURE                          │
└─────────────────────────────────────────────────────────────────────────────┘

┌──────────────────────────────── INGESTION ─────────────────────────────────┐
│                                                                             │
│   insert/update/remove ──► Delta ──► RingBuffer (SPSC, cache-padded)        │
│                                          │                                  │
│                              AdaptiveScheduler (256..4096, EWMA,            │
│                              10ms cadence, 0.8/0.4 hysteresis)              │
│                                          │                                  │
└──────────────────────────────────────────┼──────────────────────────────────┘
                                           ▼
┌──────────────────────────── OPERATOR GRAPH (IVM) ──────────────────────────┐
│                                                                             │
│   FilterOp ─► FusedOp ─► UnwindOp ─► GroupOp ─► SortOp/TopKOp ─► WindowOp   │
│      │           │           │          │             │                     │
│      │           │           │          │             └─ bounded stable     │
│      │           │           │          └─ refcounted accumulators          │
│      │           │           └─ synthetic child rids                        │
│      │           └─ vectorized match masks + shapes + window                │
│      └─ predicate insert/delete/update classification                       │
│                                                                             │
└─────────────────────────────────────────────────────────────────────────────┘
                                           │ materialize()
                                           ▼
┌──────────────────────────────── SUBSTRATE ─────────────────────────────────┐
│                                                                             │
│   Value/path model · LiveSet bitsets · RefCounted multisets · OsTree        │
│   Dimensions (value → row-ids) · ZoneMaps · BloomFilter · Trigram           │
│   Expression evaluator (scalar + column) · numeric/boolean kernels          │
│   MemoryPool (aligned chunks) · query planner (index-assisted scans)        │
│                                                                             │
└─────────────────────────────────────────────────────────────────────────────┘

Batch mode reuses the same operators: aggregate() builds a fresh graph,
feeds the store as one insert batch, and materializes.
*/

use serde_json::Value as Json;

use crate::core::config::Config;
use crate::core::error::Result;
use crate::core::types::{Delta, DeltaBatch, Rid, RowId};
use crate::core::value::Document;
use crate::ops::graph::OperatorGraph;
use crate::pipeline::fuser::fuse;
use crate::pipeline::stage::classify;

/// One-shot evaluation of a supported pipeline over a finite document
/// batch: build a fresh operator graph, feed every document as an
/// insert, materialize. `aggregate()` and the equivalence tests ride
/// this path.
pub fn evaluate(pipeline: &[Json], docs: &[Document], config: &Config) -> Result<Vec<Document>> {
    let stages = classify(pipeline).map_err(|e| e.into_error())?;
    let plan = fuse(stages, config)?;
    let mut graph = OperatorGraph::build(plan);

    let mut batch = DeltaBatch::with_capacity(docs.len());
    for (i, doc) in docs.iter().enumerate() {
        batch.push(Delta::insert(Rid::source(RowId(i as u64)), doc.clone(), i as u64));
    }
    graph.push(batch)?;
    Ok(graph.materialize())
}

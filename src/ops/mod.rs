pub mod filter;
pub mod fused;
pub mod graph;
pub mod group;
pub mod project;
pub mod sort;
pub mod topk;
pub mod unwind;

use crate::core::error::{Error, ErrorKind, Result};
use crate::core::types::{Delta, DeltaBatch};
use crate::core::value::Document;

/// Malformed deltas are invariant violations; the collection poisons on
/// them rather than aborting.
pub(crate) fn delta_before(delta: &Delta) -> Result<&Document> {
    delta.before.as_ref().ok_or_else(|| {
        Error::new(ErrorKind::Internal, format!("delta for {:?} is missing its before image", delta.rid))
    })
}

pub(crate) fn delta_after(delta: &Delta) -> Result<&Document> {
    delta.after.as_ref().ok_or_else(|| {
        Error::new(ErrorKind::Internal, format!("delta for {:?} is missing its after image", delta.rid))
    })
}

/// One stage of the incremental operator graph. A batch of upstream
/// deltas goes in, state is updated, and a batch of output deltas comes
/// out for the next stage.
///
/// Stateless stages (match, project, unwind) answer `materialize` by
/// per-document replay via `transform`; state-bearing stages (group,
/// sort, top-k, limit/skip windows) snapshot their own output.
pub trait Operator: std::fmt::Debug {
    fn name(&self) -> &'static str;

    fn push(&mut self, batch: DeltaBatch) -> Result<DeltaBatch>;

    /// Current output for state-bearing operators, in output order.
    /// `None` for pass-through operators.
    fn snapshot(&self) -> Option<Vec<Document>> {
        None
    }

    /// Pure per-document application, used to replay pass-through stages
    /// over an upstream snapshot at materialize time.
    fn transform(&self, doc: &Document) -> Vec<Document> {
        vec![doc.clone()]
    }

    fn reset(&mut self);
}

use crate::core::config::Config;
use crate::core::error::{Error, ErrorKind, Result};
use crate::ops::fused::FusedStep;
use crate::ops::project::Shape;
use crate::ops::sort::SortSpec;
use crate::pipeline::stage::Stage;

/// Executable plan produced from a classified stage list: standalone
/// stages, fused linear runs, and sort runs rewritten to Top-K or a
/// buffering sort.
#[derive(Debug)]
pub enum PlanNode {
    Stage(Stage),
    Fused(Vec<FusedStep>),
    TopK { spec: SortSpec, skip: usize, limit: usize },
    Sort { spec: SortSpec, skip: usize, limit: Option<usize> },
}

impl PlanNode {
    pub fn describe(&self) -> String {
        match self {
            PlanNode::Stage(stage) => stage.name().to_string(),
            PlanNode::Fused(steps) => format!("fused[{}]", steps.len()),
            PlanNode::TopK { limit, skip, .. } => format!("topk[{}+{}]", skip, limit),
            PlanNode::Sort { .. } => "sort".to_string(),
        }
    }
}

/// Rewrite the stage list into plan nodes.
///
/// Pass one folds each `$sort` with its adjacent `$skip`/`$limit` stages:
/// a bounded run becomes Top-K (the sort spec is always field-ordered by
/// construction), an unbounded one a buffering sort. Pass two groups
/// maximal runs of fusable stages, subject to the guardrails: group
/// size, estimated generated-code size, and a minimum estimated speedup
/// from the cost model (more stages and simpler expressions push the
/// estimate up). A group failing any guardrail is discarded and its
/// stages run standalone.
pub fn fuse(stages: Vec<Stage>, config: &Config) -> Result<Vec<PlanNode>> {
    let folded = fold_sort_runs(stages)?;
    Ok(group_fusable(folded, config))
}

enum Folded {
    Plain(Stage),
    Node(PlanNode),
}

fn fold_sort_runs(stages: Vec<Stage>) -> Result<Vec<Folded>> {
    let mut out = Vec::with_capacity(stages.len());
    let mut iter = stages.into_iter().peekable();
    // Set after a sort run whose order must survive to the output;
    // cleared by a group, which is unordered.
    let mut order_sensitive = false;
    while let Some(stage) = iter.next() {
        match stage {
            Stage::Sort(spec) => {
                let mut skip = 0usize;
                let mut limit: Option<usize> = None;
                while let Some(next) = iter.peek() {
                    match next {
                        Stage::Skip(n) => {
                            skip += n;
                            limit = limit.map(|l| l.saturating_sub(*n));
                            iter.next();
                        }
                        Stage::Limit(k) => {
                            let k = *k;
                            limit = Some(limit.map(|l| l.min(k)).unwrap_or(k));
                            iter.next();
                        }
                        _ => break,
                    }
                }
                let node = match limit {
                    Some(k) if k > 0 => PlanNode::TopK { spec, skip, limit: k },
                    _ => PlanNode::Sort { spec, skip, limit },
                };
                out.push(Folded::Node(node));
                order_sensitive = true;
            }
            Stage::Group { .. } => {
                order_sensitive = false;
                out.push(Folded::Plain(stage));
            }
            Stage::Limit(_) | Stage::Skip(_) if order_sensitive => {
                // A window detached from its sort would be applied in
                // insertion order and silently change the result.
                return Err(Error::new(
                    ErrorKind::Unsupported,
                    "limit/skip after sort must be adjacent to it for incremental maintenance"
                        .to_string(),
                ));
            }
            other => out.push(Folded::Plain(other)),
        }
    }
    Ok(out)
}

fn is_fusable(stage: &Stage) -> bool {
    match stage {
        Stage::Match(pred) => pred.is_simple(),
        Stage::Project(projection) => projection.is_simple(),
        Stage::AddFields(assignments) => assignments.iter().all(|(_, e)| e.is_simple()),
        Stage::Limit(_) | Stage::Skip(_) => true,
        _ => false,
    }
}

fn is_window(stage: &Stage) -> bool {
    matches!(stage, Stage::Limit(_) | Stage::Skip(_))
}

fn stage_tokens(stage: &Stage) -> usize {
    match stage {
        Stage::Match(pred) => pred.token_count(),
        Stage::Project(projection) => projection.token_count(),
        Stage::AddFields(assignments) => {
            assignments.iter().map(|(_, e)| e.token_count()).sum::<usize>()
        }
        _ => 1,
    }
}

/// Rough size of the code a fused run compiles to, in tokens.
fn estimated_tokens(run: &[Stage]) -> usize {
    40 + run.iter().map(|s| 30 * stage_tokens(s)).sum::<usize>()
}

/// Cost-model speedup estimate: grows with the number of collapsed
/// stages, shrinks with expression complexity.
fn estimated_speedup(run: &[Stage]) -> f64 {
    let stages = run.len() as f64;
    let avg_tokens = run.iter().map(stage_tokens).sum::<usize>() as f64 / stages;
    1.0 + 0.25 * (stages - 1.0) * (20.0 / (20.0 + avg_tokens))
}

fn guardrails_pass(run: &[Stage], config: &Config) -> bool {
    run.len() >= 2
        && run.len() <= config.fuse_max_stages
        && estimated_tokens(run) <= config.fuse_max_tokens
        && estimated_speedup(run) >= config.fuse_min_speedup
}

fn to_fused_steps(run: Vec<Stage>) -> Vec<FusedStep> {
    run.into_iter()
        .map(|stage| match stage {
            Stage::Match(pred) => FusedStep::Match(pred),
            Stage::Project(projection) => FusedStep::Shape(Shape::Project(projection)),
            Stage::AddFields(assignments) => FusedStep::Shape(Shape::AddFields(assignments)),
            Stage::Limit(k) => FusedStep::Limit(k),
            Stage::Skip(n) => FusedStep::Skip(n),
            _ => unreachable!("non-fusable stage in fused run"),
        })
        .collect()
}

fn flush_run(run: &mut Vec<Stage>, out: &mut Vec<PlanNode>, config: &Config) {
    if run.is_empty() {
        return;
    }
    if guardrails_pass(run, config) {
        out.push(PlanNode::Fused(to_fused_steps(std::mem::take(run))));
    } else {
        for stage in run.drain(..) {
            out.push(PlanNode::Stage(stage));
        }
    }
}

fn group_fusable(folded: Vec<Folded>, config: &Config) -> Vec<PlanNode> {
    let mut out = Vec::with_capacity(folded.len());
    let mut run: Vec<Stage> = Vec::new();
    let mut run_has_window = false;
    for item in folded {
        match item {
            Folded::Node(node) => {
                flush_run(&mut run, &mut out, config);
                run_has_window = false;
                out.push(node);
            }
            Folded::Plain(stage) => {
                if !is_fusable(&stage) {
                    flush_run(&mut run, &mut out, config);
                    run_has_window = false;
                    out.push(PlanNode::Stage(stage));
                    continue;
                }
                // Once a limit/skip is in the run, a following transform
                // would see the windowed rows; split the run instead.
                if run_has_window && !is_window(&stage) {
                    flush_run(&mut run, &mut out, config);
                    run_has_window = false;
                }
                run_has_window |= is_window(&stage);
                run.push(stage);
            }
        }
    }
    flush_run(&mut run, &mut out, config);
    out
}

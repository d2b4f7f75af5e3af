/// Torvane incremental view maintenance demo
///
/// Installs a pipeline once, then mutates the collection and shows that
/// materialize() stays current without re-running the pipeline.

use Torvane::core::collection::Collection;
use Torvane::core::types::RowId;
use Torvane::core::value::Document;

fn doc(json: &str) -> Document {
    Document::from_json(&serde_json::from_str(json).unwrap()).unwrap()
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("\n=== Torvane streaming demo ===\n");

    let mut metrics = Collection::new(Vec::new());
    let pipeline: Vec<serde_json::Value> = serde_json::from_str(
        r#"[
            {"$match": {"status": "ok"}},
            {"$group": {"_id": "$service", "p_sum": {"$sum": "$latency"}, "n": {"$sum": 1}}}
        ]"#,
    )?;
    metrics.install(&pipeline)?;

    println!("Inserting measurements...");
    let rows: Vec<RowId> = [
        r#"{"service": "api", "status": "ok", "latency": 12}"#,
        r#"{"service": "api", "status": "ok", "latency": 18}"#,
        r#"{"service": "db", "status": "ok", "latency": 5}"#,
        r#"{"service": "api", "status": "error", "latency": 500}"#,
    ]
    .iter()
    .map(|j| metrics.insert(doc(j)))
    .collect::<Result<_, _>>()?;

    for out in metrics.materialize()? {
        println!("  {}", out.to_json());
    }

    println!("\nSecond api measurement degrades to an error...");
    metrics.update(rows[1], doc(r#"{"service": "api", "status": "error", "latency": 900}"#))?;
    for out in metrics.materialize()? {
        println!("  {}", out.to_json());
    }

    println!("\nThe db measurement is retracted...");
    metrics.remove(rows[2])?;
    for out in metrics.materialize()? {
        println!("  {}", out.to_json());
    }

    let stats = metrics.stats();
    println!("\nScheduler: batch size {}, ewma {:.2}ms, queue {:.0}%",
        stats.current_batch_size,
        stats.ewma_latency_ms,
        stats.queue_utilization * 100.0
    );

    metrics.destroy();
    println!("Collection destroyed; further inserts are rejected: {}",
        metrics.insert(doc(r#"{"service": "api"}"#)).is_err()
    );

    Ok(())
}

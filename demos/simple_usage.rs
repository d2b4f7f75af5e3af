/// Torvane batch API demo
///
/// Demonstrates the one-shot aggregation surface:
/// - Creating a collection from JSON documents
/// - $match / $project / $addFields
/// - $group with several accumulators
/// - $sort + $limit (maintained as a bounded Top-K)
/// - Engine statistics

use Torvane::core::collection::Collection;
use Torvane::core::value::Document;

fn docs(jsons: &[&str]) -> Vec<Document> {
    jsons
        .iter()
        .map(|j| Document::from_json(&serde_json::from_str(j).unwrap()).unwrap())
        .collect()
}

fn pipeline(json: &str) -> Vec<serde_json::Value> {
    serde_json::from_str(json).unwrap()
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("\n=== Torvane aggregation demo ===\n");

    let mut orders = Collection::new(docs(&[
        r#"{"customer": "ada", "total": 120, "items": ["keyboard", "mouse"]}"#,
        r#"{"customer": "grace", "total": 80, "items": ["monitor"]}"#,
        r#"{"customer": "ada", "total": 300, "items": ["laptop"]}"#,
        r#"{"customer": "alan", "total": 40, "items": ["cable", "mouse"]}"#,
        r#"{"customer": "grace", "total": 260, "items": ["dock", "cable"]}"#,
    ]));

    println!("Step 1: filter and reshape");
    let reshaped = orders.aggregate(&pipeline(
        r#"[
            {"$match": {"total": {"$gte": 80}}},
            {"$addFields": {"with_tax": {"$multiply": ["$total", 1.2]}}},
            {"$project": {"customer": 1, "with_tax": 1, "_id": 0}}
        ]"#,
    ))?;
    for doc in &reshaped {
        println!("  {}", doc.to_json());
    }

    println!("\nStep 2: spend per customer");
    let per_customer = orders.aggregate(&pipeline(
        r#"[
            {"$group": {
                "_id": "$customer",
                "orders": {"$sum": 1},
                "spend": {"$sum": "$total"},
                "largest": {"$max": "$total"}
            }}
        ]"#,
    ))?;
    for doc in &per_customer {
        println!("  {}", doc.to_json());
    }

    println!("\nStep 3: most sold items");
    let top_items = orders.aggregate(&pipeline(
        r#"[
            {"$unwind": "$items"},
            {"$group": {"_id": "$items", "n": {"$sum": 1}}},
            {"$sort": {"n": -1, "_id": 1}},
            {"$limit": 3}
        ]"#,
    ))?;
    for doc in &top_items {
        println!("  {}", doc.to_json());
    }

    println!("\nStep 4: engine statistics");
    let stats = orders.stats();
    println!("  documents: {}", stats.live_documents);
    println!("  deltas in: {}", stats.deltas_in);
    println!("  health:    {:?}", stats.health);

    Ok(())
}

//! End-to-End Experiment Example
//!
//! Runs a pricing-page experiment on the in-memory stores: create, start,
//! assign simulated traffic, track purchases, let the scheduler analyze,
//! then read results, stats and recommendations.
//!
//! Run with: RUST_LOG=info cargo run --example end_to_end

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use rand::Rng;
use trueno_ab::config::EngineConfig;
use trueno_ab::experiment::{Event, ExperimentSpec, Metric, MetricType, Variant};
use trueno_ab::lifecycle::ExperimentManager;
use trueno_ab::logging::init_logging;
use trueno_ab::metric_store::MemoryMetricStore;
use trueno_ab::repository::MemoryRepository;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();
    println!("=== Trueno-AB End-to-End Experiment ===\n");

    let config = EngineConfig::builder()
        .tick_interval(Duration::from_millis(200))
        .min_total_sample_size(500)
        .build()
        .context("engine config")?;
    let manager = ExperimentManager::new(
        Arc::new(MemoryRepository::new()),
        Arc::new(MemoryMetricStore::new()),
        config,
    );

    // -------------------------------------------------------------------------
    // 1. Create and start
    // -------------------------------------------------------------------------
    println!("1. Creating experiment...");
    let experiment = manager
        .create(
            ExperimentSpec::builder("Pricing page")
                .description("Annual plan shown first")
                .variant(Variant::new("monthly-first", 0.5))
                .variant(Variant::new("annual-first", 0.5))
                .metric(Metric::new("conversion", MetricType::Binary).primary())
                .metric(Metric::new("plan", MetricType::Categorical))
                .build(),
        )
        .await?;
    let id = experiment.id().to_string();
    manager.start(&id).await?;
    println!("   Experiment ID: {id}");

    // -------------------------------------------------------------------------
    // 2. Simulated traffic
    // -------------------------------------------------------------------------
    println!("\n2. Simulating 2,000 visitors...");
    for user in 0..2_000 {
        let user_id = format!("visitor-{user}");
        let assignment = manager.assign(&id, &user_id).await?;
        let rate = if assignment.variant_name == "annual-first" {
            0.14
        } else {
            0.10
        };
        let converted = rand::thread_rng().gen_bool(rate);

        manager
            .track_event(
                Event::builder(&id, &user_id, &assignment.variant_name, "checkout")
                    .value(if converted { 1.0 } else { 0.0 })
                    .build(),
            )
            .await?;
        if converted {
            manager
                .track_event(Event::new(
                    &id,
                    &user_id,
                    &assignment.variant_name,
                    "experiment_completed",
                ))
                .await?;
        }
    }

    // -------------------------------------------------------------------------
    // 3. Let the scheduler run a pass
    // -------------------------------------------------------------------------
    println!("\n3. Waiting for the scheduler...");
    tokio::time::sleep(Duration::from_millis(500)).await;

    let report = manager.results(&id).await?;
    for row in report
        .results
        .iter()
        .filter(|r| r.metric_name() == "conversion")
    {
        println!(
            "   {:<14} rate={:.4} n={} p={}",
            row.variant_name(),
            row.value(),
            row.sample_size(),
            row.p_value()
                .map_or_else(|| "-".to_string(), |p| format!("{p:.4}"))
        );
    }
    println!("\n   Conclusions:");
    for conclusion in &report.conclusions {
        println!("   - {conclusion}");
    }

    // -------------------------------------------------------------------------
    // 4. Stats and recommendations
    // -------------------------------------------------------------------------
    let stats = manager.stats(&id).await?;
    println!(
        "\n4. Assignments: {} ({:.1}% completed), events: {}",
        stats.total_assignments, stats.completion_rate, stats.total_events
    );
    for recommendation in manager.recommendations(&id).await? {
        println!(
            "   [{:?}] {}",
            recommendation.priority, recommendation.message
        );
    }

    // -------------------------------------------------------------------------
    // 5. Complete
    // -------------------------------------------------------------------------
    let completed = manager.complete(&id).await?;
    println!("\n5. Final status: {}", completed.status().as_str());
    for entry in manager.timeline(&id).await?.timeline {
        println!("   {} {}", entry.timestamp.to_rfc3339(), entry.description);
    }
    println!(
        "   Health: {}",
        serde_json::to_string(&manager.health().await)?
    );

    manager.shutdown().await;
    println!("\n=== Experiment Complete ===");
    Ok(())
}

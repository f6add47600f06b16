// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Basic offline-sync usage example.
//!
//! Demonstrates:
//! 1. Configuring and starting the engine over a SQLite store
//! 2. Reading through the caching strategies (with timing)
//! 3. Re-reading the same resources from cache
//! 4. Queueing a mutation while the backend is unreachable
//! 5. Inspecting outbox, connectivity and quota state
//! 6. Replaying the outbox
//! 7. Displaying metrics (OTEL-compatible)
//! 8. Clean shutdown
//!
//! # Prerequisites
//!
//! An operations API answering on `http://localhost:8000` makes the online
//! paths light up. Without one the demo still runs end to end and shows the
//! offline behavior instead: cold reads answer 503, writes queue with a 202.
//!
//! # Run
//!
//! ```bash
//! cargo run --example basic_usage
//! ```

use std::time::Instant;

use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};
use serde_json::json;
use tokio::sync::watch;

use opsync::{EngineState, HttpMethod, SyncConfig, SyncEngine, SyncRequest};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Install metrics recorder (captures all metrics for OTEL export)
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder.install().expect("failed to install metrics recorder");

    // Simple logging (no filter for simplicity)
    tracing_subscriber::fmt()
        .with_target(false)
        .compact()
        .init();

    println!("\n╔═══════════════════════════════════════════════════════════════╗");
    println!("║              opsync: Basic Usage Example                      ║");
    println!("╚═══════════════════════════════════════════════════════════════╝\n");

    // ─────────────────────────────────────────────────────────────────────────
    // 1. Configure and start the engine
    // ─────────────────────────────────────────────────────────────────────────
    println!("📦 Configuring opsync...");

    let config = SyncConfig {
        // Where the operations API lives
        api_origin: "http://localhost:8000".into(),
        // Durable store for cache, outbox and conflicts
        database_path: Some("./opsync_demo.db".into()),
        ..Default::default()
    };

    let (_config_tx, config_rx) = watch::channel(config.clone());
    let mut engine = SyncEngine::new(config, config_rx)?;

    println!("   State: {:?}", engine.state());

    println!("\n🚀 Starting engine (opening stores)...");
    engine.start().await?;

    assert_eq!(engine.state(), EngineState::Ready);
    println!("   ✅ Engine ready! State: {:?}", engine.state());

    // ─────────────────────────────────────────────────────────────────────────
    // 2. First reads, one per caching strategy
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📖 First reads (cold cache)...");
    println!("   ⏱️  Timing each request; a live backend answers, otherwise");
    println!("       the offline fallbacks do");

    let reads = vec![
        ("shell asset ", "http://localhost:8000/static/app.js"),
        ("critical    ", "http://localhost:8000/api/config/current?tenant=acme"),
        ("api         ", "http://localhost:8000/api/workitems?priority=high&tenant=acme"),
    ];

    for (label, url) in &reads {
        let start = Instant::now();
        let response = engine.handle_request(SyncRequest::get(url)?).await;
        let elapsed = start.elapsed();
        println!(
            "   └─ {} → {} cache={} ({:?})",
            label, response.status, response.served_from_cache, elapsed
        );
    }

    // ─────────────────────────────────────────────────────────────────────────
    // 3. Same reads again - cache answers for whatever was stored
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📖 Same reads again...");
    println!("   ⏱️  Anything the first pass stored now comes from the cache");

    for (label, url) in &reads {
        let start = Instant::now();
        let response = engine.handle_request(SyncRequest::get(url)?).await;
        let elapsed = start.elapsed();
        println!(
            "   └─ {} → {} cache={} ({:?})",
            label, response.status, response.served_from_cache, elapsed
        );
    }

    // ─────────────────────────────────────────────────────────────────────────
    // 4. Submit a mutation
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📝 Submitting a work item update...");

    let mutation = SyncRequest::new(
        HttpMethod::Put,
        "http://localhost:8000/api/workitems/42/status?tenant=acme",
    )?
    .with_body(json!({"status": "resolved"}));

    let ack = engine.handle_request(mutation).await;
    let body = String::from_utf8_lossy(&ack.body);
    println!("   └─ Status: {}", ack.status);
    println!("   └─ Body:   {}", body);
    if ack.status == 202 {
        println!("   💡 Backend unreachable - the write is queued for replay");
    }

    // ─────────────────────────────────────────────────────────────────────────
    // 5. Engine status: connectivity, outbox, quota
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📊 Engine Status:");
    println!("   ┌─ Connectivity");
    println!("   │  └─ Online: {}", engine.is_online());

    if let Some(stats) = engine.sync_stats() {
        println!("   ├─ Outbox");
        println!("   │  └─ Pending:   {}", stats.pending);
        println!("   │  └─ Attempts:  {}", stats.total_attempts);
        println!("   │  └─ Successes: {}", stats.successes);
        println!("   │  └─ Conflicts: {}", stats.conflicts);
    }

    if let Some((pressure, usage)) = engine.quota_pressure().await {
        println!("   └─ Storage");
        println!("      └─ Pressure: {}", pressure);
        println!("      └─ Used:     {} bytes across {} entries", usage.bytes, usage.entries);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // 6. Replay the outbox
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🔁 Draining the outbox for tenant 'acme'...");
    match engine.drain_tenant("acme").await {
        Ok(result) => {
            println!(
                "   └─ total={} replayed={} conflicted={} failed={} requeued={}",
                result.total, result.replayed, result.conflicted, result.failed, result.requeued
            );
            if result.is_clean() {
                println!("   ✅ Every pending mutation was confirmed");
            } else if result.total > 0 {
                println!("   💡 Leftovers wait for the next reconnect or drain");
            }
        }
        Err(e) => println!("   └─ Drain failed: {}", e),
    }

    // ─────────────────────────────────────────────────────────────────────────
    // 7. Dump raw metrics (OTEL-compatible)
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📈 Raw Metrics (OTEL export format):");
    dump_metrics(&snapshotter);

    // ─────────────────────────────────────────────────────────────────────────
    // 8. Clean shutdown
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🛑 Shutting down...");
    engine.shutdown().await;
    println!("   ✅ Shutdown complete! State: {:?}", engine.state());

    println!("\n🧹 Cleaning up demo database...");
    for file in ["./opsync_demo.db", "./opsync_demo.db-shm", "./opsync_demo.db-wal"] {
        let _ = std::fs::remove_file(file);
    }
    println!("   ✅ Cleanup complete!");

    println!("\n╔═══════════════════════════════════════════════════════════════╗");
    println!("║                    Example complete!                          ║");
    println!("╚═══════════════════════════════════════════════════════════════╝\n");

    Ok(())
}

/// Dump all captured metrics in OTEL-compatible format
fn dump_metrics(snapshotter: &Snapshotter) {
    let snapshot = snapshotter.snapshot();

    let mut counters: Vec<_> = vec![];
    let mut gauges: Vec<_> = vec![];
    let mut histograms: Vec<_> = vec![];

    for (composite_key, _, _, value) in snapshot.into_vec() {
        let (_kind, key) = composite_key.into_parts();
        let name = key.name();
        let labels: Vec<_> = key
            .labels()
            .map(|l| format!("{}={}", l.key(), l.value()))
            .collect();
        let label_str = if labels.is_empty() {
            String::new()
        } else {
            format!("{{{}}}", labels.join(","))
        };

        match value {
            DebugValue::Counter(v) => counters.push((name.to_string(), label_str, v)),
            DebugValue::Gauge(v) => gauges.push((name.to_string(), label_str, v.into_inner())),
            DebugValue::Histogram(samples) => {
                let count = samples.len();
                let sum: f64 = samples.iter().map(|v| v.into_inner()).sum();
                let avg = if count > 0 { sum / count as f64 } else { 0.0 };
                histograms.push((name.to_string(), label_str, count, avg));
            }
        }
    }

    counters.sort_by(|a, b| a.0.cmp(&b.0));
    gauges.sort_by(|a, b| a.0.cmp(&b.0));
    histograms.sort_by(|a, b| a.0.cmp(&b.0));

    if !counters.is_empty() {
        println!("   ┌─ Counters (cumulative)");
        for (name, labels, value) in &counters {
            println!("   │  └─ {}{} = {}", name, labels, value);
        }
    }

    if !gauges.is_empty() {
        println!("   ├─ Gauges (current value)");
        for (name, labels, value) in &gauges {
            println!("   │  └─ {}{} = {:.2}", name, labels, value);
        }
    }

    if !histograms.is_empty() {
        println!("   └─ Histograms (distributions)");
        for (name, labels, count, avg) in &histograms {
            println!("   │  └─ {}{} count={} avg={:.4}", name, labels, count, avg);
        }
    }

    if counters.is_empty() && gauges.is_empty() && histograms.is_empty() {
        println!("   └─ (no metrics recorded)");
    }
}

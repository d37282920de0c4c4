// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Basic offline-sync usage example.
//!
//! Demonstrates:
//! 1. Starting the engine on an in-memory SQLite store
//! 2. Loading the catalog and customer roster from a scripted backend
//! 3. Going offline and taking an order locally
//! 4. Reconnecting and pushing the dirty cart and order
//! 5. Displaying metrics
//! 6. Clean shutdown
//!
//! # Run
//!
//! ```bash
//! cargo run --example basic_usage
//! ```

use std::sync::Arc;

use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};
use serde_json::json;

use offline_sync::{
    CartItem, CartRef, EngineConfig, EngineState, Endpoint, InMemoryCommerceApi, NewCart, NewOrder,
    OfflineEngine, PricedLine, ReferenceDomain, IN_MEMORY_PATH,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder.install().expect("failed to install metrics recorder");

    tracing_subscriber::fmt()
        .with_target(false)
        .compact()
        .init();

    println!("\n╔═══════════════════════════════════════════════════════════════╗");
    println!("║           offline-sync: Basic Usage Example                   ║");
    println!("╚═══════════════════════════════════════════════════════════════╝\n");

    // ─────────────────────────────────────────────────────────────────────────
    // 1. Configure and start the engine
    // ─────────────────────────────────────────────────────────────────────────
    let api = Arc::new(InMemoryCommerceApi::new());
    api.seed(
        Endpoint::Categories,
        vec![
            json!({"id": "2", "id_parent": "1", "name": "Home"}),
            json!({"id": "10", "id_parent": "2", "name": "Red wine"}),
        ],
    );
    api.seed(
        Endpoint::Customers,
        (1..=5)
            .map(|id| json!({"id": id.to_string(), "company": format!("Bar {id}")}))
            .collect(),
    );

    let config = EngineConfig {
        database_path: IN_MEMORY_PATH.into(),
        customer_page_size: 2,
        push_backoff_initial_ms: 0,
        push_jitter: 0.0,
        ..Default::default()
    };

    let mut engine = OfflineEngine::new(config, api.clone());
    println!("📦 State: {}", engine.state());
    engine.start().await?;
    assert_eq!(engine.state(), EngineState::Ready);
    println!("   ✅ Engine ready! State: {}", engine.state());

    // ─────────────────────────────────────────────────────────────────────────
    // 2. Reference data
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📖 Loading catalog...");
    let first = engine.load_catalog(ReferenceDomain::Categories, None).await?;
    println!("   └─ {} categories from {}", first.rows.len(), first.source);
    let second = engine.load_catalog(ReferenceDomain::Categories, None).await?;
    println!("   └─ {} categories from {} (fresh cache)", second.rows.len(), second.source);

    let roster = engine.refresh_customers(false).await?;
    println!("   └─ Roster: {} customers in {} pages", roster.fetched, roster.pages);

    // ─────────────────────────────────────────────────────────────────────────
    // 3. Offline order
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📴 Going offline...");
    api.set_reachable(false);

    let lines = [PricedLine {
        unit_price: 10.0,
        unit_excise: 0.10,
        quantity: 12,
    }];
    let totals = engine.order_totals(&lines, 5.0);
    println!("   └─ Totals: {} products, {} paid", totals.total_products_wt, totals.total_paid);

    let cart = engine
        .create_cart_locally(NewCart {
            id_currency: Some(1),
            id_lang: Some(1),
            id_customer: Some(3),
            id_address_delivery: Some(30),
            id_address_invoice: Some(30),
            items: vec![CartItem {
                id_product: 100,
                id_product_attribute: 0,
                quantity: 12,
                id_address_delivery: 30,
            }],
        })
        .await?;
    let order = engine
        .create_order_locally(NewOrder {
            cart: Some(CartRef::Local(cart.clone())),
            id_customer: Some(3),
            id_carrier: Some(2),
            id_address_delivery: Some(30),
            id_address_invoice: Some(30),
            id_currency: Some(1),
            id_lang: Some(1),
            totals,
            ..NewOrder::default()
        })
        .await?;
    println!("   └─ Cart {cart}, order {order}");

    let report = engine.sync_now().await?;
    println!("   └─ Offline pass: {} deferred, {report}", report.deferred);

    // ─────────────────────────────────────────────────────────────────────────
    // 4. Reconnect and push
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📶 Back online, pushing...");
    api.set_reachable(true);
    let report = engine.sync_now().await?;
    println!(
        "   └─ Pushed {} carts and {} orders: {report}",
        report.carts_pushed, report.orders_pushed
    );
    if let Some(order) = engine.order(&order).await? {
        println!("   └─ Order remote id: {:?}", order.sync.remote_id);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // 5. Metrics
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📈 Metrics:");
    dump_metrics(&snapshotter);

    // ─────────────────────────────────────────────────────────────────────────
    // 6. Clean shutdown
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🛑 Shutting down...");
    engine.shutdown().await;
    println!("   ✅ Shutdown complete! State: {}", engine.state());

    Ok(())
}

fn dump_metrics(snapshotter: &Snapshotter) {
    let mut lines: Vec<String> = snapshotter
        .snapshot()
        .into_vec()
        .into_iter()
        .map(|(composite_key, _, _, value)| {
            let (_, key) = composite_key.into_parts();
            let labels: Vec<_> = key.labels().map(|l| format!("{}={}", l.key(), l.value())).collect();
            let label_str = if labels.is_empty() { String::new() } else { format!("{{{}}}", labels.join(",")) };
            let rendered = match value {
                DebugValue::Counter(v) => v.to_string(),
                DebugValue::Gauge(v) => format!("{:.2}", v.into_inner()),
                DebugValue::Histogram(samples) => format!("{} samples", samples.len()),
            };
            format!("{}{} = {}", key.name(), label_str, rendered)
        })
        .collect();
    lines.sort();

    if lines.is_empty() {
        println!("   └─ (no metrics recorded)");
    }
    for line in lines {
        println!("   └─ {line}");
    }
}

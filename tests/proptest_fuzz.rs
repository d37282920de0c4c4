//! Property-based tests (fuzzing) for the offline sync engine.
//!
//! Uses proptest to generate random/malformed inputs and verify the pure
//! parts of the engine hold their contracts and never panic.
//!
//! Run with: `cargo test --test proptest_fuzz`

use chrono::{Duration, TimeZone, Utc};
use proptest::prelude::*;
use serde_json::{Map, Value};

use offline_sync::cache::resolver::coerce_remote_shape;
use offline_sync::records::pricing::{excise_total, order_totals, unit_excise_taxed, PricedLine};
use offline_sync::schema::split_statements;
use offline_sync::{is_stale, SyncState};

// =============================================================================
// Strategies for generating test data
// =============================================================================

/// Generate arbitrary JSON values (including odd structures)
fn arbitrary_json_strategy() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(|n| Value::Number(n.into())),
        ".*".prop_map(Value::String),
    ];

    leaf.prop_recursive(
        3,  // depth
        32, // max nodes
        8,  // items per collection
        |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..8).prop_map(Value::Array),
                prop::collection::hash_map(".*", inner, 0..8)
                    .prop_map(|m| Value::Object(m.into_iter().collect())),
            ]
        },
    )
}

/// Payload-like object: a mix of id fields and ordinary fields
fn payload_strategy() -> impl Strategy<Value = Map<String, Value>> {
    prop::collection::hash_map("(id|id_[a-z]{1,8}|[a-z]{1,8})", arbitrary_json_strategy(), 0..12)
        .prop_map(|m| m.into_iter().collect())
}

/// A priced line with amounts on whole cents
fn line_strategy() -> impl Strategy<Value = PricedLine> {
    (0i64..100_000, 0i64..2_000, 1i64..200).prop_map(|(price_cents, excise_cents, quantity)| PricedLine {
        unit_price: price_cents as f64 / 100.0,
        unit_excise: excise_cents as f64 / 100.0,
        quantity,
    })
}

// =============================================================================
// Staleness
// =============================================================================

proptest! {
    /// Stale exactly when the age is negative or strictly greater than the limit
    #[test]
    fn prop_staleness_boundary(max_age_hours in 0u64..10_000, offset_secs in -3_600i64..3_600) {
        let now = Utc.with_ymd_and_hms(2026, 6, 1, 12, 0, 0).unwrap();
        let limit_secs = max_age_hours as i64 * 3_600;
        let synced = now - Duration::seconds(limit_secs + offset_secs);

        let stale = is_stale(Some(&synced.to_rfc3339()), max_age_hours, now);
        prop_assert_eq!(stale, offset_secs > 0 || limit_secs + offset_secs < 0);
    }

    /// Arbitrary timestamp text never panics; unparsable text is stale
    #[test]
    fn fuzz_staleness_garbage_timestamps(text in ".*", max_age_hours in any::<u64>()) {
        let now = Utc::now();
        let stale = is_stale(Some(&text), max_age_hours, now);
        if chrono::DateTime::parse_from_rfc3339(text.trim()).is_err()
            && chrono::NaiveDateTime::parse_from_str(text.trim(), "%Y-%m-%d %H:%M:%S").is_err()
        {
            prop_assert!(stale);
        }
    }
}

// =============================================================================
// Excise rounding
// =============================================================================

proptest! {
    /// The taxed per-unit excise is floored, never rounded up
    #[test]
    fn prop_unit_excise_never_rounds_up(excise_cents in 0i64..100_000) {
        let excise = excise_cents as f64 / 100.0;
        let taxed = unit_excise_taxed(excise, 1.22);
        let exact = excise_cents as f64 * 1.22 / 100.0;
        prop_assert!(taxed <= exact + 1e-9);
        prop_assert!(exact - taxed < 0.01 + 1e-9);
    }

    /// The line total is the floored unit value times the quantity, summed
    #[test]
    fn prop_excise_total_is_sum_of_floored_units(lines in prop::collection::vec(line_strategy(), 0..20)) {
        let expected_cents: i64 = lines
            .iter()
            .map(|l| (unit_excise_taxed(l.unit_excise, 1.22) * 100.0).round() as i64 * l.quantity)
            .sum();
        let total_cents = (excise_total(&lines, 1.22) * 100.0).round() as i64;
        prop_assert_eq!(total_cents, expected_cents);
    }

    /// Totals are consistent with each other
    #[test]
    fn prop_order_totals_consistent(
        lines in prop::collection::vec(line_strategy(), 0..20),
        shipping_cents in 0i64..10_000,
    ) {
        let totals = order_totals(&lines, 1.22, shipping_cents as f64 / 100.0);
        let paid = totals.total_products_wt + totals.total_shipping_tax_incl;
        prop_assert!((totals.total_paid - paid).abs() < 0.005);
        prop_assert!(totals.total_products_wt + 0.005 >= totals.total_products);
        prop_assert_eq!(totals.total_paid, totals.total_paid_real);
    }
}

// =============================================================================
// Migration script splitting
// =============================================================================

proptest! {
    /// Arbitrary script text never panics and never yields empty statements
    #[test]
    fn fuzz_split_statements(body in ".*") {
        for statement in split_statements(&body) {
            prop_assert!(!statement.trim().is_empty());
        }
    }

    /// Semicolons inside string literals do not split a statement
    #[test]
    fn prop_split_respects_quotes(values in prop::collection::vec("[a-z;]{0,12}", 1..10)) {
        let body: String = values
            .iter()
            .enumerate()
            .map(|(i, v)| format!("INSERT INTO t VALUES ({i}, '{v}');\n"))
            .collect();
        prop_assert_eq!(split_statements(&body).len(), values.len());
    }
}

// =============================================================================
// Remote shape coercion
// =============================================================================

proptest! {
    /// Coercion never panics, is idempotent, and leaves no integer id fields
    #[test]
    fn prop_coerce_remote_shape(mut row in payload_strategy()) {
        coerce_remote_shape(&mut row);
        let once = row.clone();
        coerce_remote_shape(&mut row);
        prop_assert_eq!(&once, &row);

        for (field, value) in &row {
            if field == "id" || field.starts_with("id_") {
                prop_assert!(value.as_i64().is_none());
            }
        }
    }

    /// Unknown sync states are decode errors, not panics
    #[test]
    fn fuzz_sync_state_parse(text in ".*") {
        let parsed = SyncState::parse(&text);
        prop_assert_eq!(
            parsed.is_ok(),
            matches!(text.as_str(), "local_only" | "synced" | "failed")
        );
    }
}

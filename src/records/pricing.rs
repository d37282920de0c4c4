// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Order totals and the excise rounding rule.
//!
//! The per-unit excise, after tax, is floored to the cent before it is
//! multiplied by the quantity:
//!
//! ```text
//! excise_line = floor(unit_excise * tax_multiplier * 100) / 100 * quantity
//! ```
//!
//! This is a business contract, not an approximation, so it is computed in
//! integer cents. Everything else rounds half away from zero to the cent.

use serde::{Deserialize, Serialize};

/// Absorbs binary representation error (0.1 * 1.22 * 100 = 12.199999...).
const CENT_EPSILON: f64 = 1e-9;

/// One priced cart line.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PricedLine {
    /// Unit price, tax excluded
    pub unit_price: f64,
    /// Per-unit excise duty, tax excluded
    pub unit_excise: f64,
    pub quantity: i64,
}

/// Totals carried on an order row.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct OrderTotals {
    pub total_products: f64,
    pub total_products_wt: f64,
    pub total_shipping: f64,
    pub total_shipping_tax_incl: f64,
    pub total_paid: f64,
    pub total_paid_real: f64,
}

fn floor_cents(amount: f64) -> i64 {
    (amount * 100.0 + CENT_EPSILON).floor() as i64
}

fn round_cents(amount: f64) -> i64 {
    (amount * 100.0).round() as i64
}

fn from_cents(cents: i64) -> f64 {
    cents as f64 / 100.0
}

/// Taxed per-unit excise, floored to the cent.
#[must_use]
pub fn unit_excise_taxed(unit_excise: f64, tax_multiplier: f64) -> f64 {
    from_cents(floor_cents(unit_excise * tax_multiplier))
}

fn excise_cents(lines: &[PricedLine], tax_multiplier: f64) -> i64 {
    lines
        .iter()
        .map(|l| floor_cents(l.unit_excise * tax_multiplier).saturating_mul(l.quantity))
        .fold(0, i64::saturating_add)
}

/// Sum of the floored, taxed excise over all lines.
#[must_use]
pub fn excise_total(lines: &[PricedLine], tax_multiplier: f64) -> f64 {
    from_cents(excise_cents(lines, tax_multiplier))
}

/// Full order totals for `lines` plus a tax-excluded `shipping` charge.
#[must_use]
pub fn order_totals(lines: &[PricedLine], tax_multiplier: f64, shipping: f64) -> OrderTotals {
    let products: f64 = lines.iter().map(|l| l.unit_price * l.quantity as f64).sum();
    let products_cents = round_cents(products);
    let products_wt_cents =
        round_cents(products * tax_multiplier).saturating_add(excise_cents(lines, tax_multiplier));
    let shipping_cents = round_cents(shipping);
    let shipping_wt_cents = round_cents(shipping * tax_multiplier);
    let paid_cents = products_wt_cents.saturating_add(shipping_wt_cents);

    OrderTotals {
        total_products: from_cents(products_cents),
        total_products_wt: from_cents(products_wt_cents),
        total_shipping: from_cents(shipping_cents),
        total_shipping_tax_incl: from_cents(shipping_wt_cents),
        total_paid: from_cents(paid_cents),
        total_paid_real: from_cents(paid_cents),
    }
}

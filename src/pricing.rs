//! Pricing Engine

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::metrics::PrintMetrics;
use crate::profile::QuoteParameters;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuoteStatus {
    Quoted,
}

impl QuoteStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuoteStatus::Quoted => "quoted",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub total_price: f64,
    pub currency: String,
    pub estimated_time: Option<String>,
    pub estimated_time_seconds: Option<u64>,
    pub filament_length_mm: Option<f64>,
    pub filament_volume_cm3: Option<f64>,
    pub filament_weight_g: Option<f64>,
    pub filament_cost: Option<f64>,
    pub status: QuoteStatus,
}

/// Price a print.
///
/// `base + hours * cost_per_hour + grams * cost_per_gram`, rounded to cents
/// half away from zero. A missing duration or weight contributes nothing.
pub fn price(metrics: &PrintMetrics, params: &QuoteParameters) -> Quote {
    if metrics.estimated_time_seconds.is_none() {
        warn!("Engine output has no estimated time, pricing zero machine hours");
    }
    if metrics.filament_weight_g.is_none() {
        warn!("Engine output has no filament weight, pricing zero grams");
    }

    let seconds = metrics.estimated_time_seconds.unwrap_or(0) as f64;
    let grams = metrics.filament_weight_g.unwrap_or(0.0);
    let raw = params.base_price
        + (seconds / 3600.0) * params.cost_per_hour
        + grams * params.cost_per_gram;

    Quote {
        total_price: round_cents(raw),
        currency: params.currency.clone(),
        estimated_time: metrics.estimated_time.clone(),
        estimated_time_seconds: metrics.estimated_time_seconds,
        filament_length_mm: metrics.filament_length_mm,
        filament_volume_cm3: metrics.filament_volume_cm3,
        filament_weight_g: metrics.filament_weight_g,
        filament_cost: metrics.filament_cost,
        status: QuoteStatus::Quoted,
    }
}

/// Round to two decimal places, ties away from zero.
pub fn round_cents(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

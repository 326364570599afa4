//! Table-driven fair-price model.
//!
//! Observations are bucketed by asset, mispricing versus the 50-cent
//! anchor, and time remaining in the window. Each cell carries an
//! empirical fair price and a sample count; cells with too few samples
//! are untrusted and never traded.

use std::collections::HashMap;
use std::path::Path;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::info;

use crate::error::StrategyError;
use crate::market::types::{Asset, Market};

/// Width of one mispricing bucket, in price.
const MISPRICING_BUCKET_WIDTH: Decimal = Decimal::from_parts(5, 0, 0, false, 2); // 0.05
/// Width of one time bucket, in seconds.
const TIME_BUCKET_SECONDS: i64 = 60;
/// Cells below this sample count are untrusted.
const DEFAULT_MIN_SAMPLES: u64 = 100;

/// Lookup key into the model table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PriceCell {
    /// Underlying asset.
    pub asset: Asset,
    /// Signed 5-cent buckets of mid-price distance from 0.50.
    pub mispricing_bucket: i32,
    /// One-minute buckets of time remaining in the window.
    pub time_bucket: i64,
}

impl PriceCell {
    /// Bucket a live observation.
    pub fn from_observation(asset: Asset, mid: Decimal, seconds_remaining: i64) -> Self {
        let offset = mid - Decimal::new(50, 2);
        let bucket = (offset / MISPRICING_BUCKET_WIDTH)
            .floor()
            .to_i32()
            .unwrap_or(0);
        let time_bucket = seconds_remaining
            .clamp(0, Market::WINDOW_SECONDS - 1)
            / TIME_BUCKET_SECONDS;
        Self {
            asset,
            mispricing_bucket: bucket,
            time_bucket,
        }
    }
}

/// Fair-price source consulted by the entry gates.
pub trait PriceModel: Send + Sync {
    /// Empirical fair price for a cell, if the table has one.
    fn fair_price(&self, cell: &PriceCell) -> Option<Decimal>;

    /// Whether the cell has enough samples to trade on.
    fn is_trusted(&self, cell: &PriceCell) -> bool;
}

#[derive(Debug, Clone, Deserialize)]
struct TableRow {
    asset: Asset,
    mispricing_bucket: i32,
    time_bucket: i64,
    fair_price: Decimal,
    samples: u64,
}

#[derive(Debug, Clone, Copy)]
struct TableEntry {
    fair_price: Decimal,
    samples: u64,
}

/// Model backed by a JSON table of cells.
pub struct TableModel {
    cells: HashMap<PriceCell, TableEntry>,
    min_samples: u64,
}

impl TableModel {
    /// Load a model from a JSON file of rows.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, StrategyError> {
        let text = std::fs::read_to_string(path.as_ref())
            .map_err(|e| StrategyError::ModelLoadFailed(format!("read: {}", e)))?;
        let rows: Vec<TableRow> = serde_json::from_str(&text)
            .map_err(|e| StrategyError::ModelLoadFailed(format!("parse: {}", e)))?;

        let model = Self::from_rows(rows);
        info!(cells = model.cells.len(), "loaded price model");
        Ok(model)
    }

    /// An empty model; every cell is untrusted.
    pub fn empty() -> Self {
        Self {
            cells: HashMap::new(),
            min_samples: DEFAULT_MIN_SAMPLES,
        }
    }

    fn from_rows(rows: Vec<TableRow>) -> Self {
        let cells = rows
            .into_iter()
            .map(|row| {
                (
                    PriceCell {
                        asset: row.asset,
                        mispricing_bucket: row.mispricing_bucket,
                        time_bucket: row.time_bucket,
                    },
                    TableEntry {
                        fair_price: row.fair_price,
                        samples: row.samples,
                    },
                )
            })
            .collect();
        Self {
            cells,
            min_samples: DEFAULT_MIN_SAMPLES,
        }
    }

    /// Override the minimum sample count.
    pub fn with_min_samples(mut self, min_samples: u64) -> Self {
        self.min_samples = min_samples;
        self
    }
}

impl PriceModel for TableModel {
    fn fair_price(&self, cell: &PriceCell) -> Option<Decimal> {
        self.cells.get(cell).map(|entry| entry.fair_price)
    }

    fn is_trusted(&self, cell: &PriceCell) -> bool {
        self.cells
            .get(cell)
            .map(|entry| entry.samples >= self.min_samples)
            .unwrap_or(false)
    }
}

#[cfg(test)]
pub(crate) struct FixedModel {
    pub fair: Decimal,
    pub trusted: bool,
}

#[cfg(test)]
impl PriceModel for FixedModel {
    fn fair_price(&self, _cell: &PriceCell) -> Option<Decimal> {
        Some(self.fair)
    }

    fn is_trusted(&self, _cell: &PriceCell) -> bool {
        self.trusted
    }
}

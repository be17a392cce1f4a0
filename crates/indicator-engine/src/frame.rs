use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use trading_core::IndicatorRow;

/// Positions where an indicator has insufficient history carry this
/// sentinel. It is never a numerical zero; consumers must check
/// `is_defined` before using a value.
pub const UNDEFINED: f64 = f64::NAN;

#[inline]
pub fn is_defined(value: f64) -> bool {
    !value.is_nan()
}

/// Column-oriented indicator values aligned 1:1 with a bar series.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IndicatorFrame {
    pub ts: Vec<DateTime<Utc>>,
    columns: BTreeMap<String, Vec<f64>>,
}

impl IndicatorFrame {
    pub fn new(ts: Vec<DateTime<Utc>>) -> Self {
        Self {
            ts,
            columns: BTreeMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.ts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ts.is_empty()
    }

    /// Insert a column; panics if the length disagrees with the frame.
    pub fn insert(&mut self, name: impl Into<String>, values: Vec<f64>) {
        assert_eq!(
            values.len(),
            self.ts.len(),
            "column length must match frame length"
        );
        self.columns.insert(name.into(), values);
    }

    pub fn column(&self, name: &str) -> Option<&[f64]> {
        self.columns.get(name).map(|v| v.as_slice())
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.keys().map(|s| s.as_str())
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.contains_key(name)
    }

    /// Merge another frame over the same timestamps into this one.
    pub fn merge(&mut self, other: IndicatorFrame) {
        assert_eq!(self.ts, other.ts, "frames must share a timestamp axis");
        self.columns.extend(other.columns);
    }

    /// Rows for store persistence. Undefined values become JSON null so
    /// they cannot be mistaken for zero on the way back out.
    pub fn to_rows(&self, column: &str) -> Vec<IndicatorRow> {
        let Some(values) = self.columns.get(column) else {
            return Vec::new();
        };
        self.ts
            .iter()
            .zip(values)
            .map(|(ts, &v)| IndicatorRow {
                ts: *ts,
                value: if is_defined(v) {
                    serde_json::json!(v)
                } else {
                    serde_json::Value::Null
                },
            })
            .collect()
    }
}

/// Stable hash of an indicator's parameters: sha256 over the canonical
/// JSON rendering (BTreeMap keys are already sorted).
pub fn params_hash(params: &BTreeMap<String, serde_json::Value>) -> String {
    let canonical = serde_json::to_string(params).unwrap_or_default();
    let digest = Sha256::digest(canonical.as_bytes());
    hex::encode(&digest[..16])
}

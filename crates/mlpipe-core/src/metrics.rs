//! Metrics record written by the evaluation stage.
//!
//! The record is a JSON object of metric name to number. Nested objects are
//! flattened with `.` separators (`{"test": {"r2": 0.9}}` -> `test.r2`);
//! non-numeric leaves are ignored.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::{PipelineError, Result};

/// Display order for the metrics the evaluation script emits.
const KNOWN_METRICS: [&str; 5] = ["mse", "rmse", "mae", "r2", "mape"];

/// Parsed metrics record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MetricsRecord {
    values: BTreeMap<String, f64>,
}

impl MetricsRecord {
    /// Read and parse a metrics file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse a metrics document; the top level must be an object.
    pub fn parse(content: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(content)?;
        if !value.is_object() {
            return Err(PipelineError::Serialization(
                <serde_json::Error as serde::de::Error>::custom(
                    "metrics record must be a JSON object",
                ),
            ));
        }

        let mut values = BTreeMap::new();
        flatten(None, &value, &mut values);
        Ok(MetricsRecord { values })
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.values.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Metrics in display order: known metrics first, then the rest by name.
    pub fn entries(&self) -> Vec<(&str, f64)> {
        let mut entries: Vec<(&str, f64)> =
            self.values.iter().map(|(k, v)| (k.as_str(), *v)).collect();
        entries.sort_by_key(|(name, _)| {
            let rank = KNOWN_METRICS
                .iter()
                .position(|m| m == name)
                .unwrap_or(KNOWN_METRICS.len());
            (rank, *name)
        });
        entries
    }
}

impl fmt::Display for MetricsRecord {
    /// One `NAME: value` line per metric, four decimals.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, value) in self.entries() {
            writeln!(f, "  {}: {:.4}", name.to_uppercase(), value)?;
        }
        Ok(())
    }
}

fn flatten(prefix: Option<&str>, value: &Value, out: &mut BTreeMap<String, f64>) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                let name = match prefix {
                    Some(p) => format!("{p}.{key}"),
                    None => key.clone(),
                };
                flatten(Some(&name), child, out);
            }
        }
        Value::Number(n) => {
            if let (Some(name), Some(v)) = (prefix, n.as_f64()) {
                out.insert(name.to_string(), v);
            }
        }
        other => {
            debug!(metric = ?prefix, value = %other, "Ignoring non-numeric metric");
        }
    }
}

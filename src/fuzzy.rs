//! Fuzzy Engine.
//!
//! Evaluates declared membership functions over indicator columns, emitting
//! one `<feature-id>_<set-name>_membership` column per (feature-id, set-name)
//! pair with values in `[0, 1]`.

use crate::error::{KtrdrError, KtrdrResult};
use crate::indicators::IndicatorFrame;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MembershipFunction {
    Triangular { a: f64, b: f64, c: f64 },
    Trapezoidal { a: f64, b: f64, c: f64, d: f64 },
}

impl MembershipFunction {
    fn evaluate(&self, x: f64) -> f64 {
        if x.is_nan() {
            return f64::NAN;
        }
        match *self {
            Self::Triangular { a, b, c } => {
                if x <= a || x >= c {
                    0.0
                } else if x < b {
                    (x - a) / (b - a)
                } else if x > b {
                    (c - x) / (c - b)
                } else {
                    1.0
                }
            }
            Self::Trapezoidal { a, b, c, d } => {
                if x <= a || x >= d {
                    0.0
                } else if x < b {
                    (x - a) / (b - a)
                } else if x <= c {
                    1.0
                } else {
                    (d - x) / (d - c)
                }
            }
        }
        .clamp(0.0, 1.0)
    }
}

/// `fuzzy_sets[feature_id][set_name] = membership function`, the shape a
/// strategy manifest's `fuzzy_sets` section deserializes into.
pub type FuzzyConfig = BTreeMap<String, BTreeMap<String, MembershipFunction>>;

#[derive(Debug, Clone, Default)]
pub struct FuzzyFrame {
    names: Vec<String>,
    columns: Vec<Vec<f64>>,
    rows: usize,
}

impl FuzzyFrame {
    pub fn len(&self) -> usize {
        self.rows
    }

    pub fn is_empty(&self) -> bool {
        self.rows == 0
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn column(&self, name: &str) -> Option<&[f64]> {
        self.names
            .iter()
            .position(|n| n == name)
            .map(|i| self.columns[i].as_slice())
    }
}

/// Column order is stable: feature-ids sorted alphabetically, set-names
/// within a feature-id sorted alphabetically (a `BTreeMap` gives us this for
/// free). Output row count always equals the input indicator frame's row
/// count.
#[tracing::instrument(skip(indicators, config), fields(rows = indicators.len()))]
pub fn evaluate(indicators: &IndicatorFrame, config: &FuzzyConfig) -> KtrdrResult<FuzzyFrame> {
    let mut names = Vec::new();
    let mut columns = Vec::new();

    for (feature_id, sets) in config {
        let Some(source) = indicators.column(feature_id) else {
            return Err(KtrdrError::FuzzyConfigInvalid {
                feature_id: feature_id.clone(),
                message: "referenced feature-id absent from indicator frame".to_string(),
            });
        };
        for (set_name, membership) in sets {
            let column: Vec<f64> = source.iter().map(|&x| membership.evaluate(x)).collect();
            names.push(format!("{feature_id}_{set_name}_membership"));
            columns.push(column);
        }
    }

    Ok(FuzzyFrame {
        names,
        columns,
        rows: indicators.len(),
    })
}

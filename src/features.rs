//! Feature Engineer.
//!
//! Joins fuzzy memberships, optional price/volume context, and lag features
//! into a supervised feature matrix with a stable, declared column order.

use crate::data::BarFrame;
use crate::fuzzy::FuzzyFrame;
use nalgebra::DMatrix;

#[derive(Debug, Clone, Copy, Default)]
pub struct FeatureConfig {
    pub include_price_context: bool,
    pub include_volume_context: bool,
    pub lookback: usize,
}

/// Rows indexed the same way as the input frames; columns in the declared
/// order (fuzzy memberships, then context, then lag columns).
#[derive(Debug, Clone, Default)]
pub struct FeatureMatrix {
    names: Vec<String>,
    columns: Vec<Vec<f64>>,
    rows: usize,
}

impl FeatureMatrix {
    pub fn rows(&self) -> usize {
        self.rows
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

    /// Row `i` across every column, in declared order.
    pub fn row(&self, i: usize) -> Vec<f64> {
        self.columns.iter().map(|c| c[i]).collect()
    }

    /// Feature-major, sample-minor matrix (rows = features, columns =
    /// samples) — the orientation [`crate::training`] expects.
    pub fn to_dmatrix(&self) -> DMatrix<f64> {
        DMatrix::from_fn(self.columns.len(), self.rows, |r, c| self.columns[r][c])
    }

    /// Drops rows where any column is `NaN` (the warm-up period), returning
    /// the surviving row indices alongside the trimmed matrix.
    pub fn drop_nan_rows(&self) -> (FeatureMatrix, Vec<usize>) {
        let keep: Vec<usize> = (0..self.rows)
            .filter(|&i| self.columns.iter().all(|c| !c[i].is_nan()))
            .collect();
        let columns = self
            .columns
            .iter()
            .map(|c| keep.iter().map(|&i| c[i]).collect())
            .collect();
        (
            FeatureMatrix {
                names: self.names.clone(),
                columns,
                rows: keep.len(),
            },
            keep,
        )
    }
}

fn price_to_sma(bars: &[crate::data::Bar], period: usize) -> Vec<f64> {
    let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
    let mut out = vec![f64::NAN; closes.len()];
    if closes.len() < period {
        return out;
    }
    let mut sum: f64 = closes[..period].iter().sum();
    out[period - 1] = closes[period - 1] / (sum / period as f64);
    for i in period..closes.len() {
        sum += closes[i] - closes[i - period];
        out[i] = closes[i] / (sum / period as f64);
    }
    out
}

fn price_change(bars: &[crate::data::Bar], lag: usize) -> Vec<f64> {
    let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
    let mut out = vec![f64::NAN; closes.len()];
    for i in lag..closes.len() {
        out[i] = (closes[i] - closes[i - lag]) / closes[i - lag];
    }
    out
}

fn volume_ratio(bars: &[crate::data::Bar], period: usize) -> Vec<f64> {
    let volumes: Vec<f64> = bars.iter().map(|b| b.volume).collect();
    let mut out = vec![f64::NAN; volumes.len()];
    if volumes.len() < period {
        return out;
    }
    let mut sum: f64 = volumes[..period].iter().sum();
    out[period - 1] = volumes[period - 1] / (sum / period as f64);
    for i in period..volumes.len() {
        sum += volumes[i] - volumes[i - period];
        out[i] = volumes[i] / (sum / period as f64);
    }
    out
}

fn volume_change(bars: &[crate::data::Bar], lag: usize) -> Vec<f64> {
    let volumes: Vec<f64> = bars.iter().map(|b| b.volume).collect();
    let mut out = vec![f64::NAN; volumes.len()];
    for i in lag..volumes.len() {
        out[i] = (volumes[i] - volumes[i - lag]) / volumes[i - lag];
    }
    out
}

fn shift(column: &[f64], lag: usize) -> Vec<f64> {
    let mut out = vec![f64::NAN; column.len()];
    for i in lag..column.len() {
        out[i] = column[i - lag];
    }
    out
}

/// Column order: fuzzy memberships first (already alphabetical from
/// [`crate::fuzzy::evaluate`]), then optional context columns, then lag
/// columns for each ℓ in `[1, lookback)`.
pub fn prepare(bar_frame: &BarFrame, fuzzy: &FuzzyFrame, config: &FeatureConfig) -> FeatureMatrix {
    let bars = bar_frame.bars();
    let rows = fuzzy.len();
    let mut names = Vec::new();
    let mut columns = Vec::new();

    for name in fuzzy.names() {
        names.push(name.clone());
        columns.push(fuzzy.column(name).unwrap().to_vec());
    }

    if config.include_price_context {
        names.push("price_to_sma".to_string());
        columns.push(price_to_sma(bars, 20));
        names.push("price_change_1".to_string());
        columns.push(price_change(bars, 1));
        names.push("price_change_5".to_string());
        columns.push(price_change(bars, 5));
    }

    if config.include_volume_context {
        names.push("volume_ratio_20".to_string());
        columns.push(volume_ratio(bars, 20));
        names.push("volume_change_1".to_string());
        columns.push(volume_change(bars, 1));
    }

    let fuzzy_column_count = fuzzy.names().len();
    for lag in 1..config.lookback {
        for i in 0..fuzzy_column_count {
            names.push(format!("{}_lag_{}", fuzzy.names()[i], lag));
            columns.push(shift(&columns[i], lag));
        }
    }

    FeatureMatrix {
        names,
        columns,
        rows,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Bar;
    use crate::fuzzy::{evaluate, FuzzyConfig, MembershipFunction};
    use crate::indicators::{compute, IndicatorKind, IndicatorSpec};
    use chrono::{DateTime, Utc};
    use std::collections::BTreeMap;

    fn bar_frame(closes: &[f64]) -> BarFrame {
        let bars = closes
            .iter()
            .enumerate()
            .map(|(i, &c)| Bar {
                ts: DateTime::<Utc>::from_timestamp(i as i64 * 60, 0).unwrap(),
                open: c,
                high: c + 0.5,
                low: c - 0.5,
                close: c,
                volume: 100.0 + i as f64,
            })
            .collect();
        BarFrame::new(bars).unwrap()
    }

    fn fuzzy_frame(bars: &BarFrame) -> FuzzyFrame {
        let indicators = compute(
            bars,
            &[IndicatorSpec {
                feature_id: "sma_3".into(),
                kind: IndicatorKind::Sma { period: 3 },
            }],
        )
        .unwrap();
        let mut sets = BTreeMap::new();
        sets.insert(
            "high".to_string(),
            MembershipFunction::Triangular {
                a: 0.0,
                b: 10.0,
                c: 20.0,
            },
        );
        let mut config = FuzzyConfig::new();
        config.insert("sma_3".to_string(), sets);
        evaluate(&indicators, &config).unwrap()
    }

    #[test]
    fn column_order_follows_declared_sections() {
        let bars = bar_frame(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0]);
        let fuzzy = fuzzy_frame(&bars);
        let config = FeatureConfig {
            include_price_context: true,
            include_volume_context: true,
            lookback: 2,
        };
        let matrix = prepare(&bars, &fuzzy, &config);
        assert_eq!(
            matrix.names(),
            &[
                "sma_3_high_membership".to_string(),
                "price_to_sma".to_string(),
                "price_change_1".to_string(),
                "price_change_5".to_string(),
                "volume_ratio_20".to_string(),
                "volume_change_1".to_string(),
                "sma_3_high_membership_lag_1".to_string(),
            ]
        );
        assert_eq!(matrix.rows(), bars.len());
    }

    #[test]
    fn lag_column_shifts_values_by_one() {
        let bars = bar_frame(&[1.0, 2.0, 3.0, 4.0, 5.0]);
        let fuzzy = fuzzy_frame(&bars);
        let config = FeatureConfig {
            lookback: 2,
            ..Default::default()
        };
        let matrix = prepare(&bars, &fuzzy, &config);
        let base = matrix.column("sma_3_high_membership").unwrap();
        let lagged = matrix.column("sma_3_high_membership_lag_1").unwrap();
        assert!(lagged[0].is_nan());
        for i in 1..base.len() {
            assert_eq!(lagged[i].is_nan(), base[i - 1].is_nan());
            if !lagged[i].is_nan() {
                assert_eq!(lagged[i], base[i - 1]);
            }
        }
    }

    #[test]
    fn drop_nan_rows_removes_warmup_period() {
        let bars = bar_frame(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let fuzzy = fuzzy_frame(&bars);
        let config = FeatureConfig {
            lookback: 1,
            ..Default::default()
        };
        let matrix = prepare(&bars, &fuzzy, &config);
        let (trimmed, kept) = matrix.drop_nan_rows();
        assert!(trimmed.rows() < matrix.rows());
        assert_eq!(trimmed.rows(), kept.len());
    }
}

//! Indicator Engine.
//!
//! Batch-evaluates a declared list of technical indicators over a bar frame.
//! Every indicator preserves head-of-series `NaN`s for its warm-up window;
//! downstream components (the fuzzy engine, the feature engineer) are
//! responsible for dropping them explicitly rather than this module silently
//! shortening the output.

use crate::data::{Bar, BarFrame};
use crate::error::{KtrdrError, KtrdrResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BandPosition {
    Upper,
    Middle,
    Lower,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IndicatorKind {
    Sma { period: usize },
    Ema { period: usize },
    Rsi { period: usize },
    Atr { period: usize },
    VolumeSma { period: usize },
    BollingerBand {
        period: usize,
        num_std: f64,
        band: BandPosition,
    },
}

impl IndicatorKind {
    fn validate(&self, feature_id: &str) -> KtrdrResult<()> {
        let bad = |message: &str| {
            Err(KtrdrError::IndicatorParameterInvalid {
                feature_id: feature_id.to_string(),
                message: message.to_string(),
            })
        };
        match *self {
            Self::Sma { period }
            | Self::Ema { period }
            | Self::Rsi { period }
            | Self::Atr { period }
            | Self::VolumeSma { period } => {
                if period < 1 {
                    return bad("period must be >= 1");
                }
            }
            Self::BollingerBand {
                period, num_std, ..
            } => {
                if period < 1 {
                    return bad("period must be >= 1");
                }
                if !(num_std > 0.0) {
                    return bad("num_std must be > 0");
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndicatorSpec {
    pub feature_id: String,
    #[serde(flatten)]
    pub kind: IndicatorKind,
}

/// Output of [`compute`]: one named, `NaN`-preserving column per spec, in the
/// order the specs were declared.
#[derive(Debug, Clone, Default)]
pub struct IndicatorFrame {
    timestamps: Vec<DateTime<Utc>>,
    names: Vec<String>,
    columns: Vec<Vec<f64>>,
}

impl IndicatorFrame {
    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    pub fn timestamps(&self) -> &[DateTime<Utc>] {
        &self.timestamps
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn column(&self, feature_id: &str) -> Option<&[f64]> {
        self.names
            .iter()
            .position(|n| n == feature_id)
            .map(|i| self.columns[i].as_slice())
    }
}

#[tracing::instrument(skip(frame, specs), fields(bars = frame.len(), specs = specs.len()))]
pub fn compute(frame: &BarFrame, specs: &[IndicatorSpec]) -> KtrdrResult<IndicatorFrame> {
    for spec in specs {
        spec.kind.validate(&spec.feature_id)?;
    }
    let bars = frame.bars();
    let timestamps: Vec<DateTime<Utc>> = bars.iter().map(|b| b.ts).collect();
    let mut names = Vec::with_capacity(specs.len());
    let mut columns = Vec::with_capacity(specs.len());
    for spec in specs {
        names.push(spec.feature_id.clone());
        columns.push(evaluate(bars, spec.kind));
    }
    Ok(IndicatorFrame {
        timestamps,
        names,
        columns,
    })
}

fn evaluate(bars: &[Bar], kind: IndicatorKind) -> Vec<f64> {
    match kind {
        IndicatorKind::Sma { period } => sma(&closes(bars), period),
        IndicatorKind::Ema { period } => ema(&closes(bars), period),
        IndicatorKind::Rsi { period } => rsi(&closes(bars), period),
        IndicatorKind::Atr { period } => atr(bars, period),
        IndicatorKind::VolumeSma { period } => sma(&volumes(bars), period),
        IndicatorKind::BollingerBand {
            period,
            num_std,
            band,
        } => bollinger(&closes(bars), period, num_std, band),
    }
}

fn closes(bars: &[Bar]) -> Vec<f64> {
    bars.iter().map(|b| b.close).collect()
}

fn volumes(bars: &[Bar]) -> Vec<f64> {
    bars.iter().map(|b| b.volume).collect()
}

fn sma(values: &[f64], period: usize) -> Vec<f64> {
    let mut out = vec![f64::NAN; values.len()];
    if values.len() < period {
        return out;
    }
    let mut window_sum: f64 = values[..period].iter().sum();
    out[period - 1] = window_sum / period as f64;
    for i in period..values.len() {
        window_sum += values[i] - values[i - period];
        out[i] = window_sum / period as f64;
    }
    out
}

/// Seeded with the SMA over the first window, then the standard recursive
/// smoothing; the warm-up window is identical to SMA's.
fn ema(values: &[f64], period: usize) -> Vec<f64> {
    let mut out = vec![f64::NAN; values.len()];
    if values.len() < period {
        return out;
    }
    let k = 2.0 / (period as f64 + 1.0);
    let seed: f64 = values[..period].iter().sum::<f64>() / period as f64;
    out[period - 1] = seed;
    let mut prev = seed;
    for i in period..values.len() {
        prev = values[i] * k + prev * (1.0 - k);
        out[i] = prev;
    }
    out
}

/// Wilder's smoothing. First `period` entries are `NaN` since the first
/// average gain/loss needs `period` deltas.
fn rsi(values: &[f64], period: usize) -> Vec<f64> {
    let mut out = vec![f64::NAN; values.len()];
    if values.len() <= period {
        return out;
    }
    let mut gains = 0.0;
    let mut losses = 0.0;
    for i in 1..=period {
        let delta = values[i] - values[i - 1];
        if delta >= 0.0 {
            gains += delta;
        } else {
            losses -= delta;
        }
    }
    let mut avg_gain = gains / period as f64;
    let mut avg_loss = losses / period as f64;
    out[period] = rsi_from_averages(avg_gain, avg_loss);

    for i in (period + 1)..values.len() {
        let delta = values[i] - values[i - 1];
        let (gain, loss) = if delta >= 0.0 { (delta, 0.0) } else { (0.0, -delta) };
        avg_gain = (avg_gain * (period - 1) as f64 + gain) / period as f64;
        avg_loss = (avg_loss * (period - 1) as f64 + loss) / period as f64;
        out[i] = rsi_from_averages(avg_gain, avg_loss);
    }
    out
}

fn rsi_from_averages(avg_gain: f64, avg_loss: f64) -> f64 {
    if avg_loss == 0.0 {
        return 100.0;
    }
    let rs = avg_gain / avg_loss;
    100.0 - 100.0 / (1.0 + rs)
}

/// Wilder's average true range.
fn atr(bars: &[Bar], period: usize) -> Vec<f64> {
    let mut out = vec![f64::NAN; bars.len()];
    if bars.len() <= period {
        return out;
    }
    let true_range = |i: usize| -> f64 {
        let high_low = bars[i].high - bars[i].low;
        if i == 0 {
            return high_low;
        }
        let prev_close = bars[i - 1].close;
        high_low
            .max((bars[i].high - prev_close).abs())
            .max((bars[i].low - prev_close).abs())
    };
    let sum: f64 = (1..=period).map(true_range).sum();
    let mut avg = sum / period as f64;
    out[period] = avg;
    for i in (period + 1)..bars.len() {
        let tr = true_range(i);
        avg = (avg * (period - 1) as f64 + tr) / period as f64;
        out[i] = avg;
    }
    out
}

fn bollinger(values: &[f64], period: usize, num_std: f64, band: BandPosition) -> Vec<f64> {
    let middle = sma(values, period);
    let mut out = vec![f64::NAN; values.len()];
    for i in (period - 1)..values.len() {
        if middle[i].is_nan() {
            continue;
        }
        let window = &values[i + 1 - period..=i];
        let mean = middle[i];
        let variance =
            window.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / period as f64;
        let std_dev = variance.sqrt();
        out[i] = match band {
            BandPosition::Middle => mean,
            BandPosition::Upper => mean + num_std * std_dev,
            BandPosition::Lower => mean - num_std * std_dev,
        };
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(closes: &[f64]) -> BarFrame {
        let bars = closes
            .iter()
            .enumerate()
            .map(|(i, &c)| Bar {
                ts: DateTime::<Utc>::from_timestamp(i as i64 * 60, 0).unwrap(),
                open: c,
                high: c + 0.5,
                low: c - 0.5,
                close: c,
                volume: 100.0,
            })
            .collect();
        BarFrame::new(bars).unwrap()
    }

    #[test]
    fn sma_matches_hand_computed_window() {
        let f = frame(&[1.0, 2.0, 3.0, 4.0, 5.0]);
        let out = compute(
            &f,
            &[IndicatorSpec {
                feature_id: "sma_3".into(),
                kind: IndicatorKind::Sma { period: 3 },
            }],
        )
        .unwrap();
        let col = out.column("sma_3").unwrap();
        assert!(col[0].is_nan());
        assert!(col[1].is_nan());
        assert_eq!(col[2], 2.0);
        assert_eq!(col[3], 3.0);
        assert_eq!(col[4], 4.0);
    }

    #[test]
    fn rsi_is_bounded_and_warms_up() {
        let closes: Vec<f64> = (0..20).map(|i| 100.0 + i as f64).collect();
        let f = frame(&closes);
        let out = compute(
            &f,
            &[IndicatorSpec {
                feature_id: "rsi_14".into(),
                kind: IndicatorKind::Rsi { period: 14 },
            }],
        )
        .unwrap();
        let col = out.column("rsi_14").unwrap();
        assert!(col[13].is_nan());
        for v in &col[14..] {
            assert!(*v >= 0.0 && *v <= 100.0);
        }
        // Strictly increasing closes: all gains, no losses -> RSI saturates at 100.
        assert_eq!(*col.last().unwrap(), 100.0);
    }

    #[test]
    fn zero_period_is_rejected() {
        let f = frame(&[1.0, 2.0, 3.0]);
        let err = compute(
            &f,
            &[IndicatorSpec {
                feature_id: "sma_0".into(),
                kind: IndicatorKind::Sma { period: 0 },
            }],
        )
        .unwrap_err();
        assert_eq!(err.category(), "indicator-parameter-invalid");
    }

    #[test]
    fn bollinger_middle_band_matches_sma() {
        let f = frame(&[1.0, 2.0, 3.0, 4.0, 5.0]);
        let out = compute(
            &f,
            &[
                IndicatorSpec {
                    feature_id: "bb_mid".into(),
                    kind: IndicatorKind::BollingerBand {
                        period: 3,
                        num_std: 2.0,
                        band: BandPosition::Middle,
                    },
                },
                IndicatorSpec {
                    feature_id: "sma_3".into(),
                    kind: IndicatorKind::Sma { period: 3 },
                },
            ],
        )
        .unwrap();
        let bb_mid = out.column("bb_mid").unwrap();
        let sma = out.column("sma_3").unwrap();
        for (a, b) in bb_mid.iter().zip(sma) {
            assert_eq!(a.is_nan(), b.is_nan());
            if !a.is_nan() {
                assert_eq!(a, b);
            }
        }
    }

    #[test]
    fn bollinger_upper_band_is_above_lower() {
        let f = frame(&[1.0, 5.0, 2.0, 8.0, 3.0, 9.0]);
        let out = compute(
            &f,
            &[
                IndicatorSpec {
                    feature_id: "bb_upper".into(),
                    kind: IndicatorKind::BollingerBand {
                        period: 3,
                        num_std: 2.0,
                        band: BandPosition::Upper,
                    },
                },
                IndicatorSpec {
                    feature_id: "bb_lower".into(),
                    kind: IndicatorKind::BollingerBand {
                        period: 3,
                        num_std: 2.0,
                        band: BandPosition::Lower,
                    },
                },
            ],
        )
        .unwrap();
        let upper = out.column("bb_upper").unwrap();
        let lower = out.column("bb_lower").unwrap();
        for i in 2..upper.len() {
            assert!(upper[i] >= lower[i]);
        }
    }
}

//! Data Repository.
//!
//! Loads/saves OHLCV bars keyed by (symbol, timeframe). Backend-agnostic:
//! storage is delegated to a pluggable [`StorageBackend`], selected once at
//! process-startup wiring time from [`crate::config::KtrdrConfig`].

pub mod file_backend;
pub mod timeseries_backend;

use crate::error::{KtrdrError, KtrdrResult};
use crate::time::validate_utc;
use chrono::{DateTime, Utc};
use std::collections::HashSet;

/// A single OHLCV bar. `open`/`high`/`low`/`close`/`volume` are all
/// non-negative; `volume` may be zero, the others may not.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bar {
    pub ts: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Bar {
    pub fn validate(&self) -> KtrdrResult<()> {
        if self.volume < 0.0 {
            return Err(KtrdrError::invalid_input("volume must be non-negative"));
        }
        if self.high < self.open.max(self.close) {
            return Err(KtrdrError::invalid_input(
                "high must be >= max(open, close)",
            ));
        }
        if self.low > self.open.min(self.close) {
            return Err(KtrdrError::invalid_input("low must be <= min(open, close)"));
        }
        Ok(())
    }
}

/// An ordered, UTC-indexed, duplicate-free sequence of bars.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BarFrame {
    bars: Vec<Bar>,
}

impl BarFrame {
    /// Build a frame from bars in any order, enforcing all invariants.
    pub fn new(mut bars: Vec<Bar>) -> KtrdrResult<Self> {
        bars.sort_by_key(|b| b.ts);
        for bar in &bars {
            bar.validate()?;
        }
        let index: Vec<DateTime<Utc>> = bars.iter().map(|b| b.ts).collect();
        validate_utc(&index)?;
        Ok(Self { bars })
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    pub fn bars(&self) -> &[Bar] {
        &self.bars
    }

    pub fn range(&self) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        match (self.bars.first(), self.bars.last()) {
            (Some(first), Some(last)) => Some((first.ts, last.ts)),
            _ => None,
        }
    }

    /// Bars within the half-open range `[start, end)`.
    pub fn slice(&self, start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> BarFrame {
        let bars: Vec<Bar> = self
            .bars
            .iter()
            .filter(|b| start.map_or(true, |s| b.ts >= s) && end.map_or(true, |e| b.ts < e))
            .copied()
            .collect();
        BarFrame { bars }
    }
}

/// Resampling from a base granularity to a coarser timeframe. Market
/// sessions are not clock-aligned, so resampling groups bars by elapsed
/// duration from the first bar rather than by wall-clock boundary alignment.
pub fn resample(base: &BarFrame, target: chrono::Duration) -> KtrdrResult<BarFrame> {
    if base.is_empty() {
        return Ok(BarFrame::default());
    }
    let mut out = Vec::new();
    let mut bucket: Vec<Bar> = Vec::new();
    let mut bucket_start = base.bars()[0].ts;
    for bar in base.bars() {
        if bar.ts >= bucket_start + target {
            if !bucket.is_empty() {
                out.push(fold_bucket(&bucket));
            }
            bucket.clear();
            bucket_start = bar.ts;
        }
        bucket.push(*bar);
    }
    if !bucket.is_empty() {
        out.push(fold_bucket(&bucket));
    }
    BarFrame::new(out)
}

fn fold_bucket(bucket: &[Bar]) -> Bar {
    let open = bucket.first().unwrap().open;
    let close = bucket.last().unwrap().close;
    let high = bucket.iter().fold(f64::MIN, |acc, b| acc.max(b.high));
    let low = bucket.iter().fold(f64::MAX, |acc, b| acc.min(b.low));
    let volume = bucket.iter().map(|b| b.volume).sum();
    Bar {
        ts: bucket.first().unwrap().ts,
        open,
        high,
        low,
        close,
        volume,
    }
}

/// Declared capability every storage backend implements. Resolved at
/// process-startup wiring time; no runtime dispatch hacks.
pub trait StorageBackend: Send + Sync {
    /// A short human-readable label identifying this backend and where it
    /// keeps its data — surfaced verbatim as `storage_location` on data-load
    /// operation results.
    fn describe(&self) -> String;

    fn load(
        &self,
        symbol: &str,
        timeframe: &str,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> KtrdrResult<BarFrame>;

    fn save(&self, symbol: &str, timeframe: &str, frame: &BarFrame) -> KtrdrResult<()>;

    fn list_symbols(&self, timeframe: Option<&str>) -> KtrdrResult<HashSet<String>>;

    fn get_range(
        &self,
        symbol: &str,
        timeframe: &str,
    ) -> KtrdrResult<Option<(DateTime<Utc>, DateTime<Utc>)>>;
}

/// Repository façade: backend-agnostic entry point used by every domain
/// service, per the single invariant that matters outside this module —
/// all internal timestamps are UTC.
pub struct DataRepository {
    backend: Box<dyn StorageBackend>,
}

impl DataRepository {
    pub fn new(backend: Box<dyn StorageBackend>) -> Self {
        Self { backend }
    }

    #[tracing::instrument(skip(self), fields(symbol, timeframe))]
    pub fn load(
        &self,
        symbol: &str,
        timeframe: &str,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> KtrdrResult<BarFrame> {
        let frame = self.backend.load(symbol, timeframe, start, end)?;
        if frame.is_empty() && self.backend.get_range(symbol, timeframe)?.is_none() {
            return Err(KtrdrError::DataNotFound {
                symbol: symbol.to_string(),
                timeframe: timeframe.to_string(),
            });
        }
        let index: Vec<DateTime<Utc>> = frame.bars().iter().map(|b| b.ts).collect();
        validate_utc(&index)?;
        Ok(frame)
    }

    #[tracing::instrument(skip(self, frame), fields(symbol, timeframe, bars = frame.len()))]
    pub fn save(&self, symbol: &str, timeframe: &str, frame: &BarFrame) -> KtrdrResult<()> {
        self.backend.save(symbol, timeframe, frame)
    }

    pub fn list_symbols(&self, timeframe: Option<&str>) -> KtrdrResult<HashSet<String>> {
        self.backend.list_symbols(timeframe)
    }

    pub fn get_range(
        &self,
        symbol: &str,
        timeframe: &str,
    ) -> KtrdrResult<Option<(DateTime<Utc>, DateTime<Utc>)>> {
        self.backend.get_range(symbol, timeframe)
    }

    pub fn describe(&self) -> String {
        self.backend.describe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bar(secs: i64, close: f64) -> Bar {
        Bar {
            ts: DateTime::<Utc>::from_timestamp(secs, 0).unwrap(),
            open: close,
            high: close,
            low: close,
            close,
            volume: 1.0,
        }
    }

    #[test]
    fn frame_rejects_bad_ohlc() {
        let mut b = bar(0, 10.0);
        b.high = 5.0;
        assert!(BarFrame::new(vec![b]).is_err());
    }

    #[test]
    fn frame_sorts_and_dedups_detection() {
        let frame = BarFrame::new(vec![bar(60, 1.0), bar(0, 1.0)]).unwrap();
        assert_eq!(frame.range().unwrap().0.timestamp(), 0);
    }

    #[test]
    fn duplicate_timestamps_rejected() {
        let err = BarFrame::new(vec![bar(0, 1.0), bar(0, 2.0)]).unwrap_err();
        assert_eq!(err.category(), "timezone-violation");
    }

    #[test]
    fn slice_is_half_open() {
        let frame = BarFrame::new(vec![bar(0, 1.0), bar(60, 1.0), bar(120, 1.0)]).unwrap();
        let s = frame.slice(
            Some(DateTime::<Utc>::from_timestamp(0, 0).unwrap()),
            Some(DateTime::<Utc>::from_timestamp(120, 0).unwrap()),
        );
        assert_eq!(s.len(), 2);
    }
}

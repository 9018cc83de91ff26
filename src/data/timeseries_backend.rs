//! Time-series storage backend.
//!
//! Models the hypertable `price_data(instrument, ts, open, high, low, close,
//! volume)` with primary key `(instrument, ts)`, automatically partitioned by
//! instant. Base granularity is a single timeframe; every coarser timeframe
//! requested by the caller is produced by market-hours-aware resampling in
//! memory — never by pre-aggregation, since market sessions are not
//! clock-aligned. This in-process `BTreeMap` implementation stands in for a
//! real Timescale-backed store behind the same `StorageBackend` trait.

use super::{resample, Bar, BarFrame, StorageBackend};
use crate::error::{KtrdrError, KtrdrResult};
use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap, HashSet};

/// Parse a timeframe string (`"5m"`, `"1h"`, `"1d"`) into a duration.
pub fn parse_timeframe(timeframe: &str) -> KtrdrResult<Duration> {
    let (num, unit) = timeframe.split_at(
        timeframe
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(|| KtrdrError::invalid_input(format!("bad timeframe: {timeframe}")))?,
    );
    let n: i64 = num
        .parse()
        .map_err(|_| KtrdrError::invalid_input(format!("bad timeframe: {timeframe}")))?;
    match unit {
        "m" => Ok(Duration::minutes(n)),
        "h" => Ok(Duration::hours(n)),
        "d" => Ok(Duration::days(n)),
        other => Err(KtrdrError::invalid_input(format!(
            "unknown timeframe unit: {other}"
        ))),
    }
}

struct Instrument {
    base_timeframe: String,
    base: BTreeMap<i64, Bar>,
}

pub struct TimeSeriesBackend {
    base_timeframe: String,
    instruments: RwLock<HashMap<String, Instrument>>,
}

impl TimeSeriesBackend {
    /// `base_timeframe` is the single granularity this hypertable stores at
    /// (e.g. `"5m"`); everything coarser is resampled on read.
    pub fn new(base_timeframe: impl Into<String>) -> Self {
        Self {
            base_timeframe: base_timeframe.into(),
            instruments: RwLock::new(HashMap::new()),
        }
    }
}

impl StorageBackend for TimeSeriesBackend {
    fn describe(&self) -> String {
        format!("timeseries:{}", self.base_timeframe)
    }

    fn load(
        &self,
        symbol: &str,
        timeframe: &str,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> KtrdrResult<BarFrame> {
        let instruments = self.instruments.read();
        let Some(instrument) = instruments.get(symbol) else {
            return Ok(BarFrame::default());
        };
        let base_frame = BarFrame::new(instrument.base.values().copied().collect())?;
        let frame = if timeframe == instrument.base_timeframe {
            base_frame
        } else {
            let target = parse_timeframe(timeframe)?;
            resample(&base_frame, target)?
        };
        Ok(frame.slice(start, end))
    }

    fn save(&self, symbol: &str, timeframe: &str, frame: &BarFrame) -> KtrdrResult<()> {
        if timeframe != self.base_timeframe {
            return Err(KtrdrError::invalid_input(format!(
                "time-series backend only accepts writes at base granularity {}, got {}",
                self.base_timeframe, timeframe
            )));
        }
        let mut instruments = self.instruments.write();
        let entry = instruments
            .entry(symbol.to_string())
            .or_insert_with(|| Instrument {
                base_timeframe: timeframe.to_string(),
                base: BTreeMap::new(),
            });
        for bar in frame.bars() {
            let key = bar.ts.timestamp();
            match entry.base.get(&key) {
                Some(existing) if existing != bar => {
                    tracing::warn!(
                        symbol,
                        timeframe,
                        ts = %bar.ts,
                        "data-mismatch: retaining existing value on idempotent import"
                    );
                }
                Some(_) => {}
                None => {
                    entry.base.insert(key, *bar);
                }
            }
        }
        Ok(())
    }

    fn list_symbols(&self, timeframe: Option<&str>) -> KtrdrResult<HashSet<String>> {
        let instruments = self.instruments.read();
        Ok(instruments
            .iter()
            .filter(|(_, i)| timeframe.is_none_or(|t| t == i.base_timeframe))
            .map(|(sym, _)| sym.clone())
            .collect())
    }

    fn get_range(
        &self,
        symbol: &str,
        _timeframe: &str,
    ) -> KtrdrResult<Option<(DateTime<Utc>, DateTime<Utc>)>> {
        let instruments = self.instruments.read();
        let Some(instrument) = instruments.get(symbol) else {
            return Ok(None);
        };
        let first = instrument.base.values().next();
        let last = instrument.base.values().next_back();
        Ok(first.zip(last).map(|(f, l)| (f.ts, l.ts)))
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
    fn resamples_to_coarser_timeframe_on_read() {
        let backend = TimeSeriesBackend::new("5m");
        let bars: Vec<Bar> = (0..12).map(|i| bar(i * 300, i as f64)).collect();
        backend
            .save("AAPL", "5m", &BarFrame::new(bars).unwrap())
            .unwrap();
        let hourly = backend.load("AAPL", "1h", None, None).unwrap();
        assert_eq!(hourly.len(), 1);
    }

    #[test]
    fn rejects_writes_at_non_base_granularity() {
        let backend = TimeSeriesBackend::new("5m");
        let frame = BarFrame::new(vec![bar(0, 1.0)]).unwrap();
        assert!(backend.save("AAPL", "1h", &frame).is_err());
    }

    #[test]
    fn parses_common_timeframes() {
        assert_eq!(parse_timeframe("5m").unwrap(), Duration::minutes(5));
        assert_eq!(parse_timeframe("1h").unwrap(), Duration::hours(1));
        assert_eq!(parse_timeframe("1d").unwrap(), Duration::days(1));
        assert!(parse_timeframe("bogus").is_err());
    }
}

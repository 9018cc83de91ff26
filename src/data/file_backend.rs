//! Flat-file storage backend: one CSV file per (symbol, timeframe), sorted,
//! header `timestamp,open,high,low,close,volume`, timestamps ISO-8601 UTC
//! with a `Z` suffix.

use super::{Bar, BarFrame, StorageBackend};
use crate::error::{KtrdrError, KtrdrResult};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

pub struct FileBackend {
    root: PathBuf,
    // Serializes save() so the read-modify-write-rename cycle is atomic
    // with respect to other writers in this process.
    write_lock: Mutex<()>,
}

impl FileBackend {
    pub fn new(root: impl Into<PathBuf>) -> KtrdrResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            write_lock: Mutex::new(()),
        })
    }

    fn path_for(&self, symbol: &str, timeframe: &str) -> PathBuf {
        self.root.join(format!("{symbol}_{timeframe}.csv"))
    }

    fn read_file(path: &Path) -> KtrdrResult<Vec<Bar>> {
        if !path.exists() {
            return Ok(Vec::new());
        }
        let mut reader = csv::Reader::from_path(path)?;
        let mut bars = Vec::new();
        for record in reader.records() {
            let record = record?;
            let ts = DateTime::parse_from_rfc3339(&record[0])
                .map_err(|e| KtrdrError::storage(e.to_string()))?
                .with_timezone(&Utc);
            bars.push(Bar {
                ts,
                open: record[1].parse().map_err(|_| KtrdrError::storage("bad open"))?,
                high: record[2].parse().map_err(|_| KtrdrError::storage("bad high"))?,
                low: record[3].parse().map_err(|_| KtrdrError::storage("bad low"))?,
                close: record[4]
                    .parse()
                    .map_err(|_| KtrdrError::storage("bad close"))?,
                volume: record[5]
                    .parse()
                    .map_err(|_| KtrdrError::storage("bad volume"))?,
            });
        }
        Ok(bars)
    }

    fn write_file(path: &Path, bars: &[Bar]) -> KtrdrResult<()> {
        let tmp = path.with_extension("csv.tmp");
        {
            let mut writer = csv::Writer::from_path(&tmp)?;
            writer.write_record(["timestamp", "open", "high", "low", "close", "volume"])?;
            for bar in bars {
                writer.write_record([
                    bar.ts.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
                    bar.open.to_string(),
                    bar.high.to_string(),
                    bar.low.to_string(),
                    bar.close.to_string(),
                    bar.volume.to_string(),
                ])?;
            }
            writer.flush()?;
        }
        fs::rename(&tmp, path)?;
        Ok(())
    }
}

impl StorageBackend for FileBackend {
    fn describe(&self) -> String {
        format!("file:{}", self.root.display())
    }

    fn load(
        &self,
        symbol: &str,
        timeframe: &str,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> KtrdrResult<BarFrame> {
        let path = self.path_for(symbol, timeframe);
        let bars = Self::read_file(&path)?;
        let frame = BarFrame::new(bars)?;
        Ok(frame.slice(start, end))
    }

    fn save(&self, symbol: &str, timeframe: &str, frame: &BarFrame) -> KtrdrResult<()> {
        let _guard = self.write_lock.lock();
        let path = self.path_for(symbol, timeframe);
        let existing = Self::read_file(&path)?;
        let mut merged: std::collections::BTreeMap<i64, Bar> = existing
            .into_iter()
            .map(|b| (b.ts.timestamp(), b))
            .collect();

        for bar in frame.bars() {
            match merged.get(&bar.ts.timestamp()) {
                Some(existing) if existing != bar => {
                    tracing::warn!(
                        symbol,
                        timeframe,
                        ts = %bar.ts,
                        existing_close = existing.close,
                        incoming_close = bar.close,
                        "data-mismatch: retaining existing value on idempotent import"
                    );
                }
                Some(_) => {}
                None => {
                    merged.insert(bar.ts.timestamp(), *bar);
                }
            }
        }
        let bars: Vec<Bar> = merged.into_values().collect();
        Self::write_file(&path, &bars)
    }

    fn list_symbols(&self, timeframe: Option<&str>) -> KtrdrResult<HashSet<String>> {
        let mut out = HashSet::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            let Some(stem) = name.strip_suffix(".csv") else {
                continue;
            };
            let Some((sym, tf)) = stem.rsplit_once('_') else {
                continue;
            };
            if timeframe.map_or(true, |t| t == tf) {
                out.insert(sym.to_string());
            }
        }
        Ok(out)
    }

    fn get_range(
        &self,
        symbol: &str,
        timeframe: &str,
    ) -> KtrdrResult<Option<(DateTime<Utc>, DateTime<Utc>)>> {
        let path = self.path_for(symbol, timeframe);
        if !path.exists() {
            return Ok(None);
        }
        let bars = Self::read_file(&path)?;
        let frame = BarFrame::new(bars)?;
        Ok(frame.range())
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
    fn save_then_load_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileBackend::new(dir.path()).unwrap();
        let frame = BarFrame::new(vec![bar(0, 1.0), bar(60, 2.0)]).unwrap();
        backend.save("AAPL", "1h", &frame).unwrap();
        let loaded = backend.load("AAPL", "1h", None, None).unwrap();
        assert_eq!(loaded.len(), 2);
    }

    #[test]
    fn idempotent_import_keeps_existing_value() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileBackend::new(dir.path()).unwrap();
        let frame = BarFrame::new(vec![bar(0, 187.10)]).unwrap();
        backend.save("AAPL", "1h", &frame).unwrap();

        let mut conflicting = bar(0, 999.99);
        conflicting.open = 999.99;
        conflicting.high = 999.99;
        conflicting.low = 999.99;
        backend
            .save("AAPL", "1h", &BarFrame::new(vec![conflicting]).unwrap())
            .unwrap();

        let loaded = backend.load("AAPL", "1h", None, None).unwrap();
        assert_eq!(loaded.bars()[0].close, 187.10);
    }

    #[test]
    fn missing_symbol_has_no_range() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileBackend::new(dir.path()).unwrap();
        assert!(backend.get_range("NOPE", "1h").unwrap().is_none());
    }

    #[test]
    fn list_symbols_filters_by_timeframe() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileBackend::new(dir.path()).unwrap();
        let frame = BarFrame::new(vec![bar(0, 1.0)]).unwrap();
        backend.save("AAPL", "1h", &frame).unwrap();
        backend.save("MSFT", "1d", &frame).unwrap();
        assert_eq!(
            backend.list_symbols(Some("1h")).unwrap(),
            HashSet::from(["AAPL".to_string()])
        );
    }
}

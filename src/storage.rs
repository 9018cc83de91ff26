//! Model Storage.
//!
//! Versioned model artefact directories:
//! `root/{strategy}/{symbol}_{timeframe}_v{version}/`, holding
//! `weights.json`, `metrics.json`, `importance.json`, and `config.json`
//! (the effective manifest snapshot, not the raw input).

use crate::error::{KtrdrError, KtrdrResult};
use crate::training::network::Network;
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

#[derive(Serialize, Deserialize)]
struct NetworkSnapshot {
    weights: Vec<(usize, usize, Vec<f64>)>,
    biases: Vec<Vec<f64>>,
}

impl From<&Network> for NetworkSnapshot {
    fn from(net: &Network) -> Self {
        Self {
            weights: net
                .weights
                .iter()
                .map(|w| (w.nrows(), w.ncols(), w.iter().copied().collect()))
                .collect(),
            biases: net.biases.iter().map(|b| b.iter().copied().collect()).collect(),
        }
    }
}

impl From<NetworkSnapshot> for Network {
    fn from(snapshot: NetworkSnapshot) -> Self {
        let weights = snapshot
            .weights
            .into_iter()
            .map(|(rows, cols, data)| DMatrix::from_row_slice(rows, cols, &data))
            .collect();
        let biases = snapshot
            .biases
            .into_iter()
            .map(DVector::from_vec)
            .collect();
        Network { weights, biases }
    }
}

pub struct ModelStorage {
    root: PathBuf,
}

impl ModelStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn strategy_dir(&self, strategy: &str) -> PathBuf {
        self.root.join(strategy)
    }

    fn version_prefix(symbol: &str, timeframe: &str) -> String {
        format!("{symbol}_{timeframe}_v")
    }

    fn existing_versions(&self, strategy_dir: &Path, symbol: &str, timeframe: &str) -> Vec<u32> {
        let Ok(entries) = fs::read_dir(strategy_dir) else {
            return Vec::new();
        };
        let prefix = Self::version_prefix(symbol, timeframe);
        entries
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter_map(|name| name.strip_prefix(&prefix).map(str::to_string))
            .filter_map(|suffix| suffix.parse::<u32>().ok())
            .collect()
    }

    /// Computes `max(existing) + 1` and atomically creates that version's
    /// directory. If directory creation races with another writer, re-reads
    /// the existing versions and retries against a higher number.
    fn claim_next_version(
        &self,
        strategy_dir: &Path,
        symbol: &str,
        timeframe: &str,
    ) -> KtrdrResult<(u32, PathBuf)> {
        fs::create_dir_all(strategy_dir)?;
        loop {
            let next = self
                .existing_versions(strategy_dir, symbol, timeframe)
                .into_iter()
                .max()
                .unwrap_or(0)
                + 1;
            let candidate = strategy_dir.join(format!("{}{}", Self::version_prefix(symbol, timeframe), next));
            match fs::create_dir(&candidate) {
                Ok(()) => return Ok((next, candidate)),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn write_json(path: &Path, value: &serde_json::Value) -> KtrdrResult<()> {
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(value).map_err(|e| KtrdrError::storage(e.to_string()))?)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }

    fn read_json(path: &Path) -> KtrdrResult<Option<serde_json::Value>> {
        if !path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(path)?;
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| KtrdrError::storage(e.to_string()))
    }

    #[allow(clippy::too_many_arguments)]
    pub fn save(
        &self,
        model: &Network,
        strategy: &str,
        symbol: &str,
        timeframe: &str,
        metrics: &serde_json::Value,
        importance: &serde_json::Value,
        effective_config: &serde_json::Value,
    ) -> KtrdrResult<PathBuf> {
        let strategy_dir = self.strategy_dir(strategy);
        let (_version, dir) = self.claim_next_version(&strategy_dir, symbol, timeframe)?;

        let snapshot = NetworkSnapshot::from(model);
        let weights_json =
            serde_json::to_value(&snapshot).map_err(|e| KtrdrError::storage(e.to_string()))?;
        Self::write_json(&dir.join("weights.json"), &weights_json)?;
        Self::write_json(&dir.join("metrics.json"), metrics)?;
        Self::write_json(&dir.join("importance.json"), importance)?;
        Self::write_json(&dir.join("config.json"), effective_config)?;

        Ok(dir)
    }

    pub fn load(&self, artefact_path: &Path) -> KtrdrResult<(Network, serde_json::Value)> {
        let weights = Self::read_json(&artefact_path.join("weights.json"))?;
        let metrics = Self::read_json(&artefact_path.join("metrics.json"))?;
        let config = Self::read_json(&artefact_path.join("config.json"))?;

        let missing = [
            (weights.is_none(), "weights"),
            (metrics.is_none(), "metrics"),
            (config.is_none(), "config-snapshot"),
        ]
        .into_iter()
        .find(|(absent, _)| *absent)
        .map(|(_, name)| name);

        if let Some(missing) = missing {
            return Err(KtrdrError::ArtefactMissing {
                path: artefact_path.display().to_string(),
                missing: missing.to_string(),
            });
        }

        let snapshot: NetworkSnapshot = serde_json::from_value(weights.unwrap())
            .map_err(|e| KtrdrError::storage(e.to_string()))?;
        Ok((Network::from(snapshot), config.unwrap()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use serde_json::json;

    fn toy_network() -> Network {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        Network::new(3, &[4], &mut rng)
    }

    #[test]
    fn first_save_claims_version_one() {
        let dir = tempfile::tempdir().unwrap();
        let storage = ModelStorage::new(dir.path());
        let path = storage
            .save(
                &toy_network(),
                "trend",
                "AAPL",
                "1h",
                &json!({"val_loss": 0.1}),
                &json!({}),
                &json!({"hidden_layers": [4]}),
            )
            .unwrap();
        assert_eq!(path.file_name().unwrap().to_str().unwrap(), "AAPL_1h_v1");
    }

    #[test]
    fn second_save_claims_version_two() {
        let dir = tempfile::tempdir().unwrap();
        let storage = ModelStorage::new(dir.path());
        for _ in 0..2 {
            storage
                .save(
                    &toy_network(),
                    "trend",
                    "AAPL",
                    "1h",
                    &json!({}),
                    &json!({}),
                    &json!({}),
                )
                .unwrap();
        }
        let versions = storage.existing_versions(&storage.strategy_dir("trend"), "AAPL", "1h");
        assert_eq!(versions.into_iter().max(), Some(2));
    }

    #[test]
    fn save_then_load_roundtrips_weights() {
        let dir = tempfile::tempdir().unwrap();
        let storage = ModelStorage::new(dir.path());
        let net = toy_network();
        let path = storage
            .save(&net, "trend", "AAPL", "1h", &json!({}), &json!({}), &json!({"lr": 0.01}))
            .unwrap();
        let (loaded, config) = storage.load(&path).unwrap();
        assert_eq!(loaded.weights[0].shape(), net.weights[0].shape());
        assert_eq!(config["lr"], 0.01);
    }

    #[test]
    fn load_fails_with_artefact_missing_when_metrics_absent() {
        let dir = tempfile::tempdir().unwrap();
        let storage = ModelStorage::new(dir.path());
        let artefact_dir = dir.path().join("incomplete");
        fs::create_dir_all(&artefact_dir).unwrap();
        fs::write(artefact_dir.join("weights.json"), "{}").unwrap();
        fs::write(artefact_dir.join("config.json"), "{}").unwrap();
        let err = storage.load(&artefact_dir).unwrap_err();
        assert_eq!(err.category(), "artefact-missing");
    }
}

//! Strategy Manifest parsing.
//!
//! Consumed by the training pipeline (C13). The document format is sniffed
//! from the first non-whitespace byte: `{` means JSON, anything else is
//! parsed as TOML. Unknown top-level keys are rejected; unknown keys nested
//! within a recognized section are ignored with a warning.

use crate::error::{KtrdrError, KtrdrResult};
use crate::features::FeatureConfig;
use crate::fuzzy::FuzzyConfig;
use crate::indicators::IndicatorSpec;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

const TOP_LEVEL_KEYS: &[&str] = &["name", "indicators", "fuzzy_sets", "model", "features", "training"];
const MODEL_KEYS: &[&str] = &["hidden_layers", "learning_rate"];
const FEATURES_KEYS: &[&str] = &["lookback", "include_price_context", "include_volume_context"];
const TRAINING_KEYS: &[&str] = &[
    "zigzag_threshold",
    "zigzag_lookahead",
    "train_ratio",
    "val_ratio",
    "test_ratio",
    "patience",
    "max_epochs",
    "batch_size",
    "importance_iterations",
];

fn default_learning_rate() -> f64 {
    0.01
}
fn default_patience() -> usize {
    10
}
fn default_max_epochs() -> usize {
    200
}
fn default_batch_size() -> usize {
    32
}
fn default_importance_iterations() -> usize {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSection {
    pub hidden_layers: Vec<usize>,
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeaturesSection {
    pub lookback: usize,
    #[serde(default)]
    pub include_price_context: bool,
    #[serde(default)]
    pub include_volume_context: bool,
}

impl From<&FeaturesSection> for FeatureConfig {
    fn from(section: &FeaturesSection) -> Self {
        FeatureConfig {
            include_price_context: section.include_price_context,
            include_volume_context: section.include_volume_context,
            lookback: section.lookback,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingSection {
    pub zigzag_threshold: f64,
    pub zigzag_lookahead: usize,
    pub train_ratio: f64,
    pub val_ratio: f64,
    pub test_ratio: f64,
    #[serde(default = "default_patience")]
    pub patience: usize,
    #[serde(default = "default_max_epochs")]
    pub max_epochs: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_importance_iterations")]
    pub importance_iterations: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyManifest {
    pub name: String,
    pub indicators: Vec<IndicatorSpec>,
    pub fuzzy_sets: FuzzyConfig,
    pub model: ModelSection,
    pub features: FeaturesSection,
    pub training: TrainingSection,
}

fn sniff_to_json(input: &str) -> KtrdrResult<serde_json::Value> {
    let first_non_ws = input.trim_start().chars().next();
    match first_non_ws {
        Some('{') => serde_json::from_str(input).map_err(|e| KtrdrError::invalid_input(e.to_string())),
        _ => {
            let toml_value: toml::Value =
                toml::from_str(input).map_err(|e| KtrdrError::invalid_input(e.to_string()))?;
            serde_json::to_value(toml_value).map_err(|e| KtrdrError::invalid_input(e.to_string()))
        }
    }
}

fn check_unknown_keys(object: &serde_json::Map<String, serde_json::Value>, allowed: &[&str], context: &str) -> KtrdrResult<()> {
    for key in object.keys() {
        if !allowed.contains(&key.as_str()) {
            return Err(KtrdrError::invalid_input(format!(
                "unknown key '{key}' in {context}"
            )));
        }
    }
    Ok(())
}

fn warn_unknown_nested_keys(value: &serde_json::Value, allowed: &[&str], section: &str) {
    let Some(object) = value.as_object() else {
        return;
    };
    for key in object.keys() {
        if !allowed.contains(&key.as_str()) {
            tracing::warn!(section, key, "unknown key ignored in strategy manifest section");
        }
    }
}

fn validate_fuzzy_references(manifest: &StrategyManifest) -> KtrdrResult<()> {
    let declared: HashSet<&str> = manifest
        .indicators
        .iter()
        .map(|spec| spec.feature_id.as_str())
        .collect();
    for feature_id in manifest.fuzzy_sets.keys() {
        if !declared.contains(feature_id.as_str()) {
            return Err(KtrdrError::FuzzyConfigInvalid {
                feature_id: feature_id.clone(),
                message: "referenced in fuzzy_sets but not declared in indicators".to_string(),
            });
        }
    }
    Ok(())
}

/// Parses, then validates top-level keys (rejected if unknown), nested keys
/// within `model`/`features`/`training` (warned if unknown), and the
/// fuzzy-sets-reference-indicators invariant.
pub fn parse(input: &str) -> KtrdrResult<StrategyManifest> {
    let value = sniff_to_json(input)?;
    let Some(object) = value.as_object() else {
        return Err(KtrdrError::invalid_input("manifest must be a document with top-level keys"));
    };
    check_unknown_keys(object, TOP_LEVEL_KEYS, "top-level manifest")?;
    if let Some(model) = object.get("model") {
        warn_unknown_nested_keys(model, MODEL_KEYS, "model");
    }
    if let Some(features) = object.get("features") {
        warn_unknown_nested_keys(features, FEATURES_KEYS, "features");
    }
    if let Some(training) = object.get("training") {
        warn_unknown_nested_keys(training, TRAINING_KEYS, "training");
    }

    let manifest: StrategyManifest =
        serde_json::from_value(value).map_err(|e| KtrdrError::invalid_input(e.to_string()))?;
    validate_fuzzy_references(&manifest)?;
    Ok(manifest)
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOML_MANIFEST: &str = r#"
        name = "trend-follower"

        [[indicators]]
        feature_id = "rsi_14"
        kind = "rsi"
        period = 14

        [fuzzy_sets.rsi_14.oversold]
        type = "triangular"
        a = 0.0
        b = 20.0
        c = 40.0

        [model]
        hidden_layers = [16, 8]

        [features]
        lookback = 3

        [training]
        zigzag_threshold = 0.03
        zigzag_lookahead = 10
        train_ratio = 0.7
        val_ratio = 0.15
        test_ratio = 0.15
    "#;

    #[test]
    fn parses_toml_manifest() {
        let manifest = parse(TOML_MANIFEST).unwrap();
        assert_eq!(manifest.name, "trend-follower");
        assert_eq!(manifest.indicators.len(), 1);
        assert_eq!(manifest.model.hidden_layers, vec![16, 8]);
        assert_eq!(manifest.training.patience, default_patience());
    }

    #[test]
    fn parses_equivalent_json_manifest() {
        let json = r#"{
            "name": "trend-follower",
            "indicators": [{"feature_id": "rsi_14", "kind": "rsi", "period": 14}],
            "fuzzy_sets": {"rsi_14": {"oversold": {"type": "triangular", "a": 0.0, "b": 20.0, "c": 40.0}}},
            "model": {"hidden_layers": [16, 8]},
            "features": {"lookback": 3},
            "training": {"zigzag_threshold": 0.03, "zigzag_lookahead": 10, "train_ratio": 0.7, "val_ratio": 0.15, "test_ratio": 0.15}
        }"#;
        let manifest = parse(json).unwrap();
        assert_eq!(manifest.name, "trend-follower");
    }

    #[test]
    fn rejects_unknown_top_level_key() {
        let json = r#"{"name": "x", "bogus": 1, "indicators": [], "fuzzy_sets": {}, "model": {"hidden_layers": []}, "features": {"lookback": 1}, "training": {"zigzag_threshold": 0.01, "zigzag_lookahead": 1, "train_ratio": 0.8, "val_ratio": 0.1, "test_ratio": 0.1}}"#;
        let err = parse(json).unwrap_err();
        assert_eq!(err.category(), "invalid-input");
    }

    #[test]
    fn rejects_fuzzy_set_referencing_undeclared_indicator() {
        let json = r#"{
            "name": "x",
            "indicators": [],
            "fuzzy_sets": {"missing": {"low": {"type": "triangular", "a": 0.0, "b": 1.0, "c": 2.0}}},
            "model": {"hidden_layers": []},
            "features": {"lookback": 1},
            "training": {"zigzag_threshold": 0.01, "zigzag_lookahead": 1, "train_ratio": 0.8, "val_ratio": 0.1, "test_ratio": 0.1}
        }"#;
        let err = parse(json).unwrap_err();
        assert_eq!(err.category(), "fuzzy-config-invalid");
    }

    #[test]
    fn tolerates_unknown_nested_key_with_a_warning() {
        let json = r#"{
            "name": "x",
            "indicators": [],
            "fuzzy_sets": {},
            "model": {"hidden_layers": [], "mystery_knob": 42},
            "features": {"lookback": 1},
            "training": {"zigzag_threshold": 0.01, "zigzag_lookahead": 1, "train_ratio": 0.8, "val_ratio": 0.1, "test_ratio": 0.1}
        }"#;
        assert!(parse(json).is_ok());
    }
}

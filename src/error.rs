//! Error categories shared by every component.
//!
//! One variant per category from the error-handling design: each carries
//! enough context to populate an `Operation Record`'s `error.detail` map
//! without the caller having to reconstruct it.

use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum KtrdrError {
    #[error("invalid input: {message}")]
    InvalidInput { message: String },

    #[error("no data for {symbol}/{timeframe}")]
    DataNotFound { symbol: String, timeframe: String },

    #[error("timezone violation: {message}")]
    TimezoneViolation { message: String },

    #[error("invalid indicator parameter for {feature_id}: {message}")]
    IndicatorParameterInvalid { feature_id: String, message: String },

    #[error("invalid fuzzy config for {feature_id}: {message}")]
    FuzzyConfigInvalid { feature_id: String, message: String },

    #[error("training diverged: {message}")]
    TrainingDiverged {
        message: String,
        best_epoch: Option<usize>,
    },

    #[error("storage error: {message}")]
    StorageError { message: String },

    #[error("illegal transition: {from} -> {to}")]
    IllegalTransition { from: String, to: String },

    #[error("artefact missing at {path}: {missing}")]
    ArtefactMissing { path: String, missing: String },

    #[error("operation timed out after {elapsed_secs}s")]
    Timeout { elapsed_secs: u64 },

    #[error("cancelled: {reason}")]
    Cancelled { reason: String },
}

impl KtrdrError {
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::StorageError {
            message: message.into(),
        }
    }

    /// Stable category string, persisted verbatim on the Operation Record.
    pub fn category(&self) -> &'static str {
        match self {
            Self::InvalidInput { .. } => "invalid-input",
            Self::DataNotFound { .. } => "data-not-found",
            Self::TimezoneViolation { .. } => "timezone-violation",
            Self::IndicatorParameterInvalid { .. } => "indicator-parameter-invalid",
            Self::FuzzyConfigInvalid { .. } => "fuzzy-config-invalid",
            Self::TrainingDiverged { .. } => "training-diverged",
            Self::StorageError { .. } => "storage-error",
            Self::IllegalTransition { .. } => "illegal-transition",
            Self::ArtefactMissing { .. } => "artefact-missing",
            Self::Timeout { .. } => "timeout",
            Self::Cancelled { .. } => "cancelled",
        }
    }

    /// Free-form detail map, stable per category.
    pub fn detail(&self) -> HashMap<String, String> {
        let mut d = HashMap::new();
        match self {
            Self::DataNotFound { symbol, timeframe } => {
                d.insert("symbol".into(), symbol.clone());
                d.insert("timeframe".into(), timeframe.clone());
            }
            Self::IndicatorParameterInvalid { feature_id, .. }
            | Self::FuzzyConfigInvalid { feature_id, .. } => {
                d.insert("feature_id".into(), feature_id.clone());
            }
            Self::TrainingDiverged { best_epoch, .. } => {
                if let Some(epoch) = best_epoch {
                    d.insert("best_epoch".into(), epoch.to_string());
                }
            }
            Self::ArtefactMissing { path, missing } => {
                d.insert("path".into(), path.clone());
                d.insert("missing".into(), missing.clone());
            }
            Self::Timeout { elapsed_secs } => {
                d.insert("elapsed_secs".into(), elapsed_secs.to_string());
            }
            _ => {}
        }
        d.insert("message".into(), self.to_string());
        d
    }
}

impl From<std::io::Error> for KtrdrError {
    fn from(e: std::io::Error) -> Self {
        Self::storage(e.to_string())
    }
}

impl From<csv::Error> for KtrdrError {
    fn from(e: csv::Error) -> Self {
        Self::storage(e.to_string())
    }
}

pub type KtrdrResult<T> = Result<T, KtrdrError>;

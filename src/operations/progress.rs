//! Progress Renderer Protocol.
//!
//! Pure functions from raw worker state to a progress context map. The
//! registered renderer is chosen by operation kind; renderers never have
//! side effects.

use super::OperationKind;
use std::collections::HashMap;

/// Declarative shape for a data-load operation's progress.
#[derive(Debug, Clone, Default)]
pub struct DataLoadState {
    pub symbol: String,
    pub timeframe: String,
    pub mode: String,
    pub segment_index: usize,
    pub total_segments: usize,
}

/// Declarative shape for a training operation's progress.
#[derive(Debug, Clone, Default)]
pub struct TrainingState {
    pub epoch_index: usize,
    pub total_epochs: usize,
    pub batch_number: usize,
    pub batch_total: usize,
    pub epoch_metrics: HashMap<String, f64>,
    pub gpu_usage: Option<f64>,
}

/// Declarative shape for a backtesting operation's progress.
#[derive(Debug, Clone, Default)]
pub struct BacktestState {
    pub bar_index: usize,
    pub total_bars: usize,
    pub trades_so_far: usize,
}

pub trait ProgressRenderer: Send + Sync {
    /// `percentage` and the human-readable `current_step`, plus the
    /// kind-specific context map `update_progress` forwards to the record.
    fn render(&self, state: &HashMap<String, String>) -> (f64, String, HashMap<String, String>);
}

pub struct DataLoadRenderer;
pub struct TrainingRenderer;
pub struct BacktestRenderer;

fn get_f64(state: &HashMap<String, String>, key: &str) -> f64 {
    state.get(key).and_then(|v| v.parse().ok()).unwrap_or(0.0)
}

impl ProgressRenderer for DataLoadRenderer {
    fn render(&self, state: &HashMap<String, String>) -> (f64, String, HashMap<String, String>) {
        let segment_index = get_f64(state, "segment_index");
        let total_segments = get_f64(state, "total_segments").max(1.0);
        let percentage = (segment_index / total_segments * 100.0).min(100.0);
        let step = format!(
            "Segment {}/{}",
            state.get("segment_index").cloned().unwrap_or_default(),
            state.get("total_segments").cloned().unwrap_or_default()
        );
        (percentage, step, state.clone())
    }
}

impl ProgressRenderer for TrainingRenderer {
    fn render(&self, state: &HashMap<String, String>) -> (f64, String, HashMap<String, String>) {
        let epoch = get_f64(state, "epoch_index");
        let total = get_f64(state, "total_epochs").max(1.0);
        let percentage = (epoch / total * 100.0).min(100.0);
        let step = format!(
            "Epoch {}/{}",
            state.get("epoch_index").cloned().unwrap_or_default(),
            state.get("total_epochs").cloned().unwrap_or_default()
        );
        (percentage, step, state.clone())
    }
}

impl ProgressRenderer for BacktestRenderer {
    fn render(&self, state: &HashMap<String, String>) -> (f64, String, HashMap<String, String>) {
        let bar = get_f64(state, "bar_index");
        let total = get_f64(state, "total_bars").max(1.0);
        let percentage = (bar / total * 100.0).min(100.0);
        let step = format!(
            "Bar {}/{}",
            state.get("bar_index").cloned().unwrap_or_default(),
            state.get("total_bars").cloned().unwrap_or_default()
        );
        (percentage, step, state.clone())
    }
}

/// Resolved once at process-startup wiring time.
pub struct RendererRegistry {
    renderers: HashMap<&'static str, Box<dyn ProgressRenderer>>,
}

impl Default for RendererRegistry {
    fn default() -> Self {
        let mut renderers: HashMap<&'static str, Box<dyn ProgressRenderer>> = HashMap::new();
        renderers.insert(OperationKind::DataLoad.as_str(), Box::new(DataLoadRenderer));
        renderers.insert(OperationKind::Training.as_str(), Box::new(TrainingRenderer));
        renderers.insert(
            OperationKind::Backtesting.as_str(),
            Box::new(BacktestRenderer),
        );
        Self { renderers }
    }
}

impl RendererRegistry {
    pub fn render(
        &self,
        kind: OperationKind,
        state: &HashMap<String, String>,
    ) -> (f64, String, HashMap<String, String>) {
        match self.renderers.get(kind.as_str()) {
            Some(renderer) => renderer.render(state),
            None => (0.0, String::new(), state.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn training_renderer_computes_percentage_and_step() {
        let registry = RendererRegistry::default();
        let mut state = HashMap::new();
        state.insert("epoch_index".to_string(), "32".to_string());
        state.insert("total_epochs".to_string(), "50".to_string());
        let (pct, step, _) = registry.render(OperationKind::Training, &state);
        assert!((pct - 64.0).abs() < 1e-9);
        assert_eq!(step, "Epoch 32/50");
    }

    #[test]
    fn unknown_kind_falls_back_to_zero() {
        let registry = RendererRegistry::default();
        let (pct, step, _) = registry.render(OperationKind::Other, &HashMap::new());
        assert_eq!(pct, 0.0);
        assert!(step.is_empty());
    }
}

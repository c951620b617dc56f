//! Training diagnostics.
//!
//! [`Summary`] is an append-only record written by the training loop. Per-round
//! scalars are also forwarded to a [`SummarySink`], the narrow contract for external
//! metric writers.

use std::collections::BTreeMap;

/// Receives named scalar series, one value per step.
pub trait SummarySink: Send {
    fn add_scalar(&mut self, tag: &str, value: f64, step: usize);
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSink;

impl SummarySink for NoopSink {
    fn add_scalar(&mut self, _tag: &str, _value: f64, _step: usize) {}
}

/// Emits every scalar as a `tracing` event at `INFO` level.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl SummarySink for TracingSink {
    fn add_scalar(&mut self, tag: &str, value: f64, step: usize) {
        tracing::info!(tag, value, step, "summary");
    }
}

/// Keeps every series in memory, keyed by tag.
#[derive(Debug, Clone, Default)]
pub struct InMemorySink {
    pub series: BTreeMap<String, Vec<(usize, f64)>>,
}

impl SummarySink for InMemorySink {
    fn add_scalar(&mut self, tag: &str, value: f64, step: usize) {
        self.series
            .entry(tag.to_string())
            .or_default()
            .push((step, value));
    }
}

/// Per-epoch and per-round training metrics.
///
/// Epoch-level series grow by one entry per epoch; round-level series by one entry
/// per `train`/`anneal` call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Summary {
    // per round
    pub epochs: Vec<usize>,
    pub best_validation_log_probs: Vec<f64>,
    pub num_simulations: Vec<usize>,
    // per epoch
    pub train_log_probs: Vec<f64>,
    pub validation_log_probs: Vec<f64>,
    pub validation_objective_log_probs: Vec<f64>,
    pub validation_regularizer_log_probs: Vec<f64>,
    pub validation_mixed_log_probs: Vec<f64>,
    pub validation_ratio_avg: Vec<f64>,
    pub epoch_durations_sec: Vec<f64>,
}

impl Summary {
    /// Number of completed rounds.
    pub fn num_rounds(&self) -> usize {
        self.epochs.len()
    }

    /// Pushes the latest round to `sink`, using `round` as the step.
    pub(crate) fn write_round(&self, sink: &mut dyn SummarySink, round: usize) {
        if let Some(&epochs) = self.epochs.last() {
            sink.add_scalar("epochs_trained", epochs as f64, round);
        }
        if let Some(&best) = self.best_validation_log_probs.last() {
            sink.add_scalar("best_validation_log_prob", best, round);
        }
        if let Some(&n) = self.num_simulations.last() {
            sink.add_scalar("num_simulations", n as f64, round);
        }
        if let Some(&v) = self.validation_ratio_avg.last() {
            sink.add_scalar("validation_ratio_avg", v, round);
        }
        if let Some(&v) = self.validation_objective_log_probs.last() {
            sink.add_scalar("validation_objective_log_prob", v, round);
        }
        if let Some(&v) = self.validation_regularizer_log_probs.last() {
            sink.add_scalar("validation_regularizer_log_prob", v, round);
        }
    }
}

/// Human-readable digest of the last round.
pub fn describe_round(round: usize, summary: &Summary) -> String {
    let epochs = summary.epochs.last().copied().unwrap_or(0);
    let best = summary
        .best_validation_log_probs
        .last()
        .copied()
        .unwrap_or(f64::NEG_INFINITY);
    format!(
        "-------------------------\n\
         ||||| ROUND {} STATS |||||:\n\
         -------------------------\n\
         Epochs trained: {epochs}\n\
         Best validation performance: {best:.4}\n\
         -------------------------",
        round + 1
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_memory_sink_collects_round_scalars() {
        let summary = Summary {
            epochs: vec![3, 7],
            best_validation_log_probs: vec![-1.5, -0.5],
            num_simulations: vec![100, 200],
            ..Default::default()
        };
        let mut sink = InMemorySink::default();
        summary.write_round(&mut sink, 1);

        assert_eq!(sink.series["epochs_trained"], vec![(1, 7.0)]);
        assert_eq!(sink.series["best_validation_log_prob"], vec![(1, -0.5)]);
        assert_eq!(sink.series["num_simulations"], vec![(1, 200.0)]);
        assert!(!sink.series.contains_key("validation_ratio_avg"));
    }

    #[test]
    fn test_describe_round() {
        let summary = Summary {
            epochs: vec![12],
            best_validation_log_probs: vec![-0.123456],
            ..Default::default()
        };
        let text = describe_round(0, &summary);
        assert!(text.contains("ROUND 1 STATS"));
        assert!(text.contains("Epochs trained: 12"));
        assert!(text.contains("-0.1235"));
    }
}

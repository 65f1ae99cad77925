use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::SimError;

/// The injected configuration table of constants §6 describes. Held constant for
/// the lifetime of one simulation run; the simulator never mutates it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    pub max_num_seq: usize,
    pub max_num_batch_tokens: u32,
    pub max_num_tokens_allowed: u32,
    pub max_kv_perc_before_recompute: f64,
    pub max_kv_perc_before_recompute_non_critical: f64,

    pub tokenize: f64,
    pub prefill_a: f64,
    pub prefill_b: f64,
    pub prefill_c: f64,
    pub prefill_min: f64,
    pub decode_1: f64,
    pub decode_0: f64,
    pub decode_batch: f64,

    pub lora_dict: HashMap<String, u32>,

    /// Time window (seconds) over which `Router::estimate_avg_latency` and
    /// the SLO-violation scan consider history; `f64::INFINITY` disables
    /// the filter entirely.
    pub estimation_ttl: f64,
    /// Percentile used to aggregate *running*-request latency samples
    /// (`smart`'s max-pending search); finished-request samples always use
    /// the mean, matching the source's `include_running_requests` switch.
    pub estimation_percentile: f64,
    /// Fraction of `target_latency` a server's estimated per-token latency
    /// must stay under to qualify for `smart`'s max-pending search.
    pub smart_buffer: f64,
    /// Trailing window (seconds) for SLO-violation-ratio tracking.
    pub violation_window_ttl: f64,
    /// A class is "violating" once its violation ratio exceeds this
    /// fraction (§4.3: 4%).
    pub violation_threshold: f64,
    /// A queued request is dropped once it has waited more than this many
    /// multiples of its own `target_latency`, when `drop_late_requests` is set.
    pub late_drop_multiplier: f64,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            max_num_seq: 256,
            max_num_batch_tokens: 2048,
            max_num_tokens_allowed: 16 * 1024,
            max_kv_perc_before_recompute: 0.9,
            max_kv_perc_before_recompute_non_critical: 0.8,

            tokenize: 0.0003,
            prefill_a: 0.0000135,
            prefill_b: 0.00016,
            prefill_c: 0.00011,
            prefill_min: 0.003,
            decode_1: 0.00002,
            decode_0: 0.002,
            decode_batch: 0.0003,

            lora_dict: HashMap::new(),

            estimation_ttl: 300.0,
            estimation_percentile: 95.0,
            smart_buffer: 0.5,
            violation_window_ttl: 300.0,
            violation_threshold: 0.04,
            late_drop_multiplier: 100.0,
        }
    }
}

impl SimConfig {
    /// Load a configuration table from a TOML file, falling back to `Default` for
    /// any field the file omits.
    pub fn from_file(path: &Path) -> Result<Self, SimError> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            SimError::configuration(format!("reading config file {}: {e}", path.display()))
        })?;
        toml::from_str(&text)
            .map_err(|e| SimError::configuration(format!("parsing config file {}: {e}", path.display())))
    }

    pub fn validate(&self) -> Result<(), SimError> {
        if self.max_num_seq == 0 {
            return Err(SimError::configuration("max_num_seq must be > 0"));
        }
        if self.max_num_batch_tokens == 0 {
            return Err(SimError::configuration("max_num_batch_tokens must be > 0"));
        }
        if self.max_num_tokens_allowed == 0 {
            return Err(SimError::configuration("max_num_tokens_allowed must be > 0"));
        }
        if !(0.0..=1.0).contains(&self.max_kv_perc_before_recompute) {
            return Err(SimError::configuration(
                "max_kv_perc_before_recompute must be within [0, 1]",
            ));
        }
        if !(0.0..=1.0).contains(&self.max_kv_perc_before_recompute_non_critical) {
            return Err(SimError::configuration(
                "max_kv_perc_before_recompute_non_critical must be within [0, 1]",
            ));
        }
        if !(0.0..=100.0).contains(&self.estimation_percentile) {
            return Err(SimError::configuration("estimation_percentile must be within [0, 100]"));
        }
        if self.smart_buffer <= 0.0 {
            return Err(SimError::configuration("smart_buffer must be > 0"));
        }
        if !(0.0..=1.0).contains(&self.violation_threshold) {
            return Err(SimError::configuration("violation_threshold must be within [0, 1]"));
        }
        Ok(())
    }

    pub fn lora_cost(&self, lora: &str) -> Option<u32> {
        self.lora_dict.get(lora).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(SimConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_out_of_range_kv_threshold() {
        let mut cfg = SimConfig::default();
        cfg.max_kv_perc_before_recompute = 1.5;
        assert!(cfg.validate().is_err());
    }
}

//! Pure functions deciding admission and computing prefill/decode delays.
//!
//! Kept free of any store or request mutation so they can be tested in
//! isolation from `Server`'s bookkeeping (§4.1).

use crate::config::SimConfig;

/// `max(MIN, A*n^2 + B*n + C + TOK*items)`.
pub fn prefill_delay(token_count: f64, num_items: usize, cfg: &SimConfig) -> f64 {
    let n = token_count;
    let raw = cfg.prefill_a * n * n + cfg.prefill_b * n + cfg.prefill_c
        + cfg.tokenize * num_items as f64;
    raw.max(cfg.prefill_min)
}

/// `D*n + E + (TOK + BATCH)*items`.
pub fn decode_delay(token_count: f64, num_items: usize, cfg: &SimConfig) -> f64 {
    cfg.decode_1 * token_count + cfg.decode_0 + (cfg.tokenize + cfg.decode_batch) * num_items as f64
}

/// The three admission guards of §4.1, evaluated against the batch accumulated
/// so far this tick.
pub fn can_admit(
    decode_size: usize,
    new_seq_count: usize,
    batch_tokens: f64,
    decode_token_count: f64,
    candidate_input_size: u32,
    max_tokens_allowed: u32,
    cfg: &SimConfig,
) -> bool {
    let seq_ok = decode_size + new_seq_count + 1 <= cfg.max_num_seq;
    let batch_ok = batch_tokens + candidate_input_size as f64 <= cfg.max_num_batch_tokens as f64;
    let kv_ok = max_tokens_allowed > 0
        && (batch_tokens + new_seq_count as f64 + decode_token_count) / max_tokens_allowed as f64
            < cfg.max_kv_perc_before_recompute;
    seq_ok && batch_ok && kv_ok
}

/// Whether a server should evict from `decode_store` to reclaim KV cache, per
/// the recompute trigger of §4.1.
pub fn should_recompute(decode_size: usize, decode_token_count: f64, max_tokens_allowed: u32, cfg: &SimConfig) -> bool {
    if max_tokens_allowed == 0 {
        return decode_size > 0;
    }
    (decode_size as f64 + decode_token_count) / max_tokens_allowed as f64 > cfg.max_kv_perc_before_recompute
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> SimConfig {
        SimConfig::default()
    }

    #[test]
    fn prefill_delay_floors_at_min() {
        let cfg = cfg();
        let d = prefill_delay(0.0, 0, &cfg);
        assert_eq!(d, cfg.prefill_min);
    }

    #[test]
    fn prefill_delay_grows_quadratically() {
        let cfg = cfg();
        let small = prefill_delay(10.0, 1, &cfg);
        let large = prefill_delay(1000.0, 1, &cfg);
        assert!(large > small);
    }

    #[test]
    fn decode_delay_scales_with_batch_size() {
        let cfg = cfg();
        let one = decode_delay(100.0, 1, &cfg);
        let many = decode_delay(100.0, 10, &cfg);
        assert!(many > one);
    }

    #[test]
    fn can_admit_respects_max_num_seq() {
        let cfg = cfg();
        assert!(!can_admit(cfg.max_num_seq, 0, 0.0, 0.0, 1, 1000, &cfg));
    }

    #[test]
    fn can_admit_respects_batch_token_cap() {
        let cfg = cfg();
        assert!(!can_admit(0, 0, cfg.max_num_batch_tokens as f64, 0.0, 1, 1000, &cfg));
    }

    #[test]
    fn can_admit_respects_kv_pressure() {
        let cfg = cfg();
        // decode_token_count already at the threshold leaves no room.
        let max_tokens = 1000;
        let at_limit = (max_tokens as f64) * cfg.max_kv_perc_before_recompute;
        assert!(!can_admit(0, 0, 0.0, at_limit, 1, max_tokens, &cfg));
    }
}

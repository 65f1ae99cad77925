use std::collections::{BTreeMap, HashSet, VecDeque};

use tracing::{debug, trace};

use crate::batching::{can_admit, decode_delay, prefill_delay, should_recompute};
use crate::config::SimConfig;
use crate::error::SimError;
use crate::request::{Request, RequestId};

/// One ms, the idle-tick and dequeue-retry granularity used throughout §5.
pub const IDLE_TICK: f64 = 0.001;

/// The continuous-batching engine for a single backend (§4.1).
///
/// Owns the four request stores and the KV-cache/LoRA bookkeeping that go with
/// them. All mutation happens through `tick`, `admit_batch`, `decode_all`, and
/// `remove_from_decode` — nothing else writes to the stores.
#[derive(Debug)]
pub struct Server {
    pub id: usize,
    pub prefill_store: VecDeque<Request>,
    /// Order matches insertion order (oldest at the front); eviction takes the
    /// newest (back) per §4.1, mirroring the source's `items[-1]` semantics.
    pub decode_store: VecDeque<Request>,
    /// Keyed by request id for stable, lowest-id-first re-admission priority.
    pub recompute_store: BTreeMap<RequestId, Request>,
    pub decoded_store: Vec<Request>,

    pub loaded_loras: HashSet<String>,
    pub max_tokens_allowed: u32,
}

impl Server {
    pub fn new(id: usize, max_tokens_allowed: u32) -> Self {
        Self {
            id,
            prefill_store: VecDeque::new(),
            decode_store: VecDeque::new(),
            recompute_store: BTreeMap::new(),
            decoded_store: Vec::new(),
            loaded_loras: HashSet::new(),
            max_tokens_allowed,
        }
    }

    pub fn prefill_queue_size(&self) -> usize {
        self.prefill_store.len()
    }

    pub fn decode_queue_size(&self) -> usize {
        self.decode_store.len()
    }

    pub fn recompute_queue_size(&self) -> usize {
        self.recompute_store.len()
    }

    pub fn decoded_queue_size(&self) -> usize {
        self.decoded_store.len()
    }

    /// Sum of `input + (output - remaining)` over the decode store.
    pub fn decode_token_count(&self) -> f64 {
        self.decode_store
            .iter()
            .map(|r| r.tokens_processed() as f64)
            .sum()
    }

    /// `Σ(input + output)` over prefill ∪ decode, divided by capacity — the
    /// "pseudo" KV occupancy used by `leastPseudo` and non-smart saturation.
    pub fn pending_tokens_perc(&self) -> f64 {
        if self.max_tokens_allowed == 0 {
            return f64::INFINITY;
        }
        let pending: u32 = self
            .decode_store
            .iter()
            .chain(self.prefill_store.iter())
            .map(|r| r.total_tokens())
            .sum();
        pending as f64 / self.max_tokens_allowed as f64
    }

    /// Actual (not pending) token occupancy of the decode store, used for
    /// `actual_tokens_perc_at_arrival` metadata.
    pub fn actual_tokens_perc(&self) -> f64 {
        if self.max_tokens_allowed == 0 {
            return f64::INFINITY;
        }
        self.decode_token_count() / self.max_tokens_allowed as f64
    }

    /// The minimum expected KV occupancy after the next prefill admits just the
    /// head of recompute (if any) else the head of prefill (if any) else
    /// nothing — used by the `least` policy and the router's KV guard.
    pub fn min_expected_kv_after_prefill(&self) -> f64 {
        let decode_tokens = self.decode_token_count();
        if let Some((_, item)) = self.recompute_store.iter().next() {
            return decode_tokens + item.tokens_processed() as f64;
        }
        if let Some(item) = self.prefill_store.front() {
            return decode_tokens + item.tokens_processed() as f64;
        }
        decode_tokens
    }

    pub fn expected_kv_after_prefill_perc(&self) -> f64 {
        if self.max_tokens_allowed == 0 {
            return f64::INFINITY;
        }
        self.min_expected_kv_after_prefill() / self.max_tokens_allowed as f64
    }

    /// `decode_queue_size + decode_token_count`, the recompute trigger's numerator.
    pub fn expected_kv_after_decode(&self) -> f64 {
        self.decode_queue_size() as f64 + self.decode_token_count()
    }

    fn lora_admissible(&self, lora: Option<&str>, cfg: &SimConfig) -> bool {
        match lora {
            None => true,
            Some(tag) if self.loaded_loras.contains(tag) => true,
            Some(tag) => match cfg.lora_cost(tag) {
                Some(cost) => cost < self.max_tokens_allowed,
                None => true,
            },
        }
    }

    fn apply_lora_load(&mut self, lora: Option<&str>, cfg: &SimConfig) {
        if let Some(tag) = lora {
            if !self.loaded_loras.contains(tag) {
                self.loaded_loras.insert(tag.to_string());
                if let Some(cost) = cfg.lora_cost(tag) {
                    self.max_tokens_allowed = self.max_tokens_allowed.saturating_sub(cost);
                }
            }
        }
    }

    /// §4.1 admission: recompute_store drains first (priority), then
    /// prefill_store. Returns the prefill delay charged if anything was
    /// admitted.
    pub fn admit_batch(&mut self, cfg: &SimConfig, now: f64) -> Option<f64> {
        let mut batch: Vec<Request> = Vec::new();
        let mut batch_tokens = 0.0_f64;
        let mut new_seq_count = 0usize;
        let decode_size = self.decode_store.len();
        let decode_token_count = self.decode_token_count();

        while let Some(id) = self.recompute_store.keys().next().cloned() {
            let candidate = &self.recompute_store[&id];
            let admissible = can_admit(
                decode_size,
                new_seq_count,
                batch_tokens,
                decode_token_count,
                candidate.input_size,
                self.max_tokens_allowed,
                cfg,
            ) && self.lora_admissible(candidate.lora.as_deref(), cfg);
            if !admissible {
                break;
            }
            let item = self.recompute_store.remove(&id).expect("key just peeked");
            self.apply_lora_load(item.lora.as_deref(), cfg);
            batch_tokens += item.tokens_processed() as f64;
            new_seq_count += 1;
            batch.push(item);
        }

        while let Some(candidate) = self.prefill_store.front() {
            let admissible = can_admit(
                decode_size,
                new_seq_count,
                batch_tokens,
                decode_token_count,
                candidate.input_size,
                self.max_tokens_allowed,
                cfg,
            ) && self.lora_admissible(candidate.lora.as_deref(), cfg);
            if !admissible {
                break;
            }
            let item = self.prefill_store.pop_front().expect("front just peeked");
            self.apply_lora_load(item.lora.as_deref(), cfg);
            batch_tokens += item.tokens_processed() as f64;
            new_seq_count += 1;
            batch.push(item);
        }

        if batch.is_empty() {
            return None;
        }

        let prefill_len: f64 = batch.iter().map(|r| r.tokens_processed() as f64).sum();
        let delay = prefill_delay(prefill_len, batch.len(), cfg);

        trace!(server = self.id, n = batch.len(), delay, "admitting batch");

        for mut item in batch {
            if item.start_prefill.is_none() {
                item.start_prefill = Some(now);
                item.end_prefill = Some(now + delay);
            }
            item.end_decode = Some(now + delay);
            item.output_remaining -= 1;

            if item.output_remaining == 0 {
                self.decoded_store.push(item);
            } else {
                self.decode_store.push_back(item);
            }
        }

        Some(delay)
    }

    /// §4.1 decode step over every in-flight sequence. Returns the decode
    /// delay applied, or `None` if `decode_store` was empty.
    pub fn decode_all(&mut self, cfg: &SimConfig, now: f64) -> Result<Option<f64>, SimError> {
        let n_items = self.decode_store.len();
        if n_items == 0 {
            return Ok(None);
        }

        let pre_tokens = self.decode_token_count();
        let delay = decode_delay(pre_tokens, n_items, cfg);

        let mut still_decoding = VecDeque::with_capacity(n_items);
        for mut item in self.decode_store.drain(..) {
            if item.output_remaining == item.output_size - 1 {
                item.start_decode = Some(now);
                item.tokens_in_kv_at_start_of_decode = Some(pre_tokens as u32);
            }

            if item.output_remaining == 0 {
                return Err(SimError::invariant(format!(
                    "decode on already-terminal request {}",
                    item.id
                )));
            }
            item.output_remaining -= 1;
            item.end_decode = Some(now + delay);

            if item.output_remaining == 0 {
                self.decoded_store.push(item);
            } else {
                still_decoding.push_back(item);
            }
        }
        self.decode_store = still_decoding;

        Ok(Some(delay))
    }

    /// §4.1 eviction: while KV pressure exceeds the threshold, move the
    /// newest decode-store item to recompute, incrementing its counter.
    /// Returns the number of requests evicted.
    pub fn remove_from_decode(&mut self, cfg: &SimConfig) -> usize {
        let mut evicted = 0;
        while should_recompute(
            self.decode_store.len(),
            self.decode_token_count(),
            self.max_tokens_allowed,
            cfg,
        ) {
            let Some(mut item) = self.decode_store.pop_back() else {
                break;
            };
            item.recompute_count += 1;
            debug!(server = self.id, request = %item.id, "evicting to recompute");
            self.recompute_store.insert(item.id.clone(), item);
            evicted += 1;
        }
        evicted
    }

    /// One scheduling decision (§4.1 steps 1-3). Returns the simulated delay
    /// to advance the clock by before this server's process runs again.
    pub fn tick(&mut self, cfg: &SimConfig, now: f64) -> Result<f64, SimError> {
        let all_empty =
            self.prefill_store.is_empty() && self.decode_store.is_empty() && self.recompute_store.is_empty();

        if all_empty {
            return Ok(IDLE_TICK);
        }

        if let Some(delay) = self.admit_batch(cfg, now) {
            return Ok(delay);
        }

        if should_recompute(
            self.decode_store.len(),
            self.decode_token_count(),
            self.max_tokens_allowed,
            cfg,
        ) {
            self.remove_from_decode(cfg);
        }

        if let Some(delay) = self.decode_all(cfg, now)? {
            return Ok(delay);
        }

        Ok(IDLE_TICK)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> SimConfig {
        SimConfig::default()
    }

    #[test]
    fn idle_server_ticks_by_one_ms() {
        let mut server = Server::new(0, 1000);
        let delay = server.tick(&cfg(), 0.0).unwrap();
        assert_eq!(delay, IDLE_TICK);
    }

    #[test]
    fn single_request_completes_without_recompute() {
        let cfg = cfg();
        let mut server = Server::new(0, 10_000);
        server.prefill_store.push_back(Request::new("lo: 0".into(), 0.0, 10, 5));

        let mut now = 0.0;
        now += server.tick(&cfg, now).unwrap(); // admits + prefills
        assert_eq!(server.decode_store.len(), 1);
        assert_eq!(server.decode_store[0].output_remaining, 4);

        for _ in 0..4 {
            now += server.tick(&cfg, now).unwrap();
        }

        assert_eq!(server.decoded_store.len(), 1);
        assert_eq!(server.decoded_store[0].output_remaining, 0);
        assert_eq!(server.decoded_store[0].recompute_count, 0);
    }

    #[test]
    fn recompute_evicts_newest_first() {
        let mut cfg = cfg();
        cfg.max_kv_perc_before_recompute = 0.0; // force eviction immediately
        let mut server = Server::new(0, 1000);
        server
            .decode_store
            .push_back(Request::new("lo: 0".into(), 0.0, 10, 5));
        server
            .decode_store
            .push_back(Request::new("lo: 1".into(), 0.0, 10, 5));

        let evicted = server.remove_from_decode(&cfg);
        assert_eq!(evicted, 2);
        assert_eq!(server.decode_store.len(), 0);
        assert_eq!(server.recompute_store.len(), 2);
        assert!(server.recompute_store.values().all(|r| r.recompute_count == 1));
    }

    #[test]
    fn lora_load_reduces_capacity_once() {
        let mut cfg = cfg();
        cfg.lora_dict.insert("adapter-a".into(), 200);
        let mut server = Server::new(0, 1000);

        let mut req = Request::new("lo: 0".into(), 0.0, 10, 5);
        req.lora = Some("adapter-a".into());
        server.prefill_store.push_back(req);

        server.admit_batch(&cfg, 0.0);
        assert_eq!(server.max_tokens_allowed, 800);

        let mut req2 = Request::new("lo: 1".into(), 0.0, 10, 5);
        req2.lora = Some("adapter-a".into());
        server.prefill_store.push_back(req2);
        server.admit_batch(&cfg, 0.0);
        assert_eq!(server.max_tokens_allowed, 800, "adapter already loaded, no further cost");
    }

    #[test]
    fn decode_on_empty_store_is_a_no_op() {
        let mut server = Server::new(0, 1000);
        let result = server.decode_all(&cfg(), 0.0).unwrap();
        assert!(result.is_none());
    }
}

//! §4.2: the set of server-selection policies a fleet can be configured with.
//!
//! Each policy owns its own eligibility rule; there is no single KV filter
//! shared by all five — `random`/`least`/`leastPseudo`/`leastlatency`
//! consider every server, and only `smart`'s max-pending search (and its
//! fallback) apply per-candidate guards, matching the source's
//! `find_target_pod_based_on_*` split.

use rand::Rng;

use crate::config::SimConfig;
use crate::fleet;
use crate::request::Request;
use crate::server::Server;

/// §6 `--estimated-output-size`: how a candidate's still-unknown output
/// length is estimated for the per-token latency formulas, since the true
/// `output_size` is only known once the request has fully decoded. Mirrors
/// the source's mean-vs-`mean + 2·std` choice (`main.py:165-170`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputSizeEstimate {
    Mean,
    P95,
}

impl OutputSizeEstimate {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "mean" => Some(Self::Mean),
            "p95" => Some(Self::P95),
            _ => None,
        }
    }

    /// Collapse a class's output-size distribution to a single estimate,
    /// rounded and clamped to `[1, u32::MAX]` the same way sampled sizes are.
    pub fn estimate(&self, mean: f64, std: f64) -> u32 {
        let value = match self {
            Self::Mean => mean,
            Self::P95 => mean + 2.0 * std,
        };
        value.max(1.0).round() as u32
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutingPolicy {
    Random,
    Least,
    LeastPseudo,
    LeastLatency,
    Smart,
}

impl RoutingPolicy {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "random" => Some(Self::Random),
            "least" => Some(Self::Least),
            "leastPseudo" => Some(Self::LeastPseudo),
            "leastlatency" => Some(Self::LeastLatency),
            "smart" => Some(Self::Smart),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Random => "random",
            Self::Least => "least",
            Self::LeastPseudo => "leastPseudo",
            Self::LeastLatency => "leastlatency",
            Self::Smart => "smart",
        }
    }
}

#[derive(Debug)]
pub struct Router {
    pub policy: RoutingPolicy,
    /// The same hard prefill-queue cap `AdmissionQueue` gates
    /// `all_servers_queued` on (§3's `LoadBalancer.max_prefill_queue_size`);
    /// `smart`'s candidate eligibility check uses it directly rather than
    /// through the queue, since a server can be over-queued without the
    /// whole fleet being saturated.
    pub max_prefill_queue_size: usize,
}

impl Router {
    pub fn new(policy: RoutingPolicy, max_prefill_queue_size: usize) -> Self {
        Self { policy, max_prefill_queue_size }
    }

    /// §4.2 latency estimation, pulling its sample population from a
    /// server's `decoded_store` (finished requests, kept indefinitely per
    /// §3). `now`/`ttl` bound the sample to recent history; a server with no
    /// matching history estimates zero (§7's "estimation void", never an
    /// error).
    ///
    /// `percentile_95` selects `decode_store` (running requests) sampled at
    /// p95 instead of `decoded_store` sampled by mean — the source's
    /// `include_running_requests` switch, used by `smart`'s max-pending
    /// search but not by `leastlatency`.
    pub fn estimate_avg_latency(
        server: &Server,
        input_size: u32,
        output_size: u32,
        now: f64,
        cfg: &SimConfig,
        use_running: bool,
    ) -> f64 {
        let ttl = cfg.estimation_ttl;
        let current_kv_tokens = server.decode_token_count();
        let within = |arrival: f64| ttl.is_infinite() || now - arrival <= ttl;

        let mut prefill_ratios: Vec<f64> = Vec::new();
        let mut decode_ratios: Vec<f64> = Vec::new();

        let sample = |item: &Request, prefill_ratios: &mut Vec<f64>, decode_ratios: &mut Vec<f64>| {
            if !within(item.arrival_time) {
                return;
            }
            if let Some(end_prefill) = item.end_prefill {
                if item.input_size > 0 {
                    prefill_ratios.push((end_prefill - item.arrival_time) / item.input_size as f64);
                }
            }
            // A sample with no KV-at-start-of-decode history (or zero tokens
            // produced) contributes 0 rather than being skipped, so the mean
            // isn't inflated by dropping the cheap/instant cases.
            let decode_ratio = match item.tokens_in_kv_at_start_of_decode {
                Some(kv_at_start) if kv_at_start > 0 => {
                    let produced = item.output_size - item.output_remaining;
                    match (item.end_prefill, item.end_decode) {
                        (Some(end_prefill), Some(end_decode)) if produced > 0 => {
                            ((end_decode - end_prefill) / kv_at_start as f64) / produced as f64
                        }
                        _ => 0.0,
                    }
                }
                _ => 0.0,
            };
            decode_ratios.push(decode_ratio);
        };

        if use_running {
            for item in &server.decode_store {
                sample(item, &mut prefill_ratios, &mut decode_ratios);
            }
        } else {
            for item in &server.decoded_store {
                sample(item, &mut prefill_ratios, &mut decode_ratios);
            }
        }

        let prefill_agg = aggregate(&prefill_ratios, use_running, cfg.estimation_percentile);
        let decode_agg = aggregate(&decode_ratios, use_running, cfg.estimation_percentile);

        let estimated_prefill = prefill_agg * input_size as f64;
        let estimated_decode = decode_agg * current_kv_tokens * output_size as f64;
        let estimated_queue = estimated_prefill * server.prefill_queue_size() as f64;

        estimated_prefill + estimated_decode + estimated_queue
    }

    fn lora_affinity_candidates<'a>(servers: &'a [Server], candidate: &Request) -> Vec<&'a Server> {
        match &candidate.lora {
            None => servers.iter().collect(),
            Some(tag) => {
                let affine: Vec<&Server> = servers.iter().filter(|s| s.loaded_loras.contains(tag)).collect();
                if !affine.is_empty() {
                    return affine;
                }
                let min_count = servers.iter().map(|s| s.loaded_loras.len()).min().unwrap_or(0);
                servers.iter().filter(|s| s.loaded_loras.len() == min_count).collect()
            }
        }
    }

    /// §4.2: choose a target server for `candidate`, or `None` when the
    /// pre-check gates a best-effort request or no server qualifies.
    pub fn find_target(
        &self,
        servers: &[Server],
        candidate: &Request,
        cfg: &SimConfig,
        now: f64,
        rng: &mut impl Rng,
    ) -> Option<usize> {
        if servers.is_empty() {
            return None;
        }

        if candidate.target_latency.is_infinite() {
            let saturated = fleet::all_pods_saturated(servers, cfg.max_kv_perc_before_recompute_non_critical);
            let active = fleet::active_target_latencies_in_window(servers, now, cfg.violation_window_ttl);
            if saturated && !active.is_empty() {
                return None;
            }
            let (violating, _) = fleet::violations_in_window(
                servers,
                now,
                cfg.violation_window_ttl,
                cfg.violation_threshold,
            );
            if violating {
                return None;
            }
        }

        match self.policy {
            RoutingPolicy::Random => Some(servers[rng.gen_range(0..servers.len())].id),
            RoutingPolicy::Least => Some(
                servers
                    .iter()
                    .min_by(|a, b| {
                        a.min_expected_kv_after_prefill()
                            .partial_cmp(&b.min_expected_kv_after_prefill())
                            .unwrap()
                    })
                    .expect("non-empty")
                    .id,
            ),
            RoutingPolicy::LeastPseudo => Some(self.find_min_pending(servers, false, cfg).expect("non-empty")),
            RoutingPolicy::LeastLatency => Some(self.find_least_latency(servers, candidate, now, cfg)),
            RoutingPolicy::Smart => self.find_target_smart(servers, candidate, cfg, now, rng),
        }
    }

    fn find_least_latency(&self, servers: &[Server], candidate: &Request, now: f64, cfg: &SimConfig) -> usize {
        let output_size = candidate.output_size_estimate.max(1);
        servers
            .iter()
            .min_by(|a, b| {
                let la = Self::estimate_avg_latency(a, candidate.input_size, output_size, now, cfg, false)
                    / output_size as f64;
                let lb = Self::estimate_avg_latency(b, candidate.input_size, output_size, now, cfg, false)
                    / output_size as f64;
                la.partial_cmp(&lb).unwrap()
            })
            .expect("non-empty")
            .id
    }

    /// `find_target_pod_based_on_min_pending`: minimum pseudo-occupancy,
    /// optionally restricted to servers safe to admit into without
    /// immediately triggering eviction (`eviction_safe`).
    fn find_min_pending(&self, servers: &[Server], eviction_safe: bool, cfg: &SimConfig) -> Option<usize> {
        servers
            .iter()
            .filter(|s| !eviction_safe || s.expected_kv_after_prefill_perc() < cfg.max_kv_perc_before_recompute)
            .min_by(|a, b| a.pending_tokens_perc().partial_cmp(&b.pending_tokens_perc()).unwrap())
            .map(|s| s.id)
    }

    /// `find_target_pod_based_on_max_pending`: among servers under the SLO
    /// buffer, KV-safe, and below the prefill-queue cap, the one packing the
    /// most pending tokens (preserving cold headroom elsewhere); falls back
    /// to an unguarded `leastPseudo` search over the full server list.
    fn find_target_smart(
        &self,
        servers: &[Server],
        candidate: &Request,
        cfg: &SimConfig,
        now: f64,
        rng: &mut impl Rng,
    ) -> Option<usize> {
        let pool = Self::lora_affinity_candidates(servers, candidate);
        let output_size = candidate.output_size_estimate.max(1);

        let mut best: Vec<&Server> = Vec::new();
        let mut best_pending = f64::NEG_INFINITY;

        for server in &pool {
            let estimated = Self::estimate_avg_latency(server, candidate.input_size, output_size, now, cfg, true);
            let per_token = estimated / output_size as f64;
            let pending = server.pending_tokens_perc();
            let kv_after_prefill = server.expected_kv_after_prefill_perc();
            let queue_ok = server.prefill_queue_size() < self.max_prefill_queue_size;

            if per_token < cfg.smart_buffer * candidate.target_latency
                && kv_after_prefill < cfg.max_kv_perc_before_recompute
                && queue_ok
            {
                if pending > best_pending {
                    best_pending = pending;
                    best = vec![server];
                } else if (pending - best_pending).abs() < f64::EPSILON {
                    best.push(server);
                }
            }
        }

        if !best.is_empty() {
            return Some(best[rng.gen_range(0..best.len())].id);
        }

        self.find_min_pending(servers, false, cfg)
    }
}

/// Mean for finished-request sampling, p95 for running-request sampling —
/// the source's `include_running_requests` switch over `np.mean`/
/// `np.percentile(..., 95)`. `percentile` overrides the running-sample
/// quantile when configured away from the default.
fn aggregate(samples: &[f64], use_running: bool, percentile: f64) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    if use_running {
        percentile_of(samples, percentile)
    } else {
        samples.iter().sum::<f64>() / samples.len() as f64
    }
}

fn percentile_of(samples: &[f64], p: f64) -> f64 {
    let mut sorted = samples.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
    if sorted.len() == 1 {
        return sorted[0];
    }
    let rank = (p / 100.0) * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    if lo == hi {
        sorted[lo]
    } else {
        let frac = rank - lo as f64;
        sorted[lo] * (1.0 - frac) + sorted[hi] * frac
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn cfg() -> SimConfig {
        SimConfig::default()
    }

    #[test]
    fn from_name_round_trips() {
        for name in ["random", "least", "leastPseudo", "leastlatency", "smart"] {
            let policy = RoutingPolicy::from_name(name).unwrap();
            assert_eq!(policy.name(), name);
        }
    }

    #[test]
    fn least_picks_lowest_kv() {
        let cfg = cfg();
        let mut busy = Server::new(0, 1000);
        busy.decode_store.push_back(Request::new("lo: 0".into(), 0.0, 500, 5));
        let idle = Server::new(1, 1000);
        let servers = vec![busy, idle];

        let router = Router::new(RoutingPolicy::Least, 100);
        let candidate = Request::new("lo: 1".into(), 0.0, 10, 5);
        let mut rng = StdRng::seed_from_u64(0);
        let target = router.find_target(&servers, &candidate, &cfg, 0.0, &mut rng);
        assert_eq!(target, Some(1));
    }

    #[test]
    fn best_effort_request_gated_when_fleet_saturated_and_active() {
        let mut cfg = cfg();
        cfg.max_kv_perc_before_recompute_non_critical = 0.0; // trivially saturated
        let mut server = Server::new(0, 1000);
        let mut in_flight = Request::new("lo: 0".into(), 0.0, 10, 5);
        in_flight.target_latency = 0.5;
        server.prefill_store.push_back(in_flight);

        let servers = vec![server];
        let router = Router::new(RoutingPolicy::Random, 100);
        let candidate = Request::new("hi: 0".into(), 0.0, 10, 5); // target_latency defaults to infinity
        let mut rng = StdRng::seed_from_u64(0);
        assert_eq!(router.find_target(&servers, &candidate, &cfg, 0.0, &mut rng), None);
    }

    #[test]
    fn lora_affinity_prefers_loaded_server() {
        let cfg = cfg();
        let plain = Server::new(0, 1000);
        let mut loaded = Server::new(1, 1000);
        loaded.loaded_loras.insert("adapter-a".into());
        let servers = vec![plain, loaded];

        let router = Router::new(RoutingPolicy::Smart, 100);
        let mut candidate = Request::new("lo: 0".into(), 0.0, 10, 5);
        candidate.lora = Some("adapter-a".into());
        candidate.target_latency = f64::INFINITY;
        let mut rng = StdRng::seed_from_u64(1);
        let target = router.find_target(&servers, &candidate, &cfg, 0.0, &mut rng);
        assert_eq!(target, Some(1));
    }

    #[test]
    fn smart_falls_back_to_least_pending_when_nothing_meets_slo() {
        let cfg = cfg();
        let servers = vec![Server::new(0, 1000), Server::new(1, 1000)];
        let router = Router::new(RoutingPolicy::Smart, 100);
        let mut candidate = Request::new("lo: 0".into(), 0.0, 10, 5);
        candidate.target_latency = 0.0; // impossible to satisfy, forces fallback
        let mut rng = StdRng::seed_from_u64(2);
        let target = router.find_target(&servers, &candidate, &cfg, 0.0, &mut rng);
        assert!(target.is_some());
    }
}

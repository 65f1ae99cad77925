//! §4.3: the SLO-class admission queue a fleet falls back to once every
//! server is saturated.
//!
//! Requests are queued per distinct `target_latency` value (a best-effort
//! request's class key is `f64::INFINITY`). Two dequeue strategies compete
//! for the head of the line: `weighted_dequeue` favors tighter-SLO classes
//! by inverse-latency weight over whichever finite classes currently have
//! in-flight or recently-completed traffic anywhere in the fleet;
//! `slo_based_dequeue` favors whichever class is currently missing its SLO
//! most often. `weighted_dequeue`'s weights are zero for the infinite-target
//! class (`1/∞ == 0`), so it never drains best-effort traffic;
//! `dequeue_step` falls back to `slo_based_dequeue` to cover that class and
//! any finite class `weighted_dequeue` left behind.

use std::collections::VecDeque;

use rand::Rng;

use crate::config::SimConfig;
use crate::fleet;
use crate::request::Request;
use crate::router::RoutingPolicy;
use crate::server::Server;

#[derive(Debug)]
pub struct AdmissionQueue {
    pub queueing_threshold: f64,
    pub max_prefill_queue_size: usize,
    pub drop_late_requests: bool,
    queues: Vec<(f64, VecDeque<Request>)>,
}

impl AdmissionQueue {
    pub fn new(queueing_threshold: f64, max_prefill_queue_size: usize, drop_late_requests: bool) -> Self {
        Self {
            queueing_threshold,
            max_prefill_queue_size,
            drop_late_requests,
            queues: Vec::new(),
        }
    }

    fn class_index(&mut self, target_latency: f64) -> usize {
        if let Some(i) = self.queues.iter().position(|(t, _)| *t == target_latency) {
            return i;
        }
        self.queues.push((target_latency, VecDeque::new()));
        self.queues.len() - 1
    }

    pub fn len(&self) -> usize {
        self.queues.iter().map(|(_, q)| q.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn mean_pending_tokens_perc(servers: &[Server]) -> f64 {
        if servers.is_empty() {
            return 0.0;
        }
        servers.iter().map(|s| s.pending_tokens_perc()).sum::<f64>() / servers.len() as f64
    }

    /// §4.3: every server's prefill queue exceeds `max_prefill_queue_size`.
    pub fn all_servers_queued(&self, servers: &[Server]) -> bool {
        !servers.is_empty() && servers.iter().all(|s| s.prefill_queue_size() > self.max_prefill_queue_size)
    }

    /// §4.3 saturation signal: `smart` gates on every server's real
    /// (non-pseudo) expected KV occupancy; other policies gate on the
    /// fleet-mean pseudo occupancy. Both fall through to `all_servers_queued`.
    fn saturated(&self, servers: &[Server], policy: RoutingPolicy) -> bool {
        if self.queueing_threshold.is_infinite() {
            return false;
        }
        let signal = match policy {
            RoutingPolicy::Smart => fleet::all_pods_saturated(servers, self.queueing_threshold),
            _ => Self::mean_pending_tokens_perc(servers) > self.queueing_threshold,
        };
        signal || self.all_servers_queued(servers)
    }

    /// Whether an arriving request should be queued rather than routed
    /// directly: queueing is enabled and the fleet is saturated, or the
    /// queue already has traffic waiting.
    pub fn should_enqueue(&self, servers: &[Server], policy: RoutingPolicy) -> bool {
        if self.queueing_threshold.is_infinite() {
            return false;
        }
        self.saturated(servers, policy) || !self.is_empty()
    }

    /// Whether the dequeue process may pull from the queues right now: the
    /// inverse of `saturated`.
    pub fn dequeueing_signal(&self, servers: &[Server], policy: RoutingPolicy) -> bool {
        !self.saturated(servers, policy)
    }

    pub fn enqueue(&mut self, request: Request) {
        let idx = self.class_index(request.target_latency);
        self.queues[idx].1.push_back(request);
    }

    /// §5/§7 late-drop policy: a queued request waiting past
    /// `cfg.late_drop_multiplier` times its own target latency is dropped
    /// rather than routed, when `drop_late_requests` is configured.
    pub fn is_late(&self, request: &Request, now: f64, cfg: &SimConfig) -> bool {
        self.drop_late_requests
            && request.target_latency.is_finite()
            && (now - request.arrival_time) > cfg.late_drop_multiplier * request.target_latency
    }

    /// Inverse-latency-weighted random pick among the finite SLO classes
    /// with any in-flight-or-recent fleet traffic, retrying up to 1000
    /// times if the chosen class's own queue happens to be empty (§4.3).
    pub fn weighted_dequeue(&mut self, servers: &[Server], rng: &mut impl Rng) -> Option<Request> {
        let active = fleet::active_target_latencies_in_window(servers, 0.0, f64::INFINITY);
        let weighted: Vec<(f64, f64)> = active.into_iter().map(|t| (t, 1.0 / t)).collect();
        let total: f64 = weighted.iter().map(|(_, w)| w).sum();
        if total <= 0.0 {
            return None;
        }

        for _ in 0..1000 {
            let mut pick = rng.gen_range(0.0..total);
            let mut chosen = weighted[0].0;
            for (t, w) in &weighted {
                if pick < *w {
                    chosen = *t;
                    break;
                }
                pick -= w;
            }
            if let Some(idx) = self.queues.iter().position(|(t, _)| *t == chosen) {
                if !self.queues[idx].1.is_empty() {
                    return self.queues[idx].1.pop_front();
                }
            }
        }
        None
    }

    /// Violation-ratio-ordered dequeue over every class: classes with no
    /// completion history yet (including the best-effort `∞`-target class,
    /// which never appears in the violation scan) drain first in
    /// queue-creation order, then every other class in descending
    /// violation-ratio order so the worst-missing-SLO class goes first.
    pub fn slo_based_dequeue(&mut self, servers: &[Server], now: f64, cfg: &SimConfig) -> Option<Request> {
        let (_, ratios) = fleet::violations_in_window(servers, now, cfg.violation_window_ttl, cfg.violation_threshold);

        for (target, queue) in self.queues.iter_mut() {
            if !ratios.iter().any(|(t, _)| t == target) && !queue.is_empty() {
                return queue.pop_front();
            }
        }

        let mut by_ratio_desc = ratios;
        by_ratio_desc.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap());
        for (target, _) in by_ratio_desc {
            if let Some(idx) = self.queues.iter().position(|(t, _)| *t == target) {
                if !self.queues[idx].1.is_empty() {
                    return self.queues[idx].1.pop_front();
                }
            }
        }
        None
    }

    /// One admission-queue dequeue decision: SLO-weighted first, falling
    /// back to violation-ratio ordering so best-effort traffic still drains.
    pub fn dequeue_step(&mut self, servers: &[Server], now: f64, cfg: &SimConfig, rng: &mut impl Rng) -> Option<Request> {
        self.weighted_dequeue(servers, rng)
            .or_else(|| self.slo_based_dequeue(servers, now, cfg))
    }
}

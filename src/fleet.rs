//! Fleet-wide scans shared by `Router` and `AdmissionQueue`.
//!
//! The source computes saturation, active-SLO-class membership, and
//! violation ratios directly against the servers' stores rather than
//! through any separate bookkeeping, so these are plain scans over
//! `&[Server]` rather than incrementally maintained state.

use crate::server::Server;

/// True once every server's *actual* (non-pseudo) expected KV occupancy
/// after its next prefill is at or beyond `threshold`. Used by the
/// infinite-target pre-check in `Router::find_target` and, with a
/// different threshold, by non-smart saturation signalling.
pub fn all_pods_saturated(servers: &[Server], threshold: f64) -> bool {
    !servers.is_empty() && servers.iter().all(|s| s.expected_kv_after_prefill_perc() >= threshold)
}

/// The set of distinct finite `target_latency` values with at least one
/// request currently in flight (prefill/decode/recompute, unconditionally)
/// or completed within `ttl` seconds of `now` (`ttl == INFINITY` disables
/// the time filter, matching the source's `time_windows=np.inf` call from
/// `weighted_dequeue`).
pub fn active_target_latencies_in_window(servers: &[Server], now: f64, ttl: f64) -> Vec<f64> {
    let mut out: Vec<f64> = Vec::new();
    let within = |arrival: f64| ttl.is_infinite() || now - arrival <= ttl;

    for server in servers {
        for req in server.prefill_store.iter().chain(server.decode_store.iter()) {
            if req.target_latency.is_finite() && !out.contains(&req.target_latency) {
                out.push(req.target_latency);
            }
        }
        for req in server.recompute_store.values() {
            if req.target_latency.is_finite() && !out.contains(&req.target_latency) {
                out.push(req.target_latency);
            }
        }
        for req in &server.decoded_store {
            if req.target_latency.is_finite() && within(req.arrival_time) && !out.contains(&req.target_latency) {
                out.push(req.target_latency);
            }
        }
    }
    out
}

/// For each finite `target_latency` class with at least one terminal
/// request within `ttl` seconds of `now`, the fraction of that class's
/// requests whose achieved latency exceeded their target. Returns
/// `(any_class_over_threshold, per_class_ratio)`.
pub fn violations_in_window(
    servers: &[Server],
    now: f64,
    ttl: f64,
    threshold: f64,
) -> (bool, Vec<(f64, f64)>) {
    let mut totals: Vec<(f64, usize, usize)> = Vec::new(); // (target, total, violated)

    for server in servers {
        for req in &server.decoded_store {
            if !req.target_latency.is_finite() {
                continue;
            }
            if !(ttl.is_infinite() || now - req.arrival_time <= ttl) {
                continue;
            }
            let Some(achieved) = req.achieved_latency() else { continue };

            let entry = match totals.iter_mut().find(|(t, _, _)| *t == req.target_latency) {
                Some(e) => e,
                None => {
                    totals.push((req.target_latency, 0, 0));
                    totals.last_mut().unwrap()
                }
            };
            entry.1 += 1;
            if achieved > req.target_latency {
                entry.2 += 1;
            }
        }
    }

    let mut any_violating = false;
    let ratios: Vec<(f64, f64)> = totals
        .into_iter()
        .map(|(target, total, violated)| {
            let ratio = violated as f64 / total as f64;
            if ratio > threshold {
                any_violating = true;
            }
            (target, ratio)
        })
        .collect();

    (any_violating, ratios)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::Request;

    #[test]
    fn no_servers_is_not_saturated() {
        assert!(!all_pods_saturated(&[], 0.5));
    }

    #[test]
    fn violations_empty_when_nothing_decoded() {
        let servers = vec![Server::new(0, 1000)];
        let (any, ratios) = violations_in_window(&servers, 10.0, 300.0, 0.04);
        assert!(!any);
        assert!(ratios.is_empty());
    }

    #[test]
    fn violations_detects_over_threshold_class() {
        let mut server = Server::new(0, 1000);
        for i in 0..10 {
            let mut req = Request::new(format!("lo: {i}"), 0.0, 10, 5);
            req.target_latency = 1.0;
            req.end_decode = Some(if i < 5 { 10.0 } else { 0.5 }); // half violate
            server.decoded_store.push(req);
        }
        let (any, ratios) = violations_in_window(&[server], 0.0, f64::INFINITY, 0.04);
        assert!(any);
        assert_eq!(ratios.len(), 1);
        assert!((ratios[0].1 - 0.5).abs() < 1e-9);
    }

    #[test]
    fn active_targets_include_in_flight_and_recent_decoded() {
        let mut server = Server::new(0, 1000);
        let mut in_flight = Request::new("lo: 0".into(), 0.0, 10, 5);
        in_flight.target_latency = 0.5;
        server.prefill_store.push_back(in_flight);

        let mut decoded = Request::new("lo: 1".into(), 0.0, 10, 5);
        decoded.target_latency = 2.0;
        decoded.end_decode = Some(1.0);
        server.decoded_store.push(decoded);

        let targets = active_target_latencies_in_window(&[server], 1.0, 300.0);
        assert_eq!(targets.len(), 2);
    }
}

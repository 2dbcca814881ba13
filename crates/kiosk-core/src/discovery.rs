/// Bounded concurrent LAN discovery.
///
/// A producer task feeds candidates through a semaphore-gated worker pool;
/// the first probe to succeed wins the race and cancels everything else.
/// The whole scan is capped by a wall-time budget.

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use ipnet::Ipv4Net;
use rand::seq::SliceRandom;
use tokio::sync::{mpsc, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::probe::Prober;

/// Prefixes shorter than this enumerate too many hosts to sweep within any
/// sane budget (a /20 is already 4094 candidates). Seeds are still probed.
pub const MIN_SCAN_PREFIX_LEN: u8 = 20;

/// Effective worker count for a scan.
pub fn worker_count(requested: usize) -> usize {
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(2);
    requested.min(cpus * 8).max(1)
}

/// Candidate order: seeds first (deduplicated, order preserved), then the
/// remaining hosts of the network in random order.
pub fn scan_order(network: Option<Ipv4Net>, seeds: &[Ipv4Addr]) -> Vec<Ipv4Addr> {
    let mut seen: HashSet<Ipv4Addr> = HashSet::new();
    let mut order: Vec<Ipv4Addr> = Vec::new();
    for &ip in seeds {
        if seen.insert(ip) {
            order.push(ip);
        }
    }

    if let Some(net) = network {
        if net.prefix_len() < MIN_SCAN_PREFIX_LEN {
            warn!(
                network = %net,
                "Network too large to enumerate (wider than /{MIN_SCAN_PREFIX_LEN}), scanning seeds only"
            );
        } else {
            let mut hosts: Vec<Ipv4Addr> =
                net.hosts().filter(|h| !seen.contains(h)).collect();
            hosts.shuffle(&mut rand::rng());
            order.extend(hosts);
        }
    }

    order
}

/// Race probes over the candidate set and return the first address that
/// answers healthy, or `None` once the budget elapses or the set is
/// exhausted. In-flight probes are abandoned as soon as a winner is known;
/// repeated calls may pick different addresses when several panels answer.
pub async fn discover(
    prober: &Prober,
    network: Option<Ipv4Net>,
    seeds: &[Ipv4Addr],
    budget: Duration,
    workers: usize,
) -> Option<Ipv4Addr> {
    let candidates = scan_order(network, seeds);
    if candidates.is_empty() || budget.is_zero() {
        return None;
    }

    let started = Instant::now();
    let deadline = started + budget;
    let total = candidates.len();
    debug!(candidates = total, workers = worker_count(workers), "Discovery scan starting");

    let cancel = CancellationToken::new();
    let semaphore = Arc::new(Semaphore::new(worker_count(workers)));
    let (tx, mut rx) = mpsc::channel::<Ipv4Addr>(1);

    let producer = {
        let cancel = cancel.clone();
        let prober = prober.clone();
        let semaphore = Arc::clone(&semaphore);
        let tx = tx.clone();
        tokio::spawn(async move {
            for ip in candidates {
                let permit = tokio::select! {
                    _ = cancel.cancelled() => break,
                    permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                        Ok(p) => p,
                        Err(_) => break,
                    },
                };

                let prober = prober.clone();
                let tx = tx.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    let _permit = permit;
                    tokio::select! {
                        _ = cancel.cancelled() => {}
                        healthy = prober.probe(ip) => {
                            if healthy {
                                // Losing the race here just means someone
                                // else already won.
                                let _ = tx.try_send(ip);
                            }
                        }
                    }
                });
            }
        })
    };
    // Once the producer and all probe tasks are done, `rx` sees the channel
    // close, which ends the race early on small candidate sets.
    drop(tx);

    let winner = tokio::select! {
        found = rx.recv() => found,
        _ = tokio::time::sleep_until(deadline) => None,
    };

    cancel.cancel();
    producer.abort();

    match winner {
        Some(ip) => {
            info!(%ip, elapsed_ms = started.elapsed().as_millis() as u64, "Discovery found a panel");
        }
        None => {
            info!(candidates = total, budget_ms = budget.as_millis() as u64, "Discovery exhausted without a hit");
        }
    }
    winner
}

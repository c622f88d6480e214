// Forwarding set selection
//
// n <= flood_threshold  -> every candidate
// n >  flood_threshold  -> top max(ceil(n/2), min_forward_set) by
//                          score = signal_strength - penalty * queue_depth,
//                          ties broken by ascending peer id

use crate::config::RoutingConfig;
use crate::identity::PeerId;
use crate::peers::Peer;
use std::cmp::Reverse;

/// How a forwarding set was chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardingStrategy {
    Flood,
    Gossip,
}

/// Choose the peers to forward to.
///
/// `exclude` holds ids that must never be picked (the immediate sender and
/// the original source).
pub fn select_forwarding_set(
    candidates: &[Peer],
    exclude: &[PeerId],
    config: &RoutingConfig,
) -> (ForwardingStrategy, Vec<PeerId>) {
    let mut eligible: Vec<&Peer> = candidates
        .iter()
        .filter(|p| !exclude.contains(&p.peer_id))
        .collect();

    if eligible.len() <= config.flood_threshold {
        let mut targets: Vec<PeerId> = eligible.iter().map(|p| p.peer_id).collect();
        targets.sort();
        return (ForwardingStrategy::Flood, targets);
    }

    let penalty = config.queue_depth_penalty;
    eligible.sort_by_key(|p| (Reverse(p.score(penalty)), p.peer_id));

    let subset = eligible
        .len()
        .div_ceil(2)
        .max(config.min_forward_set)
        .min(eligible.len());

    let targets = eligible.iter().take(subset).map(|p| p.peer_id).collect();
    (ForwardingStrategy::Gossip, targets)
}

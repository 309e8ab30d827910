//! Deterministic leader choice for a replicated application.
//!
//! The leader is the replica whose data is authoritative (read-write) while
//! the others catch up in receive-only mode. Every node evaluates the same
//! rule over the location set it observes, so nodes that see the same set
//! agree on the same leader. During a partition several nodes may briefly
//! believe they lead; the rule converges once the views match.
//!
//! Rule:
//!
//! 1. No peers: nobody leads.
//! 2. One peer: it leads.
//! 3. Otherwise, among replicas without `running_since`, the earliest
//!    `broadcasted_at` wins. When every replica has started, the earliest
//!    `running_since` wins instead.
//! 4. Candidates within `tolerance_ms` of the winning time tie; the
//!    lexicographically lowest host breaks the tie.

use skyfleet_proto::{host_of, ApplicationLocation};

/// The location elected as leader, if any.
pub fn designated_leader(peers: &[ApplicationLocation], tolerance_ms: u64) -> Option<&ApplicationLocation> {
    match peers.len() {
        0 => return None,
        1 => return peers.first(),
        _ => {}
    }

    let pending: Vec<(&ApplicationLocation, u64)> = peers
        .iter()
        .filter(|p| p.running_since.is_none())
        .map(|p| (p, p.broadcasted_at))
        .collect();
    let candidates = if pending.is_empty() {
        peers.iter().filter_map(|p| p.running_since.map(|t| (p, t))).collect()
    } else {
        pending
    };

    let earliest = candidates.iter().map(|(_, t)| *t).min()?;
    let window_end = earliest.saturating_add(tolerance_ms);
    candidates
        .into_iter()
        .filter(|(_, t)| *t <= window_end)
        .map(|(p, _)| p)
        .min_by(|a, b| a.host().cmp(b.host()))
}

/// True when `self_ip` is the designated leader of `peers`.
///
/// A lone peer makes every caller a leader, whichever host it names: a
/// node that sees one location has nobody to wait for.
pub fn is_designated_leader(peers: &[ApplicationLocation], self_ip: &str, tolerance_ms: u64) -> bool {
    if peers.len() == 1 {
        return true;
    }
    designated_leader(peers, tolerance_ms)
        .map(|leader| leader.host() == host_of(self_ip))
        .unwrap_or(false)
}

// ════════════════════════════════════════════════════════════════════════════
// TESTS
// ════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(ip: &str, broadcasted_at: u64, running_since: Option<u64>) -> ApplicationLocation {
        ApplicationLocation {
            name: "db".into(),
            hash: "h".into(),
            ip: ip.into(),
            broadcasted_at,
            running_since,
            expire_at: u64::MAX,
        }
    }

    #[test]
    fn test_zero_and_one_peer() {
        assert!(!is_designated_leader(&[], "1.1.1.1", 0));
        assert!(is_designated_leader(&[peer("9.9.9.9", 5, None)], "1.1.1.1", 0));
    }

    #[test]
    fn test_earliest_unstarted_wins() {
        let peers = vec![
            peer("10.0.0.3", 300, None),
            peer("10.0.0.1", 100, Some(50)),
            peer("10.0.0.2", 200, None),
        ];
        assert!(is_designated_leader(&peers, "10.0.0.2", 0));
        assert!(!is_designated_leader(&peers, "10.0.0.1", 0));
        assert!(!is_designated_leader(&peers, "10.0.0.3", 0));
    }

    #[test]
    fn test_tie_within_tolerance_lowest_ip() {
        let peers = vec![peer("10.0.0.9", 1_000, None), peer("10.0.0.5", 1_004, None)];
        assert!(is_designated_leader(&peers, "10.0.0.5:16127", 10));
        // Outside the window the earlier broadcast wins
        assert!(is_designated_leader(&peers, "10.0.0.9", 2));
    }

    #[test]
    fn test_all_started_falls_back_to_running_since() {
        let peers = vec![peer("10.0.0.1", 1, Some(900)), peer("10.0.0.2", 2, Some(800))];
        assert!(is_designated_leader(&peers, "10.0.0.2", 0));
    }

    #[test]
    fn test_exactly_one_leader_and_order_independent() {
        let mut peers = vec![
            peer("10.0.0.4", 500, None),
            peer("10.0.0.2", 502, None),
            peer("10.0.0.7", 400, Some(10)),
            peer("10.0.0.3", 900, None),
        ];
        let count = |ps: &[ApplicationLocation]| ps.iter().filter(|p| is_designated_leader(ps, &p.ip, 5)).count();
        assert_eq!(count(&peers), 1);
        let before: Vec<bool> = peers.iter().map(|p| is_designated_leader(&peers, &p.ip, 5)).collect();
        peers.reverse();
        let mut after: Vec<bool> = peers.iter().map(|p| is_designated_leader(&peers, &p.ip, 5)).collect();
        after.reverse();
        assert_eq!(before, after);
        assert!(is_designated_leader(&peers, "10.0.0.2", 5));
    }
}

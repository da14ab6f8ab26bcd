// Numan Thabit 2025
// sched/lookahead.rs - batch ordering for several future slots

use std::cmp::Ordering;

use crate::wire::NodeId;

/// Scheduling view of one node when a batch is planned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Candidate {
    pub id: NodeId,
    pub buffer_level: u8,
    /// Slots since the node last got a transmit opportunity.
    pub waited: u16,
}

/// Orders `candidates` into at most `slots` entries of `out`.
///
/// Nodes past `max_latency` come first, most overdue leading. The rest follow
/// by descending buffer level, then by longest wait. A node whose level
/// exceeds the next one's receives that difference as extra slots.
/// Returns how many leading entries of `out` are overdue nodes.
pub fn plan_batch(
    candidates: &mut [Candidate],
    slots: usize,
    max_latency: u16,
    out: &mut Vec<NodeId>,
) -> usize {
    out.clear();
    let overdue = |c: &Candidate| c.waited >= max_latency;
    candidates.sort_by(|a, b| match (overdue(a), overdue(b)) {
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        (true, true) => b.waited.cmp(&a.waited).then(a.id.cmp(&b.id)),
        (false, false) => b
            .buffer_level
            .cmp(&a.buffer_level)
            .then(b.waited.cmp(&a.waited))
            .then(a.id.cmp(&b.id)),
    });

    let overdue_len = candidates.iter().take_while(|c| overdue(c)).count();
    for c in &candidates[..overdue_len] {
        if out.len() == slots {
            return out.len();
        }
        out.push(c.id);
    }
    let overdue_planned = out.len();

    let backlog = &candidates[overdue_len..];
    for (i, c) in backlog.iter().enumerate() {
        if c.buffer_level == 0 || out.len() == slots {
            break;
        }
        let next_level = backlog.get(i + 1).map_or(0, |n| n.buffer_level);
        let copies = usize::from(c.buffer_level - next_level)
            .max(1)
            .min(slots - out.len());
        out.extend(std::iter::repeat(c.id).take(copies));
    }
    overdue_planned
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cand(raw: u8, buffer_level: u8, waited: u16) -> Candidate {
        Candidate {
            id: NodeId::new(raw).unwrap(),
            buffer_level,
            waited,
        }
    }

    fn ids(out: &[NodeId]) -> Vec<u8> {
        out.iter().map(|id| id.get()).collect()
    }

    #[test]
    fn overdue_nodes_lead_by_lateness() {
        let mut c = vec![cand(1, 9, 3), cand(2, 0, 40), cand(3, 0, 50)];
        let mut out = Vec::new();
        let overdue = plan_batch(&mut c, 4, 32, &mut out);
        assert_eq!(overdue, 2);
        assert_eq!(ids(&out), vec![3, 2, 1, 1]);
    }

    #[test]
    fn equal_levels_rotate_by_wait() {
        let mut c = vec![cand(1, 4, 2), cand(2, 4, 7), cand(3, 4, 5)];
        let mut out = Vec::new();
        plan_batch(&mut c, 3, 32, &mut out);
        assert_eq!(ids(&out), vec![2, 3, 1]);
    }

    #[test]
    fn heavy_feeder_gets_level_difference() {
        let mut c = vec![cand(1, 1, 9), cand(2, 3, 0), cand(3, 1, 4)];
        let mut out = Vec::new();
        plan_batch(&mut c, 4, 32, &mut out);
        assert_eq!(ids(&out), vec![2, 2, 1, 3]);
    }

    #[test]
    fn idle_nodes_are_not_planned() {
        let mut c = vec![cand(1, 0, 5), cand(2, 0, 1)];
        let mut out = Vec::new();
        assert_eq!(plan_batch(&mut c, 4, 32, &mut out), 0);
        assert!(out.is_empty());
    }
}

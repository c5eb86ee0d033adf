// ABOUTME: Load-balancing strategies for picking among eligible pooled connections

use rand::Rng;
use serde::{Deserialize, Serialize};

/// How `acquire()` chooses among eligible connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancing {
    /// Rotate through slots in order
    #[default]
    RoundRobin,
    /// Fewest outstanding leases wins; healthy beats degraded on ties
    LeastConnections,
    /// Uniform choice
    Random,
}

/// What the selector needs to know about one eligible slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Candidate {
    /// Position in the pool's slot list
    pub index: usize,
    /// Callers currently holding this connection
    pub leases: usize,
    /// False for `Degraded` connections
    pub healthy: bool,
}

impl LoadBalancing {
    /// Pick one candidate and return its slot index.
    ///
    /// `cursor` is the round-robin position; it is advanced past the chosen
    /// slot and ignored by the other strategies. Candidates must be sorted by
    /// `index`.
    pub fn select(self, candidates: &[Candidate], cursor: &mut usize) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }
        let chosen = match self {
            Self::RoundRobin => candidates
                .iter()
                .find(|c| c.index >= *cursor)
                .or_else(|| candidates.first())
                .map(|c| c.index),
            Self::LeastConnections => candidates
                .iter()
                .min_by_key(|c| (c.leases, !c.healthy, c.index))
                .map(|c| c.index),
            Self::Random => {
                let pick = rand::thread_rng().gen_range(0..candidates.len());
                Some(candidates[pick].index)
            }
        };
        if let Some(index) = chosen {
            *cursor = index + 1;
        }
        chosen
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidates(specs: &[(usize, usize, bool)]) -> Vec<Candidate> {
        specs
            .iter()
            .map(|&(index, leases, healthy)| Candidate {
                index,
                leases,
                healthy,
            })
            .collect()
    }

    #[test]
    fn test_round_robin_rotates_and_wraps() {
        let list = candidates(&[(0, 0, true), (2, 0, true), (3, 0, true)]);
        let mut cursor = 0;
        let picks: Vec<_> = (0..4)
            .map(|_| LoadBalancing::RoundRobin.select(&list, &mut cursor).unwrap())
            .collect();
        assert_eq!(picks, vec![0, 2, 3, 0]);
    }

    #[test]
    fn test_least_connections_prefers_idle_then_healthy() {
        let list = candidates(&[(0, 2, true), (1, 0, false), (2, 0, true), (3, 1, true)]);
        let mut cursor = 0;
        assert_eq!(LoadBalancing::LeastConnections.select(&list, &mut cursor), Some(2));
    }

    #[test]
    fn test_random_stays_in_candidate_set() {
        let list = candidates(&[(1, 0, true), (4, 0, true)]);
        let mut cursor = 0;
        for _ in 0..50 {
            let pick = LoadBalancing::Random.select(&list, &mut cursor).unwrap();
            assert!(pick == 1 || pick == 4);
        }
    }

    #[test]
    fn test_empty_candidates() {
        let mut cursor = 0;
        assert_eq!(LoadBalancing::RoundRobin.select(&[], &mut cursor), None);
        assert_eq!(cursor, 0);
    }

    #[test]
    fn test_serde_names() {
        let parsed: LoadBalancing = serde_json::from_str("\"least_connections\"").unwrap();
        assert_eq!(parsed, LoadBalancing::LeastConnections);
    }
}

//! Load Balancer (spec.md §4.3 step 5, §9): a strategy-object picking one
//! healthy server from the candidate set the dispatcher hands it. Modeled as
//! a small behavioral contract shared by both concrete balancers, per spec.md
//! §9's "the two concrete balancers share one small behavioral contract".

use std::sync::atomic::{AtomicUsize, Ordering};

use uuid::Uuid;

use crate::model::LbStrategy;

/// One candidate the balancer chooses among: enough of `ServerState` to rank
/// it, without coupling this module to the A/B zone map directly.
#[derive(Debug, Clone, Copy)]
pub struct Candidate {
	pub id: Uuid,
	pub active_connections: i64,
}

pub trait Balancer: Send + Sync {
	fn select(&self, candidates: &[Candidate]) -> Option<Uuid>;
}

/// Picks the candidate with the fewest active connections, ties broken by
/// lowest id for determinism.
pub struct LeastConnections;

impl Balancer for LeastConnections {
	fn select(&self, candidates: &[Candidate]) -> Option<Uuid> {
		candidates.iter().min_by_key(|c| (c.active_connections, c.id)).map(|c| c.id)
	}
}

/// Cycles the candidate set (sorted by id for a stable order) with an atomic
/// counter, per spec.md §4.3's "round-robin cycles sorted ids with an atomic
/// counter".
pub struct RoundRobin {
	counter: AtomicUsize,
}

impl RoundRobin {
	pub fn new() -> Self {
		RoundRobin { counter: AtomicUsize::new(0) }
	}
}

impl Default for RoundRobin {
	fn default() -> Self {
		Self::new()
	}
}

impl Balancer for RoundRobin {
	fn select(&self, candidates: &[Candidate]) -> Option<Uuid> {
		if candidates.is_empty() {
			return None;
		}
		let mut sorted: Vec<Uuid> = candidates.iter().map(|c| c.id).collect();
		sorted.sort();
		let idx = self.counter.fetch_add(1, Ordering::Relaxed) % sorted.len();
		Some(sorted[idx])
	}
}

pub fn build(strategy: LbStrategy) -> Box<dyn Balancer> {
	match strategy {
		LbStrategy::LeastConnections => Box::new(LeastConnections),
		LbStrategy::RoundRobin => Box::new(RoundRobin::new()),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn candidate(n: u8, active: i64) -> Candidate {
		Candidate { id: Uuid::from_bytes([n; 16]), active_connections: active }
	}

	#[test]
	fn least_connections_picks_minimum() {
		let lb = LeastConnections;
		let candidates = vec![candidate(1, 5), candidate(2, 1), candidate(3, 3)];
		assert_eq!(lb.select(&candidates), Some(candidate(2, 1).id));
	}

	#[test]
	fn empty_candidates_select_none() {
		let lb = LeastConnections;
		assert_eq!(lb.select(&[]), None);
		assert_eq!(RoundRobin::new().select(&[]), None);
	}

	#[test]
	fn round_robin_cycles() {
		let lb = RoundRobin::new();
		let candidates = vec![candidate(1, 0), candidate(2, 0), candidate(3, 0)];
		let first = lb.select(&candidates).unwrap();
		let second = lb.select(&candidates).unwrap();
		let third = lb.select(&candidates).unwrap();
		let fourth = lb.select(&candidates).unwrap();
		assert_ne!(first, second);
		assert_ne!(second, third);
		assert_eq!(first, fourth);
	}
}

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use tracing::info;

use crate::telemetry;

/// Tracks which startup tasks are still outstanding; the process is "ready"
/// once the set is empty.
#[derive(Clone, Debug, Default)]
pub struct Ready(Arc<Mutex<HashSet<String>>>);

impl Ready {
	pub fn new() -> Ready {
		Ready(Default::default())
	}

	/// Registers a dependency that must complete before the process is ready.
	pub fn register_task(&self, name: &str) -> BlockReady {
		self.0.lock().unwrap().insert(name.to_string());
		BlockReady {
			parent: self.to_owned(),
			name: name.to_string(),
		}
	}

	pub fn pending(&self) -> HashSet<String> {
		self.0.lock().unwrap().clone()
	}
}

/// Blocks readiness until dropped.
pub struct BlockReady {
	parent: Ready,
	name: String,
}

impl BlockReady {
	pub fn subtask(&self, name: &str) -> BlockReady {
		self.parent.register_task(name)
	}
}

impl Drop for BlockReady {
	fn drop(&mut self) {
		let mut pending = self.parent.0.lock().unwrap();
		let removed = pending.remove(&self.name);
		debug_assert!(removed);
		let left = pending.len();
		let dur = telemetry::APPLICATION_START_TIME.elapsed();
		if left == 0 {
			info!("task '{}' complete ({dur:?}), marking server ready", self.name);
		} else {
			info!(
				"task '{}' complete ({dur:?}), still awaiting {left} tasks",
				self.name
			);
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn ready_tracks_outstanding_tasks() {
		let ready = Ready::new();
		let a = ready.register_task("state-manager");
		let b = ready.register_task("health-checker");
		assert_eq!(ready.pending().len(), 2);
		drop(a);
		assert_eq!(ready.pending(), HashSet::from(["health-checker".to_string()]));
		drop(b);
		assert!(ready.pending().is_empty());
	}

	#[test]
	fn subtask_registers_under_the_same_set() {
		let ready = Ready::new();
		let parent = ready.register_task("gateway");
		let child = parent.subtask("gateway-listener");
		assert_eq!(ready.pending().len(), 2);
		drop(child);
		drop(parent);
		assert!(ready.pending().is_empty());
	}
}

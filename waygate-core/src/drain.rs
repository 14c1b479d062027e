use tokio::sync::watch;

pub use internal::{DrainTrigger, Watch as DrainWatcher, ReleaseShutdown as DrainBlocker};

/// Builds a new drain pair.
///
/// `DrainTrigger` starts a drain and waits for it to complete.
/// `DrainWatcher` is held by anything that wants to participate in draining;
/// it may be cloned, and a drain does not complete until every clone is dropped.
pub fn new() -> (DrainTrigger, DrainWatcher) {
	internal::channel()
}

mod internal {
	use tokio::sync::{mpsc, watch};

	pub fn channel() -> (DrainTrigger, Watch) {
		let (signal_tx, signal_rx) = watch::channel(false);
		let (drained_tx, drained_rx) = mpsc::channel(1);
		(
			DrainTrigger {
				drained_rx,
				signal_tx,
			},
			Watch {
				drained_tx,
				signal_rx,
			},
		)
	}

	enum Never {}

	/// Starts a drain and waits for every outstanding [`Watch`] to be dropped.
	pub struct DrainTrigger {
		drained_rx: mpsc::Receiver<Never>,
		signal_tx: watch::Sender<bool>,
	}

	impl DrainTrigger {
		/// Signal all watchers to begin draining, then wait for every handle to release.
		pub async fn start_drain_and_wait(mut self) {
			let _ = self.signal_tx.send(true);
			match self.drained_rx.recv().await {
				None => {},
				Some(n) => match n {},
			}
		}

		pub fn watcher_count(&self) -> usize {
			self.signal_tx.receiver_count()
		}
	}

	/// Watch for a drain signal. Clone freely; a drain blocks until all clones drop.
	#[derive(Clone)]
	pub struct Watch {
		drained_tx: mpsc::Sender<Never>,
		signal_rx: watch::Receiver<bool>,
	}

	impl Watch {
		/// Waits until a drain has been signaled, then returns a handle that must be
		/// dropped once the caller has finished any in-flight work.
		pub async fn signaled(mut self) -> ReleaseShutdown {
			let _ = self.signal_rx.wait_for(|v| *v).await;
			ReleaseShutdown(self.drained_tx)
		}
	}

	impl std::fmt::Debug for Watch {
		fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
			f.debug_struct("DrainWatcher").finish_non_exhaustive()
		}
	}

	#[must_use = "ReleaseShutdown should be dropped explicitly to unblock the drain"]
	pub struct ReleaseShutdown(mpsc::Sender<Never>);
}

#[cfg(test)]
mod test {
	use std::sync::Arc;
	use std::sync::atomic::{AtomicUsize, Ordering};

	use super::*;

	#[tokio::test]
	async fn drain_waits_for_all_watchers() {
		let (trigger, watcher) = new();
		let done = Arc::new(AtomicUsize::new(0));
		for _ in 0..3 {
			let watcher = watcher.clone();
			let done = done.clone();
			tokio::spawn(async move {
				let _release = watcher.signaled().await;
				tokio::time::sleep(std::time::Duration::from_millis(5)).await;
				done.fetch_add(1, Ordering::SeqCst);
			});
		}
		drop(watcher);
		trigger.start_drain_and_wait().await;
		assert_eq!(done.load(Ordering::SeqCst), 3);
	}
}

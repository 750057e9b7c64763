//! Cluster-wide view of what every servant is currently running, ported
//! from `original_source/yadcc/scheduler/running_task_bookkeeper.{h,cc}`.

use std::collections::HashMap;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// One task a servant reported as currently running, identified by its
/// grant id. Distributed back to every servant in the cluster so clients
/// picking a servant for a cache-populating compile can see where a given
/// grant is already executing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunningTask {
	pub servant_task_id: u64,
}

/// Merges per-servant heartbeat reports into one cluster-wide list.
///
/// There is exactly one daemon reporting its own running-task info at a
/// time, so each heartbeat simply replaces that servant's prior entry
/// wholesale rather than being merged field-by-field.
#[derive(Debug, Default)]
pub struct RunningTaskBookkeeper {
	running_tasks: Mutex<HashMap<String, Vec<RunningTask>>>,
}

impl RunningTaskBookkeeper {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn set_servant_running_tasks(&self, servant_location: impl Into<String>, tasks: Vec<RunningTask>) {
		self.running_tasks.lock().insert(servant_location.into(), tasks);
	}

	/// Drops a servant's entry entirely, called when its heartbeat lapses.
	pub fn drop_servant(&self, servant_location: &str) {
		self.running_tasks.lock().remove(servant_location);
	}

	pub fn running_tasks(&self) -> Vec<RunningTask> {
		self.running_tasks.lock().values().flatten().copied().collect()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn set_then_get_round_trips_in_order() {
		let bookkeeper = RunningTaskBookkeeper::new();
		let tasks: Vec<_> = (0..3).map(|i| RunningTask { servant_task_id: 100 + i }).collect();
		bookkeeper.set_servant_running_tasks("my location", tasks);

		let ids: Vec<_> = bookkeeper.running_tasks().iter().map(|t| t.servant_task_id).collect();
		assert_eq!(ids, vec![100, 101, 102]);
	}

	#[test]
	fn drop_servant_clears_its_tasks() {
		let bookkeeper = RunningTaskBookkeeper::new();
		bookkeeper.set_servant_running_tasks("my location", vec![RunningTask { servant_task_id: 1 }]);
		bookkeeper.drop_servant("my location");
		assert!(bookkeeper.running_tasks().is_empty());
	}

	#[test]
	fn a_later_report_replaces_the_earlier_one_wholesale() {
		let bookkeeper = RunningTaskBookkeeper::new();
		bookkeeper.set_servant_running_tasks("loc", vec![RunningTask { servant_task_id: 1 }, RunningTask { servant_task_id: 2 }]);
		bookkeeper.set_servant_running_tasks("loc", vec![RunningTask { servant_task_id: 3 }]);
		let ids: Vec<_> = bookkeeper.running_tasks().iter().map(|t| t.servant_task_id).collect();
		assert_eq!(ids, vec![3]);
	}
}

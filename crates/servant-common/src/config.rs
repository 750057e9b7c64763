//! Process-wide configuration, parsed from CLI flags with environment
//! variable fallbacks. Every other crate receives already-validated values
//! out of a [`Config`] rather than re-parsing flags itself.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};

use crate::size::{parse_size, ParseSizeError};

/// How aggressively this servant should claim local CPU capacity for
/// network-submitted tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServantPriority {
	/// Up to 40% of processors, and only on machines with enough cores and
	/// no surrounding cgroup constraining our real capacity.
	User,
	/// Up to 95% of processors, unconditionally.
	Dedicated,
}

impl Default for ServantPriority {
	fn default() -> Self {
		ServantPriority::User
	}
}

/// Why this servant currently reports zero task capacity in its heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum NotAcceptingTaskReason {
	CGroupsPresent,
	PoorMachine,
	UserInstructed,
}

impl NotAcceptingTaskReason {
	pub fn as_str(self) -> &'static str {
		match self {
			NotAcceptingTaskReason::CGroupsPresent => "cgroups_present",
			NotAcceptingTaskReason::PoorMachine => "poor_machine",
			NotAcceptingTaskReason::UserInstructed => "user_instructed",
		}
	}
}

#[derive(Debug, Parser, Clone)]
#[command(name = "compute-servantd", about = "Distributed compilation servant daemon")]
pub struct Config {
	/// Maximum number of network-submitted tasks to run concurrently. `-1`
	/// (the default) derives the limit from `--servant-priority` instead.
	#[arg(long, env = "SERVANT_MAX_REMOTE_TASKS", default_value_t = -1)]
	pub max_remote_tasks: i64,

	#[arg(long, env = "SERVANT_PRIORITY", value_enum, default_value_t = ServantPriority::User)]
	pub servant_priority: ServantPriority,

	/// Below this much free memory, refuse to start any new task.
	#[arg(long, env = "SERVANT_MIN_MEMORY_FOR_NEW_TASK", default_value = "2G")]
	pub min_memory_for_starting_new_task: String,

	/// Machines with this many processor cores or fewer are never handed
	/// network tasks under `--servant-priority=user`.
	#[arg(long, env = "SERVANT_POOR_MACHINE_THRESHOLD_PROCESSORS", default_value_t = 16)]
	pub poor_machine_threshold_processors: usize,

	/// Directory for scratch files (source input, compiled output, stdout
	/// and stderr capture). Defaults to `/dev/shm` when it has enough free
	/// space, falling back to `/tmp` otherwise; see `servant_sysinfo::temp_dir`.
	#[arg(long, env = "SERVANT_TEMPORARY_DIR")]
	pub temporary_dir: Option<PathBuf>,

	/// Window, in seconds, over which processor load is averaged for the
	/// heartbeat's `current_load` field.
	#[arg(long, env = "SERVANT_CPU_LOAD_AVERAGE_SECONDS", default_value_t = 10)]
	pub cpu_load_average_seconds: u64,

	/// Scheduler RPC endpoint this servant heartbeats to.
	#[arg(long, env = "SERVANT_SCHEDULER_URI")]
	pub scheduler_uri: String,

	/// Shared secret presented to the scheduler and to clients, identifying
	/// this servant as belonging to the cluster.
	#[arg(long, env = "SERVANT_TOKEN")]
	pub token: String,

	/// Local address the Daemon Service RPC surface listens on.
	#[arg(long, env = "SERVANT_LISTEN_ADDR", default_value = "127.0.0.1:8334")]
	pub listen_addr: String,

	/// Cache engine backend to use: `object-store` or `null`.
	#[arg(long, env = "SERVANT_CACHE_ENGINE", default_value = "object-store")]
	pub cache_engine: String,

	/// `object_store`-compatible URL for the cache backend, e.g.
	/// `s3://bucket/prefix` or `file:///var/cache/compute-servant`.
	#[arg(long, env = "SERVANT_CACHE_URI")]
	pub cache_uri: Option<String>,

	/// Total size budget for the distributed cache before old entries are
	/// purged.
	#[arg(long, env = "SERVANT_CACHE_CAPACITY", default_value = "10G")]
	pub cache_capacity: String,

	/// RPC endpoint of the cache service `PutEntry` is called against.
	/// Defaults to the scheduler-uri's host with the cache service's
	/// well-known port, since in practice they're co-located; set
	/// explicitly when they aren't.
	#[arg(long, env = "SERVANT_CACHE_SERVICE_URI")]
	pub cache_service_uri: Option<String>,

	/// JSON manifest of `{triple, compiler_version, digest, path}` entries
	/// describing the toolchains this servant can compile for. Absent means
	/// an empty registry: every compile request is rejected with
	/// `ENVIRONMENT_NOT_AVAILABLE`.
	#[arg(long, env = "SERVANT_COMPILER_REGISTRY")]
	pub compiler_registry_path: Option<PathBuf>,
}

impl Config {
	pub fn min_memory_for_starting_new_task_bytes(&self) -> Result<u64, ParseSizeError> {
		parse_size(&self.min_memory_for_starting_new_task)
	}

	pub fn cache_capacity_bytes(&self) -> Result<u64, ParseSizeError> {
		parse_size(&self.cache_capacity)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use clap::CommandFactory;

	#[test]
	fn command_is_well_formed() {
		Config::command().debug_assert();
	}

	#[test]
	fn parses_minimal_required_args() {
		let cfg = Config::parse_from([
			"compute-servantd",
			"--scheduler-uri",
			"http://scheduler.local:9000",
			"--token",
			"secret",
		]);
		assert_eq!(cfg.max_remote_tasks, -1);
		assert_eq!(cfg.min_memory_for_starting_new_task_bytes().unwrap(), 2 * 1024 * 1024 * 1024);
	}
}

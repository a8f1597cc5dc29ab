//! Load-bearing defaults for the agent configuration.

/// Controller request port.
pub const MASTER_PORT: u16 = 4506;
/// Controller publish port (request port - 1, as the wire layout fixes).
pub const PUBLISH_PORT: u16 = 4505;
/// Local event publish port under `ipc_mode: tcp`.
pub const TCP_PUB_PORT: u16 = 4510;
/// Local event pull port under `ipc_mode: tcp`.
pub const TCP_PULL_PORT: u16 = 4511;

pub const LOOP_INTERVAL_SECS: u64 = 1;
pub const AUTH_TIMEOUT_SECS: u64 = 60;
pub const AUTH_TRIES: u32 = 7;
pub const ACCEPTANCE_WAIT_TIME_SECS: u64 = 10;
pub const ACCEPTANCE_WAIT_TIME_MAX_SECS: u64 = 0;
pub const RETURN_RETRY_TIMER_SECS: u64 = 5;
pub const RETURN_RETRY_TIMER_MAX_SECS: u64 = 10;
pub const CHANNEL_SEND_TIMEOUT_SECS: u64 = 60;
pub const MINE_INTERVAL_MINUTES: u64 = 60;
pub const SYNDIC_EVENT_FORWARD_TIMEOUT_SECS: f64 = 0.5;
pub const SYNDIC_JID_FORWARD_CACHE_HWM: usize = 100;
pub const MASTER_JOB_CACHE: &str = "local_cache";

/// Size at which the live agent log rolls to an archive.
pub const LOG_FILE_CAP_BYTES: u64 = 10 * 1024 * 1024;
/// Rolled log archives kept per binary; older ones are pruned.
pub const LOG_KEEP_ARCHIVES: usize = 4;

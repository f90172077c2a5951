//! System-wide default values.
//!
//! Every value here can be overridden through the environment variables
//! documented in `config`; these are the fallbacks applied when a variable
//! is absent or unparseable.

// Task runner step machine
/// Maximum transient retries per step before the failure becomes permanent.
pub const TASK_RUNNER_STEP_MAX_RETRIES: u32 = 3;

/// Base delay for exponential step retry backoff.
pub const TASK_RUNNER_RETRY_BASE_DELAY_MS: u64 = 5_000;

/// Ceiling on step retry backoff.
pub const TASK_RUNNER_RETRY_MAX_DELAY_MS: u64 = 60_000;

/// Poll interval while waiting on the in-VM agent (health and readiness).
pub const TASK_RUNNER_AGENT_POLL_INTERVAL_MS: u64 = 5_000;

/// Wall-clock budget for the agent health endpoint to come up.
pub const TASK_RUNNER_AGENT_READY_TIMEOUT_MS: u64 = 120_000;

/// Wall-clock budget for the workspace-ready callback.
pub const TASK_RUNNER_WORKSPACE_READY_TIMEOUT_MS: u64 = 600_000;

/// Poll interval while a provisioned node boots.
pub const TASK_RUNNER_PROVISION_POLL_INTERVAL_MS: u64 = 10_000;

/// Per-call timeout for the agent health probe.
pub const AGENT_HEALTH_PROBE_TIMEOUT_SECS: u64 = 5;

// Capacity limits
pub const MAX_NODES_PER_USER: u32 = 10;
pub const MAX_WORKSPACES_PER_NODE: u32 = 10;

/// Nodes above this CPU load are excluded from capacity placement.
pub const TASK_RUN_NODE_CPU_THRESHOLD_PERCENT: f64 = 80.0;

/// Nodes above this memory usage are excluded from capacity placement.
pub const TASK_RUN_NODE_MEMORY_THRESHOLD_PERCENT: f64 = 85.0;

// Session store
pub const MAX_SESSIONS_PER_PROJECT: u32 = 1_000;
pub const MAX_MESSAGES_PER_SESSION: u32 = 10_000;

/// Coalescing window for the project summary syncback.
pub const DO_SUMMARY_SYNC_DEBOUNCE_MS: u64 = 5_000;

/// Idle window after agent completion before session cleanup fires.
pub const SESSION_IDLE_TIMEOUT_MINUTES: u64 = 15;

/// Delay before an idle cleanup that hit a transient failure is retried.
pub const IDLE_CLEANUP_RETRY_DELAY_MS: u64 = 300_000;

pub const IDLE_CLEANUP_MAX_RETRIES: u32 = 1;

/// Chat session topics are captured from the first user message and
/// truncated to this many characters.
pub const SESSION_TOPIC_MAX_CHARS: usize = 100;

// Sweeper
pub const SWEEPER_INTERVAL_SECS: u64 = 60;
pub const STUCK_QUEUED_TIMEOUT_MINUTES: i64 = 15;
pub const STUCK_IN_PROGRESS_TIMEOUT_MINUTES: i64 = 120;

/// Cold running nodes untouched for this long with no live workspace are
/// reaped back into the warm pool. The grace window covers the gap between
/// a warm claim and the first workspace insert.
pub const ORPHAN_NODE_GRACE_MINUTES: i64 = 5;

// VM agent error ingest
/// Maximum entries accepted in one `/nodes/{id}/errors` batch.
pub const MAX_VM_AGENT_ERROR_BATCH_ENTRIES: usize = 10;

/// Maximum size of a single error entry message.
pub const MAX_VM_AGENT_ERROR_ENTRY_BYTES: usize = 32 * 1024;

/// Maximum accepted request body for the error ingest endpoint.
pub const MAX_VM_AGENT_ERROR_BODY_BYTES: usize = 512 * 1024;

// API defaults
pub const DEFAULT_API_HOST: &str = "127.0.0.1";
pub const DEFAULT_API_PORT: u16 = 3100;

/// Port the in-VM agent listens on.
pub const DEFAULT_NODE_AGENT_PORT: u16 = 3030;

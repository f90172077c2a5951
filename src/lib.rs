//! # Strato Core
//!
//! Strato Core is the task orchestration engine of the Strato cloud
//! development platform. It provisions VMs on an external cloud provider,
//! brokers AI coding-agent sessions between browser clients and the agent
//! process inside each VM, and keeps per-project chat history with
//! real-time fan-out to viewers.
//!
//! ## Architecture
//!
//! - **Task Orchestrator**: per-task state machines that select or
//!   provision a node, create a workspace and start an agent session,
//!   surviving process restarts
//! - **Per-Project Session Store**: isolated chat/activity storage per
//!   project with viewer WebSockets and idle-cleanup alarms
//! - **Node Lifecycle Manager**: serialised warm-pool transitions per node
//! - **Stuck-task Sweeper**: safety net for abandoned tasks and orphaned
//!   nodes
//!
//! The service runs alongside an external HTTP gateway that owns user
//! authentication and task submission; this crate owns everything between
//! "task row created" and "agent session running".

/// Callback-token authentication
pub mod auth;
/// Central metadata store (users, projects, nodes, workspaces, tasks)
pub mod cms;
/// System configuration
pub mod config;
/// System-wide constants
pub mod constants;
/// Error types and classification
pub mod error;
/// HTTP callbacks and viewer WebSockets
pub mod api;
/// Core data models
pub mod models;
/// In-VM agent HTTP client
pub mod node_agent;
/// Per-node warm-state transitions
pub mod node_lifecycle;
/// Best-effort error-record store
pub mod observability;
/// Per-task orchestration engine
pub mod orchestrator;
/// Cloud-provider REST client
pub mod provider;
/// Per-project session store
pub mod session_store;
/// Stuck-task sweeper
pub mod sweeper;

#[cfg(test)]
mod tests;

pub use error::{ErrorClass, Result, StratoError};

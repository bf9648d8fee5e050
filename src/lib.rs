//! # Companion Core
//!
//! Agent task orchestration core for the Companion chat assistant.
//!
//! This library provides:
//! - A capability registry resolving agent names to pluggable handlers
//! - A durable task lifecycle with approval gating and an audit trail
//! - A fan-out executor collapsing independent tool calls into one
//!   concurrent round-trip
//! - A durable, retrying email outbox with exponential backoff
//! - An HTTP API for task submission and operator administration
//!
//! ## Task Flow
//! 1. A supervisor submits a task naming an agent (resolved at dispatch
//!    time, not at creation)
//! 2. The worker enforces the approval gate, runs the handler, and records
//!    every transition to the task store and the append-only audit trail
//! 3. Capabilities that send mail enqueue on the outbox; a periodic worker
//!    drains it with retry and backoff, independent of the task path
//!
//! ## Modules
//! - `registry`: named capability handlers
//! - `worker`: single-task execution and lifecycle recording
//! - `executor`: concurrent fan-out over tool-call batches
//! - `outbox`: persisted delivery queue and transport backends
//! - `api`: axum HTTP surface, operator-gated administration

pub mod api;
pub mod audit;
pub mod capabilities;
pub mod config;
pub mod error;
pub mod executor;
pub mod outbox;
pub mod registry;
pub mod task;
pub mod task_store;
pub mod worker;

pub use config::Config;
pub use error::CoreError;
pub use task::{Task, TaskStatus};

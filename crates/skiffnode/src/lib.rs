//! skiffnode — the Skiff node agent.
//!
//! Registers with the panel, heartbeats with host metrics, pulls rendered
//! forwarder configs and applies them with validate/snapshot/swap/rollback
//! semantics, submits traffic counters, and executes panel-issued commands.

#![forbid(unsafe_code)]

pub mod client;
pub mod commands;
pub mod config;
pub mod error;
pub mod forwarder;
pub mod health;
pub mod metrics;
pub mod supervisor;
pub mod traffic;

pub use client::PanelClient;
pub use config::AgentConfig;
pub use supervisor::Agent;

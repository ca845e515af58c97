//! issuewright-agents: the two reasoning-backed agents and the collaborators
//! they depend on.
//!
//! - Requirements agent: refines an issue through clarification rounds
//! - Code agent: turns refined requirements into a branch, commits and a PR
//! - Retry executor: the single place retry/backoff lives
//! - Collaborators: reasoning backend, VCS, durable conversation store

pub mod agent;
pub mod code;
pub mod domain;
pub mod error;
pub mod llm;
pub mod models;
pub mod output;
pub mod requirements;
pub mod retry;
pub mod store;
pub mod vcs;

pub use agent::AgentDeps;
pub use error::{Error, Result, Service};

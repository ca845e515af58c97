//! Webhook gateway and lifecycle orchestrator.
//!
//! Deliveries are verified, classified, deduplicated by delivery id and then
//! dispatched to the [`orchestrator::Orchestrator`], which drives each issue
//! through analysis, clarification and code generation.

pub mod config;
pub mod error;
pub mod events;
pub mod orchestrator;
pub mod server;
pub mod signature;
pub mod web;

pub use error::{GatewayError, WebhookResponse};

//! # Agent Authorization Module
//!
//! Autonomous agents spend on a user's behalf within limits the user sets.
//! Every spend is authorized here first, against a live proof and rolling
//! spend windows, and comes back as a signed single-use token.

pub mod config;
pub mod engine;
pub mod token;

pub use config::{
    AgentConfig, AgentError, AgentPatch, AgentRecord, AgentStatus, NewAgent, Permission,
    SpendEvent,
};
pub use engine::AgentEngine;
pub use token::{AuthorizationToken, TokenRecord};

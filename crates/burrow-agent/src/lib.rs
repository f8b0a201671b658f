//! Burrow agent: connects out to the server and hosts the dialing or
//! listening side of tunnels on its own network.

pub mod agent;
pub mod handler;
pub mod socks;

pub use agent::{Agent, AgentConfig, AgentError, SessionEnd};

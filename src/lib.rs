//! pi-relay - RPC client and chat relay for the pi coding agent.

pub mod config;
pub mod display;
pub mod relay;
pub mod rpc;

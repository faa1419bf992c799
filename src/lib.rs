//! loom — orchestration core for LLM-assisted app generation.
//!
//! Turns a natural-language product request into a deployed web application:
//! a planner produces a phased blueprint, the orchestrator generates each
//! phase through the inference gateway, code runs in a remote sandbox, and
//! clients observe progress over a WebSocket control channel. Session state
//! is durable and owned by a single-writer actor per session.

pub mod config;
pub mod errors;
pub mod export;
pub mod fixer;
pub mod inference;
pub mod orchestrator;
pub mod planner;
pub mod sandbox;
pub mod server;
pub mod session;
pub mod ws;

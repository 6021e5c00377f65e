//! Cofe Relay Server Library
//!
//! HTTP gateway between the chat UI and the workflow engine:
//! - Prompt submission with long-poll or async-ack delivery
//! - Workflow callback intake, routed through the core correlator
//! - Outbound webhook forwarding

pub mod error;
pub mod forwarder;
pub mod routes;

//! Client-side orchestrator for the HMON health-monitor protocol.
//!
//! This crate is the concurrency engine that dials or accepts interpreter
//! connections, negotiates the HMON handshake, multiplexes framed JSON
//! command/response traffic per session, and exposes a single typed event
//! stream plus a small set of request-style operations to callers. It does
//! not interpret fact semantics, persist anything, or speak any transport
//! other than plain TCP — those concerns belong to the consumers that sit
//! on top of it (dashboards, telemetry adapters, presentation layers).

pub mod config;
pub mod connection;
pub mod dialer;
pub mod error;
pub mod event;
pub mod fact;
pub mod frame;
pub mod listener;
pub mod orchestrator;
pub mod poller;
pub mod session;

pub use config::OrchestratorConfig;
pub use error::{HmonError, HmonResult};
pub use event::{Event, FactsResponse};
pub use fact::{Fact, FactCache, FactKind};
pub use orchestrator::{Orchestrator, ServerRef};
pub use session::{Direction, Session, SessionId, SessionRegistry, SessionState};

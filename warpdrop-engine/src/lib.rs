//! # warpdrop-engine
//!
//! Peer lifecycle and transport runtime for Warpdrop, embedded into the
//! CLI (and any future UI shell).
//!
//! This crate provides:
//! - **Discovery**: mDNS advertisement and browsing with typed
//!   peer-found / peer-lost events (flush and self records filtered)
//! - **Remote registry**: the authoritative identity-keyed map of peers
//!   and their connections
//! - **Connection state machine**: per-peer connect / disconnect /
//!   cancel with externally driven retry
//! - **Service endpoints**: the TLS transfer and registration servers
//!   sharing one bind-retry lifecycle
//! - **Orchestrator**: coordinated startup / shutdown / restart with
//!   failure classification for user-facing reporting
//! - **Transport**: TLS-over-TCP implementations of the core seams,
//!   trusted through pinned certificates only

pub mod discovery;
pub mod orchestrator;
pub mod registry;
pub mod remote;
pub mod server;
pub mod session;
pub mod tls;
pub mod trust;

#[cfg(test)]
pub(crate) mod test_support;

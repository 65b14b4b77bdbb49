//! # warpdrop-core
//!
//! Shared building blocks for the Warpdrop peer transfer protocol.
//!
//! This crate provides the foundational types and utilities used by
//! [`warpdrop-engine`] and the binary crate (`warpdrop-cli`).
//!
//! ## Responsibilities
//!
//! - **Peer data model** — [`peer::PeerRecord`] and the
//!   [`peer::PeerStatus`] state machine shared by the registry and the
//!   per-peer connections.
//!
//! - **Discovery record parsing** — the well-known service type, TXT
//!   metadata keys with their defaults, and flush-record detection.
//!
//! - **Protocol primitives** — frame format (magic / version / type /
//!   length), JSON payloads for the registration handshake and duplex
//!   hello, and certificate encoding helpers.
//!
//! - **Credentials** — the [`auth::Credentials`] pair, the
//!   [`auth::Authenticator`] seam, and a self-signed implementation.
//!
//! - **Transport seams** — [`transport::Connection`] / `Listener` /
//!   `ListenerFactory` / `Connector` traits that keep the engine
//!   independent of the concrete transport.

pub mod auth;
pub mod config;
pub mod peer;
pub mod protocol;
pub mod record;
pub mod transport;

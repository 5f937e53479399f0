//! Distlock Core - shared types for the distributed locking engines
//!
//! This crate provides the value types exchanged between agents: the
//! envelope abstraction with its performatives, the protocol tag table,
//! the Suzuki-Kasami token, the archive codec used to move structured
//! data through string message content, and the public error types.
//!
//! The engine itself lives in `distlock-engine`; the host application is
//! responsible for moving [`Envelope`]s between agents.

#![warn(clippy::pedantic)]

pub mod agent;
pub mod codec;
pub mod envelope;
pub mod error;
pub mod protocol;
pub mod state;
pub mod token;

pub use agent::AgentId;
pub use codec::{decode_archive, encode_archive};
pub use envelope::{Envelope, Performative};
pub use error::{ArchiveError, LockError, MalformedMessage};
pub use protocol::{LockProtocol, ProtocolTag};
pub use state::LockState;
pub use token::Token;

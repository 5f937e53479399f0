//! Distlock Engine - distributed mutual exclusion over named resources
//!
//! Each participating agent embeds one [`LockEngine`]. The engine is a
//! pure state machine: it never blocks, spawns no tasks, and performs no
//! I/O. The host drives it by
//!
//! 1. handing every delivered inbound message to
//!    [`LockEngine::on_incoming`],
//! 2. calling [`LockEngine::trigger`] periodically (roughly once a
//!    second) to advance failure detection,
//! 3. draining [`LockEngine::pop_next_outgoing`] after every entry-point
//!    call and moving the envelopes to their receivers.
//!
//! Two algorithms are implemented over a shared base protocol
//! (resource-owner discovery plus liveness probing): the permission-based
//! Ricart-Agrawala algorithm with Lamport clocks and deferred replies,
//! and the token-based Suzuki-Kasami algorithm. The extended variant of
//! each activates the probe-based failure detector.
//!
//! ```
//! use distlock_core::{AgentId, LockProtocol, LockState};
//! use distlock_engine::LockEngine;
//!
//! let agent2 = AgentId::from("agent2");
//! let mut engine = LockEngine::new(
//!     LockProtocol::SuzukiKasami,
//!     AgentId::from("agent1"),
//!     vec!["resource".to_owned()],
//! );
//!
//! engine.lock("resource", &[agent2]).unwrap();
//! assert_eq!(engine.lock_state("resource"), LockState::Locked);
//!
//! while let Some(_envelope) = engine.pop_next_outgoing() {
//!     // hand to the transport
//! }
//!
//! engine.unlock("resource");
//! ```

#![warn(clippy::pedantic)]

mod base;
mod conversation;
mod engine;
mod probe;
mod ricart_agrawala;
mod suzuki_kasami;


pub use engine::LockEngine;

//! The agent communication envelope.
//!
//! The engine neither opens connections nor parses wire frames; the host
//! moves these envelopes between agents and hands inbound ones to
//! [`on_incoming`](https://docs.rs/distlock-engine). A transport that
//! fails to deliver an envelope must report it back as an inbound
//! [`Performative::Failure`] envelope embedding the undelivered one (see
//! [`crate::codec`]).

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::agent::AgentId;

/// The closed set of performatives the locking protocols use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Performative {
    /// Discovery: "who owns this resource?"
    QueryIf,
    /// Discovery: "I own this resource."
    Inform,
    /// RA/SK lock request, and the probe ping.
    Request,
    /// RA permission grant.
    Agree,
    /// Lock-acquired notification to the owner, and the probe pong.
    Confirm,
    /// Lock-released notification to the owner.
    Disconfirm,
    /// SK token transfer.
    Propagate,
    /// Transport delivery failure, embedding the undelivered envelope.
    Failure,
}

impl fmt::Display for Performative {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Performative::QueryIf => "query-if",
            Performative::Inform => "inform",
            Performative::Request => "request",
            Performative::Agree => "agree",
            Performative::Confirm => "confirm",
            Performative::Disconfirm => "disconfirm",
            Performative::Propagate => "propagate",
            Performative::Failure => "failure",
        };
        f.write_str(name)
    }
}

/// An application-level message between agents.
///
/// `protocol` stays a plain string so envelopes from foreign protocols
/// can be represented (and dropped) rather than rejected at construction.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Envelope {
    pub performative: Performative,
    pub sender: AgentId,
    pub receivers: BTreeSet<AgentId>,
    pub protocol: String,
    pub conversation_id: String,
    pub content: String,
    pub language: String,
}

impl Envelope {
    /// A bare envelope with no receivers and empty content.
    #[must_use]
    pub fn new(
        performative: Performative,
        sender: AgentId,
        protocol: impl Into<String>,
        conversation_id: impl Into<String>,
    ) -> Self {
        Self {
            performative,
            sender,
            receivers: BTreeSet::new(),
            protocol: protocol.into(),
            conversation_id: conversation_id.into(),
            content: String::new(),
            language: String::new(),
        }
    }

    #[must_use]
    pub fn with_receiver(mut self, receiver: AgentId) -> Self {
        self.receivers.insert(receiver);
        self
    }

    #[must_use]
    pub fn with_receivers(mut self, receivers: impl IntoIterator<Item = AgentId>) -> Self {
        self.receivers.extend(receivers);
        self
    }

    #[must_use]
    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = content.into();
        self
    }

    /// Whether `agent` is among the addressed receivers.
    #[must_use]
    pub fn is_addressed_to(&self, agent: &AgentId) -> bool {
        self.receivers.contains(agent)
    }
}

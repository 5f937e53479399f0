//! The engine façade: one object per agent, unifying the algorithm
//! state machine with the shared base protocol.

use std::time::{Duration, Instant};

use distlock_core::{
    AgentId, Envelope, LockError, LockProtocol, LockState, MalformedMessage, Performative,
    ProtocolTag,
};
use tracing::{trace, warn};

use crate::base::BaseState;
use crate::ricart_agrawala::RicartAgrawala;
use crate::suzuki_kasami::SuzukiKasami;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
enum Algorithm {
    RicartAgrawala(RicartAgrawala),
    SuzukiKasami(SuzukiKasami),
}

/// A distributed mutual exclusion engine for one agent.
///
/// The host serializes all calls on one instance and moves the envelopes
/// produced in [`LockEngine::pop_next_outgoing`] to their receivers; see
/// the crate docs for the drive loop.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct LockEngine {
    base: BaseState,
    algorithm: Algorithm,
}

impl LockEngine {
    /// Create an engine speaking `protocol`, registering every resource
    /// in `owned_resources` as physically owned by `self_id`. For the
    /// Suzuki-Kasami variants the token of each owned resource is born
    /// here.
    #[must_use]
    pub fn new(protocol: LockProtocol, self_id: AgentId, owned_resources: Vec<String>) -> Self {
        let algorithm = match protocol {
            LockProtocol::RicartAgrawala | LockProtocol::RicartAgrawalaExtended => {
                Algorithm::RicartAgrawala(RicartAgrawala::new(protocol.is_extended()))
            }
            LockProtocol::SuzukiKasami | LockProtocol::SuzukiKasamiExtended => {
                Algorithm::SuzukiKasami(SuzukiKasami::new(
                    protocol.is_extended(),
                    &self_id,
                    &owned_resources,
                ))
            }
        };
        Self {
            base: BaseState::new(protocol, self_id, owned_resources),
            algorithm,
        }
    }

    pub fn self_agent(&self) -> &AgentId {
        self.base.self_id()
    }

    pub fn protocol(&self) -> LockProtocol {
        self.base.protocol()
    }

    /// Resolve the physical owner of `resource` by broadcast query to
    /// `peers`. A no-op once the owner is known.
    pub fn discover(&mut self, resource: &str, peers: &[AgentId]) {
        self.base.discover(resource, peers);
    }

    /// The physical owner of `resource`, if known.
    pub fn owner_of(&self, resource: &str) -> Option<&AgentId> {
        self.base.owner_of(resource)
    }

    /// The logical holder of `resource` as observed by its physical
    /// owner; `None` on non-owners and for unheld resources.
    pub fn logical_holder(&self, resource: &str) -> Option<&AgentId> {
        self.base.logical_holder(resource)
    }

    /// Try to acquire the lock, asking `peers` for permission (or the
    /// token). Watch [`LockEngine::lock_state`] for the outcome.
    ///
    /// # Errors
    /// [`LockError::UnknownOwner`] before discovery completed for the
    /// resource, [`LockError::Unreachable`] once failure analysis marked
    /// it unreachable.
    pub fn lock(&mut self, resource: &str, peers: &[AgentId]) -> Result<(), LockError> {
        match &mut self.algorithm {
            Algorithm::RicartAgrawala(ra) => ra.lock(&mut self.base, resource, peers),
            Algorithm::SuzukiKasami(sk) => sk.lock(&mut self.base, resource, peers),
        }
    }

    /// Release a held lock; a no-op unless the state is `Locked`.
    pub fn unlock(&mut self, resource: &str) {
        match &mut self.algorithm {
            Algorithm::RicartAgrawala(ra) => ra.unlock(&mut self.base, resource),
            Algorithm::SuzukiKasami(sk) => sk.unlock(&mut self.base, resource),
        }
    }

    /// The lock state of `resource`; `NotInterested` for resources never
    /// touched.
    #[must_use]
    pub fn lock_state(&self, resource: &str) -> LockState {
        match &self.algorithm {
            Algorithm::RicartAgrawala(ra) => ra.lock_state(resource),
            Algorithm::SuzukiKasami(sk) => sk.lock_state(resource),
        }
    }

    /// Feed one delivered inbound envelope. Returns whether the message
    /// was consumed; envelopes for foreign protocols, other receivers,
    /// or with malformed content are dropped.
    pub fn on_incoming(&mut self, message: &Envelope) -> bool {
        self.base.record_incoming(message);

        let Some(tag) = ProtocolTag::from_tag(&message.protocol) else {
            trace!(protocol = %message.protocol, "dropping message with foreign protocol tag");
            return false;
        };
        let active = self.base.algorithm_tag();
        if tag != active && tag != ProtocolTag::Discover && tag != ProtocolTag::Probe {
            trace!(%tag, "dropping message for inactive protocol");
            return false;
        }
        if !message.is_addressed_to(self.base.self_id()) {
            return false;
        }

        let handled: Result<bool, MalformedMessage> = match (tag, message.performative) {
            (ProtocolTag::Discover, Performative::QueryIf) => {
                self.base.handle_query_if(message);
                Ok(true)
            }
            (ProtocolTag::Discover, Performative::Inform) => {
                self.base.handle_inform(message);
                Ok(true)
            }
            (ProtocolTag::Probe, Performative::Request) => {
                self.base.handle_probe_request(message);
                Ok(true)
            }
            (ProtocolTag::Probe, Performative::Confirm) => {
                self.base.handle_probe_confirm(message);
                Ok(true)
            }
            (_, Performative::Failure) => match &mut self.algorithm {
                Algorithm::RicartAgrawala(ra) => {
                    ra.handle_failure(&mut self.base, message).map(|()| true)
                }
                Algorithm::SuzukiKasami(sk) => {
                    sk.handle_failure(&mut self.base, message).map(|()| true)
                }
            },
            (tag, Performative::Confirm) if tag == active => {
                self.base.handle_confirm(message);
                Ok(true)
            }
            (tag, Performative::Disconfirm) if tag == active => {
                self.base.handle_disconfirm(message);
                Ok(true)
            }
            (tag, Performative::Request) if tag == active => match &mut self.algorithm {
                Algorithm::RicartAgrawala(ra) => {
                    ra.handle_request(&mut self.base, message).map(|()| true)
                }
                Algorithm::SuzukiKasami(sk) => {
                    sk.handle_request(&mut self.base, message).map(|()| true)
                }
            },
            (tag, Performative::Agree) if tag == active => match &mut self.algorithm {
                Algorithm::RicartAgrawala(ra) => {
                    ra.handle_agree(&mut self.base, message).map(|()| true)
                }
                Algorithm::SuzukiKasami(_) => Ok(false),
            },
            (tag, Performative::Propagate) if tag == active => match &mut self.algorithm {
                Algorithm::SuzukiKasami(sk) => {
                    sk.handle_token(&mut self.base, message).map(|()| true)
                }
                Algorithm::RicartAgrawala(_) => Ok(false),
            },
            _ => Ok(false),
        };

        match handled {
            Ok(consumed) => consumed,
            Err(error) => {
                warn!(%error, performative = %message.performative, "dropping malformed message");
                false
            }
        }
    }

    /// The next outgoing envelope, in production order.
    pub fn pop_next_outgoing(&mut self) -> Option<Envelope> {
        self.base.pop_next_outgoing()
    }

    #[must_use]
    pub fn has_outgoing(&self) -> bool {
        self.base.has_outgoing()
    }

    /// Periodic tick advancing the probe loop; call roughly once a
    /// second.
    pub fn trigger(&mut self) {
        let failed = self.base.trigger_at(Instant::now());
        for agent in failed {
            self.agent_failed(&agent);
        }
    }

    /// Run the algorithm's failure analysis for `agent`, as if a probe
    /// had just timed out.
    pub fn agent_failed(&mut self, agent: &AgentId) {
        match &mut self.algorithm {
            Algorithm::RicartAgrawala(ra) => ra.agent_failed(&mut self.base, agent),
            Algorithm::SuzukiKasami(sk) => sk.agent_failed(&mut self.base, agent),
        }
    }

    /// Probe timeout applied to all runners (default 5 s).
    pub fn set_probe_timeout(&mut self, timeout: Duration) {
        self.base.set_probe_timeout(timeout);
    }

    /// Whether the extended Suzuki-Kasami owner currently attributes the
    /// token for `resource` to `agent`. Always `false` on the other
    /// variants.
    #[must_use]
    pub fn is_token_holder(&self, resource: &str, agent: &AgentId) -> bool {
        match &self.algorithm {
            Algorithm::SuzukiKasami(sk) if self.base.protocol().is_extended() => {
                sk.is_token_holder(resource, agent)
            }
            _ => false,
        }
    }

    /// The envelopes exchanged under `conversation_id`, in order.
    pub fn conversation(&self, conversation_id: &str) -> &[Envelope] {
        self.base.conversation(conversation_id)
    }
}

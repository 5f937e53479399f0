//! State and behavior shared by both algorithms: the outgoing queue,
//! conversation-id minting and logging, resource ownership (static plus
//! discovered), owner-side tracking of logical lock holders, and the
//! probe sub-protocol wiring.

use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};

use distlock_core::{AgentId, Envelope, LockProtocol, Performative, ProtocolTag};
use tracing::{debug, trace};

use crate::conversation::ConversationLog;
use crate::probe::ProbeTable;

/// Probe timeout applied to all runners unless reconfigured.
pub(crate) const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub(crate) struct BaseState {
    self_id: AgentId,
    protocol: LockProtocol,
    outbox: VecDeque<Envelope>,
    conversation_counter: u64,
    /// Resource name to physical owner; `None` marks a discovery still in
    /// flight.
    owned_resources: BTreeMap<String, Option<AgentId>>,
    /// Logical holder per resource, maintained only for resources this
    /// agent physically owns.
    lock_holders: BTreeMap<String, AgentId>,
    probes: ProbeTable,
    conversations: ConversationLog,
    probe_timeout: Duration,
}

impl BaseState {
    pub(crate) fn new(
        protocol: LockProtocol,
        self_id: AgentId,
        owned_resources: Vec<String>,
    ) -> Self {
        let owned_resources = owned_resources
            .into_iter()
            .map(|resource| (resource, Some(self_id.clone())))
            .collect();
        Self {
            self_id,
            protocol,
            outbox: VecDeque::new(),
            conversation_counter: 0,
            owned_resources,
            lock_holders: BTreeMap::new(),
            probes: ProbeTable::default(),
            conversations: ConversationLog::default(),
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }

    pub(crate) fn self_id(&self) -> &AgentId {
        &self.self_id
    }

    pub(crate) fn protocol(&self) -> LockProtocol {
        self.protocol
    }

    pub(crate) fn algorithm_tag(&self) -> ProtocolTag {
        self.protocol.tag()
    }

    pub(crate) fn set_probe_timeout(&mut self, timeout: Duration) {
        self.probe_timeout = timeout;
    }

    // --- conversations and the outgoing queue ---

    pub(crate) fn next_conversation_id(&mut self) -> String {
        let id = format!("{}_{}", self.self_id, self.conversation_counter);
        self.conversation_counter += 1;
        id
    }

    /// A fresh envelope from this agent under a new conversation.
    pub(crate) fn prepare(&mut self, performative: Performative, tag: ProtocolTag) -> Envelope {
        let conversation_id = self.next_conversation_id();
        Envelope::new(performative, self.self_id.clone(), tag.as_str(), conversation_id)
    }

    /// A reply to `to`, keeping its conversation id and addressing its
    /// sender.
    pub(crate) fn reply(
        &self,
        to: &Envelope,
        performative: Performative,
        tag: ProtocolTag,
    ) -> Envelope {
        Envelope::new(
            performative,
            self.self_id.clone(),
            tag.as_str(),
            to.conversation_id.clone(),
        )
        .with_receiver(to.sender.clone())
    }

    pub(crate) fn send(&mut self, envelope: Envelope) {
        trace!(
            performative = %envelope.performative,
            protocol = %envelope.protocol,
            conversation = %envelope.conversation_id,
            "enqueue outgoing message"
        );
        self.conversations.record(&envelope);
        self.outbox.push_back(envelope);
    }

    pub(crate) fn record_incoming(&mut self, envelope: &Envelope) {
        self.conversations.record(envelope);
    }

    pub(crate) fn pop_next_outgoing(&mut self) -> Option<Envelope> {
        self.outbox.pop_front()
    }

    pub(crate) fn has_outgoing(&self) -> bool {
        !self.outbox.is_empty()
    }

    pub(crate) fn conversation(&self, conversation_id: &str) -> &[Envelope] {
        self.conversations.envelopes(conversation_id)
    }

    // --- resource ownership ---

    pub(crate) fn owner_of(&self, resource: &str) -> Option<&AgentId> {
        self.owned_resources.get(resource).and_then(Option::as_ref)
    }

    pub(crate) fn is_owner_known(&self, resource: &str) -> bool {
        self.owner_of(resource).is_some()
    }

    pub(crate) fn is_self_owner(&self, resource: &str) -> bool {
        self.owner_of(resource) == Some(&self.self_id)
    }

    pub(crate) fn logical_holder(&self, resource: &str) -> Option<&AgentId> {
        self.lock_holders.get(resource)
    }

    /// Resolve the physical owner of `resource` by broadcast query. A
    /// no-op once the owner is known; a pending discovery is re-queried.
    pub(crate) fn discover(&mut self, resource: &str, peers: &[AgentId]) {
        if self.is_owner_known(resource) {
            return;
        }
        self.owned_resources.insert(resource.to_owned(), None);
        let query = self
            .prepare(Performative::QueryIf, ProtocolTag::Discover)
            .with_receivers(peers.iter().cloned())
            .with_content(resource);
        self.send(query);
    }

    /// Discovery query: if this agent owns the queried resource, inform
    /// the sender and every other queried agent in one broadcast reply.
    pub(crate) fn handle_query_if(&mut self, message: &Envelope) {
        let resource = message.content.clone();
        if !self.is_self_owner(&resource) {
            trace!(resource, "discovery query for a resource we do not own");
            return;
        }
        let reply = Envelope::new(
            Performative::Inform,
            self.self_id.clone(),
            ProtocolTag::Discover.as_str(),
            message.conversation_id.clone(),
        )
        .with_receivers(
            message
                .receivers
                .iter()
                .filter(|agent| **agent != self.self_id)
                .cloned(),
        )
        .with_receiver(message.sender.clone())
        .with_content(resource);
        self.send(reply);
    }

    /// Discovery answer: fill the open owner slot, ignore the rest.
    pub(crate) fn handle_inform(&mut self, message: &Envelope) {
        if let Some(slot) = self.owned_resources.get_mut(message.content.as_str()) {
            if slot.is_none() {
                debug!(resource = %message.content, owner = %message.sender, "resource owner discovered");
                *slot = Some(message.sender.clone());
            }
        }
    }

    // --- owner-side holder tracking ---

    /// `Confirm` on the algorithm tag: a peer acquired the lock on one of
    /// our resources.
    pub(crate) fn handle_confirm(&mut self, message: &Envelope) {
        let resource = message.content.clone();
        if !self.is_self_owner(&resource) {
            return;
        }
        debug!(resource, holder = %message.sender, "resource locked by peer");
        self.lock_holders.insert(resource.clone(), message.sender.clone());
        self.probes.start(&message.sender, &resource);
    }

    /// `Disconfirm` on the algorithm tag: the recorded holder released.
    pub(crate) fn handle_disconfirm(&mut self, message: &Envelope) {
        let resource = message.content.clone();
        if self.lock_holders.get(&resource) == Some(&message.sender) {
            debug!(resource, holder = %message.sender, "resource released by peer");
            self.lock_holders.remove(&resource);
            self.probes.stop(&message.sender, &resource);
        }
    }

    /// Called by the algorithm when it acquired the lock on a resource
    /// physically owned by another agent.
    pub(crate) fn lock_obtained(&mut self, resource: &str, conversation_id: &str) {
        let Some(owner) = self.owner_of(resource) else {
            return;
        };
        if *owner == self.self_id {
            return;
        }
        let owner = owner.clone();
        let confirm = Envelope::new(
            Performative::Confirm,
            self.self_id.clone(),
            self.algorithm_tag().as_str(),
            conversation_id,
        )
        .with_receiver(owner)
        .with_content(resource);
        self.send(confirm);
    }

    /// Counterpart of [`BaseState::lock_obtained`] on release.
    pub(crate) fn lock_released(&mut self, resource: &str, conversation_id: &str) {
        let Some(owner) = self.owner_of(resource) else {
            return;
        };
        if *owner == self.self_id {
            return;
        }
        let owner = owner.clone();
        let disconfirm = Envelope::new(
            Performative::Disconfirm,
            self.self_id.clone(),
            self.algorithm_tag().as_str(),
            conversation_id,
        )
        .with_receiver(owner)
        .with_content(resource);
        self.send(disconfirm);
    }

    // --- probing ---

    pub(crate) fn start_probing(&mut self, peer: &AgentId, resource: &str) {
        self.probes.start(peer, resource);
    }

    pub(crate) fn stop_probing(&mut self, peer: &AgentId, resource: &str) {
        self.probes.stop(peer, resource);
    }

    /// Probe ping: answer with an empty confirm under the sender's
    /// conversation.
    pub(crate) fn handle_probe_request(&mut self, message: &Envelope) {
        let reply = self.reply(message, Performative::Confirm, ProtocolTag::Probe);
        self.send(reply);
    }

    pub(crate) fn handle_probe_confirm(&mut self, message: &Envelope) {
        if !self.probes.confirm(&message.sender) {
            trace!(peer = %message.sender, "stray probe confirm");
        }
    }

    /// Advance the probe loop to `now`. Returns the peers whose probes
    /// timed out; the façade feeds them into the algorithm's failure
    /// analysis.
    pub(crate) fn trigger_at(&mut self, now: Instant) -> Vec<AgentId> {
        let tick = self.probes.tick(now, self.probe_timeout);
        for peer in tick.send_to {
            let probe = self
                .prepare(Performative::Request, ProtocolTag::Probe)
                .with_receiver(peer)
                .with_content("PROBE");
            self.send(probe);
        }
        tick.failed
    }

    #[cfg(test)]
    pub(crate) fn is_probing(&self, peer: &AgentId) -> bool {
        self.probes.is_probing(peer)
    }
}

//! The Suzuki-Kasami token-based lock.
//!
//! Exactly one token exists per resource; whoever holds it may enter the
//! critical section. Requests carry per-agent sequence numbers
//! (`"<resource>\n<request_number>"`); the token travels in `Propagate`
//! envelopes as an archived `(resource, token)` pair.
//!
//! In the extended variant every release routes the token through the
//! resource's physical owner, which therefore always knows the current
//! holder, probes it, and can reclaim the token from a failed holder
//! with its last known copy.

use std::collections::BTreeMap;

use distlock_core::{
    decode_archive, encode_archive, AgentId, Envelope, LockError, LockState, MalformedMessage,
    Performative, Token,
};
use tracing::{debug, trace, warn};

use crate::base::BaseState;

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
struct SkResource {
    state: LockState,
    holding_token: bool,
    /// Valid while `holding_token`; kept afterwards as the owner's
    /// reclamation copy.
    token: Token,
    /// Peers queried for the running lock attempt, sorted.
    partners: Vec<AgentId>,
    /// Highest request number observed per agent (`RN` in the
    /// literature; our own entry is our request counter).
    request_numbers: BTreeMap<AgentId, u64>,
    /// Conversation id per requesting peer, plus our own lock attempt.
    conversations: BTreeMap<AgentId, String>,
}

/// What an incoming token request requires beyond recording its numbers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RequestAction {
    Outdated,
    Recorded,
    Queued,
    SendToken,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub(crate) struct SuzukiKasami {
    extended: bool,
    resources: BTreeMap<String, SkResource>,
    /// Owner-side view of who holds the token, extended variant only.
    token_holders: BTreeMap<String, AgentId>,
}

impl SuzukiKasami {
    pub(crate) fn new(extended: bool, self_id: &AgentId, owned_resources: &[String]) -> Self {
        let mut resources = BTreeMap::new();
        let mut token_holders = BTreeMap::new();
        for resource in owned_resources {
            // The token is born in the owning agent.
            let entry = SkResource {
                holding_token: true,
                ..SkResource::default()
            };
            resources.insert(resource.clone(), entry);
            if extended {
                token_holders.insert(resource.clone(), self_id.clone());
            }
        }
        Self {
            extended,
            resources,
            token_holders,
        }
    }

    pub(crate) fn lock_state(&self, resource: &str) -> LockState {
        self.resources
            .get(resource)
            .map_or(LockState::NotInterested, |entry| entry.state)
    }

    pub(crate) fn is_token_holder(&self, resource: &str, agent: &AgentId) -> bool {
        self.token_holders.get(resource) == Some(agent)
    }

    pub(crate) fn lock(
        &mut self,
        base: &mut BaseState,
        resource: &str,
        peers: &[AgentId],
    ) -> Result<(), LockError> {
        if !base.is_owner_known(resource) {
            return Err(LockError::UnknownOwner {
                resource: resource.to_owned(),
            });
        }
        match self.lock_state(resource) {
            LockState::Unreachable => {
                return Err(LockError::Unreachable {
                    resource: resource.to_owned(),
                });
            }
            LockState::Interested | LockState::Locked => return Ok(()),
            LockState::NotInterested => {}
        }

        let self_id = base.self_id().clone();
        let entry = self.resources.entry(resource.to_owned()).or_default();

        if entry.holding_token {
            // The token is already here: straight into the critical
            // section, nothing on the wire.
            entry.state = LockState::Locked;
            debug!(agent = %self_id, resource, "locked with resident token");
            return Ok(());
        }

        let request_number = entry.request_numbers.get(&self_id).copied().unwrap_or(0) + 1;
        entry.request_numbers.insert(self_id.clone(), request_number);
        entry.state = LockState::Interested;

        let mut partners = peers.to_vec();
        partners.sort();
        partners.dedup();
        entry.partners = partners;

        let request = base
            .prepare(Performative::Request, base.algorithm_tag())
            .with_receivers(peers.iter().cloned())
            .with_content(format!("{resource}\n{request_number}"));
        entry
            .conversations
            .insert(self_id.clone(), request.conversation_id.clone());
        base.send(request);
        debug!(agent = %self_id, resource, request_number, "mark interested");

        if self.extended {
            // Watch the owner until the token arrives.
            if let Some(owner) = base.owner_of(resource).cloned() {
                base.start_probing(&owner, resource);
            }
        }
        Ok(())
    }

    pub(crate) fn unlock(&mut self, base: &mut BaseState, resource: &str) {
        let self_id = base.self_id().clone();
        let conversation_id = {
            let Some(entry) = self.resources.get_mut(resource) else {
                return;
            };
            if entry.state != LockState::Locked {
                return;
            }
            entry.state = LockState::NotInterested;
            let request_number = entry.request_numbers.get(&self_id).copied().unwrap_or(0);
            entry
                .token
                .last_request_number
                .insert(self_id.clone(), request_number);
            entry.conversations.get(&self_id).cloned()
        };
        debug!(agent = %self_id, resource, "mark not interested");

        self.forward_token(base, resource);

        let conversation_id =
            conversation_id.unwrap_or_else(|| base.next_conversation_id());
        base.lock_released(resource, &conversation_id);
    }

    /// A peer requests the token.
    pub(crate) fn handle_request(
        &mut self,
        base: &mut BaseState,
        message: &Envelope,
    ) -> Result<(), MalformedMessage> {
        let (resource, sequence) = parse_request_content(message)?;
        let sender = message.sender.clone();

        let action = {
            let entry = self.resources.entry(resource.clone()).or_default();
            if entry
                .request_numbers
                .get(&sender)
                .is_some_and(|&known| known >= sequence)
            {
                RequestAction::Outdated
            } else {
                entry.request_numbers.insert(sender.clone(), sequence);
                entry
                    .conversations
                    .insert(sender.clone(), message.conversation_id.clone());

                if entry.holding_token && entry.state == LockState::Locked {
                    if !entry.token.queue.contains(&sender) {
                        entry.token.queue.push_back(sender.clone());
                    }
                    entry
                        .token
                        .last_request_number
                        .insert(sender.clone(), sequence);
                    RequestAction::Queued
                } else if entry.holding_token
                    && sequence == entry.token.last_granted(&sender) + 1
                {
                    RequestAction::SendToken
                } else {
                    RequestAction::Recorded
                }
            }
        };

        match action {
            RequestAction::Outdated => {
                trace!(resource, peer = %sender, sequence, "outdated token request");
            }
            RequestAction::Queued => {
                debug!(resource, peer = %sender, "queue token request while locked");
            }
            RequestAction::SendToken => self.send_token(base, &resource, &sender),
            RequestAction::Recorded => {}
        }
        Ok(())
    }

    /// The token arrives.
    pub(crate) fn handle_token(
        &mut self,
        base: &mut BaseState,
        message: &Envelope,
    ) -> Result<(), MalformedMessage> {
        let (resource, token): (String, Token) =
            decode_archive(&message.content).map_err(MalformedMessage::from)?;

        if self.extended {
            if base.is_self_owner(&resource) {
                self.token_holders
                    .insert(resource.clone(), base.self_id().clone());
            }
            // The previous holder handed it over; no need to watch it.
            base.stop_probing(&message.sender, &resource);
        }

        let locked = {
            let entry = self.resources.entry(resource.clone()).or_default();
            entry.token = token;
            entry.holding_token = true;
            if entry.state == LockState::Interested {
                entry.state = LockState::Locked;
                true
            } else {
                false
            }
        };

        if locked {
            debug!(agent = %base.self_id(), resource, "locked with received token");
            base.lock_obtained(&resource, &message.conversation_id);
        } else {
            // Not waiting for it ourselves: pass it on.
            self.forward_token(base, &resource);
        }
        Ok(())
    }

    /// Hand the token to the next waiting agent, if any. The extended
    /// variant routes through the resource owner instead.
    fn forward_token(&mut self, base: &mut BaseState, resource: &str) {
        if self.extended && !base.is_self_owner(resource) {
            if let Some(owner) = base.owner_of(resource).cloned() {
                self.send_token(base, resource, &owner);
            }
            return;
        }

        let self_id = base.self_id().clone();
        let next = {
            let Some(entry) = self.resources.get_mut(resource) else {
                return;
            };
            if !entry.holding_token {
                return;
            }
            let waiting: Vec<AgentId> = entry
                .request_numbers
                .iter()
                .filter(|(agent, &number)| {
                    **agent != self_id
                        && number == entry.token.last_granted(agent) + 1
                        && !entry.token.queue.contains(agent)
                })
                .map(|(agent, _)| agent.clone())
                .collect();
            for agent in waiting {
                entry.token.queue.push_back(agent);
            }
            entry.token.queue.pop_front()
        };

        if let Some(next) = next {
            self.send_token(base, resource, &next);
        }
    }

    fn send_token(&mut self, base: &mut BaseState, resource: &str, receiver: &AgentId) {
        let self_id = base.self_id().clone();
        let conversation_id;
        let archive;
        {
            let Some(entry) = self.resources.get_mut(resource) else {
                return;
            };
            archive = match encode_archive(&(resource.to_owned(), entry.token.clone())) {
                Ok(archive) => archive,
                Err(error) => {
                    warn!(resource, %error, "token archive failed, keeping token");
                    return;
                }
            };
            entry.holding_token = false;
            conversation_id = entry
                .conversations
                .get(receiver)
                .or_else(|| entry.conversations.get(&self_id))
                .cloned();
        }
        let conversation_id =
            conversation_id.unwrap_or_else(|| base.next_conversation_id());

        let transfer = Envelope::new(
            Performative::Propagate,
            self_id.clone(),
            base.algorithm_tag().as_str(),
            conversation_id,
        )
        .with_receiver(receiver.clone())
        .with_content(archive);
        base.send(transfer);
        debug!(agent = %self_id, resource, receiver = %receiver, "token sent");

        if self.extended && base.is_self_owner(resource) {
            self.token_holders
                .insert(resource.to_owned(), receiver.clone());
            base.start_probing(receiver, resource);
        }
    }

    /// A transport failure: correlate the conversation to a resource, or
    /// fall back to full failure analysis of each undeliverable
    /// receiver.
    pub(crate) fn handle_failure(
        &mut self,
        base: &mut BaseState,
        message: &Envelope,
    ) -> Result<(), MalformedMessage> {
        let inner: Envelope = decode_archive(&message.content).map_err(MalformedMessage::from)?;
        let resource = self
            .resources
            .iter()
            .find(|(_, entry)| {
                entry
                    .conversations
                    .values()
                    .any(|conversation| *conversation == message.conversation_id)
            })
            .map(|(resource, _)| resource.clone());

        match resource {
            Some(resource) => {
                for failed in &inner.receivers {
                    self.fail_agent(base, &resource, failed);
                }
            }
            None => {
                // Possibly a token transfer we never conversed about;
                // analyze everything we track.
                trace!(conversation = %message.conversation_id, "failure without matching conversation");
                for failed in &inner.receivers {
                    self.agent_failed(base, failed);
                }
            }
        }
        Ok(())
    }

    /// Probe-detected failure: analyze every tracked resource.
    pub(crate) fn agent_failed(&mut self, base: &mut BaseState, agent: &AgentId) {
        debug!(agent = %base.self_id(), failed = %agent, "peer failed");
        let resources: Vec<String> = self.resources.keys().cloned().collect();
        for resource in resources {
            self.fail_agent(base, &resource, agent);
        }
    }

    fn fail_agent(&mut self, base: &mut BaseState, resource: &str, failed: &AgentId) {
        if base.owner_of(resource) == Some(failed) {
            // The owner is gone and with it any path to the token.
            let entry = self.resources.entry(resource.to_owned()).or_default();
            entry.state = LockState::Unreachable;
            entry.holding_token = false;
            debug!(agent = %base.self_id(), resource, "mark unreachable");
            return;
        }

        if self.extended
            && base.is_self_owner(resource)
            && self.token_holders.get(resource) == Some(failed)
        {
            // The holder died; revive the token from our last copy.
            debug!(agent = %base.self_id(), resource, holder = %failed, "reclaim token from failed holder");
            base.stop_probing(failed, resource);
            self.token_holders
                .insert(resource.to_owned(), base.self_id().clone());
            let locked = {
                let entry = self.resources.entry(resource.to_owned()).or_default();
                entry.holding_token = true;
                if entry.state == LockState::Interested {
                    entry.state = LockState::Locked;
                    true
                } else {
                    false
                }
            };
            if !locked {
                self.forward_token(base, resource);
            }
            return;
        }

        let Some(entry) = self.resources.get_mut(resource) else {
            return;
        };
        entry.partners.retain(|agent| agent != failed);
        entry.request_numbers.remove(failed);
        entry.token.last_request_number.remove(failed);
        entry.token.queue.retain(|agent| agent != failed);
    }
}

/// Split `"<resource>\n<request_number>"`.
fn parse_request_content(message: &Envelope) -> Result<(String, u64), MalformedMessage> {
    let parts: Vec<&str> = message.content.split('\n').collect();
    let [resource, sequence] = parts.as_slice() else {
        return Err(MalformedMessage::new(format!(
            "expected \"<resource>\\n<request_number>\", got {:?}",
            message.content
        )));
    };
    let sequence = sequence
        .parse::<u64>()
        .map_err(|e| MalformedMessage::new(format!("invalid request number {sequence:?}: {e}")))?;
    Ok(((*resource).to_owned(), sequence))
}

#[cfg(test)]
mod tests {
    use distlock_core::LockProtocol;

    use super::*;

    fn owner_setup(extended: bool) -> (SuzukiKasami, BaseState) {
        let protocol = if extended {
            LockProtocol::SuzukiKasamiExtended
        } else {
            LockProtocol::SuzukiKasami
        };
        let self_id = AgentId::from("agent1");
        let owned = vec!["resource".to_owned()];
        let sk = SuzukiKasami::new(extended, &self_id, &owned);
        let base = BaseState::new(protocol, self_id, owned);
        (sk, base)
    }

    fn request_from(sender: &str, sequence: u64, conversation_id: &str) -> Envelope {
        Envelope::new(
            Performative::Request,
            AgentId::from(sender),
            "suzuki_kasami",
            conversation_id,
        )
        .with_receiver(AgentId::from("agent1"))
        .with_content(format!("resource\n{sequence}"))
    }

    #[test]
    fn owner_locks_with_resident_token() {
        let (mut sk, mut base) = owner_setup(false);
        sk.lock(&mut base, "resource", &[AgentId::from("agent2")]).unwrap();
        assert_eq!(sk.lock_state("resource"), LockState::Locked);
        assert!(!base.has_outgoing());
    }

    #[test]
    fn request_while_free_sends_token() {
        let (mut sk, mut base) = owner_setup(false);
        sk.handle_request(&mut base, &request_from("agent2", 1, "agent2_0"))
            .unwrap();

        let transfer = base.pop_next_outgoing().unwrap();
        assert_eq!(transfer.performative, Performative::Propagate);
        assert_eq!(transfer.conversation_id, "agent2_0");
        assert!(transfer.is_addressed_to(&AgentId::from("agent2")));

        let (resource, token): (String, Token) = decode_archive(&transfer.content).unwrap();
        assert_eq!(resource, "resource");
        assert!(token.queue.is_empty());
        assert_eq!(sk.lock_state("resource"), LockState::NotInterested);
    }

    #[test]
    fn request_while_locked_is_queued_until_unlock() {
        let (mut sk, mut base) = owner_setup(false);
        sk.lock(&mut base, "resource", &[AgentId::from("agent2")]).unwrap();

        sk.handle_request(&mut base, &request_from("agent2", 1, "agent2_0"))
            .unwrap();
        assert!(!base.has_outgoing());

        sk.unlock(&mut base, "resource");
        assert_eq!(sk.lock_state("resource"), LockState::NotInterested);
        let transfer = base.pop_next_outgoing().unwrap();
        assert_eq!(transfer.performative, Performative::Propagate);
        assert!(transfer.is_addressed_to(&AgentId::from("agent2")));
        assert!(!base.has_outgoing());
    }

    #[test]
    fn outdated_request_is_dropped() {
        let (mut sk, mut base) = owner_setup(false);
        sk.lock(&mut base, "resource", &[]).unwrap();
        sk.handle_request(&mut base, &request_from("agent2", 2, "agent2_0"))
            .unwrap();
        sk.handle_request(&mut base, &request_from("agent2", 1, "agent2_1"))
            .unwrap();
        sk.unlock(&mut base, "resource");

        // Only one transfer, for the up-to-date request.
        let transfer = base.pop_next_outgoing().unwrap();
        assert_eq!(transfer.conversation_id, "agent2_0");
        assert!(!base.has_outgoing());
    }

    #[test]
    fn received_token_locks_when_interested() {
        let self_id = AgentId::from("agent2");
        let mut sk = SuzukiKasami::new(false, &self_id, &[]);
        let mut base = BaseState::new(LockProtocol::SuzukiKasami, self_id, Vec::new());
        base.discover("resource", &[AgentId::from("agent1")]);
        base.pop_next_outgoing();
        let inform = Envelope::new(
            Performative::Inform,
            AgentId::from("agent1"),
            "dlm_discover",
            "agent2_0",
        )
        .with_receiver(AgentId::from("agent2"))
        .with_content("resource");
        base.handle_inform(&inform);

        sk.lock(&mut base, "resource", &[AgentId::from("agent1")]).unwrap();
        let request = base.pop_next_outgoing().unwrap();
        assert_eq!(request.content, "resource\n1");
        assert_eq!(sk.lock_state("resource"), LockState::Interested);

        let token = Token::default();
        let transfer = Envelope::new(
            Performative::Propagate,
            AgentId::from("agent1"),
            "suzuki_kasami",
            request.conversation_id.clone(),
        )
        .with_receiver(AgentId::from("agent2"))
        .with_content(encode_archive(&("resource".to_owned(), token)).unwrap());
        sk.handle_token(&mut base, &transfer).unwrap();
        assert_eq!(sk.lock_state("resource"), LockState::Locked);

        // The acquisition is confirmed towards the owner.
        let confirm = base.pop_next_outgoing().unwrap();
        assert_eq!(confirm.performative, Performative::Confirm);
        assert!(confirm.is_addressed_to(&AgentId::from("agent1")));

        // Re-locking after release reuses the resident token silently.
        sk.unlock(&mut base, "resource");
        while base.pop_next_outgoing().is_some() {}
        sk.lock(&mut base, "resource", &[AgentId::from("agent1")]).unwrap();
        assert_eq!(sk.lock_state("resource"), LockState::Locked);
        assert!(!base.has_outgoing());
    }

    #[test]
    fn unlock_forwards_to_all_pending_requesters_in_turn() {
        let (mut sk, mut base) = owner_setup(false);
        sk.lock(&mut base, "resource", &[]).unwrap();

        sk.handle_request(&mut base, &request_from("agent3", 1, "agent3_0"))
            .unwrap();
        sk.handle_request(&mut base, &request_from("agent2", 1, "agent2_0"))
            .unwrap();

        sk.unlock(&mut base, "resource");
        let transfer = base.pop_next_outgoing().unwrap();
        // agent3 asked first and sits at the head of the queue.
        assert!(transfer.is_addressed_to(&AgentId::from("agent3")));

        let (_, token): (String, Token) = decode_archive(&transfer.content).unwrap();
        // agent2's pending request rides along in the token queue.
        assert!(token.queue.contains(&AgentId::from("agent2")));
    }

    #[test]
    fn malformed_request_is_rejected_without_state_change() {
        let (mut sk, mut base) = owner_setup(false);
        let bad = Envelope::new(
            Performative::Request,
            AgentId::from("agent2"),
            "suzuki_kasami",
            "agent2_0",
        )
        .with_receiver(AgentId::from("agent1"))
        .with_content("resource\nnot-a-number");
        assert!(sk.handle_request(&mut base, &bad).is_err());
        assert!(!base.has_outgoing());
    }

    #[test]
    fn extended_owner_tracks_and_probes_the_holder() {
        let (mut sk, mut base) = owner_setup(true);
        assert!(sk.is_token_holder("resource", &AgentId::from("agent1")));

        sk.handle_request(&mut base, &request_from("agent2", 1, "agent2_0"))
            .unwrap();
        assert!(sk.is_token_holder("resource", &AgentId::from("agent2")));
        assert!(base.is_probing(&AgentId::from("agent2")));

        // The holder returns the token through the owner on release,
        // with its own request marked as served.
        let (_, mut token): (String, Token) = {
            let transfer = base.pop_next_outgoing().unwrap();
            decode_archive(&transfer.content).unwrap()
        };
        token
            .last_request_number
            .insert(AgentId::from("agent2"), 1);
        let back = Envelope::new(
            Performative::Propagate,
            AgentId::from("agent2"),
            "suzuki_kasami_extended",
            "agent2_1",
        )
        .with_receiver(AgentId::from("agent1"))
        .with_content(encode_archive(&("resource".to_owned(), token)).unwrap());
        sk.handle_token(&mut base, &back).unwrap();

        assert!(sk.is_token_holder("resource", &AgentId::from("agent1")));
        assert!(!base.is_probing(&AgentId::from("agent2")));
    }

    #[test]
    fn extended_owner_reclaims_token_from_failed_holder() {
        let (mut sk, mut base) = owner_setup(true);
        sk.handle_request(&mut base, &request_from("agent3", 1, "agent3_0"))
            .unwrap();
        base.pop_next_outgoing();
        assert!(sk.is_token_holder("resource", &AgentId::from("agent3")));

        // agent2 queues up behind the (now doomed) holder.
        sk.handle_request(&mut base, &request_from("agent2", 1, "agent2_0"))
            .unwrap();
        assert!(!base.has_outgoing());

        sk.agent_failed(&mut base, &AgentId::from("agent3"));
        // Reclaimed and immediately granted to the waiting agent2.
        assert!(sk.is_token_holder("resource", &AgentId::from("agent2")));
        let transfer = base.pop_next_outgoing().unwrap();
        assert_eq!(transfer.performative, Performative::Propagate);
        assert!(transfer.is_addressed_to(&AgentId::from("agent2")));
    }

    #[test]
    fn failed_owner_marks_resource_unreachable_and_drops_token() {
        let self_id = AgentId::from("agent2");
        let mut sk = SuzukiKasami::new(false, &self_id, &[]);
        let mut base = BaseState::new(LockProtocol::SuzukiKasami, self_id, Vec::new());
        base.discover("resource", &[AgentId::from("agent1")]);
        base.pop_next_outgoing();
        let inform = Envelope::new(
            Performative::Inform,
            AgentId::from("agent1"),
            "dlm_discover",
            "agent2_0",
        )
        .with_receiver(AgentId::from("agent2"))
        .with_content("resource");
        base.handle_inform(&inform);

        sk.lock(&mut base, "resource", &[AgentId::from("agent1")]).unwrap();
        base.pop_next_outgoing();

        sk.agent_failed(&mut base, &AgentId::from("agent1"));
        assert_eq!(sk.lock_state("resource"), LockState::Unreachable);
        let err = sk.lock(&mut base, "resource", &[AgentId::from("agent1")]);
        assert_eq!(
            err,
            Err(LockError::Unreachable {
                resource: "resource".to_owned()
            })
        );
    }

    #[test]
    fn failed_bystander_is_purged_from_token_bookkeeping() {
        let (mut sk, mut base) = owner_setup(false);
        sk.lock(&mut base, "resource", &[]).unwrap();
        sk.handle_request(&mut base, &request_from("agent2", 1, "agent2_0"))
            .unwrap();
        sk.handle_request(&mut base, &request_from("agent3", 1, "agent3_0"))
            .unwrap();

        sk.agent_failed(&mut base, &AgentId::from("agent2"));
        sk.unlock(&mut base, "resource");

        // The token goes to agent3; agent2 left no trace in it.
        let transfer = base.pop_next_outgoing().unwrap();
        assert!(transfer.is_addressed_to(&AgentId::from("agent3")));
        let (_, token): (String, Token) = decode_archive(&transfer.content).unwrap();
        assert!(!token.queue.contains(&AgentId::from("agent2")));
        assert!(!token
            .last_request_number
            .contains_key(&AgentId::from("agent2")));
    }
}

//! The Ricart-Agrawala permission-based lock.
//!
//! Every lock attempt is stamped with a Lamport clock; a peer's request
//! is granted immediately unless we are locked, or interested with the
//! older (or tie-breaking) timestamp, in which case the reply is
//! deferred until our own unlock. Ties on equal timestamps are broken by
//! the lexicographic order of the agent names.
//!
//! Request and agree content is `"<lamport_time>\n<resource>"`.

use std::collections::BTreeMap;

use distlock_core::{
    decode_archive, AgentId, Envelope, LockError, LockState, MalformedMessage, Performative,
};
use tracing::{debug, trace};

use crate::base::BaseState;

pub(crate) type LamportTime = u64;

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
struct RaResource {
    state: LockState,
    /// Lamport time at which this agent marked itself interested.
    interest_time: LamportTime,
    /// Peers queried for the running lock attempt, sorted.
    partners: Vec<AgentId>,
    /// Subset of partners that agreed so far.
    responded: Vec<AgentId>,
    /// Replies withheld until unlock; the clock is stamped at send time.
    deferred: Vec<Envelope>,
    conversation_id: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub(crate) struct RicartAgrawala {
    extended: bool,
    clock: LamportTime,
    resources: BTreeMap<String, RaResource>,
}

impl RicartAgrawala {
    pub(crate) fn new(extended: bool) -> Self {
        Self {
            extended,
            clock: 0,
            resources: BTreeMap::new(),
        }
    }

    pub(crate) fn lock_state(&self, resource: &str) -> LockState {
        self.resources
            .get(resource)
            .map_or(LockState::NotInterested, |entry| entry.state)
    }

    fn synchronize_clock(&mut self, other: LamportTime) {
        self.clock = 1 + self.clock.max(other);
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

        self.clock += 1;

        if peers.is_empty() {
            // Nobody to ask: the critical section is ours immediately.
            let conversation_id = base.next_conversation_id();
            let entry = self.resources.entry(resource.to_owned()).or_default();
            entry.state = LockState::Locked;
            entry.interest_time = self.clock;
            entry.partners.clear();
            entry.responded.clear();
            entry.conversation_id = conversation_id.clone();
            debug!(agent = %base.self_id(), resource, "locked without peers");
            base.lock_obtained(resource, &conversation_id);
            return Ok(());
        }

        let request = base
            .prepare(Performative::Request, base.algorithm_tag())
            .with_receivers(peers.iter().cloned())
            .with_content(format!("{}\n{resource}", self.clock));
        let conversation_id = request.conversation_id.clone();
        base.send(request);

        let mut partners = peers.to_vec();
        partners.sort();
        partners.dedup();

        let entry = self.resources.entry(resource.to_owned()).or_default();
        entry.partners = partners;
        entry.responded.clear();
        entry.state = LockState::Interested;
        entry.interest_time = self.clock;
        entry.conversation_id = conversation_id;
        debug!(agent = %base.self_id(), resource, time = self.clock, "mark interested");

        if self.extended {
            for partner in entry.partners.clone() {
                base.start_probing(&partner, resource);
            }
        }
        Ok(())
    }

    pub(crate) fn unlock(&mut self, base: &mut BaseState, resource: &str) {
        let Some(entry) = self.resources.get_mut(resource) else {
            return;
        };
        if entry.state != LockState::Locked {
            return;
        }
        entry.state = LockState::NotInterested;
        let conversation_id = entry.conversation_id.clone();
        debug!(agent = %base.self_id(), resource, "mark not interested");

        self.flush_deferred(base, resource);
        base.lock_released(resource, &conversation_id);
    }

    /// A peer requests the lock: grant or defer.
    pub(crate) fn handle_request(
        &mut self,
        base: &mut BaseState,
        message: &Envelope,
    ) -> Result<(), MalformedMessage> {
        let (other_time, resource) = parse_timed_content(message)?;
        self.synchronize_clock(other_time);

        let entry = self.resources.entry(resource.clone()).or_default();
        let grant = match entry.state {
            LockState::NotInterested => true,
            LockState::Interested => {
                other_time < entry.interest_time
                    || (other_time == entry.interest_time
                        && message.sender.name() < base.self_id().name())
            }
            LockState::Locked | LockState::Unreachable => false,
        };

        let reply = base.reply(message, Performative::Agree, base.algorithm_tag());
        if grant {
            self.clock += 1;
            let reply = reply.with_content(format!("{}\n{resource}", self.clock));
            base.send(reply);
        } else {
            trace!(agent = %base.self_id(), resource, peer = %message.sender, "defer reply");
            entry.deferred.push(reply.with_content(resource));
        }
        Ok(())
    }

    /// A peer granted our request.
    pub(crate) fn handle_agree(
        &mut self,
        base: &mut BaseState,
        message: &Envelope,
    ) -> Result<(), MalformedMessage> {
        let (other_time, resource) = parse_timed_content(message)?;
        self.synchronize_clock(other_time);

        let Some(entry) = self.resources.get_mut(&resource) else {
            return Ok(());
        };
        if entry.state != LockState::Interested {
            return Ok(());
        }

        if entry.partners.contains(&message.sender) && !entry.responded.contains(&message.sender) {
            entry.responded.push(message.sender.clone());
            if self.extended {
                base.stop_probing(&message.sender, &resource);
            }
        }

        if entry.responded.len() == entry.partners.len() {
            entry.responded.sort();
            if entry.responded == entry.partners {
                entry.state = LockState::Locked;
                debug!(agent = %base.self_id(), resource, "locked");
                base.lock_obtained(&resource, &message.conversation_id);
            }
        }
        Ok(())
    }

    /// A transport failure: correlate the conversation back to the lock
    /// attempt and analyze each undeliverable receiver.
    pub(crate) fn handle_failure(
        &mut self,
        base: &mut BaseState,
        message: &Envelope,
    ) -> Result<(), MalformedMessage> {
        let resource = self
            .resources
            .iter()
            .find(|(_, entry)| {
                !entry.conversation_id.is_empty()
                    && entry.conversation_id == message.conversation_id
            })
            .map(|(resource, _)| resource.clone());
        let Some(resource) = resource else {
            // Undeliverable replies carry no lock attempt of ours.
            trace!(conversation = %message.conversation_id, "failure without matching lock attempt");
            return Ok(());
        };
        if self.lock_state(&resource) != LockState::Interested {
            trace!(resource, "failure for a resource we are not waiting on");
            return Ok(());
        }

        let inner: Envelope = decode_archive(&message.content).map_err(MalformedMessage::from)?;
        for failed in &inner.receivers {
            self.fail_partner(base, &resource, failed);
        }
        Ok(())
    }

    /// Probe-detected failure: analyze every resource still waiting on
    /// the agent.
    pub(crate) fn agent_failed(&mut self, base: &mut BaseState, agent: &AgentId) {
        debug!(agent = %base.self_id(), failed = %agent, "peer failed");
        let affected: Vec<String> = self
            .resources
            .iter()
            .filter(|(_, entry)| {
                matches!(entry.state, LockState::Interested | LockState::Locked)
                    && entry.partners.contains(agent)
                    && !entry.responded.contains(agent)
            })
            .map(|(resource, _)| resource.clone())
            .collect();
        for resource in affected {
            self.fail_partner(base, &resource, agent);
        }
    }

    fn fail_partner(&mut self, base: &mut BaseState, resource: &str, failed: &AgentId) {
        if base.owner_of(resource) == Some(failed) {
            // The physical owner is gone; the resource cannot be
            // obtained any more.
            let entry = self.resources.entry(resource.to_owned()).or_default();
            entry.state = LockState::Unreachable;
            debug!(agent = %base.self_id(), resource, "mark unreachable");
            self.flush_deferred(base, resource);
            return;
        }

        let Some(entry) = self.resources.get_mut(resource) else {
            return;
        };
        entry.partners.retain(|agent| agent != failed);
        trace!(agent = %base.self_id(), resource, failed = %failed, "drop failed partner");

        if entry.state == LockState::Interested && entry.responded.len() == entry.partners.len() {
            entry.responded.sort();
            if entry.responded == entry.partners {
                entry.state = LockState::Locked;
                let conversation_id = entry.conversation_id.clone();
                debug!(agent = %base.self_id(), resource, "locked after partner failure");
                base.lock_obtained(resource, &conversation_id);
            }
        }
    }

    fn flush_deferred(&mut self, base: &mut BaseState, resource: &str) {
        let Some(entry) = self.resources.get_mut(resource) else {
            return;
        };
        for mut reply in entry.deferred.drain(..) {
            self.clock += 1;
            reply.content = format!("{}\n{}", self.clock, reply.content);
            base.send(reply);
        }
    }
}

/// Split `"<lamport_time>\n<resource>"`.
fn parse_timed_content(message: &Envelope) -> Result<(LamportTime, String), MalformedMessage> {
    let parts: Vec<&str> = message.content.split('\n').collect();
    let [time, resource] = parts.as_slice() else {
        return Err(MalformedMessage::new(format!(
            "expected \"<time>\\n<resource>\", got {:?}",
            message.content
        )));
    };
    let time = time
        .parse::<LamportTime>()
        .map_err(|e| MalformedMessage::new(format!("invalid lamport time {time:?}: {e}")))?;
    Ok((time, (*resource).to_owned()))
}

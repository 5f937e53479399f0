//! Liveness probing.
//!
//! One [`ProbeRunner`] exists per probed peer while at least one resource
//! is associated with it. The tick itself is a pure function of the
//! current instant and the configured timeout; the base layer sends the
//! probe requests and the façade feeds detected failures into the active
//! algorithm.

use std::collections::{BTreeMap, BTreeSet};
use std::hash::{Hash, Hasher};
use std::time::{Duration, Instant};

use distlock_core::AgentId;
use tracing::trace;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct ProbeRunner {
    last_sent_at: Option<Instant>,
    resources: BTreeSet<String>,
    success: bool,
}

// `Instant` is not hashable; the send timestamp carries no identity, so
// hashing the rest keeps `Hash` consistent with `Eq`-equal values.
impl Hash for ProbeRunner {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.resources.hash(state);
        self.success.hash(state);
    }
}

/// What one probe tick decided: who gets a fresh probe, who is declared
/// failed (their runner is already removed).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct ProbeTick {
    pub(crate) send_to: Vec<AgentId>,
    pub(crate) failed: Vec<AgentId>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub(crate) struct ProbeTable {
    runners: BTreeMap<AgentId, ProbeRunner>,
}

impl ProbeTable {
    /// Associate `resource` with `peer`, creating the runner on first
    /// use. The first following tick sends the initial probe.
    pub(crate) fn start(&mut self, peer: &AgentId, resource: &str) {
        self.runners
            .entry(peer.clone())
            .or_default()
            .resources
            .insert(resource.to_owned());
    }

    /// Drop the association; a runner left without resources is removed.
    pub(crate) fn stop(&mut self, peer: &AgentId, resource: &str) {
        if let Some(runner) = self.runners.get_mut(peer) {
            runner.resources.remove(resource);
            if runner.resources.is_empty() {
                self.runners.remove(peer);
            }
        }
    }

    /// Record a probe confirm. Returns `false` for a stray confirm with
    /// no matching runner.
    pub(crate) fn confirm(&mut self, peer: &AgentId) -> bool {
        match self.runners.get_mut(peer) {
            Some(runner) => {
                runner.success = true;
                true
            }
            None => false,
        }
    }

    #[cfg(test)]
    pub(crate) fn is_probing(&self, peer: &AgentId) -> bool {
        self.runners.contains_key(peer)
    }

    /// Advance every runner to `now`.
    pub(crate) fn tick(&mut self, now: Instant, timeout: Duration) -> ProbeTick {
        let mut tick = ProbeTick::default();
        let mut finished = Vec::new();

        for (peer, runner) in &mut self.runners {
            if runner.resources.is_empty() {
                finished.push(peer.clone());
                continue;
            }
            match runner.last_sent_at {
                None => {
                    runner.last_sent_at = Some(now);
                    runner.success = false;
                    tick.send_to.push(peer.clone());
                }
                Some(sent_at) if now.duration_since(sent_at) > timeout => {
                    if runner.success {
                        runner.last_sent_at = Some(now);
                        runner.success = false;
                        tick.send_to.push(peer.clone());
                    } else {
                        trace!(peer = %peer, "probe timed out without confirm");
                        tick.failed.push(peer.clone());
                        finished.push(peer.clone());
                    }
                }
                Some(_) => {}
            }
        }

        for peer in finished {
            self.runners.remove(&peer);
        }
        tick
    }
}

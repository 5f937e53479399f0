//! Conversation monitor.
//!
//! Every envelope the engine sends or receives is appended to the log of
//! its conversation id. The failure handlers use the log to correlate a
//! transport `Failure` back to the lock attempt it belongs to.

use std::collections::BTreeMap;

use distlock_core::Envelope;

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub(crate) struct ConversationLog {
    entries: BTreeMap<String, Vec<Envelope>>,
}

impl ConversationLog {
    pub(crate) fn record(&mut self, envelope: &Envelope) {
        self.entries
            .entry(envelope.conversation_id.clone())
            .or_default()
            .push(envelope.clone());
    }

    /// All envelopes exchanged under `conversation_id`, in order.
    pub(crate) fn envelopes(&self, conversation_id: &str) -> &[Envelope] {
        self.entries
            .get(conversation_id)
            .map_or(&[], Vec::as_slice)
    }
}

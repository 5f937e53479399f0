//! Test harness for driving several [`LockEngine`]s against each other
//! in memory: the host's forwarding loop, reduced to its essence, plus a
//! constructor for the delivery-failure envelopes a real transport would
//! produce.

#![warn(clippy::pedantic)]

use distlock_core::{encode_archive, AgentId, Envelope, Performative};
use distlock_engine::LockEngine;

/// Upper bound on [`settle`] rounds; more indicates a message loop.
const MAX_SETTLE_ROUNDS: usize = 100;

/// Initialize tracing for tests. Call at the start of each test.
/// Uses the `RUST_LOG` env var for filtering (defaults to "debug" for
/// the engine crate).
pub fn init_tracing() -> impl Sized {
    use tracing::Dispatch;
    use tracing_subscriber::{fmt, EnvFilter};

    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("distlock_engine=debug")),
        )
        .with_test_writer()
        .finish();

    let dispatch = Dispatch::new(subscriber);
    tracing::dispatcher::set_default(&dispatch)
}

/// Drain every engine once, in slice order, delivering each envelope to
/// all engines (each engine ignores messages not addressed to it).
pub fn forward_all_messages(engines: &mut [&mut LockEngine]) {
    for index in 0..engines.len() {
        while let Some(envelope) = engines[index].pop_next_outgoing() {
            for engine in engines.iter_mut() {
                engine.on_incoming(&envelope);
            }
        }
    }
}

/// Forward until no engine has outgoing messages left.
///
/// # Panics
/// Panics when the exchange does not quiesce within a generous bound.
pub fn settle(engines: &mut [&mut LockEngine]) {
    for _ in 0..MAX_SETTLE_ROUNDS {
        if engines.iter().all(|engine| !engine.has_outgoing()) {
            return;
        }
        forward_all_messages(engines);
    }
    panic!("message exchange did not settle in {MAX_SETTLE_ROUNDS} rounds");
}

/// Like [`settle`], but `unreachable` neither sends nor receives: its
/// outbox stays untouched and envelopes addressed to it vanish, exactly
/// as with a disconnected peer.
///
/// # Panics
/// Panics when the exchange does not quiesce within a generous bound.
pub fn settle_without(engines: &mut [&mut LockEngine], unreachable: &AgentId) {
    for _ in 0..MAX_SETTLE_ROUNDS {
        if engines
            .iter()
            .all(|engine| engine.self_agent() == unreachable || !engine.has_outgoing())
        {
            return;
        }
        for index in 0..engines.len() {
            if engines[index].self_agent() == unreachable {
                continue;
            }
            while let Some(envelope) = engines[index].pop_next_outgoing() {
                for engine in engines.iter_mut() {
                    if engine.self_agent() != unreachable {
                        engine.on_incoming(&envelope);
                    }
                }
            }
        }
    }
    panic!("message exchange did not settle in {MAX_SETTLE_ROUNDS} rounds");
}

/// The delivery-failure notification a transport produces when
/// `undelivered` could not be brought to `failed_receivers`: an inbound
/// `Failure` envelope for the original sender, embedding an envelope
/// that lists the unreachable receivers, under the original
/// conversation.
#[must_use]
pub fn failure_envelope(undelivered: &Envelope, failed_receivers: &[AgentId]) -> Envelope {
    let inner = Envelope::new(
        Performative::Inform,
        undelivered.sender.clone(),
        undelivered.protocol.clone(),
        undelivered.conversation_id.clone(),
    )
    .with_receivers(failed_receivers.iter().cloned())
    .with_content("description: message delivery failed");

    Envelope::new(
        Performative::Failure,
        AgentId::from("mts"),
        undelivered.protocol.clone(),
        undelivered.conversation_id.clone(),
    )
    .with_receiver(undelivered.sender.clone())
    .with_content(encode_archive(&inner).expect("failure envelope archive"))
}

//! Probe-driven failure detection with the extended algorithm variants.
//!
//! The probe timeout is configured down to milliseconds so the tests
//! sleep briefly instead of the five-second production default.

use std::thread::sleep;
use std::time::Duration;

use distlock_core::{AgentId, LockProtocol, LockState, Performative};
use distlock_engine::LockEngine;
use distlock_testing::{init_tracing, settle, settle_without};

const PROBE_TIMEOUT: Duration = Duration::from_millis(50);
const PAST_TIMEOUT: Duration = Duration::from_millis(80);

fn agent(name: &str) -> AgentId {
    AgentId::from(name)
}

fn engine(protocol: LockProtocol, name: &str, owned: &[&str]) -> LockEngine {
    let mut engine = LockEngine::new(
        protocol,
        agent(name),
        owned.iter().map(|resource| (*resource).to_owned()).collect(),
    );
    engine.set_probe_timeout(PROBE_TIMEOUT);
    engine
}

fn run_discovery(engines: &mut [&mut LockEngine], resource: &str) {
    let names: Vec<AgentId> = engines.iter().map(|e| e.self_agent().clone()).collect();
    for index in 0..engines.len() {
        let peers: Vec<AgentId> = names
            .iter()
            .filter(|name| **name != names[index])
            .cloned()
            .collect();
        engines[index].discover(resource, &peers);
    }
    settle(engines);
}

#[test]
fn ra_extended_detects_a_silent_partner() {
    let _guard = init_tracing();
    let mut dlm1 = engine(LockProtocol::RicartAgrawalaExtended, "agent1", &["r"]);
    let mut dlm2 = engine(LockProtocol::RicartAgrawalaExtended, "agent2", &[]);
    let mut dlm3 = engine(LockProtocol::RicartAgrawalaExtended, "agent3", &[]);

    run_discovery(&mut [&mut dlm1, &mut dlm2, &mut dlm3], "r");

    // agent3 dies; agent2 asks both peers for the lock.
    dlm2.lock("r", &[agent("agent1"), agent("agent3")]).unwrap();
    settle_without(&mut [&mut dlm1, &mut dlm2, &mut dlm3], &agent("agent3"));

    // The owner agreed (and is no longer probed); agent3 stays silent.
    assert_eq!(dlm2.lock_state("r"), LockState::Interested);

    dlm2.trigger();
    settle_without(&mut [&mut dlm1, &mut dlm2, &mut dlm3], &agent("agent3"));
    sleep(PAST_TIMEOUT);
    dlm2.trigger();

    // The silent partner is dropped; the remaining agreement suffices.
    assert_eq!(dlm2.lock_state("r"), LockState::Locked);
}

#[test]
fn ra_extended_marks_unreachable_when_the_owner_dies() {
    let _guard = init_tracing();
    let mut dlm1 = engine(LockProtocol::RicartAgrawalaExtended, "agent1", &["r"]);
    let mut dlm2 = engine(LockProtocol::RicartAgrawalaExtended, "agent2", &[]);

    run_discovery(&mut [&mut dlm1, &mut dlm2], "r");

    // The owner dies before it can answer.
    dlm2.lock("r", &[agent("agent1")]).unwrap();
    dlm2.trigger();
    sleep(PAST_TIMEOUT);
    dlm2.trigger();

    assert_eq!(dlm2.lock_state("r"), LockState::Unreachable);
    assert!(dlm2.lock("r", &[agent("agent1")]).is_err());
}

#[test]
fn probed_peer_answers_and_stays_alive() {
    let _guard = init_tracing();
    let mut dlm1 = engine(LockProtocol::RicartAgrawalaExtended, "agent1", &["r"]);
    let mut dlm2 = engine(LockProtocol::RicartAgrawalaExtended, "agent2", &[]);

    run_discovery(&mut [&mut dlm1, &mut dlm2], "r");

    // agent2 holds the lock; the owner probes it for liveness.
    dlm2.lock("r", &[agent("agent1")]).unwrap();
    settle(&mut [&mut dlm1, &mut dlm2]);
    assert_eq!(dlm2.lock_state("r"), LockState::Locked);
    assert_eq!(dlm1.logical_holder("r"), Some(&agent("agent2")));

    for _ in 0..3 {
        dlm1.trigger();
        settle(&mut [&mut dlm1, &mut dlm2]);
        sleep(PAST_TIMEOUT);
    }
    dlm1.trigger();
    settle(&mut [&mut dlm1, &mut dlm2]);

    // Probes kept being answered: the holder is still tracked.
    assert_eq!(dlm1.logical_holder("r"), Some(&agent("agent2")));
    assert_eq!(dlm2.lock_state("r"), LockState::Locked);
}

#[test]
fn sk_extended_owner_recovers_the_token_for_a_waiter() {
    let _guard = init_tracing();
    let mut dlm1 = engine(LockProtocol::SuzukiKasamiExtended, "agent1", &["r"]);
    let mut dlm2 = engine(LockProtocol::SuzukiKasamiExtended, "agent2", &[]);
    let mut dlm3 = engine(LockProtocol::SuzukiKasamiExtended, "agent3", &[]);

    run_discovery(&mut [&mut dlm1, &mut dlm2, &mut dlm3], "r");

    // agent3 acquires the token from the owner.
    dlm3.lock("r", &[agent("agent1"), agent("agent2")]).unwrap();
    settle(&mut [&mut dlm1, &mut dlm2, &mut dlm3]);
    assert_eq!(dlm3.lock_state("r"), LockState::Locked);
    assert!(dlm1.is_token_holder("r", &agent("agent3")));

    // agent2 queues up behind it.
    dlm2.lock("r", &[agent("agent1"), agent("agent3")]).unwrap();
    settle_without(&mut [&mut dlm1, &mut dlm2, &mut dlm3], &agent("agent3"));
    assert_eq!(dlm2.lock_state("r"), LockState::Interested);

    // agent3 disconnects; the owner's probe runs dry.
    dlm1.trigger();
    settle_without(&mut [&mut dlm1, &mut dlm2, &mut dlm3], &agent("agent3"));
    sleep(PAST_TIMEOUT);
    dlm1.trigger();

    // The owner reclaimed the token and granted it onwards.
    assert!(dlm1.has_outgoing());
    settle_without(&mut [&mut dlm1, &mut dlm2, &mut dlm3], &agent("agent3"));
    assert_eq!(dlm2.lock_state("r"), LockState::Locked);
    assert!(dlm1.is_token_holder("r", &agent("agent2")));
}

#[test]
fn sk_extended_routes_the_token_home_through_the_owner() {
    let _guard = init_tracing();
    let mut dlm1 = engine(LockProtocol::SuzukiKasamiExtended, "agent1", &["r"]);
    let mut dlm2 = engine(LockProtocol::SuzukiKasamiExtended, "agent2", &[]);

    run_discovery(&mut [&mut dlm1, &mut dlm2], "r");

    dlm2.lock("r", &[agent("agent1")]).unwrap();
    settle(&mut [&mut dlm1, &mut dlm2]);
    assert_eq!(dlm2.lock_state("r"), LockState::Locked);
    assert!(dlm1.is_token_holder("r", &agent("agent2")));

    // On release the token does not linger with agent2: it travels back
    // to the owner even though nobody requested it.
    dlm2.unlock("r");
    let transfer = dlm2.pop_next_outgoing().unwrap();
    assert_eq!(transfer.performative, Performative::Propagate);
    assert!(transfer.is_addressed_to(&agent("agent1")));
    dlm1.on_incoming(&transfer);
    settle(&mut [&mut dlm1, &mut dlm2]);

    assert!(dlm1.is_token_holder("r", &agent("agent1")));
    // A fresh lock by agent2 must go through the owner again.
    dlm2.lock("r", &[agent("agent1")]).unwrap();
    assert_eq!(dlm2.lock_state("r"), LockState::Interested);
    settle(&mut [&mut dlm1, &mut dlm2]);
    assert_eq!(dlm2.lock_state("r"), LockState::Locked);
}

//! End-to-end scenarios over the simulator
//!
//! Each scenario runs a conductor against simulated nodes and checks the
//! outcome through the published status events and what the nodes received.

use std::time::Duration;

use cuesync_core::{
    Authority, AuthorityTime, CoreEvent, Cue, CueId, CueKind, DispatchStatus, ExclusionReason,
    Liveness, MissReason, NodeId, NodeSelector, SchedulingError, TransitionReason,
};

use crate::clock::ClockModel;
use crate::link::{JitterDistribution, LinkConfig};
use crate::simulator::{NodeSpec, SimConfig, Simulation};

fn cue(id: u64, target: AuthorityTime, nodes: &[u64], tolerance_ms: u64) -> Cue {
    Cue::new(
        CueId::new(id),
        CueKind::Trigger,
        target,
        NodeSelector::nodes(nodes.iter().map(|n| NodeId::new(*n))),
        &b"scene"[..],
    )
    .with_tolerance(Duration::from_millis(tolerance_ms))
}

fn statuses(sim: &Simulation, cue: u64, node: u64) -> Vec<(DispatchStatus, Option<MissReason>)> {
    sim.events()
        .iter()
        .filter_map(|event| match event {
            CoreEvent::DispatchStatusChanged {
                cue: c,
                node: n,
                status,
                reason,
            } if *c == CueId::new(cue) && *n == NodeId::new(node) => Some((*status, reason.clone())),
            _ => None,
        })
        .collect()
}

fn closed(sim: &Simulation, cue: u64) -> usize {
    sim.events()
        .iter()
        .filter(|event| matches!(event, CoreEvent::CueClosed { cue: c } if *c == CueId::new(cue)))
        .count()
}

/// Execution error against the intended instant, in true time
fn timing_error_ms(sim: &Simulation, node: u64, cue: u64, target: AuthorityTime) -> i64 {
    let executed = sim.node(node).and_then(|n| n.executed(CueId::new(cue))).unwrap();
    let intended = sim.true_time_of(target);
    (executed.executes_at.as_micros() - intended.as_micros()).abs() / 1000
}

fn jittery() -> LinkConfig {
    LinkConfig {
        base_latency: Duration::from_millis(2),
        jitter: JitterDistribution::Uniform { max_us: 8_000 },
        loss_rate: 0.0,
        duplicate_prob: 0.0,
    }
}

#[test]
fn test_degraded_delivery_excludes_node_without_clock_data() {
    let mut sim = Simulation::new(SimConfig::default()).unwrap();
    sim.add_node(NodeSpec::new(1).authority());
    sim.add_node(NodeSpec::new(2).clock(ClockModel::offset_ms(120)).link(jittery()));
    sim.add_node(NodeSpec::new(3).without_probe_replies());
    sim.run_for(Duration::from_secs(2));

    let estimate = sim
        .conductor()
        .sync()
        .estimate(NodeId::new(2), sim.now())
        .unwrap();
    assert!((estimate.offset.as_millis() - 120).abs() <= 10);
    assert!(estimate.confidence <= Duration::from_millis(10));

    let target = sim.authority_time(sim.now()) + Duration::from_millis(500);
    let handle = sim.conductor().submit(cue(1, target, &[1, 2, 3], 50)).unwrap();
    assert_eq!(handle.included, vec![NodeId::new(1), NodeId::new(2)]);
    assert_eq!(
        handle.excluded,
        vec![(NodeId::new(3), ExclusionReason::NoClockData)]
    );
    assert!(sim.events().iter().any(|event| matches!(
        event,
        CoreEvent::DegradedDelivery { cue, node, reason: ExclusionReason::NoClockData }
            if *cue == CueId::new(1) && *node == NodeId::new(3)
    )));

    sim.run_for(Duration::from_secs(1));

    for node in [1, 2] {
        let seen: Vec<DispatchStatus> = statuses(&sim, 1, node).into_iter().map(|(s, _)| s).collect();
        assert_eq!(seen, vec![DispatchStatus::Sent, DispatchStatus::Acknowledged]);
        assert!(timing_error_ms(&sim, node, 1, target) <= 10);
    }
    assert!(statuses(&sim, 1, 3).is_empty());
    assert!(sim.node(3).unwrap().executions().is_empty());
    assert_eq!(closed(&sim, 1), 1);
}

#[test]
fn test_suspect_node_keeps_in_flight_dispatch() {
    let mut sim = Simulation::new(SimConfig::default()).unwrap();
    sim.add_node(NodeSpec::new(1).authority());
    sim.add_node(NodeSpec::new(2));
    sim.run_for(Duration::from_secs(2));

    let first_target = sim.authority_time(sim.now()) + Duration::from_secs(8);
    let handle = sim
        .conductor()
        .submit(cue(1, first_target, &[1, 2], 50))
        .unwrap();
    assert_eq!(handle.included.len(), 2);

    // Five heartbeat intervals of silence against a threshold of three
    sim.node_mut(2).unwrap().go_silent();
    sim.run_for(Duration::from_millis(5_200));

    let registry = sim.conductor().registry();
    assert_eq!(registry.liveness(NodeId::new(2)), Some(Liveness::Suspect));
    assert!(sim.events().iter().any(|event| matches!(
        event,
        CoreEvent::LivenessChanged { node, to: Liveness::Suspect, reason: TransitionReason::MissedHeartbeats(n), .. }
            if *node == NodeId::new(2) && *n >= 3
    )));

    let in_flight = sim.conductor().status(CueId::new(1)).unwrap();
    let pending = in_flight.iter().find(|d| d.node == NodeId::new(2)).unwrap();
    assert_eq!(pending.status, DispatchStatus::Pending);

    let second_target = sim.authority_time(sim.now()) + Duration::from_secs(1);
    let handle = sim
        .conductor()
        .submit(cue(2, second_target, &[1, 2], 50))
        .unwrap();
    assert_eq!(handle.included, vec![NodeId::new(1)]);
    assert_eq!(
        handle.excluded,
        vec![(NodeId::new(2), ExclusionReason::NotActive(Liveness::Suspect))]
    );
}

#[test]
fn test_authority_failover_within_one_evaluation() {
    let mut sim = Simulation::new(SimConfig::default()).unwrap();
    sim.add_node(NodeSpec::new(1).authority());
    sim.add_node(NodeSpec::new(2).authority().clock(ClockModel::offset_ms(40)));
    sim.add_node(NodeSpec::new(3).clock(ClockModel::offset_ms(-25)));
    sim.run_for(Duration::from_secs(3));

    let arbiter = sim.conductor().arbiter();
    assert_eq!(arbiter.current_authority(), Authority::Node(NodeId::new(1)));
    let old_epoch = arbiter.epoch();

    sim.node_mut(1).unwrap().go_silent();
    let failed_over = sim.run_until(Duration::from_secs(15), |s| {
        s.conductor().arbiter().current_authority() == Authority::Node(NodeId::new(2))
    });
    assert!(failed_over);

    // The authority keeps its role while suspect
    assert!(sim.evaluations().iter().any(|(_, e)| {
        e.authority_change.is_none()
            && e.transitions.iter().any(|t| t.node == NodeId::new(1) && t.to == Liveness::Suspect)
    }));

    // Departure and the new election happen in the same pass
    let (_, evaluation) = sim
        .evaluations()
        .iter()
        .find(|(_, e)| e.authority_change.is_some_and(|c| c.epoch > old_epoch))
        .unwrap();
    assert!(evaluation
        .transitions
        .iter()
        .any(|t| t.node == NodeId::new(1) && t.to == Liveness::Departed));
    let new_epoch = evaluation.authority_change.unwrap().epoch;

    sim.run_for(Duration::from_secs(2));
    assert!(!sim.conductor().arbiter().is_paused());

    let now = sim.now();
    for node in [2, 3] {
        let estimate = sim.conductor().sync().estimate(NodeId::new(node), now).unwrap();
        assert_eq!(estimate.epoch, new_epoch);
    }

    let target = sim.authority_time(now) + Duration::from_millis(400);
    let handle = sim.conductor().submit(cue(7, target, &[1, 2, 3], 50)).unwrap();
    assert_eq!(handle.epoch, new_epoch);
    assert_eq!(handle.included, vec![NodeId::new(2), NodeId::new(3)]);

    sim.run_for(Duration::from_secs(1));
    for node in [2, 3] {
        assert!(timing_error_ms(&sim, node, 7, target) <= 5);
    }
}

#[test]
fn test_idempotent_resubmission() {
    let mut sim = Simulation::new(SimConfig::default()).unwrap();
    sim.add_node(NodeSpec::new(1).authority());
    sim.add_node(NodeSpec::new(2).clock(ClockModel::offset_ms(15)));
    sim.run_for(Duration::from_secs(2));

    let target = sim.authority_time(sim.now()) + Duration::from_millis(300);
    let original = cue(1, target, &[1, 2], 50).with_idempotency_key("scene-4-go");

    let first = sim.conductor().submit(original.clone()).unwrap();
    assert!(!first.duplicate);

    let again = sim.conductor().submit(original).unwrap();
    assert!(again.duplicate);
    assert_eq!(again.cue, first.cue);
    assert_eq!(again.included, first.included);

    let renamed = cue(2, target, &[1, 2], 50).with_idempotency_key("scene-4-go");
    let renamed = sim.conductor().submit(renamed).unwrap();
    assert!(renamed.duplicate);
    assert_eq!(renamed.cue, CueId::new(1));

    assert_eq!(sim.conductor().status(CueId::new(1)).unwrap().len(), 2);
    assert!(sim.conductor().status(CueId::new(2)).is_none());

    sim.run_for(Duration::from_secs(1));
    for node in [1, 2] {
        assert_eq!(sim.node(node).unwrap().executions().len(), 1);
    }
    let scheduled = sim
        .events()
        .iter()
        .filter(|event| matches!(event, CoreEvent::CueScheduled { .. }))
        .count();
    assert_eq!(scheduled, 1);

    // The key is free again once the cue closed
    let later = sim.authority_time(sim.now()) + Duration::from_millis(300);
    let fresh = sim
        .conductor()
        .submit(cue(3, later, &[1, 2], 50).with_idempotency_key("scene-4-go"))
        .unwrap();
    assert!(!fresh.duplicate);
    assert_eq!(fresh.cue, CueId::new(3));
}

#[test]
fn test_estimate_converges_under_jitter_and_drift() {
    let mut sim = Simulation::new(SimConfig::with_seed(7)).unwrap();
    sim.add_node(NodeSpec::new(1).authority());
    sim.add_node(
        NodeSpec::new(2)
            .clock(ClockModel::offset_ms(250).with_drift_ppm(80.0))
            .link(LinkConfig::wireless()),
    );
    sim.run_for(Duration::from_secs(20));

    let now = sim.now();
    let estimate = sim
        .conductor()
        .sync()
        .estimate(NodeId::new(2), now)
        .unwrap();
    let truth = sim.node(2).unwrap().clock.offset_at(now);
    let error_us = (estimate.offset_at(now).as_micros() - truth.as_micros()).abs();
    assert!(error_us <= 5_000, "offset error {error_us}us");
    assert!(estimate.confidence <= sim.conductor().config().sync.max_confidence);
    assert!(estimate.samples >= sim.conductor().config().sync.min_samples);
}

#[test]
fn test_target_in_the_past_has_no_eligible_nodes() {
    let mut sim = Simulation::new(SimConfig::default()).unwrap();
    sim.add_node(NodeSpec::new(1).authority());
    sim.add_node(NodeSpec::new(2));
    sim.run_for(Duration::from_secs(2));

    let target = sim.authority_time(sim.now()) - Duration::from_secs(1);
    let err = sim.conductor().submit(cue(9, target, &[1, 2], 50)).unwrap_err();
    assert_eq!(err, SchedulingError::NoEligibleNodes(CueId::new(9)));
    assert!(sim.conductor().status(CueId::new(9)).is_none());
}

#[test]
fn test_every_dispatch_reaches_one_terminal_status_on_lossy_links() {
    let mut sim = Simulation::new(SimConfig::with_seed(21)).unwrap();
    sim.add_node(NodeSpec::new(1).authority());
    for id in 2..=5 {
        sim.add_node(
            NodeSpec::new(id)
                .clock(ClockModel::offset_ms(id as i64 * 10))
                .link(LinkConfig::lossy(0.2)),
        );
    }
    sim.run_for(Duration::from_secs(3));

    let mut handles = Vec::new();
    for id in 1..=10u64 {
        let target = sim.authority_time(sim.now()) + Duration::from_millis(300);
        let handle = sim
            .conductor()
            .submit(cue(id, target, &[1, 2, 3, 4, 5], 50))
            .unwrap();
        handles.push(handle);
        sim.run_for(Duration::from_millis(100));
    }
    sim.run_for(Duration::from_secs(2));

    assert_eq!(sim.conductor().live_cues(), 0);
    for handle in &handles {
        let cue = handle.cue.0;
        for node in handle.included.iter().chain(&handle.missed) {
            let terminal: Vec<_> = statuses(&sim, cue, node.0)
                .into_iter()
                .filter(|(status, _)| status.is_terminal())
                .collect();
            assert_eq!(terminal.len(), 1, "cue {cue} node {node}");
        }
        assert_eq!(closed(&sim, cue), 1);
    }
}

#[test]
fn test_lost_acknowledgment_is_missed() {
    let mut sim = Simulation::new(SimConfig::default()).unwrap();
    sim.add_node(NodeSpec::new(1).authority());
    sim.add_node(NodeSpec::new(2));
    sim.run_for(Duration::from_secs(2));
    sim.node_mut(2).unwrap().sends_acks = false;

    let target = sim.authority_time(sim.now()) + Duration::from_millis(200);
    sim.conductor().submit(cue(1, target, &[1, 2], 50)).unwrap();
    sim.run_for(Duration::from_millis(600));

    assert_eq!(
        statuses(&sim, 1, 2),
        vec![
            (DispatchStatus::Sent, None),
            (DispatchStatus::Missed, Some(MissReason::AckTimeout))
        ]
    );
    // The node still got the dispatch
    assert!(sim.node(2).unwrap().executed(CueId::new(1)).is_some());
}

#[test]
fn test_rejected_dispatch() {
    let mut sim = Simulation::new(SimConfig::default()).unwrap();
    sim.add_node(NodeSpec::new(1).authority());
    sim.add_node(NodeSpec::new(2));
    sim.run_for(Duration::from_secs(2));
    sim.node_mut(2).unwrap().rejects = Some("fixture busy".into());

    let target = sim.authority_time(sim.now()) + Duration::from_millis(200);
    sim.conductor().submit(cue(1, target, &[1, 2], 50)).unwrap();
    sim.run_for(Duration::from_millis(600));

    let last = statuses(&sim, 1, 2).pop().unwrap();
    assert_eq!(
        last,
        (
            DispatchStatus::Missed,
            Some(MissReason::Rejected("fixture busy".into()))
        )
    );
}

#[test]
fn test_cancel_before_send() {
    let mut sim = Simulation::new(SimConfig::default()).unwrap();
    sim.add_node(NodeSpec::new(1).authority());
    sim.add_node(NodeSpec::new(2));
    sim.run_for(Duration::from_secs(2));

    let target = sim.authority_time(sim.now()) + Duration::from_secs(2);
    sim.conductor().submit(cue(1, target, &[1, 2], 50)).unwrap();
    assert!(sim.conductor().cancel(CueId::new(1)));
    sim.run_for(Duration::from_millis(50));

    for node in [1, 2] {
        assert_eq!(
            statuses(&sim, 1, node),
            vec![(DispatchStatus::Cancelled, None)]
        );
        assert!(sim.node(node).unwrap().executions().is_empty());
    }
    assert_eq!(closed(&sim, 1), 1);
}

#[test]
fn test_departed_node_loses_open_dispatches() {
    let mut sim = Simulation::new(SimConfig::default()).unwrap();
    sim.add_node(NodeSpec::new(1).authority());
    sim.add_node(NodeSpec::new(2));
    sim.run_for(Duration::from_secs(2));

    let target = sim.authority_time(sim.now()) + Duration::from_secs(15);
    sim.conductor()
        .submit(cue(1, target, &[1, 2], 50))
        .unwrap();
    sim.node_mut(2).unwrap().go_silent();

    let departed = sim.run_until(Duration::from_secs(12), |s| {
        s.conductor().registry().get(NodeId::new(2)).is_none()
    });
    assert!(departed);
    assert_eq!(
        statuses(&sim, 1, 2),
        vec![(DispatchStatus::Missed, Some(MissReason::NodeDeparted))]
    );
    assert!(statuses(&sim, 1, 1).is_empty());
}

#[test]
fn test_latency_budget_sends_earlier() {
    let mut sim = Simulation::new(SimConfig::default()).unwrap();
    sim.add_node(NodeSpec::new(1).authority());
    sim.add_node(NodeSpec::new(2).latency_budget(Duration::from_millis(120)));
    sim.run_for(Duration::from_secs(2));

    let target = sim.authority_time(sim.now()) + Duration::from_millis(500);
    sim.conductor().submit(cue(1, target, &[1, 2], 50)).unwrap();
    sim.run_for(Duration::from_secs(1));

    let intended = sim.true_time_of(target);
    let slow = sim.node(2).unwrap().executed(CueId::new(1)).unwrap();
    let fast = sim.node(1).unwrap().executed(CueId::new(1)).unwrap();
    assert!(intended - slow.received_at >= Duration::from_millis(100));
    assert!(intended - fast.received_at < Duration::from_millis(100));
}

use crate::common::TestHarness;
use lockstep_core::*;
use serde_json::json;

#[test]
fn test_periodic_emitter_one_event_per_step() {
    // Given: 1 event/s for 10 s, quantum 1 s, direct network
    let mut h = TestHarness::new_with_seed(42);
    h.add_behavior("sensor", "periodic", json!({"period_us": 1_000_000, "destination": "sink"}));
    let sink = h.add_recorder("sink");
    h.start();

    let report = h.run_for(10_000_000, 1_000_000);

    // Then: 10 routed events, one per step, at 0, 1 s, ..., 9 s
    assert_eq!(report.steps, 10);
    assert_eq!(report.network.packets_sent, 10);
    assert_eq!(report.network.packets_delivered, 10);
    let expected: Vec<u64> = (0..10).map(|s| s * 1_000_000).collect();
    let emitted: Vec<u64> = report.emitted_events.iter().map(|e| e.timestamp_us).collect();
    assert_eq!(emitted, expected);
    for (step, point) in report.history.iter().enumerate() {
        assert_eq!(point.emitted, 1, "step {step}");
        assert_eq!(point.sim_time_us, (step as u64 + 1) * 1_000_000);
    }

    // Each event reaches the sink in the step after it was sent; the last is
    // still in flight when the run ends.
    let received = sink.events();
    assert_eq!(received.len(), 9);
    assert_eq!(report.in_flight, 1);
    for (i, (event, window)) in received.iter().zip(sink.windows()).enumerate() {
        assert_eq!(event.timestamp_us, expected[i]);
        assert_eq!(window.from_us, expected[i] + 1_000_000);
        assert_eq!(event.source, "sensor");
    }
    h.finish();
}

#[test]
fn test_boundary_event_goes_to_next_window() {
    // Given: an event sent at 0 with exactly one quantum of latency
    let edge = EdgeConfig {
        latency_us: 500,
        ..EdgeConfig::ideal()
    };
    let mut h = TestHarness::lossy(edge, 1);
    h.add_behavior("a", "periodic", json!({"period_us": 1_000_000_000, "destination": "b"}));
    let b = h.add_recorder("b");
    h.start();

    let r = h.run_for(500, 500);
    assert_eq!(r.delivered, 0);
    assert_eq!(r.in_flight, 1);

    // Then: due at 500, excluded from [0, 500), included in [500, 1000)
    let r = h.run_for(500, 500);
    assert_eq!(r.delivered, 1);
    let windows = b.windows();
    assert_eq!(windows, vec![TimeWindow::new(500, 1_000)]);
    assert_eq!(b.events()[0].timestamp_us, 500);
}

#[test]
fn test_same_delivery_time_keeps_emission_order() {
    // Given: two sources in registration order, both emitting at the same instants
    let mut h = TestHarness::new();
    h.add_behavior("first", "periodic", json!({"period_us": 100, "destination": "sink"}));
    h.add_behavior("second", "periodic", json!({"period_us": 100, "destination": "sink"}));
    let sink = h.add_recorder("sink");
    h.start();
    h.run_for(1_000, 500);
    h.run_for(500, 500);

    let received = sink.events();
    assert_eq!(received.len(), 20);
    for pair in received.chunks(2) {
        assert_eq!(pair[0].timestamp_us, pair[1].timestamp_us);
        assert_eq!(pair[0].source, "first");
        assert_eq!(pair[1].source, "second");
    }
}

#[test]
fn test_relay_chain_crosses_multiple_steps() {
    // sensor -> gateway (2 ms processing) -> cloud
    let mut h = TestHarness::new();
    h.add_behavior("sensor", "periodic", json!({"period_us": 10_000, "limit": 3, "destination": "gateway"}));
    h.add_behavior(
        "gateway",
        "relay",
        json!({"destination": "cloud", "processing_delay_us": 2_000, "event_type": "FORWARD"}),
    );
    let cloud = h.add_recorder("cloud");
    h.start();
    let report = h.run_for(100_000, 1_000);

    let received = cloud.events();
    assert_eq!(received.len(), 3);
    assert_eq!(report.in_flight, 0);
    for (i, e) in received.iter().enumerate() {
        assert_eq!(e.event_type, "FORWARD");
        assert_eq!(e.source, "gateway");
        assert_eq!(e.payload["from"], "sensor");
        // Sent at 10 ms * i, seen by the gateway one step later, forwarded
        // 2 ms after that.
        assert_eq!(e.timestamp_us, i as u64 * 10_000 + 1_000 + 2_000);
    }
}

#[test]
fn test_global_time_never_overtaken() {
    let mut h = TestHarness::new();
    h.add_behavior("a", "periodic", json!({"period_us": 333}));
    h.add_behavior("b", "relay", json!({}));
    h.start();

    // Given: a duration that is not a multiple of the quantum
    let report = h.run_for(10_500, 1_000);
    assert_eq!(report.steps, 11);
    assert_eq!(report.final_time_us, 10_500);
    assert_eq!(report.history.last().unwrap().sim_time_us, 10_500);
    for (_, state) in h.coord.adapter_states() {
        assert_eq!(state, AdapterState::Running);
    }
    assert_eq!(h.coord.current_time_us(), 10_500);
}

#[test]
fn test_shutdown_twice() {
    let mut h = TestHarness::new();
    h.add_behavior("a", "relay", json!({}));
    h.start();
    h.run_for(10, 5);

    let first = h.finish();
    assert_eq!(first, vec![("a".to_string(), ShutdownOutcome::Graceful)]);
    let second = h.finish();
    assert_eq!(second, vec![("a".to_string(), ShutdownOutcome::AlreadyShutDown)]);
    assert!(matches!(
        h.coord.run_until(100, 5),
        Err(CoordinatorError::ShutDown)
    ));
}

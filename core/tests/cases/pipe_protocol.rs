use crate::common::TestHarness;
use lockstep_core::*;
use serde_json::{json, Value};
use std::time::{Duration, Instant};

const WORKER: &str = env!("CARGO_BIN_EXE_lockstep-worker");

fn ctx() -> InitContext {
    InitContext {
        global_seed: 1,
        seed: 2,
    }
}

fn worker(node_id: &str, behavior: &str, config: Value) -> PipeProtocolAdapter {
    let params = json!({"behavior": behavior, "config": config});
    let mut cfg = PipeConfig::new(ProcessSpec::new([WORKER]), params);
    cfg.response_timeout_ms = 5_000;
    cfg.handshake_timeout_ms = 5_000;
    PipeProtocolAdapter::new(node_id, cfg)
}

fn shell(script: &str) -> PipeConfig {
    let mut cfg = PipeConfig::new(ProcessSpec::new(["sh", "-c", script]), Value::Null);
    cfg.response_timeout_ms = 300;
    cfg.handshake_timeout_ms = 300;
    cfg.poll_interval_ms = 20;
    cfg.shutdown_grace_ms = 300;
    cfg
}

#[test]
fn test_reference_worker_round_trip() {
    let mut p = worker("w1", "relay", json!({"destination": "cloud", "processing_delay_us": 10}));
    p.initialize(&ctx()).unwrap();
    assert_eq!(p.state(), AdapterState::Initialized);
    assert!(p.process_id().is_some());

    let inbound = vec![Event::new(5, "SAMPLE", "sensor").to("w1").with_payload(json!({"v": 1}))];
    let out = p.advance_to(1_000, inbound).unwrap();
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].timestamp_us, 15);
    assert_eq!(out[0].source, "w1");
    assert_eq!(out[0].destination.as_deref(), Some("cloud"));
    assert_eq!(out[0].payload["data"]["v"], 1);
    assert!(out[0].network_metadata().is_none());
    assert_eq!(p.current_time_us(), 1_000);
    assert_eq!(p.state(), AdapterState::Running);

    assert!(p.advance_to(2_000, vec![]).unwrap().is_empty());

    assert_eq!(p.shutdown(), ShutdownOutcome::Graceful);
    assert_eq!(p.shutdown(), ShutdownOutcome::AlreadyShutDown);
    assert!(p.process_id().is_none());
}

#[test]
fn test_pipe_worker_in_coordinator() {
    // in-process sensor -> pipe gateway -> in-process sink
    let mut h = TestHarness::new_with_seed(9);
    h.add_behavior("sensor", "periodic", json!({"period_us": 100_000, "destination": "gateway"}));
    h.add(Box::new(worker("gateway", "relay", json!({"destination": "sink"}))));
    let sink = h.add_recorder("sink");
    h.start();
    let report = h.run_for(1_000_000, 100_000);

    // Sensor emits 10; the gateway forwards each one step later; the sink
    // sees them one step after that.
    assert_eq!(report.emitted, 10 + 9);
    assert_eq!(sink.events().len(), 8);
    assert!(sink.events().iter().all(|e| e.source == "gateway"));
    let outcomes = h.finish();
    assert!(outcomes.iter().all(|(_, o)| *o == ShutdownOutcome::Graceful));
}

#[test]
fn test_pipe_worker_seed_reaches_behavior() {
    let run = |seed: u64| {
        let mut p = worker("w", "periodic", json!({"period_us": 100}));
        p.initialize(&InitContext { global_seed: 0, seed }).unwrap();
        let out = p.advance_to(1_000, vec![]).unwrap();
        p.shutdown();
        out.into_iter().map(|e| e.payload["value"].clone()).collect::<Vec<_>>()
    };
    assert_eq!(run(1), run(1));
    assert_ne!(run(1), run(2));
}

#[test]
fn test_advance_before_initialize_writes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let capture = dir.path().join("stdin.txt");
    // Given: a worker that records its input and never answers
    let mut p = PipeProtocolAdapter::new("mute", shell(&format!("cat > '{}'", capture.display())));
    let err = p.initialize(&ctx()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert_eq!(p.state(), AdapterState::Connected);

    // When: advancing without a completed handshake
    let err = p.advance_to(1_000, vec![Event::new(0, "X", "y")]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Protocol);

    // Then: the worker saw the handshake and the shutdown, nothing else
    assert_eq!(p.shutdown(), ShutdownOutcome::Graceful);
    let written = std::fs::read_to_string(&capture).unwrap();
    let lines: Vec<&str> = written.lines().collect();
    assert_eq!(lines.len(), 2, "unexpected input: {written:?}");
    assert!(lines[0].starts_with("INIT {"));
    assert_eq!(lines[1], "SHUTDOWN");
    let init: Value = serde_json::from_str(&lines[0]["INIT ".len()..]).unwrap();
    assert_eq!(init["node_id"], "mute");
    assert_eq!(init["seed"], 2);
}

#[test]
fn test_error_reply_is_protocol_error() {
    let mut p = PipeProtocolAdapter::new("e", shell("read l; echo 'ERROR model file missing'; read l"));
    let err = p.initialize(&ctx()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Protocol);
    assert!(err.to_string().contains("model file missing"), "{err}");
    p.shutdown();
}

#[test]
fn test_burst_reply_does_not_stall() {
    // DONE and the event array arrive in a single write.
    let script = r#"read l; echo READY; read a; read b; printf 'DONE\n[{"timestamp_us":5,"event_type":"X"}]\n'; read c"#;
    let mut p = PipeProtocolAdapter::new("burst", shell(script));
    p.initialize(&ctx()).unwrap();
    let out = p.advance_to(10, vec![]).unwrap();
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].source, "burst");
    assert_eq!(p.shutdown(), ShutdownOutcome::Graceful);
}

#[test]
fn test_stalled_worker_times_out() {
    let mut p = PipeProtocolAdapter::new("slow", shell("read l; echo READY; exec sleep 30"));
    p.initialize(&ctx()).unwrap();

    let started = Instant::now();
    let err = p.advance_to(1_000, vec![]).unwrap_err();
    match &err {
        AdapterError::Timeout {
            waiting_for,
            elapsed,
            polls,
        } => {
            assert!(waiting_for.contains("DONE"));
            assert!(*elapsed >= Duration::from_millis(300));
            assert!(*polls > 1);
        }
        other => panic!("expected timeout, got {other}"),
    }
    assert!(started.elapsed() < Duration::from_secs(5));

    // Then: the stuck worker is killed after the grace period
    assert_eq!(p.shutdown(), ShutdownOutcome::Forced);
}

#[test]
fn test_dead_worker_detected() {
    let mut p = PipeProtocolAdapter::new("dies", shell("read l; echo READY; read l; echo 'segfault in handler' >&2; exit 3"));
    p.initialize(&ctx()).unwrap();
    let err = p.advance_to(1_000, vec![]).unwrap_err();
    match &err {
        AdapterError::ProcessDied { status, stderr_tail } => {
            assert!(status.contains('3'), "{status}");
            assert!(stderr_tail.contains("segfault in handler"), "{stderr_tail}");
        }
        other => panic!("expected process death, got {other}"),
    }
    assert_eq!(p.shutdown(), ShutdownOutcome::Graceful);
}

#[test]
fn test_failing_pipe_node_aborts_run() {
    let mut h = TestHarness::new();
    h.add_behavior("a", "relay", json!({}));
    h.add(Box::new(PipeProtocolAdapter::new(
        "flaky",
        shell("read l; echo READY; read a; read b; echo DONE; echo '[]'; read a; read b; exit 1"),
    )));
    h.start();
    let err = h.coord.run_until(10_000, 1_000).unwrap_err();
    assert_eq!(err.node_id(), Some("flaky"));
    assert!(matches!(
        err,
        CoordinatorError::Adapter {
            phase: Phase::Advance,
            time_us: 1_000,
            kind: ErrorKind::ProcessDied,
            ..
        }
    ));
    assert!(h.coord.is_shut_down());
    assert!(h
        .coord
        .adapter_states()
        .iter()
        .all(|(_, s)| *s == AdapterState::ShutDown));
}

/// Stand-in for a container runtime CLI: logs its argv, runs `run_action`
/// for `run` and succeeds for everything else.
fn fake_runtime(dir: &std::path::Path, run_action: &str) -> (std::path::PathBuf, std::path::PathBuf) {
    use std::os::unix::fs::PermissionsExt;

    let log = dir.join("runtime.log");
    let shim = dir.join("fake-docker");
    let script = format!(
        "#!/bin/sh\necho \"$*\" >> '{log}'\nif [ \"$1\" = run ]; then {run_action}; fi\nexit 0\n",
        log = log.display()
    );
    std::fs::write(&shim, script).unwrap();
    std::fs::set_permissions(&shim, std::fs::Permissions::from_mode(0o755)).unwrap();
    (shim, log)
}

fn runtime_calls(log: &std::path::Path) -> Vec<String> {
    std::fs::read_to_string(log)
        .unwrap()
        .lines()
        .map(str::to_string)
        .collect()
}

#[test]
fn test_container_worker_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let (shim, log) = fake_runtime(dir.path(), &format!("exec '{WORKER}'"));

    // Given: a relay worker packaged as an image
    let container = ContainerSpec {
        runtime: shim.display().to_string(),
        ..ContainerSpec::new("lockstep/relay:1")
    };
    let mut process = ProcessSpec::new(["lockstep-worker"]);
    process.env.insert("RUST_LOG".into(), "debug".into());
    let mut cfg = PipeConfig::in_container(container, process, json!({"behavior": "relay", "config": {"destination": "cloud"}}));
    cfg.handshake_timeout_ms = 5_000;
    cfg.response_timeout_ms = 5_000;
    let mut p = PipeProtocolAdapter::new("gw", cfg);
    assert_eq!(p.container_name().as_deref(), Some("lockstep-gw"));

    p.initialize(&ctx()).unwrap();
    let out = p
        .advance_to(1_000, vec![Event::new(10, "SAMPLE", "s1").to("gw")])
        .unwrap();
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].source, "gw");

    // Then: stale cleanup, the run itself, and removal at shutdown
    assert_eq!(p.shutdown(), ShutdownOutcome::Graceful);
    assert_eq!(
        runtime_calls(&log),
        vec![
            "rm -f lockstep-gw",
            "run -i --rm --name lockstep-gw -e RUST_LOG=debug lockstep/relay:1 lockstep-worker",
            "rm -f lockstep-gw",
        ]
    );
    assert_eq!(p.shutdown(), ShutdownOutcome::AlreadyShutDown);
    assert_eq!(runtime_calls(&log).len(), 3);
}

#[test]
fn test_stuck_container_is_removed() {
    let dir = tempfile::tempdir().unwrap();
    let (shim, log) = fake_runtime(dir.path(), "read l; echo READY; exec sleep 30");

    let container = ContainerSpec {
        runtime: shim.display().to_string(),
        name: Some("stuck-worker".into()),
        ..ContainerSpec::new("img")
    };
    let mut cfg = PipeConfig::in_container(container, ProcessSpec::default(), Value::Null);
    cfg.response_timeout_ms = 200;
    cfg.poll_interval_ms = 20;
    cfg.shutdown_grace_ms = 200;
    let mut p = PipeProtocolAdapter::new("edge", cfg);
    p.initialize(&ctx()).unwrap();
    assert_eq!(p.advance_to(1_000, vec![]).unwrap_err().kind(), ErrorKind::Timeout);

    // Killing the runtime client is not enough: the container goes too.
    assert_eq!(p.shutdown(), ShutdownOutcome::Forced);
    assert_eq!(runtime_calls(&log).last().map(String::as_str), Some("rm -f stuck-worker"));
}

#[test]
fn test_container_removed_when_run_aborts() {
    let dir = tempfile::tempdir().unwrap();
    let (shim, log) = fake_runtime(dir.path(), "read l; echo 'ERROR image has no model'");

    let container = ContainerSpec {
        runtime: shim.display().to_string(),
        ..ContainerSpec::new("img")
    };
    let mut h = TestHarness::new();
    h.add_behavior("sensor", "periodic", json!({}));
    h.add(Box::new(PipeProtocolAdapter::new(
        "ml",
        PipeConfig::in_container(container, ProcessSpec::default(), Value::Null),
    )));
    let err = h.coord.initialize_all(0).unwrap_err();
    assert_eq!(err.node_id(), Some("ml"));
    assert_eq!(
        runtime_calls(&log),
        vec!["rm -f lockstep-ml", "run -i --rm --name lockstep-ml img", "rm -f lockstep-ml"]
    );
}

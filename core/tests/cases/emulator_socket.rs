use lockstep_core::*;
use std::io::{BufRead, BufReader, Write};
use std::net::TcpListener;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

/// Scripted stand-in for an emulator monitor. Every command is recorded; the
/// first `RunFor` reports records far ahead of the requested window.
struct FakeMonitor {
    port: u16,
    commands: Arc<Mutex<Vec<String>>>,
    handle: JoinHandle<()>,
}

const FIRST_RUN_OUTPUT: &str = "\
{\"time\":500000,\"type\":\"SAMPLE\",\"dst\":\"gw\",\"payload\":{\"seq\":0}}
{\"time\":1500000,\"type\":\"SAMPLE\",\"dst\":\"gw\",\"payload\":{\"seq\":1}}
{\"time\":2500000,\"type\":\"SAMPLE\",\"dst\":\"gw\",\"payload\":{\"seq\":2}}
[uart0] {\"type\":\"HEARTBEAT\"}
[uart0] {not json at all}
";

impl FakeMonitor {
    fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let commands = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&commands);
        let handle = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut writer = stream.try_clone().unwrap();
            write!(writer, "Emulator monitor\n(monitor) ").unwrap();
            let mut runs = 0;
            for line in BufReader::new(stream).lines() {
                let Ok(line) = line else { break };
                log.lock().unwrap().push(line.clone());
                let reply = if line == "quit" {
                    break;
                } else if line.starts_with("emulation RunFor") {
                    runs += 1;
                    if runs == 1 {
                        FIRST_RUN_OUTPUT.to_string()
                    } else {
                        String::new()
                    }
                } else if line.starts_with("mach create") {
                    "{\"type\":\"BOOT\"}\n".to_string()
                } else {
                    "ok\n".to_string()
                };
                if write!(writer, "{reply}(dev1) ").is_err() {
                    break;
                }
            }
        });
        Self { port, commands, handle }
    }

    fn config(&self) -> EmulatorConfig {
        let mut cfg = EmulatorConfig::attach("127.0.0.1", self.port);
        cfg.command_timeout_ms = 2_000;
        cfg.poll_interval_ms = 10;
        cfg
    }

    fn finish(self) -> Vec<String> {
        self.handle.join().unwrap();
        Arc::try_unwrap(self.commands).unwrap().into_inner().unwrap()
    }
}

fn ctx() -> InitContext {
    InitContext {
        global_seed: 0,
        seed: 7,
    }
}

#[test]
fn test_emulator_overshoot_is_buffered() {
    let monitor = FakeMonitor::start();
    let mut cfg = monitor.config();
    cfg.startup_commands = vec!["mach create \"{node_id}\"".into(), "start".into()];
    let mut dev = EmulatorSocketAdapter::new("dev1", cfg);

    dev.initialize(&ctx()).unwrap();
    assert_eq!(dev.state(), AdapterState::Initialized);

    // Window [0, 1s): the firmware ran ahead and reported up to 2.5 s
    let out = dev.advance_to(1_000_000, vec![]).unwrap();
    let types: Vec<&str> = out.iter().map(|e| e.event_type.as_str()).collect();
    assert_eq!(types, vec!["BOOT", "SAMPLE", "HEARTBEAT"]);
    assert_eq!(out[0].timestamp_us, 0);
    assert_eq!(out[1].timestamp_us, 500_000);
    assert_eq!(out[1].destination.as_deref(), Some("gw"));
    assert_eq!(out[1].payload["seq"], 0);
    // Untimestamped record: stamped with the window start
    assert_eq!(out[2].timestamp_us, 0);
    assert!(out.iter().all(|e| e.source == "dev1"));
    assert_eq!(dev.buffered().len(), 2);
    assert_eq!(dev.buffered().next_due_us(), Some(1_500_000));

    // Then: each held record comes out in the window that contains it
    let out = dev.advance_to(2_000_000, vec![]).unwrap();
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].timestamp_us, 1_500_000);
    assert_eq!(dev.buffered().len(), 1);

    let out = dev.advance_to(3_000_000, vec![]).unwrap();
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].timestamp_us, 2_500_000);
    assert!(dev.buffered().is_empty());
    assert_eq!(dev.current_time_us(), 3_000_000);

    assert_eq!(dev.shutdown(), ShutdownOutcome::Graceful);
    let commands = monitor.finish();
    assert_eq!(
        commands,
        vec![
            "mach create \"dev1\"",
            "start",
            "emulation RunFor @1.000000",
            "emulation RunFor @1.000000",
            "emulation RunFor @1.000000",
            "quit",
        ]
    );
}

#[test]
fn test_emulator_inject_command() {
    let monitor = FakeMonitor::start();
    let mut cfg = monitor.config();
    cfg.inject_command = Some("sysbus.uart0 WriteLine '{event}'".into());
    let mut dev = EmulatorSocketAdapter::new("dev1", cfg);
    dev.initialize(&ctx()).unwrap();

    let inbound = vec![Event::new(100, "CMD", "gw").to("dev1")];
    dev.advance_to(500, inbound).unwrap();
    dev.shutdown();

    let commands = monitor.finish();
    assert_eq!(commands.len(), 3);
    assert!(commands[0].starts_with("sysbus.uart0 WriteLine '{"));
    assert!(commands[0].contains("\"event_type\":\"CMD\""));
    assert_eq!(commands[1], "emulation RunFor @0.000500");
    assert_eq!(commands[2], "quit");
}

#[test]
fn test_emulator_uart_log_is_tailed() {
    let dir = tempfile::tempdir().unwrap();
    let uart = dir.path().join("uart.log");
    let monitor = FakeMonitor::start();
    let mut cfg = monitor.config();
    cfg.uart_log = Some(uart.clone());
    let mut dev = EmulatorSocketAdapter::new("dev1", cfg);
    dev.initialize(&ctx()).unwrap();

    // First window also picks up the monitor's own output.
    let first = dev.advance_to(1_000_000, vec![]).unwrap();
    assert_eq!(first.len(), 2);

    std::fs::write(&uart, "{\"time\":1200000,\"type\":\"TEMP\"}\n{\"time\":1300000,").unwrap();
    let out = dev.advance_to(2_000_000, vec![]).unwrap();
    let types: Vec<&str> = out.iter().map(|e| e.event_type.as_str()).collect();
    assert_eq!(types, vec!["SAMPLE", "TEMP"]);
    assert_eq!(out[1].timestamp_us, 1_200_000);

    dev.shutdown();
    monitor.finish();
}

#[test]
fn test_emulator_in_coordinator_feeds_sink() {
    let monitor = FakeMonitor::start();
    let mut coord = Coordinator::new(NetworkModel::direct()).with_event_recording(true);
    coord
        .register_adapter(Box::new(EmulatorSocketAdapter::new("dev1", monitor.config())))
        .unwrap();
    coord
        .register_adapter(Box::new(InProcessAdapter::new(
            "gw",
            create_behavior("relay", serde_json::Value::Null).unwrap(),
        )))
        .unwrap();
    coord.initialize_all(3).unwrap();

    let report = coord.run_until(3_000_000, 1_000_000).unwrap();
    // HEARTBEAT has no destination and stays local.
    assert_eq!(report.emitted, 4);
    assert_eq!(report.local, 1);
    // The 2.5 s record is released in the last window and still in flight.
    assert_eq!(report.delivered, 2);
    assert_eq!(report.in_flight, 1);

    coord.shutdown_all();
    assert!(monitor.finish().last().is_some_and(|c| c == "quit"));
}

#[test]
fn test_emulator_closed_monitor_is_process_death() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        write!(stream, "(monitor) ").unwrap();
        // Read the first command, then hang up.
        let mut line = String::new();
        BufReader::new(stream.try_clone().unwrap()).read_line(&mut line).unwrap();
    });

    let mut cfg = EmulatorConfig::attach("127.0.0.1", port);
    cfg.command_timeout_ms = 2_000;
    let mut dev = EmulatorSocketAdapter::new("dev1", cfg);
    dev.initialize(&ctx()).unwrap();
    let err = dev.advance_to(1_000, vec![]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ProcessDied);
    dev.shutdown();
    server.join().unwrap();
}

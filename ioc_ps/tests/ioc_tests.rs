//! End-to-end IOC tests against the simulated bus: scan cycles feed the
//! low-level PVs, client writes reach the device, and the computed
//! diagnostics track device health.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ioc_bsmp::transport::shared;
use ioc_common::config::{
    DeviceConfig, DevicesConfig, FullConfig, IocConfig, SerialConfig,
};
use ioc_common::csdev::OpModeTable;
use ioc_common::pv::{PvValue, Severity};
use ioc_compute::PsStatusWord;
use ioc_ps::app::App;
use ioc_ps::sim::SimBus;

const INTERVAL: Duration = Duration::from_millis(10);

fn test_config() -> FullConfig {
    FullConfig {
        ioc: IocConfig {
            service_name: "ps-ioc-test".to_string(),
            log_level: Default::default(),
            scan_interval_s: 0.01,
            serial: SerialConfig {
                retry_backoff_ms: 0,
                ..SerialConfig::default()
            },
        },
        devices: DevicesConfig {
            devices: vec![DeviceConfig {
                name: "PS-01".to_string(),
                address: 1,
                pstype: "fbp".to_string(),
            }],
            wfm_tolerance: HashMap::from([("fbp".to_string(), 0.5)]),
            opmode: OpModeTable::default(),
        },
    }
}

fn build_app(bus: &SimBus) -> App {
    App::new(&test_config(), shared(bus.clone())).unwrap()
}

/// Scan until the computed PVs have settled: each `process` posts the
/// primary sources, and the queue drains between calls.
fn settle(app: &mut App, cycles: usize) {
    for _ in 0..cycles {
        app.process(INTERVAL);
        std::thread::sleep(Duration::from_millis(5));
    }
}

fn status_word(app: &App) -> PsStatusWord {
    match app.read("PS-01:DiagStatus-Mon") {
        Some(PvValue::Int(bits)) => PsStatusWord::from_bits_truncate(bits as u8),
        other => panic!("unexpected status value {other:?}"),
    }
}

#[test]
fn scan_publishes_device_state() {
    let bus = SimBus::new(&[1]);
    let mut app = build_app(&bus);

    assert!(app.write("PS-01:PwrState-Sel", &PvValue::Enum(1)));
    assert!(app.write("PS-01:Current-SP", &PvValue::Float(2.0)));
    settle(&mut app, 12);

    assert_eq!(app.read("PS-01:Current-SP"), Some(PvValue::Float(2.0)));
    assert_eq!(app.read("PS-01:PwrState-Sts"), Some(PvValue::Enum(1)));
    // SlowRef under the default table.
    assert_eq!(app.read("PS-01:OpMode-Sts"), Some(PvValue::Enum(3)));
    let mon = app
        .read("PS-01:Current-Mon")
        .and_then(|v| v.as_f64())
        .unwrap();
    assert!((mon - 2.0).abs() < 0.05, "monitor at {mon}");

    app.shutdown();
}

#[test]
fn healthy_device_reports_zero_status() {
    let bus = SimBus::new(&[1]);
    let mut app = build_app(&bus);

    assert!(app.write("PS-01:PwrState-Sel", &PvValue::Enum(1)));
    assert!(app.write("PS-01:Current-SP", &PvValue::Float(1.0)));
    settle(&mut app, 16);

    assert_eq!(status_word(&app), PsStatusWord::empty());

    let diff = app
        .read("PS-01:DiagCurrentDiff-Mon")
        .and_then(|v| v.as_f64())
        .unwrap();
    assert!(diff.abs() < 0.05, "diff at {diff}");

    app.shutdown();
}

#[test]
fn powered_off_device_raises_power_bit() {
    let bus = SimBus::new(&[1]);
    let mut app = build_app(&bus);

    settle(&mut app, 6);
    let word = status_word(&app);
    assert!(word.contains(PsStatusWord::POWER_OFF), "word {word:?}");

    app.shutdown();
}

#[test]
fn interlock_trip_raises_interlock_bit() {
    let bus = SimBus::new(&[1]);
    let mut app = build_app(&bus);

    assert!(app.write("PS-01:PwrState-Sel", &PvValue::Enum(1)));
    settle(&mut app, 8);
    assert_eq!(status_word(&app) & PsStatusWord::INTERLOCK, PsStatusWord::empty());

    bus.raise_hard_interlock(1, 0x02);
    settle(&mut app, 8);

    let word = status_word(&app);
    assert!(word.contains(PsStatusWord::INTERLOCK), "word {word:?}");
    assert_eq!(
        app.read("PS-01:IntlkHard-Mon"),
        Some(PvValue::Int(0x02))
    );

    app.shutdown();
}

#[test]
fn reset_command_clears_interlocks() {
    let bus = SimBus::new(&[1]);
    let mut app = build_app(&bus);

    assert!(app.write("PS-01:PwrState-Sel", &PvValue::Enum(1)));
    bus.raise_hard_interlock(1, 0x01);
    settle(&mut app, 6);
    assert!(status_word(&app).contains(PsStatusWord::INTERLOCK));

    assert!(app.write("PS-01:Reset-Cmd", &PvValue::Int(1)));
    settle(&mut app, 6);

    assert_eq!(app.read("PS-01:IntlkHard-Mon"), Some(PvValue::Int(0)));
    let word = status_word(&app);
    assert!(!word.contains(PsStatusWord::INTERLOCK), "word {word:?}");
    // The reset drops the supply to the off state.
    assert!(word.contains(PsStatusWord::POWER_OFF));
    assert_eq!(app.read("PS-01:Reset-Cmd"), Some(PvValue::Int(1)));

    app.shutdown();
}

#[test]
fn write_validation() {
    let bus = SimBus::new(&[1]);
    let mut app = build_app(&bus);
    settle(&mut app, 2);

    // Read-only property.
    assert!(!app.write("PS-01:Current-Mon", &PvValue::Float(1.0)));
    // Unknown device and property.
    assert!(!app.write("PS-99:Current-SP", &PvValue::Float(1.0)));
    assert!(!app.write("PS-01:Nope-SP", &PvValue::Float(1.0)));
    // Wrong kind.
    assert!(!app.write("PS-01:Current-SP", &PvValue::Str("x".into())));
    // Outside display limits.
    assert!(!app.write("PS-01:Current-SP", &PvValue::Float(1000.0)));
    // Enum out of range.
    assert!(!app.write("PS-01:PwrState-Sel", &PvValue::Enum(7)));
    // Setpoint while powered off is rejected by the firmware.
    assert!(!app.write("PS-01:Current-SP", &PvValue::Float(1.0)));

    app.shutdown();
}

#[test]
fn waveform_write_echoes_to_readback() {
    let bus = SimBus::new(&[1]);
    let mut app = build_app(&bus);

    let wfm = vec![0.25; ioc_ps::db::WFM_POINTS];
    assert!(app.write("PS-01:WfmData-SP", &PvValue::FloatArray(wfm.clone())));
    assert_eq!(
        app.read("PS-01:WfmData-RB"),
        Some(PvValue::FloatArray(wfm))
    );
    // Wrong element count is rejected.
    assert!(!app.write("PS-01:WfmData-SP", &PvValue::FloatArray(vec![0.0; 3])));

    app.shutdown();
}

#[test]
fn dead_bus_degrades_and_recovers() {
    let bus = SimBus::new(&[1]);
    let mut app = build_app(&bus);

    assert!(app.write("PS-01:PwrState-Sel", &PvValue::Enum(1)));
    settle(&mut app, 8);
    assert_eq!(status_word(&app), PsStatusWord::empty());

    // Bus goes silent: retries exhaust and the device PVs degrade.
    bus.drop_replies(u32::MAX);
    settle(&mut app, 4);
    // Publisher-visible updates stop; values are stale but readable.
    assert!(app.read("PS-01:Current-Mon").is_some());

    // Bus back: the device reconnects and status recovers.
    bus.drop_replies(0);
    settle(&mut app, 8);
    assert_eq!(status_word(&app), PsStatusWord::empty());

    app.shutdown();
}

#[test]
fn app_builds_from_config_directory() {
    let dir = tempfile::TempDir::new().unwrap();
    std::fs::write(
        dir.path().join("ioc.toml"),
        r#"
service_name = "ps-ioc-si"
scan_interval_s = 0.02
"#,
    )
    .unwrap();
    std::fs::write(
        dir.path().join("devices.toml"),
        r#"
[[devices]]
name = "PS-01"
address = 1
pstype = "fbp"

[wfm_tolerance]
fbp = 0.5
"#,
    )
    .unwrap();

    let config = ioc_common::config::load_config_dir(dir.path()).unwrap();
    let bus = SimBus::new(&[1]);
    let mut app = App::new(&config, shared(bus)).unwrap();

    settle(&mut app, 4);
    assert!(app.read("PS-01:Version-Cte").is_some());
    // Database dump carries the device key.
    assert!(app.dump_db().get("PS-01").is_some());
    app.shutdown();
}

#[test]
fn publisher_receives_updates() {
    let bus = SimBus::new(&[1]);
    let mut app = build_app(&bus);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    app.set_publisher(Arc::new(move |name, _value, severity: Severity| {
        sink.lock().unwrap().push((name.to_string(), severity));
    }));

    settle(&mut app, 4);

    let seen = seen.lock().unwrap();
    assert!(
        seen.iter().any(|(name, _)| name == "PS-01:Current-Mon"),
        "no monitor updates published"
    );
    assert!(
        seen.iter().any(|(name, _)| name == "PS-01:DiagStatus-Mon"),
        "no status updates published"
    );

    app.shutdown();
}

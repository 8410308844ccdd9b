//! Driver-facing application surface and device wiring.
//!
//! The hosting PV-server driver calls [`App::read`] for authoritative
//! values, [`App::write`] for client writes and [`App::process`] from
//! its main loop. Everything the IOC serves hangs off observable PV
//! handles: the controller posts low-level values into them, the
//! computed-PV engine derives the diagnostics, and a registered
//! publisher callback forwards every update to the driver.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use ioc_bsmp::Channel;
use ioc_bsmp::transport::SharedTransport;
use ioc_common::config::FullConfig;
use ioc_common::csdev::OpModeTable;
use ioc_common::db::{DbError, PvDatabase};
use ioc_common::pv::{PvType, PvValue, Severity};
use ioc_compute::status::source;
use ioc_compute::{
    Computer, ComputedPv, CurrentDiff, Pv, PsStatus, TaskQueue, WfmToleranceCache,
};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::controller::{DevicePvs, PsController};
use crate::db;

/// Callback toward the server driver: `(full pv name, value, severity)`.
pub type Publisher = Arc<dyn Fn(&str, &PvValue, Severity) + Send + Sync>;

/// Application construction error.
#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Db(#[from] DbError),

    #[error("PV '{0}' missing from database")]
    MissingPv(String),
}

/// Scan-cycle timing statistics.
#[derive(Debug, Default)]
struct ScanStats {
    cycle_count: u64,
    timing_violations: u64,
    max_cycle_time_us: u64,
    total_cycle_time_us: u64,
}

impl ScanStats {
    fn record(&mut self, elapsed: Duration, budget: Duration) {
        let us = elapsed.as_micros() as u64;
        self.cycle_count += 1;
        self.total_cycle_time_us += us;
        if us > self.max_cycle_time_us {
            self.max_cycle_time_us = us;
        }
        if elapsed > budget {
            self.timing_violations += 1;
            debug!(elapsed_us = us, "scan cycle exceeded interval");
        }
    }

    fn avg_us(&self) -> u64 {
        if self.cycle_count == 0 {
            0
        } else {
            self.total_cycle_time_us / self.cycle_count
        }
    }
}

/// One wired device: controller, live handles and its computed PVs.
struct Device {
    name: String,
    controller: Arc<PsController>,
    pvs: HashMap<String, Pv>,
    db: PvDatabase,
    // Kept alive for their source observers.
    _diff: ComputedPv,
    _status: ComputedPv,
}

impl Device {
    fn pv(&self, property: &str) -> Option<&Pv> {
        self.pvs.get(property)
    }
}

/// The soft-IOC application.
pub struct App {
    service_name: String,
    queue: Option<TaskQueue>,
    devices: Vec<Device>,
    stats: ScanStats,
    publisher: Arc<Mutex<Option<Publisher>>>,
}

impl App {
    /// Wire every configured device onto the shared transport.
    pub fn new(config: &FullConfig, transport: SharedTransport) -> Result<Self, AppError> {
        let queue = TaskQueue::start(&config.ioc.service_name);
        let opmode = Arc::new(config.devices.opmode.clone());
        let tolerances = Arc::new(WfmToleranceCache::new(config.devices.wfm_tolerance.clone()));
        let publisher: Arc<Mutex<Option<Publisher>>> = Arc::new(Mutex::new(None));

        let mut devices = Vec::with_capacity(config.devices.devices.len());
        for device_config in &config.devices.devices {
            devices.push(build_device(
                config,
                device_config,
                transport.clone(),
                &queue,
                &opmode,
                &tolerances,
                &publisher,
            )?);
        }
        info!(
            service = %config.ioc.service_name,
            devices = devices.len(),
            "application wired"
        );

        Ok(Self {
            service_name: config.ioc.service_name.clone(),
            queue: Some(queue),
            devices,
            stats: ScanStats::default(),
            publisher,
        })
    }

    /// Install the driver publish callback. Every PV update from now on
    /// is forwarded as `(name, value, severity)`.
    pub fn set_publisher(&self, publisher: Publisher) {
        *self
            .publisher
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(publisher);
    }

    /// Authoritative current value for `reason`, or `None` to let the
    /// generic store answer.
    pub fn read(&self, reason: &str) -> Option<PvValue> {
        let (device, property) = split_reason(reason)?;
        let device = self.devices.iter().find(|d| d.name == device)?;
        device.pv(property).map(Pv::value)
    }

    /// Apply a client write. `true` means accepted — the caller should
    /// also update its generic store.
    pub fn write(&self, reason: &str, value: &PvValue) -> bool {
        let Some((device_name, property)) = split_reason(reason) else {
            return false;
        };
        let Some(device) = self.devices.iter().find(|d| d.name == device_name) else {
            return false;
        };
        let Some(descriptor) = device.db.get(property) else {
            return false;
        };
        if descriptor.read_only {
            warn!(reason, "write to read-only PV rejected");
            return false;
        }
        if !value_matches(descriptor.ty, value) {
            warn!(reason, ?value, "write with wrong value kind rejected");
            return false;
        }
        if let (PvType::Float, Some(v)) = (descriptor.ty, value.as_f64())
            && (v > descriptor.limits.hilim || v < descriptor.limits.lolim)
        {
            warn!(reason, v, "write outside display limits rejected");
            return false;
        }
        if descriptor.ty == PvType::Enum
            && let Some(index) = value.as_enum()
            && usize::from(index) >= descriptor.enums.len()
        {
            warn!(reason, index, "write outside enum range rejected");
            return false;
        }

        let Some(pv) = device.pv(property) else {
            return false;
        };
        pv.put(value)
    }

    /// One bounded scan cycle: poll every device. Called repeatedly by
    /// the hosting main loop; blocking is bounded by the per-exchange
    /// serial timeouts.
    pub fn process(&mut self, interval: Duration) {
        let started = Instant::now();
        for device in &self.devices {
            // Failures already degrade the device's PVs; the scan goes on.
            if let Err(err) = device.controller.poll() {
                debug!(device = %device.name, error = %err, "poll failed");
            }
        }
        self.stats.record(started.elapsed(), interval);
    }

    /// Stop the recomputation queue and log scan statistics.
    pub fn shutdown(&mut self) {
        if let Some(queue) = self.queue.take() {
            queue.stop();
        }
        info!(
            service = %self.service_name,
            cycles = self.stats.cycle_count,
            violations = self.stats.timing_violations,
            avg_us = self.stats.avg_us(),
            max_us = self.stats.max_cycle_time_us,
            "application stopped"
        );
    }

    /// Database dump for `--dump-db`, keyed by device name.
    pub fn dump_db(&self) -> serde_json::Value {
        let mut out = serde_json::Map::new();
        for device in &self.devices {
            let descriptors: Vec<_> = device.db.iter().collect();
            out.insert(
                device.name.clone(),
                serde_json::to_value(descriptors).unwrap_or_default(),
            );
        }
        serde_json::Value::Object(out)
    }
}

/// Split `<device>:<property>`.
fn split_reason(reason: &str) -> Option<(&str, &str)> {
    reason.split_once(':')
}

fn value_matches(ty: PvType, value: &PvValue) -> bool {
    match (ty, value) {
        (PvType::Float, PvValue::Float(_) | PvValue::Int(_)) => true,
        (PvType::Int, PvValue::Int(_)) => true,
        (PvType::Enum, PvValue::Enum(_) | PvValue::Int(_)) => true,
        (PvType::FloatArray, PvValue::FloatArray(_)) => true,
        (PvType::Str, PvValue::Str(_)) => true,
        _ => false,
    }
}

/// Properties served without a device exchange, connected from startup.
const IOC_RESIDENT: &[&str] = &[
    "PwrState-Sel",
    "OpMode-Sel",
    "WfmData-SP",
    "WfmData-RB",
    "IntlkSoftLabels-Cte",
    "IntlkHardLabels-Cte",
    "Version-Cte",
    "Reset-Cmd",
];

#[allow(clippy::too_many_arguments)]
fn build_device(
    config: &FullConfig,
    device_config: &ioc_common::config::DeviceConfig,
    transport: SharedTransport,
    queue: &TaskQueue,
    opmode: &Arc<OpModeTable>,
    tolerances: &Arc<WfmToleranceCache>,
    publisher: &Arc<Mutex<Option<Publisher>>>,
) -> Result<Device, AppError> {
    let name = device_config.name.clone();
    let database = db::device_db(env!("CARGO_PKG_VERSION"), opmode)?;

    // Live handles, one per descriptor, under the full PV name.
    let mut pvs = HashMap::new();
    for descriptor in database.iter() {
        let full_name = format!("{name}:{}", descriptor.name);
        let pv = Pv::new(&full_name, descriptor.initial.clone(), descriptor.limits);
        if IOC_RESIDENT.contains(&descriptor.name.as_str()) {
            pv.set_connected(true);
        }
        // Forward every update to the driver once a publisher is set.
        let slot = Arc::clone(publisher);
        pv.add_value_observer(Arc::new(move |pv_name, value, severity| {
            if let Some(publish) = slot.lock().unwrap_or_else(|e| e.into_inner()).clone() {
                publish(pv_name, value, severity);
            }
        }));
        pvs.insert(descriptor.name.clone(), pv);
    }
    let pv = |property: &str| -> Result<Pv, AppError> {
        pvs.get(property)
            .cloned()
            .ok_or_else(|| AppError::MissingPv(property.to_string()))
    };

    let controller = Arc::new(PsController::new(
        Channel::new(device_config.address, transport),
        device_config.clone(),
        config.ioc.serial.clone(),
        Arc::clone(opmode),
        DevicePvs {
            current_sp: pv("Current-SP")?,
            current_rb: pv("Current-RB")?,
            current_ref: pv("CurrentRef-Mon")?,
            current_mon: pv("Current-Mon")?,
            pwrstate_sts: pv("PwrState-Sts")?,
            opmode_sts: pv("OpMode-Sts")?,
            intlk_soft: pv("IntlkSoft-Mon")?,
            intlk_hard: pv("IntlkHard-Mon")?,
        },
    ));

    install_write_handlers(&pv, &controller)?;

    // DiagCurrentDiff-Mon: monitor minus setpoint, setpoint first.
    let diff = ComputedPv::new(
        &format!("{name}:DiagCurrentDiff-Mon"),
        Arc::new(CurrentDiff),
        queue.handle(),
        vec![pv("Current-SP")?, pv("Current-Mon")?],
    );
    // The diag PV keeps the dedicated difference band from its
    // descriptor; the engine-level limits (copied from the setpoint)
    // stay on the computed PV itself.
    let diag_diff = pv("DiagCurrentDiff-Mon")?;
    diff.add_observer(Arc::new(move |event| {
        if event.severity == Severity::Invalid {
            diag_diff.set_connected(false);
        } else {
            diag_diff.set_connected(true);
            diag_diff.post(event.value.clone());
        }
    }));

    // DiagStatus-Mon: sources wired in the strategy's contract order.
    let status_sources = vec![
        pv("PwrState-Sts")?,
        pv("OpMode-Sel")?,
        pv("OpMode-Sts")?,
        pv("DiagCurrentDiff-Mon")?,
        pv("WfmData-SP")?,
        pv("WfmData-RB")?,
        pv("IntlkSoft-Mon")?,
        pv("IntlkHard-Mon")?,
    ];
    debug_assert_eq!(status_sources.len(), source::COUNT);
    let status_computer = Arc::new(PsStatus::new(
        &device_config.pstype,
        Arc::clone(opmode),
        Arc::clone(tolerances),
    ));
    let status = ComputedPv::new(
        &format!("{name}:DiagStatus-Mon"),
        status_computer as Arc<dyn Computer>,
        queue.handle(),
        status_sources,
    );
    let diag_status = pv("DiagStatus-Mon")?;
    status.add_observer(Arc::new(move |event| {
        if event.severity == Severity::Invalid {
            diag_status.set_connected(false);
        } else {
            diag_status.set_connected(true);
            diag_status.post(event.value.clone());
        }
    }));

    debug!(device = %name, pvs = database.len(), "device wired");
    Ok(Device {
        name,
        controller,
        pvs,
        db: database,
        _diff: diff,
        _status: status,
    })
}

/// Route writable PVs to the controller through their handles.
fn install_write_handlers(
    pv: &dyn Fn(&str) -> Result<Pv, AppError>,
    controller: &Arc<PsController>,
) -> Result<(), AppError> {
    let ctl = Arc::clone(controller);
    pv("Current-SP")?.set_write_handler(Arc::new(move |value| {
        value
            .as_f64()
            .is_some_and(|v| ctl.set_current(v).is_ok())
    }));

    let ctl = Arc::clone(controller);
    let sel_echo = pv("PwrState-Sel")?;
    pv("PwrState-Sel")?.set_write_handler(Arc::new(move |value| {
        let Some(index) = value.as_enum() else {
            return false;
        };
        if ctl.set_pwrstate(index == 1).is_err() {
            return false;
        }
        sel_echo.post(PvValue::Enum(index));
        true
    }));

    let ctl = Arc::clone(controller);
    let sel_echo = pv("OpMode-Sel")?;
    pv("OpMode-Sel")?.set_write_handler(Arc::new(move |value| {
        let Some(index) = value.as_enum() else {
            return false;
        };
        if ctl.select_op_mode(index).is_err() {
            return false;
        }
        sel_echo.post(PvValue::Enum(index));
        true
    }));

    // The firmware model carries no curve transfer; the ramp table is
    // IOC-resident and echoed to its readback.
    let sp_echo = pv("WfmData-SP")?;
    let rb_echo = pv("WfmData-RB")?;
    pv("WfmData-SP")?.set_write_handler(Arc::new(move |value| {
        let Some(points) = value.as_array() else {
            return false;
        };
        if points.len() != db::WFM_POINTS {
            return false;
        }
        sp_echo.post(value.clone());
        rb_echo.post(value.clone());
        true
    }));

    let ctl = Arc::clone(controller);
    let counter = pv("Reset-Cmd")?;
    pv("Reset-Cmd")?.set_write_handler(Arc::new(move |_value| {
        if ctl.reset_interlocks().is_err() {
            return false;
        }
        let executed = counter
            .value()
            .as_f64()
            .map_or(1, |count| count as i64 + 1);
        counter.post(PvValue::Int(executed));
        true
    }));

    Ok(())
}

//! BSMP device controller.
//!
//! Owns the channel to one power supply and the low-level PV handles it
//! feeds. One poll cycle reads the standard variable group and posts
//! every value; writes map to execute-function exchanges. The protocol
//! engine never retries — bounded retry with a fixed backoff lives
//! here, and a device that exhausts its retries is marked disconnected
//! for the cycle and re-probed on the next one.

use std::sync::Arc;
use std::time::Duration;

use ioc_bsmp::{BsmpError, Channel, Message, command};
use ioc_common::config::{DeviceConfig, SerialConfig};
use ioc_common::csdev::OpModeTable;
use ioc_common::pv::PvValue;
use ioc_compute::Pv;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::vars;
use crate::vars::GroupReading;

/// Controller-level errors.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Exchange failed after every retry.
    #[error("device '{device}': {source}")]
    Exchange {
        device: String,
        #[source]
        source: BsmpError,
    },

    /// The device answered with an unexpected opcode.
    #[error("device '{device}': unexpected reply command {command:#04x}")]
    UnexpectedReply { device: String, command: u8 },

    /// The device rejected the command.
    #[error("device '{device}': rejected with {error:?}")]
    Rejected {
        device: String,
        error: command::CmdError,
    },

    /// A structurally valid reply carried a malformed payload.
    #[error("device '{device}': {source}")]
    BadPayload {
        device: String,
        #[source]
        source: vars::BadGroupPayload,
    },

    /// The requested operating mode does not exist in the table.
    #[error("device '{device}': unknown OpMode-Sel index {index}")]
    UnknownOpMode { device: String, index: u16 },
}

/// Low-level PV handles fed by one controller.
#[derive(Clone)]
pub struct DevicePvs {
    pub current_sp: Pv,
    pub current_rb: Pv,
    pub current_ref: Pv,
    pub current_mon: Pv,
    pub pwrstate_sts: Pv,
    pub opmode_sts: Pv,
    pub intlk_soft: Pv,
    pub intlk_hard: Pv,
}

impl DevicePvs {
    fn all(&self) -> [&Pv; 8] {
        [
            &self.current_sp,
            &self.current_rb,
            &self.current_ref,
            &self.current_mon,
            &self.pwrstate_sts,
            &self.opmode_sts,
            &self.intlk_soft,
            &self.intlk_hard,
        ]
    }
}

/// Master-side controller for one power supply.
pub struct PsController {
    channel: Channel,
    device: DeviceConfig,
    serial: SerialConfig,
    opmode: Arc<OpModeTable>,
    pvs: DevicePvs,
    /// Last known communication state, to log transitions once.
    comm_ok: std::sync::atomic::AtomicBool,
}

impl PsController {
    pub fn new(
        channel: Channel,
        device: DeviceConfig,
        serial: SerialConfig,
        opmode: Arc<OpModeTable>,
        pvs: DevicePvs,
    ) -> Self {
        info!(
            device = %device.name,
            address = device.address,
            pstype = %device.pstype,
            "controller created"
        );
        Self {
            channel,
            device,
            serial,
            opmode,
            pvs,
            comm_ok: std::sync::atomic::AtomicBool::new(false),
        }
    }

    fn timeout(&self) -> Duration {
        Duration::from_millis(self.serial.timeout_ms)
    }

    /// One request/response exchange with bounded retry.
    ///
    /// Recoverable failures (silence, corrupted or truncated replies)
    /// are retried with a fixed backoff; transport I/O errors are not.
    fn exchange(&self, message: Message) -> Result<Message, ControllerError> {
        let mut attempt = 0;
        loop {
            match self.channel.request(message.clone(), self.timeout()) {
                Ok(reply) => return Ok(reply),
                Err(err) if attempt < self.serial.retries && is_recoverable(&err) => {
                    attempt += 1;
                    debug!(
                        device = %self.device.name,
                        attempt,
                        error = %err,
                        "exchange failed; retrying"
                    );
                    std::thread::sleep(Duration::from_millis(self.serial.retry_backoff_ms));
                }
                Err(err) => {
                    return Err(ControllerError::Exchange {
                        device: self.device.name.clone(),
                        source: err,
                    });
                }
            }
        }
    }

    /// Exchange expecting a specific reply opcode; error-family replies
    /// surface as rejections.
    fn exchange_expect(&self, message: Message, expected: u8) -> Result<Message, ControllerError> {
        let reply = self.exchange(message)?;
        if let Some(error) = command::CmdError::from_command(reply.command()) {
            return Err(ControllerError::Rejected {
                device: self.device.name.clone(),
                error,
            });
        }
        if reply.command() != expected {
            return Err(ControllerError::UnexpectedReply {
                device: self.device.name.clone(),
                command: reply.command(),
            });
        }
        Ok(reply)
    }

    /// Read the standard variable group and post every PV.
    ///
    /// On failure the device's PVs are marked disconnected; they
    /// reconnect on the next successful poll.
    pub fn poll(&self) -> Result<(), ControllerError> {
        let reading = match self
            .exchange_expect(command::read_group(vars::GROUP_ALL), command::GROUP_REPLY)
        {
            Ok(reply) => GroupReading::decode(reply.payload()).map_err(|source| {
                ControllerError::BadPayload {
                    device: self.device.name.clone(),
                    source,
                }
            }),
            Err(err) => Err(err),
        };

        match reading {
            Ok(reading) => {
                self.mark_connected();
                self.publish(&reading);
                Ok(())
            }
            Err(err) => {
                self.mark_disconnected(&err);
                Err(err)
            }
        }
    }

    fn publish(&self, reading: &GroupReading) {
        let setpoint = f64::from(reading.setpoint);
        self.pvs.current_sp.post(PvValue::Float(setpoint));
        self.pvs.current_rb.post(PvValue::Float(setpoint));
        self.pvs
            .current_ref
            .post(PvValue::Float(f64::from(reading.reference)));
        self.pvs
            .current_mon
            .post(PvValue::Float(f64::from(reading.load_current)));
        self.pvs
            .pwrstate_sts
            .post(PvValue::Enum(reading.status.pwrstate()));
        self.pvs
            .opmode_sts
            .post(PvValue::Enum(reading.status.state()));
        self.pvs
            .intlk_soft
            .post(PvValue::Int(i64::from(reading.soft_interlock)));
        self.pvs
            .intlk_hard
            .post(PvValue::Int(i64::from(reading.hard_interlock)));
    }

    fn mark_connected(&self) {
        use std::sync::atomic::Ordering;
        if !self.comm_ok.swap(true, Ordering::SeqCst) {
            info!(
                device = %self.device.name,
                bytes = self.channel.bytes_transferred(),
                "communication established"
            );
        }
        for pv in self.pvs.all() {
            pv.set_connected(true);
        }
    }

    fn mark_disconnected(&self, err: &ControllerError) {
        use std::sync::atomic::Ordering;
        if self.comm_ok.swap(false, Ordering::SeqCst) {
            warn!(device = %self.device.name, error = %err, "communication lost");
        }
        for pv in self.pvs.all() {
            pv.set_connected(false);
        }
    }

    // ── Commands ────────────────────────────────────────────────────

    /// Set the SlowRef current setpoint.
    pub fn set_current(&self, value: f64) -> Result<(), ControllerError> {
        let input = (value as f32).to_le_bytes();
        self.exchange_expect(
            command::execute_function(vars::func::SET_SLOWREF, &input),
            command::FUNCTION_REPLY,
        )?;
        debug!(device = %self.device.name, value, "setpoint applied");
        Ok(())
    }

    /// Power the supply on or off.
    pub fn set_pwrstate(&self, on: bool) -> Result<(), ControllerError> {
        let func = if on {
            vars::func::TURN_ON
        } else {
            vars::func::TURN_OFF
        };
        self.exchange_expect(
            command::execute_function(func, &[]),
            command::FUNCTION_REPLY,
        )?;
        info!(device = %self.device.name, on, "power state command");
        Ok(())
    }

    /// Select an operating mode by `OpMode-Sel` index; translated to
    /// the status-space index the firmware expects.
    pub fn select_op_mode(&self, sel: u16) -> Result<(), ControllerError> {
        let sts = self
            .opmode
            .expected_sts(sel)
            .ok_or_else(|| ControllerError::UnknownOpMode {
                device: self.device.name.clone(),
                index: sel,
            })?;
        self.exchange_expect(
            command::execute_function(vars::func::SELECT_OP_MODE, &sts.to_le_bytes()),
            command::FUNCTION_REPLY,
        )?;
        info!(device = %self.device.name, sel, sts, "operating mode selected");
        Ok(())
    }

    /// Clear latched interlocks.
    pub fn reset_interlocks(&self) -> Result<(), ControllerError> {
        self.exchange_expect(
            command::execute_function(vars::func::RESET_INTERLOCKS, &[]),
            command::FUNCTION_REPLY,
        )?;
        info!(device = %self.device.name, "interlocks reset");
        Ok(())
    }
}

/// Retry silence, corruption and mid-frame timeouts; give up
/// immediately on transport I/O failures.
fn is_recoverable(err: &BsmpError) -> bool {
    match err {
        BsmpError::SerialCommunication { .. } => true,
        BsmpError::Frame(_) => true,
        BsmpError::Transport(ioc_bsmp::TransportError::Timeout(_)) => true,
        BsmpError::Transport(_) => false,
    }
}

//! Simulated BSMP slave bus for development and tests.
//!
//! Implements the slave side of the protocol behind the
//! [`SerialTransport`] seam: each written frame is validated and
//! answered the way a controller firmware would, including a first-order
//! load-current response toward the applied reference. Faults can be
//! injected per reply (dropped, corrupted) and interlocks raised
//! directly, so the controller's retry and degradation paths are
//! exercisable without hardware.
//!
//! [`SimBus`] is a cheap clone over shared state: one clone goes behind
//! the transport mutex, others stay with the composition root (or a
//! test) for fault injection.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use ioc_bsmp::error::TransportError;
use ioc_bsmp::transport::SerialTransport;
use ioc_bsmp::{Message, Package, command};
use tracing::{debug, trace};

use crate::vars;
use crate::vars::{GroupReading, PsStatusReg};

/// Fraction of the remaining reference error the load closes per scan.
const LOAD_ALPHA: f32 = 0.5;

/// Simulated slave device state.
#[derive(Debug, Clone)]
struct SimSlave {
    /// State index in `OpMode-Sts` space (low nibble of the status word).
    state: u16,
    setpoint: f32,
    reference: f32,
    load_current: f32,
    soft_interlock: u32,
    hard_interlock: u32,
}

impl Default for SimSlave {
    fn default() -> Self {
        Self {
            state: 0,
            setpoint: 0.0,
            reference: 0.0,
            load_current: 0.0,
            soft_interlock: 0,
            hard_interlock: 0,
        }
    }
}

impl SimSlave {
    /// One scan tick of the load dynamics.
    fn step(&mut self) {
        if self.state <= 2 {
            // Not delivering current: the load decays toward zero.
            self.load_current += LOAD_ALPHA * (0.0 - self.load_current);
        } else {
            self.load_current += LOAD_ALPHA * (self.reference - self.load_current);
        }
    }

    /// Trip into the interlock state.
    fn trip(&mut self) {
        self.state = 1;
        self.reference = 0.0;
    }

    fn reading(&self) -> GroupReading {
        GroupReading {
            status: PsStatusReg::from_state(self.state),
            setpoint: self.setpoint,
            reference: self.reference,
            soft_interlock: self.soft_interlock,
            hard_interlock: self.hard_interlock,
            load_current: self.load_current,
        }
    }

    fn read_variable(&self, var_id: u8) -> Option<Vec<u8>> {
        match var_id {
            vars::STATUS => Some(PsStatusReg::from_state(self.state).0.to_le_bytes().to_vec()),
            vars::SETPOINT => Some(self.setpoint.to_le_bytes().to_vec()),
            vars::REFERENCE => Some(self.reference.to_le_bytes().to_vec()),
            vars::SOFT_INTERLOCK => Some(self.soft_interlock.to_le_bytes().to_vec()),
            vars::HARD_INTERLOCK => Some(self.hard_interlock.to_le_bytes().to_vec()),
            vars::LOAD_CURRENT => Some(self.load_current.to_le_bytes().to_vec()),
            _ => None,
        }
    }

    /// Slave-side command dispatch.
    fn handle(&mut self, message: &Message) -> Message {
        match message.command() {
            command::READ_GROUP => {
                if message.payload() != [vars::GROUP_ALL] {
                    return error_reply(command::CmdError::InvalidId);
                }
                self.step();
                reply(command::GROUP_REPLY, self.reading().encode())
            }
            command::READ_VARIABLE => {
                let [var_id] = message.payload() else {
                    return error_reply(command::CmdError::InvalidPayloadSize);
                };
                match self.read_variable(*var_id) {
                    Some(value) => reply(command::VARIABLE_REPLY, value),
                    None => error_reply(command::CmdError::InvalidId),
                }
            }
            // Every variable served here is firmware-owned.
            command::WRITE_VARIABLE => error_reply(command::CmdError::ReadOnly),
            command::EXECUTE_FUNCTION => self.execute(message.payload()),
            _ => error_reply(command::CmdError::OperationNotSupported),
        }
    }

    fn execute(&mut self, payload: &[u8]) -> Message {
        let Some((&func_id, input)) = payload.split_first() else {
            return error_reply(command::CmdError::InvalidPayloadSize);
        };
        match (func_id, input) {
            (vars::func::TURN_ON, []) => {
                if self.soft_interlock != 0 || self.hard_interlock != 0 {
                    self.trip();
                } else if self.state <= 2 {
                    self.state = 3; // SlowRef
                }
                function_ok()
            }
            (vars::func::TURN_OFF, []) => {
                self.state = 0;
                self.reference = 0.0;
                function_ok()
            }
            (vars::func::SELECT_OP_MODE, [lo, hi]) => {
                let sts = u16::from_le_bytes([*lo, *hi]);
                if !(3..=8).contains(&sts) {
                    return error_reply(command::CmdError::InvalidValue);
                }
                if self.state <= 2 {
                    return error_reply(command::CmdError::Busy);
                }
                self.state = sts;
                function_ok()
            }
            (vars::func::RESET_INTERLOCKS, []) => {
                self.soft_interlock = 0;
                self.hard_interlock = 0;
                if self.state == 1 {
                    self.state = 0;
                }
                function_ok()
            }
            (vars::func::SET_SLOWREF, [a, b, c, d]) => {
                if self.state <= 2 {
                    return error_reply(command::CmdError::Busy);
                }
                let value = f32::from_le_bytes([*a, *b, *c, *d]);
                self.setpoint = value;
                self.reference = value;
                function_ok()
            }
            _ => error_reply(command::CmdError::InvalidValue),
        }
    }
}

fn reply(command: u8, payload: Vec<u8>) -> Message {
    // Slave replies are bounded well below the length-field limit.
    Message::new(command, payload).unwrap_or_else(|e| unreachable!("reply framing: {e}"))
}

fn function_ok() -> Message {
    reply(command::FUNCTION_REPLY, vec![0])
}

fn error_reply(err: command::CmdError) -> Message {
    reply(err as u8, Vec::new())
}

struct BusState {
    slaves: HashMap<u8, SimSlave>,
    pending: Option<Vec<u8>>,
    drop_replies: u32,
    corrupt_replies: u32,
}

/// A bus of simulated slaves behind one transport. Clones share state.
#[derive(Clone)]
pub struct SimBus {
    state: Arc<Mutex<BusState>>,
}

impl SimBus {
    /// Create a bus with one powered-off slave per address.
    pub fn new(addresses: &[u8]) -> Self {
        Self {
            state: Arc::new(Mutex::new(BusState {
                slaves: addresses
                    .iter()
                    .map(|&address| (address, SimSlave::default()))
                    .collect(),
                pending: None,
                drop_replies: 0,
                corrupt_replies: 0,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Swallow the next `count` replies (the master sees silence).
    pub fn drop_replies(&self, count: u32) {
        self.lock().drop_replies = count;
    }

    /// Corrupt the checksum of the next `count` replies.
    pub fn corrupt_replies(&self, count: u32) {
        self.lock().corrupt_replies = count;
    }

    /// Raise hard interlock bits on a device and trip it.
    pub fn raise_hard_interlock(&self, address: u8, bits: u32) {
        let mut state = self.lock();
        if let Some(slave) = state.slaves.get_mut(&address) {
            slave.hard_interlock |= bits;
            slave.trip();
        }
    }

    /// Direct view of a slave's measured current, for assertions.
    pub fn load_current(&self, address: u8) -> Option<f32> {
        self.lock().slaves.get(&address).map(|s| s.load_current)
    }
}

impl SerialTransport for SimBus {
    fn write(&mut self, frame: &[u8], _timeout: Duration) -> Result<(), TransportError> {
        let mut state = self.lock();

        // A real slave ignores anything that does not parse or verify.
        let Ok(package) = Package::checked_parse(frame) else {
            debug!("simulated slave dropped malformed frame");
            state.pending = None;
            return Ok(());
        };
        let address = package.address();
        let reply = match state.slaves.get_mut(&address) {
            Some(slave) => slave.handle(package.message()),
            None => {
                trace!(address, "no slave at address");
                state.pending = None;
                return Ok(());
            }
        };
        let mut reply_frame = Package::new(address, reply).stream();

        if state.drop_replies > 0 {
            state.drop_replies -= 1;
            state.pending = None;
            return Ok(());
        }
        if state.corrupt_replies > 0 {
            state.corrupt_replies -= 1;
            let last = reply_frame.len() - 1;
            reply_frame[last] ^= 0xFF;
        }
        state.pending = Some(reply_frame);
        Ok(())
    }

    fn read(&mut self, _timeout: Duration) -> Result<Vec<u8>, TransportError> {
        Ok(self.lock().pending.take().unwrap_or_default())
    }
}

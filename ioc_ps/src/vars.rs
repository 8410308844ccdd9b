//! Device variable/function numbering and payload codecs.
//!
//! Variable and function ids follow the controller firmware's entity
//! table. All multi-byte values are little-endian on the wire.

use thiserror::Error;

// ─── Variable Ids ───────────────────────────────────────────────────

/// Status word (u16).
pub const STATUS: u8 = 0;
/// Accepted current setpoint (f32, A).
pub const SETPOINT: u8 = 1;
/// Reference currently applied by the control loop (f32, A).
pub const REFERENCE: u8 = 2;
/// Soft interlock word (u32).
pub const SOFT_INTERLOCK: u8 = 25;
/// Hard interlock word (u32).
pub const HARD_INTERLOCK: u8 = 26;
/// Measured load current (f32, A).
pub const LOAD_CURRENT: u8 = 27;

/// Pre-defined group holding every variable above, in id order.
pub const GROUP_ALL: u8 = 3;

// ─── Function Ids ───────────────────────────────────────────────────

pub mod func {
    /// Power the supply on; lands in SlowRef when no interlock is up.
    pub const TURN_ON: u8 = 0;
    /// Power the supply off.
    pub const TURN_OFF: u8 = 1;
    /// Select operating mode; input is a u16 status-space index.
    pub const SELECT_OP_MODE: u8 = 4;
    /// Clear latched interlock words.
    pub const RESET_INTERLOCKS: u8 = 6;
    /// Set the SlowRef current setpoint; input is an f32 in ampere.
    pub const SET_SLOWREF: u8 = 16;
}

// ─── Status Word ────────────────────────────────────────────────────

/// Controller status word: the low nibble carries the state index in
/// `OpMode-Sts` space; higher bits are loop/interface flags this IOC
/// does not consume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PsStatusReg(pub u16);

impl PsStatusReg {
    const STATE_MASK: u16 = 0x000F;

    /// State index in `OpMode-Sts` space.
    #[inline]
    pub fn state(&self) -> u16 {
        self.0 & Self::STATE_MASK
    }

    /// Build a status word from a state index.
    #[inline]
    pub fn from_state(state: u16) -> Self {
        Self(state & Self::STATE_MASK)
    }

    /// `PwrState-Sts` index derived from the state: Off for the off and
    /// interlock states, Initializing while booting, otherwise On.
    pub fn pwrstate(&self) -> u16 {
        match self.state() {
            0 | 1 => 0,
            2 => 2,
            _ => 1,
        }
    }
}

// ─── Group Reading ──────────────────────────────────────────────────

/// Payload decoding error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("group reading payload of {len} bytes, expected {expected}")]
pub struct BadGroupPayload {
    pub len: usize,
    pub expected: usize,
}

/// One full scan of the standard variable group.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GroupReading {
    pub status: PsStatusReg,
    pub setpoint: f32,
    pub reference: f32,
    pub soft_interlock: u32,
    pub hard_interlock: u32,
    pub load_current: f32,
}

impl GroupReading {
    /// Serialized size: u16 + f32 + f32 + u32 + u32 + f32.
    pub const WIRE_SIZE: usize = 22;

    /// Decode a `GROUP_ALL` reply payload.
    pub fn decode(payload: &[u8]) -> Result<Self, BadGroupPayload> {
        if payload.len() != Self::WIRE_SIZE {
            return Err(BadGroupPayload {
                len: payload.len(),
                expected: Self::WIRE_SIZE,
            });
        }
        Ok(Self {
            status: PsStatusReg(u16::from_le_bytes([payload[0], payload[1]])),
            setpoint: f32::from_le_bytes([payload[2], payload[3], payload[4], payload[5]]),
            reference: f32::from_le_bytes([payload[6], payload[7], payload[8], payload[9]]),
            soft_interlock: u32::from_le_bytes([
                payload[10],
                payload[11],
                payload[12],
                payload[13],
            ]),
            hard_interlock: u32::from_le_bytes([
                payload[14],
                payload[15],
                payload[16],
                payload[17],
            ]),
            load_current: f32::from_le_bytes([
                payload[18],
                payload[19],
                payload[20],
                payload[21],
            ]),
        })
    }

    /// Encode for the slave side of the exchange.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::WIRE_SIZE);
        out.extend_from_slice(&self.status.0.to_le_bytes());
        out.extend_from_slice(&self.setpoint.to_le_bytes());
        out.extend_from_slice(&self.reference.to_le_bytes());
        out.extend_from_slice(&self.soft_interlock.to_le_bytes());
        out.extend_from_slice(&self.hard_interlock.to_le_bytes());
        out.extend_from_slice(&self.load_current.to_le_bytes());
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_reading_codec_round_trip() {
        let reading = GroupReading {
            status: PsStatusReg::from_state(3),
            setpoint: 1.25,
            reference: 1.25,
            soft_interlock: 0,
            hard_interlock: 0x20,
            load_current: 1.2499,
        };
        let decoded = GroupReading::decode(&reading.encode()).unwrap();
        assert_eq!(decoded, reading);
    }

    #[test]
    fn short_payload_rejected() {
        let err = GroupReading::decode(&[0u8; 10]).unwrap_err();
        assert_eq!(err.expected, GroupReading::WIRE_SIZE);
    }

    #[test]
    fn pwrstate_derivation() {
        assert_eq!(PsStatusReg::from_state(0).pwrstate(), 0); // Off
        assert_eq!(PsStatusReg::from_state(1).pwrstate(), 0); // Interlock
        assert_eq!(PsStatusReg::from_state(2).pwrstate(), 2); // Initializing
        assert_eq!(PsStatusReg::from_state(3).pwrstate(), 1); // SlowRef
        assert_eq!(PsStatusReg::from_state(6).pwrstate(), 1); // RmpWfm
    }
}

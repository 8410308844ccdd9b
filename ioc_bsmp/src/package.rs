//! Addressed, checksummed frame around a message.
//!
//! A package is what actually travels on the bus: device address,
//! embedded message and a mod-256 checksum. Structural parsing does
//! **not** validate the checksum — receivers must call
//! [`Package::verify_checksum`] (or [`Package::checked_parse`]) on any
//! stream read from the wire.

use crate::error::FrameError;
use crate::message::Message;
use crate::{MESSAGE_HEADER, MIN_PACKAGE_STREAM};

/// A message plus addressing and integrity metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Package {
    address: u8,
    message: Message,
    checksum: u8,
}

impl Package {
    /// Construct a package for transmission, computing the checksum
    /// eagerly.
    pub fn new(address: u8, message: Message) -> Self {
        let mut bytes = Vec::with_capacity(1 + message.len());
        bytes.push(address);
        bytes.extend_from_slice(&message.stream());
        let checksum = Self::calc_checksum(&bytes);
        Self {
            address,
            message,
            checksum,
        }
    }

    /// Parse a received stream into address, embedded message and
    /// checksum. The checksum is captured but not validated here.
    ///
    /// # Errors
    ///
    /// - [`FrameError::ShortPackage`] if fewer than
    ///   [`MIN_PACKAGE_STREAM`] bytes are present.
    /// - [`FrameError::LengthMismatch`] if the total frame size disagrees
    ///   with the declared payload length.
    pub fn parse(stream: &[u8]) -> Result<Self, FrameError> {
        if stream.len() < MIN_PACKAGE_STREAM {
            return Err(FrameError::ShortPackage { len: stream.len() });
        }
        let message = Message::parse(&stream[1..])?;
        let expected_len = 1 + MESSAGE_HEADER + message.payload().len() + 1;
        if stream.len() != expected_len {
            return Err(FrameError::LengthMismatch {
                declared: message.payload().len(),
                actual: stream.len(),
            });
        }
        Ok(Self {
            address: stream[0],
            checksum: stream[expected_len - 1],
            message,
        })
    }

    /// Parse and validate in one step, as receivers should.
    ///
    /// # Errors
    ///
    /// Everything [`Package::parse`] raises, plus
    /// [`FrameError::ChecksumMismatch`] when the checksum law fails.
    pub fn checked_parse(stream: &[u8]) -> Result<Self, FrameError> {
        let package = Self::parse(stream)?;
        if !Self::verify_checksum(stream) {
            let expected = Self::calc_checksum(&stream[..stream.len() - 1]);
            return Err(FrameError::ChecksumMismatch {
                received: package.checksum,
                expected,
            });
        }
        Ok(package)
    }

    /// Checksum over a frame missing its final checksum byte:
    /// `(256 - sum(bytes) % 256) % 256`.
    pub fn calc_checksum(stream_without_checksum: &[u8]) -> u8 {
        let sum: u8 = stream_without_checksum
            .iter()
            .fold(0u8, |acc, b| acc.wrapping_add(*b));
        sum.wrapping_neg()
    }

    /// True iff the sum of all bytes in the full frame, checksum
    /// included, is congruent to 0 modulo 256.
    pub fn verify_checksum(full_stream: &[u8]) -> bool {
        full_stream.iter().fold(0u8, |acc, b| acc.wrapping_add(*b)) == 0
    }

    /// Device address on the bus.
    #[inline]
    pub fn address(&self) -> u8 {
        self.address
    }

    /// The embedded message.
    #[inline]
    pub fn message(&self) -> &Message {
        &self.message
    }

    /// Consume the package, yielding the embedded message.
    #[inline]
    pub fn into_message(self) -> Message {
        self.message
    }

    /// The frame checksum byte.
    #[inline]
    pub fn checksum(&self) -> u8 {
        self.checksum
    }

    /// Serialize the full frame. `parse` is the exact inverse on valid
    /// frames.
    pub fn stream(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + self.message.len() + 1);
        out.push(self.address);
        out.extend_from_slice(&self.message.stream());
        out.push(self.checksum);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn package(address: u8, command: u8, payload: &[u8]) -> Package {
        Package::new(address, Message::new(command, payload.to_vec()).unwrap())
    }

    #[test]
    fn reference_vectors() {
        let p = package(1, 0x10, &[3]);
        assert_eq!(p.stream(), vec![0x01, 0x10, 0x00, 0x01, 0x03, 235]);
        assert_eq!(p.checksum(), 235);

        let p = package(0, 0x11, &[3, 255, 255]);
        assert_eq!(p.checksum(), 235);

        let p = package(2, 0x20, &[4, 1, 187, 187]);
        assert_eq!(p.checksum(), 95);
    }

    #[test]
    fn checksum_round_trip() {
        let cases: &[(u8, u8, Vec<u8>)] = &[
            (0, 0x00, vec![]),
            (1, 0x10, vec![3]),
            (5, 0x12, vec![0; 64]),
            (255, 0x50, vec![0xFF; 17]),
            (32, 0x20, (0..=255).collect()),
        ];
        for (address, command, payload) in cases {
            let p = package(*address, *command, payload);
            assert!(
                Package::verify_checksum(&p.stream()),
                "round trip failed for address={address} command={command:#04x}"
            );
        }
    }

    #[test]
    fn checksum_detects_any_single_byte_flip() {
        let stream = package(2, 0x20, &[4, 1, 187, 187]).stream();
        for idx in 0..stream.len() {
            for bit in 0..8 {
                let mut corrupted = stream.clone();
                corrupted[idx] ^= 1 << bit;
                assert!(
                    !Package::verify_checksum(&corrupted),
                    "flip of bit {bit} in byte {idx} went undetected"
                );
            }
        }
    }

    #[test]
    fn rejects_short_streams() {
        for len in 0..MIN_PACKAGE_STREAM {
            let stream = vec![0u8; len];
            assert!(matches!(
                Package::parse(&stream),
                Err(FrameError::ShortPackage { len: l }) if l == len
            ));
        }
    }

    #[test]
    fn parse_is_inverse_of_stream() {
        let original = package(17, 0x12, &[1, 2, 3, 4, 5]);
        let stream = original.stream();
        let parsed = Package::parse(&stream).unwrap();
        assert_eq!(parsed, original);
        assert_eq!(parsed.stream(), stream);
    }

    #[test]
    fn parse_rejects_trailing_garbage() {
        let mut stream = package(1, 0x10, &[3]).stream();
        stream.push(0x00);
        assert!(matches!(
            Package::parse(&stream),
            Err(FrameError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn checked_parse_flags_corruption() {
        let mut stream = package(1, 0x10, &[3]).stream();
        stream[4] ^= 0x01;
        let err = Package::checked_parse(&stream).unwrap_err();
        assert!(matches!(err, FrameError::ChecksumMismatch { .. }));
    }

    #[test]
    fn structural_parse_does_not_validate() {
        let mut stream = package(1, 0x10, &[3]).stream();
        stream[4] ^= 0x01;
        // Plain parse captures the (wrong) checksum without complaint.
        assert!(Package::parse(&stream).is_ok());
    }
}

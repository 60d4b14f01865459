// Public-Key Crypto Accelerator (PKC) Rust Driver
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Command words and protocol identifiers.
//!
//! The accelerator's job language is a sequence of 32-bit command words.
//! The command type lives in bits [31:27]; the remaining bits are
//! command-specific. Public-key jobs use a single `OPERATION` word naming a
//! protocol; signing additionally drives the FIFOs directly.

use bitflags::bitflags;

/// Shift of the command-type field.
pub const CMD_SHIFT: u32 = 27;

pub const CMD_FIFO_LOAD: u32 = 0x04 << CMD_SHIFT;
pub const CMD_FIFO_STORE: u32 = 0x0c << CMD_SHIFT;
pub const CMD_MOVE: u32 = 0x0f << CMD_SHIFT;
pub const CMD_OPERATION: u32 = 0x10 << CMD_SHIFT;
pub const CMD_JUMP: u32 = 0x14 << CMD_SHIFT;
pub const CMD_DESC_HDR: u32 = 0x16 << CMD_SHIFT;

/// Mask selecting the command-type field.
pub const CMD_MASK: u32 = 0x1f << CMD_SHIFT;

// Header word
pub const HDR_ONE: u32 = 1 << 23;
pub const HDR_START_IDX_SHIFT: u32 = 16;
pub const HDR_START_IDX_MASK: u32 = 0x3f << HDR_START_IDX_SHIFT;
pub const HDR_DESCLEN_MASK: u32 = 0x7f;

// Operation word
pub const OP_TYPE_UNI_PROTOCOL: u32 = 0x00 << 24;
pub const OP_PCLID_SHIFT: u32 = 16;
pub const OP_PCLID_MASK: u32 = 0xff << OP_PCLID_SHIFT;
pub const OP_PCLINFO_MASK: u32 = 0xffff;

// Move
pub const MOVE_SRC_INFIFO: u32 = 0x08 << 12;
pub const MOVE_DEST_OUTFIFO: u32 = 0x02 << 16;

// Jump
pub const JUMP_JSL: u32 = 1 << 24;
pub const JUMP_COND_NOP: u32 = (0x02 << 8) | JUMP_JSL;

// FIFO load / store
pub const FIFOLD_CLASS_CLASS1: u32 = 0x01 << 25;
pub const FIFOLD_TYPE_PK_TYPEMASK: u32 = 0x0f << 16;
pub const FIFOST_CONT: u32 = 1 << 23;
pub const FIFOST_TYPE_MESSAGE_DATA: u32 = 0x30 << 16;

/// Length field of move, FIFO load and FIFO store words.
pub const CMD_LENGTH_MASK: u32 = 0xffff;

bitflags! {
    /// Protocol info bits of an ECC-capable operation word.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ProtocolFlags: u32 {
        /// Operands are over a binary field GF(2^m).
        const F2M = 0x0001;
        /// Operands are elliptic-curve points.
        const ECC = 0x0002;
    }
}

/// Protocol identifiers carried in an `OPERATION` word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ProtocolId {
    /// Generate a key pair.
    PublicKeyPair = 0x14,

    /// DSA/ECDSA signature generation.
    DsaSign = 0x15,

    /// DSA/ECDSA signature verification.
    DsaVerify = 0x16,

    /// Diffie-Hellman shared secret.
    Dh = 0x17,

    /// RSA public-key operation.
    RsaEncrypt = 0x18,

    /// RSA private-key operation.
    RsaDecrypt = 0x19,
}

impl ProtocolId {
    #[inline]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x14 => Some(Self::PublicKeyPair),
            0x15 => Some(Self::DsaSign),
            0x16 => Some(Self::DsaVerify),
            0x17 => Some(Self::Dh),
            0x18 => Some(Self::RsaEncrypt),
            0x19 => Some(Self::RsaDecrypt),
            _ => None,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::PublicKeyPair => "PUBLICKEYPAIR",
            Self::DsaSign => "DSASIGN",
            Self::DsaVerify => "DSAVERIFY",
            Self::Dh => "DH",
            Self::RsaEncrypt => "RSAENCRYPT",
            Self::RsaDecrypt => "RSADECRYPT",
        }
    }

    /// Encode an `OPERATION` word for this protocol.
    ///
    /// `info` lands in the protocol-info field; for ECC-capable protocols it
    /// carries [`ProtocolFlags`], for RSA decrypt the private-key form.
    #[inline]
    pub const fn operation(self, info: u32) -> u32 {
        CMD_OPERATION
            | OP_TYPE_UNI_PROTOCOL
            | ((self as u32) << OP_PCLID_SHIFT)
            | (info & OP_PCLINFO_MASK)
    }
}

impl std::fmt::Display for ProtocolId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({:#04x})", self.name(), self.as_u8())
    }
}

/// Command type of a word, as its raw 5-bit value shifted into place.
#[inline]
pub const fn command_type(word: u32) -> u32 {
    word & CMD_MASK
}

/// Protocol id of an `OPERATION` word.
pub fn operation_protocol(word: u32) -> Option<ProtocolId> {
    if command_type(word) != CMD_OPERATION {
        return None;
    }
    ProtocolId::from_u8(((word & OP_PCLID_MASK) >> OP_PCLID_SHIFT) as u8)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_values() {
        assert_eq!(ProtocolId::PublicKeyPair.as_u8(), 0x14);
        assert_eq!(ProtocolId::DsaSign.as_u8(), 0x15);
        assert_eq!(ProtocolId::DsaVerify.as_u8(), 0x16);
        assert_eq!(ProtocolId::Dh.as_u8(), 0x17);
        assert_eq!(ProtocolId::RsaEncrypt.as_u8(), 0x18);
        assert_eq!(ProtocolId::RsaDecrypt.as_u8(), 0x19);
        assert_eq!(ProtocolId::from_u8(0x13), None);
    }

    #[test]
    fn test_protocol_display() {
        assert_eq!(format!("{}", ProtocolId::DsaSign), "DSASIGN (0x15)");
        assert_eq!(format!("{}", ProtocolId::RsaDecrypt), "RSADECRYPT (0x19)");
    }

    #[test]
    fn test_operation_word() {
        let word = ProtocolId::DsaSign.operation(0);
        assert_eq!(word, 0x8015_0000);
        assert_eq!(operation_protocol(word), Some(ProtocolId::DsaSign));

        let ecc = ProtocolId::DsaVerify.operation((ProtocolFlags::ECC | ProtocolFlags::F2M).bits());
        assert_eq!(ecc & OP_PCLINFO_MASK, 0x0003);
        assert_eq!(operation_protocol(ecc), Some(ProtocolId::DsaVerify));

        assert_eq!(operation_protocol(CMD_MOVE), None);
    }

    #[test]
    fn test_command_fields_do_not_overlap_type() {
        for word in [CMD_FIFO_LOAD, CMD_FIFO_STORE, CMD_MOVE, CMD_OPERATION, CMD_JUMP, CMD_DESC_HDR] {
            assert_eq!(word & !CMD_MASK, 0);
        }
        assert_eq!(command_type(CMD_DESC_HDR | HDR_ONE | 28), CMD_DESC_HDR);
        assert_eq!(CMD_DESC_HDR, 0xB000_0000);
    }
}

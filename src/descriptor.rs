// Public-Key Crypto Accelerator (PKC) Rust Driver
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Job descriptors.
//!
//! A descriptor is a short program of 32-bit words the accelerator fetches
//! from host memory:
//!
//! | Word | Field |
//! |------|-------|
//! | 0 | header: command, `HDR_ONE`, start index, length |
//! | 1 | packed operand lengths |
//! | 2.. | operand addresses, two words each, high word first |
//! | .. | optional trailing length word |
//! | start.. | operation words |
//!
//! The driver places a 64-bit correlation token right after the last word.
//! The accelerator never reads it; the response echoes the descriptor
//! address, and the token found there names the job.

use crate::endian;
use crate::error::PkcResult;
use crate::layout::{BufferPlan, Group, Operand, OperationKind, RsaForm};
use crate::opcode::{self, ProtocolFlags, ProtocolId};
use crate::pool::BufferSet;
use crate::region::DmaRegion;
use std::fmt::Write as _;

/// Bytes of correlation token stored behind the descriptor words.
pub const TOKEN_BYTES: usize = 8;

/// Largest descriptor the header can describe.
pub const MAX_DESC_WORDS: usize = opcode::HDR_DESCLEN_MASK as usize;

/// Decoded header word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescHeader {
    /// Descriptor length in words.
    pub len: usize,
    /// Index of the first executed word.
    pub start: usize,
}

impl DescHeader {
    #[inline]
    pub const fn new(len: usize, start: usize) -> Self {
        Self { len, start }
    }

    #[inline]
    pub const fn encode(self) -> u32 {
        opcode::CMD_DESC_HDR
            | opcode::HDR_ONE
            | (((self.start as u32) << opcode::HDR_START_IDX_SHIFT) & opcode::HDR_START_IDX_MASK)
            | (self.len as u32 & opcode::HDR_DESCLEN_MASK)
    }

    /// Decode a header word; `None` if it is not a job header.
    pub fn decode(word: u32) -> Option<Self> {
        if opcode::command_type(word) != opcode::CMD_DESC_HDR || word & opcode::HDR_ONE == 0 {
            return None;
        }
        Some(Self {
            len: (word & opcode::HDR_DESCLEN_MASK) as usize,
            start: ((word & opcode::HDR_START_IDX_MASK) >> opcode::HDR_START_IDX_SHIFT) as usize,
        })
    }
}

/// An encoded job descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Descriptor {
    kind: OperationKind,
    words: Vec<u32>,
}

impl Descriptor {
    /// Encode the descriptor for a planned and allocated job.
    ///
    /// Planning has already validated every length, so this cannot fail.
    pub fn build(plan: &BufferPlan, buffers: &BufferSet) -> Self {
        let kind = plan.kind;
        let mut words = vec![0u32; kind.word_count()];

        words[0] = DescHeader::new(kind.word_count(), kind.start_index()).encode();
        words[1] = plan.length_word;

        let tmp = buffers.addr(Operand::Tmp).unwrap_or(0);
        let mut at = 2;
        for &op in kind.pointers() {
            let addr = match (kind, op) {
                // Both components are computed into tmp, c then d.
                (OperationKind::DsaSign(_), Operand::SigC) => tmp,
                (OperationKind::DsaSign(_), Operand::SigD) => tmp + plan.component_len as u64,
                _ => buffers.addr(op).unwrap_or(0),
            };
            put_addr(&mut words[at..], addr);
            at += 2;
        }

        if kind.has_trailing_word() {
            words[at] = plan.trailing_word.unwrap_or(0);
            at += 1;
        }
        debug_assert_eq!(at, kind.start_index());

        match kind {
            OperationKind::DsaSign(group) => sign_program(
                &mut words[at..],
                group,
                plan.component_len as u32,
                tmp,
                buffers.addr(Operand::SigC).unwrap_or(0),
                buffers.addr(Operand::SigD).unwrap_or(0),
            ),
            _ => words[at] = kind.protocol().operation(kind.protocol_info()),
        }

        Self { kind, words }
    }

    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    pub fn words(&self) -> &[u32] {
        &self.words
    }

    pub fn header(&self) -> DescHeader {
        DescHeader::new(self.kind.word_count(), self.kind.start_index())
    }

    /// Bytes occupied in memory, token included.
    pub fn byte_len(&self) -> usize {
        self.words.len() * 4 + TOKEN_BYTES
    }

    /// Store the words and the correlation token at `offset`.
    pub fn write_to(&self, region: &DmaRegion, offset: usize, token: u64) -> PkcResult<()> {
        region.write_words(offset, &self.words)?;
        region.write_u64(offset + self.words.len() * 4, token)
    }

    /// Human-readable listing, one word per line.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "{} descriptor, {} words", self.kind, self.words.len());
        for (i, word) in self.words.iter().enumerate() {
            let _ = writeln!(out, "  [{:02}] {:#010x}", i, word);
        }
        out
    }
}

/// Read the header and correlation token of a descriptor in memory.
pub fn read_token(region: &DmaRegion, offset: usize) -> PkcResult<Option<(DescHeader, u64)>> {
    let Some(header) = DescHeader::decode(region.read_u32(offset)?) else {
        return Ok(None);
    };
    let token = region.read_u64(offset + header.len * 4)?;
    Ok(Some((header, token)))
}

#[inline]
fn put_addr(words: &mut [u32], addr: u64) {
    let (high, low) = endian::split_addr(addr);
    words[0] = high;
    words[1] = low;
}

#[inline]
fn get_addr(words: &[u32]) -> u64 {
    endian::join_addr(words[0], words[1])
}

/// Twelve-word program: run the signature, then store c and d from tmp.
fn sign_program(op: &mut [u32], group: Group, r_len: u32, tmp: u64, c: u64, d: u64) {
    use opcode::*;

    op[0] = ProtocolId::DsaSign.operation(group.flags().bits());
    op[1] = CMD_MOVE | MOVE_SRC_INFIFO | MOVE_DEST_OUTFIFO | (2 * r_len);
    op[2] = CMD_JUMP | JUMP_COND_NOP | 1;
    op[3] = CMD_FIFO_LOAD | FIFOLD_CLASS_CLASS1 | FIFOLD_TYPE_PK_TYPEMASK | (2 * r_len);
    put_addr(&mut op[4..6], tmp);
    op[6] = CMD_FIFO_STORE | FIFOST_CONT | FIFOST_TYPE_MESSAGE_DATA | r_len;
    put_addr(&mut op[7..9], c);
    op[9] = CMD_FIFO_STORE | FIFOST_TYPE_MESSAGE_DATA | r_len;
    put_addr(&mut op[10..12], d);
}

// ============================================================================
// Decoding
// ============================================================================

/// A descriptor decoded back into its fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedDescriptor {
    pub kind: OperationKind,
    pub header: DescHeader,
    pub length_word: u32,
    /// Operand addresses in descriptor order.
    pub pointers: Vec<(Operand, u64)>,
    pub trailing_word: Option<u32>,
    /// Words from the start index on.
    pub ops: Vec<u32>,
}

impl ParsedDescriptor {
    pub fn pointer(&self, op: Operand) -> Option<u64> {
        self.pointers.iter().find(|(o, _)| *o == op).map(|(_, a)| *a)
    }
}

/// Recover the operation kind from an `OPERATION` word.
fn kind_of(op_word: u32) -> Option<OperationKind> {
    let info = op_word & opcode::OP_PCLINFO_MASK;
    let group = || {
        let flags = ProtocolFlags::from_bits_truncate(info);
        if !flags.contains(ProtocolFlags::ECC) {
            Group::Finite
        } else if flags.contains(ProtocolFlags::F2M) {
            Group::Curve(crate::layout::CurveField::Binary)
        } else {
            Group::Curve(crate::layout::CurveField::Prime)
        }
    };
    Some(match opcode::operation_protocol(op_word)? {
        ProtocolId::RsaEncrypt => OperationKind::RsaPublic,
        ProtocolId::RsaDecrypt => OperationKind::RsaPrivate(match info {
            0 => RsaForm::Form1,
            1 => RsaForm::Form2,
            2 => RsaForm::Form3,
            _ => return None,
        }),
        ProtocolId::PublicKeyPair => OperationKind::DsaKeygen(group()),
        ProtocolId::DsaSign => OperationKind::DsaSign(group()),
        ProtocolId::DsaVerify => OperationKind::DsaVerify(group()),
        ProtocolId::Dh => OperationKind::Dh(group()),
    })
}

/// Decode descriptor words; `None` if they are not a well-formed job.
pub fn parse(words: &[u32]) -> Option<ParsedDescriptor> {
    let header = DescHeader::decode(*words.first()?)?;
    if header.len > words.len() || header.start >= header.len {
        return None;
    }
    let words = &words[..header.len];
    let kind = kind_of(words[header.start])?;
    if kind.word_count() != header.len || kind.start_index() != header.start {
        return None;
    }

    let mut at = 2;
    let pointers = kind
        .pointers()
        .iter()
        .map(|&op| {
            let addr = get_addr(&words[at..]);
            at += 2;
            (op, addr)
        })
        .collect();
    let trailing_word = kind.has_trailing_word().then(|| words[at]);

    Some(ParsedDescriptor {
        kind,
        header,
        length_word: words[1],
        pointers,
        trailing_word,
        ops: words[header.start..].to_vec(),
    })
}

// Compile-time layout checks
const _: () = assert!(OperationKind::DsaSign(Group::Finite).word_count() == 28);
const _: () = assert!(OperationKind::DsaSign(Group::Curve(crate::layout::CurveField::Binary)).word_count() == 30);
const _: () = assert!(OperationKind::RsaPrivate(RsaForm::Form3).word_count() <= MAX_DESC_WORDS);
const _: () = assert!(OperationKind::RsaPrivate(RsaForm::Form3).start_index() < 64);

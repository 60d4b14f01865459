// Public-Key Crypto Accelerator (PKC) Rust Driver
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Operation kinds, descriptor geometry and buffer planning.
//!
//! [`OperationKind`] is the single switch both the planner and the
//! descriptor builder match on. Planning validates every declared length
//! before any accelerator-visible memory is touched and produces the
//! per-operand buffer list plus the packed length words the descriptor
//! needs.
//!
//! # Descriptor geometry
//!
//! | kind | pointers | trailing | op | words | start |
//! |------|----------|----------|----|-------|-------|
//! | RSA public | f g n e | f_len | 1 | 12 | 11 |
//! | RSA private 1 | g f n d | - | 1 | 11 | 10 |
//! | RSA private 2 | g f d p q tmp1 tmp2 | p_q_len | 1 | 18 | 17 |
//! | RSA private 3 | g f c p q dp dq tmp1 tmp2 | p_q_len | 1 | 22 | 21 |
//! | keygen | q r g s w (ab) | - | 1 | 13 (15) | 12 (14) |
//! | sign | q r g s f c d (ab) | - | 12 | 28 (30) | 16 (18) |
//! | verify | q r g w f c d tmp (ab) | - | 1 | 19 (21) | 18 (20) |
//! | DH | q w s z (ab) | - | 1 | 11 (13) | 10 (12) |
//!
//! Every layout starts with the header word and a length word; each
//! pointer takes two words.

use crate::descriptor::TOKEN_BYTES;
use crate::error::{PkcError, PkcResult};
use crate::opcode::{ProtocolFlags, ProtocolId};
use crate::request::{
    DhRequest, DsaDomain, DsaKeygenRequest, DsaSignRequest, DsaVerifyRequest, PkcRequest,
    RsaPrivateKey, RsaPrivateRequest, RsaPublicRequest,
};

/// Largest field or modulus the accelerator accepts, in bytes.
pub const MAX_OPERAND_LEN: usize = 512;

/// Largest subgroup order / DH private key; the `sgf_ln` field is 7 bits.
pub const MAX_ORDER_LEN: usize = 127;

/// Words for a sign operation's FIFO program.
pub const SIGN_OP_WORDS: usize = 12;

/// Field an elliptic curve is defined over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CurveField {
    /// GF(p)
    Prime,
    /// GF(2^m)
    Binary,
}

/// Finite-field or elliptic-curve variant of a discrete-log operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Group {
    Finite,
    Curve(CurveField),
}

impl Group {
    #[inline]
    pub const fn is_curve(self) -> bool {
        matches!(self, Self::Curve(_))
    }

    /// Protocol-info bits for the `OPERATION` word.
    pub const fn flags(self) -> ProtocolFlags {
        match self {
            Self::Finite => ProtocolFlags::empty(),
            Self::Curve(CurveField::Prime) => ProtocolFlags::ECC,
            Self::Curve(CurveField::Binary) => ProtocolFlags::ECC.union(ProtocolFlags::F2M),
        }
    }

    /// Length of a group element: `q` for a field element, `2q` for a point.
    #[inline]
    pub const fn element_len(self, q_len: usize) -> usize {
        if self.is_curve() {
            2 * q_len
        } else {
            q_len
        }
    }
}

/// RSA private-key representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RsaForm {
    Form1,
    Form2,
    Form3,
}

impl RsaForm {
    /// Protocol-info value selecting this form.
    #[inline]
    pub const fn as_u32(self) -> u32 {
        match self {
            Self::Form1 => 0,
            Self::Form2 => 1,
            Self::Form3 => 2,
        }
    }
}

/// Every operation family the accelerator runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    RsaPublic,
    RsaPrivate(RsaForm),
    DsaKeygen(Group),
    DsaSign(Group),
    DsaVerify(Group),
    Dh(Group),
}

/// Named operand slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operand {
    /// Field prime / polynomial.
    Q,
    /// Subgroup order.
    R,
    /// Generator.
    G,
    /// Curve coefficients.
    Ab,
    PrivKey,
    PubKey,
    /// Message digest.
    Message,
    /// First signature component.
    SigC,
    /// Second signature component.
    SigD,
    Tmp,
    /// DH shared secret.
    Secret,
    Modulus,
    PubExp,
    PrivExp,
    PrimeP,
    PrimeQ,
    /// q^-1 mod p
    Qinv,
    /// d mod (p-1)
    ExpP,
    /// d mod (q-1)
    ExpQ,
    Tmp1,
    Tmp2,
    /// RSA input block.
    RsaIn,
    /// RSA output block.
    RsaOut,
}

impl Operand {
    pub const fn name(self) -> &'static str {
        match self {
            Self::Q => "q",
            Self::R => "r",
            Self::G => "g",
            Self::Ab => "ab",
            Self::PrivKey => "private key",
            Self::PubKey => "public key",
            Self::Message => "message",
            Self::SigC => "signature c",
            Self::SigD => "signature d",
            Self::Tmp => "tmp",
            Self::Secret => "shared secret",
            Self::Modulus => "n",
            Self::PubExp => "e",
            Self::PrivExp => "d",
            Self::PrimeP => "p",
            Self::PrimeQ => "prime q",
            Self::Qinv => "c",
            Self::ExpP => "dp",
            Self::ExpQ => "dq",
            Self::Tmp1 => "tmp1",
            Self::Tmp2 => "tmp2",
            Self::RsaIn => "input block",
            Self::RsaOut => "output block",
        }
    }
}

impl std::fmt::Display for Operand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

use Operand::*;

const RSA_PUB_PTRS: &[Operand] = &[RsaIn, RsaOut, Modulus, PubExp];
const RSA_PRIV1_PTRS: &[Operand] = &[RsaIn, RsaOut, Modulus, PrivExp];
const RSA_PRIV2_PTRS: &[Operand] = &[RsaIn, RsaOut, PrivExp, PrimeP, PrimeQ, Tmp1, Tmp2];
const RSA_PRIV3_PTRS: &[Operand] = &[RsaIn, RsaOut, Qinv, PrimeP, PrimeQ, ExpP, ExpQ, Tmp1, Tmp2];
const KEYGEN_PTRS: &[Operand] = &[Q, R, G, PrivKey, PubKey];
const EC_KEYGEN_PTRS: &[Operand] = &[Q, R, G, PrivKey, PubKey, Ab];
const SIGN_PTRS: &[Operand] = &[Q, R, G, PrivKey, Message, SigC, SigD];
const EC_SIGN_PTRS: &[Operand] = &[Q, R, G, PrivKey, Message, SigC, SigD, Ab];
const VERIFY_PTRS: &[Operand] = &[Q, R, G, PubKey, Message, SigC, SigD, Tmp];
const EC_VERIFY_PTRS: &[Operand] = &[Q, R, G, PubKey, Message, SigC, SigD, Tmp, Ab];
const DH_PTRS: &[Operand] = &[Q, PubKey, PrivKey, Secret];
const EC_DH_PTRS: &[Operand] = &[Q, PubKey, PrivKey, Secret, Ab];

impl OperationKind {
    /// Operand pointers in descriptor order.
    pub const fn pointers(self) -> &'static [Operand] {
        match self {
            Self::RsaPublic => RSA_PUB_PTRS,
            Self::RsaPrivate(RsaForm::Form1) => RSA_PRIV1_PTRS,
            Self::RsaPrivate(RsaForm::Form2) => RSA_PRIV2_PTRS,
            Self::RsaPrivate(RsaForm::Form3) => RSA_PRIV3_PTRS,
            Self::DsaKeygen(Group::Finite) => KEYGEN_PTRS,
            Self::DsaKeygen(Group::Curve(_)) => EC_KEYGEN_PTRS,
            Self::DsaSign(Group::Finite) => SIGN_PTRS,
            Self::DsaSign(Group::Curve(_)) => EC_SIGN_PTRS,
            Self::DsaVerify(Group::Finite) => VERIFY_PTRS,
            Self::DsaVerify(Group::Curve(_)) => EC_VERIFY_PTRS,
            Self::Dh(Group::Finite) => DH_PTRS,
            Self::Dh(Group::Curve(_)) => EC_DH_PTRS,
        }
    }

    /// Whether a length word follows the pointers.
    pub const fn has_trailing_word(self) -> bool {
        matches!(
            self,
            Self::RsaPublic | Self::RsaPrivate(RsaForm::Form2) | Self::RsaPrivate(RsaForm::Form3)
        )
    }

    pub const fn op_words(self) -> usize {
        match self {
            Self::DsaSign(_) => SIGN_OP_WORDS,
            _ => 1,
        }
    }

    /// Descriptor length in words, header included.
    pub const fn word_count(self) -> usize {
        2 + 2 * self.pointers().len() + self.has_trailing_word() as usize + self.op_words()
    }

    /// Index of the first executable word.
    pub const fn start_index(self) -> usize {
        self.word_count() - self.op_words()
    }

    pub const fn protocol(self) -> ProtocolId {
        match self {
            Self::RsaPublic => ProtocolId::RsaEncrypt,
            Self::RsaPrivate(_) => ProtocolId::RsaDecrypt,
            Self::DsaKeygen(_) => ProtocolId::PublicKeyPair,
            Self::DsaSign(_) => ProtocolId::DsaSign,
            Self::DsaVerify(_) => ProtocolId::DsaVerify,
            Self::Dh(_) => ProtocolId::Dh,
        }
    }

    /// Protocol-info field of the `OPERATION` word.
    pub const fn protocol_info(self) -> u32 {
        match self {
            Self::RsaPublic => 0,
            Self::RsaPrivate(form) => form.as_u32(),
            Self::DsaKeygen(group)
            | Self::DsaSign(group)
            | Self::DsaVerify(group)
            | Self::Dh(group) => group.flags().bits(),
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::RsaPublic => "rsa-public",
            Self::RsaPrivate(RsaForm::Form1) => "rsa-private-1",
            Self::RsaPrivate(RsaForm::Form2) => "rsa-private-2",
            Self::RsaPrivate(RsaForm::Form3) => "rsa-private-3",
            Self::DsaKeygen(Group::Finite) => "dsa-keygen",
            Self::DsaKeygen(Group::Curve(_)) => "ecdsa-keygen",
            Self::DsaSign(Group::Finite) => "dsa-sign",
            Self::DsaSign(Group::Curve(_)) => "ecdsa-sign",
            Self::DsaVerify(Group::Finite) => "dsa-verify",
            Self::DsaVerify(Group::Curve(_)) => "ecdsa-verify",
            Self::Dh(Group::Finite) => "dh",
            Self::Dh(Group::Curve(_)) => "ecdh",
        }
    }
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// What a buffer is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferRole {
    /// Loaded from the request before submission.
    Input,
    /// Copied back to the caller on success.
    Output,
    /// Accelerator scratch.
    Temporary,
    /// Descriptor words and correlation token.
    Descriptor,
}

/// One buffer the operation needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferSpec {
    pub operand: Operand,
    pub role: BufferRole,
    pub len: usize,
}

/// Validated allocation plan for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferPlan {
    pub kind: OperationKind,
    pub specs: Vec<BufferSpec>,
    /// `sgf_ln` or the RSA length word.
    pub length_word: u32,
    /// `f_len` or `p_q_len`.
    pub trailing_word: Option<u32>,
    /// Signature component length (sign only).
    pub component_len: usize,
}

impl BufferPlan {
    /// Validate `req` and compute its buffers.
    pub fn for_request(req: &PkcRequest) -> PkcResult<Self> {
        match req {
            PkcRequest::RsaPublic(r) => plan_rsa_public(r),
            PkcRequest::RsaPrivate(r) => plan_rsa_private(r),
            PkcRequest::DsaKeygen(r) => plan_keygen(r),
            PkcRequest::DsaSign(r) => plan_sign(r),
            PkcRequest::DsaVerify(r) => plan_verify(r),
            PkcRequest::Dh(r) => plan_dh(r),
        }
    }

    pub fn spec(&self, op: Operand) -> Option<&BufferSpec> {
        self.specs.iter().find(|s| s.operand == op)
    }

    /// Bytes of descriptor scratch: words plus the correlation token.
    pub fn descriptor_len(&self) -> usize {
        self.kind.word_count() * 4 + TOKEN_BYTES
    }

    pub fn outputs(&self) -> impl Iterator<Item = &BufferSpec> {
        self.specs.iter().filter(|s| s.role == BufferRole::Output)
    }

    fn new(kind: OperationKind, length_word: u32) -> Self {
        Self {
            kind,
            specs: Vec::with_capacity(kind.pointers().len() + 2),
            length_word,
            trailing_word: None,
            component_len: 0,
        }
    }

    fn push(&mut self, operand: Operand, role: BufferRole, len: usize) {
        self.specs.push(BufferSpec { operand, role, len });
    }

    fn input(&mut self, operand: Operand, bytes: &[u8]) {
        self.push(operand, BufferRole::Input, bytes.len());
    }
}

// ============================================================================
// Validation helpers
// ============================================================================

fn non_empty(op: Operand, bytes: &[u8]) -> PkcResult<usize> {
    if bytes.is_empty() {
        return Err(PkcError::InvalidRequest(format!("{} is empty", op)));
    }
    Ok(bytes.len())
}

fn at_most(op: Operand, len: usize, max: usize) -> PkcResult<()> {
    if len > max {
        return Err(PkcError::InvalidRequest(format!(
            "{} is {} bytes, limit {}",
            op, len, max
        )));
    }
    Ok(())
}

fn expect_len(field: &'static str, expected: usize, actual: usize) -> PkcResult<()> {
    if expected != actual {
        return Err(PkcError::LengthMismatch {
            field,
            expected,
            actual,
        });
    }
    Ok(())
}

/// Check domain parameters and return `(q_len, r_len)`.
fn check_domain(domain: &DsaDomain) -> PkcResult<(usize, usize)> {
    let q_len = non_empty(Q, &domain.q)?;
    let r_len = non_empty(R, &domain.r)?;
    non_empty(G, &domain.g)?;
    at_most(Q, q_len, MAX_OPERAND_LEN)?;
    at_most(R, r_len, MAX_ORDER_LEN)?;

    let group = domain.group();
    expect_len("g", group.element_len(q_len), domain.g.len())?;
    if let Some(curve) = &domain.curve {
        expect_len("ab", 2 * q_len, curve.ab.len())?;
    }
    Ok((q_len, r_len))
}

#[inline]
fn sgf_ln(q_len: usize, r_len: usize) -> u32 {
    ((q_len as u32) << 7) | r_len as u32
}

#[inline]
fn rsa_len_word(exp_len: usize, n_len: usize) -> u32 {
    ((exp_len as u32) << 12) | n_len as u32
}

fn push_domain(plan: &mut BufferPlan, domain: &DsaDomain) {
    plan.input(Q, &domain.q);
    plan.input(R, &domain.r);
    plan.input(G, &domain.g);
    if let Some(curve) = &domain.curve {
        plan.input(Ab, &curve.ab);
    }
}

// ============================================================================
// Per-family planning
// ============================================================================

fn plan_keygen(req: &DsaKeygenRequest) -> PkcResult<BufferPlan> {
    let (q_len, r_len) = check_domain(&req.domain)?;
    let group = req.domain.group();
    expect_len("private key", r_len, req.priv_len)?;
    expect_len("public key", group.element_len(q_len), req.pub_len)?;

    let mut plan = BufferPlan::new(OperationKind::DsaKeygen(group), sgf_ln(q_len, r_len));
    push_domain(&mut plan, &req.domain);
    plan.push(PrivKey, BufferRole::Output, req.priv_len);
    plan.push(PubKey, BufferRole::Output, req.pub_len);
    Ok(plan)
}

fn plan_sign(req: &DsaSignRequest) -> PkcResult<BufferPlan> {
    let (q_len, r_len) = check_domain(&req.domain)?;
    expect_len("private key", r_len, req.priv_key.len())?;
    expect_len("signature component", r_len, req.component_len)?;
    non_empty(Message, &req.message)?;

    let mut plan = BufferPlan::new(OperationKind::DsaSign(req.domain.group()), sgf_ln(q_len, r_len));
    plan.component_len = r_len;
    push_domain(&mut plan, &req.domain);
    plan.input(PrivKey, &req.priv_key);
    plan.input(Message, &req.message);
    // c and d are computed into the two halves of tmp and stored out.
    plan.push(Tmp, BufferRole::Temporary, 2 * r_len);
    plan.push(SigC, BufferRole::Output, r_len);
    plan.push(SigD, BufferRole::Output, r_len);
    Ok(plan)
}

fn plan_verify(req: &DsaVerifyRequest) -> PkcResult<BufferPlan> {
    let (q_len, r_len) = check_domain(&req.domain)?;
    let group = req.domain.group();
    expect_len("public key", group.element_len(q_len), req.pub_key.len())?;
    expect_len("signature c", r_len, req.c.len())?;
    expect_len("signature d", r_len, req.d.len())?;
    non_empty(Message, &req.message)?;

    let mut plan = BufferPlan::new(OperationKind::DsaVerify(group), sgf_ln(q_len, r_len));
    push_domain(&mut plan, &req.domain);
    plan.input(PubKey, &req.pub_key);
    plan.input(Message, &req.message);
    plan.input(SigC, &req.c);
    plan.input(SigD, &req.d);
    plan.push(Tmp, BufferRole::Temporary, group.element_len(q_len));
    Ok(plan)
}

fn plan_dh(req: &DhRequest) -> PkcResult<BufferPlan> {
    let q_len = non_empty(Q, &req.q)?;
    at_most(Q, q_len, MAX_OPERAND_LEN)?;
    let s_len = non_empty(PrivKey, &req.priv_key)?;
    at_most(PrivKey, s_len, MAX_ORDER_LEN)?;
    non_empty(PubKey, &req.pub_key)?;

    let group = req.group();
    expect_len("public key", group.element_len(q_len), req.pub_key.len())?;
    expect_len("shared secret", q_len, req.secret_len)?;
    if let Some(curve) = &req.curve {
        expect_len("ab", 2 * q_len, curve.ab.len())?;
    }

    let mut plan = BufferPlan::new(OperationKind::Dh(group), sgf_ln(q_len, s_len));
    plan.input(Q, &req.q);
    plan.input(PubKey, &req.pub_key);
    plan.input(PrivKey, &req.priv_key);
    if let Some(curve) = &req.curve {
        plan.input(Ab, &curve.ab);
    }
    plan.push(Secret, BufferRole::Output, req.secret_len);
    Ok(plan)
}

fn plan_rsa_public(req: &RsaPublicRequest) -> PkcResult<BufferPlan> {
    let n_len = non_empty(Modulus, &req.n)?;
    at_most(Modulus, n_len, MAX_OPERAND_LEN)?;
    let e_len = non_empty(PubExp, &req.e)?;
    at_most(PubExp, e_len, n_len)?;
    let f_len = non_empty(RsaIn, &req.f)?;
    at_most(RsaIn, f_len, n_len)?;

    let mut plan = BufferPlan::new(OperationKind::RsaPublic, rsa_len_word(e_len, n_len));
    plan.trailing_word = Some(f_len as u32);
    plan.input(RsaIn, &req.f);
    plan.input(Modulus, &req.n);
    plan.input(PubExp, &req.e);
    plan.push(RsaOut, BufferRole::Output, n_len);
    Ok(plan)
}

fn plan_rsa_private(req: &RsaPrivateRequest) -> PkcResult<BufferPlan> {
    let n_len = req.key.n_len();
    if n_len == 0 {
        return Err(PkcError::InvalidRequest("modulus length is zero".to_string()));
    }
    at_most(Modulus, n_len, MAX_OPERAND_LEN)?;
    let g_len = non_empty(RsaIn, &req.g)?;
    at_most(RsaIn, g_len, n_len)?;

    let kind = OperationKind::RsaPrivate(req.key.form());
    let mut plan = match &req.key {
        RsaPrivateKey::Form1 { n, d } => {
            let d_len = non_empty(PrivExp, d)?;
            at_most(PrivExp, d_len, n_len)?;
            let mut plan = BufferPlan::new(kind, rsa_len_word(d_len, n_len));
            plan.input(RsaIn, &req.g);
            plan.input(Modulus, n);
            plan.input(PrivExp, d);
            plan
        }
        RsaPrivateKey::Form2 { d, p, q, .. } => {
            let d_len = non_empty(PrivExp, d)?;
            at_most(PrivExp, d_len, n_len)?;
            let (p_len, q_len) = check_primes(p, q, n_len)?;
            let mut plan = BufferPlan::new(kind, rsa_len_word(d_len, n_len));
            plan.trailing_word = Some(rsa_len_word(q_len, p_len));
            plan.input(RsaIn, &req.g);
            plan.input(PrivExp, d);
            plan.input(PrimeP, p);
            plan.input(PrimeQ, q);
            plan.push(Tmp1, BufferRole::Temporary, p_len);
            plan.push(Tmp2, BufferRole::Temporary, q_len);
            plan
        }
        RsaPrivateKey::Form3 { c, p, q, dp, dq, .. } => {
            let (p_len, q_len) = check_primes(p, q, n_len)?;
            expect_len("c", p_len, c.len())?;
            expect_len("dp", p_len, dp.len())?;
            expect_len("dq", q_len, dq.len())?;
            let mut plan = BufferPlan::new(kind, n_len as u32);
            plan.trailing_word = Some(rsa_len_word(q_len, p_len));
            plan.input(RsaIn, &req.g);
            plan.input(Qinv, c);
            plan.input(PrimeP, p);
            plan.input(PrimeQ, q);
            plan.input(ExpP, dp);
            plan.input(ExpQ, dq);
            plan.push(Tmp1, BufferRole::Temporary, p_len);
            plan.push(Tmp2, BufferRole::Temporary, q_len);
            plan
        }
    };
    plan.push(RsaOut, BufferRole::Output, n_len);
    Ok(plan)
}

fn check_primes(p: &[u8], q: &[u8], n_len: usize) -> PkcResult<(usize, usize)> {
    let p_len = non_empty(PrimeP, p)?;
    let q_len = non_empty(PrimeQ, q)?;
    at_most(PrimeP, p_len, n_len)?;
    at_most(PrimeQ, q_len, n_len)?;
    Ok((p_len, q_len))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::EcCurve;

    fn finite_domain(q_len: usize, r_len: usize) -> DsaDomain {
        DsaDomain::finite(vec![0x11; q_len], vec![0x22; r_len], vec![0x33; q_len])
    }

    fn sign_request(q_len: usize, r_len: usize) -> PkcRequest {
        PkcRequest::DsaSign(DsaSignRequest {
            domain: finite_domain(q_len, r_len),
            priv_key: vec![0x44; r_len],
            message: vec![0x55; 32],
            component_len: r_len,
        })
    }

    #[test]
    fn test_word_counts_match_layouts() {
        let binary = Group::Curve(CurveField::Binary);
        let cases = [
            (OperationKind::RsaPublic, 12, 11),
            (OperationKind::RsaPrivate(RsaForm::Form1), 11, 10),
            (OperationKind::RsaPrivate(RsaForm::Form2), 18, 17),
            (OperationKind::RsaPrivate(RsaForm::Form3), 22, 21),
            (OperationKind::DsaKeygen(Group::Finite), 13, 12),
            (OperationKind::DsaKeygen(binary), 15, 14),
            (OperationKind::DsaSign(Group::Finite), 28, 16),
            (OperationKind::DsaSign(binary), 30, 18),
            (OperationKind::DsaVerify(Group::Finite), 19, 18),
            (OperationKind::DsaVerify(binary), 21, 20),
            (OperationKind::Dh(Group::Finite), 11, 10),
            (OperationKind::Dh(binary), 13, 12),
        ];
        for (kind, words, start) in cases {
            assert_eq!(kind.word_count(), words, "{}", kind);
            assert_eq!(kind.start_index(), start, "{}", kind);
        }
    }

    #[test]
    fn test_protocol_info() {
        assert_eq!(OperationKind::DsaSign(Group::Finite).protocol_info(), 0);
        assert_eq!(OperationKind::DsaSign(Group::Curve(CurveField::Prime)).protocol_info(), 0x2);
        assert_eq!(OperationKind::Dh(Group::Curve(CurveField::Binary)).protocol_info(), 0x3);
        assert_eq!(OperationKind::RsaPrivate(RsaForm::Form3).protocol_info(), 2);
        assert_eq!(OperationKind::DsaKeygen(Group::Finite).protocol(), ProtocolId::PublicKeyPair);
    }

    #[test]
    fn test_sign_plan() {
        let plan = BufferPlan::for_request(&sign_request(20, 20)).unwrap();
        assert_eq!(plan.kind, OperationKind::DsaSign(Group::Finite));
        assert_eq!(plan.length_word, (20 << 7) | 20);
        assert_eq!(plan.component_len, 20);
        assert_eq!(plan.spec(Tmp).unwrap().len, 40);
        assert_eq!(plan.spec(Tmp).unwrap().role, BufferRole::Temporary);
        let outputs: Vec<_> = plan.outputs().map(|s| (s.operand, s.len)).collect();
        assert_eq!(outputs, vec![(SigC, 20), (SigD, 20)]);
        assert_eq!(plan.descriptor_len(), 28 * 4 + TOKEN_BYTES);
    }

    #[test]
    fn test_sign_rejects_mismatched_lengths() {
        let PkcRequest::DsaSign(mut req) = sign_request(20, 20) else {
            unreachable!()
        };
        req.component_len = 21;
        assert!(matches!(
            BufferPlan::for_request(&req.clone().into()),
            Err(PkcError::LengthMismatch { field: "signature component", expected: 20, actual: 21 })
        ));

        req.component_len = 20;
        req.priv_key.pop();
        assert!(matches!(
            BufferPlan::for_request(&req.into()),
            Err(PkcError::LengthMismatch { field: "private key", .. })
        ));
    }

    #[test]
    fn test_domain_limits() {
        assert!(BufferPlan::for_request(&sign_request(513, 20)).is_err());
        assert!(BufferPlan::for_request(&sign_request(512, 128)).is_err());
        assert!(BufferPlan::for_request(&sign_request(512, 127)).is_ok());

        let mut empty = finite_domain(20, 20);
        empty.r.clear();
        let req = PkcRequest::DsaKeygen(DsaKeygenRequest {
            domain: empty,
            priv_len: 20,
            pub_len: 20,
        });
        assert!(matches!(BufferPlan::for_request(&req), Err(PkcError::InvalidRequest(_))));
    }

    #[test]
    fn test_curve_requires_point_lengths() {
        let mut domain = DsaDomain::curve(vec![1; 32], vec![2; 32], vec![3; 64], vec![4; 64], CurveField::Prime);
        let req = PkcRequest::DsaVerify(DsaVerifyRequest {
            domain: domain.clone(),
            pub_key: vec![5; 64],
            message: vec![6; 32],
            c: vec![7; 32],
            d: vec![8; 32],
        });
        let plan = BufferPlan::for_request(&req).unwrap();
        assert_eq!(plan.spec(Tmp).unwrap().len, 64);
        assert_eq!(plan.spec(Ab).unwrap().len, 64);

        domain.curve = Some(EcCurve {
            ab: vec![4; 32],
            field: CurveField::Prime,
        });
        let req = PkcRequest::DsaKeygen(DsaKeygenRequest {
            domain,
            priv_len: 32,
            pub_len: 64,
        });
        assert!(matches!(
            BufferPlan::for_request(&req),
            Err(PkcError::LengthMismatch { field: "ab", .. })
        ));
    }

    #[test]
    fn test_dh_plan() {
        let req = PkcRequest::Dh(DhRequest {
            q: vec![1; 128],
            curve: None,
            pub_key: vec![2; 128],
            priv_key: vec![3; 20],
            secret_len: 128,
        });
        let plan = BufferPlan::for_request(&req).unwrap();
        assert_eq!(plan.length_word, (128 << 7) | 20);
        assert_eq!(plan.spec(Secret).unwrap().role, BufferRole::Output);
    }

    #[test]
    fn test_rsa_plans() {
        let public = PkcRequest::RsaPublic(RsaPublicRequest {
            n: vec![0xC5; 256],
            e: vec![1, 0, 1],
            f: vec![0x42; 200],
        });
        let plan = BufferPlan::for_request(&public).unwrap();
        assert_eq!(plan.length_word, (3 << 12) | 256);
        assert_eq!(plan.trailing_word, Some(200));
        assert_eq!(plan.spec(RsaOut).unwrap().len, 256);

        let crt = PkcRequest::RsaPrivate(RsaPrivateRequest {
            key: RsaPrivateKey::Form3 {
                c: vec![1; 128],
                p: vec![2; 128],
                q: vec![3; 120],
                dp: vec![4; 128],
                dq: vec![5; 120],
                n_len: 248,
            },
            g: vec![6; 248],
        });
        let plan = BufferPlan::for_request(&crt).unwrap();
        assert_eq!(plan.length_word, 248);
        assert_eq!(plan.trailing_word, Some((120 << 12) | 128));
        assert_eq!(plan.spec(Tmp1).unwrap().len, 128);
        assert_eq!(plan.spec(Tmp2).unwrap().len, 120);

        let oversized = PkcRequest::RsaPublic(RsaPublicRequest {
            n: vec![1; 16],
            e: vec![1; 17],
            f: vec![1; 16],
        });
        assert!(BufferPlan::for_request(&oversized).is_err());
    }
}

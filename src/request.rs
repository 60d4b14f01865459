// Public-Key Crypto Accelerator (PKC) Rust Driver
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Host-facing request shapes.
//!
//! Every variable-length field carries its length explicitly: inputs through
//! the length of their byte vector, outputs through a declared length. Byte
//! strings are big-endian integers (or encoded curve points) and are copied
//! to the accelerator verbatim.

use crate::layout::{CurveField, Group, Operand, OperationKind, RsaForm};

/// Elliptic-curve parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EcCurve {
    /// Curve coefficients a and b, concatenated.
    pub ab: Vec<u8>,
    /// Field the curve is defined over.
    pub field: CurveField,
}

/// DSA or ECDSA domain parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DsaDomain {
    /// Field prime (or binary field polynomial).
    pub q: Vec<u8>,
    /// Subgroup order.
    pub r: Vec<u8>,
    /// Generator; a curve point (x || y) for ECDSA.
    pub g: Vec<u8>,
    /// Present for ECDSA.
    pub curve: Option<EcCurve>,
}

impl DsaDomain {
    /// Finite-field DSA domain.
    pub fn finite(q: Vec<u8>, r: Vec<u8>, g: Vec<u8>) -> Self {
        Self {
            q,
            r,
            g,
            curve: None,
        }
    }

    /// ECDSA domain over a prime or binary field.
    pub fn curve(q: Vec<u8>, r: Vec<u8>, g: Vec<u8>, ab: Vec<u8>, field: CurveField) -> Self {
        Self {
            q,
            r,
            g,
            curve: Some(EcCurve { ab, field }),
        }
    }

    pub fn group(&self) -> Group {
        match &self.curve {
            None => Group::Finite,
            Some(curve) => Group::Curve(curve.field),
        }
    }

    fn input(&self, op: Operand) -> Option<&[u8]> {
        match op {
            Operand::Q => Some(&self.q),
            Operand::R => Some(&self.r),
            Operand::G => Some(&self.g),
            Operand::Ab => self.curve.as_ref().map(|c| c.ab.as_slice()),
            _ => None,
        }
    }
}

/// Generate a key pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DsaKeygenRequest {
    pub domain: DsaDomain,
    /// Length of the private key to produce (equals `r`).
    pub priv_len: usize,
    /// Length of the public key to produce (`q`, or `2q` for a curve point).
    pub pub_len: usize,
}

/// Sign a message digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DsaSignRequest {
    pub domain: DsaDomain,
    pub priv_key: Vec<u8>,
    /// Digest to sign.
    pub message: Vec<u8>,
    /// Length of each signature component (equals `r`).
    pub component_len: usize,
}

/// Verify a signature (c, d).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DsaVerifyRequest {
    pub domain: DsaDomain,
    pub pub_key: Vec<u8>,
    pub message: Vec<u8>,
    pub c: Vec<u8>,
    pub d: Vec<u8>,
}

/// Compute a Diffie-Hellman shared secret.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhRequest {
    /// Field prime (or binary field polynomial).
    pub q: Vec<u8>,
    /// Present for ECDH.
    pub curve: Option<EcCurve>,
    /// Peer public value.
    pub pub_key: Vec<u8>,
    pub priv_key: Vec<u8>,
    /// Length of the shared secret to produce (equals `q`).
    pub secret_len: usize,
}

impl DhRequest {
    pub fn group(&self) -> Group {
        match &self.curve {
            None => Group::Finite,
            Some(curve) => Group::Curve(curve.field),
        }
    }
}

/// RSA public-key operation (encrypt / raw verify): `g = f^e mod n`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RsaPublicRequest {
    pub n: Vec<u8>,
    pub e: Vec<u8>,
    /// Input block.
    pub f: Vec<u8>,
}

/// RSA private-key representations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RsaPrivateKey {
    /// (n, d)
    Form1 { n: Vec<u8>, d: Vec<u8> },
    /// (p, q, d); `n_len` is the modulus length.
    Form2 {
        d: Vec<u8>,
        p: Vec<u8>,
        q: Vec<u8>,
        n_len: usize,
    },
    /// CRT form (p, q, dp, dq, c = q^-1 mod p).
    Form3 {
        c: Vec<u8>,
        p: Vec<u8>,
        q: Vec<u8>,
        dp: Vec<u8>,
        dq: Vec<u8>,
        n_len: usize,
    },
}

impl RsaPrivateKey {
    pub fn form(&self) -> RsaForm {
        match self {
            Self::Form1 { .. } => RsaForm::Form1,
            Self::Form2 { .. } => RsaForm::Form2,
            Self::Form3 { .. } => RsaForm::Form3,
        }
    }

    /// Modulus length in bytes.
    pub fn n_len(&self) -> usize {
        match self {
            Self::Form1 { n, .. } => n.len(),
            Self::Form2 { n_len, .. } | Self::Form3 { n_len, .. } => *n_len,
        }
    }
}

/// RSA private-key operation (decrypt / raw sign): `f = g^d mod n`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RsaPrivateRequest {
    pub key: RsaPrivateKey,
    /// Input block.
    pub g: Vec<u8>,
}

/// Any request the driver can offload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PkcRequest {
    RsaPublic(RsaPublicRequest),
    RsaPrivate(RsaPrivateRequest),
    DsaKeygen(DsaKeygenRequest),
    DsaSign(DsaSignRequest),
    DsaVerify(DsaVerifyRequest),
    Dh(DhRequest),
}

impl PkcRequest {
    pub fn kind(&self) -> OperationKind {
        match self {
            Self::RsaPublic(_) => OperationKind::RsaPublic,
            Self::RsaPrivate(req) => OperationKind::RsaPrivate(req.key.form()),
            Self::DsaKeygen(req) => OperationKind::DsaKeygen(req.domain.group()),
            Self::DsaSign(req) => OperationKind::DsaSign(req.domain.group()),
            Self::DsaVerify(req) => OperationKind::DsaVerify(req.domain.group()),
            Self::Dh(req) => OperationKind::Dh(req.group()),
        }
    }

    /// Caller-supplied bytes for an input operand.
    pub fn input(&self, op: Operand) -> Option<&[u8]> {
        match self {
            Self::RsaPublic(req) => match op {
                Operand::RsaIn => Some(&req.f),
                Operand::Modulus => Some(&req.n),
                Operand::PubExp => Some(&req.e),
                _ => None,
            },
            Self::RsaPrivate(req) => match (op, &req.key) {
                (Operand::RsaIn, _) => Some(&req.g),
                (Operand::Modulus, RsaPrivateKey::Form1 { n, .. }) => Some(n),
                (Operand::PrivExp, RsaPrivateKey::Form1 { d, .. }) => Some(d),
                (Operand::PrivExp, RsaPrivateKey::Form2 { d, .. }) => Some(d),
                (Operand::PrimeP, RsaPrivateKey::Form2 { p, .. }) => Some(p),
                (Operand::PrimeQ, RsaPrivateKey::Form2 { q, .. }) => Some(q),
                (Operand::Qinv, RsaPrivateKey::Form3 { c, .. }) => Some(c),
                (Operand::PrimeP, RsaPrivateKey::Form3 { p, .. }) => Some(p),
                (Operand::PrimeQ, RsaPrivateKey::Form3 { q, .. }) => Some(q),
                (Operand::ExpP, RsaPrivateKey::Form3 { dp, .. }) => Some(dp),
                (Operand::ExpQ, RsaPrivateKey::Form3 { dq, .. }) => Some(dq),
                _ => None,
            },
            Self::DsaKeygen(req) => req.domain.input(op),
            Self::DsaSign(req) => match op {
                Operand::PrivKey => Some(&req.priv_key),
                Operand::Message => Some(&req.message),
                _ => req.domain.input(op),
            },
            Self::DsaVerify(req) => match op {
                Operand::PubKey => Some(&req.pub_key),
                Operand::Message => Some(&req.message),
                Operand::SigC => Some(&req.c),
                Operand::SigD => Some(&req.d),
                _ => req.domain.input(op),
            },
            Self::Dh(req) => match op {
                Operand::Q => Some(&req.q),
                Operand::Ab => req.curve.as_ref().map(|c| c.ab.as_slice()),
                Operand::PubKey => Some(&req.pub_key),
                Operand::PrivKey => Some(&req.priv_key),
                _ => None,
            },
        }
    }
}

macro_rules! impl_from_request {
    ($($variant:ident($ty:ty)),* $(,)?) => {
        $(
            impl From<$ty> for PkcRequest {
                fn from(req: $ty) -> Self {
                    Self::$variant(req)
                }
            }
        )*
    };
}

impl_from_request!(
    RsaPublic(RsaPublicRequest),
    RsaPrivate(RsaPrivateRequest),
    DsaKeygen(DsaKeygenRequest),
    DsaSign(DsaSignRequest),
    DsaVerify(DsaVerifyRequest),
    Dh(DhRequest),
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_follows_domain() {
        let finite = DsaDomain::finite(vec![1; 20], vec![2; 20], vec![3; 20]);
        let sign = PkcRequest::from(DsaSignRequest {
            domain: finite,
            priv_key: vec![4; 20],
            message: vec![5; 20],
            component_len: 20,
        });
        assert_eq!(sign.kind(), OperationKind::DsaSign(Group::Finite));

        let curve = DsaDomain::curve(vec![1; 32], vec![2; 32], vec![3; 64], vec![6; 64], CurveField::Binary);
        let keygen = PkcRequest::from(DsaKeygenRequest {
            domain: curve,
            priv_len: 32,
            pub_len: 64,
        });
        assert_eq!(keygen.kind(), OperationKind::DsaKeygen(Group::Curve(CurveField::Binary)));
        assert_eq!(keygen.input(Operand::Ab).map(<[u8]>::len), Some(64));
    }

    #[test]
    fn test_rsa_inputs_by_form() {
        let req = PkcRequest::from(RsaPrivateRequest {
            key: RsaPrivateKey::Form3 {
                c: vec![1; 64],
                p: vec![2; 64],
                q: vec![3; 64],
                dp: vec![4; 64],
                dq: vec![5; 64],
                n_len: 128,
            },
            g: vec![6; 128],
        });
        assert_eq!(req.kind(), OperationKind::RsaPrivate(RsaForm::Form3));
        assert_eq!(req.input(Operand::ExpQ), Some(&[5u8; 64][..]));
        assert_eq!(req.input(Operand::Modulus), None);
        assert_eq!(req.input(Operand::RsaIn).map(<[u8]>::len), Some(128));
    }
}

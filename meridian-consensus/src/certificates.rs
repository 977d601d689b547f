//! Opaque finality certificates attached to accepted decisions.
//!
//! The engine treats certificates as pass-through bytes: they are produced
//! and checked by an injected signer/verifier pair and only sanity-checked
//! for length here. This keeps the certificate scheme — single signatures
//! today, aggregated or post-quantum schemes tomorrow — entirely behind the
//! trait seam.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use meridian_core::Id;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Upper bound on certificate size the engine will carry.
pub const MAX_CERTIFICATE_LEN: usize = 64 * 1024;

/// Opaque certificate bytes with a validated length.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Certificate(Vec<u8>);

impl Certificate {
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, CertificateError> {
        if bytes.is_empty() {
            return Err(CertificateError::Empty);
        }
        if bytes.len() > MAX_CERTIFICATE_LEN {
            return Err(CertificateError::TooLong { len: bytes.len() });
        }
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }
}

#[derive(Error, Debug)]
pub enum CertificateError {
    #[error("certificate is empty")]
    Empty,

    #[error("certificate of {len} bytes exceeds the {MAX_CERTIFICATE_LEN} byte limit")]
    TooLong { len: usize },

    #[error("certificate rejected: {0}")]
    Invalid(String),

    #[error("signer failed: {0}")]
    Signer(String),
}

/// Produces a finality certificate for an accepted decision id.
pub trait CertificateSigner: Send + Sync {
    fn sign(&self, id: &Id) -> Result<Certificate, CertificateError>;
}

/// Checks a finality certificate against a decision id.
pub trait CertificateVerifier: Send + Sync {
    fn verify(&self, id: &Id, certificate: &Certificate) -> Result<(), CertificateError>;
}

/// Ed25519 single-signature certificates, the bundled default scheme.
pub struct Ed25519Signer {
    key: SigningKey,
}

impl Ed25519Signer {
    pub fn new(key: SigningKey) -> Self {
        Self { key }
    }

    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self {
            key: SigningKey::from_bytes(&seed),
        }
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.key.verifying_key()
    }
}

impl CertificateSigner for Ed25519Signer {
    fn sign(&self, id: &Id) -> Result<Certificate, CertificateError> {
        let signature = self.key.sign(id.as_bytes());
        Certificate::from_bytes(signature.to_bytes().to_vec())
    }
}

/// Verifier counterpart of [`Ed25519Signer`].
pub struct Ed25519Verifier {
    key: VerifyingKey,
}

impl Ed25519Verifier {
    pub fn new(key: VerifyingKey) -> Self {
        Self { key }
    }
}

impl CertificateVerifier for Ed25519Verifier {
    fn verify(&self, id: &Id, certificate: &Certificate) -> Result<(), CertificateError> {
        let signature = Signature::from_slice(certificate.as_bytes())
            .map_err(|e| CertificateError::Invalid(e.to_string()))?;
        self.key
            .verify(id.as_bytes(), &signature)
            .map_err(|e| CertificateError::Invalid(e.to_string()))
    }
}

use std::{fmt, str::FromStr};

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use thiserror::Error;

pub const SIGNATURE_LEN: usize = 30;

const HUMAN_READABLE_PREFIX: &str = "dtqs_";

/// A shared secret proving a connection belongs to a dtq deployment.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Signature(pub(crate) [u8; SIGNATURE_LEN]);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("invalid signature; signatures look like `dtqs_` followed by 30 alphanumeric characters")]
    InvalidSignature,
}

impl Signature {
    /// Creates a new, randomly generated signature.
    pub fn new_random() -> Self {
        // A 20-round ChaCha RNG seeded from the OS is more than enough for a shared secret.
        let mut rng: ChaCha20Rng = SeedableRng::from_entropy();
        let mut buf = [0; SIGNATURE_LEN];
        for byte in buf.iter_mut() {
            *byte = rng.sample(rand::distributions::Alphanumeric);
        }
        Self(buf)
    }

    pub(crate) fn from_buf(buf: [u8; SIGNATURE_LEN]) -> Result<Self, SignatureError> {
        if buf.iter().all(|c| c.is_ascii_alphanumeric()) {
            Ok(Self(buf))
        } else {
            Err(SignatureError::InvalidSignature)
        }
    }

    /// Compares two signatures without short-circuiting on the first differing byte.
    pub(crate) fn matches(&self, other: &[u8; SIGNATURE_LEN]) -> bool {
        self.0
            .iter()
            .zip(other.iter())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }
}

impl FromStr for Signature {
    type Err = SignatureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s
            .strip_prefix(HUMAN_READABLE_PREFIX)
            .ok_or(SignatureError::InvalidSignature)?;
        let buf: [u8; SIGNATURE_LEN] = raw
            .as_bytes()
            .try_into()
            .map_err(|_| SignatureError::InvalidSignature)?;
        Self::from_buf(buf)
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(HUMAN_READABLE_PREFIX)?;
        for c in self.0 {
            fmt::Write::write_char(f, c as char)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never leak the secret into logs.
        f.write_str("Signature(<redacted>)")
    }
}

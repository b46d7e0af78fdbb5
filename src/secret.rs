//! Deterministic sequence provider derived from a password or key file.
//!
//! The input material is hashed once with SHA-256 (tagged with the requested
//! length) and the digest seeds a Xoshiro256** generator, so identical
//! material and length always produce identical sequences. The raw material
//! is not retained beyond hashing; the digest doubles as a cheap structural
//! fingerprint for cache keys.

use std::fs;
use std::hash::{Hash, Hasher};
use std::path::Path;

use anyhow::{Context, Result};
use rand::seq::SliceRandom;
use rand::{RngCore, SeedableRng};
use rand_xoshiro::Xoshiro256StarStar;
use sha2::{Digest, Sha256};

use crate::errors::RenderError;

#[derive(Debug, Clone)]
pub struct CipherSecret {
    permutation_sequence: Vec<u32>,
    substitution_sequence: Vec<u8>,
    sequence_length: usize,
    fingerprint: [u8; 32],
}

impl CipherSecret {
    pub fn from_password(password: &str, length: usize) -> Self {
        Self::from_material(password.as_bytes(), length)
    }

    pub fn from_file(path: &Path, length: usize) -> Result<Self> {
        let material = fs::read(path)
            .map_err(|_| RenderError::ResourceNotReadable(path.to_path_buf()))
            .with_context(|| format!("failed reading key file {}", path.display()))?;
        Ok(Self::from_material(&material, length))
    }

    fn from_material(material: &[u8], length: usize) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(material);
        hasher.update((length as u64).to_le_bytes());
        let fingerprint: [u8; 32] = hasher.finalize().into();

        let mut random = Xoshiro256StarStar::from_seed(fingerprint);
        let mut permutation_sequence: Vec<u32> = (0..length as u32).collect();
        permutation_sequence.shuffle(&mut random);
        let mut substitution_sequence = vec![0_u8; length];
        random.fill_bytes(&mut substitution_sequence);

        Self {
            permutation_sequence,
            substitution_sequence,
            sequence_length: length,
            fingerprint,
        }
    }

    /// A permutation of `[0, sequence_length)`.
    pub fn permutation_sequence(&self) -> &[u32] {
        &self.permutation_sequence
    }

    pub fn substitution_sequence(&self) -> &[u8] {
        &self.substitution_sequence
    }

    pub fn sequence_length(&self) -> usize {
        self.sequence_length
    }

    /// Internal consistency check: both sequences must carry exactly the
    /// requested number of values.
    pub fn validate(&self) -> Result<(), RenderError> {
        if self.permutation_sequence.len() != self.sequence_length {
            return Err(RenderError::LengthMismatch {
                expected: self.sequence_length,
                actual: self.permutation_sequence.len(),
            });
        }
        if self.substitution_sequence.len() != self.sequence_length {
            return Err(RenderError::LengthMismatch {
                expected: self.sequence_length,
                actual: self.substitution_sequence.len(),
            });
        }
        Ok(())
    }
}

// Equality and hashing go through the fingerprint: the sequences are a pure
// function of (material, length), which the fingerprint already captures.
impl PartialEq for CipherSecret {
    fn eq(&self, other: &Self) -> bool {
        self.fingerprint == other.fingerprint && self.sequence_length == other.sequence_length
    }
}

impl Eq for CipherSecret {}

impl Hash for CipherSecret {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.fingerprint.hash(state);
        self.sequence_length.hash(state);
    }
}

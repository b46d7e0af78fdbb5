//! Configuration surface consumed by the scrambling core.

use anyhow::{bail, Result};

use crate::math::factorize;
use crate::secret::CipherSecret;

/// Smallest block size the engine accepts.
pub const MIN_BLOCK_SIZE: u32 = 16;
/// Largest block size the engine accepts, before the image edge cap.
pub const MAX_BLOCK_SIZE: u32 = 1024;

/// What a single compute pass does to each pixel. Modes are mutually
/// exclusive per pass; runs compose several passes via [`ColorProcessing`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CipherMode {
    Permutation,
    Unpermutation,
    Substitution,
}

/// Whether a run scrambles or unscrambles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherDirection {
    Forward,
    Inverse,
}

impl CipherDirection {
    pub fn permutation_mode(self) -> CipherMode {
        match self {
            Self::Forward => CipherMode::Permutation,
            Self::Inverse => CipherMode::Unpermutation,
        }
    }
}

/// Which pass composition a run executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorProcessing {
    Permute,
    TwoPassPermute,
    Substitute,
    Both,
}

impl ColorProcessing {
    /// The ordered compute-pass modes for one run.
    pub fn pass_modes(self, direction: CipherDirection) -> Vec<CipherMode> {
        let permute = direction.permutation_mode();
        match self {
            Self::Permute => vec![permute],
            Self::TwoPassPermute => vec![permute, permute],
            Self::Substitute => vec![CipherMode::Substitution],
            Self::Both => vec![permute, CipherMode::Substitution, permute],
        }
    }
}

/// Per-run render configuration. `cipher_mode` is rewritten by the scheduler
/// before each compute pass; everything else is fixed for the run.
#[derive(Debug, Clone)]
pub struct RenderConfig {
    pub secret: CipherSecret,
    pub cipher_mode: CipherMode,
    pub block_size: u32,
    pub cluster_size: u32,
    pub cluster_size_table: Vec<u32>,
}

impl RenderConfig {
    pub fn new(secret: CipherSecret, cluster_size: u32, block_size: u32) -> Self {
        Self {
            secret,
            cipher_mode: CipherMode::Permutation,
            block_size,
            cluster_size,
            cluster_size_table: cluster_size_table(block_size),
        }
    }
}

/// Cluster sizes usable with `block_size`: its divisors, floored so that a
/// scaled displacement direction code still fits one byte
/// (`4 x (cluster - 1) <= 255` and per-axis distances <= 255), and capped at 64.
pub fn cluster_size_table(block_size: u32) -> Vec<u32> {
    factorize(
        block_size,
        (block_size - 1) / 256 + 1,
        block_size.saturating_sub(1).min(64),
    )
}

/// Block sizes are bounded below by [`MIN_BLOCK_SIZE`] and above by the
/// shorter image edge and [`MAX_BLOCK_SIZE`].
pub fn validate_block_size(block_size: u32, shorter_image_edge: u32) -> Result<()> {
    let upper = MAX_BLOCK_SIZE.min(shorter_image_edge);
    if block_size < MIN_BLOCK_SIZE || block_size > upper {
        bail!(
            "block size must be within [{MIN_BLOCK_SIZE}, {upper}] for this image, got {block_size}"
        );
    }
    Ok(())
}

//! Failure taxonomy for the scrambling pipeline.
//!
//! Every failure mode the pipeline can surface is a variant here; the
//! scheduler reports each exactly once through the event channel and never
//! retries. Cancellation is not an error and is reported separately.

use std::error::Error;
use std::fmt::{self, Display, Formatter};
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenderError {
    /// No usable compute device, or kernel/pipeline construction failed.
    EnvironmentUnavailable(String),
    /// Source image or key file could not be opened or decoded.
    ResourceNotReadable(PathBuf),
    /// The decoded pixel layout has no device texture format mapping.
    UnsupportedPixelFormat { bits_per_component: u32, float: bool },
    /// Host-to-device copy could not be prepared.
    UploadFailed(String),
    /// Device-to-host readback failed.
    TransferFailed(String),
    /// The secret's sequences are shorter than a region's data size.
    SequenceTooShort { needed: usize, available: usize },
    /// Paired sequences or index lists disagree in length.
    LengthMismatch { expected: usize, actual: usize },
    /// The block size admits no cluster size that tiles the image exactly.
    DegenerateTessellation { block_size: u32 },
    /// The prepared output target vanished between preparation and write.
    FileModified(PathBuf),
}

impl Display for RenderError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::EnvironmentUnavailable(detail) => {
                write!(f, "compute environment unavailable: {detail}")
            }
            Self::ResourceNotReadable(path) => {
                write!(f, "resource not readable: {}", path.display())
            }
            Self::UnsupportedPixelFormat {
                bits_per_component,
                float,
            } => write!(
                f,
                "unsupported pixel format: {bits_per_component}-bit{}",
                if *float { " float" } else { "" }
            ),
            Self::UploadFailed(detail) => write!(f, "image upload failed: {detail}"),
            Self::TransferFailed(detail) => write!(f, "result transfer failed: {detail}"),
            Self::SequenceTooShort { needed, available } => write!(
                f,
                "secret sequence too short: region needs {needed} values, secret has {available}"
            ),
            Self::LengthMismatch { expected, actual } => {
                write!(f, "sequence length mismatch: expected {expected}, got {actual}")
            }
            Self::DegenerateTessellation { block_size } => write!(
                f,
                "block size {block_size} admits no cluster size that tiles the image exactly"
            ),
            Self::FileModified(path) => {
                write!(f, "output target changed before write: {}", path.display())
            }
        }
    }
}

impl Error for RenderError {}

/// Walk an `anyhow` chain and return the first `RenderError`, if any.
pub fn find_render_error(error: &anyhow::Error) -> Option<&RenderError> {
    error
        .chain()
        .find_map(|cause| cause.downcast_ref::<RenderError>())
}

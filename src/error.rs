use thiserror::Error;

/// The two ways the detector can fail hard enough to abort the process.
///
/// Everything else (ring full, IPC send failure, logger short write,
/// unknown config key) is a [`TRANSIENT_IO`/`CONFIG_WARN`] class that is
/// absorbed locally and never reaches this type.
///
/// [`TRANSIENT_IO`/`CONFIG_WARN`]: crate
#[derive(Debug, Error)]
pub enum DetectorError {
    /// PMU could not open its mandatory counters, the ring buffer could
    /// not be allocated, or the alert sink could not be opened.
    #[error("initialization failed: {0}")]
    FatalInit(String),

    /// The learning phase ended without collecting a single sample.
    #[error("learning phase collected zero samples: {0}")]
    FatalRuntime(String),
}

impl DetectorError {
    /// Process exit code for this failure class.
    pub fn exit_code(&self) -> i32 {
        match self {
            DetectorError::FatalInit(_) => 1,
            DetectorError::FatalRuntime(_) => 2,
        }
    }
}

pub type Result<T> = std::result::Result<T, DetectorError>;

use thiserror::Error;

/// Synchronous submission-path errors. These leave no partial state behind;
/// everything that can fail after submission is reported through the job's
/// completion fence instead.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum SubmitError {
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("out of memory")]
    OutOfMemory,
}

/// The ring's packet emitter rejected a submission.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("emitter rejected submission: {0}")]
pub struct EmitError(pub String);

/// The device reset primitive failed. The VRAM-lost epoch is still bumped
/// and the recovery mutex still released when this is returned.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("device reset failed: {0}")]
pub struct ResetError(pub String);

/// A power quiesce/resume step failed. Best-effort: never fatal to this
/// engine, only logged.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("power transition failed: {0}")]
pub struct PowerError(pub String);

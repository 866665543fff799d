//! Error type for the compute device layer.

use thiserror::Error;

/// Errors surfaced by device, resource and command operations.
///
/// Handle errors are always recoverable: a stale lookup reports
/// [`GpuError::InvalidHandle`] instead of touching freed state.
#[derive(Debug, Error)]
pub enum GpuError {
    /// A handle was stale (freed and possibly reused) or never valid.
    #[error("stale or invalid {kind} handle")]
    InvalidHandle { kind: &'static str },

    /// The adapter does not expose the minimum feature set.
    #[error("unsupported hardware: {0}")]
    UnsupportedHardware(String),

    /// No resource was supplied for a binding slot the shader declares.
    #[error("binding mismatch: no resource bound for binding {binding}, array index {index}")]
    BindingMismatch { binding: u32, index: u32 },

    /// A buffer binding offset violates the device's storage buffer alignment.
    #[error("buffer binding offset {offset} not aligned to {alignment}")]
    UnalignedBindingOffset { offset: u64, alignment: u64 },

    /// A fixed-capacity scratch array overflowed. The bound is part of the
    /// device contract and documented on the constant it mirrors.
    #[error("hardcoded limit reached: {what} (limit {limit})")]
    LimitReached { what: &'static str, limit: usize },

    /// Shader module could not be parsed or validated for reflection.
    #[error("shader reflection failed: {0}")]
    Reflection(String),

    /// A command buffer outlived the device it was recorded against.
    #[error("command buffer refers to a destroyed device")]
    DeviceGone,

    /// Command recorded outside a begin/end bracket, or submit of an open buffer.
    #[error("command buffer is not in the {expected} state")]
    RecordState { expected: &'static str },

    /// No pipeline bound at dispatch or binding update.
    #[error("no compute pipeline bound")]
    NoPipelineBound,

    /// Mapping a buffer for host access failed.
    #[error("buffer map failed: {0}")]
    MapFailed(String),

    /// Buffer is not mapped but a mapped-memory operation was issued.
    #[error("buffer is not mapped")]
    NotMapped,

    /// Push-constant data does not match the reflected block size.
    #[error("push constant size {pushed} does not match reflected block size {reflected}")]
    PushConstantSize { pushed: u32, reflected: u32 },
}

pub type GpuResult<T> = Result<T, GpuError>;

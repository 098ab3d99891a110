//! Core types shared by the picam server and client: media vocabulary and tracing setup.

pub mod media;
pub mod tracing;

pub use media::{
    FOCUS_RANGE, ImageFormat, MediaError, RECORDING_EXTENSION, Resolution, ResolutionBounds,
    check_focus_length,
};
pub use tracing::{TracingConfig, TracingError, TracingOutputFormat, init_tracing};

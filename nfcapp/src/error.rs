use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Clone)]
pub enum LabError {
    #[error("sample rate must be greater than zero")]
    InvalidSampleRate,

    #[error("no technology is enabled, nothing to decode")]
    NothingEnabled,

    #[error("power level threshold {0} is outside (0, 1)")]
    InvalidPowerThreshold(f32),

    #[error("modulation threshold for {tech} is contradictory: min {min}, max {max}")]
    InvalidModulationThreshold {
        tech: &'static str,
        min: f32,
        max: f32,
    },

    #[error("correlation threshold for {tech} is outside (0, 1): {value}")]
    InvalidCorrelationThreshold { tech: &'static str, value: f32 },

    #[error("capture file could not be opened: {0}")]
    InvalidCapturePath(PathBuf),

    #[error("failed to read capture file: {0}")]
    CaptureReadFailed(PathBuf),

    #[error("pipeline is no longer running")]
    PipelineClosed,
}

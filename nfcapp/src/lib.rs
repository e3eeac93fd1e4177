#![doc = include_str!("../README.md")]

pub mod config;
pub mod error;
pub mod pipeline;
pub mod source;

#[cfg(test)]
mod test_util;

// Frame types needed to consume pipeline output without importing the core
pub use nfccore::frame::{FrameFlags, FramePhase, FrameTech, FrameType, RawFrame};
pub use nfccore::tree::{FieldValue, ProtoFlags, ProtocolFrame};

//! Protocol parsers: lift raw frames into labelled field trees.

use crate::frame::{FrameFlags, FrameTech, FrameType, RawFrame};
use crate::tree::{FieldValue, ProtoFlags, ProtocolFrame};

pub mod iso7816;
pub mod isodep;
pub mod nfca;
pub mod nfcb;
pub mod nfcf;
pub mod nfcv;

use iso7816::Iso7816Parser;
use nfca::NfcAParser;
use nfcb::NfcBParser;
use nfcf::NfcFParser;
use nfcv::NfcVParser;

/// Frame-level flags derived from the raw frame type and error bits.
pub(crate) fn frame_flags(frame: &RawFrame) -> ProtoFlags {
    let mut flags = ProtoFlags::NONE;
    flags |= match frame.frame_type() {
        FrameType::NfcPollFrame | FrameType::IsoRequestFrame => ProtoFlags::REQUEST_FRAME,
        FrameType::NfcListenFrame | FrameType::IsoResponseFrame => ProtoFlags::RESPONSE_FRAME,
        FrameType::IsoAtrFrame => ProtoFlags::STARTUP_FRAME,
        FrameType::IsoExchangeFrame => ProtoFlags::EXCHANGE_FRAME,
        _ => ProtoFlags::NONE,
    };
    if frame.has_flags(FrameFlags::CRC_ERROR) {
        flags |= ProtoFlags::CRC_ERROR;
    }
    if frame.has_flags(FrameFlags::PARITY_ERROR) {
        flags |= ProtoFlags::PARITY_ERROR;
    }
    if frame.has_flags(FrameFlags::SYNC_ERROR) {
        flags |= ProtoFlags::SYNC_ERROR;
    }
    if frame.has_flags(FrameFlags::ENCRYPTED) {
        flags |= ProtoFlags::ENCRYPTED;
    }
    flags
}

/// Root node carrying the full frame payload.
pub(crate) fn build_root(name: &str, frame: &RawFrame) -> ProtocolFrame {
    ProtocolFrame::new(
        name,
        frame_flags(frame),
        FieldValue::Bytes(frame.payload().to_vec()),
        Some((0, frame.len())),
    )
}

/// Field child holding the bytes of a payload range.
pub(crate) fn child_bytes(frame: &RawFrame, name: &str, start: usize, len: usize) -> ProtocolFrame {
    let end = (start + len).min(frame.len());
    let start = start.min(frame.len());
    ProtocolFrame::new(
        name,
        ProtoFlags::FRAME_FIELD,
        FieldValue::Bytes(frame.payload()[start..end].to_vec()),
        Some((start, end - start)),
    )
}

/// Field child holding a decoded number.
pub(crate) fn child_num(name: &str, value: u64, start: usize, len: usize) -> ProtocolFrame {
    ProtocolFrame::new(
        name,
        ProtoFlags::FRAME_FIELD,
        FieldValue::Number(value),
        Some((start, len)),
    )
}

/// Informational child without a byte range of its own.
pub(crate) fn info(name: &str, text: impl Into<String>) -> ProtocolFrame {
    ProtocolFrame::new(
        name,
        ProtoFlags::FIELD_INFO,
        FieldValue::Text(text.into()),
        None,
    )
}

/// Root for an unrecognised command: `CMD xx` with the raw payload child.
pub(crate) fn unknown_root(frame: &RawFrame, command: u8) -> ProtocolFrame {
    let mut root = build_root(&format!("CMD {command:02x}"), frame);
    root.set_flag(ProtoFlags::PARSE_ERROR);
    if frame.len() > 0 {
        root.push(child_bytes(frame, "Data", 0, frame.len()));
    }
    root
}

/// Root for an unnamed response frame: raw payload only.
pub(crate) fn raw_response_root(frame: &RawFrame) -> ProtocolFrame {
    let mut root = build_root("", frame);
    if frame.len() > 0 {
        root.push(child_bytes(frame, "Data", 0, frame.len()));
    }
    root
}

/// Dictionary of common ISO 7816-4 status words.
pub(crate) fn status_word_text(sw1: u8, sw2: u8) -> Option<&'static str> {
    Some(match (sw1, sw2) {
        (0x90, 0x00) => "normal processing",
        (0x61, _) => "response bytes still available",
        (0x62, 0x83) => "selected file invalidated",
        (0x63, 0x00) => "authentication failed",
        (0x65, 0x81) => "memory failure",
        (0x67, 0x00) => "wrong length",
        (0x69, 0x82) => "security status not satisfied",
        (0x69, 0x85) => "conditions of use not satisfied",
        (0x6A, 0x81) => "function not supported",
        (0x6A, 0x82) => "file or application not found",
        (0x6A, 0x86) => "incorrect P1-P2",
        (0x6C, _) => "wrong Le field",
        (0x6D, 0x00) => "instruction not supported",
        (0x6E, 0x00) => "class not supported",
        (0x6F, 0x00) => "no precise diagnosis",
        _ => return None,
    })
}

/// Stateful parser set covering every supported technology.
///
/// Per-session state (chained blocks, last command) lives in the individual
/// parsers; `reset` drops it everywhere.
pub struct ProtocolParser {
    nfca: NfcAParser,
    nfcb: NfcBParser,
    nfcf: NfcFParser,
    nfcv: NfcVParser,
    iso7816: Iso7816Parser,
}

impl Default for ProtocolParser {
    fn default() -> Self {
        Self::new()
    }
}

impl ProtocolParser {
    pub fn new() -> Self {
        Self {
            nfca: NfcAParser::new(),
            nfcb: NfcBParser::new(),
            nfcf: NfcFParser::new(),
            nfcv: NfcVParser::new(),
            iso7816: Iso7816Parser::new(),
        }
    }

    pub fn reset(&mut self) {
        self.nfca.reset();
        self.nfcb.reset();
        self.nfcf.reset();
        self.nfcv.reset();
        self.iso7816.reset();
    }

    /// Build the field tree for a frame. Carrier events carry no protocol
    /// content and yield `None`.
    pub fn parse(&mut self, frame: &RawFrame) -> Option<ProtocolFrame> {
        match frame.tech() {
            FrameTech::NfcA => Some(self.nfca.parse(frame)),
            FrameTech::NfcB => Some(self.nfcb.parse(frame)),
            FrameTech::NfcF => Some(self.nfcf.parse(frame)),
            FrameTech::NfcV => Some(self.nfcv.parse(frame)),
            FrameTech::Iso7816 => Some(self.iso7816.parse(frame)),
            FrameTech::NfcNone => None,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::frame::{FrameBuilder, FramePhase};

    pub(crate) fn poll_frame(tech: FrameTech, bytes: &[u8]) -> RawFrame {
        let mut b = FrameBuilder::new(tech, FrameType::NfcPollFrame);
        b.extend(bytes);
        b.set_phase(FramePhase::Selection);
        b.finalize(0.0, 0.0, 0, 0)
    }

    pub(crate) fn listen_frame(tech: FrameTech, bytes: &[u8]) -> RawFrame {
        let mut b = FrameBuilder::new(tech, FrameType::NfcListenFrame);
        b.extend(bytes);
        b.set_phase(FramePhase::Selection);
        b.finalize(0.0, 0.0, 0, 0)
    }

    #[test]
    fn carrier_frames_have_no_tree() {
        let b = FrameBuilder::new(FrameTech::NfcNone, FrameType::NfcCarrierOn);
        let frame = b.finalize(0.0, 0.0, 0, 0);
        let mut parser = ProtocolParser::new();
        assert!(parser.parse(&frame).is_none());
    }

    #[test]
    fn error_flags_propagate_to_root() {
        let mut b = FrameBuilder::new(FrameTech::NfcA, FrameType::NfcListenFrame);
        b.extend(&[0x05, 0x00]);
        b.set_flag(FrameFlags::CRC_ERROR);
        let frame = b.finalize(0.0, 0.0, 0, 0);
        let mut parser = ProtocolParser::new();
        let tree = parser.parse(&frame).unwrap();
        assert!(tree.flags().contains(ProtoFlags::CRC_ERROR));
    }

    #[test]
    fn status_words() {
        assert_eq!(status_word_text(0x90, 0x00), Some("normal processing"));
        assert_eq!(status_word_text(0x6A, 0x82), Some("file or application not found"));
        assert_eq!(status_word_text(0x13, 0x37), None);
    }

    #[test]
    fn unknown_command_keeps_raw_bytes() {
        let frame = poll_frame(FrameTech::NfcF, &[0x05, 0xF7, 0x00, 0x00, 0x00]);
        let mut parser = ProtocolParser::new();
        let tree = parser.parse(&frame).unwrap();
        assert!(tree.flags().contains(ProtoFlags::PARSE_ERROR) || !tree.children().is_empty());
        assert_eq!(tree.flatten(frame.payload()), frame.payload());
    }
}

//! NFC-F (FeliCa) frame parser.

use crate::frame::RawFrame;
use crate::parser::{build_root, child_bytes, child_num, info};
use crate::tree::{ProtoFlags, ProtocolFrame};

const CMD_POLLING: u8 = 0x00;
const CMD_POLLING_RES: u8 = 0x01;

pub struct NfcFParser {
    last_command: u8,
}

impl Default for NfcFParser {
    fn default() -> Self {
        Self::new()
    }
}

impl NfcFParser {
    pub fn new() -> Self {
        Self { last_command: 0 }
    }

    pub fn reset(&mut self) {
        self.last_command = 0;
    }

    pub fn parse(&mut self, frame: &RawFrame) -> ProtocolFrame {
        if frame.len() < 2 {
            let mut root = build_root("", frame);
            if frame.len() > 0 {
                root.push(child_bytes(frame, "Data", 0, frame.len()));
            }
            return root;
        }
        let command = frame.payload()[1];
        let tree = match command {
            CMD_POLLING => self.parse_polling(frame),
            CMD_POLLING_RES => self.parse_polling_response(frame),
            other => self.parse_generic(frame, other),
        };
        if frame.is_poll() {
            self.last_command = command;
        } else {
            self.last_command = 0;
        }
        tree
    }

    fn parse_polling(&self, frame: &RawFrame) -> ProtocolFrame {
        let payload = frame.payload();
        let mut root = build_root("REQC", frame);
        root.push(child_num("LEN", payload[0] as u64, 0, 1));
        root.push(child_num("CMD", payload[1] as u64, 1, 1));
        if frame.len() >= 6 {
            root.push(child_bytes(frame, "SystemCode", 2, 2));
            root.push(child_num("RequestCode", payload[4] as u64, 4, 1));
            let mut slots = child_num("TimeSlot", payload[5] as u64, 5, 1);
            slots.push(info("Slots", format!("{}", payload[5] as u64 + 1)));
            root.push(slots);
        } else if frame.len() > 2 {
            root.push(child_bytes(frame, "Data", 2, frame.len() - 2));
        }
        self.push_crc(frame, &mut root, 6);
        root
    }

    fn parse_polling_response(&self, frame: &RawFrame) -> ProtocolFrame {
        let payload = frame.payload();
        let mut root = build_root("ATQC", frame);
        root.push(child_num("LEN", payload[0] as u64, 0, 1));
        root.push(child_num("CMD", payload[1] as u64, 1, 1));
        if frame.len() >= 18 {
            root.push(child_bytes(frame, "NFCID2", 2, 8));
            root.push(child_bytes(frame, "PAD", 10, 8));
            if frame.len() >= 22 {
                root.push(child_bytes(frame, "RD", 18, 2));
            }
            self.push_crc(frame, &mut root, 18);
        } else if frame.len() > 2 {
            root.push(child_bytes(frame, "Data", 2, frame.len() - 2));
            self.push_crc(frame, &mut root, frame.len());
        }
        root
    }

    fn parse_generic(&self, frame: &RawFrame, command: u8) -> ProtocolFrame {
        let mut root = build_root(&format!("CMD {command:02x}"), frame);
        root.set_flag(ProtoFlags::PARSE_ERROR);
        let payload = frame.payload();
        root.push(child_num("LEN", payload[0] as u64, 0, 1));
        root.push(child_num("CMD", payload[1] as u64, 1, 1));
        if frame.len() > 4 {
            root.push(child_bytes(frame, "Data", 2, frame.len() - 4));
        }
        self.push_crc(frame, &mut root, 2);
        root
    }

    fn push_crc(&self, frame: &RawFrame, root: &mut ProtocolFrame, from: usize) {
        if frame.len() >= from + 2 {
            let payload = frame.payload();
            // FeliCa transmits the CRC big-endian
            let crc = u16::from_be_bytes([payload[frame.len() - 2], payload[frame.len() - 1]]);
            root.push(child_num("CRC", crc as u64, frame.len() - 2, 2));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crc::crc_f;
    use crate::frame::FrameTech;
    use crate::parser::tests::{listen_frame, poll_frame};

    fn felica(payload: &[u8]) -> Vec<u8> {
        let mut bytes = vec![payload.len() as u8 + 1];
        bytes.extend_from_slice(payload);
        let crc = crc_f(&bytes);
        bytes.extend_from_slice(&crc.to_be_bytes());
        bytes
    }

    #[test]
    fn polling_request() {
        let mut parser = NfcFParser::new();
        let frame_bytes = felica(&[0x00, 0xFF, 0xFF, 0x01, 0x03]);
        let frame = poll_frame(FrameTech::NfcF, &frame_bytes);
        let tree = parser.parse(&frame);
        assert_eq!(tree.name(), "REQC");
        assert!(tree.child("SystemCode").is_some());
        assert_eq!(tree.flatten(&frame_bytes), frame_bytes);
    }

    #[test]
    fn polling_response() {
        let mut parser = NfcFParser::new();
        let frame_bytes = felica(&[
            0x01, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0xAA, 0xBB, 0xCC, 0xDD, 0xEE,
            0xFF, 0x00, 0x11,
        ]);
        let frame = listen_frame(FrameTech::NfcF, &frame_bytes);
        let tree = parser.parse(&frame);
        assert_eq!(tree.name(), "ATQC");
        assert!(tree.child("NFCID2").is_some());
        assert_eq!(tree.flatten(&frame_bytes), frame_bytes);
    }

    #[test]
    fn generic_command() {
        let mut parser = NfcFParser::new();
        let frame_bytes = felica(&[0x06, 0x01, 0x02]);
        let frame = poll_frame(FrameTech::NfcF, &frame_bytes);
        let tree = parser.parse(&frame);
        assert_eq!(tree.name(), "CMD 06");
        assert_eq!(tree.flatten(&frame_bytes), frame_bytes);
    }
}

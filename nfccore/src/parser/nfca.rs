//! NFC-A command and response parser, ISO/IEC 14443-3A activation plus
//! ISO-DEP above it.

use crate::frame::{FrameFlags, RawFrame};
use crate::parser::isodep::{is_block, IsoDep};
use crate::parser::{build_root, child_bytes, child_num, info, raw_response_root, unknown_root};
use crate::tree::ProtocolFrame;

const CMD_REQA: u8 = 0x26;
const CMD_HLTA: u8 = 0x50;
const CMD_WUPA: u8 = 0x52;
const CMD_AUTH1: u8 = 0x60;
const CMD_AUTH2: u8 = 0x61;
const CMD_SEL1: u8 = 0x93;
const CMD_SEL2: u8 = 0x95;
const CMD_SEL3: u8 = 0x97;
const CMD_PPS: u8 = 0xD0;
const CMD_RATS: u8 = 0xE0;

pub struct NfcAParser {
    last_command: u8,
    isodep: IsoDep,
}

impl Default for NfcAParser {
    fn default() -> Self {
        Self::new()
    }
}

impl NfcAParser {
    pub fn new() -> Self {
        Self {
            last_command: 0,
            isodep: IsoDep::new(),
        }
    }

    pub fn reset(&mut self) {
        self.last_command = 0;
        self.isodep.reset();
    }

    pub fn parse(&mut self, frame: &RawFrame) -> ProtocolFrame {
        if frame.has_flags(FrameFlags::ENCRYPTED) {
            let mut root = build_root("(encrypted)", frame);
            if frame.len() > 0 {
                root.push(child_bytes(frame, "Data", 0, frame.len()));
            }
            return root;
        }
        if frame.is_poll() {
            self.parse_poll(frame)
        } else {
            self.parse_listen(frame)
        }
    }

    fn parse_poll(&mut self, frame: &RawFrame) -> ProtocolFrame {
        let Some(&command) = frame.payload().first() else {
            return build_root("", frame);
        };

        let tree = match command {
            CMD_REQA if frame.has_flags(FrameFlags::SHORT_FRAME) => build_root("REQA", frame),
            CMD_WUPA if frame.has_flags(FrameFlags::SHORT_FRAME) => build_root("WUPA", frame),
            CMD_HLTA => self.parse_hlta(frame),
            CMD_AUTH1 | CMD_AUTH2 => self.parse_auth(frame, command),
            CMD_SEL1 | CMD_SEL2 | CMD_SEL3 => self.parse_select(frame, command),
            CMD_RATS => self.parse_rats(frame),
            CMD_PPS..=0xDF => self.parse_pps(frame, command),
            pcb if is_block(pcb) => match self.isodep.parse(frame) {
                Some(tree) => tree,
                None => unknown_root(frame, command),
            },
            other => unknown_root(frame, other),
        };
        self.last_command = command;
        tree
    }

    fn parse_listen(&mut self, frame: &RawFrame) -> ProtocolFrame {
        if frame.is_empty() {
            return raw_response_root(frame);
        }
        let command = self.last_command;
        let tree = match command {
            CMD_REQA | CMD_WUPA => self.parse_atqa(frame),
            CMD_SEL1 | CMD_SEL2 | CMD_SEL3 => self.parse_select_response(frame),
            CMD_RATS => self.parse_ats(frame),
            CMD_PPS..=0xDF => {
                let mut root = build_root("PPS", frame);
                root.push(child_num("PPS", frame.payload()[0] as u64, 0, 1));
                self.push_crc(frame, &mut root, 1);
                root
            }
            CMD_AUTH1 | CMD_AUTH2 => {
                let mut root = build_root("AUTH", frame);
                if frame.len() > 0 {
                    root.push(child_bytes(frame, "Token", 0, frame.len()));
                }
                root
            }
            pcb if is_block(pcb) => match self.isodep.parse(frame) {
                Some(tree) => tree,
                None => raw_response_root(frame),
            },
            _ => {
                // responses to ISO-DEP exchanges carry their own PCB
                match frame.payload().first() {
                    Some(&pcb) if is_block(pcb) => match self.isodep.parse(frame) {
                        Some(tree) => tree,
                        None => raw_response_root(frame),
                    },
                    _ => raw_response_root(frame),
                }
            }
        };
        self.last_command = 0;
        tree
    }

    fn parse_atqa(&self, frame: &RawFrame) -> ProtocolFrame {
        let mut root = build_root("ATQA", frame);
        if frame.len() < 2 {
            return root;
        }
        let atqa = u16::from_le_bytes([frame.payload()[0], frame.payload()[1]]);
        let mut field = child_num("ATQA", atqa as u64, 0, 2);
        let uid_size = match (atqa >> 6) & 0x3 {
            0 => "single",
            1 => "double",
            2 => "triple",
            _ => "reserved",
        };
        field.push(info("UID-Size", uid_size));
        field.push(info("Anticoll", format!("{:05b}", atqa & 0x1F)));
        if atqa & 0x0F00 != 0 {
            field.push(info("Proprietary", format!("{:x}", (atqa >> 8) & 0xF)));
        }
        root.push(field);
        if frame.len() > 2 {
            root.push(child_bytes(frame, "Data", 2, frame.len() - 2));
        }
        root
    }

    fn parse_hlta(&self, frame: &RawFrame) -> ProtocolFrame {
        let mut root = build_root("HLTA", frame);
        root.push(child_num("CMD", frame.payload()[0] as u64, 0, 1));
        if frame.len() > 1 {
            root.push(child_num("Param", frame.payload()[1] as u64, 1, 1));
        }
        self.push_crc(frame, &mut root, 2);
        root
    }

    fn parse_auth(&self, frame: &RawFrame, command: u8) -> ProtocolFrame {
        let name = if command == CMD_AUTH1 { "AUTH1" } else { "AUTH2" };
        let mut root = build_root(name, frame);
        root.push(child_num("CMD", command as u64, 0, 1));
        if frame.len() > 1 {
            root.push(child_num("Block", frame.payload()[1] as u64, 1, 1));
        }
        self.push_crc(frame, &mut root, 2);
        root
    }

    fn parse_select(&self, frame: &RawFrame, command: u8) -> ProtocolFrame {
        let level = match command {
            CMD_SEL1 => 1,
            CMD_SEL2 => 2,
            _ => 3,
        };
        let mut root = build_root(&format!("SEL{level}"), frame);
        let payload = frame.payload();
        root.push(child_num("CMD", command as u64, 0, 1));
        if frame.len() < 2 {
            return root;
        }
        let nvb = payload[1];
        let mut nvb_node = child_num("NVB", nvb as u64, 1, 1);
        nvb_node.push(info("Bytes", format!("{}", nvb >> 4)));
        root.push(nvb_node);
        if frame.len() >= 9 {
            // full select with UID, BCC and CRC
            root.push(child_bytes(frame, "UID", 2, 4));
            root.push(child_num("BCC", payload[6] as u64, 6, 1));
            self.push_crc(frame, &mut root, 7);
        } else if frame.len() > 2 {
            root.push(child_bytes(frame, "UID", 2, frame.len() - 2));
        }
        root
    }

    fn parse_select_response(&self, frame: &RawFrame) -> ProtocolFrame {
        let payload = frame.payload();
        if frame.len() == 5 {
            // anticollision UID CLn + BCC
            let mut root = build_root("UID", frame);
            root.push(child_bytes(frame, "UID", 0, 4));
            root.push(child_num("BCC", payload[4] as u64, 4, 1));
            return root;
        }
        let mut root = build_root("SAK", frame);
        if !frame.is_empty() {
            let sak = payload[0];
            let mut node = child_num("SAK", sak as u64, 0, 1);
            if sak & 0x20 != 0 {
                node.push(info("ISO-DEP", "compliant with ISO 14443-4"));
            }
            if sak & 0x04 != 0 {
                node.push(info("UID", "incomplete, cascade further"));
            }
            root.push(node);
        }
        self.push_crc(frame, &mut root, 1);
        root
    }

    fn parse_rats(&self, frame: &RawFrame) -> ProtocolFrame {
        let mut root = build_root("RATS", frame);
        let payload = frame.payload();
        root.push(child_num("CMD", payload[0] as u64, 0, 1));
        if frame.len() > 1 {
            let param = payload[1];
            let mut node = child_num("Param", param as u64, 1, 1);
            node.push(info("FSDI", format!("{}", param >> 4)));
            node.push(info("CID", format!("{}", param & 0x0F)));
            root.push(node);
        }
        self.push_crc(frame, &mut root, 2);
        root
    }

    fn parse_ats(&self, frame: &RawFrame) -> ProtocolFrame {
        let mut root = build_root("ATS", frame);
        let payload = frame.payload();
        if frame.is_empty() {
            return root;
        }
        root.push(child_num("TL", payload[0] as u64, 0, 1));
        let tl = payload[0] as usize;
        let mut offset = 1;
        if tl >= 2 && frame.len() > 1 {
            let t0 = payload[1];
            let mut node = child_num("T0", t0 as u64, 1, 1);
            node.push(info("FSCI", format!("{}", t0 & 0x0F)));
            root.push(node);
            offset = 2;
            for (bit, name) in [(0x10u8, "TA1"), (0x20, "TB1"), (0x40, "TC1")] {
                if t0 & bit != 0 && offset < frame.len() {
                    root.push(child_num(name, payload[offset] as u64, offset, 1));
                    offset += 1;
                }
            }
            if tl > offset && frame.len() > offset {
                let hist = (tl - offset).min(frame.len() - offset);
                root.push(child_bytes(frame, "Historical", offset, hist));
                offset += hist;
            }
        }
        self.push_crc(frame, &mut root, offset);
        root
    }

    fn parse_pps(&self, frame: &RawFrame, command: u8) -> ProtocolFrame {
        let mut root = build_root("PPS", frame);
        let payload = frame.payload();
        let mut node = child_num("PPSS", command as u64, 0, 1);
        node.push(info("CID", format!("{}", command & 0x0F)));
        root.push(node);
        let mut offset = 1;
        if frame.len() > 1 {
            let pps0 = payload[1];
            root.push(child_num("PPS0", pps0 as u64, 1, 1));
            offset = 2;
            if pps0 & 0x10 != 0 && frame.len() > 2 {
                root.push(child_num("PPS1", payload[2] as u64, 2, 1));
                offset = 3;
            }
        }
        self.push_crc(frame, &mut root, offset);
        root
    }

    /// Append the trailing CRC field when the payload extends past `from`.
    fn push_crc(&self, frame: &RawFrame, root: &mut ProtocolFrame, from: usize) {
        if frame.len() >= from + 2 {
            let payload = frame.payload();
            let crc = u16::from_le_bytes([payload[frame.len() - 2], payload[frame.len() - 1]]);
            root.push(child_num("CRC", crc as u64, frame.len() - 2, 2));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crc::crc_a;
    use crate::frame::{FrameBuilder, FrameTech, FrameType};
    use crate::parser::tests::{listen_frame, poll_frame};
    use crate::tree::{FieldValue, ProtoFlags};

    fn short_poll(byte: u8) -> RawFrame {
        let mut b = FrameBuilder::new(FrameTech::NfcA, FrameType::NfcPollFrame);
        b.append(byte);
        b.set_flag(FrameFlags::SHORT_FRAME);
        b.finalize(0.0, 0.0, 0, 0)
    }

    #[test]
    fn reqa_atqa_sequence() {
        let mut parser = NfcAParser::new();
        let reqa = parser.parse(&short_poll(0x26));
        assert_eq!(reqa.name(), "REQA");
        assert!(reqa.flags().contains(ProtoFlags::REQUEST_FRAME));

        let atqa = parser.parse(&listen_frame(FrameTech::NfcA, &[0x44, 0x00]));
        assert_eq!(atqa.name(), "ATQA");
        let field = atqa.child("ATQA").unwrap();
        assert_eq!(field.value(), &FieldValue::Number(0x0044));
        let uid_size = field.child("UID-Size").unwrap();
        assert_eq!(uid_size.value(), &FieldValue::Text("double".into()));
        assert!(field.child("Anticoll").is_some());
    }

    #[test]
    fn select_and_sak() {
        let mut parser = NfcAParser::new();
        let mut sel = vec![0x93, 0x70, 0x04, 0x03, 0x02, 0x01, 0x04];
        let crc = crc_a(&sel);
        sel.extend_from_slice(&crc.to_le_bytes());
        let tree = parser.parse(&poll_frame(FrameTech::NfcA, &sel));
        assert_eq!(tree.name(), "SEL1");
        assert!(tree.child("UID").is_some());
        assert!(tree.child("CRC").is_some());
        assert_eq!(tree.flatten(&sel), sel);

        let sak = parser.parse(&listen_frame(FrameTech::NfcA, &[0x20, 0xFC, 0x70]));
        assert_eq!(sak.name(), "SAK");
        assert!(sak.child("SAK").unwrap().child("ISO-DEP").is_some());
    }

    #[test]
    fn rats_and_ats() {
        let mut parser = NfcAParser::new();
        let tree = parser.parse(&poll_frame(FrameTech::NfcA, &[0xE0, 0x80, 0x31, 0x73]));
        assert_eq!(tree.name(), "RATS");
        let param = tree.child("Param").unwrap();
        assert_eq!(param.child("FSDI").unwrap().value(), &FieldValue::Text("8".into()));

        let ats = parser.parse(&listen_frame(
            FrameTech::NfcA,
            &[0x05, 0x78, 0x80, 0x70, 0x02, 0xAA, 0xBB],
        ));
        assert_eq!(ats.name(), "ATS");
        assert!(ats.child("T0").is_some());
        assert!(ats.child("TA1").is_some());
    }

    #[test]
    fn unknown_command_is_flagged() {
        let mut parser = NfcAParser::new();
        let tree = parser.parse(&poll_frame(FrameTech::NfcA, &[0x41, 0x00]));
        assert_eq!(tree.name(), "CMD 41");
        assert!(tree.flags().contains(ProtoFlags::PARSE_ERROR));
        assert_eq!(tree.flatten(&[0x41, 0x00]), vec![0x41, 0x00]);
    }

    #[test]
    fn encrypted_frames_not_decoded() {
        let mut parser = NfcAParser::new();
        let mut b = FrameBuilder::new(FrameTech::NfcA, FrameType::NfcPollFrame);
        b.extend(&[0x12, 0x34]);
        b.set_flag(FrameFlags::ENCRYPTED);
        let tree = parser.parse(&b.finalize(0.0, 0.0, 0, 0));
        assert_eq!(tree.name(), "(encrypted)");
        assert!(tree.flags().contains(ProtoFlags::ENCRYPTED));
    }
}

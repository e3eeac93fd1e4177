//! NFC-V (ISO/IEC 15693-3) command and response parser.

use crate::frame::RawFrame;
use crate::parser::{build_root, child_bytes, child_num, info, raw_response_root};
use crate::tree::{ProtoFlags, ProtocolFrame};

const REQ_FLAG_INVENTORY: u8 = 0x04;
const REQ_FLAG_ADDRESS: u8 = 0x20;
const RES_FLAG_ERROR: u8 = 0x01;

fn command_name(command: u8) -> Option<&'static str> {
    Some(match command {
        0x01 => "Inventory",
        0x02 => "StayQuiet",
        0x20 => "ReadSingle",
        0x21 => "WriteSingle",
        0x22 => "LockBlock",
        0x23 => "ReadMultiple",
        0x24 => "WriteMultiple",
        0x25 => "Select",
        0x26 => "ResetToReady",
        0x27 => "WriteAFI",
        0x28 => "LockAFI",
        0x29 => "WriteDSFID",
        0x2A => "LockDSFID",
        0x2B => "GetSystemInfo",
        0x2C => "GetSecurity",
        _ => return None,
    })
}

fn error_name(code: u8) -> &'static str {
    match code {
        0x01 => "command not supported",
        0x02 => "command not recognised",
        0x03 => "option not supported",
        0x0F => "unspecified error",
        0x10 => "block not available",
        0x11 => "block already locked",
        0x12 => "block locked, write rejected",
        0x13 => "block write failed",
        0x14 => "block lock failed",
        _ => "reserved",
    }
}

pub struct NfcVParser {
    last_command: u8,
}

impl Default for NfcVParser {
    fn default() -> Self {
        Self::new()
    }
}

impl NfcVParser {
    pub fn new() -> Self {
        Self { last_command: 0 }
    }

    pub fn reset(&mut self) {
        self.last_command = 0;
    }

    pub fn parse(&mut self, frame: &RawFrame) -> ProtocolFrame {
        if frame.is_poll() {
            self.parse_poll(frame)
        } else {
            self.parse_listen(frame)
        }
    }

    fn parse_poll(&mut self, frame: &RawFrame) -> ProtocolFrame {
        let payload = frame.payload();
        if payload.len() < 2 {
            return raw_response_root(frame);
        }
        let flags = payload[0];
        let command = payload[1];
        self.last_command = command;

        let mut root = match command_name(command) {
            Some(name) => build_root(name, frame),
            None => {
                let mut root = build_root(&format!("CMD {command:02x}"), frame);
                root.set_flag(ProtoFlags::PARSE_ERROR);
                root
            }
        };

        root.push(self.request_flags(flags));
        root.push(child_num("CMD", command as u64, 1, 1));

        let mut offset = 2;
        let crc_start = payload.len().saturating_sub(2).max(offset);
        if flags & REQ_FLAG_ADDRESS != 0 && flags & REQ_FLAG_INVENTORY == 0 {
            // addressed request carries the 8-byte UID first
            if crc_start >= offset + 8 {
                root.push(child_bytes(frame, "UID", offset, 8));
                offset += 8;
            }
        }
        if crc_start > offset {
            root.push(child_bytes(frame, "Param", offset, crc_start - offset));
        }
        self.push_crc(frame, &mut root, crc_start);
        root
    }

    fn parse_listen(&mut self, frame: &RawFrame) -> ProtocolFrame {
        let payload = frame.payload();
        if payload.is_empty() {
            return raw_response_root(frame);
        }
        let flags = payload[0];
        let name = match command_name(self.last_command) {
            Some(name) => name,
            None => "",
        };
        let mut root = build_root(name, frame);

        let mut node = child_num("Flags", flags as u64, 0, 1);
        if flags & RES_FLAG_ERROR != 0 {
            node.push(info("Error", "error flag set"));
        }
        root.push(node);

        let mut offset = 1;
        let crc_start = payload.len().saturating_sub(2).max(offset);
        if flags & RES_FLAG_ERROR != 0 && crc_start > offset {
            let code = payload[offset];
            let mut err = child_num("ErrorCode", code as u64, offset, 1);
            err.push(info("Meaning", error_name(code)));
            root.push(err);
            offset += 1;
        }
        if crc_start > offset {
            root.push(child_bytes(frame, "Data", offset, crc_start - offset));
        }
        self.push_crc(frame, &mut root, crc_start);
        self.last_command = 0;
        root
    }

    fn request_flags(&self, flags: u8) -> ProtocolFrame {
        let mut node = child_num("Flags", flags as u64, 0, 1);
        if flags & 0x01 != 0 {
            node.push(info("Subcarrier", "two subcarriers"));
        }
        if flags & 0x02 != 0 {
            node.push(info("DataRate", "high data rate"));
        }
        if flags & REQ_FLAG_INVENTORY != 0 {
            node.push(info("Inventory", "inventory request"));
        }
        if flags & REQ_FLAG_ADDRESS != 0 {
            node.push(info("Addressed", "UID field present"));
        }
        node
    }

    fn push_crc(&self, frame: &RawFrame, root: &mut ProtocolFrame, from: usize) {
        if frame.len() >= from + 2 && frame.len() >= 3 {
            let payload = frame.payload();
            let crc = u16::from_le_bytes([payload[frame.len() - 2], payload[frame.len() - 1]]);
            root.push(child_num("CRC", crc as u64, frame.len() - 2, 2));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crc::crc_v;
    use crate::frame::FrameTech;
    use crate::parser::tests::{listen_frame, poll_frame};
    use crate::tree::FieldValue;

    fn with_crc(mut bytes: Vec<u8>) -> Vec<u8> {
        let crc = crc_v(&bytes);
        bytes.extend_from_slice(&crc.to_le_bytes());
        bytes
    }

    #[test]
    fn inventory_round() {
        let mut parser = NfcVParser::new();
        let req = with_crc(vec![0x26, 0x01, 0x00]);
        let tree = parser.parse(&poll_frame(FrameTech::NfcV, &req));
        assert_eq!(tree.name(), "Inventory");
        assert!(tree.child("Flags").unwrap().child("Inventory").is_some());
        assert_eq!(tree.flatten(&req), req);

        let resp = with_crc(vec![0x00, 0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0xE0]);
        let tree = parser.parse(&listen_frame(FrameTech::NfcV, &resp));
        assert_eq!(tree.name(), "Inventory");
        assert!(tree.child("Data").is_some());
        assert_eq!(tree.flatten(&resp), resp);
    }

    #[test]
    fn addressed_read_single() {
        let mut parser = NfcVParser::new();
        let req = with_crc(vec![
            0x22, 0x20, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0xE0, 0x04,
        ]);
        let tree = parser.parse(&poll_frame(FrameTech::NfcV, &req));
        assert_eq!(tree.name(), "ReadSingle");
        match tree.child("UID").unwrap().value() {
            FieldValue::Bytes(b) => assert_eq!(b.len(), 8),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(tree.flatten(&req), req);
    }

    #[test]
    fn error_response() {
        let mut parser = NfcVParser::new();
        let req = with_crc(vec![0x22, 0x20, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0xE0, 0x10]);
        parser.parse(&poll_frame(FrameTech::NfcV, &req));
        let resp = with_crc(vec![0x01, 0x10]);
        let tree = parser.parse(&listen_frame(FrameTech::NfcV, &resp));
        let err = tree.child("ErrorCode").unwrap();
        assert_eq!(err.value(), &FieldValue::Number(0x10));
        assert_eq!(tree.flatten(&resp), resp);
    }

    #[test]
    fn unknown_command_flagged() {
        let mut parser = NfcVParser::new();
        let req = with_crc(vec![0x02, 0xA0, 0x07]);
        let tree = parser.parse(&poll_frame(FrameTech::NfcV, &req));
        assert_eq!(tree.name(), "CMD a0");
        assert!(tree.flags().contains(ProtoFlags::PARSE_ERROR));
    }
}

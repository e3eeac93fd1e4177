//! NFC-B command and response parser, ISO/IEC 14443-3B activation plus
//! ISO-DEP above it.

use crate::frame::RawFrame;
use crate::parser::isodep::{is_block, IsoDep};
use crate::parser::{build_root, child_bytes, child_num, info, raw_response_root, unknown_root};
use crate::tree::ProtocolFrame;

const CMD_REQB: u8 = 0x05;
const CMD_ATTRIB: u8 = 0x1D;
const CMD_HLTB: u8 = 0x50;

pub struct NfcBParser {
    last_command: u8,
    isodep: IsoDep,
}

impl Default for NfcBParser {
    fn default() -> Self {
        Self::new()
    }
}

impl NfcBParser {
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
            CMD_REQB => self.parse_reqb(frame),
            CMD_ATTRIB => self.parse_attrib(frame),
            CMD_HLTB => self.parse_hltb(frame),
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
        let tree = match self.last_command {
            CMD_REQB => self.parse_atqb(frame),
            CMD_ATTRIB => self.parse_attrib_response(frame),
            CMD_HLTB => {
                let mut root = build_root("HLTB", frame);
                if frame.len() > 0 {
                    root.push(child_num("Response", frame.payload()[0] as u64, 0, 1));
                }
                self.push_crc(frame, &mut root, 1);
                root
            }
            _ => match frame.payload().first() {
                Some(&pcb) if is_block(pcb) => match self.isodep.parse(frame) {
                    Some(tree) => tree,
                    None => raw_response_root(frame),
                },
                _ => raw_response_root(frame),
            },
        };
        self.last_command = 0;
        tree
    }

    fn parse_reqb(&self, frame: &RawFrame) -> ProtocolFrame {
        let payload = frame.payload();
        let wup = frame.len() > 2 && payload[2] & 0x08 != 0;
        let mut root = build_root(if wup { "WUPB" } else { "REQB" }, frame);
        root.push(child_num("CMD", payload[0] as u64, 0, 1));
        if frame.len() > 1 {
            root.push(child_num("AFI", payload[1] as u64, 1, 1));
        }
        if frame.len() > 2 {
            let param = payload[2];
            let mut node = child_num("Param", param as u64, 2, 1);
            node.push(info("Slots", format!("{}", 1 << (param & 0x07).min(4))));
            if wup {
                node.push(info("WUP", "wake-up request"));
            }
            root.push(node);
        }
        self.push_crc(frame, &mut root, 3);
        root
    }

    fn parse_atqb(&self, frame: &RawFrame) -> ProtocolFrame {
        let mut root = build_root("ATQB", frame);
        if frame.len() < 12 {
            if frame.len() > 0 {
                root.push(child_bytes(frame, "Data", 0, frame.len()));
            }
            return root;
        }
        root.push(child_num("CMD", frame.payload()[0] as u64, 0, 1));
        root.push(child_bytes(frame, "PUPI", 1, 4));
        root.push(child_bytes(frame, "AppData", 5, 4));
        let proto_len = (frame.len() - 9).min(3);
        root.push(child_bytes(frame, "ProtInfo", 9, proto_len));
        self.push_crc(frame, &mut root, 12);
        root
    }

    fn parse_attrib(&self, frame: &RawFrame) -> ProtocolFrame {
        let mut root = build_root("ATTRIB", frame);
        let payload = frame.payload();
        root.push(child_num("CMD", payload[0] as u64, 0, 1));
        if frame.len() < 9 {
            if frame.len() > 1 {
                root.push(child_bytes(frame, "Data", 1, frame.len() - 1));
            }
            return root;
        }
        root.push(child_bytes(frame, "Identifier", 1, 4));
        for (i, name) in ["Param1", "Param2", "Param3", "Param4"].iter().enumerate() {
            root.push(child_num(name, payload[5 + i] as u64, 5 + i, 1));
        }
        if frame.len() > 11 {
            root.push(child_bytes(frame, "INF", 9, frame.len() - 11));
        }
        self.push_crc(frame, &mut root, 9);
        root
    }

    fn parse_attrib_response(&self, frame: &RawFrame) -> ProtocolFrame {
        let mut root = build_root("ATTRIB", frame);
        if frame.len() > 0 {
            let byte = frame.payload()[0];
            let mut node = child_num("MBLI-CID", byte as u64, 0, 1);
            node.push(info("MBLI", format!("{}", byte >> 4)));
            node.push(info("CID", format!("{}", byte & 0x0F)));
            root.push(node);
        }
        if frame.len() > 3 {
            root.push(child_bytes(frame, "INF", 1, frame.len() - 3));
        }
        self.push_crc(frame, &mut root, 1);
        root
    }

    fn parse_hltb(&self, frame: &RawFrame) -> ProtocolFrame {
        let mut root = build_root("HLTB", frame);
        root.push(child_num("CMD", frame.payload()[0] as u64, 0, 1));
        if frame.len() > 4 {
            root.push(child_bytes(frame, "Identifier", 1, 4));
        }
        self.push_crc(frame, &mut root, 5);
        root
    }

    fn push_crc(&self, frame: &RawFrame, root: &mut ProtocolFrame, from: usize) {
        if frame.len() >= from + 2 {
            let payload = frame.payload();
            let crc = u16::from_le_bytes([payload[frame.len() - 2], payload[frame.len() - 1]]);
            root.push(child_num("CRC", crc as u64, frame.len() - 2, 2));
        }
    }
}

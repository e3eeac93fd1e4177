//! ISO-DEP (ISO/IEC 14443-4) block parsing shared by NFC-A and NFC-B,
//! with chained I-block reassembly and T=4 APDU detection.

use crate::frame::RawFrame;
use crate::parser::{build_root, child_bytes, child_num, info, status_word_text};
use crate::tree::{FieldValue, ProtoFlags, ProtocolFrame};

pub(crate) fn is_i_block(pcb: u8) -> bool {
    pcb & 0xC2 == 0x02
}

pub(crate) fn is_r_block(pcb: u8) -> bool {
    pcb & 0xE2 == 0xA2
}

pub(crate) fn is_s_block(pcb: u8) -> bool {
    pcb & 0xC7 == 0xC2
}

pub(crate) fn is_block(pcb: u8) -> bool {
    is_i_block(pcb) || is_r_block(pcb) || is_s_block(pcb)
}

/// Does this byte sequence have a plausible ISO 7816-4 APDU command shape?
pub(crate) fn is_apdu(bytes: &[u8]) -> bool {
    match bytes.len() {
        0..=3 => false,
        4 | 5 => true,
        n => {
            let lc = bytes[4] as usize;
            n == 5 + lc || n == 6 + lc
        }
    }
}

/// Field children for an APDU command located at `base` in the payload.
pub(crate) fn apdu_command_children(bytes: &[u8], base: usize) -> Vec<ProtocolFrame> {
    let mut children = vec![
        child_num("CLA", bytes[0] as u64, base, 1),
        child_num("INS", bytes[1] as u64, base + 1, 1),
        child_num("P1", bytes[2] as u64, base + 2, 1),
        child_num("P2", bytes[3] as u64, base + 3, 1),
    ];
    match bytes.len() {
        4 => {}
        5 => children.push(child_num("Le", bytes[4] as u64, base + 4, 1)),
        n => {
            let lc = bytes[4] as usize;
            children.push(child_num("Lc", lc as u64, base + 4, 1));
            let data_len = lc.min(n - 5);
            children.push(ProtocolFrame::new(
                "Data",
                ProtoFlags::FRAME_FIELD,
                FieldValue::Bytes(bytes[5..5 + data_len].to_vec()),
                Some((base + 5, data_len)),
            ));
            if n == 6 + lc {
                children.push(child_num("Le", bytes[5 + lc] as u64, base + 5 + lc, 1));
            }
        }
    }
    children
}

/// Field children for an APDU response located at `base` in the payload.
pub(crate) fn apdu_response_children(bytes: &[u8], base: usize) -> Vec<ProtocolFrame> {
    let mut children = Vec::new();
    if bytes.len() > 2 {
        children.push(ProtocolFrame::new(
            "Data",
            ProtoFlags::FRAME_FIELD,
            FieldValue::Bytes(bytes[..bytes.len() - 2].to_vec()),
            Some((base, bytes.len() - 2)),
        ));
    }
    if bytes.len() >= 2 {
        let sw1 = bytes[bytes.len() - 2];
        let sw2 = bytes[bytes.len() - 1];
        let mut sw = child_num(
            "SW",
            u16::from_be_bytes([sw1, sw2]) as u64,
            base + bytes.len() - 2,
            2,
        );
        if let Some(text) = status_word_text(sw1, sw2) {
            sw.push(info("Meaning", text));
        }
        children.push(sw);
    }
    children
}

/// Per-session ISO-DEP state: one reassembly buffer per direction.
#[derive(Default)]
pub struct IsoDep {
    poll_chain: Vec<u8>,
    listen_chain: Vec<u8>,
    apdu_pending: bool,
}

impl IsoDep {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.poll_chain.clear();
        self.listen_chain.clear();
        self.apdu_pending = false;
    }

    /// Parse an ISO-DEP block frame, or return None if the first byte is
    /// not a valid PCB.
    pub fn parse(&mut self, frame: &RawFrame) -> Option<ProtocolFrame> {
        let pcb = *frame.payload().first()?;
        if is_i_block(pcb) {
            Some(self.parse_i_block(frame, pcb))
        } else if is_r_block(pcb) {
            Some(self.parse_r_block(frame, pcb))
        } else if is_s_block(pcb) {
            Some(self.parse_s_block(frame, pcb))
        } else {
            None
        }
    }

    fn parse_i_block(&mut self, frame: &RawFrame, pcb: u8) -> ProtocolFrame {
        let payload = frame.payload();
        let chaining = pcb & 0x10 != 0;
        let block_number = pcb & 0x01;
        let name = if chaining { "I-Block (chaining)" } else { "I-Block" };
        let mut root = build_root(name, frame);

        let mut pcb_node = child_num("PCB", pcb as u64, 0, 1);
        pcb_node.push(info("Block number", format!("{block_number}")));
        if chaining {
            pcb_node.push(info("Chaining", "more blocks follow"));
        }
        root.push(pcb_node);

        let mut offset = 1;
        if pcb & 0x08 != 0 && offset < payload.len() {
            root.push(child_num("CID", payload[offset] as u64, offset, 1));
            offset += 1;
        }
        if pcb & 0x04 != 0 && offset < payload.len() {
            root.push(child_num("NAD", payload[offset] as u64, offset, 1));
            offset += 1;
        }

        // trailing CRC, when the demodulator left it in place
        let crc_len = if payload.len() >= offset + 2 { 2 } else { 0 };
        let inf_len = payload.len().saturating_sub(offset + crc_len);
        let inf = &payload[offset..offset + inf_len];

        let chain = if frame.is_poll() {
            &mut self.poll_chain
        } else {
            &mut self.listen_chain
        };

        if chaining {
            chain.extend_from_slice(inf);
            if inf_len > 0 {
                root.push(child_bytes(frame, "INF", offset, inf_len));
            }
        } else if frame.is_poll() {
            if chain.is_empty() && is_apdu(inf) {
                let mut apdu = ProtocolFrame::new(
                    "APDU",
                    ProtoFlags::FRAME_FIELD,
                    FieldValue::Bytes(inf.to_vec()),
                    Some((offset, inf_len)),
                );
                for child in apdu_command_children(inf, offset) {
                    apdu.push(child);
                }
                root.push(apdu);
                self.apdu_pending = true;
            } else if !chain.is_empty() {
                let mut assembled = std::mem::take(chain);
                assembled.extend_from_slice(inf);
                if inf_len > 0 {
                    root.push(child_bytes(frame, "INF", offset, inf_len));
                }
                if is_apdu(&assembled) {
                    let mut apdu = ProtocolFrame::new(
                        "APDU",
                        ProtoFlags::FIELD_INFO,
                        FieldValue::Bytes(assembled.clone()),
                        None,
                    );
                    for child in apdu_info_children(&assembled) {
                        apdu.push(child);
                    }
                    root.push(apdu);
                    self.apdu_pending = true;
                }
            } else if inf_len > 0 {
                root.push(child_bytes(frame, "INF", offset, inf_len));
            }
        } else {
            // listen direction
            let assembled_prefix = std::mem::take(chain);
            if self.apdu_pending && assembled_prefix.is_empty() {
                self.apdu_pending = false;
                for child in apdu_response_children(inf, offset) {
                    root.push(child);
                }
            } else if inf_len > 0 {
                root.push(child_bytes(frame, "INF", offset, inf_len));
            }
        }

        if crc_len > 0 {
            root.push(child_bytes(frame, "CRC", payload.len() - 2, 2));
        }
        root
    }

    fn parse_r_block(&mut self, frame: &RawFrame, pcb: u8) -> ProtocolFrame {
        let name = if pcb & 0x10 != 0 { "R(NAK)" } else { "R(ACK)" };
        let mut root = build_root(name, frame);
        let mut pcb_node = child_num("PCB", pcb as u64, 0, 1);
        pcb_node.push(info("Block number", format!("{}", pcb & 0x01)));
        root.push(pcb_node);
        let mut offset = 1;
        if pcb & 0x08 != 0 && offset < frame.len() {
            root.push(child_num("CID", frame.payload()[offset] as u64, offset, 1));
            offset += 1;
        }
        if frame.len() >= offset + 2 {
            root.push(child_bytes(frame, "CRC", frame.len() - 2, 2));
        }
        root
    }

    fn parse_s_block(&mut self, frame: &RawFrame, pcb: u8) -> ProtocolFrame {
        let name = match pcb & 0x30 {
            0x00 => "S(DESELECT)",
            0x30 => "S(WTX)",
            _ => "S-Block",
        };
        let mut root = build_root(name, frame);
        root.push(child_num("PCB", pcb as u64, 0, 1));
        let mut offset = 1;
        if pcb & 0x08 != 0 && offset < frame.len() {
            root.push(child_num("CID", frame.payload()[offset] as u64, offset, 1));
            offset += 1;
        }
        if pcb & 0x30 == 0x30 && offset < frame.len().saturating_sub(2) {
            root.push(child_num("WTXM", frame.payload()[offset] as u64, offset, 1));
        }
        if frame.len() >= offset + 2 {
            root.push(child_bytes(frame, "CRC", frame.len() - 2, 2));
        }
        root
    }
}

/// Informational APDU children for a reassembled (multi-frame) command.
fn apdu_info_children(bytes: &[u8]) -> Vec<ProtocolFrame> {
    let mut children = vec![
        info("CLA", format!("{:02x}", bytes[0])),
        info("INS", format!("{:02x}", bytes[1])),
        info("P1", format!("{:02x}", bytes[2])),
        info("P2", format!("{:02x}", bytes[3])),
    ];
    if bytes.len() > 5 {
        let lc = bytes[4] as usize;
        children.push(info("Lc", format!("{lc}")));
        let data_len = lc.min(bytes.len() - 5);
        children.push(info(
            "Data",
            bytes[5..5 + data_len]
                .iter()
                .map(|b| format!("{b:02x}"))
                .collect::<Vec<_>>()
                .join(" "),
        ));
        if bytes.len() == 6 + lc {
            children.push(info("Le", format!("{:02x}", bytes[5 + lc])));
        }
    } else if bytes.len() == 5 {
        children.push(info("Le", format!("{:02x}", bytes[4])));
    }
    children
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameTech;
    use crate::parser::tests::{listen_frame, poll_frame};

    #[test]
    fn block_classification() {
        assert!(is_i_block(0x02));
        assert!(is_i_block(0x03));
        assert!(is_i_block(0x13)); // chaining
        assert!(is_r_block(0xA2));
        assert!(is_r_block(0xB2)); // NAK
        assert!(is_s_block(0xC2));
        assert!(is_s_block(0xF2)); // WTX
        assert!(!is_block(0x26));
    }

    #[test]
    fn apdu_shapes() {
        assert!(is_apdu(&[0x00, 0xA4, 0x04, 0x00]));
        assert!(is_apdu(&[0x00, 0xA4, 0x04, 0x00, 0x00]));
        assert!(is_apdu(&[0x00, 0xA4, 0x04, 0x00, 0x02, 0x3F, 0x00]));
        assert!(is_apdu(&[0x00, 0xA4, 0x04, 0x00, 0x02, 0x3F, 0x00, 0x10]));
        assert!(!is_apdu(&[0x00, 0xA4]));
        assert!(!is_apdu(&[0x00, 0xA4, 0x04, 0x00, 0x07, 0x3F]));
    }

    #[test]
    fn single_i_block_apdu() {
        let mut isodep = IsoDep::new();
        // PCB 02, APDU select by name, CRC
        let mut bytes = vec![0x02, 0x00, 0xA4, 0x04, 0x00, 0x02, 0x3F, 0x00];
        bytes.extend_from_slice(&[0xAA, 0xBB]);
        let frame = poll_frame(FrameTech::NfcA, &bytes);
        let tree = isodep.parse(&frame).unwrap();
        assert_eq!(tree.name(), "I-Block");
        let apdu = tree.child("APDU").expect("APDU subtree");
        assert_eq!(apdu.child("INS").unwrap().value(), &FieldValue::Number(0xA4));
        assert_eq!(apdu.child("Lc").unwrap().value(), &FieldValue::Number(2));
        assert_eq!(tree.flatten(frame.payload()), frame.payload().to_vec());
    }

    #[test]
    fn chained_i_blocks_merge_into_one_apdu() {
        let mut isodep = IsoDep::new();
        // first poll block with chaining set: APDU header + Lc
        let first = poll_frame(FrameTech::NfcA, &[0x12, 0x00, 0xA4, 0x04, 0x00, 0x07, 0x11, 0x22]);
        let tree1 = isodep.parse(&first).unwrap();
        assert_eq!(tree1.name(), "I-Block (chaining)");
        // continuation without chaining completes the APDU
        let second = poll_frame(
            FrameTech::NfcA,
            &[0x03, 0xA0, 0x00, 0x00, 0x00, 0x03, 0x10, 0x10, 0x33, 0x44],
        );
        let tree2 = isodep.parse(&second).unwrap();
        let apdu = tree2.child("APDU").expect("merged APDU");
        match apdu.value() {
            FieldValue::Bytes(b) => {
                assert_eq!(
                    b,
                    &vec![0x00, 0xA4, 0x04, 0x00, 0x07, 0xA0, 0x00, 0x00, 0x00, 0x03, 0x10, 0x10]
                );
            }
            other => panic!("unexpected value {other:?}"),
        }
        assert!(apdu.child("Lc").is_some());
        // response carries the status word
        let resp = listen_frame(FrameTech::NfcA, &[0x02, 0x90, 0x00, 0x55, 0x66]);
        let tree3 = isodep.parse(&resp).unwrap();
        let sw = tree3.child("SW").expect("status word");
        assert_eq!(sw.value(), &FieldValue::Number(0x9000));
    }
}

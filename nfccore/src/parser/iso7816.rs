//! ISO/IEC 7816-3/4 parser: ATR structure, PPS, T=0 and T=1 exchanges.

use crate::frame::{FrameType, RawFrame};
use crate::parser::isodep::{apdu_command_children, apdu_response_children, is_apdu};
use crate::parser::{build_root, child_bytes, child_num, info, raw_response_root};
use crate::tree::{FieldValue, ProtoFlags, ProtocolFrame};

pub struct Iso7816Parser {
    request_pending: bool,
}

impl Default for Iso7816Parser {
    fn default() -> Self {
        Self::new()
    }
}

impl Iso7816Parser {
    pub fn new() -> Self {
        Self {
            request_pending: false,
        }
    }

    pub fn reset(&mut self) {
        self.request_pending = false;
    }

    pub fn parse(&mut self, frame: &RawFrame) -> ProtocolFrame {
        match frame.frame_type() {
            FrameType::IsoAtrFrame => {
                self.request_pending = false;
                self.parse_atr(frame)
            }
            FrameType::IsoRequestFrame | FrameType::IsoExchangeFrame => {
                self.request_pending = true;
                self.parse_request(frame)
            }
            _ => {
                let tree = self.parse_response(frame);
                self.request_pending = false;
                tree
            }
        }
    }

    fn parse_atr(&self, frame: &RawFrame) -> ProtocolFrame {
        let payload = frame.payload();
        let mut root = build_root("ATR", frame);
        if payload.is_empty() {
            return root;
        }

        let mut ts = child_num("TS", payload[0] as u64, 0, 1);
        ts.push(info(
            "Convention",
            match payload[0] {
                0x3B => "direct",
                0x3F => "inverse",
                _ => "unknown",
            },
        ));
        root.push(ts);

        if payload.len() < 2 {
            return root;
        }
        let t0 = payload[1];
        let historical = (t0 & 0x0F) as usize;
        let mut t0_node = child_num("T0", t0 as u64, 1, 1);
        t0_node.push(info("Historical bytes", format!("{historical}")));
        root.push(t0_node);

        // walk the interface byte chain announced by T0 and each TD
        let mut offset = 2;
        let mut presence = t0 >> 4;
        let mut index = 1;
        let mut need_tck = false;
        while presence != 0 && offset < payload.len() {
            for (bit, prefix) in [(0x1u8, "TA"), (0x2, "TB"), (0x4, "TC")] {
                if presence & bit != 0 && offset < payload.len() {
                    root.push(child_num(
                        &format!("{prefix}{index}"),
                        payload[offset] as u64,
                        offset,
                        1,
                    ));
                    offset += 1;
                }
            }
            if presence & 0x8 != 0 && offset < payload.len() {
                let td = payload[offset];
                let mut td_node = child_num(&format!("TD{index}"), td as u64, offset, 1);
                td_node.push(info("Protocol", format!("T={}", td & 0x0F)));
                root.push(td_node);
                offset += 1;
                if td & 0x0F != 0 {
                    need_tck = true;
                }
                presence = td >> 4;
            } else {
                presence = 0;
            }
            index += 1;
        }

        if historical > 0 && offset < payload.len() {
            let take = historical.min(payload.len() - offset);
            root.push(child_bytes(frame, "Historical", offset, take));
            offset += take;
        }
        if need_tck && offset < payload.len() {
            root.push(child_num("TCK", payload[offset] as u64, offset, 1));
            offset += 1;
        }
        if offset < payload.len() {
            root.push(child_bytes(frame, "Extra", offset, payload.len() - offset));
        }
        root
    }

    fn parse_request(&self, frame: &RawFrame) -> ProtocolFrame {
        let payload = frame.payload();
        if payload.first() == Some(&0xFF) {
            return self.parse_pps(frame, true);
        }
        if let Some(root) = self.parse_t1_block(frame) {
            return root;
        }
        if is_apdu(payload) {
            let ins = payload[1];
            let mut root = build_root(&format!("APDU {ins:02x}"), frame);
            for child in apdu_command_children(payload, 0) {
                root.push(child);
            }
            return root;
        }
        let mut root = raw_response_root(frame);
        root.set_flag(ProtoFlags::PARSE_ERROR);
        root
    }

    fn parse_response(&mut self, frame: &RawFrame) -> ProtocolFrame {
        let payload = frame.payload();
        if payload.first() == Some(&0xFF) {
            return self.parse_pps(frame, false);
        }
        if let Some(root) = self.parse_t1_block(frame) {
            return root;
        }
        if self.request_pending && payload.len() >= 2 {
            let mut root = build_root("Response", frame);
            for child in apdu_response_children(payload, 0) {
                root.push(child);
            }
            return root;
        }
        raw_response_root(frame)
    }

    fn parse_pps(&self, frame: &RawFrame, request: bool) -> ProtocolFrame {
        let payload = frame.payload();
        let name = if request { "PPS" } else { "PPS response" };
        let mut root = build_root(name, frame);
        root.push(child_num("PPSS", payload[0] as u64, 0, 1));
        let mut offset = 1;
        if payload.len() > 1 {
            let pps0 = payload[1];
            let mut node = child_num("PPS0", pps0 as u64, 1, 1);
            node.push(info("Protocol", format!("T={}", pps0 & 0x0F)));
            root.push(node);
            offset = 2;
            for (bit, name) in [(0x10u8, "PPS1"), (0x20, "PPS2"), (0x40, "PPS3")] {
                if pps0 & bit != 0 && offset < payload.len() {
                    root.push(child_num(name, payload[offset] as u64, offset, 1));
                    offset += 1;
                }
            }
        }
        if offset < payload.len() {
            root.push(child_num("PCK", payload[offset] as u64, offset, 1));
        }
        root
    }

    /// Recognise a T=1 block by its prologue and length consistency.
    fn parse_t1_block(&self, frame: &RawFrame) -> Option<ProtocolFrame> {
        let payload = frame.payload();
        if payload.len() < 4 {
            return None;
        }
        let len = payload[2] as usize;
        if payload.len() != len + 4 {
            return None;
        }
        let pcb = payload[1];
        let name = match pcb {
            p if p & 0x80 == 0 => "T1 I-Block",
            p if p & 0xC0 == 0x80 => "T1 R-Block",
            _ => "T1 S-Block",
        };
        let mut root = build_root(name, frame);
        root.push(child_num("NAD", payload[0] as u64, 0, 1));
        root.push(child_num("PCB", pcb as u64, 1, 1));
        root.push(child_num("LEN", len as u64, 2, 1));
        if len > 0 {
            let inf = &payload[3..3 + len];
            let mut inf_node = ProtocolFrame::new(
                "INF",
                ProtoFlags::FRAME_FIELD,
                FieldValue::Bytes(inf.to_vec()),
                Some((3, len)),
            );
            if pcb & 0x80 == 0 {
                if frame.is_poll() && is_apdu(inf) {
                    for child in apdu_command_children(inf, 3) {
                        inf_node.push(child);
                    }
                } else if !frame.is_poll() && inf.len() >= 2 {
                    for child in apdu_response_children(inf, 3) {
                        inf_node.push(child);
                    }
                }
            }
            root.push(inf_node);
        }
        root.push(child_num("LRC", payload[payload.len() - 1] as u64, payload.len() - 1, 1));
        Some(root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{FrameBuilder, FrameTech};
    use crate::tree::FieldValue;

    fn frame(frame_type: FrameType, bytes: &[u8]) -> RawFrame {
        let mut b = FrameBuilder::new(FrameTech::Iso7816, frame_type);
        b.extend(bytes);
        b.finalize(0.0, 0.0, 0, 0)
    }

    #[test]
    fn atr_direct_with_ta1() {
        let mut parser = Iso7816Parser::new();
        let tree = parser.parse(&frame(FrameType::IsoAtrFrame, &[0x3B, 0x10, 0x11]));
        assert_eq!(tree.name(), "ATR");
        let ts = tree.child("TS").unwrap();
        assert_eq!(ts.child("Convention").unwrap().value(), &FieldValue::Text("direct".into()));
        assert!(tree.child("T0").is_some());
        assert!(tree.child("TA1").is_some());
        assert!(tree.child("TCK").is_none());
        assert_eq!(tree.flatten(&[0x3B, 0x10, 0x11]), vec![0x3B, 0x10, 0x11]);
    }

    #[test]
    fn atr_with_td_and_tck() {
        let mut parser = Iso7816Parser::new();
        // TS, T0 (TD1, 1 historical), TD1 announcing T=1, historical, TCK
        let bytes = [0x3B, 0x81, 0x01, 0x55, 0xD5];
        let tree = parser.parse(&frame(FrameType::IsoAtrFrame, &bytes));
        let td1 = tree.child("TD1").unwrap();
        assert_eq!(td1.child("Protocol").unwrap().value(), &FieldValue::Text("T=1".into()));
        assert!(tree.child("Historical").is_some());
        assert!(tree.child("TCK").is_some());
        assert_eq!(tree.flatten(&bytes), bytes.to_vec());
    }

    #[test]
    fn t0_request_and_response() {
        let mut parser = Iso7816Parser::new();
        let req = [0x00, 0xA4, 0x04, 0x00, 0x02, 0x3F, 0x00];
        let tree = parser.parse(&frame(FrameType::IsoRequestFrame, &req));
        assert_eq!(tree.name(), "APDU a4");
        assert_eq!(tree.child("INS").unwrap().value(), &FieldValue::Number(0xA4));
        assert_eq!(tree.flatten(&req), req.to_vec());

        let resp = [0x90, 0x00];
        let tree = parser.parse(&frame(FrameType::IsoResponseFrame, &resp));
        assert_eq!(tree.name(), "Response");
        let sw = tree.child("SW").unwrap();
        assert_eq!(sw.value(), &FieldValue::Number(0x9000));
        assert_eq!(
            sw.child("Meaning").unwrap().value(),
            &FieldValue::Text("normal processing".into())
        );
    }

    #[test]
    fn t1_block_with_apdu() {
        let mut parser = Iso7816Parser::new();
        // NAD 00, PCB 00 (I-block), LEN 7, APDU, LRC
        let mut bytes = vec![0x00, 0x00, 0x07, 0x00, 0xA4, 0x04, 0x00, 0x02, 0x3F, 0x00];
        let lrc = bytes.iter().fold(0u8, |a, b| a ^ b);
        bytes.push(lrc);
        let tree = parser.parse(&frame(FrameType::IsoRequestFrame, &bytes));
        assert_eq!(tree.name(), "T1 I-Block");
        let inf = tree.child("INF").unwrap();
        assert!(inf.child("CLA").is_some());
        assert_eq!(tree.flatten(&bytes), bytes);
    }

    #[test]
    fn pps_exchange() {
        let mut parser = Iso7816Parser::new();
        let req = [0xFF, 0x10, 0x11, 0xFE];
        let tree = parser.parse(&frame(FrameType::IsoRequestFrame, &req));
        assert_eq!(tree.name(), "PPS");
        assert!(tree.child("PPS1").is_some());
        assert!(tree.child("PCK").is_some());
    }
}

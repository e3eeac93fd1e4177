//! ISO/IEC 7816-3 UART-style demodulator.
//!
//! Clock recovery happens on the ATR TS byte: the start-bit low pulse is
//! exactly one elementary time unit in either convention. Characters are
//! sampled at mid-ETU positions; parity failures and guard-time violations
//! are reported as frame flags, never fatal.

use log::debug;

use crate::frame::{FrameBuilder, FrameFlags, FramePhase, FrameTech, FrameType, RawFrame};
use crate::iso::{Convention, ISO_7816_BGT_DEF, ISO_7816_CGT_DEF, ISO_TS_DIRECT, ISO_TS_INVERSE};
use crate::logic::LogicStatus;

/// Samples of idle-high line required before a TS start edge is trusted.
const MIN_IDLE_SAMPLES: u64 = 16;

/// Smallest believable elementary time unit, in samples.
const MIN_ETU_SAMPLES: u64 = 8;

#[derive(Debug)]
struct CharReader {
    start: u64,
    idx: usize,
    levels: [u8; 9],
}

impl CharReader {
    fn new(start: u64) -> Self {
        Self {
            start,
            idx: 0,
            levels: [0; 9],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum IfByte {
    Ta,
    Tb,
    Tc,
    Td,
}

#[derive(Debug, PartialEq)]
enum AtrStage {
    T0,
    Interface,
    Historical,
    Tck,
}

#[derive(Debug)]
struct AtrDecode {
    start: u64,
    bytes: Vec<u8>,
    char: Option<CharReader>,
    flags: FrameFlags,
    queue: Vec<IfByte>,
    historical: usize,
    need_tck: bool,
    had_tck: bool,
    stage: AtrStage,
    td_protocol: Option<u8>,
    last_leading: u64,
    last_end: u64,
}

#[derive(Debug)]
struct SessionDecode {
    block: Vec<u8>,
    block_start: u64,
    char: Option<CharReader>,
    flags: FrameFlags,
    last_leading: u64,
    request: bool,
}

#[derive(Debug)]
enum IState {
    WaitReset,
    TsLow { start: u64 },
    TsBits { start: u64, idx: usize, bits: [u8; 8] },
    Atr(AtrDecode),
    Session(SessionDecode),
}

pub struct Iso7816 {
    etu: f64,
    convention: Convention,
    protocol: u8,
    state: IState,
    high_run: u64,
}

impl Default for Iso7816 {
    fn default() -> Self {
        Self::new()
    }
}

impl Iso7816 {
    pub fn new() -> Self {
        Self {
            etu: 0.0,
            convention: Convention::Unknown,
            protocol: 0,
            state: IState::WaitReset,
            high_run: 0,
        }
    }

    pub fn reset(&mut self) {
        self.etu = 0.0;
        self.convention = Convention::Unknown;
        self.protocol = 0;
        self.state = IState::WaitReset;
        self.high_run = 0;
    }

    pub fn convention(&self) -> Convention {
        self.convention
    }

    /// Elementary time unit in samples, measured from the TS start bit.
    pub fn etu_samples(&self) -> f64 {
        self.etu
    }

    pub fn process_sample(&mut self, status: &LogicStatus, frames: &mut Vec<RawFrame>) {
        let clock = status.signal_clock;

        // count idle-high samples; the run is inspected on the next edge
        if status.level {
            self.high_run += 1;
        }

        match &mut self.state {
            IState::WaitReset => {
                if status.falling_edge() && self.high_run >= MIN_IDLE_SAMPLES {
                    self.state = IState::TsLow { start: clock };
                }
            }
            IState::TsLow { start } => {
                let start = *start;
                if status.rising_edge() {
                    let width = clock - start;
                    if width >= MIN_ETU_SAMPLES {
                        self.etu = width as f64;
                        self.state = IState::TsBits {
                            start,
                            idx: 0,
                            bits: [0; 8],
                        };
                    } else {
                        self.state = IState::WaitReset;
                    }
                }
            }
            IState::TsBits { start, idx, bits } => {
                let t = *start + ((1.5 + *idx as f64) * self.etu).round() as u64;
                if clock >= t {
                    bits[*idx] = status.level as u8;
                    *idx += 1;
                    if *idx == 8 {
                        let start = *start;
                        let bits = *bits;
                        self.finish_ts(start, &bits, clock);
                    }
                }
            }
            IState::Atr(_) => self.process_atr(status, frames),
            IState::Session(_) => self.process_session(status, frames),
        }

        if status.falling_edge() {
            self.high_run = 0;
        }
    }

    /// Flush any ATR or block under construction as truncated.
    pub fn flush(&mut self, status: &LogicStatus, frames: &mut Vec<RawFrame>) {
        let clock = status.signal_clock;
        match std::mem::replace(&mut self.state, IState::WaitReset) {
            IState::Atr(ad) => {
                if !ad.bytes.is_empty() {
                    let frame = self.build_frame(
                        status,
                        FrameType::IsoAtrFrame,
                        FramePhase::Selection,
                        ad.bytes,
                        ad.flags | FrameFlags::TRUNCATED,
                        ad.start,
                        clock,
                    );
                    frames.push(frame);
                }
            }
            IState::Session(sd) => {
                if sd.block.is_empty() {
                    // nothing pending, the session continues untouched
                    self.state = IState::Session(sd);
                } else {
                    let frame_type = if sd.request {
                        FrameType::IsoRequestFrame
                    } else {
                        FrameType::IsoResponseFrame
                    };
                    let request = sd.request;
                    let frame = self.build_frame(
                        status,
                        frame_type,
                        FramePhase::Application,
                        sd.block,
                        sd.flags | FrameFlags::TRUNCATED,
                        sd.block_start,
                        clock,
                    );
                    frames.push(frame);
                    self.state = IState::Session(SessionDecode {
                        block: Vec::new(),
                        block_start: clock,
                        char: None,
                        flags: FrameFlags::NONE,
                        last_leading: clock,
                        request: !request,
                    });
                }
            }
            other => self.state = other,
        }
    }

    fn finish_ts(&mut self, start: u64, bits: &[u8; 8], clock: u64) {
        let direct: u8 = bits
            .iter()
            .enumerate()
            .map(|(i, &b)| b << i)
            .fold(0, |a, b| a | b);
        let inverse: u8 = bits
            .iter()
            .enumerate()
            .map(|(i, &b)| (1 - b) << (7 - i))
            .fold(0, |a, b| a | b);

        let mut flags = FrameFlags::NONE;
        let ts = if direct == ISO_TS_DIRECT {
            self.convention = Convention::Direct;
            ISO_TS_DIRECT
        } else if inverse == ISO_TS_INVERSE {
            self.convention = Convention::Inverse;
            ISO_TS_INVERSE
        } else {
            debug!("unrecognised TS pattern {direct:02X}, assuming direct convention");
            self.convention = Convention::Direct;
            flags |= FrameFlags::SYNC_ERROR;
            direct
        };

        self.state = IState::Atr(AtrDecode {
            start,
            bytes: vec![ts],
            char: None,
            flags,
            queue: Vec::new(),
            historical: 0,
            need_tck: false,
            had_tck: false,
            stage: AtrStage::T0,
            td_protocol: None,
            last_leading: clock,
            last_end: clock,
        });
    }

    fn process_atr(&mut self, status: &LogicStatus, frames: &mut Vec<RawFrame>) {
        let clock = status.signal_clock;
        let etu = self.etu;
        let convention = self.convention;

        let IState::Atr(ad) = &mut self.state else {
            return;
        };

        if let Some(ch) = &mut ad.char {
            let t = ch.start + ((1.5 + ch.idx as f64) * etu).round() as u64;
            if clock >= t {
                ch.levels[ch.idx] = status.level as u8;
                ch.idx += 1;
                if ch.idx == 9 {
                    let (byte, parity_ok) = decode_char(&ch.levels, convention);
                    if !parity_ok {
                        ad.flags |= FrameFlags::PARITY_ERROR;
                    }
                    ad.char = None;
                    ad.bytes.push(byte);
                    ad.last_end = clock;
                    atr_advance(ad, byte);
                    if ad.stage == AtrStage::Tck && !ad.need_tck {
                        self.finish_atr(status, frames, clock);
                    }
                }
            }
        } else if status.falling_edge() {
            let gap_etus = (clock - ad.last_leading) as f64 / etu;
            if gap_etus < (ISO_7816_CGT_DEF as f64) - 1.0 && ad.bytes.len() > 1 {
                ad.flags |= FrameFlags::SYNC_ERROR;
            }
            ad.last_leading = clock;
            ad.char = Some(CharReader::new(clock));
        } else if ad.bytes.len() > 1
            && clock - ad.last_leading > ((ISO_7816_BGT_DEF as f64 + 11.0) * etu) as u64
        {
            // line idle past the block guard time: take the ATR as complete
            // even if the announced structure was not fully seen
            self.finish_atr(status, frames, clock);
        }
    }

    fn finish_atr(&mut self, status: &LogicStatus, frames: &mut Vec<RawFrame>, clock: u64) {
        let ad = match std::mem::replace(&mut self.state, IState::WaitReset) {
            IState::Atr(ad) => ad,
            _ => unreachable!(),
        };
        self.protocol = ad.td_protocol.unwrap_or(0);
        let mut flags = ad.flags;
        if ad.had_tck {
            // TCK makes the exclusive-or of all bytes after TS zero
            let check = ad.bytes[1..].iter().fold(0u8, |a, b| a ^ b);
            if check != 0 {
                flags |= FrameFlags::CRC_ERROR;
            }
        }
        let frame_end = ad.last_end + (2.0 * self.etu) as u64;
        let frame = self.build_frame(
            status,
            FrameType::IsoAtrFrame,
            FramePhase::Selection,
            ad.bytes,
            flags,
            ad.start,
            frame_end.min(clock.max(ad.last_end)),
        );
        debug!("ISO 7816 ATR complete, protocol T={}", self.protocol);
        frames.push(frame);
        self.state = IState::Session(SessionDecode {
            block: Vec::new(),
            block_start: clock,
            char: None,
            flags: FrameFlags::NONE,
            last_leading: clock,
            request: true,
        });
    }

    fn process_session(&mut self, status: &LogicStatus, frames: &mut Vec<RawFrame>) {
        let clock = status.signal_clock;
        let etu = self.etu;
        let convention = self.convention;
        let bgt_samples = (ISO_7816_BGT_DEF as f64 * etu) as u64;

        let IState::Session(sd) = &mut self.state else {
            return;
        };

        if let Some(ch) = &mut sd.char {
            let t = ch.start + ((1.5 + ch.idx as f64) * etu).round() as u64;
            if clock >= t {
                ch.levels[ch.idx] = status.level as u8;
                ch.idx += 1;
                if ch.idx == 9 {
                    let (byte, parity_ok) = decode_char(&ch.levels, convention);
                    if !parity_ok {
                        sd.flags |= FrameFlags::PARITY_ERROR;
                    }
                    sd.char = None;
                    sd.block.push(byte);
                }
            }
        } else if status.falling_edge() {
            let gap_etus = (clock - sd.last_leading) as f64 / etu;
            if !sd.block.is_empty() && gap_etus < (ISO_7816_CGT_DEF as f64) - 1.0 {
                sd.flags |= FrameFlags::SYNC_ERROR;
            }
            sd.last_leading = clock;
            if sd.block.is_empty() {
                sd.block_start = clock;
            }
            sd.char = Some(CharReader::new(clock));
        } else if !sd.block.is_empty() && clock - sd.last_leading > bgt_samples.max(1) + (11.0 * etu) as u64
        {
            // block guard time elapsed: the block is complete
            let request = sd.request;
            let sd_taken = match std::mem::replace(&mut self.state, IState::WaitReset) {
                IState::Session(sd) => sd,
                _ => unreachable!(),
            };
            let mut flags = sd_taken.flags;
            if self.protocol == 1 && sd_taken.block.len() >= 4 {
                let lrc = sd_taken.block.iter().fold(0u8, |a, b| a ^ b);
                if lrc != 0 {
                    flags |= FrameFlags::CRC_ERROR;
                }
            }
            let frame_type = if request {
                FrameType::IsoRequestFrame
            } else {
                FrameType::IsoResponseFrame
            };
            let phase = if sd_taken.block.first() == Some(&0xFF) {
                FramePhase::Selection
            } else {
                FramePhase::Application
            };
            let frame_end = sd_taken.last_leading + (11.0 * etu) as u64;
            let frame = self.build_frame(
                status,
                frame_type,
                phase,
                sd_taken.block,
                flags,
                sd_taken.block_start,
                frame_end,
            );
            debug!(
                "ISO 7816 {frame_type:?} [{:02X?}]",
                frame.payload()
            );
            frames.push(frame);
            self.state = IState::Session(SessionDecode {
                block: Vec::new(),
                block_start: clock,
                char: None,
                flags: FrameFlags::NONE,
                last_leading: clock,
                request: !request,
            });
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn build_frame(
        &self,
        status: &LogicStatus,
        frame_type: FrameType,
        phase: FramePhase,
        bytes: Vec<u8>,
        flags: FrameFlags,
        sample_start: u64,
        sample_end: u64,
    ) -> RawFrame {
        let mut builder = FrameBuilder::new(FrameTech::Iso7816, frame_type);
        builder.extend(&bytes);
        builder.set_flag(flags);
        builder.set_phase(phase);
        if self.etu > 0.0 {
            builder.set_rate((status.sample_rate as f64 / self.etu) as u32);
        }
        builder.set_sample_rate(status.sample_rate);
        builder.set_date_time(status.stream_time + status.time_at(sample_start));
        builder.finalize(
            status.time_at(sample_start),
            status.time_at(sample_end),
            sample_start,
            sample_end,
        )
    }
}

/// Advance the ATR structure tracker with a freshly received byte.
fn atr_advance(ad: &mut AtrDecode, byte: u8) {
    match ad.stage {
        AtrStage::T0 => {
            ad.historical = (byte & 0x0F) as usize;
            push_interface(&mut ad.queue, byte >> 4);
            ad.stage = if ad.queue.is_empty() {
                if ad.historical > 0 {
                    AtrStage::Historical
                } else {
                    AtrStage::Tck
                }
            } else {
                AtrStage::Interface
            };
        }
        AtrStage::Interface => {
            let kind = ad.queue.remove(0);
            if kind == IfByte::Td {
                let t = byte & 0x0F;
                if ad.td_protocol.is_none() {
                    ad.td_protocol = Some(t);
                }
                if t != 0 {
                    ad.need_tck = true;
                }
                push_interface(&mut ad.queue, byte >> 4);
            }
            if ad.queue.is_empty() {
                ad.stage = if ad.historical > 0 {
                    AtrStage::Historical
                } else {
                    AtrStage::Tck
                };
            }
        }
        AtrStage::Historical => {
            ad.historical -= 1;
            if ad.historical == 0 {
                ad.stage = AtrStage::Tck;
            }
        }
        AtrStage::Tck => {
            // the TCK byte itself
            ad.need_tck = false;
            ad.had_tck = true;
        }
    }
    // when no TCK is expected the frame completes as soon as the stage
    // reaches Tck with need_tck == false; the caller checks that condition
}

fn push_interface(queue: &mut Vec<IfByte>, presence: u8) {
    if presence & 0x1 != 0 {
        queue.push(IfByte::Ta);
    }
    if presence & 0x2 != 0 {
        queue.push(IfByte::Tb);
    }
    if presence & 0x4 != 0 {
        queue.push(IfByte::Tc);
    }
    if presence & 0x8 != 0 {
        queue.push(IfByte::Td);
    }
}

/// Decode one character's sampled levels per the line convention.
/// Returns the byte and whether even parity held.
fn decode_char(levels: &[u8; 9], convention: Convention) -> (u8, bool) {
    let (byte, parity) = match convention {
        Convention::Inverse => {
            let byte: u8 = levels[..8]
                .iter()
                .enumerate()
                .map(|(i, &b)| (1 - b) << (7 - i))
                .fold(0, |a, b| a | b);
            (byte, 1 - levels[8])
        }
        _ => {
            let byte: u8 = levels[..8]
                .iter()
                .enumerate()
                .map(|(i, &b)| b << i)
                .fold(0, |a, b| a | b);
            (byte, levels[8])
        }
    };
    let parity_ok = (byte.count_ones() + parity as u32) % 2 == 0;
    (byte, parity_ok)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{SampleBuffer, SampleType};
    use crate::logic::IsoDecoder;
    use crate::testgen::LogicSignal;

    const LOGIC_RATE: u32 = 1_000_000;
    const ETU: f64 = 372.0;

    fn decode_all(values: &[f32]) -> Vec<RawFrame> {
        let mut decoder = IsoDecoder::new();
        let mut buf = SampleBuffer::from_samples(values, SampleType::RawLogic, LOGIC_RATE, 0);
        let mut frames = decoder.next_frames(&mut buf);
        frames.extend(decoder.flush());
        frames
    }

    #[test]
    fn decode_direct_atr() {
        let mut sig = LogicSignal::new(ETU);
        sig.idle(30.0);
        sig.ts_direct();
        sig.char_direct(0x10); // T0: TA1 present, no historical bytes
        sig.char_direct(0x11); // TA1
        sig.idle(40.0);
        let frames = decode_all(&sig.finish());
        assert_eq!(frames.len(), 1, "{frames:?}");
        let f = &frames[0];
        assert_eq!(f.tech(), FrameTech::Iso7816);
        assert_eq!(f.frame_type(), FrameType::IsoAtrFrame);
        assert_eq!(f.payload(), &[0x3B, 0x10, 0x11]);
        assert!(f.flags().is_empty(), "{:?}", f.flags());
    }

    #[test]
    fn decode_inverse_atr() {
        let mut sig = LogicSignal::new(ETU);
        sig.idle(30.0);
        sig.ts_inverse();
        sig.char_inverse(0x10);
        sig.char_inverse(0x11);
        sig.idle(40.0);
        let frames = decode_all(&sig.finish());
        assert_eq!(frames.len(), 1, "{frames:?}");
        assert_eq!(frames[0].payload(), &[0x3F, 0x10, 0x11]);
    }

    #[test]
    fn parity_error_is_flagged_not_fatal() {
        let mut sig = LogicSignal::new(ETU);
        sig.idle(30.0);
        sig.ts_direct();
        sig.char_direct_bad_parity(0x90);
        sig.char_direct(0x11);
        sig.idle(40.0);
        let frames = decode_all(&sig.finish());
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload(), &[0x3B, 0x90, 0x11]);
        assert!(frames[0].has_flags(FrameFlags::PARITY_ERROR));
    }

    #[test]
    fn request_response_pairing() {
        let mut sig = LogicSignal::new(ETU);
        sig.idle(30.0);
        sig.ts_direct();
        sig.char_direct(0x00); // T0: no interface, no historical
        // T=0 command header: CLA INS P1 P2 P3
        for byte in [0x00u8, 0xA4, 0x04, 0x00, 0x00] {
            sig.char_direct(byte);
        }
        sig.idle(40.0);
        // response status word
        for byte in [0x90u8, 0x00] {
            sig.char_direct(byte);
        }
        sig.idle(60.0);
        let frames = decode_all(&sig.finish());
        assert_eq!(frames.len(), 3, "{frames:?}");
        assert_eq!(frames[0].frame_type(), FrameType::IsoAtrFrame);
        assert_eq!(frames[0].payload(), &[0x3B, 0x00]);
        assert_eq!(frames[1].frame_type(), FrameType::IsoRequestFrame);
        assert_eq!(frames[1].payload(), &[0x00, 0xA4, 0x04, 0x00, 0x00]);
        assert_eq!(frames[2].frame_type(), FrameType::IsoResponseFrame);
        assert_eq!(frames[2].payload(), &[0x90, 0x00]);
        assert!(frames[2].time_start() > frames[1].time_end());
    }

    #[test]
    fn etu_recovered_from_ts() {
        let mut sig = LogicSignal::new(200.0);
        sig.idle(30.0);
        sig.ts_direct();
        sig.char_direct(0x00);
        sig.idle(40.0);
        let mut decoder = IsoDecoder::new();
        let mut buf =
            SampleBuffer::from_samples(&sig.finish(), SampleType::RawLogic, LOGIC_RATE, 0);
        let frames = decoder.next_frames(&mut buf);
        assert_eq!(frames.len(), 1);
        // rate field reflects the measured 200-sample ETU
        assert_eq!(frames[0].rate(), 5_000);
    }
}

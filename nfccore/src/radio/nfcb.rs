//! NFC-B demodulator, ISO/IEC 14443-3 type B.
//!
//! Poll frames use shallow-ASK NRZ-L characters (start + 8 data + stop)
//! between an extended SOF and EOF; listen frames use a BPSK fc/16
//! subcarrier with differential phase detection.

use log::debug;

use crate::buffer::SampleBuffer;
use crate::crc::{check_trailing_le, crc_b};
use crate::frame::{FrameBuilder, FrameFlags, FramePhase, FrameTech, FrameType, RawFrame};
use crate::nfc::{NfcRate, NFCB_FWT_DEF};
use crate::radio::{
    bits_to_byte_lsb, fc_to_samples, window_energy, window_phase_correlation, PulseTracker,
};
use crate::status::{BitrateParams, DecoderStatus};

const CMD_REQB: u8 = 0x05;
const CMD_ATTRIB: u8 = 0x1D;
const CMD_HLTB: u8 = 0x50;

#[derive(Debug)]
struct CharReader {
    start: u64,
    idx: usize,
    byte: u8,
}

#[derive(Debug)]
struct CharAssembly {
    frame_start: u64,
    bytes: Vec<u8>,
    char: Option<CharReader>,
    prev_modulated: bool,
    last_activity: u64,
}

#[derive(Debug)]
struct ListenDecode {
    frame_start: u64,
    window_start: f64,
    levels: Vec<u8>,
}

#[derive(Debug)]
enum BState {
    WaitPoll { idle_since: u64 },
    Chars(CharAssembly),
    WaitListen { deadline: u64 },
    Listen(ListenDecode),
}

pub struct NfcB {
    modulation_min: f32,
    modulation_max: f32,
    correlation: f32,
    bitrate: BitrateParams,
    fwt: u64,
    idle_timeout: u64,
    detect_pulses: PulseTracker,
    pulses: PulseTracker,
    state: BState,
    phase: FramePhase,
    pending_application: bool,
}

impl Default for NfcB {
    fn default() -> Self {
        Self::new()
    }
}

impl NfcB {
    pub fn new() -> Self {
        Self {
            modulation_min: 0.10,
            modulation_max: 0.75,
            correlation: 0.05,
            bitrate: BitrateParams::new(FrameTech::NfcB, NfcRate::R106k, 1),
            fwt: 0,
            idle_timeout: 0,
            detect_pulses: PulseTracker::default(),
            pulses: PulseTracker::default(),
            state: BState::WaitPoll { idle_since: 0 },
            phase: FramePhase::Selection,
            pending_application: false,
        }
    }

    pub fn modulation_threshold_min(&self) -> f32 {
        self.modulation_min
    }

    pub fn modulation_threshold_max(&self) -> f32 {
        self.modulation_max
    }

    pub fn set_modulation_threshold(&mut self, min: f32, max: f32) {
        self.modulation_min = min;
        self.modulation_max = max;
    }

    pub fn correlation_threshold(&self) -> f32 {
        self.correlation
    }

    pub fn set_correlation_threshold(&mut self, value: f32) {
        self.correlation = value;
    }

    pub fn initialize(&mut self, sample_rate: u32) {
        self.bitrate = BitrateParams::new(FrameTech::NfcB, NfcRate::R106k, sample_rate);
        self.fwt = fc_to_samples(NFCB_FWT_DEF, sample_rate);
        self.idle_timeout = (sample_rate as f64 * 10e-3) as u64;
        self.reset();
    }

    pub fn reset(&mut self) {
        self.detect_pulses.reset();
        self.pulses.reset();
        self.state = BState::WaitPoll { idle_since: 0 };
        self.phase = FramePhase::Selection;
        self.pending_application = false;
    }

    /// Probe for the extended SOF low (10..11 etu of shallow modulation).
    pub fn detect(&mut self, status: &DecoderStatus) -> Option<u64> {
        if status.signal_envelope < status.power_level_threshold {
            self.detect_pulses.reset();
            return None;
        }
        let clock = status.signal_clock;
        let sample = status.sample_at(clock);
        let pulse = self
            .detect_pulses
            .update(clock, sample.modulation, self.modulation_min)?;
        if !self.sof_pulse_width(pulse.width() as f64) || pulse.peak > self.modulation_max {
            return None;
        }
        Some(pulse.start)
    }

    pub fn clear_detect(&mut self) {
        self.detect_pulses.reset();
    }

    pub fn lock(&mut self, status: &mut DecoderStatus, start: u64) {
        status.bitrate = Some(self.bitrate);
        self.pulses.reset();
        self.state = BState::Chars(CharAssembly {
            frame_start: start,
            bytes: Vec::new(),
            char: None,
            prev_modulated: false,
            last_activity: status.signal_clock,
        });
    }

    pub fn decode(
        &mut self,
        samples: &mut SampleBuffer,
        status: &mut DecoderStatus,
        frames: &mut Vec<RawFrame>,
    ) {
        while matches!(status.bitrate, Some(b) if b.tech == FrameTech::NfcB) {
            if !status.next_sample(samples) {
                break;
            }
            self.process_sample(status, frames);
        }
    }

    pub fn flush(&mut self, status: &mut DecoderStatus, frames: &mut Vec<RawFrame>) {
        let clock = status.signal_clock;
        match std::mem::replace(&mut self.state, BState::WaitPoll { idle_since: clock }) {
            BState::Chars(ca) if !ca.bytes.is_empty() => {
                self.emit_poll(status, frames, ca.frame_start, ca.bytes, clock, FrameFlags::TRUNCATED);
            }
            BState::Listen(ld) if !ld.levels.is_empty() => {
                let (bytes, flags) = parse_listen_levels(&ld.levels);
                if !bytes.is_empty() {
                    self.emit_listen(
                        status,
                        frames,
                        ld.frame_start,
                        bytes,
                        clock,
                        flags | FrameFlags::TRUNCATED,
                    );
                }
            }
            _ => {}
        }
    }

    fn process_sample(&mut self, status: &mut DecoderStatus, frames: &mut Vec<RawFrame>) {
        let clock = status.signal_clock;

        if status.signal_average < status.power_level_threshold {
            self.flush(status, frames);
            self.state = BState::WaitPoll { idle_since: clock };
            self.phase = FramePhase::Selection;
            status.bitrate = None;
            return;
        }

        let sample = status.sample_at(clock);
        let spe = self.bitrate.samples_per_etu;
        let modulated = sample.modulation >= self.modulation_min
            && sample.modulation <= self.modulation_max + f32::EPSILON;

        match &mut self.state {
            BState::WaitPoll { idle_since } => {
                let idle_since = *idle_since;
                if let Some(pulse) = self.pulses.update(clock, sample.modulation, self.modulation_min)
                {
                    if self.sof_pulse_width(pulse.width() as f64) {
                        self.state = BState::Chars(CharAssembly {
                            frame_start: pulse.start,
                            bytes: Vec::new(),
                            char: None,
                            prev_modulated: false,
                            last_activity: clock,
                        });
                        return;
                    }
                } else if !self.pulses.active() && clock - idle_since > self.idle_timeout {
                    debug!("NFC-B idle, releasing lock at sample {clock}");
                    status.bitrate = None;
                    self.state = BState::WaitPoll { idle_since: clock };
                }
            }
            BState::Chars(ca) => {
                let stall = (spe * 16.0) as u64;
                if let Some(ch) = &mut ca.char {
                    if ch.idx < 8 {
                        let t = ch.start + ((1.5 + ch.idx as f64) * spe).round() as u64;
                        if clock >= t {
                            if !modulated {
                                ch.byte |= 1 << ch.idx;
                            }
                            ch.idx += 1;
                        }
                    } else {
                        let t = ch.start + (9.5 * spe).round() as u64;
                        if clock >= t {
                            if modulated {
                                // extended low in place of a stop bit: EOF,
                                // or a framing error on a non-empty byte
                                let sync_error = ch.byte != 0;
                                let frame_end = ch.start;
                                let ca = match std::mem::replace(
                                    &mut self.state,
                                    BState::WaitPoll { idle_since: clock },
                                ) {
                                    BState::Chars(ca) => ca,
                                    _ => unreachable!(),
                                };
                                let extra = if sync_error {
                                    FrameFlags::SYNC_ERROR
                                } else {
                                    FrameFlags::NONE
                                };
                                self.emit_poll(
                                    status,
                                    frames,
                                    ca.frame_start,
                                    ca.bytes,
                                    frame_end,
                                    extra,
                                );
                                self.state = BState::WaitListen {
                                    deadline: clock + self.fwt,
                                };
                            } else {
                                ca.bytes.push(ch.byte);
                                ca.char = None;
                                ca.last_activity = clock;
                            }
                        }
                    }
                } else if modulated && !ca.prev_modulated {
                    ca.char = Some(CharReader {
                        start: clock,
                        idx: 0,
                        byte: 0,
                    });
                } else if clock - ca.last_activity > stall {
                    // stream stalled without an EOF
                    let ca = match std::mem::replace(
                        &mut self.state,
                        BState::WaitPoll { idle_since: clock },
                    ) {
                        BState::Chars(ca) => ca,
                        _ => unreachable!(),
                    };
                    if !ca.bytes.is_empty() {
                        self.emit_poll(
                            status,
                            frames,
                            ca.frame_start,
                            ca.bytes,
                            clock,
                            FrameFlags::TRUNCATED,
                        );
                        self.state = BState::WaitListen {
                            deadline: clock + self.fwt,
                        };
                    }
                }
                if let BState::Chars(ca) = &mut self.state {
                    ca.prev_modulated = modulated;
                }
            }
            BState::WaitListen { deadline } => {
                let deadline = *deadline;
                if let Some(pulse) = self.pulses.update(clock, sample.modulation, self.modulation_min)
                {
                    if self.sof_pulse_width(pulse.width() as f64) {
                        self.state = BState::Chars(CharAssembly {
                            frame_start: pulse.start,
                            bytes: Vec::new(),
                            char: None,
                            prev_modulated: false,
                            last_activity: clock,
                        });
                    }
                    return;
                }
                if self.pulses.active() {
                    return;
                }
                let ripple = sample.filtered.abs() / status.signal_envelope.max(f32::EPSILON);
                if ripple > self.correlation && sample.modulation < self.modulation_min * 0.5 {
                    self.state = BState::Listen(ListenDecode {
                        frame_start: clock,
                        window_start: clock as f64,
                        levels: Vec::new(),
                    });
                } else if clock > deadline {
                    self.state = BState::WaitPoll { idle_since: clock };
                }
            }
            BState::Listen(ld) => {
                if (clock as f64) < ld.window_start + spe {
                    return;
                }
                let w0 = ld.window_start.round() as u64;
                let period1 = self.bitrate.period1;
                if window_energy(status, w0, period1) < self.correlation {
                    // subcarrier gone: close out the character stream
                    let ld = match std::mem::replace(
                        &mut self.state,
                        BState::WaitPoll { idle_since: clock },
                    ) {
                        BState::Listen(ld) => ld,
                        _ => unreachable!(),
                    };
                    let (bytes, flags) = parse_listen_levels(&ld.levels);
                    if !bytes.is_empty() {
                        self.emit_listen(status, frames, ld.frame_start, bytes, w0, flags);
                    }
                } else {
                    let level = if ld.levels.is_empty() {
                        0
                    } else {
                        let corr =
                            window_phase_correlation(status, w0, period1, period1 as u64);
                        let prev = *ld.levels.last().unwrap();
                        if corr < 0.0 {
                            prev ^ 1
                        } else {
                            prev
                        }
                    };
                    ld.levels.push(level);
                    ld.window_start += spe;
                }
            }
        }
    }

    fn sof_pulse_width(&self, width: f64) -> bool {
        let spe = self.bitrate.samples_per_etu;
        width >= 9.0 * spe && width <= 12.0 * spe
    }

    fn emit_poll(
        &mut self,
        status: &DecoderStatus,
        frames: &mut Vec<RawFrame>,
        frame_start: u64,
        bytes: Vec<u8>,
        frame_end: u64,
        extra: FrameFlags,
    ) {
        if bytes.is_empty() {
            return;
        }
        match bytes[0] {
            CMD_REQB | CMD_HLTB => {
                self.phase = FramePhase::Selection;
                self.pending_application = false;
            }
            CMD_ATTRIB => self.pending_application = true,
            _ => {}
        }
        frames.push(self.build_frame(
            status,
            FrameType::NfcPollFrame,
            bytes,
            extra,
            frame_start,
            frame_end,
        ));
    }

    fn emit_listen(
        &mut self,
        status: &DecoderStatus,
        frames: &mut Vec<RawFrame>,
        frame_start: u64,
        bytes: Vec<u8>,
        frame_end: u64,
        extra: FrameFlags,
    ) {
        if self.pending_application {
            self.pending_application = false;
            self.phase = FramePhase::Application;
        }
        frames.push(self.build_frame(
            status,
            FrameType::NfcListenFrame,
            bytes,
            extra,
            frame_start,
            frame_end,
        ));
    }

    fn build_frame(
        &self,
        status: &DecoderStatus,
        frame_type: FrameType,
        bytes: Vec<u8>,
        mut flags: FrameFlags,
        sample_start: u64,
        sample_end: u64,
    ) -> RawFrame {
        if bytes.len() >= 3
            && !flags.contains(FrameFlags::TRUNCATED)
            && !check_trailing_le(&bytes, crc_b)
        {
            flags |= FrameFlags::CRC_ERROR;
        }
        let mut builder = FrameBuilder::new(FrameTech::NfcB, frame_type);
        builder.extend(&bytes);
        builder.set_flag(flags);
        builder.set_phase(self.phase);
        builder.set_rate(self.bitrate.rate.bps());
        builder.set_sample_rate(status.params.sample_rate);
        builder.set_date_time(status.stream_time + status.time_at(sample_start));
        debug!(
            "NFC-B {frame_type:?} [{:02X?}] at sample {sample_start}",
            builder.bytes()
        );
        builder.finalize(
            status.time_at(sample_start),
            status.time_at(sample_end),
            sample_start,
            sample_end,
        )
    }
}

/// Parse a BPSK level stream: SOS zeros and ones, characters of
/// start + 8 data LSB + stop, EOS zeros.
fn parse_listen_levels(levels: &[u8]) -> (Vec<u8>, FrameFlags) {
    let mut flags = FrameFlags::NONE;
    let mut bytes = Vec::new();
    let mut i = 0;
    while i < levels.len() && levels[i] == 0 {
        i += 1;
    }
    if i < 8 {
        flags |= FrameFlags::SYNC_ERROR;
    }
    while i < levels.len() && levels[i] == 1 {
        i += 1;
    }
    while i < levels.len() {
        if levels[i] != 0 {
            flags |= FrameFlags::SYNC_ERROR;
            break;
        }
        if levels[i..].iter().all(|&b| b == 0) {
            break;
        }
        if i + 10 > levels.len() {
            flags |= FrameFlags::TRUNCATED;
            let avail = &levels[i + 1..];
            let take = avail.len().min(8);
            if take > 0 {
                bytes.push(bits_to_byte_lsb(&avail[..take]));
            }
            break;
        }
        bytes.push(bits_to_byte_lsb(&levels[i + 1..i + 9]));
        if levels[i + 9] != 1 {
            flags |= FrameFlags::SYNC_ERROR;
        }
        i += 10;
    }
    (bytes, flags)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{SampleBuffer, SampleType};
    use crate::testgen::{self, SIG_RATE};

    fn decode_all(samples: &[f32]) -> Vec<RawFrame> {
        let mut status = DecoderStatus::new(SIG_RATE);
        let mut nfcb = NfcB::new();
        nfcb.initialize(SIG_RATE);
        let mut buf = SampleBuffer::from_samples(samples, SampleType::RawIq, SIG_RATE, 0);
        let mut frames = Vec::new();
        while status.next_sample(&mut buf) {
            if status.bitrate.is_none() {
                if let Some(start) = nfcb.detect(&status) {
                    nfcb.lock(&mut status, start);
                }
            } else {
                nfcb.process_sample(&mut status, &mut frames);
            }
        }
        frames
    }

    fn with_crc_b(mut bytes: Vec<u8>) -> Vec<u8> {
        let crc = crc_b(&bytes);
        bytes.extend_from_slice(&crc.to_le_bytes());
        bytes
    }

    #[test]
    fn decode_reqb_poll() {
        let frame = with_crc_b(vec![0x05, 0x00, 0x00]);
        let mut sig = testgen::Signal::new();
        sig.carrier_ms(1.0);
        sig.nfcb_poll_bytes(&frame);
        sig.carrier_ms(1.0);
        let frames = decode_all(&sig.finish());
        assert_eq!(frames.len(), 1, "{frames:?}");
        assert_eq!(frames[0].tech(), FrameTech::NfcB);
        assert_eq!(frames[0].frame_type(), FrameType::NfcPollFrame);
        assert_eq!(frames[0].payload(), &frame[..]);
        assert!(frames[0].flags().is_empty());
    }

    #[test]
    fn decode_poll_and_bpsk_listen() {
        let poll = with_crc_b(vec![0x05, 0x00, 0x00]);
        // ATQB-style response: 0x50 + PUPI + application data + protocol info
        let listen = with_crc_b(vec![
            0x50, 0x01, 0x02, 0x03, 0x04, 0x00, 0x00, 0x00, 0x00, 0x11, 0x81, 0xE1,
        ]);
        let mut sig = testgen::Signal::new();
        sig.carrier_ms(1.0);
        sig.nfcb_poll_bytes(&poll);
        sig.carrier_us(200.0);
        sig.nfcb_listen_bytes(&listen);
        sig.carrier_ms(1.0);
        let frames = decode_all(&sig.finish());
        assert_eq!(frames.len(), 2, "{frames:?}");
        assert_eq!(frames[1].frame_type(), FrameType::NfcListenFrame);
        assert_eq!(frames[1].payload(), &listen[..]);
        assert!(frames[1].flags().is_empty(), "{:?}", frames[1].flags());
    }

    #[test]
    fn poll_crc_error_flagged() {
        let mut frame = with_crc_b(vec![0x05, 0x00, 0x08]);
        frame[1] ^= 0x04;
        let mut sig = testgen::Signal::new();
        sig.carrier_ms(1.0);
        sig.nfcb_poll_bytes(&frame);
        sig.carrier_ms(1.0);
        let frames = decode_all(&sig.finish());
        assert_eq!(frames.len(), 1);
        assert!(frames[0].has_flags(FrameFlags::CRC_ERROR));
        assert_eq!(frames[0].payload(), &frame[..]);
    }

    #[test]
    fn listen_level_parser() {
        let mut levels = vec![0u8; 10];
        levels.extend_from_slice(&[1, 1]);
        // byte 0xA5: start, bits LSB first, stop
        levels.push(0);
        for i in 0..8 {
            levels.push((0xA5 >> i) & 1);
        }
        levels.push(1);
        levels.extend_from_slice(&[0; 10]);
        let (bytes, flags) = parse_listen_levels(&levels);
        assert_eq!(bytes, vec![0xA5]);
        assert!(flags.is_empty());
    }
}

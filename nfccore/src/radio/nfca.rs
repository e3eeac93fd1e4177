//! NFC-A demodulator, ISO/IEC 14443-3 type A.
//!
//! Poll frames use modified Miller pause coding (sequences X/Y/Z), listen
//! frames use Manchester with an fc/16 subcarrier. The initial exchange is
//! always at 106 kbps.

use log::debug;

use crate::buffer::SampleBuffer;
use crate::crc::{check_trailing_le, crc_a};
use crate::frame::{FrameBuilder, FrameFlags, FramePhase, FrameTech, FrameType, RawFrame};
use crate::nfc::{NfcRate, NFCA_FWT_DEF};
use crate::radio::{assemble_parity_bits, fc_to_samples, window_energy, Pulse, PulseTracker};
use crate::status::{BitrateParams, DecoderStatus};

const CMD_REQA: u8 = 0x26;
const CMD_HLTA: u8 = 0x50;
const CMD_WUPA: u8 = 0x52;
const CMD_AUTH1: u8 = 0x60;
const CMD_AUTH2: u8 = 0x61;
const CMD_RATS: u8 = 0xE0;

#[derive(Debug, Clone, Copy, PartialEq)]
enum PrevBit {
    /// Immediately after the start-of-communication symbol.
    Start,
    One,
    Zero,
}

#[derive(Debug)]
struct PollDecode {
    frame_start: u64,
    window_start: f64,
    pulse: Option<Pulse>,
    soc_seen: bool,
    prev: PrevBit,
    bits: Vec<u8>,
}

#[derive(Debug)]
struct ListenDecode {
    frame_start: u64,
    window_start: f64,
    bits: Vec<u8>,
}

#[derive(Debug)]
enum AState {
    WaitPoll { idle_since: u64 },
    Poll(PollDecode),
    WaitListen { deadline: u64 },
    Listen(ListenDecode),
}

pub struct NfcA {
    modulation_min: f32,
    modulation_max: f32,
    correlation: f32,
    bitrate: BitrateParams,
    /// Frame waiting time for a listen response, in samples.
    fwt: u64,
    /// Silence before the technology lock is released, in samples.
    idle_timeout: u64,
    detect_pulses: PulseTracker,
    detect_candidate: Option<Pulse>,
    pulses: PulseTracker,
    state: AState,
    phase: FramePhase,
    pending_application: bool,
    last_poll_command: u8,
    encrypted: bool,
}

impl Default for NfcA {
    fn default() -> Self {
        Self::new()
    }
}

impl NfcA {
    pub fn new() -> Self {
        Self {
            modulation_min: 0.85,
            modulation_max: 1.0,
            correlation: 0.05,
            bitrate: BitrateParams::new(FrameTech::NfcA, NfcRate::R106k, 1),
            fwt: 0,
            idle_timeout: 0,
            detect_pulses: PulseTracker::default(),
            detect_candidate: None,
            pulses: PulseTracker::default(),
            state: AState::WaitPoll { idle_since: 0 },
            phase: FramePhase::Selection,
            pending_application: false,
            last_poll_command: 0,
            encrypted: false,
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
        self.bitrate = BitrateParams::new(FrameTech::NfcA, NfcRate::R106k, sample_rate);
        self.fwt = fc_to_samples(NFCA_FWT_DEF, sample_rate);
        self.idle_timeout = (sample_rate as f64 * 10e-3) as u64;
        self.reset();
    }

    pub fn reset(&mut self) {
        self.detect_pulses.reset();
        self.detect_candidate = None;
        self.pulses.reset();
        self.state = AState::WaitPoll { idle_since: 0 };
        self.phase = FramePhase::Selection;
        self.pending_application = false;
        self.last_poll_command = 0;
        self.encrypted = false;
    }

    /// Probe the shared status for a poll start-of-communication pause.
    /// Returns the symbol start on a hit; does not lock.
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
        if pulse.peak > self.modulation_max + f32::EPSILON {
            return None;
        }
        let width = pulse.width() as usize;
        if width < self.bitrate.period0 || width >= self.bitrate.period2 + self.bitrate.period4 {
            return None;
        }
        self.detect_candidate = Some(pulse);
        Some(pulse.start)
    }

    pub fn clear_detect(&mut self) {
        self.detect_pulses.reset();
    }

    /// Take ownership of the stream after a successful detect.
    pub fn lock(&mut self, status: &mut DecoderStatus, start: u64) {
        status.bitrate = Some(self.bitrate);
        self.pulses.reset();
        self.state = AState::Poll(PollDecode {
            frame_start: start,
            window_start: start as f64,
            pulse: self.detect_candidate.take(),
            soc_seen: false,
            prev: PrevBit::Start,
            bits: Vec::new(),
        });
    }

    /// Demodulate while this technology holds the bitrate lock.
    pub fn decode(
        &mut self,
        samples: &mut SampleBuffer,
        status: &mut DecoderStatus,
        frames: &mut Vec<RawFrame>,
    ) {
        while matches!(status.bitrate, Some(b) if b.tech == FrameTech::NfcA) {
            if !status.next_sample(samples) {
                break;
            }
            self.process_sample(status, frames);
        }
    }

    /// Flush any frame under construction as truncated.
    pub fn flush(&mut self, status: &mut DecoderStatus, frames: &mut Vec<RawFrame>) {
        let clock = status.signal_clock;
        match std::mem::replace(&mut self.state, AState::WaitPoll { idle_since: clock }) {
            AState::Poll(pd) => {
                if !pd.bits.is_empty() {
                    self.emit_poll(status, frames, pd, clock, FrameFlags::TRUNCATED);
                }
            }
            AState::Listen(ld) => {
                if ld.bits.len() > 1 {
                    self.emit_listen(status, frames, ld, clock, FrameFlags::TRUNCATED);
                }
            }
            _ => {}
        }
    }

    fn process_sample(&mut self, status: &mut DecoderStatus, frames: &mut Vec<RawFrame>) {
        let clock = status.signal_clock;

        // carrier lost mid-exchange: flush and release the lock
        if status.signal_average < status.power_level_threshold {
            let in_frame = matches!(self.state, AState::Poll(_) | AState::Listen(_));
            if in_frame {
                self.flush_sync_error(status, frames);
            }
            self.state = AState::WaitPoll { idle_since: clock };
            self.phase = FramePhase::Selection;
            self.encrypted = false;
            status.bitrate = None;
            return;
        }

        let sample = status.sample_at(clock);
        let spe = self.bitrate.samples_per_etu;

        match &mut self.state {
            AState::WaitPoll { idle_since } => {
                let idle_since = *idle_since;
                if let Some(pulse) = self.pulses.update(clock, sample.modulation, self.modulation_min)
                {
                    if self.poll_start_pulse(&pulse) {
                        self.start_poll(pulse);
                    }
                } else if !self.pulses.active() && clock - idle_since > self.idle_timeout {
                    debug!("NFC-A idle, releasing lock at sample {clock}");
                    status.bitrate = None;
                    self.state = AState::WaitPoll { idle_since: clock };
                }
            }
            AState::Poll(pd) => {
                if let Some(pulse) =
                    self.pulses.update(clock, sample.modulation, self.modulation_min)
                {
                    pd.pulse = Some(pulse);
                }
                if (clock as f64) < pd.window_start + spe {
                    return;
                }
                // close the current bit window
                let period0 = self.bitrate.period0;
                let period2 = self.bitrate.period2;
                let symbol = match pd.pulse.take() {
                    Some(pulse) => {
                        let offset = pulse.center() - pd.window_start;
                        if offset < spe * 0.375 {
                            // sequence Z, re-sync the grid on the pause edge
                            let delta = pulse.start as f64 - pd.window_start;
                            if delta.abs() <= period0 as f64 {
                                pd.window_start += delta;
                            }
                            Symbol::Z
                        } else {
                            let delta = pulse.start as f64 - period2 as f64 - pd.window_start;
                            if delta.abs() <= period0 as f64 {
                                pd.window_start += delta;
                            }
                            Symbol::X
                        }
                    }
                    None => Symbol::Y,
                };

                pd.window_start += spe;

                if !pd.soc_seen {
                    // first window holds the start of communication
                    pd.soc_seen = true;
                    return;
                }

                match symbol {
                    Symbol::X => {
                        pd.bits.push(1);
                        pd.prev = PrevBit::One;
                    }
                    Symbol::Z => {
                        pd.bits.push(0);
                        pd.prev = PrevBit::Zero;
                    }
                    Symbol::Y => match pd.prev {
                        PrevBit::One => {
                            pd.bits.push(0);
                            pd.prev = PrevBit::Zero;
                        }
                        PrevBit::Zero => {
                            // end of communication: the trailing zero is the
                            // end delimiter, not data
                            let mut pd = match std::mem::replace(
                                &mut self.state,
                                AState::WaitPoll { idle_since: clock },
                            ) {
                                AState::Poll(pd) => pd,
                                _ => unreachable!(),
                            };
                            pd.bits.pop();
                            let frame_end = (pd.window_start - 2.0 * spe).round() as u64;
                            self.emit_poll(status, frames, pd, frame_end, FrameFlags::NONE);
                            self.state = AState::WaitListen {
                                deadline: clock + self.fwt,
                            };
                        }
                        PrevBit::Start => {
                            // no data after the start symbol, drop silently
                            self.state = AState::WaitPoll { idle_since: clock };
                        }
                    },
                }
            }
            AState::WaitListen { deadline } => {
                let deadline = *deadline;
                if let Some(pulse) =
                    self.pulses.update(clock, sample.modulation, self.modulation_min)
                {
                    // the reader polled again instead of the card answering
                    if self.poll_start_pulse(&pulse) {
                        self.start_poll(pulse);
                    }
                    return;
                }
                if self.pulses.active() {
                    return;
                }
                let ripple = sample.filtered.abs() / status.signal_envelope.max(f32::EPSILON);
                if ripple > self.correlation && sample.modulation < self.modulation_min * 0.5 {
                    self.state = AState::Listen(ListenDecode {
                        frame_start: clock,
                        window_start: clock as f64,
                        bits: Vec::new(),
                    });
                } else if clock > deadline {
                    self.state = AState::WaitPoll { idle_since: clock };
                }
            }
            AState::Listen(ld) => {
                if (clock as f64) < ld.window_start + spe {
                    return;
                }
                let w0 = ld.window_start.round() as u64;
                let half = self.bitrate.period2;
                let e1 = window_energy(status, w0, half);
                let e2 = window_energy(status, w0 + half as u64, half);
                if e1.max(e2) < self.correlation {
                    let ld = match std::mem::replace(
                        &mut self.state,
                        AState::WaitPoll { idle_since: clock },
                    ) {
                        AState::Listen(ld) => ld,
                        _ => unreachable!(),
                    };
                    self.emit_listen(status, frames, ld, w0, FrameFlags::NONE);
                } else {
                    ld.bits.push(if e1 > e2 { 1 } else { 0 });
                    ld.window_start += spe;
                }
            }
        }
    }

    fn poll_start_pulse(&self, pulse: &Pulse) -> bool {
        let width = pulse.width() as usize;
        pulse.peak <= self.modulation_max + f32::EPSILON
            && width >= self.bitrate.period0
            && width < self.bitrate.period2 + self.bitrate.period4
    }

    fn start_poll(&mut self, pulse: Pulse) {
        self.state = AState::Poll(PollDecode {
            frame_start: pulse.start,
            window_start: pulse.start as f64,
            pulse: Some(pulse),
            soc_seen: false,
            prev: PrevBit::Start,
            bits: Vec::new(),
        });
    }

    fn flush_sync_error(&mut self, status: &mut DecoderStatus, frames: &mut Vec<RawFrame>) {
        let clock = status.signal_clock;
        match std::mem::replace(&mut self.state, AState::WaitPoll { idle_since: clock }) {
            AState::Poll(pd) if !pd.bits.is_empty() => {
                self.emit_poll(
                    status,
                    frames,
                    pd,
                    clock,
                    FrameFlags::TRUNCATED | FrameFlags::SYNC_ERROR,
                );
            }
            AState::Listen(ld) if ld.bits.len() > 1 => {
                self.emit_listen(
                    status,
                    frames,
                    ld,
                    clock,
                    FrameFlags::TRUNCATED | FrameFlags::SYNC_ERROR,
                );
            }
            _ => {}
        }
    }

    fn emit_poll(
        &mut self,
        status: &DecoderStatus,
        frames: &mut Vec<RawFrame>,
        pd: PollDecode,
        frame_end: u64,
        extra: FrameFlags,
    ) {
        let (bytes, mut flags) = assemble_parity_bits(&pd.bits);
        if bytes.is_empty() {
            return;
        }
        flags |= extra;
        self.note_poll_command(bytes[0]);
        frames.push(self.build_frame(
            status,
            FrameType::NfcPollFrame,
            bytes,
            flags,
            pd.frame_start,
            frame_end,
        ));
    }

    fn emit_listen(
        &mut self,
        status: &DecoderStatus,
        frames: &mut Vec<RawFrame>,
        ld: ListenDecode,
        frame_end: u64,
        extra: FrameFlags,
    ) {
        // the first bit is the start of communication, not data
        if ld.bits.len() <= 1 {
            return;
        }
        let (bytes, mut flags) = assemble_parity_bits(&ld.bits[1..]);
        if bytes.is_empty() {
            return;
        }
        flags |= extra;
        if self.pending_application {
            self.pending_application = false;
            self.phase = FramePhase::Application;
        }
        frames.push(self.build_frame(
            status,
            FrameType::NfcListenFrame,
            bytes,
            flags,
            ld.frame_start,
            frame_end,
        ));
        // a completed authentication exchange starts the ciphered session
        if matches!(self.last_poll_command, CMD_AUTH1 | CMD_AUTH2) {
            self.encrypted = true;
        }
    }

    fn build_frame(
        &mut self,
        status: &DecoderStatus,
        frame_type: FrameType,
        bytes: Vec<u8>,
        mut flags: FrameFlags,
        sample_start: u64,
        sample_end: u64,
    ) -> RawFrame {
        if self.encrypted {
            // parity and CRC are scrambled by the cipher stream
            flags = FrameFlags::ENCRYPTED
                | if flags.contains(FrameFlags::SHORT_FRAME) {
                    FrameFlags::SHORT_FRAME
                } else {
                    FrameFlags::NONE
                }
                | if flags.contains(FrameFlags::TRUNCATED) {
                    FrameFlags::TRUNCATED
                } else {
                    FrameFlags::NONE
                };
        } else if bytes.len() >= 3
            && !flags.contains(FrameFlags::TRUNCATED)
            && !check_trailing_le(&bytes, crc_a)
        {
            flags |= FrameFlags::CRC_ERROR;
        }

        let mut builder = FrameBuilder::new(FrameTech::NfcA, frame_type);
        builder.extend(&bytes);
        builder.set_flag(flags);
        builder.set_phase(self.phase);
        builder.set_rate(self.bitrate.rate.bps());
        builder.set_sample_rate(status.params.sample_rate);
        builder.set_date_time(status.stream_time + status.time_at(sample_start));
        debug!(
            "NFC-A {frame_type:?} [{:02X?}] at sample {sample_start}",
            builder.bytes()
        );
        builder.finalize(
            status.time_at(sample_start),
            status.time_at(sample_end),
            sample_start,
            sample_end,
        )
    }

    fn note_poll_command(&mut self, command: u8) {
        if !self.encrypted {
            self.last_poll_command = command;
        }
        match command {
            CMD_REQA | CMD_WUPA | CMD_HLTA => {
                self.phase = FramePhase::Selection;
                self.pending_application = false;
                self.encrypted = false;
                self.last_poll_command = command;
            }
            _ => {}
        }
        if !self.encrypted && command == CMD_RATS {
            self.pending_application = true;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Symbol {
    X,
    Y,
    Z,
}

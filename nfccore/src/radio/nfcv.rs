//! NFC-V demodulator, ISO/IEC 15693.
//!
//! Poll frames use 1-out-of-4 pulse position coding over eight 9.44 us
//! slots per bit pair; listen frames use a single fc/32 subcarrier with
//! Manchester halves. The default minimum modulation threshold is 0.85,
//! matching the shallow pauses of low-modulation V readers.

use log::debug;

use crate::buffer::SampleBuffer;
use crate::crc::{check_trailing_le, crc_v};
use crate::frame::{FrameBuilder, FrameFlags, FramePhase, FrameTech, FrameType, RawFrame};
use crate::nfc::{vicc_slot_samples, NfcRate, NFCV_FWT_DEF};
use crate::radio::{assemble_plain_bits, fc_to_samples, window_energy, PulseTracker};
use crate::status::{BitrateParams, DecoderStatus};

#[derive(Debug)]
struct PollDecode {
    frame_start: u64,
    window_start: f64,
    center: Option<f64>,
    bits: Vec<u8>,
}

#[derive(Debug)]
struct ListenDecode {
    frame_start: u64,
    window_start: f64,
    bits: Vec<u8>,
}

#[derive(Debug)]
enum VState {
    WaitPoll { idle_since: u64 },
    Sof { t0: u64, confirmed: bool },
    Poll(PollDecode),
    WaitListen { deadline: u64 },
    Listen(ListenDecode),
}

pub struct NfcV {
    modulation_min: f32,
    modulation_max: f32,
    correlation: f32,
    /// Pulse slot duration in samples.
    tv: f64,
    bitrate: BitrateParams,
    fwt: u64,
    idle_timeout: u64,
    detect_pulses: PulseTracker,
    pulses: PulseTracker,
    state: VState,
}

impl Default for NfcV {
    fn default() -> Self {
        Self::new()
    }
}

impl NfcV {
    pub fn new() -> Self {
        Self {
            modulation_min: 0.85,
            modulation_max: 1.0,
            correlation: 0.05,
            tv: 1.0,
            bitrate: BitrateParams::new(FrameTech::NfcV, NfcRate::R26k, 1),
            fwt: 0,
            idle_timeout: 0,
            detect_pulses: PulseTracker::default(),
            pulses: PulseTracker::default(),
            state: VState::WaitPoll { idle_since: 0 },
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
        self.tv = vicc_slot_samples(sample_rate);
        self.bitrate = BitrateParams::new(FrameTech::NfcV, NfcRate::R26k, sample_rate);
        self.fwt = fc_to_samples(NFCV_FWT_DEF, sample_rate);
        self.idle_timeout = (sample_rate as f64 * 10e-3) as u64;
        self.reset();
    }

    pub fn reset(&mut self) {
        self.detect_pulses.reset();
        self.pulses.reset();
        self.state = VState::WaitPoll { idle_since: 0 };
    }

    /// Probe for the first SOF pause, one slot wide.
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
        if pulse.peak > self.modulation_max + f32::EPSILON || !self.slot_pulse(pulse.width() as f64)
        {
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
        self.state = VState::Sof {
            t0: start,
            confirmed: false,
        };
    }

    pub fn decode(
        &mut self,
        samples: &mut SampleBuffer,
        status: &mut DecoderStatus,
        frames: &mut Vec<RawFrame>,
    ) {
        while matches!(status.bitrate, Some(b) if b.tech == FrameTech::NfcV) {
            if !status.next_sample(samples) {
                break;
            }
            self.process_sample(status, frames);
        }
    }

    pub fn flush(&mut self, status: &mut DecoderStatus, frames: &mut Vec<RawFrame>) {
        let clock = status.signal_clock;
        match std::mem::replace(&mut self.state, VState::WaitPoll { idle_since: clock }) {
            VState::Poll(pd) if !pd.bits.is_empty() => {
                self.emit_poll(status, frames, pd, clock, FrameFlags::TRUNCATED);
            }
            VState::Listen(ld) if ld.bits.len() > 1 => {
                self.emit_listen(status, frames, ld, clock, FrameFlags::TRUNCATED);
            }
            _ => {}
        }
    }

    fn process_sample(&mut self, status: &mut DecoderStatus, frames: &mut Vec<RawFrame>) {
        let clock = status.signal_clock;

        if status.signal_average < status.power_level_threshold {
            self.flush(status, frames);
            status.bitrate = None;
            self.state = VState::WaitPoll { idle_since: clock };
            return;
        }

        let sample = status.sample_at(clock);
        let tv = self.tv;
        let window = 8.0 * tv;

        match &mut self.state {
            VState::WaitPoll { idle_since } => {
                let idle_since = *idle_since;
                if let Some(pulse) = self.pulses.update(clock, sample.modulation, self.modulation_min)
                {
                    if self.slot_pulse(pulse.width() as f64) {
                        self.state = VState::Sof {
                            t0: pulse.start,
                            confirmed: false,
                        };
                    }
                } else if !self.pulses.active() && clock - idle_since > self.idle_timeout {
                    debug!("NFC-V idle, releasing lock at sample {clock}");
                    status.bitrate = None;
                    self.state = VState::WaitPoll { idle_since: clock };
                }
            }
            VState::Sof { t0, confirmed } => {
                let t0 = *t0;
                if let Some(pulse) = self.pulses.update(clock, sample.modulation, self.modulation_min)
                {
                    let offset = pulse.center() - t0 as f64;
                    if offset >= 3.5 * tv && offset <= 5.5 * tv {
                        *confirmed = true;
                    }
                }
                if (clock as f64) >= t0 as f64 + window {
                    if *confirmed {
                        self.state = VState::Poll(PollDecode {
                            frame_start: t0,
                            window_start: t0 as f64 + window,
                            center: None,
                            bits: Vec::new(),
                        });
                    } else {
                        debug!("NFC-V SOF not confirmed at sample {clock}");
                        status.bitrate = None;
                        self.state = VState::WaitPoll { idle_since: clock };
                    }
                }
            }
            VState::Poll(pd) => {
                if let Some(pulse) = self.pulses.update(clock, sample.modulation, self.modulation_min)
                {
                    pd.center = Some(pulse.center());
                }
                if (clock as f64) < pd.window_start + window {
                    return;
                }
                let w0 = pd.window_start;
                match pd.center.take() {
                    Some(center) => {
                        let slot = ((center - w0) / tv).floor() as i64;
                        match slot {
                            1 | 3 | 5 | 7 => {
                                let value = ((slot - 1) / 2) as u8;
                                pd.bits.push(value & 1);
                                pd.bits.push((value >> 1) & 1);
                                pd.window_start += window;
                            }
                            2 => {
                                // end of frame
                                let pd = match std::mem::replace(
                                    &mut self.state,
                                    VState::WaitPoll { idle_since: clock },
                                ) {
                                    VState::Poll(pd) => pd,
                                    _ => unreachable!(),
                                };
                                let frame_end = (w0 + 3.0 * tv).round() as u64;
                                self.emit_poll(status, frames, pd, frame_end, FrameFlags::NONE);
                                self.state = VState::WaitListen {
                                    deadline: clock + self.fwt,
                                };
                            }
                            _ => {
                                let pd = match std::mem::replace(
                                    &mut self.state,
                                    VState::WaitPoll { idle_since: clock },
                                ) {
                                    VState::Poll(pd) => pd,
                                    _ => unreachable!(),
                                };
                                self.emit_poll(
                                    status,
                                    frames,
                                    pd,
                                    clock,
                                    FrameFlags::TRUNCATED | FrameFlags::SYNC_ERROR,
                                );
                            }
                        }
                    }
                    None => {
                        // no pause in a whole coding window
                        let pd = match std::mem::replace(
                            &mut self.state,
                            VState::WaitPoll { idle_since: clock },
                        ) {
                            VState::Poll(pd) => pd,
                            _ => unreachable!(),
                        };
                        if !pd.bits.is_empty() {
                            self.emit_poll(
                                status,
                                frames,
                                pd,
                                clock,
                                FrameFlags::TRUNCATED | FrameFlags::SYNC_ERROR,
                            );
                        }
                    }
                }
            }
            VState::WaitListen { deadline } => {
                let deadline = *deadline;
                if let Some(pulse) = self.pulses.update(clock, sample.modulation, self.modulation_min)
                {
                    if self.slot_pulse(pulse.width() as f64) {
                        self.state = VState::Sof {
                            t0: pulse.start,
                            confirmed: false,
                        };
                    }
                    return;
                }
                if self.pulses.active() {
                    return;
                }
                let ripple = sample.filtered.abs() / status.signal_envelope.max(f32::EPSILON);
                if ripple > self.correlation && sample.modulation < self.modulation_min * 0.5 {
                    self.state = VState::Listen(ListenDecode {
                        frame_start: clock,
                        window_start: clock as f64,
                        bits: Vec::new(),
                    });
                } else if clock > deadline {
                    self.state = VState::WaitPoll { idle_since: clock };
                }
            }
            VState::Listen(ld) => {
                let bit_len = 2.0 * tv;
                if (clock as f64) < ld.window_start + bit_len {
                    return;
                }
                let w0 = ld.window_start.round() as u64;
                let half = tv.round() as usize;
                let e1 = window_energy(status, w0, half);
                let e2 = window_energy(status, w0 + half as u64, half);
                if e1.max(e2) < self.correlation {
                    let ld = match std::mem::replace(
                        &mut self.state,
                        VState::WaitPoll { idle_since: clock },
                    ) {
                        VState::Listen(ld) => ld,
                        _ => unreachable!(),
                    };
                    self.emit_listen(status, frames, ld, w0, FrameFlags::NONE);
                } else {
                    ld.bits.push(if e1 > e2 { 1 } else { 0 });
                    ld.window_start += bit_len;
                }
            }
        }
    }

    fn slot_pulse(&self, width: f64) -> bool {
        width >= self.tv * 0.75 && width <= self.tv * 1.5
    }

    fn emit_poll(
        &mut self,
        status: &DecoderStatus,
        frames: &mut Vec<RawFrame>,
        pd: PollDecode,
        frame_end: u64,
        extra: FrameFlags,
    ) {
        let (bytes, mut flags) = assemble_plain_bits(&pd.bits);
        if bytes.is_empty() {
            return;
        }
        flags |= extra;
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
        if ld.bits.len() <= 1 {
            return;
        }
        let (bytes, mut flags) = assemble_plain_bits(&ld.bits[1..]);
        if bytes.is_empty() {
            return;
        }
        flags |= extra;
        frames.push(self.build_frame(
            status,
            FrameType::NfcListenFrame,
            bytes,
            flags,
            ld.frame_start,
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
            && !check_trailing_le(&bytes, crc_v)
        {
            flags |= FrameFlags::CRC_ERROR;
        }
        let mut builder = FrameBuilder::new(FrameTech::NfcV, frame_type);
        builder.extend(&bytes);
        builder.set_flag(flags);
        builder.set_phase(FramePhase::Selection);
        builder.set_rate(self.bitrate.rate.bps());
        builder.set_sample_rate(status.params.sample_rate);
        builder.set_date_time(status.stream_time + status.time_at(sample_start));
        debug!(
            "NFC-V {frame_type:?} [{:02X?}] at sample {sample_start}",
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

//! NFC-F demodulator, JIS X 6319-4 (FeliCa).
//!
//! Manchester coding at 212 or 424 kbps in both directions: 48-bit zero
//! preamble, 16-bit sync word, then MSB-first bytes with a length prefix
//! and a big-endian CRC. Even command codes are requests, odd are responses.

use log::debug;

use crate::buffer::SampleBuffer;
use crate::crc::crc_f;
use crate::frame::{FrameBuilder, FrameFlags, FramePhase, FrameTech, FrameType, RawFrame};
use crate::nfc::{NfcRate, NFCF_SYNC};
use crate::radio::{window_modulation, Pulse, PulseTracker};
use crate::status::{BitrateParams, DecoderStatus};

/// Pulses needed before the preamble alignment is trusted.
const ALIGN_PULSES: usize = 5;

#[derive(Debug, Default)]
struct BurstAlign {
    starts: Vec<u64>,
}

impl BurstAlign {
    fn clear(&mut self) {
        self.starts.clear();
    }

    /// Feed one completed pulse; returns the matching rate when the last
    /// pulses are evenly spaced at one symbol period.
    fn push(&mut self, pulse: Pulse, sample_rate: u32) -> Option<NfcRate> {
        self.starts.push(pulse.start);
        if self.starts.len() > 8 {
            self.starts.remove(0);
        }
        for rate in [NfcRate::R212k, NfcRate::R424k] {
            let spe = rate.etu_samples(sample_rate);
            if self.matches(spe) {
                return Some(rate);
            }
        }
        None
    }

    fn matches(&self, spe: f64) -> bool {
        if self.starts.len() < ALIGN_PULSES {
            return false;
        }
        let tail = &self.starts[self.starts.len() - ALIGN_PULSES..];
        tail.windows(2).all(|w| {
            let spacing = (w[1] - w[0]) as f64;
            (spacing - spe).abs() < spe * 0.2
        })
    }
}

#[derive(Debug)]
struct BitsDecode {
    burst_start: u64,
    window_start: f64,
    reg: u16,
    synced: bool,
    inverted: bool,
    acc: u8,
    acc_bits: u8,
    bytes: Vec<u8>,
    quiet: u32,
}

#[derive(Debug)]
enum FState {
    Burst { idle_since: u64 },
    Bits(BitsDecode),
}

pub struct NfcF {
    modulation_min: f32,
    modulation_max: f32,
    correlation: f32,
    sample_rate: u32,
    bitrate: BitrateParams,
    idle_timeout: u64,
    detect_pulses: PulseTracker,
    detect_align: BurstAlign,
    detect_rate: Option<NfcRate>,
    pulses: PulseTracker,
    align: BurstAlign,
    state: FState,
}

impl Default for NfcF {
    fn default() -> Self {
        Self::new()
    }
}

impl NfcF {
    pub fn new() -> Self {
        Self {
            modulation_min: 0.10,
            modulation_max: 0.75,
            correlation: 0.05,
            sample_rate: 1,
            bitrate: BitrateParams::new(FrameTech::NfcF, NfcRate::R212k, 1),
            idle_timeout: 0,
            detect_pulses: PulseTracker::default(),
            detect_align: BurstAlign::default(),
            detect_rate: None,
            pulses: PulseTracker::default(),
            align: BurstAlign::default(),
            state: FState::Burst { idle_since: 0 },
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
        self.sample_rate = sample_rate;
        self.bitrate = BitrateParams::new(FrameTech::NfcF, NfcRate::R212k, sample_rate);
        self.idle_timeout = (sample_rate as f64 * 10e-3) as u64;
        self.reset();
    }

    pub fn reset(&mut self) {
        self.detect_pulses.reset();
        self.detect_align.clear();
        self.detect_rate = None;
        self.pulses.reset();
        self.align.clear();
        self.state = FState::Burst { idle_since: 0 };
    }

    /// Probe for the Manchester preamble pulse train at 212 or 424 kbps.
    pub fn detect(&mut self, status: &DecoderStatus) -> Option<u64> {
        if status.signal_envelope < status.power_level_threshold {
            self.detect_pulses.reset();
            self.detect_align.clear();
            return None;
        }
        let clock = status.signal_clock;
        let sample = status.sample_at(clock);
        let pulse = self
            .detect_pulses
            .update(clock, sample.modulation, self.modulation_min)?;
        if pulse.peak > self.modulation_max || !self.half_symbol_pulse(&pulse) {
            return None;
        }
        let rate = self.detect_align.push(pulse, status.params.sample_rate)?;
        self.detect_rate = Some(rate);
        let spe = rate.etu_samples(status.params.sample_rate);
        let first = self.detect_align.starts[0];
        Some((first as f64 - spe / 2.0).max(0.0) as u64)
    }

    pub fn clear_detect(&mut self) {
        self.detect_pulses.reset();
        self.detect_align.clear();
    }

    pub fn lock(&mut self, status: &mut DecoderStatus, start: u64) {
        let rate = self.detect_rate.take().unwrap_or(NfcRate::R212k);
        self.bitrate = BitrateParams::new(FrameTech::NfcF, rate, status.params.sample_rate);
        status.bitrate = Some(self.bitrate);
        self.pulses.reset();
        self.align.clear();
        let spe = self.bitrate.samples_per_etu;
        let last = *self.detect_align.starts.last().unwrap_or(&start);
        self.state = FState::Bits(BitsDecode {
            burst_start: start,
            window_start: last as f64 + spe / 2.0,
            reg: 0,
            synced: false,
            inverted: false,
            acc: 0,
            acc_bits: 0,
            bytes: Vec::new(),
            quiet: 0,
        });
        self.detect_align.clear();
    }

    pub fn decode(
        &mut self,
        samples: &mut SampleBuffer,
        status: &mut DecoderStatus,
        frames: &mut Vec<RawFrame>,
    ) {
        while matches!(status.bitrate, Some(b) if b.tech == FrameTech::NfcF) {
            if !status.next_sample(samples) {
                break;
            }
            self.process_sample(status, frames);
        }
    }

    pub fn flush(&mut self, status: &mut DecoderStatus, frames: &mut Vec<RawFrame>) {
        let clock = status.signal_clock;
        if let FState::Bits(bd) = std::mem::replace(
            &mut self.state,
            FState::Burst { idle_since: clock },
        ) {
            if bd.synced && !bd.bytes.is_empty() {
                self.emit(status, frames, &bd, clock, FrameFlags::TRUNCATED);
            }
        }
    }

    fn process_sample(&mut self, status: &mut DecoderStatus, frames: &mut Vec<RawFrame>) {
        let clock = status.signal_clock;

        if status.signal_average < status.power_level_threshold {
            self.flush(status, frames);
            status.bitrate = None;
            self.state = FState::Burst { idle_since: clock };
            return;
        }

        let sample = status.sample_at(clock);
        let spe = self.bitrate.samples_per_etu;

        match &mut self.state {
            FState::Burst { idle_since } => {
                let idle_since = *idle_since;
                if let Some(pulse) = self.pulses.update(clock, sample.modulation, self.modulation_min)
                {
                    if self.half_symbol_pulse(&pulse) {
                        if self
                            .align
                            .push(pulse, status.params.sample_rate)
                            .is_some()
                        {
                            let last = *self.align.starts.last().unwrap();
                            let first = self.align.starts[0];
                            self.align.clear();
                            self.state = FState::Bits(BitsDecode {
                                burst_start: (first as f64 - spe / 2.0).max(0.0) as u64,
                                window_start: last as f64 + spe / 2.0,
                                reg: 0,
                                synced: false,
                                inverted: false,
                                acc: 0,
                                acc_bits: 0,
                                bytes: Vec::new(),
                                quiet: 0,
                            });
                        }
                        return;
                    }
                } else if !self.pulses.active() && clock - idle_since > self.idle_timeout {
                    debug!("NFC-F idle, releasing lock at sample {clock}");
                    status.bitrate = None;
                    self.state = FState::Burst { idle_since: clock };
                }
            }
            FState::Bits(bd) => {
                if (clock as f64) < bd.window_start + spe {
                    return;
                }
                let w0 = bd.window_start.round() as u64;
                let half = self.bitrate.period2;
                let m1 = window_modulation(status, w0, half);
                let m2 = window_modulation(status, w0 + half as u64, half);

                if m1.max(m2) < self.modulation_min * 0.5 {
                    bd.quiet += 1;
                    if bd.synced {
                        // modulation ceased mid-frame
                        let bd = match std::mem::replace(
                            &mut self.state,
                            FState::Burst { idle_since: clock },
                        ) {
                            FState::Bits(bd) => bd,
                            _ => unreachable!(),
                        };
                        if !bd.bytes.is_empty() {
                            self.emit(status, frames, &bd, w0, FrameFlags::TRUNCATED);
                        }
                    } else if bd.quiet > 2 {
                        self.state = FState::Burst { idle_since: clock };
                    } else {
                        bd.window_start += spe;
                    }
                    return;
                }

                bd.quiet = 0;
                let mut bit = if m2 > m1 { 0u8 } else { 1u8 };
                if bd.inverted {
                    bit ^= 1;
                }

                if !bd.synced {
                    bd.reg = (bd.reg << 1) | bit as u16;
                    if bd.reg == NFCF_SYNC {
                        bd.synced = true;
                    } else if bd.reg == !NFCF_SYNC {
                        bd.synced = true;
                        bd.inverted = true;
                    }
                } else {
                    bd.acc = (bd.acc << 1) | bit;
                    bd.acc_bits += 1;
                    if bd.acc_bits == 8 {
                        bd.bytes.push(bd.acc);
                        bd.acc = 0;
                        bd.acc_bits = 0;
                        let expected = bd.bytes[0] as usize + 2;
                        if bd.bytes[0] > 0 && bd.bytes.len() == expected {
                            let bd = match std::mem::replace(
                                &mut self.state,
                                FState::Burst { idle_since: clock },
                            ) {
                                FState::Bits(bd) => bd,
                                _ => unreachable!(),
                            };
                            self.emit(status, frames, &bd, w0, FrameFlags::NONE);
                            return;
                        }
                        if bd.bytes[0] == 0 {
                            let bd = match std::mem::replace(
                                &mut self.state,
                                FState::Burst { idle_since: clock },
                            ) {
                                FState::Bits(bd) => bd,
                                _ => unreachable!(),
                            };
                            self.emit(status, frames, &bd, w0, FrameFlags::SYNC_ERROR);
                            return;
                        }
                    }
                }
                bd.window_start += spe;
            }
        }
    }

    fn half_symbol_pulse(&self, pulse: &Pulse) -> bool {
        let width = pulse.width() as f64;
        let min = NfcRate::R424k.etu_samples(self.sample_rate) / 3.0;
        let max = NfcRate::R212k.etu_samples(self.sample_rate) * 0.8;
        width >= min && width <= max
    }

    fn emit(
        &mut self,
        status: &DecoderStatus,
        frames: &mut Vec<RawFrame>,
        bd: &BitsDecode,
        frame_end: u64,
        extra: FrameFlags,
    ) {
        let bytes = &bd.bytes;
        let mut flags = extra;
        let length = bytes[0] as usize;
        if !flags.contains(FrameFlags::TRUNCATED) {
            if bytes.len() == length + 2 {
                let crc = crc_f(&bytes[..length]);
                let tail = u16::from_be_bytes([bytes[length], bytes[length + 1]]);
                if crc != tail {
                    flags |= FrameFlags::CRC_ERROR;
                }
            } else {
                flags |= FrameFlags::SYNC_ERROR;
            }
        }

        // even command codes are reader requests, odd are card responses
        let frame_type = match bytes.get(1) {
            Some(cmd) if cmd % 2 == 0 => FrameType::NfcPollFrame,
            Some(_) => FrameType::NfcListenFrame,
            None => FrameType::NfcPollFrame,
        };
        let phase = match bytes.get(1) {
            Some(0x00) | Some(0x01) => FramePhase::Selection,
            _ => FramePhase::Application,
        };

        let mut builder = FrameBuilder::new(FrameTech::NfcF, frame_type);
        builder.extend(bytes);
        builder.set_flag(flags);
        builder.set_phase(phase);
        builder.set_rate(self.bitrate.rate.bps());
        builder.set_sample_rate(status.params.sample_rate);
        builder.set_date_time(status.stream_time + status.time_at(bd.burst_start));
        debug!(
            "NFC-F {frame_type:?} [{:02X?}] at sample {}",
            builder.bytes(),
            bd.burst_start
        );
        frames.push(builder.finalize(
            status.time_at(bd.burst_start),
            status.time_at(frame_end),
            bd.burst_start,
            frame_end,
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{SampleBuffer, SampleType};
    use crate::testgen::{self, SIG_RATE};

    fn decode_all(samples: &[f32]) -> Vec<RawFrame> {
        let mut status = DecoderStatus::new(SIG_RATE);
        let mut nfcf = NfcF::new();
        nfcf.initialize(SIG_RATE);
        let mut buf = SampleBuffer::from_samples(samples, SampleType::RawIq, SIG_RATE, 0);
        let mut frames = Vec::new();
        while status.next_sample(&mut buf) {
            if status.bitrate.is_none() {
                if let Some(start) = nfcf.detect(&status) {
                    nfcf.lock(&mut status, start);
                }
            } else {
                nfcf.process_sample(&mut status, &mut frames);
            }
        }
        frames
    }

    fn felica_frame(payload: &[u8]) -> Vec<u8> {
        let mut bytes = vec![payload.len() as u8 + 1];
        bytes.extend_from_slice(payload);
        let crc = crc_f(&bytes);
        bytes.extend_from_slice(&crc.to_be_bytes());
        bytes
    }

    #[test]
    fn decode_reqc_frame() {
        // polling request: cmd 00, system code FFFF, request code, time slots
        let frame = felica_frame(&[0x00, 0xFF, 0xFF, 0x00, 0x03]);
        let mut sig = testgen::Signal::new();
        sig.carrier_ms(1.0);
        sig.nfcf_frame(&frame);
        sig.carrier_ms(1.0);
        let frames = decode_all(&sig.finish());
        assert_eq!(frames.len(), 1, "{frames:?}");
        assert_eq!(frames[0].tech(), FrameTech::NfcF);
        assert_eq!(frames[0].frame_type(), FrameType::NfcPollFrame);
        assert_eq!(frames[0].payload(), &frame[..]);
        assert!(frames[0].flags().is_empty(), "{:?}", frames[0].flags());
        assert_eq!(frames[0].rate(), 211_875);
    }

    #[test]
    fn decode_request_and_response() {
        let poll = felica_frame(&[0x00, 0xFF, 0xFF, 0x00, 0x03]);
        let resp = felica_frame(&[
            0x01, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0xAA, 0xBB, 0xCC, 0xDD, 0xEE,
            0xFF, 0x00, 0x11,
        ]);
        let mut sig = testgen::Signal::new();
        sig.carrier_ms(1.0);
        sig.nfcf_frame(&poll);
        sig.carrier_us(300.0);
        sig.nfcf_frame(&resp);
        sig.carrier_ms(1.0);
        let frames = decode_all(&sig.finish());
        assert_eq!(frames.len(), 2, "{frames:?}");
        assert_eq!(frames[0].frame_type(), FrameType::NfcPollFrame);
        assert_eq!(frames[1].frame_type(), FrameType::NfcListenFrame);
        assert_eq!(frames[1].payload(), &resp[..]);
        assert!(frames[1].time_start() > frames[0].time_end());
    }

    #[test]
    fn crc_error_flagged() {
        let mut frame = felica_frame(&[0x00, 0xFF, 0xFF, 0x00, 0x03]);
        frame[2] ^= 0x40;
        let mut sig = testgen::Signal::new();
        sig.carrier_ms(1.0);
        sig.nfcf_frame(&frame);
        sig.carrier_ms(1.0);
        let frames = decode_all(&sig.finish());
        assert_eq!(frames.len(), 1);
        assert!(frames[0].has_flags(FrameFlags::CRC_ERROR));
        assert_eq!(frames[0].payload(), &frame[..]);
    }
}

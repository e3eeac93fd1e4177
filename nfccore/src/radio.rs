//! Radio-side decoder: carrier tracking and the NFC-A/B/F/V detect cascade.

use log::debug;

use crate::buffer::SampleBuffer;
use crate::debug::{SignalDebug, DEBUG_CHANNELS};
use crate::frame::{FrameBuilder, FrameFlags, FramePhase, FrameTech, FrameType, RawFrame};
use crate::nfc::NFC_FC;
use crate::status::DecoderStatus;

pub mod nfca;
pub mod nfcb;
pub mod nfcf;
pub mod nfcv;

use nfca::NfcA;
use nfcb::NfcB;
use nfcf::NfcF;
use nfcv::NfcV;

/// A contiguous run of modulation above a depth threshold.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Pulse {
    pub start: u64,
    pub end: u64,
    pub peak: f32,
}

impl Pulse {
    pub fn width(&self) -> u64 {
        self.end - self.start
    }

    pub fn center(&self) -> f64 {
        (self.start + self.end) as f64 / 2.0
    }
}

/// Streams modulation-depth samples into discrete pulse events, with a
/// half-threshold hysteresis on the trailing edge.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct PulseTracker {
    active: bool,
    start: u64,
    peak: f32,
}

impl PulseTracker {
    pub fn update(&mut self, clock: u64, depth: f32, threshold: f32) -> Option<Pulse> {
        if !self.active {
            if depth >= threshold {
                self.active = true;
                self.start = clock;
                self.peak = depth;
            }
            None
        } else if depth >= threshold * 0.5 {
            self.peak = self.peak.max(depth);
            None
        } else {
            self.active = false;
            Some(Pulse {
                start: self.start,
                end: clock,
                peak: self.peak,
            })
        }
    }

    pub fn reset(&mut self) {
        self.active = false;
    }

    pub fn active(&self) -> bool {
        self.active
    }
}

/// Mean rectified filtered signal over a window, as a fraction of the
/// envelope. Measures subcarrier activity.
pub(crate) fn window_energy(status: &DecoderStatus, from: u64, len: usize) -> f32 {
    let mut sum = 0.0f32;
    for k in 0..len {
        sum += status.sample_at(from + k as u64).filtered.abs();
    }
    sum / (len as f32 * status.signal_envelope.max(f32::EPSILON))
}

/// Mean modulation depth over a window.
pub(crate) fn window_modulation(status: &DecoderStatus, from: u64, len: usize) -> f32 {
    let mut sum = 0.0f32;
    for k in 0..len {
        sum += status.sample_at(from + k as u64).modulation;
    }
    sum / len as f32
}

/// Normalized correlation of the envelope-removed signal against itself at
/// `lag` samples, over a window. Positive for an in-phase subcarrier,
/// negative across a BPSK phase reversal.
pub(crate) fn window_phase_correlation(
    status: &DecoderStatus,
    from: u64,
    len: usize,
    lag: u64,
) -> f32 {
    let env = status.signal_envelope;
    let mut dot = 0.0f32;
    let mut norm = 0.0f32;
    for k in 0..len {
        let clock = from + k as u64;
        let a = status.sample_at(clock).value - env;
        let b = status.sample_at(clock - lag).value - env;
        dot += a * b;
        norm += a * a;
    }
    if norm > f32::EPSILON {
        dot / norm
    } else {
        0.0
    }
}

/// Pack bits (0/1 per element), least significant bit first.
pub(crate) fn bits_to_byte_lsb(bits: &[u8]) -> u8 {
    let mut byte = 0u8;
    for (i, bit) in bits.iter().enumerate().take(8) {
        byte |= (bit & 1) << i;
    }
    byte
}

/// Pack bits (0/1 per element), most significant bit first.
pub(crate) fn bits_to_byte_msb(bits: &[u8]) -> u8 {
    let mut byte = 0u8;
    for (i, bit) in bits.iter().enumerate().take(8) {
        byte |= (bit & 1) << (7 - i);
    }
    byte
}

/// Convert a duration in carrier cycles (1/fc) to samples.
pub(crate) fn fc_to_samples(fc_units: u32, sample_rate: u32) -> u64 {
    (fc_units as f64 * sample_rate as f64 / NFC_FC).round() as u64
}

/// Emits carrier-on / carrier-off frames from the rolling signal average.
#[derive(Debug, Default)]
struct CarrierTracker {
    on: bool,
    below_since: Option<u64>,
}

impl CarrierTracker {
    fn update(&mut self, status: &DecoderStatus, frames: &mut Vec<RawFrame>) {
        let clock = status.signal_clock;
        let average = status.signal_average;
        let threshold = status.power_level_threshold;
        // confirmation window before declaring the carrier gone
        let confirm = (status.params.sample_rate as f64 * 1e-3) as u64;

        if !self.on {
            if average > threshold {
                self.on = true;
                self.below_since = None;
                frames.push(carrier_frame(status, FrameType::NfcCarrierOn, clock));
                debug!("carrier on at sample {clock}");
            }
        } else if average < threshold {
            match self.below_since {
                None => self.below_since = Some(clock),
                Some(since) if clock - since > confirm => {
                    self.on = false;
                    self.below_since = None;
                    frames.push(carrier_frame(status, FrameType::NfcCarrierOff, since));
                    debug!("carrier off at sample {since}");
                }
                _ => {}
            }
        } else {
            self.below_since = None;
        }
    }

    fn reset(&mut self) {
        self.on = false;
        self.below_since = None;
    }
}

fn carrier_frame(status: &DecoderStatus, frame_type: FrameType, clock: u64) -> RawFrame {
    let mut builder = FrameBuilder::new(FrameTech::NfcNone, frame_type);
    builder.set_phase(FramePhase::Carrier);
    builder.set_sample_rate(status.params.sample_rate);
    builder.set_date_time(status.stream_time + status.time_at(clock));
    let time = status.time_at(clock);
    builder.finalize(time, time, clock, clock)
}

/// Full radio-side decoder over a raw I/Q sample stream.
///
/// All enabled technology detectors peek at the shared [`DecoderStatus`]
/// while no bitrate is locked; once one of them locks, it owns the sample
/// stream until the frame exchange ends or the carrier drops.
pub struct NfcDecoder {
    status: DecoderStatus,
    sample_rate: u32,
    debug_enabled: bool,
    enable_nfca: bool,
    enable_nfcb: bool,
    enable_nfcf: bool,
    enable_nfcv: bool,
    nfca: NfcA,
    nfcb: NfcB,
    nfcf: NfcF,
    nfcv: NfcV,
    carrier: CarrierTracker,
}

impl Default for NfcDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl NfcDecoder {
    pub fn new() -> Self {
        Self {
            status: DecoderStatus::new(0),
            sample_rate: 0,
            debug_enabled: false,
            enable_nfca: true,
            enable_nfcb: true,
            enable_nfcf: true,
            enable_nfcv: true,
            nfca: NfcA::new(),
            nfcb: NfcB::new(),
            nfcf: NfcF::new(),
            nfcv: NfcV::new(),
            carrier: CarrierTracker::default(),
        }
    }

    pub fn set_enable_nfca(&mut self, enabled: bool) {
        self.enable_nfca = enabled;
    }

    pub fn set_enable_nfcb(&mut self, enabled: bool) {
        self.enable_nfcb = enabled;
    }

    pub fn set_enable_nfcf(&mut self, enabled: bool) {
        self.enable_nfcf = enabled;
    }

    pub fn set_enable_nfcv(&mut self, enabled: bool) {
        self.enable_nfcv = enabled;
    }

    pub fn is_nfca_enabled(&self) -> bool {
        self.enable_nfca
    }

    pub fn is_nfcb_enabled(&self) -> bool {
        self.enable_nfcb
    }

    pub fn is_nfcf_enabled(&self) -> bool {
        self.enable_nfcf
    }

    pub fn is_nfcv_enabled(&self) -> bool {
        self.enable_nfcv
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn set_sample_rate(&mut self, sample_rate: u32) {
        self.sample_rate = sample_rate;
    }

    pub fn set_stream_time(&mut self, seconds: f64) {
        self.status.stream_time = seconds;
    }

    pub fn set_power_level_threshold(&mut self, value: f32) {
        self.status.power_level_threshold = value;
    }

    pub fn power_level_threshold(&self) -> f32 {
        self.status.power_level_threshold
    }

    pub fn set_enable_debug(&mut self, enabled: bool) {
        self.debug_enabled = enabled;
    }

    /// Drain recorded debug channel values, if debug is enabled.
    pub fn take_debug(&mut self) -> Option<Vec<f32>> {
        self.status.debug.as_mut().map(|d| d.take())
    }

    pub fn set_modulation_threshold_nfca(&mut self, min: f32, max: f32) {
        self.nfca.set_modulation_threshold(min, max);
    }

    pub fn set_modulation_threshold_nfcb(&mut self, min: f32, max: f32) {
        self.nfcb.set_modulation_threshold(min, max);
    }

    pub fn set_modulation_threshold_nfcf(&mut self, min: f32, max: f32) {
        self.nfcf.set_modulation_threshold(min, max);
    }

    pub fn set_modulation_threshold_nfcv(&mut self, min: f32, max: f32) {
        self.nfcv.set_modulation_threshold(min, max);
    }

    pub fn set_correlation_threshold_nfca(&mut self, value: f32) {
        self.nfca.set_correlation_threshold(value);
    }

    pub fn set_correlation_threshold_nfcb(&mut self, value: f32) {
        self.nfcb.set_correlation_threshold(value);
    }

    pub fn set_correlation_threshold_nfcf(&mut self, value: f32) {
        self.nfcf.set_correlation_threshold(value);
    }

    pub fn set_correlation_threshold_nfcv(&mut self, value: f32) {
        self.nfcv.set_correlation_threshold(value);
    }

    /// Reset all signal and session state and apply the configured sample
    /// rate. Must be called before the first buffer and after rate changes.
    pub fn initialize(&mut self) {
        debug!("initializing NFC decoder, sample rate {}", self.sample_rate);
        let stream_time = self.status.stream_time;
        let power = self.status.power_level_threshold;
        self.status = DecoderStatus::new(self.sample_rate.max(1));
        self.status.stream_time = stream_time;
        self.status.power_level_threshold = power;
        if self.debug_enabled {
            self.status.debug = Some(SignalDebug::new(DEBUG_CHANNELS));
        }
        if self.sample_rate > 0 {
            self.nfca.initialize(self.sample_rate);
            self.nfcb.initialize(self.sample_rate);
            self.nfcf.initialize(self.sample_rate);
            self.nfcv.initialize(self.sample_rate);
        }
        self.carrier.reset();
    }

    /// Decode all frames contained in the buffer.
    ///
    /// Demodulator state persists across calls, so a frame split over two
    /// buffers is completed when the continuation arrives.
    pub fn next_frames(&mut self, samples: &mut SampleBuffer) -> Vec<RawFrame> {
        let mut frames = Vec::new();

        if samples.sample_rate() > 0 && samples.sample_rate() != self.sample_rate {
            self.sample_rate = samples.sample_rate();
            self.initialize();
        }

        loop {
            if self.status.bitrate.is_none() {
                // unlocked: run the detect cascade sample by sample
                let mut locked = false;
                while self.status.next_sample(samples) {
                    self.carrier.update(&self.status, &mut frames);

                    let mut candidate: Option<(u64, u8, FrameTech)> = None;
                    if self.enable_nfca {
                        if let Some(start) = self.nfca.detect(&self.status) {
                            candidate = pick(candidate, (start, 0, FrameTech::NfcA));
                        }
                    }
                    if self.enable_nfcb {
                        if let Some(start) = self.nfcb.detect(&self.status) {
                            candidate = pick(candidate, (start, 1, FrameTech::NfcB));
                        }
                    }
                    if self.enable_nfcf {
                        if let Some(start) = self.nfcf.detect(&self.status) {
                            candidate = pick(candidate, (start, 2, FrameTech::NfcF));
                        }
                    }
                    if self.enable_nfcv {
                        if let Some(start) = self.nfcv.detect(&self.status) {
                            candidate = pick(candidate, (start, 3, FrameTech::NfcV));
                        }
                    }

                    if let Some((start, _, tech)) = candidate {
                        debug!("{tech:?} locked at sample {start}");
                        match tech {
                            FrameTech::NfcA => self.nfca.lock(&mut self.status, start),
                            FrameTech::NfcB => self.nfcb.lock(&mut self.status, start),
                            FrameTech::NfcF => self.nfcf.lock(&mut self.status, start),
                            FrameTech::NfcV => self.nfcv.lock(&mut self.status, start),
                            _ => unreachable!(),
                        }
                        self.nfca.clear_detect();
                        self.nfcb.clear_detect();
                        self.nfcf.clear_detect();
                        self.nfcv.clear_detect();
                        locked = true;
                        break;
                    }
                }
                if !locked {
                    break;
                }
            }

            if let Some(bitrate) = self.status.bitrate {
                match bitrate.tech {
                    FrameTech::NfcA => self.nfca.decode(samples, &mut self.status, &mut frames),
                    FrameTech::NfcB => self.nfcb.decode(samples, &mut self.status, &mut frames),
                    FrameTech::NfcF => self.nfcf.decode(samples, &mut self.status, &mut frames),
                    FrameTech::NfcV => self.nfcv.decode(samples, &mut self.status, &mut frames),
                    tech => {
                        debug!("unsupported radio tech {tech:?}");
                        self.status.bitrate = None;
                    }
                }
            }

            if samples.remaining() < samples.stride() {
                break;
            }
        }

        frames
    }

    /// Flush any frame under construction as truncated. Used on terminate.
    pub fn flush(&mut self) -> Vec<RawFrame> {
        let mut frames = Vec::new();
        self.nfca.flush(&mut self.status, &mut frames);
        self.nfcb.flush(&mut self.status, &mut frames);
        self.nfcf.flush(&mut self.status, &mut frames);
        self.nfcv.flush(&mut self.status, &mut frames);
        self.status.bitrate = None;
        frames
    }
}

fn pick(
    current: Option<(u64, u8, FrameTech)>,
    next: (u64, u8, FrameTech),
) -> Option<(u64, u8, FrameTech)> {
    match current {
        None => Some(next),
        Some(cur) if (next.0, next.1) < (cur.0, cur.1) => Some(next),
        Some(cur) => Some(cur),
    }
}

/// Assemble an NFC-A style bit stream (8 data bits + odd parity per byte,
/// LSB first) into payload bytes and flags.
pub(crate) fn assemble_parity_bits(bits: &[u8]) -> (Vec<u8>, FrameFlags) {
    let mut flags = FrameFlags::NONE;
    let mut bytes = Vec::new();

    if bits.len() <= 7 {
        flags |= FrameFlags::SHORT_FRAME;
        if !bits.is_empty() {
            bytes.push(bits_to_byte_lsb(bits));
        }
        return (bytes, flags);
    }

    let mut chunks = bits.chunks_exact(9);
    for chunk in &mut chunks {
        let byte = bits_to_byte_lsb(&chunk[..8]);
        let ones = byte.count_ones() + chunk[8] as u32;
        if ones % 2 != 1 {
            flags |= FrameFlags::PARITY_ERROR;
        }
        bytes.push(byte);
    }
    let rest = chunks.remainder();
    if !rest.is_empty() {
        flags |= FrameFlags::TRUNCATED;
        bytes.push(bits_to_byte_lsb(rest));
    }
    (bytes, flags)
}

/// Assemble a plain bit stream (8 bits per byte, LSB first, no parity)
/// into payload bytes and flags.
pub(crate) fn assemble_plain_bits(bits: &[u8]) -> (Vec<u8>, FrameFlags) {
    let mut flags = FrameFlags::NONE;
    let mut bytes = Vec::new();
    if bits.len() < 8 {
        flags |= FrameFlags::SHORT_FRAME;
        if !bits.is_empty() {
            bytes.push(bits_to_byte_lsb(bits));
        }
        return (bytes, flags);
    }
    let mut chunks = bits.chunks_exact(8);
    for chunk in &mut chunks {
        bytes.push(bits_to_byte_lsb(chunk));
    }
    let rest = chunks.remainder();
    if !rest.is_empty() {
        flags |= FrameFlags::TRUNCATED;
        bytes.push(bits_to_byte_lsb(rest));
    }
    (bytes, flags)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pulse_tracker_events() {
        let mut tracker = PulseTracker::default();
        assert!(tracker.update(1, 0.0, 0.5).is_none());
        assert!(tracker.update(2, 0.9, 0.5).is_none());
        assert!(tracker.update(3, 0.4, 0.5).is_none()); // above half threshold
        let pulse = tracker.update(4, 0.1, 0.5).expect("pulse end");
        assert_eq!(pulse.start, 2);
        assert_eq!(pulse.end, 4);
        assert!((pulse.peak - 0.9).abs() < 1e-6);
        assert!(!tracker.active());
    }

    #[test]
    fn byte_packing() {
        assert_eq!(bits_to_byte_lsb(&[0, 1, 1, 0, 0, 1, 0, 0]), 0x26);
        assert_eq!(bits_to_byte_msb(&[1, 0, 1, 1, 0, 0, 1, 0]), 0xB2);
    }

    #[test]
    fn parity_assembly_good() {
        // 0x26 has three set bits, odd parity bit must be 0
        let bits = [0, 1, 1, 0, 0, 1, 0, 0, 0];
        let (bytes, flags) = assemble_parity_bits(&bits);
        assert_eq!(bytes, vec![0x26]);
        assert!(flags.is_empty());
    }

    #[test]
    fn parity_assembly_error() {
        let bits = [0, 1, 1, 0, 0, 1, 0, 0, 1];
        let (bytes, flags) = assemble_parity_bits(&bits);
        assert_eq!(bytes, vec![0x26]);
        assert!(flags.contains(FrameFlags::PARITY_ERROR));
    }

    #[test]
    fn short_frame_assembly() {
        let bits = [0, 1, 1, 0, 0, 1, 0];
        let (bytes, flags) = assemble_parity_bits(&bits);
        assert_eq!(bytes, vec![0x26]);
        assert!(flags.contains(FrameFlags::SHORT_FRAME));
    }

    #[test]
    fn truncated_assembly() {
        let mut bits = vec![0, 0, 1, 0, 0, 0, 0, 0, 0]; // 0x04, parity 0
        bits.extend_from_slice(&[1, 1, 1]); // partial final byte
        let (bytes, flags) = assemble_parity_bits(&bits);
        assert_eq!(bytes, vec![0x04, 0x07]);
        assert!(flags.contains(FrameFlags::TRUNCATED));
    }

    mod scenarios {
        use super::*;
        use crate::buffer::{SampleBuffer, SampleType};
        use crate::testgen::{self, short_frame_bits, SIG_RATE};

        fn fresh_decoder() -> NfcDecoder {
            let mut decoder = NfcDecoder::new();
            decoder.set_sample_rate(SIG_RATE);
            decoder.initialize();
            decoder
        }

        fn reqa_atqa_signal() -> Vec<f32> {
            let mut sig = testgen::Signal::new();
            sig.carrier_ms(1.0);
            sig.miller_poll_bits(&short_frame_bits(0x26));
            sig.carrier_us(100.0);
            sig.manchester_listen_bytes(&[0x04, 0x00]);
            sig.carrier_ms(0.5);
            sig.finish()
        }

        fn data_frames(frames: &[RawFrame]) -> Vec<&RawFrame> {
            frames
                .iter()
                .filter(|f| {
                    !matches!(
                        f.frame_type(),
                        FrameType::NfcCarrierOn | FrameType::NfcCarrierOff
                    )
                })
                .collect()
        }

        #[test]
        fn reqa_atqa_end_to_end() {
            let mut decoder = fresh_decoder();
            let mut buf =
                SampleBuffer::from_samples(&reqa_atqa_signal(), SampleType::RawIq, SIG_RATE, 0);
            let frames = decoder.next_frames(&mut buf);
            let data = data_frames(&frames);
            assert_eq!(data.len(), 2, "{frames:?}");

            let reqa = data[0];
            assert_eq!(reqa.tech(), FrameTech::NfcA);
            assert_eq!(reqa.frame_type(), FrameType::NfcPollFrame);
            assert_eq!(reqa.payload(), &[0x26]);
            assert!(reqa.has_flags(FrameFlags::SHORT_FRAME));
            assert_eq!(reqa.rate(), 105_937);
            assert!((reqa.time_start() - 0.001).abs() < 1e-4);

            let atqa = data[1];
            assert_eq!(atqa.frame_type(), FrameType::NfcListenFrame);
            assert_eq!(atqa.payload(), &[0x04, 0x00]);
            assert!(atqa.flags().is_empty());

            // frames are strictly ordered by start time
            for pair in frames.windows(2) {
                assert!(pair[1].time_start() >= pair[0].time_start());
            }
        }

        #[test]
        fn corrupted_crc_frame_is_emitted_with_flag() {
            let mut bytes = vec![0x0A, 0x04, 0x00];
            let crc = crate::crc::crc_a(&bytes);
            bytes.extend_from_slice(&crc.to_le_bytes());
            bytes[1] ^= 0x01;

            let mut sig = testgen::Signal::new();
            sig.carrier_ms(1.0);
            sig.miller_poll_bits(&short_frame_bits(0x26));
            sig.carrier_us(100.0);
            sig.manchester_listen_bytes(&bytes);
            sig.carrier_ms(0.5);

            let mut decoder = fresh_decoder();
            let mut buf =
                SampleBuffer::from_samples(&sig.finish(), SampleType::RawIq, SIG_RATE, 0);
            let frames = decoder.next_frames(&mut buf);
            let data = data_frames(&frames);
            assert_eq!(data.len(), 2, "{frames:?}");
            assert!(data[1].has_flags(FrameFlags::CRC_ERROR));
            assert_eq!(data[1].payload(), &bytes[..]);
        }

        #[test]
        fn carrier_on_off_events() {
            let mut decoder = fresh_decoder();
            let mut frames = Vec::new();

            let mut first = testgen::Signal::new();
            first.silence_ms(5.0);
            let mut second = testgen::Signal::new();
            second.carrier_ms(5.0);
            let mut third = testgen::Signal::new();
            third.silence_ms(5.0);

            for (chunk, offset) in [
                (first.finish(), 0u64),
                (second.finish(), 50_000),
                (third.finish(), 100_000),
            ] {
                let mut buf = SampleBuffer::from_samples(&chunk, SampleType::RawIq, SIG_RATE, offset);
                frames.extend(decoder.next_frames(&mut buf));
            }

            assert_eq!(frames.len(), 2, "{frames:?}");
            assert_eq!(frames[0].frame_type(), FrameType::NfcCarrierOn);
            assert!((frames[0].time_start() - 0.005).abs() < 5e-4);
            assert_eq!(frames[1].frame_type(), FrameType::NfcCarrierOff);
            assert!((frames[1].time_start() - 0.010).abs() < 2.5e-3);
        }

        #[test]
        fn split_buffers_decode_identically() {
            let signal = reqa_atqa_signal();
            let mut decoder = fresh_decoder();
            let mut buf = SampleBuffer::from_samples(&signal, SampleType::RawIq, SIG_RATE, 0);
            let whole = decoder.next_frames(&mut buf);

            // split mid-frame at 1.05 ms
            let cut = 2 * 10_500;
            let mut decoder = fresh_decoder();
            let mut first =
                SampleBuffer::from_samples(&signal[..cut], SampleType::RawIq, SIG_RATE, 0);
            let mut second = SampleBuffer::from_samples(
                &signal[cut..],
                SampleType::RawIq,
                SIG_RATE,
                10_500,
            );
            let mut split = decoder.next_frames(&mut first);
            split.extend(decoder.next_frames(&mut second));

            assert_eq!(whole, split);
        }

        #[test]
        fn reset_and_decode_is_idempotent() {
            let signal = reqa_atqa_signal();
            let mut decoder = fresh_decoder();
            let mut buf = SampleBuffer::from_samples(&signal, SampleType::RawIq, SIG_RATE, 0);
            let first = decoder.next_frames(&mut buf);

            decoder.initialize();
            let mut buf = SampleBuffer::from_samples(&signal, SampleType::RawIq, SIG_RATE, 0);
            let second = decoder.next_frames(&mut buf);
            assert_eq!(first, second);
        }

        #[test]
        fn complete_frame_leaves_no_state_behind() {
            let mut sig = testgen::Signal::new();
            sig.carrier_ms(1.0);
            sig.miller_poll_bits(&short_frame_bits(0x26));
            sig.carrier_us(50.0);
            let mut decoder = fresh_decoder();
            let mut buf =
                SampleBuffer::from_samples(&sig.finish(), SampleType::RawIq, SIG_RATE, 0);
            let frames = decoder.next_frames(&mut buf);
            let data = data_frames(&frames);
            assert_eq!(data.len(), 1);
            assert_eq!(data[0].payload(), &[0x26]);
            // nothing left to flush
            assert!(decoder.flush().is_empty());
        }

        #[test]
        fn detect_cascade_picks_the_matching_technology() {
            // an NFC-B exchange must not be claimed by the other detectors
            let mut frame_bytes = vec![0x05, 0x00, 0x00];
            let crc = crate::crc::crc_b(&frame_bytes);
            frame_bytes.extend_from_slice(&crc.to_le_bytes());
            let mut sig = testgen::Signal::new();
            sig.carrier_ms(1.0);
            sig.nfcb_poll_bytes(&frame_bytes);
            sig.carrier_ms(1.0);
            let mut decoder = fresh_decoder();
            let mut buf =
                SampleBuffer::from_samples(&sig.finish(), SampleType::RawIq, SIG_RATE, 0);
            let frames = decoder.next_frames(&mut buf);
            let data = data_frames(&frames);
            assert_eq!(data.len(), 1, "{frames:?}");
            assert_eq!(data[0].tech(), FrameTech::NfcB);
            assert_eq!(data[0].payload(), &frame_bytes[..]);
        }
    }
}

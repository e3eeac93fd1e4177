use crate::buffer::{SampleBuffer, SampleType};
use crate::debug::{
    SignalDebug, DEBUG_SIGNAL_AVERAGE_CHANNEL, DEBUG_SIGNAL_FILTERED_CHANNEL,
    DEBUG_SIGNAL_VALUE_CHANNEL, DEBUG_SIGNAL_VARIANCE_CHANNEL,
};
use crate::frame::FrameTech;
use crate::nfc::{NfcRate, NFC_FC};

/// Signal components stored for each processed sample.
#[derive(Debug, Clone, Copy, Default)]
pub struct SignalSample {
    pub value: f32,
    pub filtered: f32,
    pub deviation: f32,
    pub modulation: f32,
}

/// Per-sample-rate processing parameters shared by all detectors.
#[derive(Debug, Clone, Copy)]
pub struct SignalParams {
    pub sample_rate: u32,
    pub sample_time: f64,
    /// Samples per elementary time unit at 106 kbps; the reference for the
    /// silence gate and the ring buffer size.
    pub elementary_time_unit: f64,
    pub signal_enve_w0: f32,
    pub signal_enve_w1: f32,
    pub signal_mean_w0: f32,
    pub signal_mean_w1: f32,
    pub signal_mdev_w0: f32,
    pub signal_mdev_w1: f32,
    /// Feedback coefficient of the DC-removal IIR filter.
    pub signal_iir_dc_a: f32,
}

impl SignalParams {
    pub fn new(sample_rate: u32) -> Self {
        let etu = sample_rate as f64 * 128.0 / NFC_FC;
        // envelope follows changes down to a few hundred microseconds and
        // averages out symbol-scale modulation
        let enve_w1 = (1.0 / (sample_rate as f64 * 300e-6)).min(0.5) as f32;
        let mean_w1 = (1.0 / (sample_rate as f64 * 200e-6)).min(0.5) as f32;
        let mdev_w1 = (1.0 / etu).min(0.5) as f32;
        Self {
            sample_rate,
            sample_time: 1.0 / sample_rate as f64,
            elementary_time_unit: etu,
            signal_enve_w0: 1.0 - enve_w1,
            signal_enve_w1: enve_w1,
            signal_mean_w0: 1.0 - mean_w1,
            signal_mean_w1: mean_w1,
            signal_mdev_w0: 1.0 - mdev_w1,
            signal_mdev_w1: mdev_w1,
            signal_iir_dc_a: (1.0 - 8.0 / etu).clamp(0.0, 0.9999) as f32,
        }
    }
}

/// Active symbol timing once a technology has locked.
#[derive(Debug, Clone, Copy)]
pub struct BitrateParams {
    pub tech: FrameTech,
    pub rate: NfcRate,
    pub samples_per_etu: f64,
    /// etu / 8
    pub period0: usize,
    /// one etu
    pub period1: usize,
    /// etu / 2
    pub period2: usize,
    /// etu / 4
    pub period4: usize,
}

impl BitrateParams {
    pub fn new(tech: FrameTech, rate: NfcRate, sample_rate: u32) -> Self {
        let etu = rate.etu_samples(sample_rate);
        Self {
            tech,
            rate,
            samples_per_etu: etu,
            period0: (etu / 8.0).round().max(1.0) as usize,
            period1: etu.round().max(1.0) as usize,
            period2: (etu / 2.0).round().max(1.0) as usize,
            period4: (etu / 4.0).round().max(1.0) as usize,
        }
    }
}

/// Shared per-sample state used by all radio demodulators.
///
/// All active technology detectors peek at the same processed stream; the
/// decoder owns this struct and lends it to each detector per call.
pub struct DecoderStatus {
    pub params: SignalParams,
    /// Envelope level below which the carrier is considered absent.
    pub power_level_threshold: f32,
    /// Absolute reference time for sample-to-wallclock mapping, seconds.
    pub stream_time: f64,
    /// Monotonic sample counter; increases by 1 per processed sample.
    pub signal_clock: u64,
    pulse_filter: u64,
    pub signal_value: f32,
    pub signal_envelope: f32,
    pub signal_filtered: f32,
    filter_n0: f32,
    filter_n1: f32,
    pub signal_deviation: f32,
    pub signal_average: f32,
    pub carrier_edge_peak: f32,
    pub carrier_edge_time: u64,
    ring: Vec<SignalSample>,
    ring_mask: usize,
    pub debug: Option<SignalDebug>,
    /// Technology and rate currently locked, if any.
    pub bitrate: Option<BitrateParams>,
}

impl DecoderStatus {
    pub fn new(sample_rate: u32) -> Self {
        let params = SignalParams::new(sample_rate);
        // power of two, at least 8x the reference symbol so detectors can
        // look back across a whole symbol at any supported rate
        let ring_len = ((params.elementary_time_unit * 8.0) as usize)
            .next_power_of_two()
            .max(256);
        Self {
            params,
            power_level_threshold: 0.01,
            stream_time: 0.0,
            signal_clock: 0,
            pulse_filter: 0,
            signal_value: 0.0,
            signal_envelope: 0.0,
            signal_filtered: 0.0,
            filter_n0: 0.0,
            filter_n1: 0.0,
            signal_deviation: 0.0,
            signal_average: 0.0,
            carrier_edge_peak: 0.0,
            carrier_edge_time: 0,
            ring: vec![SignalSample::default(); ring_len],
            ring_mask: ring_len - 1,
            debug: None,
            bitrate: None,
        }
    }

    /// Drop all signal state, keeping the configured thresholds.
    pub fn reset(&mut self) {
        self.signal_clock = 0;
        self.pulse_filter = 0;
        self.signal_value = 0.0;
        self.signal_envelope = 0.0;
        self.signal_filtered = 0.0;
        self.filter_n0 = 0.0;
        self.filter_n1 = 0.0;
        self.signal_deviation = 0.0;
        self.signal_average = 0.0;
        self.carrier_edge_peak = 0.0;
        self.carrier_edge_time = 0;
        self.ring.fill(SignalSample::default());
        self.bitrate = None;
    }

    /// Samples the ring buffer can look back over.
    pub fn ring_len(&self) -> usize {
        self.ring.len()
    }

    /// Signal components recorded at `clock`. Only valid within the last
    /// `ring_len()` samples.
    pub fn sample_at(&self, clock: u64) -> SignalSample {
        self.ring[(clock as usize) & self.ring_mask]
    }

    /// Relative stream time of a sample clock, in seconds.
    pub fn time_at(&self, clock: u64) -> f64 {
        clock as f64 * self.params.sample_time
    }

    /// Consume one radio sample from the buffer and update the shared state.
    ///
    /// Returns false without consuming anything when the buffer is not a
    /// radio sample stream or is exhausted. One sample is the magnitude of
    /// one I/Q pair.
    pub fn next_sample(&mut self, buf: &mut SampleBuffer) -> bool {
        if buf.sample_type() != SampleType::RawIq {
            return false;
        }
        if buf.remaining() < buf.stride() {
            return false;
        }

        // update signal clock and pulse filter
        self.signal_clock += 1;
        self.pulse_filter += 1;

        let i = buf.get().unwrap_or(0.0);
        let q = buf.get().unwrap_or(0.0);
        let value = (i * i + q * q).sqrt();
        self.signal_value = value;

        let etu = self.params.elementary_time_unit;
        let silence_gate = (etu * 10.0) as u64;

        let diff = if self.signal_envelope > f32::EPSILON {
            (value - self.signal_envelope).abs() / self.signal_envelope
        } else {
            1.0
        };

        // average envelope detector, gated while the signal deviates from it
        if diff < 0.05 || self.pulse_filter > silence_gate {
            self.pulse_filter = 0;
            self.signal_envelope = self.signal_envelope * self.params.signal_enve_w0
                + value * self.params.signal_enve_w1;
        } else if self.signal_clock < etu as u64 {
            // cold start, seed the envelope directly
            self.signal_envelope = value;
        }

        // DC-removal IIR filter
        self.filter_n0 = value + self.filter_n1 * self.params.signal_iir_dc_a;
        self.signal_filtered = self.filter_n0 - self.filter_n1;
        self.filter_n1 = self.filter_n0;

        // rolling variance of the filtered signal
        self.signal_deviation = self.signal_deviation * self.params.signal_mdev_w0
            + self.signal_filtered.abs() * self.params.signal_mdev_w1;

        // rolling average of the raw signal
        self.signal_average =
            self.signal_average * self.params.signal_mean_w0 + value * self.params.signal_mean_w1;

        let modulation = if self.signal_envelope > f32::EPSILON {
            (self.signal_envelope - value.clamp(0.0, self.signal_envelope)) / self.signal_envelope
        } else {
            0.0
        };

        self.ring[(self.signal_clock as usize) & self.ring_mask] = SignalSample {
            value,
            filtered: self.signal_filtered,
            deviation: self.signal_deviation,
            modulation,
        };

        // carrier edge tracker
        let rectified = self.signal_filtered.abs();
        let high_threshold = self.signal_envelope * 0.5;
        let low_threshold = self.signal_envelope * 0.25;
        if rectified > high_threshold {
            if rectified > self.carrier_edge_peak {
                self.carrier_edge_peak = rectified;
                self.carrier_edge_time = self.signal_clock;
            }
        } else if rectified < low_threshold {
            self.carrier_edge_peak = 0.0;
        }

        if let Some(debug) = &mut self.debug {
            debug.block();
            debug.set(DEBUG_SIGNAL_VALUE_CHANNEL, value);
            debug.set(DEBUG_SIGNAL_FILTERED_CHANNEL, self.signal_filtered);
            debug.set(DEBUG_SIGNAL_VARIANCE_CHANNEL, self.signal_deviation);
            debug.set(DEBUG_SIGNAL_AVERAGE_CHANNEL, self.signal_average);
        }

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::SampleBuffer;

    fn iq_buffer(values: &[f32], sample_rate: u32) -> SampleBuffer {
        let mut data = Vec::with_capacity(values.len() * 2);
        for v in values {
            data.push(*v);
            data.push(0.0);
        }
        SampleBuffer::from_samples(&data, SampleType::RawIq, sample_rate, 0)
    }

    #[test]
    fn clock_advances_per_sample() {
        let mut status = DecoderStatus::new(10_000_000);
        let mut buf = iq_buffer(&[1.0; 100], 10_000_000);
        let mut count = 0;
        while status.next_sample(&mut buf) {
            count += 1;
        }
        assert_eq!(count, 100);
        assert_eq!(status.signal_clock, 100);
        assert_eq!(buf.remaining(), 0);
    }

    #[test]
    fn rejects_non_radio_buffers() {
        let mut status = DecoderStatus::new(10_000_000);
        let mut buf =
            SampleBuffer::from_samples(&[1.0, 1.0], SampleType::RawLogic, 10_000_000, 0);
        assert!(!status.next_sample(&mut buf));
        assert_eq!(buf.remaining(), 2);
        assert_eq!(status.signal_clock, 0);
    }

    #[test]
    fn envelope_seeds_during_cold_start() {
        let mut status = DecoderStatus::new(10_000_000);
        let mut buf = iq_buffer(&[0.8; 50], 10_000_000);
        while status.next_sample(&mut buf) {}
        assert!((status.signal_envelope - 0.8).abs() < 0.01);
    }

    #[test]
    fn envelope_holds_through_short_pause() {
        let mut status = DecoderStatus::new(10_000_000);
        let mut samples = vec![1.0f32; 400];
        samples.extend_from_slice(&[0.0; 24]);
        samples.extend_from_slice(&[1.0; 100]);
        let mut buf = iq_buffer(&samples, 10_000_000);
        let mut min_env_in_pause = f32::MAX;
        while status.next_sample(&mut buf) {
            if (400..424).contains(&(status.signal_clock - 1)) {
                min_env_in_pause = min_env_in_pause.min(status.signal_envelope);
            }
        }
        assert!(min_env_in_pause > 0.9, "envelope dipped to {min_env_in_pause}");
    }

    #[test]
    fn modulation_depth_tracks_pause() {
        let mut status = DecoderStatus::new(10_000_000);
        let mut samples = vec![1.0f32; 400];
        samples.extend_from_slice(&[0.0; 24]);
        samples.extend_from_slice(&[1.0; 100]);
        let mut buf = iq_buffer(&samples, 10_000_000);
        while status.next_sample(&mut buf) {}
        let in_pause = status.sample_at(412);
        let in_carrier = status.sample_at(300);
        assert!(in_pause.modulation > 0.9);
        assert!(in_carrier.modulation < 0.1);
    }

    #[test]
    fn average_follows_carrier_loss() {
        let mut status = DecoderStatus::new(10_000_000);
        let mut samples = vec![1.0f32; 5_000];
        samples.extend_from_slice(&vec![0.0; 20_000]);
        let mut buf = iq_buffer(&samples, 10_000_000);
        while status.next_sample(&mut buf) {}
        assert!(status.signal_average < status.power_level_threshold);
    }
}

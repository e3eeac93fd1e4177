//! Logic-side decoder: ISO/IEC 7816-3 contact card exchanges captured as
//! logic-analyzer level streams.

use log::debug;

use crate::buffer::{SampleBuffer, SampleType};
use crate::frame::RawFrame;

pub mod iso7816;

use iso7816::Iso7816;

/// Per-sample state shared with the logic demodulators.
pub struct LogicStatus {
    pub sample_rate: u32,
    pub sample_time: f64,
    /// Absolute reference time for sample-to-wallclock mapping, seconds.
    pub stream_time: f64,
    /// Monotonic sample counter; increases by 1 per processed sample.
    pub signal_clock: u64,
    pub level: bool,
    pub prev_level: bool,
}

impl LogicStatus {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            sample_time: 1.0 / sample_rate.max(1) as f64,
            stream_time: 0.0,
            signal_clock: 0,
            level: true,
            prev_level: true,
        }
    }

    pub fn time_at(&self, clock: u64) -> f64 {
        clock as f64 * self.sample_time
    }

    /// Consume one logic sample; levels above 0.5 are read as high.
    pub fn next_sample(&mut self, buf: &mut SampleBuffer) -> bool {
        if buf.sample_type() != SampleType::RawLogic {
            return false;
        }
        if buf.remaining() < buf.stride() {
            return false;
        }
        self.signal_clock += 1;
        let value = buf.get().unwrap_or(0.0);
        self.prev_level = self.level;
        self.level = value >= 0.5;
        true
    }

    pub fn falling_edge(&self) -> bool {
        self.prev_level && !self.level
    }

    pub fn rising_edge(&self) -> bool {
        !self.prev_level && self.level
    }
}

/// Decoder for logic capture streams. Currently ISO 7816 only.
pub struct IsoDecoder {
    status: LogicStatus,
    iso7816: Iso7816,
    enabled: bool,
    sample_rate: u32,
}

impl Default for IsoDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl IsoDecoder {
    pub fn new() -> Self {
        Self {
            status: LogicStatus::new(0),
            iso7816: Iso7816::new(),
            enabled: true,
            sample_rate: 0,
        }
    }

    pub fn set_enable_iso7816(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn is_iso7816_enabled(&self) -> bool {
        self.enabled
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

    pub fn initialize(&mut self) {
        debug!("initializing ISO decoder, sample rate {}", self.sample_rate);
        let stream_time = self.status.stream_time;
        self.status = LogicStatus::new(self.sample_rate.max(1));
        self.status.stream_time = stream_time;
        self.iso7816.reset();
    }

    /// Decode all frames contained in the buffer; state persists across
    /// calls so frames split over buffers complete on the continuation.
    pub fn next_frames(&mut self, samples: &mut SampleBuffer) -> Vec<RawFrame> {
        let mut frames = Vec::new();
        if samples.sample_rate() > 0 && samples.sample_rate() != self.sample_rate {
            self.sample_rate = samples.sample_rate();
            self.initialize();
        }
        while self.status.next_sample(samples) {
            if self.enabled {
                self.iso7816.process_sample(&self.status, &mut frames);
            }
        }
        frames
    }

    /// Flush any block under construction as truncated. Used on terminate
    /// and at end of capture.
    pub fn flush(&mut self) -> Vec<RawFrame> {
        let mut frames = Vec::new();
        self.iso7816.flush(&self.status, &mut frames);
        frames
    }
}

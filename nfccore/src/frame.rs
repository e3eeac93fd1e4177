use std::ops::{BitOr, BitOrAssign};

/// Technology that produced a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameTech {
    /// Carrier-level events not tied to one technology.
    NfcNone,
    NfcA,
    NfcB,
    NfcF,
    NfcV,
    Iso7816,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    NfcCarrierOff,
    NfcCarrierOn,
    NfcPollFrame,
    NfcListenFrame,
    IsoAtrFrame,
    IsoRequestFrame,
    IsoResponseFrame,
    IsoExchangeFrame,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramePhase {
    Carrier,
    Selection,
    Application,
}

/// Wire-level condition flags attached to a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameFlags(u32);

impl FrameFlags {
    pub const NONE: FrameFlags = FrameFlags(0);
    pub const SHORT_FRAME: FrameFlags = FrameFlags(0x01);
    pub const ENCRYPTED: FrameFlags = FrameFlags(0x02);
    pub const TRUNCATED: FrameFlags = FrameFlags(0x08);
    pub const PARITY_ERROR: FrameFlags = FrameFlags(0x10);
    pub const CRC_ERROR: FrameFlags = FrameFlags(0x20);
    pub const SYNC_ERROR: FrameFlags = FrameFlags(0x40);

    pub fn contains(self, other: FrameFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for FrameFlags {
    type Output = FrameFlags;
    fn bitor(self, rhs: FrameFlags) -> FrameFlags {
        FrameFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for FrameFlags {
    fn bitor_assign(&mut self, rhs: FrameFlags) {
        self.0 |= rhs.0;
    }
}

/// A decoded wire frame: payload bytes plus timing and condition flags.
///
/// Immutable once built; assembled through [`FrameBuilder`].
#[derive(Debug, Clone, PartialEq)]
pub struct RawFrame {
    tech: FrameTech,
    frame_type: FrameType,
    phase: FramePhase,
    flags: FrameFlags,
    rate: u32,
    sample_rate: u32,
    sample_start: u64,
    sample_end: u64,
    time_start: f64,
    time_end: f64,
    date_time: f64,
    payload: Vec<u8>,
}

impl RawFrame {
    pub fn tech(&self) -> FrameTech {
        self.tech
    }

    pub fn frame_type(&self) -> FrameType {
        self.frame_type
    }

    pub fn phase(&self) -> FramePhase {
        self.phase
    }

    pub fn flags(&self) -> FrameFlags {
        self.flags
    }

    pub fn has_flags(&self, flags: FrameFlags) -> bool {
        self.flags.contains(flags)
    }

    /// Symbol rate on the wire in bits per second, 0 when not applicable.
    pub fn rate(&self) -> u32 {
        self.rate
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn sample_start(&self) -> u64 {
        self.sample_start
    }

    pub fn sample_end(&self) -> u64 {
        self.sample_end
    }

    pub fn time_start(&self) -> f64 {
        self.time_start
    }

    pub fn time_end(&self) -> f64 {
        self.time_end
    }

    /// Wall-clock anchor for `time_start`, seconds since the epoch.
    pub fn date_time(&self) -> f64 {
        self.date_time
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// The payload bytes in wire order.
    pub fn to_byte_array(&self) -> Vec<u8> {
        self.payload.clone()
    }

    pub fn is_poll(&self) -> bool {
        matches!(
            self.frame_type,
            FrameType::NfcPollFrame | FrameType::IsoRequestFrame
        )
    }

    pub fn is_listen(&self) -> bool {
        matches!(
            self.frame_type,
            FrameType::NfcListenFrame | FrameType::IsoResponseFrame
        )
    }
}

/// Accumulates payload bytes and flags for a frame under construction.
#[derive(Debug, Clone)]
pub struct FrameBuilder {
    tech: FrameTech,
    frame_type: FrameType,
    phase: FramePhase,
    flags: FrameFlags,
    rate: u32,
    sample_rate: u32,
    date_time: f64,
    payload: Vec<u8>,
}

impl FrameBuilder {
    pub fn new(tech: FrameTech, frame_type: FrameType) -> Self {
        Self {
            tech,
            frame_type,
            phase: FramePhase::Selection,
            flags: FrameFlags::NONE,
            rate: 0,
            sample_rate: 0,
            date_time: 0.0,
            payload: Vec::new(),
        }
    }

    pub fn append(&mut self, byte: u8) {
        self.payload.push(byte);
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.payload.extend_from_slice(bytes);
    }

    pub fn set_flag(&mut self, flags: FrameFlags) {
        self.flags |= flags;
    }

    pub fn set_frame_type(&mut self, frame_type: FrameType) {
        self.frame_type = frame_type;
    }

    pub fn set_phase(&mut self, phase: FramePhase) {
        self.phase = phase;
    }

    pub fn set_rate(&mut self, rate: u32) {
        self.rate = rate;
    }

    pub fn set_sample_rate(&mut self, sample_rate: u32) {
        self.sample_rate = sample_rate;
    }

    pub fn set_date_time(&mut self, date_time: f64) {
        self.date_time = date_time;
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.payload
    }

    /// Seal the frame with its timing. Fields are immutable afterwards.
    pub fn finalize(
        self,
        time_start: f64,
        time_end: f64,
        sample_start: u64,
        sample_end: u64,
    ) -> RawFrame {
        debug_assert!(time_end >= time_start);
        debug_assert!(sample_end >= sample_start);
        RawFrame {
            tech: self.tech,
            frame_type: self.frame_type,
            phase: self.phase,
            flags: self.flags,
            rate: self.rate,
            sample_rate: self.sample_rate,
            sample_start,
            sample_end,
            time_start,
            time_end,
            date_time: self.date_time,
            payload: self.payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_and_seal() {
        let mut b = FrameBuilder::new(FrameTech::NfcA, FrameType::NfcPollFrame);
        b.append(0x26);
        b.set_flag(FrameFlags::SHORT_FRAME);
        b.set_rate(105_937);
        b.set_sample_rate(10_000_000);
        let f = b.finalize(0.001, 0.0011, 10_000, 11_000);
        assert_eq!(f.payload(), &[0x26]);
        assert!(f.has_flags(FrameFlags::SHORT_FRAME));
        assert!(!f.has_flags(FrameFlags::CRC_ERROR));
        assert!(f.time_end() >= f.time_start());
        assert!(f.sample_end() >= f.sample_start());
        assert!(f.is_poll());
    }

    #[test]
    fn flags_compose() {
        let mut flags = FrameFlags::NONE;
        assert!(flags.is_empty());
        flags |= FrameFlags::CRC_ERROR | FrameFlags::TRUNCATED;
        assert!(flags.contains(FrameFlags::CRC_ERROR));
        assert!(flags.contains(FrameFlags::TRUNCATED));
        assert!(!flags.contains(FrameFlags::PARITY_ERROR));
    }

    #[test]
    fn sample_and_time_spans_agree() {
        let mut b = FrameBuilder::new(FrameTech::NfcA, FrameType::NfcListenFrame);
        b.extend(&[0x04, 0x00]);
        b.set_sample_rate(10_000_000);
        let start = 25_000u64;
        let end = 26_900u64;
        let rate = 10_000_000f64;
        let f = b.finalize(start as f64 / rate, end as f64 / rate, start, end);
        let span = ((f.time_end() - f.time_start()) * rate).round() as u64;
        assert_eq!(f.sample_end() - f.sample_start(), span);
    }
}

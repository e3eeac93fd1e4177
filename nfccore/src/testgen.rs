//! Synthetic baseband generators for demodulator tests.

use crate::nfc::NFC_FC;

/// Sample rate used by the radio test vectors.
pub const SIG_RATE: u32 = 10_000_000;

/// ASK depth used for NFC-A / NFC-V listen subcarrier bursts.
pub const LISTEN_DEPTH: f32 = 0.15;

/// ASK depth used for NFC-B and NFC-F modulation.
pub const SHALLOW_DEPTH: f32 = 0.25;

pub fn etu106() -> f64 {
    SIG_RATE as f64 * 128.0 / NFC_FC
}

pub fn etu212() -> f64 {
    SIG_RATE as f64 * 64.0 / NFC_FC
}

/// 7 data bits, least significant first (NFC-A short frame).
pub fn short_frame_bits(byte: u8) -> Vec<u8> {
    (0..7).map(|i| (byte >> i) & 1).collect()
}

/// Standard NFC-A byte frame bits: 8 data bits LSB first plus odd parity.
pub fn byte_frame_bits(bytes: &[u8]) -> Vec<u8> {
    let mut bits = Vec::with_capacity(bytes.len() * 9);
    for &byte in bytes {
        for i in 0..8 {
            bits.push((byte >> i) & 1);
        }
        bits.push(if byte.count_ones() % 2 == 0 { 1 } else { 0 });
    }
    bits
}

/// Plain bit frame: 8 data bits LSB first, no parity (NFC-V).
pub fn plain_frame_bits(bytes: &[u8]) -> Vec<u8> {
    let mut bits = Vec::with_capacity(bytes.len() * 8);
    for &byte in bytes {
        for i in 0..8 {
            bits.push((byte >> i) & 1);
        }
    }
    bits
}

/// Magnitude-sample signal under construction. Values are appended through a
/// fractional cursor so symbol timing does not accumulate rounding drift.
pub struct Signal {
    values: Vec<f32>,
    cursor: f64,
}

impl Default for Signal {
    fn default() -> Self {
        Self::new()
    }
}

impl Signal {
    pub fn new() -> Self {
        Self {
            values: Vec::new(),
            cursor: 0.0,
        }
    }

    fn fill_to<F: Fn(usize) -> f32>(&mut self, end: f64, f: F) {
        let end_n = end.round() as usize;
        while self.values.len() < end_n {
            let n = self.values.len();
            self.values.push(f(n));
        }
        self.cursor = end;
    }

    pub fn carrier_samples(&mut self, n: f64) {
        let end = self.cursor + n;
        self.fill_to(end, |_| 1.0);
    }

    pub fn carrier_ms(&mut self, ms: f64) {
        self.carrier_samples(ms * 1e-3 * SIG_RATE as f64);
    }

    pub fn carrier_us(&mut self, us: f64) {
        self.carrier_samples(us * 1e-6 * SIG_RATE as f64);
    }

    pub fn silence_ms(&mut self, ms: f64) {
        let end = self.cursor + ms * 1e-3 * SIG_RATE as f64;
        self.fill_to(end, |_| 0.0);
    }

    /// Modified Miller poll sequence for the given wire bits (parity
    /// included), with start and end of communication.
    pub fn miller_poll_bits(&mut self, bits: &[u8]) {
        let etu = etu106();
        let pause = etu / 4.0;
        // sequence Z carries a pause at the bit start, X at the middle
        let mut symbols: Vec<Option<f64>> = vec![Some(0.0)];
        let mut prev_one = false;
        for &b in bits {
            if b == 1 {
                symbols.push(Some(0.5));
                prev_one = true;
            } else if prev_one {
                symbols.push(None);
                prev_one = false;
            } else {
                symbols.push(Some(0.0));
            }
        }
        // end of communication: logic zero followed by idle
        if prev_one {
            symbols.push(None);
        } else {
            symbols.push(Some(0.0));
        }
        symbols.push(None);

        let base = self.cursor;
        for (k, symbol) in symbols.iter().enumerate() {
            let s0 = base + k as f64 * etu;
            if let Some(offset) = symbol {
                let p0 = s0 + offset * etu;
                self.fill_to(p0, |_| 1.0);
                self.fill_to(p0 + pause, |_| 0.0);
            }
            self.fill_to(s0 + etu, |_| 1.0);
        }
    }

    pub fn miller_poll_bytes(&mut self, bytes: &[u8]) {
        self.miller_poll_bits(&byte_frame_bits(bytes));
    }

    /// NFC-A listen burst: Manchester with an fc/16 subcarrier, one start
    /// bit then the given wire bits.
    pub fn manchester_listen_bits(&mut self, bits: &[u8]) {
        let etu = etu106();
        let half_sub = SIG_RATE as f64 / (2.0 * NFC_FC / 16.0);
        let mut wire = vec![1u8];
        wire.extend_from_slice(bits);
        let base = self.cursor;
        for (k, &b) in wire.iter().enumerate() {
            let s0 = base + k as f64 * etu;
            let mid = s0 + etu / 2.0;
            let end = s0 + etu;
            let (m0, m1) = if b == 1 { (s0, mid) } else { (mid, end) };
            self.fill_to(m0, |_| 1.0);
            self.fill_to(m1, move |n| {
                if ((n as f64 / half_sub) as u64) % 2 == 0 {
                    1.0 - LISTEN_DEPTH
                } else {
                    1.0
                }
            });
            self.fill_to(end, |_| 1.0);
        }
    }

    pub fn manchester_listen_bytes(&mut self, bytes: &[u8]) {
        self.manchester_listen_bits(&byte_frame_bits(bytes));
    }

    /// NFC-B poll frame: NRZ characters between an extended SOF and EOF.
    pub fn nfcb_poll_bytes(&mut self, bytes: &[u8]) {
        let etu = etu106();
        let low = 1.0 - SHALLOW_DEPTH;
        let sof_low = self.cursor + 10.5 * etu;
        self.fill_to(sof_low, move |_| low);
        let sof_high = self.cursor + 2.5 * etu;
        self.fill_to(sof_high, |_| 1.0);
        for &byte in bytes {
            let c0 = self.cursor;
            self.fill_to(c0 + etu, move |_| low);
            for i in 0..8 {
                let v = if (byte >> i) & 1 == 1 { 1.0 } else { low };
                self.fill_to(c0 + (2.0 + i as f64) * etu, move |_| v);
            }
            // stop bit
            self.fill_to(c0 + 10.0 * etu, |_| 1.0);
        }
        let eof_low = self.cursor + 10.5 * etu;
        self.fill_to(eof_low, move |_| low);
        let tail = self.cursor + 2.0 * etu;
        self.fill_to(tail, |_| 1.0);
    }

    /// NFC-B listen burst: BPSK subcarrier characters between SOS and EOS.
    pub fn nfcb_listen_bytes(&mut self, bytes: &[u8]) {
        let etu = etu106();
        let m = 0.1f32;
        let half_sub = SIG_RATE as f64 / (2.0 * NFC_FC / 16.0);
        let mut levels: Vec<u8> = vec![0; 10];
        levels.extend_from_slice(&[1, 1]);
        for &byte in bytes {
            levels.push(0);
            for i in 0..8 {
                levels.push((byte >> i) & 1);
            }
            levels.push(1);
        }
        levels.extend(std::iter::repeat(0).take(10));
        let base = self.cursor;
        for (k, &level) in levels.iter().enumerate() {
            let end = base + (k + 1) as f64 * etu;
            let sign = if level == 1 { -1.0f32 } else { 1.0f32 };
            self.fill_to(end, move |n| {
                let phase = ((n as f64 / half_sub) as u64) % 2 == 0;
                1.0 + m * sign * (if phase { 1.0 } else { -1.0 })
            });
        }
    }

    /// NFC-F frame at 212 kbps: Manchester preamble, sync word, then
    /// length-prefixed payload with CRC appended big-endian.
    pub fn nfcf_frame(&mut self, frame_bytes: &[u8]) {
        let etu = etu212();
        let low = 1.0 - SHALLOW_DEPTH;
        let mut bits: Vec<u8> = vec![0; 48];
        for i in (0..16).rev() {
            bits.push(((crate::nfc::NFCF_SYNC >> i) & 1) as u8);
        }
        for &byte in frame_bytes {
            for i in (0..8).rev() {
                bits.push((byte >> i) & 1);
            }
        }
        let base = self.cursor;
        for (k, &b) in bits.iter().enumerate() {
            let s0 = base + k as f64 * etu;
            let mid = s0 + etu / 2.0;
            let end = s0 + etu;
            // '0': unmodulated then modulated; '1': the reverse
            let (m0, m1) = if b == 0 { (mid, end) } else { (s0, mid) };
            self.fill_to(m0, |_| 1.0);
            self.fill_to(m1, move |_| low);
            self.fill_to(end, |_| 1.0);
        }
    }

    /// NFC-V poll frame: 1-out-of-4 pulse position coding with SOF and EOF.
    pub fn nfcv_poll_bytes(&mut self, bytes: &[u8]) {
        let tv = etu106();
        let base = self.cursor;
        let mut windows: Vec<Vec<usize>> = vec![vec![0, 4]];
        let bits = plain_frame_bits(bytes);
        for pair in bits.chunks(2) {
            let value = (pair[0] | (pair.get(1).copied().unwrap_or(0) << 1)) as usize;
            windows.push(vec![2 * value + 1]);
        }
        windows.push(vec![2]);
        for (k, slots) in windows.iter().enumerate() {
            let w0 = base + k as f64 * 8.0 * tv;
            for slot in 0..8 {
                let s0 = w0 + slot as f64 * tv;
                if slots.contains(&slot) {
                    self.fill_to(s0, |_| 1.0);
                    self.fill_to(s0 + tv, |_| 0.0);
                }
            }
            self.fill_to(w0 + 8.0 * tv, |_| 1.0);
        }
    }

    /// NFC-V listen burst: single-subcarrier halves over 2-slot bit windows.
    pub fn nfcv_listen_bytes(&mut self, bytes: &[u8]) {
        let bit = 2.0 * etu106();
        let half_sub = SIG_RATE as f64 / (2.0 * NFC_FC / 32.0);
        let mut wire = vec![1u8];
        wire.extend_from_slice(&plain_frame_bits(bytes));
        let base = self.cursor;
        for (k, &b) in wire.iter().enumerate() {
            let s0 = base + k as f64 * bit;
            let mid = s0 + bit / 2.0;
            let end = s0 + bit;
            let (m0, m1) = if b == 1 { (s0, mid) } else { (mid, end) };
            self.fill_to(m0, |_| 1.0);
            self.fill_to(m1, move |n| {
                if ((n as f64 / half_sub) as u64) % 2 == 0 {
                    1.0 - LISTEN_DEPTH
                } else {
                    1.0
                }
            });
            self.fill_to(end, |_| 1.0);
        }
    }

    /// Interleave the magnitude samples into I/Q pairs (Q = 0).
    pub fn finish(self) -> Vec<f32> {
        let mut out = Vec::with_capacity(self.values.len() * 2);
        for v in self.values {
            out.push(v);
            out.push(0.0);
        }
        out
    }
}

/// Logic-level signal for the ISO 7816 decoder tests.
pub struct LogicSignal {
    values: Vec<f32>,
    cursor: f64,
    etu: f64,
}

impl LogicSignal {
    pub fn new(etu_samples: f64) -> Self {
        Self {
            values: Vec::new(),
            cursor: 0.0,
            etu: etu_samples,
        }
    }

    fn fill_to(&mut self, end: f64, level: f32) {
        let end_n = end.round() as usize;
        while self.values.len() < end_n {
            self.values.push(level);
        }
        self.cursor = end;
    }

    pub fn idle(&mut self, etus: f64) {
        let end = self.cursor + etus * self.etu;
        self.fill_to(end, 1.0);
    }

    fn char_levels(&mut self, levels: &[f32]) {
        let c0 = self.cursor;
        for (i, &level) in levels.iter().enumerate() {
            self.fill_to(c0 + (i + 1) as f64 * self.etu, level);
        }
        // stop bits
        self.fill_to(c0 + (levels.len() + 2) as f64 * self.etu, 1.0);
    }

    /// TS character: start bit plus 8 bits, no parity.
    pub fn ts_direct(&mut self) {
        let mut levels = vec![0.0f32];
        for i in 0..8 {
            levels.push(((0x3Bu8 >> i) & 1) as f32);
        }
        self.char_levels(&levels);
    }

    pub fn ts_inverse(&mut self) {
        let mut levels = vec![0.0f32];
        for i in (0..8).rev() {
            levels.push(1.0 - ((0x3Fu8 >> i) & 1) as f32);
        }
        self.char_levels(&levels);
    }

    /// Data character with even parity in the given convention.
    pub fn char_direct(&mut self, byte: u8) {
        let mut levels = vec![0.0f32];
        for i in 0..8 {
            levels.push(((byte >> i) & 1) as f32);
        }
        levels.push((byte.count_ones() % 2) as f32);
        self.char_levels(&levels);
    }

    pub fn char_inverse(&mut self, byte: u8) {
        let mut levels = vec![0.0f32];
        for i in (0..8).rev() {
            levels.push(1.0 - ((byte >> i) & 1) as f32);
        }
        levels.push(1.0 - (byte.count_ones() % 2) as f32);
        self.char_levels(&levels);
    }

    /// Data character with a deliberately wrong parity bit.
    pub fn char_direct_bad_parity(&mut self, byte: u8) {
        let mut levels = vec![0.0f32];
        for i in 0..8 {
            levels.push(((byte >> i) & 1) as f32);
        }
        levels.push(1.0 - (byte.count_ones() % 2) as f32);
        self.char_levels(&levels);
    }

    pub fn finish(self) -> Vec<f32> {
        self.values
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn miller_reqa_has_expected_pauses() {
        let mut sig = Signal::new();
        sig.carrier_us(10.0);
        sig.miller_poll_bits(&short_frame_bits(0x26));
        sig.carrier_us(10.0);
        let values = sig.finish();
        let magnitudes: Vec<f32> = values.iter().step_by(2).copied().collect();
        // REQA symbols Z Z X X Y Z X Y + EOC Z Y carry 7 pauses
        let mut pauses = 0;
        let mut low = false;
        for v in magnitudes {
            if v < 0.5 && !low {
                pauses += 1;
                low = true;
            } else if v >= 0.5 {
                low = false;
            }
        }
        assert_eq!(pauses, 7);
    }

    #[test]
    fn parity_bits_are_odd() {
        let bits = byte_frame_bits(&[0x04]);
        assert_eq!(bits.len(), 9);
        let ones: u8 = bits.iter().sum();
        assert_eq!(ones % 2, 1);
    }
}

//! Helpers shared by the pipeline tests.

use std::sync::{Arc, Mutex};

use crate::pipeline::{FramePair, FrameSink};

/// Sink that collects every decoded pair behind a mutex.
#[derive(Default)]
pub(crate) struct VecSink {
    frames: Arc<Mutex<Vec<FramePair>>>,
}

impl VecSink {
    pub(crate) fn frames(&self) -> Arc<Mutex<Vec<FramePair>>> {
        Arc::clone(&self.frames)
    }
}

impl FrameSink for VecSink {
    fn frame(&mut self, pair: FramePair) {
        self.frames.lock().unwrap().push(pair);
    }
}

/// A 10 MS/s I/Q capture holding one REQA short frame after 1 ms of
/// carrier: modified Miller, sequence Z pauses of a quarter ETU.
pub(crate) fn reqa_signal() -> Vec<f32> {
    let rate = 10_000_000f64;
    let etu = rate * 128.0 / 13.56e6;
    let pause = etu / 4.0;

    // REQA 0x26 as a 7-bit short frame, LSB first
    let bits = [0u8, 1, 1, 0, 0, 1, 0];
    let mut symbols: Vec<Option<f64>> = vec![Some(0.0)];
    let mut prev_one = false;
    for &b in &bits {
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
    if prev_one {
        symbols.push(None);
    } else {
        symbols.push(Some(0.0));
    }
    symbols.push(None);

    let lead = 10_000f64;
    let mut pauses: Vec<(f64, f64)> = Vec::new();
    for (k, symbol) in symbols.iter().enumerate() {
        if let Some(offset) = symbol {
            let p0 = lead + (k as f64 + offset) * etu;
            pauses.push((p0, p0 + pause));
        }
    }

    let total = (lead + symbols.len() as f64 * etu + 5_000.0) as usize;
    let mut out = Vec::with_capacity(total * 2);
    for n in 0..total {
        let t = n as f64;
        let in_pause = pauses.iter().any(|&(a, b)| t >= a && t < b);
        out.push(if in_pause { 0.0 } else { 1.0 });
        out.push(0.0);
    }
    out
}

/// Auxiliary per-sample channel recorder for off-line analysis.
///
/// When enabled, the radio decoder stores one float per channel per sample.
/// The application layer drains the values and decides where they go.
#[derive(Debug, Default)]
pub struct SignalDebug {
    channels: usize,
    open: bool,
    block: Vec<f32>,
    values: Vec<f32>,
}

pub const DEBUG_SIGNAL_VALUE_CHANNEL: usize = 0;
pub const DEBUG_SIGNAL_FILTERED_CHANNEL: usize = 1;
pub const DEBUG_SIGNAL_VARIANCE_CHANNEL: usize = 2;
pub const DEBUG_SIGNAL_AVERAGE_CHANNEL: usize = 3;

/// Number of channels recorded by the radio decoder.
pub const DEBUG_CHANNELS: usize = 4;

impl SignalDebug {
    pub fn new(channels: usize) -> Self {
        Self {
            channels,
            open: false,
            block: vec![0.0; channels],
            values: Vec::new(),
        }
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Start the slot for a new sample, flushing the previous one.
    pub fn block(&mut self) {
        if self.open {
            self.values.extend_from_slice(&self.block);
            for v in &mut self.block {
                *v = 0.0;
            }
        }
        self.open = true;
    }

    pub fn set(&mut self, channel: usize, value: f32) {
        if channel < self.channels {
            self.block[channel] = value;
        }
    }

    /// Take all completed sample slots, interleaved by channel.
    pub fn take(&mut self) -> Vec<f32> {
        if self.open {
            self.values.extend_from_slice(&self.block);
            for v in &mut self.block {
                *v = 0.0;
            }
            self.open = false;
        }
        std::mem::take(&mut self.values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_interleaved_slots() {
        let mut dbg = SignalDebug::new(2);
        dbg.block();
        dbg.set(0, 1.0);
        dbg.set(1, 2.0);
        dbg.block();
        dbg.set(0, 3.0);
        assert_eq!(dbg.take(), vec![1.0, 2.0, 3.0, 0.0]);
        assert!(dbg.take().is_empty());
    }
}

use std::sync::Arc;

/// Payload layout of a [`SampleBuffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleType {
    /// 2 float components per sample (I / Q)
    RawIq,
    /// 1 float component per sample (value)
    RawReal,
    /// 1 float component per sample (logic level)
    RawLogic,
    /// 2 float components per sample (value / offset)
    AdvReal,
    /// 2 float components per sample (level / offset)
    AdvLogic,
    /// 2 float components per sample (magnitude / phase)
    FftBin,
}

impl SampleType {
    /// Default number of float components per sample for this type.
    pub fn stride(&self) -> usize {
        match self {
            SampleType::RawIq => 2,
            SampleType::RawReal => 1,
            SampleType::RawLogic => 1,
            SampleType::AdvReal => 2,
            SampleType::AdvLogic => 2,
            SampleType::FftBin => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferError {
    /// Read past the buffer limit.
    Underflow,
    /// Write past the buffer capacity.
    Overflow,
    /// Write attempted after the storage became shared.
    Sealed,
}

impl std::fmt::Display for BufferError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BufferError::Underflow => write!(f, "read past buffer limit"),
            BufferError::Overflow => write!(f, "write past buffer capacity"),
            BufferError::Sealed => write!(f, "write to shared buffer"),
        }
    }
}

impl std::error::Error for BufferError {}

/// A typed slice of float samples moving between pipeline stages.
///
/// Behaves as a put/get buffer with an explicit `flip`: the producer `put`s
/// samples, flips once, and hands the buffer to exactly one consumer which
/// `get`s them back out. Copies share the underlying storage; `slice` creates
/// a new view with its own position.
#[derive(Debug, Clone)]
pub struct SampleBuffer {
    data: Arc<Vec<f32>>,
    capacity: usize,
    stride: usize,
    sample_type: SampleType,
    sample_rate: u32,
    decimation: u32,
    offset: u64,
    position: usize,
    limit: usize,
}

impl SampleBuffer {
    pub fn new(
        capacity: usize,
        sample_type: SampleType,
        sample_rate: u32,
        offset: u64,
    ) -> Self {
        Self {
            data: Arc::new(Vec::with_capacity(capacity)),
            capacity,
            stride: sample_type.stride(),
            sample_type,
            sample_rate,
            decimation: 1,
            offset,
            position: 0,
            limit: 0,
        }
    }

    /// Build a flipped buffer directly from a slice of components.
    pub fn from_samples(
        samples: &[f32],
        sample_type: SampleType,
        sample_rate: u32,
        offset: u64,
    ) -> Self {
        let mut buf = Self::new(samples.len(), sample_type, sample_rate, offset);
        buf.put(samples).expect("fresh buffer");
        buf.flip();
        buf
    }

    /// Append components to the fill region.
    pub fn put(&mut self, samples: &[f32]) -> Result<(), BufferError> {
        let capacity = self.capacity;
        let data = Arc::get_mut(&mut self.data).ok_or(BufferError::Sealed)?;
        if data.len() + samples.len() > capacity {
            return Err(BufferError::Overflow);
        }
        data.extend_from_slice(samples);
        Ok(())
    }

    /// Seal the fill region for reading: position 0, limit at the fill point.
    pub fn flip(&mut self) {
        self.limit = self.data.len();
        self.position = 0;
        debug_assert!(self.limit % self.stride == 0);
    }

    /// Read one float component, advancing the position.
    pub fn get(&mut self) -> Result<f32, BufferError> {
        if self.position >= self.limit {
            return Err(BufferError::Underflow);
        }
        let v = self.data[self.position];
        self.position += 1;
        Ok(v)
    }

    /// Components left between position and limit.
    pub fn remaining(&self) -> usize {
        self.limit - self.position
    }

    /// Whole samples left between position and limit.
    pub fn elements(&self) -> usize {
        self.remaining() / self.stride
    }

    /// New view over `len` components starting at `from`, sharing storage.
    pub fn slice(&self, from: usize, len: usize) -> SampleBuffer {
        let from = from.min(self.data.len());
        let limit = (from + len).min(self.data.len());
        SampleBuffer {
            data: Arc::clone(&self.data),
            capacity: self.capacity,
            stride: self.stride,
            sample_type: self.sample_type,
            sample_rate: self.sample_rate,
            decimation: self.decimation,
            offset: self.offset,
            position: from,
            limit,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn sample_type(&self) -> SampleType {
        self.sample_type
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn decimation(&self) -> u32 {
        self.decimation
    }

    pub fn set_decimation(&mut self, decimation: u32) {
        self.decimation = decimation;
    }

    /// Absolute sample index of the first element in the buffer.
    pub fn offset(&self) -> u64 {
        self.offset
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_flip_get() {
        let mut buf = SampleBuffer::new(4, SampleType::RawReal, 1000, 0);
        buf.put(&[1.0, 2.0, 3.0]).unwrap();
        buf.flip();
        assert_eq!(buf.remaining(), 3);
        assert_eq!(buf.elements(), 3);
        assert_eq!(buf.get().unwrap(), 1.0);
        assert_eq!(buf.get().unwrap(), 2.0);
        assert_eq!(buf.remaining(), 1);
        assert_eq!(buf.get().unwrap(), 3.0);
        assert_eq!(buf.get(), Err(BufferError::Underflow));
    }

    #[test]
    fn overflow_rejected() {
        let mut buf = SampleBuffer::new(2, SampleType::RawReal, 1000, 0);
        assert_eq!(buf.put(&[0.0; 3]), Err(BufferError::Overflow));
    }

    #[test]
    fn sealed_after_clone() {
        let mut buf = SampleBuffer::new(4, SampleType::RawReal, 1000, 0);
        buf.put(&[1.0]).unwrap();
        buf.flip();
        let _view = buf.clone();
        assert_eq!(buf.put(&[2.0]), Err(BufferError::Sealed));
    }

    #[test]
    fn iq_elements_use_stride() {
        let buf = SampleBuffer::from_samples(&[1.0, 0.0, 0.5, 0.5], SampleType::RawIq, 1000, 7);
        assert_eq!(buf.stride(), 2);
        assert_eq!(buf.elements(), 2);
        assert_eq!(buf.offset(), 7);
        assert!(buf.elements() * buf.stride() <= buf.capacity());
    }

    #[test]
    fn slice_has_own_position() {
        let buf = SampleBuffer::from_samples(&[1.0, 2.0, 3.0, 4.0], SampleType::RawReal, 1000, 0);
        let mut view = buf.slice(2, 2);
        assert_eq!(view.get().unwrap(), 3.0);
        assert_eq!(buf.remaining(), 4);
        assert_eq!(view.remaining(), 1);
    }
}

//! Capture sources feeding the pipeline from recorded files.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{channel, Sender, SyncSender, TryRecvError};
use std::sync::{Arc, Mutex};

use log::debug;
use nfccore::buffer::{SampleBuffer, SampleType};

use crate::error::LabError;
use crate::pipeline::{PipelineEvent, SampleSource};

/// Number of samples pushed per buffer.
const CHUNK_ELEMENTS: usize = 65_536;

/// Replays a capture file of little-endian f32 components as sample
/// buffers, then closes the pipeline. Backpressure comes from the bounded
/// event queue: the feeder thread blocks, the file is never dropped.
pub struct FileSource {
    samples: Arc<Vec<f32>>,
    sample_type: SampleType,
    sample_rate: u32,
    end_tx: Mutex<Option<Sender<()>>>,
}

impl FileSource {
    /// Raw I/Q capture (two components per sample).
    pub fn iq(path: &Path, sample_rate: u32) -> Result<Self, LabError> {
        Self::open(path, SampleType::RawIq, sample_rate)
    }

    /// Logic-analyzer capture (one level component per sample).
    pub fn logic(path: &Path, sample_rate: u32) -> Result<Self, LabError> {
        Self::open(path, SampleType::RawLogic, sample_rate)
    }

    fn open(path: &Path, sample_type: SampleType, sample_rate: u32) -> Result<Self, LabError> {
        let mut file =
            File::open(path).map_err(|_| LabError::InvalidCapturePath(PathBuf::from(path)))?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)
            .map_err(|_| LabError::CaptureReadFailed(PathBuf::from(path)))?;
        let samples = bytes
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();
        Ok(Self::from_samples(samples, sample_type, sample_rate))
    }

    pub fn from_samples(samples: Vec<f32>, sample_type: SampleType, sample_rate: u32) -> Self {
        Self {
            samples: Arc::new(samples),
            sample_type,
            sample_rate,
            end_tx: Mutex::new(None),
        }
    }
}

impl SampleSource for FileSource {
    fn start(&self, events: SyncSender<PipelineEvent>) {
        let (end_tx, end_rx) = channel();
        let samples = Arc::clone(&self.samples);
        let sample_type = self.sample_type;
        let sample_rate = self.sample_rate;
        std::thread::spawn(move || {
            let stride = sample_type.stride();
            let mut offset = 0u64;
            for chunk in samples.chunks(CHUNK_ELEMENTS * stride) {
                if end_rx.try_recv() != Err(TryRecvError::Empty) {
                    return;
                }
                let buffer = SampleBuffer::from_samples(chunk, sample_type, sample_rate, offset);
                offset += buffer.elements() as u64;
                if events.send(PipelineEvent::Samples(buffer)).is_err() {
                    debug!("pipeline went away while feeding capture");
                    return;
                }
            }
            let _ = events.send(PipelineEvent::Close);
        });
        *self.end_tx.lock().unwrap() = Some(end_tx);
    }

    fn close(&self) {
        let _ = self.end_tx.lock().unwrap().take();
    }
}

/// A source that produces nothing; the pipeline is driven externally.
#[derive(Default)]
pub struct NullSource;

impl NullSource {
    pub fn new() -> Self {
        Self
    }
}

impl SampleSource for NullSource {
    fn start(&self, _events: SyncSender<PipelineEvent>) {}
    fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc::sync_channel;

    #[test]
    fn file_source_replays_and_closes() {
        let source = FileSource::from_samples(
            vec![1.0; CHUNK_ELEMENTS * 2 + 64],
            SampleType::RawIq,
            10_000_000,
        );
        let (tx, rx) = sync_channel(8);
        source.start(tx);

        let mut buffers = 0;
        let mut elements = 0;
        loop {
            match rx.recv().unwrap() {
                PipelineEvent::Samples(buf) => {
                    buffers += 1;
                    elements += buf.elements();
                    assert_eq!(buf.sample_type(), SampleType::RawIq);
                }
                PipelineEvent::Close => break,
                _ => {}
            }
        }
        assert_eq!(buffers, 2);
        assert_eq!(elements, CHUNK_ELEMENTS + 32);
    }

    #[test]
    fn missing_file_is_a_config_error() {
        let result = FileSource::iq(Path::new("/does/not/exist.iq"), 10_000_000);
        assert!(matches!(result, Err(LabError::InvalidCapturePath(_))));
    }
}

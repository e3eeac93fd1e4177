//! The decoding pipeline: one worker thread per stage, joined by bounded
//! channels.
//!
//! The capture source feeds sample buffers from its own thread; the
//! demodulate worker owns the radio and logic decoders and emits raw
//! frames; the parse worker owns the protocol parsers and lifts each raw
//! frame into its field tree; the sink worker drains decoded pairs. Every
//! queue is bounded, so a slow stage blocks the one before it; the core
//! never drops a buffer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::JoinHandle;

use log::{debug, warn};
use nfccore::buffer::{SampleBuffer, SampleType};
use nfccore::frame::RawFrame;
use nfccore::logic::IsoDecoder;
use nfccore::parser::ProtocolParser;
use nfccore::radio::NfcDecoder;
use nfccore::tree::ProtocolFrame;

use crate::config::DecoderConfig;
use crate::error::LabError;

/// One decoded frame with its field tree. Carrier events have no tree.
#[derive(Debug, Clone)]
pub struct FramePair {
    pub raw: RawFrame,
    pub protocol: Option<ProtocolFrame>,
}

pub enum PipelineEvent {
    /// A sealed sample buffer from the capture stage.
    Samples(SampleBuffer),
    /// Replace the decoder configuration. Rejected configurations keep the
    /// previous state.
    Configure(Box<DecoderConfig>),
    Start,
    Close,
}

/// Items flowing from the demodulate stage to the parse stage.
enum ParseEvent {
    Frame(RawFrame),
    /// A configuration change dropped the session state upstream; the
    /// parsers follow.
    Reset,
}

/// A capture stage feeding sample buffers into the pipeline. The
/// implementation owns the capture worker: `start` is expected to hand the
/// queue to a thread (or a device callback) that pushes `Samples` events.
pub trait SampleSource: Send + Sync + 'static {
    fn start(&self, events: SyncSender<PipelineEvent>);
    fn close(&self);
}

/// A consumer of decoded frame pairs.
pub trait FrameSink: Send + 'static {
    fn frame(&mut self, pair: FramePair);

    /// Called once after the last frame, including on termination.
    fn finish(&mut self) {}
}

pub struct Pipeline {
    event_tx: SyncSender<PipelineEvent>,
    alive: Arc<AtomicBool>,
    demod_worker: Option<JoinHandle<()>>,
    parse_worker: Option<JoinHandle<()>>,
    sink_worker: Option<JoinHandle<()>>,
}

impl Pipeline {
    /// Validate the configuration and spawn the demodulate, parse and sink
    /// workers.
    pub fn new<S: SampleSource, K: FrameSink>(
        config: DecoderConfig,
        source: S,
        sink: K,
    ) -> Result<Self, LabError> {
        config.validate()?;
        let (event_tx, event_rx) = sync_channel(config.queue_depth);
        let (frame_tx, frame_rx) = sync_channel(config.queue_depth);
        let (pair_tx, pair_rx) = sync_channel(config.queue_depth);
        let alive = Arc::new(AtomicBool::new(true));

        let demod_worker = spawn_demod_worker(
            config,
            event_tx.clone(),
            event_rx,
            frame_tx,
            Box::new(source),
            Arc::clone(&alive),
        );
        let parse_worker = spawn_parse_worker(frame_rx, pair_tx);
        let sink_worker = spawn_sink_worker(pair_rx, Box::new(sink));

        Ok(Self {
            event_tx,
            alive,
            demod_worker: Some(demod_worker),
            parse_worker: Some(parse_worker),
            sink_worker: Some(sink_worker),
        })
    }

    /// Queue handle for pushing events from outside the capture stage.
    pub fn events(&self) -> SyncSender<PipelineEvent> {
        self.event_tx.clone()
    }

    pub fn start(&self) -> Result<(), LabError> {
        self.event_tx
            .send(PipelineEvent::Start)
            .map_err(|_| LabError::PipelineClosed)
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Request termination and wait for the workers. The demodulate worker
    /// finishes the current buffer and flushes in-flight frames as
    /// truncated before exiting; the downstream stages drain behind it.
    pub fn shutdown(mut self) {
        self.alive.store(false, Ordering::SeqCst);
        // the Close event doubles as the wake-up for an idle worker
        let _ = self.event_tx.try_send(PipelineEvent::Close);
        self.join();
    }

    /// Wait for the pipeline to finish on its own (source sent Close).
    pub fn wait(mut self) {
        self.join();
    }

    fn join(&mut self) {
        if let Some(worker) = self.demod_worker.take() {
            let _ = worker.join();
        }
        if let Some(worker) = self.parse_worker.take() {
            let _ = worker.join();
        }
        if let Some(worker) = self.sink_worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.alive.store(false, Ordering::SeqCst);
        match self.event_tx.try_send(PipelineEvent::Close) {
            Ok(()) | Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {}
        }
        self.join();
    }
}

fn spawn_demod_worker(
    config: DecoderConfig,
    event_tx: SyncSender<PipelineEvent>,
    event_rx: Receiver<PipelineEvent>,
    frame_tx: SyncSender<ParseEvent>,
    source: Box<dyn SampleSource>,
    alive: Arc<AtomicBool>,
) -> JoinHandle<()> {
    std::thread::spawn(move || {
        let mut radio = NfcDecoder::new();
        let mut logic = IsoDecoder::new();
        config.apply_radio(&mut radio);
        config.apply_logic(&mut logic);

        while let Ok(event) = event_rx.recv() {
            match event {
                PipelineEvent::Samples(mut buffer) => {
                    let frames = match buffer.sample_type() {
                        SampleType::RawIq => radio.next_frames(&mut buffer),
                        SampleType::RawLogic => logic.next_frames(&mut buffer),
                        other => {
                            debug!("ignoring buffer of type {other:?}");
                            Vec::new()
                        }
                    };
                    if !forward(&frame_tx, frames) {
                        break;
                    }
                }
                PipelineEvent::Configure(new_config) => match new_config.validate() {
                    Ok(()) => {
                        debug!("applying new decoder configuration");
                        new_config.apply_radio(&mut radio);
                        new_config.apply_logic(&mut logic);
                        let _ = frame_tx.send(ParseEvent::Reset);
                    }
                    Err(e) => warn!("rejected decoder configuration: {e}"),
                },
                PipelineEvent::Start => source.start(event_tx.clone()),
                PipelineEvent::Close => break,
            }
            if !alive.load(Ordering::SeqCst) {
                break;
            }
        }

        // flush whatever was mid-frame as truncated
        let mut trailing = radio.flush();
        trailing.extend(logic.flush());
        forward(&frame_tx, trailing);

        source.close();
        alive.store(false, Ordering::SeqCst);
    })
}

fn forward(frame_tx: &SyncSender<ParseEvent>, frames: Vec<RawFrame>) -> bool {
    for raw in frames {
        // blocking send: backpressure belongs to the stage before
        if frame_tx.send(ParseEvent::Frame(raw)).is_err() {
            return false;
        }
    }
    true
}

fn spawn_parse_worker(
    frame_rx: Receiver<ParseEvent>,
    pair_tx: SyncSender<FramePair>,
) -> JoinHandle<()> {
    std::thread::spawn(move || {
        let mut parser = ProtocolParser::new();
        while let Ok(event) = frame_rx.recv() {
            match event {
                ParseEvent::Frame(raw) => {
                    let protocol = parser.parse(&raw);
                    if pair_tx.send(FramePair { raw, protocol }).is_err() {
                        break;
                    }
                }
                ParseEvent::Reset => parser.reset(),
            }
        }
    })
}

fn spawn_sink_worker(pair_rx: Receiver<FramePair>, mut sink: Box<dyn FrameSink>) -> JoinHandle<()> {
    std::thread::spawn(move || {
        while let Ok(pair) = pair_rx.recv() {
            sink.frame(pair);
        }
        sink.finish();
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{reqa_signal, VecSink};
    use nfccore::frame::{FrameFlags, FrameTech, FrameType};
    use std::sync::Mutex;
    use std::time::Duration;

    struct NullSource;

    impl SampleSource for NullSource {
        fn start(&self, _events: SyncSender<PipelineEvent>) {}
        fn close(&self) {}
    }

    #[test]
    fn rejects_invalid_configuration() {
        let config = DecoderConfig {
            sample_rate: 0,
            ..Default::default()
        };
        let result = Pipeline::new(config, NullSource, VecSink::default());
        assert!(matches!(result, Err(LabError::InvalidSampleRate)));
    }

    #[test]
    fn decodes_and_parses_in_order() {
        let sink = VecSink::default();
        let collected = sink.frames();
        let pipeline = Pipeline::new(DecoderConfig::default(), NullSource, sink).unwrap();
        pipeline.start().unwrap();

        let samples = reqa_signal();
        let events = pipeline.events();
        let buffer = SampleBuffer::from_samples(&samples, SampleType::RawIq, 10_000_000, 0);
        events.send(PipelineEvent::Samples(buffer)).unwrap();
        events.send(PipelineEvent::Close).unwrap();
        pipeline.wait();

        let frames = collected.lock().unwrap();
        let data: Vec<_> = frames
            .iter()
            .filter(|p| p.raw.frame_type() == FrameType::NfcPollFrame)
            .collect();
        assert_eq!(data.len(), 1, "{:?}", frames.iter().map(|p| &p.raw).collect::<Vec<_>>());
        let pair = data[0];
        assert_eq!(pair.raw.tech(), FrameTech::NfcA);
        assert_eq!(pair.raw.payload(), &[0x26]);
        assert!(pair.raw.has_flags(FrameFlags::SHORT_FRAME));
        let tree = pair.protocol.as_ref().expect("protocol tree");
        assert_eq!(tree.name(), "REQA");

        // carrier events pass through without a tree
        for pair in frames.iter() {
            if pair.raw.frame_type() == FrameType::NfcCarrierOn {
                assert!(pair.protocol.is_none());
            }
        }

        // ordering matches the raw frame order
        for window in frames.windows(2) {
            assert!(window[1].raw.time_start() >= window[0].raw.time_start());
        }
    }

    #[test]
    fn split_buffers_match_single_buffer() {
        fn run(chunks: Vec<Vec<f32>>) -> Vec<FramePair> {
            let sink = VecSink::default();
            let collected = sink.frames();
            let pipeline = Pipeline::new(DecoderConfig::default(), NullSource, sink).unwrap();
            let events = pipeline.events();
            let mut offset = 0u64;
            for chunk in chunks {
                let buffer =
                    SampleBuffer::from_samples(&chunk, SampleType::RawIq, 10_000_000, offset);
                offset += buffer.elements() as u64;
                events.send(PipelineEvent::Samples(buffer)).unwrap();
            }
            events.send(PipelineEvent::Close).unwrap();
            pipeline.wait();
            let frames = collected.lock().unwrap();
            frames.clone()
        }

        let signal = reqa_signal();
        let whole = run(vec![signal.clone()]);
        let cut = signal.len() / 2 & !1;
        let split = run(vec![signal[..cut].to_vec(), signal[cut..].to_vec()]);

        let raw_whole: Vec<_> = whole.iter().map(|p| p.raw.clone()).collect();
        let raw_split: Vec<_> = split.iter().map(|p| p.raw.clone()).collect();
        assert_eq!(raw_whole, raw_split);
    }

    #[test]
    fn shutdown_terminates_workers() {
        static CLOSED: Mutex<bool> = Mutex::new(false);

        struct TrackingSource;
        impl SampleSource for TrackingSource {
            fn start(&self, _events: SyncSender<PipelineEvent>) {}
            fn close(&self) {
                *CLOSED.lock().unwrap() = true;
            }
        }

        let pipeline =
            Pipeline::new(DecoderConfig::default(), TrackingSource, VecSink::default()).unwrap();
        pipeline.start().unwrap();
        std::thread::sleep(Duration::from_millis(10));
        pipeline.shutdown();
        assert!(*CLOSED.lock().unwrap());
    }
}

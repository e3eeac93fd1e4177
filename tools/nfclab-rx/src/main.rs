use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, ValueEnum};
use log::error;
use nfcapp::config::DecoderConfig;
use nfcapp::pipeline::{FramePair, FrameSink, Pipeline};
use nfcapp::source::FileSource;
use nfccore::frame::{FrameTech, FrameType};
use nfccore::tree::FieldValue;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Format {
    /// Raw I/Q capture from an SDR (two f32 components per sample)
    Iq,
    /// Logic-analyzer level capture (one f32 component per sample)
    Logic,
}

/// Decode NFC (A/B/F/V) or ISO 7816 exchanges from a capture file and
/// print the recovered frames.
#[derive(Parser)]
#[command(name = "nfclab-rx", version)]
struct Args {
    /// Capture file of little-endian f32 components
    input: PathBuf,

    #[arg(long, value_enum, default_value = "iq")]
    format: Format,

    /// Sample rate of the capture in samples per second
    #[arg(long, default_value_t = 10_000_000)]
    sample_rate: u32,

    /// Envelope level below which the carrier is considered absent
    #[arg(long, default_value_t = 0.01)]
    power_threshold: f32,

    /// Print the decoded field tree under each frame
    #[arg(long)]
    tree: bool,
}

struct PrintSink {
    tree: bool,
    count: usize,
}

impl FrameSink for PrintSink {
    fn frame(&mut self, pair: FramePair) {
        let raw = &pair.raw;
        let tech = match raw.tech() {
            FrameTech::NfcNone => "-",
            FrameTech::NfcA => "NfcA",
            FrameTech::NfcB => "NfcB",
            FrameTech::NfcF => "NfcF",
            FrameTech::NfcV => "NfcV",
            FrameTech::Iso7816 => "Iso7816",
        };
        let kind = match raw.frame_type() {
            FrameType::NfcCarrierOn => "carrier-on",
            FrameType::NfcCarrierOff => "carrier-off",
            FrameType::NfcPollFrame | FrameType::IsoRequestFrame => ">>",
            FrameType::NfcListenFrame | FrameType::IsoResponseFrame => "<<",
            FrameType::IsoAtrFrame => "atr",
            FrameType::IsoExchangeFrame => "<>",
        };
        let bytes = raw
            .payload()
            .iter()
            .map(|b| format!("{b:02X}"))
            .collect::<Vec<_>>()
            .join(" ");
        let name = pair
            .protocol
            .as_ref()
            .map(|t| t.name().to_string())
            .unwrap_or_default();
        println!(
            "{:>12.6}  {:<8} {:<11} {:<16} {}",
            raw.time_start(),
            tech,
            kind,
            name,
            bytes
        );
        if self.tree {
            if let Some(tree) = &pair.protocol {
                for child in tree.children() {
                    let value = match child.value() {
                        FieldValue::Bytes(b) => b
                            .iter()
                            .map(|v| format!("{v:02X}"))
                            .collect::<Vec<_>>()
                            .join(" "),
                        FieldValue::Number(n) => format!("{n:#x}"),
                        FieldValue::Text(t) => t.clone(),
                    };
                    println!("              {:<20} {}", child.name(), value);
                }
            }
        }
        self.count += 1;
    }

    fn finish(&mut self) {
        println!("{} frames", self.count);
    }
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();

    let config = DecoderConfig {
        sample_rate: args.sample_rate,
        power_level_threshold: args.power_threshold,
        ..Default::default()
    };

    let source = match args.format {
        Format::Iq => FileSource::iq(&args.input, args.sample_rate),
        Format::Logic => FileSource::logic(&args.input, args.sample_rate),
    };
    let source = match source {
        Ok(source) => source,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    let sink = PrintSink {
        tree: args.tree,
        count: 0,
    };
    let pipeline = match Pipeline::new(config, source, sink) {
        Ok(pipeline) => pipeline,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };
    if pipeline.start().is_err() {
        error!("pipeline refused to start");
        return ExitCode::FAILURE;
    }
    pipeline.wait();
    ExitCode::SUCCESS
}

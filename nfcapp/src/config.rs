use nfccore::logic::IsoDecoder;
use nfccore::radio::NfcDecoder;

use crate::error::LabError;

/// Decoder configuration, applied at pipeline start and on `Configure`
/// events. Validation failures leave the running decoder untouched.
#[derive(Debug, Clone, PartialEq)]
pub struct DecoderConfig {
    /// Declared input sample rate; a differing rate on an incoming buffer
    /// re-initialises the decoders.
    pub sample_rate: u32,
    pub enable_nfca: bool,
    pub enable_nfcb: bool,
    pub enable_nfcf: bool,
    pub enable_nfcv: bool,
    pub enable_iso7816: bool,
    /// Envelope level below which the carrier is considered absent.
    pub power_level_threshold: f32,
    /// (min, max) modulation depth accepted by each radio detector.
    pub modulation_threshold_nfca: (f32, f32),
    pub modulation_threshold_nfcb: (f32, f32),
    pub modulation_threshold_nfcf: (f32, f32),
    pub modulation_threshold_nfcv: (f32, f32),
    pub correlation_threshold_nfca: f32,
    pub correlation_threshold_nfcb: f32,
    pub correlation_threshold_nfcf: f32,
    pub correlation_threshold_nfcv: f32,
    /// Absolute reference time in nanoseconds for sample-to-wallclock
    /// mapping of emitted frames.
    pub stream_time: u64,
    /// Record auxiliary per-sample debug channels.
    pub debug_enabled: bool,
    /// Depth of the bounded queues between pipeline stages, in buffers.
    pub queue_depth: usize,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            sample_rate: 10_000_000,
            enable_nfca: true,
            enable_nfcb: true,
            enable_nfcf: true,
            enable_nfcv: true,
            enable_iso7816: true,
            power_level_threshold: 0.01,
            modulation_threshold_nfca: (0.85, 1.0),
            modulation_threshold_nfcb: (0.10, 0.75),
            modulation_threshold_nfcf: (0.10, 0.75),
            // the low-modulation V reader needs the high default minimum
            modulation_threshold_nfcv: (0.85, 1.0),
            correlation_threshold_nfca: 0.05,
            correlation_threshold_nfcb: 0.05,
            correlation_threshold_nfcf: 0.05,
            correlation_threshold_nfcv: 0.05,
            stream_time: 0,
            debug_enabled: false,
            queue_depth: 16,
        }
    }
}

impl DecoderConfig {
    pub fn validate(&self) -> Result<(), LabError> {
        if self.sample_rate == 0 {
            return Err(LabError::InvalidSampleRate);
        }
        if !(self.enable_nfca
            || self.enable_nfcb
            || self.enable_nfcf
            || self.enable_nfcv
            || self.enable_iso7816)
        {
            return Err(LabError::NothingEnabled);
        }
        if !(0.0..1.0).contains(&self.power_level_threshold) || self.power_level_threshold <= 0.0 {
            return Err(LabError::InvalidPowerThreshold(self.power_level_threshold));
        }
        for (tech, (min, max)) in [
            ("nfc-a", self.modulation_threshold_nfca),
            ("nfc-b", self.modulation_threshold_nfcb),
            ("nfc-f", self.modulation_threshold_nfcf),
            ("nfc-v", self.modulation_threshold_nfcv),
        ] {
            if !(min > 0.0 && min < max && max <= 1.0) {
                return Err(LabError::InvalidModulationThreshold { tech, min, max });
            }
        }
        for (tech, value) in [
            ("nfc-a", self.correlation_threshold_nfca),
            ("nfc-b", self.correlation_threshold_nfcb),
            ("nfc-f", self.correlation_threshold_nfcf),
            ("nfc-v", self.correlation_threshold_nfcv),
        ] {
            if !(value > 0.0 && value < 1.0) {
                return Err(LabError::InvalidCorrelationThreshold { tech, value });
            }
        }
        Ok(())
    }

    /// Seconds form of the stream time reference.
    pub fn stream_time_seconds(&self) -> f64 {
        self.stream_time as f64 / 1e9
    }

    pub(crate) fn apply_radio(&self, decoder: &mut NfcDecoder) {
        decoder.set_sample_rate(self.sample_rate);
        decoder.set_enable_nfca(self.enable_nfca);
        decoder.set_enable_nfcb(self.enable_nfcb);
        decoder.set_enable_nfcf(self.enable_nfcf);
        decoder.set_enable_nfcv(self.enable_nfcv);
        decoder.set_power_level_threshold(self.power_level_threshold);
        decoder.set_stream_time(self.stream_time_seconds());
        decoder.set_enable_debug(self.debug_enabled);
        let (min, max) = self.modulation_threshold_nfca;
        decoder.set_modulation_threshold_nfca(min, max);
        let (min, max) = self.modulation_threshold_nfcb;
        decoder.set_modulation_threshold_nfcb(min, max);
        let (min, max) = self.modulation_threshold_nfcf;
        decoder.set_modulation_threshold_nfcf(min, max);
        let (min, max) = self.modulation_threshold_nfcv;
        decoder.set_modulation_threshold_nfcv(min, max);
        decoder.set_correlation_threshold_nfca(self.correlation_threshold_nfca);
        decoder.set_correlation_threshold_nfcb(self.correlation_threshold_nfcb);
        decoder.set_correlation_threshold_nfcf(self.correlation_threshold_nfcf);
        decoder.set_correlation_threshold_nfcv(self.correlation_threshold_nfcv);
        decoder.initialize();
    }

    pub(crate) fn apply_logic(&self, decoder: &mut IsoDecoder) {
        decoder.set_sample_rate(self.sample_rate);
        decoder.set_enable_iso7816(self.enable_iso7816);
        decoder.set_stream_time(self.stream_time_seconds());
        decoder.initialize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert_eq!(DecoderConfig::default().validate(), Ok(()));
    }

    #[test]
    fn zero_sample_rate_rejected() {
        let config = DecoderConfig {
            sample_rate: 0,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(LabError::InvalidSampleRate));
    }

    #[test]
    fn contradictory_thresholds_rejected() {
        let config = DecoderConfig {
            modulation_threshold_nfcb: (0.8, 0.2),
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(LabError::InvalidModulationThreshold { tech: "nfc-b", .. })
        ));
    }

    #[test]
    fn all_disabled_rejected() {
        let config = DecoderConfig {
            enable_nfca: false,
            enable_nfcb: false,
            enable_nfcf: false,
            enable_nfcv: false,
            enable_iso7816: false,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(LabError::NothingEnabled));
    }

    #[test]
    fn nfcv_keeps_low_modulation_default() {
        let config = DecoderConfig::default();
        assert_eq!(config.modulation_threshold_nfcv.0, 0.85);
    }
}

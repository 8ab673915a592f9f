use std::{path::PathBuf, time::Duration};

use crate::{
    channel::ChannelRange,
    driver::{Edge, SampleMode, TerminalConfig},
    error::{Error, Result},
};

/// How many rows a buffer-filled notification emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RowPolicy {
    /// As many rows as the secondary task returned frames. Primary slots
    /// past its own read are emitted with whatever they held before.
    #[default]
    Secondary,
    /// Only frames both tasks returned in this notification.
    Lockstep,
}

impl RowPolicy {
    pub fn rows(self, primary_frames: usize, secondary_frames: usize) -> usize {
        match self {
            RowPolicy::Secondary => secondary_frames,
            RowPolicy::Lockstep => primary_frames.min(secondary_frames),
        }
    }
}

/// Everything needed to set up the two synchronized tasks.
#[derive(Debug, Clone)]
pub struct AcquisitionConfig {
    pub primary_device: String,
    pub secondary_device: String,
    pub channels: ChannelRange,
    pub terminal: TerminalConfig,
    pub min_volts: f64,
    pub max_volts: f64,
    pub rate: f64,
    pub edge: Edge,
    pub mode: SampleMode,
    pub samples_per_channel: usize,
    pub read_timeout: Duration,
    pub row_policy: RowPolicy,
    pub output: PathBuf,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        AcquisitionConfig {
            primary_device: "Dev1".to_string(),
            secondary_device: "Dev3".to_string(),
            channels: ChannelRange { first: 0, last: 7 },
            terminal: TerminalConfig::Rse,
            min_volts: -10.0,
            max_volts: 10.0,
            rate: 1000.0,
            edge: Edge::Rising,
            mode: SampleMode::Continuous,
            samples_per_channel: 1000,
            read_timeout: Duration::from_secs(10),
            row_policy: RowPolicy::Secondary,
            output: PathBuf::from("data.txt"),
        }
    }
}

impl AcquisitionConfig {
    pub const PRIMARY_TASK: &'static str = "DAQ1";
    pub const SECONDARY_TASK: &'static str = "DAQ2";

    pub fn primary_channel(&self) -> String {
        format!("{}/{}", self.primary_device, self.channels)
    }

    pub fn secondary_channel(&self) -> String {
        format!("{}/{}", self.secondary_device, self.channels)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.rate > 0.0) || !self.rate.is_finite() {
            return Err(Error::Configuration(format!("invalid sample rate {}", self.rate)));
        }
        if self.samples_per_channel == 0 || u32::try_from(self.samples_per_channel).is_err() {
            return Err(Error::Configuration(format!(
                "invalid samples per channel {}",
                self.samples_per_channel
            )));
        }
        if !(self.min_volts < self.max_volts) {
            return Err(Error::Configuration(format!(
                "empty voltage range [{}, {}]",
                self.min_volts, self.max_volts
            )));
        }
        if self.primary_device == self.secondary_device {
            return Err(Error::Configuration(format!(
                "primary and secondary both use {}",
                self.primary_device
            )));
        }
        if self.read_timeout.is_zero() {
            return Err(Error::Configuration("read timeout must be positive".to_string()));
        }
        Ok(())
    }
}

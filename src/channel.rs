use std::{fmt, str::FromStr};

use crate::error::Error;

/// A contiguous range of analog input lines on one device, written the way
/// the driver expects it: `Dev1/ai0:7` or `Dev1/ai3`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSpec {
    pub device: String,
    pub range: ChannelRange,
}

/// The `ai0:7` part of a [`ChannelSpec`].
///
/// Ranges may be descending (`ai7:0`), the driver then reports the channels
/// in that order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelRange {
    pub first: u32,
    pub last: u32,
}

impl ChannelRange {
    pub fn len(&self) -> usize {
        self.first.abs_diff(self.last) as usize + 1
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    /// Line numbers in the order the driver interleaves them.
    pub fn lines(&self) -> Box<dyn Iterator<Item = u32>> {
        if self.first <= self.last {
            Box::new(self.first..=self.last)
        } else {
            Box::new((self.last..=self.first).rev())
        }
    }
}

impl FromStr for ChannelRange {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || Error::Configuration(format!("malformed channel range '{}'", s));

        let lines = s.trim().strip_prefix("ai").ok_or_else(malformed)?;
        let (first, last) = match lines.split_once(':') {
            Some((first, last)) => (first, last),
            None => (lines, lines),
        };
        let first = first.parse::<u32>().map_err(|_| malformed())?;
        let last = last.parse::<u32>().map_err(|_| malformed())?;

        Ok(ChannelRange { first, last })
    }
}

impl fmt::Display for ChannelRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.first == self.last {
            write!(f, "ai{}", self.first)
        } else {
            write!(f, "ai{}:{}", self.first, self.last)
        }
    }
}

impl ChannelSpec {
    pub fn new(device: impl Into<String>, range: ChannelRange) -> Self {
        ChannelSpec {
            device: device.into(),
            range,
        }
    }

    pub fn channel_count(&self) -> usize {
        self.range.len()
    }
}

impl FromStr for ChannelSpec {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (device, range) = s
            .trim()
            .split_once('/')
            .ok_or_else(|| Error::Configuration(format!("malformed channel '{}'", s)))?;

        if device.is_empty() || !device.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(Error::Configuration(format!(
                "malformed device name in channel '{}'",
                s
            )));
        }

        Ok(ChannelSpec {
            device: device.to_string(),
            range: range.parse()?,
        })
    }
}

impl fmt::Display for ChannelSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.device, self.range)
    }
}

//! The capability set an acquisition backend has to provide.
//!
//! Everything here is modelled after the call surface of a vendor DAQ
//! library: tasks are opaque handles, every call returns a status code, and
//! the human readable diagnostic for the last failure is fetched separately
//! through [`Driver::extended_error_info`].

use std::{fmt, sync::Arc, time::Duration};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskHandle(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Status(pub i32);

impl Status {
    pub const OK: Status = Status(0);

    pub fn is_failure(self) -> bool {
        self.0 < 0
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "status {}", self.0)
    }
}

pub type DriverResult<T> = std::result::Result<T, Status>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TerminalConfig {
    Default,
    /// Referenced single-ended.
    #[default]
    Rse,
    Nrse,
    Differential,
    PseudoDifferential,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Edge {
    #[default]
    Rising,
    Falling,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SampleMode {
    Finite,
    /// Acquire until stopped; `samples_per_channel` sizes the driver buffer.
    #[default]
    Continuous,
}

pub type EveryNCallback = Arc<dyn Fn(TaskHandle, u32) + Send + Sync>;

/// Invoked from the driver's context once a task stops on its own, either
/// because a finite acquisition completed or because of an error.
pub type DoneCallback = Arc<dyn Fn(TaskHandle, Status) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationEvent {
    BufferFilled { task: TaskHandle, frames: u32 },
    TaskFinished { task: TaskHandle, status: Status },
}

/// Capability interface of a hardware acquisition driver.
///
/// Implementations must never invoke a registered callback while holding a
/// lock that any of the methods below also take, and `stop_task` and
/// `clear_task` must not wait for a callback in flight to return.
pub trait Driver: Send + Sync {
    fn create_task(&self, name: &str) -> DriverResult<TaskHandle>;

    fn create_ai_voltage_chan(
        &self,
        task: TaskHandle,
        physical_channel: &str,
        terminal: TerminalConfig,
        min_volts: f64,
        max_volts: f64,
    ) -> DriverResult<()>;

    fn cfg_samp_clk_timing(
        &self,
        task: TaskHandle,
        rate: f64,
        edge: Edge,
        mode: SampleMode,
        samples_per_channel: u64,
    ) -> DriverResult<()>;

    /// Registers the buffer-filled notification. A `None` callback arms the
    /// event without delivering it anywhere.
    fn register_every_n_samples(
        &self,
        task: TaskHandle,
        n: u32,
        callback: Option<EveryNCallback>,
    ) -> DriverResult<()>;

    fn register_done(&self, task: TaskHandle, callback: DoneCallback) -> DriverResult<()>;

    fn start_task(&self, task: TaskHandle) -> DriverResult<()>;

    fn stop_task(&self, task: TaskHandle) -> DriverResult<()>;

    fn clear_task(&self, task: TaskHandle) -> DriverResult<()>;

    /// Reads every available frame, up to what fits into `data`, interleaved
    /// by scan (all channels of frame 0, then frame 1, ...).
    ///
    /// Returns the number of frames read.
    fn read_analog_f64(
        &self,
        task: TaskHandle,
        timeout: Duration,
        data: &mut [f64],
    ) -> DriverResult<usize>;

    fn extended_error_info(&self) -> String;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_negative_status_is_failure() {
        assert!(Status(-200279).is_failure());
        assert!(!Status::OK.is_failure());
        assert!(!Status(200).is_failure());
    }
}

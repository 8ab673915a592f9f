use std::{sync::Arc, time::Duration};

use log::{debug, info, warn};

use crate::{
    buffer::SampleBuffer,
    channel::ChannelSpec,
    driver::{DoneCallback, Driver, Edge, EveryNCallback, SampleMode, Status, TaskHandle, TerminalConfig},
    error::{Error, Result},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Created,
    Configured,
    Running,
    Stopped,
    Cleared,
}

/// One acquisition task inside the driver, bound to a channel group and a
/// sample clock.
///
/// The task is cleared when dropped.
pub struct DeviceTask {
    driver: Arc<dyn Driver>,
    handle: Option<TaskHandle>,
    name: String,
    state: TaskState,
    channel: Option<ChannelSpec>,
    samples_per_channel: usize,
}

impl DeviceTask {
    pub fn create(driver: Arc<dyn Driver>, name: &str) -> Result<DeviceTask> {
        let handle = match driver.create_task(name) {
            Ok(handle) => handle,
            Err(status) => {
                return Err(Error::Driver {
                    code: status.0,
                    message: driver.extended_error_info(),
                });
            }
        };
        info!("created task {} ({:?})", name, handle);

        Ok(DeviceTask {
            driver,
            handle: Some(handle),
            name: name.to_string(),
            state: TaskState::Created,
            channel: None,
            samples_per_channel: 0,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn handle(&self) -> Option<TaskHandle> {
        self.handle
    }

    pub fn channel(&self) -> Option<&ChannelSpec> {
        self.channel.as_ref()
    }

    pub fn channel_count(&self) -> usize {
        self.channel.as_ref().map_or(0, ChannelSpec::channel_count)
    }

    pub fn samples_per_channel(&self) -> usize {
        self.samples_per_channel
    }

    /// A buffer sized for one full read of this task.
    pub fn sample_buffer(&self) -> SampleBuffer {
        SampleBuffer::new(self.samples_per_channel, self.channel_count())
    }

    pub fn add_voltage_channel(
        &mut self,
        channel: &str,
        terminal: TerminalConfig,
        min_volts: f64,
        max_volts: f64,
    ) -> Result<()> {
        let handle = self.expect_state(TaskState::Created)?;
        let spec: ChannelSpec = channel.parse()?;
        if !(min_volts < max_volts) {
            return Err(Error::Configuration(format!(
                "{}: empty voltage range [{}, {}]",
                self.name, min_volts, max_volts
            )));
        }

        self.driver
            .create_ai_voltage_chan(handle, &spec.to_string(), terminal, min_volts, max_volts)
            .map_err(|status| self.rejected(status))?;
        info!(
            "{}: added {} ({:?}, {} V to {} V)",
            self.name, spec, terminal, min_volts, max_volts
        );
        self.channel = Some(spec);
        Ok(())
    }

    pub fn configure_clock(
        &mut self,
        rate: f64,
        edge: Edge,
        mode: SampleMode,
        samples_per_channel: usize,
    ) -> Result<()> {
        let handle = self.expect_state(TaskState::Created)?;
        if self.channel.is_none() {
            return Err(Error::Configuration(format!(
                "{}: no channel to clock",
                self.name
            )));
        }
        if !(rate > 0.0) || !rate.is_finite() {
            return Err(Error::Configuration(format!(
                "{}: invalid sample rate {}",
                self.name, rate
            )));
        }
        if samples_per_channel == 0 {
            return Err(Error::Configuration(format!(
                "{}: samples per channel must be positive",
                self.name
            )));
        }

        self.driver
            .cfg_samp_clk_timing(handle, rate, edge, mode, samples_per_channel as u64)
            .map_err(|status| self.rejected(status))?;
        info!(
            "{}: clock {} Hz, {:?} edge, {:?}, {} samples per channel",
            self.name, rate, edge, mode, samples_per_channel
        );
        self.samples_per_channel = samples_per_channel;
        self.state = TaskState::Configured;
        Ok(())
    }

    pub fn register_every_n(&mut self, n: u32, callback: Option<EveryNCallback>) -> Result<()> {
        let handle = self.expect_state(TaskState::Configured)?;
        self.driver
            .register_every_n_samples(handle, n, callback)
            .map_err(|status| self.rejected(status))
    }

    pub fn register_done(&mut self, callback: DoneCallback) -> Result<()> {
        let handle = self.expect_state(TaskState::Configured)?;
        self.driver
            .register_done(handle, callback)
            .map_err(|status| self.rejected(status))
    }

    pub fn start(&mut self) -> Result<()> {
        let handle = self.expect_state(TaskState::Configured)?;
        self.driver
            .start_task(handle)
            .map_err(|status| self.failed(status))?;
        info!("{}: started", self.name);
        self.state = TaskState::Running;
        Ok(())
    }

    /// Stops a running task. Does nothing in any other state.
    pub fn stop(&mut self) -> Result<()> {
        let (Some(handle), TaskState::Running) = (self.handle, self.state) else {
            return Ok(());
        };
        self.state = TaskState::Stopped;
        self.driver
            .stop_task(handle)
            .map_err(|status| self.failed(status))?;
        info!("{}: stopped", self.name);
        Ok(())
    }

    /// Releases the task inside the driver. Safe to call repeatedly.
    pub fn clear(&mut self) -> Result<()> {
        self.state = TaskState::Cleared;
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        self.driver
            .clear_task(handle)
            .map_err(|status| self.failed(status))?;
        info!("{}: cleared", self.name);
        Ok(())
    }

    /// Reads up to `buffer.capacity()` frames and returns how many arrived.
    pub fn read_into(&self, buffer: &mut SampleBuffer, timeout: Duration) -> Result<usize> {
        let handle = match (self.handle, self.state) {
            (Some(handle), TaskState::Running) => handle,
            _ => {
                return Err(Error::Driver {
                    code: -1,
                    message: format!("{}: read from a task that is not running", self.name),
                });
            }
        };

        let frames = self
            .driver
            .read_analog_f64(handle, timeout, buffer.as_mut_slice())
            .map_err(|status| self.failed(status))?;
        buffer.set_frames(frames);
        debug!("{}: read {} frames", self.name, frames);
        Ok(buffer.frames())
    }

    fn expect_state(&self, state: TaskState) -> Result<TaskHandle> {
        match self.handle {
            Some(handle) if self.state == state => Ok(handle),
            _ => Err(Error::Configuration(format!(
                "{}: expected state {:?}, task is {:?}",
                self.name, state, self.state
            ))),
        }
    }

    fn failed(&self, status: Status) -> Error {
        Error::Driver {
            code: status.0,
            message: self.driver.extended_error_info(),
        }
    }

    fn rejected(&self, status: Status) -> Error {
        Error::Configuration(format!(
            "{}: {} ({})",
            self.name,
            self.driver.extended_error_info(),
            status
        ))
    }
}

impl Drop for DeviceTask {
    fn drop(&mut self) {
        if let Err(e) = self.clear() {
            warn!("{}: failed to clear on drop: {}", self.name, e);
        }
    }
}

//! Drives the two synchronized tasks and turns buffer-filled notifications
//! into records.
//!
//! Both tasks, both sample buffers and the record writer sit behind one
//! lock. A notification holds it for as long as it reads and writes, and so
//! does [`AcquisitionController::shutdown`], so a shutdown requested while a
//! notification is being processed waits for it to complete. Once halted,
//! later notifications return without touching the driver.

use std::{
    io::Write,
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, AtomicU64, Ordering},
        mpsc::Sender,
    },
    time::{Duration, Instant},
};

use log::{debug, error, info, warn};
use parking_lot::Mutex;

use crate::{
    buffer::SampleBuffer,
    config::{AcquisitionConfig, RowPolicy},
    driver::{Driver, NotificationEvent, Status, TaskHandle},
    error::{Error, Result},
    record::RecordWriter,
    task::{DeviceTask, TaskState},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Interrupted,
    /// The primary task completed a finite acquisition.
    Finished,
    Failed,
}

/// Progress counters shared with the console.
#[derive(Debug, Default)]
pub struct Counters {
    last_read: AtomicU64,
    total_secondary: AtomicU64,
    total_primary: AtomicU64,
    rows: AtomicU64,
    errors: AtomicU64,
}

impl Counters {
    /// Frames returned by the latest non-empty secondary read.
    pub fn last_read(&self) -> u64 {
        self.last_read.load(Ordering::Relaxed)
    }

    pub fn total(&self) -> u64 {
        self.total_secondary.load(Ordering::Relaxed)
    }

    pub fn total_primary(&self) -> u64 {
        self.total_primary.load(Ordering::Relaxed)
    }

    pub fn rows(&self) -> u64 {
        self.rows.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }
}

struct Acquisition<W: Write> {
    primary: Option<DeviceTask>,
    secondary: Option<DeviceTask>,
    primary_buf: SampleBuffer,
    secondary_buf: SampleBuffer,
    writer: RecordWriter<W>,
    read_timeout: Duration,
    row_policy: RowPolicy,
    error: Option<Error>,
}

impl<W: Write> Acquisition<W> {
    /// Pulls one notification's worth of frames from both tasks and writes
    /// the rows. Returns the number of rows written.
    fn transfer(&mut self, counters: &Counters) -> Result<usize> {
        let (Some(primary), Some(secondary)) = (&self.primary, &self.secondary) else {
            return Ok(0);
        };
        let primary_frames = primary.read_into(&mut self.primary_buf, self.read_timeout)?;
        counters
            .total_primary
            .fetch_add(primary_frames as u64, Ordering::Relaxed);
        let secondary_frames = secondary.read_into(&mut self.secondary_buf, self.read_timeout)?;
        if secondary_frames == 0 {
            return Ok(0);
        }
        counters
            .last_read
            .store(secondary_frames as u64, Ordering::Relaxed);
        counters
            .total_secondary
            .fetch_add(secondary_frames as u64, Ordering::Relaxed);

        let rows = self.row_policy.rows(primary_frames, secondary_frames);
        let mut written = 0;
        for index in 0..rows {
            let (Some(p), Some(s)) = (self.primary_buf.frame(index), self.secondary_buf.frame(index))
            else {
                break;
            };
            self.writer.write_row(p, s)?;
            counters.rows.fetch_add(1, Ordering::Relaxed);
            written += 1;
        }
        self.writer.flush()?;
        Ok(written)
    }

    /// Stops and clears both tasks. Failures are logged and swallowed.
    fn teardown(&mut self) {
        for task in [&mut self.primary, &mut self.secondary].into_iter().flatten() {
            if let Err(e) = task.stop() {
                warn!("{}: stop failed: {}", task.name(), e);
            }
            if let Err(e) = task.clear() {
                warn!("{}: clear failed: {}", task.name(), e);
            }
        }
    }
}

struct Inner<W: Write> {
    driver: Arc<dyn Driver>,
    acquisition: Mutex<Acquisition<W>>,
    counters: Arc<Counters>,
    halted: AtomicBool,
    stop_tx: Mutex<Option<Sender<StopReason>>>,
}

impl<W: Write + Send + 'static> Inner<W> {
    fn handle(&self, event: NotificationEvent) {
        match event {
            NotificationEvent::BufferFilled { task, frames } => {
                debug!("buffer filled on {:?} ({} frames)", task, frames);
                self.on_buffer_filled();
            }
            NotificationEvent::TaskFinished { task, status } => {
                debug!("task {:?} finished with {}", task, status);
                self.on_task_finished(status);
            }
        }
    }

    fn on_buffer_filled(&self) {
        if self.halted.load(Ordering::Acquire) {
            return;
        }
        let mut guard = self.acquisition.lock();
        if self.halted.load(Ordering::Acquire) {
            return;
        }

        let timer = Instant::now();
        match guard.transfer(&self.counters) {
            Ok(rows) => debug!("wrote {} rows in {:?}", rows, timer.elapsed()),
            Err(e) => self.fail(&mut guard, e),
        }
    }

    fn on_task_finished(&self, status: Status) {
        if !status.is_failure() {
            info!("primary task finished");
            if !self.halted.load(Ordering::Acquire) {
                self.signal(StopReason::Finished);
            }
            return;
        }
        let message = self.driver.extended_error_info();

        let mut guard = self.acquisition.lock();
        if self.halted.swap(true, Ordering::AcqRel) {
            debug!("ignoring task status {} after shutdown", status);
            return;
        }
        let acquisition = &mut *guard;
        for task in [&mut acquisition.primary, &mut acquisition.secondary].into_iter().flatten() {
            if let Err(e) = task.clear() {
                warn!("{}: clear failed: {}", task.name(), e);
            }
        }
        self.report(
            acquisition,
            Error::Driver {
                code: status.0,
                message,
            },
        );
    }

    fn fail(&self, acquisition: &mut Acquisition<W>, e: Error) {
        self.halted.store(true, Ordering::Release);
        acquisition.teardown();
        self.report(acquisition, e);
    }

    fn report(&self, acquisition: &mut Acquisition<W>, e: Error) {
        error!("acquisition error: {}", e);
        self.counters.errors.fetch_add(1, Ordering::Relaxed);
        if acquisition.error.is_none() {
            acquisition.error = Some(e);
        }
        self.signal(StopReason::Failed);
    }

    fn signal(&self, reason: StopReason) {
        if let Some(tx) = self.stop_tx.lock().as_ref() {
            let _ = tx.send(reason);
        }
    }
}

pub struct AcquisitionController<W: Write + Send + 'static> {
    inner: Arc<Inner<W>>,
}

impl<W: Write + Send + 'static> AcquisitionController<W> {
    pub fn new(driver: Arc<dyn Driver>, writer: RecordWriter<W>) -> Self {
        AcquisitionController {
            inner: Arc::new(Inner {
                driver,
                acquisition: Mutex::new(Acquisition {
                    primary: None,
                    secondary: None,
                    primary_buf: SampleBuffer::new(0, 0),
                    secondary_buf: SampleBuffer::new(0, 0),
                    writer,
                    read_timeout: Duration::from_secs(10),
                    row_policy: RowPolicy::Secondary,
                    error: None,
                }),
                counters: Arc::new(Counters::default()),
                halted: AtomicBool::new(false),
                stop_tx: Mutex::new(None),
            }),
        }
    }

    pub fn set_stop_signal(&self, tx: Sender<StopReason>) {
        *self.inner.stop_tx.lock() = Some(tx);
    }

    pub fn counters(&self) -> Arc<Counters> {
        self.inner.counters.clone()
    }

    pub fn is_halted(&self) -> bool {
        self.inner.halted.load(Ordering::Acquire)
    }

    pub fn task_states(&self) -> [Option<TaskState>; 2] {
        let acquisition = self.inner.acquisition.lock();
        [
            acquisition.primary.as_ref().map(DeviceTask::state),
            acquisition.secondary.as_ref().map(DeviceTask::state),
        ]
    }

    pub fn configure(&self, config: &AcquisitionConfig) -> Result<()> {
        config.validate()?;
        let mut guard = self.inner.acquisition.lock();
        if guard.primary.is_some() {
            return Err(Error::Configuration("acquisition is already configured".to_string()));
        }

        let samples = config.samples_per_channel;
        let every_n = u32::try_from(samples)
            .map_err(|_| Error::Configuration(format!("{} samples per channel is too many", samples)))?;

        let mut primary = self.create_task(AcquisitionConfig::PRIMARY_TASK, &config.primary_channel(), config)?;
        let mut secondary =
            self.create_task(AcquisitionConfig::SECONDARY_TASK, &config.secondary_channel(), config)?;

        let weak = Arc::downgrade(&self.inner);
        primary.register_every_n(
            every_n,
            Some(Arc::new(move |task: TaskHandle, frames: u32| {
                deliver(&weak, NotificationEvent::BufferFilled { task, frames })
            })),
        )?;
        secondary.register_every_n(every_n, None)?;

        let weak = Arc::downgrade(&self.inner);
        primary.register_done(Arc::new(move |task: TaskHandle, status: Status| {
            deliver(&weak, NotificationEvent::TaskFinished { task, status })
        }))?;

        guard.primary_buf = primary.sample_buffer();
        guard.secondary_buf = secondary.sample_buffer();
        guard.primary = Some(primary);
        guard.secondary = Some(secondary);
        guard.read_timeout = config.read_timeout;
        guard.row_policy = config.row_policy;
        self.inner.halted.store(false, Ordering::Release);
        Ok(())
    }

    fn create_task(&self, name: &str, channel: &str, config: &AcquisitionConfig) -> Result<DeviceTask> {
        let mut task = DeviceTask::create(self.inner.driver.clone(), name)?;
        task.add_voltage_channel(channel, config.terminal, config.min_volts, config.max_volts)?;
        task.configure_clock(config.rate, config.edge, config.mode, config.samples_per_channel)?;
        Ok(task)
    }

    /// Starts the primary, then the secondary task. If either fails, both
    /// are stopped and cleared before the error is returned.
    pub fn start(&self) -> Result<()> {
        let mut guard = self.inner.acquisition.lock();
        let acquisition = &mut *guard;
        let (Some(primary), Some(secondary)) = (&mut acquisition.primary, &mut acquisition.secondary)
        else {
            return Err(Error::Configuration("acquisition is not configured".to_string()));
        };

        if let Err(e) = primary.start().and_then(|_| secondary.start()) {
            self.inner.halted.store(true, Ordering::Release);
            acquisition.teardown();
            return Err(e);
        }
        Ok(())
    }

    pub fn handle(&self, event: NotificationEvent) {
        self.inner.handle(event);
    }

    pub fn on_buffer_filled(&self) {
        self.inner.on_buffer_filled();
    }

    pub fn on_task_finished(&self, status: Status) {
        self.inner.on_task_finished(status);
    }

    /// Stops and clears both tasks. Waits for a notification in flight and
    /// can be called any number of times.
    pub fn shutdown(&self) {
        let mut guard = self.inner.acquisition.lock();
        self.inner.halted.store(true, Ordering::Release);
        guard.teardown();
    }

    /// Shuts down, closes the record writer and returns the first runtime
    /// error that was reported, if any.
    pub fn finish(&self) -> Result<()> {
        self.shutdown();
        let mut guard = self.inner.acquisition.lock();
        let closed = guard.writer.close();
        match guard.error.take() {
            Some(e) => Err(e),
            None => closed,
        }
    }
}

fn deliver<W: Write + Send + 'static>(weak: &Weak<Inner<W>>, event: NotificationEvent) {
    if let Some(inner) = weak.upgrade() {
        inner.handle(event);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use super::*;
    use crate::sim::{SimCall, SimulatedDriver};

    fn controller(driver: &Arc<SimulatedDriver>) -> AcquisitionController<Vec<u8>> {
        AcquisitionController::new(driver.clone(), RecordWriter::new(Vec::new()))
    }

    #[test]
    fn registers_callbacks_on_primary_only() {
        let driver = Arc::new(SimulatedDriver::manual());
        let controller = controller(&driver);
        controller.configure(&AcquisitionConfig::default()).unwrap();
        controller.start().unwrap();

        driver.acquire("DAQ2", 10);
        driver.notify("DAQ2");
        assert_eq!(driver.count(&SimCall::Read("DAQ2".into())), 0);

        driver.notify("DAQ1");
        assert_eq!(driver.count(&SimCall::Read("DAQ1".into())), 1);
        assert_eq!(driver.count(&SimCall::Read("DAQ2".into())), 1);
        assert_eq!(controller.counters().rows(), 10);
    }

    #[test]
    fn configure_twice_is_rejected() {
        let driver = Arc::new(SimulatedDriver::manual());
        let controller = controller(&driver);
        controller.configure(&AcquisitionConfig::default()).unwrap();
        assert!(matches!(
            controller.configure(&AcquisitionConfig::default()),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn failed_configure_clears_created_tasks() {
        let driver = Arc::new(SimulatedDriver::manual());
        let controller = controller(&driver);
        let config = AcquisitionConfig {
            secondary_device: "Dev7".into(),
            ..Default::default()
        };
        assert!(matches!(controller.configure(&config), Err(Error::Configuration(_))));
        assert_eq!(driver.count(&SimCall::Clear("DAQ1".into())), 1);
        assert_eq!(driver.count(&SimCall::Clear("DAQ2".into())), 1);
        assert_eq!(controller.task_states(), [None, None]);
    }

    #[test]
    fn start_before_configure_fails() {
        let driver = Arc::new(SimulatedDriver::manual());
        assert!(matches!(controller(&driver).start(), Err(Error::Configuration(_))));
    }

    #[test]
    fn empty_secondary_read_writes_nothing() {
        let driver = Arc::new(SimulatedDriver::manual());
        let controller = controller(&driver);
        controller.configure(&AcquisitionConfig::default()).unwrap();
        controller.start().unwrap();

        driver.acquire("DAQ1", 1000);
        controller.on_buffer_filled();
        let counters = controller.counters();
        assert_eq!(counters.rows(), 0);
        assert_eq!(counters.total(), 0);
        assert_eq!(counters.total_primary(), 1000);
    }

    #[test]
    fn successful_finish_status_signals_finished() {
        let driver = Arc::new(SimulatedDriver::manual());
        let controller = controller(&driver);
        let (tx, rx) = mpsc::channel();
        controller.set_stop_signal(tx);
        controller.configure(&AcquisitionConfig::default()).unwrap();
        controller.start().unwrap();

        controller.on_task_finished(Status::OK);
        assert_eq!(rx.try_recv(), Ok(StopReason::Finished));
        assert!(!controller.is_halted());
        assert_eq!(controller.counters().errors(), 0);
        assert_eq!(
            controller.task_states(),
            [Some(TaskState::Running), Some(TaskState::Running)]
        );
        controller.finish().unwrap();
    }

    #[test]
    fn shutdown_without_tasks_is_a_no_op() {
        let driver = Arc::new(SimulatedDriver::manual());
        let controller = controller(&driver);
        controller.shutdown();
        controller.shutdown();
        controller.finish().unwrap();
        assert!(driver.calls().is_empty());
        assert_eq!(controller.task_states(), [None, None]);
    }

    #[test]
    fn notifications_after_shutdown_are_ignored() {
        let driver = Arc::new(SimulatedDriver::manual());
        let controller = controller(&driver);
        let (tx, rx) = mpsc::channel();
        controller.set_stop_signal(tx);
        controller.configure(&AcquisitionConfig::default()).unwrap();
        controller.start().unwrap();
        controller.shutdown();

        controller.on_buffer_filled();
        controller.on_task_finished(Status(-200279));
        assert_eq!(driver.count(&SimCall::Read("DAQ1".into())), 0);
        assert_eq!(controller.counters().errors(), 0);
        assert!(rx.try_recv().is_err());
        controller.finish().unwrap();
    }
}

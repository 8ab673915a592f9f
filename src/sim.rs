//! A software stand-in for the acquisition hardware.
//!
//! [`SimulatedDriver::new`] runs a clock thread per started task that
//! produces sine waves at the configured rate and delivers notifications
//! from that thread, the same way the vendor driver calls back from its own
//! context. [`SimulatedDriver::manual`] has no clock: frames, notifications
//! and faults are injected explicitly with [`SimulatedDriver::acquire`],
//! [`SimulatedDriver::notify`], [`SimulatedDriver::finish`] and the
//! `fail_*` methods.

use std::{
    collections::{HashMap, VecDeque},
    f64::consts::TAU,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use log::{debug, warn};
use parking_lot::Mutex;
use thread_priority::{ThreadPriority, set_current_thread_priority};

use crate::{
    channel::ChannelSpec,
    driver::{
        DoneCallback, Driver, DriverResult, Edge, EveryNCallback, SampleMode, Status, TaskHandle,
        TerminalConfig,
    },
};

pub const ERR_INVALID_TASK: i32 = -200088;
pub const ERR_DUPLICATE_TASK: i32 = -200089;
pub const ERR_DEVICE_NOT_FOUND: i32 = -200220;
pub const ERR_CHANNEL_NOT_FOUND: i32 = -200170;
pub const ERR_INVALID_VALUE: i32 = -200077;
pub const ERR_NOT_CONFIGURED: i32 = -200478;
pub const ERR_NOT_RUNNING: i32 = -200983;
pub const ERR_OVERWRITTEN: i32 = -200279;

pub const LINES_PER_DEVICE: u32 = 16;
pub const MAX_VOLTS: f64 = 10.0;
/// Aggregate sample rate limit of one simulated device, in samples/s.
pub const MAX_AGGREGATE_RATE: f64 = 1_000_000.0;

/// The driver buffer holds this many notification-sized blocks before
/// unread frames are overwritten.
const BUFFER_BLOCKS: u64 = 4;
const TICK: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimCall {
    Create(String),
    Start(String),
    Stop(String),
    Clear(String),
    Read(String),
}

#[derive(Debug, Clone, Copy)]
struct Clock {
    rate: f64,
    mode: SampleMode,
    samples_per_channel: u64,
}

struct SimTask {
    name: String,
    channel: Option<(ChannelSpec, f64, f64)>,
    clock: Option<Clock>,
    every_n: Option<(u32, Option<EveryNCallback>)>,
    done: Option<DoneCallback>,
    running: Arc<AtomicBool>,
    fifo: VecDeque<f64>,
    generated: u64,
    since_event: u64,
    fail_read: Option<i32>,
    fail_start: Option<i32>,
}

impl SimTask {
    fn new(name: &str) -> Self {
        SimTask {
            name: name.to_string(),
            channel: None,
            clock: None,
            every_n: None,
            done: None,
            running: Arc::new(AtomicBool::new(false)),
            fifo: VecDeque::new(),
            generated: 0,
            since_event: 0,
            fail_read: None,
            fail_start: None,
        }
    }

    fn channels(&self) -> usize {
        self.channel.as_ref().map_or(0, |(spec, _, _)| spec.channel_count())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn generate(&mut self, frames: u64) {
        let (Some((spec, min, max)), Some(clock)) = (&self.channel, &self.clock) else {
            return;
        };
        let center = (min + max) / 2.0;
        let amplitude = 0.8 * (max - min) / 2.0;
        let phase = spec.device.bytes().map(f64::from).sum::<f64>() / 10.0;
        let lines: Vec<u32> = spec.range.lines().collect();

        for frame in self.generated..self.generated + frames {
            let t = frame as f64 / clock.rate;
            for &line in &lines {
                let freq = 1.0 + f64::from(line) * 0.5;
                self.fifo
                    .push_back(center + amplitude * (TAU * freq * t + phase).sin());
            }
        }
        self.generated += frames;
        self.since_event += frames;
    }
}

struct Shared {
    tasks: Mutex<HashMap<usize, SimTask>>,
    next_handle: Mutex<usize>,
    devices: Vec<String>,
    last_error: Mutex<String>,
    calls: Mutex<Vec<SimCall>>,
}

impl Shared {
    fn fail(&self, code: i32, message: impl Into<String>) -> Status {
        let message = message.into();
        debug!("simulated driver error {}: {}", code, message);
        *self.last_error.lock() = message;
        Status(code)
    }

    fn record(&self, call: SimCall) {
        self.calls.lock().push(call);
    }

    /// Feeds `frames` new frames into a running task and collects the
    /// notifications that became due. Returns `None` once the task is gone
    /// or no longer running.
    fn produce(&self, handle: usize, frames: u64) -> Option<Vec<Pending>> {
        let mut tasks = self.tasks.lock();
        let task = tasks.get_mut(&handle)?;
        if !task.is_running() {
            return None;
        }
        let clock = task.clock?;

        let frames = match clock.mode {
            SampleMode::Finite => frames.min(clock.samples_per_channel.saturating_sub(task.generated)),
            SampleMode::Continuous => frames,
        };
        task.generate(frames);

        let mut pending = Vec::new();
        if let Some((n, callback)) = &task.every_n {
            let n = u64::from(*n).max(1);
            while task.since_event >= n {
                task.since_event -= n;
                if let Some(callback) = callback {
                    pending.push(Pending::EveryN(callback.clone(), n as u32));
                }
            }
        }

        let channels = task.channels().max(1);
        let capacity = clock.samples_per_channel.max(1) * BUFFER_BLOCKS;
        if clock.mode == SampleMode::Continuous && (task.fifo.len() / channels) as u64 > capacity {
            task.running.store(false, Ordering::Release);
            let status = self.fail(
                ERR_OVERWRITTEN,
                format!(
                    "{}: the application is not able to keep up with the hardware acquisition, \
                     samples were overwritten before they could be read",
                    task.name
                ),
            );
            if let Some(done) = &task.done {
                pending.push(Pending::Done(done.clone(), status));
            }
        } else if clock.mode == SampleMode::Finite && task.generated >= clock.samples_per_channel {
            task.running.store(false, Ordering::Release);
            if let Some(done) = &task.done {
                pending.push(Pending::Done(done.clone(), Status::OK));
            }
        }

        Some(pending)
    }
}

enum Pending {
    EveryN(EveryNCallback, u32),
    Done(DoneCallback, Status),
}

impl Pending {
    fn deliver(self, handle: TaskHandle) {
        match self {
            Pending::EveryN(callback, n) => callback(handle, n),
            Pending::Done(callback, status) => callback(handle, status),
        }
    }
}

pub struct SimulatedDriver {
    shared: Arc<Shared>,
    realtime: bool,
}

impl Default for SimulatedDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedDriver {
    pub fn new() -> Self {
        Self::with_devices(true, &["Dev1", "Dev2", "Dev3"])
    }

    /// A driver without a clock; the caller feeds frames and notifications.
    pub fn manual() -> Self {
        Self::with_devices(false, &["Dev1", "Dev2", "Dev3"])
    }

    pub fn with_devices(realtime: bool, devices: &[&str]) -> Self {
        SimulatedDriver {
            shared: Arc::new(Shared {
                tasks: Mutex::new(HashMap::new()),
                next_handle: Mutex::new(1),
                devices: devices.iter().map(|d| d.to_string()).collect(),
                last_error: Mutex::new(String::new()),
                calls: Mutex::new(Vec::new()),
            }),
            realtime,
        }
    }

    pub fn calls(&self) -> Vec<SimCall> {
        self.shared.calls.lock().clone()
    }

    pub fn count(&self, call: &SimCall) -> usize {
        self.shared.calls.lock().iter().filter(|c| *c == call).count()
    }

    pub fn handle_of(&self, name: &str) -> Option<TaskHandle> {
        self.shared
            .tasks
            .lock()
            .iter()
            .find(|(_, task)| task.name == name)
            .map(|(handle, _)| TaskHandle(*handle))
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.shared
            .tasks
            .lock()
            .values()
            .any(|task| task.name == name && task.is_running())
    }

    /// Pushes `frames` frames into the buffer of a running task without
    /// delivering notifications.
    pub fn acquire(&self, name: &str, frames: u64) {
        let mut tasks = self.shared.tasks.lock();
        if let Some(task) = tasks.values_mut().find(|t| t.name == name && t.is_running()) {
            task.generate(frames);
        }
    }

    /// Delivers the buffer-filled notification of `name` on the calling
    /// thread, if a callback is registered.
    pub fn notify(&self, name: &str) {
        let pending = {
            let tasks = self.shared.tasks.lock();
            tasks.iter().find(|(_, t)| t.name == name).and_then(|(handle, t)| {
                match &t.every_n {
                    Some((n, Some(callback))) => Some((TaskHandle(*handle), callback.clone(), *n)),
                    _ => None,
                }
            })
        };
        if let Some((handle, callback, n)) = pending {
            callback(handle, n);
        }
    }

    /// Stops `name` and delivers its task-finished notification on the
    /// calling thread. A failing `status` also sets the extended error text.
    pub fn finish(&self, name: &str, status: i32) {
        let pending = {
            let tasks = self.shared.tasks.lock();
            tasks.iter().find(|(_, t)| t.name == name).map(|(handle, t)| {
                t.running.store(false, Ordering::Release);
                (TaskHandle(*handle), t.done.clone())
            })
        };
        let status = if status < 0 {
            self.shared
                .fail(status, format!("{}: task stopped with status {}", name, status))
        } else {
            Status(status)
        };
        if let Some((handle, Some(done))) = pending {
            done(handle, status);
        }
    }

    pub fn fail_next_read(&self, name: &str, code: i32) {
        if let Some(task) = self.shared.tasks.lock().values_mut().find(|t| t.name == name) {
            task.fail_read = Some(code);
        }
    }

    pub fn fail_next_start(&self, name: &str, code: i32) {
        if let Some(task) = self.shared.tasks.lock().values_mut().find(|t| t.name == name) {
            task.fail_start = Some(code);
        }
    }

    fn spawn_clock(&self, handle: usize, rate: f64, running: Arc<AtomicBool>) {
        let shared = self.shared.clone();
        let spawned = thread::Builder::new()
            .name(format!("sim-clock-{}", handle))
            .spawn(move || {
                if let Err(e) = set_current_thread_priority(ThreadPriority::Max) {
                    debug!("could not raise clock thread priority: {:?}", e);
                }

                let start = Instant::now();
                let mut emitted = 0u64;
                while running.load(Ordering::Acquire) {
                    thread::sleep(TICK);
                    let due = (start.elapsed().as_secs_f64() * rate) as u64;
                    let frames = due - emitted;
                    emitted = due;

                    let Some(pending) = shared.produce(handle, frames) else {
                        break;
                    };
                    for event in pending {
                        event.deliver(TaskHandle(handle));
                    }
                }
                debug!("clock thread of task {} exiting", handle);
            });
        if let Err(e) = spawned {
            warn!("failed to spawn simulated clock thread: {}", e);
        }
    }
}

impl Driver for SimulatedDriver {
    fn create_task(&self, name: &str) -> DriverResult<TaskHandle> {
        let mut tasks = self.shared.tasks.lock();
        if tasks.values().any(|t| t.name == name) {
            return Err(self
                .shared
                .fail(ERR_DUPLICATE_TASK, format!("task name '{}' is already in use", name)));
        }
        let handle = {
            let mut next = self.shared.next_handle.lock();
            let handle = *next;
            *next += 1;
            handle
        };
        tasks.insert(handle, SimTask::new(name));
        self.shared.record(SimCall::Create(name.to_string()));
        Ok(TaskHandle(handle))
    }

    fn create_ai_voltage_chan(
        &self,
        task: TaskHandle,
        physical_channel: &str,
        _terminal: TerminalConfig,
        min_volts: f64,
        max_volts: f64,
    ) -> DriverResult<()> {
        let mut tasks = self.shared.tasks.lock();
        let sim = tasks
            .get_mut(&task.0)
            .ok_or_else(|| self.shared.fail(ERR_INVALID_TASK, "invalid task handle"))?;

        let spec: ChannelSpec = physical_channel.parse().map_err(|_| {
            self.shared.fail(
                ERR_CHANNEL_NOT_FOUND,
                format!("physical channel '{}' does not exist", physical_channel),
            )
        })?;
        if !self.shared.devices.contains(&spec.device) {
            return Err(self.shared.fail(
                ERR_DEVICE_NOT_FOUND,
                format!("device identifier '{}' is invalid", spec.device),
            ));
        }
        if spec.range.first.max(spec.range.last) >= LINES_PER_DEVICE {
            return Err(self.shared.fail(
                ERR_CHANNEL_NOT_FOUND,
                format!("physical channel '{}' does not exist", physical_channel),
            ));
        }
        if min_volts < -MAX_VOLTS || max_volts > MAX_VOLTS || min_volts >= max_volts {
            return Err(self.shared.fail(
                ERR_INVALID_VALUE,
                format!(
                    "requested range [{}, {}] V is not supported, the device accepts ±{} V",
                    min_volts, max_volts, MAX_VOLTS
                ),
            ));
        }

        sim.channel = Some((spec, min_volts, max_volts));
        Ok(())
    }

    fn cfg_samp_clk_timing(
        &self,
        task: TaskHandle,
        rate: f64,
        _edge: Edge,
        mode: SampleMode,
        samples_per_channel: u64,
    ) -> DriverResult<()> {
        let mut tasks = self.shared.tasks.lock();
        let sim = tasks
            .get_mut(&task.0)
            .ok_or_else(|| self.shared.fail(ERR_INVALID_TASK, "invalid task handle"))?;

        let channels = sim.channels();
        if channels == 0 {
            return Err(self.shared.fail(ERR_NOT_CONFIGURED, "task contains no channels"));
        }
        if !(rate > 0.0) || rate * channels as f64 > MAX_AGGREGATE_RATE {
            return Err(self.shared.fail(
                ERR_INVALID_VALUE,
                format!(
                    "sample rate {} Hz with {} channels exceeds the device maximum of {} S/s",
                    rate, channels, MAX_AGGREGATE_RATE
                ),
            ));
        }
        if samples_per_channel == 0 {
            return Err(self
                .shared
                .fail(ERR_INVALID_VALUE, "samples per channel must be positive"));
        }

        sim.clock = Some(Clock {
            rate,
            mode,
            samples_per_channel,
        });
        Ok(())
    }

    fn register_every_n_samples(
        &self,
        task: TaskHandle,
        n: u32,
        callback: Option<EveryNCallback>,
    ) -> DriverResult<()> {
        let mut tasks = self.shared.tasks.lock();
        let sim = tasks
            .get_mut(&task.0)
            .ok_or_else(|| self.shared.fail(ERR_INVALID_TASK, "invalid task handle"))?;
        if n == 0 {
            return Err(self.shared.fail(ERR_INVALID_VALUE, "every-N count must be positive"));
        }
        sim.every_n = Some((n, callback));
        Ok(())
    }

    fn register_done(&self, task: TaskHandle, callback: DoneCallback) -> DriverResult<()> {
        let mut tasks = self.shared.tasks.lock();
        let sim = tasks
            .get_mut(&task.0)
            .ok_or_else(|| self.shared.fail(ERR_INVALID_TASK, "invalid task handle"))?;
        sim.done = Some(callback);
        Ok(())
    }

    fn start_task(&self, task: TaskHandle) -> DriverResult<()> {
        let (rate, running) = {
            let mut tasks = self.shared.tasks.lock();
            let sim = tasks
                .get_mut(&task.0)
                .ok_or_else(|| self.shared.fail(ERR_INVALID_TASK, "invalid task handle"))?;
            self.shared.record(SimCall::Start(sim.name.clone()));

            if let Some(code) = sim.fail_start.take() {
                return Err(self
                    .shared
                    .fail(code, format!("{}: device could not be started", sim.name)));
            }
            let Some(clock) = sim.clock else {
                return Err(self
                    .shared
                    .fail(ERR_NOT_CONFIGURED, format!("{}: no sample clock configured", sim.name)));
            };
            sim.fifo.clear();
            sim.generated = 0;
            sim.since_event = 0;
            sim.running.store(true, Ordering::Release);
            (clock.rate, sim.running.clone())
        };

        if self.realtime {
            self.spawn_clock(task.0, rate, running);
        }
        Ok(())
    }

    fn stop_task(&self, task: TaskHandle) -> DriverResult<()> {
        let tasks = self.shared.tasks.lock();
        let sim = tasks
            .get(&task.0)
            .ok_or_else(|| self.shared.fail(ERR_INVALID_TASK, "invalid task handle"))?;
        self.shared.record(SimCall::Stop(sim.name.clone()));
        sim.running.store(false, Ordering::Release);
        Ok(())
    }

    fn clear_task(&self, task: TaskHandle) -> DriverResult<()> {
        let sim = self
            .shared
            .tasks
            .lock()
            .remove(&task.0)
            .ok_or_else(|| self.shared.fail(ERR_INVALID_TASK, "invalid task handle"))?;
        self.shared.record(SimCall::Clear(sim.name.clone()));
        sim.running.store(false, Ordering::Release);
        Ok(())
    }

    fn read_analog_f64(
        &self,
        task: TaskHandle,
        _timeout: Duration,
        data: &mut [f64],
    ) -> DriverResult<usize> {
        let mut tasks = self.shared.tasks.lock();
        let sim = tasks
            .get_mut(&task.0)
            .ok_or_else(|| self.shared.fail(ERR_INVALID_TASK, "invalid task handle"))?;
        self.shared.record(SimCall::Read(sim.name.clone()));

        if let Some(code) = sim.fail_read.take() {
            return Err(self
                .shared
                .fail(code, format!("{}: read failed with status {}", sim.name, code)));
        }
        if !sim.is_running() && sim.fifo.is_empty() {
            return Err(self
                .shared
                .fail(ERR_NOT_RUNNING, format!("{}: task is not running", sim.name)));
        }

        let channels = sim.channels();
        if channels == 0 {
            return Ok(0);
        }
        let frames = (sim.fifo.len() / channels).min(data.len() / channels);
        for (slot, value) in data.iter_mut().zip(sim.fifo.drain(..frames * channels)) {
            *slot = value;
        }
        Ok(frames)
    }

    fn extended_error_info(&self) -> String {
        self.shared.last_error.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;

    use super::*;

    fn configured(driver: &SimulatedDriver, name: &str, device: &str) -> TaskHandle {
        let task = driver.create_task(name).unwrap();
        driver
            .create_ai_voltage_chan(task, &format!("{}/ai0:7", device), TerminalConfig::Rse, -10.0, 10.0)
            .unwrap();
        driver
            .cfg_samp_clk_timing(task, 1000.0, Edge::Rising, SampleMode::Continuous, 100)
            .unwrap();
        task
    }

    #[test]
    fn manual_acquire_then_read() {
        let driver = SimulatedDriver::manual();
        let task = configured(&driver, "DAQ1", "Dev1");
        driver.start_task(task).unwrap();
        driver.acquire("DAQ1", 30);

        let mut data = vec![0.0; 8 * 20];
        assert_eq!(driver.read_analog_f64(task, TICK, &mut data).unwrap(), 20);
        assert!(data.iter().all(|v| v.abs() <= MAX_VOLTS));
        assert_eq!(driver.read_analog_f64(task, TICK, &mut data).unwrap(), 10);
        assert_eq!(driver.read_analog_f64(task, TICK, &mut data).unwrap(), 0);
    }

    #[test]
    fn devices_produce_distinct_waveforms() {
        let driver = SimulatedDriver::manual();
        let a = configured(&driver, "DAQ1", "Dev1");
        let b = configured(&driver, "DAQ2", "Dev3");
        driver.start_task(a).unwrap();
        driver.start_task(b).unwrap();
        driver.acquire("DAQ1", 1);
        driver.acquire("DAQ2", 1);

        let mut x = vec![0.0; 8];
        let mut y = vec![0.0; 8];
        driver.read_analog_f64(a, TICK, &mut x).unwrap();
        driver.read_analog_f64(b, TICK, &mut y).unwrap();
        assert_ne!(x, y);
    }

    #[test]
    fn rejects_unknown_device_and_line() {
        let driver = SimulatedDriver::manual();
        let task = driver.create_task("DAQ1").unwrap();

        let err = driver
            .create_ai_voltage_chan(task, "Dev9/ai0:7", TerminalConfig::Rse, -10.0, 10.0)
            .unwrap_err();
        assert_eq!(err, Status(ERR_DEVICE_NOT_FOUND));
        assert!(driver.extended_error_info().contains("Dev9"));

        let err = driver
            .create_ai_voltage_chan(task, "Dev1/ai0:31", TerminalConfig::Rse, -10.0, 10.0)
            .unwrap_err();
        assert_eq!(err, Status(ERR_CHANNEL_NOT_FOUND));
    }

    #[test]
    fn duplicate_names_are_rejected_until_cleared() {
        let driver = SimulatedDriver::manual();
        let task = driver.create_task("DAQ1").unwrap();
        assert_eq!(driver.create_task("DAQ1").unwrap_err(), Status(ERR_DUPLICATE_TASK));
        driver.clear_task(task).unwrap();
        assert!(driver.create_task("DAQ1").is_ok());
    }

    #[test]
    fn injected_read_failure_fires_once() {
        let driver = SimulatedDriver::manual();
        let task = configured(&driver, "DAQ1", "Dev1");
        driver.start_task(task).unwrap();
        driver.fail_next_read("DAQ1", ERR_OVERWRITTEN);

        let mut data = vec![0.0; 8];
        assert_eq!(
            driver.read_analog_f64(task, TICK, &mut data).unwrap_err(),
            Status(ERR_OVERWRITTEN)
        );
        assert!(driver.read_analog_f64(task, TICK, &mut data).is_ok());
    }

    #[test]
    fn realtime_clock_notifies_from_its_own_thread() {
        let driver = SimulatedDriver::new();
        let task = configured(&driver, "DAQ1", "Dev1");

        let fired = Arc::new(AtomicU32::new(0));
        let main_thread = thread::current().id();
        let counter = fired.clone();
        driver
            .register_every_n_samples(
                task,
                10,
                Some(Arc::new(move |_: TaskHandle, n: u32| {
                    assert_eq!(n, 10);
                    assert_ne!(thread::current().id(), main_thread);
                    counter.fetch_add(1, Ordering::Relaxed);
                })),
            )
            .unwrap();
        driver.start_task(task).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while fired.load(Ordering::Relaxed) < 3 && Instant::now() < deadline {
            thread::sleep(TICK);
        }
        driver.stop_task(task).unwrap();
        driver.clear_task(task).unwrap();
        assert!(fired.load(Ordering::Relaxed) >= 3);
    }

    #[test]
    fn finite_task_reports_done() {
        let driver = SimulatedDriver::new();
        let task = driver.create_task("DAQ1").unwrap();
        driver
            .create_ai_voltage_chan(task, "Dev1/ai0", TerminalConfig::Rse, -1.0, 1.0)
            .unwrap();
        driver
            .cfg_samp_clk_timing(task, 1000.0, Edge::Rising, SampleMode::Finite, 20)
            .unwrap();

        let (tx, rx) = std::sync::mpsc::channel();
        driver
            .register_done(task, Arc::new(move |_: TaskHandle, status: Status| {
                let _ = tx.send(status);
            }))
            .unwrap();
        driver.start_task(task).unwrap();

        let status = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(status, Status::OK);
        let mut data = vec![0.0; 100];
        assert_eq!(driver.read_analog_f64(task, TICK, &mut data).unwrap(), 20);
    }
}

use std::{
    fs::File,
    io::{BufWriter, Write},
    sync::{
        Arc,
        mpsc::{self, Receiver, RecvTimeoutError, Sender},
    },
    time::Duration,
};

use chrono::{DateTime, Local};
use log::info;

use crate::{
    config::AcquisitionConfig,
    controller::{AcquisitionController, Counters, StopReason},
    driver::Driver,
    error::{Error, Result},
    record::RecordWriter,
};

/// Lifecycle of one acquisition run.
///
/// ```text
/// Idle → Configured → Running → Stopping → Terminated
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Configured,
    Running,
    Stopping,
    Terminated,
}

/// The main control flow: configure, start, wait for a stop signal, tear
/// down.
///
/// A stop signal is either an interrupt sent through [`Session::stop_handle`]
/// or a runtime error reported by the controller.
pub struct Session<W: Write + Send + 'static> {
    state: SessionState,
    controller: AcquisitionController<W>,
    stop_tx: Sender<StopReason>,
    stop_rx: Receiver<StopReason>,
    started_at: Option<DateTime<Local>>,
}

impl Session<BufWriter<File>> {
    /// Opens the output file named in `config` and configures both tasks.
    pub fn open(driver: Arc<dyn Driver>, config: &AcquisitionConfig) -> Result<Self> {
        let writer = RecordWriter::open(&config.output)?;
        let mut session = Session::new(driver, writer);
        session.configure(config)?;
        Ok(session)
    }
}

impl<W: Write + Send + 'static> Session<W> {
    pub fn new(driver: Arc<dyn Driver>, writer: RecordWriter<W>) -> Self {
        let (stop_tx, stop_rx) = mpsc::channel();
        let controller = AcquisitionController::new(driver, writer);
        controller.set_stop_signal(stop_tx.clone());
        Session {
            state: SessionState::Idle,
            controller,
            stop_tx,
            stop_rx,
            started_at: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn counters(&self) -> Arc<Counters> {
        self.controller.counters()
    }

    pub fn controller(&self) -> &AcquisitionController<W> {
        &self.controller
    }

    /// Sender that makes [`Session::wait`] return.
    pub fn stop_handle(&self) -> Sender<StopReason> {
        self.stop_tx.clone()
    }

    pub fn configure(&mut self, config: &AcquisitionConfig) -> Result<()> {
        self.expect(SessionState::Idle)?;
        self.controller.configure(config)?;
        info!(
            "configured {} and {} at {} Hz",
            config.primary_channel(),
            config.secondary_channel(),
            config.rate
        );
        self.state = SessionState::Configured;
        Ok(())
    }

    pub fn start(&mut self) -> Result<()> {
        self.expect(SessionState::Configured)?;
        self.controller.start()?;
        let now = Local::now();
        info!("acquisition started at {}", now.format("%Y-%m-%d %H:%M:%S"));
        self.started_at = Some(now);
        self.state = SessionState::Running;
        Ok(())
    }

    /// Blocks until a stop signal arrives.
    pub fn wait(&mut self) -> Result<StopReason> {
        self.expect(SessionState::Running)?;
        // The session holds a sender itself, so the channel stays connected.
        let reason = self.stop_rx.recv().unwrap_or(StopReason::Interrupted);
        self.stopping(reason);
        Ok(reason)
    }

    /// Like [`Session::wait`], but gives up after `timeout`.
    pub fn wait_timeout(&mut self, timeout: Duration) -> Result<Option<StopReason>> {
        self.expect(SessionState::Running)?;
        match self.stop_rx.recv_timeout(timeout) {
            Ok(reason) => {
                self.stopping(reason);
                Ok(Some(reason))
            }
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => {
                self.stopping(StopReason::Interrupted);
                Ok(Some(StopReason::Interrupted))
            }
        }
    }

    /// Shuts both tasks down and closes the output.
    ///
    /// From `Running` this passes through `Stopping`. It also serves as the
    /// abort path after a failed `configure` or `start`. Returns the first
    /// runtime error reported during the run.
    pub fn terminate(&mut self) -> Result<()> {
        if self.state == SessionState::Terminated {
            return Ok(());
        }
        if self.state == SessionState::Running {
            self.stopping(StopReason::Interrupted);
        }
        let result = self.controller.finish();
        if let Some(started_at) = self.started_at {
            let elapsed = Local::now().signed_duration_since(started_at);
            info!(
                "acquisition ran for {:.03}s, {} rows written",
                elapsed.num_milliseconds() as f64 / 1000.0,
                self.controller.counters().rows()
            );
        }
        self.state = SessionState::Terminated;
        result
    }

    fn stopping(&mut self, reason: StopReason) {
        info!("stopping: {:?}", reason);
        self.state = SessionState::Stopping;
    }

    fn expect(&self, state: SessionState) -> Result<()> {
        if self.state == state {
            Ok(())
        } else {
            Err(Error::Configuration(format!(
                "session is {:?}, expected {:?}",
                self.state, state
            )))
        }
    }
}

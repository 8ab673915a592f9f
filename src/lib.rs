//! Synchronized two-device analog acquisition.
//!
//! Two hardware tasks sample the same channel range on different devices.
//! Every time the primary task has filled a notification-sized block, both
//! tasks are read and the frames are written side by side, one text line
//! per frame.

pub mod buffer;
pub mod channel;
pub mod config;
pub mod controller;
pub mod driver;
pub mod error;
#[cfg(feature = "nidaqmx")]
pub mod nidaqmx;
pub mod record;
pub mod session;
pub mod sim;
pub mod task;

pub use buffer::SampleBuffer;
pub use config::{AcquisitionConfig, RowPolicy};
pub use controller::{AcquisitionController, Counters, StopReason};
pub use driver::{Driver, NotificationEvent};
pub use error::{Error, Result};
pub use record::RecordWriter;
pub use session::{Session, SessionState};
pub use task::{DeviceTask, TaskState};

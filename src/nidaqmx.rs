//! Binding to the vendor's NI-DAQmx C library.
//!
//! Only built with the `nidaqmx` feature, which links against the installed
//! driver (`NIDAQmx.lib` on Windows, `libnidaqmx.so` on Linux).

use std::{
    collections::HashMap,
    ffi::{CStr, CString, c_char, c_void},
    panic::{AssertUnwindSafe, catch_unwind},
    ptr,
    time::Duration,
};

use log::{error, warn};
use parking_lot::Mutex;

use crate::driver::{
    DoneCallback, Driver, DriverResult, Edge, EveryNCallback, SampleMode, Status, TaskHandle,
    TerminalConfig,
};

type RawTask = *mut c_void;
type EveryNFn = extern "C" fn(RawTask, i32, u32, *mut c_void) -> i32;
type DoneFn = extern "C" fn(RawTask, i32, *mut c_void) -> i32;

const VAL_CFG_DEFAULT: i32 = -1;
const VAL_RSE: i32 = 10083;
const VAL_NRSE: i32 = 10078;
const VAL_DIFF: i32 = 10106;
const VAL_PSEUDO_DIFF: i32 = 12529;
const VAL_VOLTS: i32 = 10348;
const VAL_RISING: i32 = 10280;
const VAL_FALLING: i32 = 10171;
const VAL_FINITE_SAMPS: i32 = 10178;
const VAL_CONT_SAMPS: i32 = 10123;
const VAL_ACQUIRED_INTO_BUFFER: i32 = 1;
const VAL_GROUP_BY_SCAN_NUMBER: u32 = 1;
/// Read everything that is available.
const READ_ALL_AVAILABLE: i32 = -1;
/// An argument that cannot be handed to the library as is.
const ERR_INVALID_ARGUMENT: i32 = -1;

#[cfg_attr(windows, link(name = "NIDAQmx"))]
#[cfg_attr(not(windows), link(name = "nidaqmx"))]
unsafe extern "C" {
    fn DAQmxCreateTask(task_name: *const c_char, task: *mut RawTask) -> i32;
    fn DAQmxCreateAIVoltageChan(
        task: RawTask,
        physical_channel: *const c_char,
        name_to_assign: *const c_char,
        terminal_config: i32,
        min_val: f64,
        max_val: f64,
        units: i32,
        custom_scale_name: *const c_char,
    ) -> i32;
    fn DAQmxCfgSampClkTiming(
        task: RawTask,
        source: *const c_char,
        rate: f64,
        active_edge: i32,
        sample_mode: i32,
        samps_per_chan: u64,
    ) -> i32;
    fn DAQmxRegisterEveryNSamplesEvent(
        task: RawTask,
        event_type: i32,
        n_samples: u32,
        options: u32,
        callback: Option<EveryNFn>,
        callback_data: *mut c_void,
    ) -> i32;
    fn DAQmxRegisterDoneEvent(
        task: RawTask,
        options: u32,
        callback: Option<DoneFn>,
        callback_data: *mut c_void,
    ) -> i32;
    fn DAQmxStartTask(task: RawTask) -> i32;
    fn DAQmxStopTask(task: RawTask) -> i32;
    fn DAQmxClearTask(task: RawTask) -> i32;
    fn DAQmxReadAnalogF64(
        task: RawTask,
        num_samps_per_chan: i32,
        timeout: f64,
        fill_mode: u32,
        read_array: *mut f64,
        array_size_in_samps: u32,
        samps_per_chan_read: *mut i32,
        reserved: *mut u32,
    ) -> i32;
    fn DAQmxGetExtendedErrorInfo(error_string: *mut c_char, buffer_size: u32) -> i32;
}

fn check(code: i32) -> DriverResult<()> {
    if code < 0 {
        Err(Status(code))
    } else {
        if code > 0 {
            warn!("DAQmx warning {}", code);
        }
        Ok(())
    }
}

fn cstring(s: &str) -> DriverResult<CString> {
    CString::new(s).map_err(|_| Status(ERR_INVALID_ARGUMENT))
}

fn array_size(len: usize) -> DriverResult<u32> {
    u32::try_from(len).map_err(|_| Status(ERR_INVALID_ARGUMENT))
}

fn raw(task: TaskHandle) -> RawTask {
    task.0 as RawTask
}

extern "C" fn every_n_trampoline(task: RawTask, _event: i32, n: u32, data: *mut c_void) -> i32 {
    // SAFETY: `data` points into a box owned by `NiDaqmx::callbacks`. The
    // callback may clear its own task, which drops that box, so it runs on
    // a clone of the Arc.
    let callback = unsafe { (*(data as *const EveryNCallback)).clone() };
    if catch_unwind(AssertUnwindSafe(|| callback(TaskHandle(task as usize), n))).is_err() {
        error!("panic in buffer-filled callback");
    }
    0
}

extern "C" fn done_trampoline(task: RawTask, status: i32, data: *mut c_void) -> i32 {
    // SAFETY: see every_n_trampoline.
    let callback = unsafe { (*(data as *const DoneCallback)).clone() };
    if catch_unwind(AssertUnwindSafe(|| callback(TaskHandle(task as usize), Status(status)))).is_err() {
        error!("panic in task-finished callback");
    }
    0
}

#[derive(Default)]
struct Registered {
    every_n: Option<Box<EveryNCallback>>,
    done: Option<Box<DoneCallback>>,
}

/// [`Driver`] backed by the NI-DAQmx library.
#[derive(Default)]
pub struct NiDaqmx {
    callbacks: Mutex<HashMap<usize, Registered>>,
}

impl NiDaqmx {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Driver for NiDaqmx {
    fn create_task(&self, name: &str) -> DriverResult<TaskHandle> {
        let name = cstring(name)?;
        let mut task: RawTask = ptr::null_mut();
        check(unsafe { DAQmxCreateTask(name.as_ptr(), &mut task) })?;
        Ok(TaskHandle(task as usize))
    }

    fn create_ai_voltage_chan(
        &self,
        task: TaskHandle,
        physical_channel: &str,
        terminal: TerminalConfig,
        min_volts: f64,
        max_volts: f64,
    ) -> DriverResult<()> {
        let channel = cstring(physical_channel)?;
        let terminal = match terminal {
            TerminalConfig::Default => VAL_CFG_DEFAULT,
            TerminalConfig::Rse => VAL_RSE,
            TerminalConfig::Nrse => VAL_NRSE,
            TerminalConfig::Differential => VAL_DIFF,
            TerminalConfig::PseudoDifferential => VAL_PSEUDO_DIFF,
        };
        check(unsafe {
            DAQmxCreateAIVoltageChan(
                raw(task),
                channel.as_ptr(),
                c"".as_ptr(),
                terminal,
                min_volts,
                max_volts,
                VAL_VOLTS,
                ptr::null(),
            )
        })
    }

    fn cfg_samp_clk_timing(
        &self,
        task: TaskHandle,
        rate: f64,
        edge: Edge,
        mode: SampleMode,
        samples_per_channel: u64,
    ) -> DriverResult<()> {
        let edge = match edge {
            Edge::Rising => VAL_RISING,
            Edge::Falling => VAL_FALLING,
        };
        let mode = match mode {
            SampleMode::Finite => VAL_FINITE_SAMPS,
            SampleMode::Continuous => VAL_CONT_SAMPS,
        };
        check(unsafe {
            DAQmxCfgSampClkTiming(raw(task), c"".as_ptr(), rate, edge, mode, samples_per_channel)
        })
    }

    fn register_every_n_samples(
        &self,
        task: TaskHandle,
        n: u32,
        callback: Option<EveryNCallback>,
    ) -> DriverResult<()> {
        let mut callbacks = self.callbacks.lock();
        let slot = callbacks.entry(task.0).or_default();
        let boxed = callback.map(Box::new);
        let (function, data): (Option<EveryNFn>, *mut c_void) = match &boxed {
            Some(b) => (Some(every_n_trampoline), &**b as *const EveryNCallback as *mut c_void),
            None => (None, ptr::null_mut()),
        };
        check(unsafe {
            DAQmxRegisterEveryNSamplesEvent(raw(task), VAL_ACQUIRED_INTO_BUFFER, n, 0, function, data)
        })?;
        slot.every_n = boxed;
        Ok(())
    }

    fn register_done(&self, task: TaskHandle, callback: DoneCallback) -> DriverResult<()> {
        let mut callbacks = self.callbacks.lock();
        let slot = callbacks.entry(task.0).or_default();
        let boxed = Box::new(callback);
        let data = &*boxed as *const DoneCallback as *mut c_void;
        check(unsafe { DAQmxRegisterDoneEvent(raw(task), 0, Some(done_trampoline), data) })?;
        slot.done = Some(boxed);
        Ok(())
    }

    fn start_task(&self, task: TaskHandle) -> DriverResult<()> {
        check(unsafe { DAQmxStartTask(raw(task)) })
    }

    fn stop_task(&self, task: TaskHandle) -> DriverResult<()> {
        check(unsafe { DAQmxStopTask(raw(task)) })
    }

    fn clear_task(&self, task: TaskHandle) -> DriverResult<()> {
        let result = check(unsafe { DAQmxClearTask(raw(task)) });
        self.callbacks.lock().remove(&task.0);
        result
    }

    fn read_analog_f64(
        &self,
        task: TaskHandle,
        timeout: Duration,
        data: &mut [f64],
    ) -> DriverResult<usize> {
        let size = array_size(data.len())?;
        let mut read = 0i32;
        check(unsafe {
            DAQmxReadAnalogF64(
                raw(task),
                READ_ALL_AVAILABLE,
                timeout.as_secs_f64(),
                VAL_GROUP_BY_SCAN_NUMBER,
                data.as_mut_ptr(),
                size,
                &mut read,
                ptr::null_mut(),
            )
        })?;
        Ok(read.max(0) as usize)
    }

    fn extended_error_info(&self) -> String {
        let mut buf = [0 as c_char; 2048];
        unsafe { DAQmxGetExtendedErrorInfo(buf.as_mut_ptr(), buf.len() as u32) };
        unsafe { CStr::from_ptr(buf.as_ptr()) }
            .to_string_lossy()
            .into_owned()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    };

    use super::*;

    #[test]
    fn callback_survives_clearing_its_own_task() {
        let registration: Arc<Mutex<Option<Box<EveryNCallback>>>> = Arc::new(Mutex::new(None));
        let frames = Arc::new(AtomicU32::new(0));

        let slot = registration.clone();
        let counter = frames.clone();
        let callback: EveryNCallback = Arc::new(move |_: TaskHandle, n: u32| {
            // What clear_task does to the registration.
            slot.lock().take();
            counter.fetch_add(n, Ordering::SeqCst);
        });
        let boxed = Box::new(callback);
        let data = &*boxed as *const EveryNCallback as *mut c_void;
        *registration.lock() = Some(boxed);

        assert_eq!(every_n_trampoline(ptr::null_mut(), VAL_ACQUIRED_INTO_BUFFER, 1000, data), 0);
        assert_eq!(frames.load(Ordering::SeqCst), 1000);
        assert!(registration.lock().is_none());
    }

    #[test]
    fn oversized_read_buffer_is_rejected() {
        assert_eq!(array_size(8000), Ok(8000));
        assert_eq!(array_size(u32::MAX as usize), Ok(u32::MAX));
        assert_eq!(array_size(u32::MAX as usize + 1), Err(Status(ERR_INVALID_ARGUMENT)));
    }
}

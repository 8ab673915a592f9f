use clap::{Arg, ArgAction, ArgMatches, Command, value_parser};
use daq_sync::{
    AcquisitionConfig, Counters, Driver, RowPolicy, Session, StopReason,
    channel::ChannelRange,
    driver::{Edge, SampleMode, TerminalConfig},
    sim::SimulatedDriver,
};
use status_line::StatusLine;
use std::{
    error::Error,
    fmt::Display,
    path::PathBuf,
    process::exit,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let matches = Command::new("daq-sync")
        .about("Stream two DAQ devices side by side into a text file")
        .arg(
            Arg::new("output")
                .short('o')
                .long("output")
                .value_parser(value_parser!(PathBuf))
                .default_value("data.txt")
                .help("Output file"),
        )
        .arg(
            Arg::new("primary")
                .long("primary")
                .default_value("Dev1")
                .help("Device whose buffer-filled events drive the acquisition"),
        )
        .arg(
            Arg::new("secondary")
                .long("secondary")
                .default_value("Dev3")
                .help("Device read alongside the primary"),
        )
        .arg(
            Arg::new("channels")
                .short('c')
                .long("channels")
                .value_parser(|s: &str| s.parse::<ChannelRange>().map_err(|e| e.to_string()))
                .default_value("ai0:7")
                .help("Analog input lines on both devices"),
        )
        .arg(
            Arg::new("min")
                .long("min")
                .value_parser(value_parser!(f64))
                .allow_negative_numbers(true)
                .default_value("-10.0")
                .help("Minimum input voltage"),
        )
        .arg(
            Arg::new("max")
                .long("max")
                .value_parser(value_parser!(f64))
                .allow_negative_numbers(true)
                .default_value("10.0")
                .help("Maximum input voltage"),
        )
        .arg(
            Arg::new("rate")
                .short('r')
                .long("rate")
                .value_parser(value_parser!(f64))
                .default_value("1000.0")
                .help("Sample rate in Hz"),
        )
        .arg(
            Arg::new("samples")
                .short('n')
                .long("samples")
                .value_parser(value_parser!(usize))
                .default_value("1000")
                .help("Samples per channel read on every notification"),
        )
        .arg(
            Arg::new("terminal")
                .long("terminal")
                .value_parser(["rse", "nrse", "diff", "pseudodiff", "default"])
                .default_value("rse")
                .help("Input terminal configuration"),
        )
        .arg(
            Arg::new("edge")
                .long("edge")
                .value_parser(["rising", "falling"])
                .default_value("rising")
                .help("Sample clock edge"),
        )
        .arg(
            Arg::new("finite")
                .long("finite")
                .action(ArgAction::SetTrue)
                .help("Stop after one block of samples instead of acquiring continuously"),
        )
        .arg(
            Arg::new("timeout")
                .long("timeout")
                .value_parser(value_parser!(f64))
                .default_value("10.0")
                .help("Read timeout in seconds"),
        )
        .arg(
            Arg::new("lockstep")
                .long("lockstep")
                .action(ArgAction::SetTrue)
                .help("Only write frames that both devices delivered"),
        )
        .arg(
            Arg::new("backend")
                .long("backend")
                .value_parser(backends())
                .default_value("sim")
                .help("Acquisition driver"),
        )
        .get_matches();

    let config = config_from(&matches)?;
    let backend = matches
        .get_one::<String>("backend")
        .map_or("sim", String::as_str);
    let driver = open_driver(backend);

    let mut session = Session::open(driver, &config)?;

    #[derive(Clone)]
    struct Progress {
        counters: Arc<Counters>,
    }
    impl Display for Progress {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(
                f,
                "Acquired {} samples. Total {}",
                self.counters.last_read(),
                self.counters.total()
            )
        }
    }
    let progress = Progress {
        counters: session.counters(),
    };

    let stop = session.stop_handle();
    let requested = Arc::new(AtomicBool::new(false));
    ctrlc::set_handler(move || {
        if requested.swap(true, Ordering::Relaxed) {
            eprintln!("Killing...");
            exit(-1);
        }
        let _ = stop.send(StopReason::Interrupted);
    })?;

    if let Err(e) = session.start() {
        eprintln!("Error: {}", e);
        if let Err(e) = session.terminate() {
            log::warn!("teardown after failed start: {}", e);
        }
        eprintln!("End of program");
        exit(1);
    }

    match config.mode {
        SampleMode::Continuous => {
            eprintln!("Acquiring samples continuously. Press Ctrl+C to interrupt")
        }
        SampleMode::Finite => eprintln!(
            "Acquiring {} samples. Press Ctrl+C to interrupt",
            config.samples_per_channel
        ),
    }
    let status = StatusLine::new(progress.clone());
    let reason = session.wait()?;
    drop(status);
    eprintln!("{}", progress);

    let result = session.terminate();
    log::info!("stopped: {:?}", reason);
    if let Err(e) = result {
        eprintln!("Error: {}", e);
        eprintln!("End of program");
        exit(1);
    }
    eprintln!("End of program");
    Ok(())
}

fn backends() -> Vec<&'static str> {
    let mut backends = vec!["sim"];
    if cfg!(feature = "nidaqmx") {
        backends.push("nidaqmx");
    }
    backends
}

fn open_driver(backend: &str) -> Arc<dyn Driver> {
    match backend {
        #[cfg(feature = "nidaqmx")]
        "nidaqmx" => Arc::new(daq_sync::nidaqmx::NiDaqmx::new()),
        _ => Arc::new(SimulatedDriver::new()),
    }
}

fn config_from(matches: &ArgMatches) -> Result<AcquisitionConfig, Box<dyn Error>> {
    let defaults = AcquisitionConfig::default();

    let terminal = match matches.get_one::<String>("terminal").map(String::as_str) {
        Some("nrse") => TerminalConfig::Nrse,
        Some("diff") => TerminalConfig::Differential,
        Some("pseudodiff") => TerminalConfig::PseudoDifferential,
        Some("default") => TerminalConfig::Default,
        _ => TerminalConfig::Rse,
    };
    let edge = match matches.get_one::<String>("edge").map(String::as_str) {
        Some("falling") => Edge::Falling,
        _ => Edge::Rising,
    };
    let timeout = matches
        .get_one::<f64>("timeout")
        .copied()
        .unwrap_or(defaults.read_timeout.as_secs_f64());

    let config = AcquisitionConfig {
        primary_device: matches
            .get_one::<String>("primary")
            .cloned()
            .unwrap_or(defaults.primary_device),
        secondary_device: matches
            .get_one::<String>("secondary")
            .cloned()
            .unwrap_or(defaults.secondary_device),
        channels: matches
            .get_one::<ChannelRange>("channels")
            .copied()
            .unwrap_or(defaults.channels),
        terminal,
        min_volts: matches.get_one::<f64>("min").copied().unwrap_or(defaults.min_volts),
        max_volts: matches.get_one::<f64>("max").copied().unwrap_or(defaults.max_volts),
        rate: matches.get_one::<f64>("rate").copied().unwrap_or(defaults.rate),
        edge,
        mode: if matches.get_flag("finite") {
            SampleMode::Finite
        } else {
            SampleMode::Continuous
        },
        samples_per_channel: matches
            .get_one::<usize>("samples")
            .copied()
            .unwrap_or(defaults.samples_per_channel),
        read_timeout: Duration::try_from_secs_f64(timeout)
            .map_err(|e| format!("invalid timeout {}: {}", timeout, e))?,
        row_policy: if matches.get_flag("lockstep") {
            RowPolicy::Lockstep
        } else {
            RowPolicy::Secondary
        },
        output: matches
            .get_one::<PathBuf>("output")
            .cloned()
            .unwrap_or(defaults.output),
    };
    config.validate()?;
    Ok(config)
}

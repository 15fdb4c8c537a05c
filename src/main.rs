use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{bail, Result};
use clap::Parser;
use log::{error, info, warn, LevelFilter};

use phcsync::boot::{self, ClockRef};
use phcsync::clock::{ClockAdj, LinuxClockAdj};
use phcsync::engine::{self, ClockContext, LoopMode, PmcHandle};
use phcsync::leap::LeapTracker;
use phcsync::pmc::{Pmc, UnixTransport};
use phcsync::servo::PiServo;

/// Synchronizes a local clock to a master clock or PPS signal via frequency
/// steering (see `-h` for the full option list).
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Slave clock: a device path or `CLOCK_REALTIME`.
    #[arg(short = 'c', long, default_value = "CLOCK_REALTIME")]
    clock: String,

    /// PPS device; presence enables the PPS loop.
    #[arg(short = 'd', long)]
    pps_device: Option<String>,

    /// Master clock: a device path or `CLOCK_REALTIME`.
    #[arg(short = 's', long)]
    source: Option<String>,

    /// Interface name used to auto-discover the master PHC.
    #[arg(short = 'i', long)]
    interface: Option<String>,

    /// PI proportional gain.
    #[arg(short = 'P', long, default_value_t = 0.7)]
    kp: f64,

    /// PI integral gain.
    #[arg(short = 'I', long, default_value_t = 0.3)]
    ki: f64,

    /// Step threshold in ns; disabled (no stepping) when absent.
    #[arg(short = 'S', long)]
    step_threshold_ns: Option<i64>,

    /// Slave update rate in Hz.
    #[arg(short = 'R', long, default_value_t = 1)]
    rate: u32,

    /// Master readings per sample.
    #[arg(short = 'N', long, default_value_t = 5)]
    n_samples: u32,

    /// Forced sync offset in seconds; forces direction = -1.
    #[arg(short = 'O', long)]
    forced_offset: Option<i64>,

    /// Batch window size for stats; 0 disables batching.
    #[arg(short = 'u', long, default_value_t = 0)]
    stats_max_count: u64,

    /// Wait for the external PTP daemon via the management protocol.
    #[arg(short = 'w', long, default_value_t = false)]
    wait_sync: bool,

    /// Fold leap seconds into the servo offset instead of the kernel.
    #[arg(short = 'x', long, default_value_t = false)]
    fold_leap: bool,

    /// Log level.
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,

    /// Verbose: send console output to stderr at debug level.
    #[arg(short = 'm', long, default_value_t = false)]
    verbose: bool,

    /// Disable syslog.
    #[arg(short = 'q', long, default_value_t = false)]
    no_syslog: bool,
}

fn init_logging(args: &Args) {
    let level = if args.verbose {
        LevelFilter::Debug
    } else {
        args.log_level.parse().unwrap_or(LevelFilter::Info)
    };

    if args.no_syslog {
        env_logger::builder().format_timestamp_millis().filter_level(level).init();
        return;
    }

    let formatter = syslog::Formatter3164 {
        facility: syslog::Facility::LOG_DAEMON,
        hostname: None,
        process: "phcsync".into(),
        pid: std::process::id(),
    };
    match syslog::unix(formatter) {
        Ok(writer) => {
            let logger = syslog::BasicLogger::new(writer);
            if log::set_boxed_logger(Box::new(logger)).is_ok() {
                log::set_max_level(level);
                return;
            }
        }
        Err(e) => eprintln!("syslog unavailable ({}), falling back to stderr", e),
    }
    env_logger::builder().format_timestamp_millis().filter_level(level).init();
}

fn open_master(args: &Args) -> Result<Option<ClockRef>> {
    if let Some(path) = &args.source {
        return Ok(Some(boot::resolve_clock(path)?));
    }
    if let Some(ifname) = &args.interface {
        let path = boot::discover_phc_for_interface(ifname)?;
        let path_str = path.to_string_lossy().into_owned();
        return Ok(Some(boot::resolve_clock(&path_str)?));
    }
    Ok(None)
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args);
    info!("phcsync starting, v{}", env!("CARGO_PKG_VERSION"));

    let slave = boot::resolve_clock(&args.clock)?;
    let master = open_master(&args)?;

    // Invariant 2: a PPS-source configuration requires the slave to be the
    // real-time clock.
    if args.pps_device.is_some() && !slave.is_realtime() {
        bail!("-d requires the slave clock (-c) to be CLOCK_REALTIME");
    }
    // Invariant 3: at least one of {PPS device, master clock handle}.
    if args.pps_device.is_none() && master.is_none() {
        bail!("at least one of -d or -s/-i must be given");
    }

    let pps_fd = args.pps_device.as_deref().map(boot::open_pps).transpose()?;

    let clock = LinuxClockAdj::open(slave.clockid())?;
    run_with_clock(args, slave, master, pps_fd, clock)
}

fn run_with_clock(args: Args, slave: ClockRef, master: Option<ClockRef>, pps_fd: Option<i32>, mut clock: LinuxClockAdj) -> Result<()> {
    let initial_freq = clock.get_freq();
    clock.set_freq(initial_freq)?; // invariant 1: read, then re-assert, before the servo exists.
    let servo = PiServo::with_initial_freq(args.kp, args.ki, args.step_threshold_ns, -initial_freq);

    let slave_is_rtc = slave.is_realtime();
    let master_is_rtc = master.as_ref().map(|m| m.is_realtime()).unwrap_or(false);
    let kernel_leap = !args.fold_leap;

    let local_socket_path = PathBuf::from(format!("/run/phcsync-{}.sock", std::process::id()));
    let peer_socket_path = PathBuf::from("/var/run/phc2sys");

    let (mut management_sync_offset, mut management_leap): (i64, i8) = (0, 0);
    let mut bootstrap_pmc: Option<(Pmc, UnixTransport)> = None;
    if args.wait_sync {
        match UnixTransport::connect(&local_socket_path, &peer_socket_path) {
            Ok(transport) => {
                let mut pmc = Pmc::new();
                let mut t = transport;
                if let Err(e) = boot::wait_sync(&mut pmc, &mut t, &mut management_sync_offset, &mut management_leap) {
                    warn!("wait_sync bootstrap failed: {}", e);
                }
                bootstrap_pmc = Some((pmc, t));
            }
            Err(e) => warn!("could not open management transport: {}", e),
        }
    }

    let (mut leap_tracker, close_pmc): (LeapTracker, bool) =
        boot::build_leap_tracker(args.forced_offset, management_sync_offset, slave_is_rtc, master_is_rtc, kernel_leap);
    leap_tracker.leap = management_leap;

    let pmc_handle = if close_pmc {
        None
    } else {
        bootstrap_pmc.map(|(pmc, transport)| PmcHandle {
            pmc,
            transport,
            wait_sync: false,
            get_utc_offset: true,
        })
    };

    let source_label: &'static str = if pps_fd.is_some() {
        "pps"
    } else if slave_is_rtc {
        "sys"
    } else {
        "phc"
    };

    let mut ctx: ClockContext<LinuxClockAdj, PiServo, UnixTransport> =
        ClockContext::new(clock, servo, source_label, args.stats_max_count, leap_tracker, pmc_handle);

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        info!("signal received, exiting");
        r.store(false, Ordering::SeqCst);
        std::process::exit(0);
    })?;

    let companion_phc = match (pps_fd, &master) {
        (Some(_), Some(m)) => Some((slave.clockid(), m.clockid(), args.n_samples)),
        _ => None,
    };
    let sysoff_probe_fd = if slave_is_rtc { master.as_ref().and_then(|m| m.fd()) } else { None };
    // read_phc's offset convention is reference-minus-source (spec §4.2); the
    // slave is the clock being steered, so it is the reference and the
    // master is the source, matching the SYSOFF and PPS-companion paths.
    let source = master.as_ref().map(|m| m.clockid()).unwrap_or_else(|| slave.clockid());

    let mode = engine::select_mode(pps_fd, companion_phc, slave_is_rtc, sysoff_probe_fd, slave.clockid(), source, args.rate, args.n_samples);

    match &mode {
        LoopMode::Pps { .. } => info!("running PPS loop"),
        LoopMode::Sysoff { .. } => info!("running SYSOFF loop at {}Hz", args.rate),
        LoopMode::Phc { .. } => info!("running PHC loop at {}Hz", args.rate),
    }

    if let Err(e) = engine::run(&mut ctx, &mode) {
        error!("fatal: {}", e);
        std::process::exit(1);
    }

    Ok(())
}

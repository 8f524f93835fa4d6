use std::path::PathBuf;

use chrono::Utc;
use clap::Parser;
use log::{LevelFilter, error, info, warn};

use mtklog::config;
use mtklog::datalog::scanner::{LogScanner, ScanItem};
use mtklog::datalog::{LogImage, LogMode};
use mtklog::gpx::{self, GpxOptions};
use mtklog::kml;
use mtklog::memory;
use mtklog::models::ModelProfile;
use mtklog::probe;
use mtklog::session::PmtkSession;
use mtklog::transport::SerialPort;

#[derive(Parser, Debug)]
#[command(version, about = "Download and decode GPS track logs from MTK-based loggers")]
struct Args {
    /// Serial port of the logger (autodiscovered when omitted)
    #[arg(short, long)]
    port: Option<PathBuf>,

    /// Port speed (the fastest working speed is probed when omitted)
    #[arg(short, long)]
    speed: Option<u32>,

    /// Dump raw flash memory to this file
    #[arg(short = 'd', long, value_name = "FILE")]
    dump: Option<PathBuf>,

    /// Parse a previously dumped flash image instead of talking to a device
    #[arg(short = 'b', long, value_name = "FILE")]
    bin: Option<PathBuf>,

    /// Write a GPX file with tracks and waypoints
    #[arg(short = 'g', long, value_name = "FILE")]
    gpx: Option<PathBuf>,

    /// Write a GPX file with tracks only
    #[arg(long, value_name = "FILE")]
    tracks: Option<PathBuf>,

    /// Write a GPX file with waypoints only
    #[arg(long, value_name = "FILE")]
    waypoints: Option<PathBuf>,

    /// Write a KML file
    #[arg(long, value_name = "FILE")]
    kml: Option<PathBuf>,

    /// Erase the logger memory and exit
    #[arg(long)]
    erase: bool,

    /// Set the memory-full behaviour and exit
    #[arg(long, value_enum, value_name = "MODE")]
    full: Option<FullMode>,

    /// Set logging criteria as <seconds>:<metres>:<km/h> and exit (0 disables one)
    #[arg(long, value_name = "T:D:S")]
    log: Option<String>,

    /// Keep decoding past record checksum mismatches
    #[arg(long)]
    lenient: bool,

    /// Log verbosity (error, warn, info, debug, trace)
    #[arg(long, value_name = "LEVEL", default_value = "info")]
    debug: LevelFilter,

    /// Optional TOML config file with port/speed defaults
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum FullMode {
    Stop,
    Overlap,
}

fn parse_criteria(text: &str) -> Result<(f64, f64, f64), String> {
    let parts: Vec<&str> = text.split(':').collect();
    let [period, distance, speed] = parts.as_slice() else {
        return Err(format!("expected <seconds>:<metres>:<km/h>, got '{text}'"));
    };
    let parse = |p: &str| {
        p.parse::<f64>()
            .map_err(|_| format!("'{p}' is not a number"))
    };
    Ok((parse(period)?, parse(distance)?, parse(speed)?))
}

async fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let config = match &args.config {
        Some(path) => config::parse_config(path).await?,
        None => config::Config::default(),
    };
    let lenient = args.lenient || config.lenient;
    let wants_output = args.gpx.is_some()
        || args.tracks.is_some()
        || args.waypoints.is_some()
        || args.kml.is_some();

    let (image, profile) = if let Some(bin) = &args.bin {
        info!("reading flash image from {}", bin.display());
        let data = tokio::fs::read(bin).await?;
        (LogImage::from_bytes(data), ModelProfile::MTK)
    } else {
        let port_arg = args.port.clone().or_else(|| config.port.clone().map(PathBuf::from));
        let (port_path, speed) = match (port_arg, args.speed.or(config.speed)) {
            (Some(path), Some(speed)) => (path, speed),
            (Some(path), None) => {
                let speed = probe::detect_max_speed(&path).await?;
                (path, speed)
            }
            (None, _) => probe::find_device().await?,
        };
        info!("using {} at {speed} baud", port_path.display());

        let port = SerialPort::open(&port_path, speed)?;
        let mut session = PmtkSession::new(port);
        if !probe::handshake(&mut session).await? {
            return Err("device did not answer the PMTK test command".into());
        }
        let device = probe::identify(&mut session).await?;

        if args.erase {
            info!("erasing logger memory");
            if !session.erase_log().await? {
                return Err("device did not acknowledge the erase command".into());
            }
            info!("logger memory erased");
            return Ok(());
        }
        if let Some(mode) = args.full {
            let mode = match mode {
                FullMode::Stop => LogMode::Stop,
                FullMode::Overlap => LogMode::Overlap,
            };
            if !session.set_log_mode(mode).await? {
                return Err("device did not acknowledge the mode change".into());
            }
            info!("memory-full behaviour set to {mode:?}");
            return Ok(());
        }
        if let Some(criteria) = &args.log {
            let (period, distance, speed) = parse_criteria(criteria)?;
            if !session.set_log_criteria(period, distance, speed).await? {
                return Err("device did not acknowledge the logging criteria".into());
            }
            info!("logging criteria set to {period} s / {distance} m / {speed} km/h");
            return Ok(());
        }

        if !wants_output && args.dump.is_none() {
            // identity query output is the result
            return Ok(());
        }

        let image = memory::download(&mut session, &device, |read, expected| {
            let percent = read as f64 * 100.0 / expected as f64;
            print!("\rSaved log data: {percent:6.2}%");
            let _ = std::io::Write::flush(&mut std::io::stdout());
        })
        .await?;
        println!();

        // the image always lands on disk before any decoding, so a parse
        // failure never loses captured data
        let dump_path = args
            .dump
            .clone()
            .unwrap_or_else(|| PathBuf::from("mtklog.bin"));
        tokio::fs::write(&dump_path, &image.data).await?;
        info!("wrote {} bytes to {}", image.data.len(), dump_path.display());
        if !wants_output {
            return Ok(());
        }

        (image, ModelProfile::for_model(&device.model_id))
    };

    if args.bin.is_some() && args.dump.is_some() {
        warn!("--dump is ignored when parsing an existing file");
    }

    let mut scanner = LogScanner::new(&image, profile, lenient);
    let mut items: Vec<ScanItem> = Vec::new();
    let mut scan_error = None;
    for item in &mut scanner {
        match item {
            Ok(item) => items.push(item),
            Err(e) => {
                error!("{e}");
                scan_error = Some(e);
                break;
            }
        }
    }
    info!(
        "decoded {} records ({} checksum failures)",
        scanner.total_records(),
        scanner.checksum_failures()
    );

    let timestamp = Utc::now();
    if let Some(path) = &args.gpx {
        let mut file = tokio::fs::File::create(path).await?;
        let opts = GpxOptions {
            tracks: true,
            waypoints: true,
            timestamp,
        };
        gpx::write_gpx(&mut file, &items, &opts).await?;
        info!("wrote GPX to {}", path.display());
    }
    if let Some(path) = &args.tracks {
        let mut file = tokio::fs::File::create(path).await?;
        let opts = GpxOptions {
            tracks: true,
            waypoints: false,
            timestamp,
        };
        gpx::write_gpx(&mut file, &items, &opts).await?;
        info!("wrote GPX tracks to {}", path.display());
    }
    if let Some(path) = &args.waypoints {
        let mut file = tokio::fs::File::create(path).await?;
        let opts = GpxOptions {
            tracks: false,
            waypoints: true,
            timestamp,
        };
        gpx::write_gpx(&mut file, &items, &opts).await?;
        info!("wrote GPX waypoints to {}", path.display());
    }
    if let Some(path) = &args.kml {
        let mut file = tokio::fs::File::create(path).await?;
        kml::write_kml(&mut file, &items).await?;
        info!("wrote KML to {}", path.display());
    }

    // outputs above still carry everything decoded before the error
    if let Some(e) = scan_error {
        return Err(e.into());
    }
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let args = Args::parse();
    env_logger::Builder::new().filter_level(args.debug).init();

    if let Err(e) = run(args).await {
        error!("{e}");
        std::process::exit(1);
    }
}

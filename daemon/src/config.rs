//! Daemon settings: CLI flags layered over an optional TOML file

use std::fs;
use std::path::{Path, PathBuf};

use ambilight_consumer::filter::DEFAULT_TAU;
use ambilight_consumer::layout::{DEFAULT_HEIGHT, DEFAULT_WIDTH};
use ambilight_consumer::pipeline::DEFAULT_ACQUIRE_TIMEOUT;
use ambilight_consumer::shm::{DEFAULT_SEGMENT_NAME, DEFAULT_SEMAPHORE_NAME};
use ambilight_consumer::{
    Duration, FirstTick, FrameLayout, PerimeterLayout, PipelineConfig, SmootherConfig,
    TickCadence,
};
use anyhow::{Context, Result, bail};
use clap::{Parser, ValueEnum};
use serde::Deserialize;

/// Diagnostic sink logs every this many frames unless configured
const DEFAULT_LOG_EVERY: usize = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SinkKind {
    /// Log frames as hex rows
    Diagnostic,
    /// Stream raw RGB bytes into a device node or FIFO
    Device,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FirstTickArg {
    /// Show the first frame immediately
    Snap,
    /// Fade in from black
    Fade,
}

impl From<FirstTickArg> for FirstTick {
    fn from(arg: FirstTickArg) -> Self {
        match arg {
            FirstTickArg::Snap => Self::Snap,
            FirstTickArg::Fade => Self::FadeFromBlack,
        }
    }
}

/// Ambilight consumer - reads LED frames from shared memory and drives the strip
#[derive(Parser, Debug)]
#[command(name = "ambilight-daemon", version, long_about = None)]
pub struct Args {
    /// TOML config file; flags given on the command line take precedence
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Shared memory segment name
    #[arg(long)]
    pub shm_name: Option<String>,

    /// Semaphore name
    #[arg(long)]
    pub sem_name: Option<String>,

    /// Screen perimeter width in pixels
    #[arg(long, conflicts_with = "pixels")]
    pub width: Option<usize>,

    /// Screen perimeter height in pixels
    #[arg(long, conflicts_with = "pixels")]
    pub height: Option<usize>,

    /// Total pixel count, for strips not wired around a screen
    #[arg(long)]
    pub pixels: Option<usize>,

    /// Smoothing time constant in seconds
    #[arg(long)]
    pub tau: Option<f32>,

    /// Output sink
    #[arg(long, value_enum)]
    pub sink: Option<SinkKind>,

    /// Device node or FIFO for the device sink
    #[arg(long)]
    pub device: Option<PathBuf>,

    /// Tick cadence: `free`, `delay:<ms>` or `fps:<n>`
    #[arg(long, value_parser = parse_cadence)]
    pub cadence: Option<TickCadence>,

    /// Bound on each semaphore wait in milliseconds (0 waits forever)
    #[arg(long)]
    pub acquire_timeout_ms: Option<u64>,

    /// Log tick latency statistics (`--monitor false` overrides the file)
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    pub monitor: Option<bool>,

    /// First frame behavior
    #[arg(long, value_enum)]
    pub first_tick: Option<FirstTickArg>,

    /// Log every n-th frame with the diagnostic sink
    #[arg(long)]
    pub log_every: Option<usize>,

    /// Enable verbose logging
    #[arg(short, long, default_value_t = false)]
    pub verbose: bool,
}

/// Config file contents, every key optional
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub shm_name: Option<String>,
    pub sem_name: Option<String>,
    pub width: Option<usize>,
    pub height: Option<usize>,
    pub pixels: Option<usize>,
    pub tau: Option<f32>,
    pub sink: Option<SinkKind>,
    pub device: Option<PathBuf>,
    pub cadence: Option<String>,
    pub acquire_timeout_ms: Option<u64>,
    pub monitor: Option<bool>,
    pub first_tick: Option<FirstTickArg>,
    pub log_every: Option<usize>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("invalid config file {}", path.display()))
    }

    fn parse(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SinkChoice {
    Diagnostic { log_every: usize },
    Device(PathBuf),
}

/// Fully resolved daemon settings
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub segment: String,
    pub semaphore: String,
    pub perimeter: Option<PerimeterLayout>,
    pub pipeline: PipelineConfig,
    pub sink: SinkChoice,
    pub monitor: bool,
}

impl Settings {
    /// Resolve CLI flags over file values over defaults
    pub fn resolve(args: Args, file: FileConfig) -> Result<Self> {
        // Any CLI geometry flag overrides every geometry key of the file
        let cli_geometry = args.pixels.is_some() || args.width.is_some() || args.height.is_some();
        let pixels = if cli_geometry { args.pixels } else { file.pixels };
        let (layout, perimeter) = match pixels {
            Some(0) => bail!("pixel count must be positive"),
            Some(pixels) => (FrameLayout::new(pixels), None),
            None => {
                let width = args.width.or(file.width).unwrap_or(DEFAULT_WIDTH);
                let height = args.height.or(file.height).unwrap_or(DEFAULT_HEIGHT);
                if width == 0 || height == 0 {
                    bail!("perimeter of {width}x{height} has no pixels");
                }
                let perimeter = PerimeterLayout::new(width, height);
                (perimeter.frame_layout(), Some(perimeter))
            }
        };

        let tau = args.tau.or(file.tau).unwrap_or(DEFAULT_TAU);
        if !tau.is_finite() || tau < 0.0 {
            bail!("tau must be a non-negative number of seconds, got {tau}");
        }
        let first_tick = args
            .first_tick
            .or(file.first_tick)
            .map(FirstTick::from)
            .unwrap_or_default();

        let cadence = match (args.cadence, file.cadence) {
            (Some(cadence), _) => cadence,
            (None, Some(text)) => parse_cadence(&text).map_err(anyhow::Error::msg)?,
            (None, None) => TickCadence::default(),
        };

        let acquire_timeout = match args.acquire_timeout_ms.or(file.acquire_timeout_ms) {
            Some(0) => None,
            Some(ms) => Some(Duration::from_millis(ms)),
            None => Some(DEFAULT_ACQUIRE_TIMEOUT),
        };

        let sink = match args.sink.or(file.sink).unwrap_or(SinkKind::Diagnostic) {
            SinkKind::Diagnostic => SinkChoice::Diagnostic {
                log_every: args
                    .log_every
                    .or(file.log_every)
                    .unwrap_or(DEFAULT_LOG_EVERY),
            },
            SinkKind::Device => match args.device.or(file.device) {
                Some(path) => SinkChoice::Device(path),
                None => bail!("the device sink needs a --device path"),
            },
        };

        Ok(Self {
            segment: args
                .shm_name
                .or(file.shm_name)
                .unwrap_or_else(|| DEFAULT_SEGMENT_NAME.to_owned()),
            semaphore: args
                .sem_name
                .or(file.sem_name)
                .unwrap_or_else(|| DEFAULT_SEMAPHORE_NAME.to_owned()),
            perimeter,
            pipeline: PipelineConfig {
                layout,
                smoother: SmootherConfig { tau, first_tick },
                acquire_timeout,
                cadence,
            },
            sink,
            monitor: args.monitor.or(file.monitor).unwrap_or(false),
        })
    }
}

/// Parse `free`, `delay:<ms>` or `fps:<n>`
pub fn parse_cadence(text: &str) -> Result<TickCadence, String> {
    let text = text.trim();
    if text == "free" {
        return Ok(TickCadence::FreeRunning);
    }
    if let Some(ms) = text.strip_prefix("delay:") {
        let ms = ms
            .parse::<u64>()
            .map_err(|err| format!("invalid delay `{ms}`: {err}"))?;
        return Ok(TickCadence::FixedDelay(Duration::from_millis(ms)));
    }
    if let Some(fps) = text.strip_prefix("fps:") {
        return match fps.parse::<u32>() {
            Ok(0) => Err("fps must be positive".to_owned()),
            Ok(fps) => Ok(TickCadence::TargetFps(fps)),
            Err(err) => Err(format!("invalid fps `{fps}`: {err}")),
        };
    }
    Err(format!(
        "unknown cadence `{text}`, expected `free`, `delay:<ms>` or `fps:<n>`"
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(argv: &[&str]) -> Args {
        Args::parse_from(std::iter::once("ambilight-daemon").chain(argv.iter().copied()))
    }

    #[test]
    fn test_defaults() {
        let settings = Settings::resolve(args(&[]), FileConfig::default()).unwrap();

        assert_eq!(settings.segment, "/shm_leds");
        assert_eq!(settings.semaphore, "/sem_leds");
        assert_eq!(settings.pipeline.layout.pixel_count(), 104);
        assert_eq!(settings.perimeter, Some(PerimeterLayout::new(32, 20)));
        assert_eq!(settings.pipeline, PipelineConfig::default());
        assert_eq!(
            settings.sink,
            SinkChoice::Diagnostic {
                log_every: DEFAULT_LOG_EVERY
            }
        );
        assert!(!settings.monitor);
    }

    #[test]
    fn test_cli_overrides_file() {
        let file = FileConfig::parse(
            r#"
            shm_name = "/from_file"
            tau = 0.2
            cadence = "fps:30"
            acquire_timeout_ms = 0
            first_tick = "fade"
            monitor = true
            "#,
        )
        .unwrap();
        let settings = Settings::resolve(args(&["--tau", "0.1", "--pixels", "10"]), file).unwrap();

        assert_eq!(settings.segment, "/from_file");
        assert!((settings.pipeline.smoother.tau - 0.1).abs() < f32::EPSILON);
        assert_eq!(settings.pipeline.smoother.first_tick, FirstTick::FadeFromBlack);
        assert_eq!(settings.pipeline.cadence, TickCadence::TargetFps(30));
        assert_eq!(settings.pipeline.acquire_timeout, None);
        assert_eq!(settings.pipeline.layout, FrameLayout::new(10));
        assert_eq!(settings.perimeter, None);
        assert!(settings.monitor);
    }

    #[test]
    fn test_cli_perimeter_overrides_file_pixels() {
        let file = FileConfig::parse("pixels = 50").unwrap();
        let settings =
            Settings::resolve(args(&["--width", "10", "--height", "5"]), file).unwrap();

        assert_eq!(settings.pipeline.layout, FrameLayout::new(30));
        assert_eq!(settings.perimeter, Some(PerimeterLayout::new(10, 5)));
    }

    #[test]
    fn test_cli_width_keeps_file_height() {
        let file = FileConfig::parse("pixels = 50\nheight = 4").unwrap();
        let settings = Settings::resolve(args(&["--width", "6"]), file).unwrap();

        assert_eq!(settings.perimeter, Some(PerimeterLayout::new(6, 4)));
        assert_eq!(settings.pipeline.layout.pixel_count(), 20);
    }

    #[test]
    fn test_file_pixels_without_cli_geometry() {
        let file = FileConfig::parse("pixels = 50\nwidth = 10").unwrap();
        let settings = Settings::resolve(args(&[]), file).unwrap();

        assert_eq!(settings.pipeline.layout, FrameLayout::new(50));
        assert_eq!(settings.perimeter, None);
    }

    #[test]
    fn test_monitor_flag_overrides_file() {
        let file = || FileConfig::parse("monitor = true").unwrap();

        assert!(Settings::resolve(args(&[]), file()).unwrap().monitor);
        assert!(!Settings::resolve(args(&["--monitor", "false"]), file()).unwrap().monitor);
        assert!(Settings::resolve(args(&["--monitor"]), FileConfig::default()).unwrap().monitor);
        assert!(!Settings::resolve(args(&[]), FileConfig::default()).unwrap().monitor);
    }

    #[test]
    fn test_device_sink_requires_path() {
        let err = Settings::resolve(args(&["--sink", "device"]), FileConfig::default()).unwrap_err();
        assert!(err.to_string().contains("--device"));

        let settings = Settings::resolve(
            args(&["--sink", "device", "--device", "/dev/ledstrip0"]),
            FileConfig::default(),
        )
        .unwrap();
        assert_eq!(settings.sink, SinkChoice::Device("/dev/ledstrip0".into()));
    }

    #[test]
    fn test_unknown_file_key() {
        assert!(FileConfig::parse("brightness = 3").is_err());
    }

    #[test]
    fn test_parse_cadence() {
        assert_eq!(parse_cadence("free"), Ok(TickCadence::FreeRunning));
        assert_eq!(
            parse_cadence("delay:10"),
            Ok(TickCadence::FixedDelay(Duration::from_millis(10)))
        );
        assert_eq!(parse_cadence(" fps:60 "), Ok(TickCadence::TargetFps(60)));
        assert!(parse_cadence("fps:0").is_err());
        assert!(parse_cadence("delay:soon").is_err());
        assert!(parse_cadence("often").is_err());
    }
}

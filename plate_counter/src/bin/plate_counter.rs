use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use log::{info, warn};
use pyroscope::PyroscopeAgent;
use pyroscope_pprofrs::{pprof_backend, PprofConfig};

use plate_counter::metrics;
use plate_counter::plate_detection::dnn_ocr::DnnOcrReader;
use plate_counter::plate_detection::object_detector::{DetectorOptions, YoloPlateDetector};
use plate_counter::plate_detection::video_reader::VideoReader;
use plate_counter::progress::{ChannelReporter, LogReporter, ProgressUpdate};
use plate_counter::settings::Settings;
use plate_counter::{
    CounterStore, DetectionPipeline, FrameSource, JsonFileCounters, RunConfig, RunReport,
};

#[derive(Parser)]
#[command(name = "plate_counter", version)]
#[command(about = "Count distinct license plates in videos and camera streams")]
struct Cli {
    #[command(flatten)]
    settings: Settings,

    /// Print the Prometheus metrics when the command finishes.
    #[arg(long)]
    print_metrics: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Count plates in a video file.
    Video {
        path: PathBuf,
        /// Read the file at its own frame rate instead of as fast as possible.
        #[arg(long)]
        realtime: bool,
    },
    /// Watch a camera stream (rtsp, http, ...). Press enter to stop early.
    Camera {
        uri: String,
        /// Seconds to watch, the configured default when omitted.
        #[arg(long)]
        duration: Option<u64>,
    },
    /// Show the stored per plate counts.
    Counts,
    /// Look up a single plate.
    Search { plate: String },
    /// Clear every stored count.
    Reset,
    /// Print the effective settings without loading models.
    Status,
}

struct Models {
    detector: YoloPlateDetector,
    recognizer: DnnOcrReader,
}

impl Models {
    fn load(settings: &Settings) -> Result<Self> {
        let detector = YoloPlateDetector::load(
            &settings.detection_model,
            DetectorOptions {
                use_gpu: settings.use_gpu,
                ..DetectorOptions::default()
            },
        )
        .context("loading the plate detector")?;
        let recognizer = DnnOcrReader::new(
            settings.recognition_model.as_deref(),
            &settings.tesseract_language,
        )
        .context("loading the plate recognizer")?;
        Ok(Self {
            detector,
            recognizer,
        })
    }
}

fn count_video(settings: &Settings, path: PathBuf, realtime: bool) -> Result<RunReport> {
    let bytes = settings.ensure_within_size_limit(&path)?;
    info!("counting plates in {} ({bytes} bytes)", path.display());

    let mut models = Models::load(settings)?;
    let mut source = VideoReader::open_file(&path)?;
    if realtime {
        source = source.paced();
    }

    let mut pipeline = DetectionPipeline::new(&mut models.detector, &mut models.recognizer)
        .with_normalizer(settings.normalizer())
        .with_reporter(LogReporter);
    let report = pipeline.run(source, &settings.video_run_config())?;
    Ok(report)
}

fn watch_camera(settings: &Settings, uri: &str, duration: Option<u64>) -> Result<RunReport> {
    let mut models = Models::load(settings)?;
    let source = VideoReader::open_stream(uri, settings.connect_timeout())
        .with_context(|| format!("opening camera stream {uri}"))?;
    let config: RunConfig = settings.camera_run_config(
        source.effective_frame_rate(),
        duration.map(Duration::from_secs),
    )?;

    let (reporter, updates) = ChannelReporter::with_capacity(8);
    let printer = thread::spawn(move || {
        for update in updates {
            match update {
                ProgressUpdate::Snapshot(snapshot) => {
                    let counted: u64 = snapshot.counts.values().sum();
                    println!(
                        "{} frames, {} plates counted, in view: {}",
                        snapshot.frames_processed,
                        counted,
                        snapshot.open_plates.join(", ")
                    );
                }
                ProgressUpdate::Finished(report) => {
                    println!("stopped: {:?}", report.stop_reason);
                }
            }
        }
    });

    let mut pipeline = DetectionPipeline::new(&mut models.detector, &mut models.recognizer)
        .with_normalizer(settings.normalizer())
        .with_reporter(reporter);

    let cancel = pipeline.cancellation_token();
    thread::spawn(move || cancel.cancel_on_line(std::io::stdin().lock()));

    let report = pipeline.run(source, &config);
    drop(pipeline);
    if printer.join().is_err() {
        warn!("progress printer panicked");
    }
    Ok(report?)
}

fn print_counts(store: &JsonFileCounters) -> Result<()> {
    let mut counts: Vec<(String, u64)> = store.get_all()?.into_iter().collect();
    if counts.is_empty() {
        println!("no plates recorded in {}", store.path().display());
        return Ok(());
    }
    counts.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    for (plate, count) in counts {
        println!("{plate:<12} {count}");
    }
    Ok(())
}

fn print_status(settings: &Settings) {
    for (name, value) in settings.status_lines() {
        println!("{name:<24} {value}");
    }
}

fn execute(cli: &Cli) -> Result<()> {
    let settings = &cli.settings;
    if let Command::Status = cli.command {
        print_status(settings);
        return Ok(());
    }
    let store = JsonFileCounters::open(&settings.storage_file)
        .with_context(|| format!("opening {}", settings.storage_file.display()))?;

    match &cli.command {
        Command::Video { path, realtime } => {
            let report = count_video(settings, path.clone(), *realtime)?;
            store.merge(&report.summary)?;
            println!(
                "{} plate sightings in {} processed frames ({:?})",
                report.summary.total_sessions(),
                report.summary.total_frames_processed,
                report.stop_reason
            );
            print_counts(&store)?;
        }
        Command::Camera { uri, duration } => {
            let report = watch_camera(settings, uri, *duration)?;
            store.merge(&report.summary)?;
            for (plate, count) in &report.summary.counts {
                println!("{plate:<12} +{count}");
            }
        }
        Command::Counts => print_counts(&store)?,
        Command::Search { plate } => {
            let Some(key) = settings.normalizer().normalize(plate) else {
                bail!("'{plate}' is not a valid plate");
            };
            println!("{key:<12} {}", store.get(&key)?);
        }
        Command::Reset => {
            store.reset_all()?;
            println!("all counts cleared");
        }
        Command::Status => print_status(settings),
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    env_logger::Builder::new()
        .parse_filters(&cli.settings.log_level)
        .init();

    match cli.settings.pyroscope_url.as_deref() {
        Some(url) => {
            let agent = PyroscopeAgent::builder(url, "plate_counter")
                .backend(pprof_backend(PprofConfig::new().sample_rate(100)))
                .build()?
                .start()?;
            let result = execute(&cli);
            agent.stop()?.shutdown();
            result?;
        }
        None => execute(&cli)?,
    }

    if cli.print_metrics {
        print!("{}", metrics::gather_text());
    }
    Ok(())
}

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use footfall_core::embedder::DETECTOR_MODEL;
use footfall_core::provider::best_face;
use footfall_core::{
    BoundingBox, Clock, OnnxEmbedder, Pipeline, PipelineConfig, PipelineEvent, QualityScorer, ScrfdDetector,
};
use footfall_hw::{Camera, CameraConfig, ImageSequence};
use footfall_store::SqliteStore;
use std::cell::Cell;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::{Duration, Instant};

#[derive(Parser)]
#[command(name = "footfall", about = "Footfall visitor counting CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show visitor totals from the database
    Stats {
        /// Database path (defaults to the daemon's)
        #[arg(long)]
        db: Option<PathBuf>,
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },
    /// List known visitors, most recently seen first
    Visitors {
        #[arg(long)]
        db: Option<PathBuf>,
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },
    /// List recent visits
    Visits {
        #[arg(long)]
        db: Option<PathBuf>,
        /// Only visits of this visitor
        #[arg(long)]
        visitor: Option<i64>,
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },
    /// Show daemon status
    Status,
    /// Score the face quality of a still image
    Score {
        image: PathBuf,
        /// Face box as x1,y1,x2,y2; detected with SCRFD when omitted
        #[arg(long, value_parser = parse_bbox)]
        bbox: Option<BoundingBox>,
        #[arg(long)]
        model_dir: Option<PathBuf>,
    },
    /// Run the counting pipeline over a directory of images
    Replay {
        dir: PathBuf,
        /// Record into this database instead of a throwaway in-memory one
        #[arg(long)]
        db: Option<PathBuf>,
        #[arg(long)]
        model_dir: Option<PathBuf>,
        /// Frame rate the images were captured at
        #[arg(long, default_value_t = 15.0)]
        fps: f32,
        #[arg(long)]
        threshold: Option<f32>,
        #[arg(long)]
        cooldown: Option<f32>,
    },
    /// Run camera diagnostics
    Test {
        #[arg(short, long, default_value = "/dev/video0")]
        device: String,
        #[arg(short, long, default_value_t = 10)]
        frames: usize,
    },
}

#[zbus::proxy(
    interface = "org.footfall.Counter1",
    default_service = "org.footfall.Counter1",
    default_path = "/org/footfall/Counter1"
)]
trait Counter {
    fn status(&self) -> zbus::Result<String>;
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Stats { db, json } => {
            let store = open_store(db)?;
            let summary = store.summary()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                println!("Unique visitors:    {}", summary.unique_visitors);
                println!("Returning visitors: {}", summary.returning_visitors);
                println!("Total visits:       {}", summary.total_visits);
                println!("Return visits:      {}", summary.return_visits);
            }
        }
        Commands::Visitors { db, limit } => {
            let store = open_store(db)?;
            let visitors = store.list_visitors(limit)?;
            if visitors.is_empty() {
                println!("No visitors recorded");
            }
            for v in visitors {
                println!(
                    "#{:<6} visits={:<4} first={} last={} {}",
                    v.id,
                    v.visit_count,
                    v.first_seen.format("%Y-%m-%d %H:%M:%S"),
                    v.last_seen.format("%Y-%m-%d %H:%M:%S"),
                    v.sample_image.as_deref().unwrap_or("")
                );
            }
        }
        Commands::Visits { db, visitor, limit } => {
            let store = open_store(db)?;
            for visit in store.recent_visits(visitor, limit)? {
                let similarity = visit
                    .similarity
                    .map(|s| format!("{s:.3}"))
                    .unwrap_or_else(|| "new".into());
                println!(
                    "{} visitor=#{} similarity={} session={}",
                    visit.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    visit.visitor_id,
                    similarity,
                    visit.session_id
                );
            }
        }
        Commands::Status => {
            let conn = match zbus::Connection::session().await {
                Ok(c) => c,
                Err(e) => bail!("cannot reach the session bus: {e}"),
            };
            let proxy = CounterProxy::new(&conn).await?;
            match proxy.status().await {
                Ok(status) => {
                    let value: serde_json::Value = serde_json::from_str(&status)?;
                    println!("{}", serde_json::to_string_pretty(&value)?);
                }
                Err(e) => {
                    println!("footfalld: not running ({e})");
                }
            }
        }
        Commands::Score { image, bbox, model_dir } => score(&image, bbox, model_dir)?,
        Commands::Replay {
            dir,
            db,
            model_dir,
            fps,
            threshold,
            cooldown,
        } => {
            let mut config = PipelineConfig::default();
            if let Some(t) = threshold {
                config.similarity_threshold = t;
            }
            if let Some(c) = cooldown {
                config.cooldown_secs = c;
            }
            replay(&dir, db, model_dir, fps, config)?;
        }
        Commands::Test { device, frames } => camera_test(&device, frames)?,
    }

    Ok(())
}

fn open_store(db: Option<PathBuf>) -> Result<SqliteStore> {
    let path = db.unwrap_or_else(footfall_store::default_db_path);
    if !path.exists() {
        bail!("no database at {} (has footfalld run yet?)", path.display());
    }
    SqliteStore::open(&path).with_context(|| format!("opening {}", path.display()))
}

fn parse_bbox(s: &str) -> Result<BoundingBox, String> {
    let parts: Vec<f32> = s
        .split(',')
        .map(|p| p.trim().parse::<f32>().map_err(|e| format!("'{p}': {e}")))
        .collect::<Result<_, _>>()?;
    let [x1, y1, x2, y2] = parts[..] else {
        return Err(format!("expected x1,y1,x2,y2, got {} values", parts.len()));
    };
    if x2 <= x1 || y2 <= y1 {
        return Err("box must have positive width and height".into());
    }
    Ok(BoundingBox::from_corners(x1, y1, x2, y2, 1.0))
}

fn score(image: &Path, bbox: Option<BoundingBox>, model_dir: Option<PathBuf>) -> Result<()> {
    let frame = footfall_hw::load_luma(image)?;
    let face = match bbox {
        Some(b) => b.clamped(frame.width, frame.height),
        None => {
            let dir = model_dir.unwrap_or_else(footfall_core::default_model_dir);
            let mut detector = ScrfdDetector::load(&dir.join(DETECTOR_MODEL))?;
            let faces = detector.run(&frame)?;
            match best_face(&faces, 0.0) {
                Some(f) => f.clamped(frame.width, frame.height),
                None => bail!("no face detected in {}", image.display()),
            }
        }
    };

    let score = QualityScorer::default().score_face(&frame, &face);
    println!(
        "face: x={:.0} y={:.0} w={:.0} h={:.0} confidence={:.2}",
        face.x, face.y, face.width, face.height, face.confidence
    );
    println!("{}", serde_json::to_string_pretty(&score)?);
    Ok(())
}

/// Advances by one frame period per replayed image, so cooldown and
/// capture windows follow the recording rather than decode speed.
#[derive(Clone)]
struct ReplayClock(Rc<Cell<Instant>>);

impl Clock for ReplayClock {
    fn now(&self) -> Instant {
        self.0.get()
    }
}

fn replay(dir: &Path, db: Option<PathBuf>, model_dir: Option<PathBuf>, fps: f32, config: PipelineConfig) -> Result<()> {
    let period = match Duration::try_from_secs_f32(1.0 / fps) {
        Ok(p) if fps > 0.0 && !p.is_zero() => p,
        _ => bail!("--fps must be a positive frame rate, got {fps}"),
    };
    let model_dir = model_dir.unwrap_or_else(footfall_core::default_model_dir);
    let source = ImageSequence::open(dir)?;
    let total = source.len();
    let detector = ScrfdDetector::load(&model_dir.join(DETECTOR_MODEL))?;
    let embedder = OnnxEmbedder::load(&model_dir)?;
    let store = match db {
        Some(path) => SqliteStore::open(&path)?,
        None => SqliteStore::open_in_memory()?,
    };

    let clock = ReplayClock(Rc::new(Cell::new(Instant::now())));
    let mut pipeline = Pipeline::with_clock(source, detector, embedder, store, config, clock.clone())?;

    println!("Replaying {total} frames from {}", dir.display());
    loop {
        match pipeline.process_next_frame() {
            Ok(PipelineEvent::EndOfStream) => break,
            Ok(PipelineEvent::Completed(visit)) => {
                let similarity = visit.similarity.map(|s| format!(" similarity={s:.3}")).unwrap_or_default();
                println!(
                    "{} visitor=#{} {}{} quality={:.3} frame={}/{}",
                    visit.session_id,
                    visit.visitor_id,
                    visit.outcome,
                    similarity,
                    visit.quality.composite,
                    visit.sequence_index,
                    visit.observations
                );
            }
            Ok(PipelineEvent::Discarded { session_id, reason }) => {
                println!("{session_id} discarded ({reason:?})");
            }
            Ok(_) => {}
            Err(e) if e.is_transient() => tracing::warn!(error = %e, "frame skipped"),
            Err(e) => return Err(e.into()),
        }
        clock.0.set(clock.0.get() + period);
    }

    println!("{}", serde_json::to_string_pretty(pipeline.stats())?);
    println!("Unique visitors: {}", pipeline.store().visitor_count()?);
    Ok(())
}

fn camera_test(device: &str, frames: usize) -> Result<()> {
    println!("Running camera diagnostics...");
    let devices = Camera::list_devices();
    if devices.is_empty() {
        println!("No V4L2 capture devices found");
    }
    for d in &devices {
        println!("  {}: {} ({}, {})", d.path, d.name, d.driver, d.bus);
    }

    let mut camera = Camera::open(CameraConfig {
        device: device.to_string(),
        ..CameraConfig::default()
    })?;
    let (w, h) = camera.resolution();
    println!("Opened {device}: {w}x{h} {:?}", camera.pixel_format());

    let mut dark = 0;
    let started = Instant::now();
    for i in 0..frames {
        let frame = camera.capture()?;
        let is_dark = footfall_hw::is_dark_frame(&frame.data, 0.95);
        dark += usize::from(is_dark);
        println!(
            "  frame {i:>3}: seq={} brightness={:.1}{}",
            frame.sequence,
            frame.avg_brightness(),
            if is_dark { " (dark)" } else { "" }
        );
    }
    let elapsed = started.elapsed().as_secs_f32();
    if frames > 0 && elapsed > 0.0 {
        println!("{frames} frames in {elapsed:.2}s ({:.1} fps), {dark} dark", frames as f32 / elapsed);
    }
    Ok(())
}

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use emotion_recognizer_core::artifacts::ArtifactStore;
use emotion_recognizer_core::config::{
    resolve_path_with_default, resolve_seed, AppConfig, Env, LiveConfig, SegmentDuration, StdEnv,
    TrainingConfig, DEFAULT_ARTIFACTS_DIR, DEFAULT_BUFFER_SEGMENTS, DEFAULT_CV_FOLDS,
    DEFAULT_DATA_DIR, DEFAULT_FEATURES_CSV, DEFAULT_MIN_PEAK, DEFAULT_REPORTS_DIR,
    DEFAULT_SEGMENT_MS, ENV_ARTIFACTS_DIR, ENV_REPORTS_DIR,
};
use emotion_recognizer_core::dataset::FeatureTable;
use emotion_recognizer_core::features::{FeatureConfig, FeatureExtractor};
use emotion_recognizer_core::inference::{InferenceEngine, Prediction};
use emotion_recognizer_core::live::{AudioCapture, LiveEvent, LiveSession};
use emotion_recognizer_core::model::ModelVariant;
use emotion_recognizer_core::pipeline::{extract_corpus, find_audio_files, train_and_evaluate};
use emotion_recognizer_core::training::ScoringMetric;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

const TOP_K: usize = 3;
const REPLAY_CHUNK_FRAMES: usize = 1024;

#[derive(Parser, Debug)]
#[command(name = "emotion-recognizer")]
#[command(about = "Speech emotion recognition: feature extraction, training, batch and live prediction")]
struct Cli {
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Extract one feature vector per labelled clip into a CSV table.
    Extract(ExtractArgs),
    /// Split, scale, train, evaluate and persist models.
    Train(TrainArgs),
    /// Classify audio files with the persisted model.
    Predict(PredictArgs),
    /// Classify a live audio stream in fixed-length segments.
    Live(LiveArgs),
}

#[derive(Args, Debug)]
struct ExtractArgs {
    #[arg(long, default_value = DEFAULT_DATA_DIR)]
    data_dir: PathBuf,

    #[arg(long, default_value = DEFAULT_FEATURES_CSV)]
    output: PathBuf,
}

#[derive(Args, Debug)]
struct TrainArgs {
    #[arg(long, default_value = DEFAULT_FEATURES_CSV)]
    features: PathBuf,

    #[arg(long)]
    artifacts_dir: Option<PathBuf>,

    #[arg(long)]
    reports_dir: Option<PathBuf>,

    #[arg(long)]
    seed: Option<u64>,

    #[arg(long, default_value_t = DEFAULT_CV_FOLDS)]
    folds: usize,

    #[arg(long, default_value = "macro-f1")]
    scoring: ScoringMetric,
}

#[derive(Args, Debug)]
struct PredictArgs {
    /// Audio files, or directories searched recursively for `.wav` files.
    #[arg(required = true)]
    files: Vec<PathBuf>,

    #[arg(long)]
    artifacts_dir: Option<PathBuf>,

    /// Use this stored model instead of the selected one (e.g. `forest_tuned`).
    #[arg(long)]
    model: Option<String>,
}

#[derive(Args, Debug)]
struct LiveArgs {
    #[arg(long)]
    artifacts_dir: Option<PathBuf>,

    #[arg(long, default_value_t = DEFAULT_SEGMENT_MS as f64 / 1000.0)]
    segment_secs: f64,

    #[arg(long, default_value_t = DEFAULT_BUFFER_SEGMENTS)]
    buffer_segments: usize,

    #[arg(long, default_value_t = DEFAULT_MIN_PEAK)]
    min_peak: f32,

    /// Stream this file through the live path instead of a microphone.
    #[arg(long)]
    replay: Option<PathBuf>,

    /// Replay as fast as possible instead of at real time.
    #[arg(long, requires = "replay")]
    fast: bool,

    /// Input device name; the system default when omitted.
    #[arg(long)]
    device: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level)?;
    let env = StdEnv;

    match cli.command {
        Command::Extract(args) => run_extract(args),
        Command::Train(args) => run_train(args, &env),
        Command::Predict(args) => run_predict(args, &env),
        Command::Live(args) => run_live(args, &env).await,
    }
}

fn init_tracing(level: &str) -> anyhow::Result<()> {
    let filter = EnvFilter::builder()
        .with_default_directive(
            level
                .parse()
                .with_context(|| format!("invalid --log-level: {level}"))?,
        )
        .from_env_lossy();

    tracing_subscriber::fmt().with_env_filter(filter).init();
    Ok(())
}

fn artifacts_dir(cli_value: Option<PathBuf>, env: &impl Env) -> PathBuf {
    resolve_path_with_default(cli_value, ENV_ARTIFACTS_DIR, env, DEFAULT_ARTIFACTS_DIR)
}

fn run_extract(args: ExtractArgs) -> anyhow::Result<()> {
    let extractor = FeatureExtractor::new(FeatureConfig::default())?;
    let (table, summary) = extract_corpus(&args.data_dir, &extractor)
        .with_context(|| format!("extracting features from {}", args.data_dir.display()))?;
    table
        .write_csv(&args.output)
        .with_context(|| format!("writing {}", args.output.display()))?;

    println!(
        "extracted {} clips ({} skipped, {} degenerate) into {}",
        summary.extracted,
        summary.skipped,
        summary.degenerate,
        args.output.display()
    );
    for (path, reason) in &summary.failures {
        println!("  skipped {}: {reason}", path.display());
    }
    Ok(())
}

fn build_train_config(args: &TrainArgs, env: &impl Env) -> anyhow::Result<AppConfig> {
    let seed = resolve_seed(args.seed, env)?;
    Ok(AppConfig {
        artifacts_dir: artifacts_dir(args.artifacts_dir.clone(), env),
        reports_dir: resolve_path_with_default(
            args.reports_dir.clone(),
            ENV_REPORTS_DIR,
            env,
            DEFAULT_REPORTS_DIR,
        ),
        training: TrainingConfig::new(seed, args.folds, args.scoring)?,
        ..AppConfig::default()
    })
}

fn run_train(args: TrainArgs, env: &impl Env) -> anyhow::Result<()> {
    let config = build_train_config(&args, env)?;
    tracing::info!(
        features = %args.features.display(),
        artifacts_dir = %config.artifacts_dir.display(),
        reports_dir = %config.reports_dir.display(),
        seed = config.training.seed.value(),
        scoring = %config.training.scoring,
        "config loaded"
    );

    let table = FeatureTable::read_csv(&args.features)
        .with_context(|| format!("reading {}", args.features.display()))?;
    let store = ArtifactStore::new(&config.artifacts_dir);
    let outcome = train_and_evaluate(&table, &config, &store).context("training failed")?;

    println!(
        "split: {} train / {} validation / {} test",
        outcome.train_size, outcome.validation_size, outcome.test_size
    );
    println!(
        "{:<16} {:>10} {:>10} {:>10}",
        "model", "val f1", "test f1", "test acc"
    );
    for (variant, report) in &outcome.reports {
        println!(
            "{:<16} {:>10.4} {:>10.4} {:>10.4}",
            variant.name(),
            report.validation.macro_f1,
            report.test.macro_f1,
            report.test.accuracy
        );
    }
    println!("selected: {}", outcome.selected);
    Ok(())
}

fn print_prediction(label: &str, prediction: &Prediction) {
    let ranked = prediction
        .top_k(TOP_K)
        .iter()
        .map(|(emotion, p)| format!("{emotion} {:.1}%", p * 100.0))
        .collect::<Vec<_>>()
        .join(", ");
    let flag = if prediction.degenerate { " (near-silent)" } else { "" };
    println!("{label}: {ranked}{flag}");
}

fn load_engine(store: &ArtifactStore, model: Option<&str>) -> anyhow::Result<InferenceEngine> {
    let context = || format!("loading artifacts from {}", store.dir().display());
    match model {
        None => InferenceEngine::load(store).with_context(context),
        Some(name) => {
            let variant = ModelVariant::from_name(name)
                .with_context(|| format!("unknown model `{name}`"))?;
            let bundle = store.load().with_context(context)?;
            Ok(InferenceEngine::with_variant(bundle, variant)?)
        }
    }
}

fn expand_inputs(inputs: &[PathBuf]) -> anyhow::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for input in inputs {
        if input.is_dir() {
            let found = find_audio_files(input)
                .with_context(|| format!("listing {}", input.display()))?;
            if found.is_empty() {
                tracing::warn!(dir = %input.display(), "no .wav files in directory");
            }
            files.extend(found);
        } else {
            files.push(input.clone());
        }
    }
    if files.is_empty() {
        anyhow::bail!("no audio files to classify");
    }
    Ok(files)
}

fn run_predict(args: PredictArgs, env: &impl Env) -> anyhow::Result<()> {
    let files = expand_inputs(&args.files)?;
    let store = ArtifactStore::new(artifacts_dir(args.artifacts_dir, env));
    let engine = load_engine(&store, args.model.as_deref())?;
    tracing::info!(model = %engine.variant(), files = files.len(), "predicting");

    let mut failed = 0;
    for (path, result) in engine.predict_files(&files) {
        match result {
            Ok(prediction) => print_prediction(&path.display().to_string(), &prediction),
            Err(e) => {
                failed += 1;
                println!("{}: error: {e}", path.display());
            }
        }
    }
    if failed == files.len() {
        anyhow::bail!("no file could be classified");
    }
    Ok(())
}

fn build_live_config(args: &LiveArgs) -> anyhow::Result<LiveConfig> {
    let segment = SegmentDuration::from_secs_f64(args.segment_secs)?;
    Ok(LiveConfig::new(segment, args.buffer_segments, args.min_peak)?)
}

fn open_capture(args: &LiveArgs) -> anyhow::Result<Box<dyn AudioCapture>> {
    if let Some(path) = &args.replay {
        let waveform = emotion_recognizer_core::decode::decode_file(path)
            .with_context(|| format!("decoding {}", path.display()))?;
        let replay = emotion_recognizer_core::live::ReplayCapture::new(waveform, REPLAY_CHUNK_FRAMES)
            .realtime(!args.fast);
        return Ok(Box::new(replay));
    }
    open_microphone(args.device.clone())
}

#[cfg(feature = "microphone")]
fn open_microphone(device: Option<String>) -> anyhow::Result<Box<dyn AudioCapture>> {
    let mic = emotion_recognizer_core::live::MicrophoneCapture::open(device)
        .context("opening microphone")?;
    Ok(Box::new(mic))
}

#[cfg(not(feature = "microphone"))]
fn open_microphone(_device: Option<String>) -> anyhow::Result<Box<dyn AudioCapture>> {
    anyhow::bail!("built without the `microphone` feature; pass --replay <file> or rebuild with --features microphone")
}

async fn run_live(args: LiveArgs, env: &impl Env) -> anyhow::Result<()> {
    let config = build_live_config(&args)?;
    let store = ArtifactStore::new(artifacts_dir(args.artifacts_dir.clone(), env));
    let engine = Arc::new(load_engine(&store, None)?);
    let capture = open_capture(&args)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, stopping");
            let _ = shutdown_tx.send(true);
        }
    });

    let session = LiveSession::new(engine, config);
    let summary = session
        .run(capture.as_ref(), shutdown_rx, |event| match event {
            LiveEvent::Prediction {
                sequence,
                prediction,
            } => print_prediction(&format!("segment {sequence}"), &prediction),
            LiveEvent::TooQuiet { sequence, peak } => {
                println!("segment {sequence}: too quiet (peak {peak:.4})")
            }
            LiveEvent::Failed { sequence, error } => {
                println!("segment {sequence}: error: {error}")
            }
        })
        .await
        .context("live session failed")?;

    println!(
        "{} segments classified, {} too quiet, {} failed, {} dropped",
        summary.predicted, summary.too_quiet, summary.failed, summary.dropped
    );
    Ok(())
}

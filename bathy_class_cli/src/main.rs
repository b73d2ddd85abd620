use std::io::{self, BufRead};
use std::path::PathBuf;
use std::process;
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueHint};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use bathy_class::{
    classify_samples, convert_dataframe, dump_features, get_sample_indexes, read_training_samples,
    remap_label, write_samples, Booster, Dataframe, FeatureParams, Features, PostprocessParams,
    TrainParams,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Photon classification for sea surface and bathymetry", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Classify photons from a CSV on stdin and write the augmented CSV to stdout
    Classify(ClassifyArgs),
    /// Train a model from labelled CSV files whose names arrive on stdin
    Train(TrainArgs),
}

#[derive(Parser, Debug)]
struct ClassifyArgs {
    /// Trained model to apply
    #[arg(long, value_hint = ValueHint::FilePath)]
    model_filename: PathBuf,

    /// Verbose logging
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,
}

#[derive(Parser, Debug)]
struct TrainArgs {
    /// Cap on noise and surface photons as a multiple of the bathy count
    /// per dataset (0 disables prior balancing)
    #[arg(long, default_value_t = 0)]
    balance_priors_ratio: u32,

    /// Seed for the sample shuffle and the booster's subsampling
    #[arg(long, default_value_t = 123)]
    random_seed: u64,

    /// Number of boosting epochs
    #[arg(long, default_value_t = 100)]
    epochs: usize,

    /// Optional CSV dump of the assembled feature matrix
    #[arg(long, value_hint = ValueHint::FilePath)]
    feature_dump_filename: Option<PathBuf>,

    /// Existing model to warm start from
    #[arg(long, value_hint = ValueHint::FilePath)]
    input_model_filename: Option<PathBuf>,

    /// Where to write the trained model
    #[arg(long, default_value = "./model.json", value_hint = ValueHint::FilePath)]
    output_model_filename: PathBuf,

    /// Verbose logging
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,
}

fn main() {
    let cli = Cli::parse();

    let verbose = match &cli.command {
        Command::Classify(args) => args.verbose,
        Command::Train(args) => args.verbose,
    };
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();

    let result = match cli.command {
        Command::Classify(args) => handle_classify(args),
        Command::Train(args) => handle_train(args),
    };

    if let Err(err) = result {
        eprintln!("{err:#}");
        process::exit(-1);
    }
}

fn handle_classify(args: ClassifyArgs) -> Result<()> {
    let total_timer = Instant::now();

    let booster = Booster::load_model(&args.model_filename)
        .with_context(|| format!("loading model {}", args.model_filename.display()))?;

    debug!("reading CSV from stdin");
    let photons = Dataframe::read(io::stdin().lock())?;
    debug!("total photons = {}", photons.rows());
    debug!("total dataframe columns = {}", photons.headers.len());

    // Nothing came in, nothing goes out
    if photons.headers.is_empty() {
        return Ok(());
    }

    let processing_timer = Instant::now();
    let samples = convert_dataframe(&photons)?;
    let samples = classify_samples(
        samples,
        &booster,
        &FeatureParams::default(),
        &PostprocessParams::default(),
    )?;
    let processing = processing_timer.elapsed().as_secs_f64();

    debug!("writing dataframe");
    write_samples(io::stdout().lock(), &photons, &samples)?;

    let total = total_timer.elapsed().as_secs_f64();
    info!("total elapsed time {total:.3} seconds");
    info!("elapsed processing time {processing:.3} seconds");
    if total > 0.0 && processing > 0.0 {
        info!("{:.0} photons/second total", photons.rows() as f64 / total);
        info!(
            "{:.0} photons/second without I/O",
            photons.rows() as f64 / processing
        );
    }

    Ok(())
}

fn handle_train(args: TrainArgs) -> Result<()> {
    info!("reading filenames from stdin");
    let mut filenames = Vec::new();
    for line in io::stdin().lock().lines() {
        let line = line?;
        let trimmed = line.trim();
        if !trimmed.is_empty() {
            filenames.push(PathBuf::from(trimmed));
        }
    }
    info!("{} filenames read", filenames.len());
    if filenames.is_empty() {
        return Err(anyhow!("no training filenames were supplied on stdin"));
    }

    let samples = read_training_samples(&filenames)?;
    if samples.is_empty() {
        return Err(anyhow!("the training files contained no samples"));
    }

    let fp = FeatureParams::default();
    debug!("creating features, {} per sample", fp.features_per_sample());
    let features = Features::new(&samples, fp)?;

    let sample_indexes = get_sample_indexes(&samples, args.random_seed, args.balance_priors_ratio);
    info!("training with {} total samples", sample_indexes.len());

    let rows = sample_indexes.len();
    let cols = fp.features_per_sample();
    let mut matrix = Vec::with_capacity(rows * cols);
    let mut labels = Vec::with_capacity(rows);
    let mut dataset_ids = Vec::with_capacity(rows);
    for &j in &sample_indexes {
        matrix.extend(features.row(j)?);
        labels.push(remap_label(samples[j].cls));
        dataset_ids.push(samples[j].dataset_id as u32);
    }

    if let Some(path) = &args.feature_dump_filename {
        info!("dumping features to {}", path.display());
        dump_features(path, &matrix, rows, cols, &labels, &dataset_ids)?;
    }

    let mut booster = match &args.input_model_filename {
        Some(path) => {
            info!("warm starting from {}", path.display());
            Booster::load_model(path)?
        }
        None => Booster::new(),
    };

    let params = TrainParams {
        num_boosting_rounds: args.epochs,
        seed: args.random_seed,
        ..TrainParams::default()
    };
    booster.train(&matrix, &labels, rows, cols, &params)?;

    info!(
        "saving model to {}",
        args.output_model_filename.display()
    );
    booster.save_model(&args.output_model_filename)?;

    Ok(())
}

// =============================================================================
// stagewise: damage-aware curriculum stage advancement
// =============================================================================
// Build & Run:
//   cargo build --release
//   cargo run --release -- build-dataset --logs runs/logs --out data
//   cargo run --release -- train-critic --data data --save data/critic.safetensors
//   cargo run --release -- run --config cl.json --steps 300000
//   cargo run --release -- sweep --config cl.json --generations 10 --popsize 8

#[cfg(feature = "accelerate")]
extern crate accelerate_src;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{info, warn};

use stagewise::critic::select_device;
use stagewise::dataset;
use stagewise::search::{self, RandomSearch, SweepConfig, candidate_dim};
use stagewise::surrogate::{SurrogateFactory, SurrogateRunner};
use stagewise::{
    CancellationToken, CriticTrainer, CurriculumConfig, CurriculumController, DatasetConfig,
    DecisionMode, ReplayBuffer, StageCritic, Summarizer,
};

fn banner(title: &str) {
    eprintln!("═══════════════════════════════════════════════════════════");
    eprintln!("  {title}");
    eprintln!("═══════════════════════════════════════════════════════════");
}

fn entropy() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

/// Ctrl-C flips the returned token; long loops poll it.
fn install_interrupt() -> Result<CancellationToken> {
    let cancel = CancellationToken::new();
    let handle = cancel.clone();
    ctrlc::set_handler(move || {
        eprintln!("\nInterrupt received, finishing current unit of work...");
        handle.cancel();
    })?;
    Ok(cancel)
}

fn load_curriculum(path: Option<&PathBuf>) -> Result<CurriculumConfig> {
    match path {
        Some(p) => CurriculumConfig::load(p),
        None => Ok(CurriculumConfig::default()),
    }
}

// =============================================================================
// Dataset
// =============================================================================

fn build_dataset(args: &BuildDatasetArgs) -> Result<()> {
    banner("DATASET: monitor logs → replay buffers");
    let mut cfg = match &args.config {
        Some(p) => {
            let file = std::fs::File::open(p)
                .with_context(|| format!("Failed to open dataset config {}", p.display()))?;
            serde_json::from_reader::<_, DatasetConfig>(std::io::BufReader::new(file))?
        }
        None => DatasetConfig::default(),
    };
    if let Some(v) = args.steps_of_history {
        cfg.steps_of_history = v;
    }
    if let Some(v) = args.generations {
        cfg.generations = v;
    }
    if let Some(v) = args.seed {
        cfg.seed = v;
    }
    cfg.validate()?;

    let summarizer = Summarizer::new(args.env_timeout, args.td_error_scale);
    let corpus = dataset::load_runs(&args.logs, cfg.generations, &summarizer)?;
    eprintln!(
        "Loaded {} trajectories ({} logs skipped)",
        corpus.trajectories.len(),
        corpus.skipped_logs
    );
    let built = dataset::build(&corpus.trajectories, &cfg)?;
    built.save(&args.out, &args.name)?;
    eprintln!(
        "Saved {}_{{train,test}}.bin ({} / {} transitions) to {}",
        args.name,
        built.train.len(),
        built.test.len(),
        args.out.display()
    );
    Ok(())
}

// =============================================================================
// Offline critic training
// =============================================================================

fn train_critic(args: &TrainCriticArgs, cancel: &CancellationToken) -> Result<()> {
    banner("CRITIC: offline TD training (candle)");
    let mut cfg = load_curriculum(args.config.as_ref())?.critic;
    if let Some(v) = args.iterations {
        cfg.iterations = v;
    }
    let device = select_device(args.cpu);
    eprintln!("Device: {:?}", device);

    let train = ReplayBuffer::load(args.data.join(format!("{}_train.bin", args.name)))?;
    let test = ReplayBuffer::load(args.data.join(format!("{}_test.bin", args.name)))?;
    eprintln!(
        "Train {} / test {} transitions, state width {}",
        train.len(),
        test.len(),
        train.state_len()
    );

    let mut critic = StageCritic::new(&device, train.state_len(), &cfg)?;
    let mut trainer = CriticTrainer::new(&mut critic, &cfg, args.save.clone(), args.seed)?;
    if args.resume {
        match trainer.resume()? {
            Some(it) => eprintln!("Resumed from iteration {it}"),
            None => warn!("no snapshot beside {}, starting fresh", args.save.display()),
        }
    }
    let out = trainer.train(&train, &test, cancel)?;
    eprintln!(
        "Done: {} iterations, weights {}, series {}",
        out.iterations,
        out.weights.display(),
        out.series_path.display()
    );
    Ok(())
}

// =============================================================================
// Curriculum run
// =============================================================================

fn apply_run_overrides(cfg: &mut CurriculumConfig, args: &RunOverrides) {
    if let Some(v) = args.steps {
        cfg.steps = v;
    }
    if let Some(v) = args.reach_return {
        cfg.reach_return = Some(v);
    }
    if let Some(v) = args.seed {
        cfg.seed = Some(v);
    }
    if let Some(v) = &args.output {
        cfg.output = v.clone();
    }
    if let Some(v) = &args.cl_save {
        cfg.cl_save = v.clone();
    }
    if let Some(v) = &args.cl_load {
        cfg.cl_load = Some(v.clone());
    }
    if let Some(v) = &args.pt_stats {
        cfg.pt_stats = Some(v.clone());
    }
    if let Some(v) = args.decision {
        cfg.decision = v;
    }
}

fn run(args: &RunArgs, cancel: &CancellationToken) -> Result<()> {
    banner("CURRICULUM: stage-wise training run");
    let mut cfg = load_curriculum(args.config.as_ref())?;
    apply_run_overrides(&mut cfg, &args.overrides);
    let device = select_device(args.cpu);
    eprintln!("Device: {:?}", device);

    let summary_path = args
        .summary
        .clone()
        .unwrap_or_else(|| cfg.output.with_extension("summary.json"));
    let mut controller = CurriculumController::new(cfg, SurrogateRunner::default(), SurrogateFactory)
        .with_device(device)
        .with_cancellation(cancel.clone());
    let summary = controller.run(entropy())?;
    summary.save(&summary_path)?;

    banner("RESULT");
    eprintln!("  stages : {}", summary.cl_info.trim_end());
    eprintln!("  steps  : {}", summary.steps);
    eprintln!("  damage : {:.3}", summary.damage);
    eprintln!("  reached: {}", summary.reached);
    eprintln!("  cost   : {:.3}", summary.cost);
    info!("summary written to {}", summary_path.display());
    Ok(())
}

// =============================================================================
// Sweep
// =============================================================================

fn sweep(args: &SweepArgs, cancel: &CancellationToken) -> Result<()> {
    banner("SWEEP: critic weights vs. curriculum cost");
    let mut cfg = load_curriculum(args.config.as_ref())?;
    apply_run_overrides(&mut cfg, &args.overrides);
    if cfg.decision != DecisionMode::Critic {
        warn!("sweep candidates always steer with the critic; ignoring {:?}", cfg.decision);
    }

    let dim = candidate_dim(&cfg)?;
    let sweep_cfg = SweepConfig {
        generations: args.generations,
        popsize: args.popsize,
        workers: args.workers.unwrap_or_else(stagewise::WorkerPool::default_size),
        seed: args.search_seed,
        dir: args.dir.clone(),
    };
    eprintln!(
        "{} parameters, {} generations x {} candidates on {} workers",
        dim, sweep_cfg.generations, sweep_cfg.popsize, sweep_cfg.workers
    );

    let mut optimizer = RandomSearch::new(dim, args.popsize, args.search_seed);
    let history = search::sweep(&mut optimizer, &cfg, &sweep_cfg, cancel, || {
        (SurrogateRunner::default(), SurrogateFactory)
    })?;

    banner("SWEEP RESULT");
    match history.last() {
        Some(last) => eprintln!(
            "  {} generations, best cost {:.3}",
            history.len(),
            last.best_cost
        ),
        None => eprintln!("  no generation completed"),
    }
    Ok(())
}

// =============================================================================
// CLI
// =============================================================================

#[derive(Parser)]
#[command(name = "stagewise", about = "Damage-aware curriculum stage advancement")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Turn monitor logs into train/test replay buffers
    BuildDataset(BuildDatasetArgs),
    /// Fit the stage-value critic on a built dataset
    TrainCritic(TrainCriticArgs),
    /// Run one curriculum
    Run(RunArgs),
    /// Search critic weights by curriculum cost
    Sweep(SweepArgs),
}

#[derive(Parser)]
struct BuildDatasetArgs {
    #[arg(long)]
    logs: PathBuf,
    #[arg(long, default_value = "data")]
    out: PathBuf,
    #[arg(long, default_value = "dataset")]
    name: String,
    /// JSON dataset options
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    steps_of_history: Option<usize>,
    #[arg(long)]
    generations: Option<u32>,
    #[arg(long)]
    seed: Option<u64>,
    #[arg(long, default_value = "20")]
    env_timeout: f64,
    #[arg(long, default_value = "600")]
    td_error_scale: f64,
}

#[derive(Parser)]
struct TrainCriticArgs {
    #[arg(long, default_value = "data")]
    data: PathBuf,
    #[arg(long, default_value = "dataset")]
    name: String,
    #[arg(long, default_value = "data/critic.safetensors")]
    save: PathBuf,
    /// JSON curriculum config; only its critic section is used
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    iterations: Option<usize>,
    /// Continue from the newest periodic snapshot beside --save
    #[arg(long, default_value_t = false)]
    resume: bool,
    #[arg(long, default_value = "0")]
    seed: u64,
    #[arg(long, default_value_t = false)]
    cpu: bool,
}

#[derive(Parser)]
struct RunOverrides {
    #[arg(long)]
    steps: Option<u64>,
    #[arg(long)]
    reach_return: Option<f64>,
    #[arg(long)]
    seed: Option<u32>,
    #[arg(long)]
    output: Option<PathBuf>,
    #[arg(long)]
    cl_save: Option<PathBuf>,
    #[arg(long)]
    cl_load: Option<PathBuf>,
    #[arg(long)]
    pt_stats: Option<PathBuf>,
    #[arg(long, value_enum)]
    decision: Option<DecisionMode>,
}

#[derive(Parser)]
struct RunArgs {
    #[arg(long)]
    config: Option<PathBuf>,
    #[command(flatten)]
    overrides: RunOverrides,
    /// Where the run summary JSON goes (default: beside the output prefix)
    #[arg(long)]
    summary: Option<PathBuf>,
    #[arg(long, default_value_t = false)]
    cpu: bool,
}

#[derive(Parser)]
struct SweepArgs {
    #[arg(long)]
    config: Option<PathBuf>,
    #[command(flatten)]
    overrides: RunOverrides,
    #[arg(long, default_value = "sweep")]
    dir: PathBuf,
    #[arg(long, default_value = "10")]
    generations: usize,
    #[arg(long, default_value = "8")]
    popsize: usize,
    #[arg(long)]
    workers: Option<usize>,
    /// Seeds the optimizer; `--seed` still seeds the runs
    #[arg(long, default_value = "1")]
    search_seed: u64,
}

// =============================================================================
// Main
// =============================================================================

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()))
        .init();

    let cli = Cli::parse();
    let cancel = install_interrupt()?;

    match &cli.command {
        Commands::BuildDataset(args) => build_dataset(args),
        Commands::TrainCritic(args) => train_critic(args, &cancel),
        Commands::Run(args) => run(args, &cancel),
        Commands::Sweep(args) => sweep(args, &cancel),
    }
}

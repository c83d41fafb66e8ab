use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use time::precise_time_s;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use rbc_vfi::config::{load_config, RunConfig};
use rbc_vfi::{Error, LogObserver, Model, Silent, Solution, Solver};

/// Capital index printed as a sanity check after a solve.
const CHECK_INDEX: usize = 999;

#[derive(Parser, Debug)]
#[command(name = "rbc")]
#[command(about = "Solve the RBC model with full depreciation by value function iteration")]
struct Cli {
    /// TOML run configuration (defaults to the benchmark run if missing)
    #[arg(long, default_value = "rbc.toml")]
    config: PathBuf,

    /// Worker threads for each sweep (0 = one per logical CPU)
    #[arg(long)]
    threads: Option<usize>,

    #[arg(long)]
    tolerance: Option<f64>,

    #[arg(long)]
    max_iterations: Option<u32>,

    /// Number of capital grid points
    #[arg(long)]
    grid_size: Option<usize>,

    /// Time this many silent solves and report the median
    #[arg(long, num_args = 0..=1, default_missing_value = "5")]
    sample: Option<usize>,

    /// Capital index of the printed policy check
    #[arg(long, default_value_t = CHECK_INDEX)]
    check_index: usize,
}

impl Cli {
    fn apply(&self, cfg: &mut RunConfig) {
        if let Some(threads) = self.threads {
            cfg.solver.threads = threads;
        }
        if let Some(tolerance) = self.tolerance {
            cfg.solver.tolerance = tolerance;
        }
        if let Some(max_iterations) = self.max_iterations {
            cfg.solver.max_iterations = max_iterations;
        }
        if let Some(size) = self.grid_size {
            cfg.grid.size = size;
            cfg.grid.upper_ratio = None;
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("rbc=info,rbc_vfi=info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}

/// Policy at `capital_index` for the middle productivity state, if in range.
fn check_value(solution: &Solution, capital_index: usize) -> Option<f64> {
    let middle = solution.policy.cols() / 2;
    solution.policy.try_get(capital_index, middle)
}

fn run_once(cli: &Cli, model: &Model, cfg: &RunConfig) -> Result<Solution> {
    let mut solver = Solver::new(model, cfg.solver.clone()).context("build solver")?;
    let mut observer = LogObserver::new(cfg.report.every);

    let cpu0 = precise_time_s();
    let solution = solver.solve_observed(&mut observer)?;
    let cpu1 = precise_time_s();

    match check_value(&solution, cli.check_index) {
        Some(check) => println!("My check = {}\n", check),
        None => info!(
            capital_index = cli.check_index,
            "check index outside the capital grid"
        ),
    }
    println!("Elapsed time is = {}", cpu1 - cpu0);
    Ok(solution)
}

fn run_samples(cli: &Cli, model: &Model, cfg: &RunConfig, runs: usize) -> Result<()> {
    let mut solver = Solver::new(model, cfg.solver.clone()).context("build solver")?;
    let mut reference: Option<Solution> = None;

    let mut samples = Vec::with_capacity(runs);
    for i in 0..runs {
        let cpu0 = precise_time_s();
        let solution = solver.solve_observed(&mut Silent)?;
        let cpu1 = precise_time_s();

        if let Some(first) = &reference {
            anyhow::ensure!(
                first.policy == solution.policy && first.value == solution.value,
                "sample #{} differs from sample #1",
                i + 1
            );
        } else {
            if let Some(check) = check_value(&solution, cli.check_index) {
                println!("My check = {}", check);
            }
            reference = Some(solution);
        }

        let diff = cpu1 - cpu0;
        println!("Sample #{}, Time: {}s", i + 1, diff);
        samples.push(diff);
    }

    samples.sort_by(|a, b| a.total_cmp(b));
    if let Some(median) = samples.get(samples.len() / 2) {
        println!("\nMedian time is = {}", median);
    }
    Ok(())
}

fn run(cli: Cli) -> Result<()> {
    let mut cfg = load_config(&cli.config)
        .with_context(|| format!("load config {}", cli.config.display()))?;
    cli.apply(&mut cfg);
    cfg.validate().context("validate config")?;

    let model = Model::new(cfg.calibration.clone(), &cfg.grid).context("build model")?;
    if let Some(ss) = model.steady_state() {
        println!(
            "Output = {}, Capital = {}, Consumption = {}",
            ss.output, ss.capital, ss.consumption
        );
    }
    info!(
        n_capital = model.n_capital(),
        n_productivity = model.n_productivity(),
        threads = cfg.solver.resolved_threads(),
        "model ready"
    );

    match cli.sample {
        Some(runs) => run_samples(&cli, &model, &cfg, runs.max(1)),
        None => run_once(&cli, &model, &cfg).map(|_| ()),
    }
}

fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            if let Some(Error::NonConvergence {
                iterations,
                max_difference,
                ..
            }) = err.downcast_ref::<Error>()
            {
                error!(iterations, max_difference, "solver stopped before converging");
            } else {
                error!("{:#}", err);
            }
            ExitCode::FAILURE
        }
    }
}

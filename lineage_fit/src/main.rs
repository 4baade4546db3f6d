//! Lineage Fit - CLI driver for growth-parameter inference
//!
//! Reads a measurement CSV and a parameter-bounds file, then runs any
//! combination of:
//! - `-m` likelihood maximisation over the free parameters
//! - `-s` 1D likelihood scans over each free parameter's grid
//! - `-p` posterior prediction (forward / backward / smoothed tables)

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::{debug, info, Level};
use tracing_subscriber::FmtSubscriber;

use lineage_core::{
    maximize_likelihood, scan_1d, seed_root_prior, smooth_tree, CellTree, CsvConfig, ParameterSet,
    TreeState,
};

mod output;
use output::{outfile_name, write_evaluations, write_predictions, Pass};

#[derive(Parser, Debug)]
#[command(name = "lineage_fit", about = "Growth-parameter inference on cell lineages")]
struct Cli {
    /// Input CSV with one measurement row per (cell, time point)
    #[arg(short = 'i', long = "infile")]
    infile: PathBuf,

    /// Parameter file: `key = value[, step, lower, upper]`
    #[arg(short = 'b', long = "parameter-bounds")]
    parameter_bounds: PathBuf,

    /// CSV column configuration file
    #[arg(short = 'c', long = "csv-config")]
    csv_config: Option<PathBuf>,

    /// Print level: 0 = warnings, 1 = info, 2+ = debug
    #[arg(short = 'l', long = "print-level", default_value_t = 0)]
    print_level: u8,

    /// Output directory (default: next to the input file)
    #[arg(short = 'o', long = "outdir")]
    outdir: Option<PathBuf>,

    /// Relative tolerance of the maximisation
    #[arg(short = 'r', long = "rel-tol", default_value_t = 1e-2)]
    rel_tol: f64,

    /// Run maximisation
    #[arg(short = 'm', long = "maximize")]
    maximize: bool,

    /// Run 1D scans over each free parameter
    #[arg(short = 's', long = "scan")]
    scan: bool,

    /// Run prediction with the current parameter values
    #[arg(short = 'p', long = "predict")]
    predict: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = match cli.print_level {
        0 => Level::WARN,
        1 => Level::INFO,
        _ => Level::DEBUG,
    };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber).expect("failed to set tracing subscriber");

    if !cli.infile.exists() {
        bail!("infile {} not found", cli.infile.display());
    }
    if !cli.parameter_bounds.exists() {
        bail!("parameter bounds file {} not found", cli.parameter_bounds.display());
    }

    let mut params = ParameterSet::from_file(&cli.parameter_bounds)
        .with_context(|| format!("reading {}", cli.parameter_bounds.display()))?;
    info!("parameters:\n{params}");

    let csv_config = match &cli.csv_config {
        Some(path) => CsvConfig::from_file(path).with_context(|| format!("reading {}", path.display()))?,
        None => CsvConfig::default(),
    };

    let tree = lineage_core::load_tree(&cli.infile, &csv_config)
        .with_context(|| format!("reading {}", cli.infile.display()))?;
    if tree.is_empty() {
        bail!("no cells in {}", cli.infile.display());
    }
    seed_root_prior(&mut params, &tree);
    debug!("genealogy:\n{tree}");

    if cli.maximize {
        run_maximization(&cli, &tree, &mut params)?;
    }
    if cli.scan {
        run_scan(&cli, &tree, &params)?;
    }
    if cli.predict {
        run_prediction(&cli, &tree, &params)?;
    }

    info!("done");
    Ok(())
}

fn run_maximization(cli: &Cli, tree: &CellTree, params: &mut ParameterSet) -> Result<()> {
    info!("-> maximisation");
    let (result, history) = maximize_likelihood(tree, params, cli.rel_tol);
    info!(
        evaluations = result.evaluations,
        converged = result.converged,
        "maximum log-likelihood: {}",
        result.value
    );
    info!("optimised parameters:\n{params}");

    let path = outfile_name(&cli.infile, cli.outdir.as_deref(), "_maximization");
    write_evaluations(&path, &history)?;
    info!("outfile: {}", path.display());
    Ok(())
}

fn run_scan(cli: &Cli, tree: &CellTree, params: &ParameterSet) -> Result<()> {
    info!("-> 1d scan");
    for idx in params.free_indices() {
        let name = params.all[idx].name.clone();
        let points = scan_1d(tree, params, idx);
        let path = outfile_name(&cli.infile, cli.outdir.as_deref(), &format!("_scan_{name}"));
        write_evaluations(&path, &points)?;
        info!(parameter = %name, points = points.len(), "outfile: {}", path.display());
    }
    Ok(())
}

fn run_prediction(cli: &Cli, tree: &CellTree, params: &ParameterSet) -> Result<()> {
    info!("-> prediction");
    let theta = params.theta();
    let mut state = TreeState::new(tree);
    smooth_tree(&theta, tree, &mut state).context("smoothing failed")?;

    for (pass, suffix) in [
        (Pass::Forward, "_prediction_forward"),
        (Pass::Backward, "_prediction_backward"),
        (Pass::Smoothed, "_prediction"),
    ] {
        let path = outfile_name(&cli.infile, cli.outdir.as_deref(), suffix);
        write_predictions(&path, tree, &state, pass)?;
        info!("outfile: {}", path.display());
    }
    Ok(())
}

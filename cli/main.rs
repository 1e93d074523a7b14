#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]

use clap::{Args, CommandFactory, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::fs::File;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::process;
use std::time::Duration;

use ocafit::config::FitConfig;
use ocafit::data::{load_observations, write_observation_fits};
use ocafit::estimate::fit_optics_model_with_progress;
use ocafit::marquardt::IterationRecord;
use ocafit::results::FitResult;
use ocafit::systematic::Systematic;

#[derive(Parser)]
#[command(
    name = "ocafit",
    about = "Optical-response model fitting for light-source calibration runs",
    long_about = "Fits extinction coefficients, photomultiplier angular response, source \
                 intensity distribution and run normalisations to occupancy ratios measured \
                 with a movable calibration light source."
)]
struct Cli {
    /// Log at debug level (overridden by RUST_LOG)
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Fit the optics model to a file of observations
    #[command(about = "Fit the optics model (outputs: result.toml)")]
    Fit(FitArgs),

    /// Print the parameters and report of a saved fit
    #[command(about = "Print a saved fit result")]
    Inspect {
        #[arg(value_name = "RESULT")]
        result: PathBuf,
    },
}

#[derive(Args)]
struct FitArgs {
    /// CSV file with one observation per row
    #[arg(value_name = "OBSERVATIONS")]
    observations: PathBuf,

    /// TOML fit configuration
    #[arg(long, value_name = "PATH")]
    config: PathBuf,

    /// Where to write the fit result
    #[arg(long, value_name = "PATH", default_value = "result.toml")]
    output: PathBuf,

    /// Systematic variation to apply, overriding the configuration
    /// (nominal, distribution_squared, flat_mask, source_radius)
    #[arg(long, value_name = "NAME")]
    systematic: Option<String>,

    /// Numeric value of the systematic (the offset of source_radius)
    #[arg(long, value_name = "VALUE", requires = "systematic")]
    systematic_value: Option<f64>,

    /// Optional CSV of per-observation predictions and pulls
    #[arg(long, value_name = "PATH")]
    residuals: Option<PathBuf>,
}

fn main() {
    let cli = Cli::parse();
    let Cli { verbose, command } = cli;

    let default_level = if verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();

    let result = match command {
        Some(Commands::Fit(args)) => run_fit(args),
        Some(Commands::Inspect { result }) => run_inspect(result),
        None => Cli::command().print_help().map_err(Into::into),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn create_spinner() -> ProgressBar {
    let draw_target = if std::io::stderr().is_terminal() {
        ProgressDrawTarget::stderr_with_hz(10)
    } else {
        ProgressDrawTarget::hidden()
    };
    let spinner = ProgressBar::with_draw_target(None, draw_target);
    if let Ok(style) = ProgressStyle::with_template("> [{elapsed_precise}] {spinner} {msg}") {
        spinner.set_style(style);
    }
    spinner.enable_steady_tick(Duration::from_millis(120));
    spinner
}

fn run_fit(args: FitArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = FitConfig::load(&args.config)?;
    if let Some(name) = &args.systematic {
        config.fit.systematic = Systematic::from_name(name, args.systematic_value)?;
        config.validate_settings()?;
    }
    let observations = load_observations(&args.observations)?;

    let spinner = create_spinner();
    spinner.set_message("Fitting optics model...");
    let progress = |record: &IterationRecord| {
        spinner.set_message(format!(
            "Iteration {}: chi-square {:.4}, lambda {:.1e}",
            record.iteration, record.chi_square, record.lambda
        ));
    };
    let fitted = fit_optics_model_with_progress(&config, &observations, progress);
    spinner.finish_and_clear();
    let fitted = fitted?;

    let result = FitResult::from(&fitted);
    result.save(&args.output)?;
    println!(
        "Fit {:?} after {} iterations: chi-square {:.4} ({} observations, {} varying parameters)",
        result.report.status,
        result.report.iterations,
        result.report.chi_square,
        result.report.n_observations,
        result.report.n_varying
    );
    println!("Result written to {}", args.output.display());

    if let Some(path) = &args.residuals {
        write_observation_fits(File::create(path)?, &observations, &fitted.annotations)?;
        println!("Residuals written to {}", path.display());
    }
    Ok(())
}

fn run_inspect(path: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let result = FitResult::load(&path)?;
    let report = &result.report;

    println!("Systematic: {}", result.systematic.name());
    println!(
        "Status: {:?} after {} iterations (covariance {:?})",
        report.status, report.iterations, report.covariance_status
    );
    println!(
        "Chi-square: {:.4} over {} observations and {} varying parameters (reduced {:.4})",
        report.chi_square, report.n_observations, report.n_varying, report.reduced_chi_square
    );
    println!(
        "Pulls: mean {:.4}, spread {:.4} ({} of {} finite)",
        report.residuals.mean,
        report.residuals.std_dev,
        report.residuals.finite,
        report.residuals.total
    );
    println!(
        "Census fixed {} angular-response bins and {} distribution bins",
        report.census.angular_bins_fixed, report.census.distribution_bins_fixed
    );
    println!();
    println!(
        "{:>5}  {:<36} {:>14} {:>12}  {}",
        "index", "name", "value", "error", "vary"
    );
    for parameter in &result.parameters {
        let value = parameter.final_value.unwrap_or(parameter.initial_value);
        let error = parameter
            .final_error
            .map_or_else(|| "-".to_string(), |e| format!("{e:.4e}"));
        println!(
            "{:>5}  {:<36} {:>14.6e} {:>12}  {}",
            parameter.index,
            parameter.name,
            value,
            error,
            if parameter.vary { "yes" } else { "fixed" }
        );
    }
    Ok(())
}

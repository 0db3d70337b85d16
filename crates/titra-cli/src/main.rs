//! # Titra CLI
//!
//! Command-line interface for titration speciation and signal fitting.

mod job;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use job::Job;
use ndarray::Array2;
use std::path::{Path, PathBuf};
use titra_core::{fitted_count, Parameter, Schedule};
use titra_signal::{fit_molar_responses, select_contributors};
use titra_speciation::{BindingModel, Speciation, SequentialDriver, SpeciationModel, Stoichiometry};

#[derive(Parser)]
#[command(name = "titra")]
#[command(version)]
#[command(about = "Equilibrium speciation for host-guest titrations", long_about = None)]
struct Cli {
    /// More log output (-v info, -vv debug); RUST_LOG overrides
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Speciate every addition point of a job
    Solve {
        /// Job file
        job: PathBuf,
        /// Override the job's schedule
        #[arg(short, long, value_enum)]
        schedule: Option<ScheduleArg>,
        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },

    /// Speciate, then fit molar responses to the job's signals
    FitSignals {
        /// Job file
        job: PathBuf,
        #[arg(short, long, value_enum)]
        schedule: Option<ScheduleArg>,
        #[arg(long)]
        json: bool,
    },

    /// List the built-in binding models
    Models,

    /// Validate a job and show its species and constants
    Check {
        /// Job file
        job: PathBuf,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum ScheduleArg {
    Sequential,
    Parallel,
    TwoPass,
}

impl From<ScheduleArg> for Schedule {
    fn from(arg: ScheduleArg) -> Self {
        match arg {
            ScheduleArg::Sequential => Schedule::Sequential,
            ScheduleArg::Parallel => Schedule::Parallel,
            ScheduleArg::TwoPass => Schedule::TwoPass,
        }
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Solve {
            job,
            schedule,
            json,
        } => {
            let loaded = load(&job)?;
            let (speciation, stoich, totals) = speciate(&loaded, schedule.map(Into::into), !json)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&speciation)?);
            } else {
                print_speciation(&speciation, &stoich, &totals);
                print_summary(&speciation, &loaded, &stoich, &totals)?;
            }
        }

        Commands::FitSignals {
            job,
            schedule,
            json,
        } => {
            let loaded = load(&job)?;
            let signals = loaded
                .signals()?
                .with_context(|| format!("{} has no signals", job.display()))?;
            let (speciation, stoich, _) = speciate(&loaded, schedule.map(Into::into), !json)?;
            let columns = loaded.contributors(&stoich)?;
            let concs = select_contributors(&speciation.free, &speciation.bound, &columns)?;
            let fit = fit_molar_responses(&concs, &signals).context("signal regression failed")?;

            if json {
                println!("{}", serde_json::to_string_pretty(&fit)?);
            } else {
                println!("{}", "Molar responses:".green().bold());
                for (k, name) in loaded.contributors.iter().enumerate() {
                    let row: Vec<String> = fit
                        .coefficients
                        .row(k)
                        .iter()
                        .map(|c| format!("{:>12.5e}", c))
                        .collect();
                    println!("  {:<14} {}", name.cyan(), row.join(" "));
                }
                println!();
                println!(
                    "  {} {:.4e} over {} points",
                    "RMS residual:".bold(),
                    fit.rms,
                    fit.points_used
                );
            }
        }

        Commands::Models => {
            println!("{}", "Built-in binding models:".green().bold());
            println!();
            for model in BindingModel::builtins() {
                let stoich = model.stoichiometry()?;
                println!(
                    "  {:<14} components: {:<8} constants: {}",
                    model.name().cyan(),
                    stoich.components().join(", "),
                    stoich.variable_names().join(", ")
                );
            }
            println!(
                "  {:<14} any stoichiometry given in a job file",
                "general".cyan()
            );
        }

        Commands::Check { job } => {
            let loaded = load(&job)?;
            let stoich = loaded.stoichiometry()?;
            let params = loaded.parameters(&stoich)?;
            let totals = loaded.totals()?;

            println!("{} {}", "Job:".green().bold(), job.display());
            println!("  Components: {}", stoich.components().join(", "));
            println!("  Outputs:    {}", stoich.output_names().join(", "));
            println!("  Points:     {}", totals.nrows());
            println!();
            println!("{}", "Constants:".green().bold());
            for (name, p) in stoich.variable_names().iter().zip(&params) {
                let value = match p {
                    Parameter::Known(v) => format!("{:e}", v),
                    Parameter::InitialGuess(v) => format!("{:e} {}", v, "(fitted)".yellow()),
                    Parameter::Unknown => "(fitted, no guess)".yellow().to_string(),
                };
                println!("  {:<10} {}", name.cyan(), value);
            }
            println!("  {} fitted of {}", fitted_count(&params), params.len());

            loaded.constants(&stoich)?;
            if let Some(signals) = loaded.signals()? {
                loaded.contributors(&stoich)?;
                anyhow::ensure!(
                    signals.nrows() == totals.nrows(),
                    "{} signal rows for {} points",
                    signals.nrows(),
                    totals.nrows()
                );
            }
            println!();
            println!("{}", "Job is valid".green());
        }
    }

    Ok(())
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
}

fn load(path: &Path) -> anyhow::Result<Job> {
    Job::load(path).with_context(|| format!("failed to read job {}", path.display()))
}

fn speciate(
    job: &Job,
    schedule: Option<Schedule>,
    show_progress: bool,
) -> anyhow::Result<(Speciation, Stoichiometry, Array2<f64>)> {
    let stoich = job.stoichiometry()?;
    let constants = job.constants(&stoich)?;
    let totals = job.totals()?;
    let model = SpeciationModel::from_flat(stoich.clone(), &constants)?;
    let driver = SequentialDriver::new(&model, job.options).with_warm_start(job.warm_start);

    let speciation = match schedule.unwrap_or(job.schedule) {
        Schedule::Sequential if show_progress => {
            let bar = ProgressBar::new(totals.nrows() as u64);
            bar.set_style(
                ProgressStyle::default_bar()
                    .template("{msg} {bar:40.cyan/blue} {pos}/{len} ({eta})")?
                    .progress_chars("##-"),
            );
            bar.set_message("speciation");
            let result = driver.run_with_progress(&totals, |done| bar.set_position(done as u64));
            bar.finish_and_clear();
            result?
        }
        other => driver.run_scheduled(&totals, other)?,
    };
    Ok((speciation, stoich, totals))
}

fn print_speciation(speciation: &Speciation, stoich: &Stoichiometry, totals: &Array2<f64>) {
    let mut header = vec!["#".to_string()];
    header.extend(stoich.components().iter().map(|c| format!("{} total", c)));
    header.extend(stoich.components().iter().map(|c| format!("{} free", c)));
    header.extend(stoich.output_names());
    println!(
        "{}",
        header
            .iter()
            .map(|h| format!("{:>14}", h))
            .collect::<String>()
            .bold()
    );

    for i in 0..speciation.n_points() {
        println!("{}", table_row(i, speciation, totals));
    }
}

/// Totals, free and bound concentrations of point `i`
fn table_row(i: usize, speciation: &Speciation, totals: &Array2<f64>) -> String {
    let mut line = format!("{:>14}", i);
    let (total, free, bound) = (totals.row(i), speciation.free.row(i), speciation.bound.row(i));
    for v in total.iter().chain(free.iter()).chain(bound.iter()) {
        line.push_str(&format!("{:>14.4e}", v));
    }
    line
}

fn print_summary(
    speciation: &Speciation,
    job: &Job,
    stoich: &Stoichiometry,
    totals: &Array2<f64>,
) -> anyhow::Result<()> {
    let model = SpeciationModel::from_flat(stoich.clone(), &job.constants(stoich)?)?;
    let error = speciation.max_mass_balance_error(&model, totals)?;
    let stats = &speciation.stats;

    println!();
    println!("{}", "Summary:".green().bold());
    println!("  Points:             {}", stats.points);
    println!("  Iterations:         {}", stats.iterations);
    println!("  Refine passes:      {}", stats.refine_passes);
    println!("  Mass balance error: {:.3e}", error);
    if stats.accuracy_warnings > 0 {
        println!(
            "  {}",
            format!(
                "{} points did not reach the requested accuracy (max gradient {:.3e})",
                stats.accuracy_warnings, stats.max_gradient_norm
            )
            .yellow()
        );
    }
    Ok(())
}

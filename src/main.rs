use clap::{CommandFactory, Parser, Subcommand};
use fiml::config::EngineConfig;
use fiml::context::{FitContext, InfoMethod, Want};
use fiml::export::export_state;
use fiml::model_file::{LoadedModel, load_model};
use std::fs;
use std::path::PathBuf;
use std::process;

#[derive(Parser)]
#[command(
    name = "fiml",
    version,
    about = "Row-wise full-information likelihood evaluation for matrix-algebra models",
    long_about = "Loads a TOML model description with its CSV data, evaluates the fit \
                 function once at the starting values and reports the result."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Evaluate a model's fit function at its starting values
    Evaluate {
        /// Path to the TOML model file
        #[arg(value_name = "MODEL")]
        model: PathBuf,

        /// Engine settings file; command-line flags override it
        #[arg(long)]
        config: Option<PathBuf>,

        /// Number of workers for row evaluation
        #[arg(long)]
        workers: Option<usize>,

        /// Report per-row log-likelihoods instead of the summed fit
        #[arg(long)]
        row_likelihoods: bool,

        /// Also request gradient and Hessian and print the information matrix
        #[arg(long)]
        derivatives: bool,

        /// How the information matrix is assembled (hessian or meat)
        #[arg(long)]
        info_method: Option<InfoMethod>,

        /// Log every derivative-name mapping
        #[arg(long)]
        verbose: bool,

        /// Write the evaluated state as TOML to this path
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let Cli { command } = Cli::parse();

    let result = match command {
        Some(Commands::Evaluate {
            model,
            config,
            workers,
            row_likelihoods,
            derivatives,
            info_method,
            verbose,
            output,
        }) => {
            let overrides = Overrides {
                workers,
                row_likelihoods,
                info_method,
                verbose,
            };
            run_evaluate(model, config, overrides, derivatives, output)
        }
        None => {
            if let Err(e) = Cli::command().print_help() {
                eprintln!("Error: {e}");
                process::exit(1);
            }
            println!();
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

struct Overrides {
    workers: Option<usize>,
    row_likelihoods: bool,
    info_method: Option<InfoMethod>,
    verbose: bool,
}

fn run_evaluate(
    model: PathBuf,
    config: Option<PathBuf>,
    overrides: Overrides,
    derivatives: bool,
    output: Option<PathBuf>,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = match config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    if let Some(workers) = overrides.workers {
        config.workers = workers;
    }
    if let Some(method) = overrides.info_method {
        config.info_method = method;
    }
    config.return_row_likelihoods |= overrides.row_likelihoods;
    config.verbose |= overrides.verbose;

    let LoadedModel { mut state, mut fit } = load_model(&model, &config)?;
    let mut fc = FitContext::for_state(&state, config.info_method);
    let want = if derivatives {
        Want::FIT | Want::GRADIENT | Want::HESSIAN | Want::INFO
    } else {
        Want::FIT
    };

    state.next_evaluation();
    let ok = fit.evaluate(&mut state, want, &mut fc);
    if !ok {
        return Err(state.status().message.clone().into());
    }
    if state.status().is_warning() {
        eprintln!("Warning: {}", state.status().message);
    }

    println!("{}: {}", fit.name(), fit.fit_value());
    for result in fit.final_results() {
        if result.values.len() == 1 {
            println!("  {} = {}", result.label, result.values[0]);
        } else {
            println!("  {} ({}x{})", result.label, result.rows, result.cols);
        }
    }
    if derivatives {
        let names: Vec<&str> = state
            .free_vars()
            .vars()
            .iter()
            .map(|v| v.name.as_str())
            .collect();
        println!("gradient:");
        for (name, g) in names.iter().zip(fc.grad.iter()) {
            println!("  {name} = {g}");
        }
        let info = match config.info_method {
            InfoMethod::Hessian => fc.assemble_information(),
            InfoMethod::Meat => fc.meat_information(),
        };
        println!("information ({}):", config.info_method);
        for row in info.rows() {
            let cells: Vec<String> = row.iter().map(|v| format!("{v:.6}")).collect();
            println!("  [{}]", cells.join(", "));
        }
    }

    if let Some(path) = output {
        let exported = export_state(&mut state, &[fit.as_ref()])?;
        fs::write(&path, toml::to_string_pretty(&exported)?)?;
        eprintln!("> Wrote evaluated state to {}", path.display());
    }
    state.destroy_children();
    Ok(())
}

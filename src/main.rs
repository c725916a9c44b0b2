use advnet::attacks::AttackParams;
use advnet::dataset::{load_mnist, IndexRanges};
use advnet::diagnostics::color_remap_probe;
use advnet::tutorial::{mnist_tutorial, TutorialParams};

use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
    /// Pin the worker thread pool size
    #[arg(long, global = true)]
    num_threads: Option<usize>,
}

#[derive(Subcommand)]
enum Commands {
    /// Train an MNIST model and evaluate it against FGSM adversarial examples
    Tutorial {
        /// Model size multiplier
        #[arg(long, default_value_t = 64)]
        nb_filters: usize,
        #[arg(long, default_value_t = 10)]
        nb_epochs: usize,
        #[arg(long, default_value_t = 128)]
        batch_size: usize,
        #[arg(long, default_value_t = 0.001)]
        learning_rate: f32,
        /// Train on clean examples
        #[arg(long, default_value_t = true, action = ArgAction::Set)]
        clean_train: bool,
        /// Backprop through adversarial example construction during
        /// adversarial training (no effect for FGSM)
        #[arg(long, action = ArgAction::SetTrue)]
        backprop_through_attack: bool,
        /// Repeat the process with adversarial training
        #[arg(long, action = ArgAction::SetTrue)]
        adv_train: bool,
        /// Also report train-set accuracies
        #[arg(long, action = ArgAction::SetTrue)]
        testing: bool,
        /// FGSM perturbation size
        #[arg(long, default_value_t = 0.3)]
        eps: f32,
        #[arg(long, default_value_t = 1234)]
        seed: u64,
        /// Directory holding the MNIST ubyte files
        #[arg(long, default_value = "data/mnist")]
        data_dir: PathBuf,
        /// Checkpoint directory
        #[arg(long, default_value = "checkpoints/")]
        save_dir: PathBuf,
    },
    /// Exercise the color-table and index-gather plumbing
    Probe {
        #[arg(long, default_value_t = 1234)]
        seed: u64,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")),
        )
        .init();

    let cli = Cli::parse();

    if let Some(n) = cli.num_threads {
        if let Err(e) = rayon::ThreadPoolBuilder::new().num_threads(n).build_global() {
            warn!("could not pin thread pool: {}", e);
        }
    }

    match cli.command {
        Commands::Tutorial {
            nb_filters,
            nb_epochs,
            batch_size,
            learning_rate,
            clean_train,
            backprop_through_attack,
            adv_train,
            testing,
            eps,
            seed,
            data_dir,
            save_dir,
        } => {
            let params = TutorialParams {
                nb_epochs,
                batch_size,
                learning_rate,
                nb_filters,
                clean_train,
                testing,
                backprop_through_attack,
                adv_train,
                attack: AttackParams {
                    eps,
                    ..AttackParams::default()
                },
                seed,
                save_dir: Some(save_dir),
                ..TutorialParams::default()
            };

            let report = load_mnist(&data_dir, &IndexRanges::default())
                .and_then(|data| mnist_tutorial(&params, &data));
            match report {
                Ok(report) => info!("{:?}", report),
                Err(e) => {
                    eprintln!("Error running tutorial: {}", e);
                    std::process::exit(1);
                }
            }
        }
        Commands::Probe { seed } => {
            let report = color_remap_probe(seed);
            info!("{:?}", report);
        }
    }
}

//! trl CLI
//!
//! Command-line driver for PPO fine-tuning of a small language model against
//! a lexicon sentiment reward.

use anyhow::{bail, Context, Result};
use candle_core::Device;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

use trl::prelude::*;

const DEMO_PROMPTS: &[&str] = &[
    "the movie was",
    "this film is",
    "i thought the plot",
    "the acting felt",
    "overall the story",
    "the ending was",
    "my friends said it",
    "the soundtrack is",
    "honestly this movie",
    "the director made",
    "every scene was",
    "the characters are",
    "i left the cinema",
    "the dialogue was",
    "this sequel is",
    "the first hour",
    "the special effects",
    "watching it again",
    "the cast was",
    "the script felt",
    "compared to the book",
    "the pacing was",
    "the final scene",
    "the villain was",
    "critics called it",
    "the camera work",
    "the jokes were",
    "my kids thought it",
    "the romance felt",
    "the twist was",
    "the opening scene",
    "in the end it was",
];

#[derive(Parser)]
#[command(name = "trl")]
#[command(version, about = "trl - PPO fine-tuning for language models", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fine-tune a tiny language model towards positive sentiment
    Train {
        /// JSON trainer config; flags below override it
        #[arg(long)]
        config: Option<PathBuf>,

        /// Prompt file, one prompt per line (built-in movie prompts otherwise)
        #[arg(long)]
        prompts: Option<PathBuf>,

        /// Number of iterations
        #[arg(long)]
        epochs: Option<usize>,

        /// Rollouts per iteration
        #[arg(long)]
        batch_size: Option<usize>,

        /// Sub-batch size for forward passes and updates
        #[arg(long)]
        forward_batch_size: Option<usize>,

        /// Learning rate
        #[arg(long)]
        lr: Option<f64>,

        /// Random seed
        #[arg(long)]
        seed: Option<u64>,

        /// Hidden size of the model
        #[arg(long, default_value = "32")]
        hidden_size: usize,

        /// Where the trained model is written
        #[arg(long, default_value = "trl-output")]
        output_dir: PathBuf,

        /// Append per-iteration statistics to this JSON-lines file
        #[arg(long)]
        jsonl: Option<PathBuf>,

        /// TensorBoard log directory (requires --features tensorboard)
        #[arg(long)]
        tensorboard: Option<PathBuf>,

        /// Disable the progress bar
        #[arg(long)]
        no_progress: bool,
    },

    /// Print the default trainer config as JSON
    Config,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Train {
            config,
            prompts,
            epochs,
            batch_size,
            forward_batch_size,
            lr,
            seed,
            hidden_size,
            output_dir,
            jsonl,
            tensorboard,
            no_progress,
        } => {
            let mut config = match config {
                Some(path) => TrainerConfig::from_json_file(&path)
                    .with_context(|| format!("failed to read config {}", path.display()))?,
                None => demo_config(),
            };
            if let Some(epochs) = epochs {
                config.epochs = epochs;
            }
            if let Some(bs) = batch_size {
                config.batch_size = bs;
            }
            if let Some(fbs) = forward_batch_size {
                config.forward_batch_size = fbs;
            }
            if let Some(lr) = lr {
                config.lr = lr;
            }
            if let Some(seed) = seed {
                config.seed = seed;
            }

            let prompts = match prompts {
                Some(path) => read_prompts(&path)?,
                None => DEMO_PROMPTS.iter().map(|s| s.to_string()).collect(),
            };

            let options = TrainOptions {
                hidden_size,
                output_dir,
                jsonl,
                tensorboard,
                progress: !no_progress,
            };
            train(config, &prompts, options)?;
        }
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&TrainerConfig::default())?);
        }
    }

    Ok(())
}

struct TrainOptions {
    hidden_size: usize,
    output_dir: PathBuf,
    jsonl: Option<PathBuf>,
    tensorboard: Option<PathBuf>,
    progress: bool,
}

/// Defaults sized for the built-in prompt pool on a CPU.
fn demo_config() -> TrainerConfig {
    TrainerConfig::default()
        .with_batch_size(16, 4)
        .with_lengths(4, 12)
        .with_lr(1e-3)
        .with_epochs(20)
}

fn read_prompts(path: &Path) -> Result<Vec<String>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read prompts {}", path.display()))?;
    let prompts: Vec<String> = text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect();
    if prompts.is_empty() {
        bail!("no prompts in {}", path.display());
    }
    Ok(prompts)
}

fn train(config: TrainerConfig, prompts: &[String], options: TrainOptions) -> Result<()> {
    config.validate()?;

    let device = Device::Cpu;
    let alphabet = "abcdefghijklmnopqrstuvwxyz .,!'";
    let tokenizer =
        CharTokenizer::from_corpus(prompts.iter().map(String::as_str).chain([alphabet]));

    let lm_config = TinyLmConfig {
        vocab_size: tokenizer.vocab_size(),
        hidden_size: options.hidden_size,
        max_position_embeddings: config.seq_len().max(64),
        ..Default::default()
    };
    let policy = TinyCausalLm::new(lm_config, &device)?;
    let reference = policy.frozen_copy()?;
    tracing::info!(
        vocab = tokenizer.vocab_size(),
        parameters = policy.num_parameters(),
        prompts = prompts.len(),
        "Created policy"
    );

    let sampler = MultinomialSampler::new(SamplerConfig {
        seed: config.seed,
        ..Default::default()
    });
    let trainer = PpoTrainer::new(policy, reference, config)?;

    let mut logger = CompositeLogger::default();
    logger.add(Box::new(ConsoleLogger::with_prefixes([
        "env/reward",
        "objective/kl",
        "ppo/loss/total",
    ])));
    if let Some(path) = &options.jsonl {
        logger.add(Box::new(JsonLinesLogger::new(path)?));
    }
    if let Some(dir) = &options.tensorboard {
        add_tensorboard(&mut logger, dir);
    }

    let mut runner = RlhfRunner::new(
        trainer,
        Box::new(sampler),
        Box::new(LexiconSentiment::default()),
        Box::new(tokenizer),
    )?
    .with_logger(Box::new(logger));
    if options.progress {
        runner = runner.with_progress_bar();
    }

    let summary = runner.run(prompts)?;
    let path = runner.save_pretrained(&options.output_dir)?;

    let first = summary.mean_rewards.first().copied().unwrap_or(0.0);
    let last = summary.mean_rewards.last().copied().unwrap_or(0.0);
    println!("Training complete: {} iterations", summary.iterations);
    println!("Mean reward: {first:.4} -> {last:.4}");
    println!("Final KL coefficient: {:.6}", summary.final_kl_coef);
    println!("Elapsed: {:.2?}", summary.elapsed);
    println!("Saved model to {}", path.display());

    Ok(())
}

#[cfg(feature = "tensorboard")]
fn add_tensorboard(logger: &mut CompositeLogger, dir: &Path) {
    logger.add(Box::new(TensorBoardLogger::new(dir)));
}

#[cfg(not(feature = "tensorboard"))]
fn add_tensorboard(_logger: &mut CompositeLogger, dir: &Path) {
    tracing::warn!(
        dir = %dir.display(),
        "TensorBoard logging requires the 'tensorboard' feature; ignoring"
    );
}

use std::path::PathBuf;
use std::sync::mpsc;
use std::thread;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};

use pxscramble::config::{
    cluster_size_table, validate_block_size, CipherDirection, ColorProcessing, RenderConfig,
};
use pxscramble::scheduler::{CancelToken, RenderEvent, RenderJob, Scheduler, TerminationReason};
use pxscramble::secret::CipherSecret;

#[derive(Debug, Parser)]
#[command(name = "pxscramble")]
#[command(about = "Key-derived reversible pixel scrambling on the GPU")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Scramble an image with a password or key file
    Scramble(RunArgs),
    /// Invert a previous scramble with the same secret and options
    Unscramble(RunArgs),
    /// List the cluster sizes usable with a block size
    Divisors { block_size: u32 },
}

#[derive(Debug, Args)]
struct RunArgs {
    /// Input image
    input: PathBuf,

    /// Secret password
    #[arg(long, conflicts_with = "key_file")]
    password: Option<String>,

    /// File whose bytes act as the secret
    #[arg(long)]
    key_file: Option<PathBuf>,

    /// Scrambling tile edge, in pixels
    #[arg(long, default_value_t = 256)]
    block_size: u32,

    /// Pixels per edge that share one instruction; must divide the block size
    #[arg(long)]
    cluster_size: Option<u32>,

    /// Pass composition
    #[arg(long, value_enum, default_value_t = ColorArg::Permute)]
    color_processing: ColorArg,

    /// Directory the output artifact is written into
    #[arg(short = 'o', long, default_value = ".")]
    output_dir: PathBuf,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ColorArg {
    Permute,
    #[value(name = "2-pass-permute")]
    TwoPassPermute,
    Substitute,
    Both,
}

impl From<ColorArg> for ColorProcessing {
    fn from(value: ColorArg) -> Self {
        match value {
            ColorArg::Permute => Self::Permute,
            ColorArg::TwoPassPermute => Self::TwoPassPermute,
            ColorArg::Substitute => Self::Substitute,
            ColorArg::Both => Self::Both,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Scramble(args) => run(args, CipherDirection::Forward),
        Commands::Unscramble(args) => run(args, CipherDirection::Inverse),
        Commands::Divisors { block_size } => run_divisors(block_size),
    }
}

fn run_divisors(block_size: u32) -> Result<()> {
    let table = cluster_size_table(block_size);
    if table.is_empty() {
        bail!("block size {block_size} admits no usable cluster size");
    }
    println!(
        "{}",
        table
            .iter()
            .map(u32::to_string)
            .collect::<Vec<_>>()
            .join(" ")
    );
    Ok(())
}

fn run(args: RunArgs, direction: CipherDirection) -> Result<()> {
    let (width, height) = image::image_dimensions(&args.input)
        .with_context(|| format!("failed reading {}", args.input.display()))?;
    validate_block_size(args.block_size, width.min(height))?;

    let table = cluster_size_table(args.block_size);
    let cluster_size = match args.cluster_size {
        Some(value) => {
            if !table.is_empty() && !table.contains(&value) {
                bail!(
                    "cluster size {value} is not usable with block size {}; choose one of: {}",
                    args.block_size,
                    table
                        .iter()
                        .map(u32::to_string)
                        .collect::<Vec<_>>()
                        .join(" ")
                );
            }
            value
        }
        // An empty table means no candidate exists at all; keep 1 and let
        // planning report the degenerate block size.
        None => table.first().copied().unwrap_or(1),
    };

    eprintln!("[pxscramble] Generating key...");
    let sequence_length = (args.block_size as usize).pow(2);
    let secret = match (&args.password, &args.key_file) {
        (Some(password), _) => CipherSecret::from_password(password, sequence_length),
        (None, Some(path)) => CipherSecret::from_file(path, sequence_length)?,
        (None, None) => bail!("provide a secret with --password or --key-file"),
    };

    let job = RenderJob {
        input: args.input,
        output_dir: args.output_dir,
        config: RenderConfig::new(secret, cluster_size, args.block_size),
        direction,
        color_processing: args.color_processing.into(),
    };

    let (sender, receiver) = mpsc::channel();
    let worker = thread::Builder::new()
        .name("pxscramble-render".to_owned())
        .spawn(move || {
            let mut scheduler = Scheduler::new();
            scheduler.run(&job, &sender, &CancelToken::new());
        })
        .context("failed to spawn render thread")?;

    let mut failure = None;
    for event in receiver {
        match event {
            RenderEvent::Progress(message) => eprintln!("[pxscramble] {message}"),
            RenderEvent::PassCompleted(label) => eprintln!("[pxscramble] {label} completed"),
            RenderEvent::Succeeded(path) => println!("Wrote {}", path.display()),
            RenderEvent::Terminated(TerminationReason::Cancelled) => {
                failure = Some(anyhow!("run cancelled"));
            }
            RenderEvent::Terminated(TerminationReason::Failed(message)) => {
                failure = Some(anyhow!(message));
            }
        }
    }

    worker
        .join()
        .map_err(|_| anyhow!("render thread panicked"))?;
    match failure {
        Some(error) => Err(error),
        None => Ok(()),
    }
}

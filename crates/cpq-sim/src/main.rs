mod workload;

use anyhow::bail;
use clap::{Args, Parser, Subcommand};
use cpq_core::command::MAX_COMMAND_SIZE;
use cpq_core::QueueConfig;

#[derive(Parser)]
#[command(name = "cpq-sim")]
#[command(about = "Run command-queue workloads against the simulated coprocessor", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[command(flatten)]
    rings: RingArgs,

    /// Suppress the report
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Args)]
struct RingArgs {
    /// Primary ring capacity in words
    #[arg(long, global = true, default_value = "2048")]
    lowpri_words: u32,

    /// High-priority ring capacity in words
    #[arg(long, global = true, default_value = "512")]
    highpri_words: u32,
}

impl RingArgs {
    fn config(&self) -> anyhow::Result<QueueConfig> {
        let min = 2 * (MAX_COMMAND_SIZE as u32 + 1);
        if self.lowpri_words < min || self.highpri_words < min {
            bail!("rings must hold at least {min} words");
        }
        Ok(QueueConfig {
            lowpri_ring_words: self.lowpri_words,
            highpri_ring_words: self.highpri_words,
            ..QueueConfig::default()
        })
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Stream mixed-size overlay commands
    Stream {
        /// Number of commands
        #[arg(short = 'n', long, default_value = "100000")]
        commands: u32,

        /// Wait on a syncpoint every this many commands (0: never)
        #[arg(long, default_value = "0")]
        sync_every: u32,
    },
    /// Record nested blocks and replay them
    Blocks {
        /// Commands per block
        #[arg(long, default_value = "200")]
        block_len: u32,

        /// Nesting depth (1 to 8)
        #[arg(long, default_value = "4")]
        depth: u32,

        /// Replays of the outermost block
        #[arg(long, default_value = "100")]
        runs: u32,
    },
    /// Interleave high-priority brackets with the primary stream
    Highpri {
        /// Primary commands
        #[arg(short = 'n', long, default_value = "50000")]
        commands: u32,

        /// Open a bracket every this many primary commands
        #[arg(long, default_value = "1000")]
        every: u32,

        /// Commands per bracket
        #[arg(long, default_value = "8")]
        bracket_len: u32,
    },
    /// Draw textured rectangles through the rasterizer layer
    Rdp {
        /// Number of rectangles
        #[arg(short = 'n', long, default_value = "1000")]
        rects: u32,
    },
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    let config = cli.rings.config()?;

    let report = match cli.command {
        Commands::Stream {
            commands,
            sync_every,
        } => workload::stream(config, commands, sync_every)?,
        Commands::Blocks {
            block_len,
            depth,
            runs,
        } => workload::blocks(config, block_len, depth, runs)?,
        Commands::Highpri {
            commands,
            every,
            bracket_len,
        } => workload::highpri(config, commands, every, bracket_len)?,
        Commands::Rdp { rects } => workload::rdp(config, rects)?,
    };

    if !cli.quiet {
        report.print();
    }
    Ok(())
}

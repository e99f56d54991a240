use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod commands;

#[derive(Parser)]
#[command(name = "csv-relay")]
#[command(about = "Stream CSV rows through Kafka and rebuild the files", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to a YAML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging (-v for debug, -vv for trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Publish every row of every CSV file in a directory
    Emit {
        /// Directory to read source files from
        #[arg(short, long)]
        dir: Option<PathBuf>,

        /// Kafka bootstrap servers (comma-separated)
        #[arg(long, value_delimiter = ',')]
        bootstrap_servers: Vec<String>,

        /// Topic to publish to
        #[arg(short, long)]
        topic: Option<String>,

        /// Extension of source files, without the dot
        #[arg(long)]
        extension: Option<String>,

        /// Acknowledgments to wait for
        #[arg(long, value_enum)]
        acks: Option<AcksArg>,

        /// Do not create the topic when it is missing
        #[arg(long)]
        no_create_topic: bool,
    },

    /// Consume the topic and rebuild one CSV file per source
    Materialize {
        /// Directory to write reconstructed files to
        #[arg(short, long)]
        dir: Option<PathBuf>,

        /// Kafka bootstrap servers (comma-separated)
        #[arg(long, value_delimiter = ',')]
        bootstrap_servers: Vec<String>,

        /// Topic to consume
        #[arg(short, long)]
        topic: Option<String>,

        /// Where to start reading each partition
        #[arg(long, value_enum)]
        start_offset: Option<StartOffsetArg>,

        /// How values are matched to header columns
        #[arg(long, value_enum)]
        column_alignment: Option<ColumnAlignmentArg>,

        /// Do not commit consumed offsets
        #[arg(long)]
        no_commit: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum AcksArg {
    All,
    Leader,
}

#[derive(Clone, Copy, ValueEnum)]
enum StartOffsetArg {
    Earliest,
    Committed,
}

#[derive(Clone, Copy, ValueEnum)]
enum ColumnAlignmentArg {
    Positional,
    ByName,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    // Priority: RUST_LOG env var > verbose flag > default (info)
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        match cli.verbose {
            0 => EnvFilter::new("info"),
            1 => EnvFilter::new("debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    let mut config = commands::load_config(cli.config.as_deref()).await?;

    let exit_code = match cli.command {
        Commands::Emit {
            dir,
            bootstrap_servers,
            topic,
            extension,
            acks,
            no_create_topic,
        } => {
            commands::apply_common(&mut config, bootstrap_servers, topic);
            if let Some(dir) = dir {
                config.emitter.input_dir = dir;
            }
            if let Some(extension) = extension {
                config.emitter.extension = extension;
            }
            if let Some(acks) = acks {
                config.emitter.acks = match acks {
                    AcksArg::All => csv_relay_core::Acks::All,
                    AcksArg::Leader => csv_relay_core::Acks::Leader,
                };
            }
            if no_create_topic {
                config.emitter.create_topic.enabled = false;
            }
            commands::emit::run(config).await?
        }
        Commands::Materialize {
            dir,
            bootstrap_servers,
            topic,
            start_offset,
            column_alignment,
            no_commit,
        } => {
            commands::apply_common(&mut config, bootstrap_servers, topic);
            if let Some(dir) = dir {
                config.materializer.output_dir = dir;
            }
            if let Some(start_offset) = start_offset {
                config.materializer.start_offset = match start_offset {
                    StartOffsetArg::Earliest => csv_relay_core::StartOffset::Earliest,
                    StartOffsetArg::Committed => csv_relay_core::StartOffset::Committed,
                };
            }
            if let Some(alignment) = column_alignment {
                config.materializer.column_alignment = match alignment {
                    ColumnAlignmentArg::Positional => csv_relay_core::ColumnAlignment::Positional,
                    ColumnAlignmentArg::ByName => csv_relay_core::ColumnAlignment::ByName,
                };
            }
            if no_commit {
                config.materializer.commit_offsets = false;
            }
            commands::materialize::run(config).await?
        }
    };

    if exit_code != 0 {
        std::process::exit(exit_code);
    }
    Ok(())
}

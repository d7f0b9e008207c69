use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

use esri_harvest::app::{App, ProgressSink, ScrapeOptions};
use esri_harvest::client::EsriHttpClient;
use esri_harvest::config::ConfigLoader;
use esri_harvest::error::HarvestError;
use esri_harvest::output::{
    JsonOutput, LogSink, OutputMode, print_check_summary, print_explore_summary,
    print_scrape_summary,
};

#[derive(Parser)]
#[command(name = "esri-harvest")]
#[command(about = "Crawl an ArcGIS REST services directory and download every layer")]
#[command(version)]
struct Cli {
    /// Config file (default: esri-harvest.json in the current directory)
    #[arg(long, global = true)]
    config: Option<String>,

    /// Print the command result as JSON on stdout
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Walk the folder tree and record every layer in the catalog")]
    Explore,
    #[command(about = "Download layers, retrying whole runs until finished")]
    Scrape(ScrapeArgs),
    #[command(about = "Match missing layers against downloaded ones")]
    Check,
}

#[derive(Args)]
struct ScrapeArgs {
    /// Make a single pass without the retry loop
    #[arg(long)]
    once: bool,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(error) = report.downcast_ref::<HarvestError>() {
            return ExitCode::from(map_exit_code(error));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &HarvestError) -> u8 {
    if error.is_config() {
        2
    } else if error.is_remote() {
        3
    } else {
        1
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let output_mode = if cli.json {
        OutputMode::Json
    } else {
        OutputMode::Text
    };

    let config = ConfigLoader::resolve(cli.config.as_deref())?;
    let client = EsriHttpClient::new(&config.base_url, config.page_size)?;
    let app = App::new(config, client);
    let sink: &dyn ProgressSink = match output_mode {
        OutputMode::Json => &JsonOutput,
        OutputMode::Text => &LogSink,
    };

    match cli.command {
        Commands::Explore => {
            let result = app.explore(sink)?;
            match output_mode {
                OutputMode::Json => JsonOutput::print_explore(&result).into_diagnostic()?,
                OutputMode::Text => print_explore_summary(&result),
            }
        }
        Commands::Scrape(args) => {
            let result = app.scrape(ScrapeOptions { once: args.once }, sink)?;
            match output_mode {
                OutputMode::Json => JsonOutput::print_scrape(&result).into_diagnostic()?,
                OutputMode::Text => print_scrape_summary(&result),
            }
        }
        Commands::Check => {
            let result = app.check(sink)?;
            match output_mode {
                OutputMode::Json => JsonOutput::print_check(&result).into_diagnostic()?,
                OutputMode::Text => print_check_summary(&result),
            }
        }
    }

    Ok(())
}

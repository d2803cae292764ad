use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use dialoguer::theme::ColorfulTheme;
use dialoguer::{Confirm, Input, Select};
use stagewatch_adapters::{DEFAULT_DURATION, DEFAULT_LOCATION, DEFAULT_START_DATE};
use stagewatch_core::{RawCandidate, KNOWN_DOMAINS};
use stagewatch_storage::{DatasetStore, JsonDatasetStore};
use stagewatch_sync::{run_sync_once_from_env, DatasetStats, SyncConfig, SyncPipeline};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "stagewatch")]
#[command(about = "Track finance internships posted on Swiss job boards")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Scrape every enabled source once and merge the results into the dataset
    Sync,
    /// Add a listing by hand
    Add(AddArgs),
    /// Print listing counts by domain and location
    Stats,
    /// Run the sync on the configured cron schedule until Ctrl-C
    Schedule,
}

#[derive(Debug, Default, Args)]
struct AddArgs {
    #[arg(long)]
    company: Option<String>,
    #[arg(long)]
    title: Option<String>,
    #[arg(long)]
    domain: Option<String>,
    #[arg(long)]
    location: Option<String>,
    #[arg(long)]
    duration: Option<String>,
    #[arg(long)]
    start_date: Option<String>,
    #[arg(long)]
    link: Option<String>,
    /// Save without asking for confirmation
    #[arg(long)]
    yes: bool,
}

impl AddArgs {
    fn is_complete(&self) -> bool {
        self.company.is_some() && self.title.is_some()
    }

    fn to_candidate(&self) -> RawCandidate {
        RawCandidate {
            company: self.company.clone(),
            title: self.title.clone(),
            domain: self.domain.clone(),
            location: self.location.clone(),
            duration: self.duration.clone(),
            start_date: self.start_date.clone(),
            link: self.link.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("stagewatch=info".parse()?))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let summary = run_sync_once_from_env().await?;
            println!("sync complete: {}", summary.one_line());
            if let Some(dir) = &summary.reports_dir {
                println!("reports: {dir}");
            }
        }
        Commands::Add(args) => {
            let pipeline = SyncPipeline::new(SyncConfig::from_env())?;
            if args.is_complete() {
                save_listing(&pipeline, args.to_candidate()).await?;
            } else {
                add_interactively(&pipeline, &args).await?;
            }
        }
        Commands::Stats => {
            let data_file = SyncConfig::from_env().data_file;
            let dataset = JsonDatasetStore::new(data_file).load().await;
            println!("{}", DatasetStats::from_dataset(&dataset).to_markdown());
        }
        Commands::Schedule => {
            let pipeline = Arc::new(SyncPipeline::new(SyncConfig {
                scheduler_enabled: true,
                ..SyncConfig::from_env()
            })?);
            let mut sched = pipeline
                .maybe_build_scheduler()
                .await?
                .context("scheduler not built")?;
            sched.start().await.context("starting scheduler")?;
            info!("scheduler running; press Ctrl-C to stop");
            tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}

async fn save_listing(pipeline: &SyncPipeline, candidate: RawCandidate) -> Result<()> {
    let outcome = pipeline.add_listing(candidate).await?;
    let verb = if outcome.replaced { "updated" } else { "added" };
    println!(
        "{verb}: {} / {} ({} listings in {})",
        outcome.listing.company,
        outcome.listing.title,
        outcome.total,
        pipeline.config().data_file.display()
    );
    Ok(())
}

async fn add_interactively(pipeline: &SyncPipeline, args: &AddArgs) -> Result<()> {
    let theme = ColorfulTheme::default();
    let mut first = true;
    loop {
        // Flags only seed the first entry.
        let seed = if first { args.to_candidate() } else { RawCandidate::default() };
        first = false;

        let candidate = prompt_listing(&theme, seed)?;
        print_candidate(&candidate);

        let confirmed = args.yes
            || Confirm::with_theme(&theme)
                .with_prompt("Save this listing?")
                .default(true)
                .interact()?;
        if confirmed {
            save_listing(pipeline, candidate).await?;
        } else {
            println!("discarded");
        }

        let again = Confirm::with_theme(&theme)
            .with_prompt("Add another listing?")
            .default(false)
            .interact()?;
        if !again {
            return Ok(());
        }
    }
}

fn prompt_listing(theme: &ColorfulTheme, seed: RawCandidate) -> Result<RawCandidate> {
    let company = prompt_required(theme, "Company", seed.company)?;
    let title = prompt_required(theme, "Title", seed.title)?;
    let domain = match seed.domain {
        Some(domain) => domain,
        None => prompt_domain(theme)?,
    };
    let location = prompt_optional(theme, "Location", seed.location, DEFAULT_LOCATION)?;
    let duration = prompt_optional(theme, "Duration", seed.duration, DEFAULT_DURATION)?;
    let start_date = prompt_optional(theme, "Start date", seed.start_date, DEFAULT_START_DATE)?;
    let link = prompt_optional(theme, "Link", seed.link, "")?;

    Ok(RawCandidate {
        company: Some(company),
        title: Some(title),
        domain: Some(domain),
        location: Some(location),
        duration: Some(duration),
        start_date: Some(start_date),
        link: Some(link),
    })
}

fn prompt_required(theme: &ColorfulTheme, prompt: &str, seed: Option<String>) -> Result<String> {
    Input::<String>::with_theme(theme)
        .with_prompt(prompt)
        .with_initial_text(seed.unwrap_or_default())
        .validate_with(|value: &String| {
            if value.trim().is_empty() {
                Err("required")
            } else {
                Ok(())
            }
        })
        .interact_text()
        .with_context(|| format!("reading {prompt}"))
}

fn prompt_optional(
    theme: &ColorfulTheme,
    prompt: &str,
    seed: Option<String>,
    default: &str,
) -> Result<String> {
    if let Some(value) = seed {
        return Ok(value);
    }
    Input::<String>::with_theme(theme)
        .with_prompt(prompt)
        .default(default.to_string())
        .allow_empty(true)
        .interact_text()
        .with_context(|| format!("reading {prompt}"))
}

fn prompt_domain(theme: &ColorfulTheme) -> Result<String> {
    let mut items = KNOWN_DOMAINS.to_vec();
    items.push("Other");
    let choice = Select::with_theme(theme)
        .with_prompt("Domain")
        .items(&items)
        .default(0)
        .interact()
        .context("reading Domain")?;

    match KNOWN_DOMAINS.get(choice) {
        Some(domain) => Ok(domain.to_string()),
        None => prompt_required(theme, "Domain", None),
    }
}

fn print_candidate(candidate: &RawCandidate) {
    let fields = [
        ("Company", &candidate.company),
        ("Title", &candidate.title),
        ("Domain", &candidate.domain),
        ("Location", &candidate.location),
        ("Duration", &candidate.duration),
        ("Start date", &candidate.start_date),
        ("Link", &candidate.link),
    ];
    println!();
    for (label, value) in fields {
        println!("  {label:<11} {}", value.as_deref().unwrap_or(""));
    }
    println!();
}

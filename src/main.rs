use anyhow::{Context, Result};
use clap::Parser;
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use downly::cli::{Cli, Commands};
use downly::utils;
use downly::{Artifact, Config, DownlyError, FetchOutcome, FormatCatalog, FormatOption, Job, JobHandle, JobScheduler, JobState};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "downly=debug" } else { "downly=info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = Config::load().await?;

    if matches!(cli.command, Commands::Fetch { .. } | Commands::Formats { .. }) {
        // Non-fatal: the tools may live somewhere the check does not look
        let missing_deps = utils::check_dependencies(&config.providers.yt_dlp_path).await;
        if !missing_deps.is_empty() {
            eprintln!("{}", style("Dependency check warnings:").yellow());
            for dep in missing_deps {
                eprintln!("   • {}", dep);
            }
            eprintln!("   (Continuing anyway - tools may be available)");
        }
    }

    match cli.command {
        Commands::Fetch {
            url,
            audio,
            video: _,
            format,
            output,
        } => {
            let selector = Commands::selector(audio, format.as_deref());
            let scheduler = JobScheduler::from_config(&config)?;
            scheduler.recover().await?;
            scheduler.start_reaper();

            let result = fetch(&scheduler, &url, selector, &output, cli.quiet).await;
            scheduler.shutdown().await;

            let saved = result?;
            println!("{} {}", style("Saved to:").green().bold(), saved.display());
        }
        Commands::Formats { url, json, video_only } => {
            let scheduler = JobScheduler::from_config(&config)?;
            let url = utils::validate_and_normalize_url(&url)?;
            let catalog = scheduler
                .extractor()
                .probe(&url, &CancellationToken::new())
                .await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&catalog)?);
            } else {
                print_catalog(&catalog, video_only);
            }
        }
        Commands::Config { show } => {
            if show {
                config.display();
            } else {
                let path = Config::config_path()?;
                Config::default().save().await?;
                println!("Default configuration written to: {}", path.display());
            }
        }
        Commands::Sweep => {
            let scheduler = JobScheduler::from_config(&config)?;
            let report = scheduler.recover().await?;
            println!(
                "Removed {} leftover entries, kept {}",
                report.removed.len(),
                report.kept
            );
            for path in report.removed {
                tracing::debug!("Removed {}", path.display());
            }
        }
        Commands::Platforms => {
            let scheduler = JobScheduler::from_config(&config)?;
            println!(
                "Registered extractors: {}",
                scheduler.extractor().list_platforms().join(", ")
            );
            println!("Supported platforms:");
            println!("  • YouTube (youtube.com, youtu.be)");
            println!("  • Instagram (instagram.com)");
            println!("  • X/Twitter, TikTok, Vimeo and every other site yt-dlp supports");
            println!("  • Direct audio/video URLs (mp4, webm, mp3, m4a, ...)");
        }
    }

    Ok(())
}

/// Submit one download, follow it to completion and copy the artifact out
async fn fetch(
    scheduler: &JobScheduler,
    url: &str,
    selector: downly::DownloadSelector,
    output_dir: &Path,
    quiet: bool,
) -> Result<PathBuf> {
    let handle = scheduler.submit(url, selector)?;
    tracing::info!("Job {} submitted", handle.key().short());

    let progress = if quiet {
        ProgressBar::hidden()
    } else {
        ProgressBar::new(100)
    };
    progress.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos:>3}% {msg}")
            .context("Invalid progress template")?,
    );
    progress.enable_steady_tick(std::time::Duration::from_millis(120));

    let job = follow(scheduler, &handle, &progress).await?;

    match job.state {
        JobState::Ready => progress.finish_with_message("Download complete"),
        _ => progress.abandon_with_message(job.state.to_string()),
    }

    let artifact = match scheduler.fetch_artifact(&handle)? {
        FetchOutcome::Ready(artifact) => artifact,
        FetchOutcome::Failed(e) => return Err(e.into()),
        FetchOutcome::Pending(state) => anyhow::bail!("Job stopped in state {}", state),
    };

    let destination = copy_artifact(&artifact, job.title.as_deref(), output_dir).await?;
    scheduler.acknowledge(&handle).await?;

    Ok(destination)
}

/// Render job updates until the job settles. Ctrl-C cancels it.
async fn follow(scheduler: &JobScheduler, handle: &JobHandle, progress: &ProgressBar) -> Result<Job> {
    let mut rx = scheduler.watch(handle)?;
    let mut interrupted = false;

    loop {
        let job = rx.borrow_and_update().clone();
        render(&job, progress);
        if job.state.is_terminal() {
            return Ok(job);
        }

        tokio::select! {
            signal = tokio::signal::ctrl_c(), if !interrupted => {
                signal.context("Failed to listen for Ctrl-C")?;
                interrupted = true;
                progress.set_message("Cancelling...");
                scheduler.cancel(handle)?;
            }
            changed = rx.changed() => {
                if changed.is_err() {
                    return Err(DownlyError::JobNotFound(handle.to_string()).into());
                }
            }
        }
    }
}

fn render(job: &Job, progress: &ProgressBar) {
    let label = job.title.as_deref().unwrap_or(job.url.as_str());
    match (&job.state, &job.progress) {
        (JobState::Transcoding, Some(p)) => {
            if let Some(percent) = p.percent {
                progress.set_position(percent.round() as u64);
            }
            let mut msg = format!("Downloading {}", label);
            if let Some(speed) = p.speed {
                msg.push_str(&format!(" at {}/s", utils::format_file_size(speed as u64)));
            }
            if let Some(eta) = p.eta_secs {
                msg.push_str(&format!(", {} left", utils::format_duration(eta as f64)));
            }
            progress.set_message(msg);
        }
        (state, _) => progress.set_message(format!("{} {}", state, label)),
    }
}

/// Copy the artifact to `output_dir` under a name derived from the title
async fn copy_artifact(artifact: &Artifact, title: Option<&str>, output_dir: &Path) -> Result<PathBuf> {
    fs_err::create_dir_all(output_dir)?;

    let stem = title
        .map(utils::sanitize_filename)
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| format!("download-{}", artifact.job.short()));
    let file_name = match artifact.extension() {
        Some(ext) => format!("{}.{}", stem, ext),
        None => stem,
    };
    let destination = output_dir.join(file_name);

    tokio::fs::copy(&artifact.path, &destination)
        .await
        .with_context(|| format!("Failed to copy artifact to {}", destination.display()))?;

    Ok(destination)
}

fn print_catalog(catalog: &FormatCatalog, video_only: bool) {
    if let Some(title) = &catalog.title {
        println!("{}", style(title).bold());
    }
    println!(
        "{:<12} {:<6} {:<11} {:<6} {:<6} {:>10}",
        "ID", "EXT", "RESOLUTION", "VIDEO", "AUDIO", "SIZE"
    );
    let options: Vec<&FormatOption> = if video_only {
        catalog.video_options().collect()
    } else {
        catalog.options().iter().collect()
    };
    for option in options {
        let flag = |present: bool| if present { "yes" } else { "-" };
        println!(
            "{:<12} {:<6} {:<11} {:<6} {:<6} {:>10}",
            option.id,
            option.ext,
            option.resolution_label(),
            flag(option.has_video),
            flag(option.has_audio),
            option
                .size
                .map(utils::format_file_size)
                .unwrap_or_else(|| "?".to_string())
        );
    }
}

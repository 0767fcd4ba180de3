use anyhow::{Context, Result};
use clap::Parser;
use tgscrape::cli::{Cli, Commands};
use tgscrape::{utils, CycleOutcome, MessageSource, MessageStore, ResolveError, Scraper, Settings};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let mut settings = Settings::new().context("Failed to load settings")?;
    if let Some(output) = cli.output {
        settings.scraper.output_file = output;
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(settings.logging.level.as_str()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Stats => handle_stats(settings).await,
        command => {
            let scraper = Scraper::init(settings, Settings::bot_token()?)?;

            let result = match command {
                Commands::Run => handle_run(&scraper).await,
                Commands::Once => handle_once(&scraper).await,
                Commands::Check => handle_check(&scraper).await,
                Commands::Stats => handle_stats(scraper.settings().clone()).await,
            };

            scraper.shutdown().await;
            result
        }
    }
}

async fn handle_run(scraper: &Scraper) -> Result<()> {
    scraper
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for Ctrl+C: {}", e);
            }
        })
        .await
}

async fn handle_once(scraper: &Scraper) -> Result<()> {
    utils::print_info("Running a single cycle...");

    match scraper.fetcher().run_cycle().await {
        Ok(CycleOutcome::Saved(count)) => utils::print_success(&format!(
            "{} new messages saved to {}",
            count,
            scraper.settings().scraper.output_file.display()
        )),
        Ok(CycleOutcome::NoNewMessages) => utils::print_info("No new messages found."),
        Ok(outcome) => utils::print_warning(&format!("Cycle ended early: {}", outcome)),
        Err(e) => {
            utils::print_error(&format!("Cycle aborted: {}", e));
            return Err(e.into());
        }
    }

    Ok(())
}

async fn handle_check(scraper: &Scraper) -> Result<()> {
    let session = scraper.session();
    let group = &scraper.settings().telegram.group;

    session
        .connect()
        .await
        .context("Failed to connect to the Telegram Bot API")?;

    utils::print_header("Connection Check");
    if let Some(identity) = session.identity().await {
        utils::print_field(
            "Bot",
            format!("@{} ({})", identity.username.as_deref().unwrap_or("<unnamed>"), identity.id),
        );
        utils::print_field(
            "Privacy mode",
            if identity.reads_all_group_messages { "off" } else { "on" },
        );
        if !identity.reads_all_group_messages {
            utils::print_warning("  Disable privacy mode via @BotFather or the bot will miss group messages.");
        }
    }
    utils::print_field("Group", if group.is_empty() { "<not configured>" } else { group.as_str() });

    match session.resolve_group(group).await {
        Ok(handle) => {
            utils::print_field("Chat id", handle.chat_id);
            utils::print_field("Type", &handle.kind);
            utils::print_field("Title", handle.title.as_deref().unwrap_or("-"));
            utils::print_success("\nGroup resolved, ready to scrape.");
            Ok(())
        }
        Err(ResolveError::NotConfigured) => {
            utils::print_error("\nSet TELEGRAM_GROUP_USERNAME or telegram.group.");
            Err(ResolveError::NotConfigured.into())
        }
        Err(e) => {
            utils::print_error(&format!("\n{}", e));
            Err(e.into())
        }
    }
}

async fn handle_stats(settings: Settings) -> Result<()> {
    let store = tgscrape::CsvStore::new(&settings.scraper.output_file);
    let loaded = store.load().await?;
    let summary = loaded.summary();

    utils::print_header("Stored Messages");
    utils::print_field("File", store.path().display());
    utils::print_field("Records", summary.records);
    if summary.distinct_ids != summary.records {
        utils::print_warning(&format!(
            "  {} duplicate message ids present",
            summary.records - summary.distinct_ids
        ));
    }
    match summary.id_range {
        Some((min, max)) => utils::print_field("Message ids", format!("{} - {}", min, max)),
        None => utils::print_field("Message ids", "-"),
    }
    match summary.latest {
        Some(latest) => utils::print_field("Latest", latest.to_rfc3339()),
        None => utils::print_field("Latest", "-"),
    }

    Ok(())
}

//! `postpilot`: revise posts and toggle schedules from the terminal.

use std::sync::Arc;

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use postpilot_core::{ToggleApi, init_observability};
use postpilot_core::prelude::*;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "postpilot", version, about = "Content console client")]
struct Cli {
    /// Base URL of the content API.
    #[arg(long, env = "POSTPILOT_API_URL", global = true)]
    api_url: Option<String>,
    /// Bearer token for the content API.
    #[arg(long, env = "POSTPILOT_API_TOKEN", global = true, hide_env_values = true)]
    api_token: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Stream an AI revision of a post.
    Revise {
        #[arg(long)]
        post: String,
        /// What should change.
        #[arg(long)]
        feedback: String,
        /// Save the revised content to the post.
        #[arg(long)]
        accept: bool,
    },
    /// Flip a schedule between active and inactive.
    Toggle {
        #[arg(long)]
        schedule: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    init_observability();
    let cli = Cli::parse();

    let config = ClientConfig::from_lookup(|key| match key {
        "POSTPILOT_API_URL" => cli.api_url.clone(),
        "POSTPILOT_API_TOKEN" => cli.api_token.clone(),
        _ => std::env::var(key).ok(),
    })?;
    let client = Arc::new(ConsoleClient::new(config)?);

    match cli.command {
        Command::Revise {
            post,
            feedback,
            accept,
        } => revise(client, PostId::new(post), feedback, accept).await,
        Command::Toggle { schedule } => toggle(client, ResourceId::new(schedule)).await,
    }
}

async fn revise(
    client: Arc<ConsoleClient>,
    post: PostId,
    feedback: String,
    accept: bool,
) -> anyhow::Result<()> {
    let mut session = RevisionSession::new(
        post.clone(),
        client.clone(),
        client.clone(),
        ActiveRevisions::new(),
    )
    .with_buffer_capacity(client.config().stream_buffer_capacity);

    let abort = session.start(feedback).await?;
    if let Some(progress) = session.state().progress() {
        print_progress(progress);
    }
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            abort.abort();
        }
    });

    while let Some(update) = session.next_update().await {
        match update {
            RevisionUpdate::Progress(progress) => print_progress(&progress),
            RevisionUpdate::Completed(_) => println!("Revision ready."),
            // Started is returned by `start`; failures surface through `finish`.
            RevisionUpdate::Started(_) | RevisionUpdate::Failed(_) | RevisionUpdate::Reset => {}
        }
    }

    let result = session.finish().await?;
    println!("\n{}\n", result.excerpt);
    if accept {
        session.accept().await?;
        println!("Saved revision to post {post}.");
    } else {
        session.discard()?;
        info!(event = "cli.revision_discarded", domain = "cli", post_id = %post);
    }
    Ok(())
}

fn print_progress(progress: &RevisionProgress) {
    println!(
        "[{}/{}] {}",
        progress.step,
        progress.total,
        progress.message.as_deref().unwrap_or("")
    );
}

async fn toggle(client: Arc<ConsoleClient>, id: ResourceId) -> anyhow::Result<()> {
    let current: Schedule = ToggleApi::<Schedule>::fetch(client.as_ref(), &id)
        .await
        .with_context(|| format!("failed to load schedule {id}"))?;
    let was_active = current.is_active;

    let cache = QueryCache::new();
    cache.write(id.clone(), current);
    let api: Arc<dyn ToggleApi<Schedule>> = client.clone();
    let controller = OptimisticToggle::new(api, cache.clone(), client.config().toggle_config());
    let mut notices = controller.subscribe_notices();

    let outcome = controller.toggle(&id, was_active)?.settled().await?;
    while let Ok(notice) = notices.try_recv() {
        match notice {
            ToggleNotice::Success { message, .. } => println!("{message}"),
            ToggleNotice::Error { error, .. } => eprintln!("error: {error}"),
        }
    }

    let state = if outcome.active() { "active" } else { "inactive" };
    println!("Schedule {id} is {state}.");
    if let Some(next) = cache.get(&id).and_then(|s| s.next_run_at) {
        println!("Next run: {next}");
    }
    match outcome {
        ToggleOutcome::Reverted { error, .. } => Err(error.into()),
        _ => Ok(()),
    }
}

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pipeline::{JobChange, StatusAggregator};
use shared::{
    domain::{JobStatus, UserId},
    protocol::CreateJobRequest,
};
use storage::{NewJob, Storage};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
struct Cli {
    #[arg(long, default_value = "sqlite://./data/tracker.db")]
    database_url: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    CreateUser {
        username: String,
    },
    AddJob {
        user_id: String,
        title: String,
        company: String,
        #[arg(long, default_value = "applied")]
        status: JobStatus,
        #[arg(long)]
        notes: Option<String>,
    },
    ListJobs {
        user_id: String,
    },
    Stats {
        user_id: String,
    },
    /// Rebuilds a user's counters from their jobs.
    Recount {
        user_id: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let storage = Storage::new(&cli.database_url)
        .await
        .with_context(|| format!("failed to open {}", cli.database_url))?;

    match cli.command {
        Command::CreateUser { username } => {
            let user_id = storage.create_user(username.trim()).await?;
            println!("created user_id={user_id}");
        }
        Command::AddJob {
            user_id,
            title,
            company,
            status,
            notes,
        } => {
            let draft = server_api::new_job(
                &UserId(user_id),
                CreateJobRequest {
                    title,
                    company,
                    status,
                    logo_url: None,
                    notes,
                },
            )
            .context("invalid job")?;
            let change = storage.insert_job(draft).await?;
            count_change(&storage, &change).await?;
            println!("created job_id={}", change.job_id);
        }
        Command::ListJobs { user_id } => {
            for job in storage.list_jobs_for_owner(&UserId(user_id)).await? {
                println!("{}\t{}\t{}\t{}", job.id, job.status, job.company, job.title);
            }
        }
        Command::Stats { user_id } => {
            let counts = storage.status_counts(&UserId(user_id)).await?;
            for (status, count) in counts.iter() {
                println!("{status}\t{count}");
            }
        }
        Command::Recount { user_id } => {
            let user_id = UserId(user_id);
            let counts = storage.recount_stats(&user_id).await?;
            info!(%user_id, total = counts.total(), "counters rebuilt");
            for (status, count) in counts.iter() {
                println!("{status}\t{count}");
            }
        }
    }

    Ok(())
}

/// Writes made here bypass the server's trigger runtime, so counters are
/// adjusted inline.
async fn count_change(storage: &Storage, change: &JobChange) -> Result<()> {
    StatusAggregator::new(storage.clone()).apply(change).await
}

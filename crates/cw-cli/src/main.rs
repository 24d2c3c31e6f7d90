use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use cw_core::BatchId;
use cw_jobs::JobsConfig;
use cw_storage::PgMatchStore;
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "cw-cli")]
#[command(about = "CivicWeave volunteer matching jobs")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Rebuild the volunteer/initiative match table.
    Recompute,
    /// Notify top candidates for every recruiting project.
    Notify {
        /// Reuse an existing batch id instead of minting a new one.
        #[arg(long)]
        batch_id: Option<Uuid>,
    },
    Stats,
    /// Run the cron scheduler until Ctrl-C.
    Schedule,
    Serve,
    Migrate,
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = JobsConfig::from_env();

    match cli.command.unwrap_or(Commands::Recompute) {
        Commands::Recompute => {
            let store = cw_jobs::connect_store(&config).await?;
            let summary = cw_jobs::run_recompute(store.clone(), &config).await?;
            println!(
                "recompute complete: run_id={} initiatives={} volunteers={} matches={}",
                summary.run_id, summary.initiatives, summary.volunteers, summary.matches_stored
            );
            cw_jobs::log_statistics(store.as_ref()).await;
        }
        Commands::Notify { batch_id } => {
            let store = cw_jobs::connect_store(&config).await?;
            let batch_id = batch_id.map(BatchId::from).unwrap_or_default();
            let report = cw_jobs::run_notify(store.clone(), &config, batch_id).await?;
            println!(
                "notification batch complete: batch_id={} projects={} candidates={} team_leads={} failures={}",
                report.batch_id,
                report.projects.len(),
                report.candidates_notified(),
                report.team_leads_notified(),
                report.candidate_failures() + report.project_failures()
            );
            cw_jobs::log_statistics(store.as_ref()).await;
        }
        Commands::Stats => {
            let store = cw_jobs::connect_store(&config).await?;
            let stats = cw_jobs::collect_statistics(store.as_ref()).await?;
            println!("{}", render_statistics(&stats));
        }
        Commands::Schedule => {
            let store = cw_jobs::connect_store(&config).await?;
            let Some(mut sched) = cw_jobs::maybe_build_scheduler(store, &config).await? else {
                anyhow::bail!("scheduler disabled; set CW_SCHEDULER_ENABLED=true");
            };
            sched.start().await.context("starting scheduler")?;
            info!(
                recompute_cron = %config.recompute_cron,
                notify_cron = %config.notify_cron,
                "scheduler running"
            );
            tokio::signal::ctrl_c()
                .await
                .context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Serve => {
            let store = cw_jobs::connect_store(&config).await?;
            let addr = cw_web::parse_bind_addr(&config.bind_addr)?;
            cw_web::serve(store, addr).await?;
        }
        Commands::Migrate => {
            let store = PgMatchStore::connect(&config.database_url)
                .await
                .context("connecting to postgres")?;
            store.migrate().await.context("running migrations")?;
            println!("migrations applied");
        }
    }

    Ok(())
}

fn render_statistics(stats: &cw_jobs::StatisticsSnapshot) -> String {
    let m = &stats.matches;
    let n = &stats.notifications;
    format!(
        "matches: total={} volunteers={} initiatives={} avg={} min={} max={}\nnotifications: total={} last_24h={} projects={} volunteers={}",
        m.total_matches,
        m.volunteers_with_matches,
        m.initiatives_with_matches,
        fmt_score(m.average_score),
        fmt_score(m.min_score),
        fmt_score(m.max_score),
        n.total_notifications,
        n.recent_notifications,
        n.projects_with_notifications,
        n.volunteers_notified,
    )
}

fn fmt_score(score: Option<f64>) -> String {
    score.map_or_else(|| "n/a".to_string(), |s| format!("{s:.3}"))
}

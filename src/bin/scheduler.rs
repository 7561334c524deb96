use clap::Parser;
use fleetbot::config::Config;
use fleetbot::estimator::NeverAvailable;
use fleetbot::logging::LoggingArgs;
use fleetbot::models::Candidate;
use fleetbot::queue::Queue;
use fleetbot::schedule;
use std::collections::HashMap;
use std::path::PathBuf;

#[derive(Parser)]
struct Args {
    /// Create queue entries but don't touch anything else.
    #[clap(long)]
    dry_run: bool,

    /// Path to configuration.
    #[clap(long, default_value = "fleetbot.toml")]
    config: PathBuf,

    /// Restrict to a specific campaign.
    #[clap(long)]
    campaign: Option<String>,

    /// Codebases to (re)schedule. Empty means every codebase with a pending candidate.
    codebases: Vec<String>,

    /// Bucket to schedule into.
    #[clap(long, default_value = "default")]
    bucket: String,

    /// Requester to record against scheduled items.
    #[clap(long)]
    requester: Option<String>,

    /// Force a from-scratch rebuild (no resume) for scheduled items.
    #[clap(long)]
    refresh: bool,

    /// Run one scheduling pass and exit, instead of restarting forever.
    #[clap(long)]
    once: bool,

    #[clap(flatten)]
    logging: LoggingArgs,
}

async fn fetch_candidates(
    pool: &sqlx::PgPool,
    codebases: &[String],
    campaign: Option<&str>,
) -> Result<Vec<Candidate>, sqlx::Error> {
    let mut query = sqlx::QueryBuilder::new(
        "SELECT codebase, campaign, command, context, value, success_chance, publish_policy, change_set
         FROM candidate",
    );
    let mut has_where = false;
    if !codebases.is_empty() {
        query.push(" WHERE codebase = ANY(");
        query.push_bind(codebases.to_vec());
        query.push(")");
        has_where = true;
    }
    if let Some(campaign) = campaign {
        query.push(if has_where { " AND campaign = " } else { " WHERE campaign = " });
        query.push_bind(campaign);
    }
    query.build_query_as::<Candidate>().fetch_all(pool).await
}

async fn run_once(args: &Args, config: &Config, pool: &sqlx::PgPool) -> Result<(), i32> {
    log::info!("finding candidates");
    let candidates = fetch_candidates(pool, &args.codebases, args.campaign.as_deref())
        .await
        .map_err(|e| {
            log::error!("failed to load candidates: {}", e);
            1
        })?;

    log::info!("determining schedule for {} candidates", candidates.len());
    let dep_checker = NeverAvailable;
    let codebase_values: HashMap<String, f64> = HashMap::new();
    let policies = &config.policies;

    let requests = schedule::bulk_add_to_queue(
        pool,
        &candidates,
        policies,
        &codebase_values,
        &dep_checker,
        &args.bucket,
    )
    .await
    .map_err(|e| {
        log::error!("scheduling failed: {}", e);
        1
    })?;

    log::info!("adding {} items to queue", requests.len());
    if args.dry_run {
        return Ok(());
    }

    let queue = Queue::new(pool);
    for mut request in requests {
        if args.refresh {
            request.refresh = true;
        }
        if request.requester.is_none() {
            request.requester = args.requester.clone();
        }
        if let Err(e) = schedule::do_schedule(&queue, &request).await {
            log::warn!(
                "failed to enqueue codebase={} campaign={}: {}",
                request.codebase,
                request.campaign,
                e
            );
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), i32> {
    let args = Args::parse();
    args.logging.init();

    log::info!("reading configuration");
    let config = Config::read_file(&args.config).map_err(|e| {
        log::error!("failed to read config: {}", e);
        1
    })?;

    let pool = config.pg_pool().await.map_err(|e| {
        log::error!("failed to create database pool: {}", e);
        1
    })?;

    if args.once {
        run_once(&args, &config, &pool).await
    } else {
        loop {
            run_once(&args, &config, &pool).await?;
            tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
        }
    }
}

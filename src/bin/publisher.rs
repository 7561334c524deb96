use clap::Parser;
use fleetbot::config::Config;
use fleetbot::ingress::{scheduled_loop, CampaignDebouncer};
use fleetbot::logging::LoggingArgs;
use fleetbot::metrics::PublishMetrics;
use fleetbot::publish::reconcile::check_existing;
use fleetbot::publish::{publish_pending, PublishContext};
use fleetbot::rate_limiter::{HostBackoff, MaintainerCapRateLimiter, NoRateLimiter, RateLimiter};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
struct Args {
    /// Listen address for the admin API.
    #[clap(long, default_value = "0.0.0.0")]
    listen_address: std::net::IpAddr,

    /// Listen port for the admin API.
    #[clap(long, default_value = "9912")]
    port: u16,

    /// Seconds to wait between sweeps.
    #[clap(long, default_value = "7200")]
    interval: i64,

    /// Path to configuration.
    #[clap(long, default_value = "fleetbot.toml")]
    config: PathBuf,

    /// Create branches but don't push or propose anything.
    #[clap(long)]
    dry_run: bool,

    /// Run a single sweep and exit, instead of running as a daemon.
    #[clap(long, conflicts_with = "no_auto_publish")]
    once: bool,

    /// Maximum number of simultaneously open merge proposals per maintainer.
    /// Unset means no cap.
    #[clap(long)]
    max_mps_per_maintainer: Option<usize>,

    /// Only reconcile existing proposals; never open new ones.
    #[clap(long, conflicts_with = "once")]
    no_auto_publish: bool,

    /// Path to the `publish-one` subprocess binary.
    #[clap(long, default_value = "fleetbot-publish-one")]
    publish_one_binary: String,

    /// External base URL of this deployment.
    #[clap(long)]
    external_url: Option<url::Url>,

    /// Prometheus push gateway to export metrics to after a `--once` run.
    /// Running as a daemon exposes the same metrics on `/metrics` instead.
    #[clap(long)]
    prometheus: Option<url::Url>,

    #[clap(flatten)]
    logging: LoggingArgs,
}

#[tokio::main]
async fn main() -> Result<(), i32> {
    let args = Args::parse();
    args.logging.init();

    let config = Config::read_file(&args.config).map_err(|e| {
        log::error!("failed to read config: {}", e);
        1
    })?;

    let pool = config.pg_pool().await.map_err(|e| {
        log::error!("failed to create database pool: {}", e);
        1
    })?;

    let rate_limiter: Arc<dyn RateLimiter> = match args.max_mps_per_maintainer {
        Some(cap) => Arc::new(MaintainerCapRateLimiter::new(cap)),
        None => Arc::new(NoRateLimiter),
    };
    let metrics = Arc::new(PublishMetrics::new());
    let backoff = Arc::new(HostBackoff::new());

    if args.once {
        run_sweep(&args, &config, &pool, rate_limiter.as_ref(), backoff.as_ref(), &metrics, !args.no_auto_publish).await?;
        if let Some(gateway) = args.prometheus.as_ref() {
            fleetbot::metrics::push_to_gateway(gateway, "fleetbot.publish", std::collections::HashMap::new(), &metrics.registry)
                .await
                .map_err(|e| {
                    log::error!("failed to push metrics: {}", e);
                    1
                })?;
        }
        return Ok(());
    }

    let interval = chrono::Duration::seconds(args.interval);
    let auto_publish = !args.no_auto_publish;

    {
        let args = ArgsSnapshot::from(&args);
        let config = config.clone();
        let pool = pool.clone();
        let rate_limiter = rate_limiter.clone();
        let metrics = metrics.clone();
        let backoff = backoff.clone();
        tokio::spawn(async move {
            scheduled_loop(interval, auto_publish, move |auto_publish| {
                let args = args.clone();
                let config = config.clone();
                let pool = pool.clone();
                let rate_limiter = rate_limiter.clone();
                let metrics = metrics.clone();
                let backoff = backoff.clone();
                async move {
                    if let Err(code) = run_sweep_snapshot(
                        &args,
                        &config,
                        &pool,
                        rate_limiter.as_ref(),
                        backoff.as_ref(),
                        &metrics,
                        auto_publish,
                    )
                    .await
                    {
                        log::error!("sweep failed with exit code {}", code);
                    }
                }
            })
            .await;
        });
    }

    if let Some(redis_url) = config.redis_url() {
        match redis::Client::open(redis_url) {
            Ok(redis_client) => {
                let args = ArgsSnapshot::from(&args);
                let config = config.clone();
                let pool = pool.clone();
                let rate_limiter = rate_limiter.clone();
                let metrics = metrics.clone();
                let backoff = backoff.clone();
                let (shutdown_tx, shutdown_rx) = tokio::sync::mpsc::channel(1);
                tokio::spawn(async move {
                    // Held for the task's lifetime so the channel stays open;
                    // this process has no graceful-shutdown signal wired up yet
                    // (see DESIGN.md), so the listener runs until the process exits.
                    let _keep_open = shutdown_tx;
                    let debouncer = Arc::new(CampaignDebouncer::new());
                    let result = fleetbot::ingress::listen_for_results(
                        redis_client,
                        debouncer,
                        shutdown_rx,
                        move |worker_result| {
                            let args = args.clone();
                            let config = config.clone();
                            let pool = pool.clone();
                            let rate_limiter = rate_limiter.clone();
                            let metrics = metrics.clone();
                            let backoff = backoff.clone();
                            async move {
                                log::info!(
                                    "worker result for {}/{} triggered an immediate sweep",
                                    worker_result.codebase,
                                    worker_result.campaign
                                );
                                if let Err(code) = run_sweep_snapshot(
                                    &args,
                                    &config,
                                    &pool,
                                    rate_limiter.as_ref(),
                                    backoff.as_ref(),
                                    &metrics,
                                    true,
                                )
                                .await
                                {
                                    log::error!("event-driven sweep failed with exit code {}", code);
                                }
                            }
                        },
                    )
                    .await;
                    if let Err(e) = result {
                        log::error!("result-stream listener exited: {}", e);
                    }
                });
            }
            Err(e) => log::warn!("redis not configured correctly, event-driven publish disabled: {}", e),
        }
    } else {
        log::info!("no redis_location configured, running on the scheduled loop only");
    }

    let state = Arc::new(fleetbot::api::ApiState {
        pool,
        publish_one_binary: args.publish_one_binary.clone(),
        metrics,
    });
    let app = fleetbot::api::app(state);

    let addr = SocketAddr::new(args.listen_address, args.port);
    log::info!("listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| {
        log::error!("failed to bind listener: {}", e);
        1
    })?;
    axum::serve(listener, app.into_make_service()).await.map_err(|e| {
        log::error!("server error: {}", e);
        1
    })?;

    Ok(())
}

/// The subset of `Args` a sweep needs, cloned into each spawned task instead
/// of threading lifetimes through `tokio::spawn`'s `'static` boundary.
#[derive(Clone)]
struct ArgsSnapshot {
    dry_run: bool,
    publish_one_binary: String,
    external_url: Option<url::Url>,
}

impl From<&Args> for ArgsSnapshot {
    fn from(args: &Args) -> Self {
        Self {
            dry_run: args.dry_run,
            publish_one_binary: args.publish_one_binary.clone(),
            external_url: args.external_url.clone(),
        }
    }
}

async fn run_sweep(
    args: &Args,
    config: &Config,
    pool: &sqlx::PgPool,
    rate_limiter: &dyn RateLimiter,
    backoff: &HostBackoff,
    metrics: &PublishMetrics,
    auto_publish: bool,
) -> Result<(), i32> {
    run_sweep_snapshot(
        &ArgsSnapshot::from(args),
        config,
        pool,
        rate_limiter,
        backoff,
        metrics,
        auto_publish,
    )
    .await
}

async fn run_sweep_snapshot(
    args: &ArgsSnapshot,
    config: &Config,
    pool: &sqlx::PgPool,
    rate_limiter: &dyn RateLimiter,
    backoff: &HostBackoff,
    metrics: &PublishMetrics,
    auto_publish: bool,
) -> Result<(), i32> {
    let hosters: Vec<&dyn fleetbot::hoster::Hoster> = Vec::new();
    let summary = match check_existing(pool, &hosters, rate_limiter, backoff, metrics, args.dry_run).await {
        Ok(summary) => summary,
        Err(e) => {
            log::error!("reconcile sweep failed: {}", e);
            return Err(1);
        }
    };
    log::info!(
        "reconcile sweep: {} open, {} closed-no-changes, {} rescheduled-conflicted",
        summary.open,
        summary.closed_no_changes,
        summary.rescheduled_conflicted
    );

    if !auto_publish {
        log::debug!("auto-publish disabled; only reconciliation ran this pass");
        return Ok(());
    }

    let ctx = PublishContext {
        pool,
        rate_limiter,
        policies: &config.policies,
        sensitive_host_substrings: &config.sensitive_host_substrings,
        publish_one_binary: &args.publish_one_binary,
        external_url: args.external_url.as_ref(),
        dry_run: args.dry_run,
        metrics,
    };

    match publish_pending(&ctx).await {
        Ok(summary) => {
            log::info!(
                "publish pass: {} published, {} skipped, {} failed",
                summary.published,
                summary.skipped,
                summary.failed
            );
            Ok(())
        }
        Err(e) => {
            log::error!("publish pass failed: {}", e);
            Err(1)
        }
    }
}

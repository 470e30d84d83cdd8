use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use comps_core::ScrapeQuery;
use comps_storage::{ComparableFilter, PgStore};
use comps_sync::{JobService, PipelineConfig, SWEEP_BATCH};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "comps-cli")]
#[command(about = "Comparable-property scrape pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Queue a scrape job for an address and run it to completion.
    Scrape {
        address: String,
        #[arg(long, default_value_t = 5.0)]
        radius: f64,
        #[arg(long, default_value = "Multifamily")]
        asset_type: String,
        #[arg(long = "amenity", value_delimiter = ',')]
        amenities: Vec<String>,
        #[arg(long = "keyword", value_delimiter = ',')]
        keywords: Vec<String>,
        /// Only queue the job; a worker or `serve` picks it up later.
        #[arg(long)]
        queue_only: bool,
    },
    Status {
        id: Uuid,
    },
    Search {
        #[arg(short, long)]
        query: Option<String>,
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    /// Run queued jobs, once or on the configured cron.
    Worker {
        #[arg(long)]
        once: bool,
    },
    Migrate,
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = PipelineConfig::from_env();

    match cli.command {
        Commands::Migrate => {
            let Some(url) = config.database_url.as_deref() else {
                bail!("DATABASE_URL must be set to run migrations");
            };
            let store = PgStore::connect(url).await.context("connecting to postgres")?;
            store.migrate().await.context("running migrations")?;
            println!("migrations applied");
        }
        Commands::Scrape {
            address,
            radius,
            asset_type,
            amenities,
            keywords,
            queue_only,
        } => {
            let service = JobService::from_config(&config).await?;
            let query = ScrapeQuery::new(address)
                .with_radius(radius)
                .with_asset_type(asset_type)
                .with_amenities(amenities)
                .with_keywords(keywords);
            if queue_only {
                let id = service.create(query).await?;
                let job = service.get(id).await?.context("queued job vanished")?;
                print_json(&job)?;
            } else {
                let job = service.create_and_run(query).await?;
                print_json(&job)?;
            }
        }
        Commands::Status { id } => {
            let service = JobService::from_config(&config).await?;
            match service.get(id).await? {
                Some(job) => print_json(&job)?,
                None => bail!("job {id} not found"),
            }
        }
        Commands::Search { query, limit } => {
            let service = JobService::from_config(&config).await?;
            let rows = service
                .search_comparables(&ComparableFilter {
                    text: query,
                    limit: Some(limit),
                })
                .await?;
            print_json(&rows)?;
        }
        Commands::Worker { once } => {
            let service = JobService::from_config(&config).await?;
            if once {
                let jobs = service.sweep_queued(SWEEP_BATCH).await?;
                println!("worker sweep complete: ran={}", jobs.len());
            } else {
                let config = PipelineConfig {
                    worker_enabled: true,
                    ..config
                };
                run_scheduler_until_ctrl_c(&service, &config).await?;
            }
        }
        Commands::Serve => {
            let service = JobService::from_config(&config).await?;
            let scheduler = match service.build_scheduler(&config).await? {
                Some(mut sched) => {
                    sched.start().await.context("starting scheduler")?;
                    info!(cron = %config.worker_cron, "worker scheduler started");
                    Some(sched)
                }
                None => None,
            };
            comps_web::serve(service, config.web_port).await?;
            if let Some(mut sched) = scheduler {
                sched.shutdown().await.context("stopping scheduler")?;
            }
        }
    }

    Ok(())
}

async fn run_scheduler_until_ctrl_c(service: &JobService, config: &PipelineConfig) -> Result<()> {
    let Some(mut sched) = service.build_scheduler(config).await? else {
        return Ok(());
    };
    sched.start().await.context("starting scheduler")?;
    info!(cron = %config.worker_cron, "worker running; ctrl-c to stop");
    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    sched.shutdown().await.context("stopping scheduler")?;
    info!("worker stopped");
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

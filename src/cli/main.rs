//! Operator CLI for the feedback index.
//!
//! Rebuilds and reindexes the Elasticsearch index behind its alias, reports
//! on ingestion batches and submits single responses through live indexing.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use quill::config::Config;
use quill::elasticsearch::EsClient;
use quill::indexing::{
    ChunkWorker, Dispatcher, IndexLifecycle, IndexWriter, InlineQueue, LiveIndexer,
    MappingRegistry, ResponseMapping, RetryPolicy, TaskHandler, TaskQueue, WorkerPool,
};
use quill::models::{BatchSummary, Platform, Response};
use quill::search::SearchBackend;
use quill::store::{ResponseStore, Store};

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

#[derive(Parser, Debug)]
#[command(name = "quill")]
#[command(about = "Index feedback responses into Elasticsearch")]
struct Args {
    /// TOML config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Elasticsearch URL (overrides the config file)
    #[arg(long)]
    es_url: Option<String>,

    /// Index alias (overrides the config file)
    #[arg(long)]
    alias: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Reindex into the live generation behind the alias
    Reindex {
        /// Mapping types to reindex (default: all)
        #[arg(long = "mapping")]
        mappings: Vec<String>,

        /// Only reindex the first PERCENT of each mapping type's ids
        #[arg(long, default_value = "100", value_parser = clap::value_parser!(u8).range(1..=100))]
        percent: u8,

        /// Run chunks in-process instead of on the worker pool
        #[arg(long)]
        sync: bool,
    },

    /// Build a new generation and swap the alias to it
    Rebuild {
        #[arg(long)]
        sync: bool,
    },

    /// Replace the index behind the alias with an empty generation
    Recreate,

    /// Show ingestion batches, or the records of one batch
    Status {
        #[arg(long)]
        batch: Option<String>,
    },

    /// Delete finished records older than DAYS
    Prune {
        #[arg(long, default_value = "30")]
        days: i64,
    },

    /// Check the Elasticsearch cluster
    Health,

    /// Save one response and index it right away
    Submit {
        /// Sad feedback instead of happy
        #[arg(long)]
        sad: bool,

        #[arg(short, long)]
        description: String,

        #[arg(long, default_value = "firefox")]
        product: String,

        #[arg(long)]
        version: String,

        #[arg(long)]
        platform: Option<String>,

        #[arg(long)]
        locale: Option<String>,

        #[arg(long)]
        url: Option<String>,
    },

    /// Delete one response and remove it from the index
    Delete {
        #[arg(long)]
        id: u64,
    },
}

/// Everything a command needs, wired from the config
struct Pipeline {
    config: Config,
    store: Store,
    responses: ResponseStore,
    backend: Arc<dyn SearchBackend>,
    registry: Arc<MappingRegistry>,
    lifecycle: IndexLifecycle,
    pool: Option<Arc<WorkerPool>>,
}

impl Pipeline {
    fn build(config: Config, sync: bool, progress: Option<ProgressBar>) -> Result<Self> {
        let store = Store::open(&config.store.path).context("Failed to open store")?;
        let responses = store.responses()?;
        let records = store.records()?;

        let backend: Arc<dyn SearchBackend> = Arc::new(
            EsClient::new(&config.elasticsearch.url)
                .context("Failed to create Elasticsearch client")?,
        );

        let mut registry = MappingRegistry::new();
        registry.register(ResponseMapping::new(responses.clone()));
        let registry = Arc::new(registry);

        let handler: Arc<dyn TaskHandler> = Arc::new(ChunkWorker::new(
            IndexWriter::new(backend.clone()),
            registry.clone(),
            records.clone(),
        ));
        let (queue, pool) = if sync {
            let policy = RetryPolicy::from(&config.queue);
            let queue: Arc<dyn TaskQueue> = Arc::new(InlineQueue::new(handler, policy));
            (queue, None)
        } else {
            let pool = Arc::new(WorkerPool::from_config(handler, &config.queue));
            let queue: Arc<dyn TaskQueue> = pool.clone();
            (queue, Some(pool))
        };

        let mut dispatcher = Dispatcher::new(queue, records, config.indexing.chunk_size);
        if let Some(pb) = progress {
            dispatcher = dispatcher.with_progress(pb);
        }

        let lifecycle = IndexLifecycle::new(
            backend.clone(),
            registry.clone(),
            Arc::new(dispatcher),
            config.indexing.rebuild_timeout(),
        );

        Ok(Self {
            config,
            store,
            responses,
            backend,
            registry,
            lifecycle,
            pool,
        })
    }

    fn alias(&self) -> &str {
        &self.config.elasticsearch.alias
    }

    fn live_indexer(&self) -> LiveIndexer {
        LiveIndexer::new(
            self.backend.clone(),
            self.registry.clone(),
            self.alias(),
            self.config.indexing.live_index,
        )
    }

    /// Number of ids the given mapping types will schedule
    async fn id_count(&self, mappings: &[String], percent: u8) -> Result<u64> {
        let mut total = 0;
        for name in mappings {
            let ids = self.registry.get(name)?.all_ids().await?;
            total += (ids.len() * usize::from(percent) / 100) as u64;
        }
        Ok(total)
    }

    async fn shutdown(&self) -> Result<()> {
        if let Some(pool) = &self.pool {
            pool.shutdown().await;
            let dead = pool.dead_letters();
            if !dead.is_empty() {
                warn!("{} chunks were dead-lettered", dead.len());
            }
        }
        self.store.flush().await?;
        Ok(())
    }
}

fn progress_bar() -> Result<ProgressBar> {
    let pb = ProgressBar::new(0);
    pb.set_style(
        ProgressStyle::default_bar()
            .template(
                "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({per_sec})",
            )?
            .progress_chars("#>-"),
    );
    Ok(pb)
}

fn print_summary(batch_id: &str, summary: &BatchSummary) {
    println!(
        "{}  {:<8} pending={} success={} failure={}",
        batch_id,
        summary.status().to_string(),
        summary.pending,
        summary.success,
        summary.failure
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::load_from_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => Config::default(),
    };
    if let Some(url) = args.es_url {
        config.elasticsearch.url = url;
    }
    if let Some(alias) = args.alias {
        config.elasticsearch.alias = alias;
    }
    config.validate()?;

    match args.command {
        Command::Reindex {
            mappings,
            percent,
            sync,
        } => {
            let pb = progress_bar()?;
            let pipeline = Pipeline::build(config, sync, Some(pb.clone()))?;
            let mappings = if mappings.is_empty() {
                pipeline.registry.names()
            } else {
                mappings
            };
            pb.set_length(pipeline.id_count(&mappings, percent).await?);

            pipeline.lifecycle.ensure_alias(pipeline.alias()).await?;
            let batch_id = pipeline
                .lifecycle
                .reindex(pipeline.alias(), &mappings, percent)
                .await
                .context("Reindex failed")?;
            pb.finish();

            let summary = pipeline.lifecycle.wait_for_batch(&batch_id).await?;
            pipeline.shutdown().await?;
            print_summary(&batch_id, &summary);
        }

        Command::Rebuild { sync } => {
            let pb = progress_bar()?;
            let pipeline = Pipeline::build(config, sync, Some(pb.clone()))?;
            pb.set_length(pipeline.id_count(&pipeline.registry.names(), 100).await?);

            let result = pipeline.lifecycle.rebuild(pipeline.alias()).await;
            pb.finish();
            pipeline.shutdown().await?;

            let report = result.context("Rebuild failed")?;
            info!(
                "Alias {} now points at {} (previous: {:?})",
                pipeline.alias(),
                report.index,
                report.previous
            );
            print_summary(&report.batch_id, &report.summary);
        }

        Command::Recreate => {
            let pipeline = Pipeline::build(config, true, None)?;
            let index = pipeline.lifecycle.recreate_empty(pipeline.alias()).await?;
            println!("{} -> {}", pipeline.alias(), index);
        }

        Command::Status { batch } => {
            let store = Store::open(&config.store.path).context("Failed to open store")?;
            let records = store.records()?;
            match batch {
                Some(batch_id) => {
                    for record in records.batch_records(&batch_id)? {
                        println!(
                            "{:>8}  {:<8} {:<24} {}",
                            record.id,
                            record.status.to_string(),
                            record.name,
                            record.message.as_deref().unwrap_or("")
                        );
                    }
                    print_summary(&batch_id, &records.batch_summary(&batch_id)?);
                }
                None => {
                    for (batch_id, summary) in records.batches()? {
                        print_summary(&batch_id, &summary);
                    }
                }
            }
        }

        Command::Prune { days } => {
            let store = Store::open(&config.store.path).context("Failed to open store")?;
            let cutoff = Utc::now() - chrono::Duration::days(days);
            let removed = store.records()?.prune(cutoff)?;
            store.flush().await?;
            info!("Pruned {} records finished before {}", removed, cutoff);
        }

        Command::Health => {
            let client = EsClient::new(&config.elasticsearch.url)
                .context("Failed to create Elasticsearch client")?;
            if !client.health_check().await? {
                anyhow::bail!("Elasticsearch cluster is not healthy");
            }
            let alias = &config.elasticsearch.alias;
            let targets = client.alias_targets(alias).await?;
            println!("cluster healthy, {} -> {:?}", alias, targets);
        }

        Command::Submit {
            sad,
            description,
            product,
            version,
            platform,
            locale,
            url,
        } => {
            let pipeline = Pipeline::build(config, true, None)?;
            let live = pipeline.live_indexer();
            live.ensure_ready(&pipeline.lifecycle)
                .await
                .context("Failed to prepare the index")?;

            let mut response = Response::new(!sad, &description, &product, &version);
            if let Some(platform) = platform {
                response = response.with_platform(Platform::from(platform.as_str()));
            }
            if let Some(locale) = locale {
                response = response.with_locale(&locale);
            }
            if let Some(url) = url {
                response = response.with_url(&url);
            }

            let id = pipeline.responses.save(&mut response)?;
            live.index_item(ResponseMapping::NAME, id)
                .await
                .context("Saved response but failed to index it")?;
            pipeline.store.flush().await?;
            println!("{}", id);
        }

        Command::Delete { id } => {
            let pipeline = Pipeline::build(config, true, None)?;
            if !pipeline.responses.delete(id)? {
                anyhow::bail!("No response with id {}", id);
            }
            pipeline
                .live_indexer()
                .unindex_item(ResponseMapping::NAME, id)
                .await
                .context("Deleted response but failed to unindex it")?;
            pipeline.store.flush().await?;
        }
    }

    Ok(())
}

use anyhow::{Context, Result};
use lotledger::datasource::CsvTradeSource;
use lotledger::orchestration::{Ingestor, LedgerService};
use lotledger::{
    config::Config, db::init_db, BirdeyePriceOracle, LedgerPipeline, PriceOracle, Repository,
    TimeMs,
};
use std::sync::Arc;

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing_subscriber::filter::LevelFilter::INFO.into()),
        )
        .init();

    // Load configuration
    let config = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };

    match run(config).await {
        Ok(failures) if failures > 0 => std::process::exit(2),
        Ok(_) => {}
        Err(e) => {
            eprintln!("Ledger job failed: {:#}", e);
            std::process::exit(1);
        }
    }
}

/// Returns the number of pairs that failed.
async fn run(config: Config) -> Result<usize> {
    let pool = init_db(&config.database_path)
        .await
        .context("Failed to initialize database")?;
    let repo = Arc::new(Repository::new(pool));

    if let Some(path) = &config.trades_csv_path {
        let source = CsvTradeSource::new(path);
        let wallets = if config.wallets.is_empty() {
            source
                .list_wallets()
                .await
                .with_context(|| format!("Failed to read trades from {}", path))?
        } else {
            config.wallets.clone()
        };
        let ingestor = Ingestor::new(Arc::new(source), repo.clone());
        let result = ingestor
            .ensure_ingested_all(&wallets)
            .await
            .with_context(|| format!("Failed to ingest {}", path))?;
        tracing::info!(
            fetched = result.trades_fetched,
            new = result.trades_new,
            "CSV ingestion complete"
        );
    }

    let wallets = if config.wallets.is_empty() {
        repo.query_distinct_wallets()
            .await
            .context("Failed to list wallets")?
    } else {
        config.wallets.clone()
    };

    let oracle: Arc<dyn PriceOracle> = Arc::new(BirdeyePriceOracle::new(
        config.price_api_url.clone(),
        config.price_api_key.clone(),
        config.canonical_currency.clone(),
        config.currency_mints.clone(),
    ));
    let pipeline = LedgerPipeline::from_config(&config, oracle);
    let service = LedgerService::with_repository(repo, pipeline, config.worker_concurrency);

    let report = service
        .run_batch(&wallets, config.ledger_mode, TimeMs::now())
        .await
        .context("Ledger batch aborted")?;

    let lots: usize = report.pairs.iter().map(|p| p.write.lots_written).sum();
    tracing::info!(
        wallets = wallets.len(),
        pairs = report.pairs.len(),
        lots_written = lots,
        anomalies = report.anomaly_count(),
        failures = report.failures.len(),
        "Ledger batch complete"
    );
    for (wallet, token, error) in &report.failures {
        tracing::error!(wallet = %wallet, token = %token, error = %error, "Pair not committed");
    }

    Ok(report.failures.len())
}

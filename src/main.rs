// src/main.rs
mod config;
mod extractors;
mod ir;
mod llm;
mod pipeline;
mod storage;
mod utils;

use clap::Parser;
use config::{Company, PipelineConfig, DEFAULT_YEAR_PATTERN};
use extractors::PdfVisionExtractor;
use llm::{LlmSettings, OpenAiClient};
use pipeline::model::StatementType;
use pipeline::CompanyRunner;
use std::path::PathBuf;
use storage::StorageManager;
use utils::AppError;

/// Annual report financial statement extractor
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// JSON file listing companies (name, ticker, investor_relations_url)
    #[arg(short, long, conflicts_with_all = ["ticker", "name", "ir_url"])]
    companies: Option<PathBuf>,

    /// Ticker symbol of a single company
    #[arg(short, long, requires = "ir_url")]
    ticker: Option<String>,

    /// Display name of the single company (defaults to the ticker)
    #[arg(long)]
    name: Option<String>,

    /// Investor relations page listing the annual reports
    #[arg(long)]
    ir_url: Option<String>,

    /// Output directory for reports, extracted statements and unified tables
    #[arg(short, long, default_value = "./output")]
    output_dir: PathBuf,

    /// Extra extraction attempts for a unit that fails validation
    #[arg(long, env = "MAX_RETRIES", default_value_t = 2)]
    max_retries: u32,

    /// Allowed gap in Assets = Liabilities + Equity
    #[arg(long, env = "TOLERANCE", default_value_t = 2.0)]
    tolerance: f64,

    /// Publication years to process
    #[arg(long, env = "YEAR_REGEX_PATTERN", default_value = DEFAULT_YEAR_PATTERN)]
    year_pattern: String,

    /// Chat model used for page location, extraction and schema generation
    #[arg(long, env = "OPENAI_MODEL", default_value = "gpt-4o")]
    model: String,

    /// Base URL of the OpenAI-compatible API
    #[arg(long, env = "OPENAI_BASE_URL", default_value = "https://api.openai.com/v1")]
    api_base: String,

    /// Use reports already on disk instead of scraping the IR page
    #[arg(long)]
    skip_download: bool,

    /// Delete .FAILED markers so flagged units are extracted again
    #[arg(long)]
    retry_failed: bool,
}

impl Args {
    fn companies(&self) -> Result<Vec<Company>, AppError> {
        if let Some(path) = &self.companies {
            return config::load_companies(path);
        }
        match (&self.ticker, &self.ir_url) {
            (Some(ticker), Some(ir_url)) => Ok(vec![Company {
                name: self.name.clone().unwrap_or_else(|| ticker.clone()),
                ticker: ticker.clone(),
                investor_relations_url: ir_url.clone(),
            }]),
            _ => Err(AppError::Config(
                "Provide either --companies or --ticker with --ir-url".to_string(),
            )),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), AppError> {
    // 1. Setup Logging (reads RUST_LOG env var)
    utils::logging::setup_logging();

    // 2. Parse CLI Arguments
    let args = Args::parse();
    tracing::debug!("Starting with args: {:?}", args);

    let companies = args.companies()?;
    let config = PipelineConfig::new(
        args.max_retries,
        args.tolerance,
        &args.year_pattern,
        args.skip_download,
        args.retry_failed,
    )?;

    // 3. LLM client; the key is only read from the environment
    let api_key = std::env::var("OPENAI_API_KEY")
        .map_err(|_| AppError::Config("OPENAI_API_KEY is not set".to_string()))?;
    let llm = OpenAiClient::new(LlmSettings {
        api_base: args.api_base.clone(),
        api_key,
        model: args.model.clone(),
    })?;
    tracing::info!("Using model {}", llm.model());

    // 4. Initialize storage
    let storage = StorageManager::new(&args.output_dir)?;

    // 5. Process each company in turn
    let mut processed = 0;
    for company in &companies {
        tracing::info!("===== {} ({}) =====", company.name, company.ticker);
        let store = storage.company(&company.ticker)?;

        let reports = pipeline::acquire_reports(company, &store, &config).await?;
        if reports.is_empty() {
            tracing::warn!("No annual reports available for {}, skipping", company.ticker);
            continue;
        }
        tracing::info!("Processing {} annual reports for {}", reports.len(), company.ticker);

        let extractor = PdfVisionExtractor::new(&llm, store.reports_dir());
        let runner = CompanyRunner::new(&config, &extractor, &llm, &store);
        let summary = runner.run(&reports).await?;

        tracing::info!(
            "{}: {} reports, {} valid units, {} terminal failures, {} pairs without data",
            store.ticker(), summary.reports, summary.valid_units, summary.terminal_failures, summary.failed_pairs
        );
        for conflict in &summary.schema_conflicts {
            tracing::warn!("{}", conflict);
        }
        for conflict in &summary.consolidation_conflicts {
            tracing::warn!("{}", conflict);
        }
        for statement in StatementType::ALL {
            match summary.rows_written.get(&statement) {
                Some(rows) => tracing::info!(
                    "{} {}: {} years in {}",
                    store.ticker(), statement, rows,
                    store.unified_dir().join(statement.unified_file_name()).display()
                ),
                None => tracing::warn!("{} {}: no unified table written", store.ticker(), statement),
            }
        }
        processed += 1;
    }

    tracing::info!("Processing finished. {} of {} companies produced output", processed, companies.len());
    Ok(())
}

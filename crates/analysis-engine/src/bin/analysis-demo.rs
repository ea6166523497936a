//! Run analysis tasks against in-process demo collaborators and print their
//! event streams as server-sent-event frames

use analysis_engine::{
    AnalysisRequest, Analyzer, CacheCategory, CacheManager, CachedFetcher, DataFetcher,
    EngineConfig, LagPolicy, TaskContext, TaskManager, TextGenerator,
};
use async_trait::async_trait;
use clap::Parser;
use serde_json::{Value, json};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "analysis-demo")]
#[command(about = "Stream instrument analysis tasks as server-sent events", long_about = None)]
struct Args {
    /// Instruments to analyze, one task each
    #[arg(default_value = "AAPL")]
    instruments: Vec<String>,

    /// JSON engine configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Subscriber lag policy when no configuration file is given
    #[arg(long, default_value = "drop_oldest")]
    lag_policy: LagPolicy,

    /// Stages to run (default: all)
    #[arg(short, long)]
    stage: Vec<String>,

    /// Skip the generated summary
    #[arg(long)]
    no_summary: bool,

    /// Cancel every task after this many milliseconds
    #[arg(long)]
    cancel_after_ms: Option<u64>,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,
}

/// Deterministic synthetic market data
struct DemoFeed;

#[async_trait]
impl DataFetcher for DemoFeed {
    async fn fetch(&self, key: &str) -> analysis_engine::Result<Value> {
        tokio::time::sleep(Duration::from_millis(50)).await;
        let seed = key.bytes().fold(7_u64, |acc, b| acc.wrapping_mul(31).wrapping_add(u64::from(b)));
        let (symbol, dataset) = key.split_once(':').unwrap_or((key, "prices"));
        let base = 50.0 + (seed % 200) as f64;

        let value = match dataset {
            "prices" => {
                let closes: Vec<f64> = (0..30_u64)
                    .map(|day| {
                        let wave = ((seed.wrapping_add(day * 17)) % 11) as f64 - 5.0;
                        ((base + day as f64 * 0.4 + wave) * 100.0).round() / 100.0
                    })
                    .collect();
                json!({ "symbol": symbol, "closes": closes })
            }
            _ => json!({
                "symbol": symbol,
                "pe_ratio": 8.0 + (seed % 40) as f64,
                "revenue_growth": ((seed % 25) as f64 - 5.0) / 100.0,
                "debt_to_equity": (seed % 150) as f64 / 100.0,
            }),
        };
        Ok(value)
    }
}

fn moving_average(values: &[f64], window: usize) -> Option<f64> {
    (values.len() >= window && window > 0)
        .then(|| values[values.len() - window..].iter().sum::<f64>() / window as f64)
}

struct TechnicalAnalyzer {
    prices: Arc<CachedFetcher>,
}

#[async_trait]
impl Analyzer for TechnicalAnalyzer {
    fn name(&self) -> &str {
        "technical"
    }

    async fn run(&self, instrument: &str, ctx: &TaskContext) -> analysis_engine::Result<Value> {
        let data = self.prices.fetch(&format!("{instrument}:prices")).await?;
        let closes: Vec<f64> = data["closes"]
            .as_array()
            .map(|values| values.iter().filter_map(Value::as_f64).collect())
            .unwrap_or_default();
        ctx.report(json!({ "step": "prices_loaded", "days": closes.len() }));

        ctx.checkpoint()?;
        let short = moving_average(&closes, 5);
        let long = moving_average(&closes, 20);
        let trend = match (short, long) {
            (Some(short), Some(long)) if short > long => "up",
            (Some(_), Some(_)) => "down",
            _ => "unknown",
        };
        ctx.report(json!({ "step": "moving_averages", "sma5": short, "sma20": long }));

        Ok(json!({ "trend": trend, "sma5": short, "sma20": long, "last_close": closes.last() }))
    }
}

struct FundamentalAnalyzer {
    fundamentals: Arc<CachedFetcher>,
}

#[async_trait]
impl Analyzer for FundamentalAnalyzer {
    fn name(&self) -> &str {
        "fundamental"
    }

    async fn run(&self, instrument: &str, ctx: &TaskContext) -> analysis_engine::Result<Value> {
        let data = self
            .fundamentals
            .fetch(&format!("{instrument}:fundamentals"))
            .await?;
        ctx.report(json!({ "step": "statements_loaded" }));

        let pe = data["pe_ratio"].as_f64().unwrap_or(f64::NAN);
        let valuation = if pe < 15.0 {
            "cheap"
        } else if pe < 30.0 {
            "fair"
        } else {
            "expensive"
        };
        Ok(json!({
            "valuation": valuation,
            "pe_ratio": data["pe_ratio"],
            "revenue_growth": data["revenue_growth"],
            "debt_to_equity": data["debt_to_equity"],
        }))
    }
}

/// Writes a canned outlook word by word
struct DemoWriter;

#[async_trait]
impl TextGenerator for DemoWriter {
    fn name(&self) -> &str {
        "demo-writer"
    }

    async fn generate(
        &self,
        prompt: &str,
        on_chunk: &(dyn for<'c> Fn(&'c str) + Send + Sync),
    ) -> analysis_engine::Result<()> {
        let outlook = if prompt.contains("\"trend\": \"up\"") {
            "bullish"
        } else {
            "neutral"
        };
        let text = format!(
            "Momentum and valuation were reviewed from the stage results. Overall outlook: {outlook}."
        );
        for word in text.split_inclusive(' ') {
            tokio::time::sleep(Duration::from_millis(20)).await;
            on_chunk(word);
        }
        Ok(())
    }
}

fn load_config(args: &Args) -> anyhow::Result<EngineConfig> {
    let config = match &args.config {
        Some(path) => EngineConfig::from_json_file(path)?,
        None => EngineConfig::new(args.lag_policy),
    };
    Ok(config.with_env_overrides()?)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    if args.json_logs {
        engine_utils::init_tracing_json();
    } else {
        engine_utils::init_tracing();
    }

    let config = load_config(&args)?;
    info!(workers = config.worker_capacity, lag_policy = ?config.broker.lag_policy, "Starting analysis-demo");

    let cache = CacheManager::new(&config.cache);
    let feed: Arc<dyn DataFetcher> = Arc::new(DemoFeed);
    let prices = Arc::new(CachedFetcher::new(
        "demo-prices",
        Arc::clone(&feed),
        &cache,
        CacheCategory::Price,
        config.fetch.clone(),
    ));
    let fundamentals = Arc::new(CachedFetcher::new(
        "demo-fundamentals",
        feed,
        &cache,
        CacheCategory::Fundamental,
        config.fetch.clone(),
    ));

    let manager = TaskManager::builder()
        .config(config)
        .cache(cache)
        .analyzer(Arc::new(TechnicalAnalyzer { prices }))
        .analyzer(Arc::new(FundamentalAnalyzer { fundamentals }))
        .text_generator(Arc::new(DemoWriter))
        .build()?;
    let maintenance = manager.spawn_maintenance();

    let mut streams = Vec::new();
    for instrument in &args.instruments {
        let request = AnalysisRequest::new(instrument.as_str())
            .with_stages(args.stage.iter().cloned())
            .with_summary(!args.no_summary);
        let task_id = manager.create_task(request)?;
        let subscription = manager.open_event_stream(&task_id)?;
        streams.push(tokio::spawn(async move {
            let mut subscription = subscription;
            while let Some(event) = subscription.next().await {
                match event {
                    Ok(event) => print!("{}", event.to_wire().to_sse_frame()),
                    Err(err) => warn!(error = %err, "Event stream ended early"),
                }
            }
        }));
    }

    if let Some(delay) = args.cancel_after_ms {
        tokio::time::sleep(Duration::from_millis(delay)).await;
        for task in manager.list_tasks() {
            manager.cancel_task(&task.id)?;
        }
    }

    for stream in streams {
        stream.await?;
    }

    for task in manager.list_tasks() {
        info!(task_id = %task.id, instrument = %task.instrument, status = %task.status, "Task finished");
    }
    for (category, stats) in manager.cache().stats() {
        if stats.loads > 0 {
            info!(category = %category, hits = stats.hits, misses = stats.misses, hit_rate = stats.hit_rate(), "Cache statistics");
        }
    }

    maintenance.abort();
    Ok(())
}

use cryptoscope_datahub::config::Config;
use cryptoscope_datahub::scrapers::coingecko::CoinGeckoMarketCapSource;
use cryptoscope_datahub::scrapers::yahoo::{YahooChartClient, YahooListingScraper};
use cryptoscope_datahub::services::artifacts;
use cryptoscope_datahub::services::pipeline::{PipelineOrchestrator, PipelineReport};
use cryptoscope_datahub::store::PriceStore;

use anyhow::{Context, Result};
use clap::{App, Arg, ArgMatches};
use log::info;
use std::sync::Arc;

fn build_orchestrator(config: Config) -> Result<PipelineOrchestrator> {
    let store = PriceStore::open(&config.db_path)
        .with_context(|| format!("opening price store {}", config.db_path.display()))?;

    let listing = YahooListingScraper::new(config.listing_page_size)?;
    let quotes = YahooChartClient::new()?;
    let caps = CoinGeckoMarketCapSource::new()?;

    Ok(PipelineOrchestrator::new(
        config,
        Arc::new(store),
        Arc::new(listing),
        Arc::new(quotes),
        Arc::new(caps),
    ))
}

fn print_report(report: &PipelineReport) {
    info!("{:-<60}", "");
    info!("symbols discovered : {}", report.symbols_discovered);
    info!("jobs planned       : {}", report.jobs_planned);
    info!("jobs failed        : {}", report.jobs_failed);
    info!("jobs without rows  : {}", report.jobs_empty);
    info!("rows fetched       : {}", report.rows_fetched);
    info!("rows inserted      : {}", report.rows_inserted);
    info!("rows dropped       : {}", report.rows_dropped);
    info!("caps fetched       : {}", report.caps_fetched);
    info!("caps applied       : {}", report.caps_applied);
    info!("elapsed            : {:.2}s", report.elapsed.as_secs_f64());
}

fn parse_usize(matches: &ArgMatches, name: &str) -> Result<Option<usize>> {
    matches
        .value_of(name)
        .map(|v| v.parse::<usize>().with_context(|| format!("invalid --{}: {}", name, v)))
        .transpose()
}

fn explore(config: &Config, matches: &ArgMatches) -> Result<()> {
    let store = PriceStore::open(&config.db_path)?;
    store.ensure_schema()?;
    let limit = parse_usize(matches, "limit")?.unwrap_or(10);

    if let Some(symbol) = matches.value_of("symbol") {
        let bars = store.prices_for(symbol)?;
        info!("{} - {} daily records", symbol, bars.len());
        info!("{:-<60}", "");
        info!("{:<12} {:<12} {:<12} {:<12} {:<12} {:<15} {:<15}",
              "Date", "Open", "High", "Low", "Close", "Volume", "MarketCap");
        info!("{:-<60}", "");

        for bar in bars.iter().rev().take(limit) {
            let cap = bar.market_cap.map(|c| format!("{:.0}", c)).unwrap_or_default();
            info!("{:<12} {:<12.4} {:<12.4} {:<12.4} {:<12.4} {:<15.0} {:<15}",
                  bar.date, bar.open, bar.high, bar.low, bar.close, bar.volume, cap);
        }
        if bars.is_empty() {
            info!("No daily data available for this symbol");
        }
        return Ok(());
    }

    let quotes = store.latest_quotes(limit, 0, matches.value_of("query"))?;
    info!("{:<5} {:<12} {:<12} {:<14} {:<10} {:<18} {:<18}",
          "Rank", "Symbol", "Date", "Price", "Change%", "Volume", "MarketCap");
    info!("{:-<90}", "");
    for quote in quotes {
        let change = quote.change_pct.map(|c| format!("{:.2}", c)).unwrap_or_default();
        let cap = quote.market_cap.map(|c| format!("{:.0}", c)).unwrap_or_default();
        info!("{:<5} {:<12} {:<12} {:<14.4} {:<10} {:<18.0} {:<18}",
              quote.rank, quote.symbol, quote.date, quote.price, change, quote.volume, cap);
    }
    Ok(())
}

fn build_app() -> App<'static> {
    let limit_arg = || {
        Arg::new("limit")
            .short('l')
            .long("limit")
            .value_name("COUNT")
            .help("Number of symbols to discover")
            .takes_value(true)
    };
    let workers_arg = || {
        Arg::new("workers")
            .short('w')
            .long("workers")
            .value_name("WORKERS")
            .help("Upper bound on concurrent fetch workers (defaults to DATAHUB_MAX_WORKERS or 8)")
            .takes_value(true)
    };

    let app = App::new("Cryptoscope DataHub")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Crypto OHLCV ingestion pipeline")
        .arg(
            Arg::new("db")
                .long("db")
                .value_name("PATH")
                .help("SQLite price store (defaults to DB_PATH or data/crypto.db)")
                .takes_value(true)
                .global(true),
        )
        .arg(
            Arg::new("data-dir")
                .long("data-dir")
                .value_name("DIR")
                .help("Directory for symbols.csv and download_plan.csv")
                .takes_value(true)
                .global(true),
        );

    // 在开发模式下添加调试参数
    #[cfg(debug_assertions)]
    let app = app.arg(
        Arg::new("debug-limit")
            .long("debug-limit")
            .help("Limit the number of symbols and listing pages in debug mode")
            .takes_value(true)
            .global(true),
    );

    app
        .subcommand(
            App::new("run")
                .about("Discover, plan, fetch+persist and enrich in one pass")
                .arg(limit_arg())
                .arg(workers_arg()),
        )
        .subcommand(App::new("discover").about("Scrape the listing into symbols.csv").arg(limit_arg()))
        .subcommand(App::new("plan").about("Diff symbols.csv against the store into download_plan.csv"))
        .subcommand(
            App::new("sync")
                .about("Fetch and persist the download plan, then enrich market caps")
                .arg(workers_arg()),
        )
        .subcommand(App::new("caps").about("Refresh market caps on the latest row of each symbol"))
        .subcommand(
            App::new("explore")
                .about("Explore stored prices")
                .arg(
                    Arg::new("symbol")
                        .short('s')
                        .long("symbol")
                        .value_name("SYMBOL")
                        .help("Show recent bars for one symbol")
                        .takes_value(true),
                )
                .arg(
                    Arg::new("query")
                        .short('q')
                        .long("query")
                        .value_name("TEXT")
                        .help("Filter ranked symbols")
                        .takes_value(true),
                )
                .arg(
                    Arg::new("limit")
                        .short('l')
                        .long("limit")
                        .value_name("LIMIT")
                        .help("Limit the number of records to display")
                        .takes_value(true)
                        .default_value("10"),
                ),
        )
}

/// `--workers` only overrides the configured cap when it is given.
fn apply_workers(config: Config, matches: &ArgMatches) -> Result<Config> {
    Ok(match parse_usize(matches, "workers")? {
        Some(workers) => config.with_max_workers(workers),
        None => config,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let matches = build_app().get_matches();

    let mut config = Config::from_env();
    if let Some(db) = matches.value_of("db") {
        config = config.with_db_path(db);
    }
    if let Some(dir) = matches.value_of("data-dir") {
        config = config.with_data_dir(dir);
    }

    #[cfg(debug_assertions)]
    if let Some(limit) = parse_usize(&matches, "debug-limit")? {
        info!("DEBUG MODE: limiting discovery to {} symbols", limit);
        config = config.with_target_symbols(limit).with_max_pages(1);
    }

    match matches.subcommand() {
        Some(("run", sub)) => {
            if let Some(limit) = parse_usize(sub, "limit")? {
                config = config.with_target_symbols(limit);
            }
            config = apply_workers(config, sub)?;

            let report = build_orchestrator(config)?.run().await?;
            print_report(&report);
        }
        Some(("discover", sub)) => {
            if let Some(limit) = parse_usize(sub, "limit")? {
                config = config.with_target_symbols(limit);
            }
            let symbols = build_orchestrator(config)?.discover().await;
            info!("Final valid symbols: {}", symbols.len());
        }
        Some(("plan", _)) => {
            let universe = artifacts::read_symbols(&config.symbols_file())?;
            let mut orchestrator = build_orchestrator(config)?;
            orchestrator.ensure_schema().await?;
            let jobs = orchestrator.plan(universe).await?;
            let fresh = jobs.iter().filter(|job| job.last_date.is_none()).count();
            info!("Planned {} jobs, {} without stored history", jobs.len(), fresh);
        }
        Some(("sync", sub)) => {
            config = apply_workers(config, sub)?;
            let report = build_orchestrator(config)?.run_from_plan().await?;
            print_report(&report);
        }
        Some(("caps", _)) => {
            let report = build_orchestrator(config)?.run_caps_only().await?;
            print_report(&report);
        }
        Some(("explore", sub)) => explore(&config, sub)?,
        _ => info!("No command specified. Use --help for usage information."),
    }

    Ok(())
}

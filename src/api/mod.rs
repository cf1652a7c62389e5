use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use axum::{
    Router,
    extract::{Json, Query, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::info;

use crate::core::{
    Accounting, DynamicEntry, DynamicSummary, EngineConfig, MarketSeries, NestEggPolicy,
    SwrContext, SwrError, SwrResult, VPW_STOCK75_AGE65, WalkForwardMethod, WalkForwardOptions,
    compare_paths, dynamic_summary, find_dynamic_rates, parse_month, reretire, success_counts,
    walk_forward,
};

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum CliAccounting {
    Real,
    Nominal,
}

impl From<CliAccounting> for Accounting {
    fn from(value: CliAccounting) -> Self {
        match value {
            CliAccounting::Real => Accounting::Real,
            CliAccounting::Nominal => Accounting::Nominal,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum CliMethod {
    Baseline,
    Dmswr,
}

impl From<CliMethod> for WalkForwardMethod {
    fn from(value: CliMethod) -> Self {
        match value {
            CliMethod::Baseline => WalkForwardMethod::Baseline,
            CliMethod::Dmswr => WalkForwardMethod::Dmswr,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case")]
enum ApiMethod {
    Baseline,
    Dmswr,
}

impl From<ApiMethod> for WalkForwardMethod {
    fn from(value: ApiMethod) -> Self {
        match value {
            ApiMethod::Baseline => WalkForwardMethod::Baseline,
            ApiMethod::Dmswr => WalkForwardMethod::Dmswr,
        }
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "dmswr",
    about = "Historical safe withdrawal rates: baseline, dynamic (DMSWR) and re-retire"
)]
pub struct Cli {
    #[command(flatten)]
    data: DataArgs,
    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug, Clone)]
struct DataArgs {
    #[arg(
        long,
        global = true,
        default_value = "data/returns.csv",
        help = "Monthly market returns CSV"
    )]
    data: PathBuf,
    #[arg(long, value_enum, global = true, default_value_t = CliAccounting::Real)]
    accounting: CliAccounting,
    #[arg(long, global = true, help = "Engine settings (TOML)")]
    config: Option<PathBuf>,
}

#[derive(Args, Debug, Clone, Copy, PartialEq)]
struct RetirementArgs {
    #[arg(long, default_value_t = 30, help = "Retirement duration in years")]
    years: u32,
    #[arg(long, default_value_t = 20, help = "Lookback window in years")]
    lookback: u32,
    #[arg(long, default_value_t = 75, help = "Stock allocation in percent")]
    stock: u32,
    #[arg(long, default_value_t = 1_000_000.0)]
    nest_egg: f64,
}

impl Default for RetirementArgs {
    fn default() -> Self {
        Self {
            years: 30,
            lookback: 20,
            stock: 75,
            nest_egg: 1_000_000.0,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    #[command(about = "Serve the JSON API")]
    Serve {
        #[arg(long, default_value_t = 8080)]
        port: u16,
    },
    #[command(about = "Write the baseline rate table as CSV")]
    Baseline {
        #[arg(long, help = "Output file (stdout when omitted)")]
        output: Option<PathBuf>,
    },
    #[command(about = "Dynamic rates for a range of retirement months")]
    Dmswr {
        #[command(flatten)]
        retirement: RetirementArgs,
        #[arg(long, help = "First retirement month (YYYY-MM)")]
        from: Option<String>,
        #[arg(long, help = "Last retirement month (YYYY-MM)")]
        to: Option<String>,
        #[arg(long, help = "Grow the nest egg with the market from the first month")]
        market_growth: bool,
        #[arg(long, help = "Print summary statistics instead of records")]
        summary: bool,
    },
    #[command(about = "Re-retire trajectory for one retirement month")]
    Reretire {
        #[command(flatten)]
        retirement: RetirementArgs,
        #[arg(long, help = "Retirement month (YYYY-MM)")]
        retire: String,
    },
    #[command(about = "Walk-forward failure analysis")]
    WalkForward {
        #[command(flatten)]
        retirement: RetirementArgs,
        #[arg(long, value_enum, default_value_t = CliMethod::Baseline)]
        method: CliMethod,
        #[arg(long)]
        partial_years: Option<u32>,
    },
    #[command(about = "Baseline, re-retire and VPW paths for one 35-year retirement")]
    Compare {
        #[arg(long, help = "Retirement month (YYYY-MM)")]
        retire: String,
        #[arg(long, default_value_t = 20)]
        lookback: u32,
        #[arg(long, default_value_t = 75)]
        stock: u32,
        #[arg(long, default_value_t = 1_000_000.0)]
        nest_egg: f64,
    },
    #[command(about = "Count historical windows that survive a fixed rate")]
    Success {
        #[command(flatten)]
        retirement: RetirementArgs,
        #[arg(long)]
        rate_bp: u32,
    },
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct RetirementParams {
    years: u32,
    lookback: u32,
    stock: u32,
    nest_egg: f64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct BaselinePayload {
    years: Option<u32>,
    stock: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct BaselineEntryPayload {
    date: Option<String>,
    years: Option<u32>,
    stock: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct DynamicPayload {
    years: Option<u32>,
    lookback: Option<u32>,
    stock: Option<u32>,
    from: Option<String>,
    to: Option<String>,
    summary: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct ReretirePayload {
    date: Option<String>,
    years: Option<u32>,
    lookback: Option<u32>,
    stock: Option<u32>,
    nest_egg: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct WalkForwardPayload {
    method: Option<ApiMethod>,
    years: Option<u32>,
    lookback: Option<u32>,
    stock: Option<u32>,
    partial_years: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct SuccessPayload {
    rate_bp: Option<u32>,
    years: Option<u32>,
    stock: Option<u32>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct BaselineRow {
    duration_years: u32,
    allocation: u32,
    rate_bp: u32,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DynamicResponse {
    baseline_bp: u32,
    entries: Vec<DynamicEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    summary: Option<DynamicSummary>,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

fn retirement_params(args: RetirementArgs) -> Result<RetirementParams, String> {
    if args.years == 0 {
        return Err("--years must be > 0".to_string());
    }
    if args.stock > 100 {
        return Err("--stock must be between 0 and 100".to_string());
    }
    if !args.nest_egg.is_finite() || args.nest_egg <= 0.0 {
        return Err("--nest-egg must be > 0".to_string());
    }
    Ok(RetirementParams {
        years: args.years,
        lookback: args.lookback,
        stock: args.stock,
        nest_egg: args.nest_egg,
    })
}

fn month_arg(name: &str, value: &str) -> Result<NaiveDate, String> {
    parse_month(value).ok_or_else(|| format!("--{name} must be a month like 1986-02, got `{value}`"))
}

pub async fn run(cli: Cli) -> anyhow::Result<()> {
    let ctx = Arc::new(load_context(&cli.data)?);

    match cli.command {
        Command::Serve { port } => run_http_server(ctx, port).await?,
        Command::Baseline { output } => match output {
            Some(path) => {
                let file = File::create(&path)
                    .with_context(|| format!("can't create {}", path.display()))?;
                ctx.baseline().write_csv(BufWriter::new(file))?;
                info!(path = %path.display(), "baseline table written");
            }
            None => ctx.baseline().write_csv(io::stdout().lock())?,
        },
        Command::Dmswr {
            retirement,
            from,
            to,
            market_growth,
            summary,
        } => {
            let params = retirement_params(retirement).map_err(anyhow::Error::msg)?;
            if summary {
                let stats = dynamic_summary(&ctx, params.years, params.lookback, params.stock)?;
                print_json(&stats)?;
                return Ok(());
            }
            let series = ctx.series();
            let first = params.lookback as usize * 12;
            let start = match from {
                Some(s) => index_arg(series, "from", &s)?,
                None => first,
            };
            let end = match to {
                Some(s) => index_arg(series, "to", &s)?,
                None => series.len() - 1,
            };
            let nest_egg = if market_growth {
                NestEggPolicy::MarketGrowth {
                    initial: params.nest_egg,
                }
            } else {
                NestEggPolicy::Constant {
                    amount: params.nest_egg,
                }
            };
            let records = find_dynamic_rates(
                &ctx,
                start,
                end,
                params.years,
                params.lookback,
                params.stock,
                nest_egg,
            )?;
            print_json(&records)?;
        }
        Command::Reretire { retirement, retire } => {
            let params = retirement_params(retirement).map_err(anyhow::Error::msg)?;
            let retire = month_arg("retire", &retire).map_err(anyhow::Error::msg)?;
            let records = reretire(
                &ctx,
                retire,
                params.years,
                params.lookback,
                params.stock,
                params.nest_egg,
            )?;
            print_json(&records)?;
        }
        Command::WalkForward {
            retirement,
            method,
            partial_years,
        } => {
            let params = retirement_params(retirement).map_err(anyhow::Error::msg)?;
            let report = walk_forward(
                &ctx,
                WalkForwardOptions {
                    method: method.into(),
                    duration_years: params.years,
                    lookback_years: params.lookback,
                    allocation: params.stock,
                    partial_min_years: partial_years,
                },
            )?;
            print_json(&report)?;
        }
        Command::Compare {
            retire,
            lookback,
            stock,
            nest_egg,
        } => {
            let params = retirement_params(RetirementArgs {
                years: VPW_STOCK75_AGE65.len() as u32,
                lookback,
                stock,
                nest_egg,
            })
            .map_err(anyhow::Error::msg)?;
            let retire = month_arg("retire", &retire).map_err(anyhow::Error::msg)?;
            let paths = compare_paths(
                &ctx,
                retire,
                params.lookback,
                params.stock,
                params.nest_egg,
                &VPW_STOCK75_AGE65,
            )?;
            print_json(&paths)?;
        }
        Command::Success {
            retirement,
            rate_bp,
        } => {
            let params = retirement_params(retirement).map_err(anyhow::Error::msg)?;
            let counts = success_counts(&ctx, rate_bp, params.years, params.stock)?;
            print_json(&counts)?;
        }
    }
    Ok(())
}

fn load_context(data: &DataArgs) -> anyhow::Result<SwrContext> {
    let config = match &data.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    let series = MarketSeries::load_csv(&data.data, data.accounting.into())
        .with_context(|| format!("loading market data from {}", data.data.display()))?;
    Ok(SwrContext::build(Arc::new(series), config)?)
}

fn index_arg(series: &MarketSeries, name: &str, value: &str) -> anyhow::Result<usize> {
    let date = month_arg(name, value).map_err(anyhow::Error::msg)?;
    series
        .index_for_time(date)
        .ok_or_else(|| anyhow::anyhow!("--{name} {value} is outside the market data"))
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    let mut out = io::stdout().lock();
    serde_json::to_writer_pretty(&mut out, value)?;
    writeln!(out)?;
    Ok(())
}

pub fn router(ctx: Arc<SwrContext>) -> Router {
    Router::new()
        .route("/api/baseline", get(baseline_handler))
        .route("/api/baseline/entry", get(baseline_entry_handler))
        .route("/api/dynamic", get(dynamic_handler))
        .route("/api/reretire", get(reretire_handler))
        .route("/api/walk-forward", get(walk_forward_handler))
        .route("/api/success", get(success_handler))
        .fallback(not_found_handler)
        .with_state(ctx)
}

pub async fn run_http_server(ctx: Arc<SwrContext>, port: u16) -> io::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "DMSWR HTTP API listening");
    axum::serve(listener, router(ctx)).await
}

async fn not_found_handler() -> Response {
    error_response(StatusCode::NOT_FOUND, "Not found")
}

async fn baseline_handler(
    State(ctx): State<Arc<SwrContext>>,
    Query(payload): Query<BaselinePayload>,
) -> Response {
    if let Some(stock) = payload.stock {
        if !ctx.series().supports(stock) {
            return engine_error_response(&SwrError::UnsupportedAllocation(stock));
        }
    }
    let table = ctx.baseline();
    let mut rows = Vec::new();
    for years in 1..=table.max_duration_years() {
        if payload.years.is_some_and(|y| y != years) {
            continue;
        }
        for &allocation in table.allocations() {
            if payload.stock.is_some_and(|s| s != allocation) {
                continue;
            }
            if let Some(rate_bp) = table.rate(years, allocation) {
                rows.push(BaselineRow {
                    duration_years: years,
                    allocation,
                    rate_bp,
                });
            }
        }
    }
    if rows.is_empty() {
        return error_response(StatusCode::NOT_FOUND, "no baseline rate for that duration");
    }
    json_response(StatusCode::OK, rows)
}

async fn baseline_entry_handler(
    State(ctx): State<Arc<SwrContext>>,
    Query(payload): Query<BaselineEntryPayload>,
) -> Response {
    let (date, params) = match baseline_entry_request(payload) {
        Ok(request) => request,
        Err(msg) => return error_response(StatusCode::BAD_REQUEST, &msg),
    };
    if !ctx.series().supports(params.stock) {
        return engine_error_response(&SwrError::UnsupportedAllocation(params.stock));
    }
    match ctx.baseline().get(date, params.years, params.stock) {
        Some(entry) => json_response(StatusCode::OK, entry),
        None => error_response(
            StatusCode::NOT_FOUND,
            "retirement window is not fully covered by the market data",
        ),
    }
}

fn baseline_entry_request(
    payload: BaselineEntryPayload,
) -> Result<(NaiveDate, RetirementParams), String> {
    let Some(date) = payload.date.as_deref() else {
        return Err("--date is required".to_string());
    };
    let defaults = RetirementArgs::default();
    let params = retirement_params(RetirementArgs {
        years: payload.years.unwrap_or(defaults.years),
        stock: payload.stock.unwrap_or(defaults.stock),
        ..defaults
    })?;
    Ok((month_arg("date", date)?, params))
}

async fn dynamic_handler(
    State(ctx): State<Arc<SwrContext>>,
    Query(payload): Query<DynamicPayload>,
) -> Response {
    let request = dynamic_request(payload);
    let (params, from, to, summary) = match request {
        Ok(request) => request,
        Err(msg) => return error_response(StatusCode::BAD_REQUEST, &msg),
    };
    run_engine(ctx, move |ctx| {
        let series = ctx.series();
        let from = from.unwrap_or_else(|| series.start_time());
        let to = to.unwrap_or_else(|| series.time(series.len() - 1));
        let entries = ctx.dynamic_range(params.years, params.lookback, params.stock, from, to)?;
        let summary = if summary {
            Some(dynamic_summary(ctx, params.years, params.lookback, params.stock)?)
        } else {
            None
        };
        Ok(DynamicResponse {
            baseline_bp: ctx.baseline_rate(params.years, params.stock)?,
            entries,
            summary,
        })
    })
    .await
}

type DynamicRequest = (RetirementParams, Option<NaiveDate>, Option<NaiveDate>, bool);

fn dynamic_request(payload: DynamicPayload) -> Result<DynamicRequest, String> {
    let defaults = RetirementArgs::default();
    let params = retirement_params(RetirementArgs {
        years: payload.years.unwrap_or(defaults.years),
        lookback: payload.lookback.unwrap_or(defaults.lookback),
        stock: payload.stock.unwrap_or(defaults.stock),
        ..defaults
    })?;
    let from = payload.from.as_deref().map(|s| month_arg("from", s)).transpose()?;
    let to = payload.to.as_deref().map(|s| month_arg("to", s)).transpose()?;
    if let (Some(from), Some(to)) = (from, to) {
        if to < from {
            return Err("--to must not be before --from".to_string());
        }
    }
    Ok((params, from, to, payload.summary.unwrap_or(false)))
}

async fn reretire_handler(
    State(ctx): State<Arc<SwrContext>>,
    Query(payload): Query<ReretirePayload>,
) -> Response {
    let (date, params) = match reretire_request(payload) {
        Ok(request) => request,
        Err(msg) => return error_response(StatusCode::BAD_REQUEST, &msg),
    };
    run_engine(ctx, move |ctx| {
        reretire(
            ctx,
            date,
            params.years,
            params.lookback,
            params.stock,
            params.nest_egg,
        )
    })
    .await
}

fn reretire_request(payload: ReretirePayload) -> Result<(NaiveDate, RetirementParams), String> {
    let Some(date) = payload.date.as_deref() else {
        return Err("--date is required".to_string());
    };
    let date = month_arg("date", date)?;
    let defaults = RetirementArgs::default();
    let params = retirement_params(RetirementArgs {
        years: payload.years.unwrap_or(defaults.years),
        lookback: payload.lookback.unwrap_or(defaults.lookback),
        stock: payload.stock.unwrap_or(defaults.stock),
        nest_egg: payload.nest_egg.unwrap_or(defaults.nest_egg),
    })?;
    Ok((date, params))
}

async fn walk_forward_handler(
    State(ctx): State<Arc<SwrContext>>,
    Query(payload): Query<WalkForwardPayload>,
) -> Response {
    let options = match walk_forward_request(payload) {
        Ok(options) => options,
        Err(msg) => return error_response(StatusCode::BAD_REQUEST, &msg),
    };
    run_engine(ctx, move |ctx| walk_forward(ctx, options)).await
}

fn walk_forward_request(payload: WalkForwardPayload) -> Result<WalkForwardOptions, String> {
    let defaults = RetirementArgs::default();
    let params = retirement_params(RetirementArgs {
        years: payload.years.unwrap_or(defaults.years),
        lookback: payload.lookback.unwrap_or(defaults.lookback),
        stock: payload.stock.unwrap_or(defaults.stock),
        ..defaults
    })?;
    if payload.partial_years == Some(0) {
        return Err("--partial-years must be > 0".to_string());
    }
    Ok(WalkForwardOptions {
        method: payload.method.unwrap_or(ApiMethod::Baseline).into(),
        duration_years: params.years,
        lookback_years: params.lookback,
        allocation: params.stock,
        partial_min_years: payload.partial_years,
    })
}

async fn success_handler(
    State(ctx): State<Arc<SwrContext>>,
    Query(payload): Query<SuccessPayload>,
) -> Response {
    let Some(rate_bp) = payload.rate_bp else {
        return error_response(StatusCode::BAD_REQUEST, "--rate-bp is required");
    };
    let defaults = RetirementArgs::default();
    let params = match retirement_params(RetirementArgs {
        years: payload.years.unwrap_or(defaults.years),
        stock: payload.stock.unwrap_or(defaults.stock),
        ..defaults
    }) {
        Ok(params) => params,
        Err(msg) => return error_response(StatusCode::BAD_REQUEST, &msg),
    };
    run_engine(ctx, move |ctx| {
        success_counts(ctx, rate_bp, params.years, params.stock)
    })
    .await
}

async fn run_engine<T, F>(ctx: Arc<SwrContext>, job: F) -> Response
where
    T: Serialize + Send + 'static,
    F: FnOnce(&SwrContext) -> SwrResult<T> + Send + 'static,
{
    match tokio::task::spawn_blocking(move || job(&ctx)).await {
        Ok(Ok(body)) => json_response(StatusCode::OK, body),
        Ok(Err(err)) => engine_error_response(&err),
        Err(err) => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            &format!("engine task failed: {err}"),
        ),
    }
}

fn status_for(err: &SwrError) -> StatusCode {
    match err {
        SwrError::InvalidInput(_) | SwrError::UnsupportedAllocation(_) => StatusCode::BAD_REQUEST,
        SwrError::InsufficientHistory(_) => StatusCode::NOT_FOUND,
        SwrError::InvariantViolation(_)
        | SwrError::NumericDomain(_)
        | SwrError::Data(_)
        | SwrError::Config(_)
        | SwrError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn engine_error_response(err: &SwrError) -> Response {
    error_response(status_for(err), &err.to_string())
}

fn json_response<T: Serialize>(status: StatusCode, body: T) -> Response {
    let mut response = (status, Json(body)).into_response();
    response.headers_mut().insert(
        header::CACHE_CONTROL,
        header::HeaderValue::from_static("no-store"),
    );
    response
}

fn error_response(status: StatusCode, msg: &str) -> Response {
    json_response(
        status,
        ErrorResponse {
            error: msg.to_string(),
        },
    )
}

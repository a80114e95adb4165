use std::panic;
use std::process::ExitCode;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use anyhow::Context;
use backtrace::Backtrace;
use clap::Parser;
use metrics::counter;
use mimalloc::MiMalloc;
use oq_starmap::config::Config;
use oq_starmap::registry::Registry;
use oq_starmap::runner::ERROR_TAGS;
use oq_starmap::worker;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::level_filters::LevelFilter;
use tracing::span;
use tracing::Level;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;
use warp::Filter;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

const BUILTIN_TASK_TYPES: [&str; 3] = ["count", "debug", "split_task"];

#[derive(Parser, Clone, Debug)]
struct Cli {
    /// Path to the configuration file.
    #[clap(short, long)]
    config: Option<String>,

    /// If set, output logs in JSON format.
    #[clap(short, long, action)]
    json: bool,

    /// Serve remote dispatchers on this address, e.g. 0.0.0.0:1908.
    /// Without it the worker only runs as a process-pool child.
    #[clap(short, long)]
    listen: Option<String>,

    /// Port for the Prometheus exporter; 0 disables it.
    #[clap(short, long, default_value_t = 9090)]
    prometheus_port: u16,

    /// Port for the readiness/liveness endpoints; 0 disables them.
    #[clap(long, default_value_t = 0)]
    health_port: u16,

    /// Liveness fails when no task finished for this many seconds.
    #[clap(long, default_value_t = 600)]
    liveness_check_interval: u64,
}

fn setup_logging(json: bool) {
    if json {
        let subscriber = tracing_subscriber::fmt()
            .json()
            .with_level(true)
            .with_file(true)
            .with_line_number(true)
            .with_target(true)
            .with_env_filter(
                EnvFilter::builder()
                    .with_default_directive(LevelFilter::INFO.into())
                    .from_env_lossy(),
            )
            .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
            .finish();
        tracing::subscriber::set_global_default(subscriber).expect("Setting up logging failed");
    } else {
        let subscriber = tracing_subscriber::fmt()
            .compact()
            .with_level(true)
            .with_file(true)
            .with_line_number(true)
            .with_target(true)
            .with_env_filter(
                EnvFilter::builder()
                    .with_default_directive(LevelFilter::INFO.into())
                    .from_env_lossy(),
            )
            .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
            .finish();
        tracing::subscriber::set_global_default(subscriber).expect("Setting up logging failed");
    };
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    setup_logging(cli.json);

    panic::set_hook(Box::new(|panic_info| {
        let msg = match panic_info.payload().downcast_ref::<&'static str>() {
            Some(s) => *s,
            None => {
                match panic_info.payload().downcast_ref::<String>() {
                    Some(s) => &s[..],
                    None => "Box<dyn Any>",
                }
            },
        };
        let (file, lineno, col) = match panic_info.location() {
            Some(l) => (l.file(), l.line(), l.column()),
            None => ("<unknown>", 0, 0),
        };

        error!(
            msg,
            file,
            lineno,
            col,
            "Panic occurred: {:?}",
            Backtrace::new(),
        );
    }));

    let config = Config::load(cli.config.clone());
    config.validate();
    debug!("Loaded configuration: {:?}", config);

    if let Err(err) = run(&config, &cli).await {
        error!("Worker exited due to an error. err: {:?}", err);
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

async fn run(
    config: &Config,
    cli: &Cli,
) -> anyhow::Result<()> {
    let version = env!("CARGO_PKG_VERSION");
    let span = span!(Level::INFO, "run", "version" = version);
    let _guard = span.enter();

    let registry = Arc::new(Registry::with_builtins());

    // Pool children skip the exporter and the health server: many of them
    // share the machine and the parent supervises their lifetime.
    if worker::pool_feed_addr().is_some() {
        info!("Starting pool child. version: {}", version);
        return worker::pool_child(registry, config).await;
    }

    info!("Starting worker. version: {}", version);

    if cli.prometheus_port != 0 {
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(([0, 0, 0, 0], cli.prometheus_port))
            .install()
            .context("setting up Prometheus")?;
    }
    init_metrics();

    let listen = cli
        .listen
        .clone()
        .context("--listen is required outside a process pool")?;

    let last_task_processed = Arc::new(AtomicU64::new(now_secs()));
    if cli.health_port != 0 {
        start_health_server(
            cli.health_port,
            cli.liveness_check_interval,
            Arc::clone(&last_task_processed),
        );
    }

    worker::serve(registry, &listen, config, Some(last_task_processed)).await
}

/// Readiness and liveness endpoints; liveness fails once no task finished
/// within the configured interval.
fn start_health_server(
    port: u16,
    liveness_check_interval: u64,
    last_task_processed: Arc<AtomicU64>,
) {
    tokio::spawn(async move {
        let readiness_route = warp::path!("readiness")
            .map(|| warp::reply::with_status("OK", warp::http::StatusCode::OK));
        let liveness_route = warp::path!("liveness").map(move || {
            let last_processed = last_task_processed.load(Ordering::Relaxed);
            if now_secs() - last_processed <= liveness_check_interval {
                warp::reply::with_status("OK", warp::http::StatusCode::OK)
            } else {
                warp::reply::with_status("FAIL", warp::http::StatusCode::INTERNAL_SERVER_ERROR)
            }
        });
        let routes = readiness_route.or(liveness_route);
        warp::serve(routes).run(([0, 0, 0, 0], port)).await;
    });
}

/// Initialise the metrics early on for better dashboards.
fn init_metrics() {
    counter!("oq_worker_messages_total").increment(0);
    for task_type in BUILTIN_TASK_TYPES {
        counter!(
            "oq_worker_tasks_received_total",
            "task_type" => task_type.to_string(),
        )
        .increment(0);
        counter!(
            "oq_worker_tasks_successful_total",
            "task_type" => task_type.to_string(),
        )
        .increment(0);
        for error_tag in ERROR_TAGS {
            counter!(
                "oq_worker_tasks_error_total",
                "task_type" => task_type.to_string(),
                "type" => error_tag,
            )
            .increment(0);
        }
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("Epoch can not be in the future")
        .as_secs()
}

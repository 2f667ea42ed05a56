use actix_web::{
    get, middleware, web::Data, App, HttpRequest, HttpResponse, HttpServer, Responder,
};
use ansible_operator::controller::{self, Settings, State};
use ansible_operator::events::LogLevel;
use ansible_operator::runner::RunnerSettings;
use ansible_operator::telemetry;
use ansible_operator::watches;
use ansible_operator_proxy::{Options as ProxyOptions, Proxy};

use std::path::PathBuf;
use std::time::Duration;

use clap::{crate_authors, crate_description, crate_version, Parser};
use kube::{Client, Config};
use prometheus_client::registry::Registry;

#[get("/metrics")]
async fn metrics(c: Data<State>, _req: HttpRequest) -> impl Responder {
    match c.metrics() {
        Ok(metrics) => HttpResponse::Ok()
            .content_type("application/openmetrics-text; version=1.0.0; charset=utf-8")
            .body(metrics),
        Err(e) => {
            tracing::error!("Failed to get metrics: {:?}", e);
            HttpResponse::InternalServerError().finish()
        }
    }
}

#[get("/health")]
async fn health(_: HttpRequest) -> impl Responder {
    HttpResponse::Ok().json("healthy")
}

#[derive(Parser, Debug)]
#[command(
    name="ansible-operator",
    about = crate_description!(),
    version = crate_version!(),
    author = crate_authors!("\n"),
)]
struct Args {
    /// Listen on given port for health and metrics
    #[arg(short, long, default_value_t = 8080, env)]
    port: u32,

    /// Set logging filter directive for `tracing_subscriber::filter::EnvFilter`. Example: "info,kube=debug,ansible_operator=debug"
    #[arg(long, default_value = "info", env)]
    log_filter: String,

    /// Set log format
    #[arg(long, value_enum, default_value_t = telemetry::LogFormat::Text, env)]
    log_format: telemetry::LogFormat,

    /// URL for the OpenTelemetry tracing endpoint. Tracing is disabled when unset.
    #[arg(short, long, env = "OPENTELEMETRY_ENDPOINT_URL")]
    tracing_url: Option<String>,

    /// Sampling ratio for tracing
    #[arg(short, long, default_value_t = 0.1, env)]
    sample_ratio: f64,

    /// Mapping of watched GVKs to playbooks and roles
    #[arg(long, default_value = watches::DEFAULT_WATCHES_FILE, env)]
    watches_file: PathBuf,

    /// Address the cluster API proxy binds on
    #[arg(long, default_value = "localhost", env)]
    proxy_address: String,

    /// Port the cluster API proxy binds on
    #[arg(long, default_value_t = 8888, env)]
    proxy_port: u16,

    /// Root directory for per-CR runner input trees
    #[arg(long, default_value = "/tmp/ansible-operator/runner", env)]
    runner_dir: PathBuf,

    /// Directory for per-run event sockets
    #[arg(long, default_value = "/tmp/ansible-operator/eventapi", env)]
    event_socket_dir: PathBuf,

    /// Verbosity of the built-in job event logging
    #[arg(long, value_enum, default_value_t = LogLevel::Tasks, env)]
    runner_log_level: LogLevel,

    /// Wall-clock bound on a single run, in seconds
    #[arg(long, default_value_t = 600, env)]
    runner_timeout: u64,

    /// Forced resync period for all controllers, in seconds
    #[arg(long, default_value_t = 60, env = "RESYNC_PERIOD")]
    resync_period: u64,

    /// Namespace to watch; watches all namespaces when unset
    #[arg(long, env = "WATCH_NAMESPACE")]
    watch_namespace: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Args = Args::parse();

    telemetry::init(
        &args.log_filter,
        args.log_format,
        args.tracing_url.as_deref(),
        args.sample_ratio,
    )
    .await?;
    tracing::info!(version = crate_version!(), msg = "starting ansible-operator");

    // Startup misconfiguration fails the process.
    let watch_map = watches::load(&args.watches_file)?;
    let config = Config::infer().await?;
    let client = Client::try_from(config.clone())?;

    let proxy = Proxy::bind(ProxyOptions {
        address: args.proxy_address.clone(),
        port: args.proxy_port,
        ..ProxyOptions::new(config)
    })
    .await?;
    tokio::spawn(async move {
        if let Err(e) = proxy.serve().await {
            tracing::error!(msg = "proxy server failed", %e);
            std::process::exit(1);
        }
    });

    let settings = Settings {
        proxy_host: args.proxy_address,
        proxy_port: args.proxy_port,
        watch_namespace: args.watch_namespace,
        resync_period: Duration::from_secs(args.resync_period),
        runner: RunnerSettings {
            base_dir: args.runner_dir,
            socket_dir: args.event_socket_dir,
            timeout: Duration::from_secs(args.runner_timeout),
        },
        runner_log_level: args.runner_log_level,
        ..Settings::default()
    };
    let registry = Registry::with_prefix("ansible_operator");
    let state = State::new(registry, settings);

    let controllers = controller::run_controllers(state.clone(), client, watch_map);

    let server = HttpServer::new(move || {
        App::new()
            .app_data(Data::new(state.clone()))
            .wrap(middleware::Logger::default().exclude("/health"))
            .service(health)
            .service(metrics)
    })
    .bind(format!("0.0.0.0:{}", args.port))?
    .shutdown_timeout(5);

    // Both runtimes implement graceful shutdown, so poll until both are done
    tokio::join!(controllers, server.run()).1?;
    Ok(())
}

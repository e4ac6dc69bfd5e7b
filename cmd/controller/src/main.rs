use actix_web::{get, middleware, web::Data, App, HttpRequest, HttpResponse, HttpServer, Responder};

use clap::{crate_authors, crate_description, crate_version, Parser};
use kube::Config;
use prometheus_client::encoding::text::encode;
use prometheus_client::registry::Registry;
use std::sync::Mutex;
use whitebox_k8s_util::client::new_client_with_metrics;
use whitebox_runtime::config::RuntimeConfig;
use whitebox_runtime::manager::Manager;
use whitebox_runtime::telemetry;

struct MetricsState {
    registry: Mutex<Registry>,
}

#[get("/metrics")]
async fn metrics(state: Data<MetricsState>, _req: HttpRequest) -> impl Responder {
    let mut body = String::new();
    match encode(&mut body, &state.registry.lock().unwrap()) {
        Ok(()) => HttpResponse::Ok()
            .content_type("application/openmetrics-text; version=1.0.0; charset=utf-8")
            .body(body),
        Err(e) => {
            tracing::error!("failed to encode metrics: {:?}", e);
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
    name = "whitebox-controller",
    about = crate_description!(),
    version = crate_version!(),
    author = crate_authors!("\n"),
)]
struct Args {
    /// Path to the runtime config YAML file describing controllers and the
    /// admission webhook.
    #[arg(long, env)]
    config: std::path::PathBuf,

    /// Listen port for the /health and /metrics endpoints.
    #[arg(short, long, default_value_t = 8080, env)]
    port: u32,

    /// How long to wait for in-flight reconciles to drain on shutdown.
    #[arg(long, default_value_t = 30, env)]
    shutdown_grace_seconds: u64,

    /// Set logging filter directive for `tracing_subscriber::filter::EnvFilter`. Example: "info,kube=debug,whitebox_runtime=debug"
    #[arg(long, default_value = "info", env)]
    log_filter: String,

    /// Set log format
    #[arg(long, value_enum, default_value_t = telemetry::LogFormat::Text, env)]
    log_format: telemetry::LogFormat,

    /// URL for the OpenTelemetry tracing endpoint.
    ///
    /// This optional argument specifies the URL to which traces will be sent using
    /// OpenTelemetry. If not provided, tracing will be disabled.
    #[arg(short, long, env = "OPENTELEMETRY_ENDPOINT_URL")]
    tracing_url: Option<String>,

    /// Sampling ratio for tracing.
    ///
    /// Specifies the ratio of traces to sample. A value of `1.0` will sample all traces,
    /// while a lower value will sample fewer traces. The default is `0.1`, meaning 10%
    /// of traces are sampled.
    #[arg(short, long, default_value_t = 0.1, env)]
    sample_ratio: f64,
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

    let raw_config = std::fs::read_to_string(&args.config)?;
    let runtime_config: RuntimeConfig = serde_yaml::from_str(&raw_config)?;
    runtime_config.validate()?;

    let mut registry = Registry::with_prefix("whitebox_controller");
    let config = Config::infer().await?;
    let client = new_client_with_metrics(config, &mut registry).await?;

    let webhook = runtime_config.webhook.clone();
    let grace_period = std::time::Duration::from_secs(args.shutdown_grace_seconds);
    let manager = Manager::new(runtime_config, client, grace_period);

    let metrics_state = Data::new(MetricsState {
        registry: Mutex::new(registry),
    });
    let server = HttpServer::new(move || {
        App::new()
            .app_data(metrics_state.clone())
            .wrap(middleware::Logger::default().exclude("/health"))
            .service(health)
            .service(metrics)
    })
    .bind(format!("0.0.0.0:{}", args.port))?
    .shutdown_timeout(5);

    match webhook {
        Some(webhook_config) => {
            tokio::join!(manager.run(), server.run(), async move {
                if let Err(err) = whitebox_webhook::serve(webhook_config).await {
                    tracing::error!(error = %err, "admission webhook server exited with error");
                }
            })
            .1?;
        }
        None => {
            tokio::join!(manager.run(), server.run()).1?;
        }
    }
    Ok(())
}

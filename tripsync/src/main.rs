mod config;

use clap::Parser;
use config::{CommonConfig, Config, LoggingConfig, MetricsConfig};
use metrics_exporter_statsd::StatsdBuilder;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(about = "Product synchronization pipeline and PLU resolver")]
struct Cli {
    #[arg(long)]
    config_file_path: PathBuf,
}

fn init_logging(logging: &LoggingConfig) -> Option<sentry::ClientInitGuard> {
    let guard = logging.sentry_dsn.as_deref().map(|dsn| {
        sentry::init((
            dsn,
            sentry::ClientOptions {
                release: sentry::release_name!(),
                ..Default::default()
            },
        ))
    });

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| logging.filter.as_str().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .with(guard.as_ref().map(|_| sentry::integrations::tracing::layer()))
        .init();

    guard
}

fn init_metrics(metrics: &MetricsConfig) {
    let recorder = match StatsdBuilder::from(metrics.statsd_host.as_str(), metrics.statsd_port)
        .build(Some(metrics.prefix.as_str()))
    {
        Ok(recorder) => recorder,
        Err(e) => {
            tracing::error!(error = %e, "Failed to build statsd recorder, metrics disabled");
            return;
        }
    };

    if let Err(e) = metrics::set_global_recorder(recorder) {
        tracing::error!(error = %e, "Failed to install metrics recorder");
        return;
    }
    shared::metrics_defs::describe_all(pipeline::metrics_defs::ALL_METRICS);
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match Config::from_file(&cli.config_file_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load config: {e}");
            return ExitCode::FAILURE;
        }
    };
    let Config {
        common: CommonConfig { metrics, logging },
        pipeline: pipeline_config,
    } = config;

    let _sentry = init_logging(&logging);
    if let Some(metrics) = &metrics {
        init_metrics(metrics);
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!(error = %e, "Failed to start runtime");
            return ExitCode::FAILURE;
        }
    };

    tracing::info!("Starting tripsync");
    match runtime.block_on(pipeline::run(pipeline_config)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "tripsync exited with an error");
            ExitCode::FAILURE
        }
    }
}

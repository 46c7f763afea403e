use std::process::ExitCode;

use tracing::level_filters::LevelFilter;
use tracing_subscriber::{Layer, layer::SubscriberExt, util::SubscriberInitExt};

use paper_tiger::config::ServerConfig;
use paper_tiger::server;

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_level(true)
                .with_filter(LevelFilter::INFO),
        )
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();

    let config = ServerConfig::from_env();
    if !config.start {
        tracing::info!("PAPER_TIGER_START is false; exiting without serving");
        return ExitCode::SUCCESS;
    }

    let listener = match server::bind_listener(&config).await {
        Ok(listener) => listener,
        Err(err) => {
            tracing::error!(%err, "failed to bind listen port");
            return ExitCode::FAILURE;
        }
    };

    let state = paper_tiger::bootstrap(config);
    let router = server::build_router(state);

    tokio::select! {
        result = server::serve(listener, router) => {
            if let Err(err) = result {
                tracing::error!(%err, "server loop failed");
                return ExitCode::FAILURE;
            }
            ExitCode::SUCCESS
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutting down");
            ExitCode::SUCCESS
        }
    }
}

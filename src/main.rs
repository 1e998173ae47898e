use anyhow::Result;
use clap::Parser;
use fritz2mqtt::app::AppBuilder;
use fritz2mqtt::config::{Cli, Config};
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{info, level_filters::LevelFilter};

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    let config = match &cli.conf {
        Some(path) => Config::load(path)?,
        None => Config::from_env(),
    };
    config.validate()?;

    if cli.config_test {
        println!("configuration is valid");
        return Ok(());
    }

    let mut log_fmt = tracing_subscriber::fmt();
    if let Ok(level) = config.app.log_level.parse::<LevelFilter>() {
        log_fmt = log_fmt.with_max_level(level);
    }
    let _guard = if let Some(log_file) = &config.app.log_file {
        let file = std::fs::File::create(log_file)?;
        let (non_blocking, guard) = tracing_appender::non_blocking(file);
        log_fmt.with_writer(non_blocking).try_init().ok();
        Some(guard)
    } else {
        log_fmt.try_init().ok();
        None
    };

    info!(version = env!("CARGO_PKG_VERSION"), "starting fritz2mqtt");
    info!(
        router = format!("{}:{}", config.router.host, config.router.port),
        broker = format!("{}:{}", config.broker.host, config.broker.port),
        timezone = %config.app.timezone,
        "configuration loaded"
    );

    let token = CancellationToken::new();
    let app = AppBuilder::new()
        .config(config)
        .with_cancel_token(token.clone())
        .build()?;

    let mut app_task = tokio::spawn(async move { app.run().await });

    select! {
        result = &mut app_task => return result?,
        _ = shutdown_signal() => {
            info!("shutdown signal received, stopping");
            token.cancel();
        }
    }
    app_task.await?
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

use pagecraft::config::AppConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if it exists
    dotenvy::dotenv().ok();

    use env_logger::Builder;
    use log::LevelFilter;

    Builder::new()
        .filter_level(LevelFilter::Info)
        .filter_module("sqlx", LevelFilter::Warn)
        .init();

    let config = AppConfig::load()?;
    log::info!(
        "Configuration loaded: server={}:{}, backend={:?}",
        config.server.host,
        config.server.port,
        config.database.backend
    );

    pagecraft::run_server(&config).await
}

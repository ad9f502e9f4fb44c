//! loreferry - one engine pass from the default configuration

use loreferry::config::{default_config_dir, Settings};
use loreferry::{DeliveryEngine, ThreadSupervisor};

#[tokio::main]
async fn main() {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let exit = match run().await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("run failed: {:#}", e);
            1
        }
    };
    std::process::exit(exit);
}

async fn run() -> anyhow::Result<i32> {
    let config_dir = default_config_dir()?;
    let settings = Settings::load(&config_dir.join("settings.json"))?;

    let engine = DeliveryEngine::from_settings(&settings).await?;
    let supervisor = ThreadSupervisor::open(
        settings.resolve_data_dir()?,
        settings.engine.search_upstream.clone(),
    )?;

    let tracked = supervisor.poll_set().await?;
    let report = engine.run_with(tracked).await;
    supervisor.record_results(&report).await?;

    for (delivery, stats) in &report.deliveries {
        tracing::info!(
            delivery = %delivery,
            delivered = stats.delivered,
            absorbed = stats.absorbed,
            pending = stats.pending,
            failed = stats.failed,
            "delivery summary"
        );
    }
    for (delivery, reason) in &report.failures {
        tracing::error!(delivery = %delivery, %reason, "permanent delivery failure");
    }
    for (feed, reason) in &report.feed_errors {
        tracing::warn!(feed = %feed, %reason, "feed skipped");
    }
    for warning in &report.warnings {
        tracing::warn!("{}", warning);
    }

    Ok(report.exit_code())
}

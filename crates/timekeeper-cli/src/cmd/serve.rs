use std::path::Path;
use std::sync::Arc;
use timekeeper_runtime::TimerService;

pub fn run(config_path: &Path, port: u16) -> anyhow::Result<()> {
    let config = super::load_validated(config_path)?;
    for w in config.validate() {
        tracing::warn!("config: {}", w.message);
    }

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async move {
        let service = Arc::new(TimerService::builder(config).build());
        let report = service.start().await;
        if !report.missing.is_empty() {
            tracing::warn!(missing = ?report.missing, "running with reduced capacity");
        }
        if !report.reclaimed.is_empty() {
            tracing::info!(reclaimed = ?report.reclaimed, "reclaimed leftover countdowns");
        }
        timekeeper_server::serve(service, port).await
    })
}

use anyhow::Context;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    metric_pulse::run().await.context("metric-pulse exited")
}

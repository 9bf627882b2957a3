use envconfig::Envconfig;
use kube::Client;
use tokio_util::sync::CancellationToken;
use tracing::info;
use virtool_operator::config::OperatorConfig;
use virtool_operator::controller::run_controller;
use virtool_operator::{init_tracing, shutdown_on_signal};

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    init_tracing("info");

    let cfg = OperatorConfig::init_from_env()?;
    info!(?cfg, "Starting virtool-operator");

    let client = Client::try_default().await?;
    let shutdown = CancellationToken::new();
    tokio::spawn(shutdown_on_signal(shutdown.clone()));

    run_controller(client, cfg, shutdown).await
}

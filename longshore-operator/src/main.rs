use envconfig::Envconfig;
use kube::Client;
use longshore_operator::{config::OperatorConfig, init_tracing, runtime};
use tracing::info;

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    init_tracing("info");

    // Ensure rustls uses the aws-lc-rs provider explicitly.
    // This avoids runtime errors when no default provider is set.
    if let Err(e) = rustls::crypto::CryptoProvider::install_default(
        rustls::crypto::aws_lc_rs::default_provider(),
    ) {
        // It's fine if a compatible provider was already installed.
        tracing::debug!(
            ?e,
            "CryptoProvider already installed or incompatible; proceeding"
        );
    }

    let cfg = OperatorConfig::init_from_env()?;
    info!(
        api_endpoint = %cfg.api_endpoint,
        channel_addr = %cfg.channel_addr,
        target_namespace = %cfg.target_namespace,
        "Starting operator"
    );

    let client = Client::try_default().await?;
    runtime::run_all(client, cfg).await
}

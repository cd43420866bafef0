//! Capsule Proxy - tenant-scoped views of cluster-wide Kubernetes resources

use clap::Parser;
use kube::{Client, CustomResourceExt};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use capsule_common::crd::Tenant;
use capsule_proxy::config::ProxyArgs;
use capsule_proxy::server::start_server;

/// Capsule Proxy - filters namespace, node, ingress class and storage class
/// requests down to what the caller's tenants own
#[derive(Parser, Debug)]
#[command(name = "capsule-proxy", version, about, long_about = None)]
struct Cli {
    /// Print the Tenant CRD manifest and exit
    #[arg(long)]
    crd: bool,

    /// Emit logs as JSON
    #[arg(long, env = "CAPSULE_PROXY_LOG_JSON")]
    log_json: bool,

    #[command(flatten)]
    proxy: ProxyArgs,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("CRITICAL: Failed to install crypto provider: {:?}", e);
        std::process::exit(1);
    }

    let cli = Cli::parse();

    let json = cli.log_json.then(|| fmt::layer().json());
    let text = (!cli.log_json).then(fmt::layer);
    tracing_subscriber::registry()
        .with(json)
        .with(text)
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if cli.crd {
        let crd = serde_yaml::to_string(&Tenant::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    let config = cli.proxy.resolve()?;
    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    start_server(config, client).await?;
    Ok(())
}

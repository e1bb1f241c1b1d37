//! Thin CLI wrapper around [`safe_chain_proxy::ProxyRuntime`].
//!
//! Shell-integration setup/teardown, CI PATH shims, and per-package-manager
//! process wrappers live in a separate wrapper; this binary only starts the
//! proxy, prints the environment a caller should export, and waits.

use clap::Parser;
use safe_chain_proxy::{ProxyConfig, ProxyRuntime};

#[derive(Parser, Debug)]
#[command(name = "safe-chain-proxy", version, about = "Supply-chain firewall proxy for npm/PyPI installs")]
struct Cli {
    /// Port to listen on; 0 lets the OS choose one.
    #[arg(long, default_value_t = 0)]
    port: u16,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    safe_chain_proxy::init_tracing();
    let cli = Cli::parse();

    let config = ProxyConfig::load();
    let install_possibly_malicious = config.install_possibly_malicious;
    let runtime = ProxyRuntime::new(config)?;
    runtime.warm_malware_cache().await?;

    let port = runtime
        .start_server(if cli.port == 0 { None } else { Some(cli.port) })
        .await?;
    tracing::info!("safe-chain-proxy listening on 127.0.0.1:{port}");

    for (key, value) in runtime.get_environment_variables().await {
        println!("export {key}=\"{value}\"");
    }

    tokio::signal::ctrl_c().await?;
    runtime.stop_server().await;

    if !runtime.verify_no_malicious_packages() && !install_possibly_malicious {
        std::process::exit(1);
    }
    Ok(())
}

//! Binary entrypoint for `coral-proxy`.
//!
//! Full configuration loading, CLI flags and the metrics web sidecar live in
//! external collaborators; the binary boots from environment overrides over the
//! default snapshot so it can run standalone.

mod codec_client;
mod codec_shard;
mod conn;
mod engine;
mod message;
mod pool;
mod reactor;
mod topology;

use tracing::info;
use tracing_subscriber::EnvFilter;

use coral_common::config::ProxyConfig;
use coral_common::error::ProxyResult;

use crate::engine::{AllowAll, ClientAuthorizer, Engine, IpWhitelist};
use crate::reactor::ProxyLoop;

fn main() {
    if let Err(error) = run() {
        eprintln!("failed to start coral-proxy: {error}");
        std::process::exit(1);
    }
}

fn run() -> ProxyResult<()> {
    let config = config_from_env();
    config.validate()?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_filter()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let authorizer: Box<dyn ClientAuthorizer> = match std::env::var("CORAL_AUTH_IPS") {
        Ok(ips) => Box::new(IpWhitelist::new(
            true,
            ips.split(',').map(str::trim).map(str::to_owned),
        )),
        Err(_) => Box::new(AllowAll),
    };

    let engine = Engine::new(config, authorizer);
    let mut proxy = ProxyLoop::bind(engine)?;
    info!(addr = %proxy.local_addr()?, "coral-proxy listening");
    proxy.run()
}

fn config_from_env() -> ProxyConfig {
    let mut config = ProxyConfig::default();
    if let Ok(servers) = std::env::var("CORAL_SERVERS") {
        config.redis.servers = servers;
    }
    if let Ok(port) = std::env::var("CORAL_PORT") {
        if let Ok(port) = port.parse() {
            config.port = port;
        }
    }
    if let Ok(password) = std::env::var("CORAL_PASSWORD") {
        config.redis.password = password;
    }
    if let Ok(timeout) = std::env::var("CORAL_TIMEOUT_MS") {
        if let Ok(timeout) = timeout.parse() {
            config.redis.timeout = timeout;
        }
    }
    config
}

use std::path::PathBuf;

use anyhow::{anyhow, Result};
use clap::Parser;

use chacha::cache::DiskCache;
use chacha::cluster::Cluster;
use chacha::config;
use chacha::interceptor::TlsInterceptor;
use chacha::logging;
use chacha::rule::Rules;
use chacha::server::{Options, Server};

#[derive(Parser, Debug)]
#[command(name = "chacha", about = "Caching forward proxy for CI/CD fleets", version)]
struct Cli {
    /// Config file path
    #[arg(short = 'c', default_value = "chacha.yaml")]
    config: PathBuf,

    /// Address to listen on, overriding the config
    #[arg(short = 'l', long = "listen")]
    listen: Option<String>,

    /// Enable verbose logging
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let (mut cfg, ignored) = config::load(&cli.config)?;

    if let Some(listen) = cli.listen {
        cfg.server.addr = listen;
    }

    logging::init(&cfg.logger, cli.verbose)?;

    if cfg.strict && !ignored.is_empty() {
        return Err(anyhow!("unknown config fields: {}", ignored.join(", ")));
    }

    if !ignored.is_empty() {
        log::warn!("ignoring unknown config fields: {}", ignored.join(", "));
    }

    cfg.validate()?;

    log::info!("chacha starting with config {}", cli.config.display());

    let disk = if cfg.disk.dir.trim().is_empty() {
        None
    } else {
        Some(DiskCache::new(&cfg.disk.dir, cfg.disk.limit_bytes)?)
    };

    let rules = Rules::from_config(&cfg.rules)?;
    if rules.is_empty() {
        log::warn!("no rules configured, nothing will be cached");
    }

    let cluster = cfg
        .cluster
        .as_ref()
        .map(|cluster| Cluster::new(&cluster.secret, &cfg.server.addr, &cluster.nodes));

    let tls_interceptor = match &cfg.tls {
        Some(tls) => Some(TlsInterceptor::from_files(&tls.cert, &tls.key)?),
        None => None,
    };

    let server = Server::new(Options {
        addr: cfg.server.addr.clone(),
        disk,
        rules,
        cluster,
        tls_interceptor,
        insecure_upstream: cfg.upstream.insecure_skip_verify,
        read_header_timeout: cfg.server.read_header_timeout,
    })
    .await?;

    tokio::select! {
        result = server.run() => result,
        _ = tokio::signal::ctrl_c() => {
            log::info!("shutting down");
            Ok(())
        }
    }
}

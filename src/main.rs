//! Sinkhole - a filtering DNS forwarder with DNS-over-TLS.
//!
//! Terminates UDP, TCP and DoT, answers each question from a blocklist
//! (synthesised SOA), the reply cache, or round-robin upstream resolvers.

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use sinkhole::app;
use sinkhole::config::{
    resolve_port, Config, DEFAULT_BLOCKLIST_URL, DEFAULT_CACHE_REAPER_SCHEDULE,
    DEFAULT_DOWNLOADER_SCHEDULE,
};

#[derive(Parser)]
#[command(name = "sinkhole")]
#[command(about = "Filtering DNS forwarder with DNS-over-TLS", long_about = None)]
struct Args {
    /// Upstream DNS resolvers (host:port), selected round-robin
    #[arg(short, long, required = true)]
    upstream: Vec<String>,

    /// URL of the blocklist, wildcard hostname format
    #[arg(long, default_value = DEFAULT_BLOCKLIST_URL)]
    blocklist_url: String,

    /// Disable TLS on the DoT port and shift default ports to unprivileged
    #[arg(long, env = "DEV_MODE")]
    dev_mode: bool,

    /// Port for the UDP and TCP DNS listeners (default: 53, dev: 8053)
    #[arg(long)]
    dns_port: Option<u16>,

    /// Port for the DNS-over-TLS listener (default: 853, dev: 8853)
    #[arg(long)]
    dot_port: Option<u16>,

    /// Port for the HTTP metrics/health listener (default: 80, dev: 8080)
    #[arg(long)]
    http_port: Option<u16>,

    /// Hostname allowed for TLS certificates (repeatable)
    #[arg(long)]
    allowed_host: Vec<String>,

    /// Root directory for the certificate cache
    #[arg(long, default_value = "./data")]
    data_dir: PathBuf,

    /// Basic auth credential for /metrics (format: user:pass)
    #[arg(long)]
    metrics_auth: Option<String>,

    /// Schedule for the blocklist refresh job
    #[arg(long, default_value = DEFAULT_DOWNLOADER_SCHEDULE)]
    downloader_schedule: String,

    /// Schedule for the cache reaper job
    #[arg(long, default_value = DEFAULT_CACHE_REAPER_SCHEDULE)]
    cache_reaper_schedule: String,

    /// Disable per-query logging
    #[arg(long)]
    no_dns_logging: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config {
        upstreams: args.upstream,
        blocklist_url: args.blocklist_url,
        dev_mode: args.dev_mode,
        dns_port: resolve_port(args.dns_port, 53, 8053, args.dev_mode),
        dot_port: resolve_port(args.dot_port, 853, 8853, args.dev_mode),
        http_port: resolve_port(args.http_port, 80, 8080, args.dev_mode),
        allowed_hosts: args.allowed_host,
        data_dir: args.data_dir,
        metrics_auth: args.metrics_auth,
        downloader_schedule: args.downloader_schedule,
        cache_reaper_schedule: args.cache_reaper_schedule,
        log_queries: !args.no_dns_logging,
    };

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(app::run(config))
}

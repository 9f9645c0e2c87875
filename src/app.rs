//! Server wiring: collaborators, scheduled jobs and listeners.

use std::sync::Arc;

use anyhow::{ensure, Context as _, Result};
use prometheus::Registry;
use tracing::info;

use crate::cache::{TtlCache, DEFAULT_CAPACITY};
use crate::config::{listen_addr, Config};
use crate::dispatcher::Dispatcher;
use crate::downloader::BlocklistDownloader;
use crate::filter::{Blocklist, DEFAULT_FP_RATE};
use crate::http;
use crate::metrics::{self, DnsMetrics};
use crate::scheduler::Scheduler;
use crate::server::dot::{CertCache, DotServer};
use crate::server::tcp::TcpServer;
use crate::server::udp::UdpServer;
use crate::upstream::RoundRobinClient;

/// Build every collaborator, start the scheduled jobs and run all four
/// listeners until one of them fails.
pub async fn run(config: Config) -> Result<()> {
    if let Some(auth) = &config.metrics_auth {
        ensure!(auth.contains(':'), "invalid metrics-auth value: expected user:pass");
    }

    let client = RoundRobinClient::new(&config.upstreams)
        .context("failed to initialize upstream DNS client")?;
    let healthchecks = client.healthchecks();

    let downloader = Arc::new(BlocklistDownloader::new(&config.blocklist_url)?);
    let items = downloader
        .fetch()
        .await
        .context("failed to download blocklist")?;
    let blocklist = Arc::new(Blocklist::new(&items, DEFAULT_FP_RATE));

    let registry = Registry::new();
    let cache = Arc::new(TtlCache::new(DEFAULT_CAPACITY));
    let dns_metrics = Arc::new(
        DnsMetrics::register(&registry, &cache).context("failed to register DNS metrics")?,
    );
    metrics::register_blocklist_metrics(&registry, &blocklist)?;

    let dispatcher = Arc::new(Dispatcher::new(
        client,
        Arc::clone(&cache),
        Arc::clone(&blocklist),
        Arc::clone(&dns_metrics),
        config.log_queries,
    ));

    let scheduler = Scheduler::new(&registry)?;
    {
        let blocklist = Arc::clone(&blocklist);
        let downloader = Arc::clone(&downloader);
        scheduler.add_job("blocklist-downloader", &config.downloader_schedule, move || {
            let blocklist = Arc::clone(&blocklist);
            let downloader = Arc::clone(&downloader);
            async move {
                let items = downloader.fetch().await?;
                blocklist.replace(&items);
                Ok(())
            }
        })?;
    }
    {
        let cache = Arc::clone(&cache);
        let dns_metrics = Arc::clone(&dns_metrics);
        scheduler.add_job("cache-reaper", &config.cache_reaper_schedule, move || {
            let cache = Arc::clone(&cache);
            let dns_metrics = Arc::clone(&dns_metrics);
            async move {
                let before = cache.len();
                let (removed, after) = cache.delete_expired();
                info!(before, removed, after, "cache reaper removed expired entries");
                dns_metrics.cache_reaper_calls.inc();
                Ok(())
            }
        })?;
    }

    let dns_addr = listen_addr(config.dns_port);
    let dot_addr = listen_addr(config.dot_port);
    let http_addr = listen_addr(config.http_port);

    let udp = UdpServer::bind(dns_addr)
        .await
        .with_context(|| format!("failed to bind UDP listener on {dns_addr}"))?;
    let tcp = TcpServer::bind(dns_addr)
        .await
        .with_context(|| format!("failed to bind TCP listener on {dns_addr}"))?;
    let dot = if config.dev_mode {
        DotServer::bind_plain(dot_addr).await?
    } else {
        let resolver = Arc::new(CertCache::load(&config.cert_cache_dir(), &config.allowed_hosts)?);
        DotServer::bind(dot_addr, resolver).await?
    };

    info!(
        dns_port = config.dns_port,
        dot_port = config.dot_port,
        http_port = config.http_port,
        dev_mode = config.dev_mode,
        blocked_domains = blocklist.len(),
        "starting listeners"
    );

    tokio::try_join!(
        async {
            udp.run(Arc::clone(&dispatcher))
                .await
                .context("UDP server failed")
        },
        async {
            tcp.run(Arc::clone(&dispatcher))
                .await
                .context("TCP server failed")
        },
        async {
            dot.run(Arc::clone(&dispatcher))
                .await
                .context("DoT server failed")
        },
        http::serve(http_addr, registry.clone(), healthchecks, config.metrics_auth.clone()),
    )?;

    Ok(())
}

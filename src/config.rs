//! Runtime configuration assembled from the command line.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;

/// Default blocklist source, wildcard hostname format.
pub const DEFAULT_BLOCKLIST_URL: &str =
    "https://gitlab.com/hagezi/mirror/-/raw/main/dns-blocklists/wildcard/pro-onlydomains.txt";

/// Default schedule for the blocklist refresh job.
pub const DEFAULT_DOWNLOADER_SCHEDULE: &str = "@every 19h";

/// Default schedule for the cache reaper job.
pub const DEFAULT_CACHE_REAPER_SCHEDULE: &str = "@every 10m";

/// Resolver configuration shared by listeners and scheduled jobs.
#[derive(Debug, Clone)]
pub struct Config {
    /// Upstream resolver endpoints (`host:port`), at least one.
    pub upstreams: Vec<String>,
    /// Source URL for the wildcard-hostname blocklist.
    pub blocklist_url: String,
    /// Disables TLS on the DoT port.
    pub dev_mode: bool,
    /// Port for the UDP and TCP DNS listeners.
    pub dns_port: u16,
    /// Port for the DNS-over-TLS listener.
    pub dot_port: u16,
    /// Port for the HTTP metrics/health listener.
    pub http_port: u16,
    /// Certificate subject allow-list.
    pub allowed_hosts: Vec<String>,
    /// Root directory for persisted state (certificate cache).
    pub data_dir: PathBuf,
    /// Basic auth credential for `/metrics` (`user:pass`).
    pub metrics_auth: Option<String>,
    /// Schedule spec for the blocklist refresh job.
    pub downloader_schedule: String,
    /// Schedule spec for the cache reaper job.
    pub cache_reaper_schedule: String,
    /// Emit per-query info logs.
    pub log_queries: bool,
}

impl Config {
    /// Where the certificate collaborator keeps its PEM files.
    pub fn cert_cache_dir(&self) -> PathBuf {
        self.data_dir.join("certcache")
    }
}

/// Effective port for a listener: explicit flag wins, otherwise the
/// privileged default in production or the unprivileged one in dev mode.
pub fn resolve_port(explicit: Option<u16>, default: u16, dev_default: u16, dev_mode: bool) -> u16 {
    explicit.unwrap_or(if dev_mode { dev_default } else { default })
}

/// Wildcard listen address for a port.
pub fn listen_addr(port: u16) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port)
}

//! Prometheus metrics for the resolver.
//!
//! Everything registers on a caller-supplied registry so tests can build
//! isolated instances. Structures that cannot be sampled cheaply at update
//! time (cache stats, top-K tables, the unique-client sketch, blocklist
//! age) are exposed through callback collectors read at scrape time.

pub mod hyperloglog;
pub mod space_saving;

pub use hyperloglog::HyperLogLog;
pub use space_saving::{SpaceSaving, TopEntry};

use std::sync::{Arc, Mutex};

use anyhow::{Context as _, Result};
use prometheus::core::{Collector, Desc};
use prometheus::proto::MetricFamily;
use prometheus::{
    Gauge, GaugeVec, Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts,
    Registry,
};

use crate::cache::TtlCache;
use crate::filter::Blocklist;

/// How many heavy hitters each tracker keeps.
pub const TOP_K: usize = 20;

const LATENCY_BUCKETS: &[f64] = &[
    0.0001, 0.00025, 0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0,
];

const TTL_BUCKETS: &[f64] = &[
    30.0, 60.0, 120.0, 300.0, 600.0, 900.0, 1800.0, 3600.0, 7200.0, 14400.0, 28800.0, 43200.0,
    86400.0, 172800.0, 604800.0,
];

/// Metric handles shared by the dispatcher, listeners and scheduled jobs.
pub struct DnsMetrics {
    pub request_latency: Histogram,
    pub error_counts: IntCounterVec,
    pub request_counts: IntCounterVec,
    pub query_counts: IntCounterVec,
    pub reply_counts: IntCounterVec,
    pub upstream_ttls: HistogramVec,
    pub upstream_latency: HistogramVec,
    pub cache_reaper_calls: IntCounter,
    pub top_clients: Arc<SpaceSaving>,
    pub top_domains: Arc<SpaceSaving>,
    pub unique_clients: Arc<Mutex<HyperLogLog>>,
}

impl DnsMetrics {
    /// Create the DNS metric family and register it on `registry`. The
    /// cache is sampled at scrape time for the stats gauge.
    pub fn register(registry: &Registry, cache: &Arc<TtlCache>) -> Result<Self> {
        let top_clients = Arc::new(SpaceSaving::new(TOP_K));
        let top_domains = Arc::new(SpaceSaving::new(TOP_K));
        let unique_clients = Arc::new(Mutex::new(HyperLogLog::new()));

        let request_latency = Histogram::with_opts(
            HistogramOpts::new("dns_request_latency", "Duration of DNS requests")
                .buckets(LATENCY_BUCKETS.to_vec()),
        )?;

        let error_counts = IntCounterVec::new(
            Opts::new(
                "dns_error_count",
                "Counts the number of errors broken down by category",
            ),
            &["category"],
        )?;

        let request_counts = IntCounterVec::new(
            Opts::new(
                "dns_request_count",
                "Counts the number of DNS requests, broken down by type: total, errored, forwarded",
            ),
            &["type"],
        )?;

        let query_counts = IntCounterVec::new(
            Opts::new(
                "dns_query_count",
                "Counts the number of DNS questions, broken down by record_type (A, CNAME, MX, etc) and whether blocked (true/false)",
            ),
            &["record_type", "blocked"],
        )?;

        let reply_counts = IntCounterVec::new(
            Opts::new(
                "dns_reply_count",
                "Counts the number of DNS replies, broken down by response code",
            ),
            &["rcode"],
        )?;

        let upstream_ttls = HistogramVec::new(
            HistogramOpts::new(
                "dns_upstream_ttl_seconds",
                "Observed upstream DNS TTL values (in seconds), broken down by record_type (A, CNAME, MX, etc)",
            )
            .buckets(TTL_BUCKETS.to_vec()),
            &["record_type"],
        )?;

        let upstream_latency = HistogramVec::new(
            HistogramOpts::new(
                "dns_upstream_latency",
                "Duration of upstream DNS requests, broken down by upstream",
            )
            .buckets(LATENCY_BUCKETS.to_vec()),
            &["upstream"],
        )?;

        let cache_reaper_calls = IntCounter::new(
            "dns_cache_reaper_calls",
            "The number of times the cache reaper has been called",
        )?;

        register_on(registry, Box::new(request_latency.clone()))?;
        register_on(registry, Box::new(error_counts.clone()))?;
        register_on(registry, Box::new(request_counts.clone()))?;
        register_on(registry, Box::new(query_counts.clone()))?;
        register_on(registry, Box::new(reply_counts.clone()))?;
        register_on(registry, Box::new(upstream_ttls.clone()))?;
        register_on(registry, Box::new(upstream_latency.clone()))?;
        register_on(registry, Box::new(cache_reaper_calls.clone()))?;

        let sampled_cache = Arc::clone(cache);
        register_on(
            registry,
            Box::new(CallbackGaugeVec::new(
                "dns_cache_stats",
                "Statistics about the cache internals (cache effectiveness: hits & misses, sizing: added & evicted)",
                "type",
                move || {
                    let stat = sampled_cache.stat();
                    vec![
                        ("added".to_owned(), stat.added as f64),
                        ("evicted".to_owned(), stat.evicted as f64),
                        ("hits".to_owned(), stat.hits as f64),
                        ("misses".to_owned(), stat.misses as f64),
                        ("size".to_owned(), sampled_cache.len() as f64),
                    ]
                },
            )?),
        )?;

        let sampled_domains = Arc::clone(&top_domains);
        register_on(
            registry,
            Box::new(CallbackGaugeVec::new(
                "dns_top_domains",
                &format!("Shows the top {TOP_K} most requested domains"),
                "hostname",
                move || {
                    sampled_domains
                        .top_n(TOP_K)
                        .into_iter()
                        .map(|e| (e.key, (e.count - e.error) as f64))
                        .collect()
                },
            )?),
        )?;

        let sampled_clients = Arc::clone(&top_clients);
        register_on(
            registry,
            Box::new(CallbackGaugeVec::new(
                "dns_top_clients",
                &format!("Shows the top {TOP_K} most active clients"),
                "ip_addr",
                move || {
                    sampled_clients
                        .top_n(TOP_K)
                        .into_iter()
                        .map(|e| (e.key, (e.count - e.error) as f64))
                        .collect()
                },
            )?),
        )?;

        let sampled_sketch = Arc::clone(&unique_clients);
        register_on(
            registry,
            Box::new(CallbackGauge::new(
                "dns_unique_clients",
                "Estimates the number of unique clients (relative error ~ 1%)",
                move || {
                    let sketch = sampled_sketch.lock().unwrap_or_else(|e| e.into_inner());
                    sketch.estimate() as f64
                },
            )?),
        )?;

        Ok(Self {
            request_latency,
            error_counts,
            request_counts,
            query_counts,
            reply_counts,
            upstream_ttls,
            upstream_latency,
            cache_reaper_calls,
            top_clients,
            top_domains,
            unique_clients,
        })
    }
}

/// Register blocklist size and age gauges, sampled from the live blocklist.
pub fn register_blocklist_metrics(registry: &Registry, blocklist: &Arc<Blocklist>) -> Result<()> {
    let sampled = Arc::clone(blocklist);
    register_on(
        registry,
        Box::new(CallbackGauge::new(
            "blocklist_size",
            "The number of entries in the blocklist",
            move || sampled.len() as f64,
        )?),
    )?;

    let sampled = Arc::clone(blocklist);
    register_on(
        registry,
        Box::new(CallbackGauge::new(
            "blocklist_age",
            "The age (in seconds) since the blocklist was loaded",
            move || sampled.age_secs() as f64,
        )?),
    )
}

/// Register a collector, tolerating duplicate registrations.
fn register_on(registry: &Registry, collector: Box<dyn Collector>) -> Result<()> {
    match registry.register(collector) {
        Ok(()) | Err(prometheus::Error::AlreadyReg) => Ok(()),
        Err(err) => Err(err).context("failed to register collector"),
    }
}

/// Labelled gauge family whose samples come from a callback at scrape time.
struct CallbackGaugeVec<F>
where
    F: Fn() -> Vec<(String, f64)> + Send + Sync,
{
    gauges: GaugeVec,
    callback: F,
}

impl<F> CallbackGaugeVec<F>
where
    F: Fn() -> Vec<(String, f64)> + Send + Sync,
{
    fn new(name: &str, help: &str, label: &str, callback: F) -> Result<Self> {
        let gauges = GaugeVec::new(Opts::new(name, help), &[label])?;
        Ok(Self { gauges, callback })
    }
}

impl<F> Collector for CallbackGaugeVec<F>
where
    F: Fn() -> Vec<(String, f64)> + Send + Sync,
{
    fn desc(&self) -> Vec<&Desc> {
        self.gauges.desc()
    }

    fn collect(&self) -> Vec<MetricFamily> {
        self.gauges.reset();
        for (label, value) in (self.callback)() {
            self.gauges.with_label_values(&[&label]).set(value);
        }
        self.gauges.collect()
    }
}

/// Single gauge whose value comes from a callback at scrape time.
struct CallbackGauge<F>
where
    F: Fn() -> f64 + Send + Sync,
{
    gauge: Gauge,
    callback: F,
}

impl<F> CallbackGauge<F>
where
    F: Fn() -> f64 + Send + Sync,
{
    fn new(name: &str, help: &str, callback: F) -> Result<Self> {
        let gauge = Gauge::new(name, help)?;
        Ok(Self { gauge, callback })
    }
}

impl<F> Collector for CallbackGauge<F>
where
    F: Fn() -> f64 + Send + Sync,
{
    fn desc(&self) -> Vec<&Desc> {
        self.gauge.desc()
    }

    fn collect(&self) -> Vec<MetricFamily> {
        self.gauge.set((self.callback)());
        self.gauge.collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheKey;
    use crate::filter::DEFAULT_FP_RATE;
    use hickory_proto::rr::rdata::A;
    use hickory_proto::rr::{Name, RData, Record, RecordType};
    use std::net::Ipv4Addr;
    use std::time::Duration;

    fn gather_names(registry: &Registry) -> Vec<String> {
        registry.gather().iter().map(|f| f.get_name().to_owned()).collect()
    }

    fn family<'a>(families: &'a [MetricFamily], name: &str) -> &'a MetricFamily {
        families
            .iter()
            .find(|f| f.get_name() == name)
            .unwrap_or_else(|| panic!("metric family {name} missing"))
    }

    #[test]
    fn registers_all_dns_metric_families() {
        let registry = Registry::new();
        let cache = Arc::new(TtlCache::new(16));
        let _metrics = DnsMetrics::register(&registry, &cache).unwrap();

        let names = gather_names(&registry);
        for expected in [
            "dns_request_latency",
            "dns_cache_stats",
            "dns_unique_clients",
            "dns_cache_reaper_calls",
        ] {
            assert!(names.contains(&expected.to_string()), "{expected} missing from {names:?}");
        }
    }

    #[test]
    fn registering_twice_on_one_registry_is_tolerated() {
        let registry = Registry::new();
        let cache = Arc::new(TtlCache::new(16));
        let _first = DnsMetrics::register(&registry, &cache).unwrap();
        let _second = DnsMetrics::register(&registry, &cache).unwrap();
    }

    #[test]
    fn cache_stats_reflect_cache_activity() {
        let registry = Registry::new();
        let cache = Arc::new(TtlCache::new(16));
        let _metrics = DnsMetrics::register(&registry, &cache).unwrap();

        let name = Name::from_ascii("example.com.").unwrap();
        let record = Record::from_rdata(name, 300, RData::A(A(Ipv4Addr::new(1, 2, 3, 4))));
        let key = CacheKey::new("example.com.".into(), RecordType::A);
        cache.set(key.clone(), vec![record], Duration::from_secs(300));
        cache.get(&key);

        let families = registry.gather();
        let stats = family(&families, "dns_cache_stats");
        let hits = stats
            .get_metric()
            .iter()
            .find(|m| m.get_label()[0].get_value() == "hits")
            .expect("hits sample present");
        assert_eq!(hits.get_gauge().get_value(), 1.0);
    }

    #[test]
    fn top_domains_report_count_minus_error() {
        let registry = Registry::new();
        let cache = Arc::new(TtlCache::new(16));
        let metrics = DnsMetrics::register(&registry, &cache).unwrap();

        metrics.top_domains.add("example.com.");
        metrics.top_domains.add("example.com.");

        let families = registry.gather();
        let top = family(&families, "dns_top_domains");
        let sample = &top.get_metric()[0];
        assert_eq!(sample.get_label()[0].get_value(), "example.com.");
        assert_eq!(sample.get_gauge().get_value(), 2.0);
    }

    #[test]
    fn blocklist_gauges_track_the_current_generation() {
        let registry = Registry::new();
        let blocklist = Arc::new(Blocklist::new(
            &["ads.example.com".to_owned()],
            DEFAULT_FP_RATE,
        ));
        register_blocklist_metrics(&registry, &blocklist).unwrap();

        let families = registry.gather();
        let size = family(&families, "blocklist_size");
        assert_eq!(size.get_metric()[0].get_gauge().get_value(), 1.0);
    }
}

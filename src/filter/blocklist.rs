//! Membership oracle over a very large blocked-domain set.
//!
//! Lookups test the exact domain first, then its registrable apex (eTLD+1)
//! per the Public Suffix List, so `ads.tracker.doubleclick.net` is blocked
//! by a `doubleclick.net` entry. May return false positives at the
//! configured rate; never false negatives.

use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Result};
use arc_swap::ArcSwap;
use tracing::info;

use super::bloom::BloomFilter;

/// Default false-positive target for the filter.
pub const DEFAULT_FP_RATE: f64 = 0.0001;

struct Generation {
    filter: BloomFilter,
    loaded_at: Instant,
}

/// Blocked-domain oracle with atomic replace-all.
///
/// Readers take a lock-free snapshot of the current generation; `replace`
/// builds the next generation off the read path and publishes it with a
/// single pointer swap.
pub struct Blocklist {
    fp_rate: f64,
    current: ArcSwap<Generation>,
}

impl Blocklist {
    /// Build a blocklist from an initial set of domains (no trailing dots).
    pub fn new(items: &[String], fp_rate: f64) -> Self {
        let blocklist = Self {
            fp_rate,
            current: ArcSwap::from_pointee(Generation {
                filter: BloomFilter::with_estimates(0, fp_rate),
                loaded_at: Instant::now(),
            }),
        };
        blocklist.replace(items);
        blocklist
    }

    /// Whether the domain (or its registrable apex) is on the blocklist.
    ///
    /// A trailing dot is tolerated. Domains that have no registrable apex
    /// because they sit at or above a public suffix are never blocked by
    /// the apex rule; a malformed name is an error.
    pub fn is_blocked(&self, fqdn: &str) -> Result<bool> {
        let domain = fqdn.strip_suffix('.').unwrap_or(fqdn);

        let generation = self.current.load();
        if generation.filter.contains(domain) {
            return Ok(true);
        }

        if domain.is_empty() || domain.split('.').any(str::is_empty) {
            bail!("cannot derive registrable domain from malformed name {fqdn:?}");
        }

        match psl::domain_str(domain) {
            // The name is itself a public suffix (or directly under one
            // with no registrable part), e.g. `s3.amazonaws.com`.
            None => Ok(false),
            Some(apex) => Ok(generation.filter.contains(apex)),
        }
    }

    /// Replace the entire blocklist with a new generation.
    pub fn replace(&self, items: &[String]) {
        let mut filter = BloomFilter::with_estimates(items.len(), self.fp_rate);
        for item in items {
            filter.insert(item);
        }

        info!(
            items = items.len(),
            bits = filter.bit_count(),
            "blocklist generation built"
        );

        self.current.store(Arc::new(Generation {
            filter,
            loaded_at: Instant::now(),
        }));
    }

    /// Number of domains in the current generation.
    pub fn len(&self) -> usize {
        self.current.load().filter.len()
    }

    /// True when the current generation is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Seconds since the current generation was published.
    pub fn age_secs(&self) -> u64 {
        self.current.load().loaded_at.elapsed().as_secs()
    }

    /// Bit-array size of the current generation's filter.
    pub fn filter_bits(&self) -> u64 {
        self.current.load().filter.bit_count()
    }
}

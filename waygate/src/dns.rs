//! Cached hostname resolution, grounded on the teacher's own resolver crate
//! (`hickory_resolver`, see `crates/agentgateway/src/client/dns.rs`) but
//! simplified to a single-shot cache-with-TTL rather than the teacher's
//! background-refresh circular buffer — the dispatcher only needs "first
//! address", not round-robin-over-A-records.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use hickory_resolver::TokioResolver;
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::name_server::TokioConnectionProvider;
use thiserror::Error;

const CACHE_TTL: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum DnsError {
	#[error("resolution of {0} failed: {1}")]
	Resolve(String, hickory_resolver::ResolveError),
	#[error("no addresses returned for {0}")]
	NoAddresses(String),
}

struct CacheEntry {
	addrs: Vec<IpAddr>,
	expires: Instant,
}

/// Resolves hostnames with a short-lived in-memory cache. Used by the
/// dispatcher's `dest-ip` rule matching and by strategies dialing upstreams
/// by hostname.
pub struct DnsResolver {
	inner: TokioResolver,
	cache: Mutex<HashMap<String, CacheEntry>>,
}

impl DnsResolver {
	pub fn new() -> Self {
		let inner = TokioResolver::builder_with_config(
			ResolverConfig::default(),
			TokioConnectionProvider::default(),
		)
		.with_options(ResolverOpts::default())
		.build();
		DnsResolver {
			inner,
			cache: Mutex::new(HashMap::new()),
		}
	}

	/// Resolves `host` to its full address list, first address use is the
	/// caller's choice (dial loops try in order; rule matching uses only
	/// the first).
	pub async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>, DnsError> {
		if let Ok(ip) = host.parse::<IpAddr>() {
			return Ok(vec![ip]);
		}
		if let Some(hit) = self.cache_get(host) {
			return Ok(hit);
		}
		let response = self
			.inner
			.lookup_ip(host)
			.await
			.map_err(|e| DnsError::Resolve(host.to_string(), e))?;
		let addrs: Vec<IpAddr> = response.iter().collect();
		if addrs.is_empty() {
			return Err(DnsError::NoAddresses(host.to_string()));
		}
		self.cache.lock().unwrap().insert(
			host.to_string(),
			CacheEntry {
				addrs: addrs.clone(),
				expires: Instant::now() + CACHE_TTL,
			},
		);
		Ok(addrs)
	}

	/// Convenience used by rule matching: first resolved address only.
	pub async fn resolve_first(&self, host: &str) -> Result<IpAddr, DnsError> {
		Ok(self.resolve(host).await?[0])
	}

	fn cache_get(&self, host: &str) -> Option<Vec<IpAddr>> {
		let cache = self.cache.lock().unwrap();
		let entry = cache.get(host)?;
		if entry.expires < Instant::now() {
			return None;
		}
		Some(entry.addrs.clone())
	}
}

impl Default for DnsResolver {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn resolves_literal_ip_without_a_lookup() {
		let resolver = DnsResolver::new();
		let addrs = resolver.resolve("127.0.0.1").await.unwrap();
		assert_eq!(addrs, vec!["127.0.0.1".parse::<IpAddr>().unwrap()]);
	}
}

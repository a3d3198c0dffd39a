//! Offer source — merged, ranked capacity queries across all backends.
//!
//! Read-only: the only side effect is a short-TTL cache of per-backend
//! offer listings, so dozens of simultaneously-provisioning instances
//! don't repeat the same quota lookups.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use nimbus_backend::{
    BackendRegistry, Compute, InstanceOfferWithAvailability, JobProvisioningData,
    PlacementGroupConfig, Requirements,
};

/// Offer listings fetched within the TTL are reused across queries.
const CACHE_TTL_SECS: u64 = 300;

/// Backend queries dispatched at once.
const QUERY_CONCURRENCY: usize = 8;

/// One capacity query as issued by the provisioner or a plan preview.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OfferQuery {
    pub project: String,
    pub requirements: Requirements,
    /// Only backends with multinode support may answer.
    pub multinode: bool,
    /// Cluster members are pinned to their master's backend and region.
    pub master_provisioning_data: Option<JobProvisioningData>,
    /// An existing placement group pins the region.
    pub placement_group: Option<PlacementGroupConfig>,
    /// Explicit block count; offers must carry at least one vCPU per block.
    pub blocks: Option<u32>,
    /// Restrict to these backends (profile setting); None means all.
    pub backends: Option<Vec<String>>,
    pub regions: Option<Vec<String>>,
    /// Drop offers whose availability is NoQuota/NotAvailable.
    pub exclude_not_available: bool,
}

/// An offer with the backend that produced it, in final rank order.
#[derive(Debug, Clone, PartialEq)]
pub struct RankedOffer {
    pub backend: String,
    pub offer: InstanceOfferWithAvailability,
}

struct CacheEntry {
    fetched_at: u64,
    offers: Vec<InstanceOfferWithAvailability>,
}

/// Queries all configured backends and returns offers ranked by price.
pub struct OfferSource {
    registry: Arc<BackendRegistry>,
    cache: StdMutex<HashMap<String, CacheEntry>>,
    cache_ttl_secs: u64,
    concurrency: Arc<Semaphore>,
}

impl OfferSource {
    pub fn new(registry: Arc<BackendRegistry>) -> Self {
        Self {
            registry,
            cache: StdMutex::new(HashMap::new()),
            cache_ttl_secs: CACHE_TTL_SECS,
            concurrency: Arc::new(Semaphore::new(QUERY_CONCURRENCY)),
        }
    }

    /// Override the cache TTL (tests).
    pub fn with_cache_ttl(mut self, ttl_secs: u64) -> Self {
        self.cache_ttl_secs = ttl_secs;
        self
    }

    /// Fetch, filter, merge, and rank offers for a query.
    ///
    /// Offers are merged in backend enumeration order and stably sorted
    /// ascending by price, so price ties keep that order.
    pub async fn get_offers(&self, query: &OfferQuery, now: u64) -> Vec<RankedOffer> {
        let backends = self.candidate_backends(query);
        if backends.is_empty() {
            debug!(project = %query.project, "no candidate backends for offer query");
            return Vec::new();
        }

        // Fetch per backend concurrently; slots keep enumeration order.
        let mut listings: Vec<Option<Vec<InstanceOfferWithAvailability>>> =
            vec![None; backends.len()];
        let mut tasks = JoinSet::new();
        for (slot, backend) in backends.iter().enumerate() {
            if let Some(cached) = self.cached(backend.kind(), &query.requirements, now) {
                listings[slot] = Some(cached);
                continue;
            }
            let backend = backend.clone();
            let requirements = query.requirements.clone();
            let permits = self.concurrency.clone();
            tasks.spawn(async move {
                let _permit = permits.acquire_owned().await;
                let result = backend.get_offers(&requirements).await;
                (slot, backend.kind().to_string(), result)
            });
        }
        while let Some(joined) = tasks.join_next().await {
            let Ok((slot, kind, result)) = joined else {
                continue;
            };
            match result {
                Ok(offers) => {
                    self.store_cached(&kind, &query.requirements, now, &offers);
                    listings[slot] = Some(offers);
                }
                Err(e) => {
                    // A failing backend contributes no offers.
                    warn!(backend = %kind, error = %e, "offer query failed");
                }
            }
        }

        let mut merged: Vec<RankedOffer> = Vec::new();
        for (slot, backend) in backends.iter().enumerate() {
            let Some(offers) = listings[slot].take() else {
                continue;
            };
            for offer in offers {
                if self.accepts(query, &offer) {
                    merged.push(RankedOffer {
                        backend: backend.kind().to_string(),
                        offer,
                    });
                }
            }
        }

        // Stable ascending sort by price; ties keep enumeration order.
        merged.sort_by(|a, b| {
            a.offer
                .offer
                .price
                .partial_cmp(&b.offer.offer.price)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        merged
    }

    /// Backends eligible for this query, in registry order.
    fn candidate_backends(&self, query: &OfferQuery) -> Vec<Arc<dyn Compute>> {
        self.registry
            .iter()
            .filter(|b| {
                query
                    .backends
                    .as_ref()
                    .is_none_or(|allowed| allowed.iter().any(|k| k == b.kind()))
            })
            .filter(|b| !query.multinode || b.multinode().is_some())
            .filter(|b| {
                query
                    .master_provisioning_data
                    .as_ref()
                    .is_none_or(|master| master.backend == b.kind())
            })
            .cloned()
            .collect()
    }

    /// Post-fetch offer filter: regions, master/placement pinning,
    /// availability, block feasibility.
    fn accepts(&self, query: &OfferQuery, offer: &InstanceOfferWithAvailability) -> bool {
        if !query.requirements.matches(&offer.offer) {
            return false;
        }
        if query.exclude_not_available && offer.availability.is_unavailable() {
            return false;
        }
        if let Some(regions) = &query.regions
            && !regions.contains(&offer.offer.region)
        {
            return false;
        }
        if let Some(master) = &query.master_provisioning_data
            && offer.offer.region != master.region
        {
            return false;
        }
        if let Some(group) = &query.placement_group
            && offer.offer.region != group.region
        {
            return false;
        }
        // Each block needs at least one vCPU.
        if let Some(blocks) = query.blocks
            && offer.offer.resources.cpus < blocks
        {
            return false;
        }
        true
    }

    // ── Quota cache ────────────────────────────────────────────────

    fn cache_key(backend: &str, requirements: &Requirements) -> String {
        let req = serde_json::to_string(requirements).unwrap_or_default();
        format!("{backend}|{req}")
    }

    fn cached(
        &self,
        backend: &str,
        requirements: &Requirements,
        now: u64,
    ) -> Option<Vec<InstanceOfferWithAvailability>> {
        let cache = self
            .cache
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let entry = cache.get(&Self::cache_key(backend, requirements))?;
        (now.saturating_sub(entry.fetched_at) < self.cache_ttl_secs).then(|| entry.offers.clone())
    }

    fn store_cached(
        &self,
        backend: &str,
        requirements: &Requirements,
        now: u64,
        offers: &[InstanceOfferWithAvailability],
    ) {
        let mut cache = self
            .cache
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        cache.insert(
            Self::cache_key(backend, requirements),
            CacheEntry {
                fetched_at: now,
                offers: offers.to_vec(),
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nimbus_backend::testing::{StubCompute, test_offer, test_offer_with};
    use nimbus_backend::InstanceAvailability;

    fn source_with(backends: Vec<StubCompute>) -> (OfferSource, Vec<Arc<StubCompute>>) {
        let mut registry = BackendRegistry::new();
        let arcs: Vec<Arc<StubCompute>> = backends.into_iter().map(Arc::new).collect();
        for backend in &arcs {
            registry.register(backend.clone());
        }
        (OfferSource::new(Arc::new(registry)), arcs)
    }

    fn query() -> OfferQuery {
        OfferQuery {
            project: "main".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn ranking_is_ascending_by_price() {
        let (source, _) = source_with(vec![StubCompute::new("aws").with_offers(vec![
            test_offer("aws", "a", 3.0),
            test_offer("aws", "b", 0.5),
            test_offer("aws", "c", 2.0),
        ])]);

        let ranked = source.get_offers(&query(), 1000).await;
        let prices: Vec<f64> = ranked.iter().map(|r| r.offer.offer.price).collect();
        assert_eq!(prices, vec![0.5, 2.0, 3.0]);
    }

    #[tokio::test]
    async fn price_ties_keep_backend_enumeration_order() {
        let (source, _) = source_with(vec![
            StubCompute::new("aws").with_offers(vec![test_offer("aws", "a", 1.0)]),
            StubCompute::new("gcp").with_offers(vec![test_offer("gcp", "b", 1.0)]),
        ]);

        let ranked = source.get_offers(&query(), 1000).await;
        let backends: Vec<&str> = ranked.iter().map(|r| r.backend.as_str()).collect();
        assert_eq!(backends, vec!["aws", "gcp"]);
    }

    #[tokio::test]
    async fn exclude_not_available_drops_quota_limited_offers() {
        let mut no_quota = test_offer("aws", "a", 0.5);
        no_quota.availability = InstanceAvailability::NoQuota;
        let mut not_available = test_offer("aws", "b", 0.6);
        not_available.availability = InstanceAvailability::NotAvailable;
        let (source, _) = source_with(vec![StubCompute::new("aws").with_offers(vec![
            no_quota.clone(),
            not_available,
            test_offer("aws", "c", 2.0),
        ])]);

        let mut q = query();
        q.exclude_not_available = true;
        let ranked = source.get_offers(&q, 1000).await;
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].offer.offer.instance_type, "c");

        // Without the flag the quota-limited offers are kept and ranked.
        let all = source.get_offers(&query(), 1000).await;
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].offer, no_quota);
    }

    #[tokio::test]
    async fn multinode_skips_incapable_backends() {
        let (source, _) = source_with(vec![
            StubCompute::new("aws").with_offers(vec![test_offer("aws", "a", 0.5)]),
            StubCompute::new("gcp")
                .with_multinode()
                .with_offers(vec![test_offer("gcp", "b", 1.0)]),
        ]);

        let mut q = query();
        q.multinode = true;
        let ranked = source.get_offers(&q, 1000).await;
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].backend, "gcp");
    }

    #[tokio::test]
    async fn master_pins_backend_and_region() {
        let mut other_region = test_offer("gcp", "far", 0.1);
        other_region.offer.region = "eu-west-4".to_string();
        let (source, _) = source_with(vec![
            StubCompute::new("aws").with_offers(vec![test_offer("aws", "a", 0.2)]),
            StubCompute::new("gcp")
                .with_offers(vec![other_region, test_offer("gcp", "near", 0.5)]),
        ]);

        let mut q = query();
        q.master_provisioning_data = Some(JobProvisioningData {
            backend: "gcp".to_string(),
            region: "us-east-1".to_string(),
            instance_type: "near".to_string(),
            instance_id: "i-master".to_string(),
            hostname: None,
            internal_ip: None,
            price: 0.5,
            username: "ubuntu".to_string(),
            ssh_port: 22,
            backend_data: None,
        });
        let ranked = source.get_offers(&q, 1000).await;
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].backend, "gcp");
        assert_eq!(ranked[0].offer.offer.instance_type, "near");
    }

    #[tokio::test]
    async fn failing_backend_contributes_nothing() {
        let (source, _) = source_with(vec![
            StubCompute::new("aws").with_offers_failing(),
            StubCompute::new("gcp").with_offers(vec![test_offer("gcp", "b", 1.0)]),
        ]);

        let ranked = source.get_offers(&query(), 1000).await;
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].backend, "gcp");
    }

    #[tokio::test]
    async fn offers_are_cached_within_ttl() {
        let (source, backends) = source_with(vec![
            StubCompute::new("aws").with_offers(vec![test_offer("aws", "a", 1.0)]),
        ]);

        source.get_offers(&query(), 1000).await;
        source.get_offers(&query(), 1100).await;
        assert_eq!(backends[0].offer_calls(), 1);

        // Past the TTL the listing is fetched again.
        source.get_offers(&query(), 1000 + 301).await;
        assert_eq!(backends[0].offer_calls(), 2);
    }

    #[tokio::test]
    async fn distinct_requirements_are_cached_separately() {
        let (source, backends) = source_with(vec![
            StubCompute::new("aws").with_offers(vec![test_offer_with("aws", "a", 1.0, 8, 0)]),
        ]);

        source.get_offers(&query(), 1000).await;
        let mut q = query();
        q.requirements.max_price = Some(5.0);
        source.get_offers(&q, 1000).await;
        assert_eq!(backends[0].offer_calls(), 2);
    }

    #[tokio::test]
    async fn blocks_require_one_cpu_each() {
        let (source, _) = source_with(vec![StubCompute::new("aws").with_offers(vec![
            test_offer_with("aws", "small", 0.1, 2, 0),
            test_offer_with("aws", "big", 1.0, 16, 0),
        ])]);

        let mut q = query();
        q.blocks = Some(4);
        let ranked = source.get_offers(&q, 1000).await;
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].offer.offer.instance_type, "big");
    }
}

//! Scriptable stub backend for control-plane tests.
//!
//! `StubCompute` records call counts and plays back configured offer lists
//! and create/terminate outcomes, so provisioning tests can assert the
//! exact sequence of backend calls without any cloud driver.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;

use crate::compute::{Compute, SupportsMultinode};
use crate::error::{BackendError, BackendResult};
use crate::types::*;

/// Scripted outcome of one `create_instance` call.
#[derive(Debug, Clone)]
pub enum CreateOutcome {
    Ok,
    NoCapacity,
    Provisioning,
    Transient,
}

/// A configurable in-memory backend.
pub struct StubCompute {
    kind: String,
    offers: Vec<InstanceOfferWithAvailability>,
    offers_fail: bool,
    /// Outcomes consumed one per `create_instance` call; `Ok` once empty.
    create_script: Mutex<VecDeque<CreateOutcome>>,
    /// Number of leading `terminate_instance` calls that fail transiently.
    terminate_failures: Mutex<u32>,
    supports_placement_groups: bool,
    /// Instance types an existing group is never suitable for.
    unsuitable_instance_types: Vec<String>,
    multinode: bool,
    offer_calls: AtomicUsize,
    create_calls: AtomicUsize,
    terminate_calls: AtomicUsize,
    create_pg_calls: AtomicUsize,
    delete_pg_calls: AtomicUsize,
}

impl StubCompute {
    pub fn new(kind: &str) -> Self {
        Self {
            kind: kind.to_string(),
            offers: Vec::new(),
            offers_fail: false,
            create_script: Mutex::new(VecDeque::new()),
            terminate_failures: Mutex::new(0),
            supports_placement_groups: false,
            unsuitable_instance_types: Vec::new(),
            multinode: false,
            offer_calls: AtomicUsize::new(0),
            create_calls: AtomicUsize::new(0),
            terminate_calls: AtomicUsize::new(0),
            create_pg_calls: AtomicUsize::new(0),
            delete_pg_calls: AtomicUsize::new(0),
        }
    }

    pub fn with_offers(mut self, offers: Vec<InstanceOfferWithAvailability>) -> Self {
        self.offers = offers;
        self
    }

    pub fn with_offers_failing(mut self) -> Self {
        self.offers_fail = true;
        self
    }

    pub fn with_create_script(self, script: Vec<CreateOutcome>) -> Self {
        *self.create_script.lock().unwrap() = script.into();
        self
    }

    pub fn with_terminate_failures(self, n: u32) -> Self {
        *self.terminate_failures.lock().unwrap() = n;
        self
    }

    pub fn with_placement_groups(mut self) -> Self {
        self.supports_placement_groups = true;
        self
    }

    pub fn with_unsuitable_instance_types(mut self, types: Vec<&str>) -> Self {
        self.unsuitable_instance_types = types.into_iter().map(str::to_string).collect();
        self
    }

    pub fn with_multinode(mut self) -> Self {
        self.multinode = true;
        self
    }

    // ── Call counters ──────────────────────────────────────────────

    pub fn offer_calls(&self) -> usize {
        self.offer_calls.load(Ordering::SeqCst)
    }

    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub fn terminate_calls(&self) -> usize {
        self.terminate_calls.load(Ordering::SeqCst)
    }

    pub fn create_pg_calls(&self) -> usize {
        self.create_pg_calls.load(Ordering::SeqCst)
    }

    pub fn delete_pg_calls(&self) -> usize {
        self.delete_pg_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Compute for StubCompute {
    fn kind(&self) -> &str {
        &self.kind
    }

    async fn get_offers(
        &self,
        requirements: &Requirements,
    ) -> BackendResult<Vec<InstanceOfferWithAvailability>> {
        self.offer_calls.fetch_add(1, Ordering::SeqCst);
        if self.offers_fail {
            return Err(BackendError::Transient("offer listing failed".to_string()));
        }
        Ok(self
            .offers
            .iter()
            .filter(|o| requirements.matches(&o.offer))
            .cloned()
            .collect())
    }

    async fn create_instance(
        &self,
        offer: &InstanceOffer,
        config: &InstanceConfig,
        _placement_group: Option<&PlacementGroupProvisioningData>,
    ) -> BackendResult<JobProvisioningData> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        let outcome = self
            .create_script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(CreateOutcome::Ok);
        match outcome {
            CreateOutcome::Ok => Ok(JobProvisioningData {
                backend: self.kind.clone(),
                region: offer.region.clone(),
                instance_type: offer.instance_type.clone(),
                instance_id: format!("i-{}", config.instance_id),
                hostname: Some(format!("{}.example", config.instance_name)),
                internal_ip: Some("10.0.0.2".to_string()),
                price: offer.price,
                username: "ubuntu".to_string(),
                ssh_port: 22,
                backend_data: None,
            }),
            CreateOutcome::NoCapacity => {
                Err(BackendError::NoCapacity(format!("{} exhausted", offer.instance_type)))
            }
            CreateOutcome::Provisioning => {
                Err(BackendError::Provisioning("launch rejected".to_string()))
            }
            CreateOutcome::Transient => Err(BackendError::Transient("api timeout".to_string())),
        }
    }

    async fn terminate_instance(
        &self,
        _instance_id: &str,
        _region: &str,
        _backend_data: Option<&str>,
    ) -> BackendResult<()> {
        self.terminate_calls.fetch_add(1, Ordering::SeqCst);
        let mut failures = self.terminate_failures.lock().unwrap();
        if *failures > 0 {
            *failures -= 1;
            return Err(BackendError::NotYetTerminated("still shutting down".to_string()));
        }
        // Terminating an absent instance is a silent success.
        Ok(())
    }

    async fn create_placement_group(
        &self,
        config: &PlacementGroupConfig,
        _master_offer: &InstanceOffer,
    ) -> BackendResult<PlacementGroupProvisioningData> {
        self.create_pg_calls.fetch_add(1, Ordering::SeqCst);
        if !self.supports_placement_groups {
            return Err(BackendError::PlacementGroupNotSupported(self.kind.clone()));
        }
        Ok(PlacementGroupProvisioningData {
            backend: self.kind.clone(),
            backend_id: format!("pg-{}-{}", config.backend, config.region),
        })
    }

    async fn delete_placement_group(
        &self,
        _config: &PlacementGroupConfig,
        _data: &PlacementGroupProvisioningData,
    ) -> BackendResult<()> {
        self.delete_pg_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn is_suitable_placement_group(
        &self,
        config: &PlacementGroupConfig,
        offer: &InstanceOffer,
    ) -> bool {
        self.supports_placement_groups
            && config.region == offer.region
            && !self.unsuitable_instance_types.contains(&offer.instance_type)
    }

    fn multinode(&self) -> Option<&dyn SupportsMultinode> {
        self.multinode.then_some(self as &dyn SupportsMultinode)
    }
}

impl SupportsMultinode for StubCompute {
    fn cluster_regions(&self) -> Vec<String> {
        self.offers.iter().map(|o| o.offer.region.clone()).collect()
    }
}

/// Build an available offer for tests.
pub fn test_offer(backend: &str, instance_type: &str, price: f64) -> InstanceOfferWithAvailability {
    test_offer_with(backend, instance_type, price, 8, 0)
}

/// Build an available offer with explicit cpu/gpu counts.
pub fn test_offer_with(
    backend: &str,
    instance_type: &str,
    price: f64,
    cpus: u32,
    gpus: u32,
) -> InstanceOfferWithAvailability {
    InstanceOfferWithAvailability {
        offer: InstanceOffer {
            backend: backend.to_string(),
            region: "us-east-1".to_string(),
            instance_type: instance_type.to_string(),
            resources: Resources {
                cpus,
                memory_mib: u64::from(cpus) * 4 * 1024,
                gpus,
                gpu_name: (gpus > 0).then(|| "L4".to_string()),
                disk_gib: 100,
                spot: false,
            },
            price,
        },
        availability: InstanceAvailability::Available,
    }
}

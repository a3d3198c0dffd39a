//! Default instance probe: a TCP connect to the shim's SSH endpoint.
//!
//! Backend drivers ship richer probes (agent version, block usage); this
//! one only answers reachability, which is all the health reconciler
//! strictly needs.

use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tracing::debug;

use nimbus_health::{InstanceProbe, ProbeOutcome};
use nimbus_state::Instance;

/// Probe timeout per instance.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Default)]
pub struct TcpProbe;

#[async_trait]
impl InstanceProbe for TcpProbe {
    async fn probe(&self, instance: &Instance) -> ProbeOutcome {
        let Some(data) = &instance.job_provisioning_data else {
            // Nothing to connect to yet.
            return ProbeOutcome::Unreachable;
        };
        let Some(hostname) = &data.hostname else {
            return ProbeOutcome::Unreachable;
        };
        let address = format!("{hostname}:{}", data.ssh_port);

        match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&address)).await {
            Ok(Ok(_stream)) => ProbeOutcome::Reachable {
                shim_version: None,
                dangling_job_ids: Vec::new(),
            },
            Ok(Err(e)) => {
                debug!(instance = %instance.name, %address, error = %e, "probe connect failed");
                ProbeOutcome::Unreachable
            }
            Err(_) => {
                debug!(instance = %instance.name, %address, "probe timed out");
                ProbeOutcome::Unreachable
            }
        }
    }
}

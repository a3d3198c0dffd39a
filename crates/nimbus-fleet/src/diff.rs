//! Fleet spec diffing — what an in-place update may change.
//!
//! Only `ssh_config.hosts` is updatable, and only by adding or removing
//! entries. A host whose connection parameters changed is rejected; a
//! change limited to its private-key material is deliberately ignored
//! (key rotation must not force a fleet rebuild).

use std::collections::{BTreeMap, HashSet};

use nimbus_state::{FleetSpec, SshHost};

use crate::error::{FleetError, FleetResult};

/// Host-level changes between two ssh_config host lists, keyed by hostname.
#[derive(Debug, Default, Clone)]
pub struct SshHostsChanges {
    pub added: Vec<SshHost>,
    pub removed: Vec<SshHost>,
    /// Hostnames whose connection parameters differ (rejected upstream).
    pub changed: Vec<String>,
}

/// Diff two host lists by hostname.
pub fn calculate_ssh_hosts_changes(old: &[SshHost], new: &[SshHost]) -> SshHostsChanges {
    let old_by_name: BTreeMap<&str, &SshHost> =
        old.iter().map(|h| (h.hostname.as_str(), h)).collect();
    let new_by_name: BTreeMap<&str, &SshHost> =
        new.iter().map(|h| (h.hostname.as_str(), h)).collect();

    let mut changes = SshHostsChanges::default();
    for (name, host) in &new_by_name {
        match old_by_name.get(name) {
            None => changes.added.push((*host).clone()),
            Some(existing) => {
                if !hosts_equal_ignoring_key(existing, host) {
                    changes.changed.push((*name).to_string());
                }
            }
        }
    }
    for (name, host) in &old_by_name {
        if !new_by_name.contains_key(name) {
            changes.removed.push((*host).clone());
        }
    }
    changes
}

/// Compare hosts with identity_file blanked on both sides.
fn hosts_equal_ignoring_key(a: &SshHost, b: &SshHost) -> bool {
    let mut a = a.clone();
    let mut b = b.clone();
    a.identity_file = None;
    b.identity_file = None;
    a == b
}

/// Verify an in-place fleet spec update is permitted.
///
/// Everything outside `ssh_config.hosts` must be identical, and no
/// existing host may change its connection parameters.
pub fn check_can_update_fleet_spec(old: &FleetSpec, new: &FleetSpec) -> FleetResult<()> {
    let mut old_rest = old.clone();
    let mut new_rest = new.clone();
    if let Some(ssh) = old_rest.ssh_config.as_mut() {
        ssh.hosts = Vec::new();
    }
    if let Some(ssh) = new_rest.ssh_config.as_mut() {
        ssh.hosts = Vec::new();
    }
    if old_rest != new_rest {
        return Err(FleetError::client(
            "cannot update fleet spec in place: only ssh_config hosts can be changed",
        ));
    }

    let old_hosts = old.ssh_config.as_ref().map(|c| c.hosts.as_slice()).unwrap_or_default();
    let new_hosts = new.ssh_config.as_ref().map(|c| c.hosts.as_slice()).unwrap_or_default();
    let changes = calculate_ssh_hosts_changes(old_hosts, new_hosts);
    if let Some(hostname) = changes.changed.first() {
        return Err(FleetError::client(format!(
            "cannot update host {hostname}: changing connection parameters of an existing host is not allowed"
        )));
    }
    Ok(())
}

/// Smallest free instance_num among the active instances of a fleet.
///
/// 0 when free; otherwise the first gap at or above `min(used) + 1`.
pub fn next_instance_num(used: &HashSet<u32>) -> u32 {
    if !used.contains(&0) {
        return 0;
    }
    // `used` contains 0 here, so min is well-defined.
    let mut candidate = used.iter().min().copied().unwrap_or(0) + 1;
    while used.contains(&candidate) {
        candidate += 1;
    }
    candidate
}

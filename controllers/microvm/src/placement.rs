//! Failure domain selection.
//!
//! A failure domain is a microvm host endpoint from the cluster's registry
//! (`MicrovmCluster.status.failureDomains`). Selection is a pure function of its
//! inputs:
//!
//! 1. a domain already encoded in the provider id is reused, so placement is sticky
//!    for the life of a microvm;
//! 2. otherwise an explicit domain on the owning Machine is used as is;
//! 3. otherwise the candidates are the registered domains (control-plane eligible
//!    ones only, for control-plane machines). A single candidate is used directly;
//!    with more, the configured [`PlacementStrategy`] decides.

use crate::error::ControllerError;
use crds::{FailureDomainSpec, parse_provider_id};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

/// How a machine without a sticky domain is assigned to a host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlacementStrategy {
    /// CRC-32 of the machine name modulo the sorted candidate list
    #[default]
    NameHash,
    /// Host with the fewest machines already placed; ties go to the first host by name
    FewestMachines,
}

impl FromStr for PlacementStrategy {
    type Err = ControllerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "name-hash" => Ok(Self::NameHash),
            "fewest-machines" => Ok(Self::FewestMachines),
            other => Err(ControllerError::InvalidConfig(format!(
                "unknown placement strategy {} (expected name-hash or fewest-machines)",
                other
            ))),
        }
    }
}

impl fmt::Display for PlacementStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NameHash => f.write_str("name-hash"),
            Self::FewestMachines => f.write_str("fewest-machines"),
        }
    }
}

/// Inputs of a placement decision
#[derive(Debug, Clone, Copy)]
pub struct PlacementRequest<'a> {
    /// Name of the machine being placed
    pub machine_name: &'a str,
    /// Domain named on the owning Machine
    pub explicit_domain: Option<&'a str>,
    /// Provider id of an existing microvm
    pub provider_id: Option<&'a str>,
    /// Whether the machine is part of the control plane
    pub control_plane: bool,
    /// The cluster's failure domain registry
    pub registry: &'a BTreeMap<String, FailureDomainSpec>,
}

/// Domain the request is pinned to without consulting the registry, if any
///
/// The domain recorded in the provider id comes first: an existing microvm never
/// moves. The explicit domain applies only to machines without one.
pub fn sticky_failure_domain(request: &PlacementRequest<'_>) -> Option<String> {
    if let Some((domain, _)) = request.provider_id.and_then(parse_provider_id) {
        return Some(domain.to_string());
    }

    request
        .explicit_domain
        .filter(|d| !d.is_empty())
        .map(str::to_string)
}

/// Selects the failure domain for a machine.
///
/// `placed` lists the domains of the cluster's other machines and is only consulted
/// by [`PlacementStrategy::FewestMachines`].
pub fn select_failure_domain(
    request: &PlacementRequest<'_>,
    strategy: PlacementStrategy,
    placed: &[String],
) -> Result<String, ControllerError> {
    if let Some(domain) = sticky_failure_domain(request) {
        return Ok(domain);
    }

    let candidates: Vec<&str> = request
        .registry
        .iter()
        .filter(|(_, spec)| !request.control_plane || spec.control_plane)
        .map(|(name, _)| name.as_str())
        .collect();

    let picked = match candidates.as_slice() {
        [] => None,
        [only] => Some(*only),
        _ => match strategy {
            PlacementStrategy::NameHash => pick_by_name_hash(request.machine_name, &candidates),
            PlacementStrategy::FewestMachines => pick_fewest(&candidates, placed),
        },
    };

    picked
        .map(str::to_string)
        .ok_or_else(|| ControllerError::NoFailureDomain(request.machine_name.to_string()))
}

/// Picks `candidates[crc32(name) % len]`; `candidates` must be sorted
pub fn pick_by_name_hash<'a>(name: &str, candidates: &[&'a str]) -> Option<&'a str> {
    if candidates.is_empty() {
        return None;
    }
    let index = crc32fast::hash(name.as_bytes()) as usize % candidates.len();
    candidates.get(index).copied()
}

/// Picks the candidate with the fewest entries in `placed`, first by name on a tie
pub fn pick_fewest<'a>(candidates: &[&'a str], placed: &[String]) -> Option<&'a str> {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for domain in placed {
        *counts.entry(domain.as_str()).or_default() += 1;
    }

    let mut sorted = candidates.to_vec();
    sorted.sort_unstable();
    sorted
        .into_iter()
        .min_by_key(|domain| counts.get(domain).copied().unwrap_or(0))
}

//! File-backed simulated cloud provider
//!
//! Keeps fake resources in `sandbox.json` next to the state files so the
//! CLI can be exercised end to end without credentials. Identities are
//! derived from kind, logical id and a creation serial.
//!
//! Faults are injected with `KEEL_SANDBOX_FAIL`, a comma-separated list of
//! `<logical-id>` (fatal) or `<logical-id>:transient` (throttled twice, then
//! succeeds) entries. `KEEL_SANDBOX_LATENCY_MS` adds a delay to every call.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use stackgraph::{Outputs, Properties, Provider, ProviderError, Realized, ResourceKind, Value};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

const SANDBOX_FILE: &str = "sandbox.json";

/// Number of throttled responses before a transient fault clears
const TRANSIENT_FAILURES: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    Fatal,
    Transient { remaining: u32 },
}

/// Parse a `KEEL_SANDBOX_FAIL` value
pub fn parse_faults(spec: &str) -> BTreeMap<String, Fault> {
    spec.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|entry| match entry.split_once(':') {
            Some((id, "transient")) => (
                id.to_string(),
                Fault::Transient {
                    remaining: TRANSIENT_FAILURES,
                },
            ),
            Some((id, _)) => (id.to_string(), Fault::Fatal),
            None => (entry.to_string(), Fault::Fatal),
        })
        .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SandboxResource {
    kind: ResourceKind,
    logical_id: String,
    properties: Properties,
    outputs: Outputs,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SandboxState {
    serial: u64,
    resources: BTreeMap<String, SandboxResource>,
}

pub struct SandboxProvider {
    path: PathBuf,
    state: Mutex<SandboxState>,
    faults: Mutex<BTreeMap<String, Fault>>,
    latency: Duration,
}

impl SandboxProvider {
    /// Open the sandbox stored in `dir`, reading faults from the environment
    pub fn open(dir: &Path) -> Result<Self> {
        let faults = std::env::var("KEEL_SANDBOX_FAIL")
            .map(|spec| parse_faults(&spec))
            .unwrap_or_default();
        let latency = std::env::var("KEEL_SANDBOX_LATENCY_MS")
            .ok()
            .and_then(|ms| ms.parse().ok())
            .map_or(Duration::ZERO, Duration::from_millis);
        Self::with_faults(dir, faults, latency)
    }

    pub fn with_faults(
        dir: &Path,
        faults: BTreeMap<String, Fault>,
        latency: Duration,
    ) -> Result<Self> {
        fs::create_dir_all(dir)
            .with_context(|| format!("Could not create {}", dir.display()))?;
        let path = dir.join(SANDBOX_FILE);
        let state = if path.exists() {
            let content = fs::read_to_string(&path)
                .with_context(|| format!("Could not read {}", path.display()))?;
            serde_json::from_str(&content)
                .with_context(|| format!("Invalid sandbox file {}", path.display()))?
        } else {
            SandboxState::default()
        };

        if !faults.is_empty() {
            log::info!(
                "Sandbox faults armed for: {}",
                faults.keys().cloned().collect::<Vec<_>>().join(", ")
            );
        }

        Ok(Self {
            path,
            state: Mutex::new(state),
            faults: Mutex::new(faults),
            latency,
        })
    }

    fn lock(&self) -> MutexGuard<'_, SandboxState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn save(&self, state: &SandboxState) -> Result<(), ProviderError> {
        let json = serde_json::to_string_pretty(state)
            .map_err(|e| ProviderError::Other(e.to_string()))?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json)
            .and_then(|()| fs::rename(&tmp, &self.path))
            .map_err(|e| ProviderError::Other(format!("sandbox write failed: {e}")))
    }

    /// Consult injected faults for `logical_id`
    fn check_fault(&self, logical_id: &str) -> Result<(), ProviderError> {
        if !self.latency.is_zero() {
            std::thread::sleep(self.latency);
        }
        let mut faults = self
            .faults
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        match faults.get_mut(logical_id) {
            Some(Fault::Fatal) => Err(ProviderError::Invalid(format!(
                "injected failure for '{logical_id}'"
            ))),
            Some(Fault::Transient { remaining }) if *remaining > 0 => {
                *remaining -= 1;
                Err(ProviderError::Throttled(format!(
                    "injected throttling for '{logical_id}'"
                )))
            }
            _ => Ok(()),
        }
    }
}

fn identity_prefix(kind: ResourceKind) -> &'static str {
    match kind {
        ResourceKind::Network => "vpc",
        ResourceKind::Subnet => "subnet",
        ResourceKind::FirewallRuleSet => "sg",
        ResourceKind::Cluster => "cluster",
        ResourceKind::ComputeProfile => "nodegroup",
        ResourceKind::Registry => "repo",
        ResourceKind::Role => "role",
        ResourceKind::PolicyStatement => "stmt",
        ResourceKind::ManagedAddonRelease => "release",
        ResourceKind::ManifestObject => "obj",
        ResourceKind::OutputBinding => "out",
    }
}

fn make_identity(kind: ResourceKind, logical_id: &str, serial: u64) -> String {
    let digest = blake3::hash(format!("{kind}/{logical_id}/{serial}").as_bytes());
    format!("{}-{}", identity_prefix(kind), &digest.to_hex()[..12])
}

/// Attributes a real cloud would report for a resource
fn make_outputs(kind: ResourceKind, logical_id: &str, identity: &str, properties: &Properties) -> Outputs {
    let prop = |name: &str| properties.get(name).map(Value::render);
    let mut outputs = Outputs::from([
        ("id".to_string(), identity.to_string()),
        ("arn".to_string(), format!("arn:sandbox:{kind}::{logical_id}/{identity}")),
    ]);

    let mut put = |key: &str, value: Option<String>| {
        if let Some(value) = value {
            outputs.insert(key.to_string(), value);
        }
    };

    match kind {
        ResourceKind::Network => put("cidr", prop("cidr")),
        ResourceKind::Subnet => {
            put("cidr", prop("cidr"));
            put("zone", prop("zone"));
        }
        ResourceKind::Cluster => {
            let name = prop("name").unwrap_or_else(|| logical_id.to_string());
            put("endpoint", Some(format!("https://{name}.cluster.sandbox.local")));
            put("name", Some(name));
            put("version", prop("version"));
        }
        ResourceKind::ComputeProfile => put("instance_type", prop("instance_type")),
        ResourceKind::Registry => {
            let name = prop("name").unwrap_or_else(|| logical_id.to_string());
            put("uri", Some(format!("registry.sandbox.local/{name}")));
            put("name", Some(name));
        }
        ResourceKind::Role => put("name", prop("name")),
        ResourceKind::ManagedAddonRelease => {
            put("namespace", prop("namespace"));
            put("status", Some("deployed".to_string()));
        }
        ResourceKind::ManifestObject => {
            put("namespace", prop("namespace"));
            put("name", prop("name"));
        }
        ResourceKind::FirewallRuleSet | ResourceKind::PolicyStatement | ResourceKind::OutputBinding => {}
    }
    outputs
}

impl Provider for SandboxProvider {
    fn create(
        &self,
        kind: ResourceKind,
        logical_id: &str,
        properties: &Properties,
    ) -> Result<Realized, ProviderError> {
        self.check_fault(logical_id)?;
        let mut state = self.lock();

        if state
            .resources
            .values()
            .any(|r| r.kind == kind && r.logical_id == logical_id)
        {
            return Err(ProviderError::Conflict(format!(
                "{kind} '{logical_id}' already exists"
            )));
        }

        state.serial += 1;
        let identity = make_identity(kind, logical_id, state.serial);
        let outputs = make_outputs(kind, logical_id, &identity, properties);
        state.resources.insert(
            identity.clone(),
            SandboxResource {
                kind,
                logical_id: logical_id.to_string(),
                properties: properties.clone(),
                outputs: outputs.clone(),
                created_at: Utc::now(),
            },
        );
        self.save(&state)?;
        log::debug!("sandbox: created {kind} {logical_id} as {identity}");
        Ok(Realized::new(identity, outputs))
    }

    fn update(
        &self,
        kind: ResourceKind,
        identity: &str,
        properties: &Properties,
    ) -> Result<Outputs, ProviderError> {
        let logical_id = self
            .lock()
            .resources
            .get(identity)
            .map(|r| r.logical_id.clone())
            .ok_or_else(|| ProviderError::NotFound(identity.to_string()))?;
        self.check_fault(&logical_id)?;

        let mut state = self.lock();
        let outputs = make_outputs(kind, &logical_id, identity, properties);
        let resource = state
            .resources
            .get_mut(identity)
            .ok_or_else(|| ProviderError::NotFound(identity.to_string()))?;
        resource.properties = properties.clone();
        resource.outputs = outputs.clone();
        self.save(&state)?;
        log::debug!("sandbox: updated {kind} {identity}");
        Ok(outputs)
    }

    fn delete(&self, kind: ResourceKind, identity: &str) -> Result<(), ProviderError> {
        let mut state = self.lock();
        if state.resources.remove(identity).is_none() {
            return Err(ProviderError::NotFound(identity.to_string()));
        }
        self.save(&state)?;
        log::debug!("sandbox: deleted {kind} {identity}");
        Ok(())
    }

    fn lookup(
        &self,
        kind: ResourceKind,
        logical_id: &str,
    ) -> Result<Option<Realized>, ProviderError> {
        Ok(self
            .lock()
            .resources
            .iter()
            .find(|(_, r)| r.kind == kind && r.logical_id == logical_id)
            .map(|(identity, r)| Realized::new(identity.clone(), r.outputs.clone())))
    }
}

//! Agent registry
//!
//! Name-keyed agent descriptors plus a capability inverse index, published
//! as an immutable snapshot behind an `ArcSwap`. Readers load the current
//! snapshot without locking; a reload builds a complete replacement and
//! swaps it atomically, so concurrent readers always see either the old or
//! the new registry in full. The previous snapshot (and the adapters it
//! owns) is dropped once the last in-flight call releases its `Arc`.

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

use crate::adapters::{AdapterBuildError, AdapterFactory, AgentAdapter};
use crate::types::AgentDescriptor;

/// Errors from registry construction and reload.
#[derive(Debug, Clone, Error)]
pub enum RegistryError {
    #[error("duplicate agent name: {name}")]
    DuplicateName { name: String },

    #[error("failed to build adapter for '{agent}': {source}")]
    AdapterBuild {
        agent: String,
        source: AdapterBuildError,
    },
}

/// A registered agent: its descriptor and the adapter that reaches it.
pub struct AgentEntry {
    pub descriptor: AgentDescriptor,
    pub adapter: Arc<dyn AgentAdapter>,
}

/// An immutable view of the registry at one point in time.
#[derive(Default)]
pub struct RegistrySnapshot {
    agents: HashMap<String, Arc<AgentEntry>>,
    by_capability: HashMap<String, Vec<String>>,
}

impl RegistrySnapshot {
    /// Build a snapshot. Duplicate names abort the build; a descriptor
    /// whose adapter cannot be constructed is skipped and reported in the
    /// returned `failed` list.
    fn build(
        descriptors: Vec<AgentDescriptor>,
        factory: &AdapterFactory,
    ) -> Result<(Self, Vec<String>), RegistryError> {
        let mut agents = HashMap::new();
        let mut by_capability: HashMap<String, Vec<String>> = HashMap::new();
        let mut failed = Vec::new();

        for descriptor in descriptors {
            if agents.contains_key(&descriptor.name) {
                return Err(RegistryError::DuplicateName {
                    name: descriptor.name,
                });
            }
            let adapter = match factory.build(&descriptor) {
                Ok(adapter) => adapter,
                Err(source) => {
                    tracing::warn!(
                        "skipping agent '{}': adapter build failed: {}",
                        descriptor.name,
                        source
                    );
                    failed.push(descriptor.name);
                    continue;
                }
            };
            for capability in &descriptor.capabilities {
                by_capability
                    .entry(capability.clone())
                    .or_default()
                    .push(descriptor.name.clone());
            }
            agents.insert(
                descriptor.name.clone(),
                Arc::new(AgentEntry {
                    descriptor,
                    adapter,
                }),
            );
        }

        Ok((
            Self {
                agents,
                by_capability,
            },
            failed,
        ))
    }

    pub fn get(&self, name: &str) -> Option<Arc<AgentEntry>> {
        self.agents.get(name).cloned()
    }

    /// The named agent's descriptor, when it exists and is enabled.
    pub fn get_enabled(&self, name: &str) -> Option<Arc<AgentEntry>> {
        self.agents
            .get(name)
            .filter(|e| e.descriptor.enabled)
            .cloned()
    }

    /// Names of enabled agents advertising `capability`.
    pub fn by_capability(&self, capability: &str) -> Vec<String> {
        self.by_capability
            .get(capability)
            .map(|names| {
                names
                    .iter()
                    .filter(|n| self.get_enabled(n).is_some())
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Every entry, disabled ones included, sorted by name.
    pub fn list_all(&self) -> Vec<Arc<AgentEntry>> {
        let mut all: Vec<Arc<AgentEntry>> = self.agents.values().cloned().collect();
        all.sort_by(|a, b| a.descriptor.name.cmp(&b.descriptor.name));
        all
    }

    /// Enabled descriptors, sorted by name for stable iteration.
    pub fn list_enabled(&self) -> Vec<Arc<AgentEntry>> {
        let mut enabled: Vec<Arc<AgentEntry>> = self
            .agents
            .values()
            .filter(|e| e.descriptor.enabled)
            .cloned()
            .collect();
        enabled.sort_by(|a, b| a.descriptor.name.cmp(&b.descriptor.name));
        enabled
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}

/// Outcome of a registry reload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReloadReport {
    pub previous_count: usize,
    pub current_count: usize,
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub updated: Vec<String>,
    pub failed: Vec<String>,
}

/// The live registry: an atomically swappable snapshot.
pub struct AgentRegistry {
    inner: ArcSwap<RegistrySnapshot>,
    factory: AdapterFactory,
}

impl AgentRegistry {
    pub fn new(
        descriptors: Vec<AgentDescriptor>,
        factory: AdapterFactory,
    ) -> Result<Self, RegistryError> {
        let (snapshot, failed) = RegistrySnapshot::build(descriptors, &factory)?;
        if !failed.is_empty() {
            tracing::warn!("registry started without {} agent(s): {:?}", failed.len(), failed);
        }
        Ok(Self {
            inner: ArcSwap::from_pointee(snapshot),
            factory,
        })
    }

    /// The current snapshot. Cheap and lock-free; hold it for the duration
    /// of one pipeline invocation so a mid-flight reload cannot produce a
    /// partial view.
    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        self.inner.load_full()
    }

    /// Register one agent. Fails on a duplicate name; readers see the new
    /// agent atomically with the snapshot swap.
    pub fn register(&self, descriptor: AgentDescriptor) -> Result<(), RegistryError> {
        let current = self.snapshot();
        if current.get(&descriptor.name).is_some() {
            return Err(RegistryError::DuplicateName {
                name: descriptor.name,
            });
        }
        let mut descriptors: Vec<AgentDescriptor> = current
            .list_all()
            .iter()
            .map(|entry| entry.descriptor.clone())
            .collect();
        descriptors.push(descriptor);
        let (snapshot, failed) = RegistrySnapshot::build(descriptors, &self.factory)?;
        if !failed.is_empty() {
            return Err(RegistryError::AdapterBuild {
                agent: failed[0].clone(),
                source: AdapterBuildError::UnknownBinding(failed[0].clone()),
            });
        }
        self.inner.store(Arc::new(snapshot));
        Ok(())
    }

    /// Remove one agent. Returns whether it was present.
    pub fn unregister(&self, name: &str) -> bool {
        let current = self.snapshot();
        if current.get(name).is_none() {
            return false;
        }
        let descriptors: Vec<AgentDescriptor> = current
            .list_all()
            .iter()
            .filter(|entry| entry.descriptor.name != name)
            .map(|entry| entry.descriptor.clone())
            .collect();
        match RegistrySnapshot::build(descriptors, &self.factory) {
            Ok((snapshot, _)) => {
                self.inner.store(Arc::new(snapshot));
                true
            }
            Err(_) => false,
        }
    }

    /// Build a fresh snapshot from `descriptors` and swap it in atomically.
    pub fn reload(&self, descriptors: Vec<AgentDescriptor>) -> Result<ReloadReport, RegistryError> {
        let (snapshot, failed) = RegistrySnapshot::build(descriptors, &self.factory)?;
        let new_snapshot = Arc::new(snapshot);
        let old_snapshot = self.inner.swap(new_snapshot.clone());

        let mut report = ReloadReport {
            previous_count: old_snapshot.len(),
            current_count: new_snapshot.len(),
            failed,
            ..ReloadReport::default()
        };
        for (name, entry) in &new_snapshot.agents {
            match old_snapshot.agents.get(name) {
                None => report.added.push(name.clone()),
                Some(old) if old.descriptor != entry.descriptor => {
                    report.updated.push(name.clone())
                }
                Some(_) => {}
            }
        }
        for name in old_snapshot.agents.keys() {
            if !new_snapshot.agents.contains_key(name) {
                report.removed.push(name.clone());
            }
        }
        report.added.sort();
        report.removed.sort();
        report.updated.sort();

        tracing::info!(
            "registry reloaded: {} agents ({} added, {} removed, {} updated)",
            report.current_count,
            report.added.len(),
            report.removed.len(),
            report.updated.len(),
        );
        Ok(report)
    }
}

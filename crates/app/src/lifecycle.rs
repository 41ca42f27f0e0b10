//! Microservice lifecycle synchronizer.
//!
//! Diffs the declarative desired-module list of an owner against what is
//! attached, destroying undesired modules, building missing ones, and
//! re-parenting plus initializing everything that remains. Runs once per
//! owner per invocation; a module whose constructor fails is retried on
//! every subsequent invocation because its persisted state entry survives.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, error, warn};

use carehub_domain::id::ModuleName;

use crate::ports::{EventCx, Microservice, Owner};
use crate::registry::{ModuleSpec, Registry};

/// Live module instances of one owner, keyed like the persisted state map.
pub type ModuleMap = BTreeMap<ModuleName, Box<dyn Microservice>>;

/// Counters describing one owner's sync round.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SyncReport {
    pub created: usize,
    pub removed: usize,
    pub failed: usize,
}

/// Render an error and its source chain for operator logs.
#[must_use]
pub fn error_chain(err: &dyn std::error::Error) -> String {
    let mut out = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        out.push_str(": ");
        out.push_str(&cause.to_string());
        source = cause.source();
    }
    out
}

/// Synchronize one owner's modules against its desired list.
pub fn sync_owner_modules(
    desired: &[ModuleSpec],
    registry: &Registry,
    persisted: &mut BTreeMap<ModuleName, serde_json::Value>,
    live: &mut ModuleMap,
    owner: &Owner,
    cx: &mut EventCx<'_>,
) -> SyncReport {
    let mut report = SyncReport::default();
    let desired_names: BTreeSet<&str> = desired.iter().map(|spec| spec.name).collect();

    let stale: BTreeSet<ModuleName> = persisted
        .keys()
        .chain(live.keys())
        .filter(|name| !desired_names.contains(name.as_str()))
        .cloned()
        .collect();
    for name in stale {
        let state = persisted.remove(&name);
        let instance = live
            .remove(&name)
            .or_else(|| restore(registry, &name, state.as_ref()));
        match instance {
            Some(mut module) => {
                if let Err(err) = module.destroy(cx) {
                    warn!(module = %name, error = error_chain(&err), "destroy hook failed");
                }
            }
            None => {
                warn!(module = %name, "dropping state of unknown module without destroy hook");
            }
        }
        report.removed += 1;
    }

    for spec in desired {
        let name = ModuleName::new(spec.name);
        if live.contains_key(&name) {
            continue;
        }
        match (spec.build)(persisted.get(&name)) {
            Ok(module) => {
                live.insert(name, module);
                report.created += 1;
            }
            Err(err) => {
                // Isolated per module: state stays for a retry on the next
                // invocation, siblings continue.
                error!(
                    module = spec.name,
                    error = error_chain(&err),
                    "module construction failed; will retry next invocation"
                );
                report.failed += 1;
            }
        }
    }

    for (name, module) in live.iter_mut() {
        module.set_parent(owner.clone());
        if let Err(err) = module.initialize(cx) {
            warn!(module = %name, error = error_chain(&err), "module initialize failed");
        }
    }

    report
}

/// Destroy every module of an owner that is being deleted.
///
/// Instances not alive yet are restored from their persisted state just
/// long enough to run the destroy hook.
pub fn destroy_modules(
    mut live: ModuleMap,
    persisted: &BTreeMap<ModuleName, serde_json::Value>,
    registry: &Registry,
    cx: &mut EventCx<'_>,
) {
    let names: BTreeSet<ModuleName> = persisted.keys().chain(live.keys()).cloned().collect();
    for name in names {
        let instance = live
            .remove(&name)
            .or_else(|| restore(registry, &name, persisted.get(&name)));
        match instance {
            Some(mut module) => {
                if let Err(err) = module.destroy(cx) {
                    warn!(module = %name, error = error_chain(&err), "destroy hook failed");
                }
            }
            None => debug!(module = %name, "no class registered; state dropped without destroy"),
        }
    }
}

fn restore(
    registry: &Registry,
    name: &ModuleName,
    state: Option<&serde_json::Value>,
) -> Option<Box<dyn Microservice>> {
    let spec = registry.module_spec(name.as_str())?;
    match (spec.build)(state) {
        Ok(module) => Some(module),
        Err(err) => {
            warn!(module = %name, error = error_chain(&err), "could not restore module");
            None
        }
    }
}

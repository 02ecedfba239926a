//! Extension points called by the engine.
//!
//! Every hook has a no-op default so an implementation only overrides what
//! it cares about. The multicast and contact-graph hooks are chosen from
//! configuration; extension hooks and the custody-signal aggregator are
//! installed through the node builder.

use std::sync::Arc;

use ferry_core::admin::CustodySignal;
use ferry_core::config::HooksConfig;
use ferry_core::MetaEid;

use crate::bundle::Bundle;
use crate::vdb::Snub;

/// Per-bundle callbacks for extension-block processing.
pub trait ExtensionHooks: Send + Sync {
    /// The bundle is about to be queued for forwarding.
    fn on_forward(&self, _bundle: &mut Bundle) {}

    /// This node has just taken custody of the bundle.
    fn on_take_custody(&self, _bundle: &mut Bundle) {}

    /// The bundle has been taken off a duct for transmission.
    fn on_dequeue(&self, _bundle: &mut Bundle) {}
}

/// Aggregate custody signalling.
pub trait CustodySignalAggregator: Send + Sync {
    /// Return true to take over delivery of `signal` to `custodian`. The
    /// engine then sends nothing itself.
    fn absorb(&self, _custodian: &str, _signal: &CustodySignal) -> bool {
        false
    }
}

pub trait MulticastHook: Send + Sync {
    /// True if `eid` names a multicast group. Bundles for a group are
    /// delivered to any local member and still forwarded.
    fn is_group(&self, _eid: &MetaEid) -> bool {
        false
    }
}

/// Receives routing embargoes.
pub trait ContactGraph: Send + Sync {
    fn snub_added(&self, _snub: &Snub) {}
    fn snub_forgotten(&self, _snub: &Snub) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoHooks;

impl ExtensionHooks for NoHooks {}
impl CustodySignalAggregator for NoHooks {}
impl MulticastHook for NoHooks {}
impl ContactGraph for NoHooks {}

/// Every `imc` EID is a group.
#[derive(Debug, Default, Clone, Copy)]
pub struct ImcGroups;

impl MulticastHook for ImcGroups {
    fn is_group(&self, eid: &MetaEid) -> bool {
        eid.is_multicast()
    }
}

/// Logs embargo changes for an external contact-graph router to pick up.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggedContactGraph;

impl ContactGraph for LoggedContactGraph {
    fn snub_added(&self, snub: &Snub) {
        tracing::info!(
            destination = snub.destination,
            neighbor = snub.neighbor,
            "neighbor embargoed"
        );
    }

    fn snub_forgotten(&self, snub: &Snub) {
        tracing::info!(
            destination = snub.destination,
            neighbor = snub.neighbor,
            "embargo lifted"
        );
    }
}

/// The hook set a node runs with.
#[derive(Clone)]
pub struct Hooks {
    pub extension: Arc<dyn ExtensionHooks>,
    pub aggregator: Arc<dyn CustodySignalAggregator>,
    pub multicast: Arc<dyn MulticastHook>,
    pub contact_graph: Arc<dyn ContactGraph>,
}

impl Default for Hooks {
    fn default() -> Self {
        Self {
            extension: Arc::new(NoHooks),
            aggregator: Arc::new(NoHooks),
            multicast: Arc::new(NoHooks),
            contact_graph: Arc::new(NoHooks),
        }
    }
}

impl Hooks {
    pub fn from_config(config: &HooksConfig) -> Self {
        let mut hooks = Hooks::default();
        if config.multicast {
            hooks.multicast = Arc::new(ImcGroups);
        }
        if config.contact_graph {
            hooks.contact_graph = Arc::new(LoggedContactGraph);
        }
        hooks
    }
}

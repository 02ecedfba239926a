//! ferry-engine: the bundle-forwarding engine. Transactional store, ZCO
//! space, queueing, custody, fragmentation and the `Node` façade.

pub mod acquire;
pub mod bundle;
pub mod clock;
pub mod db;
pub mod engine;
pub mod error;
pub mod hooks;
pub mod node;
pub mod plan;
pub mod routing;
pub mod semaphore;
pub mod send;
pub mod stats;
pub mod store;
pub mod vdb;
pub mod xmit;
pub mod zco;

mod custody;
mod forward;
mod fragment;
mod identity;
mod lifecycle;
mod timeline;

#[cfg(test)]
pub(crate) mod testkit;

pub use acquire::AcqWorkArea;
pub use clock::{Clock, ManualClock, SystemClock};
pub use engine::{Engine, Env};
pub use error::{EngineError, Result, StoreError};
pub use hooks::{ContactGraph, CustodySignalAggregator, ExtensionHooks, Hooks, MulticastHook};
pub use node::{Delivery, Node, NodeBuilder};
pub use plan::PlanStep;
pub use routing::{Router, StaticRouter};
pub use send::SendRequest;
pub use stats::{DelReason, StateStat, Stats};
pub use xmit::Outbound;
pub use zco::{Residence, Zco};

//! ferry-core: shared types, bundle wire format, and the ordered index.
//! All other ferry crates depend on this one.

pub mod admin;
pub mod config;
pub mod eid;
pub mod rbt;
pub mod sdnv;
pub mod time;
pub mod wire;

pub use eid::{CbheEid, Dictionary, EidRef, MetaEid};
pub use time::{CreationTime, DtnTime};
pub use wire::{Priority, ProcFlags};

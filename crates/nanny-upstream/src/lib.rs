//! Upstream adapters for the nanny engine.
//!
//! Each module implements the engine's snapshot and repair traits against
//! one real system: the OpenStack databases, the OpenStack control plane,
//! the storage arrays, the virtualization manager gateway, the metrics
//! backend and the placement recommender.

pub mod array;
pub mod error;
pub mod openstack;
pub mod promql;
pub mod recommender;
pub mod retry;
pub mod sql;
pub mod vmgr;

pub use error::{Result, UpstreamError};

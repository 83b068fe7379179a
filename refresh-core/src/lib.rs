//! Shared types for the refresh coordination core: the refresher/domain data model, the scope
//! codec, the error taxonomy, and the configuration surface.
//!
//! This crate has no async runtime dependency and no I/O: it is the leaf layer that
//! `refresh-runtime`'s manager, orchestrator and snapshot client build on top of, the same way
//! `kube-core` underlies `kube-client` and `kube-runtime`.

#![forbid(unsafe_code)]

pub mod config;
pub mod context;
pub mod domain;
pub mod error;
pub mod refresher;
pub mod scope;
pub mod snapshot;

pub use config::{ReadinessRetryPolicy, RefresherTiming, RefresherTimingTable, RefreshSystemConfig};
pub use context::{ContextTransition, ContextUpdate, ObjectPanel, RefreshContext, View};
pub use domain::{DomainCategory, DomainConfig, StreamingFlags};
pub use error::{ErrorCategory, RefreshError, Result, StatusDetails, StatusPayload};
pub use refresher::{cooldown_duration, RefresherConfig, RefresherState, RefresherStatus};
pub use snapshot::{DomainSnapshotState, Snapshot, SnapshotStatus};

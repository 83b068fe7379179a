//! The Refresh Manager and Refresh Orchestrator: the runtime half of the refresh coordination
//! core, built on top of [`refresh_core`]'s data model.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use refresh::event_bus::EventBus;
//! use refresh::manager::RefreshManager;
//! use refresh_core::RefresherConfig;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let events = Arc::new(EventBus::new());
//! let manager = RefreshManager::new(events);
//! manager.register(RefresherConfig::new(
//!     "nodes",
//!     Duration::from_millis(10_000),
//!     Duration::from_millis(1_000),
//!     Duration::from_secs(10),
//! ));
//! # }
//! ```
//!
//! A host application normally goes one layer up, constructing a [`RefreshOrchestrator`] (which
//! owns its own `RefreshManager` internally via [`RefreshOrchestrator::new`]) and registering
//! data domains rather than raw refreshers directly; see `orchestrator` for the domain-level
//! API.

#![forbid(unsafe_code)]

pub mod client;
pub mod event_bus;
pub mod manager;
pub mod orchestrator;
pub mod store;
pub mod system;

#[doc(inline)]
pub use client::{RefreshBackend, SnapshotClient};
#[doc(inline)]
pub use event_bus::EventBus;
#[doc(inline)]
pub use manager::RefreshManager;
#[doc(inline)]
pub use orchestrator::{FetchOptions, RefreshOrchestrator, StreamingProvider};
#[doc(inline)]
pub use store::Store;
#[doc(inline)]
pub use system::RefreshSystem;

pub use refresh_core::{RefreshError, Result};

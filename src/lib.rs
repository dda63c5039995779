//! broker-ingress brings up the ingress of a multi-tenant event broker
//! and keeps it reconfigurable while it serves.
//!
//! Startup runs in a fixed order:
//! configuration watchers first, so the first served request already sees live configuration,
//! then the cluster-resource informers, which must sync before any event is routed,
//! and only then the serving loop.
//! Log level, metrics exporter and trace publisher follow their configuration objects
//! for the lifetime of the process, swapped atomically under concurrent readers.
//! A single cancellation token tears everything down.

pub mod cluster;
pub mod controller;
pub mod env;
pub mod informer;
pub mod ingress;
pub mod lifecycle;
pub mod watcher;

pub use lifecycle::{LifecycleController, State};

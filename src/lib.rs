//! apimesh: a multi-tenant API binding control plane
//!
//! This crate implements the reconcilers that let independent logical
//! clusters publish and consume versioned API surfaces: consumers declare an
//! [`api::binding::ApiBinding`] pointing at a published
//! [`api::export::ApiExport`], and the controllers materialize the export's
//! schemas as served resource definitions, keep permissions and identity
//! coherent with the publisher, and surface the endpoint URLs the export is
//! reachable at.
//!
//! The crate exposes no network surface of its own. The embedding process
//! supplies synced [`cache::ClusterStore`]s, write clients, and a shutdown
//! token, and starts each controller with its desired worker count.

pub mod api;
pub mod cache;
pub mod clients;
pub mod cluster;
pub mod controller;
pub mod error;
pub mod indexers;
pub mod queue;

pub use crate::error::{Error, Result};

//! Kubernetes operator for MAIA: reconciles `MaiaInstance` into a running
//! server and `MaiaTenant` into tenants provisioned through its admin API.

pub mod admin;
pub mod config;
pub mod crds;
pub mod error;
pub mod instance_controller;
pub mod instance_resources;
pub mod leader;
pub mod platform;
pub mod tenant_controller;
pub mod tenant_sync;

//! Closed-loop reconciliation engine for CRs backed by an external
//! configuration-management engine.
//!
//! A watches file maps each group/version/kind to a playbook or role; per-GVK
//! controllers drive every observed CR by launching `ansible-runner` with the
//! CR's spec as input and folding the run's terminal stats back into the CR's
//! status. Children talk to the cluster through the companion proxy crate,
//! which injects owner references so created objects are garbage collected
//! with their CR.

pub mod controller;
pub mod error;
pub mod eventapi;
pub mod events;
pub mod inputdir;
pub mod metrics;
pub mod params;
pub mod reconcile;
pub mod runner;
pub mod status;
pub mod telemetry;
pub mod watches;

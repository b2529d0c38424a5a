//! hpcserve - control plane for AI inference services on Slurm clusters
//!
//! The gateway accepts deployment requests, submits one batch job per
//! replica, tracks each job through its lifecycle and routes inference
//! traffic to running replicas, optionally through an SSH tunnel to the
//! cluster login node.

pub mod cli;
pub mod config;
pub mod lifecycle;
pub mod orchestrator;
pub mod recipe;
pub mod router;
pub mod scheduler;
pub mod server;
pub mod service;
pub mod store;
pub mod tunnel;

#[cfg(any(test, feature = "testkit"))]
pub mod testkit;

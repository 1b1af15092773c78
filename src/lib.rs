//! A dynamic TCP reverse proxy: a live mapping from listening ports to
//! pools of upstream targets, reconfigured atomically from declarative
//! configuration updates, with continuous health checking and round-robin
//! load distribution over the healthy upstreams.
//!
//! The crate is organized around the three collaborating pieces described
//! in the design: a generic pickable target set with a round-robin picker
//! ([`pickset`]), a health-checked wrapper around it ([`healthset`]), and a
//! controller that applies a config diff's operations to runtime state
//! ([`controller`], [`diff`], [`config`]).

pub mod config;
pub mod controller;
pub mod diff;
pub mod echodispatch;
pub mod error;
pub mod healthset;
pub mod pickset;

pub use config::{Config, Rule};
pub use controller::Controller;
pub use diff::{diff, Operation};
pub use error::{PickError, ProxyError};
pub use healthset::{HealthCheckConfig, TargetSetWithHealthCheck};
pub use pickset::{PickableSet, Picker};

//! Stratified, spatially de-duplicated sampling.
//!
//! Two modes share the quota and registry machinery:
//!   - [`batch`]: draw whole grid cells per stratum from a classified grid.
//!   - [`online`]: grow an existing dataset by jittering around anchors,
//!     rejecting anything too close to a location already in the [`registry`].

pub mod batch;
pub mod online;
pub mod registry;

pub use batch::{stratified_sample, BatchSample, StratumQuota};
#[cfg(feature = "threading")]
pub use online::sample_online_parallel;
pub use online::{sample_online, FillStatus, OnlineOutcome, StratumFill};
pub use registry::{IdAllocator, Registry, SampleRegistry, SharedRegistry};

//! Routing layer
//!
//! Transforms, edges and filters that turn one entity mutation into derived values
//! and per-node work items.

pub mod filter;
pub mod repository;
pub mod service;
pub mod transform;
pub mod types;

pub use filter::{Filter, FilterRegistry};
pub use repository::RouterRepository;
pub use service::RouterService;
pub use transform::{Transform, TransformContext, TransformRegistry};
pub use types::{
    ActionDistribution, ConfigMap, Distribution, NewEdge, NewTransform, RouterEdge, RouterFilter,
    RouterTransform, UpdateOutcome,
};

pub mod builtin;
pub mod registry;
pub mod resource;
pub mod util;

pub use registry::StrategyRegistry;
pub use resource::{HttpResourceClient, UnconfiguredResources};

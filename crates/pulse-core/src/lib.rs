// PulseWatch core
// Run registry, cancellation, event bridging, bounded stage execution,
// observer fan-out state, the phase orchestrator, and run persistence.

pub mod bridge;
pub mod broadcast;
pub mod config;
pub mod error;
pub mod executor;
pub mod orchestrator;
pub mod registry;
pub mod stages;
pub mod store;

pub use bridge::{DeliveryCommand, EventBridge, RunContext, RunEvent};
pub use broadcast::{Broadcaster, RunStateCache, Subscriber, MAX_REPLAY_STEPS};
pub use config::RunConfig;
pub use error::{PulseError, Result};
pub use executor::execute_bounded;
pub use orchestrator::Orchestrator;
pub use registry::RunRegistry;
pub use stages::{IntentInfo, NewsItem, StagePipeline};
pub use store::{JsonRunStore, RunStore};

//! Shared types for the Strata execution engine.
//!
//! Everything that crosses a tier boundary lives here so that the navigation
//! tier (`strata-navigation`) and the execution tier (`strata-resources`) can
//! talk to each other without depending on one another:
//!
//! - [`AbstractLocation`]: where an execution currently is in a workflow graph
//! - [`ExecutionContext`]: the mutable state threaded through navigation
//! - [`TierExecutionRequest`] / [`ExecutionResult`]: the tier contract
//! - [`ErrorClassification`] / [`RecoveryStrategy`]: recovery vocabulary
//! - [`EventBus`]: the publish/subscribe side channel

pub mod classification;
pub mod context;
pub mod error;
pub mod events;
pub mod execution;
pub mod ids;
pub mod location;
pub mod recovery;
pub mod resources;
pub mod risk;

pub use classification::{ErrorCategory, ErrorClassification, Recoverability, Severity};
pub use context::{
    AdHocProgress, Branch, CompensationHandler, ERRORS_VARIABLE, EventState, EventTrigger,
    ExecutionContext, GatewayState, ParallelState, PendingEvent, SubprocessContext,
    SubprocessKind, SubprocessState, SubprocessStatus, TriggerKind, Variables,
};
pub use error::{Error, Result};
pub use events::{
    Event, EventBus, EventHandler, InMemoryEventBus, SharedEventBus, SubscriptionId, topic_matches,
};
pub use execution::{
    ExecutionResult, ExecutionStatus, RequestType, RoutineFormat, SharedTierCommunication,
    StepDescriptor, TierCommunication, TierExecutionRequest, TierMetrics,
};
pub use ids::{ExecutionId, ReservationId, SubprocessContextId};
pub use location::{AbstractLocation, LocationMetadata, LocationType};
pub use recovery::{
    BackoffStrategy, BackoffType, RecoveryContext, RecoveryOutcome, RecoveryRequirements,
    RecoveryStrategy, StrategyType, Tier,
};
pub use resources::{
    AvailableResources, ModelAvailability, ResourceConstraints, ResourceUsage, StrategyProfile,
};
pub use risk::RiskLevel;

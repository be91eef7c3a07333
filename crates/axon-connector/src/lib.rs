// ABOUTME: Client connector core for AxonServer.
// ABOUTME: Connection orchestration, channels, handler registries and the primitives beneath them.

pub mod actor;
pub mod admin;
pub mod backoff;
pub mod cancellation;
mod channel;
pub mod clock;
pub mod command;
pub mod command_registrations;
pub mod config;
pub mod connection;
pub mod control;
mod duplex;
pub mod error;
pub mod event;
pub mod event_processors;
pub mod factory;
pub mod handlers;
pub mod heartbeat;
pub mod ids;
pub mod ongoing_queries;
pub mod permits;
pub mod query;
pub mod query_handlers;
pub mod query_reply;
pub mod routing;
pub mod scheduler;
pub mod sync;
pub mod task_cache;

#[cfg(test)]
mod testing;

// Connection and factory
pub use connection::{AxonServerConnection, ConnectionEvent, ConnectionState, ConnectionStatus};
pub use factory::AxonServerConnectionFactory;

// Configuration
pub use config::{AxonServerConnectorOptions, ConnectorConfig};

// Channels
pub use admin::AdminChannel;
pub use channel::ChannelStatus;
pub use command::{CommandChannel, CommandHandlerRegistration};
pub use control::{ControlChannel, EventProcessorRegistration};
pub use event::{EventChannel, EventQueryResultEntry, EventQueryValue, EventStreamToken};
pub use query::{QueryChannel, QueryHandlerRegistration, QuerySubscriptionResult};

// Handlers
pub use handlers::{
    CommandHandler, EventProcessorInfoSupplier, EventProcessorInstructionHandler, QueryFn,
    QueryHandler, QueryResponder, QueryUpdateSink,
};

// Errors
pub use error::{ConnectorError, ErrorCategory};

// Identity and flow control
pub use ids::{
    AggregateId, ClientIdentity, ClientInstanceId, CommandName, ComponentName, Context,
    EventProcessorName, IdGenerator, InstructionId, LoadFactor, QueryDefinition, QueryName,
    RegistrationId, ScheduledEventToken, SegmentId, SubscriptionId,
};
pub use permits::{FlowController, PermitCount, PermitCounter};

// Primitives
pub use backoff::{BackoffPolicy, BackoffPolicyOptions};
pub use cancellation::CooperativeCancellation;
pub use clock::{Clock, ManualClock};
pub use heartbeat::{HeartbeatChannel, HeartbeatMonitor, HeartbeatState};
pub use scheduler::Scheduler;
pub use sync::{AsyncLock, Completion, CountdownCompletionSource};
pub use task_cache::TaskCache;

// Transport types callers need to build options
pub use axon_grpc::{Authentication, ServerEndpoint};
pub use axon_proto;

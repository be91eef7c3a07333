// ABOUTME: Fully qualified gRPC method paths for the AxonServer services.
// ABOUTME: Used with tonic's generic client in place of generated stubs.

pub mod platform_service {
    pub const GET_PLATFORM_SERVER: &str =
        "/io.axoniq.axonserver.grpc.control.PlatformService/GetPlatformServer";
    pub const OPEN_STREAM: &str = "/io.axoniq.axonserver.grpc.control.PlatformService/OpenStream";
}

pub mod command_service {
    pub const OPEN_STREAM: &str = "/io.axoniq.axonserver.grpc.command.CommandService/OpenStream";
    pub const DISPATCH: &str = "/io.axoniq.axonserver.grpc.command.CommandService/Dispatch";
}

pub mod query_service {
    pub const OPEN_STREAM: &str = "/io.axoniq.axonserver.grpc.query.QueryService/OpenStream";
    pub const QUERY: &str = "/io.axoniq.axonserver.grpc.query.QueryService/Query";
    pub const SUBSCRIPTION: &str = "/io.axoniq.axonserver.grpc.query.QueryService/Subscription";
}

pub mod event_store {
    pub const APPEND_EVENT: &str = "/io.axoniq.axonserver.grpc.event.EventStore/AppendEvent";
    pub const LIST_EVENTS: &str = "/io.axoniq.axonserver.grpc.event.EventStore/ListEvents";
    pub const LIST_AGGREGATE_EVENTS: &str =
        "/io.axoniq.axonserver.grpc.event.EventStore/ListAggregateEvents";
    pub const APPEND_SNAPSHOT: &str = "/io.axoniq.axonserver.grpc.event.EventStore/AppendSnapshot";
    pub const LIST_AGGREGATE_SNAPSHOTS: &str =
        "/io.axoniq.axonserver.grpc.event.EventStore/ListAggregateSnapshots";
    pub const READ_HIGHEST_SEQUENCE_NR: &str =
        "/io.axoniq.axonserver.grpc.event.EventStore/ReadHighestSequenceNr";
    pub const GET_FIRST_TOKEN: &str = "/io.axoniq.axonserver.grpc.event.EventStore/GetFirstToken";
    pub const GET_LAST_TOKEN: &str = "/io.axoniq.axonserver.grpc.event.EventStore/GetLastToken";
    pub const GET_TOKEN_AT: &str = "/io.axoniq.axonserver.grpc.event.EventStore/GetTokenAt";
    pub const QUERY_EVENTS: &str = "/io.axoniq.axonserver.grpc.event.EventStore/QueryEvents";
}

pub mod event_scheduler {
    pub const SCHEDULE_EVENT: &str = "/io.axoniq.axonserver.grpc.event.EventScheduler/ScheduleEvent";
    pub const RESCHEDULE_EVENT: &str =
        "/io.axoniq.axonserver.grpc.event.EventScheduler/RescheduleEvent";
    pub const CANCEL_SCHEDULED_EVENT: &str =
        "/io.axoniq.axonserver.grpc.event.EventScheduler/CancelScheduledEvent";
}

pub mod context_admin {
    pub const CREATE_CONTEXT: &str =
        "/io.axoniq.axonserver.grpc.admin.ContextAdminService/CreateContext";
    pub const DELETE_CONTEXT: &str =
        "/io.axoniq.axonserver.grpc.admin.ContextAdminService/DeleteContext";
    pub const GET_CONTEXTS: &str =
        "/io.axoniq.axonserver.grpc.admin.ContextAdminService/GetContexts";
}

pub mod replication_group_admin {
    pub const CREATE_REPLICATION_GROUP: &str =
        "/io.axoniq.axonserver.grpc.admin.ReplicationGroupAdminService/CreateReplicationGroup";
    pub const DELETE_REPLICATION_GROUP: &str =
        "/io.axoniq.axonserver.grpc.admin.ReplicationGroupAdminService/DeleteReplicationGroup";
}

pub mod application_admin {
    pub const CREATE_OR_UPDATE_APPLICATION: &str =
        "/io.axoniq.axonserver.grpc.admin.ApplicationAdminService/CreateOrUpdateApplication";
    pub const DELETE_APPLICATION: &str =
        "/io.axoniq.axonserver.grpc.admin.ApplicationAdminService/DeleteApplication";
}

pub mod user_admin {
    pub const CREATE_OR_UPDATE_USER: &str =
        "/io.axoniq.axonserver.grpc.admin.UserAdminService/CreateOrUpdateUser";
    pub const DELETE_USER: &str = "/io.axoniq.axonserver.grpc.admin.UserAdminService/DeleteUser";
}

pub mod event_processor_admin {
    pub const GET_ALL_EVENT_PROCESSORS: &str =
        "/io.axoniq.axonserver.grpc.admin.EventProcessorAdminService/GetAllEventProcessors";
    pub const PAUSE_EVENT_PROCESSOR: &str =
        "/io.axoniq.axonserver.grpc.admin.EventProcessorAdminService/PauseEventProcessor";
    pub const START_EVENT_PROCESSOR: &str =
        "/io.axoniq.axonserver.grpc.admin.EventProcessorAdminService/StartEventProcessor";
    pub const SPLIT_EVENT_PROCESSOR: &str =
        "/io.axoniq.axonserver.grpc.admin.EventProcessorAdminService/SplitEventProcessor";
    pub const MERGE_EVENT_PROCESSOR: &str =
        "/io.axoniq.axonserver.grpc.admin.EventProcessorAdminService/MergeEventProcessor";
    pub const MOVE_EVENT_PROCESSOR_SEGMENT: &str =
        "/io.axoniq.axonserver.grpc.admin.EventProcessorAdminService/MoveEventProcessorSegment";
}

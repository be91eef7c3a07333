// ABOUTME: Admin service messages for contexts, replication groups, applications and users.
// ABOUTME: Also covers event processor inspection and segment management.

use std::collections::HashMap;

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Empty {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CreateContextRequest {
    #[prost(string, tag = "1")]
    pub context_name: String,
    #[prost(string, tag = "2")]
    pub replication_group_name: String,
    #[prost(map = "string, string", tag = "3")]
    pub meta_data: HashMap<String, String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DeleteContextRequest {
    #[prost(string, tag = "1")]
    pub context_name: String,
    #[prost(bool, tag = "2")]
    pub preserve_event_store: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ContextOverview {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(map = "string, string", tag = "3")]
    pub meta_data: HashMap<String, String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CreateReplicationGroupRequest {
    #[prost(string, tag = "1")]
    pub name: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DeleteReplicationGroupRequest {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(bool, tag = "2")]
    pub preserve_event_store: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ApplicationContextRole {
    #[prost(string, tag = "1")]
    pub context: String,
    #[prost(string, repeated, tag = "2")]
    pub roles: Vec<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ApplicationRequest {
    #[prost(string, tag = "1")]
    pub application_name: String,
    #[prost(string, tag = "2")]
    pub description: String,
    #[prost(message, repeated, tag = "3")]
    pub roles_per_context: Vec<ApplicationContextRole>,
    #[prost(string, tag = "4")]
    pub token: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ApplicationId {
    #[prost(string, tag = "1")]
    pub application_name: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Token {
    #[prost(string, tag = "1")]
    pub token: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UserRole {
    #[prost(string, tag = "1")]
    pub role: String,
    #[prost(string, tag = "2")]
    pub context: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CreateOrUpdateUserRequest {
    #[prost(string, tag = "1")]
    pub user_name: String,
    #[prost(string, tag = "2")]
    pub password: String,
    #[prost(message, repeated, tag = "3")]
    pub user_roles: Vec<UserRole>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DeleteUserRequest {
    #[prost(string, tag = "1")]
    pub user_name: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct EventProcessorIdentifier {
    #[prost(string, tag = "1")]
    pub processor_name: String,
    #[prost(string, tag = "2")]
    pub token_store_identifier: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct EventProcessorSegment {
    #[prost(int32, tag = "1")]
    pub id: i32,
    #[prost(int32, tag = "2")]
    pub one_part_of: i32,
    #[prost(int64, tag = "3")]
    pub token_position: i64,
    #[prost(bool, tag = "4")]
    pub is_replaying: bool,
    #[prost(bool, tag = "5")]
    pub is_in_error: bool,
    #[prost(string, tag = "6")]
    pub error: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct EventProcessorInstance {
    #[prost(string, tag = "1")]
    pub client_id: String,
    #[prost(bool, tag = "2")]
    pub is_running: bool,
    #[prost(int32, tag = "3")]
    pub max_capacity: i32,
    #[prost(message, repeated, tag = "4")]
    pub claimed_segment: Vec<EventProcessorSegment>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct EventProcessor {
    #[prost(message, optional, tag = "1")]
    pub identifier: Option<EventProcessorIdentifier>,
    #[prost(string, tag = "2")]
    pub mode: String,
    #[prost(bool, tag = "3")]
    pub is_streaming: bool,
    #[prost(message, repeated, tag = "4")]
    pub client_instance: Vec<EventProcessorInstance>,
    #[prost(string, tag = "5")]
    pub balancing_strategy: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MoveSegment {
    #[prost(message, optional, tag = "1")]
    pub event_processor: Option<EventProcessorIdentifier>,
    #[prost(int32, tag = "2")]
    pub segment: i32,
    #[prost(string, tag = "3")]
    pub target_client_id: String,
}

/// Outcome of an event processor admin action.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum AdminResult {
    Success = 0,
    Accepted = 1,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AdminActionResult {
    #[prost(enumeration = "AdminResult", tag = "1")]
    pub result: i32,
}

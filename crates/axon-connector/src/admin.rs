// ABOUTME: Admin channel: contexts, replication groups, applications, users and event processors.
// ABOUTME: Each operation is one call on the current transport; server statuses pass through unchanged.

use axon_grpc::{AdminCall, AdminReply};
use axon_proto::admin::{
    AdminActionResult, ApplicationId, ApplicationRequest, ContextOverview, CreateContextRequest,
    CreateOrUpdateUserRequest, CreateReplicationGroupRequest, DeleteContextRequest,
    DeleteReplicationGroupRequest, DeleteUserRequest, EventProcessor, EventProcessorIdentifier,
    MoveSegment, Token,
};
use tonic::Status;

use crate::channel::ChannelContext;
use crate::error::ConnectorError;

#[derive(Debug)]
pub struct AdminChannel {
    ctx: ChannelContext,
}

fn unexpected(name: &str, reply: &AdminReply) -> ConnectorError {
    ConnectorError::Status(Status::internal(format!(
        "unexpected reply to {name}: {reply:?}"
    )))
}

impl AdminChannel {
    pub(crate) fn new(ctx: ChannelContext) -> Self {
        Self { ctx }
    }

    async fn call(&self, call: AdminCall) -> Result<AdminReply, ConnectorError> {
        let transport = self.ctx.transport.require()?;
        let name = call.name();
        tracing::debug!(call = name, "admin call");
        transport.admin(call).await.map_err(|status| {
            tracing::debug!(call = name, status = %status, "admin call rejected");
            ConnectorError::Status(status)
        })
    }

    async fn done(&self, call: AdminCall) -> Result<(), ConnectorError> {
        let name = call.name();
        match self.call(call).await? {
            AdminReply::Done => Ok(()),
            other => Err(unexpected(name, &other)),
        }
    }

    async fn action(&self, call: AdminCall) -> Result<AdminActionResult, ConnectorError> {
        let name = call.name();
        match self.call(call).await? {
            AdminReply::Action(result) => Ok(result),
            other => Err(unexpected(name, &other)),
        }
    }

    pub async fn create_context(&self, request: CreateContextRequest) -> Result<(), ConnectorError> {
        self.done(AdminCall::CreateContext(request)).await
    }

    pub async fn delete_context(&self, request: DeleteContextRequest) -> Result<(), ConnectorError> {
        self.done(AdminCall::DeleteContext(request)).await
    }

    pub async fn get_all_contexts(&self) -> Result<Vec<ContextOverview>, ConnectorError> {
        match self.call(AdminCall::GetContexts).await? {
            AdminReply::Contexts(contexts) => Ok(contexts),
            other => Err(unexpected("GetContexts", &other)),
        }
    }

    pub async fn create_replication_group(
        &self,
        request: CreateReplicationGroupRequest,
    ) -> Result<(), ConnectorError> {
        self.done(AdminCall::CreateReplicationGroup(request)).await
    }

    pub async fn delete_replication_group(
        &self,
        request: DeleteReplicationGroupRequest,
    ) -> Result<(), ConnectorError> {
        self.done(AdminCall::DeleteReplicationGroup(request)).await
    }

    /// Create or update an application and return its access token.
    pub async fn create_or_update_application(
        &self,
        request: ApplicationRequest,
    ) -> Result<Token, ConnectorError> {
        match self.call(AdminCall::CreateOrUpdateApplication(request)).await? {
            AdminReply::Token(token) => Ok(token),
            other => Err(unexpected("CreateOrUpdateApplication", &other)),
        }
    }

    pub async fn delete_application(&self, application: ApplicationId) -> Result<(), ConnectorError> {
        self.done(AdminCall::DeleteApplication(application)).await
    }

    pub async fn create_or_update_user(
        &self,
        request: CreateOrUpdateUserRequest,
    ) -> Result<(), ConnectorError> {
        self.done(AdminCall::CreateOrUpdateUser(request)).await
    }

    pub async fn delete_user(&self, request: DeleteUserRequest) -> Result<(), ConnectorError> {
        self.done(AdminCall::DeleteUser(request)).await
    }

    pub async fn get_all_event_processors(&self) -> Result<Vec<EventProcessor>, ConnectorError> {
        match self.call(AdminCall::GetAllEventProcessors).await? {
            AdminReply::EventProcessors(processors) => Ok(processors),
            other => Err(unexpected("GetAllEventProcessors", &other)),
        }
    }

    pub async fn pause_event_processor(
        &self,
        processor: EventProcessorIdentifier,
    ) -> Result<AdminActionResult, ConnectorError> {
        self.action(AdminCall::PauseEventProcessor(processor)).await
    }

    pub async fn start_event_processor(
        &self,
        processor: EventProcessorIdentifier,
    ) -> Result<AdminActionResult, ConnectorError> {
        self.action(AdminCall::StartEventProcessor(processor)).await
    }

    pub async fn split_event_processor(
        &self,
        processor: EventProcessorIdentifier,
    ) -> Result<AdminActionResult, ConnectorError> {
        self.action(AdminCall::SplitEventProcessor(processor)).await
    }

    /// Merge two segments of a processor. Some servers answer `Cancelled`
    /// for an unknown processor; the status is returned as reported.
    pub async fn merge_event_processor(
        &self,
        processor: EventProcessorIdentifier,
    ) -> Result<AdminActionResult, ConnectorError> {
        self.action(AdminCall::MergeEventProcessor(processor)).await
    }

    pub async fn move_event_processor_segment(
        &self,
        request: MoveSegment,
    ) -> Result<AdminActionResult, ConnectorError> {
        self.action(AdminCall::MoveEventProcessorSegment(request)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ConnectionNotifier;
    use crate::testing::{context, FakeTransport};
    use axon_proto::admin::AdminResult;
    use std::sync::Arc;

    fn channel(transport: Option<Arc<FakeTransport>>) -> AdminChannel {
        AdminChannel::new(context(transport, ConnectionNotifier::detached()))
    }

    fn processor(name: &str) -> EventProcessorIdentifier {
        EventProcessorIdentifier {
            processor_name: name.to_string(),
            token_store_identifier: "store".to_string(),
        }
    }

    #[tokio::test]
    async fn test_create_context_issues_one_call() {
        let transport = FakeTransport::new();
        let admin = channel(Some(transport.clone()));

        admin
            .create_context(CreateContextRequest {
                context_name: "orders".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();

        let calls = transport.admin_calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert!(matches!(&calls[0], AdminCall::CreateContext(request) if request.context_name == "orders"));
    }

    #[tokio::test]
    async fn test_listing_returns_server_payload() {
        let transport = FakeTransport::new();
        transport.admin_replies.lock().unwrap().insert(
            "GetContexts",
            Ok(AdminReply::Contexts(vec![ContextOverview {
                name: "default".to_string(),
                ..Default::default()
            }])),
        );
        let admin = channel(Some(transport));

        let contexts = admin.get_all_contexts().await.unwrap();
        assert_eq!(contexts.len(), 1);
        assert_eq!(contexts[0].name, "default");
    }

    #[tokio::test]
    async fn test_application_token_is_returned() {
        let transport = FakeTransport::new();
        transport.admin_replies.lock().unwrap().insert(
            "CreateOrUpdateApplication",
            Ok(AdminReply::Token(Token {
                token: "secret".to_string(),
            })),
        );
        let admin = channel(Some(transport));

        let token = admin
            .create_or_update_application(ApplicationRequest::default())
            .await
            .unwrap();
        assert_eq!(token.token, "secret");
    }

    #[tokio::test]
    async fn test_processor_action_result() {
        let transport = FakeTransport::new();
        transport.admin_replies.lock().unwrap().insert(
            "PauseEventProcessor",
            Ok(AdminReply::Action(AdminActionResult {
                result: AdminResult::Accepted as i32,
            })),
        );
        let admin = channel(Some(transport));

        let result = admin.pause_event_processor(processor("projection")).await.unwrap();
        assert_eq!(result.result, AdminResult::Accepted as i32);
    }

    #[tokio::test]
    async fn test_server_status_passes_through_unchanged() {
        let transport = FakeTransport::new();
        {
            let mut replies = transport.admin_replies.lock().unwrap();
            replies.insert("MergeEventProcessor", Err(Status::cancelled("no such processor")));
            replies.insert("MoveEventProcessorSegment", Err(Status::not_found("no such processor")));
            replies.insert("DeleteUser", Err(Status::permission_denied("admin only")));
        }
        let admin = channel(Some(transport));

        let merged = admin.merge_event_processor(processor("missing")).await;
        assert!(matches!(merged, Err(ConnectorError::Status(s)) if s.code() == tonic::Code::Cancelled));

        let moved = admin
            .move_event_processor_segment(MoveSegment {
                event_processor: Some(processor("missing")),
                segment: 0,
                target_client_id: "client-2".to_string(),
            })
            .await;
        assert!(matches!(moved, Err(ConnectorError::Status(s)) if s.code() == tonic::Code::NotFound));

        let deleted = admin.delete_user(DeleteUserRequest::default()).await;
        assert!(matches!(deleted, Err(ConnectorError::Status(s)) if s.code() == tonic::Code::PermissionDenied));
    }

    #[tokio::test]
    async fn test_unexpected_reply_is_internal_error() {
        let transport = FakeTransport::new();
        let admin = channel(Some(transport));

        // The fake answers `Done` to calls it has no scripted reply for.
        let result = admin.get_all_event_processors().await;
        assert!(matches!(result, Err(ConnectorError::Status(s)) if s.code() == tonic::Code::Internal));
    }

    #[tokio::test]
    async fn test_without_connection_fails_immediately() {
        let admin = channel(None);
        let result = admin.delete_context(DeleteContextRequest::default()).await;
        assert!(matches!(result, Err(ConnectorError::NotConnected(_))));
    }
}

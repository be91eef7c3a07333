// ABOUTME: Translates handler replies into query provider stream messages.
// ABOUTME: Covers plain queries, subscription initial results and subscription updates.

use axon_proto::query::{
    query_provider_outbound, subscription_query_response, QueryComplete, QueryProviderOutbound,
    QueryResponse, QueryUpdate, QueryUpdateComplete, QueryUpdateCompleteExceptionally,
    SubscriptionQueryResponse,
};
use axon_proto::ErrorMessage;

use crate::ids::{ClientIdentity, IdGenerator};

/// What a query handler produced.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryReply {
    Send(QueryResponse),
    Complete,
    CompleteWithError(ErrorMessage),
}

/// Which kind of request the replies answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryReplyTranslator {
    Query {
        request_identifier: String,
    },
    SubscriptionQuery {
        request_identifier: String,
        subscription_identifier: String,
    },
}

impl QueryReplyTranslator {
    pub fn for_query(request_identifier: impl Into<String>) -> Self {
        QueryReplyTranslator::Query {
            request_identifier: request_identifier.into(),
        }
    }

    pub fn for_subscription_query(
        request_identifier: impl Into<String>,
        subscription_identifier: impl Into<String>,
    ) -> Self {
        QueryReplyTranslator::SubscriptionQuery {
            request_identifier: request_identifier.into(),
            subscription_identifier: subscription_identifier.into(),
        }
    }

    pub fn request_identifier(&self) -> &str {
        match self {
            QueryReplyTranslator::Query { request_identifier }
            | QueryReplyTranslator::SubscriptionQuery {
                request_identifier, ..
            } => request_identifier,
        }
    }

    pub fn translate(&self, reply: QueryReply, ids: &IdGenerator) -> Vec<QueryProviderOutbound> {
        match reply {
            QueryReply::Send(response) => vec![self.response(response, ids)],
            QueryReply::Complete => vec![self.complete(ids)],
            QueryReply::CompleteWithError(error) => {
                let response = QueryResponse {
                    error_code: error.error_code.clone(),
                    error_message: Some(error),
                    ..Default::default()
                };
                vec![self.response(response, ids), self.complete(ids)]
            }
        }
    }

    fn response(&self, mut response: QueryResponse, ids: &IdGenerator) -> QueryProviderOutbound {
        if response.message_identifier.is_empty() {
            response.message_identifier = ids.next_id();
        }
        response.request_identifier = self.request_identifier().to_string();

        match self {
            QueryReplyTranslator::Query { .. } => QueryProviderOutbound {
                instruction_id: response.message_identifier.clone(),
                request: Some(query_provider_outbound::Request::QueryResponse(response)),
            },
            QueryReplyTranslator::SubscriptionQuery {
                subscription_identifier,
                ..
            } => QueryProviderOutbound {
                instruction_id: ids.next_id(),
                request: Some(query_provider_outbound::Request::SubscriptionQueryResponse(
                    SubscriptionQueryResponse {
                        message_identifier: response.message_identifier.clone(),
                        subscription_identifier: subscription_identifier.clone(),
                        response: Some(subscription_query_response::Response::InitialResult(
                            response,
                        )),
                    },
                )),
            },
        }
    }

    fn complete(&self, ids: &IdGenerator) -> QueryProviderOutbound {
        let instruction_id = ids.next_id();
        QueryProviderOutbound {
            request: Some(query_provider_outbound::Request::QueryComplete(QueryComplete {
                message_id: instruction_id.clone(),
                request_id: self.request_identifier().to_string(),
            })),
            instruction_id,
        }
    }
}

/// Wraps updates of one subscription query.
#[derive(Debug, Clone)]
pub struct SubscriptionUpdateTranslator {
    identity: ClientIdentity,
    subscription_identifier: String,
}

impl SubscriptionUpdateTranslator {
    pub fn new(identity: ClientIdentity, subscription_identifier: impl Into<String>) -> Self {
        Self {
            identity,
            subscription_identifier: subscription_identifier.into(),
        }
    }

    pub fn update(&self, mut update: QueryUpdate, ids: &IdGenerator) -> QueryProviderOutbound {
        if update.message_identifier.is_empty() {
            update.message_identifier = ids.next_id();
        }
        if update.client_id.is_empty() {
            update.client_id = self.identity.client_instance_id.to_string();
            update.component_name = self.identity.component_name.to_string();
        }
        self.wrap(
            update.message_identifier.clone(),
            subscription_query_response::Response::Update(update),
        )
    }

    pub fn complete(&self, ids: &IdGenerator) -> QueryProviderOutbound {
        self.wrap(
            ids.next_id(),
            subscription_query_response::Response::Complete(QueryUpdateComplete {
                client_id: self.identity.client_instance_id.to_string(),
                component_name: self.identity.component_name.to_string(),
            }),
        )
    }

    pub fn complete_with_error(&self, error: ErrorMessage, ids: &IdGenerator) -> QueryProviderOutbound {
        self.wrap(
            ids.next_id(),
            subscription_query_response::Response::CompleteExceptionally(
                QueryUpdateCompleteExceptionally {
                    client_id: self.identity.client_instance_id.to_string(),
                    component_name: self.identity.component_name.to_string(),
                    error_code: error.error_code.clone(),
                    error_message: Some(error),
                },
            ),
        )
    }

    fn wrap(
        &self,
        message_identifier: String,
        response: subscription_query_response::Response,
    ) -> QueryProviderOutbound {
        QueryProviderOutbound {
            request: Some(query_provider_outbound::Request::SubscriptionQueryResponse(
                SubscriptionQueryResponse {
                    message_identifier,
                    subscription_identifier: self.subscription_identifier.clone(),
                    response: Some(response),
                },
            )),
            instruction_id: String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::{ClientInstanceId, ComponentName};
    use query_provider_outbound::Request;

    fn error() -> ErrorMessage {
        ErrorMessage {
            message: "boom".to_string(),
            location: "Client".to_string(),
            details: Vec::new(),
            error_code: "AXONIQ-5001".to_string(),
        }
    }

    #[test]
    fn test_send_stamps_request_identifier() {
        let ids = IdGenerator::sequential("id");
        let translator = QueryReplyTranslator::for_query("request-1");
        let response = QueryResponse {
            message_identifier: "response-1".to_string(),
            ..Default::default()
        };

        let messages = translator.translate(QueryReply::Send(response), &ids);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].instruction_id, "response-1");
        match &messages[0].request {
            Some(Request::QueryResponse(response)) => {
                assert_eq!(response.message_identifier, "response-1");
                assert_eq!(response.request_identifier, "request-1");
            }
            other => panic!("unexpected request {other:?}"),
        }
    }

    #[test]
    fn test_send_generates_missing_message_identifier() {
        let ids = IdGenerator::sequential("id");
        let translator = QueryReplyTranslator::for_query("request-1");

        let messages = translator.translate(QueryReply::Send(QueryResponse::default()), &ids);
        match &messages[0].request {
            Some(Request::QueryResponse(response)) => {
                assert_eq!(response.message_identifier, "id-1");
            }
            other => panic!("unexpected request {other:?}"),
        }
    }

    #[test]
    fn test_subscription_send_uses_fresh_instruction_id() {
        let ids = IdGenerator::sequential("id");
        let translator = QueryReplyTranslator::for_subscription_query("request-1", "sub-1");
        let response = QueryResponse {
            message_identifier: "response-1".to_string(),
            ..Default::default()
        };

        let messages = translator.translate(QueryReply::Send(response), &ids);
        assert_eq!(messages[0].instruction_id, "id-1");
        match &messages[0].request {
            Some(Request::SubscriptionQueryResponse(wrapped)) => {
                assert_eq!(wrapped.subscription_identifier, "sub-1");
                assert_eq!(wrapped.message_identifier, "response-1");
                match &wrapped.response {
                    Some(subscription_query_response::Response::InitialResult(inner)) => {
                        assert_eq!(inner.request_identifier, "request-1");
                    }
                    other => panic!("unexpected response {other:?}"),
                }
            }
            other => panic!("unexpected request {other:?}"),
        }
    }

    #[test]
    fn test_complete_has_its_own_message_id() {
        let ids = IdGenerator::sequential("id");
        let translator = QueryReplyTranslator::for_query("request-1");

        let messages = translator.translate(QueryReply::Complete, &ids);
        assert_eq!(messages.len(), 1);
        match &messages[0].request {
            Some(Request::QueryComplete(complete)) => {
                assert_eq!(complete.request_id, "request-1");
                assert_eq!(complete.message_id, "id-1");
            }
            other => panic!("unexpected request {other:?}"),
        }
    }

    #[test]
    fn test_complete_with_error_yields_error_then_complete() {
        let ids = IdGenerator::sequential("id");
        for translator in [
            QueryReplyTranslator::for_query("request-1"),
            QueryReplyTranslator::for_subscription_query("request-1", "sub-1"),
        ] {
            let messages = translator.translate(QueryReply::CompleteWithError(error()), &ids);
            assert_eq!(messages.len(), 2);

            let response = match &messages[0].request {
                Some(Request::QueryResponse(response)) => response.clone(),
                Some(Request::SubscriptionQueryResponse(SubscriptionQueryResponse {
                    response: Some(subscription_query_response::Response::InitialResult(response)),
                    ..
                })) => response.clone(),
                other => panic!("unexpected request {other:?}"),
            };
            assert_eq!(response.error_code, "AXONIQ-5001");
            assert_eq!(response.request_identifier, "request-1");
            assert_eq!(response.error_message, Some(error()));

            match &messages[1].request {
                Some(Request::QueryComplete(complete)) => {
                    assert_eq!(complete.request_id, "request-1");
                }
                other => panic!("unexpected request {other:?}"),
            }
        }
    }

    #[test]
    fn test_update_translation() {
        let ids = IdGenerator::sequential("id");
        let identity = ClientIdentity::new(
            ComponentName::new("orders").unwrap(),
            ClientInstanceId::new("client-1").unwrap(),
        );
        let translator = SubscriptionUpdateTranslator::new(identity, "sub-1");

        let update = translator.update(QueryUpdate::default(), &ids);
        match update.request {
            Some(Request::SubscriptionQueryResponse(wrapped)) => {
                assert_eq!(wrapped.subscription_identifier, "sub-1");
                assert_eq!(wrapped.message_identifier, "id-1");
                match wrapped.response {
                    Some(subscription_query_response::Response::Update(update)) => {
                        assert_eq!(update.client_id, "client-1");
                        assert_eq!(update.component_name, "orders");
                    }
                    other => panic!("unexpected response {other:?}"),
                }
            }
            other => panic!("unexpected request {other:?}"),
        }

        let failed = translator.complete_with_error(error(), &ids);
        assert!(matches!(
            failed.request,
            Some(Request::SubscriptionQueryResponse(SubscriptionQueryResponse {
                response: Some(subscription_query_response::Response::CompleteExceptionally(_)),
                ..
            }))
        ));
    }
}

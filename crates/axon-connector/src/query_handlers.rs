// ABOUTME: Client-side query handler registry and subscription bookkeeping.
// ABOUTME: Fans queries out to every handler of a name and correlates subscribe/unsubscribe acks.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use axon_proto::query::{query_provider_outbound, QueryProviderOutbound, QuerySubscription};
use axon_proto::InstructionAck;
use tokio::time::Instant;

use crate::clock::Clock;
use crate::error::{ConnectorError, ErrorCategory};
use crate::handlers::QueryHandler;
use crate::ids::{ClientIdentity, IdGenerator, InstructionId, QueryDefinition, QueryName, RegistrationId};
use crate::sync::CountdownCompletionSource;

#[derive(Clone)]
struct RegisteredQuery {
    id: RegistrationId,
    definition: QueryDefinition,
    handler: Arc<dyn QueryHandler>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Subscribe,
    Unsubscribe,
}

impl Direction {
    fn label(self) -> &'static str {
        match self {
            Direction::Subscribe => "subscribe",
            Direction::Unsubscribe => "unsubscribe",
        }
    }
}

#[derive(Clone)]
struct PendingInstruction {
    definition: QueryDefinition,
    direction: Direction,
    since: Instant,
}

/// Query handlers of one client, owned by the query channel actor.
#[derive(Clone)]
pub struct QueryHandlerCollection {
    identity: ClientIdentity,
    clock: Clock,
    ids: IdGenerator,
    // Registration order is the fan-out order.
    registered: Vec<RegisteredQuery>,
    subscribed: HashMap<QueryDefinition, usize>,
    pending: HashMap<InstructionId, PendingInstruction>,
    subscribe_completions: HashMap<QueryDefinition, Vec<CountdownCompletionSource>>,
    unsubscribe_completions: HashMap<QueryDefinition, Vec<CountdownCompletionSource>>,
}

impl QueryHandlerCollection {
    pub fn new(identity: ClientIdentity, clock: Clock, ids: IdGenerator) -> Self {
        Self {
            identity,
            clock,
            ids,
            registered: Vec::new(),
            subscribed: HashMap::new(),
            pending: HashMap::new(),
            subscribe_completions: HashMap::new(),
            unsubscribe_completions: HashMap::new(),
        }
    }

    pub fn has_registered_queries(&self) -> bool {
        !self.registered.is_empty()
    }

    pub fn registered_query_count(&self) -> usize {
        self.registered.len()
    }

    /// Every handler registered for `name`, in registration order.
    pub fn resolve_query_handlers(&self, name: &QueryName) -> Vec<Arc<dyn QueryHandler>> {
        self.registered
            .iter()
            .filter(|query| query.definition.query_name == *name)
            .map(|query| query.handler.clone())
            .collect()
    }

    /// Registering an id twice keeps the first registration.
    pub fn register_query_handler(
        &mut self,
        id: RegistrationId,
        definition: QueryDefinition,
        handler: Arc<dyn QueryHandler>,
    ) {
        if self.registered.iter().any(|query| query.id == id) {
            return;
        }
        self.registered.push(RegisteredQuery {
            id,
            definition,
            handler,
        });
    }

    /// Remove a handler, returning the definition it served.
    pub fn unregister_query_handler(&mut self, id: &RegistrationId) -> Option<QueryDefinition> {
        let index = self.registered.iter().position(|query| query.id == *id)?;
        Some(self.registered.remove(index).definition)
    }

    pub fn register_subscribe_completion(
        &mut self,
        definition: QueryDefinition,
        completion: CountdownCompletionSource,
    ) {
        self.subscribe_completions
            .entry(definition)
            .or_default()
            .push(completion);
    }

    pub fn register_unsubscribe_completion(
        &mut self,
        definition: QueryDefinition,
        completion: CountdownCompletionSource,
    ) {
        self.unsubscribe_completions
            .entry(definition)
            .or_default()
            .push(completion);
    }

    /// A subscribe instruction the first time `definition` gains a handler.
    pub fn try_begin_subscribe_to_query_instruction(
        &mut self,
        definition: &QueryDefinition,
    ) -> Option<QueryProviderOutbound> {
        let count = self.subscribed.entry(definition.clone()).or_insert(0);
        *count += 1;
        if *count > 1 {
            return None;
        }
        Some(self.begin(definition.clone(), Direction::Subscribe))
    }

    /// An unsubscribe instruction once `definition` loses its last handler.
    pub fn try_begin_unsubscribe_from_query_instruction(
        &mut self,
        definition: &QueryDefinition,
    ) -> Option<QueryProviderOutbound> {
        let count = self.subscribed.get_mut(definition)?;
        if *count > 1 {
            *count -= 1;
            return None;
        }
        self.subscribed.remove(definition);
        Some(self.begin(definition.clone(), Direction::Unsubscribe))
    }

    /// One subscribe instruction per distinct registered definition.
    pub fn begin_subscribe_to_all_instructions(&mut self) -> Vec<QueryProviderOutbound> {
        self.begin_all(Direction::Subscribe)
    }

    pub fn begin_unsubscribe_from_all_instructions(&mut self) -> Vec<QueryProviderOutbound> {
        self.begin_all(Direction::Unsubscribe)
    }

    /// Complete the subscribe instruction `ack` answers. False for unknown ids.
    pub fn try_complete_subscribe_to_query_instruction(&mut self, ack: &InstructionAck) -> bool {
        self.try_complete(ack, Direction::Subscribe)
    }

    pub fn try_complete_unsubscribe_from_query_instruction(&mut self, ack: &InstructionAck) -> bool {
        self.try_complete(ack, Direction::Unsubscribe)
    }

    /// Fail instructions that have waited `max_age` or longer for an acknowledgement.
    pub fn purge(&mut self, max_age: Duration) {
        let now = self.clock.now();
        let overdue: Vec<InstructionId> = self
            .pending
            .iter()
            .filter(|(_, pending)| now.saturating_duration_since(pending.since) >= max_age)
            .map(|(id, _)| id.clone())
            .collect();

        for instruction_id in overdue {
            let Some(pending) = self.pending.remove(&instruction_id) else {
                continue;
            };
            tracing::warn!(
                %instruction_id,
                query = %pending.definition.query_name,
                "{} instruction was not acknowledged in time",
                pending.direction.label()
            );
            let error = ConnectorError::axon_server(
                self.identity.client_instance_id.as_str(),
                ErrorCategory::Other,
                format!(
                    "The {} instruction with identifier {} was not acknowledged in time.",
                    pending.direction.label(),
                    instruction_id
                ),
            );
            for completion in self.take_completions(&pending.definition, pending.direction) {
                completion.fault(error.clone());
            }
        }
    }

    /// Drop instruction correlations of a stream that is gone. Completions stay
    /// registered, so acknowledgements on the next stream still resolve them.
    pub fn forget_pending_instructions(&mut self) {
        self.pending.clear();
    }

    /// Whether a subscribe instruction for `definition` awaits its acknowledgement.
    pub fn has_pending_subscribe(&self, definition: &QueryDefinition) -> bool {
        self.pending.values().any(|pending| {
            pending.direction == Direction::Subscribe && pending.definition == *definition
        })
    }

    pub fn pending_instruction_count(&self) -> usize {
        self.pending.len()
    }

    fn begin_all(&mut self, direction: Direction) -> Vec<QueryProviderOutbound> {
        let mut seen = HashSet::new();
        let definitions: Vec<QueryDefinition> = self
            .registered
            .iter()
            .filter(|query| seen.insert(query.definition.clone()))
            .map(|query| query.definition.clone())
            .collect();
        definitions
            .into_iter()
            .map(|definition| self.begin(definition, direction))
            .collect()
    }

    fn begin(&mut self, definition: QueryDefinition, direction: Direction) -> QueryProviderOutbound {
        let instruction_id = self.ids.instruction_id();
        let subscription = QuerySubscription {
            message_id: instruction_id.to_string(),
            query: definition.query_name.to_string(),
            result_name: definition.result_type.clone(),
            component_name: self.identity.component_name.to_string(),
            client_id: self.identity.client_instance_id.to_string(),
            nr_of_handlers: 0,
        };
        let request = match direction {
            Direction::Subscribe => query_provider_outbound::Request::Subscribe(subscription),
            Direction::Unsubscribe => query_provider_outbound::Request::Unsubscribe(subscription),
        };
        self.pending.insert(
            instruction_id.clone(),
            PendingInstruction {
                definition,
                direction,
                since: self.clock.now(),
            },
        );
        QueryProviderOutbound {
            request: Some(request),
            instruction_id: instruction_id.to_string(),
        }
    }

    fn try_complete(&mut self, ack: &InstructionAck, direction: Direction) -> bool {
        let Ok(instruction_id) = InstructionId::new(ack.instruction_id.clone()) else {
            return false;
        };
        match self.pending.get(&instruction_id) {
            Some(pending) if pending.direction == direction => {}
            _ => return false,
        }
        let Some(pending) = self.pending.remove(&instruction_id) else {
            return false;
        };

        let completions = self.take_completions(&pending.definition, direction);
        if ack.success {
            for completion in completions {
                completion.try_signal_success();
            }
        } else {
            let error = ConnectorError::from_ack(ack, self.identity.client_instance_id.as_str());
            for completion in completions {
                completion.fault(error.clone());
            }
        }
        true
    }

    fn take_completions(
        &mut self,
        definition: &QueryDefinition,
        direction: Direction,
    ) -> Vec<CountdownCompletionSource> {
        let completions = match direction {
            Direction::Subscribe => &mut self.subscribe_completions,
            Direction::Unsubscribe => &mut self.unsubscribe_completions,
        };
        completions.remove(definition).unwrap_or_default()
    }
}

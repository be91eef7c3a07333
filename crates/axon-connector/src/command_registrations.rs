// ABOUTME: Client-side command subscription state.
// ABOUTME: Tracks handlers, in-flight subscribe/unsubscribe instructions, supersession and acks.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use axon_proto::InstructionAck;

use crate::error::ConnectorError;
use crate::handlers::CommandHandler;
use crate::ids::{ClientInstanceId, CommandName, IdGenerator, InstructionId, LoadFactor, RegistrationId, SubscriptionId};
use crate::sync::CountdownCompletionSource;

#[derive(Clone)]
pub struct RegisteredCommandHandler {
    pub registration_id: RegistrationId,
    pub load_factor: LoadFactor,
    pub handler: Arc<dyn CommandHandler>,
}

impl fmt::Debug for RegisteredCommandHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredCommandHandler")
            .field("registration_id", &self.registration_id)
            .field("load_factor", &self.load_factor)
            .finish_non_exhaustive()
    }
}

/// One (handler, command name) subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisteredCommand {
    pub handler_id: RegistrationId,
    pub subscription_id: SubscriptionId,
    pub command_name: CommandName,
}

/// A subscription that must be sent (again) after a fresh stream is opened.
#[derive(Debug, Clone)]
pub struct Resubscription {
    pub instruction_id: InstructionId,
    pub command_name: CommandName,
    pub load_factor: LoadFactor,
}

/// Command handler subscription state, owned by the command channel actor.
///
/// For each command name at most one subscription is active. A newer
/// subscription for the same name supersedes older ones as soon as it is
/// created, so an older acknowledgement arriving late never overrides it.
/// An acknowledged subscription stays active until a newer one is acknowledged.
#[derive(Clone)]
pub struct CommandRegistrations {
    client: ClientInstanceId,
    ids: IdGenerator,
    handlers: HashMap<RegistrationId, RegisteredCommandHandler>,
    subscriptions: HashMap<SubscriptionId, RegisteredCommand>,
    subscribe_completions: HashMap<RegistrationId, CountdownCompletionSource>,
    unsubscribe_completions: HashMap<RegistrationId, CountdownCompletionSource>,
    active_registrations: HashMap<CommandName, SubscriptionId>,
    active_handlers: HashMap<CommandName, Arc<dyn CommandHandler>>,
    subscribe_instructions: HashMap<InstructionId, SubscriptionId>,
    unsubscribe_instructions: HashMap<InstructionId, RegisteredCommand>,
    // Re-sent after a reconnect: their acks activate but do not count toward completions.
    resubscribe_instructions: HashSet<InstructionId>,
    superseded: HashSet<SubscriptionId>,
}

impl fmt::Debug for CommandRegistrations {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandRegistrations")
            .field("client", &self.client)
            .field("handlers", &self.handlers)
            .field("subscriptions", &self.subscriptions)
            .field("active_registrations", &self.active_registrations)
            .field("subscribe_instructions", &self.subscribe_instructions)
            .field("unsubscribe_instructions", &self.unsubscribe_instructions)
            .field("superseded", &self.superseded)
            .finish_non_exhaustive()
    }
}

impl CommandRegistrations {
    pub fn new(client: ClientInstanceId, ids: IdGenerator) -> Self {
        Self {
            client,
            ids,
            handlers: HashMap::new(),
            subscriptions: HashMap::new(),
            subscribe_completions: HashMap::new(),
            unsubscribe_completions: HashMap::new(),
            active_registrations: HashMap::new(),
            active_handlers: HashMap::new(),
            subscribe_instructions: HashMap::new(),
            unsubscribe_instructions: HashMap::new(),
            resubscribe_instructions: HashSet::new(),
            superseded: HashSet::new(),
        }
    }

    /// Store a handler. A second call with the same id is a no-op.
    pub fn register_command_handler(
        &mut self,
        handler_id: RegistrationId,
        completion: CountdownCompletionSource,
        load_factor: LoadFactor,
        handler: Arc<dyn CommandHandler>,
    ) {
        if self.handlers.contains_key(&handler_id) {
            return;
        }
        self.subscribe_completions
            .entry(handler_id.clone())
            .or_insert(completion);
        self.handlers.insert(
            handler_id.clone(),
            RegisteredCommandHandler {
                registration_id: handler_id,
                load_factor,
                handler,
            },
        );
    }

    /// Record a subscription and return the instruction id to send it with.
    pub fn subscribe_to_command(
        &mut self,
        handler_id: RegistrationId,
        subscription_id: SubscriptionId,
        command_name: CommandName,
    ) -> InstructionId {
        self.subscriptions
            .entry(subscription_id.clone())
            .or_insert_with(|| RegisteredCommand {
                handler_id,
                subscription_id: subscription_id.clone(),
                command_name: command_name.clone(),
            });

        let pending: HashSet<&SubscriptionId> = self.subscribe_instructions.values().collect();
        let earlier: Vec<SubscriptionId> = self
            .subscriptions
            .values()
            .filter(|other| {
                other.subscription_id != subscription_id
                    && other.command_name == command_name
                    && pending.contains(&other.subscription_id)
            })
            .map(|other| other.subscription_id.clone())
            .collect();
        self.superseded.extend(earlier);

        let instruction_id = self.ids.instruction_id();
        self.subscribe_instructions
            .insert(instruction_id.clone(), subscription_id);
        instruction_id
    }

    /// Apply an acknowledgement. Unknown instruction ids are ignored.
    pub fn acknowledge(&mut self, ack: &InstructionAck) {
        let Ok(instruction_id) = InstructionId::new(ack.instruction_id.clone()) else {
            return;
        };
        if let Some(subscription_id) = self.subscribe_instructions.remove(&instruction_id) {
            let counted = !self.resubscribe_instructions.remove(&instruction_id);
            self.acknowledge_subscribe(ack, subscription_id, counted);
        } else if let Some(subscription) = self.unsubscribe_instructions.remove(&instruction_id) {
            self.subscriptions.remove(&subscription.subscription_id);
            self.superseded.remove(&subscription.subscription_id);
            signal(
                &mut self.unsubscribe_completions,
                &subscription.handler_id,
                ack,
                &self.client,
            );
        }
    }

    fn acknowledge_subscribe(&mut self, ack: &InstructionAck, subscription_id: SubscriptionId, counted: bool) {
        let Some(subscription) = self.subscriptions.get(&subscription_id).cloned() else {
            return;
        };
        if counted {
            signal(
                &mut self.subscribe_completions,
                &subscription.handler_id,
                ack,
                &self.client,
            );
        }

        if self.superseded.remove(&subscription_id) {
            self.subscriptions.remove(&subscription_id);
            return;
        }
        if !ack.success {
            return;
        }
        let Some(handler) = self.handlers.get(&subscription.handler_id) else {
            return;
        };

        let previous = self
            .active_registrations
            .insert(subscription.command_name.clone(), subscription_id.clone());
        self.active_handlers
            .insert(subscription.command_name.clone(), handler.handler.clone());
        if let Some(previous) = previous.filter(|previous| *previous != subscription_id) {
            self.subscriptions.remove(&previous);
            self.superseded.remove(&previous);
        }
    }

    /// Forget a handler. Its subscriptions stay until their unsubscribes are acknowledged.
    pub fn unregister_command_handler(
        &mut self,
        handler_id: &RegistrationId,
        completion: CountdownCompletionSource,
    ) {
        if self.handlers.remove(handler_id).is_some() && !completion.is_completed() {
            self.unsubscribe_completions
                .entry(handler_id.clone())
                .or_insert(completion);
        }
    }

    /// Instruction id for unsubscribing, or `None` if the subscription is gone.
    pub fn unsubscribe_from_command(&mut self, subscription_id: &SubscriptionId) -> Option<InstructionId> {
        let subscription = self.subscriptions.get(subscription_id)?.clone();
        let name = &subscription.command_name;

        let active = self.active_registrations.get(name) == Some(subscription_id);
        let pending = self
            .subscribe_instructions
            .values()
            .any(|pending| pending == subscription_id);
        if !active && !pending {
            return None;
        }
        if active {
            self.active_registrations.remove(name);
            self.active_handlers.remove(name);
        }
        if pending {
            // Its subscribe ack must not activate it any more.
            self.superseded.insert(subscription_id.clone());
        }

        let instruction_id = self.ids.instruction_id();
        self.unsubscribe_instructions
            .insert(instruction_id.clone(), subscription);
        Some(instruction_id)
    }

    /// Reset instruction bookkeeping for a fresh stream and return what must be re-sent.
    ///
    /// Pending unsubscribes complete successfully and superseded pending
    /// subscriptions are dropped, since the new stream holds no server-side state.
    /// An active subscription with a newer pending one for the same name is
    /// dropped too: only the newer one is sent again.
    pub fn rebase(&mut self) -> Vec<Resubscription> {
        let completed = InstructionAck {
            success: true,
            ..Default::default()
        };
        for (_, subscription) in std::mem::take(&mut self.unsubscribe_instructions) {
            self.subscriptions.remove(&subscription.subscription_id);
            signal(
                &mut self.unsubscribe_completions,
                &subscription.handler_id,
                &completed,
                &self.client,
            );
        }

        let pending: HashSet<SubscriptionId> = std::mem::take(&mut self.subscribe_instructions)
            .into_values()
            .collect();
        self.resubscribe_instructions.clear();
        for subscription_id in std::mem::take(&mut self.superseded) {
            if let Some(subscription) = self.subscriptions.remove(&subscription_id) {
                if pending.contains(&subscription_id) {
                    signal(
                        &mut self.subscribe_completions,
                        &subscription.handler_id,
                        &completed,
                        &self.client,
                    );
                }
            }
        }

        let replaced: Vec<(CommandName, SubscriptionId)> = self
            .active_registrations
            .iter()
            .filter(|(name, active)| {
                pending.iter().any(|subscription_id| {
                    *subscription_id != **active
                        && self
                            .subscriptions
                            .get(subscription_id)
                            .is_some_and(|subscription| subscription.command_name == **name)
                })
            })
            .map(|(name, active)| (name.clone(), active.clone()))
            .collect();
        for (name, active) in replaced {
            self.active_registrations.remove(&name);
            self.active_handlers.remove(&name);
            self.subscriptions.remove(&active);
        }

        let live: Vec<RegisteredCommand> = self
            .subscriptions
            .values()
            .filter(|subscription| {
                pending.contains(&subscription.subscription_id)
                    || self.active_registrations.get(&subscription.command_name)
                        == Some(&subscription.subscription_id)
            })
            .cloned()
            .collect();

        live.into_iter()
            .filter_map(|subscription| {
                let load_factor = self.handlers.get(&subscription.handler_id)?.load_factor;
                let instruction_id = self.ids.instruction_id();
                if !pending.contains(&subscription.subscription_id) {
                    self.resubscribe_instructions.insert(instruction_id.clone());
                }
                self.subscribe_instructions
                    .insert(instruction_id.clone(), subscription.subscription_id.clone());
                Some(Resubscription {
                    instruction_id,
                    command_name: subscription.command_name,
                    load_factor,
                })
            })
            .collect()
    }

    pub fn handler_for(&self, command_name: &CommandName) -> Option<Arc<dyn CommandHandler>> {
        self.active_handlers.get(command_name).cloned()
    }

    pub fn active_registrations(&self) -> &HashMap<CommandName, SubscriptionId> {
        &self.active_registrations
    }

    pub fn superseded_registrations(&self) -> &HashSet<SubscriptionId> {
        &self.superseded
    }

    pub fn all_subscriptions(&self) -> &HashMap<SubscriptionId, RegisteredCommand> {
        &self.subscriptions
    }

    pub fn subscribe_instructions(&self) -> &HashMap<InstructionId, SubscriptionId> {
        &self.subscribe_instructions
    }

    pub fn unsubscribe_instructions(&self) -> &HashMap<InstructionId, RegisteredCommand> {
        &self.unsubscribe_instructions
    }

    pub fn is_handler_registered(&self, handler_id: &RegistrationId) -> bool {
        self.handlers.contains_key(handler_id)
    }
}

fn signal(
    completions: &mut HashMap<RegistrationId, CountdownCompletionSource>,
    handler_id: &RegistrationId,
    ack: &InstructionAck,
    client: &ClientInstanceId,
) {
    let Some(completion) = completions.get(handler_id) else {
        return;
    };
    let completed = if ack.success {
        completion.try_signal_success()
    } else {
        completion.try_signal_failure(ConnectorError::from_ack(ack, client.as_str()))
    };
    if completed {
        completions.remove(handler_id);
    }
}

// ABOUTME: What every channel of a connection shares: identity, ids, timers and the transport slot.
// ABOUTME: Also the callback channels use to ask their connection to reconnect.

use std::fmt;
use std::sync::Arc;

use crate::backoff::BackoffPolicyOptions;
use crate::clock::Clock;
use crate::ids::{ClientIdentity, Context, IdGenerator};
use crate::routing::TransportSlot;
use crate::scheduler::Scheduler;

/// Published view of a stream-backed channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChannelStatus {
    pub connected: bool,
}

/// Lets a channel ask its connection to reconnect. Readiness follows the
/// channels' status watches instead.
#[derive(Clone)]
pub(crate) struct ConnectionNotifier {
    reconnect: Arc<dyn Fn(String) + Send + Sync>,
}

impl fmt::Debug for ConnectionNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionNotifier").finish_non_exhaustive()
    }
}

impl ConnectionNotifier {
    pub(crate) fn new(reconnect: impl Fn(String) + Send + Sync + 'static) -> Self {
        Self {
            reconnect: Arc::new(reconnect),
        }
    }

    /// A notifier that goes nowhere, for channels tested on their own.
    #[cfg(test)]
    pub(crate) fn detached() -> Self {
        Self::new(|_| {})
    }

    pub(crate) fn reconnect(&self, reason: impl Into<String>) {
        (self.reconnect)(reason.into());
    }
}

#[derive(Debug, Clone)]
pub(crate) struct ChannelContext {
    pub(crate) context: Context,
    pub(crate) identity: ClientIdentity,
    pub(crate) ids: IdGenerator,
    pub(crate) clock: Clock,
    pub(crate) scheduler: Scheduler,
    pub(crate) transport: Arc<TransportSlot>,
    pub(crate) backoff: BackoffPolicyOptions,
    pub(crate) notifier: ConnectionNotifier,
}

impl ChannelContext {
    pub(crate) fn client_id(&self) -> &str {
        self.identity.client_instance_id.as_str()
    }

    pub(crate) fn component_name(&self) -> &str {
        self.identity.component_name.as_str()
    }
}

// ABOUTME: In-flight queries this client is answering.
// ABOUTME: Routes server cancellations and permit grants to the forwarder of each query.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::error::ConnectorError;
use crate::ids::InstructionId;

/// Accepts permit grants from the server.
pub trait FlowControl: Send + Sync {
    fn request(&self, count: i64);
}

/// Permits for a streaming query reply. Responses wait for a permit each.
#[derive(Debug, Clone)]
pub struct StreamingPermits {
    semaphore: Arc<Semaphore>,
}

impl Default for StreamingPermits {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamingPermits {
    pub fn new() -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(0)),
        }
    }

    /// Wait for one permit and consume it.
    pub async fn acquire(&self, cancellation: &CancellationToken) -> Result<(), ConnectorError> {
        tokio::select! {
            biased;
            _ = cancellation.cancelled() => Err(ConnectorError::Cancelled),
            permit = self.semaphore.acquire() => {
                permit
                    .map(|permit| permit.forget())
                    .map_err(|_| ConnectorError::Disposed("streaming permits"))
            }
        }
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }
}

impl FlowControl for StreamingPermits {
    fn request(&self, count: i64) {
        let Ok(count) = usize::try_from(count) else {
            return;
        };
        let room = Semaphore::MAX_PERMITS.saturating_sub(self.semaphore.available_permits());
        self.semaphore.add_permits(count.min(room));
    }
}

/// Handle on the task forwarding one query's replies.
#[derive(Clone)]
pub struct OngoingQuery {
    cancellation: CancellationToken,
    flow_control: Option<Arc<dyn FlowControl>>,
}

impl fmt::Debug for OngoingQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OngoingQuery")
            .field("cancelled", &self.cancellation.is_cancelled())
            .field("flow_controlled", &self.flow_control.is_some())
            .finish()
    }
}

impl OngoingQuery {
    pub fn new(cancellation: CancellationToken) -> Self {
        Self {
            cancellation,
            flow_control: None,
        }
    }

    pub fn with_flow_control(mut self, flow_control: Arc<dyn FlowControl>) -> Self {
        self.flow_control = Some(flow_control);
        self
    }

    pub fn cancel(&self) {
        self.cancellation.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}

#[derive(Debug, Default, Clone)]
pub struct OngoingQueryCollection {
    queries: HashMap<InstructionId, OngoingQuery>,
}

impl OngoingQueryCollection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_query(&mut self, id: InstructionId, query: OngoingQuery) -> Result<(), ConnectorError> {
        if self.queries.contains_key(&id) {
            return Err(ConnectorError::InvalidArgument(format!(
                "query {id} is already in flight"
            )));
        }
        self.queries.insert(id, query);
        Ok(())
    }

    pub fn remove_query(&mut self, id: &InstructionId) -> Option<OngoingQuery> {
        self.queries.remove(id)
    }

    /// Forward a permit grant. False when the query is unknown or not flow controlled.
    pub fn try_flow_control_request_for_query(&self, id: &InstructionId, count: i64) -> bool {
        match self.queries.get(id).and_then(|query| query.flow_control.as_ref()) {
            Some(flow_control) => {
                flow_control.request(count);
                true
            }
            None => false,
        }
    }

    /// Cancel and forget every query.
    pub fn cancel_all(&mut self) {
        for (_, query) in self.queries.drain() {
            query.cancel();
        }
    }

    pub fn len(&self) -> usize {
        self.queries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queries.is_empty()
    }
}

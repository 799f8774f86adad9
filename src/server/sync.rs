// ============================================================================
// Active -> Passive Replication
// ============================================================================
//
// The active talks to its downstream passive by enqueueing request frames on
// the passive's queue, exactly like a client would. Each frame carries a
// one-shot `Interlock` as its sender; the active's worker blocks until the
// passive completes the frame. That keeps the passive in lock-step with the
// active's own total order.
//
// ============================================================================

use super::ServerShared;
use super::state::{EntityRecord, EntityTable, ProcessState};
use crate::connection::MessageSender;
use crate::core::{
    ConcurrencyKey, EntityError, EntityTuple, PLATFORM_CONSUMER_ID, Result, ServerError,
    invariant_violation,
};
use crate::entity::{BoxedActiveEntity, PassiveSynchronizationChannel};
use crate::protocol::{ReplyFrame, RequestFrame, ServerMessage};
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

type Completion = std::result::Result<Vec<u8>, EntityError>;

/// One-shot completion latch used as the sender of a replicated frame.
pub(crate) struct Interlock {
    completion: Mutex<Option<oneshot::Sender<Completion>>>,
}

impl Interlock {
    pub(crate) fn new() -> (Arc<Self>, oneshot::Receiver<Completion>) {
        let (tx, rx) = oneshot::channel();
        let interlock = Arc::new(Self {
            completion: Mutex::new(Some(tx)),
        });
        (interlock, rx)
    }
}

impl MessageSender for Interlock {
    fn send_ack(&self, _ack: ReplyFrame) {}

    fn send_complete(&self, complete: ReplyFrame) {
        let ReplyFrame::Complete { result, .. } = complete else {
            return;
        };
        let waiter = self
            .completion
            .lock()
            .ok()
            .and_then(|mut completion| completion.take());
        if let Some(waiter) = waiter {
            // The waiting side may already have given up.
            let _ = waiter.send(result);
        }
    }

    fn send_retire(&self, _retire: ReplyFrame) {}

    fn client_origin_id(&self) -> u64 {
        PLATFORM_CONSUMER_ID
    }
}

/// Handle on a downstream passive process.
#[derive(Clone)]
pub(crate) struct PassiveLink {
    passive: Arc<ServerShared>,
}

impl PassiveLink {
    pub(crate) fn new(passive: Arc<ServerShared>) -> Self {
        Self { passive }
    }

    pub(crate) fn name(&self) -> &str {
        &self.passive.name
    }

    /// Enqueues an encoded request on the passive and waits for its
    /// completion.
    pub(crate) fn exchange(&self, payload: Vec<u8>) -> Result<Completion> {
        let (interlock, completion) = Interlock::new();
        self.passive.submit_message(interlock, payload)?;
        completion.blocking_recv().map_err(|_| {
            ServerError::Sync(format!(
                "passive '{}' dropped the request before completing it",
                self.passive.name
            ))
        })
    }

    pub(crate) fn send(&self, message: ServerMessage) -> Result<()> {
        let operation = message.name();
        let payload = RequestFrame::new(0, message).encode()?;
        self.exchange(payload)?.map(|_| ()).map_err(|err| {
            ServerError::Sync(format!(
                "passive '{}' rejected {}: {}",
                self.passive.name, operation, err
            ))
        })
    }
}

/// Forwards the payloads an entity streams for one key, keeping the first
/// failure.
struct KeyChannel<'a> {
    link: &'a PassiveLink,
    entity: &'a EntityTuple,
    key: ConcurrencyKey,
    failure: Option<ServerError>,
}

impl PassiveSynchronizationChannel for KeyChannel<'_> {
    fn synchronize_to_passive(&mut self, payload: Vec<u8>) {
        if self.failure.is_some() {
            return;
        }
        let message = ServerMessage::SyncPayload {
            entity: self.entity.clone(),
            key: self.key,
            payload,
        };
        if let Err(err) = self.link.send(message) {
            self.failure = Some(err);
        }
    }
}

fn synchronize_entity(link: &PassiveLink, record: &mut EntityRecord<BoxedActiveEntity>) -> Result<()> {
    let entity = record.entity.clone();
    link.send(ServerMessage::SyncEntityStart {
        entity: entity.clone(),
        version: record.version,
        configuration: record.configuration.clone(),
    })?;

    for key in record.instance.keys_for_synchronization() {
        link.send(ServerMessage::SyncEntityKeyStart {
            entity: entity.clone(),
            key,
        })?;
        let mut channel = KeyChannel {
            link,
            entity: &entity,
            key,
            failure: None,
        };
        record.instance.synchronize_key_to_passive(&mut channel, key);
        if let Some(err) = channel.failure {
            return Err(err);
        }
        link.send(ServerMessage::SyncEntityKeyEnd {
            entity: entity.clone(),
            key,
        })?;
    }

    link.send(ServerMessage::SyncEntityEnd { entity })
}

impl ProcessState {
    /// Brings a fresh passive up to date with every live entity, then keeps
    /// it as the replication target.
    pub(crate) fn attach_passive(&mut self, link: PassiveLink) -> Result<()> {
        let EntityTable::Active(entities) = &mut self.entities else {
            invariant_violation(format!("passive server '{}' cannot feed another passive", self.name));
        };
        info!(
            server = %self.name,
            passive = link.name(),
            entities = entities.len(),
            "synchronizing passive"
        );
        for record in entities.values_mut() {
            synchronize_entity(&link, record)?;
            debug!(server = %self.name, entity = %record.entity, "entity synchronized");
        }
        info!(server = %self.name, passive = link.name(), "passive synchronized");
        self.downstream = Some(link);
        Ok(())
    }

    /// Forwards a request that changed local state to the downstream
    /// passive, if any, and waits for it to be applied there.
    pub(crate) fn replicate(&mut self, payload: &[u8]) {
        let Some(link) = &self.downstream else {
            return;
        };
        match link.exchange(payload.to_vec()) {
            Ok(Ok(_)) => {}
            Ok(Err(err)) => warn!(
                server = %self.name,
                passive = link.name(),
                error = %err,
                "passive rejected replicated request"
            ),
            Err(err) => {
                warn!(
                    server = %self.name,
                    passive = link.name(),
                    error = %err,
                    "dropping unreachable passive"
                );
                self.downstream = None;
            }
        }
    }
}

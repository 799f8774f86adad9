use super::queue::QueuedWork;
use super::state::ProcessState;
use crate::connection::MessageSender;
use crate::core::EntityError;
use crate::protocol::{ReplyFrame, RequestFrame, ServerMessage, encode_flag};
use std::sync::Arc;
use tracing::{debug, warn};

type Completion = std::result::Result<Vec<u8>, EntityError>;

/// Sends the completion of a request followed by its retirement.
fn complete(sender: &dyn MessageSender, transaction_id: u64, result: Completion) {
    sender.send_complete(ReplyFrame::Complete {
        transaction_id,
        result,
    });
    sender.send_retire(ReplyFrame::Retire { transaction_id });
}

fn unit<T>(result: std::result::Result<T, EntityError>) -> Completion {
    result.map(|_| Vec::new())
}

impl ProcessState {
    pub(crate) fn execute(&mut self, work: QueuedWork) {
        match work {
            QueuedWork::Message { sender, payload } => self.handle_message(sender, &payload),
            QueuedWork::Control(control) => control(self),
        }
    }

    fn handle_message(&mut self, sender: Arc<dyn MessageSender>, payload: &[u8]) {
        let RequestFrame {
            transaction_id,
            message,
        } = match RequestFrame::decode(payload) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(
                    server = %self.name,
                    origin_id = sender.client_origin_id(),
                    error = %err,
                    "dropping undecodable request"
                );
                return;
            }
        };
        debug!(
            server = %self.name,
            operation = message.name(),
            entity = %message.entity(),
            transaction_id,
            "dispatching request"
        );
        sender.send_ack(ReplyFrame::Ack { transaction_id });

        let origin_id = sender.client_origin_id();
        let replicated = message.is_replicated();
        let resend = sender.is_resend();
        // Requests completed later by a lock grant yield `None`.
        let outcome = match message {
            ServerMessage::Create {
                entity,
                version,
                configuration,
            } => match self.create(&entity, version, &configuration) {
                Err(err @ EntityError::AlreadyExists { .. }) if resend => {
                    self.tolerate_duplicate(sender.as_ref(), transaction_id, &err);
                    return;
                }
                result => Some(unit(result)),
            },
            ServerMessage::Destroy { entity } => match self.destroy(&entity) {
                Err(err @ EntityError::NotFound { .. }) if resend => {
                    self.tolerate_duplicate(sender.as_ref(), transaction_id, &err);
                    return;
                }
                result => Some(unit(result)),
            },
            ServerMessage::Invoke {
                entity,
                client_instance_id,
                payload: invocation,
            } => Some(self.invoke(sender.as_ref(), client_instance_id, &entity, &invocation)),
            ServerMessage::Fetch {
                entity,
                client_instance_id,
                version,
            } => {
                let reply_to = sender.clone();
                self.fetch(
                    sender.clone(),
                    client_instance_id,
                    entity,
                    version,
                    Box::new(move |result| complete(reply_to.as_ref(), transaction_id, result)),
                );
                None
            }
            ServerMessage::Release {
                entity,
                client_instance_id,
            } => Some(unit(self.release(sender.as_ref(), client_instance_id, &entity))),
            ServerMessage::AcquireWriteLock { entity } => {
                let reply_to = sender.clone();
                self.acquire_write_lock(
                    origin_id,
                    &entity,
                    Box::new(move |_: &mut ProcessState| complete(reply_to.as_ref(), transaction_id, Ok(Vec::new()))),
                );
                None
            }
            ServerMessage::TryAcquireWriteLock { entity } => {
                let granted = self.try_acquire_write_lock(origin_id, &entity);
                Some(Ok(encode_flag(granted)))
            }
            ServerMessage::ReleaseWriteLock { entity } => {
                self.release_write_lock(origin_id, &entity);
                Some(Ok(Vec::new()))
            }
            ServerMessage::RestoreWriteLock { entity } => {
                let reply_to = sender.clone();
                self.restore_write_lock(
                    origin_id,
                    &entity,
                    Box::new(move |_: &mut ProcessState| complete(reply_to.as_ref(), transaction_id, Ok(Vec::new()))),
                );
                None
            }
            ServerMessage::Reconnect {
                entity,
                client_instance_id,
                extended_data,
            } => {
                self.reconnect(sender.clone(), client_instance_id, &entity, extended_data);
                Some(Ok(Vec::new()))
            }
            ServerMessage::SyncEntityStart {
                entity,
                version,
                configuration,
            } => Some(unit(self.sync_entity_start(&entity, version, &configuration))),
            ServerMessage::SyncEntityEnd { entity } => Some(unit(self.sync_entity_end(&entity))),
            ServerMessage::SyncEntityKeyStart { entity, key } => {
                Some(unit(self.sync_entity_key_start(&entity, key)))
            }
            ServerMessage::SyncEntityKeyEnd { entity, key } => {
                Some(unit(self.sync_entity_key_end(&entity, key)))
            }
            ServerMessage::SyncPayload {
                entity,
                key,
                payload: state,
            } => Some(unit(self.sync_payload(&entity, key, &state))),
        };

        if let Some(result) = outcome {
            // Successful state changes reach the downstream passive before
            // the client hears back.
            if replicated && result.is_ok() {
                self.replicate(payload);
            }
            complete(sender.as_ref(), transaction_id, result);
        }
    }

    /// A resent create or destroy that already took effect before the
    /// fail-over. Nothing changes and nothing is replicated.
    fn tolerate_duplicate(&self, sender: &dyn MessageSender, transaction_id: u64, err: &EntityError) {
        debug!(
            server = %self.name,
            origin_id = sender.client_origin_id(),
            error = %err,
            "tolerating duplicate of a resent request"
        );
        complete(sender, transaction_id, Ok(Vec::new()));
    }
}

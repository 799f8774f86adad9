use crate::core::{ClientDescriptor, EntityError, EntityTuple, Result, ServerError};
use crate::protocol::{ReplyFrame, RequestFrame, ServerMessage, decode_flag};
use crate::server::ServerShared;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender, error::TryRecvError};
use tracing::warn;

/// Return path for the replies to one client's requests.
///
/// The server calls these from its worker thread, in order: `send_ack`,
/// then `send_complete`, then `send_retire` for every request it accepts.
pub trait MessageSender: Send + Sync {
    fn send_ack(&self, ack: ReplyFrame);

    fn send_complete(&self, complete: ReplyFrame);

    fn send_retire(&self, retire: ReplyFrame);

    /// Identifier of the client this sender answers to.
    fn client_origin_id(&self) -> u64;

    fn client_descriptor_for(&self, client_instance_id: u64) -> ClientDescriptor {
        ClientDescriptor::new(self.client_origin_id(), client_instance_id)
    }

    /// True when the client re-sent this request after a fail-over. A
    /// resent create of an existing entity, or destroy of a missing one,
    /// then succeeds without touching anything.
    fn is_resend(&self) -> bool {
        false
    }
}

/// Marks every request it carries as a resend and otherwise answers
/// through `inner`.
pub(crate) struct ResentSender {
    inner: Arc<dyn MessageSender>,
}

impl ResentSender {
    pub(crate) fn wrap(inner: Arc<dyn MessageSender>) -> Arc<dyn MessageSender> {
        Arc::new(Self { inner })
    }
}

impl MessageSender for ResentSender {
    fn send_ack(&self, ack: ReplyFrame) {
        self.inner.send_ack(ack)
    }

    fn send_complete(&self, complete: ReplyFrame) {
        self.inner.send_complete(complete)
    }

    fn send_retire(&self, retire: ReplyFrame) {
        self.inner.send_retire(retire)
    }

    fn client_origin_id(&self) -> u64 {
        self.inner.client_origin_id()
    }

    fn client_descriptor_for(&self, client_instance_id: u64) -> ClientDescriptor {
        self.inner.client_descriptor_for(client_instance_id)
    }

    fn is_resend(&self) -> bool {
        true
    }
}

/// Server-side end of a connection: encodes replies onto the client's
/// channel.
struct ConnectionEndpoint {
    origin_id: u64,
    outbound: UnboundedSender<Vec<u8>>,
}

impl ConnectionEndpoint {
    fn deliver(&self, frame: ReplyFrame) {
        match frame.encode() {
            Ok(bytes) => {
                if self.outbound.send(bytes).is_err() {
                    warn!(origin_id = self.origin_id, "reply for a closed connection dropped");
                }
            }
            Err(err) => warn!(origin_id = self.origin_id, error = %err, "failed to encode reply"),
        }
    }
}

impl MessageSender for ConnectionEndpoint {
    fn send_ack(&self, ack: ReplyFrame) {
        self.deliver(ack)
    }

    fn send_complete(&self, complete: ReplyFrame) {
        self.deliver(complete)
    }

    fn send_retire(&self, retire: ReplyFrame) {
        self.deliver(retire)
    }

    fn client_origin_id(&self) -> u64 {
        self.origin_id
    }
}

type Completion = std::result::Result<Vec<u8>, EntityError>;

struct Inbox {
    inbound: UnboundedReceiver<Vec<u8>>,
    completions: HashMap<u64, Completion>,
    replies: Vec<ReplyFrame>,
}

impl Inbox {
    fn absorb(&mut self, bytes: &[u8]) -> Result<()> {
        let frame = ReplyFrame::decode(bytes)?;
        if let ReplyFrame::Complete {
            transaction_id,
            result,
        } = &frame
        {
            self.completions.insert(*transaction_id, result.clone());
        }
        self.replies.push(frame);
        Ok(())
    }

    fn drain_available(&mut self) -> Result<()> {
        loop {
            match self.inbound.try_recv() {
                Ok(bytes) => self.absorb(&bytes)?,
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => return Ok(()),
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionState {
    Open,
    Closed,
}

/// Client handle on a server process.
///
/// Requests are enqueued on the server in call order; their replies land in
/// this connection's inbox and are matched back by transaction id.
pub struct ClientConnection {
    origin_id: u64,
    server: Arc<ServerShared>,
    endpoint: Arc<ConnectionEndpoint>,
    inbox: Mutex<Inbox>,
    next_transaction_id: AtomicU64,
    state: ConnectionState,
}

impl ClientConnection {
    pub(crate) fn open(server: Arc<ServerShared>, origin_id: u64) -> Self {
        let (outbound, inbound) = mpsc::unbounded_channel();
        Self {
            origin_id,
            server,
            endpoint: Arc::new(ConnectionEndpoint {
                origin_id,
                outbound,
            }),
            inbox: Mutex::new(Inbox {
                inbound,
                completions: HashMap::new(),
                replies: Vec::new(),
            }),
            next_transaction_id: AtomicU64::new(1),
            state: ConnectionState::Open,
        }
    }

    pub fn origin_id(&self) -> u64 {
        self.origin_id
    }

    pub fn is_open(&self) -> bool {
        self.state == ConnectionState::Open
    }

    /// Enqueues `message` and returns its transaction id without waiting.
    pub fn send(&self, message: ServerMessage) -> Result<u64> {
        self.enqueue(message, false)
    }

    /// Like [`send`](Self::send), for a request the client already sent to
    /// a server that failed before answering it.
    pub fn resend(&self, message: ServerMessage) -> Result<u64> {
        self.enqueue(message, true)
    }

    fn enqueue(&self, message: ServerMessage, is_resend: bool) -> Result<u64> {
        if self.state == ConnectionState::Closed {
            return Err(ServerError::Protocol("Connection is closed".into()));
        }
        let transaction_id = self.next_transaction_id.fetch_add(1, Ordering::SeqCst);
        let payload = RequestFrame::new(transaction_id, message).encode()?;
        let endpoint: Arc<dyn MessageSender> = self.endpoint.clone();
        let sender = if is_resend {
            ResentSender::wrap(endpoint)
        } else {
            endpoint
        };
        self.server.submit_message(sender, payload)?;
        Ok(transaction_id)
    }

    /// Blocks until the request `transaction_id` completes.
    ///
    /// Never returns for a request the server dropped on shutdown.
    pub fn wait_for_completion(&self, transaction_id: u64) -> Result<Completion> {
        let mut inbox = self.inbox.lock()?;
        loop {
            if let Some(result) = inbox.completions.remove(&transaction_id) {
                return Ok(result);
            }
            match inbox.inbound.blocking_recv() {
                Some(bytes) => inbox.absorb(&bytes)?,
                None => return Err(ServerError::Protocol("Connection is closed".into())),
            }
        }
    }

    /// Completion of `transaction_id` if it already arrived.
    pub fn try_completion(&self, transaction_id: u64) -> Result<Option<Completion>> {
        let mut inbox = self.inbox.lock()?;
        inbox.drain_available()?;
        Ok(inbox.completions.remove(&transaction_id))
    }

    /// Sends `message` and waits for its result.
    pub fn request(&self, message: ServerMessage) -> Result<Vec<u8>> {
        let transaction_id = self.send(message)?;
        Ok(self.wait_for_completion(transaction_id)??)
    }

    /// Every reply frame received so far, in arrival order.
    pub fn replies(&self) -> Result<Vec<ReplyFrame>> {
        let mut inbox = self.inbox.lock()?;
        inbox.drain_available()?;
        Ok(inbox.replies.clone())
    }

    pub fn create(&self, entity: &EntityTuple, version: u64, configuration: &[u8]) -> Result<()> {
        self.request(ServerMessage::Create {
            entity: entity.clone(),
            version,
            configuration: configuration.to_vec(),
        })?;
        Ok(())
    }

    pub fn destroy(&self, entity: &EntityTuple) -> Result<()> {
        self.request(ServerMessage::Destroy {
            entity: entity.clone(),
        })?;
        Ok(())
    }

    /// Fetches the entity for `client_instance_id`, returning its
    /// configuration. Blocks while a write lock is held on it.
    pub fn fetch(&self, entity: &EntityTuple, client_instance_id: u64, version: u64) -> Result<Vec<u8>> {
        self.request(ServerMessage::Fetch {
            entity: entity.clone(),
            client_instance_id,
            version,
        })
    }

    pub fn release(&self, entity: &EntityTuple, client_instance_id: u64) -> Result<()> {
        self.request(ServerMessage::Release {
            entity: entity.clone(),
            client_instance_id,
        })?;
        Ok(())
    }

    pub fn invoke(&self, entity: &EntityTuple, client_instance_id: u64, payload: Vec<u8>) -> Result<Vec<u8>> {
        self.request(ServerMessage::Invoke {
            entity: entity.clone(),
            client_instance_id,
            payload,
        })
    }

    pub fn acquire_write_lock(&self, entity: &EntityTuple) -> Result<()> {
        self.request(ServerMessage::AcquireWriteLock {
            entity: entity.clone(),
        })?;
        Ok(())
    }

    pub fn try_acquire_write_lock(&self, entity: &EntityTuple) -> Result<bool> {
        let flag = self.request(ServerMessage::TryAcquireWriteLock {
            entity: entity.clone(),
        })?;
        decode_flag(&flag)
    }

    pub fn release_write_lock(&self, entity: &EntityTuple) -> Result<()> {
        self.request(ServerMessage::ReleaseWriteLock {
            entity: entity.clone(),
        })?;
        Ok(())
    }

    pub fn restore_write_lock(&self, entity: &EntityTuple) -> Result<()> {
        self.request(ServerMessage::RestoreWriteLock {
            entity: entity.clone(),
        })?;
        Ok(())
    }

    pub fn reconnect(&self, entity: &EntityTuple, client_instance_id: u64, extended_data: &[u8]) -> Result<()> {
        self.request(ServerMessage::Reconnect {
            entity: entity.clone(),
            client_instance_id,
            extended_data: extended_data.to_vec(),
        })?;
        Ok(())
    }

    /// Closes the connection and withdraws the client from monitoring.
    pub fn close(&mut self) -> Result<()> {
        if self.state == ConnectionState::Closed {
            return Ok(());
        }
        self.state = ConnectionState::Closed;
        self.server.withdraw_client(self.origin_id)
    }
}

impl Drop for ClientConnection {
    fn drop(&mut self) {
        // The server may already be gone; nothing left to withdraw then.
        let _ = self.close();
    }
}

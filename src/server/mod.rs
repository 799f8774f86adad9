// ============================================================================
// Passthrough Server Process
// ============================================================================
//
// A server process owns its entities and runs every message, lock grant and
// control request on one worker thread, in arrival order:
//
//   producers --push--> MessageQueue --next--> worker (ProcessState)
//
// The state moves into the worker on start and comes back when the worker is
// joined on shutdown, so nothing outside the worker ever touches it while
// the process runs.
//
// ============================================================================

pub mod config;
mod dispatch;
mod handlers;
mod queue;
mod state;
mod sync;

pub use config::ServerConfig;
pub use state::{EntitySummary, ProcessSnapshot, fetch_identifier};

use crate::connection::{ClientConnection, MessageSender, ResentSender};
use crate::core::{Result, ServerError, ServerRole};
use crate::entity::{ServerEntityService, ServiceProvider};
use crate::monitoring::SERVER_STATE_STOPPED;
use queue::{ControlFn, MessageQueue, QueuedWork};
use state::ProcessState;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use sync::PassiveLink;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

/// The part of a process reachable from other threads: its queue and its
/// published role.
pub(crate) struct ServerShared {
    pub(crate) name: String,
    queue: MessageQueue,
    role: Mutex<ServerRole>,
}

impl ServerShared {
    pub(crate) fn submit_message(&self, sender: Arc<dyn MessageSender>, payload: Vec<u8>) -> Result<()> {
        self.queue.push(QueuedWork::Message { sender, payload })
    }

    pub(crate) fn submit_control(&self, control: ControlFn) -> Result<()> {
        self.queue.push(QueuedWork::Control(control))
    }

    pub(crate) fn announce_client(&self, origin_id: u64) -> Result<()> {
        self.submit_control(Box::new(move |state: &mut ProcessState| {
            state.client_connected(origin_id)
        }))
    }

    pub(crate) fn withdraw_client(&self, origin_id: u64) -> Result<()> {
        self.submit_control(Box::new(move |state: &mut ProcessState| {
            state.client_disconnected(origin_id)
        }))
    }

    /// Closes the queue of a worker that died and drops what was waiting in
    /// it, so blocked interlocks see their sender go away.
    fn abandon_queue(&self) {
        match self.queue.stop().and_then(|_| self.queue.clear()) {
            Ok(dropped) => error!(server = %self.name, dropped, "worker died; queue closed"),
            Err(err) => error!(server = %self.name, error = %err, "worker died; queue unusable"),
        }
    }

    fn role(&self) -> ServerRole {
        *self.role.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_role(&self, role: ServerRole) {
        *self.role.lock().unwrap_or_else(PoisonError::into_inner) = role;
    }
}

enum Worker {
    Stopped(Box<ProcessState>),
    Running(JoinHandle<ProcessState>),
    /// The worker panicked; its state is gone.
    Failed,
}

fn run_worker(shared: Arc<ServerShared>, mut state: ProcessState) -> ProcessState {
    debug!(server = %shared.name, "worker started");
    loop {
        match shared.queue.next() {
            Ok(Some(work)) => {
                let executed = panic::catch_unwind(AssertUnwindSafe(|| state.execute(work)));
                if let Err(panic) = executed {
                    shared.abandon_queue();
                    panic::resume_unwind(panic);
                }
            }
            Ok(None) => break,
            Err(err) => {
                error!(server = %shared.name, error = %err, "message queue unusable");
                break;
            }
        }
    }
    debug!(server = %shared.name, "worker stopped");
    state
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "worker panicked".to_string()
    }
}

/// One active or passive server process.
pub struct ServerProcess {
    shared: Arc<ServerShared>,
    worker: Worker,
    load_storage: bool,
    started: bool,
}

impl ServerProcess {
    pub fn new(config: ServerConfig) -> Result<Self> {
        config.validate().map_err(ServerError::Config)?;
        let state = ProcessState::new(
            config.name.clone(),
            config.role,
            config.persistence.clone(),
            config.monitoring.clone(),
        );
        Ok(Self {
            shared: Arc::new(ServerShared {
                name: config.name,
                queue: MessageQueue::new(),
                role: Mutex::new(config.role),
            }),
            worker: Worker::Stopped(Box::new(state)),
            load_storage: config.load_storage,
            started: false,
        })
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn role(&self) -> ServerRole {
        self.shared.role()
    }

    /// False once the worker was shut down or died.
    pub fn is_running(&self) -> bool {
        matches!(&self.worker, Worker::Running(handle) if !handle.is_finished())
    }

    fn unstarted_state(&mut self) -> Result<&mut ProcessState> {
        match &mut self.worker {
            Worker::Stopped(state) if !self.started => Ok(&mut **state),
            _ => Err(ServerError::Config(
                "services and providers can only be registered before start".to_string(),
            )),
        }
    }

    pub fn register_entity_service(&mut self, service: Arc<dyn ServerEntityService>) -> Result<()> {
        self.unstarted_state()?.register_service(service);
        Ok(())
    }

    pub fn register_service_provider(&mut self, provider: Arc<dyn ServiceProvider>) -> Result<()> {
        self.unstarted_state()?.register_provider(provider);
        Ok(())
    }

    /// Prepares the process (platform registry, monitoring, persistence,
    /// optional reload) and starts its worker.
    pub fn start(&mut self) -> Result<()> {
        let load_storage = self.load_storage;
        if !self.started && matches!(self.worker, Worker::Failed) {
            return Err(ServerError::Config(
                "server failed part way through start-up and cannot be started".to_string(),
            ));
        }
        let state = self.unstarted_state().map_err(|_| {
            ServerError::Config("server already started; use resume after shutdown".to_string())
        })?;
        if let Err(err) = state.start_up(load_storage) {
            if state.platform_registry_allocated() {
                error!(server = %self.shared.name, error = %err, "start-up failed after reload began");
                self.worker = Worker::Failed;
            }
            return Err(err);
        }
        self.started = true;
        self.spawn_worker()?;
        info!(server = %self.shared.name, role = %self.role(), "server started");
        Ok(())
    }

    /// Restarts the worker of a process that was started and shut down,
    /// keeping its entities.
    pub fn resume(&mut self) -> Result<()> {
        if !self.started || !matches!(self.worker, Worker::Stopped(_)) {
            return Err(ServerError::Config(
                "only a started server that was shut down can resume".to_string(),
            ));
        }
        self.spawn_worker()?;
        info!(server = %self.shared.name, "server resumed");
        Ok(())
    }

    fn spawn_worker(&mut self) -> Result<()> {
        let Worker::Stopped(state) = std::mem::replace(&mut self.worker, Worker::Failed) else {
            return Err(ServerError::Config("server worker already running".to_string()));
        };
        state.publish_running_state();
        self.shared.queue.start()?;

        let shared = self.shared.clone();
        let spawned = thread::Builder::new()
            .name(format!("{}-worker", self.shared.name))
            .spawn(move || run_worker(shared, *state));
        match spawned {
            Ok(handle) => {
                self.worker = Worker::Running(handle);
                Ok(())
            }
            Err(err) => {
                self.shared.queue.stop()?;
                Err(ServerError::WorkerFailed(format!("failed to spawn worker: {}", err)))
            }
        }
    }

    /// Stops accepting messages, lets the worker finish what was already
    /// queued, and joins it.
    pub fn shutdown(&mut self) -> Result<()> {
        let handle = match std::mem::replace(&mut self.worker, Worker::Failed) {
            Worker::Running(handle) => handle,
            other => {
                self.worker = other;
                return Err(ServerError::NotRunning);
            }
        };
        self.shared.queue.stop()?;
        let joined = handle.join();
        let dropped = self.shared.queue.clear()?;
        if dropped > 0 {
            warn!(server = %self.shared.name, dropped, "discarded unprocessed messages");
        }
        match joined {
            Ok(state) => {
                state.publish_server_state(SERVER_STATE_STOPPED);
                self.worker = Worker::Stopped(Box::new(state));
                info!(server = %self.shared.name, "server stopped");
                Ok(())
            }
            Err(panic) => {
                let message = panic_message(panic);
                error!(server = %self.shared.name, %message, "server worker failed");
                Err(ServerError::WorkerFailed(message))
            }
        }
    }

    /// Enqueues an encoded request frame on behalf of `sender`. With
    /// `is_resend`, duplicate creates and destroys are tolerated.
    pub fn submit(&self, sender: Arc<dyn MessageSender>, payload: Vec<u8>, is_resend: bool) -> Result<()> {
        let sender = if is_resend {
            ResentSender::wrap(sender)
        } else {
            sender
        };
        self.shared.submit_message(sender, payload)
    }

    /// Runs `control` on the worker, in order with queued messages, and
    /// waits for its result.
    fn run_control<T, F>(&self, control: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut ProcessState) -> T + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.shared.submit_control(Box::new(move |state: &mut ProcessState| {
            let _ = tx.send(control(state));
        }))?;
        rx.blocking_recv().map_err(|_| {
            ServerError::WorkerFailed(format!(
                "server '{}' dropped a control request",
                self.shared.name
            ))
        })
    }

    /// Opens a connection for client `origin_id` and publishes it.
    pub fn connect(&self, origin_id: u64) -> Result<ClientConnection> {
        self.shared.announce_client(origin_id)?;
        Ok(ClientConnection::open(self.shared.clone(), origin_id))
    }

    /// Synchronizes `passive` with every live entity, then replicates
    /// further state changes to it.
    pub fn attach_passive(&self, passive: &ServerProcess) -> Result<()> {
        if self.role() != ServerRole::Active {
            return Err(ServerError::Config(format!(
                "server '{}' is not active",
                self.shared.name
            )));
        }
        if passive.role() != ServerRole::Passive {
            return Err(ServerError::Config(format!(
                "server '{}' is not passive",
                passive.name()
            )));
        }
        if !passive.is_running() {
            return Err(ServerError::NotRunning);
        }
        let link = PassiveLink::new(passive.shared.clone());
        self.run_control(move |state| state.attach_passive(link))?
    }

    pub fn promote_to_active(&self) -> Result<()> {
        if self.role() != ServerRole::Passive {
            return Err(ServerError::Config(format!(
                "server '{}' is already active",
                self.shared.name
            )));
        }
        let shared = self.shared.clone();
        self.run_control(move |state| {
            state.promote_to_active();
            shared.set_role(ServerRole::Active);
        })
    }

    pub fn snapshot(&self) -> Result<ProcessSnapshot> {
        match &self.worker {
            Worker::Stopped(state) => Ok(state.snapshot()),
            Worker::Running(_) => self.run_control(|state| state.snapshot()),
            Worker::Failed => Err(ServerError::NotRunning),
        }
    }
}

impl Drop for ServerProcess {
    fn drop(&mut self) {
        if matches!(self.worker, Worker::Running(_)) {
            if let Err(err) = self.shutdown() {
                warn!(server = %self.shared.name, error = %err, "shutdown on drop failed");
            }
        }
    }
}

use super::state::ProcessState;
use crate::connection::MessageSender;
use crate::core::{Result, ServerError};
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};

/// Work executed on the server worker, run inside its total order.
pub(crate) type ControlFn = Box<dyn FnOnce(&mut ProcessState) + Send>;

pub(crate) enum QueuedWork {
    Message {
        sender: Arc<dyn MessageSender>,
        payload: Vec<u8>,
    },
    Control(ControlFn),
}

struct QueueState {
    entries: VecDeque<QueuedWork>,
    running: bool,
}

/// FIFO of pending work, shared between producers and the single worker.
pub(crate) struct MessageQueue {
    state: Mutex<QueueState>,
    available: Condvar,
}

impl MessageQueue {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                entries: VecDeque::new(),
                running: false,
            }),
            available: Condvar::new(),
        }
    }

    pub(crate) fn push(&self, work: QueuedWork) -> Result<()> {
        let mut state = self.state.lock()?;
        if !state.running {
            return Err(ServerError::NotRunning);
        }
        state.entries.push_back(work);
        self.available.notify_all();
        Ok(())
    }

    /// Blocks until work is available. Once stopped, keeps handing out what
    /// is left and returns `None` when the queue is empty.
    pub(crate) fn next(&self) -> Result<Option<QueuedWork>> {
        let mut state = self.state.lock()?;
        while state.running && state.entries.is_empty() {
            state = self.available.wait(state)?;
        }
        Ok(state.entries.pop_front())
    }

    pub(crate) fn start(&self) -> Result<()> {
        self.state.lock()?.running = true;
        Ok(())
    }

    pub(crate) fn stop(&self) -> Result<()> {
        let mut state = self.state.lock()?;
        state.running = false;
        self.available.notify_all();
        Ok(())
    }

    /// Drops whatever is still queued. The senders get no reply.
    pub(crate) fn clear(&self) -> Result<usize> {
        let dropped: Vec<QueuedWork> = self.state.lock()?.entries.drain(..).collect();
        Ok(dropped.len())
    }
}

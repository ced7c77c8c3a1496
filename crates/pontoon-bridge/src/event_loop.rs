//! Main-thread dispatch scheduler
//!
//! The remote side funnels every main-thread call into one event loop thread
//! that also pumps native windowing/plugin events. Calls arrive as boxed
//! tasks on an unbounded queue; callers that need the return value block on
//! a capacity-one rendezvous channel until their task has run.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};

use crate::error::{BridgeError, Result};

type Task = Box<dyn FnOnce() + Send>;

/// Consumer half, run on the thread that owns main-thread-only state.
pub struct EventLoop {
    tasks: Receiver<Task>,
    tick: Duration,
}

/// Producer half. Cloneable; the loop exits once every handle is gone.
#[derive(Clone)]
pub struct EventLoopHandle {
    tasks: Sender<Task>,
}

impl EventLoop {
    pub fn new(tick: Duration) -> (Self, EventLoopHandle) {
        let (tx, rx) = crossbeam_channel::unbounded();
        (Self { tasks: rx, tick }, EventLoopHandle { tasks: tx })
    }

    /// Run until every [`EventLoopHandle`] is dropped. Each iteration drains
    /// queued tasks, then calls `pump` so native events interleave with
    /// bridged calls the way a plugin expects; `pump` also runs on the tick
    /// interval when no tasks arrive.
    pub fn run<F: FnMut()>(self, mut pump: F) {
        loop {
            match self.tasks.recv_timeout(self.tick) {
                Ok(task) => {
                    task();
                    while let Ok(task) = self.tasks.try_recv() {
                        task();
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
            pump();
        }
    }
}

impl EventLoopHandle {
    /// Run `f` on the loop thread and block for its result.
    pub fn dispatch<R, F>(&self, f: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce() -> R + Send + 'static,
    {
        let (result_tx, result_rx) = crossbeam_channel::bounded(1);
        self.tasks
            .send(Box::new(move || {
                let _ = result_tx.send(f());
            }))
            .map_err(|_| BridgeError::ChannelClosed)?;
        result_rx.recv().map_err(|_| BridgeError::ChannelClosed)
    }

    /// Queue `f` without waiting for it.
    pub fn schedule<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.tasks
            .send(Box::new(f))
            .map_err(|_| BridgeError::ChannelClosed)
    }
}

/// Collapses duplicate deferred-callback requests. A plugin may ask for a
/// main-thread callback from several threads at once; only one may be queued
/// at a time, and further requests are dropped until it has started running.
#[derive(Default)]
pub struct CallbackDebouncer {
    pending: AtomicBool,
}

impl CallbackDebouncer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Schedule `f` on the loop unless a callback is already pending.
    /// Returns whether this request was queued or dropped as a duplicate.
    pub fn try_schedule<F>(self: &Arc<Self>, handle: &EventLoopHandle, f: F) -> Result<bool>
    where
        F: FnOnce() + Send + 'static,
    {
        if self
            .pending
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(false);
        }
        let debouncer = Arc::clone(self);
        let queued = handle.schedule(move || {
            // Clear before running so the callback itself may re-request.
            debouncer.pending.store(false, Ordering::Release);
            f();
        });
        if queued.is_err() {
            self.pending.store(false, Ordering::Release);
        }
        queued.map(|()| true)
    }
}

//! The privileged execution context.
//!
//! Error handlers may prompt the user, so they only ever run on one
//! designated thread (conventionally the UI thread). Other threads hand work
//! to it through a queue which that thread drains from its own event loop.

use std::marker::PhantomData;
use std::sync::mpsc::{self, RecvTimeoutError, TryRecvError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

pub(crate) type Task = Box<dyn FnOnce() + Send + 'static>;

/// Receiving side shared by both ends. Only the privileged thread receives.
struct Queue {
    receiver: Mutex<mpsc::Receiver<Task>>,
    /// Set when the loop is dropped; guards sends so none slip in afterwards.
    closed: Mutex<bool>,
}

impl Queue {
    fn receiver(&self) -> MutexGuard<'_, mpsc::Receiver<Task>> {
        self.receiver.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn send(&self, sender: &mpsc::Sender<Task>, task: Task) -> Result<(), Task> {
        let closed = self.closed.lock().unwrap_or_else(PoisonError::into_inner);
        if *closed {
            return Err(task);
        }
        sender.send(task).map_err(|e| e.0)
    }

    // The receiver lock is released before the task runs, so a task may
    // itself pump the queue.
    fn try_next(&self) -> Option<Task> {
        match self.receiver().try_recv() {
            Ok(task) => Some(task),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    fn next_within(&self, timeout: Duration) -> Option<Task> {
        match self.receiver().recv_timeout(timeout) {
            Ok(task) => Some(task),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Blocks until a task arrives or every sender is gone.
    fn next(&self) -> Option<Task> {
        self.receiver().recv().ok()
    }

    fn run_pending(&self) -> usize {
        let mut ran = 0;
        while let Some(task) = self.try_next() {
            task();
            ran += 1;
        }
        ran
    }
}

/// Creates the handle/loop pair for a privileged thread.
pub struct PrivilegedContext;

impl PrivilegedContext {
    /// Designate the calling thread as the privileged context.
    pub fn for_current_thread() -> (PrivilegedHandle, PrivilegedLoop) {
        let (sender, receiver) = mpsc::channel();
        let queue = Arc::new(Queue {
            receiver: Mutex::new(receiver),
            closed: Mutex::new(false),
        });
        let thread = thread::current().id();
        (
            PrivilegedHandle {
                sender,
                queue: queue.clone(),
                thread,
            },
            PrivilegedLoop {
                queue,
                _not_send: PhantomData,
            },
        )
    }
}

/// Cloneable, thread-safe way to reach the privileged context.
#[derive(Clone)]
pub struct PrivilegedHandle {
    sender: mpsc::Sender<Task>,
    queue: Arc<Queue>,
    thread: ThreadId,
}

impl PrivilegedHandle {
    pub fn is_current(&self) -> bool {
        thread::current().id() == self.thread
    }

    /// Queue `task` for the privileged thread.
    ///
    /// Returns false if the loop has been dropped; the task is dropped with it.
    pub fn dispatch(&self, task: impl FnOnce() + Send + 'static) -> bool {
        self.queue.send(&self.sender, Box::new(task)).is_ok()
    }

    /// Like `dispatch`, but hands a refused task back to the caller.
    pub(crate) fn try_dispatch(&self, task: Task) -> Result<(), Task> {
        self.queue.send(&self.sender, task)
    }

    /// Run queued tasks in place when called on the privileged thread.
    ///
    /// A privileged thread that blocks inside the backend uses this so the
    /// work it is waiting for still gets done. Returns how many ran; always 0
    /// on any other thread.
    pub fn run_pending_if_current(&self) -> usize {
        if !self.is_current() {
            return 0;
        }
        self.queue.run_pending()
    }
}

impl std::fmt::Debug for PrivilegedHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrivilegedHandle")
            .field("thread", &self.thread)
            .finish()
    }
}

/// Receiving end, pinned to the privileged thread.
pub struct PrivilegedLoop {
    queue: Arc<Queue>,
    _not_send: PhantomData<*const ()>,
}

impl PrivilegedLoop {
    /// Run every task queued so far without blocking. Returns how many ran.
    pub fn run_pending(&self) -> usize {
        self.queue.run_pending()
    }

    /// Wait up to `timeout` for work, then run whatever is queued.
    pub fn run_for(&self, timeout: Duration) -> usize {
        let deadline = Instant::now() + timeout;
        let mut ran = 0;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.queue.next_within(remaining) {
                Some(task) => {
                    task();
                    ran += 1;
                }
                None => return ran,
            }
        }
    }

    /// Run tasks until every handle has been dropped.
    pub fn run(self) {
        while let Some(task) = self.queue.next() {
            task();
        }
    }
}

impl Drop for PrivilegedLoop {
    fn drop(&mut self) {
        *self.queue.closed.lock().unwrap_or_else(PoisonError::into_inner) = true;
        // Tasks nobody will run are released now rather than with the last handle.
        while self.queue.try_next().is_some() {}
    }
}

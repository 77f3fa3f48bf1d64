//! Owner-thread affinity.
//!
//! UI resources must be manipulated from the thread that created them. An
//! [`OwnerThread`] is a dedicated thread draining a mailbox of jobs; an
//! [`OwnerToken`] is the cloneable address of that mailbox, stored on each
//! registry entry as [`Affinity::Owned`].
//!
//! [`OwnerToken::run`] is the only way a step reaches an owned resource:
//! - called on the owner thread itself, the job runs inline;
//! - otherwise it is posted and the caller blocks until it finishes;
//! - if the owner thread is gone, the job runs on the calling thread
//!   (reported as [`Marshaled::Fallback`]);
//! - if the job has not started within the timeout it is withdrawn.
//!
//! Panics inside a job are caught on whichever thread ran it.

use std::any::Any as StdAny;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use thiserror::Error;

type Job = Box<dyn FnOnce() + Send + 'static>;

enum Mailbox {
    Run(Job),
    Stop,
}

/// Where a marshaled job actually ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Marshaled<T> {
    /// Caller already was the owner thread.
    Direct(T),
    /// Ran on the owner thread.
    OnOwner(T),
    /// Owner thread gone; ran on the calling thread.
    Fallback(T),
}

impl<T> Marshaled<T> {
    pub fn into_inner(self) -> T {
        match self {
            Self::Direct(v) | Self::OnOwner(v) | Self::Fallback(v) => v,
        }
    }

    #[must_use]
    pub const fn is_fallback(&self) -> bool {
        matches!(self, Self::Fallback(_))
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MarshalError {
    #[error("job did not start on owner thread within {timeout_ms} ms")]
    Timeout { timeout_ms: u64 },

    #[error("job panicked: {0}")]
    Panicked(String),
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn StdAny + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

fn run_caught<F, T>(f: F) -> Result<T, MarshalError>
where
    F: FnOnce() -> T,
{
    catch_unwind(AssertUnwindSafe(f)).map_err(|payload| MarshalError::Panicked(panic_message(&*payload)))
}

fn take_job<F>(slot: &Mutex<Option<F>>) -> Option<F> {
    slot.lock().unwrap_or_else(|e| e.into_inner()).take()
}

/// Cloneable address of an owner thread's mailbox.
#[derive(Clone)]
pub struct OwnerToken {
    name: Arc<str>,
    thread_id: ThreadId,
    sender: Sender<Mailbox>,
}

impl std::fmt::Debug for OwnerToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OwnerToken")
            .field("name", &self.name)
            .field("thread_id", &self.thread_id)
            .finish_non_exhaustive()
    }
}

impl OwnerToken {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the calling thread is this token's owner.
    #[must_use]
    pub fn is_current(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    /// Run `f` on the owner thread and wait for its result.
    ///
    /// `timeout` bounds how long the job may wait to *start*; once the owner
    /// has picked it up the caller waits for completion.
    pub fn run<F, T>(&self, f: F, timeout: Duration) -> Result<Marshaled<T>, MarshalError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        if self.is_current() {
            return run_caught(f).map(Marshaled::Direct);
        }

        let slot = Arc::new(Mutex::new(Some(f)));
        let (reply_tx, reply_rx) = channel::bounded::<Result<T, MarshalError>>(1);
        let job_slot = Arc::clone(&slot);
        let job: Job = Box::new(move || {
            if let Some(f) = take_job(&job_slot) {
                let _ = reply_tx.send(run_caught(f));
            }
        });

        if self.sender.send(Mailbox::Run(job)).is_err() {
            return self.fallback(&slot);
        }

        match reply_rx.recv_timeout(timeout) {
            Ok(result) => result.map(Marshaled::OnOwner),
            // Mailbox dropped with the job still queued.
            Err(RecvTimeoutError::Disconnected) => self.fallback(&slot),
            Err(RecvTimeoutError::Timeout) => {
                if take_job(&slot).is_some() {
                    return Err(MarshalError::Timeout {
                        timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                    });
                }
                match reply_rx.recv() {
                    Ok(result) => result.map(Marshaled::OnOwner),
                    Err(_) => Err(MarshalError::Panicked(
                        "owner thread exited while running job".to_string(),
                    )),
                }
            }
        }
    }

    fn fallback<F, T>(&self, slot: &Mutex<Option<F>>) -> Result<Marshaled<T>, MarshalError>
    where
        F: FnOnce() -> T,
    {
        match take_job(slot) {
            Some(f) => {
                tracing::warn!(owner = %self.name, "owner thread gone, running job on caller thread");
                run_caught(f).map(Marshaled::Fallback)
            }
            None => Err(MarshalError::Panicked(
                "owner thread exited while running job".to_string(),
            )),
        }
    }
}

/// Where a resource must be manipulated from.
#[derive(Debug, Clone, Default)]
pub enum Affinity {
    /// Free-threaded; steps run on the caller.
    #[default]
    Any,
    /// Bound to an owner thread.
    Owned(OwnerToken),
}

impl Affinity {
    #[must_use]
    pub fn owner_name(&self) -> Option<&str> {
        match self {
            Self::Any => None,
            Self::Owned(token) => Some(token.name()),
        }
    }
}

/// Dedicated thread that owns a UI resource graph.
pub struct OwnerThread {
    token: OwnerToken,
    join: Option<JoinHandle<()>>,
}

impl OwnerThread {
    pub fn spawn(name: impl Into<String>) -> std::io::Result<Self> {
        let name: String = name.into();
        let (sender, receiver) = channel::unbounded();
        let join = thread::Builder::new()
            .name(name.clone())
            .spawn(move || drain_mailbox(&receiver))?;
        let token = OwnerToken {
            name: name.into(),
            thread_id: join.thread().id(),
            sender,
        };
        tracing::debug!(owner = %token.name, "owner thread started");
        Ok(Self {
            token,
            join: Some(join),
        })
    }

    #[must_use]
    pub fn token(&self) -> OwnerToken {
        self.token.clone()
    }

    #[must_use]
    pub fn affinity(&self) -> Affinity {
        Affinity::Owned(self.token())
    }

    /// Run `f` on this thread with no start deadline.
    pub fn execute<F, T>(&self, f: F) -> Result<T, MarshalError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        self.token.run(f, Duration::MAX).map(Marshaled::into_inner)
    }

    /// Stop the thread after it finishes already-queued jobs ahead of the
    /// stop message. Jobs posted afterwards fall back to their callers.
    pub fn shutdown(mut self) {
        self.stop_and_join();
    }

    fn stop_and_join(&mut self) {
        let Some(join) = self.join.take() else {
            return;
        };
        let _ = self.token.sender.send(Mailbox::Stop);
        if join.thread().id() != thread::current().id() && join.join().is_err() {
            tracing::warn!(owner = %self.token.name, "owner thread panicked");
        }
        tracing::debug!(owner = %self.token.name, "owner thread stopped");
    }
}

impl Drop for OwnerThread {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}

fn drain_mailbox(receiver: &Receiver<Mailbox>) {
    while let Ok(message) = receiver.recv() {
        match message {
            Mailbox::Run(job) => job(),
            Mailbox::Stop => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    const WAIT: Duration = Duration::from_secs(5);

    #[test]
    fn runs_on_owner_thread() {
        let owner = OwnerThread::spawn("ui-owner").unwrap();
        let token = owner.token();
        let result = token
            .run(|| thread::current().name().map(str::to_string), WAIT)
            .unwrap();
        assert_eq!(result, Marshaled::OnOwner(Some("ui-owner".to_string())));
        assert!(!token.is_current());
    }

    #[test]
    fn nested_call_on_owner_runs_inline() {
        let owner = OwnerThread::spawn("ui-owner").unwrap();
        let token = owner.token();
        let inner = token.clone();
        let result = token
            .run(move || inner.run(|| 7, WAIT), WAIT)
            .unwrap()
            .into_inner()
            .unwrap();
        assert_eq!(result, Marshaled::Direct(7));
    }

    #[test]
    fn falls_back_when_owner_is_gone() {
        let owner = OwnerThread::spawn("gone").unwrap();
        let token = owner.token();
        owner.shutdown();

        let here = thread::current().id();
        let result = token.run(move || thread::current().id() == here, WAIT).unwrap();
        assert!(result.is_fallback());
        assert!(result.into_inner());
    }

    #[test]
    fn panics_are_caught_on_owner() {
        let owner = OwnerThread::spawn("ui-owner").unwrap();
        let err = owner
            .token()
            .run(|| -> () { panic!("grid exploded") }, WAIT)
            .unwrap_err();
        assert_eq!(err, MarshalError::Panicked("grid exploded".to_string()));
        // Owner survives the panic.
        assert_eq!(owner.execute(|| 1).unwrap(), 1);
    }

    #[test]
    fn busy_owner_withdraws_job_after_timeout() {
        let owner = OwnerThread::spawn("busy").unwrap();
        let token = owner.token();
        let (started_tx, started_rx) = channel::bounded(1);
        let (gate_tx, gate_rx) = channel::bounded::<()>(1);

        let blocker_token = token.clone();
        let blocker = thread::spawn(move || {
            blocker_token.run(
                move || {
                    started_tx.send(()).unwrap();
                    gate_rx.recv().unwrap();
                },
                WAIT,
            )
        });
        started_rx.recv().unwrap();

        let ran = Arc::new(AtomicBool::new(false));
        let ran_job = Arc::clone(&ran);
        let err = token
            .run(move || ran_job.store(true, Ordering::SeqCst), Duration::from_millis(20))
            .unwrap_err();
        assert_eq!(err, MarshalError::Timeout { timeout_ms: 20 });

        gate_tx.send(()).unwrap();
        assert!(blocker.join().unwrap().is_ok());
        // Flush the mailbox; the withdrawn job must not have run.
        owner.execute(|| ()).unwrap();
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[test]
    fn affinity_reports_owner_name() {
        let owner = OwnerThread::spawn("forms").unwrap();
        assert_eq!(owner.affinity().owner_name(), Some("forms"));
        assert_eq!(Affinity::Any.owner_name(), None);
    }
}

//! Hand-off of jobs from the dispatcher to the worker thread.
//!
//! The worker plays the part of the second core. Ownership of the job slot
//! follows an atomic tag:
//!
//! ```text
//! Idle --submit--> Ready --worker claims--> Running --worker stores--> Done
//!  ^                                                                    |
//!  +------------------------ result collected --------------------------+
//! ```
//!
//! Every store to the tag is `Release` and every load `Acquire`, so whatever
//! was written to the slot before a transition is visible after it.
//!
//! A submitter that times out raises the cancel flag and waits a short grace
//! period. If the job still has not finished it is abandoned: the tag stays
//! `Running` and new submissions fail with [`Status::State`] until the worker
//! finally stores its result. The job's code lives in an `Arc`, so the worker
//! keeps it alive for as long as it runs.

use crate::exec::native::NativeRunner;
use crate::protocol::args::MAX_NATIVE_ARGS;
use crate::protocol::frame::Status;
use crate::vm::{CancelToken, RunEnd, Vm};
use crate::{debug, warn};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Grace period granted to a cancelled job before it is abandoned.
pub const DEFAULT_GRACE: Duration = Duration::from_millis(20);

const WAIT_POLL: Duration = Duration::from_micros(200);
const WORKER_IDLE: Duration = Duration::from_millis(1);

/// Tag values of the shared slot.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobState {
    Idle = 0,
    Ready = 1,
    Running = 2,
    Done = 3,
}

impl JobState {
    fn from_u8(raw: u8) -> JobState {
        match raw {
            0 => JobState::Idle,
            1 => JobState::Ready,
            2 => JobState::Running,
            _ => JobState::Done,
        }
    }
}

/// Work handed to the worker.
#[derive(Clone, Debug)]
pub enum Job {
    /// Thumb code called with eight zero-padded arguments.
    Native {
        code: Arc<[u8]>,
        args: [i32; MAX_NATIVE_ARGS],
    },
    /// Script text run on the VM with its own wall-clock budget.
    Script {
        code: Arc<[u8]>,
        args: Vec<i32>,
        timeout_ms: u32,
    },
}

#[derive(Default)]
struct Slot {
    job: Option<Job>,
    result: Option<Result<i32, Status>>,
}

struct Shared {
    state: AtomicU8,
    slot: Mutex<Slot>,
    cancel: CancelToken,
    shutdown: AtomicBool,
}

impl Shared {
    fn state(&self) -> JobState {
        JobState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn publish(&self, state: JobState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn with_slot<R>(&self, f: impl FnOnce(&mut Slot) -> R) -> R {
        let mut guard = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut guard)
    }

    /// Takes the result of a `Done` job and returns the slot to `Idle`.
    fn collect(&self) -> Option<Result<i32, Status>> {
        if self.state() != JobState::Done {
            return None;
        }
        let result = self.with_slot(|slot| slot.result.take());
        self.publish(JobState::Idle);
        result
    }
}

/// What the worker runs jobs on.
pub struct Engine {
    vm: Vm,
    runner: Box<dyn NativeRunner>,
}

impl Engine {
    /// The VM's cancel token becomes the bridge's cancel flag.
    pub fn new(vm: Vm, runner: Box<dyn NativeRunner>) -> Self {
        Self { vm, runner }
    }

    fn execute(&mut self, job: Job) -> Result<i32, Status> {
        match job {
            Job::Native { code, args } => {
                if code.is_empty() || code.len() % 2 != 0 {
                    return Err(Status::Param);
                }
                let cancel = self.vm.cancel_token().clone();
                self.runner.invoke(&code, args, &cancel)
            }
            Job::Script { code, args, timeout_ms } => match self.vm.run(&code, &args, timeout_ms) {
                Ok(outcome) => match outcome.end {
                    RunEnd::Returned | RunEnd::FellOffEnd => Ok(outcome.value),
                    RunEnd::TimedOut | RunEnd::Cancelled => {
                        debug!("script stopped after {} steps: {:?}", outcome.steps, outcome.end);
                        Err(Status::Timeout)
                    }
                },
                Err(err) => {
                    warn!("script rejected: {}", err);
                    Err(Status::Exec)
                }
            },
        }
    }
}

/// Worker side: claims and runs one job per successful poll.
pub struct Worker {
    shared: Arc<Shared>,
    engine: Engine,
}

impl Worker {
    /// Runs the pending job if there is one. Returns whether it did.
    pub fn poll(&mut self) -> bool {
        let claimed = self.shared.state.compare_exchange(
            JobState::Ready as u8,
            JobState::Running as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        if claimed.is_err() {
            return false;
        }

        // the submitter may reuse the slot as soon as it sees Running
        let job = self.shared.with_slot(|slot| slot.job.take());
        let result = match job {
            Some(job) => self.engine.execute(job),
            None => Err(Status::State),
        };

        self.shared.with_slot(|slot| slot.result = Some(result));
        self.shared.publish(JobState::Done);
        true
    }
}

/// Control side of the hand-off, owning the worker thread.
pub struct Bridge {
    shared: Arc<Shared>,
    grace: Duration,
    worker: Option<JoinHandle<()>>,
}

impl Bridge {
    /// Starts the worker thread around `engine`.
    pub fn spawn(engine: Engine) -> std::io::Result<Self> {
        let shared = Arc::new(Shared {
            state: AtomicU8::new(JobState::Idle as u8),
            slot: Mutex::default(),
            cancel: engine.vm.cancel_token().clone(),
            shutdown: AtomicBool::new(false),
        });

        let mut worker = Worker {
            shared: shared.clone(),
            engine,
        };
        let handle = thread::Builder::new().name("copro-worker".into()).spawn(move || {
            while !worker.shared.shutdown.load(Ordering::Acquire) {
                if !worker.poll() {
                    thread::park_timeout(WORKER_IDLE);
                }
            }
        })?;

        Ok(Self {
            shared,
            grace: DEFAULT_GRACE,
            worker: Some(handle),
        })
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn state(&self) -> JobState {
        self.shared.state()
    }

    /// A job is queued or still executing, possibly abandoned.
    pub fn is_busy(&self) -> bool {
        matches!(self.state(), JobState::Ready | JobState::Running)
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.shared.cancel
    }

    /// Raises the cancel flag for whatever is running.
    pub fn cancel(&self) {
        self.shared.cancel.cancel();
    }

    /// Queues `job`. Fails with [`Status::State`] while another job is active.
    ///
    /// A finished job nobody collected is discarded first.
    pub fn submit(&self, job: Job) -> Result<(), Status> {
        match self.state() {
            JobState::Ready | JobState::Running => return Err(Status::State),
            JobState::Done => {
                if let Some(stale) = self.shared.collect() {
                    debug!("discarding result of abandoned job: {:?}", stale);
                }
            }
            JobState::Idle => {}
        }

        self.shared.with_slot(|slot| {
            slot.job = Some(job);
            slot.result = None;
        });
        self.shared.cancel.clear();
        self.shared.publish(JobState::Ready);
        if let Some(worker) = &self.worker {
            worker.thread().unpark();
        }
        Ok(())
    }

    /// Waits up to `timeout` for the submitted job.
    ///
    /// On expiry the cancel flag is raised and the job gets one grace period;
    /// the answer is [`Status::Timeout`] either way.
    pub fn wait(&self, timeout: Duration) -> Result<i32, Status> {
        if let Some(result) = self.wait_done(timeout) {
            return result;
        }

        self.shared.cancel.cancel();
        match self.wait_done(self.grace) {
            Some(_) => debug!("job stopped within the grace period"),
            None => warn!("job ignored cancel, abandoning it"),
        }
        Err(Status::Timeout)
    }

    /// [`submit`](Self::submit) followed by [`wait`](Self::wait).
    pub fn run(&self, job: Job, timeout: Duration) -> Result<i32, Status> {
        self.submit(job)?;
        self.wait(timeout)
    }

    fn wait_done(&self, budget: Duration) -> Option<Result<i32, Status>> {
        let started = Instant::now();
        loop {
            if self.state() == JobState::Done {
                return Some(self.shared.collect().unwrap_or(Err(Status::State)));
            }
            if started.elapsed() >= budget {
                return None;
            }
            thread::sleep(WAIT_POLL);
        }
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.cancel.cancel();
        if let Some(worker) = self.worker.take() {
            worker.thread().unpark();
            let _ = worker.join();
        }
    }
}

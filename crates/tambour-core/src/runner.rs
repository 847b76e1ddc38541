//! Job runner: admits conversion requests and runs them one at a time.
//!
//! A runner owns a single worker thread. At most one job is in flight; what
//! happens to a request that arrives meanwhile is fixed per runner by its
//! [`AdmissionPolicy`]. A request whose input is byte-identical to the
//! in-flight or queued job is coalesced onto that job's handle.

use crate::dst::DstOptions;
use crate::error::RunnerError;
use crate::fingerprint::Fingerprint;
use crate::job::{CancelToken, ConversionJob, JobInput, JobOutcome, JobState, OutputTarget};
use crate::layout::EmbLayout;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;

/// What to do with a request while another job is in flight.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdmissionPolicy {
    /// Queue behind the in-flight job. The queue holds one request; a newer
    /// request replaces the queued one, which ends `Cancelled`.
    #[default]
    Queue,
    /// Refuse with [`RunnerError::Busy`].
    Reject,
}

/// Observes every transition of every job a runner handles.
pub type TransitionHook = Arc<dyn Fn(&Transition) + Send + Sync>;

#[derive(Clone, Default)]
pub struct RunnerConfig {
    pub admission: AdmissionPolicy,
    pub layout: Arc<EmbLayout>,
    /// Called on the thread that made the transition.
    pub on_transition: Option<TransitionHook>,
}

impl fmt::Debug for RunnerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunnerConfig")
            .field("admission", &self.admission)
            .field("layout", &self.layout)
            .field("on_transition", &self.on_transition.is_some())
            .finish()
    }
}

/// Runner-assigned job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job-{}", self.0)
    }
}

/// One state change of one job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub id: JobId,
    pub from: JobState,
    pub to: JobState,
}

/// Snapshot of a job.
#[derive(Debug, Clone)]
pub struct JobStatus {
    pub id: JobId,
    pub state: JobState,
    /// Present once the job is terminal.
    pub outcome: Option<Arc<JobOutcome>>,
}

/// A conversion request.
#[derive(Debug, Clone)]
pub struct ConversionRequest {
    pub input: Arc<[u8]>,
    pub target: OutputTarget,
    pub label: Option<String>,
}

impl ConversionRequest {
    pub fn new(input: impl Into<Arc<[u8]>>) -> Self {
        Self {
            input: input.into(),
            target: OutputTarget::Memory,
            label: None,
        }
    }

    pub fn with_target(mut self, target: OutputTarget) -> Self {
        self.target = target;
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }
}

/// Caller's reference to an admitted job.
#[derive(Clone)]
pub struct JobHandle {
    slot: Arc<JobSlot>,
}

impl JobHandle {
    pub fn id(&self) -> JobId {
        self.slot.id
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.slot.fingerprint
    }
}

impl fmt::Debug for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobHandle")
            .field("id", &self.slot.id)
            .field("fingerprint", &self.slot.fingerprint)
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct SlotInner {
    state: JobState,
    outcome: Option<Arc<JobOutcome>>,
    subscribers: Vec<Sender<Transition>>,
}

/// Shared between the runner, the worker and every handle to one job.
struct JobSlot {
    id: JobId,
    fingerprint: Fingerprint,
    cancel: CancelToken,
    inner: Mutex<SlotInner>,
    done: Condvar,
}

impl JobSlot {
    fn publish(&self, transition: Transition) {
        let mut inner = lock(&self.inner);
        // Terminal states are recorded with their outcome in `finish`.
        if !transition.to.is_terminal() {
            inner.state = transition.to;
        }
        inner.subscribers.retain(|tx| tx.send(transition).is_ok());
    }

    fn finish(&self, outcome: JobOutcome) {
        let mut inner = lock(&self.inner);
        inner.state = outcome.state();
        inner.outcome = Some(Arc::new(outcome));
        inner.subscribers.clear();
        self.done.notify_all();
    }
}

struct Entry {
    slot: Arc<JobSlot>,
    input: Arc<[u8]>,
    target: OutputTarget,
    /// Taken by the worker when the job starts.
    job: Option<ConversionJob>,
}

impl Entry {
    fn is_duplicate(&self, fingerprint: Fingerprint, request: &ConversionRequest) -> bool {
        self.slot.fingerprint == fingerprint
            && self.target == request.target
            && *self.input == *request.input
    }

    fn handle(&self) -> JobHandle {
        JobHandle {
            slot: Arc::clone(&self.slot),
        }
    }
}

#[derive(Default)]
struct Queue {
    in_flight: Option<Entry>,
    queued: Option<Entry>,
    shutdown: bool,
    next_id: u64,
}

struct Shared {
    config: RunnerConfig,
    queue: Mutex<Queue>,
    wake: Condvar,
}

impl Shared {
    fn notify(&self, slot: &JobSlot, from: JobState, to: JobState) {
        let transition = Transition {
            id: slot.id,
            from,
            to,
        };
        slot.publish(transition);
        if let Some(hook) = &self.config.on_transition {
            hook(&transition);
        }
    }

    /// End a job that never started.
    fn retire(&self, entry: Entry) {
        entry.slot.cancel.cancel();
        self.notify(&entry.slot, JobState::Idle, JobState::Cancelled);
        entry.slot.finish(JobOutcome::Cancelled {
            during: JobState::Idle,
        });
        tracing::info!(job = %entry.slot.id, "queued conversion cancelled");
    }
}

/// Serializes conversion jobs onto one worker thread.
pub struct JobRunner {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl JobRunner {
    pub fn new(config: RunnerConfig) -> Self {
        let shared = Arc::new(Shared {
            config,
            queue: Mutex::new(Queue::default()),
            wake: Condvar::new(),
        });
        let worker = {
            let shared = Arc::clone(&shared);
            std::thread::spawn(move || work(&shared))
        };
        Self {
            shared,
            worker: Some(worker),
        }
    }

    pub fn policy(&self) -> AdmissionPolicy {
        self.shared.config.admission
    }

    /// Request an in-memory conversion of `input`.
    pub fn request_conversion(&self, input: impl Into<Arc<[u8]>>) -> Result<JobHandle, RunnerError> {
        self.submit(ConversionRequest::new(input))
    }

    /// Admit a request according to the runner's policy.
    pub fn submit(&self, request: ConversionRequest) -> Result<JobHandle, RunnerError> {
        let fingerprint = Fingerprint::of(&request.input);
        let mut queue = lock(&self.shared.queue);
        if queue.shutdown {
            return Err(RunnerError::ShutDown);
        }

        for entry in [&queue.in_flight, &queue.queued].into_iter().flatten() {
            if entry.is_duplicate(fingerprint, &request) {
                tracing::debug!(job = %entry.slot.id, %fingerprint, "coalesced duplicate request");
                return Ok(entry.handle());
            }
        }

        if queue.in_flight.is_some() && self.policy() == AdmissionPolicy::Reject {
            tracing::debug!(%fingerprint, "rejected request while busy");
            return Err(RunnerError::Busy);
        }

        queue.next_id += 1;
        let entry = self.entry(JobId(queue.next_id), fingerprint, request);
        let handle = entry.handle();
        tracing::info!(job = %handle.id(), %fingerprint, bytes = fingerprint.len(), "conversion admitted");

        let replaced = if queue.in_flight.is_none() {
            queue.in_flight = Some(entry);
            self.shared.wake.notify_one();
            None
        } else {
            queue.queued.replace(entry)
        };
        drop(queue);

        if let Some(old) = replaced {
            tracing::debug!(job = %old.slot.id, by = %handle.id(), "queued request replaced");
            self.shared.retire(old);
        }
        Ok(handle)
    }

    fn entry(&self, id: JobId, fingerprint: Fingerprint, request: ConversionRequest) -> Entry {
        let cancel = CancelToken::new();
        let job = ConversionJob::new(JobInput::Bytes(Arc::clone(&request.input)), request.target.clone())
            .with_layout(Arc::clone(&self.shared.config.layout))
            .with_options(DstOptions {
                label: request.label,
            })
            .with_cancel_token(cancel.clone());

        Entry {
            slot: Arc::new(JobSlot {
                id,
                fingerprint,
                cancel,
                inner: Mutex::new(SlotInner {
                    state: JobState::Idle,
                    outcome: None,
                    subscribers: Vec::new(),
                }),
                done: Condvar::new(),
            }),
            input: request.input,
            target: request.target,
            job: Some(job),
        }
    }

    /// Current state, and the outcome once terminal.
    pub fn observe(&self, handle: &JobHandle) -> JobStatus {
        let inner = lock(&handle.slot.inner);
        JobStatus {
            id: handle.slot.id,
            state: inner.state,
            outcome: inner.outcome.clone(),
        }
    }

    /// Transitions from now on. The channel closes when the job is terminal.
    pub fn subscribe(&self, handle: &JobHandle) -> Receiver<Transition> {
        let (tx, rx) = mpsc::channel();
        let mut inner = lock(&handle.slot.inner);
        if inner.outcome.is_none() {
            inner.subscribers.push(tx);
        }
        rx
    }

    /// Block until the job is terminal.
    pub fn wait(&self, handle: &JobHandle) -> Arc<JobOutcome> {
        let mut inner = lock(&handle.slot.inner);
        loop {
            if let Some(outcome) = &inner.outcome {
                return Arc::clone(outcome);
            }
            inner = handle
                .slot
                .done
                .wait(inner)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Best-effort cancellation. A queued job ends immediately; the in-flight
    /// job stops at its next transition boundary.
    pub fn cancel(&self, handle: &JobHandle) {
        handle.slot.cancel.cancel();
        let removed = {
            let mut queue = lock(&self.shared.queue);
            let is_queued = queue
                .queued
                .as_ref()
                .is_some_and(|entry| Arc::ptr_eq(&entry.slot, &handle.slot));
            if is_queued { queue.queued.take() } else { None }
        };
        if let Some(entry) = removed {
            self.shared.retire(entry);
        }
    }

    /// Cancel outstanding work and join the worker. Idempotent.
    pub fn shutdown(&mut self) {
        let queued = {
            let mut queue = lock(&self.shared.queue);
            queue.shutdown = true;
            if let Some(entry) = &queue.in_flight {
                entry.slot.cancel.cancel();
            }
            queue.queued.take()
        };
        if let Some(entry) = queued {
            self.shared.retire(entry);
        }
        self.shared.wake.notify_all();

        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::error!("job runner worker panicked");
            }
        }
    }
}

impl Drop for JobRunner {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn work(shared: &Shared) {
    let mut queue = lock(&shared.queue);
    loop {
        let next = queue
            .in_flight
            .as_mut()
            .and_then(|entry| Some((entry.job.take()?, Arc::clone(&entry.slot))));

        if let Some((job, slot)) = next {
            drop(queue);
            let outcome = tracing::info_span!("job", id = %slot.id).in_scope(|| {
                job.run_observed(&mut |from: JobState, to: JobState| shared.notify(&slot, from, to))
            });

            queue = lock(&shared.queue);
            queue.in_flight = queue.queued.take();
            slot.finish(outcome);
            continue;
        }

        if queue.shutdown {
            break;
        }
        queue = shared
            .wake
            .wait(queue)
            .unwrap_or_else(PoisonError::into_inner);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{EmbBuilder, Rec, square_emb};
    use std::collections::HashMap;
    use std::time::Duration;

    /// Holds each job at the entry to Decoding until released.
    struct Gate {
        entered: Receiver<JobId>,
        release: Sender<()>,
    }

    impl Gate {
        fn config(admission: AdmissionPolicy) -> (RunnerConfig, Gate) {
            let (entered_tx, entered) = mpsc::channel();
            let (release, release_rx) = mpsc::channel::<()>();
            let entered_tx = Mutex::new(entered_tx);
            let release_rx = Mutex::new(release_rx);

            let hook = move |t: &Transition| {
                if t.to == JobState::Decoding {
                    let _ = lock(&entered_tx).send(t.id);
                    let _ = lock(&release_rx).recv();
                }
            };
            let config = RunnerConfig {
                admission,
                on_transition: Some(Arc::new(hook)),
                ..RunnerConfig::default()
            };
            (config, Gate { entered, release })
        }

        fn entered(&self) -> JobId {
            self.entered
                .recv_timeout(Duration::from_secs(10))
                .unwrap()
        }

        fn release(&self) {
            self.release.send(()).unwrap();
        }
    }

    fn design(n: i16) -> Vec<u8> {
        EmbBuilder::new()
            .color([0, 0, 0], "")
            .record(Rec::Stitch(n, n))
            .record(Rec::End)
            .build()
    }

    #[test]
    fn test_single_request_succeeds() {
        let runner = JobRunner::new(RunnerConfig::default());
        let handle = runner.request_conversion(square_emb()).unwrap();

        let outcome = runner.wait(&handle);
        assert_eq!(outcome.output().unwrap().metadata.stitch_count, 3);

        let status = runner.observe(&handle);
        assert_eq!(status.state, JobState::Succeeded);
        assert!(status.outcome.is_some());
    }

    #[test]
    fn test_duplicate_requests_share_a_job() {
        let (config, gate) = Gate::config(AdmissionPolicy::Queue);
        let runner = Arc::new(JobRunner::new(config));

        let first = runner.request_conversion(square_emb()).unwrap();
        assert_eq!(gate.entered(), first.id());

        let ids: Vec<JobId> = (0..4)
            .map(|_| {
                let runner = Arc::clone(&runner);
                std::thread::spawn(move || runner.request_conversion(square_emb()).unwrap().id())
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|t| t.join().unwrap())
            .collect();
        assert!(ids.iter().all(|&id| id == first.id()));

        let queued = runner.request_conversion(design(7)).unwrap();
        let again = runner.request_conversion(design(7)).unwrap();
        assert_ne!(queued.id(), first.id());
        assert_eq!(queued.id(), again.id());

        gate.release();
        assert_eq!(gate.entered(), queued.id());
        gate.release();

        assert_eq!(runner.wait(&first).state(), JobState::Succeeded);
        assert_eq!(runner.wait(&queued).state(), JobState::Succeeded);
    }

    #[test]
    fn test_newest_request_replaces_queued() {
        let (config, gate) = Gate::config(AdmissionPolicy::Queue);
        let runner = JobRunner::new(config);

        let running = runner.request_conversion(design(1)).unwrap();
        gate.entered();
        let replaced = runner.request_conversion(design(2)).unwrap();
        let newest = runner.request_conversion(design(3)).unwrap();

        let outcome = runner.wait(&replaced);
        assert!(matches!(
            *outcome,
            JobOutcome::Cancelled {
                during: JobState::Idle
            }
        ));

        drop(gate);
        assert_eq!(runner.wait(&running).state(), JobState::Succeeded);
        assert_eq!(runner.wait(&newest).state(), JobState::Succeeded);
    }

    #[test]
    fn test_reject_policy_reports_busy() {
        let (config, gate) = Gate::config(AdmissionPolicy::Reject);
        let runner = JobRunner::new(config);

        let running = runner.request_conversion(design(1)).unwrap();
        gate.entered();

        let err = runner.request_conversion(design(2)).unwrap_err();
        assert_eq!(err, RunnerError::Busy);
        assert_eq!(
            runner.request_conversion(design(1)).unwrap().id(),
            running.id()
        );

        drop(gate);
        runner.wait(&running);
        assert!(runner.request_conversion(design(2)).is_ok());
    }

    #[test]
    fn test_cancel_in_flight_job() {
        let (config, gate) = Gate::config(AdmissionPolicy::Queue);
        let runner = JobRunner::new(config);

        let handle = runner.request_conversion(square_emb()).unwrap();
        gate.entered();
        runner.cancel(&handle);
        gate.release();

        let outcome = runner.wait(&handle);
        assert!(matches!(
            *outcome,
            JobOutcome::Cancelled {
                during: JobState::Decoding
            }
        ));
    }

    #[test]
    fn test_cancel_queued_job() {
        let (config, gate) = Gate::config(AdmissionPolicy::Queue);
        let runner = JobRunner::new(config);

        let running = runner.request_conversion(design(1)).unwrap();
        gate.entered();
        let queued = runner.request_conversion(design(2)).unwrap();
        runner.cancel(&queued);

        assert_eq!(runner.wait(&queued).state(), JobState::Cancelled);
        drop(gate);
        assert_eq!(runner.wait(&running).state(), JobState::Succeeded);
    }

    #[test]
    fn test_subscribe_sees_every_transition() {
        let (config, gate) = Gate::config(AdmissionPolicy::Queue);
        let runner = JobRunner::new(config);

        let running = runner.request_conversion(design(1)).unwrap();
        gate.entered();
        let queued = runner.request_conversion(square_emb()).unwrap();
        let events = runner.subscribe(&queued);
        drop(gate);

        let states: Vec<_> = events.iter().map(|t| (t.from, t.to)).collect();
        assert_eq!(
            states,
            vec![
                (JobState::Idle, JobState::Staging),
                (JobState::Staging, JobState::Decoding),
                (JobState::Decoding, JobState::Encoding),
                (JobState::Encoding, JobState::Succeeded),
            ]
        );
        runner.wait(&running);
    }

    #[test]
    fn test_concurrent_requests_never_overlap() {
        let log = Arc::new(Mutex::new(Vec::<Transition>::new()));
        let config = RunnerConfig {
            on_transition: Some({
                let log = Arc::clone(&log);
                Arc::new(move |t: &Transition| lock(&log).push(*t))
            }),
            ..RunnerConfig::default()
        };
        let runner = Arc::new(JobRunner::new(config));

        let handles: Vec<JobHandle> = (0..16)
            .map(|i| {
                let runner = Arc::clone(&runner);
                std::thread::spawn(move || runner.request_conversion(design(i % 5)).unwrap())
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|t| t.join().unwrap())
            .collect();
        for handle in &handles {
            assert!(runner.wait(handle).state().is_terminal());
        }

        let mut active: Option<JobId> = None;
        let mut terminal: HashMap<JobId, JobState> = HashMap::new();
        for t in lock(&log).iter() {
            if t.from == JobState::Idle && t.to == JobState::Staging {
                assert_eq!(active, None, "{} started while another job was running", t.id);
                active = Some(t.id);
            }
            if t.to.is_terminal() {
                terminal.insert(t.id, t.to);
                if active == Some(t.id) {
                    active = None;
                }
            }
        }
        assert_eq!(active, None);
        assert!(terminal.values().any(|s| *s == JobState::Succeeded));
    }

    #[test]
    fn test_shutdown_refuses_new_work() {
        let mut runner = JobRunner::new(RunnerConfig::default());
        let handle = runner.request_conversion(square_emb()).unwrap();
        runner.wait(&handle);

        runner.shutdown();
        runner.shutdown();
        assert_eq!(
            runner.request_conversion(square_emb()).unwrap_err(),
            RunnerError::ShutDown
        );
    }
}

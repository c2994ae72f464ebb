//! Job handler trait, registry and the handlers for each job class.

use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

use broker_core::{
    ExecutionTask, ExecutionTime, JobEvent, JobId, JobMetadataPatch, JobOutcome, JobRequest,
    JobStatus, JobType, MetadataStatus, QuantifyRequest, SequenceJob, ValidationError,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use storage::{CompletionTracker, JobStorage, StorageError, TrackerError};
use tokio::sync::broadcast;

use crate::engine::{Engine, EngineError, EngineInvocation};

/// Future returned by [`JobHandler::handle`].
pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = Result<JobOutcome, HandlerError>> + Send + 'a>>;

/// Future returned by [`JobHandler::on_recorded`].
pub type HookFuture<'a> = Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send + 'a>>;

#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("{handler} handler cannot run a {actual} job")]
    WrongJobType { handler: JobType, actual: JobType },

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("failed to stage job files: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("object storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("completion tracking failed: {0}")]
    Tracker(#[from] TrackerError),

    #[error("failed to encode result: {0}")]
    Json(#[from] serde_json::Error),
}

/// Runs jobs of one class.
///
/// Execution failures belong in the returned [`JobOutcome`]; an `Err` from
/// [`handle`](JobHandler::handle) is recorded by the worker as a failed
/// outcome carrying the error text.
pub trait JobHandler: Send + Sync + 'static {
    /// The job class this handler processes.
    fn job_type(&self) -> JobType;

    /// Execute the job.
    fn handle<'a>(&'a self, job_id: JobId, request: &'a JobRequest) -> HandlerFuture<'a>;

    /// Follow-up work once the terminal status is durably recorded.
    ///
    /// Runs again when a message for an already-finished job is redelivered,
    /// so it must be idempotent.
    fn on_recorded<'a>(
        &'a self,
        _job_id: JobId,
        _request: &'a JobRequest,
        _outcome: &'a JobOutcome,
    ) -> HookFuture<'a> {
        Box::pin(async { Ok(()) })
    }
}

/// Handlers keyed by job class.
#[derive(Default)]
pub struct JobHandlerRegistry {
    handlers: HashMap<JobType, Arc<dyn JobHandler>>,
}

impl JobHandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register a handler, replacing any previous one for its job class.
    pub fn register<H: JobHandler>(&mut self, handler: H) {
        self.handlers.insert(handler.job_type(), Arc::new(handler));
    }

    pub fn get(&self, job_type: JobType) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(&job_type).cloned()
    }

    pub fn has_handler(&self, job_type: JobType) -> bool {
        self.handlers.contains_key(&job_type)
    }

    pub fn job_types(&self) -> Vec<JobType> {
        self.handlers.keys().copied().collect()
    }
}

/// A handler built from a closure.
pub struct FnHandler<F>
where
    F: Fn(JobId, &JobRequest) -> HandlerFuture<'static> + Send + Sync + 'static,
{
    job_type: JobType,
    handler: F,
}

impl<F> FnHandler<F>
where
    F: Fn(JobId, &JobRequest) -> HandlerFuture<'static> + Send + Sync + 'static,
{
    pub fn new(job_type: JobType, handler: F) -> Self {
        Self { job_type, handler }
    }
}

impl<F> JobHandler for FnHandler<F>
where
    F: Fn(JobId, &JobRequest) -> HandlerFuture<'static> + Send + Sync + 'static,
{
    fn job_type(&self) -> JobType {
        self.job_type
    }

    fn handle<'a>(&'a self, job_id: JobId, request: &'a JobRequest) -> HandlerFuture<'a> {
        (self.handler)(job_id, request)
    }
}

/// Build a [`FnHandler`] from an async block over an owned request.
#[macro_export]
macro_rules! job_handler {
    ($job_type:expr, |$job_id:ident, $request:ident| $body:expr) => {
        $crate::FnHandler::new(
            $job_type,
            |$job_id: $crate::broker_core::JobId, $request: &$crate::broker_core::JobRequest| {
                let $request = $request.clone();
                Box::pin(async move {
                    let outcome: Result<$crate::broker_core::JobOutcome, $crate::HandlerError> = $body;
                    outcome
                })
            },
        )
    };
}

fn millis(since: Instant) -> u64 {
    u64::try_from(since.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// Command-line flags for a quantification request, output and models excluded.
pub fn quantify_flags(request: &QuantifyRequest) -> Vec<String> {
    let mut flags = Vec::new();
    let switches = [
        ("--bdd", request.bdd),
        ("--zbdd", request.zbdd),
        ("--mocus", request.mocus),
        ("--prime-implicants", request.prime_implicants),
        ("--probability", request.probability),
        ("--importance", request.importance),
        ("--uncertainty", request.uncertainty),
        ("--ccf", request.ccf),
        ("--sil", request.sil),
        ("--rare-event", request.rare_event),
        ("--mcub", request.mcub),
        ("--no-indent", request.no_indent),
    ];
    for (flag, value) in switches {
        if value == Some(true) {
            flags.push(flag.to_string());
        }
    }

    let mut option = |flag: &str, value: Option<String>| {
        if let Some(value) = value {
            flags.push(flag.to_string());
            flags.push(value);
        }
    };
    option("--limit-order", request.limit_order.map(|v| v.to_string()));
    option("--cut-off", request.cut_off.map(|v| v.to_string()));
    option("--mission-time", request.mission_time.map(|v| v.to_string()));
    option("--time-step", request.time_step.map(|v| v.to_string()));
    option("--num-trials", request.num_trials.map(|v| v.to_string()));
    option("--num-quantiles", request.num_quantiles.map(|v| v.to_string()));
    option("--num-bins", request.num_bins.map(|v| v.to_string()));
    option("--seed", request.seed.map(|v| v.to_string()));
    option("--verbosity", request.verbosity.map(|v| v.to_string()));
    flags
}

/// Runs the quantification engine over the request's models.
#[derive(Clone)]
pub struct QuantificationHandler {
    engine: Arc<dyn Engine>,
    program: String,
}

impl QuantificationHandler {
    pub const DEFAULT_PROGRAM: &'static str = "scram-cli";

    pub fn new(engine: Arc<dyn Engine>) -> Self {
        Self {
            engine,
            program: Self::DEFAULT_PROGRAM.to_string(),
        }
    }

    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    /// Stage the models in a scratch directory, run the engine and collect
    /// the report. The directory is removed when this returns.
    pub async fn quantify(
        &self,
        job_id: JobId,
        request: &QuantifyRequest,
    ) -> Result<JobOutcome, HandlerError> {
        let started = Instant::now();
        let workdir = tempfile::Builder::new().prefix("quantify-").tempdir()?;

        let mut model_paths = Vec::new();
        for (index, model) in request.decoded_models()?.into_iter().enumerate() {
            let path = workdir.path().join(format!("models-{index}.xml"));
            tokio::fs::write(&path, model).await?;
            model_paths.push(path.to_string_lossy().into_owned());
        }
        let output_path = workdir.path().join("result.xml");

        let invocation = EngineInvocation::new(&self.program)
            .args(quantify_flags(request))
            .arg("--output")
            .arg(output_path.to_string_lossy())
            .args(model_paths);
        let prepare_ms = millis(started);

        tracing::debug!(job_id = %job_id, args = ?invocation.args, "Running quantification");
        let engine_started = Instant::now();
        let output = self.engine.run(&invocation).await?;
        let engine_ms = millis(engine_started);

        let collect_started = Instant::now();
        let results = read_report(&output_path).await?;
        let execution_time = ExecutionTime {
            prepare_ms,
            engine_ms,
            collect_ms: millis(collect_started),
            total_ms: millis(started),
        };

        Ok(JobOutcome::from_exit(output.exit_code, output.stdout, output.stderr)
            .with_results(results)
            .with_execution_time(execution_time))
    }
}

async fn read_report(path: &Path) -> Result<Vec<String>, std::io::Error> {
    match tokio::fs::read_to_string(path).await {
        Ok(report) => Ok(vec![report]),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e),
    }
}

impl JobHandler for QuantificationHandler {
    fn job_type(&self) -> JobType {
        JobType::Quantification
    }

    fn handle<'a>(&'a self, job_id: JobId, request: &'a JobRequest) -> HandlerFuture<'a> {
        Box::pin(async move {
            match request {
                JobRequest::Quantification(request) => self.quantify(job_id, request).await,
                other => Err(HandlerError::WrongJobType {
                    handler: JobType::Quantification,
                    actual: other.job_type(),
                }),
            }
        })
    }
}

/// Runs an allow-listed executable with the task's arguments.
#[derive(Clone)]
pub struct ExecutableHandler {
    engine: Arc<dyn Engine>,
}

impl ExecutableHandler {
    pub fn new(engine: Arc<dyn Engine>) -> Self {
        Self { engine }
    }

    pub fn invocation(task: &ExecutionTask) -> EngineInvocation {
        EngineInvocation {
            program: task.executable.program().to_string(),
            args: task.arguments.clone(),
            env: task.env_pairs(),
            stdin: task.stdin.clone(),
            tty: task.tty,
        }
    }

    async fn execute(&self, job_id: JobId, task: &ExecutionTask) -> Result<JobOutcome, HandlerError> {
        let invocation = Self::invocation(task);
        tracing::debug!(job_id = %job_id, executable = %task.executable, "Running executable task");
        let output = self.engine.run(&invocation).await?;
        let engine_ms = u64::try_from(output.elapsed.as_millis()).unwrap_or(u64::MAX);
        Ok(
            JobOutcome::from_exit(output.exit_code, output.stdout, output.stderr).with_execution_time(
                ExecutionTime {
                    engine_ms,
                    total_ms: engine_ms,
                    ..Default::default()
                },
            ),
        )
    }
}

impl JobHandler for ExecutableHandler {
    fn job_type(&self) -> JobType {
        JobType::Executable
    }

    fn handle<'a>(&'a self, job_id: JobId, request: &'a JobRequest) -> HandlerFuture<'a> {
        Box::pin(async move {
            match request {
                JobRequest::Executable(task) => self.execute(job_id, task).await,
                other => Err(HandlerError::WrongJobType {
                    handler: JobType::Executable,
                    actual: other.job_type(),
                }),
            }
        })
    }
}

/// Result of one fan-out child as stored under its parent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildResult {
    pub job_id: JobId,
    pub sequence_id: String,
    pub event_tree: String,
    pub sequence: String,
    pub status: JobStatus,
    pub exit_code: i32,
    #[serde(default)]
    pub results: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Aggregated output document of a completed fan-out parent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FanInReport {
    pub parent_job_id: JobId,
    pub completed: usize,
    pub failed: usize,
    pub children: Vec<ChildResult>,
}

/// Quantifies one sequence of a fan-out set and drives the parent's fan-in.
#[derive(Clone)]
pub struct SequenceHandler {
    quantify: QuantificationHandler,
    jobs: JobStorage,
    tracker: CompletionTracker,
    events: Option<broadcast::Sender<JobEvent>>,
}

impl SequenceHandler {
    pub fn new(quantify: QuantificationHandler, jobs: JobStorage) -> Self {
        Self {
            quantify,
            tracker: CompletionTracker::new(jobs.clone()),
            jobs,
            events: None,
        }
    }

    pub fn with_events(mut self, events: broadcast::Sender<JobEvent>) -> Self {
        self.events = Some(events);
        self
    }

    fn emit(&self, event: JobEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    /// Store the child's result, write its marker and complete the parent
    /// when every child has a marker.
    async fn record_child(
        &self,
        job_id: JobId,
        job: &SequenceJob,
        outcome: &JobOutcome,
    ) -> Result<(), HandlerError> {
        let parent = job.parent_job_id;
        let parent_id = parent.to_string();
        let child = ChildResult {
            job_id,
            sequence_id: job.sequence_id.clone(),
            event_tree: job.event_tree.clone(),
            sequence: job.sequence.clone(),
            status: outcome.status,
            exit_code: outcome.exit_code,
            results: outcome.results.clone(),
            error: outcome.error.clone(),
        };
        self.jobs
            .put_child_result(&parent_id, &job.sequence_id, &child)
            .await?;
        self.tracker.mark_completed(parent, &job.sequence_id).await?;

        let metadata = match self.jobs.get_job_metadata(&parent_id).await {
            Ok(metadata) => metadata,
            Err(StorageError::NotFound(_)) => {
                tracing::warn!(parent_job_id = %parent, "Child finished for a parent without metadata");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        if metadata.status.is_terminal() {
            return Ok(());
        }

        // Counted after the running write, so whichever child writes last
        // also sees every marker and leaves the parent completed.
        if metadata.status != MetadataStatus::Running {
            match self
                .jobs
                .update_job_metadata(&parent_id, JobMetadataPatch::status(MetadataStatus::Running))
                .await
            {
                Ok(_) => {}
                Err(StorageError::Finalized(_)) => return Ok(()),
                Err(e) => return Err(e.into()),
            }
        }
        let total = metadata.child_jobs.len();
        let completed = self.tracker.count_completed(parent).await?;
        self.emit(JobEvent::ChildCompleted {
            parent_job_id: parent,
            sequence_id: job.sequence_id.clone(),
            completed,
            total,
            timestamp: Utc::now(),
        });

        if completed < total {
            tracing::debug!(parent_job_id = %parent, completed, total, "Fan-in pending");
            return Ok(());
        }

        if self.jobs.get_job_metadata(&parent_id).await?.status.is_terminal() {
            tracing::debug!(parent_job_id = %parent, "Fan-in already completed by a sibling");
            return Ok(());
        }

        let children: Vec<ChildResult> = self
            .jobs
            .child_results::<ChildResult>(&parent_id)
            .await?
            .into_iter()
            .map(|(_, child)| child)
            .collect();
        let failed = children.iter().filter(|c| c.status == JobStatus::Failed).count();
        let report = FanInReport {
            parent_job_id: parent,
            completed: children.len() - failed,
            failed,
            children,
        };
        let document = serde_json::to_string(&report)?;
        let input_id = metadata.input_id.clone().unwrap_or_default();
        let output_id = self.jobs.store_output_data(&document, &input_id).await?;

        let mut patch = JobMetadataPatch::status(MetadataStatus::Completed).with_output_id(&output_id);
        if failed > 0 {
            patch.error = Some(format!("{failed} of {total} child jobs failed"));
        }
        match self.jobs.update_job_metadata(&parent_id, patch).await {
            Ok(_) => {}
            Err(StorageError::Finalized(_)) => {
                tracing::debug!(parent_job_id = %parent, "Fan-in already completed by a sibling");
                if let Err(e) = self.jobs.delete_output_data(&output_id).await {
                    tracing::warn!(output_id = %output_id, error = %e, "Failed to remove duplicate fan-in output");
                }
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }

        tracing::info!(parent_job_id = %parent, output_id = %output_id, failed, "Fan-in completed");
        self.emit(JobEvent::FanInCompleted {
            parent_job_id: parent,
            output_id,
            timestamp: Utc::now(),
        });
        Ok(())
    }
}

impl JobHandler for SequenceHandler {
    fn job_type(&self) -> JobType {
        JobType::DistributedSequenceChild
    }

    fn handle<'a>(&'a self, job_id: JobId, request: &'a JobRequest) -> HandlerFuture<'a> {
        Box::pin(async move {
            match request {
                JobRequest::Sequence(job) => self.quantify.quantify(job_id, &job.request).await,
                other => Err(HandlerError::WrongJobType {
                    handler: JobType::DistributedSequenceChild,
                    actual: other.job_type(),
                }),
            }
        })
    }

    fn on_recorded<'a>(
        &'a self,
        job_id: JobId,
        request: &'a JobRequest,
        outcome: &'a JobOutcome,
    ) -> HookFuture<'a> {
        Box::pin(async move {
            match request {
                JobRequest::Sequence(job) => self.record_child(job_id, job, outcome).await,
                _ => Ok(()),
            }
        })
    }
}

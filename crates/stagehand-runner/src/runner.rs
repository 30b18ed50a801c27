//! Poll, claim and execute stages.

use stagehand_core::logs::Line;
use stagehand_core::step::EXIT_CODE_SKIP_REMAINING;
use stagehand_core::{
    BuildId, BuildManager, Filter, Result, Stage, StageId, Status, Step, StepId, now,
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::engine::{Engine, EngineError, Plan, RunPolicy};
use crate::table::{self, StepTable};

/// Pause after a failed poll before asking again.
const ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Buffered output lines per running step.
const OUTPUT_BUFFER: usize = 1024;

/// Exit code recorded for a step the host killed for memory.
const EXIT_CODE_OOM: i32 = 137;

/// Agent settings.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Name reported when claiming a stage.
    pub machine: String,
    /// Concurrent poll-claim-execute loops.
    pub workers: usize,
    pub kind: String,
    pub kind_type: String,
    pub os: String,
    pub arch: String,
    pub kernel: String,
    pub variant: String,
    pub labels: HashMap<String, String>,
    /// Used when the repository sets no timeout of its own.
    pub stage_timeout: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            machine: "localhost".into(),
            workers: 2,
            kind: "pipeline".into(),
            kind_type: "docker".into(),
            os: std::env::consts::OS.into(),
            arch: platform_arch().into(),
            kernel: String::new(),
            variant: String::new(),
            labels: HashMap::new(),
            stage_timeout: Duration::from_secs(60 * 60),
        }
    }
}

fn platform_arch() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        "x86" => "386",
        other => other,
    }
}

/// How an execution ended when no step broke it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Completed,
    Interrupted,
}

/// Executes stages handed out by a [`BuildManager`].
pub struct Runner {
    config: RunnerConfig,
    manager: Arc<dyn BuildManager>,
    engine: Arc<dyn Engine>,
}

impl Runner {
    pub fn new(
        config: RunnerConfig,
        manager: Arc<dyn BuildManager>,
        engine: Arc<dyn Engine>,
    ) -> Self {
        Self {
            config,
            manager,
            engine,
        }
    }

    /// What this agent advertises when polling.
    pub fn filter(&self) -> Filter {
        Filter {
            kind: self.config.kind.clone(),
            kind_type: self.config.kind_type.clone(),
            os: self.config.os.clone(),
            arch: self.config.arch.clone(),
            variant: self.config.variant.clone(),
            kernel: self.config.kernel.clone(),
            labels: self.config.labels.clone(),
        }
    }

    /// Run the worker pool until `shutdown` fires. A stage already executing
    /// is finished first.
    pub async fn start(self: Arc<Self>, shutdown: CancellationToken) {
        let workers = self.config.workers.max(1);
        let mut pool = JoinSet::new();
        for worker in 0..workers {
            let runner = self.clone();
            let shutdown = shutdown.clone();
            pool.spawn(async move { runner.work(worker, shutdown).await });
        }
        info!(machine = %self.config.machine, workers, "Runner started");

        while let Some(joined) = pool.join_next().await {
            if let Err(err) = joined {
                error!(error = %err, "Runner worker failed");
            }
        }
        info!(machine = %self.config.machine, "Runner stopped");
    }

    async fn work(&self, worker: usize, shutdown: CancellationToken) {
        while !shutdown.is_cancelled() {
            // errors are logged where they happen; the loop keeps going
            if let Err(err) = self.poll(&shutdown).await {
                debug!(worker, error = %err, "Poll failed");
                tokio::select! {
                    _ = shutdown.cancelled() => {}
                    _ = tokio::time::sleep(ERROR_BACKOFF) => {}
                }
            }
        }
    }

    /// Request one stage, claim it and run it while watching the build for
    /// cancellation.
    pub async fn poll(&self, shutdown: &CancellationToken) -> Result<()> {
        let filter = self.filter();
        debug!(machine = %self.config.machine, os = %filter.os, arch = %filter.arch, "Polling queue");

        let polled = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            polled = self.manager.request(&filter) => polled,
        };
        let stage = match polled {
            Ok(Some(stage)) if stage.id.is_set() => stage,
            Ok(_) => return Ok(()),
            Err(err) => {
                warn!(machine = %self.config.machine, error = %err, "Cannot get queue item");
                return Err(err);
            }
        };

        match self.manager.accept(stage.id, &self.config.machine).await {
            Ok(_) => {}
            Err(err) if err.is_optimistic_lock() => {
                debug!(stage.id = %stage.id, "Stage claimed by another agent");
                return Ok(());
            }
            Err(err) => {
                warn!(
                    stage.id = %stage.id,
                    build.id = %stage.build_id,
                    repo.id = %stage.repo_id,
                    error = %err,
                    "Cannot accept stage"
                );
                return Err(err);
            }
        }

        let cancel = CancellationToken::new();
        let watcher = tokio::spawn(watch(
            self.manager.clone(),
            stage.build_id,
            cancel.clone(),
        ));
        let result = self.run(stage.id, &cancel).await;
        watcher.abort();
        result
    }

    /// Execute a claimed stage and report how it ended.
    pub async fn run(&self, id: StageId, cancel: &CancellationToken) -> Result<()> {
        let ctx = self
            .manager
            .details(id)
            .await
            .inspect_err(|e| warn!(stage.id = %id, error = %e, "Cannot get stage details"))?;
        let mut stage = ctx.stage.clone();

        let netrc = match self.manager.netrc(ctx.repository.id).await {
            Ok(netrc) => netrc,
            Err(err) => {
                warn!(repo = %ctx.repository.slug, error = %err, "Cannot get netrc");
                return self
                    .handle_error(&mut stage, &EngineError::Other(err.to_string()))
                    .await;
            }
        };

        if matches!(ctx.build.status, Status::Killed | Status::Skipped) {
            info!(build.id = %ctx.build.id, "Not running a cancelled build");
            return Ok(());
        }

        let plan = match self.engine.compile(&ctx, netrc.as_ref()).await {
            Ok(plan) => plan,
            Err(err) => {
                warn!(stage.id = %id, error = %err, "Cannot compile stage");
                return self.handle_error(&mut stage, &err).await;
            }
        };

        stage.steps = match register(&plan, &stage) {
            Ok(steps) => steps,
            Err(err) => {
                warn!(stage.id = %id, error = %err, "Cannot register steps");
                return self.handle_error(&mut stage, &err).await;
            }
        };
        stage.status = Status::Running;
        stage.started = now();
        stage.machine = self.config.machine.clone();
        if let Err(err) = self.manager.before_all(&mut stage).await {
            warn!(stage.id = %id, error = %err, "Cannot initialize stage");
            return self
                .handle_error(&mut stage, &EngineError::Other(err.to_string()))
                .await;
        }

        let limit = if ctx.repository.timeout > 0 {
            Duration::from_secs(ctx.repository.timeout.unsigned_abs() * 60)
        } else {
            self.config.stage_timeout
        };
        info!(
            stage.id = %id,
            stage.name = %stage.name,
            repo = %ctx.repository.slug,
            build.number = ctx.build.number,
            "Starting execution"
        );

        let table = StepTable::new(&stage.steps);
        let executed = timeout(limit, self.execute(&plan, &table, cancel)).await;
        stage.steps = table.settle();

        match executed {
            Err(_) => {
                warn!(stage.id = %id, ?limit, "Stage timed out");
                self.handle_error(&mut stage, &EngineError::Other("execution timed out".into()))
                    .await
            }
            Ok(Err(err)) => {
                info!(stage.id = %id, error = %err, "Execution failed");
                self.handle_error(&mut stage, &err).await
            }
            Ok(Ok(outcome)) => {
                info!(
                    stage.id = %id,
                    interrupted = outcome == Outcome::Interrupted,
                    "Execution complete"
                );
                stage.status = Status::Passing;
                stage.stopped = now();
                match self.manager.after_all(&mut stage).await {
                    Err(err) if outcome == Outcome::Interrupted && err.is_optimistic_lock() => {
                        debug!(stage.id = %id, "Stage already finalized by cancellation");
                        Ok(())
                    }
                    result => result,
                }
            }
        }
    }

    /// Report a stage that could not run to completion.
    async fn handle_error(&self, stage: &mut Stage, err: &EngineError) -> Result<()> {
        let stopped = now();
        table::settle(&mut stage.steps, stopped);
        stage.status = Status::Error;
        stage.error = err.to_string();
        stage.stopped = stopped;
        if let EngineError::Exit(code) = err {
            stage.status = Status::Failing;
            stage.error.clear();
            stage.exit_code = *code;
        }
        self.manager.after_all(stage).await
    }

    async fn execute(
        &self,
        plan: &Plan,
        table: &StepTable,
        cancel: &CancellationToken,
    ) -> std::result::Result<Outcome, EngineError> {
        let mut failed = None;

        for spec in plan.runnable() {
            if cancel.is_cancelled() {
                return Ok(Outcome::Interrupted);
            }
            let selected = match spec.policy {
                RunPolicy::Always => true,
                RunPolicy::OnSuccess => failed.is_none(),
                RunPolicy::OnFailure => failed.is_some(),
                RunPolicy::Never => false,
            };
            if !selected {
                debug!(step.name = %spec.name, "Step not selected");
                continue;
            }

            let step = self.before_step(table, &spec.name).await?;
            let (tx, rx) = mpsc::channel(OUTPUT_BUFFER);
            let running = async {
                tokio::select! {
                    result = self.engine.run_step(spec, tx) => Some(result),
                    _ = cancel.cancelled() => None,
                }
            };
            let (result, lines) = tokio::join!(running, self.forward(step.id, rx));

            let exit_code = match result {
                None => {
                    debug!(step.name = %spec.name, "Step interrupted");
                    return Ok(Outcome::Interrupted);
                }
                Some(Ok(code)) | Some(Err(EngineError::Exit(code))) => code,
                Some(Err(EngineError::Oom)) => {
                    self.upload(step.id, &lines).await;
                    self.after_step(table, &spec.name, EXIT_CODE_OOM).await?;
                    return Err(EngineError::Oom);
                }
                Some(Err(err)) => return Err(err),
            };
            self.upload(step.id, &lines).await;
            self.after_step(table, &spec.name, exit_code).await?;

            if exit_code == EXIT_CODE_SKIP_REMAINING {
                debug!(step.name = %spec.name, "Step ended the stage early");
                return Ok(Outcome::Completed);
            }
            if exit_code != 0 && !spec.errignore && failed.is_none() {
                failed = Some(exit_code);
            }
        }

        match failed {
            Some(code) => Err(EngineError::Exit(code)),
            None => Ok(Outcome::Completed),
        }
    }

    async fn before_step(
        &self,
        table: &StepTable,
        name: &str,
    ) -> std::result::Result<Step, EngineError> {
        let mut step = table
            .start(name)
            .ok_or_else(|| EngineError::Other(format!("unknown step {name}")))?;
        self.manager
            .before(&mut step)
            .await
            .map_err(|e| EngineError::Other(e.to_string()))?;
        table.sync(&step);
        Ok(step)
    }

    async fn after_step(
        &self,
        table: &StepTable,
        name: &str,
        exit_code: i32,
    ) -> std::result::Result<(), EngineError> {
        let mut step = table
            .finish(name, exit_code)
            .ok_or_else(|| EngineError::Other(format!("unknown step {name}")))?;
        self.manager
            .after(&mut step)
            .await
            .map_err(|e| EngineError::Other(e.to_string()))?;
        table.sync(&step);
        Ok(())
    }

    /// Stream output lines to the server as they arrive, returning all of
    /// them once the step closes its output.
    async fn forward(&self, step: StepId, mut output: mpsc::Receiver<String>) -> Vec<Line> {
        let started = Instant::now();
        let mut lines = Vec::new();
        while let Some(message) = output.recv().await {
            let line = Line {
                number: lines.len() as i64,
                message,
                timestamp: started.elapsed().as_secs() as i64,
            };
            if let Err(err) = self.manager.write(step, &line).await {
                debug!(step.id = %step, error = %err, "Cannot stream log line");
            }
            lines.push(line);
        }
        lines
    }

    async fn upload(&self, step: StepId, lines: &[Line]) {
        let raw = match serde_json::to_vec(lines) {
            Ok(raw) => raw,
            Err(err) => {
                warn!(step.id = %step, error = %err, "Cannot encode logs");
                return;
            }
        };
        if let Err(err) = self.manager.upload_bytes(step, &raw).await {
            warn!(step.id = %step, error = %err, "Cannot upload logs");
        }
    }
}

/// The steps reported to the server for a plan. Steps are tracked by name,
/// so names must be unique within the stage.
fn register(plan: &Plan, stage: &Stage) -> std::result::Result<Vec<Step>, EngineError> {
    let mut seen = HashSet::new();
    plan.runnable()
        .enumerate()
        .map(|(i, spec)| {
            if !seen.insert(spec.name.as_str()) {
                return Err(EngineError::Other(format!("duplicate step name {}", spec.name)));
            }
            Ok(Step {
                number: i as i64 + 1,
                name: spec.name.clone(),
                stage_id: stage.id,
                status: Status::Pending,
                errignore: spec.errignore,
                ..Default::default()
            })
        })
        .collect()
}

/// Long-poll the build until it is done, then cancel the execution.
async fn watch(manager: Arc<dyn BuildManager>, build: BuildId, cancel: CancellationToken) {
    loop {
        match manager.watch(build).await {
            Ok(true) => {
                debug!(build.id = %build, "Received cancel signal");
                cancel.cancel();
                return;
            }
            Ok(false) => {}
            Err(err) if err.is_deadline() => {}
            Err(err) => {
                debug!(build.id = %build, error = %err, "Stopped watching for cancellation");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::StepSpec;
    use async_trait::async_trait;
    use bytes::Bytes;
    use stagehand_core::logs::CardInput;
    use stagehand_core::{Build, Context, Error, Netrc, RepoId, Repository};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

    #[derive(Default)]
    struct FakeManager {
        queued: Mutex<Option<Stage>>,
        context: Mutex<Context>,
        conflict: AtomicBool,
        cancelled: AtomicBool,
        ids: AtomicI64,
        reported: Mutex<Vec<(String, Status)>>,
        lines: Mutex<Vec<(StepId, Line)>>,
        uploads: Mutex<Vec<(StepId, Bytes)>>,
        finished: Mutex<Option<Stage>>,
        finalized: AtomicBool,
        details_calls: AtomicI64,
    }

    impl FakeManager {
        fn new(build_status: Status) -> Self {
            let manager = Self::default();
            *manager.context.lock().unwrap() = Context {
                repository: Repository {
                    id: RepoId(1),
                    slug: "octocat/hello-world".into(),
                    ..Default::default()
                },
                build: Build {
                    id: BuildId(1),
                    number: 1,
                    status: build_status,
                    ..Default::default()
                },
                stage: Stage {
                    id: StageId(1),
                    build_id: BuildId(1),
                    number: 1,
                    name: "default".into(),
                    status: Status::Pending,
                    version: 1,
                    ..Default::default()
                },
                ..Default::default()
            };
            manager
        }

        fn queue(&self) {
            let stage = self.context.lock().unwrap().stage.clone();
            *self.queued.lock().unwrap() = Some(stage);
        }

        fn finished(&self) -> Stage {
            self.finished.lock().unwrap().clone().unwrap()
        }

        fn statuses(&self) -> Vec<(String, Status)> {
            self.reported.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl BuildManager for FakeManager {
        async fn request(&self, _filter: &Filter) -> Result<Option<Stage>> {
            let queued = self.queued.lock().unwrap().take();
            if queued.is_none() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            Ok(queued)
        }

        async fn accept(&self, id: StageId, machine: &str) -> Result<Stage> {
            if self.conflict.load(Ordering::SeqCst) {
                return Err(Error::OptimisticLock);
            }
            let mut context = self.context.lock().unwrap();
            context.stage.machine = machine.to_string();
            context.stage.version += 1;
            assert_eq!(context.stage.id, id);
            Ok(context.stage.clone())
        }

        async fn netrc(&self, _id: RepoId) -> Result<Option<Netrc>> {
            Ok(None)
        }

        async fn details(&self, _id: StageId) -> Result<Context> {
            self.details_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.context.lock().unwrap().clone())
        }

        async fn before(&self, step: &mut Step) -> Result<()> {
            assert!(step.id.is_set());
            step.version += 1;
            self.reported
                .lock()
                .unwrap()
                .push((step.name.clone(), step.status));
            Ok(())
        }

        async fn after(&self, step: &mut Step) -> Result<()> {
            step.version += 1;
            self.reported
                .lock()
                .unwrap()
                .push((step.name.clone(), step.status));
            Ok(())
        }

        async fn before_all(&self, stage: &mut Stage) -> Result<()> {
            stage.version += 1;
            for step in &mut stage.steps {
                step.id = StepId(self.ids.fetch_add(1, Ordering::SeqCst) + 1);
                step.version = 1;
            }
            Ok(())
        }

        async fn after_all(&self, stage: &mut Stage) -> Result<()> {
            if self.finalized.load(Ordering::SeqCst) {
                return Err(Error::OptimisticLock);
            }
            *self.finished.lock().unwrap() = Some(stage.clone());
            Ok(())
        }

        async fn watch(&self, _id: BuildId) -> Result<bool> {
            if self.cancelled.load(Ordering::SeqCst) {
                return Ok(true);
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
            Err(Error::DeadlineExceeded)
        }

        async fn write(&self, step: StepId, line: &Line) -> Result<()> {
            self.lines.lock().unwrap().push((step, line.clone()));
            Ok(())
        }

        async fn upload(&self, step: StepId, data: Bytes) -> Result<()> {
            self.uploads.lock().unwrap().push((step, data));
            Ok(())
        }

        async fn upload_card(&self, _step: StepId, _card: &CardInput) -> Result<()> {
            Ok(())
        }
    }

    #[derive(Clone)]
    enum Script {
        Exit(i32, Vec<&'static str>),
        Oom,
        Hang,
    }

    struct FakeEngine {
        steps: Vec<(StepSpec, Script)>,
        compile_error: Option<&'static str>,
    }

    impl FakeEngine {
        fn new(steps: Vec<(StepSpec, Script)>) -> Self {
            Self {
                steps,
                compile_error: None,
            }
        }
    }

    #[async_trait]
    impl Engine for FakeEngine {
        async fn compile(
            &self,
            _ctx: &Context,
            _netrc: Option<&Netrc>,
        ) -> std::result::Result<Plan, EngineError> {
            if let Some(message) = self.compile_error {
                return Err(EngineError::Other(message.into()));
            }
            Ok(Plan {
                steps: self.steps.iter().map(|(spec, _)| spec.clone()).collect(),
            })
        }

        async fn run_step(
            &self,
            step: &StepSpec,
            output: mpsc::Sender<String>,
        ) -> std::result::Result<i32, EngineError> {
            let script = self
                .steps
                .iter()
                .find(|(spec, _)| spec.name == step.name)
                .map(|(_, script)| script.clone())
                .unwrap();
            match script {
                Script::Exit(code, lines) => {
                    for line in lines {
                        output.send(line.to_string()).await.unwrap();
                    }
                    if code == 0 {
                        Ok(0)
                    } else {
                        Err(EngineError::Exit(code))
                    }
                }
                Script::Oom => Err(EngineError::Oom),
                Script::Hang => std::future::pending().await,
            }
        }
    }

    fn spec(name: &str, policy: RunPolicy) -> StepSpec {
        StepSpec {
            name: name.into(),
            policy,
            ..Default::default()
        }
    }

    fn runner(manager: Arc<FakeManager>, engine: FakeEngine) -> Runner {
        Runner::new(
            RunnerConfig {
                machine: "agent-1".into(),
                os: "linux".into(),
                arch: "amd64".into(),
                ..Default::default()
            },
            manager,
            Arc::new(engine),
        )
    }

    fn step_statuses(stage: &Stage) -> Vec<(&str, Status)> {
        stage
            .steps
            .iter()
            .map(|s| (s.name.as_str(), s.status))
            .collect()
    }

    #[tokio::test]
    async fn test_passing_stage() {
        let manager = Arc::new(FakeManager::new(Status::Running));
        let engine = FakeEngine::new(vec![
            (spec("clone", RunPolicy::OnSuccess), Script::Exit(0, vec!["+ git clone"])),
            (spec("test", RunPolicy::OnSuccess), Script::Exit(0, vec!["+ go test", "ok"])),
        ]);
        runner(manager.clone(), engine)
            .run(StageId(1), &CancellationToken::new())
            .await
            .unwrap();

        let stage = manager.finished();
        assert_eq!(stage.status, Status::Passing);
        assert_eq!(stage.machine, "agent-1");
        assert!(stage.started > 0 && stage.stopped >= stage.started);
        assert_eq!(
            step_statuses(&stage),
            vec![("clone", Status::Passing), ("test", Status::Passing)]
        );
        assert_eq!(
            manager.statuses(),
            vec![
                ("clone".to_string(), Status::Running),
                ("clone".to_string(), Status::Passing),
                ("test".to_string(), Status::Running),
                ("test".to_string(), Status::Passing),
            ]
        );

        let lines = manager.lines.lock().unwrap().clone();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[2].1.number, 1);
        assert_eq!(lines[2].1.message, "ok");

        let uploads = manager.uploads.lock().unwrap().clone();
        assert_eq!(uploads.len(), 2);
        let uploaded: Vec<Line> = serde_json::from_slice(&uploads[1].1).unwrap();
        assert_eq!(uploaded.len(), 2);
    }

    #[tokio::test]
    async fn test_failing_step_runs_failure_handlers() {
        let manager = Arc::new(FakeManager::new(Status::Running));
        let engine = FakeEngine::new(vec![
            (spec("test", RunPolicy::OnSuccess), Script::Exit(2, vec![])),
            (spec("publish", RunPolicy::OnSuccess), Script::Exit(0, vec![])),
            (spec("notify", RunPolicy::OnFailure), Script::Exit(0, vec![])),
            (spec("cleanup", RunPolicy::Always), Script::Exit(0, vec![])),
            (spec("disabled", RunPolicy::Never), Script::Exit(0, vec![])),
        ]);
        runner(manager.clone(), engine)
            .run(StageId(1), &CancellationToken::new())
            .await
            .unwrap();

        let stage = manager.finished();
        assert_eq!(stage.status, Status::Failing);
        assert_eq!(stage.exit_code, 2);
        assert!(stage.error.is_empty());
        assert_eq!(
            step_statuses(&stage),
            vec![
                ("test", Status::Failing),
                ("publish", Status::Skipped),
                ("notify", Status::Passing),
                ("cleanup", Status::Passing),
            ]
        );
    }

    #[tokio::test]
    async fn test_ignored_failure_passes() {
        let manager = Arc::new(FakeManager::new(Status::Running));
        let mut lint = spec("lint", RunPolicy::OnSuccess);
        lint.errignore = true;
        let engine = FakeEngine::new(vec![
            (lint, Script::Exit(1, vec![])),
            (spec("test", RunPolicy::OnSuccess), Script::Exit(0, vec![])),
        ]);
        runner(manager.clone(), engine)
            .run(StageId(1), &CancellationToken::new())
            .await
            .unwrap();

        let stage = manager.finished();
        assert_eq!(stage.status, Status::Passing);
        assert!(stage.steps[0].errignore);
        assert_eq!(stage.steps[0].status, Status::Failing);
        assert_eq!(stage.steps[1].status, Status::Passing);
    }

    #[tokio::test]
    async fn test_exit_78_skips_remaining_steps() {
        let manager = Arc::new(FakeManager::new(Status::Running));
        let engine = FakeEngine::new(vec![
            (spec("check", RunPolicy::OnSuccess), Script::Exit(78, vec![])),
            (spec("build", RunPolicy::OnSuccess), Script::Exit(0, vec![])),
        ]);
        runner(manager.clone(), engine)
            .run(StageId(1), &CancellationToken::new())
            .await
            .unwrap();

        let stage = manager.finished();
        assert_eq!(stage.status, Status::Passing);
        assert_eq!(stage.steps[0].exit_code, 78);
        assert_eq!(
            step_statuses(&stage),
            vec![("check", Status::Passing), ("build", Status::Skipped)]
        );
    }

    #[tokio::test]
    async fn test_oom_errors_stage() {
        let manager = Arc::new(FakeManager::new(Status::Running));
        let engine = FakeEngine::new(vec![
            (spec("build", RunPolicy::OnSuccess), Script::Oom),
            (spec("test", RunPolicy::OnSuccess), Script::Exit(0, vec![])),
        ]);
        runner(manager.clone(), engine)
            .run(StageId(1), &CancellationToken::new())
            .await
            .unwrap();

        let stage = manager.finished();
        assert_eq!(stage.status, Status::Error);
        assert_eq!(stage.error, "OOM kill signaled by host operating system");
        assert_eq!(stage.steps[0].exit_code, 137);
        assert_eq!(stage.steps[1].status, Status::Skipped);
    }

    #[tokio::test]
    async fn test_compile_error_reported() {
        let manager = Arc::new(FakeManager::new(Status::Running));
        let mut engine = FakeEngine::new(vec![]);
        engine.compile_error = Some("cannot find named pipeline");
        runner(manager.clone(), engine)
            .run(StageId(1), &CancellationToken::new())
            .await
            .unwrap();

        let stage = manager.finished();
        assert_eq!(stage.status, Status::Error);
        assert_eq!(stage.error, "cannot find named pipeline");
        assert!(stage.steps.is_empty());
    }

    #[tokio::test]
    async fn test_killed_build_not_executed() {
        let manager = Arc::new(FakeManager::new(Status::Killed));
        let engine = FakeEngine::new(vec![(
            spec("build", RunPolicy::OnSuccess),
            Script::Exit(0, vec![]),
        )]);
        runner(manager.clone(), engine)
            .run(StageId(1), &CancellationToken::new())
            .await
            .unwrap();

        assert!(manager.finished.lock().unwrap().is_none());
        assert!(manager.statuses().is_empty());
    }

    #[tokio::test]
    async fn test_stage_timeout_errors_stage() {
        let manager = Arc::new(FakeManager::new(Status::Running));
        let engine = FakeEngine::new(vec![
            (spec("build", RunPolicy::OnSuccess), Script::Hang),
            (spec("test", RunPolicy::OnSuccess), Script::Exit(0, vec![])),
        ]);
        let runner = Runner::new(
            RunnerConfig {
                stage_timeout: Duration::from_millis(20),
                ..Default::default()
            },
            manager.clone(),
            Arc::new(engine),
        );
        runner
            .run(StageId(1), &CancellationToken::new())
            .await
            .unwrap();

        let stage = manager.finished();
        assert_eq!(stage.status, Status::Error);
        assert_eq!(stage.error, "execution timed out");
        assert_eq!(
            step_statuses(&stage),
            vec![("build", Status::Passing), ("test", Status::Skipped)]
        );
        assert!(stage.steps[0].stopped > 0);
    }

    #[tokio::test]
    async fn test_cancelled_build_interrupts_execution() {
        let manager = Arc::new(FakeManager::new(Status::Running));
        manager.queue();
        let engine = FakeEngine::new(vec![
            (spec("build", RunPolicy::OnSuccess), Script::Hang),
            (spec("test", RunPolicy::OnSuccess), Script::Exit(0, vec![])),
        ]);
        let runner = runner(manager.clone(), engine);

        let signal = manager.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            signal.cancelled.store(true, Ordering::SeqCst);
        });
        runner.poll(&CancellationToken::new()).await.unwrap();

        let stage = manager.finished();
        assert_eq!(stage.status, Status::Passing);
        assert_eq!(
            step_statuses(&stage),
            vec![("build", Status::Passing), ("test", Status::Skipped)]
        );
    }

    #[tokio::test]
    async fn test_cancelled_stage_finalized_elsewhere_is_ok() {
        let manager = Arc::new(FakeManager::new(Status::Running));
        manager.queue();
        manager.finalized.store(true, Ordering::SeqCst);
        let engine = FakeEngine::new(vec![(spec("build", RunPolicy::OnSuccess), Script::Hang)]);
        let runner = runner(manager.clone(), engine);

        let signal = manager.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            signal.cancelled.store(true, Ordering::SeqCst);
        });
        runner.poll(&CancellationToken::new()).await.unwrap();
        assert!(manager.finished.lock().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_lock_error_without_cancel_propagates() {
        let manager = Arc::new(FakeManager::new(Status::Running));
        manager.finalized.store(true, Ordering::SeqCst);
        let engine = FakeEngine::new(vec![(
            spec("build", RunPolicy::OnSuccess),
            Script::Exit(0, vec![]),
        )]);
        let err = runner(manager, engine)
            .run(StageId(1), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.is_optimistic_lock());
    }

    #[tokio::test]
    async fn test_duplicate_step_names_error_stage() {
        let manager = Arc::new(FakeManager::new(Status::Running));
        let engine = FakeEngine::new(vec![
            (spec("build", RunPolicy::OnSuccess), Script::Exit(0, vec![])),
            (spec("build", RunPolicy::Always), Script::Exit(0, vec![])),
        ]);
        runner(manager.clone(), engine)
            .run(StageId(1), &CancellationToken::new())
            .await
            .unwrap();

        let stage = manager.finished();
        assert_eq!(stage.status, Status::Error);
        assert_eq!(stage.error, "duplicate step name build");
        assert!(stage.steps.is_empty());
        assert!(manager.statuses().is_empty());
    }

    #[test]
    fn test_disabled_step_may_share_a_name() {
        let plan = Plan {
            steps: vec![
                spec("build", RunPolicy::OnSuccess),
                spec("build", RunPolicy::Never),
            ],
        };
        let steps = register(&plan, &Stage::default()).unwrap();
        assert_eq!(steps.len(), 1);
    }

    #[tokio::test]
    async fn test_lost_accept_race_is_quiet() {
        let manager = Arc::new(FakeManager::new(Status::Running));
        manager.queue();
        manager.conflict.store(true, Ordering::SeqCst);
        let runner = runner(manager.clone(), FakeEngine::new(vec![]));

        runner.poll(&CancellationToken::new()).await.unwrap();
        assert_eq!(manager.details_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_empty_poll_is_ok() {
        let manager = Arc::new(FakeManager::new(Status::Running));
        let runner = runner(manager.clone(), FakeEngine::new(vec![]));
        runner.poll(&CancellationToken::new()).await.unwrap();
        assert_eq!(manager.details_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_pool_runs_queued_stage_and_stops() {
        let manager = Arc::new(FakeManager::new(Status::Running));
        manager.queue();
        let engine = FakeEngine::new(vec![(
            spec("build", RunPolicy::OnSuccess),
            Script::Exit(0, vec![]),
        )]);
        let runner = Arc::new(runner(manager.clone(), engine));

        let shutdown = CancellationToken::new();
        let pool = tokio::spawn(runner.start(shutdown.clone()));
        tokio::time::timeout(Duration::from_secs(5), async {
            while manager.finished.lock().unwrap().is_none() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), pool)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(manager.finished().status, Status::Passing);
    }

    #[test]
    fn test_filter_from_config() {
        let manager = Arc::new(FakeManager::default());
        let runner = Runner::new(
            RunnerConfig {
                os: "linux".into(),
                arch: "arm64".into(),
                variant: "v8".into(),
                labels: HashMap::from([("gpu".to_string(), "true".to_string())]),
                ..Default::default()
            },
            manager,
            Arc::new(FakeEngine::new(vec![])),
        );
        let filter = runner.filter();
        assert_eq!(filter.kind, "pipeline");
        assert_eq!(filter.kind_type, "docker");
        assert_eq!(filter.arch, "arm64");
        assert_eq!(filter.variant, "v8");
        assert_eq!(filter.labels["gpu"], "true");
    }

    /// A runner talking to a real server over the RPC client.
    mod remote {
        use super::*;
        use stagehand_core::services::{ConfigArgs, ConfigService};
        use stagehand_core::{BuildCanceler, Config, Event, Scheduler, User};
        use stagehand_db::Stores;
        use stagehand_manager::{
            Hub, LiveLog, Manager, ManagerConfig, NoopStatus, PassthroughConverter, Services,
            TokenNetrcService,
        };
        use stagehand_rpc::{Client, ClientConfig, RpcState, ServerConfig, router};
        use stagehand_scheduler::MemoryQueue;
        use tokio::net::TcpListener;

        const SECRET: &str = "correct-horse-battery-staple";

        struct StaticConfig;

        #[async_trait]
        impl ConfigService for StaticConfig {
            async fn find(&self, _args: &ConfigArgs<'_>) -> Result<Config> {
                Ok(Config {
                    data: "kind: pipeline\nname: default\n".into(),
                    kind: String::new(),
                })
            }
        }

        #[tokio::test]
        async fn test_server_cancel_kills_remote_stage() {
            let stores = Stores::memory();
            let mut user = User {
                login: "octocat".into(),
                token: "d7c559e677ebc489d4e0193c8b97a12e".into(),
                ..Default::default()
            };
            stores.users.create(&mut user).await.unwrap();
            let mut repo = Repository {
                user_id: user.id,
                namespace: "octocat".into(),
                name: "hello-world".into(),
                slug: "octocat/hello-world".into(),
                http_url: "https://github.com/octocat/hello-world.git".into(),
                ..Default::default()
            };
            stores.repos.create(&mut repo).await.unwrap();
            let mut build = Build {
                repo_id: repo.id,
                number: 1,
                status: Status::Pending,
                event: Event::Push,
                ..Default::default()
            };
            let mut stages = vec![Stage {
                number: 1,
                name: "default".into(),
                status: Status::Pending,
                os: "linux".into(),
                arch: "amd64".into(),
                on_success: true,
                ..Default::default()
            }];
            stores.builds.create(&mut build, &mut stages).await.unwrap();

            let queue = Arc::new(MemoryQueue::default());
            queue.schedule(&stages[0]).await.unwrap();
            let services = Services {
                config: Arc::new(StaticConfig),
                converter: Arc::new(PassthroughConverter),
                events: Arc::new(Hub::default()),
                logz: Arc::new(LiveLog::new()),
                netrcs: Arc::new(TokenNetrcService::default()),
                status: Arc::new(NoopStatus),
            };
            let manager = Manager::new(
                stores.clone(),
                queue,
                services,
                Default::default(),
                ManagerConfig {
                    request_timeout: Duration::from_millis(100),
                    watch_timeout: Duration::from_millis(100),
                },
            );
            let canceler = manager.canceler();
            let state = RpcState::new(
                Arc::new(manager),
                ServerConfig {
                    secret: SECRET.into(),
                    ..Default::default()
                },
            )
            .with_canceler(Arc::new(canceler));

            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            tokio::spawn(async move { axum::serve(listener, router(state)).await.unwrap() });
            let client =
                Arc::new(Client::new(ClientConfig::new(format!("http://{addr}"), SECRET)).unwrap());

            let engine = FakeEngine::new(vec![(spec("build", RunPolicy::OnSuccess), Script::Hang)]);
            let runner = Runner::new(
                RunnerConfig {
                    machine: "agent-1".into(),
                    os: "linux".into(),
                    arch: "amd64".into(),
                    ..Default::default()
                },
                client.clone(),
                Arc::new(engine),
            );
            let polling = tokio::spawn(async move { runner.poll(&CancellationToken::new()).await });

            tokio::time::timeout(Duration::from_secs(5), async {
                loop {
                    let listed = stores.stages.list_steps(build.id).await.unwrap();
                    if listed[0].steps.iter().any(|s| s.status == Status::Running) {
                        break;
                    }
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            })
            .await
            .unwrap();

            BuildCanceler::cancel(&*client, build.id).await.unwrap();
            tokio::time::timeout(Duration::from_secs(5), polling)
                .await
                .unwrap()
                .unwrap()
                .unwrap();

            let killed = stores.builds.find(build.id).await.unwrap();
            assert_eq!(killed.status, Status::Killed);
            let listed = stores.stages.list_steps(build.id).await.unwrap();
            assert_eq!(listed[0].status, Status::Killed);
            assert_eq!(listed[0].steps[0].status, Status::Killed);
            assert_eq!(listed[0].steps[0].exit_code, 130);
        }
    }
}

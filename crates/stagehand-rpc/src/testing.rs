//! Canned `BuildManager` and `BuildCanceler` for exercising the transport.

use async_trait::async_trait;
use bytes::Bytes;
use stagehand_core::logs::{CardInput, Line};
use stagehand_core::{
    BuildCanceler, BuildId, BuildManager, Context, Error, Filter, Netrc, RepoId, Result, Stage, StageId, Status,
    Step, StepId,
};
use std::sync::Mutex;

pub const SECRET: &str = "correct-horse-battery-staple";

#[derive(Default)]
pub struct StubManager {
    queued: Mutex<Option<Stage>>,
    conflict: Mutex<bool>,
    done: Mutex<Option<bool>>,
    lines: Mutex<Vec<(StepId, Line)>>,
    uploads: Mutex<Vec<(StepId, Bytes)>>,
}

impl StubManager {
    pub fn queue(&self, stage: Stage) {
        *self.queued.lock().unwrap() = Some(stage);
    }

    pub fn set_conflict(&self, conflict: bool) {
        *self.conflict.lock().unwrap() = conflict;
    }

    /// Without a value `watch` reports a deadline.
    pub fn set_done(&self, done: bool) {
        *self.done.lock().unwrap() = Some(done);
    }

    pub fn lines(&self) -> Vec<(StepId, Line)> {
        self.lines.lock().unwrap().clone()
    }

    pub fn uploads(&self) -> Vec<(StepId, Bytes)> {
        self.uploads.lock().unwrap().clone()
    }

    fn check(&self) -> Result<()> {
        if *self.conflict.lock().unwrap() {
            return Err(Error::OptimisticLock);
        }
        Ok(())
    }
}

#[async_trait]
impl BuildManager for StubManager {
    async fn request(&self, _filter: &Filter) -> Result<Option<Stage>> {
        Ok(self.queued.lock().unwrap().take())
    }

    async fn accept(&self, id: StageId, machine: &str) -> Result<Stage> {
        self.check()?;
        Ok(Stage {
            id,
            machine: machine.to_string(),
            status: Status::Pending,
            version: 2,
            ..Default::default()
        })
    }

    async fn netrc(&self, id: RepoId) -> Result<Option<Netrc>> {
        if id != RepoId(1) {
            return Ok(None);
        }
        Ok(Some(Netrc {
            machine: "github.com".into(),
            login: "octocat".into(),
            password: "12345".into(),
        }))
    }

    async fn details(&self, id: StageId) -> Result<Context> {
        if id == StageId(404) {
            return Err(Error::NotFound(format!("stage {id}")));
        }
        let mut context = Context::default();
        context.stage.id = id;
        context.repository.slug = "octocat/hello-world".into();
        context.repository.secret = "passphrase".into();
        Ok(context)
    }

    async fn before(&self, step: &mut Step) -> Result<()> {
        self.check()?;
        step.version += 1;
        Ok(())
    }

    async fn after(&self, step: &mut Step) -> Result<()> {
        self.check()?;
        step.version += 1;
        Ok(())
    }

    async fn before_all(&self, stage: &mut Stage) -> Result<()> {
        self.check()?;
        stage.version += 1;
        for step in &mut stage.steps {
            step.id = StepId(100 + step.number);
            step.stage_id = stage.id;
            step.version = 1;
        }
        Ok(())
    }

    async fn after_all(&self, stage: &mut Stage) -> Result<()> {
        self.check()?;
        stage.version += 1;
        Ok(())
    }

    async fn watch(&self, _id: BuildId) -> Result<bool> {
        match *self.done.lock().unwrap() {
            Some(done) => Ok(done),
            None => Err(Error::DeadlineExceeded),
        }
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

/// Records the builds it was asked to cancel.
#[derive(Default)]
pub struct StubCanceler {
    cancelled: Mutex<Vec<BuildId>>,
}

impl StubCanceler {
    pub fn cancelled(&self) -> Vec<BuildId> {
        self.cancelled.lock().unwrap().clone()
    }
}

#[async_trait]
impl BuildCanceler for StubCanceler {
    async fn cancel(&self, build: BuildId) -> Result<()> {
        self.cancelled.lock().unwrap().push(build);
        Ok(())
    }
}

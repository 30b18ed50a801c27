//! Shared fixtures for manager tests.

use async_trait::async_trait;
use stagehand_core::services::{
    ConfigArgs, ConfigService, Message, Pubsub, StatusInput, StatusService,
};
use stagehand_core::{
    Build, Config, Error, Event, Repository, Result, Stage, Status, Step, System, User, now,
};
use stagehand_db::Stores;
use stagehand_scheduler::MemoryQueue;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::{LiveLog, Manager, ManagerConfig, PassthroughConverter, Services, TokenNetrcService};

#[derive(Default)]
pub struct RecordingPubsub {
    messages: Mutex<Vec<Message>>,
}

impl RecordingPubsub {
    /// Builds decoded from every published message, oldest first.
    pub fn builds(&self) -> Vec<Build> {
        self.messages
            .lock()
            .unwrap()
            .iter()
            .map(|m| serde_json::from_str(&m.data).unwrap())
            .collect()
    }
}

#[async_trait]
impl Pubsub for RecordingPubsub {
    async fn publish(&self, message: Message) -> Result<()> {
        self.messages.lock().unwrap().push(message);
        Ok(())
    }
}

/// Records the status of every build reported; optionally fails.
#[derive(Default)]
pub struct RecordingStatus {
    sent: Mutex<Vec<Status>>,
    unsupported: bool,
}

impl RecordingStatus {
    /// A status service that refuses every report as unsupported.
    pub fn unsupported() -> Self {
        Self {
            unsupported: true,
            ..Default::default()
        }
    }

    pub fn sent(&self) -> Vec<Status> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl StatusService for RecordingStatus {
    async fn send(&self, _user: &User, input: &StatusInput<'_>) -> Result<()> {
        if self.unsupported {
            return Err(Error::NotSupported);
        }
        self.sent.lock().unwrap().push(input.build.status);
        Ok(())
    }
}

pub struct StaticConfig(pub &'static str);

#[async_trait]
impl ConfigService for StaticConfig {
    async fn find(&self, _args: &ConfigArgs<'_>) -> Result<Config> {
        Ok(Config {
            data: self.0.to_string(),
            kind: String::new(),
        })
    }
}

pub struct Harness {
    pub stores: Stores,
    pub queue: Arc<MemoryQueue>,
    pub events: Arc<RecordingPubsub>,
    pub status: Arc<RecordingStatus>,
    pub logz: Arc<LiveLog>,
    pub manager: Manager,
    pub repo: Repository,
    pub user: User,
}

pub async fn harness() -> Harness {
    harness_with(RecordingStatus::default()).await
}

pub async fn harness_with(status: RecordingStatus) -> Harness {
    let stores = Stores::memory();
    let mut user = User {
        login: "octocat".into(),
        email: "octocat@github.com".into(),
        active: true,
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
        private: true,
        visibility: "private".into(),
        active: true,
        secret: "g9dMChy22QutQM5lrpbe0yCR3f15t1gv".into(),
        ..Default::default()
    };
    stores.repos.create(&mut repo).await.unwrap();

    let queue = Arc::new(MemoryQueue::default());
    let events = Arc::new(RecordingPubsub::default());
    let status = Arc::new(status);
    let logz = Arc::new(LiveLog::new());
    let services = Services {
        config: Arc::new(StaticConfig("kind: pipeline\nname: default\n")),
        converter: Arc::new(PassthroughConverter),
        events: events.clone(),
        logz: logz.clone(),
        netrcs: Arc::new(TokenNetrcService::default()),
        status: status.clone(),
    };
    let system = System {
        proto: "https".into(),
        host: "ci.example.com".into(),
        link: "https://ci.example.com".into(),
        version: "1.0.0".into(),
    };
    let config = ManagerConfig {
        request_timeout: Duration::from_millis(50),
        watch_timeout: Duration::from_millis(50),
    };
    let manager = Manager::new(
        stores.clone(),
        queue.clone(),
        services,
        system,
        config,
    );

    Harness {
        stores,
        queue,
        events,
        status,
        logz,
        manager,
        repo,
        user,
    }
}

pub fn stage(number: i64, name: &str, status: Status, deps: &[&str]) -> Stage {
    Stage {
        number,
        name: name.into(),
        kind: "pipeline".into(),
        kind_type: "docker".into(),
        status,
        os: "linux".into(),
        arch: "amd64".into(),
        on_success: true,
        depends_on: deps.iter().map(|d| d.to_string()).collect(),
        ..Default::default()
    }
}

pub fn steps(names: &[&str]) -> Vec<Step> {
    names
        .iter()
        .enumerate()
        .map(|(i, name)| Step {
            number: i as i64 + 1,
            name: name.to_string(),
            status: Status::Pending,
            ..Default::default()
        })
        .collect()
}

impl Harness {
    /// Persist a build with the given stages.
    pub async fn create_build(&self, event: Event, mut stages: Vec<Stage>) -> (Build, Vec<Stage>) {
        let created = now();
        let mut build = Build {
            repo_id: self.repo.id,
            number: 1,
            status: Status::Pending,
            event,
            git_ref: "refs/heads/main".into(),
            after: "7fd1a60b01f91b314f59955a4e4d4e80d8edf11d".into(),
            created,
            updated: created,
            ..Default::default()
        };
        for stage in &mut stages {
            stage.created = created;
            stage.updated = created;
        }
        self.stores
            .builds
            .create(&mut build, &mut stages)
            .await
            .unwrap();
        (build, stages)
    }

    /// Accept and start a stage with two steps.
    pub async fn start_stage(&self, stage: &Stage) -> Stage {
        use stagehand_core::BuildManager;

        let mut stage = self.manager.accept(stage.id, "agent-1").await.unwrap();
        stage.steps = steps(&["clone", "build"]);
        self.manager.before_all(&mut stage).await.unwrap();
        stage
    }

    /// Drive a stage through accept, start and finish the way an agent does,
    /// ending with `status`.
    pub async fn run_stage(&self, stage: &Stage, status: Status) -> Stage {
        use stagehand_core::BuildManager;

        let mut stage = self.start_stage(stage).await;

        let step_status = if status == Status::Failing {
            Status::Failing
        } else {
            Status::Passing
        };
        for step in &mut stage.steps {
            step.status = Status::Running;
            step.started = now();
            self.manager.before(step).await.unwrap();
            step.status = step_status;
            step.exit_code = if step_status == Status::Failing { 1 } else { 0 };
            step.stopped = now();
            self.manager.after(step).await.unwrap();
        }

        stage.status = status;
        stage.exit_code = if status == Status::Failing { 1 } else { 0 };
        stage.stopped = now();
        self.manager.after_all(&mut stage).await.unwrap();
        stage
    }

    pub async fn stage_named(&self, build: &Build, name: &str) -> Stage {
        self.stores
            .stages
            .list(build.id)
            .await
            .unwrap()
            .into_iter()
            .find(|s| s.name == name)
            .unwrap()
    }
}

//! The in-process `BuildManager`.

use async_trait::async_trait;
use bytes::Bytes;
use stagehand_core::logs::{CardInput, Line};
use stagehand_core::services::{
    ConfigArgs, ConfigService, ConvertService, LogStream, NetrcService, Pubsub, StatusService,
};
use stagehand_core::{
    BuildId, BuildManager, Context, Error, Filter, Netrc, RepoId, Result, Scheduler, Stage,
    StageId, Status, Step, StepId, System, now, secret,
};
use stagehand_db::Stores;
use std::sync::Arc;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::canceler::Canceler;
use crate::setup::Setup;
use crate::teardown::Teardown;
use crate::updater::Updater;
use crate::ManagerConfig;

/// External collaborators injected into the manager.
#[derive(Clone)]
pub struct Services {
    pub config: Arc<dyn ConfigService>,
    pub converter: Arc<dyn ConvertService>,
    pub events: Arc<dyn Pubsub>,
    pub logz: Arc<dyn LogStream>,
    pub netrcs: Arc<dyn NetrcService>,
    pub status: Arc<dyn StatusService>,
}

/// Orchestrates stage lifecycle events reported by agents.
///
/// Holds no state of its own beyond its collaborators; every call reloads
/// what it needs from the stores and writes back with version checks.
pub struct Manager {
    stores: Stores,
    scheduler: Arc<dyn Scheduler>,
    services: Services,
    system: System,
    config: ManagerConfig,
}

impl Manager {
    pub fn new(
        stores: Stores,
        scheduler: Arc<dyn Scheduler>,
        services: Services,
        system: System,
        config: ManagerConfig,
    ) -> Self {
        Self {
            stores,
            scheduler,
            services,
            system,
            config,
        }
    }

    /// A canceler sharing this manager's collaborators.
    pub fn canceler(&self) -> Canceler {
        Canceler::new(
            self.stores.clone(),
            self.scheduler.clone(),
            self.services.events.clone(),
            self.services.status.clone(),
        )
    }

    fn updater(&self) -> Updater<'_> {
        Updater {
            stores: &self.stores,
            events: self.services.events.as_ref(),
        }
    }
}

#[async_trait]
impl BuildManager for Manager {
    async fn request(&self, filter: &Filter) -> Result<Option<Stage>> {
        debug!(
            kind = %filter.kind,
            os = %filter.os,
            arch = %filter.arch,
            kernel = %filter.kernel,
            variant = %filter.variant,
            "Requesting queue item"
        );
        match timeout(self.config.request_timeout, self.scheduler.request(filter)).await {
            Ok(Ok(stage)) => Ok(Some(stage)),
            Ok(Err(err)) if err.is_deadline() => Ok(None),
            Ok(Err(err)) => {
                warn!(error = %err, "Cannot request queue item");
                Err(err)
            }
            Err(_) => {
                debug!("No queue item within the request deadline");
                Ok(None)
            }
        }
    }

    async fn accept(&self, id: StageId, machine: &str) -> Result<Stage> {
        let mut stage = self
            .stores
            .stages
            .find(id)
            .await
            .inspect_err(|e| warn!(stage.id = %id, error = %e, "Cannot find stage"))?;
        if !stage.machine.is_empty() {
            debug!(stage.id = %id, machine, "Stage already assigned");
            return Err(Error::OptimisticLock);
        }

        stage.machine = machine.to_string();
        stage.status = Status::Pending;
        stage.updated = now();

        match self.stores.stages.update(&mut stage).await.map_err(Error::from) {
            Ok(()) => {
                debug!(stage.id = %id, machine, "Stage accepted");
                Ok(stage)
            }
            Err(err) if err.is_optimistic_lock() => {
                debug!(stage.id = %id, machine, "Stage processed by another agent");
                Err(err)
            }
            Err(err) => {
                warn!(stage.id = %id, error = %err, "Cannot update stage");
                Err(err)
            }
        }
    }

    async fn netrc(&self, id: RepoId) -> Result<Option<Netrc>> {
        let repo = self
            .stores
            .repos
            .find(id)
            .await
            .inspect_err(|e| warn!(repo.id = %id, error = %e, "Cannot find repository"))?;
        let user = self
            .stores
            .users
            .find(repo.user_id)
            .await
            .inspect_err(|e| warn!(repo = %repo.slug, error = %e, "Cannot find repository owner"))?;
        self.services
            .netrcs
            .create(&user, &repo)
            .await
            .inspect_err(|e| warn!(repo = %repo.slug, error = %e, "Cannot generate netrc"))
    }

    async fn details(&self, id: StageId) -> Result<Context> {
        let stage = self
            .stores
            .stages
            .find(id)
            .await
            .inspect_err(|e| warn!(stage.id = %id, error = %e, "Cannot find stage"))?;
        let mut build = self
            .stores
            .builds
            .find(stage.build_id)
            .await
            .inspect_err(|e| warn!(stage.id = %id, error = %e, "Cannot find build"))?;
        build.stages = self
            .stores
            .stages
            .list(stage.build_id)
            .await
            .inspect_err(|e| warn!(build.id = %build.id, error = %e, "Cannot list stages"))?;
        let repo = self
            .stores
            .repos
            .find(build.repo_id)
            .await
            .inspect_err(|e| warn!(build.id = %build.id, error = %e, "Cannot find repository"))?;
        let user = self
            .stores
            .users
            .find(repo.user_id)
            .await
            .inspect_err(|e| warn!(repo = %repo.slug, error = %e, "Cannot find repository owner"))?;

        let args = ConfigArgs {
            user: &user,
            repo: &repo,
            build: &build,
        };
        let raw = self
            .services
            .config
            .find(&args)
            .await
            .inspect_err(|e| warn!(repo = %repo.slug, error = %e, "Cannot find configuration"))?;
        let config = self
            .services
            .converter
            .convert(&args, raw)
            .await
            .inspect_err(|e| warn!(repo = %repo.slug, error = %e, "Cannot convert configuration"))?;

        let repo_secrets = self
            .stores
            .secrets
            .list(repo.id)
            .await
            .inspect_err(|e| warn!(repo = %repo.slug, error = %e, "Cannot list secrets"))?;
        let global_secrets = self
            .stores
            .global_secrets
            .list(&repo.namespace)
            .await
            .inspect_err(|e| warn!(repo = %repo.slug, error = %e, "Cannot list global secrets"))?;
        let secrets = secret::filter_for_event(
            repo_secrets.into_iter().chain(global_secrets),
            build.event,
        );

        debug!(stage.id = %id, build.number = build.number, repo = %repo.slug, "Fetched stage details");
        Ok(Context {
            repository: repo,
            build,
            stage,
            config,
            secrets,
            system: self.system.clone(),
        })
    }

    async fn before(&self, step: &mut Step) -> Result<()> {
        debug!(step.id = %step.id, step.name = %step.name, status = %step.status, "Updating step");
        self.updater().run(step).await?;
        self.services
            .logz
            .create(step.id)
            .await
            .inspect_err(|e| warn!(step.id = %step.id, error = %e, "Cannot create log stream"))
    }

    async fn after(&self, step: &mut Step) -> Result<()> {
        debug!(step.id = %step.id, step.name = %step.name, status = %step.status, "Updating step");
        let result = self
            .updater()
            .run(step)
            .await
            .inspect_err(|e| warn!(step.id = %step.id, error = %e, "Cannot update step"));

        if let Err(err) = self.services.logz.delete(step.id).await {
            warn!(step.id = %step.id, error = %err, "Cannot teardown log stream");
        }
        result
    }

    async fn before_all(&self, stage: &mut Stage) -> Result<()> {
        Setup {
            stores: &self.stores,
            events: self.services.events.as_ref(),
            status: self.services.status.as_ref(),
        }
        .run(stage)
        .await
    }

    async fn after_all(&self, stage: &mut Stage) -> Result<()> {
        Teardown {
            stores: &self.stores,
            scheduler: self.scheduler.as_ref(),
            events: self.services.events.as_ref(),
            status: self.services.status.as_ref(),
            logz: self.services.logz.as_ref(),
        }
        .run(stage)
        .await
    }

    async fn watch(&self, id: BuildId) -> Result<bool> {
        let cancelled = match timeout(self.config.watch_timeout, self.scheduler.cancelled(id)).await
        {
            Ok(Ok(cancelled)) => cancelled,
            Ok(Err(err)) => return Err(err),
            Err(_) => {
                // the build may have finished without an explicit cancel
                let build = self.stores.builds.find(id).await?;
                if build.is_done() {
                    return Ok(true);
                }
                debug!(build.id = %id, "Watch deadline exceeded");
                return Err(Error::DeadlineExceeded);
            }
        };

        let build = self
            .stores
            .builds
            .find(id)
            .await
            .inspect_err(|e| warn!(build.id = %id, error = %e, "Cannot find build"))?;
        Ok(cancelled || build.is_done())
    }

    async fn write(&self, step: StepId, line: &Line) -> Result<()> {
        self.services
            .logz
            .write(step, line)
            .await
            .inspect_err(|e| warn!(step.id = %step, error = %e, "Cannot write to log stream"))
    }

    async fn upload(&self, step: StepId, data: Bytes) -> Result<()> {
        self.stores
            .logs
            .create(step, data)
            .await
            .inspect_err(|e| warn!(step.id = %step, error = %e, "Cannot upload complete logs"))?;
        Ok(())
    }

    async fn upload_card(&self, step: StepId, card: &CardInput) -> Result<()> {
        self.stores
            .cards
            .create(step, card)
            .await
            .inspect_err(|e| warn!(step.id = %step, error = %e, "Cannot create card"))?;
        Ok(())
    }
}

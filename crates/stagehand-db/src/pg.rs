//! PostgreSQL store.

use async_trait::async_trait;
use bytes::Bytes;
use sqlx::PgPool;
use sqlx::types::Json;
use stagehand_core::logs::CardInput;
use stagehand_core::{
    Build, BuildId, Event, RepoId, Repository, Secret, Stage, StageId, Status, Step, StepId,
    User, UserId, now,
};
use std::collections::HashMap;

use crate::store::*;
use crate::{DbError, DbResult};

fn parse_status(raw: &str) -> DbResult<Status> {
    raw.parse()
        .map_err(|e: stagehand_core::Error| DbError::Serialization(e.to_string()))
}

/// A version-checked UPDATE that touched no row lost the race, or the row is
/// gone; both report a lock error.
fn expect_one_row(rows_affected: u64) -> DbResult<()> {
    if rows_affected == 0 {
        return Err(DbError::OptimisticLock);
    }
    Ok(())
}

/// Database row for builds.
#[derive(Debug, Clone, sqlx::FromRow)]
struct BuildRow {
    build_id: i64,
    build_repo_id: i64,
    build_trigger: String,
    build_number: i64,
    build_parent: i64,
    build_status: String,
    build_error: String,
    build_event: String,
    build_action: String,
    build_link: String,
    build_title: String,
    build_message: String,
    build_before: String,
    build_after: String,
    build_ref: String,
    build_source: String,
    build_target: String,
    build_author: String,
    build_author_name: String,
    build_author_email: String,
    build_sender: String,
    build_params: Json<HashMap<String, String>>,
    build_cron: String,
    build_deploy: String,
    build_started: i64,
    build_finished: i64,
    build_created: i64,
    build_updated: i64,
    build_version: i64,
}

const BUILD_COLUMNS: &str = r#"
    build_id, build_repo_id, build_trigger, build_number, build_parent, build_status,
    build_error, build_event, build_action, build_link, build_title, build_message,
    build_before, build_after, build_ref, build_source, build_target, build_author,
    build_author_name, build_author_email, build_sender, build_params, build_cron,
    build_deploy, build_started, build_finished, build_created, build_updated, build_version
"#;

impl TryFrom<BuildRow> for Build {
    type Error = DbError;

    fn try_from(row: BuildRow) -> Result<Self, Self::Error> {
        let event: Event = row
            .build_event
            .parse()
            .map_err(|e: stagehand_core::Error| DbError::Serialization(e.to_string()))?;
        Ok(Build {
            id: BuildId(row.build_id),
            repo_id: RepoId(row.build_repo_id),
            trigger: row.build_trigger,
            number: row.build_number,
            parent: row.build_parent,
            status: parse_status(&row.build_status)?,
            error: row.build_error,
            event,
            action: row.build_action,
            link: row.build_link,
            title: row.build_title,
            message: row.build_message,
            before: row.build_before,
            after: row.build_after,
            git_ref: row.build_ref,
            source: row.build_source,
            target: row.build_target,
            author_login: row.build_author,
            author_name: row.build_author_name,
            author_email: row.build_author_email,
            sender: row.build_sender,
            params: row.build_params.0,
            cron: row.build_cron,
            deploy_to: row.build_deploy,
            started: row.build_started,
            finished: row.build_finished,
            created: row.build_created,
            updated: row.build_updated,
            version: row.build_version,
            stages: Vec::new(),
        })
    }
}

/// Database row for stages.
#[derive(Debug, Clone, sqlx::FromRow)]
struct StageRow {
    stage_id: i64,
    stage_repo_id: i64,
    stage_build_id: i64,
    stage_number: i64,
    stage_name: String,
    stage_kind: String,
    stage_type: String,
    stage_status: String,
    stage_error: String,
    stage_errignore: bool,
    stage_exit_code: i32,
    stage_machine: String,
    stage_os: String,
    stage_arch: String,
    stage_variant: String,
    stage_kernel: String,
    stage_limit: i32,
    stage_started: i64,
    stage_stopped: i64,
    stage_created: i64,
    stage_updated: i64,
    stage_version: i64,
    stage_on_success: bool,
    stage_on_failure: bool,
    stage_depends_on: Json<Vec<String>>,
    stage_labels: Json<HashMap<String, String>>,
}

const STAGE_COLUMNS: &str = r#"
    stage_id, stage_repo_id, stage_build_id, stage_number, stage_name, stage_kind,
    stage_type, stage_status, stage_error, stage_errignore, stage_exit_code, stage_machine,
    stage_os, stage_arch, stage_variant, stage_kernel, stage_limit, stage_started,
    stage_stopped, stage_created, stage_updated, stage_version, stage_on_success,
    stage_on_failure, stage_depends_on, stage_labels
"#;

impl TryFrom<StageRow> for Stage {
    type Error = DbError;

    fn try_from(row: StageRow) -> Result<Self, Self::Error> {
        Ok(Stage {
            id: StageId(row.stage_id),
            repo_id: RepoId(row.stage_repo_id),
            build_id: BuildId(row.stage_build_id),
            number: row.stage_number,
            name: row.stage_name,
            kind: row.stage_kind,
            kind_type: row.stage_type,
            status: parse_status(&row.stage_status)?,
            error: row.stage_error,
            errignore: row.stage_errignore,
            exit_code: row.stage_exit_code,
            machine: row.stage_machine,
            os: row.stage_os,
            arch: row.stage_arch,
            variant: row.stage_variant,
            kernel: row.stage_kernel,
            limit: row.stage_limit,
            started: row.stage_started,
            stopped: row.stage_stopped,
            created: row.stage_created,
            updated: row.stage_updated,
            version: row.stage_version,
            on_success: row.stage_on_success,
            on_failure: row.stage_on_failure,
            depends_on: row.stage_depends_on.0,
            labels: row.stage_labels.0,
            steps: Vec::new(),
        })
    }
}

/// Database row for steps.
#[derive(Debug, Clone, sqlx::FromRow)]
struct StepRow {
    step_id: i64,
    step_stage_id: i64,
    step_number: i64,
    step_name: String,
    step_status: String,
    step_error: String,
    step_errignore: bool,
    step_exit_code: i32,
    step_started: i64,
    step_stopped: i64,
    step_version: i64,
}

const STEP_COLUMNS: &str = r#"
    step_id, step_stage_id, step_number, step_name, step_status, step_error,
    step_errignore, step_exit_code, step_started, step_stopped, step_version
"#;

impl TryFrom<StepRow> for Step {
    type Error = DbError;

    fn try_from(row: StepRow) -> Result<Self, Self::Error> {
        Ok(Step {
            id: StepId(row.step_id),
            stage_id: StageId(row.step_stage_id),
            number: row.step_number,
            name: row.step_name,
            status: parse_status(&row.step_status)?,
            error: row.step_error,
            errignore: row.step_errignore,
            exit_code: row.step_exit_code,
            started: row.step_started,
            stopped: row.step_stopped,
            version: row.step_version,
        })
    }
}

/// Database row for repositories.
#[derive(Debug, Clone, sqlx::FromRow)]
struct RepoRow {
    repo_id: i64,
    repo_user_id: i64,
    repo_namespace: String,
    repo_name: String,
    repo_slug: String,
    repo_scm: String,
    repo_clone_url: String,
    repo_ssh_url: String,
    repo_html_url: String,
    repo_branch: String,
    repo_private: bool,
    repo_visibility: String,
    repo_active: bool,
    repo_config: String,
    repo_trusted: bool,
    repo_protected: bool,
    repo_timeout: i64,
    repo_counter: i64,
    repo_signer: String,
    repo_version: i64,
}

const REPO_COLUMNS: &str = r#"
    repo_id, repo_user_id, repo_namespace, repo_name, repo_slug, repo_scm, repo_clone_url,
    repo_ssh_url, repo_html_url, repo_branch, repo_private, repo_visibility, repo_active,
    repo_config, repo_trusted, repo_protected, repo_timeout, repo_counter, repo_signer,
    repo_version
"#;

impl From<RepoRow> for Repository {
    fn from(row: RepoRow) -> Self {
        Repository {
            id: RepoId(row.repo_id),
            user_id: UserId(row.repo_user_id),
            namespace: row.repo_namespace,
            name: row.repo_name,
            slug: row.repo_slug,
            scm: row.repo_scm,
            http_url: row.repo_clone_url,
            ssh_url: row.repo_ssh_url,
            link: row.repo_html_url,
            branch: row.repo_branch,
            private: row.repo_private,
            visibility: row.repo_visibility,
            active: row.repo_active,
            config: row.repo_config,
            trusted: row.repo_trusted,
            protected: row.repo_protected,
            timeout: row.repo_timeout,
            counter: row.repo_counter,
            secret: row.repo_signer,
            version: row.repo_version,
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct UserRow {
    user_id: i64,
    user_login: String,
    user_email: String,
    user_admin: bool,
    user_active: bool,
    user_token: String,
}

impl From<UserRow> for User {
    fn from(row: UserRow) -> Self {
        User {
            id: UserId(row.user_id),
            login: row.user_login,
            email: row.user_email,
            admin: row.user_admin,
            active: row.user_active,
            token: row.user_token,
        }
    }
}

/// Shared shape of `secrets` and `orgsecrets`; the scope column is aliased.
#[derive(Debug, Clone, sqlx::FromRow)]
struct SecretRow {
    secret_id: i64,
    secret_repo_id: i64,
    secret_namespace: String,
    secret_name: String,
    secret_data: String,
    secret_pull_request: bool,
    secret_pull_request_push: bool,
}

impl From<SecretRow> for Secret {
    fn from(row: SecretRow) -> Self {
        Secret {
            id: row.secret_id,
            repo_id: RepoId(row.secret_repo_id),
            namespace: row.secret_namespace,
            name: row.secret_name,
            data: row.secret_data,
            pull_request: row.secret_pull_request,
            pull_request_push: row.secret_pull_request_push,
        }
    }
}

/// PostgreSQL implementation of every store trait.
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl BuildStore for PgStore {
    async fn find(&self, id: BuildId) -> DbResult<Build> {
        let row = sqlx::query_as::<_, BuildRow>(&format!(
            "SELECT {BUILD_COLUMNS} FROM builds WHERE build_id = $1"
        ))
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| DbError::NotFound(format!("build {id}")))?;
        row.try_into()
    }

    async fn find_number(&self, repo: RepoId, number: i64) -> DbResult<Build> {
        let row = sqlx::query_as::<_, BuildRow>(&format!(
            "SELECT {BUILD_COLUMNS} FROM builds WHERE build_repo_id = $1 AND build_number = $2"
        ))
        .bind(repo.0)
        .bind(number)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| DbError::NotFound(format!("build {repo}/{number}")))?;
        row.try_into()
    }

    async fn create(&self, build: &mut Build, stages: &mut [Stage]) -> DbResult<()> {
        let mut tx = self.pool.begin().await?;

        let (id,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO builds (
                build_repo_id, build_trigger, build_number, build_parent, build_status,
                build_error, build_event, build_action, build_link, build_title, build_message,
                build_before, build_after, build_ref, build_source, build_target, build_author,
                build_author_name, build_author_email, build_sender, build_params, build_cron,
                build_deploy, build_started, build_finished, build_created, build_updated,
                build_version
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16,
                    $17, $18, $19, $20, $21, $22, $23, $24, $25, $26, $27, 1)
            RETURNING build_id
            "#,
        )
        .bind(build.repo_id.0)
        .bind(&build.trigger)
        .bind(build.number)
        .bind(build.parent)
        .bind(build.status.as_str())
        .bind(&build.error)
        .bind(build.event.as_str())
        .bind(&build.action)
        .bind(&build.link)
        .bind(&build.title)
        .bind(&build.message)
        .bind(&build.before)
        .bind(&build.after)
        .bind(&build.git_ref)
        .bind(&build.source)
        .bind(&build.target)
        .bind(&build.author_login)
        .bind(&build.author_name)
        .bind(&build.author_email)
        .bind(&build.sender)
        .bind(Json(&build.params))
        .bind(&build.cron)
        .bind(&build.deploy_to)
        .bind(build.started)
        .bind(build.finished)
        .bind(build.created)
        .bind(build.updated)
        .fetch_one(&mut *tx)
        .await?;

        build.id = BuildId(id);
        build.version = 1;

        for stage in stages.iter_mut() {
            stage.build_id = build.id;
            stage.repo_id = build.repo_id;
            let (stage_id,): (i64,) = sqlx::query_as(
                r#"
                INSERT INTO stages (
                    stage_repo_id, stage_build_id, stage_number, stage_name, stage_kind,
                    stage_type, stage_status, stage_error, stage_errignore, stage_exit_code,
                    stage_machine, stage_os, stage_arch, stage_variant, stage_kernel,
                    stage_limit, stage_started, stage_stopped, stage_created, stage_updated,
                    stage_version, stage_on_success, stage_on_failure, stage_depends_on,
                    stage_labels
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15,
                        $16, $17, $18, $19, $20, 1, $21, $22, $23, $24)
                RETURNING stage_id
                "#,
            )
            .bind(stage.repo_id.0)
            .bind(stage.build_id.0)
            .bind(stage.number)
            .bind(&stage.name)
            .bind(&stage.kind)
            .bind(&stage.kind_type)
            .bind(stage.status.as_str())
            .bind(&stage.error)
            .bind(stage.errignore)
            .bind(stage.exit_code)
            .bind(&stage.machine)
            .bind(&stage.os)
            .bind(&stage.arch)
            .bind(&stage.variant)
            .bind(&stage.kernel)
            .bind(stage.limit)
            .bind(stage.started)
            .bind(stage.stopped)
            .bind(stage.created)
            .bind(stage.updated)
            .bind(stage.on_success)
            .bind(stage.on_failure)
            .bind(Json(&stage.depends_on))
            .bind(Json(&stage.labels))
            .fetch_one(&mut *tx)
            .await?;
            stage.id = StageId(stage_id);
            stage.version = 1;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn update(&self, build: &mut Build) -> DbResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE builds
            SET build_status = $3, build_error = $4, build_params = $5, build_deploy = $6,
                build_started = $7, build_finished = $8, build_updated = $9,
                build_version = build_version + 1
            WHERE build_id = $1 AND build_version = $2
            "#,
        )
        .bind(build.id.0)
        .bind(build.version)
        .bind(build.status.as_str())
        .bind(&build.error)
        .bind(Json(&build.params))
        .bind(&build.deploy_to)
        .bind(build.started)
        .bind(build.finished)
        .bind(build.updated)
        .execute(&self.pool)
        .await?;
        expect_one_row(result.rows_affected())?;
        build.version += 1;
        Ok(())
    }

    async fn purge(&self, before: i64) -> DbResult<u64> {
        // stages, steps, logs and cards cascade
        let result = sqlx::query("DELETE FROM builds WHERE build_created < $1")
            .bind(before)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl StageStore for PgStore {
    async fn find(&self, id: StageId) -> DbResult<Stage> {
        let row = sqlx::query_as::<_, StageRow>(&format!(
            "SELECT {STAGE_COLUMNS} FROM stages WHERE stage_id = $1"
        ))
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| DbError::NotFound(format!("stage {id}")))?;
        row.try_into()
    }

    async fn list(&self, build: BuildId) -> DbResult<Vec<Stage>> {
        let rows = sqlx::query_as::<_, StageRow>(&format!(
            "SELECT {STAGE_COLUMNS} FROM stages WHERE stage_build_id = $1 ORDER BY stage_number"
        ))
        .bind(build.0)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Stage::try_from).collect()
    }

    async fn list_steps(&self, build: BuildId) -> DbResult<Vec<Stage>> {
        let mut stages = StageStore::list(self, build).await?;
        let rows = sqlx::query_as::<_, StepRow>(&format!(
            r#"
            SELECT {STEP_COLUMNS} FROM steps
            WHERE step_stage_id IN (SELECT stage_id FROM stages WHERE stage_build_id = $1)
            ORDER BY step_stage_id, step_number
            "#
        ))
        .bind(build.0)
        .fetch_all(&self.pool)
        .await?;

        for row in rows {
            let step = Step::try_from(row)?;
            if let Some(stage) = stages.iter_mut().find(|s| s.id == step.stage_id) {
                stage.steps.push(step);
            }
        }
        Ok(stages)
    }

    async fn list_incomplete(&self) -> DbResult<Vec<Stage>> {
        let rows = sqlx::query_as::<_, StageRow>(&format!(
            r#"
            SELECT {STAGE_COLUMNS} FROM stages
            WHERE stage_status = 'pending' AND stage_machine = ''
            ORDER BY stage_id
            "#
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Stage::try_from).collect()
    }

    async fn create(&self, stage: &mut Stage) -> DbResult<()> {
        let (id,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO stages (
                stage_repo_id, stage_build_id, stage_number, stage_name, stage_kind,
                stage_type, stage_status, stage_machine, stage_os, stage_arch, stage_variant,
                stage_kernel, stage_limit, stage_created, stage_updated, stage_version,
                stage_on_success, stage_on_failure, stage_depends_on, stage_labels
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, 1,
                    $16, $17, $18, $19)
            RETURNING stage_id
            "#,
        )
        .bind(stage.repo_id.0)
        .bind(stage.build_id.0)
        .bind(stage.number)
        .bind(&stage.name)
        .bind(&stage.kind)
        .bind(&stage.kind_type)
        .bind(stage.status.as_str())
        .bind(&stage.machine)
        .bind(&stage.os)
        .bind(&stage.arch)
        .bind(&stage.variant)
        .bind(&stage.kernel)
        .bind(stage.limit)
        .bind(stage.created)
        .bind(stage.updated)
        .bind(stage.on_success)
        .bind(stage.on_failure)
        .bind(Json(&stage.depends_on))
        .bind(Json(&stage.labels))
        .fetch_one(&self.pool)
        .await?;
        stage.id = StageId(id);
        stage.version = 1;
        Ok(())
    }

    async fn update(&self, stage: &mut Stage) -> DbResult<()> {
        let mut tx = self.pool.begin().await?;
        // serializes stage writes of one build until commit
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(stage.build_id.0)
            .execute(&mut *tx)
            .await?;

        let stamped: Option<(i64,)> = sqlx::query_as(
            r#"
            UPDATE stages
            SET stage_status = $3, stage_error = $4, stage_errignore = $5,
                stage_exit_code = $6, stage_machine = $7, stage_started = $8,
                stage_stopped = $9, stage_on_success = $11, stage_on_failure = $12,
                stage_updated = GREATEST($10, COALESCE((
                    SELECT MAX(CASE WHEN s.stage_number >= $13
                                    THEN s.stage_updated + 1
                                    ELSE s.stage_updated END)
                    FROM stages s
                    WHERE s.stage_build_id = $14 AND s.stage_id <> $1
                      AND s.stage_status NOT IN
                          ('pending', 'running', 'waiting_on_dependencies', 'blocked', 'declined')
                ), 0)),
                stage_version = stage_version + 1
            WHERE stage_id = $1 AND stage_version = $2
            RETURNING stage_updated
            "#,
        )
        .bind(stage.id.0)
        .bind(stage.version)
        .bind(stage.status.as_str())
        .bind(&stage.error)
        .bind(stage.errignore)
        .bind(stage.exit_code)
        .bind(&stage.machine)
        .bind(stage.started)
        .bind(stage.stopped)
        .bind(now())
        .bind(stage.on_success)
        .bind(stage.on_failure)
        .bind(stage.number)
        .bind(stage.build_id.0)
        .fetch_optional(&mut *tx)
        .await?;
        let (updated,) = stamped.ok_or(DbError::OptimisticLock)?;
        tx.commit().await?;

        stage.updated = updated;
        stage.version += 1;
        Ok(())
    }
}

#[async_trait]
impl StepStore for PgStore {
    async fn find(&self, id: StepId) -> DbResult<Step> {
        let row = sqlx::query_as::<_, StepRow>(&format!(
            "SELECT {STEP_COLUMNS} FROM steps WHERE step_id = $1"
        ))
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| DbError::NotFound(format!("step {id}")))?;
        row.try_into()
    }

    async fn list(&self, stage: StageId) -> DbResult<Vec<Step>> {
        let rows = sqlx::query_as::<_, StepRow>(&format!(
            "SELECT {STEP_COLUMNS} FROM steps WHERE step_stage_id = $1 ORDER BY step_number"
        ))
        .bind(stage.0)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Step::try_from).collect()
    }

    async fn create(&self, step: &mut Step) -> DbResult<()> {
        let (id,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO steps (
                step_stage_id, step_number, step_name, step_status, step_error,
                step_errignore, step_exit_code, step_started, step_stopped, step_version
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, 1)
            RETURNING step_id
            "#,
        )
        .bind(step.stage_id.0)
        .bind(step.number)
        .bind(&step.name)
        .bind(step.status.as_str())
        .bind(&step.error)
        .bind(step.errignore)
        .bind(step.exit_code)
        .bind(step.started)
        .bind(step.stopped)
        .fetch_one(&self.pool)
        .await?;
        step.id = StepId(id);
        step.version = 1;
        Ok(())
    }

    async fn update(&self, step: &mut Step) -> DbResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE steps
            SET step_status = $3, step_error = $4, step_errignore = $5, step_exit_code = $6,
                step_started = $7, step_stopped = $8, step_version = step_version + 1
            WHERE step_id = $1 AND step_version = $2
            "#,
        )
        .bind(step.id.0)
        .bind(step.version)
        .bind(step.status.as_str())
        .bind(&step.error)
        .bind(step.errignore)
        .bind(step.exit_code)
        .bind(step.started)
        .bind(step.stopped)
        .execute(&self.pool)
        .await?;
        expect_one_row(result.rows_affected())?;
        step.version += 1;
        Ok(())
    }
}

#[async_trait]
impl RepositoryStore for PgStore {
    async fn find(&self, id: RepoId) -> DbResult<Repository> {
        let row = sqlx::query_as::<_, RepoRow>(&format!(
            "SELECT {REPO_COLUMNS} FROM repos WHERE repo_id = $1"
        ))
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| DbError::NotFound(format!("repository {id}")))?;
        Ok(row.into())
    }

    async fn find_name(&self, namespace: &str, name: &str) -> DbResult<Repository> {
        let row = sqlx::query_as::<_, RepoRow>(&format!(
            "SELECT {REPO_COLUMNS} FROM repos WHERE repo_namespace = $1 AND repo_name = $2"
        ))
        .bind(namespace)
        .bind(name)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| DbError::NotFound(format!("repository {namespace}/{name}")))?;
        Ok(row.into())
    }

    async fn create(&self, repo: &mut Repository) -> DbResult<()> {
        let (id,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO repos (
                repo_user_id, repo_namespace, repo_name, repo_slug, repo_scm, repo_clone_url,
                repo_ssh_url, repo_html_url, repo_branch, repo_private, repo_visibility,
                repo_active, repo_config, repo_trusted, repo_protected, repo_timeout,
                repo_counter, repo_signer, repo_version
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16,
                    $17, $18, 1)
            RETURNING repo_id
            "#,
        )
        .bind(repo.user_id.0)
        .bind(&repo.namespace)
        .bind(&repo.name)
        .bind(&repo.slug)
        .bind(&repo.scm)
        .bind(&repo.http_url)
        .bind(&repo.ssh_url)
        .bind(&repo.link)
        .bind(&repo.branch)
        .bind(repo.private)
        .bind(&repo.visibility)
        .bind(repo.active)
        .bind(&repo.config)
        .bind(repo.trusted)
        .bind(repo.protected)
        .bind(repo.timeout)
        .bind(repo.counter)
        .bind(&repo.secret)
        .fetch_one(&self.pool)
        .await?;
        repo.id = RepoId(id);
        repo.version = 1;
        Ok(())
    }
}

#[async_trait]
impl UserStore for PgStore {
    async fn find(&self, id: UserId) -> DbResult<User> {
        let row = sqlx::query_as::<_, UserRow>(
            r#"
            SELECT user_id, user_login, user_email, user_admin, user_active, user_token
            FROM users WHERE user_id = $1
            "#,
        )
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| DbError::NotFound(format!("user {id}")))?;
        Ok(row.into())
    }

    async fn create(&self, user: &mut User) -> DbResult<()> {
        let (id,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO users (user_login, user_email, user_admin, user_active, user_token)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING user_id
            "#,
        )
        .bind(&user.login)
        .bind(&user.email)
        .bind(user.admin)
        .bind(user.active)
        .bind(&user.token)
        .fetch_one(&self.pool)
        .await?;
        user.id = UserId(id);
        Ok(())
    }
}

#[async_trait]
impl SecretStore for PgStore {
    async fn list(&self, repo: RepoId) -> DbResult<Vec<Secret>> {
        let rows = sqlx::query_as::<_, SecretRow>(
            r#"
            SELECT secret_id, secret_repo_id, '' AS secret_namespace, secret_name,
                   secret_data, secret_pull_request, secret_pull_request_push
            FROM secrets WHERE secret_repo_id = $1 ORDER BY secret_name
            "#,
        )
        .bind(repo.0)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Secret::from).collect())
    }

    async fn create(&self, secret: &mut Secret) -> DbResult<()> {
        let (id,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO secrets (
                secret_repo_id, secret_name, secret_data, secret_pull_request,
                secret_pull_request_push
            )
            VALUES ($1, $2, $3, $4, $5)
            RETURNING secret_id
            "#,
        )
        .bind(secret.repo_id.0)
        .bind(&secret.name)
        .bind(&secret.data)
        .bind(secret.pull_request)
        .bind(secret.pull_request_push)
        .fetch_one(&self.pool)
        .await?;
        secret.id = id;
        Ok(())
    }
}

#[async_trait]
impl GlobalSecretStore for PgStore {
    async fn list(&self, namespace: &str) -> DbResult<Vec<Secret>> {
        let rows = sqlx::query_as::<_, SecretRow>(
            r#"
            SELECT secret_id, 0::BIGINT AS secret_repo_id, secret_namespace, secret_name,
                   secret_data, secret_pull_request, secret_pull_request_push
            FROM orgsecrets WHERE secret_namespace = $1 ORDER BY secret_name
            "#,
        )
        .bind(namespace)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Secret::from).collect())
    }

    async fn create(&self, secret: &mut Secret) -> DbResult<()> {
        let (id,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO orgsecrets (
                secret_namespace, secret_name, secret_data, secret_pull_request,
                secret_pull_request_push
            )
            VALUES ($1, $2, $3, $4, $5)
            RETURNING secret_id
            "#,
        )
        .bind(&secret.namespace)
        .bind(&secret.name)
        .bind(&secret.data)
        .bind(secret.pull_request)
        .bind(secret.pull_request_push)
        .fetch_one(&self.pool)
        .await?;
        secret.id = id;
        Ok(())
    }
}

#[async_trait]
impl LogStore for PgStore {
    async fn find(&self, step: StepId) -> DbResult<Bytes> {
        let (data,): (Vec<u8>,) = sqlx::query_as("SELECT log_data FROM logs WHERE log_id = $1")
            .bind(step.0)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("logs for step {step}")))?;
        Ok(Bytes::from(data))
    }

    async fn create(&self, step: StepId, data: Bytes) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO logs (log_id, log_data) VALUES ($1, $2)
            ON CONFLICT (log_id) DO UPDATE SET log_data = EXCLUDED.log_data
            "#,
        )
        .bind(step.0)
        .bind(data.as_ref())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete(&self, step: StepId) -> DbResult<()> {
        sqlx::query("DELETE FROM logs WHERE log_id = $1")
            .bind(step.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl CardStore for PgStore {
    async fn find(&self, step: StepId) -> DbResult<CardInput> {
        let (schema, data): (String, serde_json::Value) =
            sqlx::query_as("SELECT card_schema, card_data FROM cards WHERE card_id = $1")
                .bind(step.0)
                .fetch_optional(&self.pool)
                .await?
                .ok_or_else(|| DbError::NotFound(format!("card for step {step}")))?;
        Ok(CardInput { schema, data })
    }

    async fn create(&self, step: StepId, card: &CardInput) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO cards (card_id, card_schema, card_data) VALUES ($1, $2, $3)
            ON CONFLICT (card_id) DO UPDATE
            SET card_schema = EXCLUDED.card_schema, card_data = EXCLUDED.card_data
            "#,
        )
        .bind(step.0)
        .bind(&card.schema)
        .bind(&card.data)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

//! Dependency graph resolution over the stages of one build.
//!
//! Every function here is pure and recomputed independently by each stage
//! that finishes, so concurrent finishers agree without sharing a lock.

use stagehand_core::{Stage, Status};

/// The build is complete once no stage can still make progress.
pub fn is_build_complete(stages: &[Stage]) -> bool {
    !stages.iter().any(|s| {
        matches!(
            s.status,
            Status::Pending | Status::Running | Status::Waiting | Status::Declined | Status::Blocked
        )
    })
}

/// Whether any stage failed, which gates `on_success`/`on_failure` siblings.
pub fn any_failed(stages: &[Stage]) -> bool {
    stages.iter().any(Stage::is_failed)
}

/// Whether a waiting stage should be skipped given the outcome so far.
pub fn should_cancel(stage: &Stage, failed: bool) -> bool {
    if stage.status != Status::Waiting {
        return false;
    }
    let keep = (failed && stage.on_failure) || (!failed && stage.on_success);
    !keep
}

/// Whether `parent` is one of `stage`'s declared dependencies.
pub fn is_dep(parent: &Stage, stage: &Stage) -> bool {
    stage.depends_on(&parent.name)
}

/// Whether every dependency `stage` names has finished.
pub fn are_deps_complete(stage: &Stage, stages: &[Stage]) -> bool {
    stages
        .iter()
        .filter(|s| stage.depends_on(&s.name))
        .all(Stage::is_done)
}

/// Whether `parent` is the last of `stage`'s dependencies to settle.
///
/// Dependencies are ordered by `(updated, number)`; the greatest wins. Every
/// finisher sees the same persisted timestamps, so exactly one of them
/// concludes it is last.
pub fn is_last_dep(parent: &Stage, stage: &Stage, stages: &[Stage]) -> bool {
    for dep in stages.iter().filter(|s| stage.depends_on(&s.name)) {
        if dep.updated > parent.updated {
            return false;
        }
        if dep.updated == parent.updated && dep.number > parent.number {
            return false;
        }
    }
    true
}

/// Whether the finished `parent` should promote `stage` to pending.
pub fn should_schedule(parent: &Stage, stage: &Stage, stages: &[Stage]) -> bool {
    stage.status == Status::Waiting
        && !stage.depends_on.is_empty()
        && is_dep(parent, stage)
        && are_deps_complete(stage, stages)
        && is_last_dep(parent, stage, stages)
}

/// Terminal status of a completed build: the first killed, failing or errored
/// stage decides, otherwise the build passed.
pub fn build_status(stages: &[Stage]) -> Status {
    stages
        .iter()
        .find_map(|s| match s.status {
            Status::Killed | Status::Failing | Status::Error => Some(s.status),
            _ => None,
        })
        .unwrap_or(Status::Passing)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stage(number: i64, name: &str, status: Status) -> Stage {
        Stage {
            number,
            name: name.into(),
            status,
            on_success: true,
            ..Default::default()
        }
    }

    fn waiting_on(number: i64, name: &str, deps: &[&str]) -> Stage {
        Stage {
            depends_on: deps.iter().map(|d| d.to_string()).collect(),
            ..stage(number, name, Status::Waiting)
        }
    }

    fn blocks_completion(status: Status) -> bool {
        matches!(
            status,
            Status::Pending | Status::Running | Status::Waiting | Status::Declined | Status::Blocked
        )
    }

    #[test]
    fn test_is_build_complete_pairwise() {
        for a in Status::ALL {
            for b in Status::ALL {
                let stages = vec![stage(1, "a", a), stage(2, "b", b)];
                let want = !blocks_completion(a) && !blocks_completion(b);
                assert_eq!(is_build_complete(&stages), want, "{a} + {b}");
            }
        }
    }

    #[test]
    fn test_is_build_complete_empty() {
        assert!(is_build_complete(&[]));
    }

    #[test]
    fn test_should_cancel_gating() {
        let mut on_success = waiting_on(2, "deploy", &["build"]);
        on_success.on_success = true;
        on_success.on_failure = false;

        let mut on_failure = waiting_on(3, "notify", &["build"]);
        on_failure.on_success = false;
        on_failure.on_failure = true;

        let mut always = waiting_on(4, "cleanup", &["build"]);
        always.on_success = true;
        always.on_failure = true;

        assert!(!should_cancel(&on_success, false));
        assert!(should_cancel(&on_success, true));
        assert!(should_cancel(&on_failure, false));
        assert!(!should_cancel(&on_failure, true));
        assert!(!should_cancel(&always, false));
        assert!(!should_cancel(&always, true));

        let running = stage(5, "lint", Status::Running);
        assert!(!should_cancel(&running, true));
    }

    #[test]
    fn test_are_deps_complete() {
        let a = waiting_on(3, "a", &["b", "c"]);
        let stages = vec![
            stage(1, "b", Status::Passing),
            stage(2, "c", Status::Running),
            a.clone(),
        ];
        assert!(!are_deps_complete(&a, &stages));

        let stages = vec![
            stage(1, "b", Status::Passing),
            stage(2, "c", Status::Failing),
            a.clone(),
        ];
        assert!(are_deps_complete(&a, &stages));
    }

    #[test]
    fn test_is_last_dep_later_update_wins() {
        let mut b = stage(1, "b", Status::Passing);
        let mut c = stage(2, "c", Status::Passing);
        b.updated = 200;
        c.updated = 100;
        let a = waiting_on(3, "a", &["b", "c"]);
        let stages = vec![b.clone(), c.clone(), a.clone()];

        assert!(is_last_dep(&b, &a, &stages));
        assert!(!is_last_dep(&c, &a, &stages));
    }

    #[test]
    fn test_is_last_dep_tie_broken_by_number() {
        let mut b = stage(1, "b", Status::Passing);
        let mut c = stage(2, "c", Status::Passing);
        b.updated = 100;
        c.updated = 100;
        let a = waiting_on(3, "a", &["b", "c"]);
        let stages = vec![b.clone(), c.clone(), a.clone()];

        assert!(!is_last_dep(&b, &a, &stages));
        assert!(is_last_dep(&c, &a, &stages));
    }

    #[test]
    fn test_should_schedule_exactly_one_finisher() {
        let mut b = stage(1, "b", Status::Passing);
        let mut c = stage(2, "c", Status::Passing);
        b.updated = 150;
        c.updated = 150;
        let a = waiting_on(3, "a", &["b", "c"]);
        let stages = vec![b.clone(), c.clone(), a.clone()];

        let winners = [&b, &c]
            .into_iter()
            .filter(|parent| should_schedule(parent, &a, &stages))
            .count();
        assert_eq!(winners, 1);
    }

    #[test]
    fn test_should_schedule_requires_named_parent() {
        let b = stage(1, "b", Status::Passing);
        let lint = stage(2, "lint", Status::Passing);
        let a = waiting_on(3, "a", &["b"]);
        let stages = vec![b.clone(), lint.clone(), a.clone()];

        assert!(should_schedule(&b, &a, &stages));
        assert!(!should_schedule(&lint, &a, &stages));
    }

    #[test]
    fn test_should_schedule_ignores_stages_without_deps() {
        let b = stage(1, "b", Status::Passing);
        let orphan = stage(2, "orphan", Status::Waiting);
        let stages = vec![b.clone(), orphan.clone()];
        assert!(!should_schedule(&b, &orphan, &stages));
    }

    #[test]
    fn test_build_status_first_match_wins() {
        let stages = vec![
            stage(1, "a", Status::Passing),
            stage(2, "b", Status::Skipped),
        ];
        assert_eq!(build_status(&stages), Status::Passing);

        let stages = vec![
            stage(1, "a", Status::Error),
            stage(2, "b", Status::Killed),
        ];
        assert_eq!(build_status(&stages), Status::Error);

        let stages = vec![
            stage(1, "a", Status::Passing),
            stage(2, "b", Status::Failing),
            stage(3, "c", Status::Error),
        ];
        assert_eq!(build_status(&stages), Status::Failing);
    }
}

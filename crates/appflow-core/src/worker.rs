//! Transition worker.
//!
//! [`TransitionWorker::execute`] makes one decision for one job inside a
//! single store transaction: the application's status is read, checked and
//! written under the same transaction, so the decision always reflects the
//! status at execution time rather than at submission time.
//!
//! [`TransitionWorker::process`] turns that decision into queue calls:
//!
//! | outcome                    | queue call                      |
//! |----------------------------|---------------------------------|
//! | `Committed`                | `complete`                      |
//! | `Delayed` (review pending) | `delay` by the review interval  |
//! | `Rejected`                 | `fail(permanent = true)`        |
//! | transient `Err`            | `fail(permanent = false)`       |

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, info_span, warn};

use crate::config::ReviewConfig;
use crate::error::Result;
use crate::notify::ChangeNotifier;
use crate::queue::{Delivery, FailDisposition, JobId, JobQueue, TransitionJob};
use crate::store::EntityStore;
use crate::transition::{evaluate, table_for, Edge};
use crate::types::{ApplicationStatus, Role};

// ---------------------------------------------------------------------------
// Decision / Rejection
// ---------------------------------------------------------------------------

/// Why a job can never succeed. Rejections are never retried.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Rejection {
    EntityNotFound {
        entity_id: String,
    },
    ActorNotFound {
        actor_id: String,
    },
    IllegalTransition {
        from: ApplicationStatus,
        to: ApplicationStatus,
        role: Role,
    },
    NotOwner {
        actor_id: String,
        owner_id: String,
    },
    InvalidReviewer {
        reviewer_id: String,
    },
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::EntityNotFound { entity_id } => {
                write!(f, "application not found: {entity_id}")
            }
            Rejection::ActorNotFound { actor_id } => write!(f, "actor not found: {actor_id}"),
            Rejection::IllegalTransition { from, to, role } => {
                write!(f, "illegal transition for {role}: {from} -> {to}")
            }
            Rejection::NotOwner { actor_id, owner_id } => {
                write!(f, "actor {actor_id} does not own this application (owner: {owner_id})")
            }
            Rejection::InvalidReviewer { reviewer_id } => {
                write!(f, "reviewer {reviewer_id} is not an admin")
            }
        }
    }
}

/// Result of one execution attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// The application holds `status`. `changed` is false when it already
    /// did before this attempt (duplicate delivery).
    Committed {
        status: ApplicationStatus,
        changed: bool,
    },
    /// Waiting for an admin reviewer. Not a failure.
    Delayed { note: String },
    Rejected(Rejection),
}

// ---------------------------------------------------------------------------
// JobReport
// ---------------------------------------------------------------------------

/// What [`TransitionWorker::process`] did with one delivery.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum JobOutcome {
    Committed {
        status: ApplicationStatus,
        changed: bool,
    },
    Delayed {
        note: String,
    },
    Rejected {
        rejection: Rejection,
    },
    Retrying {
        attempt: u32,
        retry_at: DateTime<Utc>,
        error: String,
    },
    DeadLettered {
        attempt: u32,
        error: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobReport {
    pub job_id: JobId,
    pub entity_id: String,
    #[serde(flatten)]
    pub outcome: JobOutcome,
}

// ---------------------------------------------------------------------------
// TransitionWorker
// ---------------------------------------------------------------------------

pub struct TransitionWorker<S, Q> {
    store: Arc<S>,
    queue: Arc<Q>,
    notifier: Arc<ChangeNotifier>,
    review: ReviewConfig,
}

impl<S, Q> Clone for TransitionWorker<S, Q> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            queue: self.queue.clone(),
            notifier: self.notifier.clone(),
            review: self.review.clone(),
        }
    }
}

fn review_note(job: &TransitionJob, from: ApplicationStatus, now: DateTime<Utc>) -> String {
    format!(
        "{}: {} -> {} requested by {} is waiting for an admin reviewer",
        now.to_rfc3339(),
        from,
        job.requested_status,
        job.requesting_user_id
    )
}

impl<S: EntityStore, Q: JobQueue> TransitionWorker<S, Q> {
    pub fn new(
        store: Arc<S>,
        queue: Arc<Q>,
        notifier: Arc<ChangeNotifier>,
        review: ReviewConfig,
    ) -> Self {
        Self {
            store,
            queue,
            notifier,
            review,
        }
    }

    /// Decide and, when legal, commit one transition.
    ///
    /// `job` is updated in place: a review pause sets `note`, an admin
    /// requester is stamped as `reviewer_id`. `Err` is returned only for
    /// store failures; every business outcome is a [`Decision`].
    pub fn execute(&self, job: &mut TransitionJob) -> Result<Decision> {
        let review = &self.review;

        let decision = self.store.transaction(|tx| {
            let Some(app) = tx.find_application(&job.entity_id)? else {
                return Ok(Decision::Rejected(Rejection::EntityNotFound {
                    entity_id: job.entity_id.clone(),
                }));
            };
            let Some(actor) = tx.find_actor(&job.requesting_user_id)? else {
                return Ok(Decision::Rejected(Rejection::ActorNotFound {
                    actor_id: job.requesting_user_id.clone(),
                }));
            };

            // Non-owning providers are refused before legality is looked at.
            if actor.role == Role::Provider && app.owner_id != actor.id {
                return Ok(Decision::Rejected(Rejection::NotOwner {
                    actor_id: actor.id,
                    owner_id: app.owner_id,
                }));
            }

            // Roles without a table never transition, not even to the
            // status the application already has.
            if table_for(actor.role).is_none() {
                return Ok(Decision::Rejected(Rejection::IllegalTransition {
                    from: app.status,
                    to: job.requested_status,
                    role: actor.role,
                }));
            }

            // Redelivery of a job that already committed.
            if app.status == job.requested_status {
                return Ok(Decision::Committed {
                    status: app.status,
                    changed: false,
                });
            }

            let rule = evaluate(app.status, job.requested_status, actor.role);
            if !rule.legal {
                return Ok(Decision::Rejected(Rejection::IllegalTransition {
                    from: app.status,
                    to: job.requested_status,
                    role: actor.role,
                }));
            }

            match actor.role {
                Role::Provider => {
                    let edge = Edge::new(app.status, job.requested_status);
                    let needs_review = rule.review_required || review.gates(edge);
                    match job.reviewer_id.as_deref() {
                        None if needs_review => {
                            let note = review_note(job, app.status, Utc::now());
                            job.note = Some(note.clone());
                            return Ok(Decision::Delayed { note });
                        }
                        None => {}
                        Some(reviewer_id) => {
                            let is_admin = tx
                                .find_actor(reviewer_id)?
                                .is_some_and(|r| r.role == Role::Admin);
                            if !is_admin {
                                return Ok(Decision::Rejected(Rejection::InvalidReviewer {
                                    reviewer_id: reviewer_id.to_string(),
                                }));
                            }
                        }
                    }
                }
                Role::Admin => job.reviewer_id = Some(actor.id.clone()),
                Role::User => {}
            }

            let updated = tx.update_status(&app.id, job.requested_status)?;
            Ok(Decision::Committed {
                status: updated.status,
                changed: true,
            })
        })?;

        if let Decision::Committed { changed: true, .. } = decision {
            self.notifier.publish(&job.entity_id);
        }
        Ok(decision)
    }

    /// Execute one delivery and settle it with the queue.
    pub fn process(&self, delivery: Delivery) -> Result<JobReport> {
        let Delivery { token, mut job } = delivery;
        let span = info_span!(
            "transition",
            job_id = %token.job_id,
            entity_id = %job.entity_id,
            attempt = job.attempt
        );
        let _enter = span.enter();

        let outcome = match self.execute(&mut job) {
            Ok(Decision::Committed { status, changed }) => {
                self.queue.complete(&token, &job, status)?;
                if changed {
                    info!(%status, "transition committed");
                } else {
                    debug!(%status, "already in requested status");
                }
                JobOutcome::Committed { status, changed }
            }
            Ok(Decision::Delayed { note }) => {
                self.queue.delay(&token, self.review.delay(), &job)?;
                debug!(delay_secs = self.review.delay_secs, "awaiting review");
                JobOutcome::Delayed { note }
            }
            Ok(Decision::Rejected(rejection)) => {
                let reason = rejection.to_string();
                self.queue.fail(&token, &reason, true)?;
                warn!(%reason, "transition rejected");
                JobOutcome::Rejected { rejection }
            }
            Err(e) => {
                let err = e.to_string();
                // Anything that is not an infrastructure hiccup (a corrupt
                // record, say) fails the same way on every attempt.
                match self.queue.fail(&token, &err, !e.is_transient())? {
                    FailDisposition::Retrying { attempt, retry_at } => {
                        warn!(error = %err, attempt, %retry_at, "transient failure, will retry");
                        JobOutcome::Retrying {
                            attempt,
                            retry_at,
                            error: err,
                        }
                    }
                    FailDisposition::DeadLettered { attempt } => {
                        error!(error = %err, attempt, "job dead-lettered");
                        JobOutcome::DeadLettered {
                            attempt,
                            error: err,
                        }
                    }
                }
            }
        };

        Ok(JobReport {
            job_id: token.job_id,
            entity_id: job.entity_id,
            outcome,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AppflowError;
    use crate::queue::{JobState, RedbQueue, RetryPolicy};
    use crate::store::{RedbStore, StoreTx};
    use crate::types::{Actor, Application};
    use chrono::Duration as CDur;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;

    use ApplicationStatus::*;

    struct Fixture<S: EntityStore> {
        _dir: TempDir,
        store: Arc<S>,
        queue: Arc<RedbQueue>,
        worker: TransitionWorker<S, RedbQueue>,
        events: Arc<AtomicUsize>,
        provider: Actor,
        admin: Actor,
        app: Application,
    }

    fn seeded(dir: &TempDir, status: ApplicationStatus) -> (RedbStore, Actor, Actor, Application) {
        let store = RedbStore::open(&dir.path().join("store.redb")).unwrap();
        let provider = Actor::new("Acme", Role::Provider);
        let admin = Actor::new("Moderator", Role::Admin);
        let mut app = Application::new("Weather", &provider.id);
        app.status = status;
        store.insert_actor(&provider).unwrap();
        store.insert_actor(&admin).unwrap();
        store.insert_application(&app).unwrap();
        (store, provider, admin, app)
    }

    fn build<S: EntityStore>(
        dir: TempDir,
        store: S,
        provider: Actor,
        admin: Actor,
        app: Application,
        retry: RetryPolicy,
    ) -> Fixture<S> {
        let queue = Arc::new(
            RedbQueue::open(&dir.path().join("queue.redb"), retry, Duration::from_secs(60))
                .unwrap(),
        );
        let notifier = Arc::new(ChangeNotifier::new(16));
        let events = Arc::new(AtomicUsize::new(0));
        let counter = events.clone();
        notifier.register(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let store = Arc::new(store);
        let worker = TransitionWorker::new(
            store.clone(),
            queue.clone(),
            notifier,
            ReviewConfig::default(),
        );
        Fixture {
            _dir: dir,
            store,
            queue,
            worker,
            events,
            provider,
            admin,
            app,
        }
    }

    fn fixture(status: ApplicationStatus) -> Fixture<RedbStore> {
        let dir = TempDir::new().unwrap();
        let (store, provider, admin, app) = seeded(&dir, status);
        build(dir, store, provider, admin, app, RetryPolicy::default())
    }

    impl<S: EntityStore> Fixture<S> {
        fn submit(&self, status: ApplicationStatus, by: &str) -> JobId {
            self.queue
                .enqueue(TransitionJob::new(&self.app.id, status, by))
                .unwrap()
        }

        fn run_next(&self, at: DateTime<Utc>) -> JobReport {
            let delivery = self.queue.dequeue(at).unwrap().expect("a due job");
            self.worker.process(delivery).unwrap()
        }

    }

    fn soon() -> DateTime<Utc> {
        Utc::now() + CDur::seconds(1)
    }

    impl Fixture<RedbStore> {
        fn status(&self) -> ApplicationStatus {
            self.store.get_application(&self.app.id).unwrap().status
        }
    }

    fn job_for(app: &Application, status: ApplicationStatus, by: &str) -> TransitionJob {
        TransitionJob::new(&app.id, status, by)
    }

    #[test]
    fn owner_moves_draft_to_pending_directly() {
        let fx = fixture(Draft);
        let id = fx.submit(Pending, &fx.provider.id);

        let report = fx.run_next(soon());
        assert_eq!(
            report.outcome,
            JobOutcome::Committed {
                status: Pending,
                changed: true
            }
        );
        assert_eq!(fx.status(), Pending);
        assert_eq!(fx.events.load(Ordering::SeqCst), 1);
        assert_eq!(
            fx.queue.get(id).unwrap().state,
            JobState::Completed { status: Pending }
        );
    }

    #[test]
    fn admin_cannot_ban_published_directly() {
        let fx = fixture(Published);
        let id = fx.submit(Banned, &fx.admin.id);

        let report = fx.run_next(soon());
        assert!(matches!(
            report.outcome,
            JobOutcome::Rejected {
                rejection: Rejection::IllegalTransition {
                    from: Published,
                    to: Banned,
                    role: Role::Admin
                }
            }
        ));
        assert_eq!(fx.status(), Published);
        assert_eq!(fx.events.load(Ordering::SeqCst), 0);
        assert!(matches!(
            fx.queue.get(id).unwrap().state,
            JobState::DeadLettered {
                permanent: true,
                ..
            }
        ));
    }

    #[test]
    fn non_owner_is_refused_even_for_illegal_moves() {
        let fx = fixture(Draft);
        let stranger = Actor::new("Other", Role::Provider);
        fx.store.insert_actor(&stranger).unwrap();

        for requested in [Pending, Banned] {
            let mut job = job_for(&fx.app, requested, &stranger.id);
            let decision = fx.worker.execute(&mut job).unwrap();
            assert!(
                matches!(decision, Decision::Rejected(Rejection::NotOwner { .. })),
                "{requested}: {decision:?}"
            );
        }
        assert_eq!(fx.status(), Draft);
    }

    #[test]
    fn missing_entity_and_actor_are_rejected() {
        let fx = fixture(Draft);
        let mut job = TransitionJob::new("ghost", Pending, &fx.provider.id);
        assert!(matches!(
            fx.worker.execute(&mut job).unwrap(),
            Decision::Rejected(Rejection::EntityNotFound { .. })
        ));

        let mut job = job_for(&fx.app, Pending, "nobody");
        assert!(matches!(
            fx.worker.execute(&mut job).unwrap(),
            Decision::Rejected(Rejection::ActorNotFound { .. })
        ));
    }

    #[test]
    fn plain_user_is_always_rejected() {
        let fx = fixture(Draft);
        let user = Actor::new("Visitor", Role::User);
        fx.store.insert_actor(&user).unwrap();
        let mut job = job_for(&fx.app, Pending, &user.id);
        assert!(matches!(
            fx.worker.execute(&mut job).unwrap(),
            Decision::Rejected(Rejection::IllegalTransition {
                role: Role::User,
                ..
            })
        ));
    }

    #[test]
    fn plain_user_cannot_restate_current_status() {
        let fx = fixture(Draft);
        let user = Actor::new("Visitor", Role::User);
        fx.store.insert_actor(&user).unwrap();
        let id = fx.submit(Draft, &user.id);

        let report = fx.run_next(soon());
        assert!(matches!(
            report.outcome,
            JobOutcome::Rejected {
                rejection: Rejection::IllegalTransition {
                    role: Role::User,
                    ..
                }
            }
        ));
        assert_eq!(fx.queue.get(id).unwrap().state.label(), "dead");
        assert_eq!(fx.status(), Draft);
    }

    #[test]
    fn review_round_trip() {
        let fx = fixture(Pending);
        let id = fx.submit(Approved, &fx.provider.id);

        let report = fx.run_next(soon());
        let JobOutcome::Delayed { note } = report.outcome else {
            panic!("expected a review pause, got {:?}", report.outcome);
        };
        assert!(note.contains("pending -> approved"), "note: {note}");
        assert_eq!(fx.status(), Pending);
        assert_eq!(fx.events.load(Ordering::SeqCst), 0);

        let record = fx.queue.get(id).unwrap();
        assert_eq!(record.state.label(), "awaiting_review");
        assert_eq!(record.job.note.as_deref(), Some(note.as_str()));

        // Not before the review interval.
        assert!(fx
            .queue
            .dequeue(Utc::now() + CDur::minutes(1))
            .unwrap()
            .is_none());

        fx.queue.attach_reviewer(id, &fx.admin.id, false).unwrap();
        let report = fx.run_next(Utc::now() + CDur::minutes(6));
        assert_eq!(
            report.outcome,
            JobOutcome::Committed {
                status: Approved,
                changed: true
            }
        );
        assert_eq!(fx.status(), Approved);
        assert_eq!(fx.events.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn reviewer_must_be_an_admin() {
        let fx = fixture(Pending);
        let mut job = job_for(&fx.app, Approved, &fx.provider.id).with_reviewer(&fx.provider.id);
        assert!(matches!(
            fx.worker.execute(&mut job).unwrap(),
            Decision::Rejected(Rejection::InvalidReviewer { .. })
        ));

        let mut job = job_for(&fx.app, Approved, &fx.provider.id).with_reviewer("nobody");
        assert!(matches!(
            fx.worker.execute(&mut job).unwrap(),
            Decision::Rejected(Rejection::InvalidReviewer { .. })
        ));
        assert_eq!(fx.status(), Pending);
    }

    #[test]
    fn reviewer_supplied_up_front_commits_immediately() {
        let fx = fixture(Pending);
        let mut job = job_for(&fx.app, Approved, &fx.provider.id).with_reviewer(&fx.admin.id);
        assert_eq!(
            fx.worker.execute(&mut job).unwrap(),
            Decision::Committed {
                status: Approved,
                changed: true
            }
        );
    }

    #[test]
    fn admin_is_stamped_as_reviewer() {
        let fx = fixture(Pending);
        let id = fx.submit(Rejected, &fx.admin.id);
        fx.run_next(soon());

        let record = fx.queue.get(id).unwrap();
        assert_eq!(record.job.reviewer_id.as_deref(), Some(fx.admin.id.as_str()));
        assert_eq!(fx.status(), Rejected);
    }

    #[test]
    fn duplicate_delivery_is_a_no_op() {
        let fx = fixture(Draft);
        let mut first = job_for(&fx.app, Pending, &fx.provider.id);
        let mut second = first.clone();

        assert_eq!(
            fx.worker.execute(&mut first).unwrap(),
            Decision::Committed {
                status: Pending,
                changed: true
            }
        );
        assert_eq!(
            fx.worker.execute(&mut second).unwrap(),
            Decision::Committed {
                status: Pending,
                changed: false
            }
        );
        assert_eq!(fx.status(), Pending);
        assert_eq!(fx.events.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn stale_request_is_rejected_against_current_status() {
        let fx = fixture(Draft);
        let mut to_pending = job_for(&fx.app, Pending, &fx.provider.id);
        fx.worker.execute(&mut to_pending).unwrap();

        let mut back_to_draft = job_for(&fx.app, Draft, &fx.provider.id);
        assert!(matches!(
            fx.worker.execute(&mut back_to_draft).unwrap(),
            Decision::Rejected(Rejection::IllegalTransition { from: Pending, .. })
        ));
        assert_eq!(fx.status(), Pending);
    }

    // -- retry exhaustion ------------------------------------------------

    /// Reads pass through; every status write fails as if the store were
    /// unreachable.
    struct FailingWrites {
        inner: RedbStore,
    }

    struct FailingTx<'a> {
        inner: &'a mut dyn StoreTx,
    }

    impl StoreTx for FailingTx<'_> {
        fn find_application(&self, id: &str) -> Result<Option<Application>> {
            self.inner.find_application(id)
        }

        fn find_actor(&self, id: &str) -> Result<Option<Actor>> {
            self.inner.find_actor(id)
        }

        fn update_status(&mut self, _id: &str, _status: ApplicationStatus) -> Result<Application> {
            Err(AppflowError::Conflict("store unavailable".into()))
        }
    }

    impl EntityStore for FailingWrites {
        fn transaction<T, F>(&self, f: F) -> Result<T>
        where
            F: FnOnce(&mut dyn StoreTx) -> Result<T>,
        {
            self.inner.transaction(|tx| f(&mut FailingTx { inner: tx }))
        }
    }

    #[test]
    fn transient_failures_exhaust_retries_then_dead_letter() {
        let dir = TempDir::new().unwrap();
        let (store, provider, admin, app) = seeded(&dir, Draft);
        let retry = RetryPolicy {
            max_attempts: 3,
            base_delay_ms: 10,
            max_delay_ms: 100,
        };
        let fx = build(dir, FailingWrites { inner: store }, provider, admin, app, retry);
        let id = fx.submit(Pending, &fx.provider.id);

        let mut at = soon();
        for expected in 1..=2 {
            match fx.run_next(at).outcome {
                JobOutcome::Retrying {
                    attempt, retry_at, ..
                } => {
                    assert_eq!(attempt, expected);
                    at = retry_at + CDur::seconds(1);
                }
                other => panic!("expected retry, got {other:?}"),
            }
        }
        match fx.run_next(at).outcome {
            JobOutcome::DeadLettered { attempt, error } => {
                assert_eq!(attempt, 3);
                assert!(error.contains("store unavailable"));
            }
            other => panic!("expected dead letter, got {other:?}"),
        }

        let record = fx.queue.get(id).unwrap();
        assert!(matches!(
            record.state,
            JobState::DeadLettered {
                permanent: false,
                ..
            }
        ));
        assert!(record
            .last_error
            .as_deref()
            .is_some_and(|e| e.contains("store unavailable")));
        assert_eq!(
            fx.store.inner.get_application(&fx.app.id).unwrap().status,
            Draft
        );
        assert_eq!(fx.events.load(Ordering::SeqCst), 0);
    }
}

//! Generation state machine.
//!
//! `transition` is pure: it takes the current job and an event and returns the
//! next job plus the effects the orchestrator must perform. Complete and
//! Error are terminal and absorb every later event.
//!
//! ```text
//! Idle -> Preparing -> Generating -> Streaming -> Complete
//!                          ^             |
//!                          |             v
//!                       Retrying <--- (failure) ---> Error
//! ```

use std::time::Duration;

use crate::errors::GenerationError;
use crate::job::{GenerationJob, GenerationOutcome, GenerationStage, JobNotice};
use crate::payload::ResultUnit;
use crate::retry::RetryPolicy;

/// Inputs to the state machine.
#[derive(Debug, Clone, PartialEq)]
pub enum MachineEvent {
    Start,
    Prepared { progress_total: u32 },
    StreamOpened,
    Status(Option<String>),
    UnitReceived(ResultUnit),
    Warning(String),
    Metadata(serde_json::Map<String, serde_json::Value>),
    CompleteHint,
    Tick,
    StreamClosed,
    AttemptFailed(GenerationError),
    RetryDelayElapsed,
    Cancelled,
}

/// Work requested by a transition.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    StartTicker,
    StopTicker,
    OpenStream,
    ScheduleRetry(Duration),
    Notify(JobNotice),
    Resolve(GenerationOutcome),
}

#[derive(Debug)]
pub struct Transition {
    pub job: GenerationJob,
    pub effects: Vec<Effect>,
}

impl Transition {
    fn unchanged(job: GenerationJob) -> Self {
        Self {
            job,
            effects: Vec::new(),
        }
    }
}

pub fn transition(mut job: GenerationJob, event: MachineEvent, policy: &RetryPolicy) -> Transition {
    use GenerationStage as S;

    if job.stage.is_terminal() {
        return Transition::unchanged(job);
    }

    let effects = match (job.stage, event) {
        (S::Idle, MachineEvent::Start) => {
            job.stage = S::Preparing;
            job.cancelled = false;
            vec![Effect::StartTicker]
        }
        (S::Preparing, MachineEvent::Prepared { progress_total }) => {
            job.stage = S::Generating;
            job.progress_total = progress_total;
            vec![Effect::OpenStream]
        }
        (S::Generating, MachineEvent::StreamOpened) => {
            job.stage = S::Streaming;
            Vec::new()
        }
        (S::Generating | S::Streaming, MachineEvent::Status(message)) => {
            vec![Effect::Notify(JobNotice::Status { message })]
        }
        (S::Generating | S::Streaming, MachineEvent::UnitReceived(unit)) => {
            let id = unit.id.clone();
            if job.accept_unit(unit) {
                vec![Effect::Notify(JobNotice::UnitAdded {
                    id,
                    progress_current: job.progress_current,
                })]
            } else {
                Vec::new()
            }
        }
        (S::Generating | S::Streaming, MachineEvent::Warning(message)) => {
            vec![Effect::Notify(JobNotice::Warning { message })]
        }
        (S::Generating | S::Streaming, MachineEvent::Metadata(fields)) => {
            vec![Effect::Notify(JobNotice::Metadata(fields))]
        }
        (S::Generating | S::Streaming, MachineEvent::CompleteHint) => {
            vec![Effect::Notify(JobNotice::CompleteHint)]
        }
        (stage, MachineEvent::Tick) if stage.is_active() => {
            job.elapsed_seconds += 1;
            Vec::new()
        }
        (S::Generating | S::Streaming, MachineEvent::StreamClosed) => {
            job.stage = S::Complete;
            job.last_error = None;
            vec![
                Effect::StopTicker,
                Effect::Resolve(GenerationOutcome::Completed {
                    result_count: job.partial_results.len(),
                }),
            ]
        }
        (S::Preparing | S::Generating | S::Streaming, MachineEvent::AttemptFailed(error)) => {
            job.last_error = Some(error.to_string());
            if policy.should_retry(&error, job.retry_attempt) {
                job.stage = S::Retrying;
                job.clear_results();
                vec![
                    Effect::Notify(JobNotice::Retrying {
                        attempt: job.retry_attempt + 1,
                        error: error.to_string(),
                    }),
                    Effect::ScheduleRetry(policy.retry_delay()),
                ]
            } else {
                job.stage = S::Error;
                vec![
                    Effect::StopTicker,
                    Effect::Resolve(GenerationOutcome::Failed { error }),
                ]
            }
        }
        (S::Retrying, MachineEvent::RetryDelayElapsed) => {
            job.stage = S::Generating;
            job.retry_attempt += 1;
            vec![Effect::OpenStream]
        }
        (stage, MachineEvent::Cancelled) if stage.is_active() => {
            job.stage = S::Idle;
            job.cancelled = true;
            vec![
                Effect::StopTicker,
                Effect::Notify(JobNotice::Cancelled),
                Effect::Resolve(GenerationOutcome::Cancelled),
            ]
        }
        _ => Vec::new(),
    };

    Transition { job, effects }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::TransportError;

    fn policy() -> RetryPolicy {
        RetryPolicy::fixed(2, Duration::from_millis(10))
    }

    fn unit(id: &str) -> ResultUnit {
        ResultUnit {
            id: id.into(),
            title: String::new(),
            body: String::new(),
            scheduled_date: None,
            tags: Vec::new(),
        }
    }

    fn run(job: GenerationJob, events: Vec<MachineEvent>) -> (GenerationJob, Vec<Effect>) {
        let mut job = job;
        let mut all = Vec::new();
        for event in events {
            let t = transition(job, event, &policy());
            job = t.job;
            all.extend(t.effects);
        }
        (job, all)
    }

    fn streaming() -> GenerationJob {
        run(
            GenerationJob::new(uuid::Uuid::new_v4()),
            vec![
                MachineEvent::Start,
                MachineEvent::Prepared { progress_total: 6 },
                MachineEvent::StreamOpened,
            ],
        )
        .0
    }

    #[test]
    fn happy_path_reaches_complete() {
        let (job, effects) = run(
            GenerationJob::new(uuid::Uuid::new_v4()),
            vec![
                MachineEvent::Start,
                MachineEvent::Prepared { progress_total: 2 },
                MachineEvent::StreamOpened,
                MachineEvent::UnitReceived(unit("a")),
                MachineEvent::UnitReceived(unit("b")),
                MachineEvent::CompleteHint,
                MachineEvent::StreamClosed,
            ],
        );
        assert_eq!(job.stage, GenerationStage::Complete);
        assert_eq!(job.progress_current, 2);
        assert_eq!(effects.first(), Some(&Effect::StartTicker));
        assert!(effects.contains(&Effect::OpenStream));
        assert_eq!(
            effects.last(),
            Some(&Effect::Resolve(GenerationOutcome::Completed { result_count: 2 }))
        );
    }

    #[test]
    fn complete_hint_does_not_end_the_job() {
        let (job, _) = run(streaming(), vec![MachineEvent::CompleteHint]);
        assert_eq!(job.stage, GenerationStage::Streaming);
    }

    #[test]
    fn retryable_failure_clears_results_and_schedules_retry() {
        let (job, effects) = run(
            streaming(),
            vec![
                MachineEvent::UnitReceived(unit("a")),
                MachineEvent::AttemptFailed(TransportError::status(503, "").into()),
            ],
        );
        assert_eq!(job.stage, GenerationStage::Retrying);
        assert!(job.partial_results.is_empty());
        assert_eq!(job.progress_current, 0);
        assert_eq!(job.retry_attempt, 0);
        assert!(effects.contains(&Effect::ScheduleRetry(Duration::from_millis(10))));

        let (job, effects) = run(job, vec![MachineEvent::RetryDelayElapsed]);
        assert_eq!(job.stage, GenerationStage::Generating);
        assert_eq!(job.retry_attempt, 1);
        assert_eq!(effects, vec![Effect::OpenStream]);
    }

    #[test]
    fn exhausted_retries_end_in_error() {
        let failure = || MachineEvent::AttemptFailed(TransportError::network("down").into());
        let (job, effects) = run(
            streaming(),
            vec![
                failure(),
                MachineEvent::RetryDelayElapsed,
                failure(),
                MachineEvent::RetryDelayElapsed,
                failure(),
            ],
        );
        assert_eq!(job.stage, GenerationStage::Error);
        assert_eq!(job.retry_attempt, 2);
        assert_eq!(job.last_error.as_deref(), Some("network error: down"));
        assert!(matches!(
            effects.last(),
            Some(Effect::Resolve(GenerationOutcome::Failed { .. }))
        ));
    }

    #[test]
    fn fatal_failure_skips_retry() {
        let (job, _) = run(
            streaming(),
            vec![MachineEvent::AttemptFailed(GenerationError::authentication(
                "no session",
            ))],
        );
        assert_eq!(job.stage, GenerationStage::Error);
        assert_eq!(job.retry_attempt, 0);
    }

    #[test]
    fn terminal_stages_absorb_events() {
        let (done, _) = run(streaming(), vec![MachineEvent::StreamClosed]);
        let (after, effects) = run(
            done.clone(),
            vec![
                MachineEvent::UnitReceived(unit("late")),
                MachineEvent::Tick,
                MachineEvent::Cancelled,
                MachineEvent::AttemptFailed(TransportError::network("x").into()),
            ],
        );
        assert_eq!(after, done);
        assert!(effects.is_empty());
    }

    #[test]
    fn cancel_returns_to_idle_and_is_noop_when_idle() {
        let (job, effects) = run(streaming(), vec![MachineEvent::Cancelled]);
        assert_eq!(job.stage, GenerationStage::Idle);
        assert!(job.cancelled);
        assert!(effects.contains(&Effect::Resolve(GenerationOutcome::Cancelled)));

        let (job, effects) = run(
            GenerationJob::new(uuid::Uuid::new_v4()),
            vec![MachineEvent::Cancelled],
        );
        assert_eq!(job.stage, GenerationStage::Idle);
        assert!(effects.is_empty());
    }

    #[test]
    fn ticks_count_only_while_active() {
        let (job, _) = run(streaming(), vec![MachineEvent::Tick, MachineEvent::Tick]);
        assert_eq!(job.elapsed_seconds, 2);
        let (job, _) = run(
            GenerationJob::new(uuid::Uuid::new_v4()),
            vec![MachineEvent::Tick],
        );
        assert_eq!(job.elapsed_seconds, 0);
    }
}

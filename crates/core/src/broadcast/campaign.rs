use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use super::orchestrator::{BroadcastOrchestrator, BroadcastReport, PreviewOutcome};
use super::OutboundMessage;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BroadcastState {
    Idle,
    Previewing,
    AwaitingConfirmation,
    Executing,
    Completed,
}

impl BroadcastState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Previewing => "previewing",
            Self::AwaitingConfirmation => "awaiting_confirmation",
            Self::Executing => "executing",
            Self::Completed => "completed",
        }
    }
}

impl fmt::Display for BroadcastState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BroadcastEvent {
    PreviewRequested,
    PreviewReady,
    Confirmed,
    Cancelled,
    ExecutionFinished,
}

impl fmt::Display for BroadcastEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::PreviewRequested => "preview_requested",
            Self::PreviewReady => "preview_ready",
            Self::Confirmed => "confirmed",
            Self::Cancelled => "cancelled",
            Self::ExecutionFinished => "execution_finished",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum BroadcastTransitionError {
    #[error("cannot apply `{event}` while broadcast is `{from}`")]
    InvalidTransition { from: BroadcastState, event: BroadcastEvent },
    #[error("confirmation is for channel {actual} but the pending preview is for {expected}")]
    ChannelMismatch { expected: String, actual: String },
}

pub fn transition(
    state: BroadcastState,
    event: BroadcastEvent,
) -> Result<BroadcastState, BroadcastTransitionError> {
    use BroadcastEvent as E;
    use BroadcastState as S;

    match (state, event) {
        (S::Idle | S::AwaitingConfirmation | S::Completed, E::PreviewRequested) => Ok(S::Previewing),
        (S::Previewing, E::PreviewReady) => Ok(S::AwaitingConfirmation),
        (S::Previewing | S::AwaitingConfirmation, E::Cancelled) => Ok(S::Idle),
        (S::AwaitingConfirmation, E::Confirmed) => Ok(S::Executing),
        (S::Executing, E::ExecutionFinished) => Ok(S::Completed),
        (from, event) => Err(BroadcastTransitionError::InvalidTransition { from, event }),
    }
}

/// Handle for a confirmed run. Produced by [`BroadcastCampaign::confirm`] and
/// consumed by [`BroadcastCampaign::run`].
#[derive(Debug)]
pub struct ConfirmedRun {
    pub run_id: Uuid,
    pub channel_id: String,
    cancel: CancellationToken,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConfirmOutcome {
    Executed(BroadcastReport),
    /// The fresh preview taken at confirmation time had nobody left to notify.
    NothingToSend,
    Degraded { reason: String },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CancelOutcome {
    PreviewDiscarded,
    RunCancelling { run_id: Uuid },
}

struct ActiveRun {
    run_id: Uuid,
    cancel: CancellationToken,
}

struct CampaignState {
    state: BroadcastState,
    channel_id: Option<String>,
    run: Option<ActiveRun>,
}

/// Drives one preview → confirm → execute cycle at a time.
pub struct BroadcastCampaign {
    orchestrator: Arc<BroadcastOrchestrator>,
    inner: Mutex<CampaignState>,
}

impl BroadcastCampaign {
    pub fn new(orchestrator: Arc<BroadcastOrchestrator>) -> Self {
        Self {
            orchestrator,
            inner: Mutex::new(CampaignState { state: BroadcastState::Idle, channel_id: None, run: None }),
        }
    }

    pub fn orchestrator(&self) -> &Arc<BroadcastOrchestrator> {
        &self.orchestrator
    }

    pub fn state(&self) -> BroadcastState {
        self.inner().state
    }

    pub async fn request_preview(
        &self,
        channel_id: &str,
    ) -> Result<PreviewOutcome, BroadcastTransitionError> {
        self.apply(BroadcastEvent::PreviewRequested)?;

        let outcome = self.orchestrator.preview(channel_id).await;

        let mut inner = self.inner();
        if outcome.is_degraded() {
            inner.state = transition(inner.state, BroadcastEvent::Cancelled)?;
            inner.channel_id = None;
        } else {
            inner.state = transition(inner.state, BroadcastEvent::PreviewReady)?;
            inner.channel_id = Some(channel_id.to_owned());
        }
        Ok(outcome)
    }

    /// Claims the pending preview for execution. Only one run can be active.
    pub fn confirm(&self, channel_id: &str) -> Result<ConfirmedRun, BroadcastTransitionError> {
        let mut inner = self.inner();
        let next = transition(inner.state, BroadcastEvent::Confirmed)?;

        if let Some(expected) = inner.channel_id.as_deref() {
            if expected != channel_id {
                return Err(BroadcastTransitionError::ChannelMismatch {
                    expected: expected.to_owned(),
                    actual: channel_id.to_owned(),
                });
            }
        }

        let run_id = Uuid::new_v4();
        let cancel = CancellationToken::new();
        inner.state = next;
        inner.run = Some(ActiveRun { run_id, cancel: cancel.clone() });
        info!(event_name = "broadcast.campaign.confirmed", %run_id, channel_id, "broadcast confirmed");

        Ok(ConfirmedRun { run_id, channel_id: channel_id.to_owned(), cancel })
    }

    /// Re-reads the channel and delivers to whoever is still eligible.
    pub async fn run<B>(
        &self,
        run: ConfirmedRun,
        build_message: B,
        on_progress: Option<&(dyn Fn(usize, usize) + Send + Sync)>,
    ) -> ConfirmOutcome
    where
        B: Fn(&str) -> OutboundMessage + Send + Sync,
    {
        let ConfirmedRun { run_id, channel_id, cancel } = run;

        let outcome = match self.orchestrator.preview(&channel_id).await {
            PreviewOutcome::Degraded { reason } => ConfirmOutcome::Degraded { reason },
            PreviewOutcome::Ready(preview) if preview.eligible_recipient_ids.is_empty() => {
                info!(event_name = "broadcast.campaign.nothing_to_send", %run_id, "no eligible recipients remain");
                ConfirmOutcome::NothingToSend
            }
            PreviewOutcome::Ready(preview) => {
                let report = self
                    .orchestrator
                    .execute(&preview.eligible_recipient_ids, build_message, on_progress, &cancel)
                    .await;
                ConfirmOutcome::Executed(report)
            }
        };

        self.finish(run_id);
        outcome
    }

    pub async fn confirm_and_run<B>(
        &self,
        channel_id: &str,
        build_message: B,
        on_progress: Option<&(dyn Fn(usize, usize) + Send + Sync)>,
    ) -> Result<ConfirmOutcome, BroadcastTransitionError>
    where
        B: Fn(&str) -> OutboundMessage + Send + Sync,
    {
        let run = self.confirm(channel_id)?;
        Ok(self.run(run, build_message, on_progress).await)
    }

    pub fn cancel(&self) -> Result<CancelOutcome, BroadcastTransitionError> {
        let mut inner = self.inner();
        if inner.state == BroadcastState::Executing {
            let Some(run) = inner.run.as_ref() else {
                return Err(BroadcastTransitionError::InvalidTransition {
                    from: inner.state,
                    event: BroadcastEvent::Cancelled,
                });
            };
            run.cancel.cancel();
            warn!(event_name = "broadcast.campaign.cancel_requested", run_id = %run.run_id, "cancelling active broadcast");
            return Ok(CancelOutcome::RunCancelling { run_id: run.run_id });
        }

        inner.state = transition(inner.state, BroadcastEvent::Cancelled)?;
        inner.channel_id = None;
        info!(event_name = "broadcast.campaign.preview_discarded", "pending broadcast discarded");
        Ok(CancelOutcome::PreviewDiscarded)
    }

    fn apply(&self, event: BroadcastEvent) -> Result<BroadcastState, BroadcastTransitionError> {
        let mut inner = self.inner();
        inner.state = transition(inner.state, event)?;
        Ok(inner.state)
    }

    fn finish(&self, run_id: Uuid) {
        let mut inner = self.inner();
        if inner.run.as_ref().is_some_and(|run| run.run_id == run_id) {
            inner.run = None;
        }
        match transition(inner.state, BroadcastEvent::ExecutionFinished) {
            Ok(next) => inner.state = next,
            Err(error) => warn!(event_name = "broadcast.campaign.finish_ignored", %run_id, %error, "unexpected state at run end"),
        }
        inner.channel_id = None;
        info!(event_name = "broadcast.campaign.finished", %run_id, "broadcast run finished");
    }

    fn inner(&self) -> MutexGuard<'_, CampaignState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::{TimeZone, Utc};

    use super::{
        transition, BroadcastCampaign, BroadcastEvent, BroadcastState, BroadcastTransitionError, CancelOutcome,
        ConfirmOutcome,
    };
    use crate::broadcast::cache::DEFAULT_TTL;
    use crate::broadcast::memory::{InMemoryDirectory, RecordingTransport};
    use crate::broadcast::{
        ApiError, BroadcastOrchestrator, DeliveryCache, DirectMessageSender, EnumeratorConfig, ManualClock,
        OrchestratorConfig, OutboundMessage, RecipientEnumerator, RetryPolicy,
    };

    struct Fixture {
        campaign: Arc<BroadcastCampaign>,
        directory: Arc<InMemoryDirectory>,
        transport: Arc<RecordingTransport>,
    }

    fn fixture() -> Fixture {
        let retry = RetryPolicy { max_retries: 1, base_delay_ms: 0 };
        let directory = Arc::new(InMemoryDirectory::new());
        let transport = Arc::new(RecordingTransport::new());
        let start = Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).single().expect("valid start");
        let cache = Arc::new(DeliveryCache::new(DEFAULT_TTL, Arc::new(ManualClock::new(start))));
        let enumerator = RecipientEnumerator::new(
            directory.clone(),
            retry.clone(),
            EnumeratorConfig { batch_pause: Duration::ZERO, ..EnumeratorConfig::default() },
        );
        let sender = Arc::new(DirectMessageSender::new(transport.clone(), retry));
        let orchestrator =
            Arc::new(BroadcastOrchestrator::new(enumerator, sender, cache, OrchestratorConfig::default()));

        Fixture { campaign: Arc::new(BroadcastCampaign::new(orchestrator)), directory, transport }
    }

    fn message(recipient_id: &str) -> OutboundMessage {
        OutboundMessage::text(format!("welcome {recipient_id}"))
    }

    #[test]
    fn transition_table_rejects_out_of_order_events() {
        assert_eq!(
            transition(BroadcastState::Idle, BroadcastEvent::PreviewRequested),
            Ok(BroadcastState::Previewing)
        );
        assert_eq!(
            transition(BroadcastState::AwaitingConfirmation, BroadcastEvent::Confirmed),
            Ok(BroadcastState::Executing)
        );
        assert_eq!(
            transition(BroadcastState::Idle, BroadcastEvent::Confirmed),
            Err(BroadcastTransitionError::InvalidTransition {
                from: BroadcastState::Idle,
                event: BroadcastEvent::Confirmed,
            })
        );
        assert!(transition(BroadcastState::Executing, BroadcastEvent::PreviewRequested).is_err());
        assert!(transition(BroadcastState::Completed, BroadcastEvent::Confirmed).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn preview_confirm_execute_cycle() {
        let fixture = fixture();
        fixture.directory.add_user("U1").add_user("U2").add_bot("B1");

        let preview = fixture.campaign.request_preview("C1").await.expect("preview allowed");
        assert_eq!(preview.preview().map(|preview| preview.eligible_count()), Some(2));
        assert_eq!(fixture.campaign.state(), BroadcastState::AwaitingConfirmation);

        let outcome = fixture.campaign.confirm_and_run("C1", message, None).await.expect("confirm allowed");

        let ConfirmOutcome::Executed(report) = outcome else {
            panic!("expected an executed run, got {outcome:?}");
        };
        assert_eq!(report.succeeded, 2);
        assert_eq!(fixture.campaign.state(), BroadcastState::Completed);
        assert_eq!(fixture.transport.delivered_recipients(), vec!["U1".to_owned(), "U2".to_owned()]);

        // a second cycle finds everyone already notified
        fixture.campaign.request_preview("C1").await.expect("preview allowed after completion");
        let outcome = fixture.campaign.confirm_and_run("C1", message, None).await.expect("confirm allowed");
        assert_eq!(outcome, ConfirmOutcome::NothingToSend);
    }

    #[tokio::test]
    async fn confirm_without_preview_is_rejected() {
        let fixture = fixture();

        let error = fixture.campaign.confirm("C1").expect_err("idle campaign cannot confirm");
        assert_eq!(
            error,
            BroadcastTransitionError::InvalidTransition {
                from: BroadcastState::Idle,
                event: BroadcastEvent::Confirmed,
            }
        );
        assert_eq!(fixture.campaign.state(), BroadcastState::Idle);
    }

    #[tokio::test]
    async fn confirm_for_another_channel_is_rejected() {
        let fixture = fixture();
        fixture.directory.add_user("U1");
        fixture.campaign.request_preview("C1").await.expect("preview allowed");

        let error = fixture.campaign.confirm("C2").expect_err("channel must match");
        assert!(matches!(error, BroadcastTransitionError::ChannelMismatch { .. }));
        assert_eq!(fixture.campaign.state(), BroadcastState::AwaitingConfirmation);
    }

    #[tokio::test]
    async fn cancel_before_confirm_returns_to_idle_without_sending() {
        let fixture = fixture();
        fixture.directory.add_user("U1");
        fixture.campaign.request_preview("C1").await.expect("preview allowed");

        assert_eq!(fixture.campaign.cancel(), Ok(CancelOutcome::PreviewDiscarded));
        assert_eq!(fixture.campaign.state(), BroadcastState::Idle);
        assert_eq!(fixture.transport.open_calls(), 0);
        assert!(fixture.campaign.confirm("C1").is_err());
    }

    #[tokio::test]
    async fn degraded_preview_leaves_nothing_to_confirm() {
        let fixture = fixture();
        fixture.directory.fail_listing(ApiError::PermissionDenied("missing_scope".to_owned()));

        let outcome = fixture.campaign.request_preview("C1").await.expect("preview allowed");

        assert!(outcome.is_degraded());
        assert_eq!(fixture.campaign.state(), BroadcastState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_during_execution_stops_the_run() {
        let fixture = fixture();
        for index in 0..6 {
            fixture.directory.add_user(&format!("U{index}"));
        }
        fixture.campaign.request_preview("C1").await.expect("preview allowed");
        let run = fixture.campaign.confirm("C1").expect("confirm allowed");
        let run_id = run.run_id;

        let campaign = fixture.campaign.clone();
        let task = tokio::spawn(async move { campaign.run(run, message, None).await });

        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert_eq!(fixture.campaign.state(), BroadcastState::Executing);
        assert_eq!(fixture.campaign.cancel(), Ok(CancelOutcome::RunCancelling { run_id }));

        let outcome = task.await.expect("run task should not panic");
        let ConfirmOutcome::Executed(report) = outcome else {
            panic!("expected an executed run, got {outcome:?}");
        };
        assert_eq!(report.succeeded, 2);
        assert_eq!(report.cancelled, 4);
        assert_eq!(fixture.campaign.state(), BroadcastState::Completed);
    }

    #[test]
    fn state_serializes_as_snake_case() {
        let encoded = serde_json::to_string(&BroadcastState::AwaitingConfirmation).expect("serialize state");
        assert_eq!(encoded, "\"awaiting_confirmation\"");
    }
}

use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use perkbot_core::{
    broadcast::{BroadcastCampaign, CancelOutcome, ConfirmOutcome, ConfirmedRun, PreviewOutcome},
    errors::ApplicationError,
};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::{
    blocks::{
        self, MessageTemplate, CANCEL_BROADCAST_ACTION, CONFIRM_BROADCAST_ACTION,
        CONTACT_RH_ACTION,
    },
    commands::{BroadcastCommandService, CommandEnvelope, CommandRouteError},
    events::{
        BlockActionEvent, BlockActionService, EventContext, EventHandlerError,
        MemberJoinedChannelEvent, MemberJoinedOutcome, MemberJoinedService,
    },
};

const PROGRESS_LOG_EVERY: usize = 10;

/// Slack-facing entry point for the welcome broadcast and the join greeting.
#[derive(Clone)]
pub struct BroadcastService {
    campaign: Arc<BroadcastCampaign>,
    welcome_channel_id: String,
    send_dm: bool,
    rh_user_id: Option<String>,
    active_run: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl BroadcastService {
    pub fn new(
        campaign: Arc<BroadcastCampaign>,
        welcome_channel_id: impl Into<String>,
        send_dm: bool,
    ) -> Self {
        Self {
            campaign,
            welcome_channel_id: welcome_channel_id.into(),
            send_dm,
            rh_user_id: None,
            active_run: Arc::new(Mutex::new(None)),
        }
    }

    /// Slack user that receives "Falar com RH/DP" requests.
    pub fn with_rh_contact(mut self, rh_user_id: Option<String>) -> Self {
        self.rh_user_id = rh_user_id;
        self
    }

    pub fn campaign(&self) -> &Arc<BroadcastCampaign> {
        &self.campaign
    }

    /// Cancels whatever broadcast is pending or running and waits up to
    /// `grace` for a running one to DM its partial report. Returns `false`
    /// when the run was still going at the deadline.
    pub async fn drain(&self, grace: Duration) -> bool {
        if let Ok(outcome) = self.campaign.cancel() {
            warn!(
                event_name = "broadcast.drain.cancelled",
                outcome = ?outcome,
                "pending or running broadcast cancelled"
            );
        }

        let Some(run) = self.take_active_run() else {
            return true;
        };
        match tokio::time::timeout(grace, run).await {
            Ok(Ok(())) => true,
            Ok(Err(join_error)) => {
                error!(
                    event_name = "broadcast.drain.run_failed",
                    error = %join_error,
                    "broadcast task ended abnormally"
                );
                true
            }
            Err(_) => false,
        }
    }

    fn take_active_run(&self) -> Option<JoinHandle<()>> {
        self.active_run.lock().unwrap_or_else(PoisonError::into_inner).take()
    }

    fn track_run(&self, handle: JoinHandle<()>) {
        let mut active = self.active_run.lock().unwrap_or_else(PoisonError::into_inner);
        // the campaign admits one run at a time, so a previous handle has finished
        *active = Some(handle);
    }

    /// Runs a confirmed broadcast in the background and DMs the outcome to
    /// `requested_by` once it finishes.
    fn spawn_run(&self, run: ConfirmedRun, requested_by: String) {
        let campaign = self.campaign.clone();
        let handle = tokio::spawn(async move {
            let run_id = run.run_id;
            let channel_id = run.channel_id.clone();
            let progress = move |done: usize, total: usize| {
                if done % PROGRESS_LOG_EVERY == 0 || done == total {
                    info!(
                        event_name = "broadcast.run.progress",
                        %run_id,
                        done,
                        total,
                        "broadcast progress"
                    );
                }
            };

            let outcome = campaign
                .run(
                    run,
                    |recipient_id: &str| blocks::welcome_message(recipient_id).to_outbound(),
                    Some(&progress),
                )
                .await;

            let summary = match &outcome {
                ConfirmOutcome::Executed(report) => {
                    info!(
                        event_name = "broadcast.run.completed",
                        %run_id,
                        total = report.total,
                        succeeded = report.succeeded,
                        skipped = report.skipped,
                        failed = report.failed,
                        cancelled = report.cancelled,
                        "broadcast finished"
                    );
                    blocks::broadcast_report_message(report)
                }
                ConfirmOutcome::NothingToSend => blocks::broadcast_nothing_to_send_message(),
                ConfirmOutcome::Degraded { reason } => {
                    error!(
                        event_name = "broadcast.run.degraded",
                        %run_id,
                        reason = %reason,
                        "broadcast could not read the channel"
                    );
                    blocks::broadcast_preview_message(
                        &channel_id,
                        &PreviewOutcome::Degraded { reason: reason.clone() },
                    )
                }
            };

            let sender = campaign.orchestrator().sender();
            if let Err(error) = sender.send_direct(&requested_by, &summary.to_outbound()).await {
                warn!(
                    event_name = "broadcast.run.report_failed",
                    %run_id,
                    requested_by = %requested_by,
                    error = %error,
                    "could not deliver broadcast report"
                );
            }
        });
        self.track_run(handle);
    }

    fn confirm(&self, event: &BlockActionEvent, ctx: &EventContext) -> MessageTemplate {
        let channel_id = event
            .value
            .as_deref()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or(&self.welcome_channel_id);

        match self.campaign.confirm(channel_id) {
            Ok(run) => {
                info!(
                    event_name = "broadcast.run.started",
                    run_id = %run.run_id,
                    channel_id,
                    requested_by = %event.user_id,
                    "broadcast confirmed"
                );
                self.spawn_run(run, event.user_id.clone());
                blocks::broadcast_started_message()
            }
            Err(rejected) => {
                warn!(
                    event_name = "broadcast.run.rejected",
                    channel_id,
                    correlation_id = %ctx.correlation_id,
                    error = %rejected,
                    "broadcast confirmation rejected"
                );
                interface_error_message(ApplicationError::from(rejected), &ctx.correlation_id)
            }
        }
    }

    async fn contact_rh(&self, event: &BlockActionEvent, ctx: &EventContext) -> MessageTemplate {
        let requester_id = event.user_id.as_str();
        let Some(rh_user_id) = self.rh_user_id.as_deref() else {
            error!(
                event_name = "contact_rh.unconfigured",
                requester_id,
                "contact request dropped; no HR contact configured"
            );
            return blocks::contact_rh_unconfigured_message();
        };

        let message = blocks::contact_rh_request_message(requester_id).to_outbound();
        match self.campaign.orchestrator().sender().send_direct(rh_user_id, &message).await {
            Ok(()) => {
                info!(
                    event_name = "contact_rh.notified",
                    requester_id,
                    rh_user_id,
                    "HR notified of contact request"
                );
                blocks::contact_rh_confirmed_message()
            }
            Err(failure) => {
                warn!(
                    event_name = "contact_rh.failed",
                    requester_id,
                    rh_user_id,
                    correlation_id = %ctx.correlation_id,
                    error = %failure,
                    "could not notify HR"
                );
                interface_error_message(ApplicationError::from(failure), &ctx.correlation_id)
            }
        }
    }

    fn cancel(&self, ctx: &EventContext) -> MessageTemplate {
        match self.campaign.cancel() {
            Ok(CancelOutcome::PreviewDiscarded) => blocks::broadcast_cancelled_message(),
            Ok(CancelOutcome::RunCancelling { .. }) => blocks::broadcast_cancelling_message(),
            Err(rejected) => {
                debug!(
                    event_name = "broadcast.cancel.noop",
                    correlation_id = %ctx.correlation_id,
                    error = %rejected,
                    "cancel pressed with nothing pending"
                );
                blocks::broadcast_cancelled_message()
            }
        }
    }
}

fn interface_error_message(error: ApplicationError, correlation_id: &str) -> MessageTemplate {
    let interface = error.into_interface(correlation_id);
    blocks::error_message(interface.user_message(), interface.correlation_id())
}

#[async_trait]
impl BroadcastCommandService for BroadcastService {
    async fn preview_broadcast(
        &self,
        channel_override: Option<String>,
        envelope: &CommandEnvelope,
    ) -> Result<MessageTemplate, CommandRouteError> {
        let channel_id = channel_override.unwrap_or_else(|| self.welcome_channel_id.clone());
        info!(
            event_name = "broadcast.preview.requested",
            channel_id = %channel_id,
            requested_by = %envelope.user_id,
            request_id = %envelope.request_id,
            "broadcast preview requested"
        );

        match self.campaign.request_preview(&channel_id).await {
            Ok(outcome) => Ok(blocks::broadcast_preview_message(&channel_id, &outcome)),
            Err(rejected) => {
                warn!(
                    event_name = "broadcast.preview.rejected",
                    channel_id = %channel_id,
                    error = %rejected,
                    "broadcast preview rejected"
                );
                Ok(interface_error_message(ApplicationError::from(rejected), &envelope.request_id))
            }
        }
    }
}

#[async_trait]
impl BlockActionService for BroadcastService {
    async fn handle_block_action(
        &self,
        event: &BlockActionEvent,
        ctx: &EventContext,
    ) -> Result<Option<MessageTemplate>, EventHandlerError> {
        Ok(match event.action_id.as_str() {
            CONFIRM_BROADCAST_ACTION => Some(self.confirm(event, ctx)),
            CANCEL_BROADCAST_ACTION => Some(self.cancel(ctx)),
            CONTACT_RH_ACTION => Some(self.contact_rh(event, ctx).await),
            _ => None,
        })
    }
}

#[async_trait]
impl MemberJoinedService for BroadcastService {
    async fn handle_member_joined(
        &self,
        event: &MemberJoinedChannelEvent,
        _ctx: &EventContext,
    ) -> Result<MemberJoinedOutcome, EventHandlerError> {
        if event.channel_id != self.welcome_channel_id {
            return Ok(MemberJoinedOutcome::OtherChannel);
        }

        let orchestrator = self.campaign.orchestrator();
        let cache = orchestrator.cache();
        let message_kind = orchestrator.message_kind();
        let user_id = event.user_id.as_str();

        if !cache.can_send(user_id, message_kind) {
            debug!(
                event_name = "welcome.member_joined.duplicate",
                user_id,
                "member already welcomed"
            );
            return Ok(MemberJoinedOutcome::AlreadyWelcomed);
        }

        let outcome = if self.send_dm {
            let message = blocks::welcome_message(user_id).to_outbound();
            match orchestrator.sender().send_direct(user_id, &message).await {
                Ok(()) => {
                    info!(event_name = "welcome.member_joined.sent", user_id, "welcome message sent");
                    MemberJoinedOutcome::Welcomed
                }
                Err(error) => {
                    warn!(
                        event_name = "welcome.member_joined.failed",
                        user_id,
                        error = %error,
                        "welcome message failed"
                    );
                    MemberJoinedOutcome::WelcomeFailed { error: error.to_string() }
                }
            }
        } else {
            warn!(
                event_name = "welcome.member_joined.dm_disabled",
                user_id,
                "direct messages disabled; member not greeted"
            );
            MemberJoinedOutcome::DirectMessagesDisabled
        };

        cache.mark_sent(user_id, message_kind);
        Ok(outcome)
    }
}

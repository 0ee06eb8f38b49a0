use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::cache::DeliveryCache;
use super::enumerator::RecipientEnumerator;
use super::sender::DirectMessageSender;
use super::{OutboundMessage, WELCOME_MESSAGE_KIND};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OrchestratorConfig {
    pub message_kind: String,
    pub send_interval: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self { message_kind: WELCOME_MESSAGE_KIND.to_owned(), send_interval: Duration::from_secs(1) }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct BroadcastPreview {
    pub total_members: usize,
    pub bot_count: usize,
    pub deactivated_count: usize,
    pub already_notified_count: usize,
    pub eligible_recipient_ids: Vec<String>,
}

impl BroadcastPreview {
    pub fn eligible_count(&self) -> usize {
        self.eligible_recipient_ids.len()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PreviewOutcome {
    Ready(BroadcastPreview),
    /// The membership could not be read. Callers render it as an empty
    /// preview plus a permissions hint.
    Degraded { reason: String },
}

impl PreviewOutcome {
    pub fn preview(&self) -> Option<&BroadcastPreview> {
        match self {
            Self::Ready(preview) => Some(preview),
            Self::Degraded { .. } => None,
        }
    }

    pub fn into_preview(self) -> BroadcastPreview {
        match self {
            Self::Ready(preview) => preview,
            Self::Degraded { .. } => BroadcastPreview::default(),
        }
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, Self::Degraded { .. })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Sent,
    Skipped,
    Failed(String),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DeliveryFailure {
    pub recipient_id: String,
    pub error: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct BroadcastReport {
    pub total: usize,
    pub succeeded: usize,
    pub skipped: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub failures: Vec<DeliveryFailure>,
}

impl BroadcastReport {
    pub fn new(total: usize) -> Self {
        Self { total, ..Self::default() }
    }

    pub fn record(&mut self, recipient_id: &str, outcome: DeliveryOutcome) {
        match outcome {
            DeliveryOutcome::Sent => self.succeeded += 1,
            DeliveryOutcome::Skipped => self.skipped += 1,
            DeliveryOutcome::Failed(error) => {
                self.failed += 1;
                self.failures.push(DeliveryFailure { recipient_id: recipient_id.to_owned(), error });
            }
        }
    }

    /// Percentage of `total` that was delivered, in `0.0..=100.0`.
    pub fn success_rate(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        (self.succeeded as f64 / self.total as f64 * 100.0).clamp(0.0, 100.0)
    }

    pub fn was_cancelled(&self) -> bool {
        self.cancelled > 0
    }
}

pub struct BroadcastOrchestrator {
    enumerator: RecipientEnumerator,
    sender: Arc<DirectMessageSender>,
    cache: Arc<DeliveryCache>,
    config: OrchestratorConfig,
}

impl BroadcastOrchestrator {
    pub fn new(
        enumerator: RecipientEnumerator,
        sender: Arc<DirectMessageSender>,
        cache: Arc<DeliveryCache>,
        config: OrchestratorConfig,
    ) -> Self {
        Self { enumerator, sender, cache, config }
    }

    pub fn cache(&self) -> &Arc<DeliveryCache> {
        &self.cache
    }

    pub fn sender(&self) -> &Arc<DirectMessageSender> {
        &self.sender
    }

    pub fn message_kind(&self) -> &str {
        &self.config.message_kind
    }

    /// Computes who would receive the message right now. Never fails: an
    /// unreadable membership yields [`PreviewOutcome::Degraded`].
    pub async fn preview(&self, channel_id: &str) -> PreviewOutcome {
        let recipients = match self.enumerator.list_eligibility(channel_id).await {
            Ok(recipients) => recipients,
            Err(api_error) => {
                error!(
                    event_name = "broadcast.preview.degraded",
                    channel_id,
                    error = %api_error,
                    "could not enumerate channel members"
                );
                return PreviewOutcome::Degraded { reason: api_error.to_string() };
            }
        };

        let mut preview = BroadcastPreview { total_members: recipients.len(), ..BroadcastPreview::default() };
        for recipient in recipients {
            if recipient.is_bot {
                preview.bot_count += 1;
            } else if recipient.is_deleted {
                preview.deactivated_count += 1;
            } else if self.cache.can_send(&recipient.id, &self.config.message_kind) {
                preview.eligible_recipient_ids.push(recipient.id);
            } else {
                preview.already_notified_count += 1;
            }
        }

        info!(
            event_name = "broadcast.preview.ready",
            channel_id,
            total_members = preview.total_members,
            bot_count = preview.bot_count,
            deactivated_count = preview.deactivated_count,
            already_notified_count = preview.already_notified_count,
            eligible_count = preview.eligible_count(),
            "broadcast preview computed"
        );
        PreviewOutcome::Ready(preview)
    }

    /// Sends to `recipient_ids` one at a time, pacing attempts by the
    /// configured interval. Individual failures land in the report; the run
    /// itself never fails.
    pub async fn execute<B>(
        &self,
        recipient_ids: &[String],
        build_message: B,
        on_progress: Option<&(dyn Fn(usize, usize) + Send + Sync)>,
        cancel: &CancellationToken,
    ) -> BroadcastReport
    where
        B: Fn(&str) -> OutboundMessage + Send + Sync,
    {
        let total = recipient_ids.len();
        let kind = self.config.message_kind.as_str();
        let mut report = BroadcastReport::new(total);
        info!(event_name = "broadcast.execute.started", total, message_kind = kind, "broadcast started");

        for (index, recipient_id) in recipient_ids.iter().enumerate() {
            if cancel.is_cancelled() {
                report.cancelled = total - index;
                break;
            }

            if !self.cache.can_send(recipient_id, kind) {
                report.record(recipient_id, DeliveryOutcome::Skipped);
                continue;
            }

            let message = build_message(recipient_id);
            match self.sender.send_direct(recipient_id, &message).await {
                Ok(()) => {
                    self.cache.mark_sent(recipient_id, kind);
                    report.record(recipient_id, DeliveryOutcome::Sent);
                    if let Some(on_progress) = on_progress {
                        on_progress(report.succeeded, total);
                    }
                }
                Err(delivery_error) => {
                    warn!(
                        event_name = "broadcast.execute.delivery_failed",
                        recipient_id = recipient_id.as_str(),
                        error = %delivery_error,
                        "direct message failed; continuing"
                    );
                    report.record(recipient_id, DeliveryOutcome::Failed(delivery_error.to_string()));
                }
            }

            let is_last = index + 1 == total;
            if !is_last && !self.config.send_interval.is_zero() {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        report.cancelled = total - index - 1;
                        break;
                    }
                    _ = tokio::time::sleep(self.config.send_interval) => {}
                }
            }
        }

        if report.was_cancelled() {
            warn!(
                event_name = "broadcast.execute.cancelled",
                succeeded = report.succeeded,
                cancelled = report.cancelled,
                "broadcast cancelled before completion"
            );
        }
        info!(
            event_name = "broadcast.execute.finished",
            total,
            succeeded = report.succeeded,
            skipped = report.skipped,
            failed = report.failed,
            cancelled = report.cancelled,
            "broadcast finished"
        );
        report
    }
}

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use tracing::{debug, info, warn};

use super::retry::{with_rate_limit_retry, RetryPolicy};
use super::{ApiError, Recipient, RecipientDirectory};

/// Upper bound the directory accepts for one membership page.
pub const MAX_PAGE_SIZE: u32 = 1_000;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EnumeratorConfig {
    pub page_size: u32,
    pub batch_size: usize,
    pub batch_pause: Duration,
}

impl Default for EnumeratorConfig {
    fn default() -> Self {
        Self { page_size: MAX_PAGE_SIZE, batch_size: 10, batch_pause: Duration::from_millis(200) }
    }
}

pub struct RecipientEnumerator {
    directory: Arc<dyn RecipientDirectory>,
    retry_policy: RetryPolicy,
    config: EnumeratorConfig,
}

impl RecipientEnumerator {
    pub fn new(
        directory: Arc<dyn RecipientDirectory>,
        retry_policy: RetryPolicy,
        config: EnumeratorConfig,
    ) -> Self {
        Self { directory, retry_policy, config }
    }

    /// Lists every member of `channel_id` with bot/deleted flags. Only a
    /// failed membership listing is an error; individual lookups that fail
    /// yield a [`Recipient::placeholder`].
    pub async fn list_eligibility(&self, channel_id: &str) -> Result<Vec<Recipient>, ApiError> {
        info!(event_name = "broadcast.enumerate.start", channel_id, "listing channel members");
        let member_ids = self.collect_member_ids(channel_id).await?;

        if member_ids.is_empty() {
            warn!(event_name = "broadcast.enumerate.empty", channel_id, "no members found in channel");
            return Ok(Vec::new());
        }
        info!(
            event_name = "broadcast.enumerate.members_collected",
            channel_id,
            member_count = member_ids.len(),
            "channel membership collected"
        );

        let batch_size = self.config.batch_size.max(1);
        let mut recipients = Vec::with_capacity(member_ids.len());
        let mut batches = member_ids.chunks(batch_size).peekable();

        while let Some(batch) = batches.next() {
            let lookups = batch.iter().map(|recipient_id| self.lookup(recipient_id));
            recipients.extend(join_all(lookups).await);

            if batches.peek().is_some() && !self.config.batch_pause.is_zero() {
                tokio::time::sleep(self.config.batch_pause).await;
            }
        }

        Ok(recipients)
    }

    async fn collect_member_ids(&self, channel_id: &str) -> Result<Vec<String>, ApiError> {
        let directory = self.directory.as_ref();
        let limit = self.config.page_size.clamp(1, MAX_PAGE_SIZE);
        let mut member_ids = Vec::new();
        let mut cursor: Option<String> = None;
        let mut pages = 0_usize;

        loop {
            let page_cursor = cursor.as_deref();
            let page = with_rate_limit_retry(&self.retry_policy, "conversations.members", || {
                directory.list_members(channel_id, page_cursor, limit)
            })
            .await?;
            pages += 1;
            member_ids.extend(page.member_ids);

            cursor = page
                .next_cursor
                .map(|next| next.trim().to_owned())
                .filter(|next| !next.is_empty());
            if cursor.is_none() {
                break;
            }
        }

        debug!(
            event_name = "broadcast.enumerate.paginated",
            channel_id,
            pages,
            member_count = member_ids.len(),
            "membership pagination finished"
        );
        Ok(member_ids)
    }

    async fn lookup(&self, recipient_id: &str) -> Recipient {
        let directory = self.directory.as_ref();
        let result = with_rate_limit_retry(&self.retry_policy, "users.info", || {
            directory.get_attributes(recipient_id)
        })
        .await;

        match result {
            Ok(attributes) => Recipient {
                id: recipient_id.to_owned(),
                is_bot: attributes.is_bot,
                is_deleted: attributes.is_deleted,
            },
            Err(error) => {
                match &error {
                    ApiError::NotFound(_) => debug!(
                        event_name = "broadcast.enumerate.lookup_failed",
                        recipient_id,
                        error = %error,
                        "member no longer exists; excluding from broadcast"
                    ),
                    ApiError::PermissionDenied(_) => warn!(
                        event_name = "broadcast.enumerate.lookup_failed",
                        recipient_id,
                        error = %error,
                        "missing permission to read member; excluding from broadcast"
                    ),
                    _ => warn!(
                        event_name = "broadcast.enumerate.lookup_failed",
                        recipient_id,
                        error = %error,
                        "member lookup failed; excluding from broadcast"
                    ),
                }
                Recipient::placeholder(recipient_id)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::time::Instant;

    use super::{EnumeratorConfig, RecipientEnumerator};
    use crate::broadcast::memory::InMemoryDirectory;
    use crate::broadcast::{
        ApiError, MemberAttributes, MemberPage, Recipient, RecipientDirectory, RetryPolicy,
    };

    fn no_wait_retry() -> RetryPolicy {
        RetryPolicy { max_retries: 3, base_delay_ms: 0 }
    }

    /// Serves scripted pages and records the cursor each call received.
    #[derive(Default)]
    struct PagedDirectory {
        pages: Mutex<VecDeque<Result<MemberPage, ApiError>>>,
        cursors: Mutex<Vec<Option<String>>>,
    }

    impl PagedDirectory {
        fn with_pages(pages: Vec<Result<MemberPage, ApiError>>) -> Self {
            Self { pages: Mutex::new(pages.into()), cursors: Mutex::new(Vec::new()) }
        }
    }

    #[async_trait]
    impl RecipientDirectory for PagedDirectory {
        async fn list_members(
            &self,
            _channel_id: &str,
            cursor: Option<&str>,
            _limit: u32,
        ) -> Result<MemberPage, ApiError> {
            self.cursors.lock().expect("lock").push(cursor.map(str::to_owned));
            self.pages.lock().expect("lock").pop_front().unwrap_or(Ok(MemberPage::default()))
        }

        async fn get_attributes(&self, _recipient_id: &str) -> Result<MemberAttributes, ApiError> {
            Ok(MemberAttributes::default())
        }
    }

    fn page(ids: &[&str], next_cursor: Option<&str>) -> Result<MemberPage, ApiError> {
        Ok(MemberPage {
            member_ids: ids.iter().map(|id| (*id).to_owned()).collect(),
            next_cursor: next_cursor.map(str::to_owned),
        })
    }

    #[tokio::test]
    async fn aggregates_pages_until_cursor_is_blank() {
        let directory = Arc::new(PagedDirectory::with_pages(vec![
            page(&["U1", "U2"], Some("cursor-a")),
            page(&["U3"], Some(" cursor-b ")),
            page(&["U4"], Some("   ")),
            page(&["U-never"], None),
        ]));
        let enumerator = RecipientEnumerator::new(
            directory.clone(),
            no_wait_retry(),
            EnumeratorConfig { batch_pause: Duration::ZERO, ..EnumeratorConfig::default() },
        );

        let recipients = enumerator.list_eligibility("C1").await.expect("enumerate");
        let ids = recipients.iter().map(|recipient| recipient.id.as_str()).collect::<Vec<_>>();

        assert_eq!(ids, vec!["U1", "U2", "U3", "U4"]);
        let cursors = directory.cursors.lock().expect("lock").clone();
        assert_eq!(
            cursors,
            vec![None, Some("cursor-a".to_owned()), Some("cursor-b".to_owned())],
            "cursor is trimmed before reuse"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_page_is_retried() {
        let directory = Arc::new(PagedDirectory::with_pages(vec![
            Err(ApiError::RateLimited { retry_after: Some(Duration::from_secs(2)) }),
            page(&["U1"], None),
        ]));
        let enumerator =
            RecipientEnumerator::new(directory.clone(), no_wait_retry(), EnumeratorConfig::default());

        let recipients = enumerator.list_eligibility("C1").await.expect("enumerate");
        assert_eq!(recipients.len(), 1);
        assert_eq!(directory.cursors.lock().expect("lock").len(), 2);
    }

    #[tokio::test]
    async fn listing_failure_is_returned_to_caller() {
        let directory = InMemoryDirectory::new();
        directory.add_user("U1").fail_listing(ApiError::PermissionDenied("missing_scope".to_owned()));
        let enumerator =
            RecipientEnumerator::new(Arc::new(directory), no_wait_retry(), EnumeratorConfig::default());

        let error = enumerator.list_eligibility("C1").await.expect_err("listing must fail");
        assert_eq!(error, ApiError::PermissionDenied("missing_scope".to_owned()));
    }

    #[tokio::test]
    async fn lookup_failures_become_deleted_placeholders() {
        let directory = InMemoryDirectory::new();
        directory
            .add_user("U1")
            .add_bot("B1")
            .add_user("U2")
            .add_user("U3")
            .fail_lookup("U2", ApiError::NotFound("user_not_found".to_owned()))
            .fail_lookup("U3", ApiError::Transport("timeout".to_owned()));
        let enumerator =
            RecipientEnumerator::new(Arc::new(directory), no_wait_retry(), EnumeratorConfig::default());

        let recipients = enumerator.list_eligibility("C1").await.expect("enumerate");

        assert_eq!(
            recipients,
            vec![
                Recipient { id: "U1".to_owned(), is_bot: false, is_deleted: false },
                Recipient { id: "B1".to_owned(), is_bot: true, is_deleted: false },
                Recipient::placeholder("U2"),
                Recipient::placeholder("U3"),
            ]
        );
    }

    #[tokio::test]
    async fn empty_channel_skips_lookups() {
        let directory = Arc::new(InMemoryDirectory::new());
        let enumerator =
            RecipientEnumerator::new(directory.clone(), no_wait_retry(), EnumeratorConfig::default());

        assert!(enumerator.list_eligibility("C1").await.expect("enumerate").is_empty());
        assert_eq!(directory.lookup_calls(), 0);
    }

    #[tokio::test]
    async fn small_page_size_still_collects_everyone() {
        let directory = Arc::new(InMemoryDirectory::new());
        for index in 0..7 {
            directory.add_user(&format!("U{index}"));
        }
        let enumerator = RecipientEnumerator::new(
            directory.clone(),
            no_wait_retry(),
            EnumeratorConfig { page_size: 3, batch_pause: Duration::ZERO, ..EnumeratorConfig::default() },
        );

        let recipients = enumerator.list_eligibility("C1").await.expect("enumerate");
        assert_eq!(recipients.len(), 7);
        assert_eq!(directory.listing_calls(), 3);
    }

    /// Tracks how many lookups are in flight at once.
    #[derive(Default)]
    struct ConcurrencyGauge {
        members: Vec<String>,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl RecipientDirectory for ConcurrencyGauge {
        async fn list_members(
            &self,
            _channel_id: &str,
            _cursor: Option<&str>,
            _limit: u32,
        ) -> Result<MemberPage, ApiError> {
            Ok(MemberPage { member_ids: self.members.clone(), next_cursor: None })
        }

        async fn get_attributes(&self, _recipient_id: &str) -> Result<MemberAttributes, ApiError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::task::yield_now().await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(MemberAttributes::default())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn lookups_run_in_bounded_batches_with_pauses() {
        let gauge = Arc::new(ConcurrencyGauge {
            members: (0..25).map(|index| format!("U{index}")).collect(),
            ..ConcurrencyGauge::default()
        });
        let enumerator =
            RecipientEnumerator::new(gauge.clone(), no_wait_retry(), EnumeratorConfig::default());
        let started = Instant::now();

        let recipients = enumerator.list_eligibility("C1").await.expect("enumerate");

        assert_eq!(recipients.len(), 25);
        assert_eq!(gauge.peak.load(Ordering::SeqCst), 10);
        assert!(started.elapsed() >= Duration::from_millis(400), "two pauses between three batches");
    }
}

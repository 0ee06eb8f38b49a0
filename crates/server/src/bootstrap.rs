use std::sync::Arc;

use perkbot_core::{
    broadcast::{
        cache::spawn_sweeper, BroadcastCampaign, BroadcastOrchestrator, DeliveryCache,
        DirectMessageSender, RecipientEnumerator, SystemClock,
    },
    config::{AppConfig, ConfigError, LoadOptions},
};
use perkbot_slack::{
    events::broadcast_dispatcher,
    socket::{NoopSocketTransport, ReconnectPolicy, SocketModeRunner},
    BroadcastService, SlackWebClient,
};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub struct Application {
    pub config: AppConfig,
    pub cache: Arc<DeliveryCache>,
    pub campaign: Arc<BroadcastCampaign>,
    pub broadcast: BroadcastService,
    pub slack_runner: SocketModeRunner,
    pub sweeper: JoinHandle<()>,
    pub shutdown: CancellationToken,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("slack http client could not be built: {0}")]
    HttpClient(#[source] reqwest::Error),
}

pub async fn bootstrap(options: LoadOptions) -> Result<Application, BootstrapError> {
    let config = AppConfig::load(options)?;
    bootstrap_with_config(config).await
}

pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(
        event_name = "system.bootstrap.start",
        correlation_id = "bootstrap",
        welcome_channel_id = %config.broadcast.welcome_channel_id,
        "starting application bootstrap"
    );

    let client = Arc::new(SlackWebClient::new(&config.slack).map_err(BootstrapError::HttpClient)?);
    let broadcast = &config.broadcast;

    let cache = Arc::new(DeliveryCache::new(broadcast.cache_ttl(), Arc::new(SystemClock)));
    let enumerator = RecipientEnumerator::new(
        client.clone(),
        broadcast.retry_policy(),
        broadcast.enumerator_config(),
    );
    let sender = Arc::new(DirectMessageSender::new(client, broadcast.retry_policy()));
    let orchestrator = Arc::new(BroadcastOrchestrator::new(
        enumerator,
        sender,
        cache.clone(),
        broadcast.orchestrator_config(),
    ));
    let campaign = Arc::new(BroadcastCampaign::new(orchestrator));
    info!(
        event_name = "system.bootstrap.broadcast_ready",
        correlation_id = "bootstrap",
        cache_ttl_hours = broadcast.cache_ttl_hours,
        send_interval_ms = broadcast.send_interval_ms,
        "broadcast pipeline assembled"
    );

    let service = BroadcastService::new(
        campaign.clone(),
        broadcast.welcome_channel_id.clone(),
        broadcast.send_dm,
    )
    .with_rh_contact(broadcast.rh_user_id.clone());
    let slack_runner = SocketModeRunner::new(
        Arc::new(NoopSocketTransport),
        broadcast_dispatcher(service.clone()),
        ReconnectPolicy::default(),
    );

    let shutdown = CancellationToken::new();
    let sweeper = spawn_sweeper(cache.clone(), broadcast.sweep_interval(), shutdown.clone());

    Ok(Application {
        config,
        cache,
        campaign,
        broadcast: service,
        slack_runner,
        sweeper,
        shutdown,
    })
}

pub mod broadcast;
pub mod config;
pub mod errors;

pub use broadcast::{
    ApiError, BroadcastCampaign, BroadcastOrchestrator, BroadcastPreview, BroadcastReport,
    BroadcastState, DeliveryCache, DirectMessageSender, OutboundMessage, PreviewOutcome,
    RecipientEnumerator,
};
pub use config::{AppConfig, ConfigError, LoadOptions};
pub use errors::{ApplicationError, DomainError, InterfaceError};

use thiserror::Error;

use crate::broadcast::{BroadcastTransitionError, DeliveryError};

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DomainError {
    #[error(transparent)]
    BroadcastTransition(#[from] BroadcastTransitionError),
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ApplicationError {
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error(transparent)]
    Delivery(#[from] DeliveryError),
}

impl From<BroadcastTransitionError> for ApplicationError {
    fn from(value: BroadcastTransitionError) -> Self {
        Self::Domain(DomainError::from(value))
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum InterfaceError {
    #[error("bad request: {message}")]
    BadRequest { message: String, correlation_id: String },
    #[error("service unavailable: {message}")]
    ServiceUnavailable { message: String, correlation_id: String },
}

impl InterfaceError {
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::BadRequest { .. } => {
                "Essa etapa do broadcast não está disponível agora. Gere o preview novamente e tente de novo."
            }
            Self::ServiceUnavailable { .. } => {
                "Não foi possível concluir o envio pelo Slack agora. Tente novamente mais tarde."
            }
        }
    }

    pub fn correlation_id(&self) -> &str {
        match self {
            Self::BadRequest { correlation_id, .. }
            | Self::ServiceUnavailable { correlation_id, .. } => correlation_id,
        }
    }
}

impl ApplicationError {
    pub fn into_interface(self, correlation_id: impl Into<String>) -> InterfaceError {
        let correlation_id = correlation_id.into();
        match self {
            Self::Domain(domain) => {
                InterfaceError::BadRequest { message: domain.to_string(), correlation_id }
            }
            Self::Delivery(delivery) => {
                InterfaceError::ServiceUnavailable { message: delivery.to_string(), correlation_id }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::broadcast::{
        ApiError, BroadcastEvent, BroadcastState, BroadcastTransitionError, DeliveryError,
    };
    use crate::errors::{ApplicationError, InterfaceError};

    #[test]
    fn rejected_transition_maps_to_bad_request() {
        let interface = ApplicationError::from(BroadcastTransitionError::InvalidTransition {
            from: BroadcastState::Idle,
            event: BroadcastEvent::Confirmed,
        })
        .into_interface("action-1");

        assert!(matches!(
            interface,
            InterfaceError::BadRequest { ref message, ref correlation_id }
                if correlation_id == "action-1" && message.contains("idle")
        ));
        assert!(interface.user_message().contains("Gere o preview novamente"));
    }

    #[test]
    fn delivery_failure_maps_to_service_unavailable() {
        let interface =
            ApplicationError::from(DeliveryError::ChannelUnavailable { recipient_id: "U1".to_owned() })
                .into_interface("event-2");

        assert!(matches!(interface, InterfaceError::ServiceUnavailable { .. }));
        assert_eq!(interface.correlation_id(), "event-2");
        assert!(interface.user_message().starts_with("Não foi possível"));
    }

    #[test]
    fn api_failure_inside_delivery_keeps_its_detail() {
        let interface = ApplicationError::from(DeliveryError::from(ApiError::Transport(
            "timeout".to_owned(),
        )))
        .into_interface("event-3");

        assert!(matches!(
            interface,
            InterfaceError::ServiceUnavailable { ref message, .. } if message.contains("timeout")
        ));
    }
}

use crate::{
    error::ChatError,
    types::{ChatEvent, MessageId, MutationAck, MutationKind, Notification, SendAck},
};

/// Send command result before normalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// Row inserted with this id.
    Success { message_id: MessageId },
    Failure { error: ChatError },
}

/// Convert a send outcome to a stable `ChatEvent::SendAck`.
pub fn normalize_send_outcome(client_txn_id: impl Into<String>, outcome: SendOutcome) -> ChatEvent {
    let client_txn_id = client_txn_id.into();
    match outcome {
        SendOutcome::Success { message_id } => ChatEvent::SendAck(SendAck {
            client_txn_id,
            message_id: Some(message_id),
            error_message: None,
        }),
        SendOutcome::Failure { error } => ChatEvent::SendAck(SendAck {
            client_txn_id,
            message_id: None,
            error_message: Some(error.message),
        }),
    }
}

/// Convert an edit/delete/reaction result to a `ChatEvent::MutationAck`.
pub fn normalize_mutation_outcome(
    client_txn_id: impl Into<String>,
    message_id: MessageId,
    kind: MutationKind,
    result: Result<(), ChatError>,
) -> ChatEvent {
    ChatEvent::MutationAck(MutationAck {
        client_txn_id: client_txn_id.into(),
        message_id,
        kind,
        error_message: result.err().map(|error| error.message),
    })
}

/// Surface a failure as a transient notification, keeping the provider text.
pub fn error_notification(title: impl Into<String>, error: &ChatError) -> ChatEvent {
    ChatEvent::Notification(Notification::error(title, error.message.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{error::ChatErrorCategory, types::NotificationLevel};

    #[test]
    fn maps_success_to_send_ack() {
        let event = normalize_send_outcome("txn-1", SendOutcome::Success { message_id: 42 });

        match event {
            ChatEvent::SendAck(ack) => {
                assert_eq!(ack.client_txn_id, "txn-1");
                assert_eq!(ack.message_id, Some(42));
                assert_eq!(ack.error_message, None);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn maps_failure_to_send_ack_with_provider_message() {
        let event = normalize_send_outcome(
            "txn-2",
            SendOutcome::Failure {
                error: ChatError::new(
                    ChatErrorCategory::Storage,
                    "http_413",
                    "The object exceeded the maximum allowed size",
                ),
            },
        );

        match event {
            ChatEvent::SendAck(ack) => {
                assert_eq!(ack.message_id, None);
                assert_eq!(
                    ack.error_message.as_deref(),
                    Some("The object exceeded the maximum allowed size")
                );
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn maps_mutation_results() {
        let ok = normalize_mutation_outcome("txn-3", 9, MutationKind::Edit, Ok(()));
        assert_eq!(
            ok,
            ChatEvent::MutationAck(MutationAck {
                client_txn_id: "txn-3".into(),
                message_id: 9,
                kind: MutationKind::Edit,
                error_message: None,
            })
        );

        let failed = normalize_mutation_outcome(
            "txn-4",
            9,
            MutationKind::Delete,
            Err(ChatError::new(ChatErrorCategory::Auth, "forbidden", "not yours")),
        );
        match failed {
            ChatEvent::MutationAck(ack) => {
                assert_eq!(ack.error_message.as_deref(), Some("not yours"))
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn builds_error_notifications() {
        let error = ChatError::new(ChatErrorCategory::Network, "http_503", "unavailable");
        match error_notification("Failed to load messages", &error) {
            ChatEvent::Notification(notification) => {
                assert_eq!(notification.level, NotificationLevel::Error);
                assert_eq!(notification.detail.as_deref(), Some("unavailable"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}

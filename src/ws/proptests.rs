//! Property-based tests for the socket frame decoder
//!
//! The decoder sits on the untrusted boundary; these verify it is total over
//! arbitrary input and faithful over well-formed frames.

use super::protocol::ClientAction;
use proptest::prelude::*;
use serde_json::json;
use uuid::Uuid;

proptest! {
    #[test]
    fn decode_is_total_over_arbitrary_input(raw in ".*") {
        // Never panics; either a decoded action or a decode error.
        let _ = ClientAction::decode(&raw);
    }

    #[test]
    fn well_formed_send_message_frames_decode(
        chat in proptest::option::of(any::<u128>()),
        recipient in proptest::option::of(any::<u128>()),
        content in proptest::option::of("[a-zA-Z0-9 .!?]{0,60}"),
    ) {
        let chat = chat.map(Uuid::from_u128);
        let recipient = recipient.map(Uuid::from_u128);

        let mut frame = json!({ "action": "send_message" });
        if let Some(id) = chat {
            frame["chatId"] = json!(id.to_string());
        }
        if let Some(id) = recipient {
            frame["recipientId"] = json!(id.to_string());
        }
        if let Some(body) = &content {
            frame["content"] = json!(body);
        }

        let decoded = ClientAction::decode(&frame.to_string()).unwrap();
        prop_assert_eq!(decoded, ClientAction::SendMessage {
            chat_id: chat,
            recipient_id: recipient,
            content: content.unwrap_or_default(),
        });
    }

    #[test]
    fn unknown_actions_keep_their_name(name in "[a-z_]{1,24}") {
        prop_assume!(name != "send_message");

        let decoded = ClientAction::decode(&json!({ "action": &name }).to_string()).unwrap();
        prop_assert_eq!(decoded, ClientAction::Unknown { name });
    }

    #[test]
    fn garbage_ids_never_abort_decoding(
        chat_id in "[a-z0-9-]{0,40}",
        recipient_id in "[a-z0-9-]{0,40}",
    ) {
        let frame = json!({
            "action": "send_message",
            "chatId": chat_id,
            "recipientId": recipient_id,
            "content": "hi",
        });

        // Unparseable ids degrade to None rather than failing the frame.
        let decoded = ClientAction::decode(&frame.to_string()).unwrap();
        let is_send_message = matches!(decoded, ClientAction::SendMessage { .. });
        prop_assert!(is_send_message);
    }
}

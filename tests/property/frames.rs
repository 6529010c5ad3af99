//! Property-based tests for the socket frame schema.
//!
//! Uses proptest to verify:
//! 1. Any outbound frame survives encode → decode.
//! 2. Arbitrary text never panics `decode` (returns `Err` or a frame).
//! 3. Any object with an unrecognised `type` decodes to `ServerFrame::Unknown`.
//! 4. Normalizing a message never invents an id and always keeps its content.
//! 5. A page cursor for any page after the first always reports a previous page.

use chatlink_proto::codec;
use chatlink_proto::frame::{ClientFrame, ServerFrame};
use chatlink_proto::message::*;
use chatlink_proto::page::MessagePage;
use chrono::DateTime;
use proptest::prelude::*;
use uuid::Uuid;

fn arb_client_ref() -> impl Strategy<Value = Option<ClientRef>> {
    prop::option::of(any::<u128>().prop_map(|n| ClientRef::from_uuid(Uuid::from_u128(n))))
}

fn arb_kind() -> impl Strategy<Value = MessageKind> {
    prop_oneof![
        Just(MessageKind::Text),
        Just(MessageKind::File),
        Just(MessageKind::Image),
    ]
}

fn arb_client_frame() -> impl Strategy<Value = ClientFrame> {
    prop_oneof![
        (any::<u64>(), ".{0,256}", arb_kind(), arb_client_ref()).prop_map(
            |(recipient, content, message_type, client_ref)| ClientFrame::Message {
                recipient_id: UserId::new(recipient),
                content,
                message_type,
                client_ref,
            }
        ),
        (
            any::<u64>(),
            ".{0,256}",
            prop::option::of("/media/[a-z]{1,12}\\.pdf"),
            prop::option::of("/media/[a-z]{1,12}\\.png"),
            arb_client_ref(),
        )
            .prop_map(|(group, content, file, image, client_ref)| {
                ClientFrame::GroupMessage {
                    group_id: GroupId::new(group),
                    content,
                    file,
                    image,
                    client_ref,
                }
            }),
        any::<u64>().prop_map(|id| ClientFrame::Read {
            message_id: MessageId::new(id)
        }),
        Just(ClientFrame::Ping),
    ]
}

proptest! {
    #[test]
    fn client_frames_survive_encoding(frame in arb_client_frame()) {
        let text = codec::encode(&frame).unwrap();
        let back: ClientFrame = codec::decode(&text).unwrap();
        prop_assert_eq!(back, frame);
    }

    #[test]
    fn decode_never_panics_on_arbitrary_text(text in ".{0,512}") {
        let _ = codec::decode::<ServerFrame>(&text);
    }

    #[test]
    fn unrecognised_types_decode_as_unknown(kind in "[a-z_]{1,16}") {
        prop_assume!(!matches!(
            kind.as_str(),
            "message" | "chat_message" | "group_message" | "read" | "pong"
        ));
        let text = serde_json::json!({ "type": kind, "extra": 1 }).to_string();
        let frame: ServerFrame = codec::decode(&text).unwrap();
        prop_assert_eq!(frame, ServerFrame::Unknown);
    }

    #[test]
    fn normalize_keeps_content_and_identity(
        id in prop::option::of(any::<u64>()),
        content in prop::option::of(".{0,128}"),
        secs in 0i64..4_000_000_000,
    ) {
        let defaults = MessageDefaults {
            sender: UserRef::id_only(UserId::new(1)),
            recipient: Some(UserRef::id_only(UserId::new(2))),
            group_id: None,
            timestamp: DateTime::from_timestamp(secs, 0).unwrap(),
        };
        let raw = RawMessage {
            id: id.map(MessageId::new),
            content: content.clone(),
            ..RawMessage::default()
        };
        let message = raw.normalize(&defaults);
        prop_assert_eq!(message.id, id.map(MessageId::new));
        prop_assert_eq!(message.content.clone(), content.unwrap_or_default());
        prop_assert_eq!(message.conversation_key(UserId::new(1)),
            Some(ConversationKey::Direct(UserId::new(2))));
    }

    #[test]
    fn later_pages_report_previous(
        page in 2u32..10_000,
        size in 1u32..200,
        has_previous in prop::option::of(any::<bool>()),
    ) {
        let response = MessagePage {
            has_previous,
            ..MessagePage::default()
        };
        let cursor = response.cursor(page, size);
        prop_assert!(cursor.has_previous);
        prop_assert_eq!(cursor.page, page);
        prop_assert_eq!(cursor.page_size, size);
    }
}

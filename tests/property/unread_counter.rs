//! Property-based tests for the global unread counter.
//!
//! Uses proptest to drive arbitrary sequences of counter operations and
//! inbound messages through a `ConversationStore` and its
//! `NotificationAggregator`, checking against a simple model:
//! 1. The counter never underflows; decrements at zero are no-ops.
//! 2. Each message id from a peer counts at most once, however often it is
//!    redelivered.
//! 3. The user's own echoes never count.
//! 4. Watchers always observe the latest value.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::collections::HashSet;
use std::sync::Arc;

use chatlink::api::memory::InMemoryApi;
use chatlink::auth::SharedToken;
use chatlink::chat::store::{ConversationStore, StoreConfig};
use chatlink::connection::loopback::LoopbackConnector;
use chatlink::connection::{ConnectionConfig, ConnectionManager};
use chatlink::notify::NotificationAggregator;
use chatlink_proto::message::{Message, MessageDefaults, MessageId, RawMessage, UserId, UserRef};
use chrono::Utc;
use proptest::prelude::*;
use url::Url;

const ME: u64 = 1;

#[derive(Debug, Clone)]
enum Op {
    Increment,
    Decrement,
    MarkAllRead,
    Inbound { from: u64, id: u64 },
    OwnEcho { to: u64, id: u64 },
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        1 => Just(Op::Increment),
        3 => Just(Op::Decrement),
        1 => Just(Op::MarkAllRead),
        3 => (2u64..5, 1u64..20).prop_map(|(from, id)| Op::Inbound { from, id }),
        1 => (2u64..5, 1u64..20).prop_map(|(to, id)| Op::OwnEcho { to, id }),
    ]
}

fn message(id: u64, from: u64, to: u64) -> Message {
    RawMessage {
        id: Some(MessageId::new(id)),
        sender: Some(UserRef::id_only(UserId::new(from))),
        recipient: Some(UserRef::id_only(UserId::new(to))),
        content: Some(format!("message {id}")),
        ..RawMessage::default()
    }
    .normalize(&MessageDefaults {
        sender: UserRef::id_only(UserId::new(from)),
        recipient: None,
        group_id: None,
        timestamp: Utc::now(),
    })
}

/// Applies `ops` to a fresh store and returns (model, counter, watched).
fn run(ops: &[Op]) -> (u64, u64, u64) {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    runtime.block_on(async {
        let me = UserRef::id_only(UserId::new(ME));
        let api = Arc::new(InMemoryApi::new(me.clone()));
        let connection = ConnectionManager::new(
            LoopbackConnector::new(),
            Arc::new(SharedToken::new("tok")),
            ConnectionConfig::new(Url::parse("ws://chat.test/ws/chat/").unwrap()),
        );
        let notifications = Arc::new(NotificationAggregator::new(Arc::clone(&api)));
        let store = ConversationStore::new(
            Arc::clone(&api),
            connection,
            Arc::clone(&notifications),
            me,
            StoreConfig::default(),
        );
        let watcher = notifications.subscribe();

        let mut model: u64 = 0;
        let mut seen = HashSet::new();
        for op in ops {
            match *op {
                Op::Increment => {
                    notifications.increment();
                    model += 1;
                }
                Op::Decrement => {
                    notifications.decrement();
                    model = model.saturating_sub(1);
                }
                Op::MarkAllRead => {
                    notifications.mark_all_read().await;
                    model = 0;
                }
                Op::Inbound { from, id } => {
                    store.handle_incoming_message(message(id, from, ME));
                    if seen.insert(id) {
                        model += 1;
                    }
                }
                Op::OwnEcho { to, id } => {
                    store.handle_incoming_message(message(id, ME, to));
                    seen.insert(id);
                }
            }
        }
        let watched = *watcher.borrow();
        (model, notifications.unread_count(), watched)
    })
}

proptest! {
    #[test]
    fn counter_matches_saturating_model(ops in prop::collection::vec(arb_op(), 0..64)) {
        let (model, counter, watched) = run(&ops);
        prop_assert_eq!(counter, model);
        prop_assert_eq!(watched, model);
    }

    #[test]
    fn decrements_alone_stay_at_zero(n in 0usize..32) {
        let (_, counter, _) = run(&vec![Op::Decrement; n]);
        prop_assert_eq!(counter, 0);
    }

    #[test]
    fn redelivery_counts_once(id in 1u64..1000, repeats in 1usize..8) {
        let ops = vec![Op::Inbound { from: 2, id }; repeats];
        let (_, counter, _) = run(&ops);
        prop_assert_eq!(counter, 1);
    }
}

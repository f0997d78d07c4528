//! Property tests for the persisted actor record.

use ember_id::{ConnId, ConnToken, ScheduledEventId};
use ember_protocol::{
    persisted_actor_codec, PersistedActor, PersistedConn, PersistedScheduleEvent,
    ScheduleEventKind,
};
use proptest::prelude::*;
use serde_json::Value;

fn arb_value() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(Value::from),
        any::<u64>().prop_map(Value::from),
        "[a-z0-9 ]{0,12}".prop_map(Value::String),
    ];
    leaf.prop_recursive(3, 24, 4, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
            prop::collection::btree_map("[a-z]{1,6}", inner, 0..4)
                .prop_map(|m| Value::Object(m.into_iter().collect())),
        ]
    })
}

fn arb_conn() -> impl Strategy<Value = PersistedConn> {
    (
        arb_value(),
        proptest::option::of(arb_value()),
        proptest::option::of(arb_value()),
        prop::collection::vec("[a-z]{1,8}", 0..3),
        any::<u64>(),
    )
        .prop_map(|(parameters, state, auth, subscriptions, last_seen)| PersistedConn {
            id: ConnId::new(),
            token: ConnToken::generate(),
            driver: "websocket".into(),
            driver_state: serde_json::json!({"encoding": "bare"}),
            parameters,
            state,
            auth,
            subscriptions,
            last_seen,
        })
}

fn arb_event() -> impl Strategy<Value = PersistedScheduleEvent> {
    (any::<u64>(), "[a-z]{1,10}", proptest::option::of(arb_value())).prop_map(
        |(timestamp, action, args)| PersistedScheduleEvent {
            event_id: ScheduledEventId::new(),
            timestamp,
            kind: ScheduleEventKind::Generic { action, args },
        },
    )
}

fn arb_record() -> impl Strategy<Value = PersistedActor> {
    (
        proptest::option::of(arb_value()),
        proptest::option::of(prop::collection::vec(any::<u8>(), 0..64)),
        prop::collection::vec(arb_conn(), 0..3),
        prop::collection::vec(arb_event(), 0..4),
    )
        .prop_map(|(input, state, connections, scheduled_events)| PersistedActor {
            input,
            has_initialized: state.is_some(),
            state,
            connections,
            scheduled_events,
        })
}

proptest! {
    #[test]
    fn prop_record_survives_snapshot(record in arb_record()) {
        let codec = persisted_actor_codec();
        let bytes = codec.serialize_with_embedded_version(&record).unwrap();
        let restored = codec.deserialize_with_embedded_version(&bytes).unwrap();
        prop_assert_eq!(restored, record);
    }

    #[test]
    fn prop_arbitrary_bytes_never_panic(bytes in prop::collection::vec(any::<u8>(), 0..128)) {
        let _ = persisted_actor_codec().deserialize_with_embedded_version(&bytes);
    }
}

//! Integration tests for scheduled events and alarms.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use ember_host::actors::{ActorDefinition, ActorError};
use ember_host::clock::{Clock, ManualClock};
use ember_host::MemoryDriver;
use serde_json::{json, Value};

const TICKER: &str = "ticker";

/// Records labels as scheduled events fire.
///
/// `schedule(delay_ms, action, label)` schedules `action(label)`; `fail`
/// always errors.
fn ticker() -> ActorDefinition<Vec<String>> {
    ActorDefinition::builder(TICKER)
        .state(Vec::new())
        .action("schedule", |ctx, args| {
            Box::pin(async move {
                let delay = args.first().and_then(Value::as_u64).unwrap_or(0);
                let action = args.get(1).and_then(Value::as_str).unwrap_or("record").to_string();
                let label = args.get(2).cloned().unwrap_or(Value::Null);
                let id = ctx
                    .schedule()
                    .after(Duration::from_millis(delay), &action, vec![label])
                    .await?;
                Ok::<_, ActorError>(json!(id.to_string()))
            })
        })
        .action_sync("record", |ctx, args| {
            let label = args.first().and_then(Value::as_str).unwrap_or_default().to_string();
            ctx.mutate(|log| log.push(label))?;
            Ok(Value::Null)
        })
        .action_sync("log", |ctx, _| Ok(json!(ctx.state())))
        .action_sync("fail", |_, _| Err(ActorError::user("boom", "scheduled failure")))
        .build()
        .unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_events_fire_in_timestamp_order() {
    let t = 1_000_000;
    let clock = Arc::new(ManualClock::new(t));
    let shared: Arc<dyn Clock> = clock.clone();
    let h = harness_with(MemoryDriver::new(Arc::clone(&shared)), shared, |b| {
        b.register(ticker())
    });
    let query = key_query(TICKER, "order");

    h.manager
        .call_action(&query, "schedule", vec![json!(100), json!("record"), json!("late")])
        .await
        .unwrap();
    h.manager
        .call_action(&query, "schedule", vec![json!(50), json!("record"), json!("early")])
        .await
        .unwrap();

    // The earlier event replaces the armed alarm.
    let actor_id = h.manager.resolve(&query).await.unwrap();
    assert_eq!(h.driver.alarm_history(&actor_id), vec![t + 100, t + 50]);

    clock.advance(200);
    tokio::time::sleep(Duration::from_millis(200)).await;
    settle().await;
    let log = h.manager.call_action(&query, "log", vec![]).await.unwrap();
    assert_eq!(log, json!(["early", "late"]));

    let snapshot = h.manager.inspect(actor_id).await.unwrap().unwrap();
    assert!(snapshot.scheduled.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_scheduled_event_wakes_stopped_actor() {
    let h = harness(|b| b.register(ticker()));
    let query = key_query(TICKER, "wake");
    let actor_id = h.manager.resolve(&query).await.unwrap();

    h.manager
        .call_action(&query, "schedule", vec![json!(500), json!("record"), json!("woke")])
        .await
        .unwrap();
    assert!(h.manager.stop_actor(actor_id).await);

    tokio::time::sleep(Duration::from_millis(600)).await;
    settle().await;
    assert!(h.manager.is_active(&actor_id));

    let log = h.manager.call_action(&query, "log", vec![]).await.unwrap();
    assert_eq!(log, json!(["woke"]));
}

#[tokio::test(start_paused = true)]
async fn test_early_alarm_rearms_without_running() {
    let clock = Arc::new(ManualClock::new(1_000_000));
    let shared: Arc<dyn Clock> = clock.clone();
    let h = harness_with(MemoryDriver::new(Arc::clone(&shared)), shared, |b| {
        b.register(ticker())
    });
    let query = key_query(TICKER, "early");
    let actor_id = h.manager.resolve(&query).await.unwrap();

    h.manager
        .call_action(&query, "schedule", vec![json!(1_000), json!("record"), json!("tick")])
        .await
        .unwrap();

    // Tokio time moves past the alarm but the wall clock does not.
    tokio::time::sleep(Duration::from_millis(1_100)).await;
    settle().await;
    assert_eq!(h.driver.alarm_history(&actor_id), vec![1_001_000, 1_001_000]);
    assert_eq!(h.manager.call_action(&query, "log", vec![]).await.unwrap(), json!([]));

    clock.advance(1_000);
    tokio::time::sleep(Duration::from_millis(1_100)).await;
    settle().await;
    assert_eq!(
        h.manager.call_action(&query, "log", vec![]).await.unwrap(),
        json!(["tick"])
    );
}

#[tokio::test(start_paused = true)]
async fn test_scheduling_unknown_action_is_rejected() {
    let h = harness(|b| b.register(ticker()));
    let query = key_query(TICKER, "bad");

    let err = h
        .manager
        .call_action(&query, "schedule", vec![json!(10), json!("explode"), Value::Null])
        .await
        .unwrap_err();
    assert_eq!(err, ActorError::ActionNotFound("explode".into()));

    let actor_id = h.manager.resolve(&query).await.unwrap();
    assert!(h.driver.alarm_history(&actor_id).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_failed_event_does_not_block_the_rest_of_the_batch() {
    let h = harness(|b| b.register(ticker()));
    let query = key_query(TICKER, "batch");
    let actor_id = h.manager.resolve(&query).await.unwrap();

    h.manager
        .call_action(&query, "schedule", vec![json!(50), json!("fail"), Value::Null])
        .await
        .unwrap();
    h.manager
        .call_action(&query, "schedule", vec![json!(50), json!("record"), json!("after")])
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    settle().await;
    assert_eq!(
        h.manager.call_action(&query, "log", vec![]).await.unwrap(),
        json!(["after"])
    );
    let snapshot = h.manager.inspect(actor_id).await.unwrap().unwrap();
    assert!(snapshot.scheduled.is_empty());

    assert!(h.manager.stop_actor(actor_id).await);
    assert_eq!(stored_state::<Vec<String>>(&h.driver, &actor_id), vec!["after".to_string()]);
}

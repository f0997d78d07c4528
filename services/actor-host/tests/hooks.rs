//! Integration tests for definition hooks and context helpers.

mod common;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use common::*;
use ember_host::actors::{
    ActorDefinition, ActorError, ActorManager, ActorQuery, RawRequest, RawResponse,
};
use ember_host::clock::{Clock, SystemClock};
use ember_host::{ActorKey, SqliteDriver};
use ember_id::ScheduledEventId;
use ember_protocol::{ActionResponse, ToClient};
use serde_json::{json, Value};
use tokio::sync::watch;

fn guarded_room() -> ActorDefinition<i64> {
    ActorDefinition::builder("room")
        .state(0)
        .on_before_connect(|_ctx, presented| {
            Box::pin(async move {
                if presented.params.get("token") == Some(&json!("ok")) {
                    Ok(())
                } else {
                    Err(ActorError::user("forbidden", "bad token"))
                }
            })
        })
        .create_conn_state(|_ctx, presented| {
            Box::pin(async move {
                let nick = presented.params.get("nick").cloned().unwrap_or(Value::Null);
                Ok::<_, anyhow::Error>(json!({ "nick": nick }))
            })
        })
        .action_sync("rename", |ctx, args| {
            let nick = args.first().cloned().unwrap_or(Value::Null);
            let conn_id = ctx
                .conn_id()
                .ok_or_else(|| ActorError::user("no_connection", "rename needs a connection"))?;
            ctx.set_conn_state(&conn_id, json!({ "nick": nick }))?;
            Ok(Value::Null)
        })
        .build()
        .unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_before_connect_rejects_client() {
    let h = harness(|b| b.register(guarded_room()));
    let query = key_query("room", "lobby");

    let (request, _rx) = json_client(json!({ "token": "nope" }));
    let err = h.manager.connect(&query, request).await.unwrap_err();
    assert_eq!(err.code(), "forbidden");

    let (request, _rx) = json_client(json!({ "token": "ok", "nick": "ada" }));
    let connected = h.manager.connect(&query, request).await.unwrap();

    let snapshot = h.manager.inspect(connected.actor_id).await.unwrap().unwrap();
    assert_eq!(snapshot.connections.len(), 1);
    assert_eq!(snapshot.connections[0].state, Some(json!({ "nick": "ada" })));
}

#[tokio::test(start_paused = true)]
async fn test_action_updates_connection_state() {
    let h = harness(|b| b.register(guarded_room()));
    let query = key_query("room", "rename");

    let (request, mut rx) = json_client(json!({ "token": "ok", "nick": "ada" }));
    let connected = h.manager.connect(&query, request).await.unwrap();
    assert!(matches!(next_frame(&mut rx).await, ToClient::Init(_)));

    h.manager
        .send_frame(
            connected.actor_id,
            connected.conn_id,
            action_frame(1, "rename", json!(["grace"])),
        )
        .await
        .unwrap();
    assert_eq!(
        next_frame(&mut rx).await,
        ToClient::ActionResponse(ActionResponse {
            id: 1,
            output: Value::Null,
        })
    );

    let snapshot = h.manager.inspect(connected.actor_id).await.unwrap().unwrap();
    assert_eq!(snapshot.connections[0].state, Some(json!({ "nick": "grace" })));

    // Conn-less calls have no connection to rename.
    let err = h
        .manager
        .call_action(&query, "rename", vec![json!("x")])
        .await
        .unwrap_err();
    assert_eq!(err.code(), "no_connection");
}

#[tokio::test(start_paused = true)]
async fn test_response_hook_rewrites_output() {
    let definition = ActorDefinition::<i64>::builder("echo")
        .state(0)
        .action_sync("ping", |_, args| Ok(json!(args)))
        .action_sync("fragile", |_, _| Ok(json!("raw")))
        .on_before_action_response(|_ctx, name, _args, output| {
            if name == "fragile" {
                anyhow::bail!("cannot wrap {name}");
            }
            Ok(json!({ "action": name, "output": output }))
        })
        .build()
        .unwrap();
    let h = harness(|b| b.register(definition));
    let query = key_query("echo", "a");

    let wrapped = h.manager.call_action(&query, "ping", vec![json!(1)]).await.unwrap();
    assert_eq!(wrapped, json!({ "action": "ping", "output": [1] }));

    let original = h.manager.call_action(&query, "fragile", vec![]).await.unwrap();
    assert_eq!(original, json!("raw"));
}

#[tokio::test(start_paused = true)]
async fn test_state_change_hook_sees_new_state() {
    let seen = Arc::new(AtomicI64::new(-1));
    let observed = Arc::clone(&seen);
    let definition = ActorDefinition::<i64>::builder("gauge")
        .state(0)
        .on_state_change(move |value: &i64| {
            observed.store(*value, Ordering::SeqCst);
            Ok(())
        })
        .action_sync("set", |ctx, args| {
            let value = args.first().and_then(Value::as_i64).unwrap_or_default();
            ctx.set_state(value)?;
            Ok(Value::Null)
        })
        .build()
        .unwrap();
    let h = harness(|b| b.register(definition));

    h.manager
        .call_action(&key_query("gauge", "g"), "set", vec![json!(42)])
        .await
        .unwrap();
    assert_eq!(seen.load(Ordering::SeqCst), 42);
}

#[tokio::test(start_paused = true)]
async fn test_vars_are_rebuilt_on_every_start() {
    let definition = ActorDefinition::<i64>::builder("scratch")
        .state(0)
        .vars(Vec::<String>::new)
        .on_start(|ctx| {
            Box::pin(async move {
                if let Some(log) = ctx.vars_mut::<Vec<String>>() {
                    log.push("started".into());
                }
                Ok::<_, anyhow::Error>(())
            })
        })
        .action_sync("bump", |ctx, _| {
            if let Some(log) = ctx.vars_mut::<Vec<String>>() {
                log.push("bump".into());
            }
            Ok(json!(ctx.vars::<Vec<String>>()))
        })
        .build()
        .unwrap();
    let h = harness(|b| b.register(definition));
    let query = key_query("scratch", "s");

    h.manager.call_action(&query, "bump", vec![]).await.unwrap();
    let log = h.manager.call_action(&query, "bump", vec![]).await.unwrap();
    assert_eq!(log, json!(["started", "bump", "bump"]));

    let actor_id = h.manager.resolve(&query).await.unwrap();
    assert!(h.manager.stop_actor(actor_id).await);

    let log = h.manager.call_action(&query, "bump", vec![]).await.unwrap();
    assert_eq!(log, json!(["started", "bump"]));
}

#[tokio::test(start_paused = true)]
async fn test_raw_requests() {
    let echo = ActorDefinition::<i64>::builder("upper")
        .state(0)
        .on_request(|_ctx, request| {
            Box::pin(async move {
                let body = String::from_utf8_lossy(&request.body).to_uppercase();
                Ok::<_, ActorError>(RawResponse::ok(body))
            })
        })
        .build()
        .unwrap();
    let plain = ActorDefinition::<i64>::builder("plain").state(0).build().unwrap();
    let h = harness(|b| b.register(echo).register(plain));

    let request = RawRequest {
        method: "POST".into(),
        path: "/shout".into(),
        body: Bytes::from_static(b"hello"),
    };
    let response = h
        .manager
        .handle_request(&key_query("upper", "u"), request.clone())
        .await
        .unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.body, Bytes::from_static(b"HELLO"));

    let err = h
        .manager
        .handle_request(&key_query("plain", "p"), request)
        .await
        .unwrap_err();
    assert!(matches!(err, ActorError::Unsupported(_)));
}

fn planner() -> ActorDefinition<Vec<String>> {
    ActorDefinition::builder("planner")
        .state(Vec::new())
        .action("plan", |ctx, args| {
            Box::pin(async move {
                let label = args.first().cloned().unwrap_or(Value::Null);
                let id = ctx
                    .schedule()
                    .after(Duration::from_millis(100), "record", vec![label])
                    .await?;
                Ok::<_, ActorError>(json!(id.to_string()))
            })
        })
        .action("cancel", |ctx, args| {
            Box::pin(async move {
                let id: ScheduledEventId = args
                    .first()
                    .and_then(Value::as_str)
                    .and_then(|raw| raw.parse().ok())
                    .ok_or_else(|| ActorError::user("invalid_argument", "expected an event id"))?;
                let cancelled = ctx.schedule().cancel(&id).await?;
                Ok::<_, ActorError>(json!(cancelled))
            })
        })
        .action_sync("pending", |ctx, _| Ok(json!(ctx.schedule().list().len())))
        .action_sync("record", |ctx, args| {
            let label = args.first().and_then(Value::as_str).unwrap_or_default().to_string();
            ctx.mutate(|log| log.push(label))?;
            Ok(Value::Null)
        })
        .action_sync("log", |ctx, _| Ok(json!(ctx.state())))
        .build()
        .unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_event_never_runs() {
    let h = harness(|b| b.register(planner()));
    let query = key_query("planner", "p");

    let id = h.manager.call_action(&query, "plan", vec![json!("x")]).await.unwrap();
    assert_eq!(h.manager.call_action(&query, "pending", vec![]).await.unwrap(), json!(1));

    assert_eq!(
        h.manager.call_action(&query, "cancel", vec![id.clone()]).await.unwrap(),
        json!(true)
    );
    assert_eq!(
        h.manager.call_action(&query, "cancel", vec![id]).await.unwrap(),
        json!(false)
    );
    assert_eq!(h.manager.call_action(&query, "pending", vec![]).await.unwrap(), json!(0));

    tokio::time::sleep(Duration::from_millis(200)).await;
    settle().await;
    assert_eq!(h.manager.call_action(&query, "log", vec![]).await.unwrap(), json!([]));
}

#[tokio::test(start_paused = true)]
async fn test_stop_waits_for_background_work() {
    let finished = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&finished);
    let definition = ActorDefinition::<i64>::builder("worker")
        .state(0)
        .action_sync("defer", move |ctx, _| {
            let flag = Arc::clone(&flag);
            let mut abort = ctx.abort_signal();
            ctx.wait_until(async move {
                abort.wait_for(|stopping| *stopping).await?;
                tokio::time::sleep(Duration::from_millis(100)).await;
                flag.store(true, Ordering::SeqCst);
                Ok::<_, anyhow::Error>(())
            });
            Ok(Value::Null)
        })
        .build()
        .unwrap();
    let h = harness(|b| b.register(definition));
    let query = key_query("worker", "w");

    h.manager.call_action(&query, "defer", vec![]).await.unwrap();
    settle().await;
    assert!(!finished.load(Ordering::SeqCst));

    let actor_id = h.manager.resolve(&query).await.unwrap();
    assert!(h.manager.stop_actor(actor_id).await);
    assert!(finished.load(Ordering::SeqCst));
}

fn profile() -> ActorDefinition<i64> {
    ActorDefinition::builder("profile")
        .create_state(|metadata, input| {
            Box::pin(async move {
                let Some(seed) = input.as_ref().and_then(Value::as_i64) else {
                    anyhow::bail!("profile {} needs a numeric input", metadata.key);
                };
                Ok(seed)
            })
        })
        .on_create(|ctx, _input| {
            Box::pin(async move {
                ctx.mutate(|n| *n += 1_000)?;
                Ok::<_, anyhow::Error>(())
            })
        })
        .action_sync("get", |ctx, _| Ok(json!(*ctx.state())))
        .build()
        .unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_create_state_and_on_create_run_once() {
    let h = harness(|b| b.register(profile()));
    let query = ActorQuery::Create {
        name: "profile".into(),
        key: ActorKey::new(["ada"]),
        input: Some(json!(5)),
    };
    let actor_id = h.manager.resolve(&query).await.unwrap();
    let by_id = ActorQuery::GetForId { actor_id };

    assert_eq!(h.manager.call_action(&by_id, "get", vec![]).await.unwrap(), json!(1_005));
    assert!(h.manager.stop_actor(actor_id).await);
    assert_eq!(h.manager.call_action(&by_id, "get", vec![]).await.unwrap(), json!(1_005));
    assert_eq!(stored_state::<i64>(&h.driver, &actor_id), 1_005);
}

#[tokio::test(start_paused = true)]
async fn test_create_state_failure_fails_start() {
    let h = harness(|b| b.register(profile()));
    let query = ActorQuery::Create {
        name: "profile".into(),
        key: ActorKey::new(["nobody"]),
        input: None,
    };
    let actor_id = h.manager.resolve(&query).await.unwrap();

    let err = h
        .manager
        .call_action(&ActorQuery::GetForId { actor_id }, "get", vec![])
        .await
        .unwrap_err();
    assert_eq!(err.code(), "internal_error");
    settle().await;
    assert!(!h.manager.is_active(&actor_id));
}

#[tokio::test(start_paused = true)]
async fn test_connect_and_disconnect_hooks() {
    let definition = ActorDefinition::<i64>::builder("lobby")
        .state(0)
        .on_connect(|ctx, _conn_id| {
            Box::pin(async move {
                ctx.mutate(|n| *n += 1)?;
                Ok::<_, anyhow::Error>(())
            })
        })
        .on_disconnect(|ctx, _conn| {
            ctx.mutate(|n| *n -= 1)?;
            Ok(())
        })
        .action_sync("online", |ctx, _| Ok(json!(*ctx.state())))
        .build()
        .unwrap();
    let h = harness(|b| b.register(definition));
    let query = key_query("lobby", "main");

    let (first, _rx1) = json_client(json!({}));
    let (second, _rx2) = json_client(json!({}));
    let first = h.manager.connect(&query, first).await.unwrap();
    h.manager.connect(&query, second).await.unwrap();
    assert_eq!(h.manager.call_action(&query, "online", vec![]).await.unwrap(), json!(2));

    assert!(h.manager.close_conn(first.actor_id, first.conn_id).await);
    assert!(!h.manager.close_conn(first.actor_id, first.conn_id).await);
    assert_eq!(h.manager.call_action(&query, "online", vec![]).await.unwrap(), json!(1));
}

#[tokio::test(start_paused = true)]
async fn test_on_stop_changes_are_saved() {
    let definition = ActorDefinition::<Vec<String>>::builder("journal")
        .state(Vec::new())
        .on_stop(|ctx| {
            Box::pin(async move {
                ctx.mutate(|log| log.push("stopped".into()))?;
                Ok::<_, anyhow::Error>(())
            })
        })
        .action_sync("touch", |ctx, _| {
            ctx.mutate(|log| log.push("touched".into()))?;
            Ok(Value::Null)
        })
        .build()
        .unwrap();
    let h = harness(|b| b.register(definition));
    let query = key_query("journal", "j");

    h.manager.call_action(&query, "touch", vec![]).await.unwrap();
    let actor_id = h.manager.resolve(&query).await.unwrap();
    assert!(h.manager.stop_actor(actor_id).await);

    assert_eq!(
        stored_state::<Vec<String>>(&h.driver, &actor_id),
        vec!["touched".to_string(), "stopped".to_string()]
    );
}

// SQLite runs on the blocking pool, so this test uses real time.
#[tokio::test]
async fn test_database_handle_from_sqlite_driver() {
    let dir = tempfile::tempdir().unwrap();
    let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
    let driver = SqliteDriver::open_in_memory(Arc::clone(&clock))
        .unwrap()
        .with_databases_dir(dir.path().join("databases"));
    let definition = ActorDefinition::<i64>::builder("store")
        .state(0)
        .with_database()
        .action_sync("where", |ctx, _| {
            let path = ctx
                .database()
                .and_then(|handle| handle.downcast_ref::<PathBuf>().cloned())
                .ok_or_else(|| ActorError::user("no_database", "no database handle"))?;
            Ok(json!(path.to_string_lossy()))
        })
        .build()
        .unwrap();

    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let manager = ActorManager::builder(Arc::new(driver))
        .clock(clock)
        .register(definition)
        .build(shutdown_rx)
        .unwrap();

    let location = manager
        .call_action(&key_query("store", "s"), "where", vec![])
        .await
        .unwrap();
    let location = location.as_str().unwrap();
    assert!(location.starts_with(&*dir.path().to_string_lossy()));
    manager.shutdown().await;
}

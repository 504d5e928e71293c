//! End-to-end mesh tests over loopback TCP.
//!
//! Each scenario boots a dispatcher and one or more leaf entities inside
//! the test process, connects them through real sockets, and exercises the
//! public `Client` surface only.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use lattice::{Client, ErrCode, NodeConfig, Topology};
use serde_json::json;

fn test_config(eid: &str) -> NodeConfig {
    NodeConfig {
        eid: eid.into(),
        request_timeout_secs: 2,
        redial_delay_secs: 1,
        grace_secs: 1,
        sweep_interval_ms: 50,
        ..NodeConfig::default()
    }
}

async fn wait_for(mut cond: impl FnMut() -> bool) {
    for _ in 0..400 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within 4s");
}

/// Boot a dispatcher on an ephemeral port and return it with its address.
async fn start_gate(eid: &str) -> (Client, String) {
    let cfg = NodeConfig {
        spn: "Gate".into(),
        bind: "127.0.0.1:0".into(),
        ..test_config(eid)
    };
    let gate = Client::new(cfg);
    gate.dial(Topology {
        spn: "Gate".into(),
        ..Topology::default()
    })
    .await
    .expect("gate dial");
    let addr = gate.local_addr().expect("gate bound").to_string();
    (gate, addr)
}

/// Boot a leaf dialing the gate, register handlers first, and wait until
/// its handshake completed.
async fn start_leaf(
    eid: &str,
    spn: &str,
    federated_key: &str,
    gate_addr: &str,
    setup: impl FnOnce(&Client),
) -> Client {
    let cfg = NodeConfig {
        spn: spn.into(),
        remotes: vec![format!("Gate={gate_addr}")],
        ..test_config(eid)
    };
    let client = Client::new(cfg);
    setup(&client);
    let topology = Topology {
        spn: spn.into(),
        federated_key: federated_key.into(),
        federated_apis: client.list_grid_apis(),
    };
    client.dial(topology).await.expect("leaf dial");
    let probe = client.clone();
    wait_for(move || probe.has_route("Gate")).await;
    client
}

#[tokio::test]
async fn request_flows_through_dispatcher_and_back() {
    let (_gate, addr) = start_gate("gate1").await;

    let _responder = start_leaf("echo1", "Echo", "", &addr, |client| {
        client.register_handler("Echo", |client, req| async move {
            let body = req.body.clone();
            let _ = client.send_res(&req, &body).await;
        });
    })
    .await;

    let caller = start_leaf("cli1", "Cli", "", &addr, |_| {}).await;

    let res = caller
        .send_req("Echo", "Echo", &json!({"Msg": "hello"}))
        .await
        .expect("response");
    assert!(res.header.is_success());
    assert_eq!(res.body["Msg"], "hello");
    // The return path is fully consumed by the time it reaches the caller.
    assert!(res.header.to_eids.is_empty());
}

#[tokio::test]
async fn federated_requests_preserve_per_key_order() {
    let (_gate, addr) = start_gate("gate2").await;

    let seen: Arc<Mutex<Vec<u64>>> = Arc::new(Mutex::new(Vec::new()));
    let record = Arc::clone(&seen);
    let _owner = start_leaf("rm1", "ChatRoom", "RoomID", &addr, move |client| {
        client.register_grid_handler("Count", move |client, req, state| {
            let record = Arc::clone(&record);
            async move {
                record
                    .lock()
                    .expect("lock")
                    .push(req.body["Counter"].as_u64().unwrap_or(0));
                let key = req.header.key.clone();
                let _ = client.send_res(&req, &json!({"Key": key})).await;
                state
            }
        });
    })
    .await;

    let caller = start_leaf("cli2", "Cli", "", &addr, |_| {}).await;

    for counter in 1..=3u64 {
        caller
            .send_noti("ChatRoom", "Count", &json!({"RoomID": "42", "Counter": counter}))
            .await
            .expect("noti");
    }
    wait_for(|| seen.lock().map(|s| s.len() == 3).unwrap_or(false)).await;
    assert_eq!(*seen.lock().expect("lock"), vec![1, 2, 3]);

    // The dispatcher stamps the hashed key onto the forwarded header.
    let res = caller
        .send_req("ChatRoom", "Count", &json!({"RoomID": "42", "Counter": 4}))
        .await
        .expect("response");
    assert_eq!(res.body["Key"], "42");
}

#[tokio::test]
async fn per_key_order_holds_across_two_dispatchers() {
    let (_gate_a, addr_a) = start_gate("gate10a").await;
    let (_gate_b, addr_b) = start_gate("gate10b").await;

    // (caller, counter, phase) per handler entry and exit.
    let events: Arc<Mutex<Vec<(String, u64, &'static str)>>> = Arc::new(Mutex::new(Vec::new()));
    let record = Arc::clone(&events);

    // One owner reachable through both dispatchers.
    let owner = Client::new(NodeConfig {
        spn: "ChatRoom".into(),
        remotes: vec![format!("Gate={addr_a}"), format!("Gate2={addr_b}")],
        ..test_config("rm10")
    });
    owner.register_grid_handler("Tally", move |client, req, state| {
        let record = Arc::clone(&record);
        async move {
            let from = req.body["From"].as_str().unwrap_or("").to_string();
            let counter = req.body["Counter"].as_u64().unwrap_or(0);
            if let Ok(mut events) = record.lock() {
                events.push((from.clone(), counter, "enter"));
            }
            // Widen the window in which an overlapping invocation would
            // be caught.
            tokio::time::sleep(Duration::from_millis(5)).await;
            if let Ok(mut events) = record.lock() {
                events.push((from, counter, "exit"));
            }
            let _ = client.send_res(&req, &json!({})).await;
            state
        }
    });
    owner
        .dial(Topology {
            spn: "ChatRoom".into(),
            federated_key: "RoomID".into(),
            federated_apis: owner.list_grid_apis(),
        })
        .await
        .expect("owner dial");
    let probe = owner.clone();
    wait_for(move || probe.has_route("Gate") && probe.has_route("Gate2")).await;

    let caller_a = start_leaf("cli10a", "Cli", "", &addr_a, |_| {}).await;
    let caller_b = start_leaf("cli10b", "Cli", "", &addr_b, |_| {}).await;

    // Both callers race the same key through their own dispatcher.
    let drive = |caller: Client, from: &'static str| async move {
        for counter in 1..=5u64 {
            caller
                .send_req(
                    "ChatRoom",
                    "Tally",
                    &json!({"RoomID": "K", "From": from, "Counter": counter}),
                )
                .await
                .expect("response");
        }
    };
    let task_a = tokio::spawn(drive(caller_a.clone(), "A"));
    let task_b = tokio::spawn(drive(caller_b.clone(), "B"));
    task_a.await.expect("caller A finished");
    task_b.await.expect("caller B finished");

    let events = events.lock().expect("lock");
    assert_eq!(events.len(), 20);

    // Handler invocations for the key never overlap.
    let mut active = 0i32;
    for (_, _, phase) in events.iter() {
        if *phase == "enter" {
            active += 1;
            assert_eq!(active, 1, "handler invocations overlapped");
        } else {
            active -= 1;
        }
    }

    // Each caller's counters are observed in its send order, whichever
    // dispatcher forwarded them.
    for from in ["A", "B"] {
        let seen: Vec<u64> = events
            .iter()
            .filter(|(f, _, phase)| f.as_str() == from && *phase == "enter")
            .map(|(_, counter, _)| *counter)
            .collect();
        assert_eq!(seen, vec![1, 2, 3, 4, 5], "caller {from}");
    }
}

#[tokio::test]
async fn dispatcher_shards_deterministically_by_key() {
    let (_gate, addr) = start_gate("gate3").await;

    let mut owners = Vec::new();
    for eid in ["ra", "rb"] {
        let owner_eid = eid.to_string();
        let owner = start_leaf(eid, "ChatRoom", "RoomID", &addr, move |client| {
            client.register_grid_handler("WhoAmI", move |client, req, state| {
                let owner_eid = owner_eid.clone();
                async move {
                    let _ = client.send_res(&req, &json!({"Owner": owner_eid})).await;
                    state
                }
            });
        })
        .await;
        owners.push(owner);
    }

    let caller = start_leaf("cli3", "Cli", "", &addr, |_| {}).await;

    for key in ["7", "12", "covenant"] {
        let first = caller
            .send_req("ChatRoom", "WhoAmI", &json!({"RoomID": key}))
            .await
            .expect("response");
        let second = caller
            .send_req("ChatRoom", "WhoAmI", &json!({"RoomID": key}))
            .await
            .expect("response");
        assert_eq!(first.body["Owner"], second.body["Owner"], "key {key}");
    }

    // Membership events re-hash: with `ra` gone, its keys move to `rb`.
    owners.remove(0).shutdown().await;
    let mut moved = false;
    for _ in 0..40 {
        if let Ok(res) = caller
            .send_req("ChatRoom", "WhoAmI", &json!({"RoomID": "7"}))
            .await
        {
            if res.body["Owner"] == "rb" {
                moved = true;
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(moved, "key must re-shard to the surviving owner");
}

#[tokio::test]
async fn missing_federation_key_is_rejected() {
    let (_gate, addr) = start_gate("gate4").await;

    let _owner = start_leaf("rm4", "ChatRoom", "RoomID", &addr, |client| {
        client.register_grid_handler("Count", |_client, _req, state| async move { state });
    })
    .await;

    let caller = start_leaf("cli4", "Cli", "", &addr, |_| {}).await;

    let err = caller
        .send_req("ChatRoom", "Count", &json!({"NotTheKey": true}))
        .await
        .expect_err("must fail");
    assert_eq!(err.code, ErrCode::NoKey);
}

#[tokio::test]
async fn silent_peer_surfaces_timeout() {
    let (_gate, addr) = start_gate("gate5").await;

    let _sloth = start_leaf("sloth1", "Sloth", "", &addr, |client| {
        client.register_handler("Slow", |_client, _req| async move {
            // Never answers.
        });
    })
    .await;

    let caller = start_leaf("cli5", "Cli", "", &addr, |_| {}).await;

    let err = caller
        .send_req("Sloth", "Slow", &json!({}))
        .await
        .expect_err("must time out");
    assert_eq!(err.code, ErrCode::Timeout);
}

#[tokio::test]
async fn unknown_api_is_reported_to_the_caller() {
    let (_gate, addr) = start_gate("gate6").await;
    let _leaf = start_leaf("svc6", "Svc", "", &addr, |_| {}).await;
    let caller = start_leaf("cli6", "Cli", "", &addr, |_| {}).await;

    let err = caller
        .send_req("Svc", "Nonexistent", &json!({}))
        .await
        .expect_err("must fail");
    assert_eq!(err.code, ErrCode::UnknownApi);
}

#[tokio::test]
async fn unrouteable_service_is_no_route() {
    let (_gate, addr) = start_gate("gate7").await;
    let caller = start_leaf("cli7", "Cli", "", &addr, |_| {}).await;

    // The gate accepts the request but knows no such service.
    let err = caller
        .send_req("Ghost", "Echo", &json!({}))
        .await
        .expect_err("must fail");
    assert_eq!(err.code, ErrCode::NoRoute);
}

#[tokio::test]
async fn duplicate_eid_is_rejected_at_accept() {
    let (_gate, addr) = start_gate("gate8").await;

    let first = start_leaf("dup1", "SvcA", "", &addr, |_| {}).await;

    let cfg = NodeConfig {
        spn: "SvcB".into(),
        remotes: vec![format!("Gate={addr}")],
        ..test_config("dup1")
    };
    let second = Client::new(cfg);
    second
        .dial(Topology {
            spn: "SvcB".into(),
            ..Topology::default()
        })
        .await
        .expect("dial starts");

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(!second.has_route("Gate"), "duplicate Eid must not register");
    assert!(first.has_route("Gate"), "original session must survive");
}

#[tokio::test]
async fn shutdown_broadcasts_die_to_peers() {
    let (gate, addr) = start_gate("gate9").await;
    let leaf = start_leaf("svc9", "Svc", "", &addr, |_| {}).await;

    gate.shutdown().await;

    let probe = leaf.clone();
    wait_for(move || !probe.has_route("Gate")).await;
}

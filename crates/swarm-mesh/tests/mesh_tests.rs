//! Multi-node behaviour over the in-process hub.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{Value, json};
use swarm_core::{Event, NodeId, Role};
use swarm_mesh::runtime;
use swarm_mesh::{
    MemoryHub, MeshNode, NodeSettings, StateUpdate, TelemetrySink, TransportEvent,
};
use tokio::sync::mpsc;

struct Member {
    node: MeshNode,
    rx: mpsc::Receiver<TransportEvent>,
}

fn member(hub: &MemoryHub, id: NodeId, settings: NodeSettings) -> Member {
    let (transport, rx) = hub.join(id);
    Member {
        node: MeshNode::new(Box::new(transport), settings),
        rx,
    }
}

/// Deliver queued transport events until every inbox is empty.
fn pump(members: &mut [&mut Member]) {
    loop {
        let mut delivered = false;
        for m in members.iter_mut() {
            while let Ok(event) = m.rx.try_recv() {
                m.node.handle_event(event);
                delivered = true;
            }
        }
        if !delivered {
            break;
        }
    }
}

#[derive(Clone, Default)]
struct RecordingSink(Arc<Mutex<Vec<(NodeId, Value)>>>);

impl TelemetrySink for RecordingSink {
    fn submit(&self, node_id: NodeId, payload: Value) {
        self.0.lock().unwrap().push((node_id, payload));
    }
}

#[test]
fn test_led_scenario_converges() {
    let hub = MemoryHub::new();
    let mut a = member(&hub, 10, NodeSettings::default());
    let mut b = member(&hub, 20, NodeSettings::default());
    hub.connect(10, 20);
    pump(&mut [&mut a, &mut b]);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let log = seen.clone();
    a.node.watch_state("led", move |c, _| {
        log.lock()
            .unwrap()
            .push((c.key.clone(), c.value.clone(), c.old_value.clone()));
    });

    assert!(a.node.set_state("led", "1"));
    pump(&mut [&mut a, &mut b]);
    let on_b = b.node.state().get("led").unwrap();
    assert_eq!((on_b.value.as_str(), on_b.version, on_b.origin), ("1", 1, 10));

    assert!(b.node.set_state("led", "0"));
    pump(&mut [&mut a, &mut b]);

    for m in [&a, &b] {
        let e = m.node.state().get("led").unwrap();
        assert_eq!((e.value.as_str(), e.version, e.origin), ("0", 2, 20));
    }
    assert_eq!(
        seen.lock().unwrap().last().cloned(),
        Some(("led".to_string(), "0".to_string(), "1".to_string()))
    );
}

#[test]
fn test_tie_break_prefers_lower_origin() {
    let hub = MemoryHub::new();
    let mut a = member(&hub, 10, NodeSettings::default());
    let mut b = member(&hub, 5, NodeSettings::default());
    a.node.set_state("x", "a");
    b.node.set_state("x", "a");

    let fired = Arc::new(Mutex::new(0));
    let counter = fired.clone();
    a.node.watch_state("x", move |_, _| *counter.lock().unwrap() += 1);

    hub.connect(10, 5);
    pump(&mut [&mut a, &mut b]);

    let on_a = a.node.state().get("x").unwrap();
    assert_eq!((on_a.value.as_str(), on_a.version, on_a.origin), ("a", 1, 5));
    assert_eq!(b.node.state().get("x").unwrap().origin, 5);
    assert_eq!(*fired.lock().unwrap(), 0);
}

#[test]
fn test_election_picks_lowest_connected_id() {
    let hub = MemoryHub::new();
    let mut n7 = member(&hub, 7, NodeSettings::default());
    let mut n3 = member(&hub, 3, NodeSettings::default());
    let mut n9 = member(&hub, 9, NodeSettings::default());
    hub.connect(7, 3);
    hub.connect(7, 9);
    hub.connect(3, 9);
    pump(&mut [&mut n7, &mut n3, &mut n9]);

    for m in [&n7, &n3, &n9] {
        assert_eq!(m.node.coordinator_id(), 3);
    }
    assert_eq!(n3.node.role(), Role::Coordinator);
    assert_eq!(n7.node.role(), Role::Peer);
    assert_eq!(n9.node.role(), Role::Peer);

    hub.leave(3);
    pump(&mut [&mut n7, &mut n9]);
    assert_eq!(n7.node.role(), Role::Coordinator);
    assert_eq!(n9.node.coordinator_id(), 7);
    assert_eq!(n7.node.peer_count(), 1);
    assert!(n7.node.peers().any(|p| p.id == 3 && !p.alive));
}

#[test]
fn test_role_change_is_published() {
    let hub = MemoryHub::new();
    let mut a = member(&hub, 8, NodeSettings::default());
    let mut b = member(&hub, 2, NodeSettings::default());
    let mut events = a.node.events().subscribe();

    hub.connect(8, 2);
    pump(&mut [&mut a, &mut b]);

    let mut saw_role_change = false;
    while let Ok(event) = events.try_recv() {
        if event
            == (Event::RoleChanged {
                from: Role::Coordinator,
                to: Role::Peer,
                coordinator_id: 2,
            })
        {
            saw_role_change = true;
        }
    }
    assert!(saw_role_change);
}

#[test]
fn test_new_connection_receives_existing_state() {
    let hub = MemoryHub::new();
    let mut a = member(&hub, 1, NodeSettings::default());
    a.node.set_states([("temp", "21"), ("hum", "40")]);
    let mut b = member(&hub, 2, NodeSettings::default());

    hub.connect(1, 2);
    pump(&mut [&mut a, &mut b]);

    assert_eq!(b.node.get_state("temp", ""), "21");
    assert_eq!(b.node.get_state("hum", ""), "40");
    assert_eq!(b.node.peers().find(|p| p.id == 1).unwrap().name, "N1");
}

#[test]
fn test_state_request_triggers_full_sync() {
    let hub = MemoryHub::new();
    let mut a = member(&hub, 1, NodeSettings::default());
    let mut b = member(&hub, 2, NodeSettings::default());
    hub.connect(1, 2);
    pump(&mut [&mut a, &mut b]);

    // Put state on A without a broadcast reaching B.
    a.node.apply_remote_update(&StateUpdate::new("door", "open", 4, 99));
    assert_eq!(b.node.get_state("door", "-"), "-");

    b.node.request_state_sync();
    pump(&mut [&mut a, &mut b]);
    let e = b.node.state().get("door").unwrap();
    assert_eq!((e.version, e.origin), (4, 99));
}

#[test]
fn test_gateway_forwards_peer_telemetry() {
    let hub = MemoryHub::new();
    let sink = RecordingSink::default();
    let mut gateway = member(
        &hub,
        1,
        NodeSettings {
            telemetry_enabled: true,
            gateway: true,
            ..NodeSettings::default()
        },
    );
    gateway.node = gateway.node.with_telemetry_sink(Arc::new(sink.clone()));
    let mut light = member(
        &hub,
        0x2b,
        NodeSettings {
            name: Some("Light".into()),
            telemetry_enabled: true,
            ..NodeSettings::default()
        },
    );
    hub.connect(1, 0x2b);
    pump(&mut [&mut gateway, &mut light]);

    light.node.set_state("light", "400");
    pump(&mut [&mut gateway, &mut light]);

    let submitted = sink.0.lock().unwrap();
    let (from, payload) = submitted
        .iter()
        .find(|(id, _)| *id == 0x2b)
        .expect("light telemetry forwarded");
    assert_eq!(*from, 0x2b);
    assert_eq!(payload["name"], "Light");
    assert_eq!(payload["state"], json!({"light": "400"}));
    assert_eq!(payload["role"], "PEER");
}

#[test]
fn test_gateway_forwards_even_with_own_telemetry_disabled() {
    let hub = MemoryHub::new();
    let sink = RecordingSink::default();
    let mut gateway = member(
        &hub,
        1,
        NodeSettings {
            gateway: true,
            ..NodeSettings::default()
        },
    );
    gateway.node = gateway.node.with_telemetry_sink(Arc::new(sink.clone()));
    let mut client = member(
        &hub,
        2,
        NodeSettings {
            telemetry_enabled: true,
            ..NodeSettings::default()
        },
    );
    hub.connect(1, 2);
    pump(&mut [&mut gateway, &mut client]);

    assert!(client.node.push_telemetry());
    gateway.node.set_state("own", "1");
    pump(&mut [&mut gateway, &mut client]);

    let submitted = sink.0.lock().unwrap();
    assert_eq!(submitted.len(), 1);
    assert_eq!(submitted[0].0, 2);
}

#[test]
fn test_disabled_client_sends_no_telemetry() {
    let hub = MemoryHub::new();
    let sink = RecordingSink::default();
    let mut gateway = member(
        &hub,
        1,
        NodeSettings {
            telemetry_enabled: true,
            gateway: true,
            ..NodeSettings::default()
        },
    );
    gateway.node = gateway.node.with_telemetry_sink(Arc::new(sink.clone()));
    let mut client = member(&hub, 2, NodeSettings::default());
    hub.connect(1, 2);
    pump(&mut [&mut gateway, &mut client]);

    client.node.set_state("k", "v");
    pump(&mut [&mut gateway, &mut client]);
    assert!(sink.0.lock().unwrap().is_empty());
    assert_eq!(gateway.node.get_state("k", ""), "v");
}

#[test]
fn test_command_claimed_by_first_handler() {
    let hub = MemoryHub::new();
    let mut a = member(&hub, 1, NodeSettings::default());
    let mut b = member(&hub, 2, NodeSettings::default());
    hub.connect(1, 2);
    pump(&mut [&mut a, &mut b]);

    b.node.on_command(|_, cmd, q| {
        (cmd["cmd"] == "blink").then(|| {
            q.set("led", "blink");
            json!({"ok": true})
        })
    });
    b.node.on_command(|_, _, _| Some(json!({"ok": false})));

    let replies = Arc::new(Mutex::new(Vec::new()));
    let log = replies.clone();
    a.node
        .on_command_response(move |from, v| log.lock().unwrap().push((from, v.clone())));

    a.node.send_command(json!({"cmd": "blink"}));
    pump(&mut [&mut a, &mut b]);

    assert_eq!(
        *replies.lock().unwrap(),
        vec![(2, json!({"ok": true, "to": 1}))]
    );
    assert_eq!(a.node.get_state("led", ""), "blink");
}

#[test]
fn test_malformed_traffic_does_not_disturb_state() {
    let hub = MemoryHub::new();
    let mut a = member(&hub, 1, NodeSettings::default());
    a.node.set_state("k", "v");

    a.node.receive(9, "{\"t\":2,");
    a.node.receive(9, r#"{"t":2,"n":"Z","d":{"v":"evil","ver":100}}"#);
    a.node.receive(9, r#"{"t":3,"n":"Z","d":{"s":[{"v":"evil","ver":100}]}}"#);

    assert_eq!(a.node.get_state("k", ""), "v");
    assert_eq!(a.node.state().len(), 1);
    assert_eq!(a.node.stats().decode_errors, 2);
}

#[tokio::test]
async fn test_runtime_replicates_between_handles() {
    let hub = MemoryHub::new();
    let (ta, rx_a) = hub.join(1);
    let (tb, rx_b) = hub.join(2);
    let (a, task_a) = runtime::spawn(
        MeshNode::new(Box::new(ta), NodeSettings::default()),
        rx_a,
        Duration::from_millis(10),
    );
    let (b, task_b) = runtime::spawn(
        MeshNode::new(Box::new(tb), NodeSettings::default()),
        rx_b,
        Duration::from_millis(10),
    );
    hub.connect(1, 2);

    assert!(a.set_state("mode", "night").await.unwrap());

    let mut replicated = None;
    for _ in 0..100 {
        replicated = b.get_state("mode").await.unwrap();
        if replicated.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(replicated.as_deref(), Some("night"));

    let status = b.status().await.unwrap();
    assert_eq!(status.role, Role::Peer);
    assert_eq!(status.coordinator_id, 1);
    assert_eq!(b.console("get mode").await.unwrap(), "[GET] mode = night");

    a.shutdown().await;
    b.shutdown().await;
    task_a.await.unwrap();
    task_b.await.unwrap();
    assert!(a.status().await.is_err());
}

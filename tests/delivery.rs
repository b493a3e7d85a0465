use std::{
    net::SocketAddr,
    time::{Duration, Instant},
};

use cerebrum::{Config, ConnectorCluster, DeliveredEvent};
use tokio::{runtime::Handle, sync::mpsc::UnboundedReceiver, time::timeout};

const WAIT: Duration = Duration::from_secs(10);

fn cerebrum_config() -> Config {
    Config::from_yaml(
        r#"
node: {id: 1, role: cerebrum}
connectors:
  - {name: hub, port: 0, bind: 127.0.0.1}
reactors: {count: 2}
workers: {readers: 2, writers: 2}
auth: {shared_secret: hunter2}
"#,
    )
    .unwrap()
}

fn synapse_config(id: u16, upstream: SocketAddr, secret: &str) -> Config {
    Config::from_yaml(&format!(
        r#"
node: {{id: {id}, role: synapse}}
connectors:
  - {{name: events, port: 4100, listen: false, upstream: "{upstream}"}}
reactors: {{count: 1}}
workers: {{readers: 2, writers: 2}}
delivery: {{reconnect_secs: 1}}
auth: {{shared_secret: {secret}}}
"#
    ))
    .unwrap()
}

async fn wait_for(what: &str, mut cond: impl FnMut() -> bool) {
    let start = Instant::now();
    while !cond() {
        assert!(start.elapsed() < WAIT, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

async fn start(config: &Config) -> ConnectorCluster {
    let cluster = ConnectorCluster::new(config, Handle::current()).unwrap();
    cluster.start().await.unwrap();
    cluster
}

async fn next_event(events: &mut UnboundedReceiver<DeliveredEvent>) -> DeliveredEvent {
    timeout(WAIT, events.recv())
        .await
        .expect("no event delivered")
        .expect("event channel closed")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_events_are_relayed_exactly_once() {
    let hub = start(&cerebrum_config()).await;
    let hub_connector = hub.get(0).unwrap().clone();
    let addr = hub_connector.local_addr().unwrap();

    let subscriber = ConnectorCluster::new(&synapse_config(2, addr, "hunter2"), Handle::current()).unwrap();
    let sub = subscriber.get(4100).unwrap().clone();
    let mut events = sub.events().unwrap();
    sub.subscribe(7).unwrap();
    subscriber.start().await.unwrap();

    let publisher = start(&synapse_config(3, addr, "hunter2")).await;
    let publ = publisher.get(4100).unwrap().clone();

    wait_for("subscription", || {
        hub_connector.state().subscriptions().subscribers(7) == vec![2]
    })
    .await;
    wait_for("publisher handshake", || publ.state().upstream().is_some()).await;
    assert_eq!(hub_connector.state().ready_nodes(), vec![2, 3]);

    let mut sent = Vec::new();
    for i in 0..3u8 {
        sent.push(publ.publish(7, vec![i; 16]).unwrap());
    }
    // nobody subscribed to this one
    publ.publish(8, b"ignored".to_vec()).unwrap();

    let mut received = Vec::new();
    for _ in 0..3 {
        let event = next_event(&mut events).await;
        assert_eq!(event.event_type, 7);
        assert_eq!(event.payload.len(), 16);
        received.push(event.uid);
    }
    received.sort();
    sent.sort();
    assert_eq!(received, sent);

    // every proof on both hops reaches DONE and is dropped
    wait_for("publisher proofs", || publ.status().in_flight == 0).await;
    wait_for("relay proofs", || hub_connector.status().in_flight == 0).await;

    // retransmitting an event that was already delivered changes nothing
    assert_eq!(publ.state().redeliver(None, false).unwrap(), 0);
    assert!(timeout(Duration::from_millis(300), events.recv()).await.is_err());

    publisher.shutdown().await;
    subscriber.shutdown().await;
    hub.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_publish_before_connecting_is_redelivered() {
    let hub = start(&cerebrum_config()).await;
    let hub_connector = hub.get(0).unwrap().clone();
    let addr = hub_connector.local_addr().unwrap();
    let mut hub_events = hub_connector.events().unwrap();
    hub_connector.subscribe(5).unwrap();

    let publisher = ConnectorCluster::new(&synapse_config(4, addr, "hunter2"), Handle::current()).unwrap();
    let publ = publisher.get(4100).unwrap().clone();
    let uid = publ.publish(5, b"early".to_vec()).unwrap();
    assert_eq!(publ.status().in_flight, 1);
    publisher.start().await.unwrap();

    let event = next_event(&mut hub_events).await;
    assert_eq!(event.uid, uid);
    assert_eq!(event.payload, b"early");
    wait_for("publisher proofs", || publ.status().in_flight == 0).await;

    publisher.shutdown().await;
    hub.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_wrong_secret_never_becomes_ready() {
    let hub = start(&cerebrum_config()).await;
    let hub_connector = hub.get(0).unwrap().clone();
    let addr = hub_connector.local_addr().unwrap();

    let intruder = start(&synapse_config(9, addr, "swordfish")).await;
    let conn = intruder.get(4100).unwrap().clone();

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(hub_connector.state().ready_nodes().is_empty());
    assert!(conn.state().upstream().is_none());
    // held until a handshake succeeds
    conn.publish(1, b"x".to_vec()).unwrap();
    assert_eq!(conn.status().in_flight, 1);

    intruder.shutdown().await;
    hub.shutdown().await;
}

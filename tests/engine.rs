//! End-to-end exchanges between a client session and a listener over
//! in-memory transports.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{wait_for, FailProfile, MemNet, MemProfile};
use umbra::protocol::ids;
use umbra::{EngineConfig, JobStatus, Listener, Packet, Runtime, Session};

fn runtime() -> Runtime {
    Runtime::new(EngineConfig::default())
}

#[tokio::test]
async fn error_budget_closes_session() {
    common::init_tracing();
    let profile = Arc::new(FailProfile {
        sleep: Duration::from_millis(10),
    });
    let s = Session::connect(runtime(), profile);
    tokio::time::timeout(Duration::from_secs(5), s.wait())
        .await
        .expect("session must close after exhausting its error budget");
    assert!(s.is_closed());
    assert!(!s.is_active());
}

#[tokio::test]
async fn hello_registers_with_listener() {
    common::init_tracing();
    let net = MemNet::new();
    let listener = Listener::bind(
        runtime(),
        "test",
        "mem",
        MemProfile::new(&net, Duration::ZERO),
    )
    .await
    .unwrap();
    let client = Session::connect(runtime(), MemProfile::new(&net, Duration::from_millis(25)));

    let server = wait_for(
        || listener.session(client.device().hash()),
        Duration::from_secs(5),
    )
    .await;
    assert!(!server.is_client());
    assert!(client.is_client());
    assert_eq!(server.device(), client.device());
    assert_eq!(server.machine().pid, std::process::id());

    client.close().await;
    listener.close().await;
}

#[tokio::test]
async fn task_round_trip_completes_job() {
    common::init_tracing();
    let net = MemNet::new();
    let listener = Listener::bind(
        runtime(),
        "test",
        "mem",
        MemProfile::new(&net, Duration::ZERO),
    )
    .await
    .unwrap();
    let client = Session::connect(runtime(), MemProfile::new(&net, Duration::from_millis(25)));
    client.enable_receiver();

    let server = wait_for(
        || listener.session(client.device().hash()),
        Duration::from_secs(5),
    )
    .await;

    let mut task = Packet::new(0x80);
    task.payload = b"whoami".to_vec();
    let job = server.task(task).await.unwrap();
    assert_eq!(job.status(), JobStatus::Waiting);

    // The client picks the task up on a later poll.
    let got = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(p) = client.recv().await {
                if p.id == 0x80 {
                    break p;
                }
            }
        }
    })
    .await
    .expect("task packet must reach the client");
    assert_eq!(got.job, job.id);
    assert_eq!(got.payload, b"whoami");

    let mut result = Packet::with_job(ids::RESULT, got.job);
    result.payload = b"svc-user".to_vec();
    client.send(result).await.unwrap();

    tokio::time::timeout(Duration::from_secs(5), job.wait())
        .await
        .expect("job must resolve");
    assert_eq!(job.status(), JobStatus::Completed);
    assert_eq!(job.result().unwrap().payload, b"svc-user");
    assert!(server.job(job.id).await.is_none());

    client.close().await;
    listener.close().await;
}

#[tokio::test]
async fn channel_mode_preserves_packet_order() {
    common::init_tracing();
    let net = MemNet::new();
    let listener = Listener::bind(
        runtime(),
        "test",
        "mem",
        MemProfile::new(&net, Duration::ZERO),
    )
    .await
    .unwrap();
    let client = Session::connect(runtime(), MemProfile::new(&net, Duration::from_millis(50)));

    let server = wait_for(
        || listener.session(client.device().hash()),
        Duration::from_secs(5),
    )
    .await;
    server.enable_receiver();

    client.set_channel(true);
    wait_for(
        || server.in_channel().then_some(()),
        Duration::from_secs(5),
    )
    .await;

    for i in 1..=5u8 {
        let mut p = Packet::new(0x40);
        p.payload = vec![i];
        client.send(p).await.unwrap();
    }

    let mut seen = Vec::new();
    while seen.len() < 5 {
        let p = tokio::time::timeout(Duration::from_secs(5), server.recv())
            .await
            .expect("channel packet must arrive")
            .expect("receive queue stays open");
        if p.id == 0x40 {
            seen.push(p.payload[0]);
        }
    }
    assert_eq!(seen, vec![1, 2, 3, 4, 5], "strict FIFO across the channel");

    client.set_channel(false);
    wait_for(
        || (!server.in_channel()).then_some(()),
        Duration::from_secs(5),
    )
    .await;

    client.close().await;
    listener.close().await;
}

#[tokio::test]
async fn listener_close_drops_sessions() {
    common::init_tracing();
    let net = MemNet::new();
    let listener = Listener::bind(
        runtime(),
        "test",
        "mem",
        MemProfile::new(&net, Duration::ZERO),
    )
    .await
    .unwrap();
    let client = Session::connect(runtime(), MemProfile::new(&net, Duration::from_millis(25)));

    let server = wait_for(
        || listener.session(client.device().hash()),
        Duration::from_secs(5),
    )
    .await;
    listener.close().await;
    assert!(server.is_closed());
    assert!(listener.sessions().is_empty());
    client.close().await;
}

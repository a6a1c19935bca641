use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

use keysweep_controller::server::{Controller, ControllerConfig};
use keysweep_core::fingerprint::TargetFingerprint;
use keysweep_core::types::IndexRange;
use keysweep_wire::{
    read_message, write_message, Assignment, CheckpointReport, FoundReport, Message,
};

fn config(liveness: Duration) -> ControllerConfig {
    ControllerConfig {
        work_size: 100,
        checkpoint_interval: 25,
        liveness_timeout: liveness,
        metrics_snapshot_interval: Duration::ZERO,
    }
}

fn target() -> TargetFingerprint {
    TargetFingerprint {
        hashed_value: "$b3$s$not-a-real-digest".to_string(),
        salt: "$b3$s$".to_string(),
    }
}

async fn start(
    cfg: ControllerConfig,
) -> (
    Controller,
    std::net::SocketAddr,
    tokio::task::JoinHandle<anyhow::Result<Option<keysweep_core::types::MatchRecord>>>,
) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let controller = Controller::new(cfg, target());
    let serve = tokio::spawn(controller.clone().serve(listener));
    (controller, addr, serve)
}

async fn request_assignment(stream: &mut TcpStream) -> Assignment {
    write_message(stream, &Message::Request).await.unwrap();
    match timeout(Duration::from_secs(5), read_message(stream))
        .await
        .unwrap()
        .unwrap()
    {
        Message::Assign(a) => a,
        other => panic!("expected ASSIGN, got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn nodes_get_disjoint_consecutive_ranges() {
    let (_controller, addr, _serve) = start(config(Duration::from_secs(5))).await;

    let mut a = TcpStream::connect(addr).await.unwrap();
    let mut b = TcpStream::connect(addr).await.unwrap();

    let assign_a = request_assignment(&mut a).await;
    let assign_b = request_assignment(&mut b).await;

    assert_eq!(assign_a.range, IndexRange { start: 0, end: 99 });
    assert_eq!(assign_b.range, IndexRange { start: 100, end: 199 });
    assert_ne!(assign_a.node, assign_b.node);
    assert_eq!(assign_a.target.hashed_value, target().hashed_value);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn silent_session_is_reclaimed_within_one_scan_interval() {
    let (_controller, addr, _serve) = start(config(Duration::from_millis(500))).await;

    let mut dead = TcpStream::connect(addr).await.unwrap();
    let assign = request_assignment(&mut dead).await;
    assert_eq!(assign.range, IndexRange { start: 0, end: 99 });

    // One checkpoint lands, then the node goes silent past the timeout.
    write_message(
        &mut dead,
        &Message::Checkpoint(CheckpointReport {
            node: assign.node,
            completed: vec![IndexRange { start: 0, end: 19 }],
        }),
    )
    .await
    .unwrap();
    assert_eq!(
        timeout(Duration::from_secs(5), read_message(&mut dead))
            .await
            .unwrap()
            .unwrap(),
        Message::Continue
    );

    tokio::time::sleep(Duration::from_millis(1200)).await;

    // The next node must be handed the reclaimed gap before fresh work.
    let mut next = TcpStream::connect(addr).await.unwrap();
    let reassigned = request_assignment(&mut next).await;
    assert_eq!(reassigned.range, IndexRange { start: 20, end: 99 });
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn disconnect_before_any_checkpoint_reclaims_the_whole_range() {
    let (_controller, addr, _serve) = start(config(Duration::from_secs(5))).await;

    let mut dead = TcpStream::connect(addr).await.unwrap();
    let assign = request_assignment(&mut dead).await;
    drop(dead);

    // Give the handler a moment to observe the close and reclaim.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let mut next = TcpStream::connect(addr).await.unwrap();
    let reassigned = request_assignment(&mut next).await;
    assert_eq!(reassigned.range, assign.range);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn found_stops_every_session_and_ends_serve() {
    let (_controller, addr, serve) = start(config(Duration::from_secs(5))).await;

    let mut bystander = TcpStream::connect(addr).await.unwrap();
    let _ = request_assignment(&mut bystander).await;

    let mut finder = TcpStream::connect(addr).await.unwrap();
    let assign = request_assignment(&mut finder).await;

    write_message(
        &mut finder,
        &Message::Found(FoundReport {
            node: assign.node,
            index: 150,
        }),
    )
    .await
    .unwrap();

    // The reporter's acknowledgment.
    assert_eq!(
        timeout(Duration::from_secs(5), read_message(&mut finder))
            .await
            .unwrap()
            .unwrap(),
        Message::Stop
    );

    // Every other live session is broadcast a STOP.
    assert_eq!(
        timeout(Duration::from_secs(5), read_message(&mut bystander))
            .await
            .unwrap()
            .unwrap(),
        Message::Stop
    );

    let record = timeout(Duration::from_secs(5), serve)
        .await
        .unwrap()
        .unwrap()
        .unwrap()
        .expect("serve should return the match");
    assert_eq!(record.node, assign.node);
    assert_eq!(record.index, 150);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_found_reports_record_exactly_one_winner() {
    let (_controller, addr, serve) = start(config(Duration::from_secs(5))).await;

    let mut a = TcpStream::connect(addr).await.unwrap();
    let mut b = TcpStream::connect(addr).await.unwrap();
    let assign_a = request_assignment(&mut a).await;
    let assign_b = request_assignment(&mut b).await;

    let msg_a = Message::Found(FoundReport {
        node: assign_a.node,
        index: 11,
    });
    let msg_b = Message::Found(FoundReport {
        node: assign_b.node,
        index: 222,
    });
    let send_a = write_message(&mut a, &msg_a);
    let send_b = write_message(&mut b, &msg_b);
    let (ra, rb) = tokio::join!(send_a, send_b);
    ra.unwrap();
    rb.unwrap();

    let record = timeout(Duration::from_secs(5), serve)
        .await
        .unwrap()
        .unwrap()
        .unwrap()
        .expect("one report must win");
    assert!(
        (record.index == 11 && record.node == assign_a.node)
            || (record.index == 222 && record.node == assign_b.node),
        "winner must be one of the two reports, got {record:?}"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn malformed_frame_fails_the_session_and_reclaims_its_range() {
    use tokio::io::AsyncWriteExt;

    let (_controller, addr, _serve) = start(config(Duration::from_secs(5))).await;

    let mut bad = TcpStream::connect(addr).await.unwrap();
    let assign = request_assignment(&mut bad).await;

    // A framed payload with an unknown tag.
    bad.write_all(&2u32.to_be_bytes()).await.unwrap();
    bad.write_all(b"99").await.unwrap();
    bad.flush().await.unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;

    let mut next = TcpStream::connect(addr).await.unwrap();
    let reassigned = request_assignment(&mut next).await;
    assert_eq!(reassigned.range, assign.range);
}

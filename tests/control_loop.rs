use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{sleep, Instant};

use gamestream::control::{ControlServer, Feedback, SessionHandle};
use gamestream::crypto::{SessionKeys, IV_LEN, KEY_LEN};
use gamestream::events::{RgbLedRequested, Terminated, TerminationReason};
use gamestream::messages::{self, ControlMessage, LossStats, RgbLed};
use gamestream::session::{ControlRole, ControlSession, DEFAULT_KEEPALIVE_TIMEOUT};
use gamestream::transport::{ControlTransport, PipeTransport};
use gamestream::{ControlConfig, EncryptedPacket, EventBus, MediaLink, StatsSink};

const SESSION: u64 = 7;

/// Client end of a session: its own sequence counters over the test pipe.
struct Client {
    session: ControlSession,
    pipe: PipeTransport,
}

impl Client {
    async fn send(&mut self, message: ControlMessage) {
        let packet = self.session.encrypt(&message.encode()).unwrap();
        self.pipe.send(&packet.to_bytes().unwrap()).await.unwrap();
    }

    async fn recv(&mut self) -> ControlMessage {
        let raw = self.pipe.recv().await.unwrap();
        let packet = EncryptedPacket::parse(&raw).unwrap();
        let plain = self.session.decrypt(&packet, Instant::now()).unwrap();
        messages::decode_message(&plain).unwrap()
    }

    /// Completes the handshake and waits for a ping reply, so the host is known
    /// to be established when this returns.
    async fn establish(&mut self) {
        self.send(ControlMessage::StartA).await;
        self.send(ControlMessage::StartB).await;
        self.send(ControlMessage::PeriodicPing { payload: vec![0xaa] }).await;
        assert_eq!(
            self.recv().await,
            ControlMessage::PeriodicPing { payload: vec![0xaa] }
        );
    }
}

fn keys() -> SessionKeys {
    SessionKeys::new([0x5a; KEY_LEN], [0x01; IV_LEN])
}

fn start(bus: &Arc<EventBus>) -> (SessionHandle, Client) {
    let server = ControlServer::new(Arc::clone(bus), ControlConfig::default()).unwrap();
    let (host_side, client_side) = PipeTransport::pair(64);
    let handle = server.spawn_session(SESSION, keys(), host_side);
    let client = Client {
        session: ControlSession::new(
            SESSION,
            keys(),
            ControlRole::Client,
            DEFAULT_KEEPALIVE_TIMEOUT,
        ),
        pipe: client_side,
    };
    (handle, client)
}

fn record_terminations(
    bus: &Arc<EventBus>,
) -> (Arc<Mutex<Vec<Terminated>>>, gamestream::SubscriptionHandle) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let handle = bus.subscribe(move |event: Terminated| sink.lock().unwrap().push(event));
    (seen, handle)
}

#[tokio::test(start_paused = true)]
async fn pings_keep_the_session_alive_until_they_stop() {
    let bus = Arc::new(EventBus::new());
    let (terminations, _sub) = record_terminations(&bus);
    let (handle, mut client) = start(&bus);
    client.establish().await;

    for _ in 0..10 {
        client
            .send(ControlMessage::PeriodicPing { payload: vec![1, 2] })
            .await;
        sleep(Duration::from_millis(500)).await;
        while client.pipe.try_recv().is_some() {}
    }
    assert!(terminations.lock().unwrap().is_empty());
    assert!(!handle.is_finished());

    sleep(Duration::from_millis(1_100)).await;
    assert_eq!(
        *terminations.lock().unwrap(),
        vec![Terminated {
            session_id: SESSION,
            reason: TerminationReason::Timeout,
        }]
    );

    let summary = handle.join().await.unwrap();
    assert_eq!(summary.reason, TerminationReason::Timeout);
    assert_eq!(summary.stats.accepted, 13);
    assert_eq!(summary.stats.sent, 11);
    assert_eq!(summary.stats.dropped(), 0);
}

#[tokio::test(start_paused = true)]
async fn client_termination_is_published_once() {
    let bus = Arc::new(EventBus::new());
    let (terminations, _sub) = record_terminations(&bus);
    let (handle, mut client) = start(&bus);
    client.establish().await;

    client
        .send(ControlMessage::Termination { code: 0x8003_0023 })
        .await;
    let summary = handle.join().await.unwrap();
    let expected = TerminationReason::ClientRequested { code: 0x8003_0023 };
    assert_eq!(summary.reason, expected);

    sleep(Duration::from_secs(5)).await;
    let seen = terminations.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].reason, expected);
}

#[tokio::test(start_paused = true)]
async fn external_termination_stops_the_loop_without_republishing() {
    let bus = Arc::new(EventBus::new());
    let (terminations, _sub) = record_terminations(&bus);
    let (handle, mut client) = start(&bus);
    client.establish().await;

    handle.terminate();
    let summary = handle.join().await.unwrap();
    assert_eq!(summary.reason, TerminationReason::External);
    assert_eq!(terminations.lock().unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn terminate_issued_before_the_task_runs_is_not_lost() {
    let bus = Arc::new(EventBus::new());
    let (terminations, _sub) = record_terminations(&bus);
    let (handle, _client) = start(&bus);
    handle.terminate();

    let started = Instant::now();
    let summary = handle.join().await.unwrap();
    assert_eq!(summary.reason, TerminationReason::External);
    assert!(started.elapsed() < DEFAULT_KEEPALIVE_TIMEOUT);

    sleep(Duration::from_secs(5)).await;
    assert_eq!(
        *terminations.lock().unwrap(),
        vec![Terminated {
            session_id: SESSION,
            reason: TerminationReason::External,
        }]
    );
}

#[tokio::test(start_paused = true)]
async fn rgb_led_request_reaches_subscribers() {
    let bus = Arc::new(EventBus::new());
    let (tx, mut rx) = mpsc::unbounded_channel();
    let _sub = bus.subscribe(move |event: RgbLedRequested| {
        let _ = tx.send(event);
    });
    let (handle, mut client) = start(&bus);
    client.establish().await;

    client
        .send(ControlMessage::RgbLed(RgbLed {
            controller: 1,
            r: 0x10,
            g: 0x20,
            b: 0x30,
        }))
        .await;
    assert_eq!(
        rx.recv().await,
        Some(RgbLedRequested {
            session_id: SESSION,
            controller: 1,
            r: 0x10,
            g: 0x20,
            b: 0x30,
        })
    );
    handle.terminate();
    handle.join().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn tampered_packets_do_not_end_the_session() {
    let bus = Arc::new(EventBus::new());
    let (handle, mut client) = start(&bus);
    client.establish().await;

    let packet = client
        .session
        .encrypt(&ControlMessage::IdrFrame.encode())
        .unwrap();
    let mut bytes = packet.to_bytes().unwrap();
    let last = bytes.len() - 1;
    bytes[last] ^= 0x01;
    client.pipe.send(&bytes).await.unwrap();
    client.pipe.send(&[0x01, 0x00, 0xff, 0xff]).await.unwrap();

    client
        .send(ControlMessage::PeriodicPing { payload: vec![3] })
        .await;
    assert_eq!(
        client.recv().await,
        ControlMessage::PeriodicPing { payload: vec![3] }
    );
    assert!(!handle.is_finished());

    handle.terminate();
    let summary = handle.join().await.unwrap();
    assert_eq!(summary.stats.auth_failures, 1);
    assert_eq!(summary.stats.malformed, 1);
}

#[tokio::test(start_paused = true)]
async fn feedback_is_delivered_to_the_client() {
    let bus = Arc::new(EventBus::new());
    let (handle, mut client) = start(&bus);
    client.establish().await;

    let led = RgbLed {
        controller: 2,
        r: 0xff,
        g: 0,
        b: 0x80,
    };
    handle.send_feedback(Feedback::RgbLed(led)).await.unwrap();
    handle
        .send_feedback(Feedback::HdrMode { enabled: true })
        .await
        .unwrap();
    assert_eq!(client.recv().await, ControlMessage::RgbLed(led));
    assert_eq!(client.recv().await, ControlMessage::HdrMode { enabled: true });

    handle.terminate();
    handle.join().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn idr_requests_reach_the_media_link_and_are_acknowledged() {
    let bus = Arc::new(EventBus::new());
    let media = MediaLink::attach(&bus, SESSION);
    let (handle, mut client) = start(&bus);
    client.establish().await;

    client.send(ControlMessage::IdrFrame).await;
    client.send(ControlMessage::IdrFrame).await;
    assert_eq!(client.recv().await, ControlMessage::IdrFrame);
    assert_eq!(client.recv().await, ControlMessage::IdrFrame);
    assert!(media.take_keyframe_request());
    assert!(!media.take_keyframe_request());

    handle.terminate();
    assert_eq!(media.terminated().await, TerminationReason::External);
    handle.join().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn loss_reports_are_aggregated() {
    let bus = Arc::new(EventBus::new());
    let stats = StatsSink::attach(&bus);
    let (handle, mut client) = start(&bus);
    client.establish().await;

    for loss_count in [2, 5] {
        client
            .send(ControlMessage::LossStats(LossStats {
                loss_count,
                interval_ms: 50,
                last_good_frame: 900,
            }))
            .await;
    }
    client
        .send(ControlMessage::PeriodicPing { payload: vec![] })
        .await;
    client.recv().await;

    let snapshot = stats.snapshot(SESSION).unwrap();
    assert_eq!(snapshot.loss_reports, 2);
    assert_eq!(snapshot.total_lost, 7);
    assert_eq!(snapshot.max_loss_burst, 5);

    handle.terminate();
    handle.join().await.unwrap();
}

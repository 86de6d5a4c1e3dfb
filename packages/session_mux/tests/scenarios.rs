//! End-to-end behaviour of the core actor, driven the way a UI and a
//! transport drive it.

use std::time::Duration;

use session_mux::{
    Anchor, CleanupToken, ClientMessage, Core, CoreEvent, CoreHandle, CorrelationKey, MemoryHost,
    MuxConfig, MuxError, Notice, RecordingTransport, ServerMessage, SessionId, SessionRecord,
    SessionStatus, SubscriptionStatus, TransportEvent,
};
use tokio::sync::{broadcast, mpsc};

struct Harness {
    handle: CoreHandle<Anchor>,
    inbound: mpsc::Sender<TransportEvent>,
    host: MemoryHost,
    transport: RecordingTransport,
}

impl Harness {
    fn start() -> Self {
        Self::start_with(MuxConfig::default())
    }

    fn start_with(config: MuxConfig) -> Self {
        let host = MemoryHost::new();
        let transport = RecordingTransport::new();
        let (core, handle, inbound) = Core::new(host.clone(), transport.clone(), config);
        tokio::spawn(core.run());
        Self {
            handle,
            inbound,
            host,
            transport,
        }
    }

    async fn connected() -> Self {
        let harness = Self::start();
        harness.deliver(TransportEvent::Connected).await;
        harness
    }

    /// Hand an event to the core and wait until it has been applied.
    async fn deliver(&self, event: TransportEvent) {
        self.inbound.send(event).await.unwrap();
        // Inbound traffic is drained before commands, so this round trip
        // returns only after the event above was processed.
        self.handle.connection().await.unwrap();
    }

    async fn server(&self, msg: ServerMessage) {
        self.deliver(TransportEvent::Message(msg)).await;
    }

    fn subscribes(&self) -> Vec<String> {
        self.transport
            .sent()
            .into_iter()
            .filter_map(|m| match m {
                ClientMessage::Subscribe { session_id } => Some(session_id.to_string()),
                _ => None,
            })
            .collect()
    }
}

fn created(id: &str, key: Option<&str>) -> ServerMessage {
    ServerMessage::SessionCreated {
        session: SessionRecord {
            id: id.into(),
            correlation_key: key.map(str::to_string),
            status: SessionStatus::Idle,
            last_activity: None,
        },
    }
}

fn drain(rx: &mut broadcast::Receiver<CoreEvent>) -> Vec<CoreEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn shell_session_round_trip() {
    let h = Harness::start();

    let info = h.handle.open("shell-1").await.unwrap();
    assert_eq!(info.status, SubscriptionStatus::Subscribing);
    assert!(info.loading);
    h.handle.show("shell-1").await.unwrap();

    h.deliver(TransportEvent::Connected).await;
    assert_eq!(h.subscribes(), vec!["shell-1"]);

    h.server(ServerMessage::Buffer {
        session_id: "shell-1".into(),
        data: "$ ".into(),
    })
    .await;
    let surface = h.host.surface("shell-1").unwrap();
    assert_eq!(surface.transcript(), "$ ");
    assert!(!surface.is_loading());

    assert!(h.handle.input("shell-1", "ls\n").await.unwrap());
    assert!(h.transport.sent().contains(&ClientMessage::Input {
        session_id: "shell-1".into(),
        data: "ls\n".into()
    }));

    h.server(ServerMessage::Output {
        session_id: "shell-1".into(),
        data: "file.txt\n$ ".into(),
    })
    .await;
    assert_eq!(surface.transcript(), "$ file.txt\n$ ");
}

#[tokio::test]
async fn open_twice_subscribes_once() {
    let h = Harness::connected().await;
    let first = h.handle.open("a").await.unwrap();
    let second = h.handle.open("a").await.unwrap();
    assert_eq!(first.ordinal, second.ordinal);
    assert_eq!(h.subscribes(), vec!["a"]);
    assert_eq!(h.host.mount_count(), 1);
}

#[tokio::test]
async fn open_without_mount_target_fails() {
    let h = Harness::connected().await;
    h.host.set_mount_available(false);
    let err = h.handle.open("a").await.unwrap_err();
    assert!(matches!(err, MuxError::NoMountTarget { .. }));
    assert!(h.handle.channels().await.unwrap().is_empty());
    assert!(h.subscribes().is_empty());
}

#[tokio::test]
async fn output_after_close_is_ignored() {
    let h = Harness::connected().await;
    h.handle.open("a").await.unwrap();
    h.server(ServerMessage::Output {
        session_id: "a".into(),
        data: "one".into(),
    })
    .await;
    assert!(h.handle.close("a").await.unwrap());

    h.server(ServerMessage::Output {
        session_id: "a".into(),
        data: "two".into(),
    })
    .await;
    let surface = h.host.surface("a").unwrap();
    assert_eq!(surface.transcript(), "one");
    assert!(surface.is_disposed());
    assert!(
        h.transport
            .sent()
            .contains(&ClientMessage::Unsubscribe {
                session_id: "a".into()
            })
    );
}

#[tokio::test]
async fn buffer_then_output_renders_in_order() {
    let h = Harness::connected().await;
    h.handle.open("a").await.unwrap();
    h.inbound
        .send(TransportEvent::Message(ServerMessage::Buffer {
            session_id: "a".into(),
            data: "history|".into(),
        }))
        .await
        .unwrap();
    h.server(ServerMessage::Output {
        session_id: "a".into(),
        data: "live".into(),
    })
    .await;
    assert_eq!(h.host.surface("a").unwrap().transcript(), "history|live");
}

#[tokio::test]
async fn output_then_buffer_keeps_both() {
    let h = Harness::connected().await;
    h.handle.open("a").await.unwrap();
    h.server(ServerMessage::Output {
        session_id: "a".into(),
        data: "live|".into(),
    })
    .await;
    h.server(ServerMessage::Buffer {
        session_id: "a".into(),
        data: "hist".into(),
    })
    .await;
    assert_eq!(h.host.surface("a").unwrap().transcript(), "live|hist");
}

#[tokio::test]
async fn exit_notice_survives_reconnect_replay() {
    let h = Harness::connected().await;
    h.handle.open("a").await.unwrap();
    h.server(ServerMessage::Output {
        session_id: "a".into(),
        data: "bye\n".into(),
    })
    .await;
    h.server(ServerMessage::Exit {
        session_id: "a".into(),
        exit_code: Some(2),
    })
    .await;

    h.deliver(TransportEvent::Disconnected { reason: None }).await;
    h.deliver(TransportEvent::Connected).await;
    h.server(ServerMessage::Buffer {
        session_id: "a".into(),
        data: "bye\n".into(),
    })
    .await;

    let surface = h.host.surface("a").unwrap();
    assert_eq!(surface.transcript(), "bye\nbye\n");
    assert_eq!(surface.notices(), vec![Notice::Exited { code: Some(2) }]);
    let channels = h.handle.channels().await.unwrap();
    assert_eq!(channels[0].status, SubscriptionStatus::Exited);
    assert_eq!(channels[0].exit_code, Some(2));
}

#[tokio::test]
async fn reconnect_resubscribes_all_and_only_live_channels() {
    let h = Harness::connected().await;
    for id in ["a", "b", "c"] {
        h.handle.open(id).await.unwrap();
    }
    h.handle.close("b").await.unwrap();

    h.deliver(TransportEvent::Disconnected {
        reason: Some("server restart".into()),
    })
    .await;
    h.transport.clear();
    h.deliver(TransportEvent::Connected).await;

    assert_eq!(h.subscribes(), vec!["a", "c"]);
    let channels = h.handle.channels().await.unwrap();
    assert!(
        channels
            .iter()
            .all(|c| c.status == SubscriptionStatus::Subscribing)
    );
}

#[tokio::test]
async fn exit_and_detach_are_broadcast() {
    let h = Harness::connected().await;
    let mut events = h.handle.subscribe();
    h.handle.open("a").await.unwrap();
    h.handle.open("b").await.unwrap();

    h.server(ServerMessage::Detached {
        session_id: "a".into(),
    })
    .await;
    h.server(ServerMessage::Exit {
        session_id: "b".into(),
        exit_code: Some(0),
    })
    .await;

    let events = drain(&mut events);
    assert!(events.contains(&CoreEvent::ChannelStatus {
        session_id: "a".into(),
        status: SubscriptionStatus::Detached
    }));
    assert!(events.contains(&CoreEvent::ChannelStatus {
        session_id: "b".into(),
        status: SubscriptionStatus::Exited
    }));

    // Exited channels stay until the user closes them
    let channels = h.handle.channels().await.unwrap();
    assert_eq!(channels.len(), 2);
    assert_eq!(channels[1].exit_code, Some(0));
}

#[tokio::test(start_paused = true)]
async fn unconfirmed_placeholder_expires_with_its_stand_in() {
    let h = Harness::connected().await;
    let mut events = h.handle.subscribe();
    let token = CleanupToken::new();

    h.handle
        .record(
            "Frontend",
            Anchor { x: 3.0, z: -2.0 },
            Some(token),
            Some(Duration::from_millis(10_000)),
        )
        .await
        .unwrap();
    assert_eq!(h.handle.placeholders().await.unwrap().len(), 1);

    tokio::time::sleep(Duration::from_millis(10_001)).await;

    assert!(h.handle.placeholders().await.unwrap().is_empty());
    assert_eq!(h.host.removed_stand_ins(), vec![token]);
    assert!(h.host.seeded().is_empty());
    assert_eq!(
        drain(&mut events),
        vec![CoreEvent::PlaceholderExpired {
            key: "Frontend".into()
        }]
    );
}

#[tokio::test(start_paused = true)]
async fn confirmed_placeholder_seeds_session_and_never_expires() {
    let h = Harness::connected().await;
    let mut events = h.handle.subscribe();
    let token = CleanupToken::new();
    let pos = Anchor { x: 3.0, z: -2.0 };

    h.handle
        .record("Frontend", pos, Some(token), Some(Duration::from_millis(10_000)))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(500)).await;
    h.server(created("sess-abc", Some("Frontend"))).await;

    assert!(h.handle.placeholders().await.unwrap().is_empty());
    assert_eq!(h.host.seeded(), vec![(SessionId::from("sess-abc"), pos)]);
    assert_eq!(h.host.removed_stand_ins(), vec![token]);

    // A duplicate delivery of the creation event finds nothing to resolve
    h.server(created("sess-abc", Some("Frontend"))).await;
    tokio::time::sleep(Duration::from_millis(10_000)).await;

    assert_eq!(h.host.seeded().len(), 1);
    assert_eq!(h.host.removed_stand_ins().len(), 1);
    let events = drain(&mut events);
    assert!(events.contains(&CoreEvent::PlaceholderResolved {
        key: "Frontend".into(),
        session_id: "sess-abc".into()
    }));
    assert!(
        !events
            .iter()
            .any(|e| matches!(e, CoreEvent::PlaceholderExpired { .. }))
    );
}

#[tokio::test(start_paused = true)]
async fn creation_after_expiry_is_a_no_op() {
    let h = Harness::connected().await;
    h.handle
        .record("Frontend", Anchor { x: 0.0, z: 0.0 }, None, None)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(11)).await;

    h.server(created("sess-late", Some("Frontend"))).await;
    assert!(h.host.seeded().is_empty());
    // The directory still learns about the session
    let sessions = h.handle.sessions().await.unwrap();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].id.as_str(), "sess-late");
}

#[tokio::test(start_paused = true)]
async fn rerecording_removes_the_superseded_stand_in() {
    let h = Harness::connected().await;
    let first = CleanupToken::new();
    let second = CleanupToken::new();
    h.handle
        .record("Frontend", Anchor { x: 1.0, z: 1.0 }, Some(first), None)
        .await
        .unwrap();
    h.handle
        .record("Frontend", Anchor { x: 2.0, z: 2.0 }, Some(second), None)
        .await
        .unwrap();

    assert_eq!(h.host.removed_stand_ins(), vec![first]);
    assert_eq!(h.handle.placeholders().await.unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn huge_ttl_does_not_take_the_core_down() {
    let h = Harness::connected().await;
    let three_years = Duration::from_secs(3 * 365 * 24 * 60 * 60);
    h.handle
        .record("Frontend", Anchor { x: 0.0, z: 0.0 }, None, Some(three_years))
        .await
        .unwrap();

    h.handle.open("a").await.unwrap();
    assert_eq!(
        h.handle.placeholders().await.unwrap(),
        vec![CorrelationKey::from("Frontend")]
    );
}

#[tokio::test(start_paused = true)]
async fn huge_refit_delay_does_not_take_the_core_down() {
    let h = Harness::start_with(MuxConfig {
        refit_delays: vec![Duration::MAX],
        ..MuxConfig::default()
    });
    h.deliver(TransportEvent::Connected).await;
    h.handle.open("a").await.unwrap();
    h.handle.show("a").await.unwrap();
    assert_eq!(h.handle.active().await.unwrap(), Some(SessionId::from("a")));
}

#[tokio::test(start_paused = true)]
async fn resolve_through_handle_confirms_once() {
    let h = Harness::connected().await;
    let mut events = h.handle.subscribe();
    let token = CleanupToken::new();
    let pos = Anchor { x: 1.0, z: 4.0 };
    h.handle
        .record("Frontend", pos, Some(token), None)
        .await
        .unwrap();

    assert!(h.handle.resolve("Frontend", "sess-abc").await.unwrap());
    assert!(!h.handle.resolve("Frontend", "sess-abc").await.unwrap());

    assert!(h.handle.placeholders().await.unwrap().is_empty());
    assert_eq!(h.host.seeded(), vec![(SessionId::from("sess-abc"), pos)]);
    assert_eq!(h.host.removed_stand_ins(), vec![token]);

    // The server's own creation event arriving later finds nothing either
    h.server(created("sess-abc", Some("Frontend"))).await;
    tokio::time::sleep(Duration::from_secs(11)).await;
    assert_eq!(h.host.seeded().len(), 1);
    assert_eq!(
        drain(&mut events),
        vec![
            CoreEvent::PlaceholderResolved {
                key: "Frontend".into(),
                session_id: "sess-abc".into()
            },
            CoreEvent::SessionStatus {
                session_id: "sess-abc".into(),
                status: Some(SessionStatus::Idle)
            },
        ]
    );
}

#[tokio::test]
async fn dismiss_and_reactivate_go_through_the_server() {
    let h = Harness::connected().await;
    let mut events = h.handle.subscribe();
    h.server(created("s1", None)).await;

    h.handle.dismiss("s1").await.unwrap();
    assert_eq!(
        h.transport.sent().last(),
        Some(&ClientMessage::Dismiss {
            session_id: "s1".into()
        })
    );
    // Nothing changes until the server says so
    assert_eq!(
        h.handle.sessions().await.unwrap()[0].status,
        SessionStatus::Idle
    );

    h.server(ServerMessage::SessionUpdated {
        session: SessionRecord {
            id: "s1".into(),
            correlation_key: None,
            status: SessionStatus::Dismissed,
            last_activity: None,
        },
    })
    .await;
    assert_eq!(
        h.handle.sessions().await.unwrap()[0].status,
        SessionStatus::Dismissed
    );

    h.handle.reactivate("s1").await.unwrap();
    assert_eq!(
        h.transport.sent().last(),
        Some(&ClientMessage::Reactivate {
            session_id: "s1".into()
        })
    );
    assert!(matches!(
        h.handle.reactivate("ghost").await,
        Err(MuxError::UnknownDirectorySession(_))
    ));

    let events = drain(&mut events);
    assert!(events.contains(&CoreEvent::SessionStatus {
        session_id: "s1".into(),
        status: Some(SessionStatus::Dismissed)
    }));
}

#[tokio::test]
async fn closing_active_channel_selects_earliest_remaining() {
    let h = Harness::connected().await;
    for id in ["a", "b", "c"] {
        h.handle.open(id).await.unwrap();
    }
    h.handle.show("c").await.unwrap();
    h.handle.close("c").await.unwrap();
    assert_eq!(
        h.handle.active().await.unwrap(),
        Some(SessionId::from("a"))
    );
    assert!(h.host.surface("a").unwrap().is_visible());
}

#[tokio::test]
async fn independent_cores_do_not_share_state() {
    let one = Harness::connected().await;
    let two = Harness::connected().await;
    one.handle.open("a").await.unwrap();

    assert!(two.handle.channels().await.unwrap().is_empty());
    assert!(two.subscribes().is_empty());
}

#[tokio::test]
async fn handle_reports_core_gone() {
    let host = MemoryHost::new();
    let (core, handle, _inbound) =
        Core::new(host, RecordingTransport::new(), MuxConfig::default());
    drop(core);
    assert!(matches!(
        handle.open("a").await,
        Err(MuxError::CoreGone)
    ));
}

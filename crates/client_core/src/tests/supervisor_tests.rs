use super::*;
use crate::test_support::FakeLauncher;

const GRACE: Duration = Duration::from_secs(1);
const SETTLE: Duration = Duration::from_secs(2);
const MARKER: &str = "listening on port";

fn supervisor(launcher: &Arc<FakeLauncher>) -> (Supervisor, mpsc::UnboundedReceiver<SupervisorEvent>) {
    Supervisor::new(launcher.clone(), GRACE)
}

fn server_spec() -> LaunchSpec {
    LaunchSpec::new(ProcessKind::Server, "server").ready_marker(MARKER, SETTLE)
}

fn client_spec() -> LaunchSpec {
    LaunchSpec::new(ProcessKind::Client, "client")
}

/// Feeds events back into the supervisor until a notice matches `done`.
async fn pump_until(
    supervisor: &mut Supervisor,
    events: &mut mpsc::UnboundedReceiver<SupervisorEvent>,
    done: impl Fn(&SupervisorNotice) -> bool,
) -> Vec<SupervisorNotice> {
    let mut seen = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(30), events.recv())
            .await
            .expect("supervisor event in time")
            .expect("event channel open");
        let notices = supervisor.handle_event(event);
        let finished = notices.iter().any(&done);
        seen.extend(notices);
        if finished {
            return seen;
        }
    }
}

fn is_exit_notice(notice: &SupervisorNotice) -> bool {
    matches!(
        notice,
        SupervisorNotice::Stopped { .. } | SupervisorNotice::Crashed { .. }
    )
}

#[tokio::test]
async fn starting_twice_spawns_one_process() {
    let launcher = FakeLauncher::new();
    let (mut supervisor, _events) = supervisor(&launcher);

    let first = supervisor.start(&client_spec()).expect("first start");
    let second = supervisor.start(&client_spec()).expect("second start");

    assert_eq!(first.id, second.id);
    assert_eq!(first.pid, second.pid);
    assert_eq!(launcher.spawn_count(), 1);
    assert!(supervisor.is_running(ProcessKind::Client));
}

#[tokio::test]
async fn spawn_failure_leaves_kind_not_started() {
    let launcher = FakeLauncher::new();
    launcher.fail_kind(ProcessKind::Server);
    let (mut supervisor, _events) = supervisor(&launcher);

    let err = supervisor.start(&server_spec()).expect_err("missing binary");
    assert!(matches!(
        err,
        SupervisorError::SpawnFailed {
            kind: ProcessKind::Server,
            ..
        }
    ));
    assert_eq!(supervisor.state(ProcessKind::Server), ProcessState::NotStarted);
    assert!(supervisor.is_idle());
}

#[tokio::test]
async fn marker_line_moves_server_to_running() {
    let launcher = FakeLauncher::new();
    let (mut supervisor, mut events) = supervisor(&launcher);

    supervisor.start(&server_spec()).expect("start");
    assert_eq!(supervisor.state(ProcessKind::Server), ProcessState::Starting);

    let mut server = launcher.take(ProcessKind::Server);
    server.say("booting\nlistening on port 7000\n").await;

    let notices = pump_until(&mut supervisor, &mut events, |notice| {
        matches!(notice, SupervisorNotice::Ready { .. })
    })
    .await;
    assert_eq!(
        notices,
        vec![
            SupervisorNotice::Record {
                kind: ProcessKind::Server,
                stream: StreamKind::Stdout,
                record: "booting".to_string(),
            },
            SupervisorNotice::Ready {
                kind: ProcessKind::Server,
                via: ReadyVia::Marker,
            },
            SupervisorNotice::Record {
                kind: ProcessKind::Server,
                stream: StreamKind::Stdout,
                record: "listening on port 7000".to_string(),
            },
        ]
    );
    assert!(supervisor.is_running(ProcessKind::Server));
}

#[tokio::test]
async fn marker_on_stderr_also_counts() {
    let launcher = FakeLauncher::new();
    let (mut supervisor, mut events) = supervisor(&launcher);
    supervisor.start(&server_spec()).expect("start");

    let mut server = launcher.take(ProcessKind::Server);
    server.complain("2024/01/01 listening on port 7000\n").await;

    let notices = pump_until(&mut supervisor, &mut events, |notice| {
        matches!(notice, SupervisorNotice::Ready { .. })
    })
    .await;
    assert!(notices.contains(&SupervisorNotice::Ready {
        kind: ProcessKind::Server,
        via: ReadyVia::Marker,
    }));
}

#[tokio::test(start_paused = true)]
async fn silent_server_is_assumed_ready_after_settle_delay() {
    let launcher = FakeLauncher::new();
    let (mut supervisor, mut events) = supervisor(&launcher);
    supervisor.start(&server_spec()).expect("start");
    let started = tokio::time::Instant::now();

    let notices = pump_until(&mut supervisor, &mut events, |notice| {
        matches!(notice, SupervisorNotice::Ready { .. })
    })
    .await;
    assert_eq!(
        notices,
        vec![SupervisorNotice::Ready {
            kind: ProcessKind::Server,
            via: ReadyVia::SettleDelay,
        }]
    );
    assert!(started.elapsed() >= SETTLE);
    assert!(supervisor.is_running(ProcessKind::Server));
}

#[tokio::test(start_paused = true)]
async fn settle_timer_after_marker_is_ignored() {
    let launcher = FakeLauncher::new();
    let (mut supervisor, mut events) = supervisor(&launcher);
    supervisor.start(&server_spec()).expect("start");
    let mut server = launcher.take(ProcessKind::Server);
    server.say("listening on port 7000\n").await;

    pump_until(&mut supervisor, &mut events, |notice| {
        matches!(notice, SupervisorNotice::Ready { .. })
    })
    .await;

    tokio::time::sleep(SETTLE * 2).await;
    while let Ok(event) = events.try_recv() {
        assert!(supervisor.handle_event(event).is_empty());
    }
}

#[tokio::test(start_paused = true)]
async fn unanswered_graceful_stop_is_forced_with_one_kill() {
    let launcher = FakeLauncher::new();
    let (mut supervisor, mut events) = supervisor(&launcher);
    supervisor.start(&client_spec()).expect("start");
    let mut client = launcher.take(ProcessKind::Client);

    supervisor.stop(ProcessKind::Client, true);
    supervisor.stop(ProcessKind::Client, true);
    assert_eq!(
        supervisor.state(ProcessKind::Client),
        ProcessState::StoppingGraceful
    );
    assert_eq!(client.read_input(6).await, b"/exit\n");

    let notices = pump_until(&mut supervisor, &mut events, is_exit_notice).await;
    assert_eq!(
        notices,
        vec![SupervisorNotice::Stopped {
            kind: ProcessKind::Client,
            forced: true,
            exit_code: None,
        }]
    );
    assert_eq!(launcher.kill_count(), 1);
    assert_eq!(supervisor.state(ProcessKind::Client), ProcessState::NotStarted);
    assert!(supervisor.is_idle());
}

#[tokio::test(start_paused = true)]
async fn graceful_stop_answered_in_time_needs_no_kill() {
    let launcher = FakeLauncher::new();
    let (mut supervisor, mut events) = supervisor(&launcher);
    supervisor.start(&client_spec()).expect("start");
    let mut client = launcher.take(ProcessKind::Client);

    supervisor.stop(ProcessKind::Client, true);
    assert_eq!(client.read_input(6).await, b"/exit\n");
    client.exit(Some(0));

    let notices = pump_until(&mut supervisor, &mut events, is_exit_notice).await;
    assert_eq!(
        notices,
        vec![SupervisorNotice::Stopped {
            kind: ProcessKind::Client,
            forced: false,
            exit_code: Some(0),
        }]
    );

    tokio::time::sleep(GRACE * 2).await;
    while let Ok(event) = events.try_recv() {
        supervisor.handle_event(event);
    }
    assert_eq!(launcher.kill_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn forced_stop_escalates_a_graceful_one() {
    let launcher = FakeLauncher::new();
    let (mut supervisor, mut events) = supervisor(&launcher);
    supervisor.start(&client_spec()).expect("start");

    supervisor.stop(ProcessKind::Client, true);
    supervisor.stop(ProcessKind::Client, false);
    supervisor.stop(ProcessKind::Client, false);
    assert_eq!(
        supervisor.state(ProcessKind::Client),
        ProcessState::StoppingForced
    );

    pump_until(&mut supervisor, &mut events, is_exit_notice).await;
    tokio::time::sleep(GRACE * 2).await;
    while let Ok(event) = events.try_recv() {
        supervisor.handle_event(event);
    }
    assert_eq!(launcher.kill_count(), 1);
}

#[tokio::test]
async fn stop_without_worker_is_a_no_op() {
    let launcher = FakeLauncher::new();
    let (mut supervisor, _events) = supervisor(&launcher);
    supervisor.stop(ProcessKind::Server, false);
    supervisor.stop(ProcessKind::Client, true);
    assert!(supervisor.is_idle());
    assert_eq!(launcher.kill_count(), 0);
}

#[tokio::test]
async fn unexpected_exit_is_a_crash_and_clears_the_slot() {
    let launcher = FakeLauncher::new();
    let (mut supervisor, mut events) = supervisor(&launcher);
    let first = supervisor.start(&client_spec()).expect("start");
    let mut client = launcher.take(ProcessKind::Client);

    client.say("[alice]: bye\n").await;
    client.exit(Some(2));

    let notices = pump_until(&mut supervisor, &mut events, is_exit_notice).await;
    assert_eq!(
        notices,
        vec![
            SupervisorNotice::Record {
                kind: ProcessKind::Client,
                stream: StreamKind::Stdout,
                record: "[alice]: bye".to_string(),
            },
            SupervisorNotice::Crashed {
                kind: ProcessKind::Client,
                exit_code: Some(2),
            },
        ]
    );
    assert_eq!(supervisor.state(ProcessKind::Client), ProcessState::NotStarted);
    assert_eq!(
        supervisor.write(ProcessKind::Client, b"hi\n".to_vec()).unwrap_err(),
        WriteError::WriteAfterExit {
            kind: ProcessKind::Client
        }
    );

    let second = supervisor.start(&client_spec()).expect("restart");
    assert_ne!(first.id, second.id);
    assert_eq!(launcher.spawn_count(), 2);
}

#[tokio::test]
async fn unterminated_tail_at_stream_end_is_dropped() {
    let launcher = FakeLauncher::new();
    let (mut supervisor, mut events) = supervisor(&launcher);
    supervisor.start(&client_spec()).expect("start");
    let client = launcher.take(ProcessKind::Client);

    let mut stdout = client.stdout;
    tokio::io::AsyncWriteExt::write_all(&mut stdout, b"complete\npartial")
        .await
        .expect("write");
    drop(stdout);

    let mut records = Vec::new();
    loop {
        let event = events.recv().await.expect("event");
        let closed = matches!(
            event,
            SupervisorEvent::StreamClosed {
                stream: StreamKind::Stdout,
                ..
            }
        );
        for notice in supervisor.handle_event(event) {
            if let SupervisorNotice::Record { record, .. } = notice {
                records.push(record);
            }
        }
        if closed {
            break;
        }
    }
    assert_eq!(records, vec!["complete".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn restart_while_stopping_keeps_tracking_the_old_instance() {
    let launcher = FakeLauncher::new();
    let (mut supervisor, mut events) = supervisor(&launcher);
    let old = supervisor.start(&server_spec()).expect("start");

    supervisor.stop(ProcessKind::Server, true);
    let new = supervisor.start(&server_spec()).expect("restart");
    assert_ne!(old.id, new.id);
    assert_eq!(launcher.spawn_count(), 2);
    assert_eq!(supervisor.state(ProcessKind::Server), ProcessState::Starting);

    let notices = pump_until(&mut supervisor, &mut events, is_exit_notice).await;
    assert!(notices.contains(&SupervisorNotice::Stopped {
        kind: ProcessKind::Server,
        forced: true,
        exit_code: None,
    }));
    assert_eq!(launcher.kill_count(), 1);
    assert_eq!(
        supervisor.handle(ProcessKind::Server).map(|handle| handle.id),
        Some(new.id)
    );
    assert!(!supervisor.is_idle());
}

#[tokio::test]
async fn events_for_unknown_handles_are_ignored() {
    let launcher = FakeLauncher::new();
    let (mut supervisor, _events) = supervisor(&launcher);
    supervisor.start(&client_spec()).expect("start");
    let stale = HandleId(999);

    for event in [
        SupervisorEvent::Output {
            kind: ProcessKind::Client,
            id: stale,
            stream: StreamKind::Stdout,
            chunk: b"ghost joined the chat\n".to_vec(),
        },
        SupervisorEvent::SettleElapsed {
            kind: ProcessKind::Client,
            id: stale,
        },
        SupervisorEvent::GraceElapsed {
            kind: ProcessKind::Client,
            id: stale,
        },
        SupervisorEvent::Exited {
            kind: ProcessKind::Client,
            id: stale,
            code: Some(1),
        },
    ] {
        assert!(supervisor.handle_event(event).is_empty());
    }
    assert!(supervisor.is_running(ProcessKind::Client));
    assert_eq!(launcher.kill_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn shutdown_stops_every_worker() {
    let launcher = FakeLauncher::new();
    let (mut supervisor, mut events) = supervisor(&launcher);
    supervisor.start(&server_spec()).expect("server");
    supervisor.start(&client_spec()).expect("client");

    supervisor.shutdown();
    assert_eq!(supervisor.state(ProcessKind::Server), ProcessState::NotStarted);

    let mut stopped = Vec::new();
    while !supervisor.is_idle() {
        let event = events.recv().await.expect("event");
        for notice in supervisor.handle_event(event) {
            if let SupervisorNotice::Stopped { kind, forced, .. } = notice {
                assert!(forced);
                stopped.push(kind);
            }
        }
    }
    stopped.sort_by_key(|kind| kind.as_str());
    assert_eq!(stopped, vec![ProcessKind::Client, ProcessKind::Server]);
    assert_eq!(launcher.kill_count(), 2);
}

#[tokio::test]
async fn output_from_a_stopping_worker_is_not_forwarded() {
    let launcher = FakeLauncher::new();
    let (mut supervisor, mut events) = supervisor(&launcher);
    supervisor.start(&client_spec()).expect("start");
    let mut client = launcher.take(ProcessKind::Client);

    supervisor.stop(ProcessKind::Client, true);
    assert_eq!(client.read_input(6).await, b"/exit\n");
    client.say("mallory joined the chat\n").await;
    client.exit(Some(0));

    let notices = pump_until(&mut supervisor, &mut events, is_exit_notice).await;
    assert_eq!(
        notices,
        vec![SupervisorNotice::Stopped {
            kind: ProcessKind::Client,
            forced: false,
            exit_code: Some(0),
        }]
    );
}

#[tokio::test]
async fn replaced_instance_output_does_not_reach_the_new_one() {
    let launcher = FakeLauncher::new();
    let (mut supervisor, mut events) = supervisor(&launcher);
    supervisor.start(&client_spec()).expect("start");
    let mut old = launcher.take(ProcessKind::Client);
    supervisor.stop(ProcessKind::Client, true);
    supervisor.start(&client_spec()).expect("restart");
    let mut new = launcher.take(ProcessKind::Client);

    old.say("mallory joined the chat\n").await;
    old.exit(Some(0));
    let notices = pump_until(&mut supervisor, &mut events, is_exit_notice).await;
    assert!(!notices
        .iter()
        .any(|notice| matches!(notice, SupervisorNotice::Record { .. })));

    new.say("carol joined the chat\n").await;
    let notices = pump_until(&mut supervisor, &mut events, |notice| {
        matches!(notice, SupervisorNotice::Record { .. })
    })
    .await;
    assert_eq!(
        notices,
        vec![SupervisorNotice::Record {
            kind: ProcessKind::Client,
            stream: StreamKind::Stdout,
            record: "carol joined the chat".to_string(),
        }]
    );
}

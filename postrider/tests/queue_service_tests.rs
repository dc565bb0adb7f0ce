#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::{path::Path, sync::Arc, time::Duration};

use postrider::{
    control_handler::PostriderControlHandler,
    facade::{QueueError, QueueFacade, ReplayReport},
    service,
};
use postrider_common::{DeliveryKind, Envelope, Signal, now_secs};
use postrider_control::{
    ControlClient, ControlServer, QueueCommand, Request, RequestCommand, ResponsePayload,
    SystemCommand, protocol::ResponseData,
};
use postrider_scheduler::{RescheduleSelector, RetryPolicy};
use postrider_store::{EnvelopeStore, StoreError};
use tokio::sync::broadcast;

const NOW: u64 = 1_700_000_000;

fn store_at(root: &Path) -> EnvelopeStore {
    let store = EnvelopeStore::builder()
        .root(root.to_path_buf())
        .build()
        .expect("valid root");
    store.init().expect("init");
    store
}

fn facade_at(root: &Path) -> QueueFacade {
    QueueFacade::new(store_at(root), RetryPolicy::default())
}

fn relay_envelope(sender: &str, recipient: &str, host: &str, created: u64) -> Envelope {
    Envelope::new(sender, recipient, host, DeliveryKind::Mta, 86_400, created)
}

#[test]
fn test_create_commit_deliver_lifecycle() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut queue = facade_at(dir.path());

    let message = queue.create_message().expect("create message");
    let first = queue
        .create_envelope(
            message,
            &relay_envelope("a@example.org", "one@example.net", "example.net", NOW),
            NOW,
        )
        .expect("first envelope");
    let second = queue
        .create_envelope(
            message,
            &relay_envelope("a@example.org", "two@example.net", "example.net", NOW),
            NOW,
        )
        .expect("second envelope");

    let scheduled = queue.commit_message(message, NOW).expect("commit");
    assert_eq!(scheduled, 2);

    assert_eq!(
        queue.next_due(NOW),
        Some(first),
        "creation order decides the head"
    );

    queue.delete_envelope(first).expect("delete first");
    assert_eq!(queue.next_due(NOW), Some(second));
    queue.delete_envelope(second).expect("delete second");

    let stats = queue.stats(NOW);
    assert_eq!(stats.pending, 0);
    assert_eq!(stats.hosts, 0);
    assert_eq!(stats.messages, 0);
    assert_eq!(stats.oldest_creation_time, None);
}

#[test]
fn test_uncommitted_envelopes_stay_invisible() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut queue = facade_at(dir.path());

    let message = queue.create_message().expect("create message");
    let envelope = relay_envelope("a@example.org", "user@example.net", "example.net", NOW);
    let id = queue
        .create_envelope(message, &envelope, NOW)
        .expect("create envelope");

    assert_eq!(queue.next_due(NOW), None);
    assert_eq!(queue.load_envelope(id).expect("load"), None);

    queue.commit_message(message, NOW).expect("commit");

    assert_eq!(queue.load_envelope(id).expect("load"), Some(envelope));
    assert_eq!(queue.next_due(NOW), Some(id));
}

#[test]
fn test_envelope_created_after_commit_is_scheduled() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut queue = facade_at(dir.path());

    let message = queue.create_message().expect("create message");
    let first = queue
        .create_envelope(
            message,
            &relay_envelope("a@example.org", "one@example.net", "example.net", NOW),
            NOW,
        )
        .expect("first envelope");
    queue.commit_message(message, NOW).expect("commit");

    let late = queue
        .create_envelope(
            message,
            &relay_envelope("a@example.org", "late@example.net", "example.net", NOW),
            NOW,
        )
        .expect("late envelope");

    let pending = queue.pending_envelope(late).expect("scheduled without a commit");
    assert_eq!(pending.due_time, NOW);
    assert_eq!(
        queue.load_envelope(late).expect("load").map(|e| e.recipient),
        Some("late@example.net".to_string())
    );

    queue.delete_envelope(first).expect("delete first");
    assert_eq!(queue.next_due(NOW), Some(late), "late arrival serves in turn");

    let stats = queue.stats(NOW);
    assert_eq!(stats.pending, 1);
    assert_eq!(stats.messages, 1);
}

#[test]
fn test_rollback_discards_session() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut queue = facade_at(dir.path());

    let message = queue.create_message().expect("create message");
    queue
        .create_envelope(
            message,
            &relay_envelope("a@example.org", "user@example.net", "example.net", NOW),
            NOW,
        )
        .expect("create envelope");

    assert_eq!(queue.delete_message(message).expect("rollback"), 1);
    assert_eq!(queue.next_due(NOW), None);

    let err = queue
        .commit_message(message, NOW)
        .expect_err("session is gone");
    assert!(
        matches!(err, QueueError::Store(StoreError::MessageNotFound(_))),
        "got {err:?}"
    );
}

#[test]
fn test_envelope_deleted_before_commit_is_not_scheduled() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut queue = facade_at(dir.path());

    let message = queue.create_message().expect("create message");
    let doomed = queue
        .create_envelope(
            message,
            &relay_envelope("a@example.org", "one@example.net", "example.net", NOW),
            NOW,
        )
        .expect("doomed envelope");
    let survivor = queue
        .create_envelope(
            message,
            &relay_envelope("a@example.org", "two@example.net", "example.net", NOW),
            NOW,
        )
        .expect("surviving envelope");

    queue.delete_envelope(doomed).expect("delete before commit");

    assert_eq!(
        queue.commit_message(message, NOW).expect("commit"),
        1,
        "only the surviving envelope is scheduled"
    );
    assert_eq!(queue.next_due(NOW), Some(survivor));
    assert!(queue.pending_envelope(doomed).is_none());

    queue.delete_envelope(survivor).expect("delete survivor");
    assert_eq!(queue.next_due(NOW), None, "nothing lingers at the head");
    assert_eq!(queue.stats(NOW).pending, 0);
}

#[test]
fn test_update_before_commit_stays_unscheduled() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut queue = facade_at(dir.path());

    let message = queue.create_message().expect("create message");
    let envelope = relay_envelope("a@example.org", "user@example.net", "example.net", NOW);
    let id = queue
        .create_envelope(message, &envelope, NOW)
        .expect("create envelope");

    let mut amended = envelope;
    amended.record_attempt(NOW);
    queue.update_envelope(id, &amended, NOW).expect("update");

    assert_eq!(queue.next_due(NOW), None, "still awaiting commit");
    assert!(queue.pending_envelope(id).is_none());

    queue.commit_message(message, NOW).expect("commit");

    let pending = queue.pending_envelope(id).expect("scheduled at commit");
    assert_eq!(
        pending.summary.attempt_count, 1,
        "commit schedules the amended summary"
    );
    assert!(pending.due_time > NOW, "recorded attempt backs the retry off");
    assert_eq!(queue.load_envelope(id).expect("load"), Some(amended));
}

#[test]
fn test_temporary_failure_backs_off_and_reschedule_expedites() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut queue = facade_at(dir.path());

    let message = queue.create_message().expect("create message");
    let id = queue
        .create_envelope(
            message,
            &relay_envelope("a@example.org", "user@example.net", "example.net", NOW),
            NOW,
        )
        .expect("create envelope");
    queue.commit_message(message, NOW).expect("commit");

    let mut envelope = queue.load_envelope(id).expect("load").expect("committed");
    envelope.record_attempt(NOW);
    queue.update_envelope(id, &envelope, NOW).expect("update");

    assert_eq!(queue.next_due(NOW), None, "backed-off envelope is not due");
    let due = queue.head_due_time().expect("still scheduled");
    assert!(due > NOW);

    let reloaded = queue.load_envelope(id).expect("load").expect("committed");
    assert_eq!(reloaded.attempt_count, 1, "attempt history is durable");
    assert_eq!(reloaded.last_attempt_time, NOW);

    assert_eq!(queue.reschedule(RescheduleSelector::All, NOW), 1);
    assert_eq!(queue.next_due(NOW), Some(id), "expedited envelope is due");
}

#[test]
fn test_expired_envelope_bounces_to_sender() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut queue = facade_at(dir.path());

    let created = NOW - 10_000;
    let message = queue.create_message().expect("create message");
    let envelope = Envelope::new(
        "sender@example.org",
        "user@example.net",
        "example.net",
        DeliveryKind::Mta,
        3_600,
        created,
    );
    let id = queue
        .create_envelope(message, &envelope, created)
        .expect("create envelope");
    queue.commit_message(message, created).expect("commit");

    let mut attempted = envelope;
    attempted.record_attempt(NOW);
    queue.update_envelope(id, &attempted, NOW).expect("update");

    assert_eq!(
        queue.load_envelope(id).expect("load"),
        None,
        "expired original is gone"
    );

    let pending = queue.all_envelopes();
    assert_eq!(pending.len(), 1, "only the synthesized report remains");
    let bounce = &pending[0];
    assert_eq!(bounce.summary.kind, DeliveryKind::Bounce);
    assert_eq!(bounce.summary.destination.as_ref(), "bounce");
    assert_ne!(bounce.summary.id.message_id(), message);

    let report = queue
        .load_envelope(bounce.summary.id)
        .expect("load")
        .expect("bounce envelope");
    assert_eq!(report.recipient, "sender@example.org");
    assert_eq!(report.sender, "");
    assert_eq!(report.attempt_count, 0);
}

#[test]
fn test_expiry_before_commit_abandons_the_session() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut queue = facade_at(dir.path());

    let created = NOW - 10_000;
    let message = queue.create_message().expect("create message");
    let envelope = Envelope::new(
        "sender@example.org",
        "user@example.net",
        "example.net",
        DeliveryKind::Mta,
        3_600,
        created,
    );
    let id = queue
        .create_envelope(message, &envelope, created)
        .expect("create envelope");

    queue.update_envelope(id, &envelope, NOW).expect("expire");

    let err = queue
        .commit_message(message, NOW)
        .expect_err("session died with its only envelope");
    assert!(
        matches!(err, QueueError::Store(StoreError::MessageNotFound(_))),
        "got {err:?}"
    );

    let pending = queue.all_envelopes();
    assert_eq!(pending.len(), 1, "only the synthesized report is pending");
    assert_eq!(pending[0].summary.kind, DeliveryKind::Bounce);
}

#[test]
fn test_replay_rebuilds_quarantines_and_expires() {
    let dir = tempfile::tempdir().expect("tempdir");

    let mut seed = facade_at(dir.path());

    let healthy_message = seed.create_message().expect("create message");
    let healthy = seed
        .create_envelope(
            healthy_message,
            &relay_envelope("a@example.org", "user@example.net", "example.net", NOW - 100),
            NOW - 100,
        )
        .expect("create envelope");
    seed.commit_message(healthy_message, NOW - 100).expect("commit");

    let expired_message = seed.create_message().expect("create message");
    seed.create_envelope(
        expired_message,
        &Envelope::new(
            "b@example.org",
            "user@example.org",
            "example.org",
            DeliveryKind::Mta,
            3_600,
            NOW - 7_200,
        ),
        NOW - 7_200,
    )
    .expect("create envelope");
    seed.commit_message(expired_message, NOW - 7_200).expect("commit");

    let corrupt_message = seed.create_message().expect("create message");
    let corrupt = seed
        .create_envelope(
            corrupt_message,
            &relay_envelope("c@example.org", "x@example.net", "example.net", NOW - 100),
            NOW - 100,
        )
        .expect("create envelope");
    let sibling = seed
        .create_envelope(
            corrupt_message,
            &relay_envelope("c@example.org", "y@example.net", "example.net", NOW - 100),
            NOW - 100,
        )
        .expect("create envelope");
    seed.commit_message(corrupt_message, NOW - 100).expect("commit");
    drop(seed);

    // Overwrite one committed blob with bytes the codec cannot read.
    store_at(dir.path())
        .update_envelope(corrupt, b"not an envelope")
        .expect("corrupt blob");

    let mut queue = facade_at(dir.path());
    let report = queue.replay(NOW).expect("replay");

    assert_eq!(
        report,
        ReplayReport {
            loaded: 1,
            expired: 1,
            quarantined: 1,
        }
    );

    assert!(queue.pending_envelope(healthy).is_some());
    assert!(queue.pending_envelope(corrupt).is_none());
    assert!(
        queue.pending_envelope(sibling).is_none(),
        "quarantine takes the whole message"
    );

    let stats = queue.stats(NOW);
    assert_eq!(stats.pending, 2, "healthy survivor plus synthesized bounce");

    let quarantine_dir = dir.path().join("corrupt").join(corrupt_message.to_string());
    assert!(quarantine_dir.is_dir(), "message directory moved aside");
}

#[test]
fn test_paused_kind_skips_delivery_but_stays_counted() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut queue = facade_at(dir.path());

    let message = queue.create_message().expect("create message");
    let relay = queue
        .create_envelope(
            message,
            &relay_envelope("a@example.org", "user@example.net", "example.net", NOW),
            NOW,
        )
        .expect("relay envelope");
    let local = queue
        .create_envelope(
            message,
            &Envelope::new(
                "a@example.org",
                "root",
                "local",
                DeliveryKind::Mda,
                86_400,
                NOW,
            ),
            NOW,
        )
        .expect("local envelope");
    queue.commit_message(message, NOW).expect("commit");

    queue.pause(DeliveryKind::Mta);
    assert_eq!(
        queue.next_due(NOW),
        Some(local),
        "paused relay work is skipped"
    );

    queue.delete_envelope(local).expect("delete local");
    assert_eq!(queue.next_due(NOW), None, "only paused work remains");

    let stats = queue.stats(NOW);
    assert_eq!(stats.pending, 1, "paused envelopes stay pending");
    assert_eq!(stats.paused_kinds, vec![DeliveryKind::Mta]);

    queue.resume(DeliveryKind::Mta);
    assert_eq!(queue.next_due(NOW), Some(relay));
}

#[tokio::test]
async fn test_service_round_trip() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (queue, queue_service) = service::channel(facade_at(dir.path()));

    let (shutdown, _) = broadcast::channel(4);
    let server = tokio::spawn(queue_service.serve(shutdown.subscribe()));

    let message = queue.create_message().await.expect("create message");
    let id = queue
        .create_envelope(
            message,
            relay_envelope("a@example.org", "user@example.net", "example.net", now_secs()),
        )
        .await
        .expect("create envelope");
    assert_eq!(queue.commit_message(message).await.expect("commit"), 1);

    assert_eq!(queue.next_due().await.expect("next due"), Some(id));

    queue.pause(DeliveryKind::Mta).await.expect("pause");
    assert_eq!(queue.next_due().await.expect("next due"), None);

    let stats = queue.stats().await.expect("stats");
    assert_eq!(stats.pending, 1);
    assert_eq!(stats.paused_kinds, vec![DeliveryKind::Mta]);

    shutdown.send(Signal::Shutdown).expect("signal");
    server.await.expect("join").expect("serve");
}

#[tokio::test]
async fn test_control_round_trip() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (queue, queue_service) = service::channel(facade_at(dir.path()));

    let (shutdown, _) = broadcast::channel(4);
    let server = tokio::spawn(queue_service.serve(shutdown.subscribe()));

    let socket = dir.path().join("postrider.sock");
    let socket_path = socket.to_string_lossy().into_owned();
    let handler = Arc::new(PostriderControlHandler::new(queue.clone()));
    let control = ControlServer::new(socket_path.clone(), handler).expect("control server");
    let control_shutdown = shutdown.subscribe();
    let control_task = tokio::spawn(async move { control.serve(control_shutdown).await });

    for _ in 0..200 {
        if socket.exists() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(socket.exists(), "control socket never appeared");

    let message = queue.create_message().await.expect("create message");
    queue
        .create_envelope(
            message,
            relay_envelope("a@example.org", "user@example.net", "example.net", now_secs()),
        )
        .await
        .expect("create envelope");
    queue.commit_message(message).await.expect("commit");

    let client = ControlClient::new(socket_path);

    let response = client
        .send_request(Request::new(RequestCommand::System(SystemCommand::Ping)))
        .await
        .expect("ping");
    assert!(matches!(response.payload, ResponsePayload::Ok));

    let response = client
        .send_request(Request::new(RequestCommand::Queue(QueueCommand::Stats)))
        .await
        .expect("stats request");
    let ResponsePayload::Data(data) = response.payload else {
        panic!("expected data payload");
    };
    let ResponseData::QueueStats(stats) = *data else {
        panic!("expected queue stats");
    };
    assert_eq!(stats.pending, 1);
    assert_eq!(
        stats.by_kind,
        vec![
            ("mda".to_string(), 0),
            ("mta".to_string(), 1),
            ("bounce".to_string(), 0),
        ]
    );

    shutdown.send(Signal::Shutdown).expect("signal");
    server.await.expect("join").expect("serve");
    control_task.await.expect("join").expect("control serve");
}

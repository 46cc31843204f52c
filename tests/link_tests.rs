use dashbus::link::*;
use dashbus::protocol::{Command, Message};
use dashbus::settings::Setting;

fn tel(name: &str, value: f32) -> Message {
    Message::telemetry(name, value).unwrap()
}

/// A link that has come up and finished an (empty) resync.
fn synced_link() -> SerialLink<MemoryWriter> {
    let mut link = SerialLink::new("test", MemoryWriter::new(), LinkConfig::default());
    link.poll(0);
    assert!(link.take_resync());
    link.advance_telemetry(0, true);
    link.poll(1);
    assert_eq!(link.state(), LinkState::Synced);
    link.writer_mut().take_lines();
    link
}

fn count(lines: &[String], wanted: &str) -> usize {
    lines.iter().filter(|l| l.as_str() == wanted).count()
}

#[test]
fn test_first_write_brings_link_up_and_requests_resync() {
    let mut link = SerialLink::new("led", MemoryWriter::new(), LinkConfig::default());
    assert_eq!(link.state(), LinkState::Disconnected);

    // nothing but pings is queued while the link is down
    link.send(Message::SettingSet(Setting::Brightness(40))).unwrap();
    assert_eq!(link.queued(), 0);
    assert_eq!(link.stats().discarded_offline, 1);

    link.poll(0);
    assert_eq!(link.writer().lines(), ["PING".to_string()]);
    assert_eq!(link.state(), LinkState::Syncing);
    assert_eq!(link.stats().reconnects, 1);
    assert!(link.take_resync());
    assert!(!link.take_resync());

    // the replay
    link.send(Message::SettingSet(Setting::Brightness(40))).unwrap();
    link.advance_telemetry(0, true);
    link.poll(10);
    assert_eq!(link.pending_acks(), 1);
    assert_eq!(link.state(), LinkState::Syncing);

    link.on_receive("SETACK:brightness=40", 20);
    assert_eq!(link.pending_acks(), 0);
    assert_eq!(link.state(), LinkState::Synced);
}

#[test]
fn test_ack_must_echo_the_sent_value() {
    let mut link = synced_link();
    link.send(Message::SettingSet(Setting::Brightness(40))).unwrap();
    link.flush(10);

    link.on_receive("SETACK:brightness=41", 20);
    assert_eq!(link.pending_acks(), 1);

    link.on_receive("SETACK:brightness=40", 30);
    assert_eq!(link.pending_acks(), 0);
}

#[test]
fn test_unacked_setting_is_retried_then_link_unsynced() {
    let mut link = synced_link();
    link.send(Message::SettingSet(Setting::Brightness(40))).unwrap();
    link.poll(10);

    let mut now = 10;
    for _ in 0..DEFAULT_MAX_RETRIES {
        now += DEFAULT_ACK_TIMEOUT_MS;
        link.poll(now);
        assert_ne!(link.state(), LinkState::Unsynced);
    }
    now += DEFAULT_ACK_TIMEOUT_MS;
    link.poll(now);

    let lines = link.writer().lines();
    assert_eq!(count(lines, "SET:brightness=40"), 1 + DEFAULT_MAX_RETRIES as usize);
    assert_eq!(link.stats().retries, u32::from(DEFAULT_MAX_RETRIES));
    assert_eq!(link.pending_acks(), 0);
    assert_eq!(link.state(), LinkState::Unsynced);

    // stays unsynced until the peer resets or a resync is asked for
    link.poll(now + 10);
    assert_eq!(link.state(), LinkState::Unsynced);
    link.on_receive("RESET", now + 20);
    assert_eq!(link.state(), LinkState::Syncing);
    assert!(link.take_resync());
    assert_eq!(link.stats().peer_resets, 1);
}

#[test]
fn test_telemetry_coalesces_by_name() {
    let mut link = synced_link();
    link.send(tel("rpm", 1000.0)).unwrap();
    link.send(tel("rpm", 2000.0)).unwrap();
    link.send(tel("speed", 10.0)).unwrap();
    assert_eq!(link.queued(), 2);
    assert_eq!(link.stats().telemetry_coalesced, 1);

    link.flush(5);
    assert_eq!(link.writer().lines(), ["TEL:rpm=2000".to_string(), "TEL:speed=10".to_string()]);
}

#[test]
fn test_newer_setting_replaces_queued_one() {
    let mut link = synced_link();
    link.writer_mut().set_blocked(true);
    link.send(Message::SettingSet(Setting::Brightness(10))).unwrap();
    link.send(Message::SettingSet(Setting::Brightness(20))).unwrap();
    link.send(Message::PatternSelect(1)).unwrap();
    link.send(Message::PatternSelect(2)).unwrap();
    assert_eq!(link.queued(), 2);

    link.writer_mut().set_blocked(false);
    link.flush(5);
    assert_eq!(link.writer().lines(), ["SET:brightness=20".to_string(), "SEQ:2".to_string()]);
}

#[test]
fn test_full_queue_evicts_telemetry_for_critical_lines() {
    let mut link = synced_link();
    link.writer_mut().set_blocked(true);
    for i in 0..OUTPUT_QUEUE_DEPTH {
        link.send(tel(&format!("s{}", i), i as f32)).unwrap();
    }
    assert_eq!(link.queued(), OUTPUT_QUEUE_DEPTH);

    link.send(Message::SettingSet(Setting::Brightness(10))).unwrap();
    assert_eq!(link.queued(), OUTPUT_QUEUE_DEPTH);
    assert_eq!(link.stats().telemetry_dropped, 1);

    link.writer_mut().set_blocked(false);
    link.flush(5);
    let lines = link.writer().lines();
    assert!(!lines.contains(&"TEL:s0=0".to_string()));
    assert_eq!(lines.last().map(String::as_str), Some("SET:brightness=10"));
}

#[test]
fn test_queue_full_of_critical_lines_pushes_back() {
    let mut link = synced_link();
    link.writer_mut().set_blocked(true);
    for _ in 0..OUTPUT_QUEUE_DEPTH {
        link.send(Message::Command(Command::Dim(true))).unwrap();
    }

    assert_eq!(link.send(Message::Command(Command::Mute(true))), Err(nb::Error::WouldBlock));

    // telemetry is simply dropped
    link.send(tel("rpm", 1.0)).unwrap();
    assert_eq!(link.stats().telemetry_dropped, 1);
    assert_eq!(link.queued(), OUTPUT_QUEUE_DEPTH);
}

#[test]
fn test_invalid_message_is_rejected_before_queueing() {
    let mut link = synced_link();
    let result = link.send(tel("rpm", f32::INFINITY));
    assert!(matches!(result, Err(nb::Error::Other(LinkError::Protocol(_)))));
    assert_eq!(link.queued(), 0);
}

#[test]
fn test_ping_is_answered_and_marks_peer_alive() {
    let mut link = synced_link();
    assert!(!link.is_alive(5));

    assert_eq!(link.on_receive("PING", 5), Some(Message::Ping));
    link.flush(5);
    assert_eq!(count(link.writer().lines(), "PONG"), 1);

    assert!(link.is_alive(5 + DEFAULT_LIVENESS_TIMEOUT_MS));
    assert!(!link.is_alive(6 + DEFAULT_LIVENESS_TIMEOUT_MS));
}

#[test]
fn test_pings_follow_the_interval() {
    let mut link = synced_link();
    link.poll(DEFAULT_PING_INTERVAL_MS - 1);
    assert_eq!(count(link.writer().lines(), "PING"), 0);
    link.poll(DEFAULT_PING_INTERVAL_MS);
    assert_eq!(count(link.writer().lines(), "PING"), 1);
}

#[test]
fn test_write_failure_disconnects_and_clears_state() {
    let mut link = synced_link();
    link.send(Message::SettingSet(Setting::Brightness(40))).unwrap();
    link.poll(10);
    assert_eq!(link.pending_acks(), 1);

    link.writer_mut().set_down(true);
    link.send(tel("rpm", 900.0)).unwrap();
    link.flush(20);

    assert_eq!(link.state(), LinkState::Disconnected);
    assert_eq!(link.queued(), 0);
    assert_eq!(link.pending_acks(), 0);
    assert_eq!(link.stats().write_failures, 1);

    link.writer_mut().set_down(false);
    link.poll(DEFAULT_PING_INTERVAL_MS);
    assert_eq!(link.stats().reconnects, 2);
    assert!(link.take_resync());
}

#[test]
fn test_bad_input_is_counted_not_fatal() {
    let mut link = synced_link();
    assert_eq!(link.on_receive("garbage", 0), None);
    assert_eq!(link.stats().parse_errors, 1);

    let mut bytes = format!("TEL:{}=1\n", "x".repeat(80)).into_bytes();
    bytes.extend_from_slice(b"TEL:rpm=1\nPONG\n");
    let messages = link.on_bytes(&bytes, 10);

    assert_eq!(messages, vec![tel("rpm", 1.0), Message::Pong]);
    assert_eq!(link.stats().truncated, 1);
    assert_eq!(link.truncated_lines(), 1);
    assert_eq!(link.state(), LinkState::Synced);
}

#[test]
fn test_syncing_waits_for_the_telemetry_replay() {
    let mut link = SerialLink::new("display", MemoryWriter::new(), LinkConfig::default());
    link.poll(0);
    assert!(link.take_resync());

    // settings acked, but part of the snapshot is still waiting for room
    link.send(Message::SettingSet(Setting::Brightness(40))).unwrap();
    link.send(tel("rpm", 900.0)).unwrap();
    link.advance_telemetry(7, false);
    link.poll(10);
    link.on_receive("SETACK:brightness=40", 20);
    assert_eq!(link.state(), LinkState::Syncing);

    link.send(tel("speed", 12.0)).unwrap();
    link.advance_telemetry(9, true);
    assert_eq!(link.state(), LinkState::Syncing);
    link.flush(30);
    assert_eq!(link.state(), LinkState::Synced);
    assert_eq!(link.telemetry_cursor(), 9);
}

#[test]
fn test_room_check_matches_send() {
    let mut link = synced_link();
    link.writer_mut().set_blocked(true);
    for i in 0..OUTPUT_QUEUE_DEPTH {
        assert!(link.has_room_for(&tel(&format!("s{}", i), 0.0)));
        link.send(tel(&format!("s{}", i), i as f32)).unwrap();
    }
    assert!(!link.has_room_for(&tel("other", 1.0)));
    assert!(link.has_room_for(&tel("s3", 1.0)));
    assert!(!link.has_room_for(&Message::Command(Command::Dim(true))));
}

#[test]
fn test_evicted_telemetry_rewinds_the_cursor() {
    let mut link = synced_link();
    link.advance_telemetry(40, true);
    link.writer_mut().set_blocked(true);
    for i in 0..OUTPUT_QUEUE_DEPTH {
        link.send(tel(&format!("s{}", i), i as f32)).unwrap();
    }
    assert_eq!(link.telemetry_cursor(), 40);

    link.send(Message::SettingSet(Setting::Brightness(10))).unwrap();
    assert_eq!(link.stats().telemetry_dropped, 1);
    assert_eq!(link.telemetry_cursor(), 0);
}

#[test]
fn test_retry_is_only_counted_once_the_resend_is_queued() {
    let mut link = synced_link();
    link.send(Message::SettingSet(Setting::Brightness(40))).unwrap();
    link.poll(10);

    link.writer_mut().set_blocked(true);
    for _ in 0..OUTPUT_QUEUE_DEPTH {
        link.send(Message::Command(Command::Dim(true))).unwrap();
    }

    let mut now = 10;
    for _ in 0..=DEFAULT_MAX_RETRIES {
        now += DEFAULT_ACK_TIMEOUT_MS;
        link.poll(now);
    }
    assert_eq!(link.stats().retries, 0);
    assert_eq!(link.pending_acks(), 1);
    assert_eq!(link.state(), LinkState::Synced);

    link.writer_mut().set_blocked(false);
    // drains the backlog; the resend goes out on the next poll
    link.poll(now + 1);
    link.poll(now + 2);
    assert_eq!(link.stats().retries, 1);
    assert_eq!(count(link.writer().lines(), "SET:brightness=40"), 2);
}

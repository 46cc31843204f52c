use dashbus::protocol::*;
use dashbus::settings::{Setting, Units};

fn telemetry(name: &str, value: f32) -> Message {
    Message::telemetry(name, value).unwrap()
}

#[test]
fn test_parse_each_tag() {
    assert_eq!(Message::parse("TEL:rpm=2000"), telemetry("rpm", 2000.0));
    assert_eq!(Message::parse("TEL:tpms1_kpa=231.5"), telemetry("tpms1_kpa", 231.5));
    assert_eq!(Message::parse("CMD:screen,2"), Message::Command(Command::Screen(2)));
    assert_eq!(Message::parse("CMD:dim,1"), Message::Command(Command::Dim(true)));
    assert_eq!(Message::parse("CMD:mute,off"), Message::Command(Command::Mute(false)));
    assert_eq!(Message::parse("SET:brightness=40"), Message::SettingSet(Setting::Brightness(40)));
    assert_eq!(Message::parse("SETACK:units=imperial"), Message::SettingAck(Setting::Units(Units::Imperial)));
    assert_eq!(Message::parse("SEQ:2"), Message::PatternSelect(2));
    assert_eq!(Message::parse("SEQ?"), Message::PatternQuery);
    assert_eq!(Message::parse("OK:1"), Message::PatternOk(1));
    assert_eq!(Message::parse("PING"), Message::Ping);
    assert_eq!(Message::parse("PONG"), Message::Pong);
    assert_eq!(Message::parse("RESET"), Message::Reset);
}

#[test]
fn test_trailing_line_endings_are_ignored() {
    assert_eq!(Message::parse("PING\r\n"), Message::Ping);
    assert_eq!(Message::parse("SEQ:1\n"), Message::PatternSelect(1));
}

#[test]
fn test_malformed_lines_are_unparseable() {
    let cases = [
        ("", ParseError::Empty),
        ("HELLO", ParseError::UnknownTag),
        ("XYZ:1", ParseError::UnknownTag),
        ("TEL:rpm", ParseError::MissingField),
        ("TEL:=5", ParseError::MissingField),
        ("TEL:rpm=fast", ParseError::BadNumber),
        ("TEL:rpm=NaN", ParseError::BadNumber),
        ("TEL:rpm=inf", ParseError::BadNumber),
        ("TEL:r:pm=1", ParseError::BadName),
        ("SET:volume=3", ParseError::UnknownKey),
        ("SET:brightness=bright", ParseError::BadValue),
        ("SET:brightness=300", ParseError::BadValue),
        ("CMD:launch,1", ParseError::UnknownCommand),
        ("CMD:screen", ParseError::MissingField),
        ("CMD:dim,maybe", ParseError::BadValue),
        ("SEQ:x", ParseError::BadNumber),
        ("TEL:temp=\u{b0}", ParseError::NonAscii),
    ];
    for (line, reason) in cases {
        assert_eq!(Message::parse(line), Message::Unparseable(reason), "line {:?}", line);
    }
}

#[test]
fn test_overlong_line_is_truncated() {
    let line = format!("TEL:{}=1", "a".repeat(MAX_LINE_LEN));
    assert_eq!(Message::parse(&line), Message::Unparseable(ParseError::Truncated));
}

#[test]
fn test_out_of_range_setting_still_parses() {
    // bounds belong to the receiver, not the wire format
    assert_eq!(Message::parse("SET:brightness=150"), Message::SettingSet(Setting::Brightness(150)));
}

#[test]
fn test_encode_wire_forms() {
    let cases = [
        (telemetry("rpm", 2000.0), "TEL:rpm=2000"),
        (telemetry("battery", 13.8), "TEL:battery=13.8"),
        (Message::Command(Command::Screen(3)), "CMD:screen,3"),
        (Message::Command(Command::Dim(true)), "CMD:dim,1"),
        (Message::Command(Command::Mute(false)), "CMD:mute,0"),
        (Message::SettingSet(Setting::ShiftRpm(6800)), "SET:shift_rpm=6800"),
        (Message::SettingAck(Setting::CoolantWarning(110)), "SETACK:coolant_warning=110"),
        (Message::PatternSelect(1), "SEQ:1"),
        (Message::PatternQuery, "SEQ?"),
        (Message::PatternOk(1), "OK:1"),
        (Message::Ping, "PING"),
        (Message::Reset, "RESET"),
    ];
    for (message, wire) in cases {
        assert_eq!(message.encode().unwrap().as_str(), wire);
        assert_eq!(Message::parse(wire), message);
    }
}

#[test]
fn test_encode_rejects_bad_values() {
    assert_eq!(Message::telemetry("bad name", 1.0), Err(ProtocolError::InvalidName));
    let non_finite = Message::telemetry("rpm", f32::NAN).unwrap();
    assert_eq!(non_finite.encode(), Err(ProtocolError::NonFinite));
    assert_eq!(
        Message::Unparseable(ParseError::Empty).encode(),
        Err(ProtocolError::NotEncodable)
    );
}

#[test]
fn test_only_telemetry_is_lossy() {
    assert!(!telemetry("rpm", 1.0).is_critical());
    assert!(Message::SettingSet(Setting::Brightness(10)).is_critical());
    assert!(Message::PatternSelect(0).is_critical());
    assert!(Message::SettingAck(Setting::Brightness(10)).is_critical());
}

#[test]
fn test_line_assembler_splits_stream() {
    let mut assembler = LineAssembler::new();
    let mut lines = Vec::new();
    for b in b"PING\r\n\nTEL:rpm=1\nSEQ?" {
        if let Some(line) = assembler.feed(*b) {
            lines.push(line.unwrap().to_string());
        }
    }
    assert_eq!(lines, vec!["PING".to_string(), "TEL:rpm=1".to_string()]);
    assert_eq!(assembler.pending(), "SEQ?");
}

#[test]
fn test_line_assembler_flags_non_ascii() {
    let mut assembler = LineAssembler::new();
    let mut result = None;
    for b in "TEL:x=\u{e9}\n".as_bytes() {
        result = assembler.feed(*b).or(result);
    }
    assert_eq!(result, Some(Err(ParseError::NonAscii)));
}

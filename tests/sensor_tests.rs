use dashbus::protocol::Message;
use dashbus::sensor::*;
use std::collections::VecDeque;

#[derive(Default)]
struct MockRadio {
    adverts: VecDeque<Advert>,
    fail_start: bool,
    scanning: bool,
    starts: u32,
}

#[derive(Debug)]
struct RadioOff;

impl SensorScanner for MockRadio {
    type Error = RadioOff;

    fn start_scan(&mut self) -> Result<(), RadioOff> {
        self.starts += 1;
        if self.fail_start {
            return Err(RadioOff);
        }
        self.scanning = true;
        Ok(())
    }

    fn next_advert(&mut self) -> nb::Result<Advert, RadioOff> {
        if !self.scanning {
            return Err(nb::Error::WouldBlock);
        }
        self.adverts.pop_front().ok_or(nb::Error::WouldBlock)
    }

    fn stop_scan(&mut self) -> Result<(), RadioOff> {
        self.scanning = false;
        Ok(())
    }
}

fn payload(position: u8, pressure_pa: u32, temp_centi: i32, battery: u8) -> Advert {
    let mut bytes = Advert::new();
    bytes.extend_from_slice(&[0x59, 0x00]).unwrap();
    bytes.extend_from_slice(&[0x80 | position, 0xEA, 0xCA, 0x11, 0x22, 0x33]).unwrap();
    bytes.extend_from_slice(&pressure_pa.to_le_bytes()).unwrap();
    bytes.extend_from_slice(&temp_centi.to_le_bytes()).unwrap();
    bytes.push(battery).unwrap();
    bytes.push(0).unwrap();
    bytes
}

fn value(messages: &[Message], wanted: &str) -> Option<f32> {
    messages.iter().find_map(|m| match m {
        Message::Telemetry { name, value } if name.as_str() == wanted => Some(*value),
        _ => None,
    })
}

#[test]
fn test_decode_payload_fields() {
    let reading = TpmsReading::decode(&payload(2, 231_500, -1250, 87)).unwrap();
    assert_eq!(reading.id, 2);
    assert_eq!(reading.address, [0x82, 0xEA, 0xCA, 0x11, 0x22, 0x33]);
    assert_eq!(reading.pressure_pa, 231_500);
    assert_eq!(reading.pressure_kpa(), 231.5);
    assert_eq!(reading.temperature_c, -12.5);
    assert_eq!(reading.battery_pct, 87);
    assert!(!reading.alarm);
}

#[test]
fn test_wrong_length_is_rejected() {
    assert_eq!(TpmsReading::decode(&[0u8; 10]), Err(SensorError::WrongLength(10)));
    assert_eq!(
        TpmsReading::decode(&[0u8; TPMS_PAYLOAD_LEN + 1]),
        Err(SensorError::WrongLength(TPMS_PAYLOAD_LEN + 1))
    );
}

#[test]
fn test_scan_window_forwards_each_sensor_once() {
    let mut forwarder = SensorForwarder::new(MockRadio::default(), ForwarderConfig::default());

    assert!(forwarder.poll(0).is_empty());
    assert!(forwarder.is_scanning());

    let radio = forwarder.scanner_mut();
    radio.adverts.push_back(payload(1, 220_000, 2100, 90));
    radio.adverts.push_back(payload(1, 221_000, 2150, 90));
    radio.adverts.push_back(payload(3, 240_000, 2500, 75));
    radio.adverts.push_back(Advert::from_slice(&[1, 2, 3]).unwrap());

    assert!(forwarder.poll(100).is_empty());
    let messages = forwarder.poll(DEFAULT_SCAN_WINDOW_MS);

    assert!(!forwarder.is_scanning());
    assert_eq!(messages.len(), 6);
    assert_eq!(value(&messages, "tpms1_kpa"), Some(221.0));
    assert_eq!(value(&messages, "tpms1_temp"), Some(21.5));
    assert_eq!(value(&messages, "tpms3_batt"), Some(75.0));
    assert_eq!(forwarder.stats().decode_errors, 1);
    assert_eq!(forwarder.stats().forwarded, 2);
}

#[test]
fn test_next_cycle_waits_for_the_interval() {
    let mut forwarder = SensorForwarder::new(MockRadio::default(), ForwarderConfig::default());
    forwarder.poll(0);
    forwarder.poll(DEFAULT_SCAN_WINDOW_MS);

    forwarder.poll(DEFAULT_SCAN_WINDOW_MS + DEFAULT_SCAN_INTERVAL_MS - 1);
    assert!(!forwarder.is_scanning());
    forwarder.poll(DEFAULT_SCAN_WINDOW_MS + DEFAULT_SCAN_INTERVAL_MS);
    assert!(forwarder.is_scanning());
    assert_eq!(forwarder.stats().scans, 2);
}

#[test]
fn test_sensor_not_heard_this_cycle_is_not_resent() {
    let mut forwarder = SensorForwarder::new(MockRadio::default(), ForwarderConfig::default());
    forwarder.poll(0);
    forwarder.scanner_mut().adverts.push_back(payload(4, 230_000, 2000, 80));
    let first = forwarder.poll(DEFAULT_SCAN_WINDOW_MS);
    assert_eq!(first.len(), 3);

    let next = DEFAULT_SCAN_WINDOW_MS + DEFAULT_SCAN_INTERVAL_MS;
    forwarder.poll(next);
    let second = forwarder.poll(next + DEFAULT_SCAN_WINDOW_MS);
    assert!(second.is_empty());

    // still shown, just not re-forwarded
    let view = forwarder.view(4, next + DEFAULT_SCAN_WINDOW_MS).unwrap();
    assert!(!view.stale);
    assert_eq!(view.seen_at, DEFAULT_SCAN_WINDOW_MS);
}

#[test]
fn test_views_go_stale() {
    let mut forwarder = SensorForwarder::new(MockRadio::default(), ForwarderConfig::default());
    forwarder.poll(0);
    forwarder.scanner_mut().adverts.push_back(payload(0, 200_000, 1500, 60));
    forwarder.poll(10);

    let seen = forwarder.view(0, 10).unwrap();
    assert_eq!(seen.seen_at, 10);
    assert!(!seen.stale);
    assert!(forwarder.view(0, 10 + DEFAULT_SENSOR_STALE_MS + 1).unwrap().stale);
    assert!(forwarder.view(5, 10).is_none());
    assert_eq!(forwarder.views(10).count(), 1);
}

#[test]
fn test_failed_scan_retries_after_interval() {
    let radio = MockRadio { fail_start: true, ..MockRadio::default() };
    let mut forwarder = SensorForwarder::new(radio, ForwarderConfig::default());

    forwarder.poll(0);
    assert!(!forwarder.is_scanning());
    assert_eq!(forwarder.stats().scan_failures, 1);

    forwarder.poll(100);
    assert_eq!(forwarder.scanner_mut().starts, 1);

    forwarder.scanner_mut().fail_start = false;
    forwarder.poll(DEFAULT_SCAN_INTERVAL_MS);
    assert!(forwarder.is_scanning());
}

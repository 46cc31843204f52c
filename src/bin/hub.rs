//! Host-side hub: replays a candump log as its vehicle bus and serves the LED
//! and display units over TCP, one line protocol connection each.

use clap::{App, Arg};
use dashbus::decoder::Decoder;
use dashbus::frame::{Frame, LoggedFrame};
use dashbus::hub::{Hub, HubConfig, PeripheralId};
use dashbus::link::LineWriter;
use dashbus::listener::{BusEvent, BusListener, ListenerConfig, PassiveBus};
use dashbus::rules;
use dashbus::settings::FileBackend;
use embedded_can::ErrorKind;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, error::TryRecvError, UnboundedReceiver, UnboundedSender};
use tokio::time;
use tracing::{error, info, warn};

const LOOP_PERIOD_MS: u64 = 5;
const STATUS_PERIOD_MS: u64 = 5000;
const DEFAULT_LED_PORT: &str = "7001";
const DEFAULT_DISPLAY_PORT: &str = "7002";

/// Bus fed by the log replay task.
struct ChannelBus {
    rx: UnboundedReceiver<BusEvent>,
}

impl PassiveBus for ChannelBus {
    type Error = ErrorKind;

    fn receive(&mut self) -> nb::Result<Frame, ErrorKind> {
        match self.rx.try_recv() {
            Ok(BusEvent::Frame(frame)) => Ok(frame),
            Ok(BusEvent::Error(kind)) => Err(nb::Error::Other(kind)),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => Err(nb::Error::WouldBlock),
        }
    }

    fn reset(&mut self) -> Result<(), ErrorKind> {
        while self.rx.try_recv().is_ok() {}
        Ok(())
    }
}

#[derive(Debug)]
struct PeerDown;

/// Writes lines to whichever peripheral connection is currently attached.
#[derive(Clone, Default)]
struct PeerWriter {
    tx: Arc<Mutex<Option<UnboundedSender<String>>>>,
}

impl PeerWriter {
    fn attach(&self, tx: UnboundedSender<String>) {
        if let Ok(mut slot) = self.tx.lock() {
            *slot = Some(tx);
        }
    }
}

impl LineWriter for PeerWriter {
    type Error = PeerDown;

    fn write_line(&mut self, line: &str) -> nb::Result<(), PeerDown> {
        let mut slot = self.tx.lock().map_err(|_| nb::Error::Other(PeerDown))?;
        let Some(tx) = slot.as_ref() else {
            return Err(nb::Error::Other(PeerDown));
        };
        if tx.send(format!("{}\n", line)).is_err() {
            *slot = None;
            return Err(nb::Error::Other(PeerDown));
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let matches = App::new("dashbus-hub")
        .version("0.1.0")
        .author("Dashbus Engineering Team")
        .about("Telemetry hub replaying a candump log to LED and display peripherals")
        .arg(Arg::with_name("log").help("candump -l log to replay as the vehicle bus").required(true))
        .arg(
            Arg::with_name("settings")
                .long("settings")
                .value_name("PATH")
                .takes_value(true)
                .default_value("dashbus-settings.json"),
        )
        .arg(
            Arg::with_name("led-port")
                .long("led-port")
                .takes_value(true)
                .default_value(DEFAULT_LED_PORT),
        )
        .arg(
            Arg::with_name("display-port")
                .long("display-port")
                .takes_value(true)
                .default_value(DEFAULT_DISPLAY_PORT),
        )
        .arg(Arg::with_name("loop").long("loop").help("Restart the log when it ends"))
        .get_matches();

    let log_path = matches.value_of("log").ok_or("missing log")?.to_string();
    let settings_path = matches.value_of("settings").unwrap_or("dashbus-settings.json");
    let led_port: u16 = matches.value_of("led-port").unwrap_or(DEFAULT_LED_PORT).parse()?;
    let display_port: u16 = matches.value_of("display-port").unwrap_or(DEFAULT_DISPLAY_PORT).parse()?;
    let repeat = matches.is_present("loop");

    let frames = load_log(&log_path)?;
    info!("loaded {} frames from {}", frames.len(), log_path);

    let led_writer = PeerWriter::default();
    let display_writer = PeerWriter::default();
    let mut hub = Hub::new(
        FileBackend::new(settings_path),
        led_writer.clone(),
        display_writer.clone(),
        HubConfig::default(),
    );

    // one unbound listener per interface; each works out its own bus id
    let mut feeds: BTreeMap<String, UnboundedSender<BusEvent>> = BTreeMap::new();
    for logged in &frames {
        let name = logged.interface.to_string();
        if feeds.contains_key(&name) {
            continue;
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let interface = u8::try_from(feeds.len())?;
        hub.add_listener(BusListener::unbound(
            ChannelBus { rx },
            Decoder::new(&rules::VEHICLE_RULES),
            interface,
            &rules::BUS_SIGNATURES,
            ListenerConfig::default(),
        ));
        info!("listening on {} (iface{})", name, interface);
        feeds.insert(name, tx);
    }

    let (inbound_tx, mut inbound_rx) = mpsc::unbounded_channel::<(PeripheralId, String)>();
    for (peripheral, port, writer) in [
        (PeripheralId::LedUnit, led_port, led_writer),
        (PeripheralId::DisplayUnit, display_port, display_writer),
    ] {
        let inbound = inbound_tx.clone();
        tokio::spawn(async move {
            if let Err(e) = serve_peripheral(peripheral, port, writer, inbound).await {
                error!("{} server error: {}", peripheral, e);
            }
        });
    }

    let replay = tokio::spawn(replay_log(frames, feeds, repeat));

    let started = Instant::now();
    hub.start(0);
    let mut interval = time::interval(Duration::from_millis(LOOP_PERIOD_MS));
    let mut last_status = 0u64;

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
        }
        let now = started.elapsed().as_millis() as u64;

        loop {
            match inbound_rx.try_recv() {
                Ok((peripheral, line)) => {
                    hub.receive_line(peripheral, &line, now);
                }
                Err(_) => break,
            }
        }
        hub.tick(now);

        if now.saturating_sub(last_status) >= STATUS_PERIOD_MS {
            last_status = now;
            info!(
                "status: {} | led {:?} | display {:?}",
                serde_json::to_string(hub.state())?,
                hub.link(PeripheralId::LedUnit).state(),
                hub.link(PeripheralId::DisplayUnit).state()
            );
        }
    }

    hub.stop();
    replay.abort();
    Ok(())
}

fn load_log(path: &str) -> Result<Vec<LoggedFrame>, Box<dyn std::error::Error>> {
    let text = std::fs::read_to_string(path)?;
    let mut frames = Vec::new();
    for line in text.lines().filter(|l| !l.trim().is_empty()) {
        match Frame::from_candump(line) {
            Ok(logged) => frames.push(logged),
            Err(e) => warn!("skipping log line '{}': {}", line, e),
        }
    }
    if frames.is_empty() {
        return Err(format!("no frames in {}", path).into());
    }
    Ok(frames)
}

/// Feed frames to their interface's listener at the recorded pace.
async fn replay_log(frames: Vec<LoggedFrame>, feeds: BTreeMap<String, UnboundedSender<BusEvent>>, repeat: bool) {
    loop {
        let first = frames.first().map_or(0, |f| f.timestamp_us);
        let start = Instant::now();
        for logged in &frames {
            let offset = Duration::from_micros(logged.timestamp_us.saturating_sub(first));
            let elapsed = start.elapsed();
            if offset > elapsed {
                time::sleep(offset - elapsed).await;
            }
            if let Some(tx) = feeds.get(logged.interface.as_str()) {
                let _ = tx.send(BusEvent::Frame(logged.frame.clone()));
            }
        }
        if !repeat {
            info!("log replay finished; buses will go quiet");
            return;
        }
    }
}

async fn serve_peripheral(
    peripheral: PeripheralId,
    port: u16,
    writer: PeerWriter,
    inbound: UnboundedSender<(PeripheralId, String)>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let listener = TcpListener::bind(format!("127.0.0.1:{}", port)).await?;
    info!("{} link on port {}", peripheral, port);

    loop {
        let (stream, addr) = listener.accept().await?;
        info!("{} connected from {}", peripheral, addr);
        let (tx, rx) = mpsc::unbounded_channel();
        writer.attach(tx);
        if let Err(e) = handle_connection(peripheral, stream, rx, &inbound).await {
            warn!("{} connection error: {}", peripheral, e);
        }
        info!("{} disconnected", peripheral);
    }
}

async fn handle_connection(
    peripheral: PeripheralId,
    stream: TcpStream,
    mut outbound: UnboundedReceiver<String>,
    inbound: &UnboundedSender<(PeripheralId, String)>,
) -> std::io::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => match line? {
                Some(line) => {
                    if inbound.send((peripheral, line)).is_err() {
                        return Ok(());
                    }
                }
                None => return Ok(()),
            },
            out = outbound.recv() => match out {
                Some(text) => writer.write_all(text.as_bytes()).await?,
                None => return Ok(()),
            },
        }
    }
}

use clap::{App, AppSettings, Arg, ArgMatches, SubCommand};
use colored::*;
use dashbus::decoder::Decoder;
use dashbus::frame::{BusId, Frame};
use dashbus::led::color::ColorRamp;
use dashbus::led::render::{Pattern, Renderer, DEFAULT_LED_COUNT, MAX_LEDS};
use dashbus::led::zone::{Zone, ZoneBands};
use dashbus::protocol::Message;
use dashbus::rules;
use dashbus::settings::{FileBackend, Setting, SettingKey, SettingsStore};
use dashbus::snapshot::Snapshot;
use std::collections::HashMap;
use std::io::{BufRead, BufReader};

const DEFAULT_SETTINGS_FILE: &str = "dashbus-settings.json";

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let matches = App::new("dashbus")
        .version("0.1.0")
        .author("Dashbus Engineering Team")
        .about("Vehicle telemetry tools: decode bus logs, preview the shift light, edit settings")
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .arg(
            Arg::with_name("format")
                .short("f")
                .long("format")
                .value_name("FORMAT")
                .help("Output format")
                .takes_value(true)
                .possible_values(&["json", "table", "compact"])
                .default_value("table")
                .global(true),
        )
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .long("verbose")
                .help("Log decoder and store activity")
                .global(true),
        )
        .subcommand(
            SubCommand::with_name("decode")
                .about("Decode a candump log with the vehicle rule table")
                .arg(Arg::with_name("log").help("candump -l style log file").required(true))
                .arg(
                    Arg::with_name("summary")
                        .long("summary")
                        .help("Print only the final value of every signal"),
                ),
        )
        .subcommand(
            SubCommand::with_name("zone")
                .about("Classify an rpm/speed reading and preview the LED strip")
                .arg(Arg::with_name("rpm").help("Engine speed").required(true))
                .arg(
                    Arg::with_name("speed")
                        .long("speed")
                        .value_name("KMH")
                        .takes_value(true)
                        .help("Vehicle speed, unknown when omitted"),
                )
                .arg(numeric_arg("shift", "Shift point rpm", "6500"))
                .arg(numeric_arg("redline", "Redline rpm", "7200"))
                .arg(numeric_arg("pattern", "Pattern id (0 outside-in, 1 inside-out, 2 left-to-right)", "0"))
                .arg(numeric_arg("leds", "Strip length", "16"))
                .arg(numeric_arg("at", "Animation time in ms", "0")),
        )
        .subcommand(
            SubCommand::with_name("settings")
                .about("Inspect or edit the hub settings file")
                .setting(AppSettings::SubcommandRequiredElseHelp)
                .arg(
                    Arg::with_name("file")
                        .long("file")
                        .value_name("PATH")
                        .takes_value(true)
                        .default_value(DEFAULT_SETTINGS_FILE)
                        .global(true),
                )
                .subcommand(SubCommand::with_name("show").about("Print every setting"))
                .subcommand(
                    SubCommand::with_name("set")
                        .about("Validate and store one setting")
                        .arg(Arg::with_name("key").required(true))
                        .arg(Arg::with_name("value").required(true)),
                ),
        )
        .subcommand(
            SubCommand::with_name("parse")
                .about("Parse one serial protocol line")
                .arg(Arg::with_name("line").required(true)),
        )
        .get_matches();

    if matches.is_present("verbose") {
        tracing_subscriber::fmt::init();
    }
    let format = matches.value_of("format").unwrap_or("table");

    match matches.subcommand() {
        ("decode", Some(sub)) => handle_decode(sub, format),
        ("zone", Some(sub)) => handle_zone(sub, format),
        ("settings", Some(sub)) => handle_settings(sub, format),
        ("parse", Some(sub)) => handle_parse(sub, format),
        _ => Ok(()),
    }
}

fn numeric_arg<'a>(name: &'a str, help: &'a str, default: &'a str) -> Arg<'a, 'a> {
    Arg::with_name(name)
        .long(name)
        .takes_value(true)
        .help(help)
        .default_value(default)
        .validator(|v| match v.parse::<u64>() {
            Ok(_) => Ok(()),
            Err(_) => Err("must be a non-negative number".into()),
        })
}

fn parse_value<T: std::str::FromStr>(matches: &ArgMatches<'_>, name: &str) -> Result<T, Box<dyn std::error::Error>> {
    let raw = matches.value_of(name).ok_or_else(|| format!("missing --{}", name))?;
    raw.parse().map_err(|_| format!("invalid value for {}: {}", name, raw).into())
}

fn handle_decode(matches: &ArgMatches<'_>, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let path = matches.value_of("log").ok_or("missing log file")?;
    let summary = matches.is_present("summary");
    let reader = BufReader::new(std::fs::File::open(path)?);

    let mut decoder = Decoder::new(&rules::VEHICLE_RULES);
    let mut snapshot = Snapshot::with_stale_after(u64::MAX);
    // interfaces are bound to a bus by the first signature frame seen on them
    let mut buses: HashMap<String, BusId> = HashMap::new();
    let mut bad_lines = 0u32;
    let mut unbound = 0u32;

    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let logged = match Frame::from_candump(&line) {
            Ok(logged) => logged,
            Err(e) => {
                bad_lines += 1;
                if format != "json" {
                    eprintln!("{} {} ({})", "skipped:".yellow(), line, e);
                }
                continue;
            }
        };

        let interface = logged.interface.to_string();
        let bus = match buses.get(&interface) {
            Some(bus) => *bus,
            None => match rules::identify(&rules::BUS_SIGNATURES, logged.frame.frame_id()) {
                Some(bus) => {
                    if format == "table" {
                        println!("{} {} is bus {}", "bound".bright_blue(), interface.bright_white(), bus);
                    }
                    buses.insert(interface, bus);
                    bus
                }
                None => {
                    unbound += 1;
                    continue;
                }
            },
        };

        let now = logged.timestamp_us / 1000;
        let frame = logged.frame.with_bus(bus);
        for signal in decoder.decode(frame.bus(), frame.frame_id(), frame.payload()) {
            snapshot.update(signal.name, signal.value, signal.unit, now)?;
            if summary {
                continue;
            }
            match format {
                "json" => println!(
                    "{}",
                    serde_json::json!({"t_ms": now, "name": signal.name, "value": signal.value, "unit": signal.unit})
                ),
                "compact" => println!("{}={}", signal.name, signal.value),
                _ => println!(
                    "{:>10.3}  {:<16} {:>10.2} {}",
                    logged.timestamp_us as f64 / 1e6,
                    signal.name.bright_white(),
                    signal.value,
                    signal.unit.dimmed()
                ),
            }
        }
    }

    if summary {
        let signals: Vec<_> = snapshot.iter().collect();
        match format {
            "json" => println!("{}", serde_json::to_string_pretty(&signals)?),
            _ => {
                for s in signals {
                    println!("{:<16} {:>10.2} {}", s.name.as_str().bright_white(), s.value, s.unit.dimmed());
                }
            }
        }
    }
    if format != "json" && (bad_lines > 0 || unbound > 0 || decoder.short_rule_count() > 0) {
        eprintln!(
            "{} {} unparseable line(s), {} frame(s) before bus identification, {} rule(s) hit short frames",
            "note:".yellow(),
            bad_lines,
            unbound,
            decoder.short_rule_count()
        );
    }
    Ok(())
}

fn handle_zone(matches: &ArgMatches<'_>, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let rpm: f32 = parse_value(matches, "rpm")?;
    let speed: Option<f32> = match matches.value_of("speed") {
        Some(raw) => Some(raw.parse().map_err(|_| format!("invalid speed: {}", raw))?),
        None => None,
    };
    let shift: u16 = parse_value(matches, "shift")?;
    let redline: u16 = parse_value(matches, "redline")?;
    let pattern_id: u8 = parse_value(matches, "pattern")?;
    let leds: usize = parse_value(matches, "leds")?;
    let at: u64 = parse_value(matches, "at")?;

    let bands = ZoneBands::new(shift, redline);
    if !bands.is_ordered() {
        return Err(format!("bands out of order: shift {} redline {}", shift, redline).into());
    }
    let pattern = Pattern::from_id(pattern_id).ok_or_else(|| format!("unknown pattern {}", pattern_id))?;
    if leds == 0 || leds > MAX_LEDS {
        return Err(format!("strip length must be 1..={} (default {})", MAX_LEDS, DEFAULT_LED_COUNT).into());
    }

    let zone = bands.classify(rpm, speed);
    let mut renderer = Renderer::new(leds);
    renderer.set_pattern(pattern);
    let frame = renderer.render(zone, rpm, &bands, &ColorRamp::for_bands(&bands), at);

    match format {
        "json" => {
            let colors: Vec<[u8; 3]> = frame.iter().map(|c| [c.r, c.g, c.b]).collect();
            println!("{}", serde_json::json!({"zone": zone, "rpm": rpm, "speed": speed, "leds": colors}));
        }
        "compact" => println!("{:?}", zone),
        _ => {
            let label = match zone {
                Zone::Off => "Off".dimmed(),
                Zone::StallWarning => "StallWarning".yellow().bold(),
                Zone::EfficiencyBar => "EfficiencyBar".bright_green(),
                Zone::ShiftWarning => "ShiftWarning".bright_red().bold(),
            };
            println!("{} {} rpm, speed {}", label, rpm, speed.map_or("unknown".to_string(), |s| format!("{} km/h", s)));
            let strip: String = frame
                .iter()
                .map(|c| "██".truecolor(c.r, c.g, c.b).to_string())
                .collect();
            println!("{}", strip);
        }
    }
    Ok(())
}

fn handle_settings(matches: &ArgMatches<'_>, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let path = matches.value_of("file").unwrap_or(DEFAULT_SETTINGS_FILE);
    let mut store = SettingsStore::new(FileBackend::new(path));
    let report = store.load_all();

    match matches.subcommand() {
        ("show", _) => {
            match format {
                "json" => println!("{}", store.settings().to_json_pretty()?),
                _ => {
                    println!("{} {}", "Settings from".dimmed(), path.bright_white());
                    for setting in store.settings().iter() {
                        println!("  {:<14} {}", setting.key().as_str().bright_white(), setting.value_text().bright_cyan());
                    }
                    if report.defaulted > 0 {
                        println!("{} {} value(s) missing or invalid, shown as defaults", "note:".yellow(), report.defaulted);
                    }
                }
            }
            Ok(())
        }
        ("set", Some(sub)) => {
            let key_text = sub.value_of("key").ok_or("missing key")?;
            let value_text = sub.value_of("value").ok_or("missing value")?;
            let key = SettingKey::parse(key_text).ok_or_else(|| {
                let known: Vec<_> = SettingKey::ALL.iter().map(|k| k.as_str()).collect();
                format!("unknown setting '{}', expected one of: {}", key_text, known.join(", "))
            })?;
            let setting = Setting::parse(key, value_text)
                .ok_or_else(|| format!("'{}' is not a valid value for {}", value_text, key))?;

            match store.set(setting) {
                Ok(true) if store.save_failures() > 0 => {
                    Err(format!("{} accepted but could not be written to {}", setting, path).into())
                }
                Ok(true) => {
                    println!("{} {} set to {}", "✅".green(), key.as_str().bright_white(), setting.value_text().bright_cyan());
                    Ok(())
                }
                Ok(false) => {
                    println!("{} {} already {}", "=".dimmed(), key.as_str().bright_white(), setting.value_text());
                    Ok(())
                }
                Err(e) => {
                    println!("{} {}", "❌".red(), e.to_string().bright_red());
                    Err(e.into())
                }
            }
        }
        _ => Ok(()),
    }
}

fn handle_parse(matches: &ArgMatches<'_>, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let line = matches.value_of("line").ok_or("missing line")?;
    let message = Message::parse(line);
    match (format, message) {
        (_, Message::Unparseable(reason)) => {
            println!("{} {:?}", "unparseable:".bright_red(), reason);
        }
        ("compact", message) => println!("{:?}", message),
        (_, message) => {
            let critical = if message.is_critical() { "critical".yellow() } else { "lossy".dimmed() };
            println!("{:?} [{}]", message, critical);
            if let Ok(encoded) = message.encode() {
                println!("{} {}", "wire:".dimmed(), encoded.as_str().bright_cyan());
            }
        }
    }
    Ok(())
}

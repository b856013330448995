use clap::{App, Arg};
use colored::*;
use satchain::fault_injection::{FaultyLink, LinkFaultConfig, LinkFaultCounters};
use satchain::registry::SatelliteSnapshot;
use satchain::transport::TransportStatsSnapshot;
use satchain::{
    AudioChannel, AudioPlayer, Command, Message, NetworkHandle, OperatingMode, Payload,
    PowerReading, Protocol, Satellite, SatelliteConfig, SatelliteHardware,
    SatelliteNetworkManager, StatusDisplay, Transport, TransportConfig,
};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::{info, Level};

const LINK_BUFFER_SIZE: usize = 4096;
const INDUSTRIAL_TYPE: u8 = 1;
const INDUSTRIAL_NAME: &str = "INDUSTRIAL";

struct ConsoleDisplay {
    quiet: bool,
}

impl StatusDisplay for ConsoleDisplay {
    async fn update_status(&self, title: String, subtitle: String) {
        if !self.quiet {
            println!("📟 {} {}", title.bold().cyan(), subtitle);
        }
    }
}

struct ConsoleAudio {
    quiet: bool,
}

impl AudioPlayer for ConsoleAudio {
    async fn play(&self, clip: String, channel: AudioChannel) {
        if !self.quiet {
            println!("🔊 {} ({:?})", clip.yellow(), channel);
        }
    }
}

/// Simulated satellite box: a status counter and a steady power bus.
struct SimHardware {
    position: usize,
    leds: AtomicU8,
    downstream_power: AtomicBool,
}

impl SimHardware {
    fn new(position: usize) -> Self {
        Self {
            position,
            leds: AtomicU8::new(0),
            downstream_power: AtomicBool::new(true),
        }
    }
}

impl SatelliteHardware for SimHardware {
    fn status_bytes(&self) -> Vec<u8> {
        vec![self.position as u8, self.leds.load(Ordering::Relaxed)]
    }

    fn power_readings(&self) -> PowerReading {
        PowerReading {
            input: 19.5,
            bus: 18.2,
            main: 5.0,
        }
    }

    fn downstream_power_enabled(&self) -> bool {
        self.downstream_power.load(Ordering::Relaxed)
    }

    fn cut_downstream_power(&self) {
        self.downstream_power.store(false, Ordering::Relaxed);
    }

    fn handle_command(&self, message: &Message) -> bool {
        match (message.command(), message.payload().as_bytes()) {
            (Command::Led, Some(bytes)) => {
                self.leds.store(bytes.first().copied().unwrap_or(0), Ordering::Relaxed);
                true
            }
            _ => false,
        }
    }

    fn on_mode_change(&self, mode: OperatingMode) {
        info!("satellite #{} now {}", self.position, mode.as_str());
    }

    fn reboot(&self) {
        info!("satellite #{} reboot requested", self.position);
    }
}

struct SimSatellite {
    satellite: Arc<Satellite<SimHardware>>,
    up: Arc<Transport>,
    down: Arc<Transport>,
    tasks: Vec<JoinHandle<()>>,
    faults: Arc<LinkFaultCounters>,
}

impl SimSatellite {
    fn unplug(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.up.shutdown();
        self.down.shutdown();
    }
}

#[derive(Serialize)]
struct LinkReport {
    name: String,
    stats: TransportStatsSnapshot,
    corrupted: u64,
    dropped: u64,
}

#[derive(Serialize)]
struct SimReport {
    duration_s: u64,
    satellites: Vec<SatelliteSnapshot>,
    identities: Vec<Option<String>>,
    links: Vec<LinkReport>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let matches = App::new("chain-sim")
        .version("0.1.0")
        .author("Space Systems Engineering Team")
        .about("🛰️  Satellite chain simulator - core plus daisy-chained satellites over in-memory serial links")
        .arg(
            Arg::with_name("satellites")
                .short("n")
                .long("satellites")
                .value_name("COUNT")
                .help("Number of satellites in the chain")
                .takes_value(true)
                .default_value("3")
                .validator(|v| match v.parse::<usize>() {
                    Ok(n) if (1..=99).contains(&n) => Ok(()),
                    _ => Err("Satellite count must be between 1 and 99".into()),
                }),
        )
        .arg(
            Arg::with_name("duration")
                .short("d")
                .long("duration")
                .value_name("SECS")
                .help("Simulated run time")
                .takes_value(true)
                .default_value("10")
                .validator(|v| match v.parse::<u64>() {
                    Ok(_) => Ok(()),
                    Err(_) => Err("Duration must be a whole number of seconds".into()),
                }),
        )
        .arg(
            Arg::with_name("corrupt")
                .short("c")
                .long("corrupt")
                .value_name("PERCENT")
                .help("Chance that a frame sent upstream gets a flipped bit")
                .takes_value(true)
                .default_value("0")
                .validator(|v| match v.parse::<f32>() {
                    Ok(p) if (0.0..=100.0).contains(&p) => Ok(()),
                    _ => Err("Corruption rate must be between 0 and 100".into()),
                }),
        )
        .arg(
            Arg::with_name("unplug-at")
                .long("unplug-at")
                .value_name("SECS")
                .help("Disconnect the last satellite after this many seconds")
                .takes_value(true)
                .validator(|v| match v.parse::<u64>() {
                    Ok(_) => Ok(()),
                    Err(_) => Err("Unplug time must be a whole number of seconds".into()),
                }),
        )
        .arg(
            Arg::with_name("format")
                .short("f")
                .long("format")
                .value_name("FORMAT")
                .help("Report format")
                .takes_value(true)
                .possible_values(&["json", "table"])
                .default_value("table"),
        )
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .long("verbose")
                .help("Enable verbose output"),
        )
        .get_matches();

    let count: usize = matches.value_of("satellites").unwrap_or("3").parse()?;
    let duration: u64 = matches.value_of("duration").unwrap_or("10").parse()?;
    let corrupt: f32 = matches.value_of("corrupt").unwrap_or("0").parse()?;
    let unplug_at: Option<u64> = matches
        .value_of("unplug-at")
        .map(|v| v.parse::<u64>())
        .transpose()?;
    let json = matches.value_of("format") == Some("json");
    let verbose = matches.is_present("verbose");

    tracing_subscriber::fmt()
        .with_max_level(if verbose { Level::DEBUG } else { Level::WARN })
        .init();

    if !json {
        println!("🛰️  Satellite Chain Simulator");
        println!("============================");
        println!("   Satellites: {}", count);
        println!("   Duration:   {}s", duration);
        if corrupt > 0.0 {
            println!("   Corruption: {}%", corrupt);
        }
    }

    let protocol = Arc::new(Protocol::standard());

    // core <-> sat0 <-> sat1 <-> ... <-> satN-1 <-> (open end)
    let (core_end, mut upstream_end) = tokio::io::duplex(LINK_BUFFER_SIZE);
    let core_transport = Arc::new(Transport::new(
        "core",
        core_end,
        Arc::clone(&protocol),
        TransportConfig::default(),
    ));

    let mut satellites = Vec::with_capacity(count);
    for position in 0..count {
        let (down_end, next_upstream) = tokio::io::duplex(LINK_BUFFER_SIZE);
        let faulty = FaultyLink::new(
            upstream_end,
            LinkFaultConfig {
                seed: 0x1234_5678_9ABC_DEF0 ^ position as u64,
                ..LinkFaultConfig::corrupting(corrupt)
            },
        );
        let faults = faulty.counters();
        let up = Arc::new(Transport::new(
            &format!("sat{}-up", position),
            faulty,
            Arc::clone(&protocol),
            TransportConfig::default(),
        ));
        let down = Arc::new(Transport::new(
            &format!("sat{}-down", position),
            down_end,
            Arc::clone(&protocol),
            TransportConfig::default(),
        ));
        let satellite = Satellite::new(
            INDUSTRIAL_TYPE,
            INDUSTRIAL_NAME,
            Arc::clone(&up),
            Arc::clone(&down),
            Arc::new(SimHardware::new(position)),
            SatelliteConfig::default(),
        )?;
        let tasks = satellite.start();
        satellites.push(SimSatellite {
            satellite,
            up,
            down,
            tasks,
            faults,
        });
        upstream_end = next_upstream;
    }
    // keep the far end open so the last satellite does not see EOF
    let _open_end = upstream_end;

    let manager = SatelliteNetworkManager::new(
        Arc::new(ConsoleDisplay { quiet: json }),
        Arc::new(ConsoleAudio { quiet: json }),
    );
    let network = NetworkHandle::new(manager, Arc::clone(&core_transport));
    let rx_network = network.clone();
    let watchdog_network = network.clone();
    let monitors = [
        tokio::spawn(async move { rx_network.monitor_messages().await }),
        tokio::spawn(async move { watchdog_network.monitor_satellites().await }),
    ];

    network.discover_satellites(INDUSTRIAL_TYPE).await?;
    let queued = network.send_all(Command::Mode, Payload::text("ACTIVE")).await?;
    info!("MODE ACTIVE queued for {} satellite(s)", queued);

    let start = Instant::now();
    let mut ticker = time::interval(Duration::from_secs(1));
    let mut unplugged = false;
    let mut brightness: u8 = 0;
    while start.elapsed() < Duration::from_secs(duration) {
        ticker.tick().await;

        if let (Some(at), false) = (unplug_at, unplugged) {
            if start.elapsed() >= Duration::from_secs(at) {
                if let Some(last) = satellites.last_mut() {
                    if !json {
                        println!("{}", "🔌 Unplugging last satellite".red().bold());
                    }
                    last.unplug();
                }
                unplugged = true;
            }
        }

        brightness = brightness.wrapping_add(32);
        network
            .send_all(Command::Led, Payload::Bytes(vec![brightness, 0, 0, 255]))
            .await?;

        let events = network.manager().lock().await.take_events();
        for event in events {
            if !json {
                println!("⚡ {:?}", event);
            }
        }
    }

    for monitor in &monitors {
        monitor.abort();
    }

    let snapshot = network.manager().lock().await.snapshot(Instant::now());
    let mut identities = Vec::with_capacity(satellites.len());
    let mut links = vec![LinkReport {
        name: core_transport.name().to_string(),
        stats: core_transport.stats(),
        corrupted: 0,
        dropped: 0,
    }];
    for sim in &satellites {
        identities.push(sim.satellite.identity().await.map(|id| id.to_string()));
        let faults = sim.faults.snapshot();
        links.push(LinkReport {
            name: sim.up.name().to_string(),
            stats: sim.up.stats(),
            corrupted: faults.corrupted,
            dropped: faults.dropped,
        });
    }

    let report = SimReport {
        duration_s: duration,
        satellites: snapshot,
        identities,
        links,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_table(&report);
    }

    Ok(())
}

fn print_table(report: &SimReport) {
    println!();
    println!("{}", "📊 Registry".bold());
    println!("{:<6} {:<12} {:<8} {:>10} {:>22}", "ID", "TYPE", "LINK", "SILENT", "POWER (in/bus/main)");
    for sat in &report.satellites {
        let link = if sat.is_active { "UP".green() } else { "DOWN".red() };
        let power = sat
            .power
            .map(|p| format!("{:.1}/{:.1}/{:.1}", p.input, p.bus, p.main))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<6} {:<12} {:<8} {:>8}ms {:>22}",
            sat.id, sat.sat_type_name, link, sat.silent_for_ms, power
        );
    }

    println!();
    println!("{}", "🔗 Links".bold());
    println!(
        "{:<10} {:>6} {:>6} {:>8} {:>8} {:>8} {:>9}",
        "LINK", "SENT", "RECV", "REJECT", "RELAYED", "DROPPED", "CORRUPTED"
    );
    for link in &report.links {
        println!(
            "{:<10} {:>6} {:>6} {:>8} {:>8} {:>8} {:>9}",
            link.name,
            link.stats.frames_sent,
            link.stats.frames_received,
            link.stats.frames_rejected,
            link.stats.frames_relayed,
            link.stats.frames_dropped,
            link.corrupted
        );
    }

    println!();
    for (position, identity) in report.identities.iter().enumerate() {
        match identity {
            Some(id) => println!("   sat{} -> {}", position, id.green()),
            None => println!("   sat{} -> {}", position, "unassigned".yellow()),
        }
    }
    println!("🚀 Simulation finished after {}s", report.duration_s);
}

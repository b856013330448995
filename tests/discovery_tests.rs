use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use satchain::discovery::{id_assign, AssignmentOutcome};
use satchain::registry::PowerReading;
use satchain::*;
use tokio::io::DuplexStream;
use tokio::time::Instant;

fn id(s: &str) -> SatelliteId {
    s.parse().unwrap()
}

/// Pass one ID_ASSIGN down a chain of nodes, the way each satellite forwards it.
/// Returns the HELLO identities in the order they were sent.
fn run_assignment(chain: &mut [Discovery], first: Message) -> Vec<SatelliteId> {
    let mut hellos = Vec::new();
    let mut next = Some(first);
    for node in chain.iter_mut() {
        let Some(msg) = next.take() else { break };
        let AssignmentOutcome { reply, forward, .. } = node.on_id_assign(msg.payload().as_text().unwrap());
        if let Some(reply) = reply {
            assert_eq!(reply.command(), Command::Hello);
            hellos.push(reply.node().unwrap());
        }
        next = forward;
    }
    hellos
}

#[test]
fn test_chain_numbers_in_order() {
    let mut chain: Vec<Discovery> = (0..5).map(|_| Discovery::new(1, "INDUSTRIAL").unwrap()).collect();
    let hellos = run_assignment(&mut chain, id_assign(1, 0));

    let expected: Vec<SatelliteId> = (0..5).map(|i| SatelliteId::new(1, i).unwrap()).collect();
    assert_eq!(hellos, expected);
    for (node, want) in chain.iter().zip(&expected) {
        assert_eq!(node.identity(), Some(*want));
    }
}

#[test]
fn test_mixed_types_number_independently() {
    let types = [1u8, 2, 1, 2, 1];
    let mut chain: Vec<Discovery> = types.iter().map(|&t| Discovery::new(t, "BOX").unwrap()).collect();

    let ones = run_assignment(&mut chain, id_assign(1, 0));
    assert_eq!(ones, vec![id("0100"), id("0101"), id("0102")]);
    assert!(!chain[1].is_identified());
    assert!(!chain[3].is_identified());

    let twos = run_assignment(&mut chain, id_assign(2, 0));
    assert_eq!(twos, vec![id("0200"), id("0201")]);
    assert_eq!(chain[3].identity(), Some(id("0201")));
}

#[test]
fn test_rediscovery_keeps_identities() {
    let mut chain: Vec<Discovery> = (0..3).map(|_| Discovery::new(1, "INDUSTRIAL").unwrap()).collect();
    let first = run_assignment(&mut chain, id_assign(1, 0));
    let second = run_assignment(&mut chain, id_assign(1, 0));
    assert_eq!(first, second);
}

#[test]
fn test_late_joiner_at_tail_gets_next_index() {
    let mut chain: Vec<Discovery> = (0..3).map(|_| Discovery::new(1, "INDUSTRIAL").unwrap()).collect();
    run_assignment(&mut chain, id_assign(1, 0));

    chain.push(Discovery::new(1, "INDUSTRIAL").unwrap());
    let hellos = run_assignment(&mut chain, id_assign(1, 0));
    assert_eq!(hellos.last(), Some(&id("0103")));
    assert_eq!(chain[3].identity(), Some(id("0103")));
}

#[test]
fn test_reset_forgets_identity() {
    let mut node = Discovery::new(3, "ARCADE").unwrap();
    node.on_id_assign("0307");
    assert_eq!(node.identity(), Some(id("0307")));
    node.reset();
    assert!(node.announcement().is_some());
    assert!(node.on_id_assign("0300").claimed);
    assert_eq!(node.identity(), Some(id("0300")));
}

#[test]
fn test_malformed_assignment_ignored() {
    let mut node = Discovery::new(1, "INDUSTRIAL").unwrap();
    for bad in ["", "01", "01000", "xx00", "0a00", "9900"] {
        let out = node.on_id_assign(bad);
        assert!(out.reply.is_none(), "{}", bad);
        assert!(!out.claimed, "{}", bad);
    }
    assert!(!node.is_identified());
}

// Full stack: network manager on the core, three satellites over in-memory links.

#[derive(Default)]
struct QuietDisplay {
    calls: AtomicUsize,
}

impl StatusDisplay for QuietDisplay {
    async fn update_status(&self, _title: String, _subtitle: String) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct QuietAudio;

impl AudioPlayer for QuietAudio {
    async fn play(&self, _clip: String, _channel: AudioChannel) {}
}

#[derive(Default)]
struct BenchHardware {
    modes: Mutex<Vec<OperatingMode>>,
}

impl SatelliteHardware for BenchHardware {
    fn status_bytes(&self) -> Vec<u8> {
        vec![1, 2, 3]
    }

    fn power_readings(&self) -> PowerReading {
        PowerReading { input: 19.5, bus: 18.2, main: 5.0 }
    }

    fn handle_command(&self, _message: &Message) -> bool {
        true
    }

    fn on_mode_change(&self, mode: OperatingMode) {
        self.modes.lock().unwrap().push(mode);
    }

    fn reboot(&self) {}
}

fn transport(name: &str, end: DuplexStream) -> Arc<Transport> {
    Arc::new(Transport::new(name, end, Arc::new(Protocol::standard()), TransportConfig::default()))
}

async fn wait_for<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = Instant::now() + Duration::from_secs(10);
    while !check().await {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_chain_discovery_end_to_end() {
    let (core_end, mut upstream) = tokio::io::duplex(4096);
    let core = transport("core", core_end);

    let config = SatelliteConfig {
        status_interval: Duration::from_millis(200),
        ..SatelliteConfig::default()
    };

    let mut satellites = Vec::new();
    for n in 0..3 {
        let (down_end, next_upstream) = tokio::io::duplex(4096);
        let sat = Satellite::new(
            1,
            "INDUSTRIAL",
            transport(&format!("sat{}-up", n), upstream),
            transport(&format!("sat{}-down", n), down_end),
            Arc::new(BenchHardware::default()),
            config.clone(),
        )
        .unwrap();
        sat.start();
        satellites.push(sat);
        upstream = next_upstream;
    }
    let _tail = transport("tail", upstream);

    let display = Arc::new(QuietDisplay::default());
    let manager = SatelliteNetworkManager::new(Arc::clone(&display), Arc::new(QuietAudio));
    let network = NetworkHandle::new(manager, Arc::clone(&core));

    let monitor = network.clone();
    tokio::spawn(async move { monitor.monitor_messages().await });
    let net = &network;

    // NEW_SAT announcements alone are enough to get everyone numbered
    wait_for("three satellites", || async move { net.manager().lock().await.satellite_count() == 3 }).await;

    for (n, sat) in satellites.iter().enumerate() {
        assert_eq!(sat.identity().await, Some(SatelliteId::new(1, n as u8).unwrap()));
    }
    let mut ids = network.manager().lock().await.satellite_ids();
    ids.sort();
    assert_eq!(ids, vec![id("0100"), id("0101"), id("0102")]);

    // explicit rediscovery starts the registry over and ends with the same identities
    assert!(network.discover_satellites(1).await.unwrap());
    wait_for("rediscovery", || async move { net.manager().lock().await.satellite_count() == 3 }).await;
    for (n, sat) in satellites.iter().enumerate() {
        assert_eq!(sat.identity().await, Some(SatelliteId::new(1, n as u8).unwrap()));
    }

    assert_eq!(network.send_all(Command::Mode, Payload::text("ACTIVE")).await.unwrap(), 3);
    for sat in &satellites {
        wait_for("ACTIVE mode", || async move { sat.mode().await == OperatingMode::Active }).await;
        assert_eq!(*sat.hardware().modes.lock().unwrap(), vec![OperatingMode::Active]);
    }

    wait_for("STATUS from the far end", || async move {
        let manager = net.manager().lock().await;
        let reported = manager
            .get_sat(&id("0102"))
            .is_some_and(|e| e.last_status.as_slice() == [1, 2, 3]);
        reported
    })
    .await;

    assert!(display.calls.load(Ordering::SeqCst) > 0);
    assert_eq!(network.manager().lock().await.stats().unknown_commands, 0);
}

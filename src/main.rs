use clap::Parser;
use log::{info, warn, LevelFilter};
use signal_hook::consts::TERM_SIGNALS;
use signal_hook::iterator::Signals;
use simplelog::{ColorChoice, Config, TermLogger, TerminalMode};
use std::sync::mpsc::{self, TryRecvError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use unetstack::devices::{ethernet, loopback};
use unetstack::drivers::tap::TapDriver;
use unetstack::error::NetError;
use unetstack::net::{NetCore, NetStack};
use unetstack::protocols::arp;
use unetstack::protocols::ip::{self, icmp, IpAddr, IpIface};
use unetstack::utils::byte::hton32;

const LOOPBACK_ADDR: &str = "127.0.0.1";
const LOOPBACK_NETMASK: &str = "255.0.0.0";

#[derive(Debug, Parser)]
#[command(name = "unetstack")]
#[command(about = "Userspace network stack over a Linux TAP device.", long_about = None)]
struct Cli {
    /// TAP interface to attach.
    #[arg(long, default_value = "tap0")]
    tap: String,
    /// Address of the TAP interface.
    #[arg(long, default_value = "192.0.2.2")]
    addr: String,
    #[arg(long, default_value = "255.255.255.0")]
    netmask: String,
    #[arg(long, default_value = "192.0.2.1")]
    gateway: String,
    /// Destination to ping once per second until terminated.
    #[arg(long)]
    ping: Option<String>,
    #[arg(long, default_value = "info")]
    log_level: LevelFilter,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    TermLogger::init(
        cli.log_level,
        Config::default(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    )?;

    let mut stack = NetStack::new();
    let core = Arc::clone(stack.core());
    arp::init(&core)?;
    ip::init(&core)?;
    icmp::init(&core)?;

    let lo = core.device_register(loopback::setup())?;
    core.ip
        .iface_register(IpIface::alloc(&lo, LOOPBACK_ADDR, LOOPBACK_NETMASK)?)?;

    let tap = core.device_register(ethernet::setup(Box::new(TapDriver::new(&cli.tap))))?;
    let iface = core
        .ip
        .iface_register(IpIface::alloc(&tap, &cli.addr, &cli.netmask)?)?;
    core.ip.set_default_gateway(&iface, &cli.gateway)?;

    stack.run();
    info!("stack is up on {} ({})", cli.addr, cli.tap);

    let (stop_tx, stop_rx) = mpsc::channel();
    let pinger = match cli.ping {
        Some(target) => {
            let dst: IpAddr = target.parse()?;
            Some(spawn_pinger(Arc::clone(&core), dst, stop_rx))
        }
        None => None,
    };

    // Wait for termination
    let mut signals = Signals::new(TERM_SIGNALS)?;
    if let Some(signal) = signals.forever().next() {
        info!("received signal {}, terminating", signal);
    }

    let _ = stop_tx.send(());
    if let Some(handle) = pinger {
        let _ = handle.join();
    }
    stack.shutdown();
    Ok(())
}

/// One echo request per second. The first requests usually come back
/// deferred while ARP resolves the gateway; the next tick retries.
fn spawn_pinger(
    core: Arc<NetCore>,
    dst: IpAddr,
    stop: mpsc::Receiver<()>,
) -> thread::JoinHandle<()> {
    let id = rand::random::<u16>();
    thread::spawn(move || {
        let mut seq: u16 = 0;
        loop {
            match stop.try_recv() {
                Ok(_) | Err(TryRecvError::Disconnected) => break,
                Err(TryRecvError::Empty) => {}
            }
            seq = seq.wrapping_add(1);
            let values = hton32((id as u32) << 16 | seq as u32);
            let payload: Vec<u8> = (0..48u8).collect();
            match icmp::output(
                &core,
                icmp::ICMP_TYPE_ECHO,
                0,
                values,
                &payload,
                IpAddr::ANY,
                dst,
            ) {
                Ok(_) => info!("echo request to {}, id={} seq={}", dst, id, seq),
                Err(NetError::Unresolved(_)) => info!("echo request deferred, arp pending"),
                Err(err) => warn!("echo request failure: {}", err),
            }
            thread::sleep(Duration::from_secs(1));
        }
    })
}

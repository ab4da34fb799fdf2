use std::io::BufRead;
use std::net::{IpAddr, SocketAddr, TcpListener};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use ra_mutex::config::{PeerMap, ServiceTime};
use ra_mutex::net::tcp::{PeerService, ResourceService, Server};
use ra_mutex::net::{Client, TcpBus};
use ra_mutex::order::PeerId;
use ra_mutex::peer::Peer;
use ra_mutex::sync::{ResourceServer, RicartAgrawala};

/// Runs a resource and N peers competing for it, each on its own local port.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    /// Number of peers
    #[arg(short = 'n', long, default_value_t = 3)]
    peers: u32,
    #[arg(long, default_value = "127.0.0.1")]
    host: IpAddr,
    /// Resource port; peers take the ones right after it
    #[arg(long, default_value_t = 18812)]
    base_port: u16,
    /// Upper bound of the pause between two requests, in seconds
    #[arg(long, default_value_t = 5)]
    think_time: u64,
    /// Upper bound of the critical section, in seconds
    #[arg(long, default_value_t = 10)]
    service_time: u64,
    #[arg(short, long)]
    verbose: bool,
}

const HELP: &str = "commands: list | time-p <secs> | time-cs <secs> | exit";

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level)),
        )
        .init();

    let resource_addr = SocketAddr::new(cli.host, cli.base_port);
    let peers = PeerMap::new(
        (0..cli.peers)
            .map(|i| {
                let port = u16::try_from(i + 1)
                    .ok()
                    .and_then(|i| cli.base_port.checked_add(i))
                    .with_context(|| format!("no port left for peer {i}"))?;
                Ok((PeerId(i), SocketAddr::new(cli.host, port)))
            })
            .collect::<anyhow::Result<Vec<_>>>()?,
    );

    let resource = Arc::new(ResourceServer::new(ServiceTime::new(
        ServiceTime::RESOURCE_FLOOR,
        Duration::from_secs(cli.service_time),
    )?));
    let listener = TcpListener::bind(resource_addr)
        .with_context(|| format!("binding resource to {resource_addr}"))?;
    let resource_server = Server::spawn(listener, Arc::new(ResourceService::new(resource)))?;

    let think_time = ServiceTime::new(ServiceTime::PEER_FLOOR, Duration::from_secs(cli.think_time))?;
    let mut servers = Vec::new();
    for (id, addr) in peers.iter() {
        let core = Arc::new(RicartAgrawala::new(id, peers.others(id)?));
        let bus = TcpBus::new(id, peers.clone())?;
        let peer = Arc::new(
            Peer::new(core, bus, Client::new(resource_addr)).with_think_time(think_time),
        );
        let listener =
            TcpListener::bind(addr).with_context(|| format!("binding {id} to {addr}"))?;
        let server = Server::spawn(listener, Arc::new(PeerService::new(peer.clone())))?;

        // Shutting the endpoint down also ends the request loop
        let stop = server.handle().stop_signal().clone();
        std::thread::spawn(move || peer.run(&stop));
        servers.push(server);
    }

    println!("{HELP}");
    for line in std::io::stdin().lock().lines() {
        match command(&line?, &peers, resource_addr) {
            Ok(true) => continue,
            Ok(false) => break,
            Err(e) => println!("error: {e:#}"),
        }
    }

    info!("shutting down");
    for server in servers {
        server.shut_down();
        server.join();
    }
    resource_server.shut_down();
    resource_server.join();
    Ok(())
}

// false once the user asked to exit
fn command(line: &str, peers: &PeerMap, resource: SocketAddr) -> anyhow::Result<bool> {
    let words: Vec<_> = line.split_whitespace().collect();
    match words.as_slice() {
        [] => {}
        ["list"] => {
            for (id, addr) in peers.iter() {
                let client = Client::new(addr);
                match client.state().and_then(|s| Ok((s, client.time()?))) {
                    Ok((state, time)) => println!("{id}, {state:?}, time {time}"),
                    Err(e) => println!("{id}, unreachable: {e}"),
                }
            }
        }
        ["time-p", t] => {
            let t = secs(t)?;
            for (id, addr) in peers.iter() {
                Client::new(addr)
                    .set_service_time(t)
                    .with_context(|| format!("setting think time of {id}"))?;
            }
        }
        ["time-cs", t] => {
            Client::new(resource)
                .set_service_time(secs(t)?)
                .context("setting resource service time")?;
        }
        ["exit"] => return Ok(false),
        _ => bail!("{HELP}"),
    }
    Ok(true)
}

fn secs(s: &str) -> anyhow::Result<Duration> {
    let t: u64 = s.parse().with_context(|| format!("{s:?} is not a number of seconds"))?;
    Ok(Duration::from_secs(t))
}

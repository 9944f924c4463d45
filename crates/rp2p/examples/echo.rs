//! An echo node: serves `/echo/1.0.0` and optionally echoes one message through a remote node.
//!
//! ```text
//! cargo run --example echo -- --listen /ip4/127.0.0.1/tcp/4001
//! cargo run --example echo -- --peer /ip4/127.0.0.1/tcp/4001/p2p/<peer_id> --message hello
//! ```
use std::io;

use clap::Parser;
use futures::{AsyncReadExt, AsyncWriteExt};
use rp2p::{
    multiaddr::{Multiaddr, Protocol},
    tcp_yamux_switch, Connection, PeerInfo,
};

const ECHO: &str = "/echo/1.0.0";

fn clap_parse_multiaddr(s: &str) -> Result<Vec<Multiaddr>, String> {
    let addrs = s
        .split(';')
        .map(Multiaddr::try_from)
        .collect::<Result<Vec<Multiaddr>, rp2p::multiaddr::Error>>()
        .map_err(|err| err.to_string())?;

    Ok(addrs)
}

type Multiaddrs = Vec<Multiaddr>;

#[derive(Parser, Debug)]
#[command(
    version,
    about,
    long_about = "This is a rp2p-based echo node, listening on tcp with yamux stream multiplexing"
)]
struct Echo {
    /// The listen addresses, separated by `;`
    #[arg(short, long, value_parser = clap_parse_multiaddr, default_value = "/ip4/127.0.0.1/tcp/0")]
    listen: Multiaddrs,

    /// A remote echo node, must end with `/p2p/<peer_id>`.
    #[arg(short, long)]
    peer: Option<Multiaddr>,

    /// The message sent to `peer`.
    #[arg(short, long, default_value = "hello rp2p")]
    message: String,

    /// Use verbose output
    #[arg(short, long, default_value_t = false)]
    verbose: bool,
}

async fn echo(_protocol: String, mut conn: Connection) {
    let mut buf = vec![0; 1024];

    loop {
        let read_size = match conn.read(&mut buf).await {
            Ok(0) => return,
            Ok(read_size) => read_size,
            Err(err) => {
                log::error!("{:?}, echo stopped with error: {}", conn, err);
                return;
            }
        };

        if let Err(err) = conn.write_all(&buf[..read_size]).await {
            log::error!("{:?}, echo stopped with error: {}", conn, err);
            return;
        }
    }
}

fn to_peer_info(mut raddr: Multiaddr) -> io::Result<PeerInfo> {
    match raddr.pop() {
        Some(Protocol::P2p(peer_id)) => Ok(PeerInfo::new(peer_id).with_multiaddrs([raddr])),
        _ => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "peer address must end with /p2p/<peer_id>",
        )),
    }
}

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        log::error!("Echo exit with error: {:#?}", err);
    }
}

async fn run() -> io::Result<()> {
    let config = Echo::parse();

    let level = if config.verbose {
        log::LevelFilter::Trace
    } else {
        log::LevelFilter::Info
    };

    pretty_env_logger::formatted_timed_builder()
        .filter_level(level)
        .init();

    let switch = tcp_yamux_switch(PeerInfo::random().with_multiaddrs(config.listen))?;

    switch.handle(ECHO, echo);

    switch.start().await?;

    let local = switch.local_peer_info();

    for laddr in local.multiaddrs() {
        log::info!("Echo node listening on {}/p2p/{}", laddr, local.id());
    }

    if let Some(raddr) = config.peer {
        let peer = to_peer_info(raddr)?;

        let mut conn = switch.dial(&peer, ECHO).await?;

        conn.write_all(config.message.as_bytes()).await?;

        let mut buf = vec![0; config.message.len()];

        conn.read_exact(&mut buf).await?;

        log::info!("echo from {}: {}", peer.id(), String::from_utf8_lossy(&buf));

        switch.stop().await?;

        return Ok(());
    }

    tokio::signal::ctrl_c().await?;

    switch.stop().await?;

    Ok(())
}

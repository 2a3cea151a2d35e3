use netmgr_core::config::{default_config, load_config};
use netmgr_core::{Handle, Manager, NetResult};

use anyhow::Result;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Parser, Debug)]
struct Args {
    #[clap(short, long, parse(from_os_str), value_name = "FILE")]
    config: Option<PathBuf>,
    /// UDP and TCP-DNS listen address
    #[clap(short, long, default_value = "127.0.0.1:5300")]
    listen: SocketAddr,
    /// Stop after this many seconds instead of waiting for Ctrl-C
    #[clap(short, long)]
    duration: Option<u64>,
}

fn echo(handle: &Handle, result: NetResult<&[u8]>) {
    match result {
        Ok(msg) => handle.send(msg, |handle, result| {
            if let Err(e) = result {
                log::debug!("Reply to {:?} failed: {}", handle.peer_addr(), e);
            }
        }),
        Err(e) => log::debug!("Receive from {:?} ended: {}", handle.peer_addr(), e),
    }
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();
    let config = match &args.config {
        Some(path) => load_config(path)?,
        None => default_config(),
    };

    let is_running = Arc::new(AtomicBool::new(true));
    let r = Arc::clone(&is_running);
    ctrlc::set_handler(move || {
        r.store(false, Ordering::Relaxed);
    })?;

    let mgr = Manager::from_config(&config);
    let udp = mgr.listen_udp(args.listen, echo)?;
    let tcpdns = mgr.listen_tcpdns(
        args.listen,
        echo,
        |handle| {
            log::info!("TCP-DNS connection from {:?}", handle.peer_addr());
            Ok(())
        },
        None,
    )?;
    log::info!(
        "Echoing on udp {:?} and tcp {:?} with {} workers",
        udp.local_addr(),
        tcpdns.local_addr(),
        mgr.nworkers()
    );

    let deadline = args.duration.map(|secs| Instant::now() + Duration::from_secs(secs));
    while is_running.load(Ordering::Relaxed) {
        if deadline.map_or(false, |d| Instant::now() >= d) {
            break;
        }
        std::thread::sleep(Duration::from_millis(100));
    }

    log::info!("Shutting down");
    mgr.stats().dump();
    drop(udp);
    drop(tcpdns);
    mgr.destroy();
    Ok(())
}

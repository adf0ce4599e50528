//! send-probe - simulated field probe fleet
//!
//! Spawns one sender per simulated device, each uploading a random image
//! from the source path to the station on its own interval. Useful for
//! exercising a station end to end without hardware.

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;

use trapnet::uid::PRODUCTION_SUFFIX;
use trapnet::{envelope, SenderClient, SenderConfig, StationConfig};

#[derive(Parser, Debug)]
#[command(name = "send-probe", about = "Simulate a fleet of field probes")]
struct Args {
    /// Station address.
    #[arg(long, default_value = "127.0.0.1:8000")]
    server: String,

    /// Image file or directory of images to send from.
    #[arg(long)]
    source: PathBuf,

    /// Device types to simulate.
    #[arg(long, value_delimiter = ',', default_value = "FL,YL")]
    types: Vec<String>,

    /// Devices per type.
    #[arg(long, default_value_t = 8)]
    per_type: u32,

    /// Seconds between sends per device.
    #[arg(long, default_value_t = 10)]
    interval_secs: u64,

    /// Connect attempts per send.
    #[arg(long, default_value_t = 3)]
    max_retries: u32,

    /// First backoff delay in milliseconds.
    #[arg(long, default_value_t = 1000)]
    base_delay_ms: u64,

    /// Shared key (hex or raw 32 bytes); defaults to the station default.
    #[arg(long, env = "STATION_SHARED_KEY")]
    key: Option<String>,

    /// Send a single frame per device, then exit.
    #[arg(long)]
    once: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let key = match &args.key {
        Some(raw) => envelope::key_from_config(raw)?,
        None => StationConfig::defaults().key()?,
    };

    let stop = Arc::new(AtomicBool::new(false));
    let stop_handler = stop.clone();
    ctrlc::set_handler(move || {
        stop_handler.store(true, std::sync::atomic::Ordering::SeqCst);
    })?;

    let mut handles = Vec::new();
    for type_code in &args.types {
        for number in 1..=args.per_type {
            let uid = format!(
                "AA{}-{:06}-{}",
                type_code.to_uppercase(),
                number,
                PRODUCTION_SUFFIX
            );
            let cfg = SenderConfig {
                uid: uid.clone(),
                server_addr: args.server.clone(),
                source: args.source.clone(),
                send_interval: Duration::from_secs(args.interval_secs),
                max_retries: args.max_retries,
                base_delay: Duration::from_millis(args.base_delay_ms),
                ..SenderConfig::default()
            };
            let stop = stop.clone();
            let once = args.once;
            handles.push(std::thread::spawn(move || {
                let mut client = SenderClient::new(cfg, key);
                if once {
                    if let Err(err) = client.send_once() {
                        log::error!("sender {} failed: {:#}", uid, err);
                    }
                } else {
                    client.run(&stop);
                }
            }));
        }
    }

    log::info!(
        "{} sender(s) running against {}",
        handles.len(),
        args.server
    );
    for handle in handles {
        let _ = handle.join();
    }
    Ok(())
}

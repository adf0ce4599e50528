//! Probe-side sender.
//!
//! Mirrors the station protocol from the device side: every send opens a
//! connection, transmits exactly one encrypted frame and closes. Connect
//! attempts back off exponentially (`base * 2^(attempt-1)`) up to a
//! bounded retry count; when a send gives up, the outer interval loop
//! tries again from scratch at the next tick. A write failure mid-frame
//! half-closes the socket and retries the whole send once immediately.
//!
//! The payload is one image chosen at random from the configured source,
//! which may be a single file or a directory.

use std::io::Write;
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use rand::seq::SliceRandom;

use crate::envelope;
use crate::wire;

const SOURCE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "bmp", "mp4", "avi", "mkv", "webm"];

#[derive(Clone, Debug)]
pub struct SenderConfig {
    /// Full device UID, e.g. `AAFL-000007-CAFAF`.
    pub uid: String,
    /// Station address, `host:port`.
    pub server_addr: String,
    /// Image file or directory of images to send from.
    pub source: PathBuf,
    /// Interval between sends.
    pub send_interval: Duration,
    /// Connect attempts per send before giving up until the next tick.
    pub max_retries: u32,
    /// First backoff delay; doubles per failed attempt.
    pub base_delay: Duration,
    pub connect_timeout: Duration,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            uid: String::new(),
            server_addr: "127.0.0.1:8000".to_string(),
            source: PathBuf::new(),
            send_interval: Duration::from_secs(10),
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(30),
        }
    }
}

/// Telemetry from the most recent connect cycle.
#[derive(Clone, Debug, Default)]
pub struct ConnectStats {
    /// Connect attempts made (successful attempt included).
    pub attempts: u32,
    /// Backoff delays slept between failed attempts, in order.
    pub delays: Vec<Duration>,
}

pub struct SenderClient {
    cfg: SenderConfig,
    key: [u8; envelope::KEY_LEN],
    last_connect: ConnectStats,
}

impl SenderClient {
    pub fn new(cfg: SenderConfig, key: [u8; envelope::KEY_LEN]) -> Self {
        Self {
            cfg,
            key,
            last_connect: ConnectStats::default(),
        }
    }

    /// Stats from the most recent connect cycle.
    pub fn last_connect(&self) -> &ConnectStats {
        &self.last_connect
    }

    /// Periodic send loop; returns when `stop` flips.
    pub fn run(&mut self, stop: &AtomicBool) {
        while !stop.load(Ordering::SeqCst) {
            if let Err(err) = self.send_once() {
                log::error!("sender {} send failed: {:#}", self.cfg.uid, err);
            }
            sleep_interruptible(self.cfg.send_interval, stop);
        }
        log::info!("sender {} stopped", self.cfg.uid);
    }

    /// Transmit one frame, retrying the whole send once on a mid-frame
    /// write failure.
    pub fn send_once(&mut self) -> Result<()> {
        let payload = self.choose_payload()?;
        let sealed = envelope::seal(&self.key, &payload)?;
        let bytes = wire::encode_frame(&self.cfg.uid, &sealed.nonce, &sealed.tag, &sealed.ciphertext);

        match self.transmit(&bytes) {
            Ok(()) => Ok(()),
            Err(err) => {
                log::warn!(
                    "sender {} mid-frame failure ({:#}), retrying once",
                    self.cfg.uid,
                    err
                );
                self.transmit(&bytes)
            }
        }
    }

    fn transmit(&mut self, bytes: &[u8]) -> Result<()> {
        let mut stream = self.connect_with_backoff()?;
        match stream.write_all(bytes).and_then(|_| stream.flush()) {
            Ok(()) => {
                // One frame per connection; we close after sending.
                let _ = stream.shutdown(Shutdown::Write);
                log::info!(
                    "sender {} delivered {} byte(s) to {}",
                    self.cfg.uid,
                    bytes.len(),
                    self.cfg.server_addr
                );
                Ok(())
            }
            Err(err) => {
                let _ = stream.shutdown(Shutdown::Write);
                drop(stream);
                Err(err).context("writing frame")
            }
        }
    }

    /// Connect with exponential backoff, recording attempt telemetry.
    fn connect_with_backoff(&mut self) -> Result<TcpStream> {
        let addr = resolve(&self.cfg.server_addr)?;
        let max_retries = self.cfg.max_retries.max(1);
        self.last_connect = ConnectStats::default();

        for attempt in 1..=max_retries {
            self.last_connect.attempts = attempt;
            match TcpStream::connect_timeout(&addr, self.cfg.connect_timeout) {
                Ok(stream) => {
                    log::info!(
                        "sender {} connected to {} (attempt {}/{})",
                        self.cfg.uid,
                        self.cfg.server_addr,
                        attempt,
                        max_retries
                    );
                    return Ok(stream);
                }
                Err(err) => {
                    log::error!(
                        "sender {} connect to {} failed (attempt {}/{}): {}",
                        self.cfg.uid,
                        self.cfg.server_addr,
                        attempt,
                        max_retries,
                        err
                    );
                    if attempt < max_retries {
                        let delay = self.cfg.base_delay * 2u32.pow(attempt - 1);
                        self.last_connect.delays.push(delay);
                        std::thread::sleep(delay);
                    }
                }
            }
        }
        Err(anyhow!(
            "could not reach {} after {} attempts",
            self.cfg.server_addr,
            max_retries
        ))
    }

    /// Read the configured file, or a random image from the configured
    /// directory.
    fn choose_payload(&self) -> Result<Vec<u8>> {
        let source = &self.cfg.source;
        if source.is_file() {
            return std::fs::read(source)
                .with_context(|| format!("reading {}", source.display()));
        }
        if source.is_dir() {
            let images = crate::storage::files_with_extensions(source, SOURCE_EXTENSIONS)?;
            let chosen = images
                .choose(&mut rand::thread_rng())
                .ok_or_else(|| anyhow!("no images in {}", source.display()))?;
            return std::fs::read(chosen)
                .with_context(|| format!("reading {}", chosen.display()));
        }
        Err(anyhow!("sender source {} does not exist", source.display()))
    }
}

fn resolve(addr: &str) -> Result<SocketAddr> {
    addr.to_socket_addrs()
        .with_context(|| format!("resolving {}", addr))?
        .next()
        .ok_or_else(|| anyhow!("{} resolved to no addresses", addr))
}

fn sleep_interruptible(total: Duration, stop: &AtomicBool) {
    let step = Duration::from_millis(100);
    let mut remaining = total;
    while !remaining.is_zero() {
        if stop.load(Ordering::SeqCst) {
            return;
        }
        let chunk = remaining.min(step);
        std::thread::sleep(chunk);
        remaining = remaining.saturating_sub(chunk);
    }
}

//! Ingestion server.
//!
//! One listening socket, one frame per connection, served synchronously:
//! decode the frame, decrypt-and-verify the payload, write it into the
//! type's incoming directory, update the registry and wake the pipeline.
//! A failed bind keeps the server in a retrying unbound state instead of
//! crashing, and no single connection error ever takes down the accept
//! loop.
//!
//! Authentication failure on a frame is deliberately non-fatal: the
//! station still writes whatever was recovered (usually zero bytes) and
//! completes the connection, trading strictness for availability.

use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use chrono::Local;

use crate::config::StationConfig;
use crate::context::{lock_unpoisoned, MediaClass, RuntimeContext};
use crate::envelope;
use crate::storage;
use crate::uid::DeviceUid;
use crate::wire;

const ACCEPT_POLL: Duration = Duration::from_millis(50);
const CONNECTION_READ_TIMEOUT: Duration = Duration::from_secs(30);

pub struct IngestServer {
    cfg: StationConfig,
    key: [u8; envelope::KEY_LEN],
    ctx: Arc<RuntimeContext>,
}

/// Running server handle. `stop` requests a runtime-wide stop and joins
/// the accept loop.
pub struct ServerHandle {
    /// Bound address, when the first bind attempt succeeded.
    pub addr: Option<SocketAddr>,
    ctx: Arc<RuntimeContext>,
    join: Option<JoinHandle<()>>,
}

impl ServerHandle {
    pub fn stop(mut self) -> Result<()> {
        self.ctx.request_stop();
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("ingest server thread panicked"))?;
        }
        Ok(())
    }
}

impl IngestServer {
    pub fn new(cfg: StationConfig, ctx: Arc<RuntimeContext>) -> Result<Self> {
        let key = cfg.key()?;
        Ok(Self { cfg, key, ctx })
    }

    /// Bind (or begin retrying to bind) and run the accept loop on its own
    /// thread.
    pub fn spawn(self) -> Result<ServerHandle> {
        let listener = match bind(&self.cfg.listen_addr) {
            Ok(listener) => Some(listener),
            Err(err) => {
                log::error!(
                    "listening on {} failed, will keep retrying: {:#}",
                    self.cfg.listen_addr,
                    err
                );
                None
            }
        };
        let addr = listener.as_ref().and_then(|l| l.local_addr().ok());
        let ctx = self.ctx.clone();

        let join = std::thread::spawn(move || {
            self.run(listener);
        });

        Ok(ServerHandle {
            addr,
            ctx,
            join: Some(join),
        })
    }

    fn run(self, mut listener: Option<TcpListener>) {
        while !self.ctx.should_stop() {
            let bound = match &listener {
                Some(bound) => bound,
                None => {
                    // Still unbound; retry on the poll interval.
                    std::thread::sleep(self.cfg.loop_delay);
                    match bind(&self.cfg.listen_addr) {
                        Ok(fresh) => {
                            log::info!("now listening on {}", self.cfg.listen_addr);
                            listener = Some(fresh);
                            continue;
                        }
                        Err(err) => {
                            log::error!("bind retry on {} failed: {:#}", self.cfg.listen_addr, err);
                            continue;
                        }
                    }
                }
            };

            match bound.accept() {
                Ok((stream, peer)) => {
                    let started = Instant::now();
                    if let Err(err) = self.serve_connection(stream, peer) {
                        log::error!("error serving connection from {}: {:#}", peer, err);
                    } else {
                        log::debug!(
                            "connection from {} served in {:.1?}",
                            peer,
                            started.elapsed()
                        );
                    }
                    std::thread::sleep(self.cfg.loop_delay);
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(ACCEPT_POLL.min(self.cfg.accept_timeout));
                }
                Err(err) => {
                    // Listener broke underneath us; rebuild it.
                    log::error!("accept failed on {}: {}", self.cfg.listen_addr, err);
                    listener = None;
                }
            }
        }
        log::info!("ingest server stopped");
    }

    /// Serve a single connection to completion: one frame, one file.
    fn serve_connection(&self, mut stream: TcpStream, peer: SocketAddr) -> Result<()> {
        stream
            .set_read_timeout(Some(CONNECTION_READ_TIMEOUT))
            .context("setting connection read timeout")?;
        log::info!("new connection from {}", peer);

        let frame = wire::decode_frame(&mut stream, self.cfg.patch_size)?;

        let uid = match DeviceUid::parse(&frame.uid) {
            Ok(uid) => uid,
            Err(err) => {
                log::warn!("discarding upload from {}: {:#}", peer, err);
                return Ok(());
            }
        };

        let class = self.class_for_type(&uid.type_code);
        let extension = self
            .cfg
            .media(class)
            .extensions
            .first()
            .cloned()
            .unwrap_or_else(|| "bin".to_string());

        let now = Local::now();
        let filename = storage::build_filename(&uid.type_code, &uid.number, now, &extension);
        let dir = storage::incoming_dir(
            &self.cfg.storage_root,
            &uid.type_code,
            &self.cfg.incoming_suffix,
        );
        storage::ensure_dir(&dir)?;
        let path = dir.join(&filename);

        // Authentication failure downgrades to an empty payload; the
        // connection and the file write still complete.
        let payload = match envelope::open(&self.key, &frame.nonce, &frame.tag, &frame.payload) {
            Ok(payload) => payload,
            Err(err) => {
                log::error!(
                    "authentication failed for uid {} from {}: {:#}",
                    uid,
                    peer,
                    err
                );
                Vec::new()
            }
        };
        std::fs::write(&path, &payload)
            .with_context(|| format!("writing upload to {}", path.display()))?;
        log::info!(
            "saved {} byte(s) to {} (uid {})",
            payload.len(),
            path.display(),
            uid
        );

        let now_s = storage::now_s()?;
        let media = self.ctx.media(class);
        let merged = {
            let mut registry = lock_unpoisoned(&media.registry);
            registry.register_or_touch(&uid.to_string(), now_s);
            let merged = registry.merge_boot_placeholder(&uid);
            registry.note_cycle_arrival(&uid.to_string(), now_s);
            merged
        };
        if merged {
            // Refresh observers so charts drop the placeholder promptly.
            self.ctx.processing_done.set();
        }

        media.push_arrival(&uid.to_string());
        self.ctx.processing_done.set();
        Ok(())
    }

    fn class_for_type(&self, type_code: &str) -> MediaClass {
        if self.cfg.video.types.iter().any(|t| t == type_code) {
            MediaClass::Video
        } else {
            if !self.cfg.image.types.iter().any(|t| t == type_code) {
                log::warn!("device type '{}' not configured, filing as image", type_code);
            }
            MediaClass::Image
        }
    }
}

fn bind(addr: &str) -> Result<TcpListener> {
    let listener =
        TcpListener::bind(addr).with_context(|| format!("binding tcp listener on {}", addr))?;
    listener
        .set_nonblocking(true)
        .context("setting listener nonblocking")?;
    Ok(listener)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::MediaRuntime;
    use crate::report::ReportStore;
    use std::io::Write;

    fn test_runtime(root: &std::path::Path) -> (StationConfig, Arc<RuntimeContext>) {
        let mut cfg = StationConfig::defaults();
        cfg.listen_addr = "127.0.0.1:0".to_string();
        cfg.loop_delay = Duration::from_millis(5);
        cfg.storage_root = root.to_path_buf();
        let report = ReportStore::new(cfg.report_dir(), "report_", ".csv");
        let ctx = Arc::new(RuntimeContext::new(
            MediaRuntime::new(MediaClass::Image, 120, 300, 0),
            MediaRuntime::new(MediaClass::Video, 600, 600, 0),
            report,
        ));
        (cfg, ctx)
    }

    fn send_frame(addr: SocketAddr, bytes: &[u8]) {
        let mut stream = TcpStream::connect(addr).expect("connect");
        stream.write_all(bytes).expect("send");
        // Peer closes after sending, like a real probe.
        drop(stream);
    }

    fn wait_for<F: Fn() -> bool>(what: &str, check: F) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if check() {
                return;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        panic!("timed out waiting for {}", what);
    }

    #[test]
    fn upload_lands_in_incoming_dir_and_registry() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (cfg, ctx) = test_runtime(dir.path());
        let key = cfg.key().expect("key");
        let incoming = storage::incoming_dir(dir.path(), "FL", &cfg.incoming_suffix);

        let server = IngestServer::new(cfg, ctx.clone()).expect("server");
        let handle = server.spawn().expect("spawn");
        let addr = handle.addr.expect("bound");

        let sealed = envelope::seal(&key, b"ten bytes!").expect("seal");
        let bytes = wire::encode_frame(
            "AAFL-000007-CAFAF",
            &sealed.nonce,
            &sealed.tag,
            &sealed.ciphertext,
        );
        send_frame(addr, &bytes);

        wait_for("incoming file", || {
            storage::files_with_extensions(&incoming, &["png"])
                .map(|files| files.len() == 1)
                .unwrap_or(false)
        });
        let files = storage::files_with_extensions(&incoming, &["png"]).expect("list");
        let saved = std::fs::read(&files[0]).expect("read saved");
        assert_eq!(saved, b"ten bytes!");
        let name = files[0].file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("FL_000007_"), "bad name {}", name);

        wait_for("registry entry", || {
            lock_unpoisoned(&ctx.image.registry).is_known("AAFL-000007-CAFAF")
        });
        assert_eq!(ctx.image.arrival_count(), 1);
        assert!(ctx.processing_done.wait_timeout(Duration::from_secs(1)));

        handle.stop().expect("stop");
    }

    #[test]
    fn tampered_frame_still_writes_an_empty_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (cfg, ctx) = test_runtime(dir.path());
        let key = cfg.key().expect("key");
        let incoming = storage::incoming_dir(dir.path(), "YL", &cfg.incoming_suffix);

        let handle = IngestServer::new(cfg, ctx.clone())
            .expect("server")
            .spawn()
            .expect("spawn");
        let addr = handle.addr.expect("bound");

        let sealed = envelope::seal(&key, b"payload under attack").expect("seal");
        let mut tag = sealed.tag;
        tag[0] ^= 0x01;
        let bytes =
            wire::encode_frame("AAYL-000021-CAFAF", &sealed.nonce, &tag, &sealed.ciphertext);
        send_frame(addr, &bytes);

        wait_for("empty incoming file", || {
            storage::files_with_extensions(&incoming, &["png"])
                .map(|files| files.len() == 1)
                .unwrap_or(false)
        });
        let files = storage::files_with_extensions(&incoming, &["png"]).expect("list");
        assert_eq!(std::fs::read(&files[0]).expect("read").len(), 0);
        // The device still registers: availability over strictness.
        assert!(lock_unpoisoned(&ctx.image.registry).is_known("AAYL-000021-CAFAF"));

        handle.stop().expect("stop");
    }

    #[test]
    fn malformed_uid_is_discarded_without_filing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (cfg, ctx) = test_runtime(dir.path());
        let key = cfg.key().expect("key");

        let handle = IngestServer::new(cfg, ctx.clone())
            .expect("server")
            .spawn()
            .expect("spawn");
        let addr = handle.addr.expect("bound");

        let sealed = envelope::seal(&key, b"data").expect("seal");
        let bytes = wire::encode_frame("not a uid", &sealed.nonce, &sealed.tag, &sealed.ciphertext);
        send_frame(addr, &bytes);

        // A good frame afterwards proves the accept loop survived.
        let sealed = envelope::seal(&key, b"data").expect("seal");
        let bytes = wire::encode_frame(
            "AAFL-000001-CAFAF",
            &sealed.nonce,
            &sealed.tag,
            &sealed.ciphertext,
        );
        send_frame(addr, &bytes);

        wait_for("good upload", || {
            lock_unpoisoned(&ctx.image.registry).is_known("AAFL-000001-CAFAF")
        });
        assert_eq!(lock_unpoisoned(&ctx.image.registry).known_count(), 1);

        handle.stop().expect("stop");
    }

    #[test]
    fn boot_placeholder_merges_on_live_sighting() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (cfg, ctx) = test_runtime(dir.path());
        let key = cfg.key().expect("key");
        lock_unpoisoned(&ctx.image.registry).register_or_touch("AAFL-000007-BOOT", 1000);

        let handle = IngestServer::new(cfg, ctx.clone())
            .expect("server")
            .spawn()
            .expect("spawn");
        let addr = handle.addr.expect("bound");

        let sealed = envelope::seal(&key, b"live frame").expect("seal");
        let bytes = wire::encode_frame(
            "AAFL-000007-CAFAF",
            &sealed.nonce,
            &sealed.tag,
            &sealed.ciphertext,
        );
        send_frame(addr, &bytes);

        wait_for("merge", || {
            let registry = lock_unpoisoned(&ctx.image.registry);
            registry.is_known("AAFL-000007-CAFAF") && !registry.is_known("AAFL-000007-BOOT")
        });
        assert_eq!(lock_unpoisoned(&ctx.image.registry).known_count(), 1);

        handle.stop().expect("stop");
    }
}

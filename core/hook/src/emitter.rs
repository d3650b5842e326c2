//! Fire-and-forget event delivery to a running daemon.
//!
//! Producers are dev tools; observability must never slow or break them.
//! The fast path is a discovery-file read that costs a few microseconds
//! when no daemon is advertised. The slow path is a POST with a hard
//! deadline, every failure absorbed, and failure logs capped to one line
//! per interval so an outage signals drift without flooding stderr.

use beacon_protocol::{create_event, Envelope, EventContext};
use fs_err as fs;
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::warn;

const EMIT_TIMEOUT: Duration = Duration::from_millis(500);
const FAILURE_LOG_INTERVAL: Duration = Duration::from_secs(30);

const PORT_FILE: &str = "port";
const PID_FILE: &str = "pid";
const CACHE_DIR_ENV: &str = "BEACON_CACHE_DIR";
const PRODUCT_DIR: &str = "beacon";

pub struct Emitter {
    client: reqwest::blocking::Client,
    cache_dir: PathBuf,
    failures: u64,
    last_failure_log: Option<Instant>,
}

impl Emitter {
    pub fn new() -> Result<Self, String> {
        let cache_dir = match std::env::var_os(CACHE_DIR_ENV) {
            Some(dir) => PathBuf::from(dir),
            None => dirs::cache_dir()
                .ok_or_else(|| "Cache directory not found".to_string())?
                .join(PRODUCT_DIR),
        };
        Self::with_cache_dir(cache_dir)
    }

    pub fn with_cache_dir(cache_dir: PathBuf) -> Result<Self, String> {
        let client = reqwest::blocking::Client::builder()
            .timeout(EMIT_TIMEOUT)
            .build()
            .map_err(|err| format!("Failed to build HTTP client: {}", err))?;
        Ok(Self {
            client,
            cache_dir,
            failures: 0,
            last_failure_log: None,
        })
    }

    /// Port of the advertised daemon, or `None` when no live daemon is
    /// discoverable. Stale files are removed best-effort on the way.
    pub fn server_port(&self) -> Option<u16> {
        let port = match read_decimal(&self.cache_dir.join(PORT_FILE)) {
            Some(port) if (1..=65535).contains(&port) => port as u16,
            _ => return None,
        };
        let pid = match read_decimal(&self.cache_dir.join(PID_FILE)) {
            Some(pid) if pid > 0 => pid as u32,
            _ => return None,
        };

        if !pid_alive(pid) {
            let _ = fs::remove_file(self.cache_dir.join(PORT_FILE));
            let _ = fs::remove_file(self.cache_dir.join(PID_FILE));
            return None;
        }

        Some(port)
    }

    /// POST a full envelope to the daemon. Never fails and never takes
    /// longer than the emit deadline.
    pub fn emit(&mut self, envelope: &Envelope, port: u16) {
        let url = format!("http://127.0.0.1:{}/events", port);
        self.post(&url, &serde_json::to_value(envelope).unwrap_or(Value::Null));
    }

    /// POST a raw hook payload to the enrichment ingress.
    pub fn emit_hook(&mut self, name: &str, payload: &Value, port: u16) {
        let url = format!("http://127.0.0.1:{}/events/{}", port, name);
        self.post(&url, payload);
    }

    /// Convenience for CLI producers: skip entirely when no daemon is
    /// advertised, otherwise wrap and send.
    pub fn emit_cli(&mut self, event_type: &str, data: Map<String, Value>, ctx: &EventContext) {
        let port = match self.server_port() {
            Some(port) => port,
            None => return,
        };
        let envelope = create_event(event_type, data, ctx);
        self.emit(&envelope, port);
    }

    pub fn failures(&self) -> u64 {
        self.failures
    }

    fn post(&mut self, url: &str, body: &Value) {
        let result = self
            .client
            .post(url)
            .json(body)
            .send()
            .map_err(|err| err.to_string())
            .and_then(|response| {
                if response.status().is_success() {
                    Ok(())
                } else {
                    Err(format!("server responded {}", response.status()))
                }
            });

        match result {
            Ok(()) => {
                self.failures = 0;
            }
            Err(err) => {
                self.failures += 1;
                let due = self
                    .last_failure_log
                    .map(|at| at.elapsed() >= FAILURE_LOG_INTERVAL)
                    .unwrap_or(true);
                if due {
                    warn!(failures = self.failures, error = %err, "Failed to deliver event");
                    self.last_failure_log = Some(Instant::now());
                }
            }
        }
    }
}

fn read_decimal(path: &std::path::Path) -> Option<u64> {
    let content = fs::read_to_string(path).ok()?;
    content.trim().parse().ok()
}

fn pid_alive(pid: u32) -> bool {
    #[cfg(unix)]
    {
        unsafe { libc::kill(pid as i32, 0) == 0 }
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beacon_protocol::Source;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::thread;
    use tempfile::tempdir;

    fn context() -> EventContext {
        EventContext {
            app: "claude-code".to_string(),
            app_root: "/repo".to_string(),
            source: Source::Cli,
            correlation_id: None,
        }
    }

    fn write_triple(dir: &std::path::Path, port: u16, pid: u32) {
        fs::write(dir.join(PORT_FILE), port.to_string()).expect("write port");
        fs::write(dir.join(PID_FILE), pid.to_string()).expect("write pid");
    }

    /// Minimal single-request HTTP responder for exercising the client.
    fn spawn_responder(status_line: &'static str, delay: Duration) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind responder");
        let port = listener.local_addr().expect("local addr").port();
        thread::spawn(move || {
            if let Ok((mut stream, _)) = listener.accept() {
                let mut buffer = [0u8; 8192];
                let _ = stream.read(&mut buffer);
                thread::sleep(delay);
                let _ = stream.write_all(
                    format!("{}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n", status_line)
                        .as_bytes(),
                );
            }
        });
        port
    }

    #[test]
    fn fast_path_skips_when_no_daemon_advertised() {
        let temp = tempdir().expect("temp dir");
        let mut emitter =
            Emitter::with_cache_dir(temp.path().to_path_buf()).expect("build emitter");

        assert_eq!(emitter.server_port(), None);

        let started = Instant::now();
        emitter.emit_cli("worktree.created", Map::new(), &context());
        assert!(started.elapsed() < Duration::from_millis(100));
        assert_eq!(emitter.failures(), 0);
    }

    #[test]
    fn server_port_requires_a_live_pid() {
        let temp = tempdir().expect("temp dir");
        let emitter = Emitter::with_cache_dir(temp.path().to_path_buf()).expect("build emitter");

        write_triple(temp.path(), 4519, std::process::id());
        assert_eq!(emitter.server_port(), Some(4519));

        write_triple(temp.path(), 4519, 99999999);
        assert_eq!(emitter.server_port(), None);
        assert!(!temp.path().join(PORT_FILE).exists());
    }

    #[test]
    fn unparseable_discovery_files_mean_no_server() {
        let temp = tempdir().expect("temp dir");
        let emitter = Emitter::with_cache_dir(temp.path().to_path_buf()).expect("build emitter");

        fs::write(temp.path().join(PORT_FILE), "junk").expect("write port");
        fs::write(temp.path().join(PID_FILE), std::process::id().to_string())
            .expect("write pid");
        assert_eq!(emitter.server_port(), None);
    }

    #[test]
    fn emit_returns_within_deadline_against_a_stalled_server() {
        let temp = tempdir().expect("temp dir");
        let mut emitter =
            Emitter::with_cache_dir(temp.path().to_path_buf()).expect("build emitter");
        let port = spawn_responder("HTTP/1.1 201 Created", Duration::from_secs(2));

        let envelope = create_event("a.b", Map::new(), &context());
        let started = Instant::now();
        emitter.emit(&envelope, port);

        assert!(
            started.elapsed() < Duration::from_secs(1),
            "emit must respect its deadline, took {:?}",
            started.elapsed()
        );
        assert_eq!(emitter.failures(), 1);
    }

    #[test]
    fn emit_absorbs_connection_refused() {
        let temp = tempdir().expect("temp dir");
        let mut emitter =
            Emitter::with_cache_dir(temp.path().to_path_buf()).expect("build emitter");

        // A freshly bound and dropped listener leaves a closed port.
        let port = TcpListener::bind("127.0.0.1:0")
            .expect("bind probe")
            .local_addr()
            .expect("local addr")
            .port();

        let envelope = create_event("a.b", Map::new(), &context());
        emitter.emit(&envelope, port);
        emitter.emit(&envelope, port);
        assert_eq!(emitter.failures(), 2);
    }

    #[test]
    fn successful_delivery_resets_the_failure_counter() {
        let temp = tempdir().expect("temp dir");
        let mut emitter =
            Emitter::with_cache_dir(temp.path().to_path_buf()).expect("build emitter");
        let envelope = create_event("a.b", Map::new(), &context());

        let closed = TcpListener::bind("127.0.0.1:0")
            .expect("bind probe")
            .local_addr()
            .expect("local addr")
            .port();
        emitter.emit(&envelope, closed);
        assert_eq!(emitter.failures(), 1);

        let port = spawn_responder("HTTP/1.1 201 Created", Duration::ZERO);
        emitter.emit(&envelope, port);
        assert_eq!(emitter.failures(), 0);
    }

    #[test]
    fn non_2xx_counts_as_failure() {
        let temp = tempdir().expect("temp dir");
        let mut emitter =
            Emitter::with_cache_dir(temp.path().to_path_buf()).expect("build emitter");
        let port = spawn_responder("HTTP/1.1 400 Bad Request", Duration::ZERO);

        let envelope = create_event("a.b", Map::new(), &context());
        emitter.emit(&envelope, port);
        assert_eq!(emitter.failures(), 1);
    }
}

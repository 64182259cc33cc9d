use crate::error::{Error, Result};
use serde_json::{json, Value};
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, RecvTimeoutError, SyncSender};
use std::sync::Mutex;
use std::thread::JoinHandle;
use std::time::Duration;

const CONNECT_ATTEMPTS: u32 = 5;
const CONNECT_SPACING: Duration = Duration::from_secs(2);

/// What the monitor's worker thread reports back to whoever owns it.
///
/// Kept independent of the supervisor's own command type so this module has
/// no upward dependency on `supervisor` — the owner supplies a closure that
/// translates these into its own command queue (spec.md §9: "channel
/// handles are naturally independent of owner lifetime").
#[derive(Debug, Clone)]
pub enum QmpEvent {
    NegotiationComplete,
    NegotiationFailed(String),
    Shutdown,
    ConnectionLost(String),
}

/// Allocates a QMP socket path under `$SOCKET_DIR/internal`.
///
/// Name shape is `qmp_<12+ random lowercase letters>.sock`; on a collision
/// (file already exists) the random part grows by one letter and a new path
/// is tried, per spec.md §6.
pub fn allocate_socket_path(socket_dir: &Path) -> Result<PathBuf> {
    let internal_dir = socket_dir.join("internal");
    std::fs::create_dir_all(&internal_dir)?;

    let mut len = 12usize;
    loop {
        let suffix = random_lowercase(len);
        let path = internal_dir.join(format!("qmp_{suffix}.sock"));
        if !path.exists() {
            return Ok(path);
        }
        len += 1;
    }
}

fn random_lowercase(len: usize) -> String {
    let mut out = String::with_capacity(len);
    while out.len() < len {
        let bytes = uuid::Uuid::new_v4().into_bytes();
        for b in bytes {
            if out.len() == len {
                break;
            }
            out.push((b'a' + (b % 26)) as char);
        }
    }
    out
}

/// A long-lived connection to one QEMU instance's QMP socket.
///
/// Owns a dedicated worker thread that performs the connect/negotiate/read
/// loop described in spec.md §4.3. Callers interact only through
/// `send_command`, `online`, and `disconnect`.
pub struct QmpMonitor {
    socket_path: PathBuf,
    online: std::sync::Arc<AtomicBool>,
    send_lock: Mutex<()>,
    request_tx: Mutex<Option<SyncSender<Value>>>,
    response_rx: Mutex<Option<Receiver<Value>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl QmpMonitor {
    /// Allocates the socket path up front so it can be handed to the QEMU
    /// argv before the monitor itself is started (spec.md §4.3 contract).
    pub fn new(socket_path: PathBuf) -> Self {
        Self {
            socket_path,
            online: std::sync::Arc::new(AtomicBool::new(false)),
            send_lock: Mutex::new(()),
            request_tx: Mutex::new(None),
            response_rx: Mutex::new(None),
            worker: Mutex::new(None),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Spawns the worker thread. `notify` is called from the worker thread
    /// for every event it wants relayed to the owning supervisor.
    pub fn start(&self, notify: impl Fn(QmpEvent) + Send + 'static) {
        let (req_tx, req_rx) = sync_channel::<Value>(0);
        let (resp_tx, resp_rx) = sync_channel::<Value>(1);

        *self.request_tx.lock().unwrap() = Some(req_tx);
        *self.response_rx.lock().unwrap() = Some(resp_rx);

        let socket_path = self.socket_path.clone();
        let online = self.online.clone();

        let handle = std::thread::spawn(move || {
            run_worker(socket_path, req_rx, resp_tx, online, notify);
        });

        *self.worker.lock().unwrap() = Some(handle);
    }

    /// Sends one QMP command and blocks until a response or the timeout.
    /// Drains any stale response left in the slot by a prior timed-out call
    /// before sending, so a late response can never answer the wrong call
    /// (spec.md §9 open question, resolved).
    pub fn send_command(&self, name: &str, arguments: Option<Value>, timeout: Duration) -> Result<Value> {
        let _guard = self.send_lock.lock().unwrap();

        let request_tx = self.request_tx.lock().unwrap();
        let request_tx = request_tx
            .as_ref()
            .ok_or_else(|| Error::QmpConnectionError("monitor not started".into()))?;

        {
            let resp_rx = self.response_rx.lock().unwrap();
            if let Some(rx) = resp_rx.as_ref() {
                while rx.try_recv().is_ok() {}
            }
        }

        let mut payload = json!({ "execute": name });
        if let Some(args) = arguments {
            payload["arguments"] = args;
        }

        request_tx
            .send(payload)
            .map_err(|_| Error::QmpConnectionError("monitor worker not running".into()))?;

        let resp_rx = self.response_rx.lock().unwrap();
        let rx = resp_rx
            .as_ref()
            .ok_or_else(|| Error::QmpConnectionError("monitor not started".into()))?;

        match rx.recv_timeout(timeout) {
            Ok(v) => {
                if let Some(err) = v.get("error") {
                    Err(Error::QmpConnectionError(format!("QMP error: {err}")))
                } else {
                    Ok(v)
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                Err(Error::QmpConnectionError(format!("{name} timed out after {timeout:?}")))
            }
            Err(RecvTimeoutError::Disconnected) => {
                Err(Error::QmpConnectionError("monitor worker exited".into()))
            }
        }
    }

    /// Closes the socket connection. If `cleanup`, also unlinks the socket
    /// file — used on SIGKILL paths where QEMU never gets a chance to.
    pub fn disconnect(&self, cleanup: bool) {
        self.online.store(false, Ordering::SeqCst);
        *self.request_tx.lock().unwrap() = None;

        if let Some(handle) = self.worker.lock().unwrap().take() {
            let _ = handle.join();
        }

        if cleanup {
            let _ = std::fs::remove_file(&self.socket_path);
        }
    }
}

fn run_worker(
    socket_path: PathBuf,
    req_rx: Receiver<Value>,
    resp_tx: SyncSender<Value>,
    online: std::sync::Arc<AtomicBool>,
    notify: impl Fn(QmpEvent),
) {
    let stream = match connect_with_retries(&socket_path) {
        Ok(s) => s,
        Err(e) => {
            notify(QmpEvent::NegotiationFailed(e.to_string()));
            return;
        }
    };

    let write_stream = match stream.try_clone() {
        Ok(s) => s,
        Err(e) => {
            notify(QmpEvent::NegotiationFailed(format!("failed to clone socket: {e}")));
            return;
        }
    };
    let mut writer = write_stream;
    let mut reader = BufReader::new(stream);

    if let Err(e) = negotiate(&mut reader, &mut writer) {
        notify(QmpEvent::NegotiationFailed(e.to_string()));
        return;
    }

    online.store(true, Ordering::SeqCst);
    notify(QmpEvent::NegotiationComplete);

    // Writing happens on a second thread so a blocking socket read here
    // never has to be interrupted to service a `send_command` call. The
    // writer exits on its own once `request_tx` is dropped (disconnect) or
    // a write fails (connection lost, observed independently by the reader).
    let writer_handle = std::thread::spawn(move || {
        for payload in req_rx.iter() {
            let line = match serde_json::to_string(&payload) {
                Ok(s) => s,
                Err(e) => {
                    tracing::warn!(error = %e, "failed to serialize QMP command");
                    continue;
                }
            };
            if writer.write_all(line.as_bytes()).is_err() || writer.write_all(b"\n").is_err() {
                break;
            }
            let _ = writer.flush();
        }
    });

    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line) {
            Ok(0) => {
                notify(QmpEvent::ConnectionLost("EOF on QMP socket".into()));
                break;
            }
            Ok(_) => {}
            Err(e) => {
                notify(QmpEvent::ConnectionLost(e.to_string()));
                break;
            }
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let value: Value = match serde_json::from_str(trimmed) {
            Ok(v) => v,
            Err(e) => {
                tracing::debug!(error = %e, line = %trimmed, "malformed QMP frame, ignoring");
                continue;
            }
        };

        if let Some(event_name) = value.get("event").and_then(Value::as_str) {
            tracing::trace!(event = %event_name, "QMP event");
            if event_name == "SHUTDOWN" {
                notify(QmpEvent::Shutdown);
            }
            continue;
        }

        if value.get("return").is_some() || value.get("error").is_some() {
            if resp_tx.try_send(value).is_err() {
                tracing::debug!("dropped QMP response: no pending send_command waiting");
            }
            continue;
        }
    }

    // Dropping the stream (owned by `reader`) here would close the shared fd
    // under the writer thread too, but by this point the connection is
    // already dead one way or another, so just wait for it to notice.
    let _ = writer_handle.join();
}

fn connect_with_retries(socket_path: &Path) -> Result<UnixStream> {
    for attempt in 1..=CONNECT_ATTEMPTS {
        match UnixStream::connect(socket_path) {
            Ok(s) => return Ok(s),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                tracing::debug!(attempt, "QMP socket not yet present, retrying");
                std::thread::sleep(CONNECT_SPACING);
            }
            Err(e) => {
                return Err(Error::QmpConnectionError(format!(
                    "failed to connect to {}: {e}",
                    socket_path.display()
                )));
            }
        }
    }
    Err(Error::QmpConnectionError(format!(
        "QMP socket {} never appeared after {CONNECT_ATTEMPTS} attempts",
        socket_path.display()
    )))
}

fn negotiate(reader: &mut BufReader<UnixStream>, writer: &mut UnixStream) -> Result<()> {
    let mut greeting = String::new();
    reader.read_line(&mut greeting)?;
    let greeting: Value = serde_json::from_str(greeting.trim())
        .map_err(|e| Error::QmpConnectionError(format!("bad QMP greeting: {e}")))?;
    if greeting.get("QMP").is_none() {
        return Err(Error::QmpConnectionError("greeting missing QMP key".into()));
    }

    writer.write_all(br#"{"execute":"qmp_capabilities"}"#)?;
    writer.write_all(b"\n")?;
    writer.flush()?;

    let mut response = String::new();
    reader.read_line(&mut response)?;
    let response: Value = serde_json::from_str(response.trim())
        .map_err(|e| Error::QmpConnectionError(format!("bad capabilities response: {e}")))?;
    if response.get("return").is_none() {
        return Err(Error::QmpConnectionError(format!(
            "qmp_capabilities rejected: {response}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socket_allocation_avoids_collisions() {
        let dir = tempfile::tempdir().unwrap();
        let first = allocate_socket_path(dir.path()).unwrap();
        std::fs::File::create(&first).unwrap();
        let second = allocate_socket_path(dir.path()).unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn connect_fails_fast_on_a_non_socket_file() {
        // A plain file at the path produces a non-ENOENT error (connection
        // refused / not a socket), which is fatal on the first attempt
        // rather than retried for ~10s like a genuinely missing path would be.
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("not_a_socket");
        std::fs::File::create(&path).unwrap();
        let result = connect_with_retries(&path);
        assert!(result.is_err());
    }
}

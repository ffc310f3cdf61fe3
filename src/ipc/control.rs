//! Emulator control socket
//!
//! A Unix stream socket in listen mode (backlog 1). The emulator connects,
//! receives a `hello` line carrying the protocol version and shared-region
//! names, and from then on the framing is one JSON object per line in both
//! directions. The gateway relays browser input events verbatim and parses
//! the emulator's own envelope (`config`, `storage`, `status`, `error`,
//! `ack`). A zero-byte read is peer closure: the connection is torn down
//! while the listener stays open for reconnection.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use futures::FutureExt;
use serde::Deserialize;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Mutex;

use crate::error::{AppError, Result};
use crate::ipc::layout::IPC_VERSION;

/// Messages the emulator sends to the gateway
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum EmulatorMessage {
    Config {
        #[serde(default)]
        data: Value,
    },
    Storage {
        #[serde(default)]
        roms: Value,
        #[serde(default)]
        disks: Value,
    },
    Status {
        #[serde(default)]
        running: bool,
        #[serde(default)]
        fps: f64,
    },
    Error {
        message: String,
    },
    Ack,
}

struct ControlConn {
    stream: UnixStream,
    inbound: Vec<u8>,
}

/// Listening control socket with at most one live emulator connection
pub struct ControlSocket {
    listener: UnixListener,
    path: PathBuf,
    hello: String,
    conn: Mutex<Option<ControlConn>>,
    connected: AtomicBool,
}

impl ControlSocket {
    /// Bind the listening socket, removing any stale path first.
    /// Startup-fatal on failure.
    pub fn bind(path: &Path, video_shm: &str, audio_shm: &str) -> Result<Self> {
        let _ = std::fs::remove_file(path);

        let listener = UnixListener::bind(path).map_err(|e| {
            AppError::ControlSocket(format!("bind '{}' failed: {}", path.display(), e))
        })?;

        let hello = serde_json::json!({
            "type": "hello",
            "version": IPC_VERSION,
            "video_shm": video_shm,
            "audio_shm": audio_shm,
        })
        .to_string();

        tracing::info!("Listening for emulator on '{}'", path.display());
        Ok(Self {
            listener,
            path: path.to_path_buf(),
            hello,
            conn: Mutex::new(None),
            connected: AtomicBool::new(false),
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.path
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// Non-blocking accept. On a new connection the `hello` line is written
    /// immediately so the emulator discovers the shared-region names without
    /// out-of-band configuration. Returns true when a connection was accepted.
    pub async fn try_accept(&self) -> bool {
        if self.is_connected() {
            return false;
        }

        match self.listener.accept().now_or_never() {
            Some(Ok((mut stream, _))) => {
                let line = format!("{}\n", self.hello);
                if let Err(e) = stream.write_all(line.as_bytes()).await {
                    tracing::warn!("Failed to send hello to emulator: {}", e);
                    return false;
                }
                *self.conn.lock().await = Some(ControlConn {
                    stream,
                    inbound: Vec::new(),
                });
                self.connected.store(true, Ordering::Relaxed);
                tracing::info!("Emulator connected");
                true
            }
            Some(Err(e)) => {
                tracing::debug!("Control accept failed: {}", e);
                false
            }
            None => false,
        }
    }

    /// Drain whatever the emulator has written, one JSON object per line.
    /// A zero-byte read tears the connection down; the listener remains
    /// open so a restarted emulator can reconnect.
    pub async fn poll_inbound(&self) -> Vec<EmulatorMessage> {
        let mut guard = self.conn.lock().await;
        let Some(conn) = guard.as_mut() else {
            return Vec::new();
        };

        let mut closed = false;
        let mut scratch = [0u8; 4096];
        loop {
            match conn.stream.try_read(&mut scratch) {
                Ok(0) => {
                    closed = true;
                    break;
                }
                Ok(n) => conn.inbound.extend_from_slice(&scratch[..n]),
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    tracing::warn!("Control read failed: {}", e);
                    closed = true;
                    break;
                }
            }
        }

        let mut messages = Vec::new();
        while let Some(pos) = conn.inbound.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = conn.inbound.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line[..line.len() - 1]);
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<EmulatorMessage>(line) {
                Ok(msg) => messages.push(msg),
                Err(e) => tracing::debug!("Unrecognized control message '{}': {}", line, e),
            }
        }

        if closed {
            *guard = None;
            self.connected.store(false, Ordering::Relaxed);
            tracing::info!("Emulator disconnected");
        }

        messages
    }

    /// Write one JSON line to the emulator. A send failure marks the
    /// connection dead; the caller may re-accept later.
    pub async fn send_line(&self, msg: &str) -> bool {
        let mut guard = self.conn.lock().await;
        let Some(conn) = guard.as_mut() else {
            return false;
        };

        let line = format!("{}\n", msg);
        match conn.stream.write_all(line.as_bytes()).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("Control send failed: {}", e);
                *guard = None;
                self.connected.store(false, Ordering::Relaxed);
                false
            }
        }
    }

    /// Drop the live connection, keeping the listener
    pub async fn disconnect(&self) {
        *self.conn.lock().await = None;
        self.connected.store(false, Ordering::Relaxed);
    }
}

impl Drop for ControlSocket {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::debug!("Failed to remove '{}': {}", self.path.display(), e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, BufReader};

    fn unique_path(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("macemu-ctl-{}-{}.sock", tag, std::process::id()))
    }

    async fn accept_with_retry(socket: &ControlSocket) -> bool {
        for _ in 0..50 {
            if socket.try_accept().await {
                return true;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn hello_is_sent_on_accept() {
        let path = unique_path("hello");
        let socket = ControlSocket::bind(&path, "/video-region", "/audio-region").unwrap();

        let client = UnixStream::connect(&path).await.unwrap();
        assert!(accept_with_retry(&socket).await);
        assert!(socket.is_connected());

        let mut lines = BufReader::new(client).lines();
        let hello = lines.next_line().await.unwrap().unwrap();
        let value: Value = serde_json::from_str(&hello).unwrap();
        assert_eq!(value["type"], "hello");
        assert_eq!(value["version"], 1);
        assert_eq!(value["video_shm"], "/video-region");
        assert_eq!(value["audio_shm"], "/audio-region");
    }

    #[tokio::test]
    async fn inbound_envelope_and_closure_detection() {
        let path = unique_path("inbound");
        let socket = ControlSocket::bind(&path, "/v", "/a").unwrap();

        let mut client = UnixStream::connect(&path).await.unwrap();
        assert!(accept_with_retry(&socket).await);

        client
            .write_all(b"{\"type\":\"ack\"}\n{\"type\":\"error\",\"message\":\"boom\"}\n")
            .await
            .unwrap();
        // Give the bytes a moment to land in the socket buffer.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let messages = socket.poll_inbound().await;
        assert_eq!(messages.len(), 2);
        assert!(matches!(messages[0], EmulatorMessage::Ack));
        assert!(matches!(&messages[1], EmulatorMessage::Error { message } if message == "boom"));

        drop(client);
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let _ = socket.poll_inbound().await;
        assert!(!socket.is_connected());

        // Listener stays open for reconnection.
        let _client2 = UnixStream::connect(&path).await.unwrap();
        assert!(accept_with_retry(&socket).await);
        assert!(socket.is_connected());
    }

    #[tokio::test]
    async fn send_requires_a_connection() {
        let path = unique_path("send");
        let socket = ControlSocket::bind(&path, "/v", "/a").unwrap();
        assert!(!socket.send_line("{\"type\":\"restart\"}").await);
    }
}

//! Socat bridge adapter: spawns the bridge process, tracks its PID,
//! monitors liveness, and tears it down with SIGTERM-then-SIGKILL. Uses
//! piped stdio, `kill_on_drop(true)`, a background reader task, and a
//! graceful-then-forceful stop sequence.

use std::net::SocketAddr;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpListener;
use tokio::process::{Child, Command};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, instrument, warn};

use crate::error::{Error, Result};
use crate::profiles::model::SocatProfile;

#[derive(Debug, Clone)]
pub enum SocatEvent {
    Started { pid: u32 },
    ConnectionEstablished,
    ConnectionClosed,
    Stopped,
    Error(String),
}

pub struct SocatBridge {
    child: Child,
    pid: u32,
    port: u16,
    stderr_task: Option<JoinHandle<()>>,
    events_tx: broadcast::Sender<SocatEvent>,
}

/// Checks the listen port is free before starting, per 4.4 "Detects port
/// already in use before starting and fails with ResourceBusy".
pub async fn check_port_free(port: u16) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    match TcpListener::bind(addr).await {
        Ok(listener) => {
            drop(listener);
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
            Err(Error::resource_busy(format!("TCP port {port} is already in use")))
        }
        Err(e) => Err(Error::transport(format!("failed to probe port {port}"), e)),
    }
}

impl SocatBridge {
    /// Composes and spawns `socat -d -d -v -b <block> -x
    /// TCP-LISTEN:<port>,fork,reuseaddr <device>,raw,echo=0`.
    #[instrument(skip(profile), fields(port = profile.listen_port))]
    pub async fn start(socat_binary: &Path, device_path: &str, profile: &SocatProfile) -> Result<Self> {
        check_port_free(profile.listen_port).await?;

        let mut tcp_listen = format!("TCP-LISTEN:{}", profile.listen_port);
        if profile.fork {
            tcp_listen.push_str(",fork");
        }
        if profile.reuse_addr {
            tcp_listen.push_str(",reuseaddr");
        }

        let mut args: Vec<String> = vec!["-d".into(), "-d".into()];
        if profile.verbose {
            args.push("-v".into());
        }
        if profile.hex_dump {
            args.push("-x".into());
        }
        args.push("-b".into());
        args.push(profile.block_size.to_string());
        args.push(tcp_listen);
        args.push(format!("{device_path},raw,echo=0"));

        let mut child = Command::new(socat_binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::external(format!("failed to spawn {}", socat_binary.display())).with_source(e))?;

        let pid = child
            .id()
            .ok_or_else(|| Error::internal("socat child exited before PID was observed"))?;

        let (events_tx, _rx) = broadcast::channel(32);
        let stderr = child.stderr.take();
        let stderr_task = stderr.map(|stderr| {
            let tx = events_tx.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(socat_line = %line, "socat stderr");
                    if line.contains("starting data transfer loop") {
                        let _ = tx.send(SocatEvent::ConnectionEstablished);
                    } else if line.contains("socket is at EOF") || line.contains("connection closed") {
                        let _ = tx.send(SocatEvent::ConnectionClosed);
                    } else if line.to_lowercase().contains("error") {
                        let _ = tx.send(SocatEvent::Error(line));
                    }
                }
            })
        });

        let _ = events_tx.send(SocatEvent::Started { pid });

        Ok(Self {
            child,
            pid,
            port: profile.listen_port,
            stderr_task,
            events_tx,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SocatEvent> {
        self.events_tx.subscribe()
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub async fn is_running(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// SIGTERM, wait up to `grace`, SIGKILL if still alive.
    #[instrument(skip(self), fields(pid = self.pid))]
    pub async fn stop(&mut self, grace: Duration) -> Result<()> {
        if let Ok(Some(_)) = self.child.try_wait() {
            let _ = self.events_tx.send(SocatEvent::Stopped);
            return Ok(());
        }

        let pid = Pid::from_raw(self.pid as i32);
        if let Err(e) = signal::kill(pid, Signal::SIGTERM) {
            warn!(error = %e, "SIGTERM failed, process may already be gone");
        }

        let waited = tokio::time::timeout(grace, self.child.wait()).await;
        if waited.is_err() {
            warn!("socat did not exit within grace window, sending SIGKILL");
            let _ = signal::kill(pid, Signal::SIGKILL);
            let _ = self.child.wait().await;
        }

        if let Some(task) = self.stderr_task.take() {
            task.abort();
        }
        let _ = self.events_tx.send(SocatEvent::Stopped);
        Ok(())
    }
}

impl Drop for SocatBridge {
    fn drop(&mut self) {
        let _ = self.child.start_kill();
    }
}

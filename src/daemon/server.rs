use super::protocol::{read_frame, write_frame, EventMessage, FrameError, Response};
use super::router::{EventFilter, Reply, Router};
use super::{Context, Reconciler};
use crate::events::{Event, EventKind};
use anyhow::{Context as _, Result};
use serde::Serialize;
use serde_json::json;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch};

use tracing::{debug, error, info, trace, warn};

/// Exclusive claim on the PID file; removed again on drop.
struct PidFile {
    path: PathBuf,
}

impl PidFile {
    fn acquire(path: &Path) -> Result<Self> {
        if let Some(pid) = running_pid(path) {
            anyhow::bail!("Daemon already running with PID {}", pid);
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, format!("{}\n", std::process::id()))
            .with_context(|| format!("Failed to write PID file {}", path.display()))?;
        info!(path = %path.display(), "PID file written");
        Ok(Self {
            path: path.to_path_buf(),
        })
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            debug!(path = %self.path.display(), error = %e, "Could not remove PID file");
        }
    }
}

/// PID recorded in `path`, if that process is still alive.
fn running_pid(path: &Path) -> Option<i32> {
    let pid: i32 = std::fs::read_to_string(path).ok()?.trim().parse().ok()?;
    if pid <= 0 {
        return None;
    }
    // SAFETY: signal 0 performs only the existence and permission check.
    let rc = unsafe { libc::kill(pid, 0) };
    let alive = rc == 0 || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM);
    alive.then_some(pid)
}

/// Hand the socket to `group`. `Ok(false)` when the group does not exist.
fn chown_to_group(path: &Path, group: &str) -> io::Result<bool> {
    let name = std::ffi::CString::new(group)?;
    // SAFETY: `name` is NUL-terminated and outlives the call; the returned
    // record is read before any other getgr* call on this thread.
    let gid = unsafe {
        let entry = libc::getgrnam(name.as_ptr());
        if entry.is_null() {
            return Ok(false);
        }
        (*entry).gr_gid
    };
    std::os::unix::fs::chown(path, None, Some(gid))?;
    Ok(true)
}

struct Subscription {
    receiver: broadcast::Receiver<Event>,
    filter: EventFilter,
}

/// Next event matching the subscription. Pends forever without one.
async fn next_event(subscription: &mut Option<Subscription>) -> Option<Event> {
    let Some(sub) = subscription.as_mut() else {
        return std::future::pending().await;
    };
    loop {
        match sub.receiver.recv().await {
            Ok(event) if sub.filter.matches(&event) => return Some(event),
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "Subscriber lagging, events dropped");
            }
            Err(RecvError::Closed) => return None,
        }
    }
}

enum Incoming {
    Frame(Option<std::result::Result<Option<Vec<u8>>, FrameError>>),
    Event(Option<Event>),
}

pub struct DaemonServer {
    ctx: Arc<Context>,
    router: Router,
}

impl DaemonServer {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self {
            router: Router::new(Arc::clone(&ctx)),
            ctx,
        }
    }

    pub async fn run(self) -> Result<()> {
        info!(version = env!("CARGO_PKG_VERSION"), "Pandemic daemon starting...");
        let config = self.ctx.config.clone();

        let _pid_file = PidFile::acquire(&config.daemon.pid_file)?;
        clear_staging(&config.staging_dir()).await;
        let listener = self.bind()?;

        let recovered = self.ctx.pipeline.recover_interrupted().await;
        if recovered > 0 {
            info!(recovered, "Settled infections left mid-install or mid-remove");
        }
        let reconciled = self.ctx.lifecycle.reconcile_all(&self.ctx.locks).await;
        info!(reconciled, "Registry reconciled with supervisor");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm = signal(SignalKind::terminate())?;
            let mut sigint = signal(SignalKind::interrupt())?;
            let shutdown_tx = shutdown_tx.clone();

            tokio::spawn(async move {
                tokio::select! {
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                    _ = sigint.recv() => info!("Received SIGINT"),
                }
                let _ = shutdown_tx.send(true);
            });
        }

        let reconciler = Reconciler::new(Arc::clone(&self.ctx.lifecycle), Arc::clone(&self.ctx.locks))
            .with_interval(config.supervisor.reconcile_interval());
        let reconciler_rx = shutdown_rx.clone();
        let reconciler_task = tokio::spawn(async move { reconciler.run(reconciler_rx).await });

        self.ctx.events.publish(Event::new(
            EventKind::SystemStarted,
            json!({ "version": env!("CARGO_PKG_VERSION"), "pid": std::process::id() }),
        ));

        let server = Arc::new(self);
        info!(socket = %config.daemon.socket_path.display(), "Pandemic daemon ready");
        Arc::clone(&server).serve(listener, shutdown_rx).await;

        info!("Shutting down");
        server
            .ctx
            .events
            .publish(Event::new(EventKind::SystemStopping, json!({})));
        let _ = shutdown_tx.send(true);
        if let Err(e) = reconciler_task.await {
            error!(error = %e, "Reconciler task failed");
        }
        server.ctx.registry.close().await?;

        if let Err(e) = std::fs::remove_file(&config.daemon.socket_path) {
            debug!(error = %e, "Could not remove socket");
        }
        info!("Pandemic daemon stopped");
        Ok(())
    }

    fn bind(&self) -> Result<UnixListener> {
        let daemon = &self.ctx.config.daemon;
        let socket_path = &daemon.socket_path;

        if socket_path.exists() {
            std::fs::remove_file(socket_path)
                .with_context(|| format!("Failed to remove stale socket {}", socket_path.display()))?;
        }
        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let listener = UnixListener::bind(socket_path)
            .with_context(|| format!("Failed to bind {}", socket_path.display()))?;
        info!(socket = %socket_path.display(), "IPC server listening");

        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(daemon.socket_mode);
            std::fs::set_permissions(socket_path, perms)?;
        }
        if let Some(group) = &daemon.socket_group {
            match chown_to_group(socket_path, group) {
                Ok(true) => debug!(group = %group, "Socket group applied"),
                Ok(false) => warn!(group = %group, "Socket group does not exist"),
                Err(e) => warn!(group = %group, error = %e, "Could not change socket group"),
            }
        }
        Ok(listener)
    }

    /// Accept connections until `shutdown` flips.
    pub async fn serve(self: Arc<Self>, listener: UnixListener, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                conn = listener.accept() => {
                    match conn {
                        Ok((stream, _)) => {
                            let server = Arc::clone(&self);
                            tokio::spawn(async move {
                                server.handle_connection(stream).await;
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Accept error");
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Shutdown signal received");
                        break;
                    }
                }
            }
        }
    }

    async fn handle_connection(&self, stream: UnixStream) {
        trace!("New connection accepted");
        let (mut reader, mut writer) = stream.into_split();

        let (frames_tx, mut frames) = mpsc::channel(16);
        let reader_task = tokio::spawn(async move {
            loop {
                let frame = read_frame(&mut reader).await;
                let last = !matches!(frame, Ok(Some(_)));
                if frames_tx.send(frame).await.is_err() || last {
                    break;
                }
            }
        });

        let mut subscription: Option<Subscription> = None;
        loop {
            let incoming = tokio::select! {
                frame = frames.recv() => Incoming::Frame(frame),
                event = next_event(&mut subscription) => Incoming::Event(event),
            };

            match incoming {
                Incoming::Frame(None | Some(Ok(None))) => break,
                Incoming::Frame(Some(Err(FrameError::TooLarge(len)))) => {
                    warn!(len, "Oversized frame, closing connection");
                    let response = Response::failure(
                        "",
                        None,
                        "ValidationError",
                        FrameError::TooLarge(len).to_string(),
                    );
                    let _ = send(&mut writer, &response).await;
                    break;
                }
                Incoming::Frame(Some(Err(e))) => {
                    debug!(error = %e, "Connection read failed");
                    break;
                }
                Incoming::Frame(Some(Ok(Some(body)))) => {
                    let response = match self.router.handle_frame(&body).await {
                        Reply::Response(response) => response,
                        Reply::Subscribe {
                            response,
                            receiver,
                            filter,
                        } => {
                            subscription = Some(Subscription { receiver, filter });
                            response
                        }
                        Reply::Unsubscribe(response) => {
                            subscription = None;
                            response
                        }
                    };
                    if send(&mut writer, &response).await.is_err() {
                        break;
                    }
                }
                Incoming::Event(Some(event)) => {
                    if send(&mut writer, &EventMessage::from(event)).await.is_err() {
                        break;
                    }
                }
                Incoming::Event(None) => subscription = None,
            }
        }

        reader_task.abort();
        trace!("Connection closed");
    }
}

async fn send<T: Serialize>(writer: &mut OwnedWriteHalf, message: &T) -> std::result::Result<(), FrameError> {
    write_frame(writer, message).await.inspect_err(|e| {
        debug!(error = %e, "Failed to write to client");
    })
}

/// Leftovers from resolves interrupted by a crash.
async fn clear_staging(staging: &Path) {
    match tokio::fs::remove_dir_all(staging).await {
        Ok(()) => debug!(path = %staging.display(), "Cleared staging directory"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %staging.display(), error = %e, "Could not clear staging directory"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::protocol::MAX_FRAME_LEN;
    use crate::testing::Harness;
    use serde_json::Value;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::io::AsyncWriteExt;

    struct Running {
        _dir: TempDir,
        socket: PathBuf,
        shutdown: watch::Sender<bool>,
        task: tokio::task::JoinHandle<()>,
    }

    async fn start(h: &Harness) -> Running {
        let dir = TempDir::new().expect("tempdir");
        let socket = dir.path().join("pandemic.sock");
        let listener = UnixListener::bind(&socket).expect("bind");
        let server = Arc::new(DaemonServer::new(Arc::clone(&h.context)));
        let (shutdown, rx) = watch::channel(false);
        let task = tokio::spawn(server.serve(listener, rx));
        Running {
            _dir: dir,
            socket,
            shutdown,
            task,
        }
    }

    async fn exchange(stream: &mut UnixStream, request: Value) -> Value {
        write_frame(stream, &request).await.expect("write");
        receive(stream).await
    }

    async fn receive(stream: &mut UnixStream) -> Value {
        let body = tokio::time::timeout(Duration::from_secs(5), read_frame(stream))
            .await
            .expect("reply in time")
            .expect("read")
            .expect("frame");
        serde_json::from_slice(&body).expect("json")
    }

    #[tokio::test]
    async fn answers_several_requests_on_one_connection() {
        let h = Harness::new().await;
        let server = start(&h).await;
        let mut stream = UnixStream::connect(&server.socket).await.expect("connect");

        let health = exchange(
            &mut stream,
            json!({ "id": "1", "type": "request", "command": "health", "payload": {} }),
        )
        .await;
        assert_eq!(health["id"], "1");
        assert_eq!(health["status"], "success");
        assert_eq!(health["payload"]["status"], "healthy");

        let unknown = exchange(&mut stream, json!({ "id": "2", "command": "launch" })).await;
        assert_eq!(unknown["id"], "2");
        assert_eq!(unknown["status"], "error");
        assert_eq!(unknown["error"]["kind"], "ValidationError");

        server.shutdown.send(true).expect("shutdown");
        tokio::time::timeout(Duration::from_secs(5), server.task)
            .await
            .expect("serve exits")
            .expect("join");
    }

    #[tokio::test]
    async fn subscribers_receive_matching_events() {
        let h = Harness::new().await;
        let server = start(&h).await;
        let mut stream = UnixStream::connect(&server.socket).await.expect("connect");

        let subscribed = exchange(
            &mut stream,
            json!({
                "id": "s",
                "command": "subscribeEvents",
                "payload": { "eventTypes": ["system.*"] }
            }),
        )
        .await;
        assert_eq!(subscribed["status"], "success");

        h.context
            .events
            .publish(Event::new(EventKind::Restarted, json!({ "infectionId": "x" })));
        h.context
            .events
            .publish(Event::new(EventKind::SystemStopping, json!({})));

        let pushed = receive(&mut stream).await;
        assert_eq!(pushed["type"], "event");
        assert_eq!(pushed["command"], "system.stopping");
        assert_eq!(pushed["payload"]["source"], "core");
    }

    #[tokio::test]
    async fn oversized_frame_gets_an_error_and_is_closed() {
        let h = Harness::new().await;
        let server = start(&h).await;
        let mut stream = UnixStream::connect(&server.socket).await.expect("connect");

        let len = u32::try_from(MAX_FRAME_LEN + 1).expect("len");
        stream.write_all(&len.to_be_bytes()).await.expect("write");
        let reply = receive(&mut stream).await;
        assert_eq!(reply["status"], "error");
        assert_eq!(reply["error"]["kind"], "ValidationError");

        let after = tokio::time::timeout(Duration::from_secs(5), read_frame(&mut stream))
            .await
            .expect("closed in time");
        assert!(matches!(after, Ok(None) | Err(_)));
    }

    #[test]
    fn stale_pid_file_is_not_running() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("pandemic.pid");
        std::fs::write(&path, "not a pid").expect("write");
        assert_eq!(running_pid(&path), None);

        std::fs::write(&path, format!("{}\n", std::process::id())).expect("write");
        assert_eq!(running_pid(&path), i32::try_from(std::process::id()).ok());
        assert!(PidFile::acquire(&path).is_err());

        std::fs::remove_file(&path).expect("remove");
        let pid_file = PidFile::acquire(&path).expect("acquire");
        assert!(path.exists());
        drop(pid_file);
        assert!(!path.exists());
    }
}

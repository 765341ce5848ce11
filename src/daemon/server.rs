use super::idler::{CallGuard, CallInfo, ConnectionTracker};
use super::protocol::{MessageFrame, Request, Response, MAX_FRAME_LEN};
use crate::clienv;
use crate::error::{DaemonError, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use tracing::{debug, error, info, trace, warn};

pub struct DaemonConfig {
    pub socket_path: PathBuf,
    /// Idle time before the daemon exits on its own; zero disables it
    pub timeout: Duration,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket_path: clienv::default_socket_path(),
            timeout: clienv::DEFAULT_SERVICE_TIMEOUT,
        }
    }
}

/// Service methods served on the daemon socket.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    /// Answer one call. The stream is ended by the daemon once this returns,
    /// unless the handler ended it itself.
    async fn handle(&self, request: Request, responses: &mut ResponseStream) -> Result<()>;
}

/// Server side of one call.
pub struct ResponseStream {
    stream: UnixStream,
    finished: bool,
}

impl ResponseStream {
    pub(crate) fn new(stream: UnixStream) -> Self {
        Self {
            stream,
            finished: false,
        }
    }

    pub async fn send(&mut self, response: &Response) -> Result<()> {
        if self.finished {
            return Err(DaemonError::Protocol(
                "response stream already ended".to_string(),
            ));
        }
        let bytes = MessageFrame::encode_response(response)?;
        self.stream.write_all(&bytes).await?;
        Ok(())
    }

    pub async fn line(&mut self, text: impl Into<String>) -> Result<()> {
        self.send(&Response::Line { text: text.into() }).await
    }

    /// Send the end-of-stream marker. Later calls are no-ops.
    pub async fn finish(&mut self) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        self.send(&Response::StreamEnd).await?;
        self.stream.flush().await?;
        self.finished = true;
        Ok(())
    }
}

/// Stops the daemon; cheap to clone and usable from any task.
#[derive(Clone)]
pub struct ShutdownHandle {
    tracker: Arc<ConnectionTracker>,
    shutdown: CancellationToken,
    abort: CancellationToken,
}

impl ShutdownHandle {
    fn new(timeout: Duration) -> Self {
        Self {
            tracker: Arc::new(ConnectionTracker::new(timeout)),
            shutdown: CancellationToken::new(),
            abort: CancellationToken::new(),
        }
    }

    /// Stop accepting calls and let `listen` return.
    ///
    /// Without `force`, in-flight calls are waited for; with it they are
    /// aborted. Safe to call any number of times from any task.
    pub fn quit(&self, force: bool) {
        if self.tracker.request_quit() {
            info!(force, "Daemon quit requested");
        }
        if force {
            self.abort.cancel();
        }
        self.shutdown.cancel();
    }

    pub fn tracker(&self) -> &ConnectionTracker {
        &self.tracker
    }
}

struct Inner {
    socket_path: PathBuf,
    handler: Arc<dyn RequestHandler>,
    handle: ShutdownHandle,
}

/// Local RPC daemon that exits on its own once idle.
#[derive(Clone)]
pub struct Daemon {
    inner: Arc<Inner>,
}

impl Daemon {
    /// Create the daemon. `register` builds the service answering calls and
    /// receives a handle that can stop the daemon.
    pub fn new<F>(config: DaemonConfig, register: F) -> Result<Self>
    where
        F: FnOnce(ShutdownHandle) -> Arc<dyn RequestHandler>,
    {
        if config.socket_path.as_os_str().is_empty() {
            return Err(DaemonError::Config("socket path is empty".to_string()));
        }

        let handle = ShutdownHandle::new(config.timeout);
        let handler = register(handle.clone());

        Ok(Self {
            inner: Arc::new(Inner {
                socket_path: config.socket_path,
                handler,
                handle,
            }),
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.inner.socket_path
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.inner.handle.clone()
    }

    fn tracker(&self) -> &ConnectionTracker {
        self.inner.handle.tracker()
    }

    /// Call hook: a call started.
    pub fn on_new_connection(&self, info: &CallInfo) {
        self.tracker().on_start(info);
    }

    /// Call hook: a call ended.
    pub fn on_done_connection(&self, info: &CallInfo) {
        self.tracker().on_done(info);
    }

    /// New idle timeout, used from the next time the daemon becomes idle.
    pub fn change_timeout(&self, timeout: Duration) {
        self.tracker().change_timeout(timeout);
    }

    pub fn quit(&self, force: bool) {
        self.inner.handle.quit(force);
    }

    /// Quit gracefully on SIGTERM or SIGINT.
    pub fn quit_on_signals(&self) -> std::io::Result<()> {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        let handle = self.shutdown_handle();

        tokio::spawn(async move {
            tokio::select! {
                _ = sigterm.recv() => {
                    info!("Received SIGTERM");
                    handle.quit(false);
                }
                _ = sigint.recv() => {
                    info!("Received SIGINT");
                    handle.quit(false);
                }
                _ = handle.shutdown.cancelled() => {}
            }
        });
        Ok(())
    }

    /// Serve calls until quit or idle expiry.
    ///
    /// Returns once the socket is closed and in-flight calls are over, or
    /// the bind error if the socket could not be opened.
    pub async fn listen(&self) -> Result<()> {
        let listener = self.bind()?;
        info!(path = %self.socket_path().display(), "Daemon listening");

        let tracker = self.tracker();
        tracker.arm_if_idle();

        let expired = tracker.expired();
        tokio::pin!(expired);

        let shutdown = self.inner.handle.shutdown.clone();
        let mut calls = JoinSet::new();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = &mut expired => {
                    self.quit(false);
                    break;
                }
                conn = listener.accept() => {
                    match conn {
                        Ok((stream, _)) => {
                            let daemon = self.clone();
                            calls.spawn(async move {
                                if let Err(e) = daemon.handle_connection(stream).await {
                                    error!("Connection handler error: {}", e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                Some(res) = calls.join_next(), if !calls.is_empty() => {
                    if let Err(e) = res {
                        error!("Call task failed: {}", e);
                    }
                }
            }
        }

        drop(listener);
        self.remove_socket();
        self.drain(&mut calls).await;

        info!("Daemon stopped");
        Ok(())
    }

    fn bind(&self) -> Result<UnixListener> {
        let path = self.socket_path();
        let bind_err = |source| DaemonError::Bind {
            path: path.to_path_buf(),
            source,
        };

        if std::fs::symlink_metadata(path).is_ok() {
            debug!(path = %path.display(), "Removing stale socket");
            std::fs::remove_file(path).map_err(bind_err)?;
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(bind_err)?;
        }

        let listener = UnixListener::bind(path).map_err(bind_err)?;

        {
            use std::os::unix::fs::PermissionsExt;
            // every local user may request policy actions
            let perms = std::fs::Permissions::from_mode(0o666);
            std::fs::set_permissions(path, perms).map_err(bind_err)?;
        }

        Ok(listener)
    }

    fn remove_socket(&self) {
        match std::fs::remove_file(self.socket_path()) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove socket {}: {}", self.socket_path().display(), e),
        }
    }

    /// Wait for in-flight calls, unless a forced quit cuts it short.
    async fn drain(&self, calls: &mut JoinSet<()>) {
        let tracker = self.tracker();
        let abort = self.inner.handle.abort.clone();

        if !abort.is_cancelled() && (tracker.active() > 0 || !calls.is_empty()) {
            info!(active = tracker.active(), "Waiting for in-flight calls to finish");
        }

        let drained = async {
            while calls.join_next().await.is_some() {}
            tracker.wait_idle().await;
        };
        tokio::select! {
            biased;
            _ = abort.cancelled() => {}
            _ = drained => return,
        }

        warn!(active = tracker.active(), "Forced quit, aborting in-flight calls");
        calls.abort_all();
        while calls.join_next().await.is_some() {}
    }

    async fn handle_connection(&self, mut stream: UnixStream) -> Result<()> {
        trace!("New connection accepted");

        // a connection that has not sent its request yet is not a call
        let shutdown = self.inner.handle.shutdown.clone();
        let request = tokio::select! {
            request = read_request(&mut stream) => request?,
            _ = shutdown.cancelled() => {
                debug!("Closing connection without a request on shutdown");
                return Ok(());
            }
        };
        let method = request.method();
        let _call = CallGuard::new(self.tracker(), CallInfo::new(method));
        debug!("Handling: {}", method);

        let mut responses = ResponseStream::new(stream);
        if let Err(e) = self.inner.handler.handle(request, &mut responses).await {
            warn!("{} failed: {}", method, e);
            responses
                .send(&Response::Error {
                    message: crate::error::chain(&e),
                })
                .await?;
        }
        responses.finish().await?;

        trace!("Response sent");
        Ok(())
    }
}

async fn read_request(stream: &mut UnixStream) -> Result<Request> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let len = MessageFrame::read_length(&len_buf);
    trace!("Request length: {} bytes", len);
    if len > MAX_FRAME_LEN {
        return Err(DaemonError::Protocol(format!(
            "request frame of {len} bytes exceeds limit"
        )));
    }

    let mut request_buf = vec![0u8; len];
    stream.read_exact(&mut request_buf).await?;
    Ok(MessageFrame::decode_request(&request_buf)?)
}

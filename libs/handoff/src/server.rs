//! Backend serving context.
//!
//! [`ProxyServer`] owns the channels a backend inherited from the proxy and
//! serves an axum [`Router`] on each of them. It replaces process-wide
//! "listener registered / started / stopped" state with one explicit value
//! the entry point creates and passes around.

use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use axum::serve::Listener;
use axum::Router;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use crate::error::HandoffError;
use crate::listener::{ProxiedStream, ProxyListener};
use crate::tracker::ConnectionTracker;
use crate::ChannelKind;

/// Delay before retrying after a failed handoff receive.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Upper bound on a TLS handshake over a handed-off connection.
const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Handshaken TLS streams waiting for the accept loop.
const HANDSHAKE_QUEUE: usize = 64;

#[derive(Default)]
struct ServerState {
    /// Channels waiting for `start`.
    listeners: Vec<ProxyListener>,
    started: bool,
    stopped: bool,
}

/// Serves HTTP on the channels handed to this process by the proxy.
pub struct ProxyServer {
    state: Mutex<ServerState>,
    tls: Option<TlsAcceptor>,
    tracker: ConnectionTracker,
    shutdown: watch::Sender<bool>,
    done: Arc<watch::Sender<bool>>,
    /// First serving error, reported once by `wait`.
    error: Arc<Mutex<Option<io::Error>>>,
}

impl ProxyServer {
    /// Build a server over the given channels.
    ///
    /// Connections from both channels share one [`ConnectionTracker`].
    pub fn new(
        http: Option<ProxyListener>,
        https: Option<ProxyListener>,
    ) -> Result<Self, HandoffError> {
        let tracker = ConnectionTracker::new();
        let listeners: Vec<_> = http
            .into_iter()
            .chain(https)
            .map(|listener| listener.with_tracker(tracker.clone()))
            .collect();
        if listeners.is_empty() {
            return Err(HandoffError::NoSocket);
        }

        Ok(Self {
            state: Mutex::new(ServerState {
                listeners,
                ..Default::default()
            }),
            tls: None,
            tracker,
            shutdown: watch::Sender::new(false),
            done: Arc::new(watch::Sender::new(false)),
            error: Arc::new(Mutex::new(None)),
        })
    }

    /// Build a server over the channels inherited from the proxy.
    pub fn from_env() -> Result<Self, HandoffError> {
        let http = ProxyListener::from_env(ChannelKind::Http)?;
        let https = ProxyListener::from_env(ChannelKind::Https)?;
        Self::new(http, https)
    }

    /// Terminate TLS on the HTTPS channel with `acceptor`.
    ///
    /// Without an acceptor, HTTPS connections reach the router as raw bytes.
    pub fn with_tls(mut self, acceptor: TlsAcceptor) -> Self {
        self.tls = Some(acceptor);
        self
    }

    pub fn tracker(&self) -> &ConnectionTracker {
        &self.tracker
    }

    fn lock_state(&self) -> MutexGuard<'_, ServerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start serving `app` in the background.
    pub fn start(&self, app: Router) -> Result<(), HandoffError> {
        let listeners = {
            let mut state = self.lock_state();
            if state.stopped {
                return Err(HandoffError::Stopped);
            }
            if state.started {
                return Err(HandoffError::Running);
            }
            state.started = true;
            std::mem::take(&mut state.listeners)
        };

        let mut tasks = JoinSet::new();
        for listener in listeners {
            let kind = listener.kind();
            let shutdown = self.shutdown.subscribe();
            let app = app.clone();
            match (&self.tls, kind) {
                (Some(acceptor), ChannelKind::Https) => {
                    tasks.spawn(serve_tls(listener, acceptor.clone(), app, shutdown));
                }
                _ => {
                    tasks.spawn(serve_plain(listener, app, shutdown));
                }
            }
            info!(channel = %kind, "Serving handoff channel");
        }

        let done = Arc::clone(&self.done);
        let error = Arc::clone(&self.error);
        tokio::spawn(async move {
            while let Some(joined) = tasks.join_next().await {
                let result = joined.unwrap_or_else(|e| Err(io::Error::other(e)));
                if let Err(e) = result {
                    warn!(error = %e, "Handoff channel server failed");
                    error
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .get_or_insert(e);
                }
            }
            done.send_replace(true);
        });

        Ok(())
    }

    /// Start serving `app` and wait until serving ends.
    pub async fn run(&self, app: Router) -> Result<(), HandoffError> {
        self.start(app)?;
        self.wait().await
    }

    /// Wait until every channel stopped serving and every handed-off
    /// connection has been dropped.
    ///
    /// Returns the first serving error. Later calls return `Ok(())`.
    pub async fn wait(&self) -> Result<(), HandoffError> {
        if !self.lock_state().started {
            return Err(HandoffError::NotRunning);
        }

        let mut done = self.done.subscribe();
        // The sender lives in `self`, so this cannot fail.
        let _ = done.wait_for(|done| *done).await;
        self.tracker.wait_idle().await;

        let error = self
            .error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match error {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    /// Stop accepting handoffs. In-flight connections keep being served.
    pub fn close(&self) -> Result<(), HandoffError> {
        let unstarted = {
            let mut state = self.lock_state();
            if state.stopped {
                return Err(HandoffError::Stopped);
            }
            state.stopped = true;
            std::mem::take(&mut state.listeners)
        };
        drop(unstarted);

        info!("Backend server closing");
        self.shutdown.send_replace(true);
        Ok(())
    }
}

async fn serve_plain(
    listener: ProxyListener,
    app: Router,
    shutdown: watch::Receiver<bool>,
) -> io::Result<()> {
    let kind = listener.kind();
    let (listener, closed) = ChannelListener::new(listener);
    axum::serve(listener, app)
        .with_graceful_shutdown(stop_signal(kind, shutdown, closed))
        .await
}

async fn serve_tls(
    listener: ProxyListener,
    acceptor: TlsAcceptor,
    app: Router,
    shutdown: watch::Receiver<bool>,
) -> io::Result<()> {
    let kind = listener.kind();
    let (channel, closed) = ChannelListener::new(listener);
    let listener = TlsChannelListener::spawn(channel, acceptor);
    axum::serve(listener, app)
        .with_graceful_shutdown(stop_signal(kind, shutdown, closed))
        .await
}

async fn stop_signal(
    kind: ChannelKind,
    mut shutdown: watch::Receiver<bool>,
    mut closed: watch::Receiver<bool>,
) {
    tokio::select! {
        _ = shutdown.wait_for(|stop| *stop) => {
            info!(channel = %kind, "Handoff channel server shutting down");
        }
        _ = closed.wait_for(|closed| *closed) => {
            info!(channel = %kind, "Proxy closed handoff channel");
        }
    }
}

/// Adapts a [`ProxyListener`] to axum's accept loop.
struct ChannelListener {
    inner: ProxyListener,
    closed: watch::Sender<bool>,
}

impl ChannelListener {
    fn new(inner: ProxyListener) -> (Self, watch::Receiver<bool>) {
        let (closed, rx) = watch::channel(false);
        (Self { inner, closed }, rx)
    }
}

impl Listener for ChannelListener {
    type Io = ProxiedStream;
    type Addr = Option<SocketAddr>;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        loop {
            match self.inner.accept().await {
                Ok(stream) => {
                    let addr = stream.peer_addr().ok();
                    return (stream, addr);
                }
                Err(HandoffError::Closed) => {
                    self.closed.send_replace(true);
                    // Graceful shutdown stops polling this future.
                    std::future::pending::<()>().await;
                }
                Err(HandoffError::Io(e)) if e.kind() == io::ErrorKind::ConnectionReset => {
                    self.closed.send_replace(true);
                    std::future::pending::<()>().await;
                }
                Err(
                    e @ (HandoffError::InvalidDescriptorCount(_) | HandoffError::InvalidLength(_)),
                ) => {
                    // The listener dropped the channel; nothing more will arrive.
                    warn!(channel = %self.inner.kind(), error = %e, "Handoff channel out of sync");
                    self.closed.send_replace(true);
                    std::future::pending::<()>().await;
                }
                Err(e) => {
                    warn!(channel = %self.inner.kind(), error = %e, "Failed to receive handoff");
                    tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                }
            }
        }
    }

    fn local_addr(&self) -> io::Result<Self::Addr> {
        Ok(None)
    }
}

/// Terminates TLS on connections from a [`ChannelListener`].
///
/// Handshakes run in their own tasks; the accept loop only sees finished
/// TLS streams.
struct TlsChannelListener {
    handshaken: mpsc::Receiver<(TlsStream<ProxiedStream>, Option<SocketAddr>)>,
}

impl TlsChannelListener {
    fn spawn(channel: ChannelListener, acceptor: TlsAcceptor) -> Self {
        let (tx, handshaken) = mpsc::channel(HANDSHAKE_QUEUE);
        tokio::spawn(run_handshakes(channel, acceptor, tx));
        Self { handshaken }
    }
}

async fn run_handshakes(
    mut channel: ChannelListener,
    acceptor: TlsAcceptor,
    tx: mpsc::Sender<(TlsStream<ProxiedStream>, Option<SocketAddr>)>,
) {
    loop {
        let (stream, addr) = tokio::select! {
            accepted = channel.accept() => accepted,
            // The server is gone.
            _ = tx.closed() => return,
        };

        let acceptor = acceptor.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            match tokio::time::timeout(TLS_HANDSHAKE_TIMEOUT, acceptor.accept(stream)).await {
                Ok(Ok(tls)) => {
                    let _ = tx.send((tls, addr)).await;
                }
                Ok(Err(e)) => debug!(peer = ?addr, error = %e, "TLS handshake failed"),
                Err(_) => debug!(peer = ?addr, "TLS handshake timed out"),
            }
        });
    }
}

impl Listener for TlsChannelListener {
    type Io = TlsStream<ProxiedStream>;
    type Addr = Option<SocketAddr>;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        match self.handshaken.recv().await {
            Some(accepted) => accepted,
            // Graceful shutdown stops polling this future.
            None => std::future::pending().await,
        }
    }

    fn local_addr(&self) -> io::Result<Self::Addr> {
        Ok(None)
    }
}

//! Listeners, accept loops and connection dispatch.
//!
//! Each listener runs its own accept loop and every accepted connection
//! gets its own task: sniff the hostname, pick a host, hand the socket and
//! the sniffed bytes to that host's channel for the listener.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use hostmux_handoff::ChannelKind;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn, Instrument};

use crate::error::ProxyError;
use crate::host::{Host, HostInner, SpawnSpec};
use crate::router::RouteTable;
use crate::sniff::{sniff_http, sniff_tls, SniffError};

/// Sent to HTTP clients whose header block exceeds `MAX_HEADER_SIZE`.
pub const HEADERS_TOO_LARGE: &[u8] =
    b"HTTP/1.0 413\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";

/// Sent to HTTP clients whose headers could not be read.
pub const BAD_REQUEST: &[u8] = b"HTTP/1.0 400\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";

/// Delay before accepting again after a transient accept error.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Statistics for a listener.
#[derive(Debug, Default)]
pub struct ListenerStats {
    /// Total connections accepted.
    pub connections_accepted: AtomicU64,
    /// Connections still being sniffed or handed off.
    pub connections_active: AtomicU64,
    /// Connections this process is done with.
    pub connections_closed: AtomicU64,
    /// Malformed or unreadable preambles.
    pub sniff_failed: AtomicU64,
    /// Header blocks or handshakes over `MAX_HEADER_SIZE`.
    pub headers_too_large: AtomicU64,
    /// Connections handed to a backend.
    pub transferred: AtomicU64,
    /// Handoffs that failed or had no channel to go to.
    pub transfer_failed: AtomicU64,
}

#[derive(Default)]
struct Listeners {
    http: Option<TcpListener>,
    https: Option<TcpListener>,
}

impl Listeners {
    fn take(&mut self) -> Vec<(ChannelKind, TcpListener)> {
        let http = self.http.take().map(|l| (ChannelKind::Http, l));
        let https = self.https.take().map(|l| (ChannelKind::Https, l));
        http.into_iter().chain(https).collect()
    }
}

#[derive(Default)]
struct RunState {
    started: bool,
    closed: bool,
}

pub(crate) struct ProxyInner {
    pub(crate) routes: RouteTable<HostInner>,
    /// Kinds of the listeners given at construction.
    kinds: Vec<ChannelKind>,
    http_addr: Option<SocketAddr>,
    https_addr: Option<SocketAddr>,
    /// Handed to the accept loops on start.
    listeners: Mutex<Listeners>,
    state: Mutex<RunState>,
    hosts: Mutex<Vec<Weak<HostInner>>>,
    http_stats: ListenerStats,
    https_stats: ListenerStats,
    shutdown: watch::Sender<bool>,
    done: watch::Sender<bool>,
    /// First accept loop failure, reported once by `wait`.
    error: Mutex<Option<io::Error>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ProxyInner {
    pub(crate) fn kinds(&self) -> &[ChannelKind] {
        &self.kinds
    }

    pub(crate) fn is_closed(&self) -> bool {
        lock(&self.state).closed
    }

    fn stats(&self, kind: ChannelKind) -> &ListenerStats {
        match kind {
            ChannelKind::Http => &self.http_stats,
            ChannelKind::Https => &self.https_stats,
        }
    }
}

/// Routes HTTP and HTTPS connections to backend processes by hostname.
///
/// Cloning yields another handle to the same proxy.
#[derive(Clone)]
pub struct Proxy {
    inner: Arc<ProxyInner>,
}

impl Proxy {
    /// Create a proxy over already bound listeners.
    ///
    /// Connections on `http` are routed by `Host` header, connections on
    /// `https` by TLS SNI. Hosts get one channel per listener given here.
    pub fn new(http: Option<TcpListener>, https: Option<TcpListener>) -> Self {
        let http_addr = http.as_ref().and_then(|l| l.local_addr().ok());
        let https_addr = https.as_ref().and_then(|l| l.local_addr().ok());
        let mut kinds = Vec::with_capacity(2);
        if http.is_some() {
            kinds.push(ChannelKind::Http);
        }
        if https.is_some() {
            kinds.push(ChannelKind::Https);
        }

        Self {
            inner: Arc::new(ProxyInner {
                routes: RouteTable::new(),
                kinds,
                http_addr,
                https_addr,
                listeners: Mutex::new(Listeners { http, https }),
                state: Mutex::new(RunState::default()),
                hosts: Mutex::new(Vec::new()),
                http_stats: ListenerStats::default(),
                https_stats: ListenerStats::default(),
                shutdown: watch::Sender::new(false),
                done: watch::Sender::new(false),
                error: Mutex::new(None),
            }),
        }
    }

    /// Address of the `kind` listener, if the proxy has one.
    pub fn local_addr(&self, kind: ChannelKind) -> Option<SocketAddr> {
        match kind {
            ChannelKind::Http => self.inner.http_addr,
            ChannelKind::Https => self.inner.https_addr,
        }
    }

    /// Get listener statistics.
    pub fn stats(&self, kind: ChannelKind) -> &ListenerStats {
        self.inner.stats(kind)
    }

    /// Spawn a backend and register it with this proxy.
    ///
    /// Must be called within a tokio runtime.
    pub fn new_host(&self, spec: SpawnSpec) -> Result<Host, ProxyError> {
        let state = lock(&self.inner.state);
        if state.closed {
            return Err(ProxyError::ProxyClosed);
        }

        let host = Host::spawn(&self.inner, spec)?;
        let mut hosts = lock(&self.inner.hosts);
        hosts.retain(|host| host.strong_count() > 0);
        hosts.push(Arc::downgrade(host.inner()));
        drop(hosts);
        drop(state);

        Ok(host)
    }

    /// Route connections with no matching alias to `host`.
    pub fn set_default(&self, host: &Host) -> Result<(), ProxyError> {
        if !host.inner().belongs_to(&self.inner) {
            return Err(ProxyError::ForeignHost);
        }
        if host.is_stopped() {
            return Err(ProxyError::HostStopped);
        }
        self.inner.routes.set_default(Arc::clone(host.inner()));
        info!(host = %host.name(), "Default host set");
        Ok(())
    }

    pub fn is_default(&self, host: &Host) -> bool {
        self.inner.routes.is_default(host.inner())
    }

    pub fn default_host(&self) -> Option<Host> {
        self.inner.routes.default_owner().map(Host::from_inner)
    }

    /// Start accepting in the background.
    pub fn start(&self) -> Result<(), ProxyError> {
        let listeners = {
            let mut state = lock(&self.inner.state);
            if state.closed {
                return Err(ProxyError::Stopped);
            }
            if state.started {
                return Err(ProxyError::Running);
            }
            if self.inner.routes.default_owner().is_none() {
                return Err(ProxyError::NoDefault);
            }
            state.started = true;
            lock(&self.inner.listeners).take()
        };

        let mut loops = JoinSet::new();
        for (kind, listener) in listeners {
            loops.spawn(accept_loop(Arc::clone(&self.inner), listener, kind));
        }

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            while let Some(joined) = loops.join_next().await {
                let result = joined.unwrap_or_else(|e| Err(io::Error::other(e)));
                if let Err(e) = result {
                    error!(error = %e, "Listener failed, shutting down");
                    let mut first = lock(&inner.error);
                    if first.is_none() {
                        *first = Some(e);
                    }
                    drop(first);
                    inner.shutdown.send_replace(true);
                }
            }
            inner.done.send_replace(true);
        });

        info!("Proxy started");
        Ok(())
    }

    /// Start accepting and wait until the proxy stops.
    pub async fn run(&self) -> Result<(), ProxyError> {
        self.start()?;
        self.wait().await
    }

    /// Wait until every accept loop has exited.
    ///
    /// Returns the first listener failure. Shutdown through
    /// [`close`](Self::close) is not an error.
    pub async fn wait(&self) -> Result<(), ProxyError> {
        if !lock(&self.inner.state).started {
            return Err(ProxyError::NotRunning);
        }

        let mut done = self.inner.done.subscribe();
        // The sender lives in `self`, so this cannot fail.
        let _ = done.wait_for(|done| *done).await;

        match lock(&self.inner.error).take() {
            Some(e) => Err(ProxyError::Accept(e)),
            None => Ok(()),
        }
    }

    /// Stop accepting and stop every host, the default one included.
    ///
    /// Connections already being sniffed or handed off are not interrupted
    /// and backends are not killed.
    pub async fn close(&self) -> Result<(), ProxyError> {
        {
            let mut state = lock(&self.inner.state);
            if state.closed {
                return Err(ProxyError::Stopped);
            }
            state.closed = true;
        }
        info!("Proxy closing");

        drop(lock(&self.inner.listeners).take());
        self.inner.shutdown.send_replace(true);

        let hosts: Vec<Host> = lock(&self.inner.hosts)
            .drain(..)
            .filter_map(|host| host.upgrade())
            .map(Host::from_inner)
            .collect();
        for host in hosts {
            if let Err(e) = host.stop().await {
                warn!(host = %host.name(), error = %e, "Failed to stop host");
            }
        }
        Ok(())
    }
}

async fn accept_loop(
    inner: Arc<ProxyInner>,
    listener: TcpListener,
    kind: ChannelKind,
) -> io::Result<()> {
    let local_addr = listener.local_addr()?;
    let mut shutdown = inner.shutdown.subscribe();
    info!(listener = %kind, bind_addr = %local_addr, "Listener started");

    loop {
        let accepted = tokio::select! {
            _ = shutdown.wait_for(|stop| *stop) => {
                info!(listener = %kind, bind_addr = %local_addr, "Listener closed");
                return Ok(());
            }
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer_addr)) => {
                let stats = inner.stats(kind);
                stats.connections_accepted.fetch_add(1, Ordering::Relaxed);
                stats.connections_active.fetch_add(1, Ordering::Relaxed);

                let inner = Arc::clone(&inner);
                tokio::spawn(
                    async move {
                        handle_connection(&inner, stream, kind).await;

                        let stats = inner.stats(kind);
                        stats.connections_active.fetch_sub(1, Ordering::Relaxed);
                        stats.connections_closed.fetch_add(1, Ordering::Relaxed);
                    }
                    .instrument(tracing::info_span!("connection", peer = %peer_addr, listener = %kind)),
                );
            }
            Err(e) if is_transient(&e) => {
                warn!(listener = %kind, error = %e, "Accept error");
                // Brief sleep to avoid tight loop on persistent errors
                tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Accept errors that concern one connection or pressure that may ease.
fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    ) || matches!(
        e.raw_os_error(),
        Some(libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM)
    )
}

/// Sniff, route and hand off one connection.
async fn handle_connection(inner: &ProxyInner, mut client: TcpStream, kind: ChannelKind) {
    let stats = inner.stats(kind);
    let sniffed = match kind {
        ChannelKind::Http => sniff_http(&mut client).await,
        ChannelKind::Https => sniff_tls(&mut client).await,
    };

    let sniffed = match sniffed {
        Ok(sniffed) => sniffed,
        Err(SniffError::TooLarge) => {
            stats.headers_too_large.fetch_add(1, Ordering::Relaxed);
            debug!("Headers too large");
            // A TLS client would not understand a plaintext response.
            if kind == ChannelKind::Http {
                let _ = client.write_all(HEADERS_TOO_LARGE).await;
            }
            return;
        }
        Err(e) => {
            stats.sniff_failed.fetch_add(1, Ordering::Relaxed);
            debug!(error = %e, "Sniff failed");
            if kind == ChannelKind::Http {
                let _ = client.write_all(BAD_REQUEST).await;
            }
            return;
        }
    };

    let Some(host) = inner.routes.route(&sniffed.hostname) else {
        stats.transfer_failed.fetch_add(1, Ordering::Relaxed);
        warn!(hostname = %sniffed.hostname, "No host for connection");
        return;
    };
    let Some(channel) = host.channel(kind) else {
        stats.transfer_failed.fetch_add(1, Ordering::Relaxed);
        debug!(host = %host.name(), "Host has no open channel");
        return;
    };

    match channel.transfer(&client, &sniffed.consumed).await {
        Ok(()) => {
            stats.transferred.fetch_add(1, Ordering::Relaxed);
            debug!(
                hostname = %sniffed.hostname,
                host = %host.name(),
                prefix_len = sniffed.consumed.len(),
                "Connection handed off"
            );
        }
        Err(e) => {
            stats.transfer_failed.fetch_add(1, Ordering::Relaxed);
            warn!(host = %host.name(), error = %e, "Handoff failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use hostmux_handoff::{ProxiedStream, ProxyListener, MAX_HEADER_SIZE};
    use tokio::io::AsyncReadExt;

    use super::*;
    use crate::sniff::client_hello;
    use crate::test_support::{kill, sleeper};

    struct Fixture {
        proxy: Proxy,
        site: Host,
        fallback: Host,
    }

    impl Fixture {
        /// Proxy with `a.test` on `site` and `fallback` as the default, started.
        async fn start(with_http: bool, with_https: bool) -> Self {
            let http = match with_http {
                true => Some(TcpListener::bind("127.0.0.1:0").await.unwrap()),
                false => None,
            };
            let https = match with_https {
                true => Some(TcpListener::bind("127.0.0.1:0").await.unwrap()),
                false => None,
            };
            let proxy = Proxy::new(http, https);

            let site = proxy.new_host(sleeper("site")).unwrap();
            let fallback = proxy.new_host(sleeper("fallback")).unwrap();
            site.add_aliases(["a.test", "secure.test"]).unwrap();
            proxy.set_default(&fallback).unwrap();
            proxy.start().unwrap();

            Self {
                proxy,
                site,
                fallback,
            }
        }

        async fn connect(&self, kind: ChannelKind) -> TcpStream {
            let addr = self.proxy.local_addr(kind).unwrap();
            TcpStream::connect(addr).await.unwrap()
        }

        async fn shutdown(self) {
            self.proxy.close().await.unwrap();
            tokio::time::timeout(Duration::from_secs(5), self.proxy.wait())
                .await
                .unwrap()
                .unwrap();
            kill(&self.site);
            kill(&self.fallback);
        }
    }

    fn backend(host: &Host, kind: ChannelKind) -> ProxyListener {
        let channel = host.inner().channel(kind).unwrap();
        ProxyListener::from_fd(channel.dup_child_end(0).unwrap(), kind).unwrap()
    }

    async fn accept(backend: &ProxyListener) -> ProxiedStream {
        tokio::time::timeout(Duration::from_secs(5), backend.accept())
            .await
            .unwrap()
            .unwrap()
    }

    async fn assert_idle(backend: &ProxyListener) {
        let pending = tokio::time::timeout(Duration::from_millis(100), backend.accept()).await;
        assert!(pending.is_err(), "unexpected handoff");
    }

    #[tokio::test]
    async fn host_header_routes_to_alias() {
        let fx = Fixture::start(true, false).await;
        let site = backend(&fx.site, ChannelKind::Http);
        let fallback = backend(&fx.fallback, ChannelKind::Http);

        let mut client = fx.connect(ChannelKind::Http).await;
        client
            .write_all(b"GET / HTTP/1.1\r\nHost: a.test\r\n\r\n")
            .await
            .unwrap();

        let mut conn = accept(&site).await;
        assert_eq!(conn.pending_prefix(), b"GET / HTTP/1.1\r\nHost: a.test\r\n");
        assert_eq!(conn.pending_prefix().len(), 30);

        let mut request = [0u8; 32];
        conn.read_exact(&mut request).await.unwrap();
        assert_eq!(&request, b"GET / HTTP/1.1\r\nHost: a.test\r\n\r\n");
        assert_idle(&fallback).await;

        conn.write_all(b"HTTP/1.0 204\r\n\r\n").await.unwrap();
        drop(conn);
        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        assert_eq!(response, b"HTTP/1.0 204\r\n\r\n");

        let stats = fx.proxy.stats(ChannelKind::Http);
        assert_eq!(stats.transferred.load(Ordering::Relaxed), 1);
        fx.shutdown().await;
    }

    #[tokio::test]
    async fn unknown_or_missing_host_routes_to_default() {
        let fx = Fixture::start(true, false).await;
        let site = backend(&fx.site, ChannelKind::Http);
        let fallback = backend(&fx.fallback, ChannelKind::Http);

        for request in [
            &b"GET / HTTP/1.1\r\nHost: other.test\r\n\r\n"[..],
            &b"GET / HTTP/1.0\r\n\r\n"[..],
        ] {
            let mut client = fx.connect(ChannelKind::Http).await;
            client.write_all(request).await.unwrap();
            let conn = accept(&fallback).await;
            assert!(request.starts_with(conn.pending_prefix()));
        }
        assert_idle(&site).await;

        // Port and case do not matter.
        let mut client = fx.connect(ChannelKind::Http).await;
        client
            .write_all(b"GET / HTTP/1.1\r\nHost: A.Test:8080\r\n\r\n")
            .await
            .unwrap();
        accept(&site).await;

        fx.shutdown().await;
    }

    #[tokio::test]
    async fn malformed_http_gets_400() {
        let fx = Fixture::start(true, false).await;

        let mut client = fx.connect(ChannelKind::Http).await;
        client.write_all(b"GET / HTTP/1.1\r\nAcc").await.unwrap();
        client.shutdown().await.unwrap();

        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        assert_eq!(response, BAD_REQUEST);

        fx.shutdown().await;
    }

    #[tokio::test]
    async fn oversized_http_headers_get_413() {
        let fx = Fixture::start(true, false).await;

        let mut client = fx.connect(ChannelKind::Http).await;
        client.write_all(&[b'a'; MAX_HEADER_SIZE]).await.unwrap();

        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        assert_eq!(response, HEADERS_TOO_LARGE);
        let stats = fx.proxy.stats(ChannelKind::Http);
        assert_eq!(stats.headers_too_large.load(Ordering::Relaxed), 1);

        fx.shutdown().await;
    }

    #[tokio::test]
    async fn sni_routes_to_alias_and_missing_sni_to_default() {
        let fx = Fixture::start(false, true).await;
        let site = backend(&fx.site, ChannelKind::Https);
        let fallback = backend(&fx.fallback, ChannelKind::Https);

        let hello = client_hello::record(Some("secure.test"));
        let mut client = fx.connect(ChannelKind::Https).await;
        client.write_all(&hello).await.unwrap();
        let conn = accept(&site).await;
        assert_eq!(conn.pending_prefix(), &hello[..]);

        let hello = client_hello::record(None);
        let mut client = fx.connect(ChannelKind::Https).await;
        client.write_all(&hello).await.unwrap();
        let conn = accept(&fallback).await;
        assert_eq!(conn.pending_prefix(), &hello[..]);

        fx.shutdown().await;
    }

    #[tokio::test]
    async fn malformed_tls_is_closed_without_response() {
        let fx = Fixture::start(false, true).await;
        let fallback = backend(&fx.fallback, ChannelKind::Https);

        let mut client = fx.connect(ChannelKind::Https).await;
        client
            .write_all(b"GET / HTTP/1.1\r\nHost: secure.test\r\n\r\n")
            .await
            .unwrap();
        client.shutdown().await.unwrap();

        let mut response = Vec::new();
        let _ = client.read_to_end(&mut response).await;
        assert!(response.is_empty());
        assert_idle(&fallback).await;

        fx.shutdown().await;
    }

    #[tokio::test]
    async fn lifecycle_errors() {
        let http = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy = Proxy::new(Some(http), None);
        assert!(matches!(proxy.start(), Err(ProxyError::NoDefault)));
        assert!(matches!(proxy.wait().await, Err(ProxyError::NotRunning)));

        let host = proxy.new_host(sleeper("only")).unwrap();
        proxy.set_default(&host).unwrap();
        assert!(proxy.is_default(&host));
        proxy.start().unwrap();
        assert!(matches!(proxy.start(), Err(ProxyError::Running)));

        let runner = tokio::spawn({
            let proxy = proxy.clone();
            async move { proxy.wait().await }
        });

        proxy.close().await.unwrap();
        assert!(matches!(proxy.close().await, Err(ProxyError::Stopped)));
        assert!(matches!(proxy.start(), Err(ProxyError::Stopped)));
        assert!(matches!(
            proxy.new_host(sleeper("late")),
            Err(ProxyError::ProxyClosed)
        ));

        tokio::time::timeout(Duration::from_secs(5), runner)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(host.is_stopped());
        kill(&host);
    }

    #[tokio::test]
    async fn set_default_checks_host() {
        let http = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy = Proxy::new(Some(http), None);
        let other = Proxy::new(None, None);

        let a = proxy.new_host(sleeper("a")).unwrap();
        let b = proxy.new_host(sleeper("b")).unwrap();
        let stranger = other.new_host(sleeper("stranger")).unwrap();

        assert!(matches!(
            proxy.set_default(&stranger),
            Err(ProxyError::ForeignHost)
        ));

        b.stop().await.unwrap();
        assert!(matches!(
            proxy.set_default(&b),
            Err(ProxyError::HostStopped)
        ));

        proxy.set_default(&a).unwrap();
        assert_eq!(proxy.default_host().unwrap().name(), "a");

        kill(&a);
        kill(&b);
        kill(&stranger);
    }
}

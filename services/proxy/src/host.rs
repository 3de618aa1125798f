//! Backend process registration.
//!
//! A [`Host`] is one backend process together with the aliases it serves
//! and one transfer channel per proxy listener. The child ends of the
//! channels are inherited by the process at fixed descriptor slots, which
//! are announced through `HOSTMUX_HTTP_SOCKET` / `HOSTMUX_HTTPS_SOCKET`.

use std::collections::BTreeMap;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use hostmux_handoff::{ChannelKind, TransferChannel};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::error::ProxyError;
use crate::proxy::ProxyInner;
use crate::router::normalize_hostname;

/// First descriptor slot after stdio.
const FIRST_INHERITED_SLOT: RawFd = 3;

/// Child ends are duplicated at or above this number before spawning, so
/// moving them into their slots never clobbers another one.
const CHILD_FD_FLOOR: RawFd = 10;

/// How to start a backend process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpawnSpec {
    /// Name used in logs.
    pub name: String,
    pub command: PathBuf,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    /// Added to the proxy's own environment.
    pub env: BTreeMap<String, String>,
    /// Run as this user instead of the proxy's.
    pub uid: Option<u32>,
    /// Run as this group instead of the proxy's.
    pub gid: Option<u32>,
}

impl SpawnSpec {
    pub fn new(name: impl Into<String>, command: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            ..Default::default()
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }
}

/// Transfer channels of one backend process.
#[derive(Default)]
struct Channels {
    http: Option<Arc<TransferChannel>>,
    https: Option<Arc<TransferChannel>>,
}

impl Channels {
    fn get(&self, kind: ChannelKind) -> Option<&Arc<TransferChannel>> {
        match kind {
            ChannelKind::Http => self.http.as_ref(),
            ChannelKind::Https => self.https.as_ref(),
        }
    }

    fn set(&mut self, kind: ChannelKind, channel: Arc<TransferChannel>) {
        match kind {
            ChannelKind::Http => self.http = Some(channel),
            ChannelKind::Https => self.https = Some(channel),
        }
    }

    async fn close(self) {
        for channel in [self.http, self.https].into_iter().flatten() {
            if let Err(e) = channel.close().await {
                warn!(error = %e, "Failed to close transfer channel");
            }
        }
    }
}

struct HostState {
    spec: SpawnSpec,
    pid: Option<u32>,
    /// In registration order.
    aliases: Vec<String>,
    channels: Channels,
    stopped: bool,
}

pub(crate) struct HostInner {
    name: String,
    proxy: Weak<ProxyInner>,
    state: Mutex<HostState>,
}

impl HostInner {
    fn lock(&self) -> MutexGuard<'_, HostState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    /// Current channel for connections from the `kind` listener.
    pub(crate) fn channel(&self, kind: ChannelKind) -> Option<Arc<TransferChannel>> {
        self.lock().channels.get(kind).cloned()
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.lock().stopped
    }

    pub(crate) fn belongs_to(&self, proxy: &Arc<ProxyInner>) -> bool {
        std::ptr::eq(self.proxy.as_ptr(), Arc::as_ptr(proxy))
    }
}

/// A running backend registered with a [`Proxy`](crate::Proxy).
///
/// Cloning yields another handle to the same host.
#[derive(Clone)]
pub struct Host {
    inner: Arc<HostInner>,
}

impl Host {
    /// Start the backend described by `spec` with a channel per listener.
    pub(crate) fn spawn(proxy: &Arc<ProxyInner>, spec: SpawnSpec) -> Result<Self, ProxyError> {
        let spawned = spawn_backend(&spec, proxy.kinds())?;
        info!(host = %spec.name, pid = ?spawned.pid, "Backend started");

        Ok(Self {
            inner: Arc::new(HostInner {
                name: spec.name.clone(),
                proxy: Arc::downgrade(proxy),
                state: Mutex::new(HostState {
                    spec,
                    pid: spawned.pid,
                    aliases: Vec::new(),
                    channels: spawned.channels,
                    stopped: false,
                }),
            }),
        })
    }

    pub(crate) fn from_inner(inner: Arc<HostInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn inner(&self) -> &Arc<HostInner> {
        &self.inner
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Process id of the current backend process.
    pub fn pid(&self) -> Option<u32> {
        self.inner.lock().pid
    }

    /// Aliases owned by this host, in registration order.
    pub fn aliases(&self) -> Vec<String> {
        self.inner.lock().aliases.clone()
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.is_stopped()
    }

    fn proxy(&self) -> Result<Arc<ProxyInner>, ProxyError> {
        self.inner.proxy.upgrade().ok_or(ProxyError::ProxyClosed)
    }

    /// Route `names` to this host.
    ///
    /// Stops at the first name another host owns and reports it. Names
    /// registered earlier in the same call stay registered.
    pub fn add_aliases<I, S>(&self, names: I) -> Result<(), ProxyError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let proxy = self.proxy()?;
        let mut state = self.inner.lock();
        if state.stopped {
            return Err(ProxyError::HostStopped);
        }

        for name in names {
            let name = normalize_hostname(name.as_ref());
            if state.aliases.contains(&name) {
                continue;
            }
            if !proxy.routes.claim(&name, &self.inner) {
                return Err(ProxyError::AliasInUse(name));
            }
            debug!(host = %self.inner.name, alias = %name, "Alias added");
            state.aliases.push(name);
        }
        Ok(())
    }

    /// Stop routing `name` to this host.
    pub fn remove_alias(&self, name: &str) -> Result<(), ProxyError> {
        let name = normalize_hostname(name);
        let mut state = self.inner.lock();
        let Some(pos) = state.aliases.iter().position(|alias| *alias == name) else {
            return Err(ProxyError::UnknownAlias(name));
        };
        state.aliases.remove(pos);
        if let Some(proxy) = self.inner.proxy.upgrade() {
            proxy.routes.release(&name, &self.inner);
        }
        debug!(host = %self.inner.name, alias = %name, "Alias removed");
        Ok(())
    }

    /// Start a new process from the same spec and retire the old one.
    ///
    /// The old channels are closed only once the new process is running.
    /// The old process is not signalled; it sees its channels close.
    pub async fn restart(&self) -> Result<(), ProxyError> {
        let spec = self.inner.lock().spec.clone();
        self.swap(spec).await
    }

    /// Like [`restart`](Self::restart), with a different spec.
    pub async fn replace(&self, spec: SpawnSpec) -> Result<(), ProxyError> {
        self.swap(spec).await
    }

    async fn swap(&self, spec: SpawnSpec) -> Result<(), ProxyError> {
        let proxy = self.proxy()?;
        if proxy.is_closed() {
            return Err(ProxyError::ProxyClosed);
        }
        if self.is_stopped() {
            return Err(ProxyError::HostStopped);
        }

        let Spawned { pid, mut channels } = spawn_backend(&spec, proxy.kinds())?;
        let stopped = {
            let mut state = self.inner.lock();
            if !state.stopped {
                state.spec = spec;
                state.pid = pid;
                std::mem::swap(&mut state.channels, &mut channels);
            }
            state.stopped
        };
        // The old channels, or the new ones if the host stopped meanwhile.
        channels.close().await;
        if stopped {
            return Err(ProxyError::HostStopped);
        }

        info!(host = %self.inner.name, pid = ?pid, "Backend replaced");
        Ok(())
    }

    /// Close the channels and release every alias.
    ///
    /// Fails with [`ProxyError::IsDefault`] for the default host unless
    /// the proxy is closing. Stopping twice is a no-op.
    pub async fn stop(&self) -> Result<(), ProxyError> {
        let proxy = self.inner.proxy.upgrade();
        if let Some(proxy) = &proxy {
            if proxy.routes.is_default(&self.inner) && !proxy.is_closed() {
                return Err(ProxyError::IsDefault);
            }
        }

        let (channels, aliases) = {
            let mut state = self.inner.lock();
            if state.stopped {
                debug!(host = %self.inner.name, "Host already stopped");
                return Ok(());
            }
            state.stopped = true;
            (
                std::mem::take(&mut state.channels),
                std::mem::take(&mut state.aliases),
            )
        };

        if let Some(proxy) = &proxy {
            for alias in &aliases {
                proxy.routes.release(alias, &self.inner);
            }
        }
        channels.close().await;

        info!(host = %self.inner.name, "Host stopped");
        Ok(())
    }
}

impl std::fmt::Debug for Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Host")
            .field("name", &self.inner.name)
            .field("pid", &self.pid())
            .finish()
    }
}

struct Spawned {
    pid: Option<u32>,
    channels: Channels,
}

/// Create channels for `kinds` and start the process with their child ends.
///
/// On failure every channel created here is dropped, closing it.
fn spawn_backend(spec: &SpawnSpec, kinds: &[ChannelKind]) -> Result<Spawned, ProxyError> {
    let mut cmd = Command::new(&spec.command);
    cmd.args(&spec.args)
        .envs(&spec.env)
        .stdin(Stdio::null())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit());
    if let Some(dir) = &spec.working_dir {
        cmd.current_dir(dir);
    }

    let mut channels = Channels::default();
    let mut child_ends: Vec<(OwnedFd, RawFd)> = Vec::with_capacity(kinds.len());
    for (slot, &kind) in (FIRST_INHERITED_SLOT..).zip(kinds) {
        let channel = Arc::new(TransferChannel::new()?);
        child_ends.push((channel.dup_child_end(CHILD_FD_FLOOR)?, slot));
        cmd.env(kind.env_var(), slot.to_string());
        channels.set(kind, channel);
    }

    let moves: Vec<(RawFd, RawFd)> = child_ends
        .iter()
        .map(|(fd, slot)| (fd.as_raw_fd(), *slot))
        .collect();
    let (uid, gid) = (spec.uid, spec.gid);

    // SAFETY: runs between fork and exec and only calls async-signal-safe
    // functions, without allocating.
    unsafe {
        cmd.pre_exec(move || {
            for &(fd, slot) in &moves {
                // dup2 leaves the new slot without close-on-exec.
                if libc::dup2(fd, slot) < 0 {
                    return Err(io::Error::last_os_error());
                }
            }
            if uid.is_some() || gid.is_some() {
                // Set supplementary groups to empty
                if libc::setgroups(0, std::ptr::null()) != 0 {
                    return Err(io::Error::last_os_error());
                }
            }
            // GID first, it cannot change after dropping root
            if let Some(gid) = gid {
                if libc::setgid(gid) != 0 {
                    return Err(io::Error::last_os_error());
                }
            }
            if let Some(uid) = uid {
                if libc::setuid(uid) != 0 {
                    return Err(io::Error::last_os_error());
                }
            }
            Ok(())
        });
    }

    let child = cmd.spawn().map_err(|source| ProxyError::Spawn {
        name: spec.name.clone(),
        source,
    })?;
    drop(child_ends);

    let pid = child.id();
    tokio::spawn(reap(spec.name.clone(), child));
    Ok(Spawned { pid, channels })
}

async fn reap(name: String, mut child: Child) {
    let pid = child.id();
    match child.wait().await {
        Ok(status) => info!(host = %name, pid = ?pid, status = %status, "Backend exited"),
        Err(e) => warn!(host = %name, pid = ?pid, error = %e, "Failed to wait for backend"),
    }
}

#[cfg(test)]
mod tests {
    use hostmux_handoff::{ProxyListener, HTTPS_SOCKET_ENV, HTTP_SOCKET_ENV};
    use tokio::net::TcpListener;

    use super::*;
    use crate::proxy::Proxy;
    use crate::test_support::{kill, sleeper};

    async fn proxy() -> Proxy {
        let http = TcpListener::bind("127.0.0.1:0").await.unwrap();
        Proxy::new(Some(http), None)
    }

    #[tokio::test]
    async fn spawn_sets_inherited_slot() {
        let proxy = proxy().await;
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("ok");
        let script = format!(
            "test \"${HTTP_SOCKET_ENV}\" = 3 && test -S /dev/fd/3 && test -z \"${HTTPS_SOCKET_ENV}\" && touch {}",
            marker.display()
        );
        let spec = SpawnSpec::new("env-check", "/bin/sh").args(["-c".to_string(), script]);

        let host = proxy.new_host(spec).unwrap();
        assert!(host.pid().is_some());
        assert!(host.inner().channel(ChannelKind::Http).is_some());
        assert!(host.inner().channel(ChannelKind::Https).is_none());

        for _ in 0..100 {
            if marker.exists() {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
        panic!("backend did not see its inherited channel");
    }

    #[tokio::test]
    async fn spawn_failure_is_reported() {
        let proxy = proxy().await;
        let spec = SpawnSpec::new("missing", "/nonexistent/hostmux-backend");
        assert!(matches!(
            proxy.new_host(spec),
            Err(ProxyError::Spawn { .. })
        ));
    }

    #[tokio::test]
    async fn aliases_are_exclusive_and_not_rolled_back() {
        let proxy = proxy().await;
        let a = proxy.new_host(sleeper("a")).unwrap();
        let b = proxy.new_host(sleeper("b")).unwrap();

        a.add_aliases(["shared.test"]).unwrap();
        let err = b
            .add_aliases(["first.test", "Shared.Test", "never.test"])
            .unwrap_err();
        assert!(matches!(err, ProxyError::AliasInUse(name) if name == "shared.test"));

        assert_eq!(a.aliases(), ["shared.test"]);
        assert_eq!(b.aliases(), ["first.test"]);

        assert!(matches!(
            b.remove_alias("shared.test"),
            Err(ProxyError::UnknownAlias(_))
        ));
        b.remove_alias("first.test").unwrap();
        assert!(b.aliases().is_empty());

        kill(&a);
        kill(&b);
    }

    #[tokio::test]
    async fn stop_releases_aliases_and_closes_channels() {
        let proxy = proxy().await;
        let default = proxy.new_host(sleeper("default")).unwrap();
        let host = proxy.new_host(sleeper("site")).unwrap();
        proxy.set_default(&default).unwrap();
        host.add_aliases(["site.test"]).unwrap();

        let channel = host.inner().channel(ChannelKind::Http).unwrap();
        let backend =
            ProxyListener::from_fd(channel.dup_child_end(0).unwrap(), ChannelKind::Http).unwrap();

        host.stop().await.unwrap();
        host.stop().await.unwrap();
        assert!(host.is_stopped());
        assert!(host.aliases().is_empty());
        assert!(channel.is_closed().await);
        assert!(backend.accept().await.is_err());
        assert!(matches!(
            host.add_aliases(["site.test"]),
            Err(ProxyError::HostStopped)
        ));

        default.add_aliases(["site.test"]).unwrap();
        assert!(matches!(default.stop().await, Err(ProxyError::IsDefault)));

        kill(&default);
        kill(&host);
    }

    #[tokio::test]
    async fn failed_replace_keeps_running_backend() {
        let proxy = proxy().await;
        let host = proxy.new_host(sleeper("site")).unwrap();
        let pid = host.pid();
        let channel = host.inner().channel(ChannelKind::Http).unwrap();
        let backend =
            ProxyListener::from_fd(channel.dup_child_end(0).unwrap(), ChannelKind::Http).unwrap();

        let result = host
            .replace(SpawnSpec::new("site-v2", "/nonexistent/hostmux-backend"))
            .await;
        assert!(matches!(result, Err(ProxyError::Spawn { .. })));
        assert_eq!(host.pid(), pid);
        assert!(!host.is_stopped());

        let current = host.inner().channel(ChannelKind::Http).unwrap();
        assert!(Arc::ptr_eq(&channel, &current));
        assert!(!current.is_closed().await);

        // Connections still reach the running backend.
        let tcp = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let _client = tokio::net::TcpStream::connect(tcp.local_addr().unwrap())
            .await
            .unwrap();
        let (accepted, _) = tcp.accept().await.unwrap();
        current.transfer(&accepted, b"GET / ").await.unwrap();
        let conn = backend.accept().await.unwrap();
        assert_eq!(conn.pending_prefix(), b"GET / ");

        kill(&host);
    }

    #[tokio::test]
    async fn restart_swaps_process_and_channels() {
        let proxy = proxy().await;
        let host = proxy.new_host(sleeper("site")).unwrap();
        let old_pid = host.pid();
        let old_channel = host.inner().channel(ChannelKind::Http).unwrap();
        kill(&host);

        host.restart().await.unwrap();
        assert_ne!(host.pid(), old_pid);
        assert!(old_channel.is_closed().await);
        let new_channel = host.inner().channel(ChannelKind::Http).unwrap();
        assert!(!Arc::ptr_eq(&old_channel, &new_channel));

        host.replace(sleeper("site-v2")).await.unwrap();
        assert!(new_channel.is_closed().await);
        assert_eq!(host.name(), "site");

        kill(&host);
    }
}

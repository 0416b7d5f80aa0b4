//! Dispatch for the six daemon RPCs: `set`, `get`, `search`, `prune`,
//! `watch`, `provide`. This is the server half of §4.5 — the tree
//! store and the watcher/provider registries live here, mutated and
//! read under their own locks, with outbound callback RPCs issued only
//! after those locks are released.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use apteryx_registry::{ProviderRegistry, WatcherEntry, WatcherRegistry};
use apteryx_store::Store;
use apteryx_wire::{CallbackReply, CallbackRequest, DaemonReply, DaemonRequest};
use thiserror::Error;
use tokio::net::UnixStream;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tracing::{debug, error, warn};

pub const DEFAULT_TIMEOUT_MS: u64 = 5000;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Path(#[from] apteryx_path::PathError),
    #[error(transparent)]
    Transport(#[from] apteryx_transport::TransportError),
    #[error(transparent)]
    Wire(#[from] apteryx_wire::WireError),
    #[error("callback RPC to {endpoint} timed out after {timeout_ms}ms")]
    Timeout { endpoint: String, timeout_ms: u64 },
    #[error("peer at {endpoint} replied with the wrong message shape for this call")]
    UnexpectedReply { endpoint: String },
}

/// The daemon's in-memory state plus its single RPC timeout. Cheap to
/// clone (everything inside is already reference-counted or `Copy`);
/// one instance is shared across every accepted connection.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    store: Store,
    watchers: WatcherRegistry,
    providers: ProviderRegistry,
    timeout: Duration,
    // Per-path ordering (§4.5/§9): a dedicated async mutex serialises the
    // mutate-then-enqueue step for a given path so concurrent sets to it
    // can't race each other into the notification queue out of order,
    // and a dedicated worker task drains that path's queue one job at a
    // time so delivery itself can't reorder them either.
    path_locks: StdMutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    notify_workers: StdMutex<HashMap<String, mpsc::UnboundedSender<NotifyJob>>>,
}

/// One path's worth of pending watch notifications, resolved against
/// the watcher registry at enqueue time and delivered, in order, by
/// that path's dedicated worker task.
struct NotifyJob {
    path: String,
    value: Vec<u8>,
    watchers: Vec<WatcherEntry>,
}

async fn run_notify_worker(mut jobs: mpsc::UnboundedReceiver<NotifyJob>, timeout: Duration) {
    while let Some(job) = jobs.recv().await {
        for watcher in job.watchers {
            let req = CallbackRequest::WatchNotify {
                path: job.path.clone().into(),
                value: job.value.clone(),
                owner: watcher.owner,
                cb: watcher.cb,
                priv_: watcher.priv_,
            };
            if let Err(e) = call_endpoint(&watcher.endpoint, req, timeout).await {
                warn!(endpoint = %watcher.endpoint, %e, "watch notification delivery failed");
            }
        }
    }
}

impl Dispatcher {
    pub fn new(timeout: Duration) -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                store: Store::new(),
                watchers: WatcherRegistry::new(),
                providers: ProviderRegistry::new(),
                timeout,
                path_locks: StdMutex::new(HashMap::new()),
                notify_workers: StdMutex::new(HashMap::new()),
            }),
        }
    }

    /// The per-path lock that serialises "mutate the store, then enqueue
    /// its notifications" so that two concurrent writers to the same
    /// path can't enqueue in the opposite order to the one their
    /// mutations actually landed in.
    fn path_lock(&self, path: &str) -> Arc<AsyncMutex<()>> {
        self.inner
            .path_locks
            .lock()
            .unwrap()
            .entry(path.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Hand `watchers`' notifications for `path`/`value` to that path's
    /// dedicated worker task, spawning the worker the first time this
    /// path is notified on. Delivery itself then happens off this call's
    /// critical section, one job at a time, in enqueue order.
    fn enqueue_notify(&self, path: &str, value: Vec<u8>, watchers: Vec<WatcherEntry>) {
        let mut workers = self.inner.notify_workers.lock().unwrap();
        let tx = workers.entry(path.to_string()).or_insert_with(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            tokio::spawn(run_notify_worker(rx, self.inner.timeout));
            tx
        });
        let job = NotifyJob {
            path: path.to_string(),
            value,
            watchers,
        };
        if tx.send(job).is_err() {
            warn!(path, "notify worker channel closed unexpectedly");
        }
    }

    /// Route one decoded request to its handler and produce the reply
    /// to send back. This is the single entry point callers (the
    /// listener loop, and tests) drive requests through.
    pub async fn dispatch(&self, request: DaemonRequest) -> DaemonReply {
        match request {
            DaemonRequest::Set { path, value } => self.set(&path, value).await,
            DaemonRequest::Get { path } => self.get(&path).await,
            DaemonRequest::Search { path } => self.search(&path),
            DaemonRequest::Prune { path } => self.prune(&path).await,
            DaemonRequest::RegisterWatch {
                pattern,
                owner,
                cb,
                priv_,
                endpoint,
            } => self.register_watch(pattern.into(), owner, cb, priv_, endpoint.into()),
            DaemonRequest::RegisterProvide {
                path,
                owner,
                cb,
                priv_,
                endpoint,
            } => self.register_provide(path.into(), owner, cb, priv_, endpoint.into()),
        }
    }

    async fn set(&self, path: &str, value: Vec<u8>) -> DaemonReply {
        let Ok(path) = apteryx_path::validate_exact(path) else {
            return DaemonReply::Ok;
        };
        // Hold this path's lock across the mutation and the notification
        // enqueue so concurrent sets to the same path can't land their
        // mutation in one order but their enqueue in the other; delivery
        // itself happens later, off this lock, on the path's worker task.
        let path_lock = self.path_lock(path);
        let _guard = path_lock.lock().await;
        let old = self.inner.store.set(path, value.clone());
        let changed = old.unwrap_or_default() != value;
        if changed {
            let matching = self.inner.watchers.lookup_matching(path);
            if !matching.is_empty() {
                self.enqueue_notify(path, value, matching);
            }
        }
        DaemonReply::Ok
    }

    async fn get(&self, path: &str) -> DaemonReply {
        let Ok(path) = apteryx_path::validate_exact(path) else {
            return DaemonReply::Value { value: Vec::new() };
        };
        if let Some(value) = self.inner.store.get(path) {
            return DaemonReply::Value { value };
        }
        let Some(provider) = self.inner.providers.lookup(path) else {
            return DaemonReply::Value { value: Vec::new() };
        };
        let req = CallbackRequest::ProvideRequest {
            path: path.to_string().into(),
            owner: provider.owner,
            cb: provider.cb,
            priv_: provider.priv_,
        };
        match call_endpoint(&provider.endpoint, req, self.inner.timeout).await {
            Ok(CallbackReply::Value { value }) => DaemonReply::Value { value },
            Ok(CallbackReply::Ok) => {
                warn!(endpoint = %provider.endpoint, "provider replied Ok instead of Value");
                DaemonReply::Value { value: Vec::new() }
            }
            Err(e) => {
                warn!(endpoint = %provider.endpoint, %e, "provider RPC failed, returning absent");
                DaemonReply::Value { value: Vec::new() }
            }
        }
    }

    fn search(&self, path: &str) -> DaemonReply {
        let Ok(target) = apteryx_path::validate_search(path) else {
            return DaemonReply::Paths { paths: Vec::new() };
        };
        let target = match target {
            apteryx_path::SearchTarget::Root => apteryx_store::SearchTarget::Root,
            apteryx_path::SearchTarget::Directory(dir) => apteryx_store::SearchTarget::Directory(dir),
        };
        let paths = self
            .inner
            .store
            .search(target)
            .into_iter()
            .map(Into::into)
            .collect();
        DaemonReply::Paths { paths }
    }

    async fn prune(&self, path: &str) -> DaemonReply {
        let Ok(path) = apteryx_path::validate_exact(path) else {
            return DaemonReply::Ok;
        };
        // As in `set`, each removed descendant's lock is held across its
        // own lookup-and-enqueue step, so a concurrent `set` landing on
        // that same path can't enqueue out of order with this removal.
        for (removed_path, _old_value) in self.inner.store.prune(path) {
            let path_lock = self.path_lock(&removed_path);
            let _guard = path_lock.lock().await;
            let matching = self.inner.watchers.lookup_matching(&removed_path);
            if !matching.is_empty() {
                self.enqueue_notify(&removed_path, Vec::new(), matching);
            }
        }
        DaemonReply::Ok
    }

    fn register_watch(
        &self,
        pattern: String,
        owner: u64,
        cb: Option<u64>,
        priv_: u64,
        endpoint: String,
    ) -> DaemonReply {
        debug!(pattern, owner, cb, "register_watch");
        self.inner
            .watchers
            .register(pattern, owner, cb, priv_, endpoint);
        DaemonReply::Ok
    }

    fn register_provide(
        &self,
        path: String,
        owner: u64,
        cb: Option<u64>,
        priv_: u64,
        endpoint: String,
    ) -> DaemonReply {
        debug!(path, owner, cb, "register_provide");
        self.inner
            .providers
            .register(path, owner, cb, priv_, endpoint);
        DaemonReply::Ok
    }
}

async fn call_endpoint(
    endpoint: &str,
    request: CallbackRequest,
    timeout: Duration,
) -> Result<CallbackReply, DispatchError> {
    let fut = async {
        let mut stream = apteryx_transport::dial(Path::new(endpoint)).await?;
        let frame = apteryx_wire::encode_callback_request_default(&request)?;
        apteryx_transport::write_frame(&mut stream, &frame).await?;
        let payload = apteryx_transport::read_frame_default(&mut stream).await?;
        Ok::<_, DispatchError>(apteryx_wire::decode_callback_reply_default(&payload)?)
    };
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(DispatchError::Timeout {
            endpoint: endpoint.to_string(),
            timeout_ms: timeout.as_millis() as u64,
        }),
    }
}

/// Accept daemon connections on `socket_path`, dispatching requests
/// until the client disconnects. One connection may carry many
/// request/response round trips (`peeps-wire`-style short-lived
/// connections are also fine — this just doesn't force a reconnect).
pub async fn serve(dispatcher: Dispatcher, socket_path: &Path) -> Result<(), DispatchError> {
    let listener = apteryx_transport::bind(socket_path)?;
    apteryx_transport::serve(listener, move |stream| {
        let dispatcher = dispatcher.clone();
        async move {
            if let Err(e) = handle_conn(stream, dispatcher).await {
                error!(%e, "daemon connection error");
            }
        }
    })
    .await;
    Ok(())
}

async fn handle_conn(stream: UnixStream, dispatcher: Dispatcher) -> Result<(), DispatchError> {
    let (mut reader, outbound) = apteryx_transport::split(stream);
    loop {
        let payload = match apteryx_transport::read_frame_default(&mut reader).await {
            Ok(payload) => payload,
            Err(apteryx_transport::TransportError::Closed) => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let request = apteryx_wire::decode_daemon_request_default(&payload)?;
        let reply = dispatcher.dispatch(request).await;
        let frame = apteryx_wire::encode_daemon_reply_default(&reply)?;
        if outbound.send(frame).is_err() {
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use apteryx_wire::{CallbackReply, CallbackRequest};
    use std::sync::atomic::{AtomicU64, Ordering};
    use tokio::net::UnixListener;

    fn test_dispatcher() -> Dispatcher {
        Dispatcher::new(Duration::from_millis(500))
    }

    /// Spawn a tiny callback server on a temp socket that always replies
    /// `Ok`, recording every request it receives.
    async fn spawn_recording_watcher(
        dir: &std::path::Path,
    ) -> (std::path::PathBuf, Arc<tokio::sync::Mutex<Vec<CallbackRequest>>>) {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        let path = dir.join(format!("watcher-{}.sock", COUNTER.fetch_add(1, Ordering::Relaxed)));
        let listener = UnixListener::bind(&path).unwrap();
        let received = Arc::new(tokio::sync::Mutex::new(Vec::new()));
        let received_clone = received.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let received = received_clone.clone();
                tokio::spawn(async move {
                    let (mut reader, outbound) = apteryx_transport::split(stream);
                    while let Ok(payload) = apteryx_transport::read_frame_default(&mut reader).await {
                        let req = apteryx_wire::decode_callback_request_default(&payload).unwrap();
                        received.lock().await.push(req);
                        let frame = apteryx_wire::encode_callback_reply_default(&CallbackReply::Ok).unwrap();
                        let _ = outbound.send(frame);
                    }
                });
            }
        });
        (path, received)
    }

    async fn spawn_provider(dir: &std::path::Path, value: &'static [u8]) -> std::path::PathBuf {
        let path = dir.join("provider.sock");
        let listener = UnixListener::bind(&path).unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    let (mut reader, outbound) = apteryx_transport::split(stream);
                    while let Ok(payload) = apteryx_transport::read_frame_default(&mut reader).await {
                        let _req = apteryx_wire::decode_callback_request_default(&payload).unwrap();
                        let reply = CallbackReply::Value { value: value.to_vec() };
                        let frame = apteryx_wire::encode_callback_reply_default(&reply).unwrap();
                        let _ = outbound.send(frame);
                    }
                });
            }
        });
        path
    }

    #[tokio::test]
    async fn exact_watch_fires_once_then_unregisters() {
        let dir = tempfile::tempdir().unwrap();
        let (endpoint, received) = spawn_recording_watcher(dir.path()).await;
        let d = test_dispatcher();

        d.set("/z/s", b"up".to_vec()).await;
        d.register_watch(
            "/z/s".into(),
            1,
            Some(10),
            0,
            endpoint.to_string_lossy().into_owned(),
        );
        d.set("/z/s", b"down".to_vec()).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        {
            let events = received.lock().await;
            assert_eq!(events.len(), 1);
            match &events[0] {
                CallbackRequest::WatchNotify { path, value, .. } => {
                    assert_eq!(path.as_str(), "/z/s");
                    assert_eq!(value, b"down");
                }
                _ => panic!("unexpected callback"),
            }
        }

        d.register_watch("/z/s".into(), 1, None, 0, endpoint.to_string_lossy().into_owned());
        d.set("/z/s", b"up".to_vec()).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(received.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn wildcard_suffix_watch_ignores_sibling_paths() {
        let dir = tempfile::tempdir().unwrap();
        let (endpoint, received) = spawn_recording_watcher(dir.path()).await;
        let d = test_dispatcher();
        d.register_watch("/e/z/*".into(), 1, Some(1), 0, endpoint.to_string_lossy().into_owned());

        d.set("/e/z/p/s", b"x".to_vec()).await;
        d.set("/e/z/p/s", Vec::new()).await;
        d.set("/e/o/s", b"y".to_vec()).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let events = received.lock().await;
        assert_eq!(events.len(), 2);
    }

    #[tokio::test]
    async fn mid_path_wildcard_never_matches() {
        let dir = tempfile::tempdir().unwrap();
        let (endpoint, received) = spawn_recording_watcher(dir.path()).await;
        let d = test_dispatcher();
        d.register_watch(
            "/e/z/*/state".into(),
            1,
            Some(1),
            0,
            endpoint.to_string_lossy().into_owned(),
        );
        d.set("/e/z/pub/state", b"up".to_vec()).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(received.lock().await.is_empty());
    }

    #[tokio::test]
    async fn provider_resolves_get_and_can_be_replaced_or_unregistered() {
        let dir = tempfile::tempdir().unwrap();
        let endpoint = spawn_provider(dir.path(), b"up").await;
        let d = test_dispatcher();
        d.register_provide(
            "/if/eth0/state".into(),
            1,
            Some(1),
            0,
            endpoint.to_string_lossy().into_owned(),
        );
        let reply = d.get("/if/eth0/state").await;
        assert!(matches!(reply, DaemonReply::Value { value } if value == b"up"));

        d.register_provide(
            "/if/eth0/state".into(),
            1,
            None,
            0,
            endpoint.to_string_lossy().into_owned(),
        );
        let reply = d.get("/if/eth0/state").await;
        assert!(matches!(reply, DaemonReply::Value { value } if value.is_empty()));
    }

    #[tokio::test]
    async fn search_is_one_level() {
        let d = test_dispatcher();
        d.set("/e/z/priv", b"1".to_vec()).await;
        d.set("/e/z/priv/desc", b"2".to_vec()).await;
        d.set("/e/z/pub", b"3".to_vec()).await;
        let reply = d.search("/e/z/") ;
        let DaemonReply::Paths { mut paths } = reply else {
            panic!("expected paths reply");
        };
        paths.sort();
        assert_eq!(paths, vec!["/e/z/priv".to_string(), "/e/z/pub".to_string()]);
    }

    #[tokio::test]
    async fn reentrant_watcher_sees_the_triggering_value() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reentrant-daemon.sock");
        let d = test_dispatcher();
        let d_bg = d.clone();
        let path_bg = path.clone();
        tokio::spawn(async move {
            let _ = serve(d_bg, &path_bg).await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let watcher_dir = tempfile::tempdir().unwrap();
        let watcher_path = watcher_dir.path().join("reentrant-watcher.sock");
        let daemon_path = path.clone();
        let listener = UnixListener::bind(&watcher_path).unwrap();
        let observed = Arc::new(tokio::sync::Mutex::new(None));
        let observed_clone = observed.clone();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (mut reader, outbound) = apteryx_transport::split(stream);
            let payload = apteryx_transport::read_frame_default(&mut reader).await.unwrap();
            let CallbackRequest::WatchNotify { path, .. } =
                apteryx_wire::decode_callback_request_default(&payload).unwrap()
            else {
                panic!("expected watch notify");
            };
            // Reentrant get back to the daemon, from inside the callback.
            let mut client = apteryx_transport::dial(std::path::Path::new(&daemon_path)).await.unwrap();
            let req = DaemonRequest::Get { path: path.clone() };
            let frame = apteryx_wire::encode_daemon_request_default(&req).unwrap();
            apteryx_transport::write_frame(&mut client, &frame).await.unwrap();
            let reply_payload = apteryx_transport::read_frame_default(&mut client).await.unwrap();
            let DaemonReply::Value { value } =
                apteryx_wire::decode_daemon_reply_default(&reply_payload).unwrap()
            else {
                panic!("expected value reply");
            };
            *observed_clone.lock().await = Some(value);
            let frame = apteryx_wire::encode_callback_reply_default(&CallbackReply::Ok).unwrap();
            let _ = outbound.send(frame);
        });

        d.register_watch(
            "/e/z/priv/state".into(),
            1,
            Some(1),
            0,
            watcher_path.to_string_lossy().into_owned(),
        );
        d.set("/e/z/priv/state", b"triggered".to_vec()).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(*observed.lock().await, Some(b"triggered".to_vec()));
    }
}

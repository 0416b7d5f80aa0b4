//! Client runtime: the library surface every participating process
//! links against (§4.6, §6).
//!
//! `init` hands back an explicit, ref-counted [`Client`] handle rather
//! than relying purely on hidden process globals (the design note in
//! §9 asks for this where possible); repeated `init`/`shutdown` pairs
//! still nest correctly because every handle shares one underlying
//! [`Shared`] looked up through a process-wide slot.
//!
//! All RPC dispatch (outbound calls to the daemon, and the inbound
//! callback server that receives watch/provide invocations) runs on
//! one dedicated multi-thread Tokio runtime owned by `Shared`, mirroring
//! `moire-runtime`'s dashboard push loop spinning up its own runtime so
//! the client works whether or not the host process is itself async.
//! Synchronous callers bridge in via `Handle::block_on`; a callback that
//! reenters the client (the reentrant-watcher scenario) is already
//! running on that runtime, so it bridges back in via
//! `tokio::task::block_in_place` instead, never blocking a second
//! worker thread on top of itself.

mod dump;
mod inbound;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use apteryx_wire::{DaemonReply, DaemonRequest};
use thiserror::Error;
use tracing::debug;

pub use dump::dump;

const DEFAULT_SOCKET_PATH: &str = "/tmp/apteryx.sock";
const DEFAULT_TIMEOUT_MS: u64 = 5000;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("apteryx-client used before init()")]
    NotInitialised,
    #[error(transparent)]
    Path(#[from] apteryx_path::PathError),
    #[error(transparent)]
    Transport(#[from] apteryx_transport::TransportError),
    #[error(transparent)]
    Wire(#[from] apteryx_wire::WireError),
    #[error("RPC to the daemon timed out")]
    Timeout,
}

pub type WatchCallback = Arc<dyn Fn(&str, u64, &[u8]) + Send + Sync>;
pub type ProvideCallback = Arc<dyn Fn(&str, u64) -> Vec<u8> + Send + Sync>;

static GLOBAL: OnceLock<Mutex<Option<Arc<Shared>>>> = OnceLock::new();

fn global_slot() -> &'static Mutex<Option<Arc<Shared>>> {
    GLOBAL.get_or_init(|| Mutex::new(None))
}

struct Shared {
    refcount: AtomicUsize,
    socket_path: PathBuf,
    timeout: Duration,
    owner: u64,
    debug: bool,
    runtime: tokio::runtime::Runtime,
    next_cb: AtomicU64,
    watch_callbacks: Mutex<HashMap<u64, WatchCallback>>,
    provide_callbacks: Mutex<HashMap<u64, ProvideCallback>>,
    // Tracks which cb id currently backs each registered pattern/path, so
    // unregistering one doesn't clobber every other live callback this
    // process happens to hold (cb ids are a shared process-wide table).
    watch_cb_by_pattern: Mutex<HashMap<String, u64>>,
    provide_cb_by_path: Mutex<HashMap<String, u64>>,
    inbound: Mutex<inbound::InboundState>,
}

impl Shared {
    fn inbound_endpoint(&self) -> String {
        format!("{}.{}", self.socket_path.display(), std::process::id())
    }

    /// Bridge a sync call into async RPC dispatch on our runtime,
    /// whether or not the calling thread already happens to be one of
    /// that runtime's own worker threads.
    fn block_on<F: std::future::Future>(&self, fut: F) -> F::Output {
        let handle = self.runtime.handle().clone();
        if tokio::runtime::Handle::try_current().is_ok() {
            tokio::task::block_in_place(move || handle.block_on(fut))
        } else {
            handle.block_on(fut)
        }
    }

    async fn call_daemon(&self, request: DaemonRequest) -> Result<DaemonReply, ClientError> {
        let fut = async {
            let mut stream = apteryx_transport::dial(&self.socket_path).await?;
            let frame = apteryx_wire::encode_daemon_request_default(&request)?;
            apteryx_transport::write_frame(&mut stream, &frame).await?;
            let payload = apteryx_transport::read_frame_default(&mut stream).await?;
            Ok::<_, ClientError>(apteryx_wire::decode_daemon_reply_default(&payload)?)
        };
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(ClientError::Timeout),
        }
    }

    fn next_cb(&self) -> u64 {
        self.next_cb.fetch_add(1, Ordering::Relaxed)
    }
}

/// A reference-counted handle to the process-wide client runtime.
/// Cloning shares the same runtime and refcount; each `init()` call
/// (including ones that produced an already-cloned handle) must be
/// matched by one `shutdown()`.
#[derive(Clone)]
pub struct Client {
    shared: Arc<Shared>,
}

/// Acquire (creating if necessary) the process-wide client handle.
/// `debug` only affects the verbosity of this crate's own `tracing`
/// events — like the rest of the ambient stack, this library never
/// installs a subscriber itself.
pub fn init(debug: bool) -> Client {
    let mut slot = global_slot().lock().unwrap();
    if let Some(shared) = slot.as_ref() {
        shared.refcount.fetch_add(1, Ordering::SeqCst);
        return Client {
            shared: shared.clone(),
        };
    }

    let socket_path = std::env::var("APTERYX_SOCKET")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_SOCKET_PATH));
    let timeout = std::env::var("APTERYX_TIMEOUT_MS")
        .ok()
        .and_then(|v| v.parse().ok())
        .map(Duration::from_millis)
        .unwrap_or(Duration::from_millis(DEFAULT_TIMEOUT_MS));
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(4)
        .enable_all()
        .build()
        .expect("failed to build apteryx-client runtime");

    let shared = Arc::new(Shared {
        refcount: AtomicUsize::new(1),
        socket_path,
        timeout,
        owner: std::process::id() as u64,
        debug,
        runtime,
        next_cb: AtomicU64::new(1),
        watch_callbacks: Mutex::new(HashMap::new()),
        provide_callbacks: Mutex::new(HashMap::new()),
        watch_cb_by_pattern: Mutex::new(HashMap::new()),
        provide_cb_by_path: Mutex::new(HashMap::new()),
        inbound: Mutex::new(inbound::InboundState::Stopped),
    });
    debug!(owner = shared.owner, debug, "apteryx-client initialised");
    *slot = Some(shared.clone());
    Client { shared }
}

impl Client {
    pub fn set(&self, path: &str, value: &[u8]) -> Result<(), ClientError> {
        apteryx_path::validate_exact(path)?;
        let request = DaemonRequest::Set {
            path: path.into(),
            value: value.to_vec(),
        };
        self.shared.block_on(self.shared.call_daemon(request))?;
        Ok(())
    }

    pub fn get(&self, path: &str) -> Result<Option<Vec<u8>>, ClientError> {
        apteryx_path::validate_exact(path)?;
        let request = DaemonRequest::Get { path: path.into() };
        let reply = self.shared.block_on(self.shared.call_daemon(request))?;
        Ok(match reply {
            DaemonReply::Value { value } if !value.is_empty() => Some(value),
            _ => None,
        })
    }

    pub fn search(&self, path: &str) -> Result<Vec<String>, ClientError> {
        apteryx_path::validate_search(path)?;
        let request = DaemonRequest::Search { path: path.into() };
        let reply = self.shared.block_on(self.shared.call_daemon(request))?;
        Ok(match reply {
            DaemonReply::Paths { paths } => paths.into_iter().map(|p| p.to_string()).collect(),
            _ => Vec::new(),
        })
    }

    pub fn prune(&self, path: &str) -> Result<(), ClientError> {
        apteryx_path::validate_exact(path)?;
        let request = DaemonRequest::Prune { path: path.into() };
        self.shared.block_on(self.shared.call_daemon(request))?;
        Ok(())
    }

    /// Register (`Some`) or unregister (`None`) a watcher for `pattern`.
    pub fn watch(
        &self,
        pattern: &str,
        callback: Option<WatchCallback>,
        priv_: u64,
    ) -> Result<(), ClientError> {
        let cb = match callback {
            Some(cb) => {
                let id = self.shared.next_cb();
                self.shared.watch_callbacks.lock().unwrap().insert(id, cb);
                let prior = self
                    .shared
                    .watch_cb_by_pattern
                    .lock()
                    .unwrap()
                    .insert(pattern.to_string(), id);
                if let Some(prior) = prior {
                    self.shared.watch_callbacks.lock().unwrap().remove(&prior);
                }
                self.shared
                    .block_on(inbound::ensure_running(&self.shared))?;
                Some(id)
            }
            None => {
                if let Some(id) = self
                    .shared
                    .watch_cb_by_pattern
                    .lock()
                    .unwrap()
                    .remove(pattern)
                {
                    self.shared.watch_callbacks.lock().unwrap().remove(&id);
                }
                None
            }
        };
        let request = DaemonRequest::RegisterWatch {
            pattern: pattern.into(),
            owner: self.shared.owner,
            cb,
            priv_,
            endpoint: self.shared.inbound_endpoint().into(),
        };
        self.shared.block_on(self.shared.call_daemon(request))?;
        Ok(())
    }

    /// Register (`Some`) or unregister (`None`) a provider for `path`.
    pub fn provide(
        &self,
        path: &str,
        callback: Option<ProvideCallback>,
        priv_: u64,
    ) -> Result<(), ClientError> {
        apteryx_path::validate_exact(path)?;
        let cb = match callback {
            Some(cb) => {
                let id = self.shared.next_cb();
                self.shared.provide_callbacks.lock().unwrap().insert(id, cb);
                let prior = self
                    .shared
                    .provide_cb_by_path
                    .lock()
                    .unwrap()
                    .insert(path.to_string(), id);
                if let Some(prior) = prior {
                    self.shared.provide_callbacks.lock().unwrap().remove(&prior);
                }
                self.shared
                    .block_on(inbound::ensure_running(&self.shared))?;
                Some(id)
            }
            None => {
                if let Some(id) = self.shared.provide_cb_by_path.lock().unwrap().remove(path) {
                    self.shared.provide_callbacks.lock().unwrap().remove(&id);
                }
                None
            }
        };
        let request = DaemonRequest::RegisterProvide {
            path: path.into(),
            owner: self.shared.owner,
            cb,
            priv_,
            endpoint: self.shared.inbound_endpoint().into(),
        };
        self.shared.block_on(self.shared.call_daemon(request))?;
        Ok(())
    }

    /// Release this handle. When the last handle for the process is
    /// released, the inbound callback server (if running) is signalled
    /// to stop and given `SHUTDOWN_GRACE` to do so before this function
    /// gives up waiting and simply drops the runtime.
    pub fn shutdown(self) {
        if self.shared.refcount.fetch_sub(1, Ordering::SeqCst) != 1 {
            return;
        }
        *global_slot().lock().unwrap() = None;
        self.shared.block_on(async {
            inbound::stop(&self.shared, SHUTDOWN_GRACE).await;
        });
    }
}

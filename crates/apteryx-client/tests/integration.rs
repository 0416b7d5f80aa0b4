//! End-to-end client tests against a real `apteryx-server` daemon,
//! exercising the literal scenarios from spec.md §8: exact/wildcard/
//! mid-path watches, provider resolution, reentrant watchers, and
//! one-level search. One daemon is shared across this test binary (the
//! client's process-wide `init`/`shutdown` handle is itself shared
//! globally, so a second daemon socket would just be ignored); each
//! test works under its own path prefix to stay independent.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use apteryx_client::Client;

static DAEMON_SOCKET: OnceLock<PathBuf> = OnceLock::new();

fn daemon_socket() -> &'static PathBuf {
    DAEMON_SOCKET.get_or_init(|| {
        let dir = tempfile::tempdir().expect("tempdir");
        let socket = dir.path().join("apteryx.sock");
        // Keep the directory alive for the lifetime of the test binary.
        std::mem::forget(dir);

        let socket_for_server = socket.clone();
        std::thread::spawn(move || {
            let rt = tokio::runtime::Runtime::new().expect("daemon runtime");
            rt.block_on(async move {
                let dispatcher = apteryx_server::Dispatcher::new(Duration::from_millis(500));
                apteryx_server::serve(dispatcher, &socket_for_server)
                    .await
                    .expect("daemon serve");
            });
        });

        for _ in 0..200 {
            if socket.exists() {
                return socket;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        panic!("daemon socket never appeared at {}", socket.display());
    })
}

fn test_client() -> Client {
    let socket = daemon_socket();
    // Safety: set once, to the same value, before any test's first call
    // to `init()` actually reads it (later calls just bump the refcount).
    unsafe {
        std::env::set_var("APTERYX_SOCKET", socket);
    }
    apteryx_client::init(false)
}

static PREFIX_COUNTER: AtomicU64 = AtomicU64::new(0);

fn unique_prefix() -> String {
    format!("/t{}", PREFIX_COUNTER.fetch_add(1, Ordering::Relaxed))
}

fn wait_until(mut check: impl FnMut() -> bool, timeout: Duration) -> bool {
    let deadline = std::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if std::time::Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn exact_watch_fires_on_change_then_stops_after_unwatch() {
    let client = test_client();
    let prefix = unique_prefix();
    let path = format!("{prefix}/z/s");

    client.set(&path, b"up").unwrap();

    let received: Arc<Mutex<Vec<(String, Vec<u8>)>>> = Arc::new(Mutex::new(Vec::new()));
    let received_cb = received.clone();
    client
        .watch(
            &path,
            Some(Arc::new(move |p: &str, _priv: u64, value: &[u8]| {
                received_cb.lock().unwrap().push((p.to_string(), value.to_vec()));
            })),
            0,
        )
        .unwrap();

    client.set(&path, b"down").unwrap();
    assert!(wait_until(|| !received.lock().unwrap().is_empty(), Duration::from_secs(2)));
    {
        let events = received.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0], (path.clone(), b"down".to_vec()));
    }

    client.watch(&path, None, 0).unwrap();
    client.set(&path, b"up").unwrap();
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(received.lock().unwrap().len(), 1);
}

#[test]
fn wildcard_suffix_watch_matches_descendants_only() {
    let client = test_client();
    let prefix = unique_prefix();

    let received: Arc<Mutex<Vec<(String, Vec<u8>)>>> = Arc::new(Mutex::new(Vec::new()));
    let received_cb = received.clone();
    client
        .watch(
            &format!("{prefix}/e/z/*"),
            Some(Arc::new(move |p: &str, _priv: u64, value: &[u8]| {
                received_cb.lock().unwrap().push((p.to_string(), value.to_vec()));
            })),
            0,
        )
        .unwrap();

    client.set(&format!("{prefix}/e/z/p/s"), b"x").unwrap();
    assert!(wait_until(|| received.lock().unwrap().len() == 1, Duration::from_secs(2)));

    client.set(&format!("{prefix}/e/z/p/s"), b"").unwrap();
    assert!(wait_until(|| received.lock().unwrap().len() == 2, Duration::from_secs(2)));

    client.set(&format!("{prefix}/e/o/s"), b"y").unwrap();
    std::thread::sleep(Duration::from_millis(100));

    let events = received.lock().unwrap();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0], (format!("{prefix}/e/z/p/s"), b"x".to_vec()));
    assert_eq!(events[1], (format!("{prefix}/e/z/p/s"), Vec::new()));
}

#[test]
fn mid_path_wildcard_pattern_never_fires() {
    let client = test_client();
    let prefix = unique_prefix();

    let received: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let received_cb = received.clone();
    client
        .watch(
            &format!("{prefix}/e/z/*/state"),
            Some(Arc::new(move |p: &str, _priv: u64, _value: &[u8]| {
                received_cb.lock().unwrap().push(p.to_string());
            })),
            0,
        )
        .unwrap();

    client.set(&format!("{prefix}/e/z/pub/state"), b"up").unwrap();
    std::thread::sleep(Duration::from_millis(150));
    assert!(received.lock().unwrap().is_empty());
}

#[test]
fn provider_resolves_get_and_replacement_and_unregistration() {
    let client = test_client();
    let prefix = unique_prefix();
    let path = format!("{prefix}/if/eth0/state");

    client
        .provide(&path, Some(Arc::new(|_p: &str, _priv: u64| b"up".to_vec())), 0)
        .unwrap();
    assert_eq!(client.get(&path).unwrap(), Some(b"up".to_vec()));

    client
        .provide(&path, Some(Arc::new(|_p: &str, _priv: u64| b"down".to_vec())), 0)
        .unwrap();
    assert_eq!(client.get(&path).unwrap(), Some(b"down".to_vec()));

    client.provide(&path, None, 0).unwrap();
    assert_eq!(client.get(&path).unwrap(), None);
}

#[test]
fn reentrant_watcher_observes_the_triggering_value() {
    let client = test_client();
    let client_for_cb = client.clone();
    let prefix = unique_prefix();
    let path = format!("{prefix}/e/z/priv/state");
    let path_for_cb = path.clone();

    let observed: Arc<Mutex<Option<Vec<u8>>>> = Arc::new(Mutex::new(None));
    let observed_cb = observed.clone();
    client
        .watch(
            &path,
            Some(Arc::new(move |_p: &str, _priv: u64, _value: &[u8]| {
                // Reentrant call back into the same client from inside
                // the notification callback — must not deadlock, and
                // must observe the triggering value (or a newer one).
                let got = client_for_cb.get(&path_for_cb).unwrap();
                *observed_cb.lock().unwrap() = got;
            })),
            0,
        )
        .unwrap();

    client.set(&path, b"triggered").unwrap();
    assert!(wait_until(
        || observed.lock().unwrap().is_some(),
        Duration::from_secs(2)
    ));
    assert_eq!(*observed.lock().unwrap(), Some(b"triggered".to_vec()));
}

#[test]
fn search_is_one_level() {
    let client = test_client();
    let prefix = unique_prefix();

    client.set(&format!("{prefix}/e/z/priv"), b"1").unwrap();
    client.set(&format!("{prefix}/e/z/priv/desc"), b"2").unwrap();
    client.set(&format!("{prefix}/e/z/pub"), b"3").unwrap();

    let mut paths = client.search(&format!("{prefix}/e/z/")).unwrap();
    paths.sort();
    assert_eq!(
        paths,
        vec![format!("{prefix}/e/z/priv"), format!("{prefix}/e/z/pub")]
    );
}

#[test]
fn unwatching_one_pattern_does_not_silence_another_live_watcher() {
    let client = test_client();
    let prefix = unique_prefix();
    let path_a = format!("{prefix}/a/s");
    let path_b = format!("{prefix}/b/s");

    let received_a: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
    let received_b: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
    let cb_a = received_a.clone();
    let cb_b = received_b.clone();

    client
        .watch(
            &path_a,
            Some(Arc::new(move |_p: &str, _priv: u64, value: &[u8]| {
                cb_a.lock().unwrap().push(value.to_vec());
            })),
            0,
        )
        .unwrap();
    client
        .watch(
            &path_b,
            Some(Arc::new(move |_p: &str, _priv: u64, value: &[u8]| {
                cb_b.lock().unwrap().push(value.to_vec());
            })),
            0,
        )
        .unwrap();

    // Unregister the watcher on `a` only.
    client.watch(&path_a, None, 0).unwrap();

    client.set(&path_a, b"ignored").unwrap();
    client.set(&path_b, b"seen").unwrap();
    assert!(wait_until(|| !received_b.lock().unwrap().is_empty(), Duration::from_secs(2)));
    std::thread::sleep(Duration::from_millis(100));

    assert!(received_a.lock().unwrap().is_empty());
    assert_eq!(received_b.lock().unwrap(), vec![b"seen".to_vec()]);
}

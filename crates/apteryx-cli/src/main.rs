use std::sync::mpsc;

use apteryx_client::Client;

const DEFAULT_TIMEOUT_MS: u64 = 5_000;

fn main() {
    if let Err(err) = run() {
        eprintln!("{err}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), String> {
    let mut args = std::env::args().skip(1).collect::<Vec<_>>();
    if args.is_empty() {
        return Err(usage());
    }

    let command = args.remove(0);
    match command.as_str() {
        "set" => run_set(args),
        "get" => run_get(args),
        "search" => run_search(args),
        "prune" => run_prune(args),
        "watch" => run_watch(args),
        "provide" => run_provide(args),
        "dump" => run_dump(args),
        "-h" | "--help" | "help" => {
            println!("{}", usage());
            Ok(())
        }
        other => Err(format!("unknown command: {other}\n\n{}", usage())),
    }
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .try_init()
        .ok();
}

fn init_client() -> Client {
    init_logging();
    apteryx_client::init(false)
}

fn run_set(args: Vec<String>) -> Result<(), String> {
    let [path, value] = take_positional(&args, set_usage)?;
    let client = init_client();
    client
        .set(&path, value.as_bytes())
        .map_err(|e| format!("set {path}: {e}"))?;
    client.shutdown();
    Ok(())
}

fn run_get(args: Vec<String>) -> Result<(), String> {
    let [path] = take_positional(&args, get_usage)?;
    let client = init_client();
    let value = client.get(&path).map_err(|e| format!("get {path}: {e}"))?;
    client.shutdown();
    match value {
        Some(value) => println!("{}", String::from_utf8_lossy(&value)),
        None => eprintln!("(unset)"),
    }
    Ok(())
}

fn run_search(args: Vec<String>) -> Result<(), String> {
    let [path] = take_positional(&args, search_usage)?;
    let client = init_client();
    let paths = client.search(&path).map_err(|e| format!("search {path}: {e}"))?;
    client.shutdown();
    for p in paths {
        println!("{p}");
    }
    Ok(())
}

fn run_prune(args: Vec<String>) -> Result<(), String> {
    let [path] = take_positional(&args, prune_usage)?;
    let client = init_client();
    client.prune(&path).map_err(|e| format!("prune {path}: {e}"))?;
    client.shutdown();
    Ok(())
}

fn run_dump(args: Vec<String>) -> Result<(), String> {
    let [path] = take_positional(&args, dump_usage)?;
    let client = init_client();
    let mut stdout = std::io::stdout();
    apteryx_client::dump(&client, &path, &mut stdout).map_err(|e| format!("dump {path}: {e}"))?;
    client.shutdown();
    Ok(())
}

/// Registers a watcher for `pattern` and blocks, printing one line per
/// notification, until the process is killed.
fn run_watch(args: Vec<String>) -> Result<(), String> {
    let [pattern] = take_positional(&args, watch_usage)?;
    let client = init_client();
    let (tx, rx) = mpsc::channel::<(String, Vec<u8>)>();
    client
        .watch(
            &pattern,
            Some(std::sync::Arc::new(move |path: &str, _priv: u64, value: &[u8]| {
                tx.send((path.to_string(), value.to_vec())).ok();
            })),
            0,
        )
        .map_err(|e| format!("watch {pattern}: {e}"))?;

    println!("watching {pattern}, press ctrl-c to stop");
    for (path, value) in rx {
        if value.is_empty() {
            println!("{path} (deleted)");
        } else {
            println!("{path} = {}", String::from_utf8_lossy(&value));
        }
    }
    Ok(())
}

/// Registers a constant-value provider for `path` and blocks serving
/// `get` requests until the process is killed.
fn run_provide(args: Vec<String>) -> Result<(), String> {
    let mut path = None;
    let mut value = None;
    let mut i = 0usize;
    while i < args.len() {
        match args[i].as_str() {
            "--value" => {
                i += 1;
                value = Some(args.get(i).cloned().ok_or("missing value for --value")?);
            }
            "--help" | "-h" => {
                println!("{}", provide_usage());
                return Ok(());
            }
            other if path.is_none() => path = Some(other.to_string()),
            other => return Err(format!("unexpected argument: {other}\n\n{}", provide_usage())),
        }
        i += 1;
    }
    let path = path.ok_or_else(provide_usage)?;
    let value = value.ok_or_else(provide_usage)?;

    let client = init_client();
    client
        .provide(
            &path,
            Some(std::sync::Arc::new(move |_path: &str, _priv: u64| value.clone().into_bytes())),
            0,
        )
        .map_err(|e| format!("provide {path}: {e}"))?;

    println!("providing {path}, press ctrl-c to stop");
    loop {
        std::thread::park();
    }
}

fn take_positional<const N: usize>(
    args: &[String],
    usage: fn() -> String,
) -> Result<[String; N], String> {
    if args.len() != N {
        return Err(usage());
    }
    args.to_vec().try_into().map_err(|_| usage())
}

fn usage() -> String {
    format!(
        "apteryx-cli commands:\n  set <path> <value>\n  get <path>\n  search <path>\n  prune <path>\n  watch <pattern>\n  provide <path> --value <value>\n  dump <path>\n\n{}",
        defaults_usage()
    )
}

fn set_usage() -> String {
    format!("apteryx-cli set <path> <value>\n\n{}", defaults_usage())
}

fn get_usage() -> String {
    format!("apteryx-cli get <path>\n\n{}", defaults_usage())
}

fn search_usage() -> String {
    format!("apteryx-cli search <path>\n\n{}", defaults_usage())
}

fn prune_usage() -> String {
    format!("apteryx-cli prune <path>\n\n{}", defaults_usage())
}

fn dump_usage() -> String {
    format!("apteryx-cli dump <path>\n\n{}", defaults_usage())
}

fn watch_usage() -> String {
    format!("apteryx-cli watch <pattern>\n\n{}", defaults_usage())
}

fn provide_usage() -> String {
    format!(
        "apteryx-cli provide <path> --value <value>\n\n{}",
        defaults_usage()
    )
}

fn defaults_usage() -> String {
    format!(
        "env:\n  APTERYX_SOCKET (socket path)\n  APTERYX_TIMEOUT_MS (default {DEFAULT_TIMEOUT_MS})"
    )
}

use std::path::PathBuf;
use std::time::Duration;

use apteryx_server::Dispatcher;
use facet::Facet;
use figue as args;
use tracing::info;

const DEFAULT_SOCKET_PATH: &str = "/tmp/apteryx.sock";

#[derive(Facet, Debug)]
struct Cli {
    #[facet(flatten)]
    builtins: args::FigueBuiltins,
    #[facet(args::named, default)]
    socket: Option<String>,
    #[facet(args::named, default)]
    timeout_ms: Option<u64>,
    #[facet(args::named, default)]
    workers: Option<usize>,
    #[facet(args::named, default)]
    debug: bool,
}

fn main() {
    let cli = match parse_cli() {
        Ok(cli) => cli,
        Err(err) => {
            eprintln!("{err}");
            std::process::exit(1);
        }
    };

    let workers = cli
        .workers
        .or_else(|| std::env::var("APTERYX_WORKERS").ok().and_then(|v| v.parse().ok()))
        .unwrap_or(4);

    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(workers.max(1))
        .enable_all()
        .build()
        .expect("failed to build tokio runtime")
        .block_on(async {
            if let Err(err) = run(cli, workers).await {
                eprintln!("{err}");
                std::process::exit(1);
            }
        });
}

async fn run(cli: Cli, workers: usize) -> Result<(), String> {
    let default_filter = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .init();

    let socket_path = cli
        .socket
        .or_else(|| std::env::var("APTERYX_SOCKET").ok())
        .unwrap_or_else(|| DEFAULT_SOCKET_PATH.to_string());
    let timeout_ms = cli
        .timeout_ms
        .or_else(|| std::env::var("APTERYX_TIMEOUT_MS").ok().and_then(|v| v.parse().ok()))
        .unwrap_or(apteryx_server::DEFAULT_TIMEOUT_MS);

    info!(%socket_path, timeout_ms, workers, "apteryx-server starting");

    let dispatcher = Dispatcher::new(Duration::from_millis(timeout_ms));
    apteryx_server::serve(dispatcher, &PathBuf::from(&socket_path))
        .await
        .map_err(|e| format!("daemon listener failed on {socket_path}: {e}"))?;
    Ok(())
}

fn parse_cli() -> Result<Cli, String> {
    let figue_config = args::builder::<Cli>()
        .map_err(|e| format!("failed to build CLI schema: {e}"))?
        .cli(|cli| cli.strict())
        .help(|h| {
            h.program_name("apteryx-server")
                .description("Process-shared, path-addressed configuration and state daemon")
                .version(option_env!("CARGO_PKG_VERSION").unwrap_or("dev"))
        })
        .build();
    let cli = args::Driver::new(figue_config)
        .run()
        .into_result()
        .map_err(|e| e.to_string())?;
    Ok(cli.value)
}

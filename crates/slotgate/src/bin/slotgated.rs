use std::process;
use std::sync::Arc;

use slotgate::telemetry::init_tracing;
use slotgate::transport::{ServerConfig, serve};
use slotgate::{TunerConfig, VersionInfo, WorkerTuner};
use tokio_util::sync::CancellationToken;

fn main() {
    let args: Vec<String> = std::env::args().collect();

    let server = match parse_args(&args) {
        Ok(v) => v,
        Err(msg) => {
            eprintln!("error: {msg}");
            eprintln!();
            eprintln!("Usage: slotgated [--host <addr>] [--port <port>] [--await-explicit-shutdown]");
            eprintln!();
            eprintln!("Slot limits and cache size come from SLOTGATE_* environment variables");
            eprintln!("or a JSON file named by SLOTGATE_CONFIG.");
            process::exit(2);
        }
    };

    if let Err(e) = run(server) {
        eprintln!("error: {e:#}");
        process::exit(1);
    }
}

fn parse_args(args: &[String]) -> Result<ServerConfig, String> {
    let mut config = ServerConfig::default();

    let mut i = 1; // skip argv[0]
    while i < args.len() {
        match args[i].as_str() {
            "--host" => {
                i += 1;
                config.host = args.get(i).ok_or("--host requires a value")?.clone();
            }
            "--port" => {
                i += 1;
                let port = args.get(i).ok_or("--port requires a value")?;
                config.port = port.parse().map_err(|_| format!("invalid port: {port}"))?;
            }
            "--await-explicit-shutdown" => config.await_explicit_shutdown = true,
            "--help" | "-h" => return Err("".to_string()),
            arg => return Err(format!("unexpected argument: {arg}")),
        }
        i += 1;
    }
    Ok(config)
}

fn run(server: ServerConfig) -> anyhow::Result<()> {
    init_tracing();

    let config = TunerConfig::from_env()?;
    let (interval, threshold) = (config.leak_check_interval, config.leak_threshold);
    let tuner = Arc::new(
        WorkerTuner::builder()
            .config(config)
            .version(VersionInfo::new())
            .build()?,
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async move {
        let shutdown = CancellationToken::new();
        let watchdog = tuner.spawn_leak_watchdog(interval, threshold, shutdown.clone());
        let served = serve(server, tuner, shutdown.clone()).await;
        shutdown.cancel();
        let _ = watchdog.await;
        served
    })
}

use hostgate::config::MapFile;
use hostgate::control::{self, ControlServer};
use hostgate::proxy::ProxyServer;
use hostgate::registry::Registry;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

const PKG_NAME: &str = env!("CARGO_PKG_NAME");
const VERSION: &str = env!("CARGO_PKG_VERSION");

const LOG_FILE_NAME: &str = ".hostgate.log";
const PID_FILE_NAME: &str = ".hostgate.pid";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let command = args.get(1).map(String::as_str).unwrap_or("help");

    match command {
        "list" => list(),
        "set" => match (args.get(2), args.get(3)) {
            (Some(domain), Some(target)) => set(domain, target),
            _ => usage_error("set <domain> <target>"),
        },
        "remove" => match args.get(2) {
            Some(domain) => remove(domain),
            None => usage_error("remove <domain>"),
        },
        "reload" => match args.get(2) {
            Some(domain) => reload(domain).await,
            None => usage_error("reload <domain>"),
        },
        "server" => run_server().await,
        "daemon" => daemon(),
        "daemon-stop" | "daemon_stop" => daemon_stop(),
        "log" => tail_log(),
        "help" | "--help" | "-h" => {
            print_help();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {}", other);
            print_help();
            std::process::exit(2);
        }
    }
}

fn usage_error(usage: &str) -> anyhow::Result<()> {
    eprintln!("Usage: {} {}", PKG_NAME, usage);
    std::process::exit(2);
}

fn print_help() {
    println!("{} {} - domain-routing process manager", PKG_NAME, VERSION);
    println!();
    println!("Usage: {} <command> [args]", PKG_NAME);
    println!();
    println!("Commands:");
    println!("  list                   Show configured domain mappings");
    println!("  set <domain> <target>  Map a domain to a backend script or executable");
    println!("  remove <domain>        Remove a domain mapping");
    println!("  reload <domain>        Ask a running server to restart a domain's backend");
    println!("  server                 Run the proxy server in the foreground");
    println!("  daemon                 Run the proxy server in the background");
    println!("  daemon-stop            Stop a background server");
    println!("  log                    Follow the background server's log");
    println!("  help                   Show this help");
}

fn list() -> anyhow::Result<()> {
    let map = MapFile::load(MapFile::default_path())?;
    if map.entries().is_empty() {
        println!("No domains configured");
    } else {
        for entry in map.entries() {
            println!("{}", entry);
        }
    }
    Ok(())
}

fn set(domain: &str, target: &str) -> anyhow::Result<()> {
    let mut map = MapFile::load(MapFile::default_path())?;
    map.set(domain, target);
    map.save()?;
    println!("{} -> {}", domain, target);
    Ok(())
}

fn remove(domain: &str) -> anyhow::Result<()> {
    let mut map = MapFile::load(MapFile::default_path())?;
    if map.remove(domain) {
        map.save()?;
        println!("Removed {}", domain);
    } else {
        println!("No mapping for {}", domain);
    }
    Ok(())
}

async fn reload(domain: &str) -> anyhow::Result<()> {
    control::publish_reload(domain).await?;
    println!("Reload requested for {}", domain);
    Ok(())
}

async fn run_server() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("hostgate=debug".parse().expect("valid log directive")),
        )
        .init();

    info!(name = PKG_NAME, version = VERSION, "Starting server");

    let map_path = MapFile::default_path();
    // Creates the file if missing so the watcher has something to watch.
    MapFile::load(&map_path)?;

    let listen_port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(80);
    let bind_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), listen_port);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let registry = Registry::new();
    // The watcher stops emitting events once dropped, so hold it for the
    // lifetime of the server.
    let _watcher = registry.watch_map_file(&map_path).await?;

    let proxy = ProxyServer::bind(bind_addr, Arc::clone(&registry), shutdown_rx.clone()).await?;
    let control =
        ControlServer::bind(control::control_port(), Arc::clone(&registry), shutdown_rx).await?;

    let proxy_handle = tokio::spawn(async move {
        if let Err(e) = proxy.run().await {
            error!(error = %e, "Proxy server error");
        }
    });
    let control_handle = tokio::spawn(async move {
        if let Err(e) = control.run().await {
            error!(error = %e, "Control server error");
        }
    });

    wait_for_shutdown_signal().await;

    let _ = shutdown_tx.send(true);
    info!("Stopping all backends");
    registry.shutdown_all();

    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = proxy_handle.await;
        let _ = control_handle.await;
    })
    .await;

    info!("Shutdown complete");
    Ok(())
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT, shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to listen for Ctrl+C");
        info!("Received Ctrl+C, shutting down...");
    }
}

fn home_file(name: &str) -> PathBuf {
    dirs_next::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(name)
}

/// Start the server as a detached background process, logging to
/// `~/.hostgate.log` and recording its pid in `~/.hostgate.pid`.
fn daemon() -> anyhow::Result<()> {
    let pid_path = home_file(PID_FILE_NAME);
    if let Ok(text) = std::fs::read_to_string(&pid_path) {
        if let Ok(pid) = text.trim().parse::<i32>() {
            eprintln!(
                "Warning: pid file already exists (pid {}); is a daemon already running?",
                pid
            );
        }
    }

    let log_path = home_file(LOG_FILE_NAME);
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;
    let log_file_err = log_file.try_clone()?;

    let exe = std::env::current_exe()?;
    let mut cmd = std::process::Command::new(exe);
    cmd.arg("server")
        .stdin(std::process::Stdio::null())
        .stdout(log_file)
        .stderr(log_file_err);

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        // New process group so the daemon survives this shell's signals.
        cmd.process_group(0);
    }

    let child = cmd.spawn()?;
    std::fs::write(&pid_path, format!("{}\n", child.id()))?;

    println!("{} -> {}", std::process::id(), child.id());
    println!("Logging to {}", log_path.display());
    Ok(())
}

/// Stop a backgrounded server via the pid file.
fn daemon_stop() -> anyhow::Result<()> {
    let pid_path = home_file(PID_FILE_NAME);
    let text = std::fs::read_to_string(&pid_path)
        .map_err(|e| anyhow::anyhow!("No daemon pid file at {}: {}", pid_path.display(), e))?;
    let pid: i32 = text
        .trim()
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid pid file contents: {}", e))?;

    #[cfg(unix)]
    {
        let result = unsafe { libc::kill(pid, libc::SIGTERM) };
        if result != 0 {
            let err = std::io::Error::last_os_error();
            eprintln!(
                "Failed to signal pid {} ({}); removing stale pid file",
                pid, err
            );
        } else {
            println!("Sent SIGTERM to {}", pid);
        }
    }

    #[cfg(not(unix))]
    {
        anyhow::bail!("daemon-stop is only supported on unix");
    }

    #[cfg(unix)]
    {
        std::fs::remove_file(&pid_path)?;
        Ok(())
    }
}

/// Follow the daemon log with `tail -f`, inheriting the terminal.
fn tail_log() -> anyhow::Result<()> {
    let log_path = home_file(LOG_FILE_NAME);
    let status = std::process::Command::new("tail")
        .arg("-f")
        .arg(&log_path)
        .status()?;
    if !status.success() {
        anyhow::bail!("tail exited with {}", status);
    }
    Ok(())
}

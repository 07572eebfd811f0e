//! networkproxy: runs `networkproxy_bin` under a supervisor that proxies its
//! outbound connects to a local echo server.

#![allow(clippy::print_stdout, clippy::print_stderr)]

#[cfg(not(target_os = "linux"))]
fn main() {
    eprintln!("networkproxy: only supported on Linux");
    std::process::exit(1);
}

#[cfg(target_os = "linux")]
fn main() {
    match supervise::run() {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("networkproxy: {e:#}");
            std::process::exit(1);
        }
    }
}

#[cfg(target_os = "linux")]
mod supervise {
    //! Echo server, sandboxee launch, and the proxy loop.

    use std::io::{self, Write};
    use std::net::TcpListener;
    use std::path::PathBuf;
    use std::process::{Command, Stdio};
    use std::thread;

    use anyhow::{Context, Result};
    use clap::{ArgAction, Parser};
    use netproxy::proto::{Comms, SandboxPolicy};
    use netproxy::{AllowedHosts, ServeStats, Supervisor, jail};
    use tracing::{info, warn};
    use tracing_subscriber::EnvFilter;

    /// Name of the sandboxee binary looked up next to this executable.
    const SANDBOXEE: &str = "networkproxy_bin";

    /// Command-line arguments.
    #[derive(Debug, Parser)]
    #[command(name = "networkproxy", version, about = "Network proxy demonstration")]
    struct Cli {
        /// Sandboxee binary [default: networkproxy_bin next to this executable].
        #[arg(long)]
        sandboxee: Option<PathBuf>,

        /// Let the sandboxee use the automatic connect handler.
        #[arg(long, default_value_t = true, action = ArgAction::Set)]
        connect_with_handler: bool,

        /// Payload the echo server sends to each connection.
        #[arg(long, default_value = "Hello World\n")]
        payload: String,

        /// Enter the sandboxee without the network proxy.
        #[arg(long)]
        no_proxy: bool,
    }

    /// Runs the demonstration and returns the sandboxee's exit code.
    pub(crate) fn run() -> Result<i32> {
        let cli = Cli::parse();
        init_logging();

        let sandboxee = match cli.sandboxee {
            Some(path) => path,
            None => sibling(SANDBOXEE).context("cannot locate the sandboxee binary")?,
        };
        let port = echo_server(cli.payload.into_bytes())?;

        let (parent, child_end) = Comms::pair().context("creating the control channel")?;
        let mut cmd = Command::new(&sandboxee);
        cmd.arg("--connect-with-handler")
            .arg(cli.connect_with_handler.to_string())
            .stdin(Stdio::null());
        let mut child = jail::spawn_command(cmd, child_end.into())
            .with_context(|| format!("spawning {}", sandboxee.display()))?;

        let policy = SandboxPolicy {
            network_proxy: !cli.no_proxy,
            deny_connect: true,
        };
        let supervisor =
            Supervisor::new(parent, policy).allowed_hosts(AllowedHosts::new().allow_loopback());
        match serve(supervisor, port) {
            Ok(stats) => info!(?stats, "proxy loop finished"),
            Err(e) => warn!(error = %e, "proxy loop aborted"),
        }

        let status = child.wait().context("waiting for the sandboxee")?;
        info!(%status, "sandboxee exited");
        Ok(status.code().unwrap_or(1))
    }

    /// Entry, port, then proxy requests until the sandboxee closes the channel.
    fn serve(mut supervisor: Supervisor, port: u16) -> netproxy::Result<ServeStats> {
        supervisor.accept_entry()?;
        supervisor.send_port(port.into())?;
        supervisor.serve()
    }

    /// Installs the stderr subscriber; `RUST_LOG` overrides the level.
    fn init_logging() {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(io::stderr)
            .init();
    }

    /// Finds `name` in the directory of the running executable.
    fn sibling(name: &str) -> Result<PathBuf> {
        let exe = std::env::current_exe()?;
        let path = exe.with_file_name(name);
        anyhow::ensure!(path.is_file(), "{} does not exist", path.display());
        Ok(path)
    }

    /// Binds `[::1]:0` and writes `payload` to every accepted connection.
    fn echo_server(payload: Vec<u8>) -> Result<u16> {
        let listener = TcpListener::bind("[::1]:0").context("binding the echo server")?;
        let port = listener.local_addr()?.port();
        info!(port, "echo server listening");
        thread::spawn(move || {
            for stream in listener.incoming() {
                match stream.and_then(|mut s| s.write_all(&payload)) {
                    Ok(()) => {}
                    Err(e) => warn!(error = %e, "echo connection failed"),
                }
            }
        });
        Ok(port)
    }
}

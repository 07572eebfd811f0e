//! networkproxy_bin: sandboxee that reaches a TCP server through its
//! supervisor.
//!
//! Enters the sandbox on the inherited control channel, receives a port,
//! connects to `[::1]:port` (through the `SIGSYS` handler or the manual
//! proxy client), and checks that the server sent `"Hello World\n"`.
//!
//! Exit codes: 0 success, 1 handler installation, 2 port not received,
//! 3 connect, 4 payload validation.

#![allow(clippy::print_stdout, clippy::print_stderr)]

#[cfg(not(target_os = "linux"))]
fn main() {
    eprintln!("[networkproxy_bin] only supported on Linux");
    std::process::exit(1);
}

#[cfg(target_os = "linux")]
fn main() -> std::process::ExitCode {
    driver::main()
}

#[cfg(target_os = "linux")]
mod driver {
    //! Linux driver.

    use std::io::{self, Read};
    use std::net::TcpStream;
    use std::os::fd::{AsFd, AsRawFd, OwnedFd};
    use std::process::ExitCode;

    use clap::{ArgAction, Parser};
    use netproxy::proto::{CLIENT_COMMS_FD, Comms, Family, TargetAddress};
    use netproxy::{Error, ProxyClient, Result, Sandbox};
    use nix::sys::socket::{self, AddressFamily, SockFlag, SockType, SockaddrStorage};
    use tracing::{error, info};
    use tracing_subscriber::EnvFilter;

    /// Payload the server is expected to send.
    pub(crate) const EXPECTED: &[u8] = b"Hello World\n";

    /// Upper bound on bytes read from the server.
    const READ_LIMIT: u64 = 1024;

    /// Command-line arguments.
    #[derive(Debug, Parser)]
    #[command(name = "networkproxy_bin", about = "Network proxy sandboxee")]
    struct Args {
        /// Route `connect(2)` through the automatic handler instead of the
        /// manual proxy client.
        #[arg(long, default_value_t = true, action = ArgAction::Set)]
        connect_with_handler: bool,
    }

    /// How the driver reaches the server.
    #[derive(Debug)]
    enum Mode {
        /// `connect(2)` is trapped and proxied transparently.
        Automatic,
        /// Explicit proxy client, absent when the policy disables the proxy.
        Manual(Option<ProxyClient>),
    }

    /// Driver step that failed; each maps to one exit code.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) enum Step {
        /// Installing the automatic handler.
        InstallHandler,
        /// Entering the sandbox and receiving the port.
        ReceivePort,
        /// Building the address, creating the socket, connecting.
        Connect,
        /// Reading and checking the payload.
        Validate,
    }

    impl Step {
        /// Process exit code for a failure in this step.
        pub(crate) const fn exit_code(self) -> u8 {
            match self {
                Self::InstallHandler => 1,
                Self::ReceivePort => 2,
                Self::Connect => 3,
                Self::Validate => 4,
            }
        }

        /// Short description for the failure log line.
        const fn describe(self) -> &'static str {
            match self {
                Self::InstallHandler => "installing the network proxy handler",
                Self::ReceivePort => "receiving the port",
                Self::Connect => "connecting to the server",
                Self::Validate => "validating the received data",
            }
        }

        /// Tags an error with this step.
        fn fail(self) -> impl FnOnce(Error) -> (Self, Error) {
            move |e| (self, e)
        }
    }

    /// Entry point.
    pub(crate) fn main() -> ExitCode {
        let args = Args::parse();
        init_logging();

        match run(&args) {
            Ok(()) => ExitCode::SUCCESS,
            Err((step, e)) => {
                error!(error = %e, "failed {}", step.describe());
                ExitCode::from(step.exit_code())
            }
        }
    }

    /// Installs the stderr subscriber; `RUST_LOG` overrides the level.
    fn init_logging() {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(io::stderr)
            .init();
    }

    /// Runs the driver, returning the failed step on error.
    fn run(args: &Args) -> std::result::Result<(), (Step, Error)> {
        let comms = Comms::from_inherited_fd(CLIENT_COMMS_FD)
            .map_err(|e| (Step::ReceivePort, Error::local("control channel", e)))?;
        let sandbox = Sandbox::enter(comms).map_err(Step::ReceivePort.fail())?;

        let mode = if args.connect_with_handler {
            sandbox
                .install_network_proxy_handler()
                .map_err(Step::InstallHandler.fail())?;
            Mode::Automatic
        } else {
            Mode::Manual(sandbox.proxy_client().cloned())
        };

        let port = sandbox.recv_i32().map_err(Step::ReceivePort.fail())?;
        info!(port, ?mode, "received port");

        let sock = connect(&mode, port).map_err(Step::Connect.fail())?;
        let received = read_reply(TcpStream::from(sock))
            .map_err(|e| (Step::Validate, Error::local("read", e)))?;
        println!(
            "Sandboxee received data from the server:\n\n{}",
            String::from_utf8_lossy(&received)
        );
        validate(&received).map_err(Step::Validate.fail())
    }

    /// Connects a fresh `AF_INET6` stream socket to `[::1]:port`.
    ///
    /// The socket is closed on every error path.
    fn connect(mode: &Mode, port: i32) -> Result<OwnedFd> {
        let port = u16::try_from(port)
            .ok()
            .filter(|&p| p != 0)
            .ok_or_else(|| Error::Protocol(format!("received port {port} is out of range")))?;
        let target = TargetAddress::new(Family::V6, "::1", port)?;
        let sock = socket::socket(
            AddressFamily::Inet6,
            SockType::Stream,
            SockFlag::SOCK_CLOEXEC,
            None,
        )
        .map_err(|e| Error::local("socket", e.into()))?;

        match mode {
            Mode::Automatic => connect_direct(&sock, &target)?,
            Mode::Manual(Some(client)) => client.connect_to(sock.as_fd(), &target)?,
            Mode::Manual(None) => {
                return Err(Error::Protocol(
                    "no network proxy client; is the proxy enabled?".into(),
                ));
            }
        }
        Ok(sock)
    }

    /// Plain `connect(2)`, serviced by the handler in automatic mode.
    fn connect_direct(sock: &OwnedFd, target: &TargetAddress) -> Result<()> {
        let addr = SockaddrStorage::from(target.socket_addr());
        socket::connect(sock.as_raw_fd(), &addr).map_err(|e| Error::local("connect", e.into()))
    }

    /// Reads until EOF or [`READ_LIMIT`] bytes.
    pub(crate) fn read_reply(reader: impl Read) -> io::Result<Vec<u8>> {
        let mut buf = Vec::new();
        reader.take(READ_LIMIT).read_to_end(&mut buf)?;
        Ok(buf)
    }

    /// Checks the payload.
    pub(crate) fn validate(received: &[u8]) -> Result<()> {
        if received == EXPECTED {
            return Ok(());
        }
        Err(Error::Validation(format!(
            "expected {:?}, got {:?}",
            String::from_utf8_lossy(EXPECTED),
            String::from_utf8_lossy(received)
        )))
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn exit_codes_are_distinct() {
            let codes = [
                Step::InstallHandler,
                Step::ReceivePort,
                Step::Connect,
                Step::Validate,
            ]
            .map(Step::exit_code);
            assert_eq!(codes, [1, 2, 3, 4]);
        }

        #[test]
        fn read_stops_at_limit() {
            let data = vec![b'x'; 4096];
            assert_eq!(read_reply(data.as_slice()).unwrap().len(), 1024);
        }

        #[test]
        fn read_stops_at_eof() {
            assert_eq!(read_reply(EXPECTED).unwrap(), EXPECTED);
        }

        #[test]
        fn validation() {
            validate(EXPECTED).unwrap();
            assert!(matches!(validate(b"Hello World"), Err(Error::Validation(_))));
            assert!(matches!(validate(b"Goodbye World\n"), Err(Error::Validation(_))));
            assert!(matches!(validate(b""), Err(Error::Validation(_))));
        }

        #[test]
        fn out_of_range_port_fails_before_socket() {
            let mode = Mode::Manual(None);
            for port in [0, -1, 65536] {
                let err = connect(&mode, port).unwrap_err();
                assert!(matches!(err, Error::Protocol(m) if m.contains("out of range")));
            }
        }

        #[test]
        fn automatic_mode_connects_directly_without_trap() {
            // No filter is installed in the test process, so connect(2) is
            // a plain local connect.
            let listener = std::net::TcpListener::bind("[::1]:0").unwrap();
            let port = listener.local_addr().unwrap().port();
            let sock = connect(&Mode::Automatic, i32::from(port)).unwrap();
            let (accepted, _) = listener.accept().unwrap();
            assert_eq!(
                TcpStream::from(sock).local_addr().unwrap(),
                accepted.peer_addr().unwrap()
            );
        }

        #[test]
        fn manual_mode_without_client_fails() {
            let err = connect(&Mode::Manual(None), 8080).unwrap_err();
            assert!(matches!(err, Error::Protocol(m) if m.contains("no network proxy client")));
        }
    }
}

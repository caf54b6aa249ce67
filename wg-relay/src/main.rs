//! CLI entry point: parses the key-group configuration, binds the relay's
//! UDP socket, and runs the blocking receive loop. Everything that actually
//! understands the wire protocol lives in `wg-relay-core`; this crate is
//! just the process shell around it.

use std::net::UdpSocket;
use std::process::ExitCode;
use std::time::{Duration, Instant};

use clap::Parser;
use socket2::{Domain, Socket, Type};
use thiserror::Error;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

use wg_relay_core::RelayState;
use wg_relay_types::{PubKey, PubKeyError};

/// How long a blocking `recv_from` waits before returning control to the
/// loop so the expiry sweep gets a chance to run even on a quiet relay.
const RECV_TIMEOUT: Duration = Duration::from_secs(1);

/// Largest datagram the relay will read. Generously larger than any
/// WireGuard handshake message; oversized reads are just classified as
/// transport frames or dropped, same as on the wire.
const RECV_BUF_LEN: usize = 2048;

#[derive(Parser, Debug)]
#[command(name = "wg-relay")]
#[command(author, version, about = "Stateless WireGuard handshake relay", long_about = None)]
struct Args {
    /// UDP port to listen on, both IPv4 and IPv6.
    #[arg(short, long, default_value_t = 51820)]
    port: u16,

    /// A permission group: a comma-separated list of base64 WireGuard
    /// public keys that are allowed to rendezvous with each other. Repeat
    /// this flag once per group; at least one occurrence is required.
    #[arg(short, long = "keys", value_name = "KEY,KEY,...", required = true)]
    groups: Vec<String>,

    /// Enable debug-level logging.
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Debug, Error)]
enum StartupError {
    #[error("--keys group is empty")]
    EmptyGroup,
    #[error("invalid public key: {0}")]
    BadKey(#[from] PubKeyError),
    #[error("failed to bind udp socket on port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },
}

fn main() -> ExitCode {
    let args = Args::parse();

    let filter = if args.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err @ StartupError::Bind { .. }) => {
            eprintln!("error: {err}");
            ExitCode::from(1)
        }
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::from(2)
        }
    }
}

fn run(args: Args) -> Result<(), StartupError> {
    let groups = parse_groups(&args.groups)?;
    tracing::info!(groups = groups.len(), port = args.port, "starting relay");

    let socket = bind_dual_stack(args.port)?;
    let mut state = RelayState::new(groups);
    let mut buf = [0u8; RECV_BUF_LEN];

    loop {
        state.maybe_expire(Instant::now());

        let (n, from) = match socket.recv_from(&mut buf) {
            Ok(ok) => ok,
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
            {
                continue;
            }
            Err(e) => {
                warn!(error = %e, "recv_from failed, continuing");
                continue;
            }
        };

        if n == 0 {
            continue;
        }

        let targets = state.handle_datagram(Instant::now(), from, &buf[..n]);
        for target in targets {
            if let Err(e) = socket.send_to(&buf[..n], target) {
                warn!(to = %target, error = %e, "send_to failed");
            }
        }
    }
}

/// Parses `--keys` into permission groups. Each flag occurrence is one
/// comma-separated group; whitespace around keys is tolerated.
fn parse_groups(raw: &[String]) -> Result<Vec<Vec<PubKey>>, StartupError> {
    raw.iter()
        .map(|group| {
            let keys: Vec<PubKey> = group
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(PubKey::from_base64)
                .collect::<Result<_, _>>()?;
            if keys.is_empty() {
                return Err(StartupError::EmptyGroup);
            }
            debug!(keys = keys.len(), "loaded permission group");
            Ok(keys)
        })
        .collect()
}

/// Binds one dual-stack socket covering both IPv4 and IPv6 clients, the way
/// a relay with no particular interface preference should.
fn bind_dual_stack(port: u16) -> Result<UdpSocket, StartupError> {
    let addr: std::net::SocketAddr =
        format!("[::]:{port}").parse().expect("well-formed address");

    let socket = Socket::new(Domain::IPV6, Type::DGRAM, None)
        .map_err(|source| StartupError::Bind { port, source })?;
    socket
        .set_only_v6(false)
        .map_err(|source| StartupError::Bind { port, source })?;
    socket
        .bind(&addr.into())
        .map_err(|source| StartupError::Bind { port, source })?;

    let socket: UdpSocket = socket.into();
    socket
        .set_read_timeout(Some(RECV_TIMEOUT))
        .map_err(|source| StartupError::Bind { port, source })?;
    Ok(socket)
}

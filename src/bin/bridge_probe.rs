use std::cell::Cell;
use std::io::{self, Write};
use std::path::PathBuf;
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

use clap::Parser;
use tracing::{debug, info, warn};

use guest_bridge::pipe::{GuestPipe, PipeError, PipeHandle, WakeFlags};
use guest_bridge::reactor::EpollReactor;
use guest_bridge::tunnel::TunnelHub;
use guest_bridge::{BridgeConfig, Error};

#[derive(Parser, Debug)]
#[command(name = "bridge-probe", version)]
#[command(about = "Open one guest-pipe tunnel from the host and exchange bytes with its peer", long_about = None)]
struct Cli {
    /// Transport name: tcp, unix or opengles
    #[arg(long, default_value = "tcp")]
    transport: String,

    /// Transport argument (port for tcp, path for unix)
    #[arg(long)]
    arg: Option<String>,

    /// Bridge configuration file (.yaml/.yml or .json); BRIDGE_* env vars otherwise
    #[arg(long, env = "BRIDGE_CONFIG")]
    config: Option<PathBuf>,

    /// Payload to send once connected
    #[arg(long)]
    send: Option<String>,

    /// Give up waiting for the peer after this many milliseconds
    #[arg(long, default_value_t = 5000)]
    timeout_ms: u64,
}

/// Stand-in for the guest-visible pipe: records wakes and force-closes
#[derive(Default)]
struct ProbePipe {
    ready: Cell<WakeFlags>,
    closed: Cell<bool>,
}

impl ProbePipe {
    fn take(&self, flag: WakeFlags) -> bool {
        let ready = self.ready.get();
        if ready.contains(flag) {
            self.ready.set(ready - flag);
            true
        } else {
            false
        }
    }
}

impl GuestPipe for ProbePipe {
    fn wake(&self, flags: WakeFlags) {
        self.ready.set(self.ready.get() | flags);
    }

    fn close(&self) {
        self.closed.set(true);
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => BridgeConfig::load(path)?,
        None => BridgeConfig::from_env()?,
    };
    let mut hub = TunnelHub::with_epoll(config)?;

    let pipe = Rc::new(ProbePipe::default());
    let guest = Rc::downgrade(&pipe) as Weak<dyn GuestPipe>;
    let handle = hub.open_named(&cli.transport, guest, cli.arg.as_deref())?;
    info!("opened {} tunnel ({:?})", cli.transport, handle);

    let deadline = Instant::now() + Duration::from_millis(cli.timeout_ms);

    if let Some(payload) = &cli.send {
        send_all(&mut hub, &pipe, handle, payload.as_bytes(), deadline)?;
    }
    let received = drain(&mut hub, &pipe, handle, deadline)?;
    debug!("received {} bytes", received);

    if hub.close(handle).is_err() {
        warn!("tunnel already gone at close");
    }
    Ok(())
}

fn send_all(
    hub: &mut TunnelHub<EpollReactor>,
    pipe: &ProbePipe,
    handle: PipeHandle,
    payload: &[u8],
    deadline: Instant,
) -> Result<(), Error> {
    let mut offset = 0;
    while offset < payload.len() {
        match hub.send(handle, &[&payload[offset..]]) {
            Ok(n) => offset += n,
            Err(PipeError::TryAgain) => {
                hub.arm_wake(handle, WakeFlags::WRITE)?;
                if !wait_for(hub, pipe, WakeFlags::WRITE, deadline)? {
                    return Err(Error::Transport(format!(
                        "peer not writable after sending {} of {} bytes",
                        offset,
                        payload.len()
                    )));
                }
            }
            Err(e) => return Err(e.into()),
        }
    }
    info!("sent {} bytes", payload.len());
    Ok(())
}

fn drain(
    hub: &mut TunnelHub<EpollReactor>,
    pipe: &ProbePipe,
    handle: PipeHandle,
    deadline: Instant,
) -> Result<usize, Error> {
    let mut total = 0;
    let mut buf = [0u8; 4096];
    let mut stdout = io::stdout().lock();

    loop {
        match hub.recv(handle, &mut [&mut buf]) {
            Ok(n) => {
                stdout.write_all(&buf[..n])?;
                total += n;
            }
            Err(PipeError::TryAgain) => {
                hub.arm_wake(handle, WakeFlags::READ)?;
                if !wait_for(hub, pipe, WakeFlags::READ, deadline)? {
                    break;
                }
            }
            Err(PipeError::Io) => {
                debug!("peer closed the stream");
                break;
            }
            Err(PipeError::InvalidHandle) => {
                warn!("tunnel was closed by the host");
                break;
            }
        }
    }

    stdout.flush()?;
    Ok(total)
}

/// Run the reactor until `flag` is delivered. False on timeout or force-close.
fn wait_for(
    hub: &mut TunnelHub<EpollReactor>,
    pipe: &ProbePipe,
    flag: WakeFlags,
    deadline: Instant,
) -> Result<bool, Error> {
    loop {
        if pipe.closed.get() {
            return Ok(false);
        }
        if pipe.take(flag) {
            return Ok(true);
        }
        let now = Instant::now();
        if now >= deadline {
            return Ok(false);
        }
        hub.run_once(Some(deadline - now))?;
    }
}

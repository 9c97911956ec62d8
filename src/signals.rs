/// Wake signal: which OS signal means "show your window", how to send it, and
/// how to start listening for it.
///
/// The signal is chosen per platform at compile time. Unix has user-defined signals
/// and uses SIGUSR1; Windows has no such facility and uses SIGBREAK.
use crate::handler_chain::HandlerChain;

/// A platform signal bound to the logical wake event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WakeSignal {
    pub number: i32,
    pub name: &'static str,
}

impl std::fmt::Display for WakeSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.name, self.number)
    }
}

#[cfg(unix)]
pub const WAKE_SIGNAL: WakeSignal = WakeSignal {
    number: nix::libc::SIGUSR1,
    name: "SIGUSR1",
};

#[cfg(not(unix))]
pub const WAKE_SIGNAL: WakeSignal = WakeSignal {
    number: 21,
    name: "SIGBREAK",
};

/// Sending the wake signal to another process failed.
#[derive(Debug)]
pub enum SignalDeliveryError {
    /// The pid cannot name a single process (zero, or outside the OS pid range).
    InvalidPid { pid: u32 },
    /// This platform has no way to deliver the signal to another process.
    #[cfg_attr(unix, allow(dead_code))]
    Unsupported,
    /// The OS rejected the send (process gone, permission denied).
    Os { pid: u32, source: std::io::Error },
}

impl std::fmt::Display for SignalDeliveryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignalDeliveryError::InvalidPid { pid } => {
                write!(f, "refusing to signal invalid pid {}", pid)
            }
            SignalDeliveryError::Unsupported => {
                write!(f, "signal delivery is not supported on this platform")
            }
            SignalDeliveryError::Os { pid, source } => {
                write!(f, "failed to signal pid {}: {}", pid, source)
            }
        }
    }
}

impl std::error::Error for SignalDeliveryError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SignalDeliveryError::Os { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Installing the wake listener failed.
#[derive(Debug)]
pub enum InstallError {
    /// A wake listener already exists in this process.
    AlreadyInstalled,
    /// This platform cannot receive the wake signal.
    #[cfg_attr(unix, allow(dead_code))]
    Unsupported,
    /// Failed to create the self-pipe.
    Pipe { source: std::io::Error },
    /// Failed to register the OS signal handler.
    Sigaction {
        signal: WakeSignal,
        source: std::io::Error,
    },
    /// Failed to start the dispatch thread.
    Spawn { source: std::io::Error },
}

impl std::fmt::Display for InstallError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InstallError::AlreadyInstalled => {
                write!(f, "a wake listener is already installed in this process")
            }
            InstallError::Unsupported => {
                write!(f, "wake listening is not supported on this platform")
            }
            InstallError::Pipe { source } => write!(f, "failed to create wake pipe: {}", source),
            InstallError::Sigaction { signal, source } => {
                write!(f, "failed to install handler for {}: {}", signal, source)
            }
            InstallError::Spawn { source } => {
                write!(f, "failed to start wake dispatch thread: {}", source)
            }
        }
    }
}

impl std::error::Error for InstallError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            InstallError::Pipe { source }
            | InstallError::Sigaction { source, .. }
            | InstallError::Spawn { source } => Some(source),
            _ => None,
        }
    }
}

/// OS-facing side of the coordinator: send a wake signal, or listen for one.
pub trait SignalBackend {
    /// Kept alive for as long as the process should keep listening.
    type Listener;

    fn deliver(&self, signal: WakeSignal, pid: u32) -> Result<(), SignalDeliveryError>;

    /// Start listening for `signal`. Each delivery runs `chain` once.
    fn listen(&self, signal: WakeSignal, chain: HandlerChain)
        -> Result<Self::Listener, InstallError>;
}

/// Real signals for the current platform.
#[derive(Debug, Clone, Copy, Default)]
pub struct OsSignals;

#[cfg(unix)]
impl SignalBackend for OsSignals {
    type Listener = crate::listener::WakeListener;

    fn deliver(&self, signal: WakeSignal, pid: u32) -> Result<(), SignalDeliveryError> {
        deliver(signal, pid)
    }

    fn listen(
        &self,
        signal: WakeSignal,
        chain: HandlerChain,
    ) -> Result<Self::Listener, InstallError> {
        crate::listener::install(signal, chain)
    }
}

#[cfg(not(unix))]
impl SignalBackend for OsSignals {
    type Listener = ();

    fn deliver(&self, signal: WakeSignal, pid: u32) -> Result<(), SignalDeliveryError> {
        deliver(signal, pid)
    }

    fn listen(&self, _signal: WakeSignal, _chain: HandlerChain) -> Result<(), InstallError> {
        Err(InstallError::Unsupported)
    }
}

/// Convert to a positive OS pid. Zero and negative values address process
/// groups in `kill(2)`, so they are never passed through.
fn checked_pid(pid: u32) -> Result<i32, SignalDeliveryError> {
    match i32::try_from(pid) {
        Ok(raw) if raw > 0 => Ok(raw),
        _ => Err(SignalDeliveryError::InvalidPid { pid }),
    }
}

/// Send `signal` to `pid` without waiting for any acknowledgement.
#[cfg(unix)]
pub fn deliver(signal: WakeSignal, pid: u32) -> Result<(), SignalDeliveryError> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let raw = checked_pid(pid)?;
    let sig = Signal::try_from(signal.number).map_err(|e| SignalDeliveryError::Os {
        pid,
        source: e.into(),
    })?;
    kill(Pid::from_raw(raw), sig).map_err(|e| SignalDeliveryError::Os {
        pid,
        source: e.into(),
    })?;

    tracing::debug!(pid, signal = signal.name, "wake signal sent");
    Ok(())
}

#[cfg(not(unix))]
pub fn deliver(_signal: WakeSignal, pid: u32) -> Result<(), SignalDeliveryError> {
    checked_pid(pid)?;
    Err(SignalDeliveryError::Unsupported)
}

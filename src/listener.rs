/// Unix wake listener.
///
/// The OS handler only writes one byte to a non-blocking self-pipe. A dispatch thread
/// reads the pipe and runs the handler chain, so wake callbacks never execute in
/// signal context and a signal that arrives mid-chain waits its turn.
///
/// Whatever handler was registered for the signal before installation is captured at
/// that moment and appended to the chain, so it still runs after the new handlers.
use crate::handler_chain::HandlerChain;
use crate::signals::{InstallError, WakeSignal};
use nix::fcntl::{fcntl, FcntlArg, FdFlag, OFlag};
use nix::libc;
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use std::fs::File;
use std::io::{ErrorKind, Read};
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicI32, Ordering};
use std::thread::JoinHandle;

/// Write end of the self-pipe, or -1 before installation. Once installed, never closed.
static WAKE_PIPE: AtomicI32 = AtomicI32::new(-1);

extern "C" fn on_wake_signal(_signum: libc::c_int) {
    let fd = WAKE_PIPE.load(Ordering::Acquire);
    if fd < 0 {
        return;
    }
    // SAFETY: the descriptor is leaked at install time and stays open for the
    // life of the process. write(2) is async-signal-safe.
    let fd = unsafe { BorrowedFd::borrow_raw(fd) };
    // A full pipe already holds pending wakes; dropping this one is fine.
    let _ = nix::unistd::write(fd, &[1u8]);
}

/// Running wake listener. Dropping it does not uninstall the handler.
#[derive(Debug)]
pub struct WakeListener {
    signal: WakeSignal,
    dispatcher: JoinHandle<()>,
}

impl WakeListener {
    pub fn signal(&self) -> WakeSignal {
        self.signal
    }

    /// False once the dispatch thread has stopped reading the pipe.
    pub fn is_running(&self) -> bool {
        !self.dispatcher.is_finished()
    }
}

fn io_err(e: nix::Error) -> std::io::Error {
    e.into()
}

/// Install the wake handler for `signal`. Only one listener may exist per process.
pub fn install(signal: WakeSignal, mut chain: HandlerChain) -> Result<WakeListener, InstallError> {
    let sig = Signal::try_from(signal.number).map_err(|e| InstallError::Sigaction {
        signal,
        source: io_err(e),
    })?;

    let (read_end, write_end) = nix::unistd::pipe().map_err(|e| InstallError::Pipe {
        source: io_err(e),
    })?;
    configure_pipe(&read_end, &write_end).map_err(|e| InstallError::Pipe {
        source: io_err(e),
    })?;

    let raw_write = write_end.as_raw_fd();
    if WAKE_PIPE
        .compare_exchange(-1, raw_write, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        return Err(InstallError::AlreadyInstalled);
    }
    let raw_write = write_end.into_raw_fd();

    let action = SigAction::new(
        SigHandler::Handler(on_wake_signal),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    // SAFETY: the handler only touches an atomic and calls write(2).
    let previous = match unsafe { sigaction(sig, &action) } {
        Ok(previous) => previous,
        Err(e) => {
            release_slot(&WAKE_PIPE, raw_write, None);
            return Err(InstallError::Sigaction {
                signal,
                source: io_err(e),
            });
        }
    };

    chain_previous(&mut chain, signal, previous.handler());

    let spawned = std::thread::Builder::new()
        .name("wake-dispatch".to_string())
        .spawn(move || dispatch(File::from(read_end), chain, signal));
    let dispatcher = match spawned {
        Ok(handle) => handle,
        Err(e) => {
            release_slot(&WAKE_PIPE, raw_write, Some((sig, &previous)));
            return Err(InstallError::Spawn { source: e });
        }
    };

    tracing::debug!(signal = signal.name, "wake listener installed");
    Ok(WakeListener { signal, dispatcher })
}

/// Undo a partial installation: put back the handler we replaced, free the pipe
/// slot, then close the write end. `raw_write` must be the descriptor stored in `slot`.
fn release_slot(slot: &AtomicI32, raw_write: RawFd, restore: Option<(Signal, &SigAction)>) {
    if let Some((sig, previous)) = restore {
        // SAFETY: `previous` is exactly what sigaction returned for this signal.
        if let Err(e) = unsafe { sigaction(sig, previous) } {
            tracing::warn!(signal = %sig, error = %e, "failed to restore previous handler");
        }
    }
    slot.store(-1, Ordering::Release);
    // SAFETY: the descriptor was leaked by install and nothing else owns it.
    drop(unsafe { OwnedFd::from_raw_fd(raw_write) });
}

/// Both ends close on exec; only the write end is non-blocking.
fn configure_pipe(read_end: &OwnedFd, write_end: &OwnedFd) -> nix::Result<()> {
    for fd in [read_end.as_raw_fd(), write_end.as_raw_fd()] {
        fcntl(fd, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))?;
    }
    fcntl(write_end.as_raw_fd(), FcntlArg::F_SETFL(OFlag::O_NONBLOCK))?;
    Ok(())
}

/// Append the handler that was registered before ours, if it is a real function.
fn chain_previous(chain: &mut HandlerChain, signal: WakeSignal, previous: SigHandler) {
    let signum = signal.number;
    match previous {
        SigHandler::Handler(prior) => {
            tracing::debug!(signal = signal.name, "chaining to previous handler");
            chain.push(move || prior(signum));
        }
        SigHandler::SigAction(prior) => {
            tracing::debug!(signal = signal.name, "chaining to previous sigaction handler");
            chain.push(move || {
                // SAFETY: siginfo_t is plain data; all-zero is a valid value.
                let mut info: libc::siginfo_t = unsafe { std::mem::zeroed() };
                info.si_signo = signum;
                prior(signum, &mut info, std::ptr::null_mut());
            });
        }
        SigHandler::SigDfl | SigHandler::SigIgn => {}
    }
}

fn dispatch(mut pipe: File, chain: HandlerChain, signal: WakeSignal) {
    let mut buf = [0u8; 64];
    loop {
        match pipe.read(&mut buf) {
            Ok(0) => {
                tracing::debug!("wake pipe closed, dispatcher exiting");
                return;
            }
            Ok(n) => {
                for _ in 0..n {
                    tracing::info!(signal = signal.name, "received wake signal, showing up");
                    chain.invoke();
                }
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                tracing::warn!(error = %e, "wake pipe read failed, dispatcher exiting");
                return;
            }
        }
    }
}

//! SIGINT/SIGTERM self-pipe.
//!
//! Design Notes (§9) call for the teacher's preference for a direct libc
//! primitive over a signal-handling crate. A signal handler may only touch
//! async-signal-safe state, so this one does nothing but write a single byte
//! to a pipe whose raw fd was stashed in a static before the handler was
//! installed — the classic self-pipe trick, same shape as the DNS offload's
//! completion pipe in `dns.rs`.

use mio::unix::pipe;
use std::io;
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicI32, Ordering};

const SIGINT: i32 = 2;
const SIGTERM: i32 = 15;

static SIGNAL_FD: AtomicI32 = AtomicI32::new(-1);

extern "C" {
    fn signal(signum: i32, handler: usize) -> usize;
    fn write(fd: i32, buf: *const u8, count: usize) -> isize;
}

extern "C" fn on_signal(_signum: i32) {
    let fd = SIGNAL_FD.load(Ordering::Relaxed);
    if fd >= 0 {
        let byte: u8 = 1;
        unsafe {
            write(fd, &byte as *const u8, 1);
        }
    }
}

/// Install handlers for SIGINT and SIGTERM and return the receiving half of
/// the self-pipe; register it with the selector and treat it readable as
/// "begin shutdown".
pub fn install() -> io::Result<pipe::Receiver> {
    let (sender, receiver) = pipe::new()?;
    SIGNAL_FD.store(sender.as_raw_fd(), Ordering::Relaxed);
    // The sender's fd must stay open for the handler to write to for the
    // rest of the process's life; nothing else holds it.
    std::mem::forget(sender);

    unsafe {
        signal(SIGINT, on_signal as usize);
        signal(SIGTERM, on_signal as usize);
    }

    Ok(receiver)
}

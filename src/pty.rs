//! PTY allocation, spawning a process on the slave side, and terminal resize.
//!
//! Uses the `nix` crate for the POSIX PTY APIs. The master fd is kept alive by
//! [`PtyResizer`] for the whole stream lifetime; reads and writes go through
//! independent duplicates of it.

use std::io;
use std::os::fd::{AsRawFd, OwnedFd};
use std::pin::Pin;
use std::process::Stdio;
use std::task::{Context, Poll};

use nix::pty::{openpty, OpenptyResult, Winsize};
use tokio::io::{AsyncRead, ReadBuf};
use tokio::process::{Child, Command};

use crate::cluster::{Resize, TerminalSize};

/// An allocated PTY pair.
pub struct PtyPair {
    pub master: OwnedFd,
    pub slave: OwnedFd,
}

fn winsize(size: TerminalSize) -> Winsize {
    Winsize {
        ws_row: size.rows,
        ws_col: size.cols,
        ws_xpixel: 0,
        ws_ypixel: 0,
    }
}

/// Allocate a PTY pair with the given terminal size.
///
/// The master is marked close-on-exec so children only ever see the slave.
pub fn allocate_pty(size: TerminalSize) -> io::Result<PtyPair> {
    let OpenptyResult { master, slave } = openpty(&winsize(size), None).map_err(io::Error::from)?;
    // SAFETY: F_SETFD on an fd we own.
    if unsafe { libc::fcntl(master.as_raw_fd(), libc::F_SETFD, libc::FD_CLOEXEC) } == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(PtyPair { master, slave })
}

/// Spawn `cmd` with the PTY slave as its controlling terminal and stdio.
///
/// The child becomes a session leader. The caller should drop its copy of the
/// slave afterwards so reads on the master see EOF when the child exits.
pub fn spawn_on_pty(cmd: &mut Command, pty: &PtyPair) -> io::Result<Child> {
    let slave_fd = pty.slave.as_raw_fd();

    // stdio is wired up in pre_exec (dup2 to the slave).
    cmd.stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true);

    // SAFETY: All syscalls used here are async-signal-safe per POSIX.
    unsafe {
        cmd.pre_exec(move || {
            if libc::setsid() == -1 {
                return Err(io::Error::last_os_error());
            }
            if libc::ioctl(slave_fd, libc::TIOCSCTTY, 0) == -1 {
                return Err(io::Error::last_os_error());
            }
            libc::dup2(slave_fd, 0);
            libc::dup2(slave_fd, 1);
            libc::dup2(slave_fd, 2);
            if slave_fd > 2 {
                libc::close(slave_fd);
            }
            Ok(())
        });
    }

    cmd.spawn()
}

/// Set the terminal window size on a PTY master.
pub fn resize_pty(master: &OwnedFd, size: TerminalSize) -> io::Result<()> {
    let ws = winsize(size);
    // SAFETY: TIOCSWINSZ reads a Winsize struct that outlives the call.
    let ret = unsafe { libc::ioctl(master.as_raw_fd(), libc::TIOCSWINSZ, std::ptr::addr_of!(ws)) };
    if ret == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Async file over a duplicate of the master fd.
pub fn master_file(master: &OwnedFd) -> io::Result<tokio::fs::File> {
    let dup = master.try_clone()?;
    Ok(tokio::fs::File::from_std(std::fs::File::from(dup)))
}

/// Reader over the PTY master that reports `EIO` as end of stream.
///
/// Linux returns `EIO` from a master read once every slave fd is closed,
/// which is how the end of the attached process shows up.
pub struct PtyReader {
    inner: tokio::fs::File,
}

impl PtyReader {
    pub fn new(master: &OwnedFd) -> io::Result<Self> {
        Ok(Self {
            inner: master_file(master)?,
        })
    }
}

impl AsyncRead for PtyReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match Pin::new(&mut self.inner).poll_read(cx, buf) {
            Poll::Ready(Err(e)) if e.raw_os_error() == Some(libc::EIO) => Poll::Ready(Ok(())),
            other => other,
        }
    }
}

/// Owns the PTY master and applies resizes to it.
pub struct PtyResizer {
    master: OwnedFd,
}

impl PtyResizer {
    pub fn new(master: OwnedFd) -> Self {
        Self { master }
    }
}

impl Resize for PtyResizer {
    fn resize(&mut self, size: TerminalSize) -> io::Result<()> {
        resize_pty(&self.master, size)
    }
}

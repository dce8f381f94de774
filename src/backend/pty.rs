//! PTY allocation, process spawning on the slave side, and resize.
//!
//! `kubectl exec -t` only allocates a remote terminal when its own stdin is a
//! terminal, so interactive sessions run it inside a local PTY. The master
//! side carries the session bytes; window size changes are applied to it with
//! `TIOCSWINSZ` and propagate to the remote terminal.

use std::fs::File;
use std::io;
use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::process::Stdio;

use nix::pty::{openpty, OpenptyResult, Winsize};
use tokio::process::{Child, Command};

use crate::sessions::resize::TerminalSize;

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

/// Allocate a PTY pair with the given window size.
pub fn allocate_pty(size: TerminalSize) -> Result<PtyPair, nix::Error> {
    let OpenptyResult { master, slave } = openpty(&winsize(size), None)?;
    Ok(PtyPair { master, slave })
}

/// Spawn `program args` with the PTY slave as its controlling terminal and
/// stdio. The child leads a new session, so signals from the line discipline
/// (Ctrl-C) reach it.
pub fn spawn_in_pty(pty: &PtyPair, program: &str, args: &[String]) -> io::Result<Child> {
    let slave_fd = pty.slave.as_raw_fd();
    let mut cmd = Command::new(program);
    cmd.args(args)
        .env("TERM", "xterm-256color")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true);

    // SAFETY: only async-signal-safe calls between fork and exec.
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

/// Independent async read and write handles on the master side.
pub fn master_io(master: &OwnedFd) -> io::Result<(tokio::fs::File, tokio::fs::File)> {
    let reader = File::from(master.as_fd().try_clone_to_owned()?);
    let writer = File::from(master.as_fd().try_clone_to_owned()?);
    Ok((
        tokio::fs::File::from_std(reader),
        tokio::fs::File::from_std(writer),
    ))
}

/// Apply a new window size to the terminal.
pub fn resize_pty(master: &OwnedFd, size: TerminalSize) -> Result<(), nix::Error> {
    let ws = winsize(size);
    // SAFETY: TIOCSWINSZ reads a Winsize from the pointer.
    let ret = unsafe { libc::ioctl(master.as_raw_fd(), libc::TIOCSWINSZ, std::ptr::addr_of!(ws)) };
    if ret == -1 {
        Err(nix::Error::last())
    } else {
        Ok(())
    }
}

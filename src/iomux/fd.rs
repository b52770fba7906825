// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::fail::Fail;
use ::std::{
    io,
    os::unix::io::RawFd,
};

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Sets the `O_NONBLOCK` flag on `fd`.
pub fn set_nonblocking(fd: RawFd) -> Result<(), Fail> {
    set_status_flag(fd, libc::O_NONBLOCK, true)
}

/// Clears the `O_NONBLOCK` flag on `fd`.
pub fn set_blocking(fd: RawFd) -> Result<(), Fail> {
    set_status_flag(fd, libc::O_NONBLOCK, false)
}

/// Sets the close-on-exec flag on `fd`.
pub fn set_cloexec(fd: RawFd) -> Result<(), Fail> {
    let flags: i32 = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 {
        return Err(Fail::last_os_error("fcntl(F_GETFD) failed"));
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) } < 0 {
        return Err(Fail::last_os_error("fcntl(F_SETFD) failed"));
    }
    Ok(())
}

/// Writes all of `bytes` to `fd`, retrying short writes and `EINTR`.
pub fn write_all(fd: RawFd, bytes: &[u8]) -> Result<(), Fail> {
    let mut written: usize = 0;
    while written < bytes.len() {
        let n: isize = unsafe {
            libc::write(
                fd,
                bytes[written..].as_ptr() as *const libc::c_void,
                bytes.len() - written,
            )
        };
        if n < 0 {
            if io::Error::last_os_error().raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            return Err(Fail::last_os_error("write failed"));
        }
        written += n as usize;
    }
    Ok(())
}

/// Closes `fd`, retrying `EINTR`.
pub fn close(fd: RawFd) {
    loop {
        if unsafe { libc::close(fd) } == 0 {
            return;
        }
        if io::Error::last_os_error().raw_os_error() != Some(libc::EINTR) {
            return;
        }
    }
}

fn set_status_flag(fd: RawFd, flag: i32, on: bool) -> Result<(), Fail> {
    let flags: i32 = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(Fail::last_os_error("fcntl(F_GETFL) failed"));
    }
    let flags: i32 = if on { flags | flag } else { flags & !flag };
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags) } < 0 {
        return Err(Fail::last_os_error("fcntl(F_SETFL) failed"));
    }
    Ok(())
}

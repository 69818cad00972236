use crate::server::StoreError;
use std::io;
use std::mem;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::FromRawFd;
use std::os::unix::net::UnixListener;
use std::path::Path;

const LISTEN_BACKLOG: libc::c_int = 5;

/// Create, bind and listen on a Unix domain stream socket.
///
/// The three steps are performed separately so their failures stay
/// distinguishable to the caller.
pub fn listen(path: &Path) -> Result<UnixListener, StoreError> {
    let fd = unsafe { libc::socket(libc::AF_UNIX, libc::SOCK_STREAM, 0) };
    if fd < 0 {
        return Err(StoreError::Setup(io::Error::last_os_error()));
    }

    let mut addr: libc::sockaddr_un = unsafe { mem::zeroed() };
    addr.sun_family = libc::AF_UNIX as libc::sa_family_t;

    let bytes = path.as_os_str().as_bytes();
    if bytes.len() >= addr.sun_path.len() {
        unsafe { libc::close(fd) };
        return Err(StoreError::Setup(io::Error::new(
            io::ErrorKind::InvalidInput,
            "socket path too long",
        )));
    }
    for (dst, src) in addr.sun_path.iter_mut().zip(bytes.iter()) {
        *dst = *src as libc::c_char;
    }

    let len = (mem::size_of::<libc::sa_family_t>() + bytes.len() + 1) as libc::socklen_t;
    if unsafe { libc::bind(fd, &addr as *const libc::sockaddr_un as *const libc::sockaddr, len) } < 0 {
        let err = io::Error::last_os_error();
        unsafe { libc::close(fd) };
        return Err(StoreError::Setup(err));
    }

    if unsafe { libc::listen(fd, LISTEN_BACKLOG) } < 0 {
        let err = io::Error::last_os_error();
        unsafe { libc::close(fd) };
        return Err(StoreError::Listen(err));
    }

    let listener = unsafe { UnixListener::from_raw_fd(fd) };
    listener.set_nonblocking(true).map_err(StoreError::Setup)?;
    Ok(listener)
}

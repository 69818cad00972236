use std::io;
use std::os::unix::io::{AsRawFd, RawFd};

/// A borrowed file descriptor exposed through `io::Read`/`io::Write`.
///
/// Used for descriptors inherited from the host shell (the two stream
/// sides, standard input) which must not be closed on drop and which are
/// driven in non-blocking mode.
#[derive(Debug)]
pub struct Fd(RawFd);

impl Fd {
    #[inline]
    pub fn new(fd: RawFd) -> Fd {
        Fd(fd)
    }

    #[inline]
    pub fn stdin() -> Fd {
        Fd(libc::STDIN_FILENO)
    }

    #[inline]
    pub fn stdout() -> Fd {
        Fd(libc::STDOUT_FILENO)
    }

    /// Switch the descriptor to non-blocking mode.
    pub fn set_nonblocking(&self) -> io::Result<()> {
        set_nonblocking(self.0)
    }
}

impl io::Read for Fd {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = unsafe { libc::read(self.0, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if n < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(n as usize)
        }
    }
}

impl io::Write for Fd {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = unsafe { libc::write(self.0, buf.as_ptr() as *const libc::c_void, buf.len()) };
        if n < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(n as usize)
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl AsRawFd for Fd {
    #[inline]
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

/// Set `O_NONBLOCK` on an arbitrary descriptor.
pub fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};

    fn pipe() -> (Fd, Fd) {
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        (Fd::new(fds[0]), Fd::new(fds[1]))
    }

    #[test]
    fn test_pipe_roundtrip() {
        let (mut read_end, mut write_end) = pipe();

        write_end.write_all(b"sgsh").unwrap();

        let mut buf = [0u8; 16];
        let n = read_end.read(&mut buf).unwrap();

        assert_eq!(&buf[..n], b"sgsh");
    }

    #[test]
    fn test_nonblocking_read_would_block() {
        let (mut read_end, _write_end) = pipe();
        read_end.set_nonblocking().unwrap();

        let mut buf = [0u8; 16];
        let err = read_end.read(&mut buf).unwrap_err();

        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }
}

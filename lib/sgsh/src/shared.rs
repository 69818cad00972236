use std::env;
use std::io;

pub type SgshResult<T> = Result<T, SgshError>;

/// Two-level error model: `Wait` marks an operation that would block and
/// should be retried on the next ready event, everything else is fatal.
#[derive(Debug, Eq, PartialEq)]
pub enum SgshError {
    Wait,
    Fatal(ErrorKind),
}

#[derive(Debug, Eq, PartialEq)]
pub enum ErrorKind {
    Usage,
    Environment,
    Protocol,
    Topology,
    SlotsExhausted,
    ShortWrite,
    UnknownCommand,
    Io(io::ErrorKind),
}

impl From<io::Error> for SgshError {
    #[inline]
    fn from(io_error: io::Error) -> Self {
        match io_error.kind() {
            io::ErrorKind::WouldBlock => SgshError::Wait,
            kind => SgshError::Fatal(ErrorKind::Io(kind)),
        }
    }
}

pub trait ErrorUtils {
    fn has_failed(&self) -> bool;
}

impl<T> ErrorUtils for SgshResult<T> {
    fn has_failed(&self) -> bool {
        match self {
            Ok(_) => false,
            Err(SgshError::Wait) => false,
            _ => true,
        }
    }
}

/// Read a 0/1 environment flag. A missing or malformed variable is fatal.
pub fn env_flag(name: &str) -> SgshResult<bool> {
    let value = env::var(name).map_err(|_| SgshError::Fatal(ErrorKind::Environment))?;
    match value.trim().parse::<i32>() {
        Ok(v) => Ok(v != 0),
        Err(_) => Err(SgshError::Fatal(ErrorKind::Environment)),
    }
}

/// Augmented `io::Write` that is aware of the amount of remaining free capacity in the destination.
pub trait SizedWrite: io::Write {
    /// Remaining free capacity in the destination.
    fn free_capacity(&self) -> usize;
}

/// Augmented `io::Read` that is aware of the amount of remaining data in the source.
pub trait SizedRead: io::Read {
    /// Remaining data in the source.
    fn remaining_data(&self) -> usize;
}

impl SizedWrite for io::Cursor<&mut [u8]> {
    #[inline]
    fn free_capacity(&self) -> usize {
        self.get_ref().len() - self.position() as usize
    }
}

impl SizedWrite for Vec<u8> {
    #[inline]
    fn free_capacity(&self) -> usize {
        usize::max_value()
    }
}

impl SizedRead for io::Cursor<&[u8]> {
    #[inline]
    fn remaining_data(&self) -> usize {
        self.get_ref().len() - self.position() as usize
    }
}

/// Trait for manually serialized objects. Implementors must take care to validate the remaining
/// free capacity in the stream upfront and only write into it if all the content they wish to
/// write can be written.
///
/// Should return `SgshError::Wait` in case there is not enough capacity in the stream.
pub trait Serialize {
    fn serialize<W: SizedWrite>(&self, stream: &mut W) -> SgshResult<()>;
}

/// Trait for manually deserialized objects.
pub trait Deserialize: Sized {
    fn deserialize<R: SizedRead>(stream: &mut R) -> SgshResult<Self>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wouldblock_folds_to_wait() {
        let err: SgshError = io::Error::from(io::ErrorKind::WouldBlock).into();
        assert_eq!(err, SgshError::Wait);
    }

    #[test]
    fn test_other_io_errors_are_fatal() {
        let err: SgshError = io::Error::from(io::ErrorKind::BrokenPipe).into();
        assert_eq!(err, SgshError::Fatal(ErrorKind::Io(io::ErrorKind::BrokenPipe)));
    }

    #[test]
    fn test_has_failed() {
        assert!(!Ok::<(), SgshError>(()).has_failed());
        assert!(!Err::<(), _>(SgshError::Wait).has_failed());
        assert!(Err::<(), _>(SgshError::Fatal(ErrorKind::Protocol)).has_failed());
    }

    #[test]
    fn test_env_flag() {
        env::set_var("SGSH_SHARED_TEST_FLAG", "1");
        assert_eq!(env_flag("SGSH_SHARED_TEST_FLAG"), Ok(true));
        env::set_var("SGSH_SHARED_TEST_FLAG", "0");
        assert_eq!(env_flag("SGSH_SHARED_TEST_FLAG"), Ok(false));
        env::set_var("SGSH_SHARED_TEST_FLAG", "bogus");
        assert_eq!(
            env_flag("SGSH_SHARED_TEST_FLAG"),
            Err(SgshError::Fatal(ErrorKind::Environment))
        );
        assert_eq!(
            env_flag("SGSH_SHARED_TEST_FLAG_MISSING"),
            Err(SgshError::Fatal(ErrorKind::Environment))
        );
    }
}

use std::io::Error as IoError;

#[derive(Debug)]
pub enum Error {
    /// Pre-run validation failed; carries every violation found in the
    /// pass so a single fix cycle suffices.
    InvariantViolation(Vec<String>),

    /// A name we were about to mint already exists and is not ours.
    NameCollision(String),

    NotFound(String),

    /// Missing CAP_NET_ADMIN / CAP_SYS_ADMIN.
    NotPermitted(String),

    /// Kernel call or process spawn failed; the originating error is kept
    /// as the cause.
    ExternalFailure(String, Option<IoError>),

    /// A daemon's control socket never appeared within the deadline.
    DaemonUnready(String),

    /// API call on the wrong side of a lifecycle edge.
    InvalidState(String),

    /// Operation not defined on this node variant.
    Unsupported(String),
}

impl Error {
    pub(crate) fn external(what: impl Into<String>, err: IoError) -> Self {
        Self::ExternalFailure(what.into(), Some(err))
    }

    /// Classifies an io error into the taxonomy by errno.
    pub(crate) fn from_io(what: impl Into<String>, err: IoError) -> Self {
        let what = what.into();
        match err.raw_os_error() {
            Some(libc::EPERM) | Some(libc::EACCES) => Self::NotPermitted(what),
            Some(libc::EEXIST) => Self::NameCollision(what),
            Some(libc::ENOENT) | Some(libc::ENODEV) | Some(libc::ESRCH) => Self::NotFound(what),
            _ => Self::ExternalFailure(what, Some(err)),
        }
    }

    pub(crate) fn from_rtnetlink(what: impl Into<String>, err: rtnetlink::Error) -> Self {
        match err {
            rtnetlink::Error::NetlinkError(msg) => Self::from_io(what, msg.to_io()),
            other => Self::ExternalFailure(what.into(), Some(IoError::other(other.to_string()))),
        }
    }

    pub(crate) fn from_errno(what: impl Into<String>, errno: nix::errno::Errno) -> Self {
        Self::from_io(what, IoError::from_raw_os_error(errno as i32))
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvariantViolation(violations) => {
                write!(f, "invariant violations: {}", violations.join("; "))
            }
            Self::NameCollision(what) => write!(f, "name collision: {}", what),
            Self::NotFound(what) => write!(f, "not found: {}", what),
            Self::NotPermitted(what) => write!(f, "not permitted: {}", what),
            Self::ExternalFailure(what, Some(cause)) => write!(f, "{}: {}", what, cause),
            Self::ExternalFailure(what, None) => write!(f, "{}", what),
            Self::DaemonUnready(what) => write!(f, "daemon unready: {}", what),
            Self::InvalidState(what) => write!(f, "invalid state: {}", what),
            Self::Unsupported(what) => write!(f, "unsupported: {}", what),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::ExternalFailure(_, Some(cause)) => Some(cause),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::ErrorKind;

    #[test]
    fn classifies_by_errno() {
        let err = Error::from_io("create netns r1", IoError::from_raw_os_error(libc::EPERM));
        assert!(matches!(err, Error::NotPermitted(_)));

        let err = Error::from_io("create bridge sw0", IoError::from_raw_os_error(libc::EEXIST));
        assert!(matches!(err, Error::NameCollision(_)));

        let err = Error::from_io("delete link v0", IoError::from_raw_os_error(libc::ENODEV));
        assert!(matches!(err, Error::NotFound(_)));

        let err = Error::from_io("netlink", IoError::from_raw_os_error(libc::EINVAL));
        assert!(matches!(err, Error::ExternalFailure(_, Some(_))));
    }

    #[test]
    fn preserves_cause() {
        let cause = IoError::new(ErrorKind::BrokenPipe, "pipe closed");
        let err = Error::external("write to control socket", cause);
        assert!(std::error::Error::source(&err).is_some());
        assert_eq!(err.to_string(), "write to control socket: pipe closed");
    }

    #[test]
    fn batches_violations() {
        let err = Error::InvariantViolation(vec![
            String::from("interface eth0 on r1 references unknown switch sw9"),
            String::from("route on r2 references missing device eth7"),
        ]);
        let text = err.to_string();
        assert!(text.contains("sw9"));
        assert!(text.contains("eth7"));
    }
}

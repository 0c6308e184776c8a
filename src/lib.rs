pub mod daemons;
pub mod devices;
pub mod error;
pub(crate) mod executor;
pub mod topology;

pub type Result<T> = std::result::Result<T, error::Error>;

pub(crate) type Index = libc::c_uint;

/// Base directory for per-daemon runtime state (config, control socket,
/// log and pid files). Each daemon-bearing node gets a subdirectory.
pub const RUN_BASE_DIR: &str = "/run/nsnetsim";

/// Kernel limit on interface and namespace names (IFNAMSIZ minus the
/// trailing NUL).
pub(crate) const NAME_MAX: usize = 15;

use crate::devices::in_namespace;
use crate::error::Error;
use crate::{Result, RUN_BASE_DIR};

use nix::sys::stat::Mode;
use nix::unistd::mkfifo;
use std::fs::OpenOptions;
use std::io::{ErrorKind, Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};
use sysinfo::{Pid as SystemPid, System};

mod bird;
mod exabgp;

pub use bird::Bird;
pub use exabgp::ExaBgp;

pub(crate) const DAEMON_CONFIG: &str = "config";
pub(crate) const CONTROL_SOCKET: &str = "control.sock";
pub(crate) const CONTROL_PIPE_IN: &str = "control.sock.in";
pub(crate) const CONTROL_PIPE_OUT: &str = "control.sock.out";
pub(crate) const DAEMON_LOG: &str = "daemon.log";
pub(crate) const DAEMON_PID: &str = "daemon.pid";

const READY_TIMEOUT: Duration = Duration::from_secs(10);
const STOP_GRACE: Duration = Duration::from_secs(5);
const QUERY_TIMEOUT: Duration = Duration::from_secs(5);
const DRAIN_TIMEOUT: Duration = Duration::from_millis(200);
const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug)]
pub enum Daemon {
    Bird(Bird),
    ExaBgp(ExaBgp),
}

impl Daemon {
    pub(crate) fn program(&self) -> &str {
        match self {
            Self::Bird(bird) => &bird.daemon_path,
            Self::ExaBgp(exabgp) => &exabgp.daemon_path,
        }
    }

    fn command(&self, run_dir: &Path) -> Command {
        let config = run_dir.join(DAEMON_CONFIG);
        match self {
            Self::Bird(bird) => {
                let mut command = Command::new(&bird.daemon_path);
                command
                    .arg("-f")
                    .arg("-c")
                    .arg(&config)
                    .arg("-s")
                    .arg(run_dir.join(CONTROL_SOCKET));
                command
            }
            Self::ExaBgp(exabgp) => {
                let mut command = Command::new(&exabgp.daemon_path);
                command
                    .arg(&config)
                    .env("exabgp.daemon.daemonize", "false")
                    .env("exabgp.api.pipename", CONTROL_SOCKET)
                    .env("exabgp.api.ack", "false");
                command
            }
        }
    }

    /// Path whose appearance signals the daemon is ready to be queried.
    /// BIRD creates its control socket itself; the ExaBGP pipes are
    /// materialised by the supervisor, so readiness additionally leans on
    /// the exited-child check in the poll loop.
    fn readiness_path(&self, run_dir: &Path) -> PathBuf {
        match self {
            Self::Bird(_) => run_dir.join(CONTROL_SOCKET),
            Self::ExaBgp(_) => run_dir.join(CONTROL_PIPE_OUT),
        }
    }
}

/// Supervises one routing daemon inside a router's namespace: materialises
/// its runtime directory, launches it, gates on readiness, and proxies
/// control-channel queries as opaque bytes.
#[derive(Debug)]
pub struct Supervisor {
    pub(crate) node: String,
    daemon: Daemon,
    config: PathBuf,
    base_dir: PathBuf,
    child: Option<Child>,
}

impl Supervisor {
    pub fn new(node: &str, daemon: Daemon, config: PathBuf) -> Self {
        Self {
            node: node.to_string(),
            daemon,
            config,
            base_dir: PathBuf::from(RUN_BASE_DIR),
            child: None,
        }
    }

    /// Relocates the runtime directory, mainly for unprivileged tests.
    pub fn with_base_dir(mut self, base_dir: impl Into<PathBuf>) -> Self {
        self.base_dir = base_dir.into();
        self
    }

    pub fn run_dir(&self) -> PathBuf {
        self.base_dir.join(&self.node)
    }

    pub(crate) fn config_path(&self) -> &Path {
        &self.config
    }

    /// Sets up `/run/nsnetsim/<node>/`: copies the caller's config to a
    /// stable path and pre-creates the ExaBGP control pipes. A pid file
    /// naming a live process means the directory belongs to another
    /// simulation; we refuse rather than adopt or kill it.
    pub(crate) fn materialise(&self) -> Result<()> {
        let run_dir = self.run_dir();
        std::fs::create_dir_all(&run_dir)
            .map_err(|err| Error::from_io(format!("create {}", run_dir.display()), err))?;

        if let Ok(contents) = std::fs::read_to_string(run_dir.join(DAEMON_PID)) {
            if let Ok(pid) = contents.trim().parse::<u32>() {
                let system = System::new_all();
                if system.process(SystemPid::from_u32(pid)).is_some() {
                    return Err(Error::NameCollision(format!(
                        "runtime directory {} is held by live process {pid}",
                        run_dir.display()
                    )));
                }
            }
        }

        std::fs::copy(&self.config, run_dir.join(DAEMON_CONFIG)).map_err(|err| {
            Error::from_io(
                format!(
                    "copy config {} for {}",
                    self.config.display(),
                    self.node
                ),
                err,
            )
        })?;

        if matches!(self.daemon, Daemon::ExaBgp(_)) {
            for pipe in [CONTROL_PIPE_IN, CONTROL_PIPE_OUT] {
                let path = run_dir.join(pipe);
                if !path.exists() {
                    mkfifo(&path, Mode::S_IRUSR | Mode::S_IWUSR).map_err(|errno| {
                        Error::from_errno(format!("mkfifo {}", path.display()), errno)
                    })?;
                }
            }
        }
        Ok(())
    }

    /// Spawns the daemon inside the router's namespace with stdout and
    /// stderr captured to the per-node log file. Returns the pid for the
    /// cleanup stack.
    pub(crate) fn launch(&mut self, netns_path: &str) -> Result<i32> {
        let run_dir = self.run_dir();
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(run_dir.join(DAEMON_LOG))
            .map_err(|err| Error::from_io(format!("open log for {}", self.node), err))?;
        let log_err = log
            .try_clone()
            .map_err(|err| Error::external(format!("clone log handle for {}", self.node), err))?;

        let mut command = self.daemon.command(&run_dir);
        command
            .current_dir(&run_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err));

        let child = in_namespace(netns_path, move || command.spawn())?
            .map_err(|err| Error::from_io(format!("spawn {} for {}", self.daemon.program(), self.node), err))?;
        let pid = child.id() as i32;
        std::fs::write(run_dir.join(DAEMON_PID), format!("{pid}\n"))
            .map_err(|err| Error::from_io(format!("write pid file for {}", self.node), err))?;
        tracing::info!(node = %self.node, pid, "daemon started");
        self.child = Some(child);
        Ok(pid)
    }

    /// Polls for the control channel until it appears or the deadline
    /// elapses, failing early if the daemon dies during startup.
    pub(crate) async fn wait_ready(&mut self) -> Result<()> {
        let run_dir = self.run_dir();
        let ready = self.daemon.readiness_path(&run_dir);
        let deadline = Instant::now() + READY_TIMEOUT;
        loop {
            if let Some(child) = self.child.as_mut() {
                if let Some(status) = child
                    .try_wait()
                    .map_err(|err| Error::external(format!("wait on daemon for {}", self.node), err))?
                {
                    return Err(Error::ExternalFailure(
                        format!(
                            "daemon for {} exited during startup ({status}); see {}",
                            self.node,
                            run_dir.join(DAEMON_LOG).display()
                        ),
                        None,
                    ));
                }
            }
            if ready.exists() {
                tracing::debug!(node = %self.node, "daemon ready");
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(Error::DaemonUnready(format!(
                    "control channel {} for {} did not appear within {READY_TIMEOUT:?}",
                    ready.display(),
                    self.node
                )));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Writes the raw request to the daemon's control channel and returns
    /// the raw response. No parsing happens here.
    pub(crate) fn query(&self, request: &[u8]) -> Result<Vec<u8>> {
        let run_dir = self.run_dir();
        match &self.daemon {
            Daemon::Bird(_) => query_socket(&run_dir.join(CONTROL_SOCKET), request),
            Daemon::ExaBgp(_) => query_pipe(
                &run_dir.join(CONTROL_PIPE_IN),
                &run_dir.join(CONTROL_PIPE_OUT),
                request,
            ),
        }
    }
}

fn query_socket(path: &Path, request: &[u8]) -> Result<Vec<u8>> {
    let mut stream = UnixStream::connect(path)
        .map_err(|err| Error::from_io(format!("connect to {}", path.display()), err))?;
    stream
        .set_read_timeout(Some(QUERY_TIMEOUT))
        .map_err(|err| Error::external(format!("configure {}", path.display()), err))?;
    stream
        .write_all(request)
        .map_err(|err| Error::external(format!("write to {}", path.display()), err))?;
    if !request.ends_with(b"\n") {
        stream
            .write_all(b"\n")
            .map_err(|err| Error::external(format!("write to {}", path.display()), err))?;
    }

    let mut response = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        match stream.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                response.extend_from_slice(&buf[..n]);
                // the daemon keeps the socket open after answering; shorten
                // the window once the first chunk has landed
                stream
                    .set_read_timeout(Some(DRAIN_TIMEOUT))
                    .map_err(|err| Error::external(format!("configure {}", path.display()), err))?;
            }
            Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                if response.is_empty() {
                    return Err(Error::external(
                        format!("no response on {}", path.display()),
                        err,
                    ));
                }
                break;
            }
            Err(err) => {
                return Err(Error::external(format!("read from {}", path.display()), err));
            }
        }
    }
    Ok(response)
}

fn query_pipe(tx: &Path, rx: &Path, request: &[u8]) -> Result<Vec<u8>> {
    let mut input = OpenOptions::new()
        .write(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(tx)
        .map_err(|err| match err.raw_os_error() {
            // ENXIO: no reader on the other end of the fifo
            Some(libc::ENXIO) => Error::ExternalFailure(
                format!("daemon is not reading {}", tx.display()),
                Some(err),
            ),
            _ => Error::from_io(format!("open {}", tx.display()), err),
        })?;
    input
        .write_all(request)
        .map_err(|err| Error::external(format!("write to {}", tx.display()), err))?;
    if !request.ends_with(b"\n") {
        input
            .write_all(b"\n")
            .map_err(|err| Error::external(format!("write to {}", tx.display()), err))?;
    }
    drop(input);

    let mut output = OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(rx)
        .map_err(|err| Error::from_io(format!("open {}", rx.display()), err))?;
    let deadline = Instant::now() + QUERY_TIMEOUT;
    let mut response = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        match output.read(&mut buf) {
            Ok(0) | Err(_) if !response.is_empty() => break,
            Ok(0) => {} // no writer yet; keep polling until the deadline
            Ok(n) => response.extend_from_slice(&buf[..n]),
            Err(err) if err.kind() == ErrorKind::WouldBlock => {}
            Err(err) => {
                return Err(Error::external(format!("read from {}", rx.display()), err));
            }
        }
        if Instant::now() >= deadline {
            if response.is_empty() {
                return Err(Error::ExternalFailure(
                    format!("no response on {}", rx.display()),
                    None,
                ));
            }
            break;
        }
        std::thread::sleep(POLL_INTERVAL);
    }
    Ok(response)
}

/// Graceful process stop for the cleanup stack: SIGTERM, a bounded grace
/// for voluntary exit, SIGKILL, reap. Never raises; a missing process is
/// success.
pub(crate) async fn terminate(node: &str, pid: i32) {
    use nix::sys::signal::{kill, Signal};
    use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
    use nix::unistd::Pid;

    let pid = Pid::from_raw(pid);
    if kill(pid, Signal::SIGTERM).is_err() {
        return;
    }
    let deadline = Instant::now() + STOP_GRACE;
    while Instant::now() < deadline {
        match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => tokio::time::sleep(POLL_INTERVAL).await,
            // reaped, or not our child any more
            _ => return,
        }
    }
    tracing::warn!(%node, ?pid, "daemon ignored SIGTERM, killing");
    let _ = kill(pid, Signal::SIGKILL);
    let _ = waitpid(pid, None);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bird_supervisor(base: &Path, config: &Path) -> Supervisor {
        Supervisor::new("r1", Daemon::Bird(Bird::default()), config.to_path_buf())
            .with_base_dir(base)
    }

    #[test]
    fn run_dir_is_per_node() {
        let supervisor = Supervisor::new(
            "r1",
            Daemon::Bird(Bird::default()),
            PathBuf::from("/tmp/bird.conf"),
        );
        assert_eq!(supervisor.run_dir(), PathBuf::from("/run/nsnetsim/r1"));
    }

    #[test]
    fn bird_command_points_at_materialised_paths() {
        let daemon = Daemon::Bird(Bird::default());
        let run_dir = PathBuf::from("/run/nsnetsim/r1");
        let command = daemon.command(&run_dir);
        let args: Vec<String> = command
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert!(args.contains(&String::from("-f")));
        assert!(args.contains(&String::from("/run/nsnetsim/r1/config")));
        assert!(args.contains(&String::from("/run/nsnetsim/r1/control.sock")));
    }

    #[test]
    fn exabgp_runs_in_foreground() {
        let daemon = Daemon::ExaBgp(ExaBgp::default());
        let run_dir = PathBuf::from("/run/nsnetsim/r2");
        let command = daemon.command(&run_dir);
        let envs: Vec<String> = command
            .get_envs()
            .filter_map(|(k, _)| k.to_str().map(String::from))
            .collect();
        assert!(envs.contains(&String::from("exabgp.daemon.daemonize")));
    }

    #[test]
    fn materialise_copies_config() {
        let base = tempfile::tempdir().unwrap();
        let config = base.path().join("bird.conf");
        std::fs::write(&config, "protocol device {}\n").unwrap();

        let supervisor = bird_supervisor(base.path(), &config);
        supervisor.materialise().unwrap();

        let copied = std::fs::read_to_string(base.path().join("r1").join(DAEMON_CONFIG)).unwrap();
        assert_eq!(copied, "protocol device {}\n");
    }

    #[test]
    fn materialise_creates_exabgp_pipes() {
        let base = tempfile::tempdir().unwrap();
        let config = base.path().join("exabgp.conf");
        std::fs::write(&config, "").unwrap();

        let supervisor =
            Supervisor::new("r2", Daemon::ExaBgp(ExaBgp::default()), config.clone())
                .with_base_dir(base.path());
        supervisor.materialise().unwrap();

        assert!(base.path().join("r2").join(CONTROL_PIPE_IN).exists());
        assert!(base.path().join("r2").join(CONTROL_PIPE_OUT).exists());
    }

    #[test]
    fn materialise_rejects_live_pid_file() {
        let base = tempfile::tempdir().unwrap();
        let config = base.path().join("bird.conf");
        std::fs::write(&config, "").unwrap();
        let run_dir = base.path().join("r1");
        std::fs::create_dir_all(&run_dir).unwrap();
        // this test process is definitely alive
        std::fs::write(run_dir.join(DAEMON_PID), format!("{}\n", std::process::id())).unwrap();

        let supervisor = bird_supervisor(base.path(), &config);
        let err = supervisor.materialise().unwrap_err();
        assert!(matches!(err, Error::NameCollision(_)));
    }

    #[test]
    fn materialise_ignores_stale_pid_file() {
        let base = tempfile::tempdir().unwrap();
        let config = base.path().join("bird.conf");
        std::fs::write(&config, "").unwrap();
        let run_dir = base.path().join("r1");
        std::fs::create_dir_all(&run_dir).unwrap();
        // far above kernel.pid_max, so it cannot name a live process
        std::fs::write(run_dir.join(DAEMON_PID), "4200000000\n").unwrap();

        let supervisor = bird_supervisor(base.path(), &config);
        supervisor.materialise().unwrap();
    }
}

use std::io::{Read, Write};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use portable_pty::{native_pty_system, CommandBuilder, MasterPty, PtySize};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{
    ContainerRef, ContainerRuntime, PtyAttachment, PtyController, ResourceLimits, RuntimeError,
    RuntimeErrorKind, RuntimeState, TermSize,
};

/// Chunk size for PTY reads.
const PTY_READ_BUF: usize = 8192;
/// Capacity of the bounded PTY output/input channels, in chunks. The reader
/// thread blocks when the channel is full, which fills the kernel PTY buffer
/// and ultimately stalls the shell.
const PTY_CHANNEL_CAPACITY: usize = 64;
/// Label attached to every container this daemon creates.
const MANAGED_LABEL: &str = "shellbox.managed=true";
/// Command that keeps a workspace container alive between terminal sessions.
const KEEPALIVE_CMD: [&str; 2] = ["sleep", "infinity"];

/// Container runtime adapter that shells out to the docker CLI (or a
/// CLI-compatible engine such as podman's docker shim).
pub struct DockerRuntime {
    binary: String,
}

impl DockerRuntime {
    pub fn new(binary: impl Into<String>) -> Self {
        Self { binary: binary.into() }
    }

    /// Run an engine command, returning trimmed stdout on success and a
    /// classified error on failure.
    async fn run(&self, args: &[&str]) -> Result<String, RuntimeError> {
        debug!(binary = %self.binary, ?args, "engine command");
        let output = Command::new(&self.binary)
            .args(args)
            .output()
            .await
            .map_err(|e| {
                RuntimeError::new(
                    RuntimeErrorKind::Transient,
                    format!("spawning {}: {}", self.binary, e),
                )
            })?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(classify_failure(stderr.trim()))
        }
    }

    /// Engine reachability probe, used by `shellbox check`.
    pub async fn version(&self) -> Result<String, RuntimeError> {
        self.run(&["version", "--format", "{{.Server.Version}}"]).await
    }
}

/// Map engine stderr to an error kind. The docker CLI has no structured error
/// output, so this is substring matching on the known failure messages.
fn classify_failure(stderr: &str) -> RuntimeError {
    let lower = stderr.to_ascii_lowercase();
    let kind = if lower.contains("no such container") {
        RuntimeErrorKind::NotFound
    } else if lower.contains("is not running") || lower.contains("container is paused") {
        RuntimeErrorKind::NotRunning
    } else if lower.contains("pull access denied")
        || lower.contains("manifest unknown")
        || lower.contains("manifest for")
        || lower.contains("repository does not exist")
        || lower.contains("invalid reference format")
    {
        RuntimeErrorKind::ImagePull
    } else if lower.contains("memory limit")
        || lower.contains("not enough memory")
        || lower.contains("range of cpus")
        || lower.contains("no space left")
    {
        RuntimeErrorKind::Resource
    } else if lower.contains("cannot connect to the docker daemon")
        || lower.contains("connection refused")
        || lower.contains("i/o timeout")
        || lower.contains("context deadline exceeded")
    {
        RuntimeErrorKind::Transient
    } else {
        RuntimeErrorKind::Other
    };
    RuntimeError::new(kind, stderr.to_string())
}

/// Build the `docker create` argument list for a workspace container.
fn build_create_args(image: &str, limits: ResourceLimits) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "create".into(),
        "--label".into(),
        MANAGED_LABEL.into(),
        "--memory".into(),
        format!("{}m", limits.memory_mb),
        "--cpus".into(),
        limits.cpus.to_string(),
        image.into(),
    ];
    args.extend(KEEPALIVE_CMD.iter().map(|s| s.to_string()));
    args
}

/// Master-side PTY owner. Dropping this closes the master descriptor, which
/// hangs up the `docker exec` process and the shell behind it.
struct MasterController {
    master: parking_lot::Mutex<Box<dyn MasterPty + Send>>,
}

impl PtyController for MasterController {
    fn resize(&self, size: TermSize) -> std::io::Result<()> {
        self.master
            .lock()
            .resize(PtySize {
                rows: size.rows,
                cols: size.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| std::io::Error::other(e.to_string()))
    }
}

/// Bridge a blocking PTY reader onto a bounded async channel. Runs on a
/// dedicated thread; `blocking_send` provides the backpressure.
fn spawn_reader_thread(
    mut reader: Box<dyn Read + Send>,
    mut child: Box<dyn portable_pty::Child + Send + Sync>,
    tx: mpsc::Sender<Bytes>,
) -> std::io::Result<()> {
    std::thread::Builder::new()
        .name("pty-read".into())
        .spawn(move || {
            let mut buf = [0u8; PTY_READ_BUF];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if tx.blocking_send(Bytes::copy_from_slice(&buf[..n])).is_err() {
                            break;
                        }
                    }
                }
            }
            // Reap the exec process so it doesn't linger as a zombie.
            if let Err(e) = child.wait() {
                warn!(error = %e, "waiting for PTY child");
            }
        })
        .map(|_| ())
}

/// Drain an async input channel into the blocking PTY writer. The thread
/// exits when every input sender is dropped or the PTY closes.
fn spawn_writer_thread(
    mut writer: Box<dyn Write + Send>,
    mut rx: mpsc::Receiver<Bytes>,
) -> std::io::Result<()> {
    std::thread::Builder::new()
        .name("pty-write".into())
        .spawn(move || {
            while let Some(chunk) = rx.blocking_recv() {
                if writer.write_all(&chunk).is_err() {
                    break;
                }
                let _ = writer.flush();
            }
        })
        .map(|_| ())
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn create(
        &self,
        image: &str,
        limits: ResourceLimits,
    ) -> Result<ContainerRef, RuntimeError> {
        let args = build_create_args(image, limits);
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let id = self.run(&arg_refs).await?;
        // `docker create` prints pull progress before the id when the image
        // was not local; the container id is the last line.
        let id = id.lines().last().unwrap_or_default().trim().to_string();
        if id.is_empty() {
            return Err(RuntimeError::other("engine returned no container id"));
        }
        Ok(ContainerRef(id))
    }

    async fn start(&self, container: &ContainerRef) -> Result<(), RuntimeError> {
        // Idempotent: starting a running container is a no-op success.
        self.run(&["start", &container.0]).await.map(|_| ())
    }

    async fn stop(&self, container: &ContainerRef, timeout: Duration) -> Result<(), RuntimeError> {
        let secs = timeout.as_secs().max(1).to_string();
        match self.run(&["stop", "-t", &secs, &container.0]).await {
            // Idempotent: a container the engine no longer knows is stopped.
            Err(e) if e.kind == RuntimeErrorKind::NotFound => Ok(()),
            other => other.map(|_| ()),
        }
    }

    async fn remove(&self, container: &ContainerRef) -> Result<(), RuntimeError> {
        match self.run(&["rm", "-f", &container.0]).await {
            Err(e) if e.kind == RuntimeErrorKind::NotFound => Ok(()),
            other => other.map(|_| ()),
        }
    }

    async fn inspect(&self, container: &ContainerRef) -> Result<RuntimeState, RuntimeError> {
        let status = match self
            .run(&["inspect", "-f", "{{.State.Status}}", &container.0])
            .await
        {
            Ok(s) => s,
            Err(e) if e.kind == RuntimeErrorKind::NotFound => return Ok(RuntimeState::Missing),
            Err(e) => return Err(e),
        };
        Ok(match status.as_str() {
            "created" => RuntimeState::Created,
            "running" | "restarting" | "paused" => RuntimeState::Running,
            _ => RuntimeState::Exited,
        })
    }

    async fn attach_pty(
        &self,
        container: &ContainerRef,
        shell: &[String],
        size: TermSize,
    ) -> Result<PtyAttachment, RuntimeError> {
        match self.inspect(container).await? {
            RuntimeState::Running => {}
            state => {
                return Err(RuntimeError::new(
                    RuntimeErrorKind::NotRunning,
                    format!("container {} is not running ({:?})", container, state),
                ));
            }
        }

        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: size.rows,
                cols: size.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| RuntimeError::other(format!("opening PTY: {}", e)))?;

        let mut cmd = CommandBuilder::new(&self.binary);
        cmd.arg("exec");
        cmd.arg("-it");
        cmd.arg(&container.0);
        for part in shell {
            cmd.arg(part);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| RuntimeError::other(format!("spawning shell in PTY: {}", e)))?;
        // The slave side belongs to the child now.
        drop(pair.slave);

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| RuntimeError::other(format!("cloning PTY reader: {}", e)))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| RuntimeError::other(format!("taking PTY writer: {}", e)))?;

        let (out_tx, out_rx) = mpsc::channel::<Bytes>(PTY_CHANNEL_CAPACITY);
        let (in_tx, in_rx) = mpsc::channel::<Bytes>(PTY_CHANNEL_CAPACITY);

        spawn_reader_thread(reader, child, out_tx)
            .map_err(|e| RuntimeError::other(format!("spawning PTY reader thread: {}", e)))?;
        spawn_writer_thread(writer, in_rx)
            .map_err(|e| RuntimeError::other(format!("spawning PTY writer thread: {}", e)))?;

        Ok(PtyAttachment {
            output: out_rx,
            input: in_tx,
            controller: Box::new(MasterController {
                master: parking_lot::Mutex::new(pair.master),
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_image_pull_errors() {
        let e = classify_failure("Error response from daemon: pull access denied for nosuch");
        assert_eq!(e.kind, RuntimeErrorKind::ImagePull);
        let e = classify_failure("docker: Error: manifest unknown: manifest unknown");
        assert_eq!(e.kind, RuntimeErrorKind::ImagePull);
    }

    #[test]
    fn classify_not_found() {
        let e = classify_failure("Error: No such container: abc123");
        assert_eq!(e.kind, RuntimeErrorKind::NotFound);
    }

    #[test]
    fn classify_not_running() {
        let e = classify_failure("Error: container abc123 is not running");
        assert_eq!(e.kind, RuntimeErrorKind::NotRunning);
    }

    #[test]
    fn classify_daemon_unreachable_is_transient() {
        let e = classify_failure(
            "Cannot connect to the Docker daemon at unix:///var/run/docker.sock",
        );
        assert_eq!(e.kind, RuntimeErrorKind::Transient);
        assert!(e.is_transient());
    }

    #[test]
    fn classify_unknown_is_other() {
        let e = classify_failure("something nobody has seen before");
        assert_eq!(e.kind, RuntimeErrorKind::Other);
    }

    #[test]
    fn create_args_include_limits_and_keepalive() {
        let args = build_create_args("python:3.11", ResourceLimits { memory_mb: 1024, cpus: 2 });
        assert_eq!(args[0], "create");
        assert!(args.contains(&"--memory".to_string()));
        assert!(args.contains(&"1024m".to_string()));
        assert!(args.contains(&"--cpus".to_string()));
        assert!(args.contains(&"python:3.11".to_string()));
        assert_eq!(args.last().unwrap(), "infinity");
    }
}

//! Minimal Docker CLI wrapper.
//!
//! Shells out to the `docker` binary instead of talking to the daemon API, so
//! there is no serde, no bollard and no async runtime involved. Everything here
//! blocks; call it from `spawn_blocking` when inside an async context.
//!
//! ```ignore
//! use dockside::{Container, containers};
//! use std::time::Duration;
//!
//! let container = Container::run(containers::postgres("16-alpine", "test"))?;
//! let port = container.wait_for_port(5432, Duration::from_secs(10))?;
//! ```
//!
//! Unnamed containers are removed when the [`Container`] is dropped. Named
//! containers outlive the handle: they are meant to be found again with
//! [`Container::find`] and torn down explicitly.

use std::fmt;
use std::net::TcpStream;
use std::process::Command;
use std::time::{Duration, Instant};

pub type Result<T> = std::result::Result<T, Error>;

/// Errors from running docker commands.
#[derive(Debug)]
pub enum Error {
    /// The docker binary could not be spawned
    Spawn(std::io::Error),
    /// A docker command exited unsuccessfully
    Command { args: Vec<String>, stderr: String },
    /// Waiting for a condition ran out of time
    Timeout(String),
    /// Docker printed something we could not make sense of
    Parse(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Spawn(e) => write!(f, "failed to run docker: {}", e),
            Error::Command { args, stderr } => {
                write!(f, "docker {} failed: {}", args.join(" "), stderr.trim())
            }
            Error::Timeout(what) => write!(f, "timed out waiting for {}", what),
            Error::Parse(msg) => write!(f, "unexpected docker output: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Spawn(e) => Some(e),
            _ => None,
        }
    }
}

/// Everything needed to `docker run` a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    pub image: String,
    pub name: Option<String>,
    pub env: Vec<(String, String)>,
    /// Container ports published on a random loopback port of the host
    pub ports: Vec<u16>,
    /// Arguments passed to the image entrypoint
    pub args: Vec<String>,
}

impl ContainerSpec {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            name: None,
            env: Vec::new(),
            ports: Vec::new(),
            args: Vec::new(),
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.ports.push(port);
        self
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Arguments for `docker`, starting with `run`.
    pub fn run_args(&self) -> Vec<String> {
        let mut args = vec!["run".to_string(), "-d".to_string()];
        if let Some(name) = &self.name {
            args.push("--name".to_string());
            args.push(name.clone());
        }
        for (key, value) in &self.env {
            args.push("-e".to_string());
            args.push(format!("{}={}", key, value));
        }
        for port in &self.ports {
            args.push("-p".to_string());
            args.push(format!("127.0.0.1::{}", port));
        }
        args.push(self.image.clone());
        args.extend(self.args.iter().cloned());
        args
    }
}

/// Ready-made specs for images we use.
pub mod containers {
    use super::ContainerSpec;

    /// The official postgres image at `tag`, with the given superuser password.
    pub fn postgres(tag: &str, password: &str) -> ContainerSpec {
        ContainerSpec::new(format!("postgres:{}", tag))
            .env("POSTGRES_PASSWORD", password)
            .port(5432)
    }
}

/// Lifecycle state reported by `docker inspect`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    Created,
    Running,
    Paused,
    Restarting,
    Exited,
    Dead,
    Other,
}

impl ContainerState {
    fn parse(status: &str) -> Self {
        match status.trim() {
            "created" => ContainerState::Created,
            "running" => ContainerState::Running,
            "paused" => ContainerState::Paused,
            "restarting" => ContainerState::Restarting,
            "exited" => ContainerState::Exited,
            "dead" => ContainerState::Dead,
            _ => ContainerState::Other,
        }
    }
}

/// A handle to a docker container.
#[derive(Debug)]
pub struct Container {
    id: String,
    name: Option<String>,
    remove_on_drop: bool,
}

impl Container {
    /// Create and start a container from `spec`.
    pub fn run(spec: ContainerSpec) -> Result<Self> {
        let out = docker(&spec.run_args())?;
        let id = out.trim().to_string();
        if id.is_empty() {
            return Err(Error::Parse("docker run printed no container id".to_string()));
        }
        Ok(Self {
            id,
            remove_on_drop: spec.name.is_none(),
            name: spec.name,
        })
    }

    /// Look up an existing container (running or not) by exact name.
    pub fn find(name: &str) -> Result<Option<Self>> {
        let filter = format!("name=^/{}$", name);
        let out = docker(&["ps", "-a", "-q", "--filter", &filter])?;
        Ok(out.lines().next().map(|id| Self {
            id: id.trim().to_string(),
            name: Some(name.to_string()),
            remove_on_drop: false,
        }))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// The container name, or its id for unnamed containers.
    pub fn name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }

    pub fn state(&self) -> Result<ContainerState> {
        let out = docker(&["inspect", "-f", "{{.State.Status}}", &self.id])?;
        Ok(ContainerState::parse(&out))
    }

    pub fn start(&self) -> Result<()> {
        docker(&["start", &self.id]).map(|_| ())
    }

    pub fn stop(&self) -> Result<()> {
        docker(&["stop", &self.id]).map(|_| ())
    }

    /// Forcibly remove the container and its anonymous volumes.
    pub fn remove(&self) -> Result<()> {
        docker(&["rm", "-f", "-v", &self.id]).map(|_| ())
    }

    /// Keep the container around after this handle is dropped.
    pub fn keep(mut self) -> Self {
        self.remove_on_drop = false;
        self
    }

    pub fn logs(&self) -> Result<String> {
        let output = Command::new("docker")
            .args(["logs", &self.id])
            .output()
            .map_err(Error::Spawn)?;
        // postgres logs to stderr
        let mut logs = String::from_utf8_lossy(&output.stdout).into_owned();
        logs.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok(logs)
    }

    /// Host port that `container_port/tcp` is published on.
    pub fn host_port(&self, container_port: u16) -> Result<u16> {
        let spec = format!("{}/tcp", container_port);
        let out = docker(&["port", &self.id, &spec])?;
        parse_port_output(&out)
    }

    /// Poll the logs until `needle` shows up.
    pub fn wait_for_log(&self, needle: &str, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.logs()?.contains(needle) {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(Error::Timeout(format!("log line {:?}", needle)));
            }
            std::thread::sleep(Duration::from_millis(250));
        }
    }

    /// Wait until the published host port for `container_port` accepts TCP
    /// connections, and return it.
    pub fn wait_for_port(&self, container_port: u16, timeout: Duration) -> Result<u16> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Ok(port) = self.host_port(container_port)
                && TcpStream::connect(("127.0.0.1", port)).is_ok()
            {
                return Ok(port);
            }
            if Instant::now() >= deadline {
                return Err(Error::Timeout(format!("port {}", container_port)));
            }
            std::thread::sleep(Duration::from_millis(250));
        }
    }
}

impl Drop for Container {
    fn drop(&mut self) {
        if self.remove_on_drop {
            let _ = self.remove();
        }
    }
}

/// Parse `docker port` output such as `0.0.0.0:49153\n[::]:49153`.
fn parse_port_output(out: &str) -> Result<u16> {
    let line = out
        .lines()
        .next()
        .ok_or_else(|| Error::Parse("empty port mapping".to_string()))?;
    line.trim()
        .rsplit(':')
        .next()
        .and_then(|p| p.parse().ok())
        .ok_or_else(|| Error::Parse(format!("bad port mapping {:?}", line)))
}

fn docker<S: AsRef<str>>(args: &[S]) -> Result<String> {
    let args: Vec<String> = args.iter().map(|a| a.as_ref().to_string()).collect();
    let output = Command::new("docker")
        .args(&args)
        .output()
        .map_err(Error::Spawn)?;
    if !output.status.success() {
        return Err(Error::Command {
            args,
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

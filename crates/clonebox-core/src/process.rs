//! Uniform invocation of external programs. This is the only layer
//! permitted to spawn subprocesses directly (spec §4.1); every other
//! component that needs an external tool goes through here.

use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::{Error, Result};

const DEFAULT_CAPTURE_CAP: usize = 1024 * 1024;
const KILL_GRACE_PERIOD: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct RunRequest {
    pub argv: Vec<String>,
    pub stdin: Option<Vec<u8>>,
    pub env: HashMap<String, String>,
    pub cwd: Option<String>,
    pub timeout: Duration,
    pub capture: bool,
    pub capture_cap: usize,
}

impl RunRequest {
    pub fn new(argv: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
            stdin: None,
            env: HashMap::new(),
            cwd: None,
            timeout: Duration::from_secs(30),
            capture: true,
            capture_cap: DEFAULT_CAPTURE_CAP,
        }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn cwd(mut self, cwd: impl Into<String>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn stdin(mut self, data: Vec<u8>) -> Self {
        self.stdin = Some(data);
        self
    }
}

#[derive(Debug, Clone)]
pub struct RunOutput {
    pub exit_code: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub elapsed: Duration,
}

impl RunOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    pub fn stdout_string(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_string(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// `run(argv, ...)`. Kills the child on timeout: SIGTERM first, then
/// SIGKILL after `KILL_GRACE_PERIOD`. Output capture is capped per stream
/// so a runaway child can't exhaust memory.
pub async fn run(req: RunRequest) -> Result<RunOutput> {
    let Some(program) = req.argv.first().cloned() else {
        return Err(Error::InvalidArgument("empty argv".into()));
    };
    let args = &req.argv[1..];

    debug!(program = %program, args = ?args, "process: spawning");

    let mut command = Command::new(&program);
    command
        .args(args)
        .envs(&req.env)
        .stdin(if req.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(if req.capture { Stdio::piped() } else { Stdio::null() })
        .stderr(if req.capture { Stdio::piped() } else { Stdio::null() });
    if let Some(cwd) = &req.cwd {
        command.current_dir(cwd);
    }

    let start = std::time::Instant::now();
    let mut child = command.spawn().map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            Error::ExternalToolMissing(program.clone())
        } else {
            Error::Io(e)
        }
    })?;

    if let Some(data) = req.stdin {
        use tokio::io::AsyncWriteExt;
        if let Some(mut stdin) = child.stdin.take() {
            let _ = stdin.write_all(&data).await;
        }
    }

    let mut stdout_pipe = child.stdout.take();
    let mut stderr_pipe = child.stderr.take();

    let wait_result = timeout(req.timeout, child.wait()).await;

    match wait_result {
        Ok(Ok(status)) => {
            let stdout = read_capped(&mut stdout_pipe, req.capture_cap).await;
            let stderr = read_capped(&mut stderr_pipe, req.capture_cap).await;
            Ok(RunOutput {
                exit_code: status.code(),
                stdout,
                stderr,
                elapsed: start.elapsed(),
            })
        }
        Ok(Err(e)) => Err(Error::Io(e)),
        Err(_) => {
            warn!(program = %program, timeout = ?req.timeout, "process: timed out, escalating SIGTERM -> SIGKILL");
            kill_gracefully(&mut child).await;
            Err(Error::Timeout(req.timeout))
        }
    }
}

async fn read_capped(pipe: &mut Option<impl AsyncRead + Unpin>, cap: usize) -> Vec<u8> {
    let Some(pipe) = pipe else {
        return Vec::new();
    };
    let mut buf = vec![0u8; cap];
    let mut filled = 0;
    loop {
        if filled >= cap {
            break;
        }
        match pipe.read(&mut buf[filled..]).await {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(_) => break,
        }
    }
    buf.truncate(filled);
    buf
}

async fn kill_gracefully(child: &mut Child) {
    if let Some(pid) = child.id() {
        // SAFETY: pid came from the Child we own; SIGTERM is a request,
        // not a guarantee, so a missing process is not an error here.
        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }
    }
    let graceful = timeout(KILL_GRACE_PERIOD, child.wait()).await;
    if graceful.is_err() {
        let _ = child.start_kill();
        let _ = child.wait().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_stdout_and_exit_code() {
        let req = RunRequest::new(["echo", "hello"]);
        let out = run(req).await.unwrap();
        assert!(out.success());
        assert_eq!(out.stdout_string().trim(), "hello");
    }

    #[tokio::test]
    async fn missing_binary_is_tool_missing() {
        let req = RunRequest::new(["clonebox-definitely-not-a-real-binary"]);
        let err = run(req).await.unwrap_err();
        assert!(matches!(err, Error::ExternalToolMissing(_)));
    }

    #[tokio::test]
    async fn timeout_kills_child() {
        let req = RunRequest::new(["sleep", "5"]).timeout(Duration::from_millis(100));
        let err = run(req).await.unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
    }

    #[tokio::test]
    async fn output_is_capped() {
        let req = RunRequest::new(["yes"]).timeout(Duration::from_millis(200));
        let cap = 4096;
        let mut req = req;
        req.capture_cap = cap;
        let result = run(req).await;
        // `yes` never exits on its own; we expect a timeout, but if it
        // raced to produce output first the cap must still hold.
        if let Ok(out) = result {
            assert!(out.stdout.len() <= cap);
        }
    }
}

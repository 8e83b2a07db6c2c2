//! Test helpers for behavioral specifications.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic, dead_code)]

use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

/// Fast heartbeats for specs: 100 ms interval, 300 ms stale threshold.
pub const SPEC_HEARTBEAT_MS: &str = "100";

/// Generous ceiling for cross-process waits.
pub const SPEC_WAIT: Duration = Duration::from_secs(10);

/// Returns the path to a workspace binary.
///
/// Falls back to resolving relative to the test binary itself when
/// CARGO_MANIFEST_DIR points at a stale checkout.
pub fn binary_path(name: &str) -> PathBuf {
    let manifest_dir = Path::new(env!("CARGO_MANIFEST_DIR"));

    let standard = manifest_dir.join("target/debug").join(name);
    if standard.exists() {
        return standard;
    }

    // The test binary lives at target/debug/deps/specs-<hash>; its
    // grandparent is target/debug where the workspace bins are built.
    if let Ok(exe) = std::env::current_exe() {
        if let Some(debug_dir) = exe.parent().and_then(|d| d.parent()) {
            let fallback = debug_dir.join(name);
            if fallback.exists() {
                return fallback;
            }
        }
    }

    standard
}

/// Isolated bus environment: own state dir, fast heartbeats, and env vars
/// set for in-process clients. Restores the environment on drop.
pub struct BusEnv {
    pub dir: tempfile::TempDir,
    children: Vec<Child>,
}

impl BusEnv {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        std::env::set_var("VJ_STATE_DIR", dir.path());
        std::env::set_var("VJ_HEARTBEAT_MS", SPEC_HEARTBEAT_MS);
        BusEnv {
            dir,
            children: Vec::new(),
        }
    }

    pub fn state_dir(&self) -> &Path {
        self.dir.path()
    }

    /// Spawn a workspace binary inside this environment and track it for
    /// cleanup.
    pub fn spawn(&mut self, binary: &str, args: &[&str]) -> u32 {
        let cmd = self.command(binary, args);
        self.spawn_cmd(cmd)
    }

    /// Spawn a prepared command and track the child for cleanup.
    pub fn spawn_cmd(&mut self, mut cmd: Command) -> u32 {
        let child = cmd.spawn().unwrap_or_else(|e| {
            panic!("failed to spawn {cmd:?}: {e}");
        });
        let pid = child.id();
        self.children.push(child);
        pid
    }

    /// Build (but do not spawn) a command for a workspace binary.
    pub fn command(&self, binary: &str, args: &[&str]) -> Command {
        let mut cmd = Command::new(binary_path(binary));
        cmd.args(args)
            .env("VJ_STATE_DIR", self.dir.path())
            .env("VJ_LOG_DIR", self.dir.path().join("logs"))
            .env("VJ_HEARTBEAT_MS", SPEC_HEARTBEAT_MS)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        cmd
    }

    pub fn client(&self) -> vj_client::BusClient {
        vj_client::BusClient::new("spec_client").unwrap()
    }

    /// Wait for a worker to appear live in the registry; returns its entry.
    pub fn wait_for_worker(&self, name: &str) -> vj_bus::RegistryEntry {
        let client = self.client();
        let deadline = Instant::now() + SPEC_WAIT;
        loop {
            if let Ok(workers) = client.discover_workers(false) {
                if let Some(entry) = workers.get(name) {
                    return entry.clone();
                }
            }
            assert!(
                Instant::now() < deadline,
                "worker {name} did not register in time"
            );
            std::thread::sleep(Duration::from_millis(25));
        }
    }
}

impl Drop for BusEnv {
    fn drop(&mut self) {
        for child in &mut self.children {
            let _ = child.kill();
            let _ = child.wait();
        }
        std::env::remove_var("VJ_STATE_DIR");
        std::env::remove_var("VJ_HEARTBEAT_MS");
    }
}

/// Poll `check` until it passes or `timeout` elapses.
pub async fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    check()
}

/// Send a signal to a pid via the `kill` binary.
pub fn signal(pid: u32, sig: &str) {
    let _ = Command::new("kill")
        .args([sig, &pid.to_string()])
        .status();
}

/// Whether a pid is alive.
pub fn pid_alive(pid: u32) -> bool {
    Command::new("kill")
        .args(["-0", &pid.to_string()])
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

//! The two-process supervision scheme.
//!
//! The primary process spawns the secondary with a dash sentinel argv
//! (`aviary - <node> <cage> NORMAL|FAILURE <root>`), drains its stdio
//! into oblivion and waits; a non-zero exit restarts the secondary with
//! the `FAILURE` flag. The secondary runs the cage and heartbeats on
//! stdout every few seconds: when the primary dies the write fails and
//! the secondary shuts the cage down in order. This is how the pair
//! looks in `ps` output:
//!
//! ```text
//! 246  ??  Is  /svc/aviary cage
//! 291  ??  I   /svc/aviary - node cage NORMAL /svc
//! ```

use std::{
    io::{Read, Write},
    path::{Path, PathBuf},
    process::{Command, Stdio},
    time::Duration,
};

use anyhow::{bail, Context, Result};
use regex::Regex;

use aviary::{Cage, CageOptions};

use crate::Cli;

const HEARTBEAT_PERIOD: Duration = Duration::from_secs(3);

/// `[node.]cage` -> `(node, cage)`, the node defaulting to the host's
/// short name.
pub fn parse_target(target: &str) -> Result<(String, String)> {
    let pattern = Regex::new(r"^[A-Za-z0-9_-]{1,32}(\.[A-Za-z0-9_-]{1,32})?$").expect("static");
    if !pattern.is_match(target) {
        bail!("invalid cage name '{target}', expected [node.]cage");
    }
    Ok(match target.split_once('.') {
        Some((node, cage)) => (node.to_string(), cage.to_string()),
        None => (short_host_name(), target.to_string()),
    })
}

fn short_host_name() -> String {
    #[cfg(unix)]
    {
        if let Ok(name) = nix::unistd::gethostname() {
            if let Ok(name) = name.into_string() {
                if let Some(short) = name.split('.').next() {
                    if !short.is_empty() {
                        return short.to_string();
                    }
                }
            }
        }
    }
    "localhost".to_string()
}

fn default_root() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from("."))
}

fn logs_dir(cages_dir: &Path, cage: &str) -> PathBuf {
    cages_dir.join(cage).join("logs")
}

/// The supervising side: pid file, then respawn the secondary until it
/// exits cleanly.
pub fn primary(cli: Cli) -> Result<i32> {
    let (node, cage) = parse_target(&cli.target)?;
    let root = cli.root.unwrap_or_else(default_root);
    let cages_dir = root.join("cages");

    let cage_dir = cages_dir.join(&cage);
    if !cage_dir.is_dir() {
        bail!("cage directory {} does not exist", cage_dir.display());
    }
    let logs_dir = logs_dir(&cages_dir, &cage);
    std::fs::create_dir_all(&logs_dir)
        .with_context(|| format!("cannot create {}", logs_dir.display()))?;

    // the pid file doubles as a writability probe for the logs directory
    let pid_file = logs_dir.join(format!("{cage}.pid"));
    std::fs::write(&pid_file, std::process::id().to_string())
        .with_context(|| format!("cannot write {}", pid_file.display()))?;

    let executable = std::env::current_exe().context("cannot locate own executable")?;
    let mut restarting_after_failure = false;

    loop {
        let mode = if restarting_after_failure {
            "FAILURE"
        } else {
            "NORMAL"
        };
        let mut child = Command::new(&executable)
            .arg("-")
            .arg(&node)
            .arg(&cage)
            .arg(mode)
            .arg(&root)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .context("cannot spawn the secondary process")?;

        // any output from the secondary is read and discarded; the logs
        // are what counts
        let stdout_reader = child.stdout.take().map(|s| spawn_drain(Box::new(s)));
        let stderr_reader = child.stderr.take().map(|s| spawn_drain(Box::new(s)));

        let status = child.wait().context("cannot wait for the secondary")?;
        for reader in [stdout_reader, stderr_reader].into_iter().flatten() {
            let _ = reader.join();
        }

        if status.success() {
            return Ok(0);
        }
        restarting_after_failure = true;
    }
}

fn spawn_drain(mut stream: Box<dyn Read + Send>) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        let mut sink = [0u8; 512];
        while matches!(stream.read(&mut sink), Ok(n) if n > 0) {}
    })
}

/// The supervised side: runs the cage until the parent goes away or the
/// cage asks to exit.
pub fn secondary(args: &[String]) -> Result<i32> {
    let [node, cage, mode, root] = args else {
        bail!("internal invocation needs <node> <cage> NORMAL|FAILURE <root>");
    };
    let cages_dir = PathBuf::from(root).join("cages");
    crate::logging::init(
        &logs_dir(&cages_dir, cage),
        cage,
        crate::logging::LogConfig::from_env(),
    )?;

    match mode.as_str() {
        "FAILURE" => tracing::info!("[AVIARY] the cage is restarting after a failure"),
        _ => tracing::info!("[AVIARY] the cage is starting up"),
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("cannot build the runtime")?;

    runtime.block_on(async {
        let cage = Cage::new(CageOptions::new(node.clone(), cage.clone(), &cages_dir))
            .map_err(|e| anyhow::anyhow!("cannot assemble the cage: {e}"))?;

        // the termination watchdog: a failed heartbeat means the primary
        // is gone and the cage must come down
        let watched = cage.clone();
        std::thread::spawn(move || loop {
            let alive = std::io::stdout()
                .write_all(b"\n")
                .and_then(|_| std::io::stdout().flush());
            if alive.is_err() {
                watched.exit();
                return;
            }
            std::thread::sleep(HEARTBEAT_PERIOD);
        });

        cage.run().await;
        Ok::<_, anyhow::Error>(())
    })?;

    tracing::info!("[AVIARY] the cage has been properly shut down");
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_parsing() {
        let (node, cage) = parse_target("node1.billing").unwrap();
        assert_eq!(node, "node1");
        assert_eq!(cage, "billing");

        let (node, cage) = parse_target("billing").unwrap();
        assert!(!node.is_empty());
        assert_eq!(cage, "billing");

        assert!(parse_target("a.b.c").is_err());
        assert!(parse_target("").is_err());
        assert!(parse_target("bad name").is_err());
    }
}

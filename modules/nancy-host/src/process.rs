//! Plugin process spawning and stdio capture.

use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::warn;

use nancy_common::PluginManifest;

use crate::error::HostError;

/// A spawned plugin with captured stdin/stdout for framed JSON-RPC.
pub struct PluginProcess {
    pub child: Child,
    pub stdin: ChildStdin,
    pub stdout: BufReader<ChildStdout>,
}

impl PluginProcess {
    /// Spawn a plugin from its manifest. Stderr is forwarded through
    /// `tracing` at warn level under the plugin's name.
    pub fn spawn(manifest: &PluginManifest) -> Result<Self, HostError> {
        let mut cmd = Command::new(&manifest.command);
        cmd.args(&manifest.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (k, v) in &manifest.env {
            cmd.env(k, v);
        }

        let mut child = cmd.spawn().map_err(HostError::Spawn)?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| HostError::Protocol("stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| HostError::Protocol("stdout unavailable".into()))?;

        if let Some(stderr) = child.stderr.take() {
            let plugin = manifest.name.clone();
            tokio::spawn(async move {
                let mut reader = BufReader::new(stderr);
                let mut line = String::new();
                loop {
                    line.clear();
                    match reader.read_line(&mut line).await {
                        Ok(0) => break,
                        Ok(_) => {
                            let text = line.trim_end();
                            if !text.is_empty() {
                                warn!(target: "nancy_host.plugin.stderr", plugin = %plugin, "{text}");
                            }
                        }
                        Err(_) => break,
                    }
                }
            });
        }

        Ok(Self {
            child,
            stdin,
            stdout: BufReader::new(stdout),
        })
    }
}

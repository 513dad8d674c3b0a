//! Local git subprocess invocations.
//!
//! # Design Decisions
//! - Every child is spawned with `kill_on_drop`, so dropping the owning task
//!   (client disconnect, cancelled session) terminates the process
//! - Identity is passed through the environment the way git hooks expect it
//! - Exit status is only logged; the HTTP status is committed long before

use std::path::PathBuf;
use std::process::Stdio;

use tokio::process::{Child, Command};

use crate::api::Authorization;
use crate::git::verb::Verb;

#[derive(Debug, Clone)]
pub struct GitCommand {
    binary: PathBuf,
}

impl GitCommand {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// `git <verb> --stateless-rpc --advertise-refs <repo>`, stdout piped.
    pub fn spawn_advertisement(
        &self,
        verb: Verb,
        auth: &Authorization,
        git_protocol: Option<&str>,
    ) -> std::io::Result<Child> {
        let mut command = self.stateless_rpc(verb, auth, git_protocol);
        command.arg("--advertise-refs").arg(&auth.repo_path);
        command.stdin(Stdio::null()).stdout(Stdio::piped());
        command.spawn()
    }

    /// `git <verb> --stateless-rpc <repo>`, stdin and stdout piped.
    pub fn spawn_exchange(
        &self,
        verb: Verb,
        auth: &Authorization,
        git_protocol: Option<&str>,
    ) -> std::io::Result<Child> {
        let mut command = self.stateless_rpc(verb, auth, git_protocol);
        command.arg(&auth.repo_path);
        command.stdin(Stdio::piped()).stdout(Stdio::piped());
        command.spawn()
    }

    fn stateless_rpc(&self, verb: Verb, auth: &Authorization, git_protocol: Option<&str>) -> Command {
        let mut command = Command::new(&self.binary);
        for option in &auth.git_config_options {
            command.arg("-c").arg(option);
        }
        command
            .arg(verb.subcommand())
            .arg("--stateless-rpc")
            .env("GL_ID", &auth.gl_id)
            .env("GL_USERNAME", &auth.gl_username)
            .env("GL_REPOSITORY", &auth.gl_repository)
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        if let Some(protocol) = git_protocol {
            command.env("GIT_PROTOCOL", protocol);
        }
        command
    }
}

/// Wait for `child` and log how it ended.
pub async fn reap(mut child: Child, what: &'static str) {
    match child.wait().await {
        Ok(status) if status.success() => tracing::debug!(command = what, "Git subprocess finished"),
        Ok(status) => tracing::warn!(command = what, status = %status, "Git subprocess failed"),
        Err(e) => tracing::warn!(command = what, error = %e, "Waiting for git subprocess failed"),
    }
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! SSH transport for driving cluster nodes.
//!
//! Every remote interaction in the harness (provisioning verification,
//! `cephadm`, `ceph`/`rados` commands, file pushes) goes through a
//! [`Session`]. Commands are buffered to completion; callers that expect
//! long-running commands wrap them with [`Session::exec_timeout`].

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use camino::Utf8PathBuf;
use futures::future;
use thrussh::client;
use thrussh::ChannelMsg;
use tracing::{debug, warn};

/// Timeout for establishing the TCP + SSH handshake.
const CONNECTION_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Utf8(#[from] std::string::FromUtf8Error),

    #[error(transparent)]
    Ssh(#[from] thrussh::Error),

    #[error(transparent)]
    SshKey(#[from] thrussh_keys::Error),

    #[error("authentication to {0} failed")]
    AuthenticationFailed(String),

    #[error("no home directory to search for keys in")]
    NoHomeDir,

    #[error("command `{cmd}` exited with status {code}: {stderr}")]
    FailedCmd { cmd: String, code: u32, stderr: String },

    #[error("command `{0}` timed out after {1:?}")]
    CommandTimeout(String, Duration),
}

/// How to authenticate to a node.
#[derive(Debug, Clone)]
pub enum Auth {
    /// Use the ssh-agent if one is available.
    Agent,

    /// Password authentication.
    Password(String),

    /// A specific private key with an optional passphrase.
    Key { key_path: Utf8PathBuf, passphrase: Option<String> },

    /// Try keys under `~/.ssh`. Currently only reads `id_rsa`.
    Auto,
}

/// The output of one remote command.
#[derive(Debug)]
pub struct Output {
    /// The remote exit status, or `None` if the channel closed before one
    /// was reported.
    pub exit_status: Option<u32>,
    pub stdout: String,
    pub stderr: String,
}

impl Output {
    pub fn success(&self) -> bool {
        self.exit_status == Some(0)
    }
}

struct Client {
    host: String,
    port: u16,
}

impl client::Handler for Client {
    type Error = Error;
    type FutureUnit = future::Ready<Result<(Self, client::Session), Self::Error>>;
    type FutureBool = future::Ready<Result<(Self, bool), Self::Error>>;

    fn finished_bool(self, b: bool) -> Self::FutureBool {
        future::ready(Ok((self, b)))
    }

    fn finished(self, session: client::Session) -> Self::FutureUnit {
        future::ready(Ok((self, session)))
    }

    // Nodes are freshly imaged on every run and present new host keys, so
    // unknown keys are accepted. A changed key for a host already in
    // known_hosts is still refused.
    fn check_server_key(
        self,
        server_public_key: &thrussh_keys::key::PublicKey,
    ) -> Self::FutureBool {
        match thrussh_keys::check_known_hosts(
            &self.host,
            self.port,
            server_public_key,
        ) {
            Ok(known) => {
                if !known {
                    debug!(host = %self.host, "server key not in known_hosts");
                }
                self.finished_bool(true)
            }
            Err(thrussh_keys::Error::KeyChanged { line }) => {
                warn!(
                    host = %self.host,
                    line,
                    "server key changed, refusing connection"
                );
                self.finished_bool(false)
            }
            Err(_) => self.finished_bool(true),
        }
    }
}

/// Connects to `host:port` as `user` and authenticates with `auth`.
pub async fn connect(
    host: &str,
    port: u16,
    user: &str,
    auth: &Auth,
) -> Result<Session, Error> {
    let cfg = Arc::new(client::Config {
        connection_timeout: Some(CONNECTION_TIMEOUT),
        ..Default::default()
    });

    let address = format!("{host}:{port}");
    let handler = Client { host: host.to_string(), port };
    let mut handle = client::connect(cfg, address, handler).await?;

    let authed = match auth {
        Auth::Password(password) => {
            handle.authenticate_password(user, password).await?
        }
        Auth::Key { key_path, passphrase } => {
            let passphrase = passphrase.as_ref().map(|p| p.as_bytes().to_vec());
            let key = thrussh_keys::load_secret_key(
                key_path.as_std_path(),
                passphrase.as_deref(),
            )?;
            handle.authenticate_publickey(user, Arc::new(key)).await?
        }
        Auth::Agent => {
            let mut agent =
                thrussh_keys::agent::client::AgentClient::connect_env().await?;
            let identities = agent.request_identities().await?;

            let mut authed = false;
            for key in identities {
                let (returned, result) =
                    handle.authenticate_future(user, key, agent).await;
                agent = returned;
                authed = result.map_err(|_| {
                    Error::AuthenticationFailed(host.to_string())
                })?;
                if authed {
                    break;
                }
            }
            authed
        }
        Auth::Auto => {
            let home = std::env::var_os("HOME")
                .map(PathBuf::from)
                .ok_or(Error::NoHomeDir)?;

            let mut authed = false;
            for name in ["id_rsa"] {
                let key_path = home.join(".ssh").join(name);
                if tokio::fs::metadata(&key_path).await.is_err() {
                    continue;
                }

                let key = thrussh_keys::load_secret_key(&key_path, None)?;
                authed =
                    handle.authenticate_publickey(user, Arc::new(key)).await?;
                if authed {
                    break;
                }
            }
            authed
        }
    };

    if !authed {
        return Err(Error::AuthenticationFailed(host.to_string()));
    }

    Ok(Session { handle, host: host.to_string() })
}

/// Retries [`connect`] every `interval` until `timeout` elapses. Used after
/// reboots and reimages, where the node disappears for minutes at a time.
pub async fn wait_for_reconnect(
    host: &str,
    port: u16,
    user: &str,
    auth: &Auth,
    timeout: Duration,
    interval: Duration,
) -> Result<Session, Error> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        match connect(host, port, user, auth).await {
            Ok(session) => return Ok(session),
            Err(e) if tokio::time::Instant::now() >= deadline => {
                return Err(e);
            }
            Err(e) => {
                debug!(host, error = %e, "node not reachable yet, retrying");
                tokio::time::sleep(interval).await;
            }
        }
    }
}

/// An authenticated SSH session to one node.
pub struct Session {
    handle: client::Handle<Client>,
    host: String,
}

impl Session {
    /// Runs `cmd`, buffering stdout/stderr until the channel closes.
    pub async fn exec(&mut self, cmd: &str) -> Result<Output, Error> {
        debug!(host = %self.host, %cmd, "executing remote command");

        let mut channel = self.handle.channel_open_session().await?;
        channel.exec(true, cmd).await?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut exit_status = None;

        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { ref data } => {
                    stdout.extend_from_slice(&data[..]);
                }
                ChannelMsg::ExtendedData { ref data, ext } => {
                    if ext == 1 {
                        stderr.extend_from_slice(&data[..]);
                    }
                }
                ChannelMsg::ExitStatus { exit_status: status } => {
                    exit_status = Some(status);
                }
                other => debug!(?other, "ignoring channel message"),
            }
        }

        Ok(Output {
            exit_status,
            stdout: String::from_utf8(stdout)?,
            stderr: String::from_utf8(stderr)?,
        })
    }

    /// Runs `cmd` and treats a nonzero exit status as an error.
    pub async fn check_exec(&mut self, cmd: &str) -> Result<Output, Error> {
        let out = self.exec(cmd).await?;
        if out.success() {
            Ok(out)
        } else {
            Err(Error::FailedCmd {
                cmd: cmd.to_string(),
                code: out.exit_status.unwrap_or(1),
                stderr: if out.stderr.is_empty() {
                    out.stdout
                } else {
                    out.stderr
                },
            })
        }
    }

    /// Runs `cmd` with a deadline. The remote process is not killed on
    /// expiry; the channel is simply abandoned.
    pub async fn exec_timeout(
        &mut self,
        cmd: &str,
        timeout: Duration,
    ) -> Result<Output, Error> {
        tokio::time::timeout(timeout, self.exec(cmd))
            .await
            .map_err(|_| Error::CommandTimeout(cmd.to_string(), timeout))?
    }

    /// Writes `contents` to `path` on the node, creating parent directories
    /// as needed.
    pub async fn write_remote_file(
        &mut self,
        path: &str,
        contents: &[u8],
    ) -> Result<(), Error> {
        if let Some((dir, _)) = path.rsplit_once('/') {
            if !dir.is_empty() {
                self.check_exec(&format!("mkdir -p {dir}")).await?;
            }
        }

        let cmd = format!("cat - > {path}");
        let mut channel = self.handle.channel_open_session().await?;
        channel.exec(true, cmd.as_str()).await?;
        channel.data(contents).await?;
        channel.eof().await?;

        let mut exit_status = 1;
        let mut stderr = Vec::new();
        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::ExitStatus { exit_status: status } => {
                    exit_status = status;
                }
                ChannelMsg::ExtendedData { ref data, ext } if ext == 1 => {
                    stderr.extend_from_slice(&data[..]);
                }
                _ => {}
            }
        }

        if exit_status != 0 {
            return Err(Error::FailedCmd {
                cmd,
                code: exit_status,
                stderr: String::from_utf8_lossy(&stderr).into_owned(),
            });
        }

        Ok(())
    }

    /// Reads the contents of `path` on the node.
    pub async fn read_remote_file(&mut self, path: &str) -> Result<String, Error> {
        let out = self.check_exec(&format!("cat {path}")).await?;
        Ok(out.stdout)
    }

    pub fn host(&self) -> &str {
        &self.host
    }
}

#[cfg(test)]
mod test {
    use super::Output;

    #[test]
    fn output_success_requires_zero_status() {
        let ok = Output {
            exit_status: Some(0),
            stdout: String::new(),
            stderr: String::new(),
        };
        assert!(ok.success());

        let failed = Output {
            exit_status: Some(2),
            stdout: String::new(),
            stderr: String::new(),
        };
        assert!(!failed.success());

        let unknown = Output {
            exit_status: None,
            stdout: String::new(),
            stderr: String::new(),
        };
        assert!(!unknown.success());
    }
}

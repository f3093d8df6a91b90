//! SSH transport session - one authenticated connection to one host

use ssh2::Session;
use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::config::expand_tilde;
use crate::error::{Error, Result};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// A live SSH connection to a single host.
///
/// Commands and file transfers each open one channel on the shared
/// session. Host keys are deliberately not verified.
pub struct SshClient {
    session: Session,
    host: String,
    verbose: AtomicBool,
    closed: AtomicBool,
}

impl SshClient {
    /// Dial and authenticate with a private key file.
    ///
    /// `~/` in the key path is expanded. Fails with [`Error::Connection`]
    /// on resolution, dial, handshake, key or auth problems.
    pub fn connect(host: &str, user: &str, key_path: &str, port: u16) -> Result<Self> {
        let addr = format!("{}:{}", host, port);
        let key = expand_tilde(key_path);

        let sockaddr = addr
            .to_socket_addrs()
            .map_err(|e| connection_error(&addr, e.to_string()))?
            .next()
            .ok_or_else(|| connection_error(&addr, "address did not resolve".to_string()))?;

        let tcp = TcpStream::connect_timeout(&sockaddr, CONNECT_TIMEOUT)
            .map_err(|e| connection_error(&addr, e.to_string()))?;

        let mut session = Session::new().map_err(|e| connection_error(&addr, e.to_string()))?;
        session.set_tcp_stream(tcp);
        session
            .handshake()
            .map_err(|e| connection_error(&addr, e.to_string()))?;

        session
            .userauth_pubkey_file(user, None, &key, None)
            .map_err(|e| {
                connection_error(
                    &addr,
                    format!("auth with key {} failed: {}", key.display(), e),
                )
            })?;
        if !session.authenticated() {
            return Err(connection_error(&addr, "authentication failed".to_string()));
        }

        log::debug!("connected to {} as {}", addr, user);

        Ok(Self {
            session,
            host: host.to_string(),
            verbose: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn set_verbose(&self, verbose: bool) {
        self.verbose.store(verbose, Ordering::Relaxed);
    }

    pub(crate) fn verbose(&self) -> bool {
        self.verbose.load(Ordering::Relaxed)
    }

    /// Run a command on the remote host, streaming its stdout into `out`.
    ///
    /// Remote stderr is drained after stdout and appended to the same
    /// sink. Non-zero exit becomes [`Error::RemoteExec`] carrying the
    /// stderr tail.
    pub fn run(&self, command: &str, out: &mut dyn Write) -> Result<()> {
        log::debug!("[{}] exec: {}", self.host, command);

        let mut channel = self.session.channel_session()?;
        channel.exec(command)?;

        std::io::copy(&mut channel, out)?;
        let mut stderr = String::new();
        channel.stderr().read_to_string(&mut stderr)?;
        channel.wait_close()?;
        let status = channel.exit_status()?;

        if !stderr.is_empty() {
            out.write_all(stderr.as_bytes())?;
        }
        if status != 0 {
            return Err(Error::RemoteExec {
                status,
                stderr: stderr_tail(&stderr),
            });
        }
        Ok(())
    }

    /// Run a command and capture its stdout
    pub fn output(&self, command: &str) -> Result<String> {
        log::debug!("[{}] exec (captured): {}", self.host, command);

        let mut channel = self.session.channel_session()?;
        channel.exec(command)?;

        let mut stdout = String::new();
        channel.read_to_string(&mut stdout)?;
        let mut stderr = String::new();
        channel.stderr().read_to_string(&mut stderr)?;
        channel.wait_close()?;
        let status = channel.exit_status()?;

        if status != 0 {
            return Err(Error::RemoteExec {
                status,
                stderr: stderr_tail(&stderr),
            });
        }
        Ok(stdout)
    }

    /// Deliver exactly `content` to `remote_path` via the remote sink
    /// protocol.
    ///
    /// Starts the remote side in sink mode, writes the
    /// `C<mode> <len> <basename>` header line, the raw bytes and a single
    /// NUL terminator, closes the write side and waits for the remote
    /// process to exit. Blocks until the remote side acknowledges
    /// completion.
    pub fn send_file(&self, content: &[u8], remote_path: &str, mode: u32) -> Result<()> {
        let name = remote_path.rsplit('/').next().unwrap_or(remote_path);

        let mut channel = self.session.channel_session()?;
        channel.exec(&format!("/usr/bin/scp -t {}", remote_path))?;

        let header = format!("C{:04o} {} {}\n", mode, content.len(), name);
        let write = |channel: &mut ssh2::Channel, bytes: &[u8]| {
            channel.write_all(bytes).map_err(|e| Error::Transfer {
                path: remote_path.to_string(),
                detail: e.to_string(),
            })
        };
        write(&mut channel, header.as_bytes())?;
        write(&mut channel, content)?;
        write(&mut channel, &[0])?;

        channel.send_eof()?;
        let mut stderr = String::new();
        let _ = channel.stderr().read_to_string(&mut stderr);
        channel.wait_eof()?;
        channel.wait_close()?;
        let status = channel.exit_status()?;

        if status != 0 {
            return Err(Error::Transfer {
                path: remote_path.to_string(),
                detail: stderr_tail(&stderr),
            });
        }

        if self.verbose() {
            log::info!(
                "[{}] sent {} bytes to {}",
                self.host,
                content.len(),
                remote_path
            );
        }
        Ok(())
    }

    /// Disconnect. Idempotent; later calls are no-ops.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.session.disconnect(None, "closing", None);
            log::debug!("closed connection to {}", self.host);
        }
    }
}

impl Drop for SshClient {
    fn drop(&mut self) {
        self.close();
    }
}

fn connection_error(addr: &str, reason: String) -> Error {
    Error::Connection {
        host: addr.to_string(),
        reason,
    }
}

/// Last chunk of a stderr capture, enough to diagnose without flooding
pub(crate) fn stderr_tail(stderr: &str) -> String {
    const MAX: usize = 1024;
    let trimmed = stderr.trim();
    if trimmed.len() <= MAX {
        return trimmed.to_string();
    }
    let start = trimmed.len() - MAX;
    // Back off to a char boundary
    let start = (start..trimmed.len())
        .find(|i| trimmed.is_char_boundary(*i))
        .unwrap_or(start);
    trimmed[start..].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stderr_tail_keeps_short_output_intact() {
        assert_eq!(stderr_tail("  boom  \n"), "boom");
    }

    #[test]
    fn stderr_tail_truncates_long_output() {
        let long = "x".repeat(5000);
        let tail = stderr_tail(&long);
        assert_eq!(tail.len(), 1024);
    }
}

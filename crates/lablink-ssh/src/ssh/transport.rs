// ── Transport – session seam and the libssh2 implementation ──────────────────

use super::types::*;
use lablink_core::FailureKind;
use secrecy::ExposeSecret;
use ssh2::{ErrorCode, Session};
use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const LIBSSH2_ERROR_TIMEOUT: i32 = -9;
const LIBSSH2_ERROR_AUTHENTICATION_FAILED: i32 = -18;
const LIBSSH2_ERROR_PUBLICKEY_UNVERIFIED: i32 = -19;
const LIBSSH2_ERROR_SCP_PROTOCOL: i32 = -28;

const CHUNK_SIZE: usize = 32 * 1024;
const KEEPALIVE_INTERVAL_SECS: u32 = 30;

/// An authenticated session able to run many independent operations.
#[cfg_attr(test, mockall::automock)]
pub trait RemoteSession: Send + Sync {
    fn exec(&self, command: &str, timeout: Duration) -> Result<CommandOutput, SshFailure>;
    /// Push one file; returns the bytes sent.
    fn upload(
        &self,
        local: &Path,
        remote: &str,
        mode: i32,
        timeout: Duration,
    ) -> Result<u64, SshFailure>;
    /// Fetch one file; returns the bytes received.
    fn download(&self, remote: &str, local: &Path, timeout: Duration) -> Result<u64, SshFailure>;
    /// Must answer without blocking on the network.
    fn is_alive(&self) -> bool;
    fn close(&self);
}

/// Opens authenticated sessions.
#[cfg_attr(test, mockall::automock)]
pub trait Connector: Send + Sync {
    fn connect(
        &self,
        target: &SshTarget,
        attempt: &AuthAttempt,
        timeouts: SessionTimeouts,
    ) -> Result<Arc<dyn RemoteSession>, SshFailure>;
}

fn millis(timeout: Duration) -> u32 {
    timeout.as_millis().min(u32::MAX as u128) as u32
}

fn ssh_failure(context: &str, err: &ssh2::Error) -> SshFailure {
    let message = format!("{}: {}", context, err);
    match err.code() {
        ErrorCode::Session(LIBSSH2_ERROR_TIMEOUT) => SshFailure::new(FailureKind::Timeout, message),
        ErrorCode::Session(LIBSSH2_ERROR_AUTHENTICATION_FAILED)
        | ErrorCode::Session(LIBSSH2_ERROR_PUBLICKEY_UNVERIFIED) => {
            SshFailure::new(FailureKind::AuthFailed, message)
        }
        // the remote scp reported the problem (missing file, bad directory)
        ErrorCode::Session(LIBSSH2_ERROR_SCP_PROTOCOL) => SshFailure::remote(message),
        _ => SshFailure::classify(message),
    }
}

// ── Key authentication settings ──────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct KeyAuthConfig {
    pub use_agent: bool,
    pub key_files: Vec<PathBuf>,
}

// ── Connector ────────────────────────────────────────────────────────────────

pub struct Ssh2Connector {
    keys: KeyAuthConfig,
}

impl Ssh2Connector {
    pub fn new(keys: KeyAuthConfig) -> Self {
        Self { keys }
    }

    fn authenticate(&self, session: &Session, attempt: &AuthAttempt) -> Result<(), SshFailure> {
        let user = attempt.username.as_str();
        match &attempt.method {
            AuthMethod::Key => {
                if self.keys.use_agent {
                    if session.userauth_agent(user).is_ok() && session.authenticated() {
                        return Ok(());
                    }
                    log::debug!("Agent auth failed for {}, trying key files", user);
                }
                for key_path in self.keys.key_files.iter().filter(|p| p.exists()) {
                    match session.userauth_pubkey_file(user, None, key_path, None) {
                        Ok(()) if session.authenticated() => return Ok(()),
                        Ok(()) => {}
                        Err(e) if e.code() == ErrorCode::Session(LIBSSH2_ERROR_TIMEOUT) => {
                            return Err(ssh_failure("Key authentication", &e));
                        }
                        Err(e) => log::debug!("Key {} rejected: {}", key_path.display(), e),
                    }
                }
                Err(SshFailure::new(
                    FailureKind::AuthFailed,
                    format!("{}: Permission denied (publickey)", user),
                ))
            }
            AuthMethod::Password(secret) => {
                match session.userauth_password(user, secret.expose_secret()) {
                    Ok(()) if session.authenticated() => Ok(()),
                    Ok(()) => Err(SshFailure::new(
                        FailureKind::AuthFailed,
                        format!("{}: Authentication failed (password)", user),
                    )),
                    Err(e) if e.code() == ErrorCode::Session(LIBSSH2_ERROR_TIMEOUT) => {
                        Err(ssh_failure("Password authentication", &e))
                    }
                    Err(e) => Err(SshFailure::new(
                        FailureKind::AuthFailed,
                        format!("{}: Authentication failed: {}", user, e),
                    )),
                }
            }
        }
    }
}

impl Connector for Ssh2Connector {
    fn connect(
        &self,
        target: &SshTarget,
        attempt: &AuthAttempt,
        timeouts: SessionTimeouts,
    ) -> Result<Arc<dyn RemoteSession>, SshFailure> {
        let addr = target.addr();
        let socket = addr
            .to_socket_addrs()
            .map_err(|e| SshFailure::from_io(&format!("Invalid address '{}'", addr), &e))?
            .next()
            .ok_or_else(|| {
                SshFailure::new(
                    FailureKind::ConnectionError,
                    format!("No address resolved for '{}'", addr),
                )
            })?;

        let tcp = TcpStream::connect_timeout(&socket, timeouts.connect).map_err(|e| {
            SshFailure::from_io(&format!("TCP connection to {} failed", addr), &e)
        })?;
        tcp.set_nodelay(true).ok();

        let mut session = Session::new()
            .map_err(|e| ssh_failure("Failed to create SSH session", &e))?;
        session.set_tcp_stream(tcp);
        session.set_timeout(millis(timeouts.connect));
        session
            .handshake()
            .map_err(|e| ssh_failure(&format!("SSH handshake with {} failed", addr), &e))?;

        self.authenticate(&session, attempt)?;
        session.set_keepalive(true, KEEPALIVE_INTERVAL_SECS);

        log::debug!(
            "SSH session to {}@{} ({:?})",
            attempt.username,
            addr,
            attempt.kind
        );
        Ok(Arc::new(Ssh2Session {
            session,
            target: addr,
            open: AtomicBool::new(true),
            broken: AtomicBool::new(false),
            turn: Mutex::new(()),
        }))
    }
}

// ── Session ──────────────────────────────────────────────────────────────────
//
// libssh2's timeout is per session, so operations on one session take turns.
// A transport failure marks the session broken; `is_alive` only reads flags
// and never touches the socket.

pub struct Ssh2Session {
    session: Session,
    target: String,
    open: AtomicBool,
    broken: AtomicBool,
    turn: Mutex<()>,
}

impl Ssh2Session {
    fn ensure_open(&self) -> Result<(), SshFailure> {
        if self.open.load(Ordering::SeqCst) && !self.broken.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(SshFailure::new(
                FailureKind::ConnectionError,
                format!("Session to {} is closed", self.target),
            ))
        }
    }

    /// Run one operation with the session to itself and `timeout` applied.
    fn with_turn<T, F>(&self, timeout: Duration, op: F) -> Result<T, SshFailure>
    where
        F: FnOnce(&Session) -> Result<T, SshFailure>,
    {
        let _turn = self.turn.lock().unwrap_or_else(|e| e.into_inner());
        self.ensure_open()?;
        self.session.set_timeout(millis(timeout));

        let result = self
            .session
            .keepalive_send()
            .map_err(|e| ssh_failure("Keepalive failed", &e))
            .and_then(|_| op(&self.session));

        if let Err(failure) = &result {
            if failure.kind == FailureKind::ConnectionError {
                log::debug!("Session to {} marked broken: {}", self.target, failure.message);
                self.broken.store(true, Ordering::SeqCst);
            }
        }
        result
    }
}

impl RemoteSession for Ssh2Session {
    fn exec(&self, command: &str, timeout: Duration) -> Result<CommandOutput, SshFailure> {
        self.with_turn(timeout, |session| {
            let mut channel = session
                .channel_session()
                .map_err(|e| ssh_failure("Failed to open channel", &e))?;
            channel
                .exec(command)
                .map_err(|e| ssh_failure("Failed to execute command", &e))?;

            let mut stdout = Vec::new();
            channel
                .read_to_end(&mut stdout)
                .map_err(|e| SshFailure::from_io("Failed to read command output", &e))?;
            let mut stderr = Vec::new();
            channel
                .stderr()
                .read_to_end(&mut stderr)
                .map_err(|e| SshFailure::from_io("Failed to read command stderr", &e))?;

            channel
                .wait_close()
                .map_err(|e| ssh_failure("Failed to close channel", &e))?;
            let exit_status = channel
                .exit_status()
                .map_err(|e| ssh_failure("Failed to get exit status", &e))?;

            Ok(CommandOutput {
                exit_status,
                stdout: String::from_utf8_lossy(&stdout).into_owned(),
                stderr: String::from_utf8_lossy(&stderr).into_owned(),
            })
        })
    }

    fn upload(
        &self,
        local: &Path,
        remote: &str,
        mode: i32,
        timeout: Duration,
    ) -> Result<u64, SshFailure> {
        let total_bytes = std::fs::metadata(local)
            .map_err(|e| SshFailure::local(&format!("Cannot stat '{}'", local.display()), &e))?
            .len();
        let mut local_file = std::fs::File::open(local)
            .map_err(|e| SshFailure::local(&format!("Cannot open '{}'", local.display()), &e))?;

        let transferred = self.with_turn(timeout, |session| {
            let mut channel = session
                .scp_send(Path::new(remote), mode, total_bytes, None)
                .map_err(|e| ssh_failure(&format!("SCP send init failed for '{}'", remote), &e))?;

            let mut buffer = vec![0u8; CHUNK_SIZE];
            let mut transferred: u64 = 0;
            loop {
                let n = local_file
                    .read(&mut buffer)
                    .map_err(|e| SshFailure::local("Local read error", &e))?;
                if n == 0 {
                    break;
                }
                channel
                    .write_all(&buffer[..n])
                    .map_err(|e| SshFailure::from_io("SCP write error", &e))?;
                transferred += n as u64;
            }

            channel
                .send_eof()
                .map_err(|e| ssh_failure("Failed to send EOF", &e))?;
            channel
                .wait_eof()
                .map_err(|e| ssh_failure("Failed waiting for EOF", &e))?;
            channel
                .close()
                .map_err(|e| ssh_failure("Failed to close channel", &e))?;
            channel
                .wait_close()
                .map_err(|e| ssh_failure("Failed waiting for close", &e))?;
            Ok(transferred)
        })?;

        log::debug!("SCP uploaded {} bytes to {}:{}", transferred, self.target, remote);
        Ok(transferred)
    }

    fn download(&self, remote: &str, local: &Path, timeout: Duration) -> Result<u64, SshFailure> {
        if let Some(parent) = local.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| SshFailure::local("Cannot create local directory", &e))?;
        }

        let transferred = self.with_turn(timeout, |session| {
            let (mut channel, stat) = session
                .scp_recv(Path::new(remote))
                .map_err(|e| ssh_failure(&format!("SCP recv init failed for '{}'", remote), &e))?;
            let total_bytes = stat.size();

            let mut local_file = std::fs::File::create(local).map_err(|e| {
                SshFailure::local(&format!("Cannot create '{}'", local.display()), &e)
            })?;

            // scp appends a status byte after the payload; stop at the announced size
            let mut limited = (&mut channel).take(total_bytes);
            let transferred = std::io::copy(&mut limited, &mut local_file)
                .map_err(|e| SshFailure::from_io("SCP read error", &e))?;

            channel.send_eof().ok();
            channel.wait_eof().ok();
            channel.close().ok();
            channel.wait_close().ok();
            Ok(transferred)
        })?;

        log::debug!("SCP downloaded {} bytes from {}:{}", transferred, self.target, remote);
        Ok(transferred)
    }

    fn is_alive(&self) -> bool {
        self.open.load(Ordering::SeqCst) && !self.broken.load(Ordering::SeqCst)
    }

    fn close(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            let _ = self.session.disconnect(None, "lablink: closing session", None);
        }
    }
}

impl Drop for Ssh2Session {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_millis_saturates() {
        assert_eq!(millis(Duration::from_secs(3)), 3_000);
        assert_eq!(millis(Duration::from_secs(u64::MAX)), u32::MAX);
    }

    #[test]
    fn test_scp_protocol_error_is_remote() {
        let err = ssh2::Error::new(
            ErrorCode::Session(LIBSSH2_ERROR_SCP_PROTOCOL),
            "scp: /no/such/file: No such file or directory",
        );
        let failure = ssh_failure("SCP recv init failed for '/no/such/file'", &err);
        assert_eq!(failure.kind, FailureKind::RemoteError);
        assert!(!failure.kind.is_transport());

        let err = ssh2::Error::new(ErrorCode::Session(LIBSSH2_ERROR_TIMEOUT), "Timed out");
        assert_eq!(ssh_failure("exec", &err).kind, FailureKind::Timeout);
    }

    #[test]
    fn test_connect_refused_is_classified() {
        // bind then drop to get a port with nothing listening
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let connector = Ssh2Connector::new(KeyAuthConfig::default());
        let result = connector.connect(
            &SshTarget::new("127.0.0.1", port),
            &AuthAttempt::key("root"),
            SessionTimeouts::new(Duration::from_secs(2)),
        );
        match result {
            Err(failure) => assert_eq!(failure.kind, FailureKind::ConnectionRefused),
            Ok(_) => panic!("nothing listens on port {}", port),
        }
    }
}

//! FTP transport
//!
//! Uploads go to `<upload_dir>/<file>.part`, are checked with SIZE and only
//! then renamed to `<file>`, so a dropped connection never leaves a
//! complete-looking package behind. The reference is the final file name.
//!
//! The repository reports outcomes by moving the file: into `accepted_dir`
//! or `rejected_dir`. Still in `upload_dir` means not processed yet.
//!
//! suppaftp's blocking client runs on the blocking pool; each call opens its
//! own session. Every socket (control and data) carries connect, read and
//! write timeouts, so a stalled server releases the blocking thread. An upload
//! whose caller has given up is not renamed into place.

use async_trait::async_trait;
use dps_common::{DepositStatus, RepositoryConfig, TransportKind};
use std::io::Read;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;
use suppaftp::{FtpError, FtpStream, Mode, Status};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::{Credentials, RemoteStatus, Transport, TransportError};
use crate::packaging::Package;

/// Maximum number of attempts for connection-level failures
pub const MAX_RETRIES: u32 = 3;

/// Base delay between attempts; multiplied by the attempt number
pub const RETRY_DELAY_SECS: u64 = 2;

pub const DEFAULT_PORT: u16 = 21;
pub const DEFAULT_UPLOAD_DIR: &str = "upload";
pub const DEFAULT_ACCEPTED_DIR: &str = "accepted";
pub const DEFAULT_REJECTED_DIR: &str = "rejected";

const PART_SUFFIX: &str = ".part";

/// Connection and layout of one FTP repository
#[derive(Clone)]
pub struct FtpTarget {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub mode: Mode,
    pub upload_dir: String,
    pub accepted_dir: String,
    pub rejected_dir: String,
    /// Bound on connect and on every single read or write
    pub io_timeout: Duration,
}

impl FtpTarget {
    pub fn from_config(config: &RepositoryConfig, io_timeout: Duration) -> Result<Self, TransportError> {
        let (host, port) = parse_endpoint(&config.endpoint)?;
        let (username, password) = match Credentials::resolve(config)? {
            Some(c) => (c.username, c.secret),
            None => ("anonymous".to_string(), "anonymous@".to_string()),
        };

        let mode = match config.hint_bool("passive") {
            Some(true) => Mode::Passive,
            Some(false) => Mode::Active,
            None => Mode::ExtendedPassive,
        };

        Ok(Self {
            host,
            port,
            username,
            password,
            mode,
            upload_dir: config.hint("upload_dir").unwrap_or(DEFAULT_UPLOAD_DIR).to_string(),
            accepted_dir: config
                .hint("accepted_dir")
                .unwrap_or(DEFAULT_ACCEPTED_DIR)
                .to_string(),
            rejected_dir: config
                .hint("rejected_dir")
                .unwrap_or(DEFAULT_REJECTED_DIR)
                .to_string(),
            io_timeout,
        })
    }
}

/// `host`, `host:port` or `ftp://host[:port][/]`
pub fn parse_endpoint(endpoint: &str) -> Result<(String, u16), TransportError> {
    let trimmed = endpoint
        .trim()
        .trim_start_matches("ftp://")
        .trim_end_matches('/');

    if trimmed.is_empty() {
        return Err(TransportError::Config(format!("invalid FTP endpoint: {:?}", endpoint)));
    }

    match trimmed.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse()
                .map_err(|_| TransportError::Config(format!("invalid FTP port in {:?}", endpoint)))?;
            Ok((host.to_string(), port))
        },
        None => Ok((trimmed.to_string(), DEFAULT_PORT)),
    }
}

fn remote_path(dir: &str, name: &str) -> String {
    let dir = dir.trim_end_matches('/');
    if dir.is_empty() || dir == "." {
        name.to_string()
    } else {
        format!("{}/{}", dir, name)
    }
}

fn classify(error: FtpError) -> TransportError {
    match error {
        FtpError::ConnectionError(e) => TransportError::Network(e.to_string()),
        FtpError::UnexpectedResponse(response) if response.status == Status::NotLoggedIn => {
            TransportError::Authentication(format!("FTP login refused: {:?}", response.status))
        },
        other => TransportError::Protocol(other.to_string()),
    }
}

fn open_stream(addr: SocketAddr, timeout: Duration) -> std::io::Result<TcpStream> {
    let stream = TcpStream::connect_timeout(&addr, timeout)?;
    stream.set_read_timeout(Some(timeout))?;
    stream.set_write_timeout(Some(timeout))?;
    Ok(stream)
}

#[derive(Debug, Clone)]
pub struct FtpTransport {
    io_timeout: Duration,
}

impl FtpTransport {
    /// `io_timeout` bounds each connect, read and write of a session
    pub fn new(io_timeout: Duration) -> Self {
        Self { io_timeout }
    }

    fn connect(target: &FtpTarget) -> Result<FtpStream, TransportError> {
        debug!("Connecting to FTP server: {}:{}", target.host, target.port);

        let addr = (target.host.as_str(), target.port)
            .to_socket_addrs()
            .map_err(|e| TransportError::Network(format!("cannot resolve {}: {}", target.host, e)))?
            .next()
            .ok_or_else(|| TransportError::Network(format!("no address for {}", target.host)))?;

        let timeout = target.io_timeout;
        let stream = open_stream(addr, timeout).map_err(|e| TransportError::Network(e.to_string()))?;
        let ftp = FtpStream::connect_with_stream(stream)
            .map_err(classify)?
            .passive_stream_builder(move |addr| open_stream(addr, timeout).map_err(FtpError::ConnectionError));
        let mut ftp = match target.mode {
            Mode::Active => ftp.active_mode(timeout),
            mode => {
                let mut ftp = ftp;
                ftp.set_mode(mode);
                ftp
            },
        };

        debug!("Logging in as: {}", target.username);
        ftp.login(&target.username, &target.password).map_err(classify)?;
        ftp.transfer_type(suppaftp::types::FileType::Binary)
            .map_err(classify)?;

        Ok(ftp)
    }

    fn quit(mut ftp: FtpStream) {
        if let Err(e) = ftp.quit() {
            warn!("Failed to quit FTP session gracefully: {}", e);
        }
    }

    fn send_sync(
        target: &FtpTarget,
        file_name: &str,
        mut reader: Box<dyn Read + Send>,
        expected_size: u64,
        abandoned: &CancellationToken,
    ) -> Result<String, TransportError> {
        let mut ftp = Self::connect(target)?;
        let part_path = remote_path(&target.upload_dir, &format!("{}{}", file_name, PART_SUFFIX));
        let final_path = remote_path(&target.upload_dir, file_name);

        debug!("Uploading {} bytes to {}", expected_size, part_path);
        ftp.put_file(&part_path, &mut reader).map_err(classify)?;

        let remote_size = ftp.size(&part_path).map_err(classify)? as u64;
        if remote_size != expected_size {
            if let Err(e) = ftp.rm(&part_path) {
                warn!("Failed to remove partial upload {}: {}", part_path, e);
            }
            Self::quit(ftp);
            return Err(TransportError::Protocol(format!(
                "partial upload of {}: remote has {} of {} bytes",
                file_name, remote_size, expected_size
            )));
        }

        if abandoned.is_cancelled() {
            warn!("Caller gave up on {}; removing partial upload", file_name);
            if let Err(e) = ftp.rm(&part_path) {
                warn!("Failed to remove partial upload {}: {}", part_path, e);
            }
            Self::quit(ftp);
            return Err(TransportError::Network(format!("upload of {} abandoned", file_name)));
        }

        ftp.rename(&part_path, &final_path).map_err(classify)?;
        Self::quit(ftp);

        Ok(file_name.to_string())
    }

    fn contains(ftp: &mut FtpStream, dir: &str, name: &str) -> Result<bool, TransportError> {
        match ftp.nlst(Some(dir)) {
            Ok(entries) => Ok(entries
                .iter()
                .any(|entry| entry.rsplit('/').next() == Some(name))),
            Err(FtpError::UnexpectedResponse(response)) if response.status == Status::FileUnavailable => {
                Ok(false)
            },
            Err(e) => Err(classify(e)),
        }
    }

    fn query_sync(target: &FtpTarget, name: &str) -> Result<RemoteStatus, TransportError> {
        let mut ftp = Self::connect(target)?;

        let status = if Self::contains(&mut ftp, &target.accepted_dir, name)? {
            RemoteStatus::Visible(DepositStatus::Accepted)
        } else if Self::contains(&mut ftp, &target.rejected_dir, name)? {
            RemoteStatus::Visible(DepositStatus::Rejected)
        } else if Self::contains(&mut ftp, &target.upload_dir, name)? {
            RemoteStatus::NotYetVisible
        } else {
            RemoteStatus::NotFound
        };

        Self::quit(ftp);
        Ok(status)
    }

    /// Run a blocking FTP operation, retrying connection-level failures
    async fn with_retries<T, F>(&self, what: &str, op: F) -> Result<T, TransportError>
    where
        T: Send + 'static,
        F: Fn() -> Result<T, TransportError> + Clone + Send + 'static,
    {
        for attempt in 1..=MAX_RETRIES {
            debug!("FTP {} attempt {}/{}", what, attempt, MAX_RETRIES);

            match tokio::task::spawn_blocking(op.clone()).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(TransportError::Network(e))) if attempt < MAX_RETRIES => {
                    let delay = RETRY_DELAY_SECS * attempt as u64;
                    warn!(
                        "FTP {} attempt {}/{} failed: {}. Retrying in {}s...",
                        what, attempt, MAX_RETRIES, e, delay
                    );
                    tokio::time::sleep(Duration::from_secs(delay)).await;
                },
                Ok(Err(e)) => return Err(e),
                Err(e) => {
                    return Err(TransportError::Protocol(format!("FTP {} task panicked: {}", what, e)));
                },
            }
        }

        Err(TransportError::Network(format!(
            "FTP {} failed after {} attempts",
            what, MAX_RETRIES
        )))
    }
}

#[async_trait]
impl Transport for FtpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Ftp
    }

    #[instrument(skip(self, package, config), fields(repository_id = %config.id, file = %package.file_name))]
    async fn send(&self, package: &Package, config: &RepositoryConfig) -> Result<String, TransportError> {
        let target = FtpTarget::from_config(config, self.io_timeout)?;
        let file_name = package.file_name.clone();
        let size = package.size;
        let payload = package.payload_handle();

        // Cancelled when this future is dropped, e.g. by the registry timeout
        let abandoned = CancellationToken::new();
        let _guard = abandoned.clone().drop_guard();

        let reference = self
            .with_retries("upload", move || {
                let reader = payload
                    .open()
                    .map_err(|e| TransportError::Protocol(format!("cannot read package: {}", e)))?;
                Self::send_sync(&target, &file_name, reader, size, &abandoned)
            })
            .await?;

        info!("Uploaded {} to {}", reference, config.endpoint);
        Ok(reference)
    }

    #[instrument(skip(self, config), fields(repository_id = %config.id))]
    async fn query_status(
        &self,
        reference: &str,
        config: &RepositoryConfig,
    ) -> Result<RemoteStatus, TransportError> {
        let target = FtpTarget::from_config(config, self.io_timeout)?;
        let name = reference.to_string();

        self.with_retries("status", move || Self::query_sync(&target, &name))
            .await
    }
}

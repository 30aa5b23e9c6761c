//! Package and document transfers over FTP or HTTP.
//!
//! The FTP session uses the blocking `suppaftp` client on the blocking
//! thread pool. Socket timeouts and a session deadline are enforced inside
//! that thread, so a transfer never outlives the task awaiting it.

use std::io::{ErrorKind, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use suppaftp::types::FileType;
use suppaftp::{FtpError, FtpStream};
use tracing::{debug, info, instrument, warn};
use url::Url;

use super::TransferError;
use crate::download::HttpClient;
use crate::download::constants::DEFAULT_CHUNK_SIZE;
use crate::user_agent::HeaderProfile;

const FTP_PORT: u16 = 21;

/// A downloadable package or document advertised by the OA service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferLink {
    pub url: String,
    /// Advertised format (`tgz`, `pdf`), if any.
    pub format: Option<String>,
}

impl TransferLink {
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            format: None,
        }
    }
}

/// Moves a remote file into a local directory.
#[async_trait]
pub trait Transfer: Send + Sync {
    /// Downloads `link` into `dest_dir`, returning the local path.
    ///
    /// Partial files are removed on failure.
    async fn fetch(&self, link: &TransferLink, dest_dir: &Path) -> Result<PathBuf, TransferError>;
}

/// Host, directory and decoded file name of a remote URL.
#[derive(Debug, Clone, PartialEq, Eq)]
struct RemoteFile {
    host: Option<String>,
    port: Option<u16>,
    dir: String,
    name: String,
}

fn remote_file(raw: &str) -> Result<RemoteFile, TransferError> {
    let url = Url::parse(raw).map_err(|_| TransferError::invalid_link(raw))?;
    let path = url.path();
    let (dir, name) = path.rsplit_once('/').unwrap_or(("", path));
    let name = urlencoding::decode(name)
        .map_err(|_| TransferError::invalid_link(raw))?
        .into_owned();
    if name.is_empty() || name == "." || name == ".." {
        return Err(TransferError::invalid_link(raw));
    }
    Ok(RemoteFile {
        host: url.host_str().filter(|h| !h.is_empty()).map(ToString::to_string),
        port: url.port(),
        dir: urlencoding::decode(dir)
            .map_err(|_| TransferError::invalid_link(raw))?
            .into_owned(),
        name,
    })
}

/// FTP session settings.
#[derive(Debug, Clone)]
pub struct FtpOptions {
    /// Used when a link carries no host.
    pub host: String,
    pub user: String,
    pub password: String,
    pub chunk_size: usize,
    /// Bound on connecting and on every control or data socket read/write.
    pub io_timeout: Duration,
    /// Deadline for one whole session.
    pub timeout: Duration,
}

impl Default for FtpOptions {
    fn default() -> Self {
        Self {
            host: "ftp.ncbi.nlm.nih.gov".to_string(),
            user: "anonymous".to_string(),
            password: "anonymous@".to_string(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            io_timeout: Duration::from_secs(30),
            timeout: Duration::from_secs(300),
        }
    }
}

/// Anonymous (or authenticated) FTP retrieval.
#[derive(Debug, Clone, Default)]
pub struct FtpTransfer {
    options: FtpOptions,
}

impl FtpTransfer {
    #[must_use]
    pub fn new(options: FtpOptions) -> Self {
        Self { options }
    }
}

fn is_timeout(kind: ErrorKind) -> bool {
    matches!(kind, ErrorKind::TimedOut | ErrorKind::WouldBlock)
}

fn io_failure(url: &str, e: &std::io::Error) -> TransferError {
    if is_timeout(e.kind()) {
        TransferError::Timeout { url: url.to_string() }
    } else {
        TransferError::ftp(url, e)
    }
}

fn ftp_failure(url: &str, e: FtpError) -> TransferError {
    match &e {
        FtpError::ConnectionError(io) => io_failure(url, io),
        _ => TransferError::ftp(url, e),
    }
}

/// Opens the control connection with every socket operation bounded.
fn connect(url: &str, host: &str, port: u16, io_timeout: Duration) -> Result<FtpStream, TransferError> {
    let addresses = (host, port)
        .to_socket_addrs()
        .map_err(|e| TransferError::ftp(url, format!("cannot resolve {host}: {e}")))?;
    let mut last_error = None;
    for address in addresses {
        match TcpStream::connect_timeout(&address, io_timeout) {
            Ok(stream) => {
                stream
                    .set_read_timeout(Some(io_timeout))
                    .and_then(|()| stream.set_write_timeout(Some(io_timeout)))
                    .map_err(|e| TransferError::ftp(url, e))?;
                return FtpStream::connect_with_stream(stream).map_err(|e| ftp_failure(url, e));
            }
            Err(e) => last_error = Some(e),
        }
    }
    Err(match last_error {
        Some(e) => io_failure(url, &e),
        None => TransferError::ftp(url, format!("no address for {host}")),
    })
}

struct Session<'a> {
    url: &'a str,
    host: String,
    port: u16,
    user: &'a str,
    password: &'a str,
    chunk_size: usize,
    io_timeout: Duration,
    deadline: Instant,
}

impl Session<'_> {
    fn check_deadline(&self) -> Result<(), TransferError> {
        if Instant::now() >= self.deadline {
            return Err(TransferError::Timeout {
                url: self.url.to_string(),
            });
        }
        Ok(())
    }

    fn retrieve(&self, remote: &RemoteFile, dest: &Path) -> Result<u64, TransferError> {
        let url = self.url;
        let mut ftp = connect(url, &self.host, self.port, self.io_timeout)?;
        ftp.login(self.user, self.password)
            .map_err(|e| ftp_failure(url, e))?;
        ftp.transfer_type(FileType::Binary)
            .map_err(|e| ftp_failure(url, e))?;
        if !remote.dir.is_empty() {
            ftp.cwd(remote.dir.as_str()).map_err(|e| ftp_failure(url, e))?;
        }
        self.check_deadline()?;

        let mut stream = ftp
            .retr_as_stream(remote.name.as_str())
            .map_err(|e| ftp_failure(url, e))?;
        stream
            .get_ref()
            .set_read_timeout(Some(self.io_timeout))
            .map_err(|e| TransferError::ftp(url, e))?;
        let mut file = std::fs::File::create(dest).map_err(|e| TransferError::io(dest, e))?;
        let mut buffer = vec![0_u8; self.chunk_size.max(1)];
        let mut total = 0_u64;
        loop {
            self.check_deadline()?;
            let read = stream.read(&mut buffer).map_err(|e| io_failure(url, &e))?;
            if read == 0 {
                break;
            }
            file.write_all(&buffer[..read])
                .map_err(|e| TransferError::io(dest, e))?;
            total += read as u64;
        }
        file.flush().map_err(|e| TransferError::io(dest, e))?;
        ftp.finalize_retr_stream(stream)
            .map_err(|e| ftp_failure(url, e))?;
        if let Err(e) = ftp.quit() {
            debug!(error = %e, "FTP quit failed");
        }
        Ok(total)
    }
}

fn remove_partial(path: &Path) {
    if let Err(e) = std::fs::remove_file(path)
        && e.kind() != ErrorKind::NotFound
    {
        warn!(path = %path.display(), error = %e, "failed to remove partial transfer");
    }
}

#[async_trait]
impl Transfer for FtpTransfer {
    #[instrument(skip(self, link), fields(url = %link.url))]
    async fn fetch(&self, link: &TransferLink, dest_dir: &Path) -> Result<PathBuf, TransferError> {
        let remote = remote_file(&link.url)?;
        tokio::fs::create_dir_all(dest_dir)
            .await
            .map_err(|e| TransferError::io(dest_dir, e))?;
        let dest = dest_dir.join(&remote.name);

        let url = link.url.clone();
        let host = remote.host.clone().unwrap_or_else(|| self.options.host.clone());
        let port = remote.port.unwrap_or(FTP_PORT);
        let options = self.options.clone();
        let target = dest.clone();
        // Runs to completion: the caller's download permit stays held until
        // the blocking session has actually ended.
        let joined = tokio::task::spawn_blocking(move || {
            let session = Session {
                url: &url,
                host,
                port,
                user: &options.user,
                password: &options.password,
                chunk_size: options.chunk_size,
                io_timeout: options.io_timeout,
                deadline: Instant::now() + options.timeout,
            };
            let result = session.retrieve(&remote, &target);
            if result.is_err() {
                remove_partial(&target);
            }
            result
        })
        .await;

        match joined {
            Ok(Ok(bytes)) => {
                info!(bytes, path = %dest.display(), "FTP transfer complete");
                Ok(dest)
            }
            Ok(Err(e)) => Err(e),
            Err(join) => {
                remove_partial(&dest);
                Err(TransferError::ftp(&link.url, join))
            }
        }
    }
}

/// HTTP(S) retrieval through the shared client.
#[derive(Debug, Clone)]
pub struct HttpTransfer {
    client: HttpClient,
}

impl HttpTransfer {
    #[must_use]
    pub fn new(client: HttpClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Transfer for HttpTransfer {
    async fn fetch(&self, link: &TransferLink, dest_dir: &Path) -> Result<PathBuf, TransferError> {
        let remote = remote_file(&link.url)?;
        let dest = dest_dir.join(&remote.name);
        self.client
            .download_to_file(&link.url, &dest, HeaderProfile::Browser)
            .await?;
        Ok(dest)
    }
}

/// Routes `ftp://` links to FTP and `http(s)://` links to HTTP.
#[derive(Debug, Clone)]
pub struct SchemeTransfer {
    ftp: FtpTransfer,
    http: HttpTransfer,
}

impl SchemeTransfer {
    #[must_use]
    pub fn new(ftp: FtpTransfer, http: HttpTransfer) -> Self {
        Self { ftp, http }
    }
}

#[async_trait]
impl Transfer for SchemeTransfer {
    async fn fetch(&self, link: &TransferLink, dest_dir: &Path) -> Result<PathBuf, TransferError> {
        let scheme = Url::parse(&link.url)
            .map_err(|_| TransferError::invalid_link(&link.url))?
            .scheme()
            .to_ascii_lowercase();
        match scheme.as_str() {
            "ftp" => self.ftp.fetch(link, dest_dir).await,
            "http" | "https" => self.http.fetch(link, dest_dir).await,
            _ => Err(TransferError::invalid_link(&link.url)),
        }
    }
}

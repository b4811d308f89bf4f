//! Rendezvous between a build step and the weaving process.
//!
//! A build tool that produces assemblies after the main build (a linker, a packager) notifies
//! the weaving process through a local socket once its output directory is complete:
//!
//! 1. the client connects to `dotweave.injection.pipe` in the runtime directory, retrying until
//!    the connect timeout elapses
//! 2. the client writes the output directory as UTF-8 followed by a single `0` byte
//! 3. the server weaves the directory and answers with one [`ExitCode`] byte
//!
//! The server handles exactly one notification. Cancelling it closes the endpoint.

use std::{
    io::{ErrorKind, Read, Write},
    os::unix::net::{UnixListener, UnixStream},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use strum::{Display, FromRepr};

use crate::{
    config::WeaveConfig,
    weaver::batch::BatchWeaver,
    Error, Result,
};

/// File name of the socket inside the runtime directory.
pub const ENDPOINT_NAME: &str = "dotweave.injection.pipe";

const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Result byte sent back to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, FromRepr)]
#[repr(u8)]
pub enum ExitCode {
    /// Every assembly was woven
    Success = 0,
    /// The client could not reach the server in time
    ConnectionTimeout = 101,
    /// Weaving failed
    InjectionError = 102,
}

/// Path of the socket under `runtime_dir`.
#[must_use]
pub fn endpoint(runtime_dir: &Path) -> PathBuf {
    runtime_dir.join(ENDPOINT_NAME)
}

/// Handles the directory received from the client.
pub type Handler = Box<dyn FnOnce(&Path) -> Result<()> + Send>;

/// A server waiting for one notification on a background thread.
#[derive(Debug)]
pub struct RendezvousServer {
    endpoint: PathBuf,
    cancelled: Arc<AtomicBool>,
    worker: Option<JoinHandle<Result<Option<ExitCode>>>>,
}

impl RendezvousServer {
    /// Bind the endpoint under `runtime_dir` and start waiting for a client.
    ///
    /// A stale socket file left by an earlier server is replaced.
    ///
    /// # Errors
    /// Returns an error if the socket cannot be bound.
    pub fn start<F>(runtime_dir: &Path, handler: F) -> Result<Self>
    where
        F: FnOnce(&Path) -> Result<()> + Send + 'static,
    {
        let endpoint = endpoint(runtime_dir);
        if endpoint.exists() {
            std::fs::remove_file(&endpoint)?;
        }
        let listener = UnixListener::bind(&endpoint)?;
        listener.set_nonblocking(true)?;
        log::debug!("Waiting for a rendezvous on {}", endpoint.display());

        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&cancelled);
        let handler: Handler = Box::new(handler);
        let worker = thread::Builder::new()
            .name("dotweave-rendezvous".to_string())
            .spawn(move || serve_one(&listener, &flag, handler))?;

        Ok(RendezvousServer {
            endpoint,
            cancelled,
            worker: Some(worker),
        })
    }

    /// A server weaving every `*.dll` of the received directory with the records of `config`.
    ///
    /// # Errors
    /// Returns an error if the socket cannot be bound.
    pub fn weaving(config: WeaveConfig) -> Result<Self> {
        let runtime_dir = config.runtime_dir.clone();
        RendezvousServer::start(&runtime_dir, move |dir| weave_directory(&config, dir))
    }

    /// The socket path.
    #[must_use]
    pub fn endpoint(&self) -> &Path {
        &self.endpoint
    }

    /// Stop waiting.
    ///
    /// A client that connected but has not finished its request is dropped. A notification
    /// already being handled is completed.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// `true` once the server thread has exited.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.worker.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Wait for the server thread.
    ///
    /// Returns the exit code sent to the client, or `None` if the server was cancelled first.
    ///
    /// # Errors
    /// Returns the I/O error that ended the server, or [`Error::Rendezvous`] if it panicked.
    pub fn join(mut self) -> Result<Option<ExitCode>> {
        match self.worker.take() {
            Some(worker) => worker
                .join()
                .map_err(|_| Error::Rendezvous("server thread panicked".to_string()))?,
            None => Ok(None),
        }
    }
}

impl Drop for RendezvousServer {
    fn drop(&mut self) {
        self.cancel();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn serve_one(listener: &UnixListener, cancelled: &AtomicBool, handler: Handler) -> Result<Option<ExitCode>> {
    let result = accept_one(listener, cancelled, handler);
    if let Ok(address) = listener.local_addr() {
        if let Some(path) = address.as_pathname() {
            let _ = std::fs::remove_file(path);
        }
    }
    result
}

fn accept_one(listener: &UnixListener, cancelled: &AtomicBool, handler: Handler) -> Result<Option<ExitCode>> {
    let mut stream = loop {
        if cancelled.load(Ordering::SeqCst) {
            log::debug!("Rendezvous cancelled");
            return Ok(None);
        }
        match listener.accept() {
            Ok((stream, _)) => break stream,
            Err(e) if e.kind() == ErrorKind::WouldBlock => thread::sleep(POLL_INTERVAL),
            Err(e) => return Err(e.into()),
        }
    };
    stream.set_nonblocking(true)?;

    let Some(request) = read_request(&mut stream, cancelled)? else {
        log::debug!("Rendezvous cancelled while the client was connected");
        return Ok(None);
    };
    stream.set_nonblocking(false)?;
    let dir = PathBuf::from(
        String::from_utf8(request).map_err(|e| Error::Rendezvous(format!("path is not UTF-8: {e}")))?,
    );
    log::info!("Rendezvous for {}", dir.display());

    let code = match handler(&dir) {
        Ok(()) => ExitCode::Success,
        Err(e) => {
            log::error!("Weaving {} failed: {e}", dir.display());
            ExitCode::InjectionError
        }
    };
    stream.write_all(&[code as u8])?;
    stream.flush()?;
    Ok(Some(code))
}

/// Read up to the `0` terminator, giving up once `cancelled` is set.
fn read_request(stream: &mut UnixStream, cancelled: &AtomicBool) -> Result<Option<Vec<u8>>> {
    let mut request = Vec::new();
    let mut chunk = [0u8; 256];
    loop {
        if cancelled.load(Ordering::SeqCst) {
            return Ok(None);
        }
        match stream.read(&mut chunk) {
            Ok(0) => {
                return Err(Error::Rendezvous(
                    "client closed before the terminator".to_string(),
                ))
            }
            Ok(read) => {
                if let Some(end) = chunk[..read].iter().position(|b| *b == 0) {
                    request.extend_from_slice(&chunk[..end]);
                    return Ok(Some(request));
                }
                request.extend_from_slice(&chunk[..read]);
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => thread::sleep(POLL_INTERVAL),
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }
}

/// Weave every `*.dll` directly inside `dir` with the records of `config`.
///
/// The directory's assemblies are allowed in front of the configured allow-list.
///
/// # Errors
/// Returns an error if the directory or the records cannot be read, or if any assembly or
/// record failed.
pub fn weave_directory(config: &WeaveConfig, dir: &Path) -> Result<()> {
    let mut allowed: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_file() && path.extension().is_some_and(|e| e == "dll"))
        .collect();
    allowed.sort();
    allowed.extend(config.allowed_assemblies.iter().cloned());

    let weaver = BatchWeaver::new(allowed, config.backup_manager());
    let report = weaver.weave_records(&config.records()?);
    if report.is_success() {
        log::info!("Woven {} method(s) in {}", report.woven(), dir.display());
        Ok(())
    } else {
        Err(Error::Rendezvous(format!(
            "weaving {} failed for {} assembly(ies)",
            dir.display(),
            report
                .assemblies
                .iter()
                .filter(|a| !a.result.as_ref().is_ok_and(|o| o.is_success()))
                .count()
        )))
    }
}

/// Notify the server under `runtime_dir` that `dir` is ready and wait for its answer.
///
/// Returns [`ExitCode::ConnectionTimeout`] if no server accepts within `timeout`.
///
/// # Errors
/// Returns an I/O error if the exchange breaks off, or [`Error::Rendezvous`] for an unknown
/// answer.
pub fn notify(runtime_dir: &Path, dir: &Path, timeout: Duration) -> Result<ExitCode> {
    let endpoint = endpoint(runtime_dir);
    let deadline = Instant::now() + timeout;
    let mut stream = loop {
        match UnixStream::connect(&endpoint) {
            Ok(stream) => break stream,
            Err(e) if Instant::now() >= deadline => {
                log::warn!("No rendezvous server on {}: {e}", endpoint.display());
                return Ok(ExitCode::ConnectionTimeout);
            }
            Err(_) => thread::sleep(POLL_INTERVAL),
        }
    };

    let path = dir
        .to_str()
        .ok_or_else(|| Error::Rendezvous(format!("{} is not UTF-8", dir.display())))?;
    stream.write_all(path.as_bytes())?;
    stream.write_all(&[0])?;
    stream.flush()?;

    let mut answer = [0u8; 1];
    stream.read_exact(&mut answer)?;
    ExitCode::from_repr(answer[0])
        .ok_or_else(|| Error::Rendezvous(format!("unknown exit code {}", answer[0])))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn exit_codes() {
        assert_eq!(ExitCode::Success as u8, 0);
        assert_eq!(ExitCode::ConnectionTimeout as u8, 101);
        assert_eq!(ExitCode::InjectionError as u8, 102);
        assert_eq!(ExitCode::from_repr(102), Some(ExitCode::InjectionError));
        assert_eq!(ExitCode::from_repr(7), None);
    }

    #[test]
    fn path_is_delivered_and_answered() {
        let dir = tempfile::tempdir().unwrap();
        let received = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&received);
        let server = RendezvousServer::start(dir.path(), move |path| {
            *sink.lock().unwrap() = Some(path.to_path_buf());
            Ok(())
        })
        .unwrap();

        let code = notify(dir.path(), Path::new("/builds/out dir/Managed"), Duration::from_secs(5)).unwrap();
        assert_eq!(code, ExitCode::Success);
        assert_eq!(server.join().unwrap(), Some(ExitCode::Success));
        assert_eq!(
            received.lock().unwrap().as_deref(),
            Some(Path::new("/builds/out dir/Managed"))
        );
        assert!(!endpoint(dir.path()).exists());
    }

    #[test]
    fn handler_failure_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let server = RendezvousServer::start(dir.path(), |_| Err(Error::Synthesis("boom".to_string()))).unwrap();
        let code = notify(dir.path(), Path::new("out"), Duration::from_secs(5)).unwrap();
        assert_eq!(code, ExitCode::InjectionError);
        assert_eq!(server.join().unwrap(), Some(ExitCode::InjectionError));
    }

    #[test]
    fn missing_server_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let code = notify(dir.path(), Path::new("out"), Duration::from_millis(100)).unwrap();
        assert_eq!(code, ExitCode::ConnectionTimeout);
    }

    #[test]
    fn cancellation_closes_the_endpoint() {
        let dir = tempfile::tempdir().unwrap();
        let server = RendezvousServer::start(dir.path(), |_| Ok(())).unwrap();
        assert!(endpoint(dir.path()).exists());
        server.cancel();
        assert_eq!(server.join().unwrap(), None);
        assert!(!endpoint(dir.path()).exists());
    }

    #[test]
    fn cancellation_drops_a_silent_client() {
        let dir = tempfile::tempdir().unwrap();
        let server = RendezvousServer::start(dir.path(), |_| Ok(())).unwrap();
        let _client = UnixStream::connect(endpoint(dir.path())).unwrap();
        thread::sleep(POLL_INTERVAL * 4);
        assert!(!server.is_finished());

        server.cancel();
        let deadline = Instant::now() + Duration::from_secs(5);
        while !server.is_finished() && Instant::now() < deadline {
            thread::sleep(POLL_INTERVAL);
        }
        assert!(server.is_finished());
        assert_eq!(server.join().unwrap(), None);
        assert!(!endpoint(dir.path()).exists());
    }

    #[test]
    fn dropping_the_server_does_not_wait_for_a_silent_client() {
        let dir = tempfile::tempdir().unwrap();
        let server = RendezvousServer::start(dir.path(), |_| Ok(())).unwrap();
        let _client = UnixStream::connect(endpoint(dir.path())).unwrap();
        thread::sleep(POLL_INTERVAL * 4);

        let started = Instant::now();
        drop(server);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn truncated_request_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let server = RendezvousServer::start(dir.path(), |_| Ok(())).unwrap();
        let mut client = UnixStream::connect(endpoint(dir.path())).unwrap();
        client.write_all(b"/no/terminator").unwrap();
        drop(client);
        assert!(matches!(server.join(), Err(Error::Rendezvous(_))));
    }
}

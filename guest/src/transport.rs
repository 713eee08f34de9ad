//! Transport over a virtio-serial character device.
//!
//! The device is opened non-blocking and driven through [`AsyncFd`], so reads
//! wait on epoll readiness and can be abandoned by a timeout or `select!`
//! without leaving a thread stuck in the kernel.

use async_trait::async_trait;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use parley_core::config::BusyRetry;
use parley_core::{Transport, TransportError};
use std::fs::{File, OpenOptions};
use std::future::Future;
use std::io::{Read, Write};
use std::os::fd::{AsFd, AsRawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::unix::AsyncFd;

const READ_CHUNK: usize = 64 * 1024;

fn is_busy(error: &std::io::Error) -> bool {
    error.raw_os_error() == Some(libc::EBUSY)
}

/// Run `operation` until it stops failing with `EBUSY`, at most
/// `policy.attempts` times with `policy.delay` in between.
pub async fn retry_on_busy<T, F, Fut>(policy: BusyRetry, mut operation: F) -> Result<T, TransportError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::io::Result<T>>,
{
    let attempts = policy.attempts.max(1);
    let mut attempt = 1;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if is_busy(&e) => {
                if attempt >= attempts {
                    tracing::warn!("Device still busy after {} attempts", attempt);
                    return Err(TransportError::Busy { attempts: attempt });
                }
                tracing::debug!(
                    "Device busy (attempt {}/{}), retrying in {:?}",
                    attempt,
                    attempts,
                    policy.delay
                );
                tokio::time::sleep(policy.delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// Non-blocking reads and writes on an open port.
pub trait Port: AsRawFd + AsFd + Send + Sync + 'static {
    fn read_some(&self, buf: &mut [u8]) -> std::io::Result<usize>;
    fn write_some(&self, data: &[u8]) -> std::io::Result<usize>;
}

impl Port for File {
    fn read_some(&self, buf: &mut [u8]) -> std::io::Result<usize> {
        let mut file: &File = self;
        file.read(buf)
    }

    fn write_some(&self, data: &[u8]) -> std::io::Result<usize> {
        let mut file: &File = self;
        file.write(data)
    }
}

pub struct CharacterDevice<P: Port = File> {
    fd: Option<AsyncFd<P>>,
    path: PathBuf,
    label: String,
    retry: BusyRetry,
}

impl CharacterDevice<File> {
    pub async fn open(path: &Path, retry: BusyRetry) -> Result<Self, TransportError> {
        tracing::debug!("Opening {}", path.display());
        let file = retry_on_busy(retry, move || async move {
            OpenOptions::new()
                .read(true)
                .write(true)
                .custom_flags(libc::O_NONBLOCK)
                .open(path)
        })
        .await?;

        Self::from_port(file, path, retry)
    }
}

impl<P: Port> CharacterDevice<P> {
    /// Wrap a port that is already open in non-blocking mode.
    pub fn from_port(port: P, path: &Path, retry: BusyRetry) -> Result<Self, TransportError> {
        Ok(Self {
            fd: Some(AsyncFd::new(port)?),
            path: path.to_path_buf(),
            label: format!("character device {}", path.display()),
            retry,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether QEMU has a client on the host side of the port.
    ///
    /// virtio_console reports POLLHUP while the host end is unconnected.
    pub fn is_host_connected(&self) -> Result<bool, TransportError> {
        let fd = self.fd.as_ref().ok_or(TransportError::Closed)?;
        let mut fds = [PollFd::new(fd.get_ref().as_fd(), PollFlags::POLLIN)];
        poll(&mut fds, PollTimeout::ZERO).map_err(std::io::Error::from)?;
        let hangup = fds[0]
            .revents()
            .is_some_and(|events| events.contains(PollFlags::POLLHUP));
        Ok(!hangup)
    }

    async fn read_chunk(&self) -> std::io::Result<Vec<u8>> {
        let Some(fd) = self.fd.as_ref() else {
            return Err(std::io::ErrorKind::NotConnected.into());
        };
        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            let mut guard = fd.readable().await?;
            match guard.try_io(|inner| inner.get_ref().read_some(&mut buf)) {
                Ok(Ok(n)) => {
                    buf.truncate(n);
                    return Ok(buf);
                }
                Ok(Err(e)) => return Err(e),
                Err(_would_block) => continue,
            }
        }
    }

    async fn write_all(&self, mut data: &[u8]) -> std::io::Result<()> {
        let Some(fd) = self.fd.as_ref() else {
            return Err(std::io::ErrorKind::NotConnected.into());
        };
        while !data.is_empty() {
            let mut guard = fd.writable().await?;
            match guard.try_io(|inner| inner.get_ref().write_some(data)) {
                Ok(Ok(0)) => return Err(std::io::ErrorKind::WriteZero.into()),
                Ok(Ok(n)) => data = &data[n..],
                Ok(Err(e)) => return Err(e),
                Err(_would_block) => continue,
            }
        }
        Ok(())
    }
}

#[async_trait]
impl<P: Port> Transport for CharacterDevice<P> {
    async fn send(&mut self, data: &[u8]) -> Result<(), TransportError> {
        if self.fd.is_none() {
            return Err(TransportError::Closed);
        }
        tracing::trace!("Writing {} bytes to {}", data.len(), self.label);
        self.write_all(data).await?;
        Ok(())
    }

    async fn receive(&mut self, timeout: Option<Duration>) -> Result<Vec<u8>, TransportError> {
        if self.fd.is_none() {
            return Err(TransportError::Closed);
        }
        let device = &*self;
        let read = retry_on_busy(device.retry, move || device.read_chunk());
        let data = match timeout {
            Some(limit) => tokio::time::timeout(limit, read)
                .await
                .map_err(|_| TransportError::Timeout)??,
            None => read.await?,
        };
        if data.is_empty() {
            return Err(TransportError::Closed);
        }
        tracing::trace!("Read {} bytes from {}", data.len(), self.label);
        Ok(data)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if self.fd.take().is_some() {
            tracing::debug!("Closed {}", self.label);
        }
        Ok(())
    }

    fn label(&self) -> &str {
        &self.label
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::stat::Mode;
    use nix::unistd::mkfifo;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::TempDir;

    fn busy() -> std::io::Error {
        std::io::Error::from_raw_os_error(libc::EBUSY)
    }

    fn policy(attempts: u32) -> BusyRetry {
        BusyRetry {
            attempts,
            delay: Duration::from_millis(100),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_busy_then_success() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result = retry_on_busy(policy(10), move || async move {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n < 10 { Err(busy()) } else { Ok(n) }
        })
        .await;
        assert_eq!(result.unwrap(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_busy_exhausts_attempts() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<(), _> = retry_on_busy(policy(10), move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(busy())
        })
        .await;
        assert!(matches!(result, Err(TransportError::Busy { attempts: 10 })));
        assert_eq!(counter.load(Ordering::SeqCst), 10);
    }

    #[tokio::test]
    async fn test_other_errors_are_not_retried() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<(), _> = retry_on_busy(policy(10), move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(std::io::Error::from_raw_os_error(libc::EIO))
        })
        .await;
        assert!(matches!(result, Err(TransportError::Io(_))));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    /// A FIFO opened read-write loops back whatever is written to it.
    fn fifo(dir: &TempDir) -> PathBuf {
        let path = dir.path().join("vport0p1");
        mkfifo(&path, Mode::S_IRUSR | Mode::S_IWUSR).unwrap();
        path
    }

    #[tokio::test]
    async fn test_device_send_and_receive() {
        let dir = TempDir::new().unwrap();
        let path = fifo(&dir);
        let mut device = CharacterDevice::open(&path, BusyRetry::default())
            .await
            .unwrap();
        assert!(device.is_host_connected().unwrap());

        device.send(b"12\n{\"id\":\"x\"}").await.unwrap();
        let data = device.receive(Some(Duration::from_secs(1))).await.unwrap();
        assert_eq!(data, b"12\n{\"id\":\"x\"}");
    }

    #[tokio::test]
    async fn test_device_receive_times_out() {
        let dir = TempDir::new().unwrap();
        let path = fifo(&dir);
        let mut device = CharacterDevice::open(&path, BusyRetry::default())
            .await
            .unwrap();

        let result = device.receive(Some(Duration::from_millis(50))).await;
        assert!(matches!(result, Err(TransportError::Timeout)));
    }

    #[tokio::test]
    async fn test_closed_device_rejects_io() {
        let dir = TempDir::new().unwrap();
        let path = fifo(&dir);
        let mut device = CharacterDevice::open(&path, BusyRetry::default())
            .await
            .unwrap();
        device.close().await.unwrap();
        assert!(matches!(device.send(b"x").await, Err(TransportError::Closed)));
        assert!(matches!(
            device.receive(None).await,
            Err(TransportError::Closed)
        ));
    }

    /// Loopback port whose first reads fail with `EBUSY`.
    struct BusyPort {
        file: File,
        busy_reads: AtomicU32,
    }

    impl AsRawFd for BusyPort {
        fn as_raw_fd(&self) -> std::os::fd::RawFd {
            self.file.as_raw_fd()
        }
    }

    impl AsFd for BusyPort {
        fn as_fd(&self) -> std::os::fd::BorrowedFd<'_> {
            self.file.as_fd()
        }
    }

    impl Port for BusyPort {
        fn read_some(&self, buf: &mut [u8]) -> std::io::Result<usize> {
            let left = self.busy_reads.load(Ordering::SeqCst);
            if left > 0 {
                self.busy_reads.store(left - 1, Ordering::SeqCst);
                return Err(busy());
            }
            self.file.read_some(buf)
        }

        fn write_some(&self, data: &[u8]) -> std::io::Result<usize> {
            self.file.write_some(data)
        }
    }

    fn busy_device(path: &Path, busy_reads: u32) -> CharacterDevice<BusyPort> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(path)
            .unwrap();
        let port = BusyPort {
            file,
            busy_reads: AtomicU32::new(busy_reads),
        };
        let retry = BusyRetry {
            attempts: 10,
            delay: Duration::from_millis(1),
        };
        CharacterDevice::from_port(port, path, retry).unwrap()
    }

    #[tokio::test]
    async fn test_receive_retries_busy_reads() {
        let dir = TempDir::new().unwrap();
        let path = fifo(&dir);
        let mut device = busy_device(&path, 9);

        device.send(b"hello").await.unwrap();
        let data = device.receive(Some(Duration::from_secs(1))).await.unwrap();
        assert_eq!(data, b"hello");
    }

    #[tokio::test]
    async fn test_receive_gives_up_when_always_busy() {
        let dir = TempDir::new().unwrap();
        let path = fifo(&dir);
        let mut device = busy_device(&path, 10);

        device.send(b"hello").await.unwrap();
        let result = device.receive(Some(Duration::from_secs(1))).await;
        assert!(matches!(result, Err(TransportError::Busy { attempts: 10 })));
    }

    #[tokio::test]
    async fn test_open_missing_device() {
        let dir = TempDir::new().unwrap();
        let result = CharacterDevice::open(&dir.path().join("absent"), BusyRetry::default()).await;
        assert!(matches!(result, Err(TransportError::Io(_))));
    }
}

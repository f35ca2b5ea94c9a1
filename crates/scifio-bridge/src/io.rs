//! Host-facing image reader/writer backed by one worker process.
//!
//! The worker is started lazily and replaced whenever it is lost. Errors
//! that leave the pipes in an unknown state tear the worker down before they
//! are returned; the next call starts a fresh one. A read session survives a
//! restart: the file and series are opened again by the next call that reads
//! from them. A write session does not survive.

use std::path::{Path, PathBuf};

use crate::config::BridgeConfig;
use crate::descriptor::{ImageDescriptor, RegionRequest};
use crate::error::{BridgeError, Result};
use crate::supervisor::{ProcessSupervisor, WorkerProtocol, WorkerReady};
use crate::version::VersionInfo;

#[derive(Debug, Clone, PartialEq)]
enum Session {
    Idle,
    Reading { path: PathBuf, series: usize },
    Writing { path: PathBuf },
}

pub struct ScifioImageIO {
    config: BridgeConfig,
    worker: Option<WorkerReady>,
    session: Session,
}

impl ScifioImageIO {
    pub fn new(config: BridgeConfig) -> Self {
        Self {
            config,
            worker: None,
            session: Session::Idle,
        }
    }

    pub fn from_env() -> Self {
        Self::new(BridgeConfig::from_env())
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Start the worker now instead of on first use.
    pub async fn open(&mut self) -> Result<()> {
        self.worker().await.map(|_| ())
    }

    pub async fn can_read(&mut self, path: &Path) -> Result<bool> {
        let result = self.worker().await?.can_read(path).await;
        self.check(result).await
    }

    pub async fn can_write(&mut self, path: &Path) -> Result<bool> {
        let result = self.worker().await?.can_write(path).await;
        self.check(result).await
    }

    /// Open `path` for reading; series 0 becomes current.
    ///
    /// An open write session is closed (and its file flushed) first.
    pub async fn read_image_information(&mut self, path: &Path) -> Result<ImageDescriptor> {
        self.end_session().await?;
        let result = self.worker().await?.describe(path).await.cloned();
        let descriptor = self.check(result).await?;
        self.session = Session::Reading {
            path: path.to_path_buf(),
            series: 0,
        };
        Ok(descriptor)
    }

    pub async fn select_series(&mut self, index: usize) -> Result<ImageDescriptor> {
        if !matches!(self.session, Session::Reading { .. }) {
            return Err(BridgeError::NotOpen(
                "read image information before selecting a series".to_string(),
            ));
        }
        let result = self.session_worker().await?.select_series(index).await.cloned();
        let descriptor = self.check(result).await?;
        if let Session::Reading { series, .. } = &mut self.session {
            *series = index;
        }
        Ok(descriptor)
    }

    /// Descriptor of the current read or write session.
    pub fn descriptor(&self) -> Option<&ImageDescriptor> {
        self.worker.as_ref().and_then(|w| w.protocol.descriptor())
    }

    /// Host-order pixels of `region`, native byte order.
    pub async fn read_region(&mut self, region: &RegionRequest) -> Result<Vec<u8>> {
        if !matches!(self.session, Session::Reading { .. }) {
            return Err(BridgeError::NotOpen(
                "read image information before reading pixels".to_string(),
            ));
        }
        let result = self.session_worker().await?.read_region(region).await;
        self.check(result).await
    }

    /// The whole current series.
    pub async fn read_image(&mut self) -> Result<Vec<u8>> {
        if !matches!(self.session, Session::Reading { .. }) {
            return Err(BridgeError::NotOpen(
                "read image information before reading pixels".to_string(),
            ));
        }
        let region = match self.session_worker().await?.descriptor() {
            Some(descriptor) => descriptor.full_region(),
            None => {
                return Err(BridgeError::NotOpen(
                    "read image information before reading pixels".to_string(),
                ));
            }
        };
        self.read_region(&region).await
    }

    /// Create `path` with the given geometry and start a write session.
    ///
    /// A previous write session is closed first so its file is flushed.
    pub async fn write_image_information(
        &mut self,
        path: &Path,
        descriptor: &ImageDescriptor,
    ) -> Result<()> {
        self.end_session().await?;
        let result = self.worker().await?.create(path, descriptor).await;
        self.check(result).await?;
        self.session = Session::Writing {
            path: path.to_path_buf(),
        };
        Ok(())
    }

    /// Write host-order, native-endian pixels of `region`.
    pub async fn write_region(&mut self, region: &RegionRequest, pixels: &[u8]) -> Result<()> {
        if !matches!(self.session, Session::Writing { .. }) {
            return Err(BridgeError::NotOpen(
                "write image information before writing pixels".to_string(),
            ));
        }
        let result = self.worker().await?.write_region(region, pixels).await;
        self.check(result).await
    }

    /// Finish the session and stop the worker. Safe to call repeatedly.
    ///
    /// For a write session the worker's reply to `close` is what confirms
    /// the file was flushed, so its error is returned after the worker is
    /// stopped.
    pub async fn close(&mut self) -> Result<()> {
        let session = std::mem::replace(&mut self.session, Session::Idle);
        let Some(mut worker) = self.worker.take() else {
            return Ok(());
        };

        let result = if worker.supervisor.is_alive() {
            worker.protocol.close().await
        } else {
            Ok(())
        };
        if let Err(e) = &result {
            tracing::warn!(error = %e, session = ?session, "Worker failed to close session");
        }

        let WorkerReady {
            mut supervisor,
            protocol,
            ..
        } = worker;
        drop(protocol);
        supervisor.stop().await;
        result
    }

    /// Bytes of header before pixel data. Always 0: the worker decodes the
    /// whole file.
    pub fn header_size(&self) -> u64 {
        0
    }

    pub fn version(&self) -> VersionInfo {
        VersionInfo::from_handshake(self.worker.as_ref().and_then(|w| w.version.clone()))
    }

    pub fn worker_pid(&self) -> Option<u32> {
        self.worker.as_ref().and_then(|w| w.supervisor.pid())
    }

    /// Live worker protocol, starting or restarting the worker as needed.
    ///
    /// Does not reopen anything; see [`Self::session_worker`].
    async fn worker(&mut self) -> Result<&mut WorkerProtocol> {
        if let Some(worker) = self.worker.as_mut()
            && !worker.supervisor.is_alive()
        {
            tracing::warn!(
                pid = ?worker.supervisor.pid(),
                status = ?worker.supervisor.exit_status(),
                "Worker died between commands, restarting"
            );
            self.teardown().await;
        }

        if self.worker.is_none() {
            self.worker = Some(ProcessSupervisor::start(&self.config).await?);
        }

        match self.worker.as_mut() {
            Some(worker) => Ok(&mut worker.protocol),
            None => Err(BridgeError::NotOpen("worker is not running".to_string())),
        }
    }

    /// Live worker with the current read session open on it.
    ///
    /// A replacement worker starts with nothing open, so the session's file
    /// and series are described again before the caller's command.
    async fn session_worker(&mut self) -> Result<&mut WorkerProtocol> {
        let reopen_needed = !self.worker().await?.is_reading();
        if reopen_needed && let Session::Reading { path, series } = self.session.clone() {
            tracing::info!(path = %path.display(), series, "Reopening image on new worker");
            let result = self.reopen(&path, series).await;
            if let Err(e) = self.check(result).await {
                self.session = Session::Idle;
                return Err(e);
            }
        }
        self.worker().await
    }

    /// Close a write session so the worker flushes its file, and forget any
    /// read session.
    async fn end_session(&mut self) -> Result<()> {
        let Session::Writing { path } = std::mem::replace(&mut self.session, Session::Idle)
        else {
            return Ok(());
        };
        let Some(worker) = self.worker.as_mut() else {
            return Ok(());
        };
        if !worker.supervisor.is_alive() {
            tracing::warn!(path = %path.display(), "Write session lost with its worker");
            return Ok(());
        }
        tracing::debug!(path = %path.display(), "Closing write session");
        let result = worker.protocol.close().await;
        self.check(result).await
    }

    async fn reopen(&mut self, path: &Path, series: usize) -> Result<()> {
        let Some(worker) = self.worker.as_mut() else {
            return Err(BridgeError::NotOpen("worker is not running".to_string()));
        };
        worker.protocol.describe(path).await?;
        if series > 0 {
            worker.protocol.select_series(series).await?;
        }
        Ok(())
    }

    /// Pass `result` through, tearing the worker down first if the error
    /// leaves it unusable.
    async fn check<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result
            && e.is_fatal_to_worker()
        {
            tracing::warn!(error = %e, "Tearing down worker after fatal error");
            self.teardown().await;
        }
        result
    }

    async fn teardown(&mut self) {
        if let Some(WorkerReady {
            mut supervisor,
            protocol,
            ..
        }) = self.worker.take()
        {
            drop(protocol);
            supervisor.stop().await;
        }
        if let Session::Writing { path } = &self.session {
            tracing::warn!(path = %path.display(), "Write session lost with its worker");
            self.session = Session::Idle;
        }
    }
}

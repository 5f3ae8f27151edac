//! Disk backup of discovered snapshots.
//!
//! Reads happen inline on the caller's thread. Writes, deletes and sync-time
//! touches are queued to a dedicated persist reactor, retried on failure, and
//! superseded by any later write to the same file.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::Path;
use std::path::PathBuf;
use std::time::Instant;
use std::time::SystemTime;

#[cfg(test)]
use mockall::automock;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::constants::BACKUP_FILE_EXTENSION;
use crate::constants::BACKUP_FILE_PREFIX;
use crate::metrics::PERSIST_FAILURES;
use crate::reactor::Reactor;
use crate::reactor::ReactorHandle;
use crate::reactor::ReactorThread;
use crate::reactor::Scheduler;
use crate::DataType;
use crate::PersistConfig;
use crate::PersistError;
use crate::Result;
use crate::ServiceData;
use crate::ServiceKey;

#[cfg_attr(test, automock)]
pub trait CachePersist: Send + Sync + 'static {
    /// Backup of (`key`, `data_type`) as an `InitFromDisk` snapshot.
    fn load_service_data(
        &self,
        key: &ServiceKey,
        data_type: DataType,
    ) -> Option<ServiceData>;

    /// Replaces the backup with `json`. An empty payload deletes it.
    fn persist_service_data(
        &self,
        key: &ServiceKey,
        data_type: DataType,
        json: String,
    );

    /// Records that the server confirmed the backup is current.
    fn update_sync_time(
        &self,
        key: &ServiceKey,
        data_type: DataType,
    );
}

/// Persistence switched off.
#[derive(Debug, Default)]
pub struct NoopPersist;

impl CachePersist for NoopPersist {
    fn load_service_data(
        &self,
        _key: &ServiceKey,
        _data_type: DataType,
    ) -> Option<ServiceData> {
        None
    }

    fn persist_service_data(
        &self,
        _key: &ServiceKey,
        _data_type: DataType,
        _json: String,
    ) {
    }

    fn update_sync_time(
        &self,
        _key: &ServiceKey,
        _data_type: DataType,
    ) {
    }
}

/// `svc#{namespace}#{name}#{suffix}.json`, both names url-encoded.
pub fn backup_file_name(
    key: &ServiceKey,
    data_type: DataType,
) -> String {
    let namespace: String = url::form_urlencoded::byte_serialize(key.namespace.as_bytes()).collect();
    let name: String = url::form_urlencoded::byte_serialize(key.name.as_bytes()).collect();
    format!(
        "{BACKUP_FILE_PREFIX}#{namespace}#{name}#{}.{BACKUP_FILE_EXTENSION}",
        data_type.file_suffix()
    )
}

/// State of the persist reactor.
pub struct PersistWorker {
    config: PersistConfig,
    next_seq: u64,
    /// Sequence of the newest write accepted per file
    latest: HashMap<PathBuf, u64>,
}

impl PersistWorker {
    pub(crate) fn new(config: PersistConfig) -> Self {
        Self {
            config,
            next_seq: 0,
            latest: HashMap::new(),
        }
    }

    pub(crate) fn accept_write(
        &mut self,
        sched: &mut Scheduler<PersistWorker>,
        path: PathBuf,
        data_type: DataType,
        content: String,
    ) {
        self.next_seq += 1;
        let seq = self.next_seq;
        self.latest.insert(path.clone(), seq);
        self.write(sched, path, data_type, content, seq, 1);
    }

    fn write(
        &mut self,
        sched: &mut Scheduler<PersistWorker>,
        path: PathBuf,
        data_type: DataType,
        content: String,
        seq: u64,
        attempt: u32,
    ) {
        if self.latest.get(&path) != Some(&seq) {
            debug!(path = %path.display(), seq, "write superseded by a newer one");
            return;
        }
        match write_file(&path, &content) {
            Ok(()) => {
                self.latest.remove(&path);
                debug!(path = %path.display(), deleted = content.is_empty(), "backup written");
            }
            Err(e) if attempt < self.config.max_write_retry => {
                warn!(path = %path.display(), attempt, error = %e, "backup write failed, retrying");
                sched.add_timing_task(
                    self.config.retry_interval(),
                    move |worker: &mut PersistWorker, sched| {
                        worker.write(sched, path, data_type, content, seq, attempt + 1)
                    },
                );
            }
            Err(e) => {
                self.latest.remove(&path);
                PERSIST_FAILURES
                    .with_label_values(&[data_type.as_str()])
                    .inc();
                warn!(path = %path.display(), attempt, error = %e, "backup write given up");
            }
        }
    }

    fn touch(
        &mut self,
        path: PathBuf,
    ) {
        let result = fs::File::options()
            .write(true)
            .open(&path)
            .and_then(|file| file.set_modified(SystemTime::now()));
        match result {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %path.display(), error = %e, "update backup sync time failed"),
        }
    }
}

/// Writes through a temporary file so readers never see a partial backup.
fn write_file(
    path: &Path,
    content: &str,
) -> io::Result<()> {
    if content.is_empty() {
        return match fs::remove_file(path) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        };
    }
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, content)?;
    fs::rename(&tmp, path)
}

/// File backed [`CachePersist`] with its own writer thread.
pub struct FilePersist {
    config: PersistConfig,
    worker: ReactorThread<PersistWorker>,
    handle: ReactorHandle<PersistWorker>,
}

impl FilePersist {
    pub fn new(config: PersistConfig) -> Result<Self> {
        fs::create_dir_all(&config.dir).map_err(|source| PersistError::Path {
            path: config.dir.clone(),
            source,
        })?;
        let worker = Reactor::new(PersistWorker::new(config.clone())).spawn("polaris-persist")?;
        let handle = worker.handle();
        info!(dir = %config.dir.display(), "file persist started");
        Ok(Self {
            config,
            worker,
            handle,
        })
    }

    pub fn file_path(
        &self,
        key: &ServiceKey,
        data_type: DataType,
    ) -> PathBuf {
        self.config.dir.join(backup_file_name(key, data_type))
    }

    /// Stops the writer thread. Queued writes are dropped.
    pub fn stop(&self) {
        self.worker.stop_and_join();
    }

    fn read_backup(
        &self,
        path: &Path,
        key: &ServiceKey,
        data_type: DataType,
    ) -> Result<Option<ServiceData>> {
        let json = match fs::read_to_string(path) {
            Ok(json) => json,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(PersistError::Path {
                    path: path.to_path_buf(),
                    source,
                }
                .into())
            }
        };
        let age = fs::metadata(path)?
            .modified()?
            .elapsed()
            .unwrap_or_default();
        let now = Instant::now();
        let available_time = if age > self.config.available_time() {
            now + self.config.upgrade_wait()
        } else {
            now
        };
        let data = ServiceData::from_json(&json, available_time)?;
        if data.key() != key || data.data_type() != data_type {
            warn!(path = %path.display(), found = %data.key(), "backup belongs to another service");
            return Ok(None);
        }
        Ok(Some(data))
    }
}

impl CachePersist for FilePersist {
    fn load_service_data(
        &self,
        key: &ServiceKey,
        data_type: DataType,
    ) -> Option<ServiceData> {
        let path = self.file_path(key, data_type);
        match self.read_backup(&path, key, data_type) {
            Ok(Some(data)) => {
                info!(
                    service = %key,
                    data_type = %data_type,
                    revision = %data.revision(),
                    available = data.is_available(),
                    "backup loaded"
                );
                Some(data)
            }
            Ok(None) => None,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "backup unreadable, ignored");
                None
            }
        }
    }

    fn persist_service_data(
        &self,
        key: &ServiceKey,
        data_type: DataType,
        json: String,
    ) {
        let path = self.file_path(key, data_type);
        let submitted = self.handle.submit_task(move |worker: &mut PersistWorker, sched| {
            worker.accept_write(sched, path, data_type, json)
        });
        if !submitted {
            debug!(service = %key, data_type = %data_type, "persist worker stopped, write dropped");
        }
    }

    fn update_sync_time(
        &self,
        key: &ServiceKey,
        data_type: DataType,
    ) {
        let path = self.file_path(key, data_type);
        self.handle
            .submit_task(move |worker: &mut PersistWorker, _| worker.touch(path));
    }
}

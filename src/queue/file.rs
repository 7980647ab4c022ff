//! Directory-backed queue: one JSON document per entry.
//!
//! Layout: `<root>/<queue name>/<id, zero padded>.json`. Documents are written
//! to a temp file, synced and renamed into place, so an entry is either fully
//! present or absent after a crash. Sorting file names gives FIFO order.
//! Documents that cannot be decoded are renamed to `*.json.corrupt` and leave
//! the queue.

use super::{EntryId, QueueEntry, RetryQueue, unix_millis};
use crate::{
    Error,
    request::{Credentials, InterceptedRequest, RedirectPolicy, RequestMode},
};
use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD as B64};
use http::{HeaderMap, HeaderName, HeaderValue, Method};
use serde::{Deserialize, Serialize};
use std::{
    error::Error as StdError,
    io,
    path::{Path, PathBuf},
    time::SystemTime,
};
use tokio::{fs, io::AsyncWriteExt, sync::Mutex};
use url::Url;

const FORMAT_VERSION: u32 = 1;
const EXTENSION: &str = "json";
const TMP_SUFFIX: &str = ".tmp";
const CORRUPT_SUFFIX: &str = ".corrupt";

#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
enum StoredHeaderValue {
    Text(String),
    Bytes(Vec<u8>),
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredEntry {
    version: u32,
    id: u64,
    enqueued_at: u64,
    url: String,
    method: String,
    headers: Vec<(String, StoredHeaderValue)>,
    mode: RequestMode,
    credentials: Credentials,
    referrer: Option<String>,
    redirect: RedirectPolicy,
    /// Base64 of the raw body.
    body: String,
}

impl StoredEntry {
    fn from_entry(entry: &QueueEntry) -> Self {
        let req = &entry.request;
        let headers = req
            .headers
            .iter()
            .map(|(name, value)| {
                let value = match value.to_str() {
                    Ok(text) => StoredHeaderValue::Text(text.to_owned()),
                    Err(_) => StoredHeaderValue::Bytes(value.as_bytes().to_vec()),
                };
                (name.as_str().to_owned(), value)
            })
            .collect();

        Self {
            version: FORMAT_VERSION,
            id: entry.id.0,
            enqueued_at: entry.enqueued_at,
            url: req.url.to_string(),
            method: req.method.to_string(),
            headers,
            mode: req.mode,
            credentials: req.credentials,
            referrer: req.referrer.as_ref().map(Url::to_string),
            redirect: req.redirect,
            body: B64.encode(&req.body),
        }
    }

    fn into_entry(self) -> Result<QueueEntry, Box<dyn StdError + Send + Sync>> {
        if self.version != FORMAT_VERSION {
            return Err(format!("unsupported entry format version {}", self.version).into());
        }

        let mut headers = HeaderMap::with_capacity(self.headers.len());
        for (name, value) in self.headers {
            let name = HeaderName::from_bytes(name.as_bytes())?;
            let value = match value {
                StoredHeaderValue::Text(text) => HeaderValue::from_str(&text)?,
                StoredHeaderValue::Bytes(bytes) => HeaderValue::from_bytes(&bytes)?,
            };
            headers.append(name, value);
        }

        let referrer = self.referrer.as_deref().map(Url::parse).transpose()?;

        Ok(QueueEntry {
            id: EntryId(self.id),
            enqueued_at: self.enqueued_at,
            request: InterceptedRequest {
                url: Url::parse(&self.url)?,
                method: Method::from_bytes(self.method.as_bytes())?,
                headers,
                mode: self.mode,
                credentials: self.credentials,
                referrer,
                redirect: self.redirect,
                body: B64.decode(self.body.as_bytes())?.into(),
            },
        })
    }
}

pub struct FileQueue {
    name: String,
    dir: PathBuf,
    next_id: Mutex<u64>,
    #[cfg(test)]
    fail_dir_sync: std::sync::atomic::AtomicBool,
}

impl FileQueue {
    /// Open (or create) queue `name` under `root`, recovering the sequence
    /// from entries left by a previous run.
    pub async fn open(root: impl AsRef<Path>, name: impl Into<String>) -> Result<Self, Error> {
        let name = name.into();
        if name.is_empty()
            || !name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(Error::invalid_config(
                "queue name must be non-empty and only contain [A-Za-z0-9_-]",
            ));
        }

        let dir = root.as_ref().join(&name);
        fs::create_dir_all(&dir)
            .await
            .map_err(|err| Error::storage("failed to create queue directory", Some(dir.clone()), err))?;

        let mut next_id = 0;
        let mut listing = fs::read_dir(&dir)
            .await
            .map_err(|err| Error::storage("failed to list queue directory", Some(dir.clone()), err))?;
        while let Some(item) = listing
            .next_entry()
            .await
            .map_err(|err| Error::storage("failed to list queue directory", Some(dir.clone()), err))?
        {
            let path = item.path();
            let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if file_name.ends_with(TMP_SUFFIX) {
                // Interrupted write: never acknowledged, never visible.
                let _ = fs::remove_file(&path).await;
                continue;
            }
            // Quarantined documents still hold their id.
            let live_name = file_name.strip_suffix(CORRUPT_SUFFIX).unwrap_or(file_name);
            if let Some(id) = parse_entry_file_name(live_name) {
                next_id = next_id.max(id + 1);
            }
        }

        Ok(Self {
            name,
            dir,
            next_id: Mutex::new(next_id),
            #[cfg(test)]
            fail_dir_sync: std::sync::atomic::AtomicBool::new(false),
        })
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn entry_path(&self, id: EntryId) -> PathBuf {
        self.dir.join(format!("{:020}.{EXTENSION}", id.0))
    }

    async fn write_durably(&self, path: &Path, bytes: &[u8]) -> io::Result<()> {
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(TMP_SUFFIX);
        let tmp = PathBuf::from(tmp);

        let mut file = fs::File::create(&tmp).await?;
        file.write_all(bytes).await?;
        file.sync_all().await?;
        drop(file);

        if let Err(err) = fs::rename(&tmp, path).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(err);
        }
        // A failed store must leave nothing behind for `entries` to find.
        if let Err(err) = self.sync_dir().await {
            let _ = fs::remove_file(path).await;
            return Err(err);
        }
        Ok(())
    }

    async fn sync_dir(&self) -> io::Result<()> {
        #[cfg(test)]
        if self.fail_dir_sync.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(io::Error::other("directory sync failed"));
        }
        sync_dir(&self.dir).await
    }

    async fn quarantine(&self, path: &Path) -> Result<(), Error> {
        let mut aside = path.as_os_str().to_owned();
        aside.push(CORRUPT_SUFFIX);
        match fs::rename(path, PathBuf::from(aside)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(Error::storage(
                "failed to move unreadable queue entry aside",
                Some(path.to_path_buf()),
                err,
            )),
        }
    }

    async fn list_ids(&self) -> Result<Vec<u64>, Error> {
        let list_err =
            |err| Error::storage("failed to list queue directory", Some(self.dir.clone()), err);
        let mut ids = Vec::new();
        let mut listing = fs::read_dir(&self.dir).await.map_err(list_err)?;
        while let Some(item) = listing.next_entry().await.map_err(list_err)? {
            if let Some(id) = item.file_name().to_str().and_then(parse_entry_file_name) {
                ids.push(id);
            }
        }
        ids.sort_unstable();
        Ok(ids)
    }
}

fn parse_entry_file_name(file_name: &str) -> Option<u64> {
    file_name
        .strip_suffix(EXTENSION)?
        .strip_suffix('.')?
        .parse()
        .ok()
}

#[cfg(unix)]
async fn sync_dir(dir: &Path) -> io::Result<()> {
    fs::File::open(dir).await?.sync_all().await
}

#[cfg(not(unix))]
async fn sync_dir(_dir: &Path) -> io::Result<()> {
    Ok(())
}

#[async_trait]
impl RetryQueue for FileQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn enqueue(&self, request: InterceptedRequest) -> Result<EntryId, Error> {
        // Held across the write so entries become visible in id order. The id
        // is consumed even when the write fails.
        let mut next_id = self.next_id.lock().await;
        let id = EntryId(*next_id);
        *next_id += 1;
        let entry = QueueEntry {
            id,
            enqueued_at: unix_millis(SystemTime::now()),
            request,
        };

        let bytes = serde_json::to_vec(&StoredEntry::from_entry(&entry))
            .map_err(|source| Error::Encode { source })?;
        let path = self.entry_path(entry.id);
        self.write_durably(&path, &bytes)
            .await
            .map_err(|err| Error::storage("failed to persist queue entry", Some(path), err))?;
        Ok(entry.id)
    }

    async fn entries(&self) -> Result<Vec<QueueEntry>, Error> {
        let mut entries = Vec::new();
        for id in self.list_ids().await? {
            let path = self.entry_path(EntryId(id));
            let bytes = match fs::read(&path).await {
                Ok(bytes) => bytes,
                // Removed by a concurrent replay between listing and reading.
                Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
                Err(err) => {
                    return Err(Error::storage("failed to read queue entry", Some(path), err));
                }
            };

            let decoded = serde_json::from_slice::<StoredEntry>(&bytes)
                .map_err(|err| Box::new(err) as Box<dyn StdError + Send + Sync>)
                .and_then(StoredEntry::into_entry);
            match decoded {
                Ok(entry) => entries.push(entry),
                Err(_err) => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(
                        queue = %self.name,
                        path = %path.display(),
                        error = %_err,
                        "moving unreadable queue entry aside"
                    );
                    self.quarantine(&path).await?;
                }
            }
        }
        Ok(entries)
    }

    async fn remove(&self, id: EntryId) -> Result<(), Error> {
        let path = self.entry_path(id);
        match fs::remove_file(&path).await {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(err) => {
                return Err(Error::storage("failed to remove queue entry", Some(path), err));
            }
        }
        self.sync_dir()
            .await
            .map_err(|err| Error::storage("failed to sync queue directory", Some(self.dir.clone()), err))
    }

    async fn len(&self) -> Result<usize, Error> {
        Ok(self.list_ids().await?.len())
    }
}

use crate::session::ChannelSession;
use bytes::Bytes;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::sync::OnceCell;

/// Where asset bytes come from on a cache miss.
pub trait FileSource: Send + Sync + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    fn fetch(
        &self,
        session: &ChannelSession,
        file_name: &str,
    ) -> impl Future<Output = Result<Bytes, Self::Error>> + Send;
}

/// A fetched, playable resource. Shared by reference for the process lifetime.
#[derive(Debug)]
pub struct Asset {
    pub file_name: String,
    pub content_type: &'static str,
    pub bytes: Bytes,
}

impl Asset {
    pub fn new(file_name: impl Into<String>, bytes: Bytes) -> Self {
        let file_name = file_name.into();
        let content_type = content_type_for(&file_name);
        Self {
            file_name,
            content_type,
            bytes,
        }
    }
}

type Slot = Arc<OnceCell<Arc<Asset>>>;

/// Fetch-once cache keyed by the raw file name. Entries are never evicted and
/// a session change does not invalidate them. Concurrent first resolutions of
/// the same name share a single fetch; a failed fetch leaves the slot empty
/// so the next resolution retries.
pub struct AssetCache<F> {
    source: F,
    slots: Mutex<HashMap<String, Slot>>,
}

impl<F: FileSource> AssetCache<F> {
    pub fn new(source: F) -> Self {
        Self {
            source,
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub async fn resolve(
        &self,
        file_name: &str,
        session: &ChannelSession,
    ) -> Result<Arc<Asset>, F::Error> {
        let slot = self.slot(file_name);
        if let Some(asset) = slot.get() {
            tracing::info!(file_name, "asset served from cache");
            return Ok(asset.clone());
        }

        let asset = slot
            .get_or_try_init(|| async {
                tracing::info!(file_name, channel = %session.channel, "fetching asset from server");
                let bytes = self.source.fetch(session, file_name).await?;
                tracing::info!(file_name, size = bytes.len(), "caching asset");
                Ok::<_, F::Error>(Arc::new(Asset::new(file_name, bytes)))
            })
            .await?;
        Ok(asset.clone())
    }

    #[cfg(test)]
    pub fn source(&self) -> &F {
        &self.source
    }

    /// Returns an already-fetched asset without triggering a download.
    pub fn peek(&self, file_name: &str) -> Option<Arc<Asset>> {
        let slots = self.slots.lock().ok()?;
        slots.get(file_name).and_then(|slot| slot.get().cloned())
    }

    pub fn cached_count(&self) -> usize {
        match self.slots.lock() {
            Ok(slots) => slots.values().filter(|slot| slot.initialized()).count(),
            Err(_) => 0,
        }
    }

    fn slot(&self, file_name: &str) -> Slot {
        let mut slots = match self.slots.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        slots
            .entry(file_name.to_string())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone()
    }
}

pub fn content_type_for(file_name: &str) -> &'static str {
    let ext = file_name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        "ogg" | "oga" => "audio/ogg",
        "m4a" => "audio/mp4",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "svg" => "image/svg+xml",
        "webm" => "video/webm",
        "mp4" => "video/mp4",
        _ => "application/octet-stream",
    }
}

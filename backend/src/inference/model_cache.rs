use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::OnceCell;

use super::loader::ModelMaterializer;
use super::{ImageModel, ModelError, ModelKind};
use crate::config::ModelsConfig;
use crate::storage::BlobStore;

type Slot = Arc<OnceCell<Arc<dyn ImageModel>>>;

/// Process-wide model handles, populated on first use.
///
/// Each kind has its own slot. Concurrent cold callers for one kind share a
/// single fetch; a failed fetch leaves the slot empty so the next caller
/// tries again. The fetch runs on its own task, so a caller that is dropped
/// mid-load does not abandon the load for everyone queued behind it.
pub struct ModelCache {
    store: Arc<dyn BlobStore>,
    materializer: Arc<dyn ModelMaterializer>,
    models: ModelsConfig,
    slots: Mutex<HashMap<ModelKind, Slot>>,
}

impl ModelCache {
    pub fn new(
        store: Arc<dyn BlobStore>,
        materializer: Arc<dyn ModelMaterializer>,
        models: ModelsConfig,
    ) -> Self {
        Self {
            store,
            materializer,
            models,
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub async fn obtain(&self, kind: ModelKind) -> Result<Arc<dyn ImageModel>, ModelError> {
        let slot = self.slot(kind);
        if let Some(model) = slot.get() {
            return Ok(Arc::clone(model));
        }

        let store = Arc::clone(&self.store);
        let materializer = Arc::clone(&self.materializer);
        let key = self.models.key(kind).to_string();
        let load = tokio::spawn(async move {
            slot.get_or_try_init(|| fetch_and_load(store, materializer, kind, key))
                .await
                .map(Arc::clone)
        });
        load.await.map_err(|e| ModelError::Load {
            kind,
            reason: e.to_string(),
        })?
    }

    /// Drops the cached handle for `kind`. Requests already holding the old
    /// model finish with it; the next `obtain` fetches fresh weights.
    pub fn invalidate(&self, kind: ModelKind) -> bool {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        let previous = slots.insert(kind, Slot::default());
        let was_loaded = previous.is_some_and(|slot| slot.initialized());
        log::info!("Invalidated {} model (was loaded: {})", kind, was_loaded);
        was_loaded
    }

    pub async fn reload(&self, kind: ModelKind) -> Result<Arc<dyn ImageModel>, ModelError> {
        self.invalidate(kind);
        self.obtain(kind).await
    }

    pub fn is_loaded(&self, kind: ModelKind) -> bool {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&kind)
            .is_some_and(|slot| slot.initialized())
    }

    pub async fn preload(&self) -> Result<(), ModelError> {
        for kind in ModelKind::ALL {
            self.obtain(kind).await?;
        }
        Ok(())
    }

    fn slot(&self, kind: ModelKind) -> Slot {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(slots.entry(kind).or_default())
    }
}

async fn fetch_and_load(
    store: Arc<dyn BlobStore>,
    materializer: Arc<dyn ModelMaterializer>,
    kind: ModelKind,
    key: String,
) -> Result<Arc<dyn ImageModel>, ModelError> {
    log::info!("Fetching {} model from blob store key '{}'", kind, key);
    let bytes = store
        .get(&key)
        .await
        .map_err(|source| ModelError::Fetch { kind, source })?;

    tokio::task::spawn_blocking(move || materializer.materialize(kind, &bytes))
        .await
        .map_err(|e| ModelError::Load {
            kind,
            reason: e.to_string(),
        })?
        .map_err(|reason| ModelError::Load { kind, reason })
}

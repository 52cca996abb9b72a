//! Per-member model cache
//!
//! Models are built on demand from the member's stored messages and kept
//! until invalidated. Concurrent requests for the same key share one build.
//!
//! Every invalidation bumps the key's generation. A build checks the
//! generation it started under before handing out its model, so a model
//! trained on rows that were deleted meanwhile is discarded.

use super::MarkovModel;
use crate::config::MarkovConfig;
use crate::db::{GuildId, Store, UserId};
use crate::error::{Error, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tokio::sync::OnceCell;

/// (user, guild) pair a model is trained for
pub type CacheKey = (UserId, GuildId);

type Slot = Arc<OnceCell<Arc<MarkovModel>>>;

#[derive(Default)]
struct Slots {
    cells: HashMap<CacheKey, Slot>,
    /// Invalidations per key; keys never invalidated are at 0
    generations: HashMap<CacheKey, u64>,
}

impl Slots {
    fn generation(&self, key: &CacheKey) -> u64 {
        self.generations.get(key).copied().unwrap_or(0)
    }

    fn invalidate(&mut self, key: CacheKey) -> bool {
        *self.generations.entry(key).or_insert(0) += 1;
        self.cells.remove(&key).is_some()
    }
}

/// Keyed cache of trained models
pub struct ModelCache {
    store: Arc<dyn Store>,
    config: MarkovConfig,
    rng: Arc<Mutex<StdRng>>,
    slots: Mutex<Slots>,
    builds: AtomicU64,
}

impl ModelCache {
    /// Create a cache whose builds draw their randomness from `rng`
    pub fn new(store: Arc<dyn Store>, config: MarkovConfig, rng: Arc<Mutex<StdRng>>) -> Self {
        Self {
            store,
            config,
            rng,
            slots: Mutex::new(Slots::default()),
            builds: AtomicU64::new(0),
        }
    }

    /// Create a cache seeded from `config.seed`, or from entropy when unset
    pub fn from_config(store: Arc<dyn Store>, config: MarkovConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self::new(store, config, Arc::new(Mutex::new(rng)))
    }

    fn lock_slots(&self) -> MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Return the cached model, building it if needed.
    ///
    /// Fails with `NoData` when the member has no stored messages and with
    /// `BuildFailure` when the corpus can't be read or trained on, or when
    /// the key is invalidated while its model is being built. Failed builds
    /// leave nothing behind.
    pub async fn get_or_build(&self, user: UserId, guild: GuildId) -> Result<Arc<MarkovModel>> {
        let key = (user, guild);
        let (slot, generation) = {
            let mut slots = self.lock_slots();
            let generation = slots.generation(&key);
            let slot = slots
                .cells
                .entry(key)
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone();
            (slot, generation)
        };

        if let Some(model) = slot.get() {
            tracing::debug!(user = %user, guild = %guild, "Model cache hit");
            return Ok(model.clone());
        }

        match slot
            .get_or_try_init(|| self.build(user, guild, generation))
            .await
        {
            Ok(model) => Ok(model.clone()),
            Err(e) => {
                let mut slots = self.lock_slots();
                let ours = slots
                    .cells
                    .get(&key)
                    .map(|current| Arc::ptr_eq(current, &slot) && !current.initialized())
                    .unwrap_or(false);
                if ours {
                    slots.cells.remove(&key);
                }
                Err(e)
            }
        }
    }

    async fn build(&self, user: UserId, guild: GuildId, generation: u64) -> Result<Arc<MarkovModel>> {
        self.builds.fetch_add(1, Ordering::Relaxed);
        let started = Instant::now();

        let corpus = self
            .store
            .messages_content(user, guild)
            .await
            .map_err(|e| Error::BuildFailure(format!("failed to read corpus: {}", e)))?;
        if corpus.is_empty() {
            return Err(Error::NoData {
                guild: guild.0,
                user: user.0,
            });
        }

        let seed: u64 = {
            let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
            rng.gen()
        };
        let min = self.config.min_state_size;
        let max = self.config.max_state_size.max(min);
        let messages = corpus.len();

        let model = tokio::task::spawn_blocking(move || {
            let state_size = StdRng::seed_from_u64(seed).gen_range(min..=max);
            MarkovModel::train(&corpus, state_size)
        })
        .await
        .map_err(|e| Error::BuildFailure(format!("training task failed: {}", e)))??;

        if self.lock_slots().generation(&(user, guild)) != generation {
            tracing::debug!(user = %user, guild = %guild, "Discarded model invalidated during build");
            return Err(Error::BuildFailure(format!(
                "model of user {} in guild {} was invalidated while building",
                user, guild
            )));
        }

        tracing::info!(
            user = %user,
            guild = %guild,
            messages,
            state_size = model.state_size(),
            size = model.approx_size(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Built model"
        );
        Ok(Arc::new(model))
    }

    /// Drop the model for a key. A build already in flight for it fails
    /// instead of returning its model.
    pub fn invalidate(&self, user: UserId, guild: GuildId) -> bool {
        let removed = self.lock_slots().invalidate((user, guild));
        if removed {
            tracing::debug!(user = %user, guild = %guild, "Invalidated model");
        }
        removed
    }

    /// Drop every model of a user, in any guild. Returns how many were held.
    pub fn invalidate_user(&self, user: UserId) -> usize {
        let mut slots = self.lock_slots();
        let mut keys: Vec<CacheKey> = slots
            .cells
            .keys()
            .chain(slots.generations.keys())
            .filter(|key| key.0 == user)
            .copied()
            .collect();
        keys.sort();
        keys.dedup();

        let removed = keys.into_iter().filter(|key| slots.invalidate(*key)).count();
        if removed > 0 {
            tracing::debug!(user = %user, removed, "Invalidated models of user");
        }
        removed
    }

    /// Whether a built model is cached for the key
    pub fn contains(&self, user: UserId, guild: GuildId) -> bool {
        self.lock_slots()
            .cells
            .get(&(user, guild))
            .map(|slot| slot.initialized())
            .unwrap_or(false)
    }

    /// Number of built models held
    pub fn len(&self) -> usize {
        self.lock_slots()
            .cells
            .values()
            .filter(|slot| slot.initialized())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Combined approximate size of all built models in bytes
    pub fn approx_size(&self) -> usize {
        self.lock_slots()
            .cells
            .values()
            .filter_map(|slot| slot.get())
            .map(|model| model.approx_size())
            .sum()
    }

    /// Builds started since creation, successful or not
    pub fn builds_started(&self) -> u64 {
        self.builds.load(Ordering::Relaxed)
    }
}

//! Double-buffered prefetch staging for bump assets.
//!
//! While the current bump plays, a worker thread copies the next bump's
//! referenced files (music, sound FX, outro audio) into an ephemeral cache
//! so playback never waits on a slow drive. Two buffers live behind one
//! mutex: "active" serves the playing bump, "next" is populated by the
//! worker; the swap happens synchronously on the coordinator when the next
//! bump starts.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use log::{debug, warn};

use crate::bump::composer::CompleteBump;
use crate::bump::script::Card;

#[derive(Debug, Default)]
struct Buffers {
    /// original path -> staged path, for the bump currently playing.
    active: HashMap<PathBuf, PathBuf>,
    /// Same mapping for the bump being staged.
    next: HashMap<PathBuf, PathBuf>,
}

/// Shared prefetch cache. Clone handles freely; all clones see one state.
#[derive(Clone, Debug, Default)]
pub struct PrefetchCache {
    buffers: Arc<Mutex<Buffers>>,
}

impl PrefetchCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Substitutes a staged path for `original` when the active buffer has
    /// one; otherwise playback uses the original path.
    pub fn resolve(&self, original: &Path) -> PathBuf {
        let buffers = self.buffers.lock().expect("prefetch lock poisoned");
        buffers
            .active
            .get(original)
            .cloned()
            .unwrap_or_else(|| original.to_path_buf())
    }

    /// Promotes the staged "next" buffer to active. Called on the
    /// coordinator when the next bump starts.
    pub fn swap_active(&self) {
        let mut buffers = self.buffers.lock().expect("prefetch lock poisoned");
        buffers.active = std::mem::take(&mut buffers.next);
    }

    /// Clears both buffers (library rescans, shutdown).
    pub fn clear(&self) {
        let mut buffers = self.buffers.lock().expect("prefetch lock poisoned");
        buffers.active.clear();
        buffers.next.clear();
    }

    /// Stages `bump`'s assets into `cache_dir` on a worker thread, filling
    /// the "next" buffer only. The worker owns its file copies; the buffer
    /// insert is the single shared-state touch.
    pub fn stage_next(&self, bump: &CompleteBump, cache_dir: &Path) -> JoinHandle<()> {
        let assets = referenced_assets(bump);
        let cache_dir = cache_dir.to_path_buf();
        let buffers = Arc::clone(&self.buffers);
        std::thread::spawn(move || {
            if let Err(err) = std::fs::create_dir_all(&cache_dir) {
                warn!(
                    "Prefetch: cannot create cache dir {}: {}",
                    cache_dir.display(),
                    err
                );
                return;
            }
            let mut staged: HashMap<PathBuf, PathBuf> = HashMap::new();
            for (slot, original) in assets.into_iter().enumerate() {
                if !original.is_file() {
                    continue;
                }
                let Some(name) = original.file_name() else {
                    continue;
                };
                let mut target_name = std::ffi::OsString::from(format!("{slot:02}-"));
                target_name.push(name);
                let target = cache_dir.join(target_name);
                match std::fs::copy(&original, &target) {
                    Ok(_) => {
                        staged.insert(original, target);
                    }
                    Err(err) => {
                        debug!(
                            "Prefetch: copy {} failed: {} (playing original)",
                            original.display(),
                            err
                        );
                    }
                }
            }
            let mut buffers = buffers.lock().expect("prefetch lock poisoned");
            buffers.next = staged;
        })
    }
}

/// Every external file a complete bump touches during playback.
fn referenced_assets(bump: &CompleteBump) -> Vec<PathBuf> {
    let mut assets = Vec::new();
    if let Some(audio) = &bump.audio {
        assets.push(audio.clone());
    }
    if let Some(outro) = &bump.outro_audio_path {
        assets.push(outro.clone());
    }
    for card in &bump.script.cards {
        if let Some(sound) = card.sound() {
            assets.push(sound.path.clone());
        }
        match card {
            Card::Image(card) => assets.push(card.image.path.clone()),
            Card::ImageChar(card) => assets.push(card.image.path.clone()),
            _ => {}
        }
    }
    assets.dedup();
    assets
}

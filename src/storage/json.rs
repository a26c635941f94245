use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serenity::model::id::GuildId;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{
    shift_index, EntryId, NewPlayer, NewQueueEntry, PlayerId, PlayerPatch, PlayerState, PlayerStore, QueueEntry,
};

/// Everything persisted for one guild.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PlayerDocument {
    player: PlayerState,
    #[serde(default)]
    queue: Vec<QueueEntry>,
}

struct Cache {
    documents: HashMap<PlayerId, PlayerDocument>,
    next_entry: u64,
}

/// Store basado en archivos JSON, uno por guild.
///
/// Every document is cached in memory and written through on each change.
/// Changes are staged on a copy and reach the cache only once the file is
/// written. One async mutex serializes calls so each call is atomic.
pub struct JsonStore {
    data_dir: PathBuf,
    cache: Mutex<Cache>,
}

impl JsonStore {
    pub async fn new(data_dir: PathBuf) -> Result<Self> {
        let players_dir = data_dir.join("players");
        fs::create_dir_all(&players_dir)
            .await
            .with_context(|| format!("no se pudo crear {}", players_dir.display()))?;

        info!("📁 Storage inicializado en: {}", data_dir.display());

        let documents = Self::load_all(&players_dir).await?;
        let next_entry = documents
            .values()
            .flat_map(|doc| doc.queue.iter())
            .map(|entry| entry.id.0 + 1)
            .max()
            .unwrap_or(0);

        Ok(Self {
            data_dir,
            cache: Mutex::new(Cache { documents, next_entry }),
        })
    }

    async fn load_all(players_dir: &Path) -> Result<HashMap<PlayerId, PlayerDocument>> {
        let mut documents = HashMap::new();
        let mut files = fs::read_dir(players_dir).await?;

        while let Some(entry) = files.next_entry().await? {
            let path = entry.path();
            if path.extension().map_or(true, |ext| ext != "json") {
                continue;
            }
            let is_guild_file = path
                .file_stem()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_prefix("guild_"))
                .is_some_and(|id| id.parse::<u64>().is_ok());
            if !is_guild_file {
                continue;
            }

            let loaded = async {
                let content = fs::read_to_string(&path).await?;
                Ok::<_, anyhow::Error>(serde_json::from_str::<PlayerDocument>(&content)?)
            }
            .await;

            match loaded {
                Ok(document) => {
                    documents.insert(document.player.id, document);
                }
                Err(e) => warn!("Error cargando {}: {}", path.display(), e),
            }
        }

        if !documents.is_empty() {
            info!("📂 Cargados {} reproductores persistidos", documents.len());
        }
        Ok(documents)
    }

    fn file_path(&self, guild_id: GuildId) -> PathBuf {
        self.data_dir
            .join("players")
            .join(format!("guild_{}.json", guild_id))
    }

    async fn save(&self, document: &PlayerDocument) -> Result<()> {
        let path = self.file_path(document.player.guild_id);
        let content = serde_json::to_string_pretty(document)?;
        fs::write(&path, content)
            .await
            .with_context(|| format!("no se pudo escribir {}", path.display()))?;
        debug!("💾 Reproductor {} guardado", document.player.guild_id);
        Ok(())
    }

    fn owner_of(cache: &Cache, id: EntryId) -> Option<PlayerId> {
        cache
            .documents
            .iter()
            .find(|(_, doc)| doc.queue.iter().any(|entry| entry.id == id))
            .map(|(player_id, _)| *player_id)
    }
}

#[async_trait]
impl PlayerStore for JsonStore {
    async fn find_player(&self, guild_id: GuildId) -> Result<Option<PlayerState>> {
        let cache = self.cache.lock().await;
        Ok(cache
            .documents
            .get(&PlayerId::from(guild_id))
            .map(|doc| doc.player.clone()))
    }

    async fn create_player(&self, player: NewPlayer) -> Result<PlayerState> {
        let mut cache = self.cache.lock().await;
        let document = PlayerDocument {
            player: PlayerState::new(player),
            queue: Vec::new(),
        };
        self.save(&document).await?;
        let player = document.player.clone();
        cache.documents.insert(player.id, document);
        Ok(player)
    }

    async fn update_player(&self, id: PlayerId, patch: PlayerPatch) -> Result<PlayerState> {
        let mut cache = self.cache.lock().await;
        let mut document = cache
            .documents
            .get(&id)
            .cloned()
            .ok_or_else(|| anyhow!("player {id} not found"))?;
        document.player.apply(patch);
        self.save(&document).await?;
        let player = document.player.clone();
        cache.documents.insert(id, document);
        Ok(player)
    }

    async fn delete_player(&self, id: PlayerId) -> Result<()> {
        let mut cache = self.cache.lock().await;
        if let Some(document) = cache.documents.remove(&id) {
            let path = self.file_path(document.player.guild_id);
            if let Err(e) = fs::remove_file(&path).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    return Err(e).with_context(|| format!("no se pudo borrar {}", path.display()));
                }
            }
            info!("🗑️ Reproductor eliminado para guild {}", document.player.guild_id);
        }
        Ok(())
    }

    async fn list_players(&self) -> Result<Vec<PlayerState>> {
        let cache = self.cache.lock().await;
        Ok(cache.documents.values().map(|doc| doc.player.clone()).collect())
    }

    async fn find_queue(&self, player_id: PlayerId) -> Result<Vec<QueueEntry>> {
        let cache = self.cache.lock().await;
        let mut queue = cache
            .documents
            .get(&player_id)
            .map(|doc| doc.queue.clone())
            .unwrap_or_default();
        queue.sort_by_key(|entry| (entry.index, entry.id));
        Ok(queue)
    }

    async fn delete_queue_entry(&self, id: EntryId) -> Result<()> {
        let mut cache = self.cache.lock().await;
        let Some(owner) = Self::owner_of(&cache, id) else {
            return Ok(());
        };
        if let Some(mut document) = cache.documents.get(&owner).cloned() {
            document.queue.retain(|entry| entry.id != id);
            self.save(&document).await?;
            cache.documents.insert(owner, document);
        }
        Ok(())
    }

    async fn renumber_queue_entries(&self, ids: &[EntryId], delta: i64) -> Result<()> {
        let mut cache = self.cache.lock().await;
        let touched: Vec<PlayerId> = cache
            .documents
            .iter()
            .filter(|(_, doc)| doc.queue.iter().any(|entry| ids.contains(&entry.id)))
            .map(|(owner, _)| *owner)
            .collect();

        for owner in touched {
            let Some(mut document) = cache.documents.get(&owner).cloned() else {
                continue;
            };
            for entry in document.queue.iter_mut().filter(|entry| ids.contains(&entry.id)) {
                entry.index = shift_index(entry.index, delta);
            }
            self.save(&document).await?;
            cache.documents.insert(owner, document);
        }
        Ok(())
    }

    async fn create_queue_entries(&self, entries: Vec<NewQueueEntry>) -> Result<Vec<QueueEntry>> {
        let mut cache = self.cache.lock().await;
        let mut created = Vec::with_capacity(entries.len());

        for entry in entries {
            let id = EntryId(cache.next_entry);
            cache.next_entry += 1;
            created.push(QueueEntry::new(id, entry));
        }

        let mut owners: Vec<PlayerId> = created.iter().map(|entry| entry.player_id).collect();
        owners.sort_unstable_by_key(|owner| owner.0);
        owners.dedup();
        if let Some(missing) = owners.iter().find(|owner| !cache.documents.contains_key(owner)) {
            return Err(anyhow!("player {missing} not found"));
        }

        for owner in owners {
            let Some(mut document) = cache.documents.get(&owner).cloned() else {
                continue;
            };
            document
                .queue
                .extend(created.iter().filter(|entry| entry.player_id == owner).cloned());
            self.save(&document).await?;
            cache.documents.insert(owner, document);
        }
        Ok(created)
    }
}

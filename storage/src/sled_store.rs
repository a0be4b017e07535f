//! sled-backed stores for the state worth keeping across restarts: the
//! object inventory and the known-node registry.

use std::path::Path;

use async_trait::async_trait;
use tracing::{debug, info};

use bitmessage_core::repository::{
    InventoryRepository, KnownNode, NodeRegistry, StoredObject,
};
use bitmessage_core::{CoreError, CoreResult, InventoryVector, ObjectType};

const TREE_OBJECTS: &str = "objects";
const TREE_NODES: &str = "nodes";

fn repo_err(e: impl std::fmt::Display) -> CoreError {
    CoreError::Repository(e.to_string())
}

/// Inventory persistence on a sled tree keyed by inventory vector.
pub struct SledInventoryRepository {
    objects: sled::Tree,
}

impl SledInventoryRepository {
    pub fn open(db: &sled::Db) -> CoreResult<Self> {
        let objects = db.open_tree(TREE_OBJECTS).map_err(repo_err)?;
        info!(count = objects.len(), "opened object inventory");
        Ok(Self { objects })
    }

    fn decode(value: &[u8]) -> CoreResult<StoredObject> {
        serde_json::from_slice(value).map_err(repo_err)
    }
}

#[async_trait]
impl InventoryRepository for SledInventoryRepository {
    async fn contains(&self, iv: &InventoryVector) -> CoreResult<bool> {
        self.objects.contains_key(iv.as_bytes()).map_err(repo_err)
    }

    async fn get_object(&self, iv: &InventoryVector) -> CoreResult<Option<StoredObject>> {
        match self.objects.get(iv.as_bytes()).map_err(repo_err)? {
            Some(value) => Ok(Some(Self::decode(&value)?)),
            None => Ok(None),
        }
    }

    async fn get_inventory(&self, stream: u64) -> CoreResult<Vec<InventoryVector>> {
        self.find(stream, None, &[]).await
    }

    async fn find(
        &self,
        stream: u64,
        version: Option<u64>,
        types: &[ObjectType],
    ) -> CoreResult<Vec<InventoryVector>> {
        let mut out = Vec::new();
        for entry in self.objects.iter() {
            let (_, value) = entry.map_err(repo_err)?;
            let object = Self::decode(&value)?;
            if object.stream != stream {
                continue;
            }
            if version.map(|v| object.version != v).unwrap_or(false) {
                continue;
            }
            if !types.is_empty() && !types.contains(&object.object_type) {
                continue;
            }
            out.push(object.iv);
        }
        Ok(out)
    }

    async fn store(&self, object: StoredObject) -> CoreResult<()> {
        let value = serde_json::to_vec(&object).map_err(repo_err)?;
        self.objects
            .insert(object.iv.as_bytes(), value)
            .map_err(repo_err)?;
        Ok(())
    }

    async fn remove_expired(&self, cutoff: u64) -> CoreResult<Vec<StoredObject>> {
        let mut removed = Vec::new();
        for entry in self.objects.iter() {
            let (key, value) = entry.map_err(repo_err)?;
            let object = Self::decode(&value)?;
            if object.expires_time < cutoff {
                self.objects.remove(key).map_err(repo_err)?;
                removed.push(object);
            }
        }
        if !removed.is_empty() {
            self.objects.flush_async().await.map_err(repo_err)?;
            debug!(count = removed.len(), "removed expired objects");
        }
        Ok(removed)
    }
}

/// Known-peer registry on a sled tree keyed by `ip:port`.
pub struct SledNodeRegistry {
    nodes: sled::Tree,
}

impl SledNodeRegistry {
    pub fn open(db: &sled::Db) -> CoreResult<Self> {
        let nodes = db.open_tree(TREE_NODES).map_err(repo_err)?;
        info!(count = nodes.len(), "opened node registry");
        Ok(Self { nodes })
    }

    fn key(ip: std::net::IpAddr, port: u16) -> Vec<u8> {
        format!("{}:{}", ip, port).into_bytes()
    }
}

#[async_trait]
impl NodeRegistry for SledNodeRegistry {
    async fn known_nodes(&self, stream: u64, limit: usize) -> CoreResult<Vec<KnownNode>> {
        let mut out = Vec::new();
        for entry in self.nodes.iter() {
            let (_, value) = entry.map_err(repo_err)?;
            let node: KnownNode = serde_json::from_slice(&value).map_err(repo_err)?;
            if node.stream == stream {
                out.push(node);
            }
        }
        out.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));
        out.truncate(limit);
        Ok(out)
    }

    async fn offer(&self, offered: &[KnownNode]) -> CoreResult<()> {
        for node in offered {
            let key = Self::key(node.ip, node.port);
            let keep = match self.nodes.get(&key).map_err(repo_err)? {
                Some(value) => {
                    let existing: KnownNode =
                        serde_json::from_slice(&value).map_err(repo_err)?;
                    node.last_seen > existing.last_seen
                }
                None => true,
            };
            if keep {
                let value = serde_json::to_vec(node).map_err(repo_err)?;
                self.nodes.insert(key, value).map_err(repo_err)?;
            }
        }
        Ok(())
    }

    async fn touch(&self, node: &KnownNode) -> CoreResult<()> {
        let value = serde_json::to_vec(node).map_err(repo_err)?;
        self.nodes
            .insert(Self::key(node.ip, node.port), value)
            .map_err(repo_err)?;
        Ok(())
    }

    async fn remove(&self, ip: std::net::IpAddr, port: u16) -> CoreResult<()> {
        self.nodes.remove(Self::key(ip, port)).map_err(repo_err)?;
        Ok(())
    }
}

/// Opens the shared sled database under `data_dir`.
pub fn open_database(data_dir: &Path) -> CoreResult<sled::Db> {
    sled::Config::default()
        .path(data_dir.join("bitmessage.sled"))
        .open()
        .map_err(repo_err)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_object(seed: u8, expires_time: u64) -> StoredObject {
        StoredObject {
            iv: InventoryVector([seed; 32]),
            stream: 1,
            object_type: ObjectType::Msg,
            version: 1,
            expires_time,
            bytes: vec![seed; 40],
        }
    }

    #[tokio::test]
    async fn objects_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let object = sample_object(7, 2_000_000_000);
        {
            let db = open_database(dir.path()).unwrap();
            let repo = SledInventoryRepository::open(&db).unwrap();
            repo.store(object.clone()).await.unwrap();
            db.flush().unwrap();
        }
        let db = open_database(dir.path()).unwrap();
        let repo = SledInventoryRepository::open(&db).unwrap();
        assert!(repo.contains(&object.iv).await.unwrap());
        assert_eq!(repo.get_object(&object.iv).await.unwrap(), Some(object));
    }

    #[tokio::test]
    async fn expired_objects_are_removed() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_database(dir.path()).unwrap();
        let repo = SledInventoryRepository::open(&db).unwrap();

        repo.store(sample_object(1, 100)).await.unwrap();
        repo.store(sample_object(2, 2_000_000_000)).await.unwrap();

        let removed = repo.remove_expired(1_000_000).await.unwrap();
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].iv, InventoryVector([1; 32]));
        assert_eq!(repo.get_inventory(1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn node_registry_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_database(dir.path()).unwrap();
        let registry = SledNodeRegistry::open(&db).unwrap();

        let node = KnownNode {
            ip: "192.0.2.1".parse().unwrap(),
            port: 8444,
            stream: 1,
            services: 1,
            last_seen: 500,
        };
        registry.offer(std::slice::from_ref(&node)).await.unwrap();

        // A staler sighting of the same endpoint is ignored.
        let stale = KnownNode {
            last_seen: 10,
            ..node.clone()
        };
        registry.offer(&[stale]).await.unwrap();
        let nodes = registry.known_nodes(1, 8).await.unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].last_seen, 500);
    }
}

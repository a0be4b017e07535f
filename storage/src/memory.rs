//! In-memory repositories: the default for tests and for nodes that do
//! not care about persistence across restarts.

use std::collections::HashMap;
use std::net::IpAddr;

use async_trait::async_trait;
use parking_lot::RwLock;

use bitmessage_core::repository::{
    AddressEntry, AddressRepository, InventoryRepository, KnownNode, MessageRepository,
    NodeRegistry, PowItem, ProofOfWorkRepository, StoredObject,
};
use bitmessage_core::{
    BitmessageAddress, CoreResult, InventoryVector, Label, LabelKind, MessageStatus, ObjectType,
    Plaintext, Pubkey,
};

#[derive(Default)]
pub struct MemoryInventoryRepository {
    objects: RwLock<HashMap<InventoryVector, StoredObject>>,
}

impl MemoryInventoryRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl InventoryRepository for MemoryInventoryRepository {
    async fn contains(&self, iv: &InventoryVector) -> CoreResult<bool> {
        Ok(self.objects.read().contains_key(iv))
    }

    async fn get_object(&self, iv: &InventoryVector) -> CoreResult<Option<StoredObject>> {
        Ok(self.objects.read().get(iv).cloned())
    }

    async fn get_inventory(&self, stream: u64) -> CoreResult<Vec<InventoryVector>> {
        Ok(self
            .objects
            .read()
            .values()
            .filter(|o| o.stream == stream)
            .map(|o| o.iv)
            .collect())
    }

    async fn find(
        &self,
        stream: u64,
        version: Option<u64>,
        types: &[ObjectType],
    ) -> CoreResult<Vec<InventoryVector>> {
        Ok(self
            .objects
            .read()
            .values()
            .filter(|o| o.stream == stream)
            .filter(|o| version.map(|v| o.version == v).unwrap_or(true))
            .filter(|o| types.is_empty() || types.contains(&o.object_type))
            .map(|o| o.iv)
            .collect())
    }

    async fn store(&self, object: StoredObject) -> CoreResult<()> {
        self.objects.write().insert(object.iv, object);
        Ok(())
    }

    async fn remove_expired(&self, cutoff: u64) -> CoreResult<Vec<StoredObject>> {
        let mut objects = self.objects.write();
        let expired: Vec<InventoryVector> = objects
            .values()
            .filter(|o| o.expires_time < cutoff)
            .map(|o| o.iv)
            .collect();
        Ok(expired
            .into_iter()
            .filter_map(|iv| objects.remove(&iv))
            .collect())
    }
}

#[derive(Default)]
struct MessageTables {
    messages: HashMap<u64, Plaintext>,
    labels: HashMap<u64, Label>,
    next_message_id: u64,
    next_label_id: u64,
}

#[derive(Default)]
pub struct MemoryMessageRepository {
    tables: RwLock<MessageTables>,
}

impl MemoryMessageRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MessageRepository for MemoryMessageRepository {
    async fn save(&self, message: &mut Plaintext) -> CoreResult<()> {
        let mut tables = self.tables.write();
        let id = match message.id {
            Some(id) => id,
            None => {
                tables.next_message_id += 1;
                let id = tables.next_message_id;
                message.id = Some(id);
                id
            }
        };
        tables.messages.insert(id, message.clone());
        Ok(())
    }

    async fn remove(&self, id: u64) -> CoreResult<()> {
        self.tables.write().messages.remove(&id);
        Ok(())
    }

    async fn get(&self, id: u64) -> CoreResult<Option<Plaintext>> {
        Ok(self.tables.read().messages.get(&id).cloned())
    }

    async fn find_by_initial_hash(&self, initial_hash: &[u8]) -> CoreResult<Option<Plaintext>> {
        Ok(self
            .tables
            .read()
            .messages
            .values()
            .find(|m| m.initial_hash.as_deref() == Some(initial_hash))
            .cloned())
    }

    async fn find_by_status(
        &self,
        status: MessageStatus,
        recipient: Option<&BitmessageAddress>,
    ) -> CoreResult<Vec<Plaintext>> {
        Ok(self
            .tables
            .read()
            .messages
            .values()
            .filter(|m| m.status == status)
            .filter(|m| recipient.map(|r| m.to.as_ref() == Some(r)).unwrap_or(true))
            .cloned()
            .collect())
    }

    async fn find_to_resend(&self, now: u64) -> CoreResult<Vec<Plaintext>> {
        Ok(self
            .tables
            .read()
            .messages
            .values()
            .filter(|m| m.status == MessageStatus::Sent)
            .filter(|m| m.next_try.map(|t| t < now).unwrap_or(false))
            .cloned()
            .collect())
    }

    async fn find_by_ack_data(&self, ack_data: &[u8]) -> CoreResult<Option<Plaintext>> {
        if ack_data.is_empty() {
            return Ok(None);
        }
        Ok(self
            .tables
            .read()
            .messages
            .values()
            .find(|m| !m.ack_data.is_empty() && m.ack_data == ack_data)
            .cloned())
    }

    async fn labels(&self) -> CoreResult<Vec<Label>> {
        let mut labels: Vec<Label> = self.tables.read().labels.values().cloned().collect();
        labels.sort_by_key(|l| l.id);
        Ok(labels)
    }

    async fn save_label(&self, label: &Label) -> CoreResult<()> {
        let mut tables = self.tables.write();
        let mut label = label.clone();
        if label.id == 0 {
            tables.next_label_id += 1;
            label.id = tables.next_label_id;
        }
        tables.labels.insert(label.id, label);
        Ok(())
    }

    async fn remove_label(&self, id: u64) -> CoreResult<()> {
        let mut tables = self.tables.write();
        tables.labels.remove(&id);
        for message in tables.messages.values_mut() {
            message.labels.retain(|l| *l != id);
        }
        Ok(())
    }

    async fn count_unread(&self, label_id: u64) -> CoreResult<u64> {
        let tables = self.tables.read();
        let unread_ids: Vec<u64> = tables
            .labels
            .values()
            .filter(|l| l.kind == Some(LabelKind::Unread))
            .map(|l| l.id)
            .collect();
        Ok(tables
            .messages
            .values()
            .filter(|m| m.labels.contains(&label_id))
            .filter(|m| m.labels.iter().any(|l| unread_ids.contains(l)))
            .count() as u64)
    }
}

#[derive(Default)]
pub struct MemoryAddressRepository {
    entries: RwLock<HashMap<BitmessageAddress, AddressEntry>>,
}

impl MemoryAddressRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AddressRepository for MemoryAddressRepository {
    async fn get(&self, address: &BitmessageAddress) -> CoreResult<Option<AddressEntry>> {
        Ok(self.entries.read().get(address).cloned())
    }

    async fn save(&self, entry: AddressEntry) -> CoreResult<()> {
        self.entries.write().insert(entry.address.clone(), entry);
        Ok(())
    }

    async fn identities(&self) -> CoreResult<Vec<AddressEntry>> {
        Ok(self
            .entries
            .read()
            .values()
            .filter(|e| e.is_identity())
            .cloned()
            .collect())
    }

    async fn subscriptions(&self) -> CoreResult<Vec<AddressEntry>> {
        Ok(self
            .entries
            .read()
            .values()
            .filter(|e| e.subscribed)
            .cloned()
            .collect())
    }

    async fn attach_pubkey(
        &self,
        address: &BitmessageAddress,
        pubkey: Pubkey,
    ) -> CoreResult<()> {
        let mut entries = self.entries.write();
        entries
            .entry(address.clone())
            .or_insert_with(|| AddressEntry::contact(address.clone()))
            .pubkey = Some(pubkey);
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryNodeRegistry {
    nodes: RwLock<HashMap<(IpAddr, u16), KnownNode>>,
}

impl MemoryNodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl NodeRegistry for MemoryNodeRegistry {
    async fn known_nodes(&self, stream: u64, limit: usize) -> CoreResult<Vec<KnownNode>> {
        let mut nodes: Vec<KnownNode> = self
            .nodes
            .read()
            .values()
            .filter(|n| n.stream == stream)
            .cloned()
            .collect();
        nodes.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));
        nodes.truncate(limit);
        Ok(nodes)
    }

    async fn offer(&self, offered: &[KnownNode]) -> CoreResult<()> {
        let mut nodes = self.nodes.write();
        for node in offered {
            nodes
                .entry((node.ip, node.port))
                .and_modify(|existing| {
                    if node.last_seen > existing.last_seen {
                        *existing = node.clone();
                    }
                })
                .or_insert_with(|| node.clone());
        }
        Ok(())
    }

    async fn touch(&self, node: &KnownNode) -> CoreResult<()> {
        self.nodes
            .write()
            .insert((node.ip, node.port), node.clone());
        Ok(())
    }

    async fn remove(&self, ip: IpAddr, port: u16) -> CoreResult<()> {
        self.nodes.write().remove(&(ip, port));
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryPowRepository {
    items: RwLock<Vec<PowItem>>,
}

impl MemoryPowRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProofOfWorkRepository for MemoryPowRepository {
    async fn enqueue(&self, item: PowItem) -> CoreResult<()> {
        let mut items = self.items.write();
        items.retain(|i| i.initial_hash != item.initial_hash);
        items.push(item);
        Ok(())
    }

    async fn pending(&self) -> CoreResult<Vec<PowItem>> {
        Ok(self.items.read().clone())
    }

    async fn get(&self, initial_hash: &[u8; 64]) -> CoreResult<Option<PowItem>> {
        Ok(self
            .items
            .read()
            .iter()
            .find(|i| &i.initial_hash == initial_hash)
            .cloned())
    }

    async fn remove(&self, initial_hash: &[u8; 64]) -> CoreResult<()> {
        self.items
            .write()
            .retain(|i| &i.initial_hash != initial_hash);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitmessage_core::{MessageEncoding, PlaintextType};

    fn address(seed: u8) -> BitmessageAddress {
        BitmessageAddress::new(4, 1, [seed; 20])
    }

    fn draft(to: u8) -> Plaintext {
        Plaintext::draft(
            address(1),
            Some(address(to)),
            PlaintextType::Msg,
            MessageEncoding::Simple,
            Plaintext::simple_body("s", "b"),
            216_000,
        )
    }

    #[tokio::test]
    async fn message_ids_are_assigned_once() {
        let repo = MemoryMessageRepository::new();
        let mut message = draft(2);
        repo.save(&mut message).await.unwrap();
        let id = message.id.unwrap();

        message.status = MessageStatus::Sent;
        repo.save(&mut message).await.unwrap();
        assert_eq!(message.id, Some(id));
        assert_eq!(
            repo.get(id).await.unwrap().unwrap().status,
            MessageStatus::Sent
        );
    }

    #[tokio::test]
    async fn resend_query_filters_on_status_and_timer() {
        let repo = MemoryMessageRepository::new();

        let mut due = draft(2);
        due.status = MessageStatus::Sent;
        due.next_try = Some(90);
        repo.save(&mut due).await.unwrap();

        let mut not_due = draft(3);
        not_due.status = MessageStatus::Sent;
        not_due.next_try = Some(200);
        repo.save(&mut not_due).await.unwrap();

        let mut acked = draft(4);
        acked.status = MessageStatus::SentAcknowledged;
        acked.next_try = Some(10);
        repo.save(&mut acked).await.unwrap();

        let found = repo.find_to_resend(100).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, due.id);
    }

    #[tokio::test]
    async fn ack_lookup_ignores_empty_ack_data() {
        let repo = MemoryMessageRepository::new();
        let mut message = draft(2);
        repo.save(&mut message).await.unwrap();
        assert!(repo.find_by_ack_data(&[]).await.unwrap().is_none());

        message.ack_data = vec![0xAB; 32];
        repo.save(&mut message).await.unwrap();
        let found = repo.find_by_ack_data(&[0xAB; 32]).await.unwrap().unwrap();
        assert_eq!(found.id, message.id);
    }

    #[tokio::test]
    async fn unread_counting_follows_labels() {
        let repo = MemoryMessageRepository::new();
        let inbox = Label {
            id: 0,
            name: "inbox".into(),
            kind: Some(LabelKind::Inbox),
            color: 0,
        };
        let unread = Label {
            id: 0,
            name: "unread".into(),
            kind: Some(LabelKind::Unread),
            color: 0,
        };
        repo.save_label(&inbox).await.unwrap();
        repo.save_label(&unread).await.unwrap();
        let labels = repo.labels().await.unwrap();
        let (inbox_id, unread_id) = (labels[0].id, labels[1].id);

        let mut read_message = draft(2);
        read_message.labels = vec![inbox_id];
        repo.save(&mut read_message).await.unwrap();

        let mut unread_message = draft(3);
        unread_message.labels = vec![inbox_id, unread_id];
        repo.save(&mut unread_message).await.unwrap();

        assert_eq!(repo.count_unread(inbox_id).await.unwrap(), 1);

        repo.remove_label(unread_id).await.unwrap();
        assert_eq!(repo.count_unread(inbox_id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn node_registry_merges_by_freshness() {
        let registry = MemoryNodeRegistry::new();
        let node = KnownNode {
            ip: "10.0.0.1".parse().unwrap(),
            port: 8444,
            stream: 1,
            services: 1,
            last_seen: 100,
        };
        registry.offer(&[node.clone()]).await.unwrap();

        let stale = KnownNode {
            last_seen: 50,
            services: 0,
            ..node.clone()
        };
        registry.offer(&[stale]).await.unwrap();
        let nodes = registry.known_nodes(1, 10).await.unwrap();
        assert_eq!(nodes[0].last_seen, 100);
        assert_eq!(nodes[0].services, 1);

        registry.remove(node.ip, node.port).await.unwrap();
        assert!(registry.known_nodes(1, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn pow_queue_deduplicates_by_hash() {
        use bitmessage_core::{PowItem, PowPurpose};
        let repo = MemoryPowRepository::new();
        let item = PowItem {
            initial_hash: [1u8; 64],
            target: 1000,
            object_after_nonce: vec![1, 2, 3],
            purpose: PowPurpose::Message { message_id: 1 },
        };
        repo.enqueue(item.clone()).await.unwrap();
        repo.enqueue(item.clone()).await.unwrap();
        assert_eq!(repo.pending().await.unwrap().len(), 1);

        assert!(repo.get(&[1u8; 64]).await.unwrap().is_some());
        repo.remove(&[1u8; 64]).await.unwrap();
        assert!(repo.get(&[1u8; 64]).await.unwrap().is_none());
    }
}

//! Entity directory and local identity capabilities.
//!
//! The client core only reads and writes through these traits. `None` or an
//! empty list means the directory does not know yet; callers defer and query
//! instead of failing.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::protocol::{Document, EntityId, Meta};

pub trait Directory: Send + Sync + 'static {
    fn meta(&self, id: &EntityId) -> Option<Meta>;
    fn documents(&self, id: &EntityId) -> Vec<Document>;
    /// Whether messages to `id` can be encrypted right now.
    fn has_encryption_key(&self, id: &EntityId) -> bool;

    fn members(&self, group: &EntityId) -> Option<Vec<EntityId>>;
    fn assistants(&self, group: &EntityId) -> Option<Vec<EntityId>>;
    fn owner(&self, group: &EntityId) -> Option<EntityId>;

    fn save_meta(&self, id: &EntityId, meta: Meta) -> bool;
    fn save_document(&self, document: Document) -> bool;
    fn save_members(&self, group: &EntityId, members: &[EntityId]) -> bool;
}

/// The signed-in user with the records it presents to the station.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalUser {
    pub id: EntityId,
    pub meta: Meta,
    pub visa: Document,
}

pub trait IdentityProvider: Send + Sync + 'static {
    fn current_user(&self) -> Option<LocalUser>;
}

/// Identity provider holding one swappable user.
#[derive(Default)]
pub struct StaticIdentity {
    user: RwLock<Option<LocalUser>>,
}

impl StaticIdentity {
    pub fn new(user: Option<LocalUser>) -> Self {
        Self {
            user: RwLock::new(user),
        }
    }

    pub fn set(&self, user: Option<LocalUser>) {
        *self.user.write() = user;
    }
}

impl IdentityProvider for StaticIdentity {
    fn current_user(&self) -> Option<LocalUser> {
        self.user.read().clone()
    }
}

#[derive(Default)]
struct Records {
    metas: HashMap<EntityId, Meta>,
    documents: HashMap<EntityId, Vec<Document>>,
    members: HashMap<EntityId, Vec<EntityId>>,
    assistants: HashMap<EntityId, Vec<EntityId>>,
    owners: HashMap<EntityId, EntityId>,
}

/// In-process directory.
///
/// Mirrors the lookups of a real entity store: a group without a stored
/// roster but with a known owner reports `[owner]`, and the owner is always
/// listed first.
#[derive(Default)]
pub struct MemoryDirectory {
    records: RwLock<Records>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_owner(&self, group: &EntityId, owner: &EntityId) {
        self.records
            .write()
            .owners
            .insert(group.clone(), owner.clone());
    }

    pub fn set_assistants(&self, group: &EntityId, assistants: &[EntityId]) {
        self.records
            .write()
            .assistants
            .insert(group.clone(), assistants.to_vec());
    }
}

impl Directory for MemoryDirectory {
    fn meta(&self, id: &EntityId) -> Option<Meta> {
        self.records.read().metas.get(id).cloned()
    }

    fn documents(&self, id: &EntityId) -> Vec<Document> {
        self.records
            .read()
            .documents
            .get(id)
            .cloned()
            .unwrap_or_default()
    }

    fn has_encryption_key(&self, id: &EntityId) -> bool {
        self.records
            .read()
            .documents
            .get(id)
            .is_some_and(|docs| docs.iter().any(Document::has_encryption_key))
    }

    fn members(&self, group: &EntityId) -> Option<Vec<EntityId>> {
        let records = self.records.read();
        let owner = records.owners.get(group);
        match (records.members.get(group), owner) {
            (Some(members), _) if !members.is_empty() => {
                let mut members = members.clone();
                if let Some(owner) = owner {
                    if let Some(pos) = members.iter().position(|m| m == owner) {
                        members[..=pos].rotate_right(1);
                    }
                }
                Some(members)
            }
            (_, Some(owner)) => Some(vec![owner.clone()]),
            _ => None,
        }
    }

    fn assistants(&self, group: &EntityId) -> Option<Vec<EntityId>> {
        self.records.read().assistants.get(group).cloned()
    }

    fn owner(&self, group: &EntityId) -> Option<EntityId> {
        self.records.read().owners.get(group).cloned()
    }

    fn save_meta(&self, id: &EntityId, meta: Meta) -> bool {
        self.records.write().metas.insert(id.clone(), meta);
        true
    }

    /// Keeps only the newest document per type.
    fn save_document(&self, document: Document) -> bool {
        let mut records = self.records.write();
        let docs = records.documents.entry(document.did.clone()).or_default();
        match docs.iter_mut().find(|d| d.doc_type == document.doc_type) {
            Some(existing) if existing.time >= document.time => false,
            Some(existing) => {
                *existing = document;
                true
            }
            None => {
                docs.push(document);
                true
            }
        }
    }

    fn save_members(&self, group: &EntityId, members: &[EntityId]) -> bool {
        self.records
            .write()
            .members
            .insert(group.clone(), members.to_vec());
        true
    }
}

use crate::{Resource, ResourceId};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// One entry of the start payload. `order` is positional and derived when the payload
/// is built; it is never stored on the selection itself.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PayloadItem {
    pub id: ResourceId,
    #[serde(rename = "name_fr")]
    pub name: String,
    #[serde(rename = "slug_fr")]
    pub slug: String,
    pub level: i64,
    pub order: usize,
    #[serde(rename = "img_blob")]
    pub thumbnail: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StartPayload {
    pub item_ids: Vec<ResourceId>,
    pub items: Vec<PayloadItem>,
}

/// Ordered, duplicate-free set of resources the operator picked.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SelectionStore {
    items: Vec<Resource>,
}

impl SelectionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed from the server-persisted selection.
    pub fn hydrate(items: Vec<Resource>) -> Self {
        let mut store = Self::new();
        store.replace(items);
        store
    }

    /// Whole-list replacement from the picker. Later duplicates of an id are dropped;
    /// returns how many were dropped.
    pub fn replace(&mut self, items: Vec<Resource>) -> usize {
        let incoming = items.len();
        let mut seen = HashSet::with_capacity(incoming);
        self.items = items
            .into_iter()
            .filter(|item| seen.insert(item.id))
            .collect();
        incoming - self.items.len()
    }

    pub fn items(&self) -> &[Resource] {
        &self.items
    }

    pub fn ids(&self) -> Vec<ResourceId> {
        self.items.iter().map(|item| item.id).collect()
    }

    pub fn contains(&self, id: ResourceId) -> bool {
        self.items.iter().any(|item| item.id == id)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Builds the `start_script` arguments from the selection as it is right now.
    pub fn build_payload(&self) -> StartPayload {
        StartPayload {
            item_ids: self.ids(),
            items: self
                .items
                .iter()
                .enumerate()
                .map(|(order, item)| PayloadItem {
                    id: item.id,
                    name: item.display_name.clone(),
                    slug: item.slug.clone(),
                    level: item.level,
                    order,
                    thumbnail: item.thumbnail.clone(),
                })
                .collect(),
        }
    }
}

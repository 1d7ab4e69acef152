use crate::config::{endpoint_url, ITEMS_PATH, SELECTION_PATH};
use crate::gateway::fetch_json;
use opsdeck_core::{
    command::{DispatchError, DEFAULT_COMMAND_TIMEOUT},
    Resource, ResourceId, ResourceList, SaveSelectionAck,
};
use serde_json::{json, Value};
use std::{collections::HashMap, time::Duration};
use tracing::warn;
use url::Url;

pub const DEFAULT_SEARCH_LIMIT: usize = 20;
pub const DEFAULT_IDS_LIMIT: usize = 200;

/// Client for the backend's resource listing and persisted-selection endpoints.
#[derive(Clone, Debug)]
pub struct CatalogClient {
    client: reqwest::Client,
    base_url: Url,
    timeout: Duration,
}

impl CatalogClient {
    pub fn new(base_url: &Url) -> Self {
        Self::with_client(reqwest::Client::new(), base_url)
    }

    pub fn with_client(client: reqwest::Client, base_url: &Url) -> Self {
        Self {
            client,
            base_url: base_url.clone(),
            timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub async fn search(&self, query: &str, limit: usize) -> Result<Vec<Resource>, DispatchError> {
        let mut url = endpoint_url(&self.base_url, ITEMS_PATH);
        {
            let mut pairs = url.query_pairs_mut();
            if !query.trim().is_empty() {
                pairs.append_pair("query", query.trim());
            }
            pairs.append_pair("limit", &limit.to_string());
        }
        let body = fetch_json(self.client.get(url), self.timeout).await?;
        items_from(body)
    }

    /// Resolve ids to resources, returned in the order the ids were given. Unknown ids
    /// are skipped.
    pub async fn by_ids(
        &self,
        ids: &[ResourceId],
        limit: usize,
    ) -> Result<Vec<Resource>, DispatchError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let joined = ids
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",");
        let mut url = endpoint_url(&self.base_url, ITEMS_PATH);
        url.query_pairs_mut()
            .append_pair("ids", &joined)
            .append_pair("limit", &limit.to_string());
        let body = fetch_json(self.client.get(url), self.timeout).await?;
        Ok(order_by_ids(items_from(body)?, ids))
    }

    pub async fn load_selection(&self) -> Result<Vec<Resource>, DispatchError> {
        let url = endpoint_url(&self.base_url, SELECTION_PATH);
        let body = fetch_json(self.client.get(url), self.timeout).await?;
        items_from(body)
    }

    pub async fn save_selection(
        &self,
        ids: &[ResourceId],
    ) -> Result<SaveSelectionAck, DispatchError> {
        let url = endpoint_url(&self.base_url, SELECTION_PATH);
        let body = fetch_json(
            self.client.post(url).json(&json!({ "ids": ids })),
            self.timeout,
        )
        .await?;
        Ok(serde_json::from_value(body).unwrap_or_default())
    }
}

fn items_from(body: Value) -> Result<Vec<Resource>, DispatchError> {
    let list = ResourceList::from_value(body).map_err(|err| {
        warn!(event = "catalog_listing_unreadable", error = %err);
        DispatchError::Decode(err)
    })?;
    for error in &list.skipped {
        warn!(event = "catalog_item_skipped", %error);
    }
    Ok(list.items)
}

pub fn order_by_ids(items: Vec<Resource>, ids: &[ResourceId]) -> Vec<Resource> {
    let mut by_id: HashMap<ResourceId, Resource> =
        items.into_iter().map(|item| (item.id, item)).collect();
    ids.iter().filter_map(|id| by_id.remove(id)).collect()
}

/// Add/remove toggling over the current selection. Every change yields the complete
/// new list, which is what the selection store accepts.
#[derive(Debug, Clone, Default)]
pub struct Picker {
    selected: Vec<Resource>,
}

impl Picker {
    pub fn new(selected: &[Resource]) -> Self {
        Self {
            selected: selected.to_vec(),
        }
    }

    pub fn selected(&self) -> &[Resource] {
        &self.selected
    }

    pub fn is_selected(&self, id: ResourceId) -> bool {
        self.selected.iter().any(|item| item.id == id)
    }

    pub fn toggle(&mut self, resource: Resource) -> Vec<Resource> {
        if self.is_selected(resource.id) {
            self.remove(resource.id)
        } else {
            self.selected.push(resource);
            self.selected.clone()
        }
    }

    /// Add `resource` unless it is already picked. Used when a lookup settles after
    /// the selection moved on, where toggling could remove it again.
    pub fn insert(&mut self, resource: Resource) -> Vec<Resource> {
        if !self.is_selected(resource.id) {
            self.selected.push(resource);
        }
        self.selected.clone()
    }

    pub fn remove(&mut self, id: ResourceId) -> Vec<Resource> {
        self.selected.retain(|item| item.id != id);
        self.selected.clone()
    }

    pub fn clear(&mut self) -> Vec<Resource> {
        self.selected.clear();
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn catalog_for(server: &MockServer) -> CatalogClient {
        CatalogClient::new(&Url::parse(&server.uri()).unwrap())
    }

    fn item(id: ResourceId, name: &str) -> Value {
        json!({"id": id, "name_fr": name, "slug_fr": name.to_lowercase(), "level": 1, "img_blob": ""})
    }

    #[tokio::test]
    async fn search_sends_query_and_limit() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/items"))
            .and(query_param("query", "fer"))
            .and(query_param("limit", "24"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"items": [item(3, "Fer")]})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let items = catalog_for(&server).search(" fer ", 24).await.expect("search");
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].display_name, "Fer");
    }

    #[tokio::test]
    async fn by_ids_skips_request_for_empty_list_and_keeps_requested_order() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/items"))
            .and(query_param("ids", "9,2,5"))
            .and(query_param("limit", "200"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "items": [item(2, "B"), item(5, "E"), item(9, "I")]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let catalog = catalog_for(&server);
        assert!(catalog.by_ids(&[], DEFAULT_IDS_LIMIT).await.unwrap().is_empty());
        let items = catalog.by_ids(&[9, 2, 5], DEFAULT_IDS_LIMIT).await.unwrap();
        let ids: Vec<ResourceId> = items.iter().map(|item| item.id).collect();
        assert_eq!(ids, vec![9, 2, 5]);
    }

    #[tokio::test]
    async fn selection_round_trip_endpoints() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/selection"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "items": [item(4, "D"), item(1, "A")]
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/selection"))
            .and(body_json(json!({"ids": [4, 1]})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true, "count": 2})))
            .expect(1)
            .mount(&server)
            .await;

        let catalog = catalog_for(&server);
        let loaded = catalog.load_selection().await.expect("load");
        assert_eq!(loaded.iter().map(|i| i.id).collect::<Vec<_>>(), vec![4, 1]);
        let ack = catalog.save_selection(&[4, 1]).await.expect("save");
        assert_eq!(ack, SaveSelectionAck { ok: true, count: 2 });
    }

    #[tokio::test]
    async fn missing_items_field_is_an_empty_listing() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/selection"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
            .mount(&server)
            .await;
        assert!(catalog_for(&server).load_selection().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn one_unreadable_item_does_not_hide_the_listing() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/items"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"items": [
                {"id": 1, "name_fr": "Blé", "slug_fr": "ble", "level": null, "img_blob": null},
                {"name_fr": "sans id"},
                item(2, "Orge")
            ]})))
            .mount(&server)
            .await;

        let items = catalog_for(&server).search("", 10).await.expect("search");
        let ids: Vec<ResourceId> = items.iter().map(|item| item.id).collect();
        assert_eq!(ids, vec![1, 2]);
        assert!(items[0].thumbnail.is_empty());
        assert_eq!(items[0].level, 0);
    }

    #[tokio::test]
    async fn unreadable_listing_is_an_error_not_an_empty_result() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/selection"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"items": "none"})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/items"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([item(1, "A")])))
            .mount(&server)
            .await;

        let catalog = catalog_for(&server);
        let err = catalog.load_selection().await.expect_err("bad envelope");
        assert!(matches!(err, DispatchError::Decode(_)));
        let err = catalog.by_ids(&[1], DEFAULT_IDS_LIMIT).await.expect_err("bare array");
        assert!(matches!(err, DispatchError::Decode(_)));
    }

    #[test]
    fn picker_toggles_and_preserves_insertion_order() {
        let a = Resource::new(1, "A", "a");
        let b = Resource::new(2, "B", "b");
        let c = Resource::new(3, "C", "c");
        let mut picker = Picker::default();
        picker.toggle(b.clone());
        picker.toggle(a.clone());
        let list = picker.toggle(c.clone());
        assert_eq!(list, vec![b.clone(), a.clone(), c.clone()]);

        let list = picker.toggle(a.clone());
        assert_eq!(list, vec![b.clone(), c.clone()]);
        assert!(!picker.is_selected(1));
        assert!(picker.clear().is_empty());
    }

    #[test]
    fn picker_insert_never_removes() {
        let a = Resource::new(1, "A", "a");
        let mut picker = Picker::new(&[a.clone()]);
        assert_eq!(picker.insert(a.clone()), vec![a.clone()]);
        let b = Resource::new(2, "B", "b");
        assert_eq!(picker.insert(b.clone()), vec![a, b]);
    }
}

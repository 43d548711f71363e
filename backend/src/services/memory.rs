// In-memory collaborators for development and tests

use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{
    CollaboratorError, CollaboratorResult, Lead, LeadStore, LeadUpdate, ListMembershipStore, NewCalendarEvent, NewTask,
    TaskService,
};

#[cfg(test)]
pub use recording::RecordingSender;

#[derive(Debug, Clone, Default)]
pub struct MemoryLeadStore {
    leads: Arc<RwLock<HashMap<Uuid, Lead>>>,
}

impl MemoryLeadStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, lead_id: Uuid) -> Option<Lead> {
        self.leads.read().await.get(&lead_id).cloned()
    }
}

#[cfg(test)]
impl MemoryLeadStore {
    pub async fn insert(&self, lead: Lead) {
        self.leads.write().await.insert(lead.id, lead);
    }

    /// Create a lead with the given attributes and return its id
    pub async fn create(&self, attributes: serde_json::Value) -> Uuid {
        let id = Uuid::new_v4();
        self.insert(Lead::new(id, attributes)).await;
        id
    }

    pub async fn set_field(&self, lead_id: Uuid, field: &str, value: serde_json::Value) {
        if let Some(lead) = self.leads.write().await.get_mut(&lead_id) {
            if let Some(map) = lead.attributes.as_object_mut() {
                map.insert(field.to_string(), value);
            }
        }
    }
}

#[async_trait]
impl LeadStore for MemoryLeadStore {
    async fn get_lead(&self, lead_id: Uuid) -> CollaboratorResult<Option<Lead>> {
        Ok(self.get(lead_id).await)
    }

    async fn update_lead(&self, lead_id: Uuid, update: &LeadUpdate) -> CollaboratorResult<Lead> {
        let mut leads = self.leads.write().await;
        let lead = leads.get_mut(&lead_id).ok_or(CollaboratorError::LeadNotFound(lead_id))?;
        update.apply_to(&mut lead.attributes);
        Ok(lead.clone())
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryTaskService {
    tasks: Arc<RwLock<Vec<(Uuid, NewTask)>>>,
    events: Arc<RwLock<Vec<(Uuid, NewCalendarEvent)>>>,
}

impl MemoryTaskService {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
impl MemoryTaskService {
    pub async fn tasks(&self) -> Vec<NewTask> {
        self.tasks.read().await.iter().map(|(_, t)| t.clone()).collect()
    }

    pub async fn events(&self) -> Vec<NewCalendarEvent> {
        self.events.read().await.iter().map(|(_, e)| e.clone()).collect()
    }
}

#[async_trait]
impl TaskService for MemoryTaskService {
    async fn create_task(&self, task: &NewTask) -> CollaboratorResult<Uuid> {
        let id = Uuid::new_v4();
        self.tasks.write().await.push((id, task.clone()));
        Ok(id)
    }

    async fn create_calendar_event(&self, event: &NewCalendarEvent) -> CollaboratorResult<Uuid> {
        if event.ends_at < event.starts_at {
            return Err(CollaboratorError::rejected("calendar", "event ends before it starts"));
        }
        let id = Uuid::new_v4();
        self.events.write().await.push((id, event.clone()));
        Ok(id)
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryListStore {
    lists: Arc<RwLock<HashMap<String, BTreeSet<Uuid>>>>,
}

impl MemoryListStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ListMembershipStore for MemoryListStore {
    async fn add(&self, list_id: &str, lead_id: Uuid) -> CollaboratorResult<bool> {
        Ok(self.lists.write().await.entry(list_id.to_string()).or_default().insert(lead_id))
    }

    async fn remove(&self, list_id: &str, lead_id: Uuid) -> CollaboratorResult<bool> {
        Ok(self
            .lists
            .write()
            .await
            .get_mut(list_id)
            .is_some_and(|members| members.remove(&lead_id)))
    }

    async fn members(&self, list_id: &str) -> CollaboratorResult<Vec<Uuid>> {
        Ok(self
            .lists
            .read()
            .await
            .get(list_id)
            .map(|m| m.iter().copied().collect())
            .unwrap_or_default())
    }
}

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error};

use tokenflow_core::scheduler::{JobDescriptor, JobId, JobParameter, JobService, ScheduledJob};
use tokenflow_core::{
    CoreError, Incident, IncidentService, ProcessDefinition, ProcessDefinitionId,
    ProcessDefinitionRepository, SchedulerError,
};

/// In-memory implementation of the ProcessDefinitionRepository
#[derive(Debug, Default, Clone)]
pub struct InMemoryProcessDefinitionRepository {
    definitions: Arc<RwLock<HashMap<ProcessDefinitionId, ProcessDefinition>>>,
}

impl InMemoryProcessDefinitionRepository {
    /// Create an empty repository
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProcessDefinitionRepository for InMemoryProcessDefinitionRepository {
    async fn find_by_id(
        &self,
        id: ProcessDefinitionId,
    ) -> Result<Option<ProcessDefinition>, CoreError> {
        let definitions = self.definitions.read().await;
        Ok(definitions.get(&id).cloned())
    }

    async fn save(&self, definition: &ProcessDefinition) -> Result<(), CoreError> {
        let mut definitions = self.definitions.write().await;
        definitions.insert(definition.id, definition.clone());
        Ok(())
    }

    async fn delete(&self, id: ProcessDefinitionId) -> Result<(), CoreError> {
        let mut definitions = self.definitions.write().await;
        definitions.remove(&id);
        Ok(())
    }

    async fn list_definitions(&self) -> Result<Vec<ProcessDefinitionId>, CoreError> {
        let definitions = self.definitions.read().await;
        let mut ids: Vec<ProcessDefinitionId> = definitions.keys().copied().collect();
        ids.sort();
        Ok(ids)
    }
}

/// In-memory job descriptor storage; job names are unique
#[derive(Debug, Default)]
pub struct InMemoryJobService {
    jobs: DashMap<JobId, ScheduledJob>,
    names: DashMap<String, JobId>,
}

impl InMemoryJobService {
    /// Create an empty job store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of persisted jobs
    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    /// Whether no job is persisted
    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Names of the persisted jobs, sorted
    pub fn job_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.names.iter().map(|entry| entry.key().clone()).collect();
        names.sort();
        names
    }
}

#[async_trait]
impl JobService for InMemoryJobService {
    async fn create_job_descriptor(
        &self,
        descriptor: JobDescriptor,
        parameters: Vec<JobParameter>,
    ) -> Result<ScheduledJob, SchedulerError> {
        let job = ScheduledJob {
            id: JobId::new(),
            descriptor,
            parameters,
        };
        match self.names.entry(job.descriptor.job_name.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(SchedulerError::JobDescriptorCreation(format!(
                    "Job '{}' already exists",
                    job.descriptor.job_name
                )));
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(job.id.clone());
            }
        }
        self.jobs.insert(job.id.clone(), job.clone());
        debug!(job_name = %job.descriptor.job_name, job_id = %job.id, "Job descriptor created");
        Ok(job)
    }

    async fn get_job(&self, job_id: &JobId) -> Result<Option<ScheduledJob>, SchedulerError> {
        Ok(self.jobs.get(job_id).map(|job| job.clone()))
    }

    async fn find_job_by_name(
        &self,
        job_name: &str,
    ) -> Result<Option<ScheduledJob>, SchedulerError> {
        let Some(job_id) = self.names.get(job_name).map(|id| id.clone()) else {
            return Ok(None);
        };
        Ok(self.jobs.get(&job_id).map(|job| job.clone()))
    }

    async fn delete_job(&self, job_name: &str) -> Result<bool, SchedulerError> {
        match self.names.remove(job_name) {
            Some((_, job_id)) => {
                self.jobs.remove(&job_id);
                debug!(job_name, "Job descriptor deleted");
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

/// Keeps reported incidents in memory and logs them
#[derive(Debug, Default)]
pub struct InMemoryIncidentService {
    incidents: Mutex<Vec<Incident>>,
}

impl InMemoryIncidentService {
    /// Create an empty incident log
    pub fn new() -> Self {
        Self::default()
    }

    /// Incidents reported so far
    pub fn incidents(&self) -> Vec<Incident> {
        self.incidents.lock().clone()
    }
}

#[async_trait]
impl IncidentService for InMemoryIncidentService {
    async fn report(&self, incident: Incident) {
        error!(
            tenant_id = %incident.tenant_id,
            description = %incident.description,
            cause = %incident.cause,
            recovery_procedure = %incident.recovery_procedure,
            "Incident"
        );
        self.incidents.lock().push(incident);
    }
}

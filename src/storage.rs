use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::RwLock;

use crate::types::{ApprovalStatus, ProjectCandidate, StudentProfile, SupervisorInfo};

/// Restricts which approved projects are returned
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CandidateFilter {
    /// Empty means every specialization
    pub specializations: Vec<String>,
}

impl CandidateFilter {
    pub fn matches(&self, project: &ProjectCandidate) -> bool {
        project.status == ApprovalStatus::Approved
            && (self.specializations.is_empty()
                || self
                    .specializations
                    .iter()
                    .any(|s| s.eq_ignore_ascii_case(&project.specialization)))
    }
}

/// Read-only queries the pipeline needs from persistence.
#[async_trait]
pub trait RecommendationStore: Send + Sync {
    async fn fetch_student_profile(&self, student_id: &str) -> Result<Option<StudentProfile>>;

    /// Approved projects only, in a stable order.
    async fn fetch_candidate_projects(&self, filter: &CandidateFilter) -> Result<Vec<ProjectCandidate>>;

    async fn fetch_supervisor(&self, supervisor_id: &str) -> Result<Option<SupervisorInfo>>;
}

/// Store backed by in-process maps, used by tests and local runs
#[derive(Default)]
pub struct InMemoryStore {
    profiles: RwLock<HashMap<String, StudentProfile>>,
    projects: RwLock<Vec<ProjectCandidate>>,
    supervisors: RwLock<HashMap<String, SupervisorInfo>>,
    candidate_fetches: AtomicUsize,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert_profile(&self, profile: StudentProfile) {
        self.profiles.write().insert(profile.student_id.clone(), profile);
    }

    pub fn remove_profile(&self, student_id: &str) -> Option<StudentProfile> {
        self.profiles.write().remove(student_id)
    }

    /// Insert or replace by project id, keeping first-insertion order.
    pub fn upsert_project(&self, project: ProjectCandidate) {
        let mut projects = self.projects.write();
        match projects.iter_mut().find(|p| p.project_id == project.project_id) {
            Some(existing) => *existing = project,
            None => projects.push(project),
        }
    }

    pub fn upsert_supervisor(&self, supervisor: SupervisorInfo) {
        self.supervisors
            .write()
            .insert(supervisor.supervisor_id.clone(), supervisor);
    }

    /// Number of `fetch_candidate_projects` calls served so far
    pub fn candidate_fetches(&self) -> usize {
        self.candidate_fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RecommendationStore for InMemoryStore {
    async fn fetch_student_profile(&self, student_id: &str) -> Result<Option<StudentProfile>> {
        Ok(self.profiles.read().get(student_id).cloned())
    }

    async fn fetch_candidate_projects(&self, filter: &CandidateFilter) -> Result<Vec<ProjectCandidate>> {
        self.candidate_fetches.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .projects
            .read()
            .iter()
            .filter(|p| filter.matches(p))
            .cloned()
            .collect())
    }

    async fn fetch_supervisor(&self, supervisor_id: &str) -> Result<Option<SupervisorInfo>> {
        Ok(self.supervisors.read().get(supervisor_id).cloned())
    }
}

//! Read-only view of the course catalogue: who teaches and who manages a
//! course offering, and how to reach them.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;

use crate::error::{CourseHubError, Result};

/// Assignment of a course offering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    pub course_offering_id: String,
    pub facilitator_id: String,
    pub manager_id: String,
    pub module_name: String,
    pub module_code: String,
}

impl Assignment {
    /// "Data Structures (CS201)".
    pub fn module_label(&self) -> String {
        format!("{} ({})", self.module_name, self.module_code)
    }
}

/// Name + email of a manager or facilitator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    pub id: String,
    pub name: String,
    pub email: String,
}

/// Catalogue lookups the compliance core depends on.
pub trait Directory: Send + Sync {
    /// `NotFound` when the course offering does not exist.
    fn find_assignment(&self, course_offering_id: &str) -> Result<Assignment>;

    fn find_facilitator(&self, facilitator_id: &str) -> Result<Contact>;

    fn find_manager(&self, manager_id: &str) -> Result<Contact>;

    /// Ids of the facilitators reporting to a manager.
    fn managed_facilitators(&self, manager_id: &str) -> Result<Vec<String>>;
}

/// In-memory directory, for tests and single-process demos.
#[derive(Debug, Default)]
pub struct StaticDirectory {
    inner: RwLock<StaticInner>,
}

#[derive(Debug, Default)]
struct StaticInner {
    assignments: HashMap<String, Assignment>,
    facilitators: HashMap<String, (Contact, Option<String>)>,
    managers: HashMap<String, Contact>,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_manager(&self, id: &str, name: &str, email: &str) {
        if let Ok(mut inner) = self.inner.write() {
            inner.managers.insert(
                id.into(),
                Contact {
                    id: id.into(),
                    name: name.into(),
                    email: email.into(),
                },
            );
        }
    }

    pub fn add_facilitator(&self, id: &str, name: &str, email: &str, manager_id: Option<&str>) {
        if let Ok(mut inner) = self.inner.write() {
            inner.facilitators.insert(
                id.into(),
                (
                    Contact {
                        id: id.into(),
                        name: name.into(),
                        email: email.into(),
                    },
                    manager_id.map(String::from),
                ),
            );
        }
    }

    pub fn add_assignment(&self, assignment: Assignment) {
        if let Ok(mut inner) = self.inner.write() {
            inner
                .assignments
                .insert(assignment.course_offering_id.clone(), assignment);
        }
    }

    /// Move a course offering to another manager.
    pub fn reassign_manager(&self, course_offering_id: &str, manager_id: &str) {
        if let Ok(mut inner) = self.inner.write() {
            if let Some(a) = inner.assignments.get_mut(course_offering_id) {
                a.manager_id = manager_id.into();
            }
        }
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, StaticInner>> {
        self.inner
            .read()
            .map_err(|_| CourseHubError::Database("directory lock poisoned".into()))
    }
}

impl Directory for StaticDirectory {
    fn find_assignment(&self, course_offering_id: &str) -> Result<Assignment> {
        self.read()?
            .assignments
            .get(course_offering_id)
            .cloned()
            .ok_or_else(|| {
                CourseHubError::NotFound(format!("Course offering {course_offering_id}"))
            })
    }

    fn find_facilitator(&self, facilitator_id: &str) -> Result<Contact> {
        self.read()?
            .facilitators
            .get(facilitator_id)
            .map(|(c, _)| c.clone())
            .ok_or_else(|| CourseHubError::NotFound(format!("Facilitator {facilitator_id}")))
    }

    fn find_manager(&self, manager_id: &str) -> Result<Contact> {
        self.read()?
            .managers
            .get(manager_id)
            .cloned()
            .ok_or_else(|| CourseHubError::NotFound(format!("Manager {manager_id}")))
    }

    fn managed_facilitators(&self, manager_id: &str) -> Result<Vec<String>> {
        let mut ids: Vec<String> = self
            .read()?
            .facilitators
            .iter()
            .filter(|(_, (_, m))| m.as_deref() == Some(manager_id))
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }
}

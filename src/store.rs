//! Read access to configured projects.
//!
//! The supervisor reads project records through [`ProjectStore`] and never edits them.
//! [`ProjectCatalog`] is the in-memory store seeded from `pitboss.toml`.

use std::path::PathBuf;

use anyhow::Result;
use parking_lot::RwLock;

use crate::config::load_config;
use crate::process::Project;

pub trait ProjectStore: Send + Sync {
    /// Looks up one project by id.
    fn project(&self, id: &str) -> Result<Option<Project>>;

    /// All configured projects in configuration order.
    fn projects(&self) -> Result<Vec<Project>>;

    /// Forgets a project. Returns whether it existed.
    fn remove(&self, id: &str) -> Result<bool>;

    /// Refreshes records from their source. Returns the number of projects now known.
    fn reload(&self) -> Result<usize> {
        Ok(self.projects()?.len())
    }
}

/// Project records loaded from the configuration file.
pub struct ProjectCatalog {
    source: Option<PathBuf>,
    projects: RwLock<Vec<Project>>,
}

impl ProjectCatalog {
    pub fn new(projects: Vec<Project>) -> Self {
        Self {
            source: None,
            projects: RwLock::new(projects),
        }
    }

    /// A catalog that can be refreshed from `path`.
    pub fn with_source(projects: Vec<Project>, path: PathBuf) -> Self {
        Self {
            source: Some(path),
            projects: RwLock::new(projects),
        }
    }
}

impl ProjectStore for ProjectCatalog {
    fn project(&self, id: &str) -> Result<Option<Project>> {
        Ok(self.projects.read().iter().find(|p| p.id == id).cloned())
    }

    fn projects(&self) -> Result<Vec<Project>> {
        Ok(self.projects.read().clone())
    }

    fn remove(&self, id: &str) -> Result<bool> {
        let mut projects = self.projects.write();
        let before = projects.len();
        projects.retain(|p| p.id != id);
        Ok(projects.len() != before)
    }

    /// Re-reads the configuration file and replaces the project list.
    fn reload(&self) -> Result<usize> {
        let Some(path) = &self.source else {
            return Ok(self.projects.read().len());
        };
        let config = load_config(path)?;
        let projects = config.project_records();
        let count = projects.len();
        *self.projects.write() = projects;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn project(id: &str) -> Project {
        Project {
            id: id.into(),
            name: id.into(),
            path: "/tmp".into(),
            command: "true".into(),
            auto_restart: false,
            email_on_crash: false,
            tags: Vec::new(),
        }
    }

    #[test]
    fn lookup_and_remove() {
        let catalog = ProjectCatalog::new(vec![project("web"), project("api")]);
        assert_eq!(catalog.project("api").unwrap().unwrap().id, "api");
        assert!(catalog.project("nope").unwrap().is_none());
        assert!(catalog.remove("web").unwrap());
        assert!(!catalog.remove("web").unwrap());
        assert_eq!(catalog.projects().unwrap().len(), 1);
    }

    #[test]
    fn reload_reads_source_file() {
        let path = std::env::temp_dir().join(format!("pitboss-store-{}.toml", std::process::id()));
        std::fs::write(
            &path,
            "[[project]]\nid = \"a\"\npath = \"/\"\ncommand = \"true\"\n\n[[project]]\nid = \"b\"\npath = \"/\"\ncommand = \"true\"\n",
        )
        .unwrap();
        let catalog = ProjectCatalog::with_source(Vec::new(), path.clone());
        assert_eq!(catalog.reload().unwrap(), 2);
        assert!(catalog.project("b").unwrap().is_some());
        std::fs::remove_file(&path).unwrap();
        assert!(catalog.reload().is_err());
        assert_eq!(catalog.projects().unwrap().len(), 2);
    }
}

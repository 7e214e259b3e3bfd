//! Project registrations written by the CLI; the bridge only reads them.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProjectsError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectRegistration {
    pub id: String,
    pub machine_id: String,
    pub absolute_path: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_remote_url: Option<String>,
}

/// A missing manifest is an empty project list, not an error.
pub fn load_projects(config_dir: &Path) -> Result<Vec<ProjectRegistration>, ProjectsError> {
    let path = config_dir.join("projects.json");
    if !path.exists() {
        return Ok(Vec::new());
    }
    let raw = std::fs::read_to_string(&path).map_err(|source| ProjectsError::Io {
        path: path.clone(),
        source,
    })?;
    serde_json::from_str(&raw).map_err(|source| ProjectsError::Parse { path, source })
}

/// Longest-prefix match: the project whose path equals `cwd` or is an
/// ancestor of it (component-wise), preferring the deepest such project.
pub fn find_project_for_cwd<'a>(
    projects: &'a [ProjectRegistration],
    cwd: &str,
) -> Option<&'a ProjectRegistration> {
    let cwd = Path::new(cwd);
    projects
        .iter()
        .filter(|project| cwd.starts_with(Path::new(&project.absolute_path)))
        .max_by_key(|project| Path::new(&project.absolute_path).components().count())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn project(id: &str, path: &str) -> ProjectRegistration {
        ProjectRegistration {
            id: id.to_string(),
            machine_id: "m-1".to_string(),
            absolute_path: path.to_string(),
            name: id.to_string(),
            git_branch: None,
            git_remote_url: None,
        }
    }

    #[test]
    fn longest_prefix_wins() {
        let projects = vec![project("outer", "/a"), project("inner", "/a/b")];

        let inner = find_project_for_cwd(&projects, "/a/b/c").unwrap();
        assert_eq!(inner.id, "inner");

        let outer = find_project_for_cwd(&projects, "/a/x").unwrap();
        assert_eq!(outer.id, "outer");

        assert!(find_project_for_cwd(&projects, "/other").is_none());
    }

    #[test]
    fn prefix_match_is_component_wise() {
        let projects = vec![project("repo", "/home/user/repo")];
        // "/home/user/repo2" shares a string prefix but not a path prefix.
        assert!(find_project_for_cwd(&projects, "/home/user/repo2").is_none());
        assert!(find_project_for_cwd(&projects, "/home/user/repo").is_some());
    }

    #[test]
    fn missing_manifest_yields_empty_list() {
        let dir = tempfile::tempdir().unwrap();
        let projects = load_projects(dir.path()).unwrap();
        assert!(projects.is_empty());
    }

    #[test]
    fn manifest_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let body = serde_json::json!([{
            "id": "p-1",
            "machineId": "m-1",
            "absolutePath": "/repo",
            "name": "repo",
            "gitBranch": "main"
        }]);
        std::fs::write(dir.path().join("projects.json"), body.to_string()).unwrap();

        let projects = load_projects(dir.path()).unwrap();
        assert_eq!(projects.len(), 1);
        assert_eq!(projects[0].git_branch.as_deref(), Some("main"));
        assert!(projects[0].git_remote_url.is_none());
    }
}

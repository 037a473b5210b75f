//! The project classifier collaborator.
//!
//! [`ManifestClassifier`] derives a profile from the submitted files
//! themselves: it counts files, reads dependency manifests it recognizes
//! and estimates build time from both.

use async_trait::async_trait;
use tracing::debug;

use crate::types::{ProjectFile, ProjectProfile};

#[async_trait]
pub trait ProjectClassifier: Send + Sync + 'static {
    async fn classify(&self, files: &[ProjectFile]) -> anyhow::Result<ProjectProfile>;
}

/// Always returns the same profile.
pub struct StaticClassifier {
    profile: ProjectProfile,
}

impl StaticClassifier {
    pub fn new(file_count: u32, dependency_count: u32, estimated_build_secs: u64) -> Self {
        Self {
            profile: ProjectProfile {
                file_count,
                dependency_count,
                estimated_build_secs,
            },
        }
    }
}

#[async_trait]
impl ProjectClassifier for StaticClassifier {
    async fn classify(&self, _files: &[ProjectFile]) -> anyhow::Result<ProjectProfile> {
        Ok(self.profile)
    }
}

/// Seconds every build pays regardless of size.
const BASE_BUILD_SECS: u64 = 10;
/// Additional seconds per declared dependency.
const SECS_PER_DEPENDENCY: u64 = 3;
/// Files processed per additional build second.
const FILES_PER_SEC: u64 = 10;

#[derive(Default)]
pub struct ManifestClassifier;

impl ManifestClassifier {
    pub fn new() -> Self {
        Self
    }

    fn dependencies(file: &ProjectFile) -> anyhow::Result<u32> {
        let count = match file.file_name() {
            "package.json" => {
                let manifest: serde_json::Value = serde_json::from_str(&file.contents)?;
                ["dependencies", "devDependencies"]
                    .iter()
                    .filter_map(|k| manifest.get(*k).and_then(|v| v.as_object()))
                    .map(|deps| deps.len())
                    .sum()
            }
            "requirements.txt" => file
                .contents
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty() && !l.starts_with('#') && !l.starts_with('-'))
                .count(),
            "Cargo.toml" => {
                let manifest: toml::Table = toml::from_str(&file.contents)?;
                ["dependencies", "dev-dependencies", "build-dependencies"]
                    .iter()
                    .filter_map(|k| manifest.get(*k).and_then(|v| v.as_table()))
                    .map(|deps| deps.len())
                    .sum()
            }
            "go.mod" => file
                .contents
                .lines()
                .map(str::trim)
                .filter(|l| {
                    let l = l.strip_prefix("require ").unwrap_or(l);
                    !l.is_empty()
                        && !l.starts_with("module ")
                        && !l.starts_with("go ")
                        && !l.starts_with("//")
                        && l.contains(" v")
                })
                .count(),
            _ => 0,
        };
        Ok(u32::try_from(count).unwrap_or(u32::MAX))
    }
}

#[async_trait]
impl ProjectClassifier for ManifestClassifier {
    async fn classify(&self, files: &[ProjectFile]) -> anyhow::Result<ProjectProfile> {
        let file_count = u32::try_from(files.len()).unwrap_or(u32::MAX);
        let mut dependency_count = 0u32;
        for file in files {
            match Self::dependencies(file) {
                Ok(n) => dependency_count = dependency_count.saturating_add(n),
                // An unreadable manifest contributes nothing.
                Err(e) => debug!(path = %file.path, error = %e, "skipping unparseable manifest"),
            }
        }
        let estimated_build_secs = BASE_BUILD_SECS
            + u64::from(dependency_count) * SECS_PER_DEPENDENCY
            + u64::from(file_count) / FILES_PER_SEC;
        Ok(ProjectProfile {
            file_count,
            dependency_count,
            estimated_build_secs,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn counts_node_dependencies() {
        let files = vec![
            ProjectFile::new("index.js", "console.log('hi')"),
            ProjectFile::new(
                "package.json",
                r#"{"name":"x","dependencies":{"express":"^4","pg":"^8"},"devDependencies":{"jest":"^29"}}"#,
            ),
        ];
        let profile = ManifestClassifier::new().classify(&files).await.unwrap();
        assert_eq!(profile.file_count, 2);
        assert_eq!(profile.dependency_count, 3);
        assert_eq!(profile.estimated_build_secs, 10 + 9);
    }

    #[tokio::test]
    async fn counts_python_and_rust_manifests() {
        let files = vec![
            ProjectFile::new("api/requirements.txt", "flask==3.0\n# comment\n\nrequests\n-r base.txt\n"),
            ProjectFile::new(
                "Cargo.toml",
                "[package]\nname = \"x\"\n\n[dependencies]\nserde = \"1\"\ntokio = \"1\"\n",
            ),
        ];
        let profile = ManifestClassifier::new().classify(&files).await.unwrap();
        assert_eq!(profile.dependency_count, 4);
    }

    #[tokio::test]
    async fn broken_manifest_is_ignored() {
        let files = vec![ProjectFile::new("package.json", "{not json")];
        let profile = ManifestClassifier::new().classify(&files).await.unwrap();
        assert_eq!(profile.dependency_count, 0);
        assert_eq!(profile.file_count, 1);
    }

    #[tokio::test]
    async fn simple_project_profile() {
        let files: Vec<ProjectFile> = (0..10)
            .map(|i| ProjectFile::new(&format!("src/f{i}.js"), ""))
            .collect();
        let profile = ManifestClassifier::new().classify(&files).await.unwrap();
        assert_eq!(profile.file_count, 10);
        assert_eq!(profile.dependency_count, 0);
        assert_eq!(profile.estimated_build_secs, 11);
    }
}

//! Multi-document YAML manifests
//!
//! Used to seed the in-memory cluster in local mode. Each document is routed
//! by its `kind`; unknown kinds are rejected.

use crate::cluster::{InMemoryCluster, ResourceApi};
use crate::error::{ControllerError, ControllerResult};
use serde::Deserialize;
use std::path::Path;
use strand_types::{ClusterWorkflowTemplate, Pod, Resource, Workflow, WorkflowTemplate};

/// Objects parsed from one or more manifest files
#[derive(Debug, Default, Clone)]
pub struct Manifests {
    pub workflows: Vec<Workflow>,
    pub templates: Vec<WorkflowTemplate>,
    pub cluster_templates: Vec<ClusterWorkflowTemplate>,
    pub pods: Vec<Pod>,
}

impl Manifests {
    pub fn len(&self) -> usize {
        self.workflows.len() + self.templates.len() + self.cluster_templates.len() + self.pods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Parse every document in `source`
    pub fn parse(source: &str) -> ControllerResult<Self> {
        let mut manifests = Self::default();
        for (index, document) in serde_yaml::Deserializer::from_str(source).enumerate() {
            let value = serde_yaml::Value::deserialize(document)
                .map_err(|e| ControllerError::Manifest(format!("document {}: {}", index, e)))?;
            if value.is_null() {
                continue;
            }
            manifests.push(value, index)?;
        }
        Ok(manifests)
    }

    fn push(&mut self, value: serde_yaml::Value, index: usize) -> ControllerResult<()> {
        fn decode<T: Resource>(value: serde_yaml::Value, index: usize) -> ControllerResult<T> {
            serde_yaml::from_value(value).map_err(|e| {
                ControllerError::Manifest(format!("document {} ({}): {}", index, T::KIND, e))
            })
        }

        let kind = value
            .get("kind")
            .and_then(|k| k.as_str())
            .ok_or_else(|| ControllerError::Manifest(format!("document {} has no kind", index)))?
            .to_string();
        match kind.as_str() {
            k if k == Workflow::KIND => self.workflows.push(decode(value, index)?),
            k if k == WorkflowTemplate::KIND => self.templates.push(decode(value, index)?),
            k if k == ClusterWorkflowTemplate::KIND => {
                self.cluster_templates.push(decode(value, index)?)
            }
            k if k == Pod::KIND => self.pods.push(decode(value, index)?),
            other => {
                return Err(ControllerError::Manifest(format!(
                    "document {} has unsupported kind {}",
                    index, other
                )))
            }
        }
        Ok(())
    }

    /// Load every `.yaml`/`.yml` file in `dir`, in file name order
    pub fn load_dir(dir: &Path) -> ControllerResult<Self> {
        let mut paths: Vec<_> = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.extension()
                    .and_then(|ext| ext.to_str())
                    .is_some_and(|ext| ext == "yaml" || ext == "yml")
            })
            .collect();
        paths.sort();

        let mut manifests = Self::default();
        for path in paths {
            let source = std::fs::read_to_string(&path)?;
            let parsed = Self::parse(&source)
                .map_err(|e| ControllerError::Manifest(format!("{}: {}", path.display(), e)))?;
            tracing::debug!(path = %path.display(), objects = parsed.len(), "Loaded manifest");
            manifests.extend(parsed);
        }
        Ok(manifests)
    }

    pub fn extend(&mut self, other: Manifests) {
        self.workflows.extend(other.workflows);
        self.templates.extend(other.templates);
        self.cluster_templates.extend(other.cluster_templates);
        self.pods.extend(other.pods);
    }

    /// Create every object in `cluster`; templates first so references resolve
    pub async fn apply(self, cluster: &InMemoryCluster) -> ControllerResult<usize> {
        let mut created = 0;
        for tmpl in self.cluster_templates {
            ResourceApi::<ClusterWorkflowTemplate>::create(cluster, tmpl).await?;
            created += 1;
        }
        for tmpl in self.templates {
            ResourceApi::<WorkflowTemplate>::create(cluster, tmpl).await?;
            created += 1;
        }
        for pod in self.pods {
            ResourceApi::<Pod>::create(cluster, pod).await?;
            created += 1;
        }
        for wf in self.workflows {
            ResourceApi::<Workflow>::create(cluster, wf).await?;
            created += 1;
        }
        Ok(created)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use strand_types::ObjectKey;

    const BUNDLE: &str = r#"
kind: WorkflowTemplate
metadata:
  name: greet
  namespace: default
spec:
  entrypoint: main
  templates:
  - name: main
    container:
      image: alpine
---
kind: Workflow
metadata:
  generateName: greet-
  namespace: default
spec:
  workflowTemplateRef:
    name: greet
---
kind: ClusterWorkflowTemplate
metadata:
  name: shared
spec:
  entrypoint: main
"#;

    #[test]
    fn test_parse_routes_by_kind() {
        let manifests = Manifests::parse(BUNDLE).unwrap();
        assert_eq!(manifests.templates.len(), 1);
        assert_eq!(manifests.workflows.len(), 1);
        assert_eq!(manifests.cluster_templates.len(), 1);
        assert_eq!(manifests.len(), 3);
        assert_eq!(
            manifests.workflows[0]
                .spec
                .workflow_template_ref
                .as_ref()
                .unwrap()
                .name,
            "greet"
        );
    }

    #[test]
    fn test_parse_rejects_unknown_kind() {
        let err = Manifests::parse("kind: ConfigMap\nmetadata:\n  name: x\n").unwrap_err();
        assert!(matches!(err, ControllerError::Manifest(_)));
        assert!(Manifests::parse("metadata:\n  name: x\n").is_err());
    }

    #[test]
    fn test_parse_keeps_synchronization() {
        let manifests = Manifests::parse(
            r#"
kind: Workflow
metadata:
  name: deploy
  namespace: default
spec:
  entrypoint: main
  synchronization:
    semaphore:
      name: gpu
"#,
        )
        .unwrap();
        let sync = manifests.workflows[0].spec.synchronization.as_ref().unwrap();
        assert_eq!(sync.lock_key("default").as_deref(), Some("default/semaphore/gpu"));
    }

    #[test]
    fn test_load_dir_reads_yaml_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = std::fs::File::create(dir.path().join("bundle.yaml")).unwrap();
        file.write_all(BUNDLE.as_bytes()).unwrap();
        std::fs::write(dir.path().join("notes.txt"), "kind: Nonsense").unwrap();

        let manifests = Manifests::load_dir(dir.path()).unwrap();
        assert_eq!(manifests.len(), 3);
    }

    #[tokio::test]
    async fn test_apply_seeds_cluster() {
        let cluster = InMemoryCluster::new();
        let created = Manifests::parse(BUNDLE)
            .unwrap()
            .apply(&cluster)
            .await
            .unwrap();
        assert_eq!(created, 3);

        let tmpl = ResourceApi::<WorkflowTemplate>::get(&cluster, &ObjectKey::new("default", "greet"))
            .await
            .unwrap();
        assert!(!tmpl.metadata.uid.is_empty());
        let workflows = ResourceApi::<Workflow>::list(&cluster, Some("default"))
            .await
            .unwrap();
        assert!(workflows[0].metadata.name.starts_with("greet-"));
    }
}

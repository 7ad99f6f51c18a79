//! Executable spec resolution
//!
//! Two steps, applied in order by the operation cycle:
//!
//! 1. [`load_execution_spec`] materializes a referenced template (if any) with
//!    the workflow's own fields layered on top.
//! 2. [`set_workflow_defaults`] fills whatever the workflow left unset from the
//!    cluster-wide default workflow.
//!
//! Both merges run over the JSON form of the schema: absent keys are "unset",
//! objects merge key by key and everything else is replaced wholesale.

use crate::error::ResolveError;
use crate::mirror::MirrorReader;
use serde_json::{Map, Value};
use strand_types::{
    ClusterWorkflowTemplate, ObjectKey, Template, Workflow, WorkflowSpec, WorkflowTemplate,
};

/// Merge `overlay` into `base`; non-null values in `overlay` win
pub fn merge_json(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                if value.is_null() {
                    continue;
                }
                match base.get_mut(&key) {
                    Some(existing) => merge_json(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => {
            if !overlay.is_null() {
                *base = overlay;
            }
        }
    }
}

/// Produce the spec a workflow executes.
///
/// Without a template reference this is a copy of the workflow's own spec.
/// With one, the referenced template's spec is the base, the workflow's set
/// fields override it, and workflow templates replace same-named template
/// templates (new names are appended).
pub fn load_execution_spec(
    wf: &Workflow,
    templates: &MirrorReader<WorkflowTemplate>,
    cluster_templates: Option<&MirrorReader<ClusterWorkflowTemplate>>,
) -> Result<WorkflowSpec, ResolveError> {
    let Some(tmpl_ref) = &wf.spec.workflow_template_ref else {
        return Ok(wf.spec.clone());
    };

    let base = if tmpl_ref.cluster_scope {
        let Some(cluster_templates) = cluster_templates else {
            return Err(ResolveError::ClusterScopeUnavailable(tmpl_ref.name.clone()));
        };
        let key = ObjectKey::cluster(&tmpl_ref.name);
        cluster_templates
            .get(&key)
            .ok_or(ResolveError::TemplateNotFound {
                kind: "ClusterWorkflowTemplate",
                key,
            })?
            .spec
    } else {
        let key = ObjectKey::new(&wf.metadata.namespace, &tmpl_ref.name);
        templates
            .get(&key)
            .ok_or(ResolveError::TemplateNotFound {
                kind: "WorkflowTemplate",
                key,
            })?
            .spec
    };

    let mut local = wf.spec.clone();
    let local_templates = std::mem::take(&mut local.templates);
    let merged_templates = merge_templates(base.templates.clone(), local_templates);

    let mut spec = serde_json::to_value(&base)?;
    merge_json(&mut spec, serde_json::to_value(&local)?);
    let mut spec: WorkflowSpec = serde_json::from_value(spec)?;
    spec.templates = merged_templates;
    Ok(spec)
}

fn merge_templates(mut base: Vec<Template>, local: Vec<Template>) -> Vec<Template> {
    for tmpl in local {
        match base.iter_mut().find(|t| t.name == tmpl.name) {
            Some(existing) => *existing = tmpl,
            None => base.push(tmpl),
        }
    }
    base
}

/// JSON form of the parts of a default workflow that are merged
fn defaults_document(defaults: &Workflow) -> Result<Value, serde_json::Error> {
    let mut metadata = Map::new();
    if !defaults.metadata.labels.is_empty() {
        metadata.insert(
            "labels".to_string(),
            serde_json::to_value(&defaults.metadata.labels)?,
        );
    }
    if !defaults.metadata.annotations.is_empty() {
        metadata.insert(
            "annotations".to_string(),
            serde_json::to_value(&defaults.metadata.annotations)?,
        );
    }
    let mut doc = Map::new();
    doc.insert("metadata".to_string(), Value::Object(metadata));
    doc.insert("spec".to_string(), serde_json::to_value(&defaults.spec)?);
    Ok(Value::Object(doc))
}

/// Fill unset fields of `wf` from `defaults`, in place.
///
/// Scalars are copied only when the workflow leaves them unset, maps are
/// unioned with the workflow's keys winning, and each TTL strategy field is
/// considered on its own. `None` leaves the workflow untouched.
pub fn set_workflow_defaults(
    wf: &mut Workflow,
    defaults: Option<&Workflow>,
) -> Result<(), ResolveError> {
    let Some(defaults) = defaults else {
        return Ok(());
    };
    let mut merged = defaults_document(defaults)?;
    merge_json(&mut merged, serde_json::to_value(&*wf)?);
    *wf = serde_json::from_value(merged)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::WatchEvent;
    use crate::mirror::mirror;
    use proptest::prelude::*;
    use std::collections::BTreeMap;
    use strand_types::{ObjectMeta, TtlStrategy, WorkflowTemplateRef};

    const HELLO_WORLD_WF: &str = r#"
apiVersion: strand.io/v1alpha1
kind: Workflow
metadata:
  name: hello-world
  namespace: default
spec:
  entrypoint: whalesay
  templates:
  - name: whalesay
    metadata:
      annotations:
        annotationKey1: "annotationValue1"
        annotationKey2: "annotationValue2"
      labels:
        labelKey1: "labelValue1"
        labelKey2: "labelValue2"
    container:
      image: docker/whalesay:latest
      command: [cowsay]
      args: ["hello world"]
"#;

    const DEFAULT_WF: &str = r#"
apiVersion: strand.io/v1alpha1
kind: Workflow
metadata:
  name: hello-world
  namespace: default
  labels:
    foo: bar
spec:
  entrypoint: whalesay
  serviceAccountName: whalesay
  templates:
  - name: whalesay
    metadata:
      annotations:
        annotationKey1: "annotationValue1"
      labels:
        labelKey1: "labelValue1"
    container:
      image: docker/whalesay:latest
      command: [cowsay]
      args: ["hello world"]
"#;

    const DEFAULT_WF_TTL: &str = r#"
apiVersion: strand.io/v1alpha1
kind: Workflow
metadata:
  name: hello-world
  namespace: default
spec:
  entrypoint: whalesay
  serviceAccountName: whalesay
  ttlSecondsAfterFinished: 7
  ttlStrategy:
    secondsAfterCompletion: 5
  templates:
  - name: whalesay
    container:
      image: docker/whalesay:latest
      command: [cowsay]
      args: ["hello world"]
"#;

    const WF_WITH_TMPL_REF: &str = r#"
metadata:
  name: hello-world
  namespace: default
spec:
  workflowTemplateRef:
    name: workflow-template-whalesay-template
  arguments:
    parameters:
    - name: message
      value: test
"#;

    const WF_TMPL: &str = r#"
metadata:
  name: workflow-template-whalesay-template
  namespace: default
spec:
  entrypoint: whalesay-template
  serviceAccountName: my-sa
  priority: 77
  arguments:
    parameters:
    - name: message
      value: hello world
  templates:
  - name: whalesay-template
    inputs:
      parameters:
      - name: message
    container:
      image: docker/whalesay
      command: [cowsay]
      args: ["{{inputs.parameters.message}}"]
  volumes:
  - name: data
    emptyDir: {}
"#;

    fn parse<T: serde::de::DeserializeOwned>(yaml: &str) -> T {
        serde_yaml::from_str(yaml).unwrap()
    }

    fn host_network_defaults() -> Workflow {
        let mut defaults = Workflow::default();
        defaults.spec.host_network = Some(true);
        defaults
    }

    fn complex_defaults() -> Workflow {
        let mut defaults = Workflow::default();
        defaults
            .metadata
            .annotations
            .insert("annotation".into(), "value".into());
        defaults.metadata.labels.insert("label".into(), "value".into());
        defaults.spec.host_network = Some(true);
        defaults.spec.entrypoint = "good_entrypoint".into();
        defaults.spec.service_account_name = "my_service_account".into();
        defaults.spec.ttl_strategy = Some(TtlStrategy {
            seconds_after_completion: Some(10),
            seconds_after_success: Some(10),
            seconds_after_failure: Some(10),
        });
        defaults.spec.ttl_seconds_after_finished = Some(10);
        defaults
    }

    #[test]
    fn test_no_defaults_leaves_workflow_unchanged() {
        let mut wf: Workflow = parse(HELLO_WORLD_WF);
        let before = wf.clone();
        set_workflow_defaults(&mut wf, None).unwrap();
        assert_eq!(wf, before);
        assert_eq!(
            serde_json::to_vec(&wf).unwrap(),
            serde_json::to_vec(&before).unwrap()
        );
    }

    #[test]
    fn test_host_network_default_fills_gap() {
        let mut wf: Workflow = parse(HELLO_WORLD_WF);
        let mut expected = wf.clone();
        expected.spec.host_network = Some(true);

        set_workflow_defaults(&mut wf, Some(&host_network_defaults())).unwrap();
        assert_eq!(wf, expected);
    }

    #[test]
    fn test_complex_defaults_respect_workflow_fields() {
        let mut wf: Workflow = parse(DEFAULT_WF);
        set_workflow_defaults(&mut wf, Some(&complex_defaults())).unwrap();

        assert_eq!(wf.spec.entrypoint, "whalesay");
        assert_eq!(wf.spec.service_account_name, "whalesay");
        assert_eq!(wf.spec.host_network, Some(true));
        assert_eq!(
            wf.spec.ttl_strategy.as_ref().unwrap().seconds_after_failure,
            Some(10)
        );
        assert!(wf.metadata.labels.contains_key("foo"));
        assert!(wf.metadata.labels.contains_key("label"));
        assert!(wf.metadata.annotations.contains_key("annotation"));
    }

    #[test]
    fn test_ttl_fields_merge_independently() {
        let mut wf: Workflow = parse(DEFAULT_WF_TTL);
        set_workflow_defaults(&mut wf, Some(&complex_defaults())).unwrap();

        let ttl = wf.spec.ttl_strategy.as_ref().unwrap();
        assert_eq!(ttl.seconds_after_completion, Some(5));
        assert_eq!(ttl.seconds_after_failure, Some(10));
        assert_eq!(ttl.seconds_after_success, Some(10));
        assert_eq!(wf.spec.ttl_seconds_after_finished, Some(7));
        assert!(!wf.metadata.labels.contains_key("foo"));
        assert!(wf.metadata.labels.contains_key("label"));
    }

    #[test]
    fn test_defaults_keep_identity_and_status() {
        let mut wf: Workflow = parse(DEFAULT_WF);
        wf.status.message = "running".into();
        let mut defaults = complex_defaults();
        defaults.metadata = ObjectMeta::named("other", "other-name");
        set_workflow_defaults(&mut wf, Some(&defaults)).unwrap();
        assert_eq!(wf.metadata.name, "hello-world");
        assert_eq!(wf.metadata.namespace, "default");
        assert_eq!(wf.status.message, "running");
    }

    #[test]
    fn test_load_execution_spec_without_ref_copies_spec() {
        let (_writer, templates) = mirror::<WorkflowTemplate>();
        let wf: Workflow = parse(HELLO_WORLD_WF);
        let spec = load_execution_spec(&wf, &templates, None).unwrap();
        assert_eq!(spec, wf.spec);
    }

    #[test]
    fn test_load_execution_spec_from_template_ref() {
        let (mut writer, templates) = mirror::<WorkflowTemplate>();
        let tmpl: WorkflowTemplate = parse(WF_TMPL);
        writer.apply(WatchEvent::Restarted(vec![tmpl.clone()]));

        let wf: Workflow = parse(WF_WITH_TMPL_REF);
        let spec = load_execution_spec(&wf, &templates, None).unwrap();

        assert_eq!(spec.templates, tmpl.spec.templates);
        assert_eq!(spec.entrypoint, "whalesay-template");
        assert_eq!(spec.service_account_name, "my-sa");
        assert_eq!(spec.priority, Some(77));
        assert_eq!(spec.volumes, tmpl.spec.volumes);
        assert_eq!(spec.arguments.parameters[0].value.as_deref(), Some("test"));
    }

    #[test]
    fn test_local_templates_override_by_name() {
        let (mut writer, templates) = mirror::<WorkflowTemplate>();
        writer.apply(WatchEvent::Restarted(vec![parse(WF_TMPL)]));

        let mut wf: Workflow = parse(WF_WITH_TMPL_REF);
        wf.spec.templates.push(Template {
            name: "whalesay-template".into(),
            ..Default::default()
        });
        wf.spec.templates.push(Template {
            name: "extra".into(),
            ..Default::default()
        });
        let spec = load_execution_spec(&wf, &templates, None).unwrap();
        assert_eq!(spec.templates.len(), 2);
        assert!(spec.templates[0].container.is_none());
        assert_eq!(spec.templates[1].name, "extra");
    }

    #[test]
    fn test_missing_template_is_not_found() {
        let (_writer, templates) = mirror::<WorkflowTemplate>();
        let wf: Workflow = parse(WF_WITH_TMPL_REF);
        let err = load_execution_spec(&wf, &templates, None).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_cluster_scope_without_mirror_is_unresolved() {
        let (_writer, templates) = mirror::<WorkflowTemplate>();
        let mut wf: Workflow = parse(WF_WITH_TMPL_REF);
        wf.spec.workflow_template_ref = Some(WorkflowTemplateRef {
            name: "shared".into(),
            cluster_scope: true,
        });
        let err = load_execution_spec(&wf, &templates, None).unwrap_err();
        assert!(matches!(err, ResolveError::ClusterScopeUnavailable(_)));

        let (mut cluster_writer, cluster_templates) = mirror::<ClusterWorkflowTemplate>();
        let mut shared: ClusterWorkflowTemplate = parse(WF_TMPL);
        shared.metadata = ObjectMeta::named("", "shared");
        cluster_writer.apply(WatchEvent::Restarted(vec![shared.clone()]));
        let spec = load_execution_spec(&wf, &templates, Some(&cluster_templates)).unwrap();
        assert_eq!(spec.templates, shared.spec.templates);
    }

    fn arb_labels() -> impl Strategy<Value = BTreeMap<String, String>> {
        prop::collection::btree_map("[a-c]{1,2}", "[a-z]{0,3}", 0..5)
    }

    fn arb_ttl() -> impl Strategy<Value = Option<TtlStrategy>> {
        prop::option::of(
            (
                prop::option::of(0i32..100),
                prop::option::of(0i32..100),
                prop::option::of(0i32..100),
            )
                .prop_map(|(completion, success, failure)| TtlStrategy {
                    seconds_after_completion: completion,
                    seconds_after_success: success,
                    seconds_after_failure: failure,
                }),
        )
    }

    proptest! {
        #[test]
        fn prop_workflow_values_win(
            wf_labels in arb_labels(),
            default_labels in arb_labels(),
            wf_ttl in arb_ttl(),
            default_ttl in arb_ttl(),
            wf_after in prop::option::of(0i32..100),
            default_after in prop::option::of(0i32..100),
        ) {
            let mut wf = Workflow::default();
            wf.metadata = ObjectMeta::named("default", "wf");
            wf.metadata.labels = wf_labels.clone();
            wf.spec.ttl_strategy = wf_ttl.clone();
            wf.spec.ttl_seconds_after_finished = wf_after;

            let mut defaults = Workflow::default();
            defaults.metadata.labels = default_labels.clone();
            defaults.spec.ttl_strategy = default_ttl.clone();
            defaults.spec.ttl_seconds_after_finished = default_after;

            set_workflow_defaults(&mut wf, Some(&defaults)).unwrap();

            let mut expected_labels = default_labels;
            expected_labels.extend(wf_labels);
            prop_assert_eq!(&wf.metadata.labels, &expected_labels);
            prop_assert_eq!(wf.spec.ttl_seconds_after_finished, wf_after.or(default_after));

            let field = |ttl: &Option<TtlStrategy>, f: fn(&TtlStrategy) -> Option<i32>| {
                ttl.as_ref().and_then(f)
            };
            let got = wf.spec.ttl_strategy.clone();
            for f in [
                (|t: &TtlStrategy| t.seconds_after_completion) as fn(&TtlStrategy) -> Option<i32>,
                |t: &TtlStrategy| t.seconds_after_success,
                |t: &TtlStrategy| t.seconds_after_failure,
            ] {
                prop_assert_eq!(field(&got, f), field(&wf_ttl, f).or(field(&default_ttl, f)));
            }
        }
    }
}

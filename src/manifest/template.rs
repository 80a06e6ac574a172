//! Template rendering
//!
//! Templates are plain YAML with `${TOKEN}` placeholders. Images are looked up
//! with `${IMAGE:<key>}` in the Kubernetes-version values file.

use crate::domain::objects::ManagedObject;
use crate::error::{Error, Result};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::BTreeMap;

/// Default kubelet root when the resource does not override it
pub const DEFAULT_KUBELET_DIR: &str = "/var/lib/kubelet";

/// Values substituted into templates
#[derive(Debug, Clone, Default)]
pub struct RenderContext {
    pub release_name: String,
    pub release_namespace: String,
    pub config_version: String,
    /// Driver type of the install; empty for driverless installs
    pub driver: String,
    pub kubelet_dir: String,
    pub images: BTreeMap<String, String>,
}

impl RenderContext {
    pub fn new(release_name: impl Into<String>, release_namespace: impl Into<String>) -> Self {
        Self {
            release_name: release_name.into(),
            release_namespace: release_namespace.into(),
            config_version: String::new(),
            driver: String::new(),
            kubelet_dir: DEFAULT_KUBELET_DIR.to_string(),
            images: BTreeMap::new(),
        }
    }

    pub fn with_config_version(&self, version: impl Into<String>) -> Self {
        let mut ctx = self.clone();
        ctx.config_version = version.into();
        ctx
    }

    fn lookup(&self, token: &str) -> Option<String> {
        if let Some(key) = token.strip_prefix("IMAGE:") {
            return self.images.get(key).cloned();
        }
        match token {
            "RELEASE_NAME" => Some(self.release_name.clone()),
            "RELEASE_NAMESPACE" => Some(self.release_namespace.clone()),
            "CONFIG_VERSION" => Some(self.config_version.clone()),
            "DRIVER" => Some(self.driver.clone()),
            "KUBELET_DIR" => Some(self.kubelet_dir.clone()),
            _ => None,
        }
    }
}

/// Substitute every `${TOKEN}` in `text`
pub fn render(text: &str, ctx: &RenderContext, template: &str) -> Result<String> {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after.find('}').ok_or_else(|| Error::TemplateRender {
            template: template.to_string(),
            reason: "unterminated placeholder".to_string(),
        })?;
        let token = &after[..end];
        let value = ctx.lookup(token).ok_or_else(|| Error::TemplateRender {
            template: template.to_string(),
            reason: format!("unknown placeholder ${{{}}}", token),
        })?;
        out.push_str(&value);
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

/// Parse a multi-document YAML stream into typed objects.
///
/// Empty documents are skipped.
pub fn parse_objects(text: &str, template: &str) -> Result<Vec<ManagedObject>> {
    let mut objects = Vec::new();
    for document in serde_yaml::Deserializer::from_str(text) {
        let value = serde_yaml::Value::deserialize(document)?;
        if value.is_null() {
            continue;
        }
        let json = serde_json::to_value(value)?;
        objects.push(ManagedObject::from_value(json, template)?);
    }
    Ok(objects)
}

/// Parse a single YAML document into a fragment type
pub fn parse_fragment<T: DeserializeOwned>(text: &str) -> Result<T> {
    Ok(serde_yaml::from_str(text)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::objects::ObjectKind;

    fn ctx() -> RenderContext {
        let mut ctx = RenderContext::new("mayastor", "storage").with_config_version("v2.10.0");
        ctx.images
            .insert("csi-provisioner".into(), "registry.k8s.io/sig-storage/csi-provisioner:v4.0.0".into());
        ctx
    }

    #[test]
    fn test_render_tokens() {
        let text = "name: ${RELEASE_NAME}-controller\nnamespace: ${RELEASE_NAMESPACE}\nimage: ${IMAGE:csi-provisioner}\npath: ${KUBELET_DIR}/plugins";
        let out = render(text, &ctx(), "controller.yaml").unwrap();
        assert_eq!(
            out,
            "name: mayastor-controller\nnamespace: storage\nimage: registry.k8s.io/sig-storage/csi-provisioner:v4.0.0\npath: /var/lib/kubelet/plugins"
        );
    }

    #[test]
    fn test_render_unknown_token_fails() {
        let err = render("image: ${IMAGE:missing}", &ctx(), "node.yaml").unwrap_err();
        assert!(matches!(err, Error::TemplateRender { .. }));
        assert!(render("x: ${OOPS", &ctx(), "node.yaml").is_err());
    }

    #[test]
    fn test_parse_multi_document() {
        let text = r#"
apiVersion: v1
kind: ServiceAccount
metadata:
  name: mayastor-controller
  namespace: storage
---
---
apiVersion: rbac.authorization.k8s.io/v1
kind: ClusterRole
metadata:
  name: mayastor-controller
rules:
  - apiGroups: [""]
    resources: ["persistentvolumes"]
    verbs: ["get", "list"]
"#;
        let objects = parse_objects(text, "controller.yaml").unwrap();
        assert_eq!(objects.len(), 2);
        assert_eq!(objects[0].kind(), ObjectKind::ServiceAccount);
        assert_eq!(objects[1].kind(), ObjectKind::ClusterRole);
    }

    #[test]
    fn test_parse_rejects_unmanaged_builtin() {
        let text = "apiVersion: v1\nkind: Namespace\nmetadata:\n  name: storage\n";
        let err = parse_objects(text, "controller.yaml").unwrap_err();
        assert!(matches!(err, Error::UnsupportedKind { .. }));
    }
}

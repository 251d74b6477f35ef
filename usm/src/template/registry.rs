//! Read-only template catalog built once at manager initialization.

use std::collections::HashMap;
use std::sync::Arc;

use usm_shared::errors::{UsmError, UsmResult};

use super::ServiceTemplate;
use crate::config::{ConfigSource, UsmConfig};

/// Templates in declaration order, indexed by id.
///
/// Shared via `Arc` and never mutated after construction, so lookups take no
/// locks.
#[derive(Debug, Default)]
pub struct TemplateRegistry {
    templates: Vec<Arc<ServiceTemplate>>,
    index: HashMap<String, usize>,
}

impl TemplateRegistry {
    /// Load and validate templates from a configuration source.
    pub fn load(source: &ConfigSource) -> UsmResult<Self> {
        let config = UsmConfig::load(source)?;
        Self::from_templates(config.templates)
    }

    /// Build a registry, rejecting invalid or duplicate templates.
    pub fn from_templates(templates: Vec<ServiceTemplate>) -> UsmResult<Self> {
        let mut registry = Self::default();
        for template in templates {
            template.validate()?;
            if registry.index.contains_key(&template.id) {
                return Err(UsmError::Config(format!(
                    "duplicate template id '{}'",
                    template.id
                )));
            }
            registry
                .index
                .insert(template.id.clone(), registry.templates.len());
            registry.templates.push(Arc::new(template));
        }

        tracing::debug!(count = registry.templates.len(), "Loaded service templates");
        Ok(registry)
    }

    pub fn get(&self, id: &str) -> Option<Arc<ServiceTemplate>> {
        self.index.get(id).map(|&i| Arc::clone(&self.templates[i]))
    }

    /// All templates in declaration order.
    pub fn list(&self) -> Vec<Arc<ServiceTemplate>> {
        self.templates.clone()
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }

    /// Find the template a bare instance id belongs to.
    ///
    /// An exact id match wins; otherwise the longest template id `t` for which
    /// the instance id starts with `t-` is chosen, so `web-1` maps to `web`.
    pub fn resolve_for_instance(&self, instance_id: &str) -> Option<Arc<ServiceTemplate>> {
        if let Some(exact) = self.get(instance_id) {
            return Some(exact);
        }
        self.templates
            .iter()
            .filter(|t| {
                instance_id
                    .strip_prefix(t.id.as_str())
                    .is_some_and(|rest| rest.starts_with('-'))
            })
            .max_by_key(|t| t.id.len())
            .cloned()
    }
}

//! Tool Catalogue
//!
//! Assembles the set of tools advertised to the model when a prompt starts.
//! Tools come from three places: a built-in source, an externally registered
//! source, and user-defined tools that carry their own enabled flag.

use crate::generic_types::ToolSpec;
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::warn;

/// Anything that can list tool specifications.
#[async_trait]
pub trait ToolSource: Send + Sync {
    async fn list_tools(&self) -> anyhow::Result<Vec<ToolSpec>>;
}

/// A fixed list of tools, useful for externally registered tools that are
/// known up front.
#[derive(Debug, Clone, Default)]
pub struct StaticToolSource {
    tools: Vec<ToolSpec>,
}

impl StaticToolSource {
    pub fn new(tools: Vec<ToolSpec>) -> Self {
        Self { tools }
    }
}

#[async_trait]
impl ToolSource for StaticToolSource {
    async fn list_tools(&self) -> anyhow::Result<Vec<ToolSpec>> {
        Ok(self.tools.clone())
    }
}

/// A tool defined by the end user, toggled independently of the enabled-set.
#[derive(Debug, Clone, PartialEq)]
pub struct UserTool {
    pub spec: ToolSpec,
    pub enabled: bool,
}

/// Which built-in and external tools a session may use.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum EnabledTools {
    #[default]
    All,
    Only(HashSet<String>),
}

impl EnabledTools {
    pub fn only<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Only(names.into_iter().map(Into::into).collect())
    }

    pub fn none() -> Self {
        Self::Only(HashSet::new())
    }

    pub fn is_enabled(&self, name: &str) -> bool {
        match self {
            Self::All => true,
            Self::Only(names) => names.contains(name),
        }
    }
}

/// The tool sources available to every session of an engine.
#[derive(Clone, Default)]
pub struct ToolCatalog {
    builtin: Option<Arc<dyn ToolSource>>,
    external: Option<Arc<dyn ToolSource>>,
}

impl ToolCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtin(mut self, source: Arc<dyn ToolSource>) -> Self {
        self.builtin = Some(source);
        self
    }

    pub fn with_external(mut self, source: Arc<dyn ToolSource>) -> Self {
        self.external = Some(source);
        self
    }

    /// Lists the tools for one prompt.
    ///
    /// Order is built-in, then external, then user-defined. When two sources
    /// offer the same name, the first one seen is kept. A source that fails to
    /// list is skipped.
    pub async fn enumerate(&self, enabled: &EnabledTools, user_tools: &[UserTool]) -> Vec<ToolSpec> {
        let mut seen = HashSet::new();
        let mut tools = Vec::new();

        for (label, source) in [("builtin", &self.builtin), ("external", &self.external)] {
            let Some(source) = source else { continue };
            match source.list_tools().await {
                Ok(specs) => {
                    for spec in specs.into_iter().filter(|s| enabled.is_enabled(&s.name)) {
                        push_unique(&mut tools, &mut seen, spec, label);
                    }
                }
                Err(e) => warn!(source = label, error = ?e, "Tool source failed to list tools; skipping"),
            }
        }

        for tool in user_tools.iter().filter(|t| t.enabled) {
            push_unique(&mut tools, &mut seen, tool.spec.clone(), "user");
        }

        tools
    }
}

fn push_unique(tools: &mut Vec<ToolSpec>, seen: &mut HashSet<String>, spec: ToolSpec, label: &str) {
    if seen.insert(spec.name.clone()) {
        tools.push(spec);
    } else {
        warn!(tool = %spec.name, source = label, "Duplicate tool name; keeping the first registration");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use serde_json::json;

    struct FailingSource;

    #[async_trait]
    impl ToolSource for FailingSource {
        async fn list_tools(&self) -> anyhow::Result<Vec<ToolSpec>> {
            Err(anyhow!("registry offline"))
        }
    }

    fn spec(name: &str, description: &str) -> ToolSpec {
        ToolSpec::new(name, description, json!({ "type": "object" }))
    }

    #[tokio::test]
    async fn test_enumerate_filters_by_enabled_set_and_flag() {
        let catalog = ToolCatalog::new()
            .with_builtin(Arc::new(StaticToolSource::new(vec![
                spec("get_date_and_time", "clock"),
                spec("get_weather", "weather"),
            ])))
            .with_external(Arc::new(StaticToolSource::new(vec![spec("crm_lookup", "crm")])));
        let user_tools = vec![
            UserTool { spec: spec("webhook_a", "a"), enabled: true },
            UserTool { spec: spec("webhook_b", "b"), enabled: false },
        ];

        let tools = catalog
            .enumerate(&EnabledTools::only(["get_date_and_time", "crm_lookup"]), &user_tools)
            .await;
        let names: Vec<_> = tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["get_date_and_time", "crm_lookup", "webhook_a"]);
    }

    #[tokio::test]
    async fn test_enumerate_first_registration_wins() {
        let catalog = ToolCatalog::new()
            .with_builtin(Arc::new(StaticToolSource::new(vec![spec("lookup", "builtin")])))
            .with_external(Arc::new(StaticToolSource::new(vec![spec("lookup", "external")])));
        let user_tools = vec![UserTool { spec: spec("lookup", "user"), enabled: true }];

        let tools = catalog.enumerate(&EnabledTools::All, &user_tools).await;
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].description, "builtin");
    }

    #[tokio::test]
    async fn test_enumerate_skips_failing_source() {
        let catalog = ToolCatalog::new()
            .with_builtin(Arc::new(FailingSource))
            .with_external(Arc::new(StaticToolSource::new(vec![spec("crm_lookup", "crm")])));

        let tools = catalog.enumerate(&EnabledTools::All, &[]).await;
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "crm_lookup");
    }

    #[test]
    fn test_enabled_tools_none() {
        assert!(!EnabledTools::none().is_enabled("anything"));
        assert!(EnabledTools::All.is_enabled("anything"));
    }
}

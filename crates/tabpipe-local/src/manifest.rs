use std::path::Path;
use tabpipe_core::{Error, Result};

/// Name of the tool call that triggers a search.
pub const SEARCH_TOOL: &str = "web_search";

const DEFAULT_TOOLS: &str = include_str!("../assets/tools.json");

/// The tool schema injected into outbound chat requests. Opaque apart from the names.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolManifest {
    tools: serde_json::Value,
}

impl ToolManifest {
    pub fn from_json(raw: &str) -> Result<Self> {
        let tools: serde_json::Value =
            serde_json::from_str(raw).map_err(|e| Error::Config(format!("tools manifest: {e}")))?;
        if !tools.is_array() {
            return Err(Error::Config(
                "tools manifest must be a JSON array".to_string(),
            ));
        }
        Ok(Self { tools })
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
        Self::from_json(&raw)
    }

    pub fn as_value(&self) -> &serde_json::Value {
        &self.tools
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.tools
            .as_array()
            .map(|a| {
                a.iter()
                    .filter_map(|t| t.pointer("/function/name").and_then(|n| n.as_str()))
                    .map(|s| s.to_string())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn declares(&self, name: &str) -> bool {
        self.tool_names().iter().any(|n| n == name)
    }
}

impl Default for ToolManifest {
    fn default() -> Self {
        Self {
            tools: serde_json::from_str(DEFAULT_TOOLS).unwrap_or_else(|_| serde_json::json!([])),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bundled_manifest_declares_search_tool() {
        let m = ToolManifest::default();
        assert_eq!(m.tool_names(), vec![SEARCH_TOOL.to_string()]);
        assert!(m.declares(SEARCH_TOOL));
        assert_eq!(
            m.as_value()[0]["function"]["parameters"]["required"][0],
            "query"
        );
    }

    #[test]
    fn manifest_must_be_an_array() {
        assert!(matches!(
            ToolManifest::from_json(r#"{"name":"x"}"#),
            Err(Error::Config(_))
        ));
        assert!(ToolManifest::from_json("[]").unwrap().tool_names().is_empty());
    }
}

//! Tool-block codec and dialect-converter tool-handling configuration (C1/C2).

use serde::Deserialize;

/// Configuration for structured-tool-call handling.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ToolsConfig {
    /// Whether native structured tool calls are passed through to upstream.
    pub native_tools_enabled: bool,
    /// Whether a per-call fallback to inline-marker extraction is permitted
    /// when a native-mode upstream still emits inline tool markers.
    pub native_tools_fallback_enabled: bool,
    /// Maximum characters retained from a tool description before upstream truncates it.
    pub tool_desc_max_chars: usize,
    /// Maximum characters retained from a tool parameter description.
    pub tool_param_desc_max_chars: usize,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            native_tools_enabled: true,
            native_tools_fallback_enabled: true,
            tool_desc_max_chars: 1024,
            tool_param_desc_max_chars: 512,
        }
    }
}

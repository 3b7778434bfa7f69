//! Flat, collision-free view over the tools of every active backend.
//!
//! Every tool is exposed as `<backend>__<local>`. Backend names may not
//! contain the separator and may not end with `_`, so splitting at the first
//! separator always recovers the original pair even when the local name
//! itself contains `__` or starts with `_`.
//!
//! The catalog is a derived snapshot: the registry rebuilds it from the
//! active connections on every read.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::errors::McpError;
use super::types::ToolDescriptor;

/// Separator between backend and local name.
pub const TOOL_NAME_SEPARATOR: &str = "__";

// ─── ToolName ────────────────────────────────────────────────────────────────

/// Check a backend name against the namespacing rule.
pub fn validate_backend_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("backend name is empty".into());
    }
    if let Some(bad) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '_' || *c == '-'))
    {
        return Err(format!("backend name contains invalid character '{bad}'"));
    }
    if name.contains(TOOL_NAME_SEPARATOR) {
        return Err(format!("backend name contains separator '{TOOL_NAME_SEPARATOR}'"));
    }
    if name.ends_with('_') {
        return Err("backend name ends with '_'".into());
    }
    Ok(())
}

/// A namespaced tool identifier: `(backend, local)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ToolName {
    backend: String,
    local: String,
}

impl ToolName {
    /// Compose a name from its parts.
    pub fn new(backend: &str, local: &str) -> Result<Self, McpError> {
        let composed = format!("{backend}{TOOL_NAME_SEPARATOR}{local}");
        validate_backend_name(backend).map_err(|reason| McpError::MalformedToolName {
            name: composed.clone(),
            reason,
        })?;
        if local.is_empty() {
            return Err(McpError::MalformedToolName {
                name: composed,
                reason: "local tool name is empty".into(),
            });
        }
        Ok(Self {
            backend: backend.to_string(),
            local: local.to_string(),
        })
    }

    /// Split an external name at the first separator.
    pub fn parse(name: &str) -> Result<Self, McpError> {
        let Some((backend, local)) = name.split_once(TOOL_NAME_SEPARATOR) else {
            return Err(McpError::MalformedToolName {
                name: name.to_string(),
                reason: format!("missing '{TOOL_NAME_SEPARATOR}' separator"),
            });
        };
        Self::new(backend, local).map_err(|e| match e {
            McpError::MalformedToolName { reason, .. } => McpError::MalformedToolName {
                name: name.to_string(),
                reason,
            },
            other => other,
        })
    }

    pub fn backend(&self) -> &str {
        &self.backend
    }

    pub fn local(&self) -> &str {
        &self.local
    }
}

impl fmt::Display for ToolName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{TOOL_NAME_SEPARATOR}{}", self.backend, self.local)
    }
}

impl std::str::FromStr for ToolName {
    type Err = McpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for ToolName {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ToolName {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}

// ─── Catalog ─────────────────────────────────────────────────────────────────

/// One catalog entry.
#[derive(Debug, Clone, Serialize)]
pub struct NamespacedTool {
    pub name: ToolName,
    pub tool: ToolDescriptor,
}

/// Provider-neutral tool definition handed to a completion provider.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

impl From<&NamespacedTool> for ToolSpec {
    fn from(entry: &NamespacedTool) -> Self {
        Self {
            name: entry.name.to_string(),
            description: entry.tool.description.clone(),
            input_schema: entry.tool.input_schema.clone(),
        }
    }
}

/// Filter for [`ToolCatalog::search`]. Every set field must match.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ToolFilter {
    #[serde(default)]
    pub category: Option<String>,
    /// All listed tags must be present.
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub backends: Option<Vec<String>>,
    /// Case-insensitive glob (`*`, `?`); plain text is a substring match.
    #[serde(default)]
    pub name_pattern: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
}

/// Snapshot of all tools on active backends, in activation order then
/// declared order.
#[derive(Debug, Clone, Default)]
pub struct ToolCatalog {
    entries: Vec<NamespacedTool>,
}

impl ToolCatalog {
    /// Build from `(backend, tools)` groups in activation order.
    pub fn from_backends<'a, I>(groups: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a [ToolDescriptor])>,
    {
        let mut entries = Vec::new();
        for (backend, tools) in groups {
            for tool in tools {
                match ToolName::new(backend, &tool.name) {
                    Ok(name) => entries.push(NamespacedTool {
                        name,
                        tool: tool.clone(),
                    }),
                    Err(e) => {
                        tracing::warn!(server = %backend, tool = %tool.name, error = %e, "tool left out of catalog");
                    }
                }
            }
        }
        Self { entries }
    }

    pub fn entries(&self) -> &[NamespacedTool] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, name: &ToolName) -> Option<&NamespacedTool> {
        self.entries.iter().find(|e| &e.name == name)
    }

    pub fn names(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.name.to_string()).collect()
    }

    pub fn tools_for_backend(&self, backend: &str) -> usize {
        self.entries
            .iter()
            .filter(|e| e.name.backend() == backend)
            .count()
    }

    /// Backends present in the catalog, in activation order.
    pub fn backends(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for entry in &self.entries {
            if !names.iter().any(|n| n == entry.name.backend()) {
                names.push(entry.name.backend().to_string());
            }
        }
        names
    }

    /// Filter, order by descending priority (stable), then truncate.
    pub fn search(&self, filter: &ToolFilter) -> Vec<NamespacedTool> {
        let pattern = filter.name_pattern.as_ref().map(|p| p.to_lowercase());

        let mut hits: Vec<&NamespacedTool> = self
            .entries
            .iter()
            .filter(|e| match &filter.category {
                Some(cat) => e
                    .tool
                    .category
                    .as_ref()
                    .is_some_and(|c| c.eq_ignore_ascii_case(cat)),
                None => true,
            })
            .filter(|e| filter.tags.iter().all(|t| e.tool.tags.contains(t)))
            .filter(|e| match &filter.backends {
                Some(list) => list.iter().any(|b| b == e.name.backend()),
                None => true,
            })
            .filter(|e| match &pattern {
                Some(p) => name_matches(p, &e.name.to_string().to_lowercase()),
                None => true,
            })
            .collect();

        // `sort_by` is stable, so equal priorities keep catalog order.
        hits.sort_by(|a, b| b.tool.priority.cmp(&a.tool.priority));

        if let Some(limit) = filter.limit {
            hits.truncate(limit);
        }
        hits.into_iter().cloned().collect()
    }

    pub fn tool_specs(&self) -> Vec<ToolSpec> {
        self.entries.iter().map(ToolSpec::from).collect()
    }

    /// Short capability summary for the system prompt.
    pub fn capability_summary(&self) -> String {
        if self.is_empty() {
            return "No backend tools are currently active.".to_string();
        }

        let backends = self.backends();
        let parts: Vec<String> = backends
            .iter()
            .map(|b| format!("{b} ({})", self.tools_for_backend(b)))
            .collect();

        let mut summary = format!(
            "Available capabilities ({} tools across {} backends): {}.",
            self.len(),
            backends.len(),
            parts.join(", "),
        );

        let mut categories: Vec<&str> = self
            .entries
            .iter()
            .filter_map(|e| e.tool.category.as_deref())
            .collect();
        categories.sort_unstable();
        categories.dedup();
        if !categories.is_empty() {
            summary.push_str(&format!("\nCategories: {}.", categories.join(", ")));
        }

        summary
    }

    /// Up to `max_results` catalog names closest to `name`.
    ///
    /// Compares local parts when `name` is namespaced, full names otherwise.
    pub fn find_similar(&self, name: &str, max_results: usize) -> Vec<String> {
        let query = name
            .split_once(TOOL_NAME_SEPARATOR)
            .map(|(_, local)| local)
            .unwrap_or(name);

        let mut scored: Vec<(String, f64)> = self
            .entries
            .iter()
            .map(|e| (e.name.to_string(), similarity(query, e.name.local())))
            .filter(|(_, score)| *score > 0.3)
            .collect();

        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(max_results);
        scored.into_iter().map(|(name, _)| name).collect()
    }
}

/// Glob match with `*` and `?`; without wildcards, substring match.
fn name_matches(pattern: &str, name: &str) -> bool {
    if !pattern.contains(|c| c == '*' || c == '?') {
        return name.contains(pattern);
    }

    let p: Vec<char> = pattern.chars().collect();
    let n: Vec<char> = name.chars().collect();
    let (mut pi, mut ni) = (0usize, 0usize);
    let mut star: Option<usize> = None;
    let mut star_match = 0usize;

    while ni < n.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == n[ni]) {
            pi += 1;
            ni += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some(pi);
            star_match = ni;
            pi += 1;
        } else if let Some(s) = star {
            pi = s + 1;
            star_match += 1;
            ni = star_match;
        } else {
            return false;
        }
    }
    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}

// ─── Edit Distance ──────────────────────────────────────────────────────────

/// Compute the Levenshtein edit distance between two strings.
fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0usize; b.len() + 1];

    for i in 1..=a.len() {
        curr[0] = i;
        for j in 1..=b.len() {
            let cost = usize::from(a[i - 1] != b[j - 1]);
            curr[j] = (prev[j] + 1).min(curr[j - 1] + 1).min(prev[j - 1] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[b.len()]
}

/// Normalized similarity (0.0 = completely different, 1.0 = identical).
fn similarity(a: &str, b: &str) -> f64 {
    let max_len = a.chars().count().max(b.chars().count());
    if max_len == 0 {
        return 1.0;
    }
    1.0 - (levenshtein(a, b) as f64 / max_len as f64)
}

// ─── Tests ───────────────────────────────────────────────────────────────────

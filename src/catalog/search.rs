//! Free-text and tag search over catalog entries.

use super::ToolSchema;

const NAME_POINTS: u32 = 4;
const TAG_POINTS: u32 = 3;
const DESCRIPTION_POINTS: u32 = 2;
const SERVER_POINTS: u32 = 1;

/// Catalog query. An empty query matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchQuery {
    pub text: Option<String>,
    /// Every listed tag must be present on a match.
    pub tags: Vec<String>,
    pub limit: Option<usize>,
}

impl SearchQuery {
    /// Match every tool.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Self::default()
        }
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    fn tokens(&self) -> Vec<String> {
        self.text
            .as_deref()
            .unwrap_or_default()
            .split_whitespace()
            .map(str::to_lowercase)
            .collect()
    }

    fn wanted_tags(&self) -> Vec<String> {
        self.tags
            .iter()
            .map(|t| t.trim().to_lowercase())
            .filter(|t| !t.is_empty())
            .collect()
    }
}

impl From<&str> for SearchQuery {
    fn from(text: &str) -> Self {
        Self::text(text)
    }
}

/// Context a tool is scored against besides its own fields.
pub(crate) struct Candidate<'a> {
    pub schema: &'a ToolSchema,
    /// Descriptor and server-provided instructions, lowercased.
    pub server_text: String,
}

/// Relevance of one candidate, or `None` when it does not match.
pub(crate) fn score(candidate: &Candidate<'_>, tokens: &[String], tags: &[String]) -> Option<u32> {
    let schema = candidate.schema;
    let tool_tags: Vec<String> = schema.tags.iter().map(|t| t.to_lowercase()).collect();
    if !tags.iter().all(|wanted| tool_tags.contains(wanted)) {
        return None;
    }

    let mut points = TAG_POINTS * tags.len() as u32;
    if tokens.is_empty() {
        return Some(points);
    }

    let name = schema.tool_name.to_lowercase();
    let description = schema.description.to_lowercase();
    let server = schema.owning_server.to_lowercase();
    let mut text_points = 0;
    for token in tokens {
        if name.contains(token.as_str()) {
            text_points += NAME_POINTS;
        }
        if tool_tags.iter().any(|tag| tag == token) {
            text_points += TAG_POINTS;
        }
        if description.contains(token.as_str()) {
            text_points += DESCRIPTION_POINTS;
        }
        if server.contains(token.as_str()) || candidate.server_text.contains(token.as_str()) {
            text_points += SERVER_POINTS;
        }
    }
    if text_points == 0 {
        return None;
    }
    points += text_points;
    Some(points)
}

/// Score, filter, order and truncate.
pub(crate) fn rank(candidates: Vec<Candidate<'_>>, query: &SearchQuery) -> Vec<ToolSchema> {
    let tokens = query.tokens();
    let tags = query.wanted_tags();

    let mut scored: Vec<(u32, &ToolSchema)> = candidates
        .iter()
        .filter_map(|c| score(c, &tokens, &tags).map(|points| (points, c.schema)))
        .collect();

    scored.sort_by(|(a_points, a), (b_points, b)| {
        b_points
            .cmp(a_points)
            .then_with(|| a.owning_server.cmp(&b.owning_server))
            .then_with(|| a.tool_name.cmp(&b.tool_name))
    });

    let limit = query.limit.unwrap_or(usize::MAX);
    scored
        .into_iter()
        .take(limit)
        .map(|(_, schema)| schema.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn schema(server: &str, tool: &str, description: &str, tags: &[&str]) -> ToolSchema {
        ToolSchema {
            owning_server: server.into(),
            tool_name: tool.into(),
            description: description.into(),
            input_schema: json!({"type": "object"}),
            tags: tags.iter().map(|t| t.to_string()).collect(),
        }
    }

    fn names(results: &[ToolSchema]) -> Vec<String> {
        results.iter().map(ToolSchema::qualified_name).collect()
    }

    fn candidates(schemas: &[ToolSchema]) -> Vec<Candidate<'_>> {
        schemas
            .iter()
            .map(|schema| Candidate {
                schema,
                server_text: String::new(),
            })
            .collect()
    }

    #[test]
    fn name_matches_outrank_description_matches() {
        let schemas = vec![
            schema("docs", "lookup", "search the docs", &[]),
            schema("web", "search", "query the web", &[]),
        ];
        let results = rank(candidates(&schemas), &SearchQuery::text("search"));
        assert_eq!(names(&results), vec!["web.search", "docs.lookup"]);
    }

    #[test]
    fn ties_break_by_server_then_tool() {
        let schemas = vec![
            schema("beta", "search", "", &[]),
            schema("alpha", "search", "", &[]),
            schema("alpha", "search_all", "", &[]),
        ];
        let results = rank(candidates(&schemas), &SearchQuery::text("search"));
        assert_eq!(
            names(&results),
            vec!["alpha.search", "alpha.search_all", "beta.search"]
        );
    }

    #[test]
    fn non_matching_tools_are_excluded() {
        let schemas = vec![schema("web", "fetch", "download a page", &[])];
        assert!(rank(candidates(&schemas), &SearchQuery::text("calendar")).is_empty());
    }

    #[test]
    fn tags_filter_and_limit() {
        let schemas = vec![
            schema("a", "one", "", &["memory"]),
            schema("b", "two", "", &["memory", "write"]),
            schema("c", "three", "", &["write"]),
        ];
        let query = SearchQuery::all().with_tags(["Memory"]);
        assert_eq!(names(&rank(candidates(&schemas), &query)), vec!["a.one", "b.two"]);

        let limited = SearchQuery::all().with_limit(2);
        assert_eq!(names(&rank(candidates(&schemas), &limited)), vec!["a.one", "b.two"]);
    }

    #[test]
    fn server_instruction_contributes_to_score() {
        let schemas = vec![schema("kb", "get", "", &[])];
        let with_context = vec![Candidate {
            schema: &schemas[0],
            server_text: "company handbook and policies".into(),
        }];
        let results = rank(with_context, &SearchQuery::text("handbook"));
        assert_eq!(names(&results), vec!["kb.get"]);
    }
}

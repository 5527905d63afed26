//! Server instruction rendering for the agent's prompt.

use std::collections::HashSet;

use crate::connection::ConnectionManager;

/// Where an instruction came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum InstructionOrigin {
    /// Operator-written text from the server's config entry.
    Descriptor,
    /// Text the server returned from `initialize`.
    Server,
}

/// One instruction with its provenance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstructionSource {
    pub server: String,
    pub origin: InstructionOrigin,
    pub instructions: String,
}

impl InstructionSource {
    pub fn new(
        server: impl Into<String>,
        origin: InstructionOrigin,
        instructions: impl Into<String>,
    ) -> Self {
        Self {
            server: server.into(),
            origin,
            instructions: instructions.into(),
        }
    }
}

/// Descriptor and handshake instructions for every configured server.
pub fn collect_sources(connections: &ConnectionManager) -> Vec<InstructionSource> {
    let mut sources = Vec::new();
    for name in connections.server_names() {
        if let Some(descriptor) = connections.descriptor(&name) {
            sources.push(InstructionSource::new(
                &name,
                InstructionOrigin::Descriptor,
                descriptor.instruction(),
            ));
        }
        if let Some(text) = connections
            .server_info(&name)
            .and_then(|info| info.instructions)
        {
            sources.push(InstructionSource::new(&name, InstructionOrigin::Server, text));
        }
    }
    sources
}

/// Render a deterministic block: one `[server:name]` section per server,
/// ordered by name, with blank and repeated instructions dropped.
pub fn render_instruction_block(sources: &[InstructionSource]) -> Option<String> {
    let normalized = normalize(sources);
    if normalized.is_empty() {
        return None;
    }

    let mut sections: Vec<(String, Vec<String>)> = Vec::new();
    for source in normalized {
        match sections.last_mut() {
            Some((server, texts)) if *server == source.server => texts.push(source.instructions),
            _ => sections.push((source.server, vec![source.instructions])),
        }
    }

    let body = sections
        .into_iter()
        .map(|(server, texts)| format!("[server:{server}]\n{}", texts.join("\n")))
        .collect::<Vec<_>>()
        .join("\n\n");
    Some(format!("Tool server instructions:\n\n{body}"))
}

/// Append the instruction block to an existing system prompt.
pub fn merge_instructions(system_prompt: Option<&str>, sources: &[InstructionSource]) -> Option<String> {
    match (system_prompt, render_instruction_block(sources)) {
        (None, None) => None,
        (Some(prompt), None) => Some(prompt.to_string()),
        (None, Some(block)) => Some(block),
        (Some(prompt), Some(block)) => Some(format!("{prompt}\n\n{block}")),
    }
}

fn normalize(sources: &[InstructionSource]) -> Vec<InstructionSource> {
    let mut sources: Vec<InstructionSource> = sources
        .iter()
        .filter(|s| !s.instructions.trim().is_empty())
        .map(|s| InstructionSource {
            instructions: s.instructions.trim().to_string(),
            ..s.clone()
        })
        .collect();
    sources.sort_by(|a, b| a.server.cmp(&b.server).then(a.origin.cmp(&b.origin)));

    let mut seen = HashSet::new();
    sources.retain(|s| seen.insert((s.server.clone(), s.instructions.clone())));
    sources
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn descriptor(server: &str, text: &str) -> InstructionSource {
        InstructionSource::new(server, InstructionOrigin::Descriptor, text)
    }

    fn handshake(server: &str, text: &str) -> InstructionSource {
        InstructionSource::new(server, InstructionOrigin::Server, text)
    }

    #[test]
    fn block_is_ordered_and_grouped_by_server() {
        let block = render_instruction_block(&[
            handshake("beta", "Beta says hi"),
            descriptor("alpha", "Use alpha for docs"),
            descriptor("beta", "Use beta for code"),
        ])
        .expect("block should render");

        assert_eq!(
            block,
            "Tool server instructions:\n\n\
             [server:alpha]\nUse alpha for docs\n\n\
             [server:beta]\nUse beta for code\nBeta says hi"
        );
    }

    #[test]
    fn blanks_and_duplicates_are_dropped() {
        let block = render_instruction_block(&[
            descriptor("alpha", "  "),
            descriptor("alpha", "Same text"),
            handshake("alpha", "Same text "),
        ])
        .expect("block should render");
        assert_eq!(block.matches("Same text").count(), 1);

        assert!(render_instruction_block(&[descriptor("alpha", "")]).is_none());
    }

    #[test]
    fn merge_appends_block() {
        let merged = merge_instructions(Some("System prompt"), &[descriptor("a", "Hello")])
            .expect("merged prompt");
        assert!(merged.starts_with("System prompt\n\n"));
        assert!(merged.contains("[server:a]"));
        assert_eq!(merge_instructions(None, &[]), None);
    }
}

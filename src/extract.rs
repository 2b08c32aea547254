//! Pulls the useful payload out of free-form model output.

const FENCE: &str = "```";

/// Return the first fenced block's body, else the greedy `{...}` span, else the input unchanged.
pub fn extract(raw: &str) -> String {
    if let Some(block) = fenced_block(raw) {
        return block.to_string();
    }
    if let Some(object) = brace_span(raw) {
        return object.to_string();
    }
    raw.to_string()
}

/// Code-artifact flavor of [`extract`]: a fenced block, or the whole text trimmed.
pub fn extract_code(raw: &str) -> String {
    fenced_block(raw).unwrap_or_else(|| raw.trim()).to_string()
}

/// First ``` fence (language tag optional) that has a closing fence.
pub fn fenced_block(raw: &str) -> Option<&str> {
    let mut search_from = 0;
    while let Some(rel) = raw[search_from..].find(FENCE) {
        let open = search_from + rel;
        let after_open = open + FENCE.len();
        // Skip the language tag (everything up to the end of the opening line).
        let body_start = match raw[after_open..].find('\n') {
            Some(nl) => {
                let tag = raw[after_open..after_open + nl].trim();
                if tag.chars().all(|c| c.is_alphanumeric() || matches!(c, '_' | '-' | '+' | '.')) {
                    after_open + nl + 1
                } else {
                    after_open
                }
            }
            None => after_open,
        };
        if let Some(close_rel) = raw[body_start..].find(FENCE) {
            return Some(raw[body_start..body_start + close_rel].trim());
        }
        search_from = after_open;
    }
    None
}

/// Greedy span from the first `{` to the last `}`.
pub fn brace_span(raw: &str) -> Option<&str> {
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    (end > start).then(|| &raw[start..=end])
}

//! Best-effort content sniffing for returned chunks. This looks at the
//! chunk actually being returned, not the whole stream, so a page that
//! starts mid-document may legitimately sniff as `text/plain`.

pub fn sniff_mime(chunk: &str) -> &'static str {
    let trimmed = chunk.trim_start();

    if (trimmed.starts_with('{') || trimmed.starts_with('['))
        && serde_json::from_str::<serde_json::Value>(chunk.trim()).is_ok()
    {
        return "application/json";
    }

    if trimmed.starts_with('<') && trimmed.contains("</") {
        return "application/xml";
    }

    let lower = trimmed.to_ascii_lowercase();
    if lower.starts_with("<!doctype html") || lower.starts_with("<html") {
        return "text/html";
    }

    if let Some(first_line) = trimmed.lines().next()
        && first_line.split(',').count() >= 3
    {
        return "text/csv";
    }

    if !trimmed.contains(';') && looks_like_yaml(trimmed) {
        return "text/yaml";
    }

    "text/plain"
}

fn looks_like_yaml(content: &str) -> bool {
    let mut saw_any = false;
    for line in content.lines() {
        let line = line.trim_start();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        saw_any = true;
        let is_list_item = line.starts_with("- ") || line == "-";
        let is_mapping = line
            .split_once(':')
            .is_some_and(|(key, _)| !key.is_empty() && key.chars().all(|c| c.is_alphanumeric() || c == '_' || c == '-'));
        if !is_list_item && !is_mapping {
            return false;
        }
    }
    saw_any
}

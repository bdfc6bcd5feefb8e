//! Markdown to docx block conversion and reply chunking.
use serde_json::{Value, json};

/// Feishu accepts at most this many children per append call.
pub const MAX_BLOCKS_PER_CALL: usize = 50;

const BLOCK_TEXT: u8 = 2;
const BLOCK_HEADING1: u8 = 3;
const BLOCK_HEADING2: u8 = 4;
const BLOCK_HEADING3: u8 = 5;

/// One docx block per non-empty line.  `#`, `##` and `###` prefixes become
/// headings; everything else is a text block.
pub fn markdown_to_blocks(markdown: &str) -> Vec<Value> {
    markdown
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| {
            if let Some(rest) = line.strip_prefix("### ") {
                block(BLOCK_HEADING3, "heading3", rest)
            } else if let Some(rest) = line.strip_prefix("## ") {
                block(BLOCK_HEADING2, "heading2", rest)
            } else if let Some(rest) = line.strip_prefix("# ") {
                block(BLOCK_HEADING1, "heading1", rest)
            } else {
                block(BLOCK_TEXT, "text", line)
            }
        })
        .collect()
}

fn block(block_type: u8, field: &str, content: &str) -> Value {
    let mut value = json!({ "block_type": block_type });
    value[field] = json!({ "elements": [{ "text_run": { "content": content } }] });
    value
}

/// Split `text` on line boundaries into chunks of at most `max_chars`
/// characters.  A single overlong line is kept whole.
pub fn chunk_message(text: &str, max_chars: usize) -> Vec<String> {
    if text.chars().count() <= max_chars {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_len = 0;

    for line in text.lines() {
        let line_len = line.chars().count() + 1;
        if current_len > 0 && current_len + line_len > max_chars {
            chunks.push(current.trim_end().to_string());
            current.clear();
            current_len = 0;
        }
        current.push_str(line);
        current.push('\n');
        current_len += line_len;
    }

    if !current.trim().is_empty() {
        chunks.push(current.trim_end().to_string());
    }
    if chunks.is_empty() {
        chunks.push(text.to_string());
    }
    chunks
}

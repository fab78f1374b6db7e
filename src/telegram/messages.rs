//! Markdown rendering for terminal run output (spec §4.6 "Delivery").
//!
//! Splits assistant output into chat-sized chunks plus fenced code blocks
//! rendered as document attachments, and escapes MarkdownV2 reserved
//! characters for everything that isn't already inside a code span.

#[derive(Debug, Clone)]
pub struct CodeAttachment {
    pub filename: String,
    pub language: Option<String>,
    pub content: String,
}

#[derive(Debug, Clone, Default)]
pub struct RenderedOutput {
    pub chunks: Vec<String>,
    pub attachments: Vec<CodeAttachment>,
}

pub struct MessageFormatter {
    message_limit: usize,
}

impl MessageFormatter {
    pub fn new(message_limit: usize) -> Self {
        Self { message_limit }
    }

    /// Escapes MarkdownV2 reserved characters, per Telegram's Bot API spec.
    pub fn escape_markdown_v2(text: &str) -> String {
        text.chars()
            .map(|c| match c {
                '_' | '*' | '[' | ']' | '(' | ')' | '~' | '`' | '>' | '#' | '+' | '-' | '=' | '|' | '{' | '}' | '.'
                | '!' | '\\' => format!("\\{c}"),
                _ => c.to_string(),
            })
            .collect()
    }

    pub fn render_success_empty(&self) -> String {
        "Run succeeded with no output.".to_string()
    }

    pub fn render_failure(&self, message: &str) -> String {
        format!("\u{274c} {message}")
    }

    /// Pulls fenced code blocks out as attachments and chunks the remaining
    /// prose to fit `message_limit`.
    pub fn render_success(&self, text: &str) -> RenderedOutput {
        let (prose, attachments) = extract_code_blocks(text);
        let prose = prose.trim();
        let chunks = if prose.is_empty() {
            Vec::new()
        } else {
            self.chunk(prose)
        };
        RenderedOutput { chunks, attachments }
    }

    fn chunk(&self, text: &str) -> Vec<String> {
        if text.chars().count() <= self.message_limit {
            return vec![text.to_string()];
        }

        let mut chunks = Vec::new();
        let mut current = String::new();
        for line in text.split('\n') {
            let candidate_len = current.chars().count() + line.chars().count() + 1;
            if !current.is_empty() && candidate_len > self.message_limit {
                chunks.push(std::mem::take(&mut current));
            }
            if line.chars().count() > self.message_limit {
                for piece in hard_wrap(line, self.message_limit) {
                    if !current.is_empty() {
                        chunks.push(std::mem::take(&mut current));
                    }
                    current = piece;
                }
                continue;
            }
            if !current.is_empty() {
                current.push('\n');
            }
            current.push_str(line);
        }
        if !current.is_empty() {
            chunks.push(current);
        }
        chunks
    }
}

fn hard_wrap(line: &str, limit: usize) -> Vec<String> {
    line.chars()
        .collect::<Vec<_>>()
        .chunks(limit)
        .map(|c| c.iter().collect())
        .collect()
}

/// Extracts ` ```lang\n...\n``` ` fenced blocks into attachments, leaving
/// the surrounding prose behind with each block replaced by a short marker.
fn extract_code_blocks(text: &str) -> (String, Vec<CodeAttachment>) {
    let mut prose = String::new();
    let mut attachments = Vec::new();
    let mut rest = text;
    let mut index = 1;

    while let Some(start) = rest.find("```") {
        prose.push_str(&rest[..start]);
        let after_fence = &rest[start + 3..];
        let Some(end) = after_fence.find("```") else {
            // Unterminated fence: treat the rest as plain prose.
            prose.push_str(&rest[start..]);
            rest = "";
            break;
        };
        let block = &after_fence[..end];
        let (language, content) = match block.split_once('\n') {
            Some((lang, body)) if !lang.trim().is_empty() && !lang.contains(' ') => {
                (Some(lang.trim().to_string()), body.to_string())
            }
            _ => (None, block.to_string()),
        };

        let ext = language.as_deref().map(extension_for_language).unwrap_or("txt");
        attachments.push(CodeAttachment {
            filename: format!("attachment-{index}.{ext}"),
            language,
            content,
        });
        prose.push_str(&format!("[attachment-{index}.{ext}]\n"));
        index += 1;

        rest = &after_fence[end + 3..];
    }
    prose.push_str(rest);
    (prose, attachments)
}

fn extension_for_language(language: &str) -> &'static str {
    match language.to_lowercase().as_str() {
        "rust" | "rs" => "rs",
        "python" | "py" => "py",
        "javascript" | "js" => "js",
        "typescript" | "ts" => "ts",
        "json" => "json",
        "bash" | "sh" | "shell" => "sh",
        "yaml" | "yml" => "yml",
        "toml" => "toml",
        "sql" => "sql",
        _ => "txt",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_reserved_characters() {
        let escaped = MessageFormatter::escape_markdown_v2("a.b-c!");
        assert_eq!(escaped, "a\\.b\\-c\\!");
    }

    #[test]
    fn short_text_is_single_chunk() {
        let formatter = MessageFormatter::new(100);
        let rendered = formatter.render_success("hello world");
        assert_eq!(rendered.chunks, vec!["hello world".to_string()]);
        assert!(rendered.attachments.is_empty());
    }

    #[test]
    fn long_text_splits_into_multiple_chunks() {
        let formatter = MessageFormatter::new(10);
        let rendered = formatter.render_success("line one\nline two\nline three");
        assert!(rendered.chunks.len() > 1);
        assert!(rendered.chunks.iter().all(|c| c.chars().count() <= 10));
    }

    #[test]
    fn fenced_code_becomes_attachment() {
        let formatter = MessageFormatter::new(4000);
        let rendered = formatter.render_success("here:\n```rust\nfn main() {}\n```\ndone");
        assert_eq!(rendered.attachments.len(), 1);
        assert_eq!(rendered.attachments[0].filename, "attachment-1.rs");
        assert!(rendered.chunks[0].contains("attachment-1.rs"));
    }
}

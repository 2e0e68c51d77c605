//! Prefix canonicalisation and block hashing (component A).
//!
//! Turns a chat message array into a single canonical text, then splits that
//! text into fixed-width word windows and hashes each window. The resulting
//! chain of hashes is what the matching engine compares between requests.

use sha2::{Digest, Sha256};

use crate::api_types::{Message, MessageContent};

/// Marker delimiters. These are part of the cache's content address: changing
/// any of them invalidates every KV file and metadata record already on disk.
const BOS_MARKER: &str = "<|bos|>\n";
const SYSTEM_MARKER: &str = "<|system|>\n";
const ASSISTANT_MARKER: &str = "<|assistant|>\n";
const USER_MARKER: &str = "<|user|>\n";

fn normalize_content(content: &Option<MessageContent>) -> String {
    match content {
        None => String::new(),
        Some(MessageContent::Text(s)) => s.trim().to_string(),
        Some(MessageContent::Parts(parts)) => {
            let joined: Vec<&str> = parts
                .iter()
                .filter(|p| p.kind == "text")
                .filter_map(|p| p.text.as_deref())
                .map(|t| t.trim())
                .filter(|t| !t.is_empty())
                .collect();
            joined.join(" ").trim().to_string()
        }
    }
}

/// Builds the canonical prefix text for a message array.
///
/// `system_prompt` is the already-loaded, trimmed contents of the configured
/// system prompt file (if any) — loading from disk is the caller's job so this
/// function stays pure and deterministic (P1).
pub fn canonical_chat_prefix(messages: &[Message], system_prompt: Option<&str>, add_bos: bool) -> String {
    let mut out = String::new();
    if add_bos {
        out.push_str(BOS_MARKER);
    }
    if let Some(sys) = system_prompt {
        let trimmed = sys.trim();
        if !trimmed.is_empty() {
            out.push_str(SYSTEM_MARKER);
            out.push_str(trimmed);
            out.push('\n');
        }
    }
    for m in messages {
        let content = normalize_content(&m.content);
        match m.role.as_str() {
            "system" => {
                if !content.is_empty() {
                    out.push_str(SYSTEM_MARKER);
                    out.push_str(&content);
                    out.push('\n');
                }
            }
            "assistant" => {
                out.push_str(ASSISTANT_MARKER);
                out.push_str(&content);
                out.push('\n');
            }
            "user" => {
                out.push_str(USER_MARKER);
                out.push_str(&content);
                out.push('\n');
            }
            other => {
                out.push_str(&format!("<|user:{other}|>\n"));
                out.push_str(&content);
                out.push('\n');
            }
        }
    }
    out.push_str(ASSISTANT_MARKER);
    out
}

/// Splits on runs of whitespace; no locale folding, stable ordering.
pub fn words_from_text(text: &str) -> Vec<&str> {
    text.trim().split_whitespace().collect()
}

fn sha256_hex(data: &str) -> String {
    let digest = Sha256::digest(data.as_bytes());
    hex::encode(digest)
}

/// Groups words into windows of `words_per_block` and hashes each window.
/// The last window may be shorter than `words_per_block` (P2).
pub fn block_hashes_from_text(text: &str, words_per_block: usize) -> Vec<String> {
    let words = words_from_text(text);
    if words_per_block == 0 {
        return Vec::new();
    }
    words
        .chunks(words_per_block)
        .map(|chunk| sha256_hex(&chunk.join(" ")))
        .collect()
}

/// Longest common prefix length between two block-hash chains, in blocks (P3).
pub fn lcp_blocks(a: &[String], b: &[String]) -> usize {
    a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count()
}

/// Similarity ratio in `[0, 1]`: LCP normalised by the shorter chain's length.
/// An empty chain on either side has no meaningful overlap.
pub fn similarity_ratio(a: &[String], b: &[String]) -> f64 {
    let denom = a.len().min(b.len());
    if denom == 0 {
        return 0.0;
    }
    lcp_blocks(a, b) as f64 / denom as f64
}

/// SHA-256 of the full canonical text, hex-lowercase.
pub fn prefix_key_sha256(prefix_text: &str) -> String {
    sha256_hex(prefix_text)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(role: &str, text: &str) -> Message {
        Message {
            role: role.to_string(),
            content: Some(MessageContent::Text(text.to_string())),
        }
    }

    #[test]
    fn canonicalise_is_deterministic() {
        let messages = vec![msg("user", "hello there"), msg("assistant", "hi!")];
        let a = canonical_chat_prefix(&messages, None, true);
        let b = canonical_chat_prefix(&messages, None, true);
        assert_eq!(a, b);
    }

    #[test]
    fn canonical_form_uses_role_markers_and_anchors_assistant() {
        let messages = vec![msg("user", "hi")];
        let text = canonical_chat_prefix(&messages, None, true);
        assert!(text.starts_with("<|bos|>\n"));
        assert!(text.contains("<|user|>\nhi\n"));
        assert!(text.ends_with("<|assistant|>\n"));
    }

    #[test]
    fn unknown_role_falls_back_to_labelled_marker() {
        let messages = vec![msg("tool", "result text")];
        let text = canonical_chat_prefix(&messages, None, false);
        assert!(text.contains("<|user:tool|>\nresult text\n"));
    }

    #[test]
    fn multi_part_content_keeps_only_text_parts() {
        let content = MessageContent::Parts(vec![
            ContentPartFixture::text("first"),
            ContentPartFixture::image(),
            ContentPartFixture::text("second"),
        ]);
        assert_eq!(normalize_content(&Some(content)), "first second");
    }

    struct ContentPartFixture;
    impl ContentPartFixture {
        fn text(t: &str) -> crate::api_types::ContentPart {
            crate::api_types::ContentPart {
                kind: "text".to_string(),
                text: Some(t.to_string()),
            }
        }
        fn image() -> crate::api_types::ContentPart {
            crate::api_types::ContentPart {
                kind: "image_url".to_string(),
                text: None,
            }
        }
    }

    #[test]
    fn block_count_matches_ceiling_division() {
        let text = (0..40).map(|i| i.to_string()).collect::<Vec<_>>().join(" ");
        let blocks = block_hashes_from_text(&text, 16);
        assert_eq!(blocks.len(), 3); // ceil(40/16) = 3
    }

    #[test]
    fn last_block_hashes_the_short_remainder() {
        let words: Vec<String> = (0..40).map(|i| i.to_string()).collect();
        let blocks = block_hashes_from_text(&words.join(" "), 16);
        let expected_last = super::sha256_hex(&words[32..40].join(" "));
        assert_eq!(blocks[2], expected_last);
    }

    #[test]
    fn lcp_properties_hold() {
        let a = vec!["h1".to_string(), "h2".to_string(), "h3".to_string()];
        let b = vec!["h1".to_string(), "h2".to_string(), "h4".to_string()];
        assert_eq!(lcp_blocks(&a, &a), a.len());
        assert_eq!(lcp_blocks(&a, &b), lcp_blocks(&b, &a));
        assert!(lcp_blocks(&a, &b) <= a.len().min(b.len()));
        assert_eq!(lcp_blocks(&a, &b), 2);
    }

    #[test]
    fn prefix_key_is_stable_sha256_hex() {
        let key = prefix_key_sha256("hello");
        assert_eq!(key.len(), 64);
        assert_eq!(key, prefix_key_sha256("hello"));
    }
}

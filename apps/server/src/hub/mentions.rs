//! Server-authoritative mention resolution.
//!
//! The text keeps whatever the sender typed; only the structured `mentions`
//! field is resolved here, against the current room's members.

use super::events::MemberView;

/// Maximum characters scanned after an `@`.
const MAX_TOKEN_LEN: usize = 50;

fn is_token_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')
}

/// Extract candidate `@name` tokens from message text, in order.
fn scan_tokens(text: &str) -> Vec<&str> {
    let mut tokens = Vec::new();
    let mut rest = text;
    while let Some(at) = rest.find('@') {
        let after = &rest[at + 1..];
        let len = after
            .chars()
            .take(MAX_TOKEN_LEN)
            .take_while(|c| is_token_char(*c))
            .count();
        if len > 0 {
            tokens.push(&after[..len]);
        }
        rest = &after[len..];
    }
    tokens
}

/// Resolve `@name` tokens against the room's members, case-insensitively by
/// display name. Unmatched tokens are dropped; matches are deduplicated with
/// insertion order preserved.
pub fn resolve(text: &str, members: &[MemberView]) -> Vec<String> {
    let mut resolved = Vec::new();
    for token in scan_tokens(text) {
        let matched = members
            .iter()
            .find(|m| m.display_name.eq_ignore_ascii_case(token));
        if let Some(member) = matched {
            if !resolved.contains(&member.user_id) {
                resolved.push(member.user_id.clone());
            }
        }
    }
    resolved
}

//! Route-key derivation.
//!
//! Rate limits are scoped per route, where only the channel, guild and
//! webhook IDs are part of the identity. Everything else that looks like a
//! snowflake collapses to a placeholder so `/channels/1/messages/2` and
//! `/channels/1/messages/3` share a bucket while `/channels/4/messages/5`
//! does not. Reaction emoji segments collapse too — every emoji shares the
//! message-reaction limiter.

/// Path segments whose *following* ID is a major parameter.
const MAJOR_SEGMENTS: [&str; 3] = ["channels", "guilds", "webhooks"];

/// Derive the bucket lookup key for a request: `METHOD:normalized-path`.
#[must_use]
pub fn route_key(method: &str, path: &str) -> String {
    format!("{method}:{}", normalize_path(path))
}

fn normalize_path(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    let mut previous = "";

    for segment in path.split('/') {
        if segment.is_empty() {
            continue;
        }
        out.push('/');

        if previous == "reactions" {
            // Emoji segment, URL-encoded unicode or `name:id`.
            out.push_str("{emoji}");
        } else if is_snowflake(segment) && !MAJOR_SEGMENTS.contains(&previous) {
            out.push_str("{id}");
        } else {
            out.push_str(segment);
        }
        previous = segment;
    }

    if out.is_empty() {
        out.push('/');
    }
    out
}

fn is_snowflake(segment: &str) -> bool {
    !segment.is_empty() && segment.bytes().all(|b| b.is_ascii_digit())
}

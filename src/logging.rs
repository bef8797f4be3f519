use tracing_subscriber::EnvFilter;

const MIN_SECRET_TAIL: usize = 12;

/// Installs the global fmt subscriber. `filter` uses `EnvFilter` directive
/// syntax; an unparseable filter falls back to `info`. Calling this more than
/// once is harmless: later calls leave the first subscriber in place.
pub fn init_tracing(filter: &str) {
    let env_filter = EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .try_init();
}

/// Strips credentials from text that is about to be logged or stored in a
/// run log.
pub fn sanitize_log_message(input: &str) -> String {
    let masked = input
        .replace("Authorization", "[REDACTED_HEADER]")
        .replace("Bearer ", "[REDACTED_BEARER] ")
        .replace("api_key", "[REDACTED_FIELD]");
    redact_key_tokens(&masked)
}

// Replaces `sk-` prefixed tokens with a long enough tail.
fn redact_key_tokens(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(pos) = rest.find("sk-") {
        let at_boundary = rest[..pos]
            .chars()
            .next_back()
            .map(|c| !c.is_ascii_alphanumeric())
            .unwrap_or(true);
        let tail = &rest[pos + 3..];
        let tail_len = tail
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_' || c == '-'))
            .unwrap_or(tail.len());

        out.push_str(&rest[..pos]);
        if at_boundary && tail_len >= MIN_SECRET_TAIL {
            out.push_str("[REDACTED_KEY]");
            rest = &tail[tail_len..];
        } else {
            out.push_str("sk-");
            rest = tail;
        }
    }

    out.push_str(rest);
    out
}

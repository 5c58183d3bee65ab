//! Transcript reconciliation
//!
//! Recognition backends differ in how they report progress: some resend
//! a growing "so-far" transcript, some resend a truncated prefix, some
//! emit unrelated fragments per utterance segment. Successive updates
//! are merged under one policy:
//!
//! - no prior text: accept the update;
//! - update extends the prior text (prefix relation): accept the longer;
//! - update is a prefix of the prior text: keep the prior (never regress);
//! - no prefix relation either way: append, preferring duplication over
//!   silent data loss.

/// Merge one backend text update into the transcript so far.
pub fn reconcile(previous: Option<&str>, incoming: &str) -> String {
    let incoming = incoming.trim_end();
    let Some(previous) = previous.filter(|p| !p.is_empty()) else {
        return incoming.to_string();
    };
    if incoming.is_empty() {
        return previous.to_string();
    }
    if incoming.starts_with(previous) {
        // Growing "so-far" transcript.
        return incoming.to_string();
    }
    if previous.starts_with(incoming) {
        // Shorter prefix of what we already have.
        return previous.to_string();
    }
    // Ambiguous increment strategy; keep both.
    format!("{previous}{incoming}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_update_accepted() {
        assert_eq!(reconcile(None, "he"), "he");
        assert_eq!(reconcile(Some(""), "he"), "he");
    }

    #[test]
    fn test_growth_accepted_regression_rejected() {
        let mut text = reconcile(None, "he");
        text = reconcile(Some(&text), "hello");
        text = reconcile(Some(&text), "hell");
        assert_eq!(text, "hello");
    }

    #[test]
    fn test_unrelated_fragments_append() {
        let text = reconcile(Some("foo"), "bar");
        assert_eq!(text, "foobar");
    }

    #[test]
    fn test_empty_update_keeps_previous() {
        assert_eq!(reconcile(Some("hello"), ""), "hello");
    }

    #[test]
    fn test_identical_update_is_stable() {
        assert_eq!(reconcile(Some("hello"), "hello"), "hello");
    }
}

/// Best-effort comparison between a locally recorded outbound text and its echoed copy.
pub trait EchoMatcher: Send + Sync {
    fn name(&self) -> &'static str;

    fn matches(&self, recorded: &str, echoed: &str) -> bool;
}

pub fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Accepts when one normalized string contains the other. Contained strings shorter than
/// `min_len` characters are ignored so that "ok" does not match every sentence containing it.
#[derive(Debug, Clone, Copy)]
pub struct ContainmentMatcher {
    pub min_len: usize,
}

impl Default for ContainmentMatcher {
    fn default() -> Self {
        Self { min_len: 4 }
    }
}

impl EchoMatcher for ContainmentMatcher {
    fn name(&self) -> &'static str {
        "containment"
    }

    fn matches(&self, recorded: &str, echoed: &str) -> bool {
        let recorded = normalize_whitespace(recorded);
        let echoed = normalize_whitespace(echoed);
        if recorded.is_empty() || echoed.is_empty() {
            return false;
        }
        if recorded == echoed {
            return true;
        }
        let (shorter, longer) = if recorded.chars().count() <= echoed.chars().count() {
            (&recorded, &echoed)
        } else {
            (&echoed, &recorded)
        };
        shorter.chars().count() >= self.min_len && longer.contains(shorter.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NormalizedEqualityMatcher;

impl EchoMatcher for NormalizedEqualityMatcher {
    fn name(&self) -> &'static str {
        "normalized_equality"
    }

    fn matches(&self, recorded: &str, echoed: &str) -> bool {
        let recorded = normalize_whitespace(recorded);
        !recorded.is_empty() && recorded == normalize_whitespace(echoed)
    }
}

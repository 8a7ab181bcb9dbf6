use tally_core::BankTransaction;

/// Legal-form suffixes dropped before comparing counterparty names.
const STOPWORDS: &[&str] = &["ltd", "inc", "ag", "ab", "kft", "sa", "limited", "gmbh"];

/// Lowercase alphanumeric words joined by single spaces. Idempotent:
/// `normalize(normalize(x)) == normalize(x)`.
pub fn normalize(s: &str) -> String {
    s.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Uppercased string with everything but letters and digits removed.
/// Used for reference containment checks.
pub fn alphanumeric_upper(s: &str) -> String {
    s.chars()
        .filter(|c| c.is_alphanumeric())
        .collect::<String>()
        .to_uppercase()
}

fn name_tokens(s: &str) -> Vec<String> {
    normalize(s)
        .split_whitespace()
        .filter(|t| !STOPWORDS.contains(t))
        .map(str::to_string)
        .collect()
}

/// Token-set similarity between two counterparty names: Jaccard index over
/// adjacent-token bigrams, falling back to the plain token sets when either
/// side has fewer than two tokens after stopword removal.
pub fn name_similarity(a: &str, b: &str) -> f64 {
    let ta = name_tokens(a);
    let tb = name_tokens(b);
    if ta.is_empty() || tb.is_empty() {
        return 0.0;
    }

    let (sa, sb) = if ta.len() >= 2 && tb.len() >= 2 {
        (bigrams(&ta), bigrams(&tb))
    } else {
        (
            ta.iter().cloned().collect::<std::collections::BTreeSet<_>>(),
            tb.iter().cloned().collect::<std::collections::BTreeSet<_>>(),
        )
    };

    let intersection = sa.intersection(&sb).count();
    let union = sa.union(&sb).count();
    if union == 0 {
        return 0.0;
    }
    intersection as f64 / union as f64
}

fn bigrams(tokens: &[String]) -> std::collections::BTreeSet<String> {
    tokens
        .windows(2)
        .map(|w| format!("{} {}", w[0], w[1]))
        .collect()
}

/// Length of the longest common substring of the alphanumeric-normalized
/// forms of `a` and `b`. Two-row dynamic program.
pub fn longest_common_alnum_substring(a: &str, b: &str) -> usize {
    let a = alphanumeric_upper(a);
    let b = alphanumeric_upper(b);
    let (a, b) = (a.as_bytes(), b.as_bytes());
    if a.is_empty() || b.is_empty() {
        return 0;
    }

    let mut prev = vec![0usize; b.len() + 1];
    let mut curr = vec![0usize; b.len() + 1];
    let mut best = 0;

    for i in 1..=a.len() {
        for j in 1..=b.len() {
            curr[j] = if a[i - 1] == b[j - 1] {
                prev[j - 1] + 1
            } else {
                0
            };
            best = best.max(curr[j]);
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    best
}

/// The text embedded for pattern similarity: the normalized description
/// followed by the counterparty name and payment reference as-is.
pub fn embedding_text(tx: &BankTransaction) -> String {
    let text = format!(
        "{} {} {}",
        normalize(tx.description.as_deref().unwrap_or("")),
        tx.counterparty_name.as_deref().unwrap_or(""),
        tx.payment_reference.as_deref().unwrap_or(""),
    );
    text.trim().to_string()
}

use once_cell::sync::Lazy;
use regex::Regex;

/// Sentence boundaries: Latin terminators need trailing whitespace (so "3.5"
/// stays whole), full-width CJK terminators end a sentence on their own.
static BOUNDARY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"[.!?…]+["'”’)\]]*\s+|[。！？]+["'”’」』)]*\s*|\n+"#).unwrap()
});

/// Split text into trimmed, non-empty sentence-like units
pub fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut start = 0;
    for boundary in BOUNDARY.find_iter(text) {
        push_trimmed(&mut sentences, &text[start..boundary.end()]);
        start = boundary.end();
    }
    push_trimmed(&mut sentences, &text[start..]);
    sentences
}

fn push_trimmed(out: &mut Vec<String>, piece: &str) {
    let piece = piece.trim();
    if !piece.is_empty() {
        out.push(piece.to_string());
    }
}

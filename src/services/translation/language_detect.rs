// Best-effort source language guess from the writing system
//
// Only scripts that identify a language with reasonable confidence yield a
// guess. Latin text (and anything mixed or unknown) yields `None` so no
// misleading hint reaches the provider.

fn is_han(c: char) -> bool {
    matches!(c, '\u{4E00}'..='\u{9FFF}' | '\u{3400}'..='\u{4DBF}' | '\u{F900}'..='\u{FAFF}')
}

fn is_kana(c: char) -> bool {
    matches!(c, '\u{3040}'..='\u{30FF}' | '\u{31F0}'..='\u{31FF}')
}

fn is_hangul(c: char) -> bool {
    matches!(c, '\u{AC00}'..='\u{D7AF}' | '\u{1100}'..='\u{11FF}' | '\u{3130}'..='\u{318F}')
}

fn script_language(c: char) -> Option<&'static str> {
    match c {
        '\u{0400}'..='\u{04FF}' => Some("ru"),
        '\u{0370}'..='\u{03FF}' => Some("el"),
        '\u{0590}'..='\u{05FF}' => Some("he"),
        '\u{0600}'..='\u{06FF}' => Some("ar"),
        '\u{0900}'..='\u{097F}' => Some("hi"),
        '\u{0E00}'..='\u{0E7F}' => Some("th"),
        _ => None,
    }
}

/// Guess the language of `text`, or `None` when the script is ambiguous
pub fn detect_language(text: &str) -> Option<&'static str> {
    let letters: Vec<char> = text.chars().filter(|c| c.is_alphabetic()).collect();
    if letters.is_empty() {
        return None;
    }

    if letters.iter().any(|&c| is_kana(c)) {
        return Some("ja");
    }
    if letters.iter().any(|&c| is_hangul(c)) {
        return Some("ko");
    }
    if letters.iter().all(|&c| is_han(c)) {
        return Some("zh");
    }

    // Every letter must agree on a single script
    let first = script_language(letters[0])?;
    letters
        .iter()
        .all(|&c| script_language(c) == Some(first))
        .then_some(first)
}

use std::collections::HashSet;

const SENTENCE_TERMINATORS: [char; 4] = ['.', '!', '?', '…'];
const TRAILING_CLOSERS: [char; 6] = ['"', '\'', '”', '’', ')', ']'];
/// Titles and short forms whose trailing dot does not end a sentence.
const ABBREVIATIONS: [&str; 11] = [
    "mr", "mrs", "ms", "dr", "prof", "sr", "jr", "st", "mt", "vs", "capt",
];
const NOTE_BULLETS: [char; 5] = ['-', '*', '•', '—', '–'];

/// Collapse every run of whitespace into a single space and trim the ends.
pub fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub fn word_count(text: &str) -> usize {
    text.split_whitespace().count()
}

/// Split prose into sentences. A sentence ends at a terminator (plus any closing
/// quotes or brackets) that is followed by whitespace or the end of the text.
/// Text without a final terminator becomes the last sentence as-is. A lone dot
/// after a known abbreviation ("Dr.", "Mrs.") or a single initial ("J.") does
/// not end a sentence.
pub fn split_sentences(text: &str) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    let mut sentences = Vec::new();
    let mut current = String::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        current.push(c);
        i += 1;

        if !SENTENCE_TERMINATORS.contains(&c) {
            continue;
        }

        if c == '.' && ends_with_abbreviation(&current[..current.len() - 1]) {
            continue;
        }

        // Absorb runs like "?!" or "..." and closing quotes.
        while i < chars.len()
            && (SENTENCE_TERMINATORS.contains(&chars[i]) || TRAILING_CLOSERS.contains(&chars[i]))
        {
            current.push(chars[i]);
            i += 1;
        }

        if i == chars.len() || chars[i].is_whitespace() {
            let sentence = normalize_whitespace(&current);
            if !sentence.is_empty() {
                sentences.push(sentence);
            }
            current.clear();
        }
    }

    let rest = normalize_whitespace(&current);
    if !rest.is_empty() {
        sentences.push(rest);
    }
    sentences
}

fn ends_with_abbreviation(text: &str) -> bool {
    let word = text
        .rsplit(|c: char| c.is_whitespace() || c == '(' || c == '"' || c == '“')
        .next()
        .unwrap_or_default();
    let mut letters = word.chars();
    match (letters.next(), letters.next()) {
        (Some(first), None) => first.is_uppercase(),
        (Some(_), Some(_)) => ABBREVIATIONS.contains(&word.to_lowercase().as_str()),
        _ => false,
    }
}

/// Break free-form note text into clean lines, dropping bullet markers.
pub fn note_lines(text: &str) -> Vec<String> {
    text.replace('\r', "\n")
        .split('\n')
        .map(|line| {
            line.trim_matches(|c: char| c.is_whitespace() || NOTE_BULLETS.contains(&c))
                .to_string()
        })
        .filter(|line| !line.is_empty())
        .collect()
}

/// Keep the first occurrence of each item, comparing case-insensitively.
pub fn dedupe_case_insensitive<I>(items: I) -> Vec<String>
where
    I: IntoIterator<Item = String>,
{
    let mut seen = HashSet::new();
    items
        .into_iter()
        .filter(|item| seen.insert(item.to_lowercase()))
        .collect()
}

/// Shorten `text` to at most `max_chars` characters, ending with an ellipsis.
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let kept: String = text.chars().take(max_chars.saturating_sub(1)).collect();
    format!("{}…", kept.trim_end())
}

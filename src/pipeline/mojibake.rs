//! Mis-decoded UTF-8 ("mojibake") lookup table.
//!
//! When UTF-8 bytes are decoded as Windows-1252 (or ISO-8859-1) each
//! multi-byte character turns into two or three Latin-1-looking characters:
//! `’` becomes `â€™`, `é` becomes `Ã©`. The table is generated rather than
//! typed out: for every target character we take its UTF-8 encoding and
//! decode those bytes through both code pages.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;
use std::ops::Range;

/// Characters whose mis-decoded forms are repaired.
const TARGETS: &[char] = &[
    // Punctuation
    '’', '‘', '“', '”', '„', '‚', '–', '—', '…', '•', '′', '″', '«', '»', '‹', '›', '¿', '¡',
    '·', '§', '¶', '†', '‡',
    // Symbols
    '€', '£', '¥', '¢', '™', '©', '®', '°', '±', '×', '÷', '½', '¼', '¾', 'µ', '\u{00A0}',
    // Latin-1 letters
    'à', 'á', 'â', 'ã', 'ä', 'å', 'æ', 'ç', 'è', 'é', 'ê', 'ë', 'ì', 'í', 'î', 'ï', 'ñ',
    'ò', 'ó', 'ô', 'õ', 'ö', 'ø', 'ù', 'ú', 'û', 'ü', 'ý', 'ÿ', 'ß', 'À', 'Á', 'Â', 'Ä',
    'Å', 'Ç', 'È', 'É', 'Ê', 'Í', 'Ñ', 'Ó', 'Ô', 'Ö', 'Ø', 'Ú', 'Ü',
    // Latin Extended-A seen in author names
    'ł', 'Ł', 'ś', 'ć', 'č', 'š', 'ž', 'ř', 'Š', 'Ž', 'œ', 'Œ',
];

/// Windows-1252 mapping for bytes 0x80..=0x9F. Undefined slots fall back to
/// the C1 control with the same value, which is what ISO-8859-1 yields.
fn cp1252(byte: u8) -> char {
    const HIGH: [u32; 32] = [
        0x20AC, 0x0081, 0x201A, 0x0192, 0x201E, 0x2026, 0x2020, 0x2021, 0x02C6, 0x2030, 0x0160,
        0x2039, 0x0152, 0x008D, 0x017D, 0x008F, 0x0090, 0x2018, 0x2019, 0x201C, 0x201D, 0x2022,
        0x2013, 0x2014, 0x02DC, 0x2122, 0x0161, 0x203A, 0x0153, 0x009D, 0x017E, 0x0178,
    ];
    match byte {
        0x80..=0x9F => char::from_u32(HIGH[(byte - 0x80) as usize]).unwrap_or(byte as char),
        _ => byte as char,
    }
}

fn misdecode(target: char, decode: fn(u8) -> char) -> String {
    let mut buf = [0u8; 4];
    target
        .encode_utf8(&mut buf)
        .bytes()
        .map(decode)
        .collect()
}

/// Mis-decoded sequence → intended character.
static TABLE: Lazy<HashMap<String, char>> = Lazy::new(|| {
    let mut table = HashMap::new();
    for &target in TARGETS {
        table.insert(misdecode(target, cp1252), target);
        table.insert(misdecode(target, |b| b as char), target);
    }
    table
});

/// Alternation over every key, longest first so that `â€™` wins over any
/// shorter key sharing its prefix.
static PATTERN: Lazy<Regex> = Lazy::new(|| {
    let mut keys: Vec<&String> = TABLE.keys().collect();
    keys.sort_by(|a, b| b.chars().count().cmp(&a.chars().count()).then(a.cmp(b)));
    let alternation = keys
        .iter()
        .map(|k| regex::escape(k))
        .collect::<Vec<_>>()
        .join("|");
    Regex::new(&alternation).unwrap()
});

/// Byte ranges of every mis-decoded sequence in `text`.
pub fn find_all(text: &str) -> Vec<Range<usize>> {
    PATTERN.find_iter(text).map(|m| m.range()).collect()
}

/// The intended character for a mis-decoded sequence.
pub fn replacement(sequence: &str) -> Option<char> {
    TABLE.get(sequence).copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_sequences_resolve() {
        assert_eq!(replacement("â€™"), Some('’'));
        assert_eq!(replacement("â€œ"), Some('“'));
        assert_eq!(replacement("â€”"), Some('—'));
        assert_eq!(replacement("Ã©"), Some('é'));
        assert_eq!(replacement("Ã¼"), Some('ü'));
        assert_eq!(replacement("Â°"), Some('°'));
    }

    #[test]
    fn find_all_reports_each_sequence() {
        let text = "donâ€™t cafÃ© â€œhiâ€\u{9d}";
        let found: Vec<&str> = find_all(text).into_iter().map(|r| &text[r]).collect();
        assert_eq!(found, vec!["â€™", "Ã©", "â€œ", "â€\u{9d}"]);
    }

    #[test]
    fn clean_text_has_no_matches() {
        assert!(find_all("plain ASCII, café, naïve — “quoted”").is_empty());
    }

    #[test]
    fn no_target_maps_to_itself() {
        for (key, &ch) in TABLE.iter() {
            assert_ne!(key.as_str(), ch.to_string().as_str());
            assert!(key.chars().count() >= 2);
        }
    }
}

// Dictionary (vocabulary) table encoding.
//
// Version-3 layout: separator count and codes, entry byte length, entry
// count, then the entries sorted by their truncated word. Each entry is a
// 4-byte encoded word (6 Z-characters) followed by a fixed number of data
// bytes, the same for every entry.

use log::debug;

use crate::buffer::{Label, ZBuffer};
use crate::error::CodeGenError;
use crate::text;

/// All-pad Z-word appended when a short word encodes to a single word.
const PAD_WORD: u16 = 0x8000 | (5 << 10) | (5 << 5) | 5;

/// Encoded dictionary words span exactly two Z-words.
const WORD_ZWORDS: usize = 2;

/// Encodes the vocabulary into the table section named `section`. Words are
/// truncated to six characters and lowercased before sorting; a collision
/// after truncation is fatal.
pub fn encode_vocabulary(
    section: Label,
    separators: &str,
    entries: &[(&str, &[u8])],
) -> Result<ZBuffer, CodeGenError> {
    let mut buf = ZBuffer::new(section);

    buf.u8(separators.len() as u8);
    for separator in separators.bytes() {
        buf.u8(separator);
    }

    let data_len = entries.first().map_or(0, |entry| entry.1.len());
    buf.u8((4 + data_len) as u8);
    buf.u16(entries.len() as u16);

    let mut sorted: Vec<(&str, String, &[u8])> = entries
        .iter()
        .map(|(word, data)| {
            let truncated: String = word.chars().take(6).collect::<String>().to_lowercase();
            (*word, truncated, *data)
        })
        .collect();
    sorted.sort_by(|left, right| left.1.cmp(&right.1));

    for pair in sorted.windows(2) {
        if pair[0].1 == pair[1].1 {
            return Err(CodeGenError::DuplicateWord(
                pair[0].0.to_string(),
                pair[1].0.to_string(),
            ));
        }
    }

    for (word, truncated, data) in &sorted {
        let mut words = text::words(truncated)?;
        if words.len() == 1 {
            // A short word: clear its end bit and pad to the full width.
            words[0] &= 0x7FFF;
            words.push(PAD_WORD);
        }
        if words.len() != WORD_ZWORDS {
            return Err(CodeGenError::WordTooLong((*word).to_string()));
        }
        for w in &words {
            buf.u16(*w);
        }

        if data.len() != data_len {
            return Err(CodeGenError::DictionaryDataMismatch {
                word: (*word).to_string(),
                len: data.len(),
                expected: data_len,
            });
        }
        buf.bytes(data);
    }

    debug!(
        "dictionary: {} entries, {} data bytes each",
        entries.len(),
        data_len
    );
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::LabelAllocator;
    use test_log::test;

    fn encode(separators: &str, entries: &[(&str, &[u8])]) -> Result<Vec<u8>, CodeGenError> {
        let mut labels = LabelAllocator::new();
        encode_vocabulary(labels.fresh("dictionary"), separators, entries)?.extract()
    }

    #[test]
    fn empty_vocabulary_still_has_a_well_formed_header() {
        let bytes = encode("Z", &[]).unwrap();
        assert_eq!(bytes, vec![1, b'Z', 4, 0, 0]);
    }

    #[test]
    fn entries_are_sorted_by_word() {
        let bytes = encode("", &[("zebra", &[1]), ("apple", &[2])]).unwrap();
        // Header: 0 separators, entry length 5, count 2.
        assert_eq!(&bytes[0..4], &[0, 5, 0, 2]);
        // "apple" sorts first; its data byte follows its 4 encoded bytes.
        assert_eq!(bytes[4 + 4], 2);
        assert_eq!(bytes[4 + 5 + 4], 1);
    }

    #[test]
    fn short_words_pad_to_four_bytes_with_the_end_bit_moved() {
        let bytes = encode("", &[("t", &[])]).unwrap();
        assert_eq!(bytes.len(), 4 + 4);
        let first = (bytes[4] as u16) << 8 | bytes[5] as u16;
        let second = (bytes[6] as u16) << 8 | bytes[7] as u16;
        assert_eq!(first & 0x8000, 0, "end bit cleared on the first word");
        assert_eq!(second, PAD_WORD);
    }

    #[test]
    fn words_truncate_to_six_characters() {
        let long = encode("", &[("lantern", &[])]).unwrap();
        let short = encode("", &[("lanter", &[])]).unwrap();
        assert_eq!(long, short);
    }

    #[test]
    fn truncation_collisions_are_fatal() {
        assert!(matches!(
            encode("", &[("lanterns", &[]), ("lantern", &[])]),
            Err(CodeGenError::DuplicateWord(_, _))
        ));
        assert!(matches!(
            encode("", &[("go", &[]), ("GO", &[])]),
            Err(CodeGenError::DuplicateWord(_, _))
        ));
    }

    #[test]
    fn words_with_shifted_characters_may_not_fit() {
        // Six digits need twelve Z-characters, four words.
        assert!(matches!(
            encode("", &[("123456", &[])]),
            Err(CodeGenError::WordTooLong(_))
        ));
    }

    #[test]
    fn data_width_must_match_the_first_entry() {
        assert!(matches!(
            encode("", &[("abc", &[1, 2]), ("def", &[3])]),
            Err(CodeGenError::DictionaryDataMismatch { .. })
        ));
    }
}

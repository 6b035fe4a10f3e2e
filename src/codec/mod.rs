use std::collections::HashMap;

use thiserror::Error;

pub const DEFAULT_COMPRESSION_THRESHOLD: usize = 1000;

const CODE_BASE: u32 = 0xF_0000;
const CODE_LAST: u32 = 0x10_FFFD;
const MAX_CODES: usize = (CODE_LAST - CODE_BASE + 1) as usize;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("code {code} references an undefined dictionary entry ({defined} defined)")]
    UndefinedCode { code: usize, defined: usize },
    #[error("dictionary exhausted after {0} entries")]
    DictionaryFull(usize),
    #[error("character U+{0:X} collides with the code range")]
    ReservedCharacter(u32),
}

/// Result of [`Codec::encode`]. `data` holds either the raw text or the
/// compressed payload, as flagged by `compressed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Encoded {
    pub compressed: bool,
    pub data: String,
    pub original_length: usize,
}

impl Encoded {
    fn raw(text: &str, original_length: usize) -> Self {
        Self {
            compressed: false,
            data: text.to_string(),
            original_length,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Codec {
    threshold: usize,
}

impl Default for Codec {
    fn default() -> Self {
        Self::new(DEFAULT_COMPRESSION_THRESHOLD)
    }
}

impl Codec {
    pub fn new(threshold: usize) -> Self {
        Self { threshold }
    }

    /// Never fails: texts below the threshold, texts that would not shrink and
    /// texts the coder cannot represent are returned uncompressed.
    pub fn encode(&self, text: &str) -> Encoded {
        let original_length = text.chars().count();
        if original_length < self.threshold {
            return Encoded::raw(text, original_length);
        }
        match compress(text) {
            Ok(data) if data.len() < text.len() => Encoded {
                compressed: true,
                data,
                original_length,
            },
            Ok(_) => {
                tracing::trace!(original_length, "compressed payload not smaller, keeping raw");
                Encoded::raw(text, original_length)
            }
            Err(err) => {
                tracing::debug!(?err, "compression skipped, keeping raw text");
                Encoded::raw(text, original_length)
            }
        }
    }

    pub fn decode(&self, data: &str, compressed: bool) -> Result<String, CodecError> {
        if compressed {
            decompress(data)
        } else {
            Ok(data.to_string())
        }
    }

    /// Decodes `data`, handing back the stored payload untouched when the
    /// dictionary turns out to be inconsistent.
    pub fn decode_or_raw(&self, data: &str, compressed: bool) -> String {
        match self.decode(data, compressed) {
            Ok(text) => text,
            Err(err) => {
                tracing::warn!(?err, "failed to decompress entry, serving raw payload");
                data.to_string()
            }
        }
    }
}

/// Reversible dictionary coder used to shrink long history entries.
///
/// The scheme belongs to the LZ78 family. The text is scanned left to right
/// while a dictionary of previously seen substrings is grown by one entry per
/// step. Each step emits either
///
/// * a *literal*: a character that has never been seen before, emitted as
///   itself and added to the dictionary, or
/// * a *code*: the index of the longest dictionary entry that prefixes the
///   remaining input. The entry `match + next char` is added afterwards.
///
/// Codes are written as characters from the supplementary private use planes
/// (`U+F0000..=U+10FFFD`) so the encoded payload stays a plain `String` that
/// survives JSON persistence untouched. Input containing characters from that
/// range is never compressed.
pub fn compress(text: &str) -> Result<String, CodecError> {
    let chars: Vec<char> = text.chars().collect();
    // Trie edges: (parent code, next char) -> code. Root entries have no parent.
    let mut dictionary: HashMap<(Option<u32>, char), u32> = HashMap::new();
    let mut next_code = 0u32;
    let mut out = String::with_capacity(text.len());

    let mut pos = 0;
    while pos < chars.len() {
        let ch = chars[pos];
        let Some(&first) = dictionary.get(&(None, ch)) else {
            if (CODE_BASE..=CODE_LAST).contains(&(ch as u32)) {
                return Err(CodecError::ReservedCharacter(ch as u32));
            }
            out.push(ch);
            dictionary.insert((None, ch), allocate(&mut next_code)?);
            pos += 1;
            continue;
        };

        let mut code = first;
        let mut end = pos + 1;
        while let Some(&next) = chars
            .get(end)
            .and_then(|c| dictionary.get(&(Some(code), *c)))
        {
            code = next;
            end += 1;
        }

        out.push(code_to_char(code)?);
        if let Some(&follow) = chars.get(end) {
            dictionary.insert((Some(code), follow), allocate(&mut next_code)?);
        }
        pos = end;
    }
    Ok(out)
}

pub fn decompress(data: &str) -> Result<String, CodecError> {
    let mut entries: Vec<String> = Vec::new();
    // Code emitted by the previous step whose dictionary extension still
    // waits for the first character of the current step.
    let mut pending: Option<usize> = None;
    let mut out = String::with_capacity(data.len() * 2);

    for ch in data.chars() {
        let Some(code) = char_to_code(ch) else {
            if let Some(prev) = pending.take() {
                let mut grown = entries[prev].clone();
                grown.push(ch);
                entries.push(grown);
            }
            entries.push(ch.to_string());
            out.push(ch);
            continue;
        };

        let defined = entries.len();
        let current = if code < defined {
            entries[code].clone()
        } else if code == defined {
            // The code names the entry this very step is about to define:
            // previous match followed by its own first character.
            let prev = pending.ok_or(CodecError::UndefinedCode { code, defined })?;
            let mut value = entries[prev].clone();
            let first = value
                .chars()
                .next()
                .ok_or(CodecError::UndefinedCode { code, defined })?;
            value.push(first);
            value
        } else {
            return Err(CodecError::UndefinedCode { code, defined });
        };

        if let Some(prev) = pending.take() {
            let first = current
                .chars()
                .next()
                .ok_or(CodecError::UndefinedCode { code, defined })?;
            let mut grown = entries[prev].clone();
            grown.push(first);
            entries.push(grown);
        }
        out.push_str(&current);
        pending = Some(code);
    }
    Ok(out)
}

fn allocate(next_code: &mut u32) -> Result<u32, CodecError> {
    let code = *next_code;
    if code as usize >= MAX_CODES {
        return Err(CodecError::DictionaryFull(MAX_CODES));
    }
    *next_code += 1;
    Ok(code)
}

fn code_to_char(code: u32) -> Result<char, CodecError> {
    char::from_u32(CODE_BASE + code).ok_or(CodecError::DictionaryFull(MAX_CODES))
}

fn char_to_code(ch: char) -> Option<usize> {
    let value = ch as u32;
    if (CODE_BASE..=CODE_LAST).contains(&value) {
        Some((value - CODE_BASE) as usize)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn code(n: u32) -> char {
        char::from_u32(CODE_BASE + n).expect("valid code char")
    }

    /// Small xorshift generator so the sweep is reproducible without extra crates.
    struct Rng(u64);

    impl Rng {
        fn next(&mut self) -> u64 {
            let mut x = self.0;
            x ^= x << 13;
            x ^= x >> 7;
            x ^= x << 17;
            self.0 = x;
            x
        }

        fn pick<'a>(&mut self, items: &'a [char]) -> char {
            items[(self.next() % items.len() as u64) as usize]
        }
    }

    #[test]
    fn short_text_is_passed_through() {
        let codec = Codec::default();
        let encoded = codec.encode("hello world");
        assert!(!encoded.compressed);
        assert_eq!(encoded.data, "hello world");
        assert_eq!(encoded.original_length, 11);
    }

    #[test]
    fn repetitive_text_at_threshold_is_compressed() {
        let codec = Codec::default();
        let text = "abc ".repeat(250);
        assert_eq!(text.chars().count(), 1000);
        let encoded = codec.encode(&text);
        assert!(encoded.compressed);
        assert!(encoded.data.len() < text.len());
        assert_eq!(codec.decode(&encoded.data, true).unwrap(), text);
    }

    #[test]
    fn round_trips_around_threshold() {
        let codec = Codec::default();
        for len in [998, 999, 1000, 1001, 1500] {
            let text: String = "the quick brown fox jumps over the lazy dog "
                .chars()
                .cycle()
                .take(len)
                .collect();
            let encoded = codec.encode(&text);
            if len < 1000 {
                assert!(!encoded.compressed, "len {len}");
            }
            let decoded = codec.decode(&encoded.data, encoded.compressed).unwrap();
            assert_eq!(decoded, text, "len {len}");
        }
    }

    #[test]
    fn self_referencing_code_is_resolved() {
        // "aaaa" encodes as literal a, code 0 ("a"), code 1 ("aa") where code 1
        // is defined by the same step that uses it.
        let compressed = compress("aaaa").unwrap();
        let expected: String = ['a', code(0), code(1)].into_iter().collect();
        assert_eq!(compressed, expected);
        assert_eq!(decompress(&compressed).unwrap(), "aaaa");
    }

    #[test]
    fn random_texts_round_trip() {
        let alphabet = ['a', 'b', 'c', ' ', '한', '글', 'é', '🙂', '\t', 'Z'];
        let mut rng = Rng(0x9E37_79B9_7F4A_7C15);
        for _ in 0..200 {
            let len = (rng.next() % 3000) as usize;
            let narrow = 1 + (rng.next() % alphabet.len() as u64) as usize;
            let text: String = (0..len).map(|_| rng.pick(&alphabet[..narrow])).collect();
            let compressed = compress(&text).unwrap();
            assert_eq!(decompress(&compressed).unwrap(), text);
        }
    }

    #[test]
    fn compression_is_deterministic() {
        let text = "lorem ipsum dolor sit amet ".repeat(60);
        assert_eq!(compress(&text).unwrap(), compress(&text).unwrap());
    }

    #[test]
    fn forward_reference_is_rejected() {
        let data: String = ['a', code(5)].into_iter().collect();
        assert_matches!(
            decompress(&data),
            Err(CodecError::UndefinedCode {
                code: 5,
                defined: 1
            })
        );
    }

    #[test]
    fn leading_code_without_dictionary_is_rejected() {
        let data: String = [code(0)].into_iter().collect();
        assert_matches!(
            decompress(&data),
            Err(CodecError::UndefinedCode {
                code: 0,
                defined: 0
            })
        );
    }

    #[test]
    fn reserved_characters_fall_back_to_raw() {
        let codec = Codec::new(4);
        let text = format!("{}{}", "xyxyxyxyxyxy", code(3));
        let encoded = codec.encode(&text);
        assert!(!encoded.compressed);
        assert_eq!(encoded.data, text);
    }

    #[test]
    fn decode_or_raw_serves_payload_on_error() {
        let codec = Codec::default();
        let data: String = [code(9)].into_iter().collect();
        assert_eq!(codec.decode_or_raw(&data, true), data);
    }
}

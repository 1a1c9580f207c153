//! Product reference attributes.
//!
//! Attributes are stored as a sequence of length-prefixed key/value string
//! pairs. Each string is prefixed with a single length byte and is therefore
//! limited to 255 bytes.

use {
    std::collections::BTreeMap,
    winnow::{
        binary::{
            length_take,
            u8 as byte,
        },
        ModalResult,
        Parser,
    },
};

/// Longest key or value an attribute can hold.
pub const MAX_ATTR_LEN: usize = u8::MAX as usize;

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum AttrsError {
    #[error("attribute string of {len} bytes exceeds the {max} byte limit", max = MAX_ATTR_LEN)]
    TooLong { len: usize },
    #[error("attributes truncated at offset {offset}")]
    Truncated { offset: usize },
    #[error("attribute string at offset {offset} is not valid UTF-8")]
    InvalidUtf8 { offset: usize },
}

/// Ordered key/value attributes of a product, such as `symbol` or `asset_type`.
///
/// Pairs keep the order in which they were written. Duplicate keys are kept
/// as-is; lookups resolve to the last occurrence.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct AttrsMap {
    pairs: Vec<(String, String)>,
}

impl AttrsMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds attributes from a map, sorted by key.
    pub fn from_map<K, V>(map: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        let mut attrs = Self::new();
        for (key, value) in map {
            attrs.push(key, value);
        }
        attrs.sort();
        attrs
    }

    /// Appends a pair. Length limits are checked when encoding.
    pub fn push(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.pairs.push((key.into(), value.into()));
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, value)| value.as_str())
    }

    pub fn pairs(&self) -> &[(String, String)] {
        &self.pairs
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.pairs
            .iter()
            .map(|(key, value)| (key.as_str(), value.as_str()))
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Sorts pairs by key. Pairs with equal keys keep their relative order.
    pub fn sort(&mut self) {
        self.pairs.sort_by(|(a, _), (b, _)| a.cmp(b));
    }

    /// Collapses the attributes into a map; later duplicates win.
    pub fn to_map(&self) -> BTreeMap<String, String> {
        self.pairs.iter().cloned().collect()
    }

    pub fn encoded_len(&self) -> usize {
        self.pairs
            .iter()
            .map(|(key, value)| 2 + key.len() + value.len())
            .sum()
    }

    pub fn encode(&self) -> Result<Vec<u8>, AttrsError> {
        let mut out = Vec::with_capacity(self.encoded_len());
        self.encode_into(&mut out)?;
        Ok(out)
    }

    /// Appends the wire encoding to `out`. Nothing is written on error.
    pub fn encode_into(&self, out: &mut Vec<u8>) -> Result<(), AttrsError> {
        let mut prefixes = Vec::with_capacity(self.pairs.len() * 2);
        for string in self.pairs.iter().flat_map(|(k, v)| [k, v]) {
            let len = u8::try_from(string.len()).map_err(|_| AttrsError::TooLong { len: string.len() })?;
            prefixes.push(len);
        }
        let strings = self.pairs.iter().flat_map(|(k, v)| [k, v]);
        for (len, string) in prefixes.into_iter().zip(strings) {
            out.push(len);
            out.extend_from_slice(string.as_bytes());
        }
        Ok(())
    }

    /// Decodes pairs until `data` is exhausted. A length prefix running past
    /// the end of `data` is an error, and so is a string that is not UTF-8,
    /// so decoded attributes always encode back to the same bytes.
    pub fn decode(data: &[u8]) -> Result<Self, AttrsError> {
        let mut input = data;
        let mut attrs = Self::new();
        while !input.is_empty() {
            let offset = data.len() - input.len();
            let (key, value) = (string, string)
                .parse_next(&mut input)
                .map_err(|_| AttrsError::Truncated { offset })?;
            let value_offset = offset + 1 + key.len();
            attrs
                .pairs
                .push((utf8(key, offset)?, utf8(value, value_offset)?));
        }
        Ok(attrs)
    }
}

impl<'a> IntoIterator for &'a AttrsMap {
    type IntoIter = std::slice::Iter<'a, (String, String)>;
    type Item = &'a (String, String);

    fn into_iter(self) -> Self::IntoIter {
        self.pairs.iter()
    }
}

fn string<'a>(input: &mut &'a [u8]) -> ModalResult<&'a [u8]> {
    length_take(byte).parse_next(input)
}

/// `offset` is that of the string's length prefix.
fn utf8(bytes: &[u8], offset: usize) -> Result<String, AttrsError> {
    std::str::from_utf8(bytes)
        .map(str::to_owned)
        .map_err(|_| AttrsError::InvalidUtf8 { offset })
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        proptest::prelude::*,
    };

    #[test]
    fn test_decode_pairs() {
        let data = b"\x06symbol\x0aFX.EUR/USD\x0aasset_type\x02FX";
        let attrs = AttrsMap::decode(data).unwrap();
        assert_eq!(attrs.len(), 2);
        assert_eq!(attrs.get("symbol"), Some("FX.EUR/USD"));
        assert_eq!(attrs.get("asset_type"), Some("FX"));
        assert_eq!(attrs.get("base"), None);
        assert_eq!(attrs.encode().unwrap(), data);
    }

    #[test]
    fn test_empty() {
        let attrs = AttrsMap::decode(&[]).unwrap();
        assert!(attrs.is_empty());
        assert_eq!(attrs.encode().unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn test_truncated() {
        // Length prefix runs past the end.
        assert_eq!(
            AttrsMap::decode(b"\x06sym"),
            Err(AttrsError::Truncated { offset: 0 })
        );
        // Key without a value.
        assert_eq!(
            AttrsMap::decode(b"\x01a\x01b\x01c"),
            Err(AttrsError::Truncated { offset: 4 })
        );
    }

    #[test]
    fn test_duplicates_last_wins() {
        let mut attrs = AttrsMap::new();
        attrs.push("symbol", "A");
        attrs.push("base", "B");
        attrs.push("symbol", "C");
        assert_eq!(attrs.get("symbol"), Some("C"));
        assert_eq!(attrs.to_map().get("symbol").map(String::as_str), Some("C"));

        let decoded = AttrsMap::decode(&attrs.encode().unwrap()).unwrap();
        assert_eq!(decoded.pairs(), attrs.pairs());
    }

    #[test]
    fn test_from_map_sorted() {
        let attrs = AttrsMap::from_map([("quote", "USD"), ("base", "EUR"), ("symbol", "EUR/USD")]);
        let keys: Vec<&str> = attrs.iter().map(|(key, _)| key).collect();
        assert_eq!(keys, vec!["base", "quote", "symbol"]);
    }

    #[test]
    fn test_too_long_writes_nothing() {
        let mut attrs = AttrsMap::new();
        attrs.push("ok", "fine");
        attrs.push("long", "x".repeat(256));

        let mut out = vec![0xaa];
        assert_eq!(
            attrs.encode_into(&mut out),
            Err(AttrsError::TooLong { len: 256 })
        );
        assert_eq!(out, vec![0xaa]);

        let mut attrs = AttrsMap::new();
        attrs.push("max", "x".repeat(255));
        assert_eq!(attrs.encode().unwrap().len(), 2 + 3 + 255);
    }

    #[test]
    fn test_invalid_utf8_rejected() {
        assert_eq!(
            AttrsMap::decode(b"\x01k\x02\xff\xfe"),
            Err(AttrsError::InvalidUtf8 { offset: 2 })
        );
        assert_eq!(
            AttrsMap::decode(b"\x01k\x01v\x01\xc3\x01v"),
            Err(AttrsError::InvalidUtf8 { offset: 4 })
        );
        // Multi-byte characters are fine.
        let attrs = AttrsMap::decode("\x01k\x03\u{20ac}".as_bytes()).unwrap();
        assert_eq!(attrs.get("k"), Some("\u{20ac}"));
    }

    proptest! {
        #[test]
        fn test_encoding_preserves_pairs(
            pairs in prop::collection::vec(("[a-z_]{0,16}", "[ -~]{0,64}"), 0..12)
        ) {
            let mut attrs = AttrsMap::new();
            for (key, value) in &pairs {
                attrs.push(key.as_str(), value.as_str());
            }
            let encoded = attrs.encode().unwrap();
            prop_assert_eq!(encoded.len(), attrs.encoded_len());
            prop_assert_eq!(AttrsMap::decode(&encoded).unwrap(), attrs);
        }
    }
}

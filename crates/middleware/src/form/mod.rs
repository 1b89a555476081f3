//! `application/x-www-form-urlencoded` payloads.
//!
//! [`FormValues`] is the flat, ordered multimap a form parses into; [`FormDecoder`] maps it onto
//! a typed structure, understanding repeated keys and nested (`a.b`, `a[b]`, `a[0]`) keys.

mod decoder;
mod error;

pub use decoder::FormDecoder;
pub use error::{DecodeError, FormError};

/// Ordered key/value pairs of a form, keys may repeat.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FormValues {
    pairs: Vec<(String, String)>,
}

impl FormValues {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses an urlencoded payload.
    ///
    /// The payload must be valid utf-8 and every `%` must start a two digit hex escape.
    pub fn parse(payload: &[u8]) -> Result<Self, FormError> {
        let form = std::str::from_utf8(payload)?;
        check_escapes(form)?;

        let pairs = serde_urlencoded::from_str::<Vec<(String, String)>>(form).map_err(FormError::malformed)?;
        Ok(Self { pairs })
    }

    pub fn append<K: Into<String>, V: Into<String>>(&mut self, key: K, value: V) {
        self.pairs.push((key.into(), value.into()));
    }

    /// Appends every pair of `other` after the existing ones.
    pub fn extend(&mut self, other: FormValues) {
        self.pairs.extend(other.pairs);
    }

    /// The first value for `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    pub fn get_all<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.pairs.iter().filter(move |(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.pairs.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

impl From<Vec<(String, String)>> for FormValues {
    fn from(pairs: Vec<(String, String)>) -> Self {
        Self { pairs }
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for FormValues {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self { pairs: iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect() }
    }
}

fn check_escapes(form: &str) -> Result<(), FormError> {
    let bytes = form.as_bytes();
    let mut index = 0;
    while let Some(offset) = bytes[index..].iter().position(|&b| b == b'%') {
        let start = index + offset;
        match bytes.get(start + 1..start + 3) {
            Some([high, low]) if high.is_ascii_hexdigit() && low.is_ascii_hexdigit() => index = start + 3,
            _ => return Err(FormError::invalid_escape(form[start..].chars().take(3).collect::<String>())),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{FormError, FormValues};

    #[test]
    fn parses_repeated_and_escaped_pairs() {
        let form = FormValues::parse(b"tag=a&name=J%C3%B6rg+M&tag=b&empty=").unwrap();

        assert_eq!(form.len(), 4);
        assert_eq!(form.get("name"), Some("Jörg M"));
        assert_eq!(form.get_all("tag").collect::<Vec<_>>(), vec!["a", "b"]);
        assert_eq!(form.get("empty"), Some(""));
        assert_eq!(form.get("missing"), None);
    }

    #[test]
    fn rejects_invalid_escape() {
        let err = FormValues::parse(b"a=100%&b=2").unwrap_err();
        assert!(matches!(err, FormError::InvalidEscape { ref escape } if escape == "%&b"));

        let err = FormValues::parse(b"a=%zz").unwrap_err();
        assert!(matches!(err, FormError::InvalidEscape { .. }));
    }

    #[test]
    fn rejects_invalid_utf8() {
        let err = FormValues::parse(&[b'a', b'=', 0xff, 0xfe]).unwrap_err();
        assert!(matches!(err, FormError::InvalidUtf8 { .. }));
    }

    #[test]
    fn extend_keeps_order() {
        let mut form = FormValues::parse(b"a=1").unwrap();
        form.extend(FormValues::from_iter([("a", "2"), ("b", "3")]));
        form.append("c", "4");

        let pairs: Vec<_> = form.iter().collect();
        assert_eq!(pairs, vec![("a", "1"), ("a", "2"), ("b", "3"), ("c", "4")]);
    }

    #[test]
    fn empty_payload_is_empty_form() {
        assert!(FormValues::parse(b"").unwrap().is_empty());
    }
}

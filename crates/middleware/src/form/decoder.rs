use crate::form::FormValues;
use crate::form::error::{DecodeError, join_path};
use serde::de::value::StrDeserializer;
use serde::de::{self, DeserializeOwned, DeserializeSeed, IntoDeserializer, Visitor};
use serde_json::Value;
use std::collections::btree_map;
use std::collections::{BTreeMap, HashMap};
use url::form_urlencoded::byte_serialize;

/// Decodes [`FormValues`] into any `DeserializeOwned` type.
///
/// Keys address fields by name; `.` and `[...]` descend into nested structures, so `a.b`,
/// `a[b]` and `a[b].c` all work. Repeated keys, `key[]` and numeric indices (`key[0]`) feed
/// sequences. Scalar fields take the first value of their key.
///
/// Keys are grouped by their first segment, and a group is only parsed (by `serde_qs`) once
/// the target type asks for that field. Unknown keys are therefore ignored whatever their
/// shape, unless the decoder is [strict](FormDecoder::strict).
#[derive(Debug, Clone, Copy, Default)]
pub struct FormDecoder {
    strict: bool,
}

impl FormDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rejects keys that do not match any field of the target structure.
    pub fn strict() -> Self {
        Self { strict: true }
    }

    pub fn with_strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn is_strict(&self) -> bool {
        self.strict
    }

    pub fn decode<T: DeserializeOwned>(&self, values: &FormValues) -> Result<T, DecodeError> {
        let mut groups = Groups::new();
        for (key, value) in values.iter() {
            groups.entry(root_of(key)).or_default().push((key, value));
        }

        let deserializer = NodeDeserializer { input: Input::Groups(&groups), path: String::new(), strict: self.strict };
        T::deserialize(deserializer).map_err(|e| e.at(""))
    }
}

/// Pairs keyed by the first segment of their key.
type Groups<'a> = BTreeMap<&'a str, Vec<(&'a str, &'a str)>>;

fn root_of(key: &str) -> &str {
    key.find(['.', '[']).map_or(key, |end| &key[..end])
}

#[derive(Debug)]
enum Node {
    Values(Vec<String>),
    Fields(BTreeMap<String, Node>),
}

impl From<Value> for Node {
    fn from(value: Value) -> Self {
        match value {
            Value::Array(items) if items.iter().all(|item| !item.is_array() && !item.is_object()) => {
                Node::Values(items.into_iter().map(text).collect())
            }
            Value::Array(items) => {
                Node::Fields(items.into_iter().enumerate().map(|(index, item)| (index.to_string(), Node::from(item))).collect())
            }
            Value::Object(fields) => Node::Fields(fields.into_iter().map(|(key, item)| (key, Node::from(item))).collect()),
            scalar => Node::Values(vec![text(scalar)]),
        }
    }
}

fn text(value: Value) -> String {
    match value {
        Value::String(text) => text,
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Parses the pairs sharing the first segment `name` into a tree.
fn parse_group(name: &str, pairs: &[(&str, &str)]) -> Result<Node, DecodeError> {
    let mut parsed: BTreeMap<String, Value> =
        serde_qs::from_str(&to_query(pairs)).map_err(|e| DecodeError::new(Some(name.to_owned()), e))?;
    parsed.remove(name).map(Node::from).ok_or_else(|| DecodeError::new(Some(name.to_owned()), "malformed key"))
}

/// Rewrites pairs into a `serde_qs` query: dotted segments become brackets, and keys that
/// repeat or end in `[]` get explicit indices in order of appearance.
fn to_query(pairs: &[(&str, &str)]) -> String {
    let keys: Vec<String> = pairs.iter().map(|(key, _)| bracketed(key)).collect();

    let mut counts: HashMap<&str, usize> = HashMap::new();
    for key in &keys {
        *counts.entry(key.strip_suffix("[]").unwrap_or(key)).or_default() += 1;
    }

    let mut next: HashMap<&str, usize> = HashMap::new();
    let mut query = String::new();
    for (key, (_, value)) in keys.iter().zip(pairs) {
        let base = key.strip_suffix("[]").unwrap_or(key);
        if !query.is_empty() {
            query.push('&');
        }
        if base.len() < key.len() || counts.get(base).is_some_and(|&count| count > 1) {
            let index = next.entry(base).or_default();
            query.push_str(&encode_key(&format!("{base}[{index}]")));
            *index += 1;
        } else {
            query.push_str(&encode_key(key));
        }
        query.push('=');
        query.extend(byte_serialize(value.as_bytes()));
    }
    query
}

/// `a.b[c].d` to `a[b][c][d]`.
fn bracketed(key: &str) -> String {
    let mut out = String::with_capacity(key.len() + 2);
    let mut depth = 0usize;
    let mut dotted = false;
    for c in key.chars() {
        match c {
            '[' => {
                if dotted {
                    out.push(']');
                    dotted = false;
                }
                depth += 1;
                out.push(c);
            }
            ']' => {
                depth = depth.saturating_sub(1);
                out.push(c);
            }
            '.' if depth == 0 => {
                if dotted {
                    out.push(']');
                }
                out.push('[');
                dotted = true;
            }
            _ => out.push(c),
        }
    }
    if dotted {
        out.push(']');
    }
    out
}

/// Percent-encodes the segments of a bracketed key, leaving the brackets.
fn encode_key(key: &str) -> String {
    let mut encoded = String::with_capacity(key.len());
    let mut rest = key;
    while let Some(at) = rest.find(['[', ']']) {
        encoded.extend(byte_serialize(&rest.as_bytes()[..at]));
        encoded.push_str(&rest[at..=at]);
        rest = &rest[at + 1..];
    }
    encoded.extend(byte_serialize(rest.as_bytes()));
    encoded
}

#[derive(Clone, Copy)]
enum Input<'a> {
    Values(&'a [String]),
    Fields(&'a BTreeMap<String, Node>),
    Groups(&'a Groups<'a>),
}

impl<'a> Input<'a> {
    fn of(node: &'a Node) -> Self {
        match node {
            Node::Values(values) => Input::Values(values),
            Node::Fields(fields) => Input::Fields(fields),
        }
    }
}

struct NodeDeserializer<'a> {
    input: Input<'a>,
    path: String,
    strict: bool,
}

impl<'a> NodeDeserializer<'a> {
    fn child(&self, input: Input<'a>, key: &str) -> Self {
        Self { input, path: join_path(&self.path, key), strict: self.strict }
    }

    fn error<S: ToString>(&self, reason: S) -> DecodeError {
        DecodeError::new((!self.path.is_empty()).then(|| self.path.clone()), reason)
    }

    fn scalar(&self) -> Result<&'a str, DecodeError> {
        match self.input {
            Input::Values(values) => values.first().map(String::as_str).ok_or_else(|| self.error("missing value")),
            Input::Fields(_) | Input::Groups(_) => Err(self.error("expected a value, found nested keys")),
        }
    }

    fn elements(&self) -> Result<ElementsAccess<'a>, DecodeError> {
        let items: Vec<_> = match self.input {
            Input::Values(values) => values
                .iter()
                .enumerate()
                .map(|(index, value)| self.child(Input::Values(std::slice::from_ref(value)), &index.to_string()))
                .collect(),
            Input::Fields(fields) => {
                let mut indexed = fields
                    .iter()
                    .map(|(key, node)| match key.parse::<usize>() {
                        Ok(index) => Ok((index, key, node)),
                        Err(_) => Err(self.child(Input::of(node), key).error("expected a list index")),
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                indexed.sort_by_key(|(index, _, _)| *index);
                indexed.into_iter().map(|(_, key, node)| self.child(Input::of(node), key)).collect()
            }
            Input::Groups(_) => return Err(self.error("expected a list, found named keys")),
        };
        Ok(ElementsAccess { items: items.into_iter() })
    }

    fn entries(&self, known: Option<&'static [&'static str]>) -> Result<EntriesAccess<'a>, DecodeError> {
        let entries = match self.input {
            Input::Fields(fields) => Entries::Nodes(fields.iter()),
            Input::Groups(groups) => Entries::Groups(groups.iter()),
            Input::Values(_) => return Err(self.error("expected nested keys, found a value")),
        };
        Ok(EntriesAccess { entries, pending: None, path: self.path.clone(), strict: self.strict, known })
    }
}

macro_rules! deserialize_parsed {
    ($($method:ident => $visit:ident,)*) => {
        $(
            fn $method<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Self::Error> {
                let value = self.scalar()?;
                match value.trim().parse() {
                    Ok(parsed) => visitor.$visit(parsed),
                    Err(e) => Err(self.error(format!("invalid value {value:?}: {e}"))),
                }
            }
        )*
    };
}

impl<'de> de::Deserializer<'de> for NodeDeserializer<'_> {
    type Error = DecodeError;

    fn deserialize_any<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Self::Error> {
        match self.input {
            Input::Values([value]) => visitor.visit_str(value),
            Input::Values(_) => visitor.visit_seq(self.elements()?),
            Input::Fields(_) | Input::Groups(_) => visitor.visit_map(self.entries(None)?),
        }
    }

    fn deserialize_bool<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Self::Error> {
        let value = self.scalar()?;
        match value.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "on" | "yes" => visitor.visit_bool(true),
            "false" | "0" | "off" | "no" | "" => visitor.visit_bool(false),
            _ => Err(self.error(format!("invalid boolean {value:?}"))),
        }
    }

    deserialize_parsed! {
        deserialize_i8 => visit_i8,
        deserialize_i16 => visit_i16,
        deserialize_i32 => visit_i32,
        deserialize_i64 => visit_i64,
        deserialize_i128 => visit_i128,
        deserialize_u8 => visit_u8,
        deserialize_u16 => visit_u16,
        deserialize_u32 => visit_u32,
        deserialize_u64 => visit_u64,
        deserialize_u128 => visit_u128,
        deserialize_f32 => visit_f32,
        deserialize_f64 => visit_f64,
    }

    fn deserialize_char<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Self::Error> {
        let value = self.scalar()?;
        let mut chars = value.chars();
        match (chars.next(), chars.next()) {
            (Some(c), None) => visitor.visit_char(c),
            _ => Err(self.error(format!("expected a single character, found {value:?}"))),
        }
    }

    fn deserialize_str<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Self::Error> {
        visitor.visit_str(self.scalar()?)
    }

    fn deserialize_string<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Self::Error> {
        self.deserialize_str(visitor)
    }

    fn deserialize_bytes<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Self::Error> {
        visitor.visit_bytes(self.scalar()?.as_bytes())
    }

    fn deserialize_byte_buf<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Self::Error> {
        self.deserialize_bytes(visitor)
    }

    fn deserialize_option<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Self::Error> {
        match self.input {
            Input::Values(values) if values.iter().all(String::is_empty) => visitor.visit_none(),
            _ => visitor.visit_some(self),
        }
    }

    fn deserialize_unit<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Self::Error> {
        visitor.visit_unit()
    }

    fn deserialize_unit_struct<V: Visitor<'de>>(self, _name: &'static str, visitor: V) -> Result<V::Value, Self::Error> {
        visitor.visit_unit()
    }

    fn deserialize_newtype_struct<V: Visitor<'de>>(
        self,
        _name: &'static str,
        visitor: V,
    ) -> Result<V::Value, Self::Error> {
        visitor.visit_newtype_struct(self)
    }

    fn deserialize_seq<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Self::Error> {
        visitor.visit_seq(self.elements()?)
    }

    fn deserialize_tuple<V: Visitor<'de>>(self, _len: usize, visitor: V) -> Result<V::Value, Self::Error> {
        self.deserialize_seq(visitor)
    }

    fn deserialize_tuple_struct<V: Visitor<'de>>(
        self,
        _name: &'static str,
        _len: usize,
        visitor: V,
    ) -> Result<V::Value, Self::Error> {
        self.deserialize_seq(visitor)
    }

    fn deserialize_map<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Self::Error> {
        visitor.visit_map(self.entries(None)?)
    }

    fn deserialize_struct<V: Visitor<'de>>(
        self,
        _name: &'static str,
        fields: &'static [&'static str],
        visitor: V,
    ) -> Result<V::Value, Self::Error> {
        visitor.visit_map(self.entries(Some(fields))?)
    }

    fn deserialize_enum<V: Visitor<'de>>(
        self,
        _name: &'static str,
        _variants: &'static [&'static str],
        visitor: V,
    ) -> Result<V::Value, Self::Error> {
        let variant: StrDeserializer<'_, DecodeError> = self.scalar()?.trim().into_deserializer();
        visitor.visit_enum(variant)
    }

    fn deserialize_identifier<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Self::Error> {
        self.deserialize_str(visitor)
    }

    fn deserialize_ignored_any<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Self::Error> {
        visitor.visit_unit()
    }
}

struct ElementsAccess<'a> {
    items: std::vec::IntoIter<NodeDeserializer<'a>>,
}

impl<'de> de::SeqAccess<'de> for ElementsAccess<'_> {
    type Error = DecodeError;

    fn next_element_seed<T: DeserializeSeed<'de>>(&mut self, seed: T) -> Result<Option<T::Value>, Self::Error> {
        let Some(item) = self.items.next() else {
            return Ok(None);
        };
        let path = item.path.clone();
        seed.deserialize(item).map(Some).map_err(|e| e.at(&path))
    }

    fn size_hint(&self) -> Option<usize> {
        Some(self.items.len())
    }
}

enum Entries<'a> {
    Nodes(btree_map::Iter<'a, String, Node>),
    Groups(btree_map::Iter<'a, &'a str, Vec<(&'a str, &'a str)>>),
}

impl<'a> Entries<'a> {
    fn next(&mut self) -> Option<(&'a str, Entry<'a>)> {
        match self {
            Entries::Nodes(iter) => iter.next().map(|(key, node)| (key.as_str(), Entry::Node(node))),
            Entries::Groups(iter) => iter.next().map(|(key, pairs)| (*key, Entry::Group(pairs))),
        }
    }

    fn len(&self) -> usize {
        match self {
            Entries::Nodes(iter) => iter.len(),
            Entries::Groups(iter) => iter.len(),
        }
    }
}

enum Entry<'a> {
    Node(&'a Node),
    // raw pairs, parsed when the value is requested
    Group(&'a [(&'a str, &'a str)]),
}

struct EntriesAccess<'a> {
    entries: Entries<'a>,
    pending: Option<(&'a str, Entry<'a>)>,
    path: String,
    strict: bool,
    // field names of the target struct, `None` for maps
    known: Option<&'static [&'static str]>,
}

impl<'de> de::MapAccess<'de> for EntriesAccess<'_> {
    type Error = DecodeError;

    fn next_key_seed<K: DeserializeSeed<'de>>(&mut self, seed: K) -> Result<Option<K::Value>, Self::Error> {
        while let Some((key, entry)) = self.entries.next() {
            if let Some(known) = self.known
                && !known.contains(&key)
            {
                if self.strict {
                    return Err(DecodeError::new(Some(join_path(&self.path, key)), "unknown field"));
                }
                continue;
            }

            self.pending = Some((key, entry));
            let path = join_path(&self.path, key);
            let name = [key.to_owned()];
            let key_deserializer = NodeDeserializer { input: Input::Values(&name), path: path.clone(), strict: self.strict };
            return seed.deserialize(key_deserializer).map(Some).map_err(|e| e.at(&path));
        }
        Ok(None)
    }

    fn next_value_seed<V: DeserializeSeed<'de>>(&mut self, seed: V) -> Result<V::Value, Self::Error> {
        let (key, entry) = self.pending.take().ok_or_else(|| DecodeError::new(None, "value requested before key"))?;
        let path = join_path(&self.path, key);
        let parsed;
        let node = match entry {
            Entry::Node(node) => node,
            Entry::Group(pairs) => {
                parsed = parse_group(key, pairs)?;
                &parsed
            }
        };
        let value_deserializer = NodeDeserializer { input: Input::of(node), path: path.clone(), strict: self.strict };
        seed.deserialize(value_deserializer).map_err(|e| e.at(&path))
    }

    fn size_hint(&self) -> Option<usize> {
        self.known.is_none().then(|| self.entries.len())
    }
}

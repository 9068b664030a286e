//! Inverted word/phrase index over string attributes.
//!
//! The index is maintained by the built-in rule `system.updateindex`: for
//! every string-valued attribute of a stored node or edge it keeps, inside a
//! per-partition-per-kind search storage manager,
//!
//! - `[0x01] attr 0x00 word`  -> postings `{entity key -> [positions]}`
//! - `[0x02] attr 0x00 value` -> list of entity keys with that exact value
//!
//! Tokenisation lower-cases (Unicode-aware, locale independent), splits on
//! non-alphanumeric characters and preserves 1-based position ordinals.
//! Position lists are stored with the variable-width integer-list codec.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use crate::error::{GraphError, Result};
use crate::graph::core::GraphCore;
use crate::graph::events::{EventKind, GraphEvent};
use crate::graph::rules::GraphRule;
use crate::graph::trans::TransOp;
use crate::graph::GraphManager;
use crate::model::{AttrValue, Node, ATTR_KEY, ATTR_KIND};
use crate::storage::manager::StorageManager;
use crate::storage::HashTree;
use crate::util::{pack_list, unpack_list, read_u16_le, read_u32_le};

const KEY_WORD: u8 = 0x01;
const KEY_VALUE: u8 = 0x02;

pub(crate) fn search_sm(partition: &str, kind: &str, is_edge: bool) -> String {
    if is_edge {
        format!("{partition}{kind}.edgesearch")
    } else {
        format!("{partition}{kind}.nodesearch")
    }
}

fn word_key(attr: &str, word: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(2 + attr.len() + word.len());
    key.push(KEY_WORD);
    key.extend_from_slice(attr.as_bytes());
    key.push(0);
    key.extend_from_slice(word.as_bytes());
    key
}

fn value_key(attr: &str, value: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(2 + attr.len() + value.len());
    key.push(KEY_VALUE);
    key.extend_from_slice(attr.as_bytes());
    key.push(0);
    key.extend_from_slice(value.as_bytes());
    key
}

/// Lower-cases and splits on non-alphanumerics; returns `(word, position)`
/// pairs with 1-based positions.
pub fn tokenize(text: &str) -> Vec<(String, u64)> {
    let mut words = Vec::new();
    let mut position = 0u64;
    for raw in text.split(|c: char| !c.is_alphanumeric()) {
        if raw.is_empty() {
            continue;
        }
        position += 1;
        words.push((raw.to_lowercase(), position));
    }
    words
}

// Postings: [count u32] then per entry [klen u16][key][plen u32][packed].
fn encode_postings(postings: &BTreeMap<String, Vec<u64>>) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&(postings.len() as u32).to_le_bytes());
    for (key, positions) in postings {
        buf.extend_from_slice(&(key.len() as u16).to_le_bytes());
        buf.extend_from_slice(key.as_bytes());
        let max = positions.iter().copied().max().unwrap_or(0);
        let packed = pack_list(positions, max);
        buf.extend_from_slice(&(packed.len() as u32).to_le_bytes());
        buf.extend_from_slice(&packed);
    }
    buf
}

fn decode_postings(buf: &[u8]) -> Result<BTreeMap<String, Vec<u64>>> {
    let count = read_u32_le(buf, 0)? as usize;
    let mut cursor = 4usize;
    let mut postings = BTreeMap::new();
    for _ in 0..count {
        let klen = read_u16_le(buf, cursor)? as usize;
        cursor += 2;
        let key = String::from_utf8_lossy(
            buf.get(cursor..cursor + klen)
                .ok_or_else(|| GraphError::Corruption("postings key out of bounds".into()))?,
        )
        .into_owned();
        cursor += klen;
        let plen = read_u32_le(buf, cursor)? as usize;
        cursor += 4;
        let packed = buf
            .get(cursor..cursor + plen)
            .ok_or_else(|| GraphError::Corruption("postings positions out of bounds".into()))?;
        cursor += plen;
        postings.insert(key, unpack_list(packed)?);
    }
    Ok(postings)
}

fn encode_key_list(keys: &BTreeSet<String>) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&(keys.len() as u32).to_le_bytes());
    for key in keys {
        buf.extend_from_slice(&(key.len() as u16).to_le_bytes());
        buf.extend_from_slice(key.as_bytes());
    }
    buf
}

fn decode_key_list(buf: &[u8]) -> Result<BTreeSet<String>> {
    let count = read_u32_le(buf, 0)? as usize;
    let mut cursor = 4usize;
    let mut keys = BTreeSet::new();
    for _ in 0..count {
        let klen = read_u16_le(buf, cursor)? as usize;
        cursor += 2;
        let key = String::from_utf8_lossy(
            buf.get(cursor..cursor + klen)
                .ok_or_else(|| GraphError::Corruption("key list out of bounds".into()))?,
        )
        .into_owned();
        cursor += klen;
        keys.insert(key);
    }
    Ok(keys)
}

fn read_obj(
    sm: &mut dyn StorageManager,
    tree: &HashTree,
    key: &[u8],
) -> Result<Option<Vec<u8>>> {
    match tree.get(sm, key)? {
        Some((loc, _)) => sm.fetch(loc).map(Some),
        None => Ok(None),
    }
}

fn upsert_obj(
    sm: &mut dyn StorageManager,
    tree: &mut HashTree,
    key: &[u8],
    bytes: &[u8],
) -> Result<()> {
    match tree.get(sm, key)? {
        Some((loc, _)) => {
            let new_loc = sm.update(loc, bytes)?;
            if new_loc != loc {
                tree.put(sm, key, new_loc)?;
            }
        }
        None => {
            let loc = sm.insert(bytes)?;
            tree.put(sm, key, loc)?;
        }
    }
    Ok(())
}

fn remove_obj(sm: &mut dyn StorageManager, tree: &mut HashTree, key: &[u8]) -> Result<()> {
    if let Some(loc) = tree.remove(sm, key)? {
        sm.free(loc)?;
    }
    Ok(())
}

/// String attributes of an entity that take part in indexing.
fn indexable_attrs(node: &Node) -> BTreeMap<String, String> {
    node.attrs()
        .iter()
        .filter(|(name, _)| name.as_str() != ATTR_KEY && name.as_str() != ATTR_KIND)
        .filter_map(|(name, value)| match value {
            AttrValue::Str(s) => Some((name.clone(), s.clone())),
            _ => None,
        })
        .collect()
}

/// `system.updateindex` - keeps the inverted index in sync with node and
/// edge mutations.
pub struct IndexUpdateRule;

const ALL_EVENTS: &[EventKind] = &[
    EventKind::NodeCreated,
    EventKind::NodeUpdated,
    EventKind::NodeDeleted,
    EventKind::EdgeCreated,
    EventKind::EdgeUpdated,
    EventKind::EdgeDeleted,
];

impl GraphRule for IndexUpdateRule {
    fn name(&self) -> &str {
        "system.updateindex"
    }

    fn handles(&self) -> &'static [EventKind] {
        ALL_EVENTS
    }

    fn handle(
        &self,
        core: &mut GraphCore,
        _queue: &mut VecDeque<TransOp>,
        event: &GraphEvent,
    ) -> Result<()> {
        let (old, new, is_edge) = match event {
            GraphEvent::NodeCreated { node, .. } => (None, Some(node), false),
            GraphEvent::NodeUpdated { node, old, .. } => (Some(old), Some(node), false),
            GraphEvent::NodeDeleted { node, .. } => (Some(node), None, false),
            GraphEvent::EdgeCreated { edge, .. } => (None, Some(edge.as_node()), true),
            GraphEvent::EdgeUpdated { edge, old, .. } => {
                (Some(old.as_node()), Some(edge.as_node()), true)
            }
            GraphEvent::EdgeDeleted { edge, .. } => (Some(edge.as_node()), None, true),
        };

        let entity = new.or(old).expect("event carries an entity");
        let sm_name = search_sm(event.partition(), entity.kind(), is_edge);
        let entity_key = entity.key().to_string();

        let old_attrs = old.map(indexable_attrs).unwrap_or_default();
        let new_attrs = new.map(indexable_attrs).unwrap_or_default();
        if old_attrs == new_attrs {
            return Ok(());
        }

        core.with_sm(&sm_name, true, "write", |sm| {
            let mut tree = HashTree::load(sm)?;
            let attrs: BTreeSet<&String> = old_attrs.keys().chain(new_attrs.keys()).collect();

            for attr in attrs {
                let old_val = old_attrs.get(attr);
                let new_val = new_attrs.get(attr);
                if old_val == new_val {
                    continue;
                }
                if let Some(value) = old_val {
                    deindex_value(sm, &mut tree, attr, value, &entity_key)?;
                }
                if let Some(value) = new_val {
                    index_value(sm, &mut tree, attr, value, &entity_key)?;
                }
            }
            Ok(())
        })?;
        Ok(())
    }
}

fn index_value(
    sm: &mut dyn StorageManager,
    tree: &mut HashTree,
    attr: &str,
    value: &str,
    entity_key: &str,
) -> Result<()> {
    let mut by_word: BTreeMap<String, Vec<u64>> = BTreeMap::new();
    for (word, position) in tokenize(value) {
        by_word.entry(word).or_default().push(position);
    }
    for (word, positions) in by_word {
        let key = word_key(attr, &word);
        let mut postings = match read_obj(sm, tree, &key)? {
            Some(bytes) => decode_postings(&bytes)?,
            None => BTreeMap::new(),
        };
        postings.insert(entity_key.to_string(), positions);
        upsert_obj(sm, tree, &key, &encode_postings(&postings))?;
    }

    let vkey = value_key(attr, value);
    let mut keys = match read_obj(sm, tree, &vkey)? {
        Some(bytes) => decode_key_list(&bytes)?,
        None => BTreeSet::new(),
    };
    if keys.insert(entity_key.to_string()) {
        upsert_obj(sm, tree, &vkey, &encode_key_list(&keys))?;
    }
    Ok(())
}

fn deindex_value(
    sm: &mut dyn StorageManager,
    tree: &mut HashTree,
    attr: &str,
    value: &str,
    entity_key: &str,
) -> Result<()> {
    let words: BTreeSet<String> = tokenize(value).into_iter().map(|(w, _)| w).collect();
    for word in words {
        let key = word_key(attr, &word);
        if let Some(bytes) = read_obj(sm, tree, &key)? {
            let mut postings = decode_postings(&bytes)?;
            if postings.remove(entity_key).is_some() {
                if postings.is_empty() {
                    remove_obj(sm, tree, &key)?;
                } else {
                    upsert_obj(sm, tree, &key, &encode_postings(&postings))?;
                }
            }
        }
    }

    let vkey = value_key(attr, value);
    if let Some(bytes) = read_obj(sm, tree, &vkey)? {
        let mut keys = decode_key_list(&bytes)?;
        if keys.remove(entity_key) {
            if keys.is_empty() {
                remove_obj(sm, tree, &vkey)?;
            } else {
                upsert_obj(sm, tree, &vkey, &encode_key_list(&keys))?;
            }
        }
    }
    Ok(())
}

/// Read handle into the search index of one kind.
pub struct IndexQuery<'a> {
    manager: &'a GraphManager,
    sm_name: String,
}

impl<'a> IndexQuery<'a> {
    pub(crate) fn new(manager: &'a GraphManager, sm_name: String) -> Self {
        Self { manager, sm_name }
    }

    /// Entity keys whose `attr` contains `word`, with the word's 1-based
    /// positions.
    pub fn lookup_word(&self, attr: &str, word: &str) -> Result<HashMap<String, Vec<u64>>> {
        let key = word_key(attr, &word.to_lowercase());
        let postings = self.read_index_obj(&key)?.map(|b| decode_postings(&b));
        Ok(postings
            .transpose()?
            .map(|p| p.into_iter().collect())
            .unwrap_or_default())
    }

    /// Entity keys whose `attr` contains the words of `phrase` consecutively.
    pub fn lookup_phrase(&self, attr: &str, phrase: &str) -> Result<Vec<String>> {
        let words: Vec<String> = tokenize(phrase).into_iter().map(|(w, _)| w).collect();
        let Some(first) = words.first() else {
            return Ok(Vec::new());
        };

        let first_postings = self.lookup_word(attr, first)?;
        let mut result = Vec::new();

        'candidates: for (entity_key, start_positions) in &first_postings {
            let mut follow_maps = Vec::new();
            for word in &words[1..] {
                let postings = self.lookup_word(attr, word)?;
                match postings.get(entity_key) {
                    Some(positions) => follow_maps.push(positions.clone()),
                    None => continue 'candidates,
                }
            }
            let matches = start_positions.iter().any(|&start| {
                follow_maps
                    .iter()
                    .enumerate()
                    .all(|(i, positions)| positions.contains(&(start + i as u64 + 1)))
            });
            if matches {
                result.push(entity_key.clone());
            }
        }
        result.sort();
        Ok(result)
    }

    /// Entity keys whose `attr` equals `value` exactly.
    pub fn lookup_value(&self, attr: &str, value: &str) -> Result<Vec<String>> {
        let key = value_key(attr, value);
        let keys = self.read_index_obj(&key)?.map(|b| decode_key_list(&b));
        Ok(keys
            .transpose()?
            .map(|k| k.into_iter().collect())
            .unwrap_or_default())
    }

    fn read_index_obj(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let key = key.to_vec();
        let name = self.sm_name.clone();
        self.manager.with_core(move |core| {
            let result = core.with_sm(&name, false, "read", |sm| {
                let tree = HashTree::load(sm)?;
                read_obj(sm, &tree, &key)
            })?;
            Ok(result.flatten())
        })
    }
}

//! Vehicle state.
//!
//! Each session owns a small table of vehicles keyed by the lowest free
//! id. The state blob is kept in the game's text form: a spawn packet
//! whose header is colon/comma separated with a JSON-ish payload between
//! the second comma and the last quote, followed by trailing fields.

use std::collections::BTreeMap;

/// Per-session vehicle table.
#[derive(Debug, Default)]
pub struct VehicleTable {
    slots: BTreeMap<u8, String>,
}

impl VehicleTable {
    /// Lowest id not currently in use.
    pub fn open_id(&self) -> u8 {
        let mut id = 0u8;
        while self.slots.contains_key(&id) {
            id += 1;
        }
        id
    }

    pub fn insert(&mut self, vid: u8, blob: String) {
        self.slots.insert(vid, blob);
    }

    pub fn remove(&mut self, vid: u8) -> Option<String> {
        self.slots.remove(&vid)
    }

    pub fn get(&self, vid: u8) -> Option<&String> {
        self.slots.get(&vid)
    }

    pub fn set(&mut self, vid: u8, blob: String) {
        self.slots.insert(vid, blob);
    }

    pub fn count(&self) -> usize {
        self.slots.len()
    }

    pub fn ids(&self) -> Vec<u8> {
        self.slots.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u8, &String)> {
        self.slots.iter().map(|(id, blob)| (*id, blob))
    }
}

/// Merges an edit into the stored blob: the stored header (everything
/// through the second comma) and trailing fields (from the seventh `,"`)
/// are preserved; the dynamic payload in between comes from the edit.
///
/// Returns `None` when either blob does not have the expected shape; the
/// caller then keeps the stored state untouched.
pub fn merge_state(old: &str, incoming: &str) -> Option<String> {
    let dynamic = &incoming[nth_index(incoming, ",", 2)? + 1..];
    let body = &dynamic[..dynamic.rfind('"')? + 1];
    let head = &old[..=nth_index(old, ",", 2)?];
    let tail = &old[nth_index(old, ",\"", 7)?..];
    Some(format!("{head}{body}{tail}"))
}

/// Byte index of the `n`-th occurrence of `pat` (1-based).
fn nth_index(s: &str, pat: &str, n: usize) -> Option<usize> {
    let mut from = 0;
    for _ in 0..n {
        let at = s[from..].find(pat)? + from;
        from = at + 1;
        if from > s.len() {
            return None;
        }
    }
    Some(from - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_fill_lowest_hole() {
        let mut t = VehicleTable::default();
        assert_eq!(t.open_id(), 0);
        t.insert(0, "a".into());
        t.insert(1, "b".into());
        assert_eq!(t.open_id(), 2);
        t.remove(0);
        assert_eq!(t.open_id(), 0);
        assert_eq!(t.count(), 1);
        assert_eq!(t.ids(), vec![1]);
    }

    fn blob(name: &str, parts: &str, tail: &str) -> String {
        // Header, two comma fields, dynamic payload, then seven
        // `,"k":v`-style trailing fields the merge must keep.
        let trailing: String = (0..7).map(|i| format!(",\"t{i}\":{i}")).collect();
        format!("Os:Member:{name}:0-0:{parts},partB,{{\"dyn\":\"{tail}\"}}{trailing}")
    }

    #[test]
    fn merge_keeps_header_and_trailing_fields() {
        let old = blob("Alice", "partA", "old");
        let incoming = blob("Intruder", "partX", "new");
        let merged = merge_state(&old, &incoming).unwrap();
        // Header fields 0-1 come from the stored blob.
        assert!(merged.starts_with("Os:Member:Alice:0-0:partA,partB,"));
        // The dynamic payload comes from the edit.
        assert!(merged.contains("{\"dyn\":\"new\"}"));
        // Trailing fields come from the stored blob.
        assert!(merged.ends_with(",\"t6\":6"));
    }

    #[test]
    fn merge_rejects_malformed_blobs() {
        assert!(merge_state("no commas here", "also none").is_none());
        let old = blob("Alice", "partA", "old");
        assert!(merge_state(&old, "Oc:0-0:x").is_none());
    }
}

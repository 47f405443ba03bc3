//! A key/value settings store keeping its values in a `PackedAllocator`.
//!
//! Each group maps a key hash to the offset of the value bytes. Options are
//! looked up through a chain of groups (override, group, global) and the
//! first group holding the key wins.

use std::collections::HashMap;

use relalloc::{AllocResult, PackedAllocator};

fn key_hash(name: &str) -> u32 {
    // FNV-1a
    name.bytes()
        .fold(0x811C_9DC5u32, |hash, byte| (hash ^ byte as u32).wrapping_mul(0x0100_0193))
}

#[derive(Default)]
struct SettingsGroup {
    offsets: HashMap<u32, usize>,
    values: PackedAllocator,
}

impl SettingsGroup {
    fn deserialize(mut buf: &[u8]) -> AllocResult<Self> {
        let mut group = Self::default();

        while buf.len() >= 8 {
            let len = u32::from_le_bytes(buf[..4].try_into().unwrap()) as usize;
            let key = u32::from_le_bytes(buf[4..8].try_into().unwrap());

            group.put(key, &buf[8..8 + len])?;
            buf = &buf[8 + len..];
        }

        Ok(group)
    }

    fn serialize(&self) -> Vec<u8> {
        let mut keys: Vec<_> = self.offsets.keys().copied().collect();
        keys.sort();

        let mut out = Vec::new();
        for key in keys {
            let value = self.values.get(self.offsets[&key]).unwrap();

            out.extend_from_slice(&(value.len() as u32).to_le_bytes());
            out.extend_from_slice(&key.to_le_bytes());
            out.extend_from_slice(value);
        }

        out
    }

    /// Stores `bytes` under `key`, reusing the slot when the size matches.
    fn put(&mut self, key: u32, bytes: &[u8]) -> AllocResult<()> {
        let offset = match self.offsets.get(&key) {
            Some(&offset) if self.values.requested_len(offset)? == bytes.len() => offset,
            Some(&offset) => {
                self.values.free(offset)?;
                self.values.alloc(bytes.len())?
            }
            None => self.values.alloc(bytes.len())?,
        };

        self.values.get_mut(offset).unwrap().copy_from_slice(bytes);
        self.offsets.insert(key, offset);

        Ok(())
    }

    fn set_i32(&mut self, name: &str, value: i32) -> AllocResult<()> {
        self.put(key_hash(name), &value.to_le_bytes())
    }

    fn get_i32(&self, name: &str) -> Option<i32> {
        let offset = *self.offsets.get(&key_hash(name))?;
        let bytes = self.values.get(offset)?;

        Some(i32::from_le_bytes(bytes.try_into().ok()?))
    }

    fn set_str(&mut self, name: &str, value: &str) -> AllocResult<()> {
        self.put(key_hash(name), value.as_bytes())
    }

    fn get_str(&self, name: &str) -> Option<&str> {
        let offset = *self.offsets.get(&key_hash(name))?;
        std::str::from_utf8(self.values.get(offset)?).ok()
    }

    fn remove(&mut self, name: &str) -> AllocResult<()> {
        match self.offsets.remove(&key_hash(name)) {
            Some(offset) => self.values.free(offset),
            None => Ok(()),
        }
    }
}

/// Looks `name` up through `chain`, registering `default` in the last
/// group when nobody has it.
fn option_i32(chain: &mut [&mut SettingsGroup], name: &str, default: i32) -> i32 {
    if let Some(value) = chain.iter().find_map(|group| group.get_i32(name)) {
        return value;
    }

    let global = chain.last_mut().unwrap();
    global.set_i32(name, default).unwrap();
    default
}

#[test]
fn option_chain_lookup() {
    let mut global = SettingsGroup::default();
    let mut group_a = SettingsGroup::default();
    let mut group_b = SettingsGroup::default();
    let mut override_a = SettingsGroup::default();

    assert_eq!(option_i32(&mut [&mut global], "option_A", 1), 1);
    assert_eq!(option_i32(&mut [&mut override_a, &mut group_a, &mut global], "option_B", 23), 23);

    // Registered in the global group only.
    assert_eq!(option_i32(&mut [&mut override_a, &mut group_b, &mut global], "option_B", 0), 23);

    group_a.set_i32("option_B", 993).unwrap();
    assert_eq!(option_i32(&mut [&mut override_a, &mut group_b, &mut global], "option_B", 0), 23);
    assert_eq!(option_i32(&mut [&mut override_a, &mut group_a, &mut global], "option_B", 0), 993);

    override_a.set_i32("option_B", 360).unwrap();
    assert_eq!(option_i32(&mut [&mut override_a, &mut group_a, &mut global], "option_B", 0), 360);
    assert_eq!(option_i32(&mut [&mut global], "option_A", 0), 1);
}

#[test]
fn values_are_updated_in_place() {
    let mut group = SettingsGroup::default();

    group.set_i32("volume", 3).unwrap();
    let len = group.values.len();

    for value in 0..100 {
        group.set_i32("volume", value).unwrap();
    }

    assert_eq!(group.get_i32("volume"), Some(99));
    assert_eq!(group.values.len(), len);
    assert_eq!(group.values.stats().allocations, 1);
}

#[test]
fn resized_values_reuse_freed_space() {
    let mut group = SettingsGroup::default();

    group.set_str("name", "a fairly long player name").unwrap();
    group.set_i32("fov", 90).unwrap();
    group.set_str("name", "short").unwrap();
    group.set_str("name", "a fairly long player name").unwrap();

    assert_eq!(group.get_str("name"), Some("a fairly long player name"));
    assert_eq!(group.get_i32("fov"), Some(90));
    group.values.verify().unwrap();

    let free_before = group.values.free_region_count();
    group.remove("name").unwrap();
    assert_eq!(group.get_str("name"), None);
    assert_eq!(group.values.free_region_count(), free_before + 1);
    group.values.verify().unwrap();
}

#[test]
fn serialize_roundtrip() {
    let mut group = SettingsGroup::default();

    group.set_i32("option_A", 1).unwrap();
    group.set_i32("option_B", -23).unwrap();
    group.set_str("motd", "hello").unwrap();
    group.set_str("empty", "").unwrap();

    let bytes = group.serialize();
    let restored = SettingsGroup::deserialize(&bytes).unwrap();

    assert_eq!(restored.get_i32("option_A"), Some(1));
    assert_eq!(restored.get_i32("option_B"), Some(-23));
    assert_eq!(restored.get_str("motd"), Some("hello"));
    assert_eq!(restored.get_str("empty"), Some(""));
    assert_eq!(restored.serialize(), bytes);
}

#[test]
fn cloned_group_is_independent() {
    let mut group = SettingsGroup::default();
    group.set_i32("option_A", 5).unwrap();

    let mut copy = SettingsGroup {
        offsets: group.offsets.clone(),
        values: group.values.try_clone().unwrap(),
    };
    copy.set_i32("option_A", 6).unwrap();

    assert_eq!(group.get_i32("option_A"), Some(5));
    assert_eq!(copy.get_i32("option_A"), Some(6));
}

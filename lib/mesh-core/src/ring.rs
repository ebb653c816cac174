//! Consistent-hash ring for sticky instance selection

use sha2::{Digest, Sha256};
use std::collections::BTreeSet;

/// Consistent-hash ring over member ids.
///
/// Each member owns `replicas` points on the ring. A key maps to the owner of
/// the first point at or after the key's hash, wrapping around, so adding or
/// removing a member only remaps the keys adjacent to that member's points.
#[derive(Clone, Debug)]
pub struct HashRing {
    replicas: usize,
    points: Vec<(u64, String)>,
    members: BTreeSet<String>,
}

impl HashRing {
    /// Create an empty ring with `replicas` virtual nodes per member
    pub fn new(replicas: usize) -> Self {
        Self {
            replicas: replicas.max(1),
            points: Vec::new(),
            members: BTreeSet::new(),
        }
    }

    /// Build a ring from a member list
    pub fn with_members<'a, I>(replicas: usize, members: I) -> Self
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut ring = Self::new(replicas);
        for member in members {
            ring.add(member);
        }
        ring
    }

    /// Add a member; adding an existing member is a no-op
    pub fn add(&mut self, member: &str) {
        if !self.members.insert(member.to_string()) {
            return;
        }
        for idx in 0..self.replicas {
            self.points
                .push((Self::compute_hash(&format!("{}{}", idx, member)), member.to_string()));
        }
        self.points.sort_unstable();
    }

    /// Remove a member and all of its points
    pub fn remove(&mut self, member: &str) {
        if self.members.remove(member) {
            self.points.retain(|(_, m)| m != member);
        }
    }

    pub fn contains(&self, member: &str) -> bool {
        self.members.contains(member)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Members in ascending id order
    pub fn members(&self) -> impl Iterator<Item = &str> {
        self.members.iter().map(String::as_str)
    }

    /// Member owning `key`
    pub fn get(&self, key: &str) -> Option<&str> {
        self.get_where(key, |_| true)
    }

    /// Member owning `key` on the ring restricted to members accepted by `eligible`.
    ///
    /// Walking past ineligible points gives the same answer as a ring built
    /// from the eligible members alone.
    pub fn get_where<F>(&self, key: &str, mut eligible: F) -> Option<&str>
    where
        F: FnMut(&str) -> bool,
    {
        if self.points.is_empty() {
            return None;
        }
        let hash = Self::compute_hash(key);
        let start = self.points.partition_point(|(point, _)| *point < hash);
        let len = self.points.len();
        (0..len)
            .map(|offset| &self.points[(start + offset) % len].1)
            .find(|member| eligible(member))
            .map(String::as_str)
    }

    /// First 8 bytes of the SHA-256 digest, big-endian
    fn compute_hash(s: &str) -> u64 {
        let digest = Sha256::digest(s.as_bytes());
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&digest[..8]);
        u64::from_be_bytes(buf)
    }
}

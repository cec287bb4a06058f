// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Naming of every OS-level object owned by one relay namespace, plus the
// POSIX shm name normalisation shared by segments and mutexes.

use crate::layout::CHANNEL_COUNT;

/// FNV-1a 64-bit hash, used to shorten names on platforms with a small limit.
pub fn fnv1a_64(data: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for &b in data {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

/// Maximum length for POSIX shm names. 0 disables truncation.
///
/// On macOS `PSHMNAMLEN` is 31. On Linux the limit is typically 255.
#[cfg(target_os = "macos")]
pub const SHM_NAME_MAX: usize = 31;

#[cfg(not(target_os = "macos"))]
pub const SHM_NAME_MAX: usize = 0;

/// Produce a POSIX shm-safe name (with leading '/').
///
/// When `SHM_NAME_MAX > 0`, names that would exceed the limit are shortened to
/// `/<prefix>_<16-hex-FNV-1a-hash>`, keeping part of the readable name for
/// debuggability.
pub fn make_shm_name(name: &str) -> String {
    let result = if name.starts_with('/') {
        name.to_string()
    } else {
        format!("/{name}")
    };

    if SHM_NAME_MAX == 0 || result.len() <= SHM_NAME_MAX {
        return result;
    }

    // underscore + 16 hex digits
    const HASH_SUFFIX_LEN: usize = 1 + 16;
    let prefix_len = SHM_NAME_MAX.saturating_sub(HASH_SUFFIX_LEN + 1);

    let hash = format!("{:016x}", fnv1a_64(result.as_bytes()));
    let body = &result[1..];
    let take = prefix_len.min(body.len());
    // Don't split a multi-byte character.
    let take = (0..=take).rev().find(|&i| body.is_char_boundary(i)).unwrap_or(0);

    format!("/{}_{}", &body[..take], hash)
}

/// The names of the segment and the 33 mutexes belonging to a namespace.
///
/// Every instance derives the same names from the same namespace string, so
/// the names (not addresses) are what processes share.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedNames {
    namespace: String,
}

impl SharedNames {
    pub fn new(namespace: &str) -> Self {
        Self {
            namespace: namespace.to_owned(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Segment holding the registry and all per-channel blocks.
    pub fn segment(&self) -> String {
        format!("{}_registry", self.namespace)
    }

    pub fn registry_lock(&self) -> String {
        format!("{}_registry_lock", self.namespace)
    }

    pub fn tuning_lock(&self, channel: usize) -> String {
        format!("{}_tuning{channel}_lock", self.namespace)
    }

    pub fn notes_lock(&self, channel: usize) -> String {
        format!("{}_notes{channel}_lock", self.namespace)
    }

    /// Every mutex name of the namespace, registry lock first.
    pub fn all_locks(&self) -> Vec<String> {
        let mut names = Vec::with_capacity(1 + 2 * CHANNEL_COUNT);
        names.push(self.registry_lock());
        for ch in 0..CHANNEL_COUNT {
            names.push(self.tuning_lock(ch));
            names.push(self.notes_lock(ch));
        }
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fnv1a_known_value() {
        assert_eq!(fnv1a_64(b""), 0xcbf29ce484222325);
        assert_eq!(fnv1a_64(b"a"), 0xaf63dc4c8601ec8c);
    }

    #[test]
    fn make_shm_name_prepends_slash() {
        let name = make_shm_name("relay");
        assert!(name.starts_with('/'));
        assert!(name.contains("relay"));
    }

    #[test]
    fn make_shm_name_keeps_existing_slash() {
        assert_eq!(&make_shm_name("/bar")[..4], "/bar");
    }

    #[test]
    fn long_names_respect_limit() {
        let long = "x".repeat(300);
        let name = make_shm_name(&long);
        if SHM_NAME_MAX > 0 {
            assert!(name.len() <= SHM_NAME_MAX);
        } else {
            assert_eq!(name.len(), 301);
        }
    }

    #[test]
    fn namespace_names_are_distinct() {
        let names = SharedNames::new("ns");
        let locks = names.all_locks();
        assert_eq!(locks.len(), 1 + 2 * CHANNEL_COUNT);
        let mut dedup = locks.clone();
        dedup.sort();
        dedup.dedup();
        assert_eq!(dedup.len(), locks.len());
        assert!(!locks.contains(&names.segment()));
        assert_eq!(names.tuning_lock(3), "ns_tuning3_lock");
    }
}

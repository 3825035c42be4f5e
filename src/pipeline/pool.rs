use std::collections::HashSet;

use crate::types::PoolKey;

/// Keys already in the destination pool, plus every key claimed during this
/// run. A key is claimed when the write is decided, before the write lands.
#[derive(Debug, Default)]
pub struct PoolMembership {
    keys: HashSet<PoolKey>,
}

impl PoolMembership {
    pub fn new(keys: HashSet<PoolKey>) -> Self {
        Self { keys }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// True if `key` was not yet a member; it is one afterwards either way.
    pub fn claim(&mut self, key: PoolKey) -> bool {
        self.keys.insert(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn a_key_can_be_claimed_once() {
        let existing = HashSet::from([PoolKey::new("微博", "旧话题")]);
        let mut pool = PoolMembership::new(existing);

        assert!(!pool.claim(PoolKey::new("微博", "旧话题")));
        assert!(pool.claim(PoolKey::new("微博", "新话题")));
        assert!(!pool.claim(PoolKey::new(" 微博", "新话题 ")));
        assert!(pool.claim(PoolKey::new("抖音", "新话题")));
        assert_eq!(pool.len(), 3);
    }
}

//! Use-def equivalence tracking across call boundaries
//!
//! Values are identified as `function:value`. Relations are recorded whenever
//! an actual argument meets a formal parameter or a returned value meets the
//! caller's receiving binding, and whenever composition renames a child's
//! value inside its parent. Classes only ever merge.

use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap};
use std::rc::Rc;

use tracing::trace;

/// Fully-qualified value identifier
pub fn qualified(function: &str, value: &str) -> String {
    format!("{}:{}", function, value)
}

/// Union-find over qualified value names
#[derive(Debug, Default, Clone)]
pub struct EquivalenceTracker {
    ids: HashMap<String, usize>,
    names: Vec<String>,
    parent: Vec<usize>,
    rank: Vec<u8>,
}

/// One tracker per customization session, shared by every schedule it creates
pub type SharedTracker = Rc<RefCell<EquivalenceTracker>>;

impl EquivalenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> SharedTracker {
        Rc::new(RefCell::new(Self::new()))
    }

    fn intern(&mut self, name: &str) -> usize {
        if let Some(&id) = self.ids.get(name) {
            return id;
        }
        let id = self.names.len();
        self.ids.insert(name.to_string(), id);
        self.names.push(name.to_string());
        self.parent.push(id);
        self.rank.push(0);
        id
    }

    fn root(&self, mut id: usize) -> usize {
        while self.parent[id] != id {
            id = self.parent[id];
        }
        id
    }

    fn root_compress(&mut self, id: usize) -> usize {
        let root = self.root(id);
        let mut cur = id;
        while self.parent[cur] != root {
            let next = self.parent[cur];
            self.parent[cur] = root;
            cur = next;
        }
        root
    }

    /// Representative of `value`'s class; unknown values represent themselves
    pub fn find(&self, value: &str) -> String {
        match self.ids.get(value) {
            Some(&id) => self.names[self.root(id)].clone(),
            None => value.to_string(),
        }
    }

    pub fn union(&mut self, a: &str, b: &str) {
        let (ia, ib) = (self.intern(a), self.intern(b));
        let (ra, rb) = (self.root_compress(ia), self.root_compress(ib));
        if ra == rb {
            return;
        }
        match self.rank[ra].cmp(&self.rank[rb]) {
            std::cmp::Ordering::Less => self.parent[ra] = rb,
            std::cmp::Ordering::Greater => self.parent[rb] = ra,
            std::cmp::Ordering::Equal => {
                self.parent[rb] = ra;
                self.rank[ra] += 1;
            }
        }
    }

    /// Record that `a` and `b` denote the same logical quantity
    pub fn relate(&mut self, a: &str, b: &str) {
        trace!(%a, %b, "relate");
        self.union(a, b);
    }

    pub fn same(&self, a: &str, b: &str) -> bool {
        a == b || self.find(a) == self.find(b)
    }

    /// Every value known to equal `value`, always including `value` itself
    pub fn class_of(&self, value: &str) -> BTreeSet<String> {
        let Some(&id) = self.ids.get(value) else {
            return BTreeSet::from([value.to_string()]);
        };
        let root = self.root(id);
        (0..self.names.len())
            .filter(|&other| self.root(other) == root)
            .map(|other| self.names[other].clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_singleton_class() {
        let tracker = EquivalenceTracker::new();
        assert_eq!(tracker.class_of("kernel:A"), BTreeSet::from(["kernel:A".to_string()]));
        assert_eq!(tracker.find("kernel:A"), "kernel:A");
    }

    #[test]
    fn test_transitive_relation() {
        let mut tracker = EquivalenceTracker::new();
        tracker.relate("kernel:D", "foo:A");
        tracker.relate("foo:A", "foo2:A");
        tracker.relate("top:X", "top:Y");
        let class = tracker.class_of("foo2:A");
        assert_eq!(
            class,
            BTreeSet::from(["kernel:D".to_string(), "foo:A".to_string(), "foo2:A".to_string()])
        );
        assert!(tracker.same("kernel:D", "foo2:A"));
        assert!(!tracker.same("kernel:D", "top:X"));
    }

    #[test]
    fn test_shared_handle_sees_updates() {
        let tracker = EquivalenceTracker::shared();
        let other = Rc::clone(&tracker);
        other.borrow_mut().relate(&qualified("gemm", "C"), &qualified("top", "C"));
        assert!(tracker.borrow().same("gemm:C", "top:C"));
    }
}

use std::sync::Arc;

/// A collection snapshot versioned by a monotonic revision counter.
///
/// Writers publish a fresh snapshot only when the collection actually
/// changed; readers get the revision together with an `Arc` to the snapshot
/// and receive the identical `Arc` for as long as the revision is unchanged.
/// A revision value, once observed, always denotes the same immutable
/// snapshot.
#[derive(Debug)]
pub struct Revisioned<T> {
    revision: u32,
    snapshot: Arc<T>,
}

impl<T: Default> Default for Revisioned<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> Revisioned<T> {
    pub fn new(value: T) -> Self {
        Self {
            revision: 0,
            snapshot: Arc::new(value),
        }
    }

    pub fn revision(&self) -> u32 {
        self.revision
    }

    pub fn get(&self) -> (u32, Arc<T>) {
        (self.revision, Arc::clone(&self.snapshot))
    }

    /// Replaces the snapshot and bumps the revision.
    pub fn publish(&mut self, value: T) {
        self.revision = self.revision.wrapping_add(1);
        self.snapshot = Arc::new(value);
    }
}

impl<T: PartialEq> Revisioned<T> {
    /// Publishes `value` only if it differs from the current snapshot.
    /// Returns true when a new revision was produced.
    pub fn replace_if_changed(&mut self, value: T) -> bool {
        if *self.snapshot == value {
            return false;
        }
        self.publish(value);
        true
    }
}

impl<T: Clone> Revisioned<T> {
    /// Clones the current snapshot, applies `mutate`, and publishes the
    /// result as a new revision.
    pub fn update(&mut self, mutate: impl FnOnce(&mut T)) {
        let mut value = (*self.snapshot).clone();
        mutate(&mut value);
        self.publish(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unchanged_fetches_return_identical_snapshot() {
        let revisioned = Revisioned::new(vec![1u32, 2, 3]);

        let (rev_a, snap_a) = revisioned.get();
        let (rev_b, snap_b) = revisioned.get();

        assert_eq!(rev_a, rev_b);
        assert!(Arc::ptr_eq(&snap_a, &snap_b));
    }

    #[test]
    fn publish_bumps_revision() {
        let mut revisioned = Revisioned::new(Vec::<u32>::new());
        let (rev_before, _) = revisioned.get();

        revisioned.publish(vec![1]);

        let (rev_after, snap) = revisioned.get();
        assert!(rev_after > rev_before);
        assert_eq!(*snap, vec![1]);
    }

    #[test]
    fn replace_if_changed_skips_equal_values() {
        let mut revisioned = Revisioned::new(vec![1u32, 2]);
        let (rev, snap) = revisioned.get();

        assert!(!revisioned.replace_if_changed(vec![1, 2]));
        let (rev_same, snap_same) = revisioned.get();
        assert_eq!(rev, rev_same);
        assert!(Arc::ptr_eq(&snap, &snap_same));

        assert!(revisioned.replace_if_changed(vec![1, 2, 3]));
        assert_ne!(revisioned.revision(), rev);
    }

    #[test]
    fn update_preserves_prior_snapshot_instance() {
        let mut revisioned = Revisioned::new(vec![1u32]);
        let (_, old_snap) = revisioned.get();

        revisioned.update(|v| v.push(2));

        // The previously observed snapshot is untouched.
        assert_eq!(*old_snap, vec![1]);
        let (_, new_snap) = revisioned.get();
        assert_eq!(*new_snap, vec![1, 2]);
    }
}

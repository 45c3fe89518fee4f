use std::time::Instant;

use fxhash::FxHashMap;

use super::flow_key::FlowKey;

/// A pending expiry for one aggregated flow.
///
/// The active deadline is pinned when the flow is first seen and caps how
/// long it may keep aggregating; the inactive deadline slides forward on
/// every update and catches idle flows. The queue orders items by whichever
/// deadline comes first.
#[derive(Debug, Clone)]
pub struct ItemToExpire {
    pub flow_key: FlowKey,
    pub active_expire_time: Instant,
    pub inactive_expire_time: Instant,
}

impl ItemToExpire {
    pub fn min_expire_time(&self) -> Instant {
        self.active_expire_time.min(self.inactive_expire_time)
    }
}

/// Binary min-heap of expiry items with a key→position index.
///
/// The index is the back-reference the correlation map needs: deadline
/// refreshes and deletes address items by flow key and run in O(log n).
/// Every sift keeps the index in step with the heap vector.
#[derive(Debug, Default)]
pub struct ExpirePriorityQueue {
    items: Vec<ItemToExpire>,
    positions: FxHashMap<FlowKey, usize>,
}

impl ExpirePriorityQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn peek(&self) -> Option<&ItemToExpire> {
        self.items.first()
    }

    /// Deadlines of the item for `key`, if queued.
    #[cfg(test)]
    pub fn deadlines(&self, key: &FlowKey) -> Option<(Instant, Instant)> {
        self.positions
            .get(key)
            .map(|&i| (self.items[i].active_expire_time, self.items[i].inactive_expire_time))
    }

    /// Insert a new item. A key may only be queued once; pushing an already
    /// queued key updates it in place instead.
    pub fn push(&mut self, item: ItemToExpire) {
        if let Some(&position) = self.positions.get(&item.flow_key) {
            self.items[position] = item;
            self.fix(position);
            return;
        }
        self.items.push(item);
        let position = self.items.len() - 1;
        self.positions
            .insert(self.items[position].flow_key.clone(), position);
        self.sift_up(position);
    }

    pub fn pop(&mut self) -> Option<ItemToExpire> {
        if self.items.is_empty() {
            return None;
        }
        self.remove_at(0)
    }

    /// Mutate the deadlines of the queued item for `key`, then restore heap
    /// order. Returns false when the key is not queued.
    pub fn update<F>(&mut self, key: &FlowKey, mutate: F) -> bool
    where
        F: FnOnce(&mut ItemToExpire),
    {
        let Some(&position) = self.positions.get(key) else {
            return false;
        };
        mutate(&mut self.items[position]);
        self.fix(position);
        true
    }

    /// Remove the queued item for `key`, wherever it sits in the heap.
    pub fn remove(&mut self, key: &FlowKey) -> Option<ItemToExpire> {
        let position = *self.positions.get(key)?;
        self.remove_at(position)
    }

    fn remove_at(&mut self, position: usize) -> Option<ItemToExpire> {
        let last = self.items.len().checked_sub(1)?;
        if position != last {
            self.swap(position, last);
        }
        let item = self.items.pop()?;
        self.positions.remove(&item.flow_key);
        if position < self.items.len() {
            self.fix(position);
        }
        Some(item)
    }

    /// Restore heap order around a single out-of-place item.
    fn fix(&mut self, position: usize) {
        self.sift_down(position);
        self.sift_up(position);
    }

    fn sift_up(&mut self, mut position: usize) {
        while position > 0 {
            let parent = (position - 1) / 2;
            if self.items[position].min_expire_time() >= self.items[parent].min_expire_time() {
                break;
            }
            self.swap(position, parent);
            position = parent;
        }
    }

    fn sift_down(&mut self, mut position: usize) {
        loop {
            let left = 2 * position + 1;
            if left >= self.items.len() {
                break;
            }
            let right = left + 1;
            let mut smallest = left;
            if right < self.items.len()
                && self.items[right].min_expire_time() < self.items[left].min_expire_time()
            {
                smallest = right;
            }
            if self.items[position].min_expire_time() <= self.items[smallest].min_expire_time() {
                break;
            }
            self.swap(position, smallest);
            position = smallest;
        }
    }

    fn swap(&mut self, a: usize, b: usize) {
        self.items.swap(a, b);
        self.positions.insert(self.items[a].flow_key.clone(), a);
        self.positions.insert(self.items[b].flow_key.clone(), b);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn key(n: u16) -> FlowKey {
        FlowKey {
            source_address: "10.0.0.1".to_string(),
            destination_address: "10.0.0.2".to_string(),
            protocol: 6,
            source_port: n,
            destination_port: 5678,
        }
    }

    fn item(n: u16, active_ms: u64, inactive_ms: u64, base: Instant) -> ItemToExpire {
        ItemToExpire {
            flow_key: key(n),
            active_expire_time: base + Duration::from_millis(active_ms),
            inactive_expire_time: base + Duration::from_millis(inactive_ms),
        }
    }

    /// The key→position index must agree with the heap vector after every
    /// operation.
    fn assert_positions_consistent(queue: &ExpirePriorityQueue) {
        assert_eq!(queue.items.len(), queue.positions.len());
        for (i, queued) in queue.items.iter().enumerate() {
            assert_eq!(queue.positions[&queued.flow_key], i);
        }
    }

    #[test]
    fn test_pop_orders_by_earliest_deadline() {
        let base = Instant::now();
        let mut queue = ExpirePriorityQueue::new();
        queue.push(item(3, 300, 400, base));
        queue.push(item(1, 100, 400, base));
        // Inactive deadline earlier than every active one.
        queue.push(item(2, 500, 50, base));
        assert_positions_consistent(&queue);

        let order: Vec<u16> = std::iter::from_fn(|| queue.pop())
            .map(|i| i.flow_key.source_port)
            .collect();
        assert_eq!(order, vec![2, 1, 3]);
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn test_update_repositions_item() {
        let base = Instant::now();
        let mut queue = ExpirePriorityQueue::new();
        queue.push(item(1, 100, 150, base));
        queue.push(item(2, 200, 250, base));
        assert_eq!(queue.peek().unwrap().flow_key.source_port, 1);

        // Push item 1's deadlines past item 2's.
        let moved = queue.update(&key(1), |queued| {
            queued.active_expire_time = base + Duration::from_millis(900);
            queued.inactive_expire_time = base + Duration::from_millis(950);
        });
        assert!(moved);
        assert_positions_consistent(&queue);
        assert_eq!(queue.peek().unwrap().flow_key.source_port, 2);

        assert!(!queue.update(&key(9), |_| {}));
    }

    #[test]
    fn test_remove_by_key_from_middle() {
        let base = Instant::now();
        let mut queue = ExpirePriorityQueue::new();
        for n in 1..=5 {
            queue.push(item(n, u64::from(n) * 100, 1000, base));
        }
        let removed = queue.remove(&key(3)).unwrap();
        assert_eq!(removed.flow_key.source_port, 3);
        assert_eq!(queue.len(), 4);
        assert_positions_consistent(&queue);
        assert!(queue.remove(&key(3)).is_none());

        let order: Vec<u16> = std::iter::from_fn(|| queue.pop())
            .map(|i| i.flow_key.source_port)
            .collect();
        assert_eq!(order, vec![1, 2, 4, 5]);
    }

    #[test]
    fn test_push_existing_key_updates_in_place() {
        let base = Instant::now();
        let mut queue = ExpirePriorityQueue::new();
        queue.push(item(1, 100, 150, base));
        queue.push(item(1, 700, 800, base));
        assert_eq!(queue.len(), 1);
        let (active, _) = queue.deadlines(&key(1)).unwrap();
        assert_eq!(active, base + Duration::from_millis(700));
    }

    #[test]
    fn test_remove_last_leaves_empty_queue() {
        let base = Instant::now();
        let mut queue = ExpirePriorityQueue::new();
        queue.push(item(1, 100, 150, base));
        assert!(queue.remove(&key(1)).is_some());
        assert_eq!(queue.len(), 0);
        assert!(queue.peek().is_none());
        assert!(queue.pop().is_none());
    }
}

use ailee_types::{TaskPayload, TaskPriority};
use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

struct Tiers {
    critical: VecDeque<TaskPayload>,
    high: VecDeque<TaskPayload>,
    normal: VecDeque<TaskPayload>,
    low: VecDeque<TaskPayload>,
    closed: bool,
}

impl Tiers {
    fn tier_mut(&mut self, priority: TaskPriority) -> &mut VecDeque<TaskPayload> {
        match priority {
            TaskPriority::Critical => &mut self.critical,
            TaskPriority::High => &mut self.high,
            TaskPriority::Normal => &mut self.normal,
            TaskPriority::Low => &mut self.low,
        }
    }

    fn pop_highest(&mut self) -> Option<TaskPayload> {
        self.critical
            .pop_front()
            .or_else(|| self.high.pop_front())
            .or_else(|| self.normal.pop_front())
            .or_else(|| self.low.pop_front())
    }

    fn len(&self) -> usize {
        self.critical.len() + self.high.len() + self.normal.len() + self.low.len()
    }
}

/// Priority-tiered task queue: four FIFO sub-queues behind one mutex and
/// condition variable. Dequeue order is strict priority across tiers and
/// submission order within a tier.
pub struct TaskQueue {
    tiers: Mutex<Tiers>,
    available: Condvar,
    capacity: usize,
}

impl TaskQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            tiers: Mutex::new(Tiers {
                critical: VecDeque::new(),
                high: VecDeque::new(),
                normal: VecDeque::new(),
                low: VecDeque::new(),
                closed: false,
            }),
            available: Condvar::new(),
            capacity,
        }
    }

    /// Enqueue a task at its priority tier. Fails when the queue is full
    /// or closed.
    pub fn push(&self, task: TaskPayload) -> Result<(), TaskPayload> {
        let mut tiers = self.tiers.lock().unwrap_or_else(|e| e.into_inner());
        if tiers.closed || tiers.len() >= self.capacity {
            return Err(task);
        }
        tiers.tier_mut(task.priority).push_back(task);
        self.available.notify_one();
        Ok(())
    }

    /// Block until a task is available or the queue is closed. Returns
    /// `None` only after close, once all tiers are drained.
    pub fn pop_blocking(&self) -> Option<TaskPayload> {
        let mut tiers = self.tiers.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            if let Some(task) = tiers.pop_highest() {
                return Some(task);
            }
            if tiers.closed {
                return None;
            }
            tiers = self
                .available
                .wait(tiers)
                .unwrap_or_else(|e| e.into_inner());
        }
    }

    /// Non-blocking dequeue.
    pub fn try_pop(&self) -> Option<TaskPayload> {
        self.tiers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_highest()
    }

    /// Close the queue and pull out everything still waiting. Blocked
    /// consumers wake up and observe the close.
    pub fn close_and_drain(&self) -> Vec<TaskPayload> {
        let mut tiers = self.tiers.lock().unwrap_or_else(|e| e.into_inner());
        tiers.closed = true;
        let mut drained = Vec::with_capacity(tiers.len());
        while let Some(task) = tiers.pop_highest() {
            drained.push(task);
        }
        self.available.notify_all();
        drained
    }

    /// Reopen a previously closed queue (engine restart).
    pub fn reopen(&self) {
        self.tiers.lock().unwrap_or_else(|e| e.into_inner()).closed = false;
    }

    pub fn len(&self) -> usize {
        self.tiers.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ailee_types::TaskType;

    fn task(id: &str, priority: TaskPriority) -> TaskPayload {
        TaskPayload::new(id, TaskType::Computation, priority)
    }

    #[test]
    fn strict_priority_across_tiers_fifo_within() {
        let queue = TaskQueue::new(16);
        queue.push(task("n1", TaskPriority::Normal)).unwrap();
        queue.push(task("l1", TaskPriority::Low)).unwrap();
        queue.push(task("c1", TaskPriority::Critical)).unwrap();
        queue.push(task("n2", TaskPriority::Normal)).unwrap();
        queue.push(task("h1", TaskPriority::High)).unwrap();

        let order: Vec<String> = std::iter::from_fn(|| queue.try_pop())
            .map(|t| t.task_id)
            .collect();
        assert_eq!(order, vec!["c1", "h1", "n1", "n2", "l1"]);
    }

    #[test]
    fn capacity_is_enforced() {
        let queue = TaskQueue::new(2);
        queue.push(task("a", TaskPriority::Normal)).unwrap();
        queue.push(task("b", TaskPriority::Normal)).unwrap();
        let rejected = queue.push(task("c", TaskPriority::Critical));
        assert!(rejected.is_err());
        assert_eq!(rejected.unwrap_err().task_id, "c");
    }

    #[test]
    fn close_drains_and_wakes_consumers() {
        let queue = std::sync::Arc::new(TaskQueue::new(16));
        queue.push(task("a", TaskPriority::Low)).unwrap();

        let consumer = {
            let queue = std::sync::Arc::clone(&queue);
            std::thread::spawn(move || {
                // First pop gets the task, second observes the close.
                let first = queue.pop_blocking();
                let second = queue.pop_blocking();
                (first, second)
            })
        };

        // Give the consumer a moment to take the task and block again.
        std::thread::sleep(std::time::Duration::from_millis(50));
        let drained = queue.close_and_drain();
        let (first, second) = consumer.join().unwrap();
        assert_eq!(first.unwrap().task_id, "a");
        assert!(second.is_none());
        assert!(drained.is_empty());

        // Pushes after close are refused.
        assert!(queue.push(task("b", TaskPriority::Normal)).is_err());
    }

    #[test]
    fn drain_returns_pending_in_priority_order() {
        let queue = TaskQueue::new(16);
        queue.push(task("l", TaskPriority::Low)).unwrap();
        queue.push(task("c", TaskPriority::Critical)).unwrap();
        let drained: Vec<String> = queue
            .close_and_drain()
            .into_iter()
            .map(|t| t.task_id)
            .collect();
        assert_eq!(drained, vec!["c", "l"]);
    }
}

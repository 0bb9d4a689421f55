// waiters and the intrusive wait queues they form.
//
// a channel owns one WaiterArena and two WaitQueues (send and recv) threaded through it. queue
// links are arena indices rather than pointers. every arena slot carries a generation that is
// bumped when the slot is freed, so a WaiterKey held by a parked task goes stale, rather than
// dangling, once a partner has already dequeued its waiter.

use crate::{
    sched::TaskHandle,
    util::claim::Claim,
};
use std::{
    ptr::NonNull,
    sync::{
        atomic::{
            Ordering::{Acquire, Relaxed, Release},
            AtomicBool,
            AtomicUsize,
        },
        Arc,
    },
};


// woken_case value before any partner has woken the task.
const NO_CASE: usize = usize::MAX;


// direction of a wait queue.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum Dir {
    Send,
    Recv,
}

// state shared between a parked task and every waiter it enqueued for one park.
//
// the partner that dequeues one of the waiters records which case it woke and whether it
// transferred data directly, then readies the task. the scheduler's ready/park pair orders those
// stores before the parked task's loads.
#[derive(Debug)]
pub(crate) struct WaitToken {
    task: TaskHandle,
    // present only for selects. shared by all of the select's waiters so only one partner wins.
    claim: Option<Claim>,
    woken_case: AtomicUsize,
    handoff: AtomicBool,
}

impl WaitToken {
    pub(crate) fn new(task: TaskHandle, select: bool) -> Arc<Self> {
        Arc::new(WaitToken {
            task,
            claim: select.then(Claim::new),
            woken_case: AtomicUsize::new(NO_CASE),
            handoff: AtomicBool::new(false),
        })
    }

    pub(crate) fn task(&self) -> &TaskHandle {
        &self.task
    }

    // claim the right to wake this token's task. always succeeds for a non-select token, since
    // its only waiter can be dequeued only once.
    pub(crate) fn try_claim(&self) -> bool {
        self.claim.as_ref().map_or(true, Claim::claim)
    }

    pub(crate) fn is_select(&self) -> bool {
        self.claim.is_some()
    }

    // record how the task is being woken. must be called by the claiming partner before
    // readying the task.
    pub(crate) fn set_woken(&self, case: usize, handoff: bool) {
        debug_assert_ne!(case, NO_CASE);
        self.handoff.store(handoff, Relaxed);
        self.woken_case.store(case, Release);
    }

    // which case woke the task and whether data was handed off directly, or none if no partner
    // has woken it.
    pub(crate) fn woken(&self) -> Option<(usize, bool)> {
        let case = self.woken_case.load(Acquire);
        if case == NO_CASE {
            None
        } else {
            Some((case, self.handoff.load(Relaxed)))
        }
    }
}

// pointer to the value a waiter sends or the place it receives into. none when a received value
// is discarded or when the waiter only waits for buffer space.
//
// the pointee belongs to the parked task and stays valid until the task resumes. only the
// partner that claimed the waiter touches it.
#[derive(Debug, Copy, Clone)]
pub(crate) struct DataSlot(Option<NonNull<u8>>);

unsafe impl Send for DataSlot {}

impl DataSlot {
    pub(crate) fn new(ptr: Option<NonNull<u8>>) -> Self {
        DataSlot(ptr)
    }

    pub(crate) fn none() -> Self {
        DataSlot(None)
    }

    pub(crate) fn get(self) -> Option<NonNull<u8>> {
        self.0
    }
}

// one blocked participant in a channel operation.
#[derive(Debug)]
pub(crate) struct Waiter {
    pub(crate) token: Arc<WaitToken>,
    // index of the select case this waiter was enqueued for, or 0 for a direct operation.
    pub(crate) case: usize,
    pub(crate) slot: DataSlot,
}

// key to a waiter in an arena. stale once the waiter has been dequeued.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) struct WaiterKey {
    idx: usize,
    generation: u32,
}


// ==== arena ====


#[derive(Debug)]
struct Node {
    generation: u32,
    state: NodeState,
}

#[derive(Debug)]
enum NodeState {
    Free {
        next_free: Option<usize>,
    },
    Linked {
        waiter: Waiter,
        dir: Dir,
        // next node towards front.
        to_front: Option<usize>,
        // next node towards back.
        to_back: Option<usize>,
    },
}

// storage for the waiters of one channel's wait queues.
#[derive(Debug, Default)]
pub(crate) struct WaiterArena {
    nodes: Vec<Node>,
    // head of the free list threaded through NodeState::Free.
    free: Option<usize>,
    // number of linked nodes.
    linked: usize,
}

impl WaiterArena {
    pub(crate) fn new() -> Self {
        WaiterArena::default()
    }

    // number of waiters currently linked into either queue.
    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.linked
    }

    // allocate a node for a waiter about to be linked at the back of a queue.
    fn alloc(&mut self, waiter: Waiter, dir: Dir, to_front: Option<usize>) -> usize {
        self.linked += 1;
        let state = NodeState::Linked { waiter, dir, to_front, to_back: None };
        if let Some(idx) = self.free {
            let node = &mut self.nodes[idx];
            let NodeState::Free { next_free } = node.state else {
                unreachable!("free list links a linked node (internal bug)");
            };
            self.free = next_free;
            node.state = state;
            idx
        } else {
            self.nodes.push(Node { generation: 0, state });
            self.nodes.len() - 1
        }
    }

    // free a linked node and return its waiter. bumps the generation, staling all keys to it.
    fn free(&mut self, idx: usize) -> Waiter {
        self.linked -= 1;
        let node = &mut self.nodes[idx];
        node.generation = node.generation.wrapping_add(1);
        let state = std::mem::replace(&mut node.state, NodeState::Free { next_free: self.free });
        self.free = Some(idx);
        match state {
            NodeState::Linked { waiter, .. } => waiter,
            NodeState::Free { .. } => unreachable!("freed a free node (internal bug)"),
        }
    }

    // links of a linked node.
    fn links(&self, idx: usize) -> (Option<usize>, Option<usize>) {
        match &self.nodes[idx].state {
            &NodeState::Linked { to_front, to_back, .. } => (to_front, to_back),
            NodeState::Free { .. } => unreachable!("followed link to a free node (internal bug)"),
        }
    }

    fn set_to_front(&mut self, idx: usize, link: Option<usize>) {
        if let NodeState::Linked { to_front, .. } = &mut self.nodes[idx].state {
            *to_front = link;
        }
    }

    fn set_to_back(&mut self, idx: usize, link: Option<usize>) {
        if let NodeState::Linked { to_back, .. } = &mut self.nodes[idx].state {
            *to_back = link;
        }
    }

    // resolve a key to its node index, if the key is not stale and the node is in a queue of
    // the given direction.
    fn resolve(&self, key: WaiterKey, queue_dir: Dir) -> Option<usize> {
        let node = self.nodes.get(key.idx)?;
        if node.generation != key.generation {
            return None;
        }
        match &node.state {
            &NodeState::Linked { dir, .. } => {
                debug_assert_eq!(dir, queue_dir, "waiter key used with wrong queue");
                (dir == queue_dir).then_some(key.idx)
            }
            NodeState::Free { .. } => None,
        }
    }
}


// ==== queue ====


// FIFO of waiters for one direction of one channel.
#[derive(Debug)]
pub(crate) struct WaitQueue {
    dir: Dir,
    // front and back of queue, unless queue is empty.
    front_back: Option<(usize, usize)>,
    len: usize,
}

impl WaitQueue {
    pub(crate) fn new(dir: Dir) -> Self {
        WaitQueue { dir, front_back: None, len: 0 }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    // may still contain waiters of selects that already completed elsewhere.
    pub(crate) fn is_empty(&self) -> bool {
        self.len == 0
    }

    // link the waiter to the back of this queue.
    pub(crate) fn push(&mut self, arena: &mut WaiterArena, waiter: Waiter) -> WaiterKey {
        let back = self.front_back.map(|(_, back)| back);
        let idx = arena.alloc(waiter, self.dir, back);
        if let Some((_, ref mut back)) = self.front_back {
            // node becomes new back, and new to_back of previous back
            arena.set_to_back(*back, Some(idx));
            *back = idx;
        } else {
            // edge case: node becomes only node in queue
            self.front_back = Some((idx, idx));
        }
        self.len += 1;
        WaiterKey { idx, generation: arena.nodes[idx].generation }
    }

    // dequeue the first waiter whose token this call manages to claim.
    //
    // waiters belonging to a select that some other partner already claimed are unlinked and
    // discarded along the way. their owner will find its keys stale.
    pub(crate) fn pop(&mut self, arena: &mut WaiterArena) -> Option<Waiter> {
        loop {
            let (front, _) = self.front_back?;
            let waiter = self.unlink(arena, front);
            if waiter.token.try_claim() {
                return Some(waiter);
            }
            trace!(case = waiter.case, "discarding waiter of already-claimed select");
        }
    }

    // unlink a specific waiter. returns none if the key is stale.
    pub(crate) fn remove(&mut self, arena: &mut WaiterArena, key: WaiterKey) -> Option<Waiter> {
        let idx = arena.resolve(key, self.dir)?;
        Some(self.unlink(arena, idx))
    }

    // unlink and free a node known to be linked into this queue.
    fn unlink(&mut self, arena: &mut WaiterArena, idx: usize) -> Waiter {
        let (to_front, to_back) = arena.links(idx);
        let Some((front, back)) = self.front_back else {
            unreachable!("unlinked node from empty queue (internal bug)");
        };
        self.front_back = match (to_front, to_back) {
            (None, None) => {
                // edge case: node was only node in queue
                debug_assert_eq!((front, back), (idx, idx));
                None
            }
            (Some(to_front), Some(to_back)) => {
                // middle of queue
                arena.set_to_back(to_front, Some(to_back));
                arena.set_to_front(to_back, Some(to_front));
                Some((front, back))
            }
            (None, Some(to_back)) => {
                // edge case: node was at the front of queue (but is not the back)
                debug_assert_eq!(front, idx);
                arena.set_to_front(to_back, None);
                Some((to_back, back))
            }
            (Some(to_front), None) => {
                // edge case: node was at the back of queue (but is not the front)
                debug_assert_eq!(back, idx);
                arena.set_to_back(to_front, None);
                Some((front, to_front))
            }
        };
        self.len -= 1;
        arena.free(idx)
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::{TaskScheduler, ThreadScheduler};

    fn waiter(token: &Arc<WaitToken>, case: usize) -> Waiter {
        Waiter { token: Arc::clone(token), case, slot: DataSlot::none() }
    }

    fn direct_token() -> Arc<WaitToken> {
        WaitToken::new(ThreadScheduler.current_task(), false)
    }

    #[test]
    fn fifo_order() {
        let mut arena = WaiterArena::new();
        let mut queue = WaitQueue::new(Dir::Recv);
        let token = direct_token();
        for case in 0..5 {
            queue.push(&mut arena, waiter(&token, case));
        }
        assert_eq!(queue.len(), 5);
        for case in 0..5 {
            assert_eq!(queue.pop(&mut arena).unwrap().case, case);
        }
        assert!(queue.pop(&mut arena).is_none());
        assert!(queue.is_empty());
        assert_eq!(arena.len(), 0);
    }

    #[test]
    fn remove_front_middle_back() {
        let mut arena = WaiterArena::new();
        let mut queue = WaitQueue::new(Dir::Send);
        let token = direct_token();
        let keys = (0..5)
            .map(|case| queue.push(&mut arena, waiter(&token, case)))
            .collect::<Vec<_>>();
        assert_eq!(queue.remove(&mut arena, keys[2]).unwrap().case, 2);
        assert_eq!(queue.remove(&mut arena, keys[0]).unwrap().case, 0);
        assert_eq!(queue.remove(&mut arena, keys[4]).unwrap().case, 4);
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.pop(&mut arena).unwrap().case, 1);
        assert_eq!(queue.pop(&mut arena).unwrap().case, 3);
        assert!(queue.pop(&mut arena).is_none());
    }

    #[test]
    fn stale_key_is_noop() {
        let mut arena = WaiterArena::new();
        let mut queue = WaitQueue::new(Dir::Recv);
        let token = direct_token();
        let stale = queue.push(&mut arena, waiter(&token, 0));
        assert!(queue.pop(&mut arena).is_some());
        // the slot gets reused by a different waiter
        let fresh = queue.push(&mut arena, waiter(&token, 1));
        assert_ne!(stale, fresh);
        assert!(queue.remove(&mut arena, stale).is_none());
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.remove(&mut arena, fresh).unwrap().case, 1);
    }

    #[test]
    fn pop_skips_claimed_select_waiters() {
        let mut arena = WaiterArena::new();
        let mut queue = WaitQueue::new(Dir::Recv);
        let select = WaitToken::new(ThreadScheduler.current_task(), true);
        let direct = direct_token();
        queue.push(&mut arena, waiter(&select, 3));
        queue.push(&mut arena, waiter(&direct, 0));
        // some other channel's partner already won the select
        assert!(select.try_claim());
        let popped = queue.pop(&mut arena).unwrap();
        assert!(Arc::ptr_eq(&popped.token, &direct));
        assert!(queue.is_empty());
        assert_eq!(arena.len(), 0);
    }

    #[test]
    fn select_waiters_claimed_once() {
        let mut arena = WaiterArena::new();
        let mut queue_a = WaitQueue::new(Dir::Recv);
        let mut queue_b = WaitQueue::new(Dir::Send);
        let select = WaitToken::new(ThreadScheduler.current_task(), true);
        queue_a.push(&mut arena, waiter(&select, 0));
        queue_b.push(&mut arena, waiter(&select, 1));
        assert_eq!(queue_b.pop(&mut arena).unwrap().case, 1);
        assert!(queue_a.pop(&mut arena).is_none());
    }

    #[test]
    fn token_records_wake() {
        let token = direct_token();
        assert_eq!(token.woken(), None);
        token.set_woken(2, true);
        assert_eq!(token.woken(), Some((2, true)));
    }
}

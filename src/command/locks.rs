//! Resource lock manager
//!
//! A command holds either all of its declared resources or none of them.
//! Waiters on a resource are served in arrival order: a ticket is queued on
//! every resource it wants, and it is granted only once it is at the front of
//! each of those queues and every resource is free. Because tickets are
//! queued in one global order, no two waiters can each hold what the other
//! needs, so the manager cannot deadlock.
//!
//! Holding is re-entrant per owner: asking again for a resource the owner
//! already holds succeeds without blocking.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, trace};

/// Returned by [`ResourceLockManager::try_acquire`] when any resource is
/// unavailable
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("resources unavailable: {}", .contended.join(", "))]
pub struct Blocked {
    pub contended: Vec<String>,
}

#[derive(Debug, Default)]
struct ResourceState {
    holder: Option<String>,
    queue: VecDeque<u64>,
}

#[derive(Debug)]
struct Waiter {
    owner: String,
    resources: BTreeSet<String>,
    grant: oneshot::Sender<Vec<String>>,
}

#[derive(Debug, Default)]
struct LockTable {
    resources: HashMap<String, ResourceState>,
    waiters: HashMap<u64, Waiter>,
    next_ticket: u64,
}

impl LockTable {
    /// A resource is available to `owner` if the owner already holds it, or
    /// it is free and nobody (other than `ticket`) is queued ahead.
    fn available(&self, resource: &str, owner: &str, ticket: Option<u64>) -> bool {
        let Some(state) = self.resources.get(resource) else {
            return true;
        };
        match &state.holder {
            Some(holder) => holder == owner,
            None => match state.queue.front() {
                None => true,
                Some(front) => Some(*front) == ticket,
            },
        }
    }

    fn contended(&self, resources: &BTreeSet<String>, owner: &str, ticket: Option<u64>) -> Vec<String> {
        resources
            .iter()
            .filter(|r| !self.available(r, owner, ticket))
            .cloned()
            .collect()
    }

    /// Mark every resource held by `owner`; returns the ones newly taken
    fn grant(&mut self, resources: &BTreeSet<String>, owner: &str) -> Vec<String> {
        let mut newly = Vec::new();
        for resource in resources {
            let state = self.resources.entry(resource.clone()).or_default();
            if state.holder.as_deref() != Some(owner) {
                state.holder = Some(owner.to_string());
                newly.push(resource.clone());
            }
        }
        newly
    }

    fn release(&mut self, resources: &[String], owner: &str) {
        for resource in resources {
            if let Some(state) = self.resources.get_mut(resource) {
                if state.holder.as_deref() == Some(owner) {
                    state.holder = None;
                }
                if state.holder.is_none() && state.queue.is_empty() {
                    self.resources.remove(resource);
                }
            }
        }
    }

    fn enqueue(&mut self, resources: &BTreeSet<String>, owner: &str) -> (u64, oneshot::Receiver<Vec<String>>) {
        let ticket = self.next_ticket;
        self.next_ticket += 1;
        for resource in resources {
            self.resources
                .entry(resource.clone())
                .or_default()
                .queue
                .push_back(ticket);
        }
        let (grant, rx) = oneshot::channel();
        self.waiters.insert(
            ticket,
            Waiter {
                owner: owner.to_string(),
                resources: resources.clone(),
                grant,
            },
        );
        (ticket, rx)
    }

    /// Drop `ticket` from every queue it sits in
    fn dequeue(&mut self, ticket: u64) -> Option<Waiter> {
        let waiter = self.waiters.remove(&ticket)?;
        for resource in &waiter.resources {
            if let Some(state) = self.resources.get_mut(resource) {
                state.queue.retain(|t| *t != ticket);
                if state.holder.is_none() && state.queue.is_empty() {
                    self.resources.remove(resource);
                }
            }
        }
        Some(waiter)
    }

    /// Grant every waiter that has become eligible, in ticket order
    fn wake(&mut self) {
        loop {
            let mut fronts: Vec<u64> = self
                .resources
                .values()
                .filter_map(|s| s.queue.front().copied())
                .collect();
            fronts.sort_unstable();
            fronts.dedup();

            let eligible = fronts.into_iter().find(|ticket| {
                self.waiters.get(ticket).is_some_and(|w| {
                    w.resources
                        .iter()
                        .all(|r| self.available(r, &w.owner, Some(*ticket)))
                })
            });
            let Some(ticket) = eligible else {
                return;
            };
            let Some(waiter) = self.dequeue(ticket) else {
                return;
            };

            let newly = self.grant(&waiter.resources, &waiter.owner);
            trace!(owner = %waiter.owner, ?newly, "granted queued lock request");
            if let Err(newly) = waiter.grant.send(newly) {
                // Waiter went away between queueing and grant
                self.release(&newly, &waiter.owner);
            }
        }
    }
}

/// Shared handle to the lock table. Cloning is cheap.
#[derive(Debug, Clone, Default)]
pub struct ResourceLockManager {
    table: Arc<Mutex<LockTable>>,
}

impl ResourceLockManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> MutexGuard<'_, LockTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take every resource now, or none of them
    pub fn try_acquire(&self, resources: &BTreeSet<String>, owner: &str) -> Result<LockGuard, Blocked> {
        let mut table = self.table();
        let contended = table.contended(resources, owner, None);
        if !contended.is_empty() {
            return Err(Blocked { contended });
        }
        let newly = table.grant(resources, owner);
        Ok(self.guard(owner, newly))
    }

    /// Take a place in line now and wait for the grant later.
    ///
    /// Requests are ordered by the call to `reserve`, not by when the ticket
    /// is awaited, so callers can fix the order synchronously and wait on
    /// another task.
    pub fn reserve(&self, resources: &BTreeSet<String>, owner: &str) -> LockTicket {
        let mut table = self.table();
        let contended = table.contended(resources, owner, None);
        let state = if contended.is_empty() {
            let newly = table.grant(resources, owner);
            TicketState::Granted(self.guard(owner, newly))
        } else {
            let (ticket, rx) = table.enqueue(resources, owner);
            debug!(owner, ticket, ?contended, "queued for resources");
            TicketState::Queued(PendingRequest {
                manager: self.clone(),
                ticket,
                owner: owner.to_string(),
                rx: Some(rx),
            })
        };
        drop(table);

        LockTicket {
            manager: self.clone(),
            owner: owner.to_string(),
            resources: resources.clone(),
            contended,
            state,
        }
    }

    /// Wait until every resource can be taken at once.
    ///
    /// Dropping the returned future before it completes withdraws the request
    /// (and gives back anything granted in the meantime).
    pub async fn acquire(&self, resources: &BTreeSet<String>, owner: &str) -> LockGuard {
        loop {
            match self.reserve(resources, owner).state {
                TicketState::Granted(guard) => return guard,
                TicketState::Queued(pending) => {
                    if let Some(newly) = pending.wait().await {
                        return self.guard(owner, newly);
                    }
                }
            }
        }
    }

    /// Free the listed resources held by `owner`. Resources held by anyone
    /// else are left alone.
    pub fn release(&self, resources: &[String], owner: &str) {
        let mut table = self.table();
        table.release(resources, owner);
        table.wake();
    }

    /// Current holder of a resource
    pub fn holder(&self, resource: &str) -> Option<String> {
        self.table()
            .resources
            .get(resource)
            .and_then(|s| s.holder.clone())
    }

    /// Number of requests queued on a resource
    pub fn queued(&self, resource: &str) -> usize {
        self.table()
            .resources
            .get(resource)
            .map_or(0, |s| s.queue.len())
    }

    fn guard(&self, owner: &str, resources: Vec<String>) -> LockGuard {
        LockGuard {
            manager: self.clone(),
            owner: owner.to_string(),
            resources,
        }
    }
}

/// A reserved place in line. Dropping it gives up the place, or the
/// resources if they were already granted.
pub struct LockTicket {
    manager: ResourceLockManager,
    owner: String,
    resources: BTreeSet<String>,
    contended: Vec<String>,
    state: TicketState,
}

enum TicketState {
    Granted(LockGuard),
    Queued(PendingRequest),
}

impl LockTicket {
    /// Resources that were unavailable at reservation; empty when the
    /// request was granted on the spot
    pub fn contended(&self) -> &[String] {
        &self.contended
    }

    /// Wait for the grant
    pub async fn granted(self) -> LockGuard {
        match self.state {
            TicketState::Granted(guard) => guard,
            TicketState::Queued(pending) => match pending.wait().await {
                Some(newly) => self.manager.guard(&self.owner, newly),
                None => self.manager.acquire(&self.resources, &self.owner).await,
            },
        }
    }
}

/// Queued request; withdraws itself if dropped before the grant is read
struct PendingRequest {
    manager: ResourceLockManager,
    ticket: u64,
    owner: String,
    rx: Option<oneshot::Receiver<Vec<String>>>,
}

impl PendingRequest {
    async fn wait(mut self) -> Option<Vec<String>> {
        let rx = self.rx.as_mut()?;
        let granted = rx.await.ok();
        self.rx = None;
        granted
    }
}

impl Drop for PendingRequest {
    fn drop(&mut self) {
        let Some(mut rx) = self.rx.take() else {
            return;
        };
        let mut table = self.manager.table();
        if table.dequeue(self.ticket).is_none() {
            // Already granted; hand the resources back
            if let Ok(newly) = rx.try_recv() {
                table.release(&newly, &self.owner);
            }
        }
        table.wake();
    }
}

/// Resources held by one owner; released on drop
#[derive(Debug)]
pub struct LockGuard {
    manager: ResourceLockManager,
    owner: String,
    resources: Vec<String>,
}

impl LockGuard {
    /// Resources this guard took (excludes ones the owner already held)
    pub fn resources(&self) -> &[String] {
        &self.resources
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if !self.resources.is_empty() {
            self.manager.release(&self.resources, &self.owner);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn all_or_nothing() {
        let locks = ResourceLockManager::new();
        let _disk = locks.try_acquire(&set(&["disk-0"]), "a").unwrap();

        let err = locks.try_acquire(&set(&["bmc-session", "disk-0"]), "b").unwrap_err();
        assert_eq!(err.contended, vec!["disk-0".to_string()]);
        // bmc-session was not taken as a side effect
        assert_eq!(locks.holder("bmc-session"), None);
    }

    #[test]
    fn reentrant_for_same_owner() {
        let locks = ResourceLockManager::new();
        let outer = locks.try_acquire(&set(&["bmc-session"]), "a").unwrap();
        let inner = locks.try_acquire(&set(&["bmc-session"]), "a").unwrap();
        assert!(inner.resources().is_empty());

        drop(inner);
        assert_eq!(locks.holder("bmc-session").as_deref(), Some("a"));
        drop(outer);
        assert_eq!(locks.holder("bmc-session"), None);
    }

    #[test]
    fn release_ignores_other_owners() {
        let locks = ResourceLockManager::new();
        let _guard = locks.try_acquire(&set(&["disk-0"]), "a").unwrap();
        locks.release(&["disk-0".to_string()], "b");
        assert_eq!(locks.holder("disk-0").as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn waiters_are_served_in_arrival_order() {
        let locks = ResourceLockManager::new();
        let first = locks.try_acquire(&set(&["bmc-session"]), "a").unwrap();

        let (order_tx, mut order_rx) = tokio::sync::mpsc::unbounded_channel();
        for (i, owner) in ["b", "c", "d"].into_iter().enumerate() {
            tokio::spawn({
                let locks = locks.clone();
                let order_tx = order_tx.clone();
                async move {
                    let _guard = locks.acquire(&set(&["bmc-session"]), owner).await;
                    order_tx.send(owner).unwrap();
                }
            });
            // Let the task queue before spawning the next one
            while locks.queued("bmc-session") < i + 1 {
                tokio::task::yield_now().await;
            }
        }

        drop(first);
        let mut order = Vec::new();
        for _ in 0..3 {
            order.push(timeout(Duration::from_secs(1), order_rx.recv()).await.unwrap().unwrap());
        }
        assert_eq!(order, vec!["b", "c", "d"]);
    }

    #[tokio::test]
    async fn queued_request_blocks_later_overlapping_request() {
        let locks = ResourceLockManager::new();
        let disk = locks.try_acquire(&set(&["disk-0"]), "a").unwrap();

        // b wants disk-0 and bmc-session; it queues on both
        let waiter = tokio::spawn({
            let locks = locks.clone();
            async move { locks.acquire(&set(&["bmc-session", "disk-0"]), "b").await }
        });
        while locks.queued("bmc-session") == 0 {
            tokio::task::yield_now().await;
        }

        // bmc-session is free, but b arrived first
        assert!(locks.try_acquire(&set(&["bmc-session"]), "c").is_err());

        drop(disk);
        let guard = timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
        assert_eq!(locks.holder("bmc-session").as_deref(), Some("b"));
        assert_eq!(locks.holder("disk-0").as_deref(), Some("b"));
        drop(guard);
        assert_eq!(locks.holder("disk-0"), None);
    }

    #[tokio::test]
    async fn abandoned_request_leaves_the_queue() {
        let locks = ResourceLockManager::new();
        let held = locks.try_acquire(&set(&["storage-mount"]), "a").unwrap();

        let abandoned = timeout(
            Duration::from_millis(20),
            locks.acquire(&set(&["storage-mount"]), "b"),
        )
        .await;
        assert!(abandoned.is_err());
        assert_eq!(locks.queued("storage-mount"), 0);

        drop(held);
        assert!(locks.try_acquire(&set(&["storage-mount"]), "c").is_ok());
    }

    #[tokio::test]
    async fn reservation_order_decides_grant_order() {
        let locks = ResourceLockManager::new();
        let first = locks.reserve(&set(&["bmc-session"]), "a");
        let second = locks.reserve(&set(&["bmc-session"]), "b");
        let third = locks.reserve(&set(&["bmc-session"]), "c");

        assert!(first.contended().is_empty());
        assert_eq!(second.contended().to_vec(), vec!["bmc-session".to_string()]);
        assert_eq!(locks.queued("bmc-session"), 2);

        // Awaiting the later ticket first does not let it jump the line
        let third = tokio::spawn(third.granted());
        let first = first.granted().await;
        tokio::task::yield_now().await;
        assert!(!third.is_finished());

        drop(first);
        let second = second.granted().await;
        assert_eq!(locks.holder("bmc-session").as_deref(), Some("b"));

        drop(second);
        let third = timeout(Duration::from_secs(1), third).await.unwrap().unwrap();
        assert_eq!(locks.holder("bmc-session").as_deref(), Some("c"));
        drop(third);
        assert_eq!(locks.holder("bmc-session"), None);
    }

    #[tokio::test]
    async fn dropped_ticket_gives_up_its_place() {
        let locks = ResourceLockManager::new();
        let held = locks.try_acquire(&set(&["disk-0"]), "a").unwrap();
        let abandoned = locks.reserve(&set(&["disk-0"]), "b");
        let next = locks.reserve(&set(&["disk-0"]), "c");

        drop(abandoned);
        assert_eq!(locks.queued("disk-0"), 1);
        drop(held);
        let _guard = timeout(Duration::from_secs(1), next.granted()).await.unwrap();
        assert_eq!(locks.holder("disk-0").as_deref(), Some("c"));
    }

    #[tokio::test]
    async fn disjoint_requests_do_not_wait() {
        let locks = ResourceLockManager::new();
        let _bmc = locks.try_acquire(&set(&["bmc-session"]), "a").unwrap();
        let disk = timeout(Duration::from_millis(50), locks.acquire(&set(&["disk-0"]), "b")).await;
        assert!(disk.is_ok());
    }
}

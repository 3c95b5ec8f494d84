//! Buffer leases: typed ownership of memory handed to the engine
//!
//! A send hands its payload to the engine for the full duration of the
//! native call. The lease is the value that makes that window explicit:
//! while it exists, the underlying memory is stable and reachable only by
//! the in-flight engine operation, and it is released exactly once, by the
//! send context, strictly after the matching send-complete event.

use bytes::Bytes;
use std::mem;

/// A lease on the memory backing one in-flight send.
///
/// Two ownership variants exist:
///
/// * **pinned**: wraps caller-owned [`Bytes`] without copying; the lease
///   holds a reference count for the duration of the send, which keeps the
///   memory stable (the Rust rendering of pinning a caller buffer).
/// * **owned**: copies the payload into a lease-owned allocation at
///   construction, for fire-and-forget callers that will not keep the
///   source buffer alive. The optional wiped flavor zeroes the allocation
///   on release, provided the engine has dropped its view by then.
#[derive(Debug)]
pub struct BufferLease {
    data: Bytes,
    owned: bool,
    wipe: bool,
}

impl BufferLease {
    /// Lease caller-owned memory without copying.
    pub fn pinned(data: Bytes) -> Self {
        Self {
            data,
            owned: false,
            wipe: false,
        }
    }

    /// Copy the payload into a lease-owned allocation.
    pub fn owned(payload: &[u8]) -> Self {
        Self {
            data: Bytes::copy_from_slice(payload),
            owned: true,
            wipe: false,
        }
    }

    /// Copy the payload into a lease-owned allocation that is zeroed when
    /// the lease is released.
    pub fn owned_wiped(payload: &[u8]) -> Self {
        Self {
            data: Bytes::copy_from_slice(payload),
            owned: true,
            wipe: true,
        }
    }

    /// The stable view handed to the engine for the send's duration.
    ///
    /// Cloning `Bytes` shares the same allocation, so the engine's view and
    /// the lease refer to one buffer; the allocation cannot move or be freed
    /// until both sides are done with it.
    pub fn view(&self) -> Bytes {
        self.data.clone()
    }

    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the lease holds no bytes.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Whether this lease owns its allocation (copy variant).
    pub fn is_owned(&self) -> bool {
        self.owned
    }
}

impl Drop for BufferLease {
    fn drop(&mut self) {
        if self.wipe {
            // Only possible once the engine has released its view; if a view
            // is still live the bytes stay intact and are dropped normally.
            let data = mem::take(&mut self.data);
            if let Ok(mut exclusive) = data.try_into_mut() {
                exclusive.fill(0);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pinned_lease_shares_the_allocation() {
        let payload = Bytes::from_static(b"Hello");
        let lease = BufferLease::pinned(payload.clone());
        assert!(!lease.is_owned());
        assert_eq!(lease.view(), payload);
    }

    #[test]
    fn owned_lease_copies_the_payload() {
        let mut source = vec![1u8, 2, 3];
        let lease = BufferLease::owned(&source);
        source[0] = 9;
        assert!(lease.is_owned());
        assert_eq!(lease.view().as_ref(), &[1, 2, 3]);
    }

    #[test]
    fn wiped_lease_zeroes_when_last_owner() {
        let lease = BufferLease::owned_wiped(b"secret");
        let view = lease.view();
        drop(view);
        // Last reference: drop wipes without panicking.
        drop(lease);
    }

    #[test]
    fn wiped_lease_leaves_live_views_intact() {
        let lease = BufferLease::owned_wiped(b"secret");
        let view = lease.view();
        drop(lease);
        assert_eq!(view.as_ref(), b"secret");
    }
}

//! Pairing of a local and an external terminal for one service.

use super::ServiceDescription;
use crate::memory::ObjectPool;
use crate::observability::{record_channel_created, record_pool_exhausted, trace_channel_created};
use std::fmt;
use std::ops::Deref;
use std::ptr::NonNull;
use std::sync::Arc;
use thiserror::Error;

/// Channel failures.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelError {
    /// A terminal pool had no free cell.
    #[error("terminal pool exhausted: no free cell for a new channel")]
    ObjectPoolFull,

    /// No channel exists for the requested service.
    #[error("no channel exists for the requested service")]
    DoesNotExist,
}

/// One end of a channel, e.g. a local subscriber or an external publisher.
pub trait Terminal: Send + Sync + Sized {
    /// Parameters needed to open a terminal.
    type Options;

    /// Open a terminal for `service`.
    fn open(service: &ServiceDescription, options: &Self::Options) -> Self;
}

/// Pools the terminals of both kinds are allocated from.
///
/// Cloning shares the pools.
pub struct TerminalPools<L, E, const N: usize> {
    local: Arc<ObjectPool<L, N>>,
    external: Arc<ObjectPool<E, N>>,
}

impl<L, E, const N: usize> TerminalPools<L, E, N> {
    /// Create a fresh pair of empty pools.
    pub fn new() -> Self {
        Self::with_pools(Arc::new(ObjectPool::new()), Arc::new(ObjectPool::new()))
    }

    /// Use existing pools.
    pub fn with_pools(local: Arc<ObjectPool<L, N>>, external: Arc<ObjectPool<E, N>>) -> Self {
        Self { local, external }
    }

    /// The pool of local terminals.
    pub fn local(&self) -> &Arc<ObjectPool<L, N>> {
        &self.local
    }

    /// The pool of external terminals.
    pub fn external(&self) -> &Arc<ObjectPool<E, N>> {
        &self.external
    }
}

impl<L, E, const N: usize> Default for TerminalPools<L, E, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<L, E, const N: usize> Clone for TerminalPools<L, E, N> {
    fn clone(&self) -> Self {
        Self {
            local: Arc::clone(&self.local),
            external: Arc::clone(&self.external),
        }
    }
}

/// A terminal living in a pool cell. Removes itself on drop.
struct PooledTerminal<T, const N: usize> {
    pool: Arc<ObjectPool<T, N>>,
    index: usize,
    ptr: NonNull<T>,
}

impl<T, const N: usize> Drop for PooledTerminal<T, N> {
    fn drop(&mut self) {
        self.pool.remove(self.index, true);
    }
}

// SAFETY: ptr points into the pool kept alive by `pool`; access is shared
// only, so T: Sync suffices for Sync and the drop happens through the pool.
unsafe impl<T: Send + Sync, const N: usize> Send for PooledTerminal<T, N> {}
unsafe impl<T: Send + Sync, const N: usize> Sync for PooledTerminal<T, N> {}

/// Shared handle to a pooled terminal.
///
/// The terminal is destroyed and its cell freed when the last handle drops.
pub struct TerminalHandle<T, const N: usize>(Arc<PooledTerminal<T, N>>);

impl<T, const N: usize> TerminalHandle<T, N> {
    /// Construct a terminal in `pool`; `None` if the pool is full.
    fn construct<F>(pool: &Arc<ObjectPool<T, N>>, make: F) -> Option<Self>
    where
        F: FnOnce() -> T,
    {
        let index = pool.construct_with(make)?;
        let terminal = PooledTerminal {
            pool: Arc::clone(pool),
            index,
            // Claimed indices are always in range
            ptr: pool.index_to_pointer(index)?,
        };
        Some(Self(Arc::new(terminal)))
    }

    /// Whether both handles refer to the same terminal.
    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        Arc::ptr_eq(&a.0, &b.0)
    }

    /// Index of the terminal's cell in its pool.
    pub fn pool_index(&self) -> usize {
        self.0.index
    }
}

impl<T, const N: usize> Clone for TerminalHandle<T, N> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<T, const N: usize> Deref for TerminalHandle<T, N> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the cell stays constructed until the last handle drops.
        unsafe { self.0.ptr.as_ref() }
    }
}

impl<T: fmt::Debug, const N: usize> fmt::Debug for TerminalHandle<T, N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TerminalHandle")
            .field("index", &self.0.index)
            .field("terminal", &**self)
            .finish()
    }
}

/// A service paired with one local and one external terminal.
///
/// # Example
///
/// ```rust,ignore
/// use shoal::gateway::{Channel, ServiceDescription, TerminalPools};
///
/// let pools = TerminalPools::<LocalSub, DdsPub, 16>::new();
/// let service = ServiceDescription::new("radar", "front", "objects");
/// let channel = Channel::create(service, &pools, &local_opts, &dds_opts)?;
/// channel.external_terminal().forward(/* ... */);
/// ```
pub struct Channel<L, E, const N: usize> {
    service: ServiceDescription,
    local: TerminalHandle<L, N>,
    external: TerminalHandle<E, N>,
}

impl<L: Terminal, E: Terminal, const N: usize> Channel<L, E, N> {
    /// Open both terminals for `service` and pair them.
    ///
    /// Fails with [`ChannelError::ObjectPoolFull`] if either pool is full;
    /// a local terminal opened before the external pool turned out full is
    /// released again.
    pub fn create(
        service: ServiceDescription,
        pools: &TerminalPools<L, E, N>,
        local_options: &L::Options,
        external_options: &E::Options,
    ) -> Result<Self, ChannelError> {
        let service_name = service.to_string();

        let Some(local) = TerminalHandle::construct(&pools.local, || {
            L::open(&service, local_options)
        }) else {
            record_pool_exhausted("local_terminals");
            tracing::warn!(service = %service_name, "local terminal pool exhausted");
            return Err(ChannelError::ObjectPoolFull);
        };

        let Some(external) = TerminalHandle::construct(&pools.external, || {
            E::open(&service, external_options)
        }) else {
            record_pool_exhausted("external_terminals");
            tracing::warn!(service = %service_name, "external terminal pool exhausted");
            // `local` drops here and frees its cell
            return Err(ChannelError::ObjectPoolFull);
        };

        trace_channel_created(&service_name);
        record_channel_created(&service_name);

        Ok(Self {
            service,
            local,
            external,
        })
    }
}

impl<L, E, const N: usize> Channel<L, E, N> {
    /// The service this channel serves.
    pub fn service_description(&self) -> &ServiceDescription {
        &self.service
    }

    /// The local terminal.
    pub fn local_terminal(&self) -> &TerminalHandle<L, N> {
        &self.local
    }

    /// The external terminal.
    pub fn external_terminal(&self) -> &TerminalHandle<E, N> {
        &self.external
    }
}

impl<L, E, const N: usize> Clone for Channel<L, E, N> {
    fn clone(&self) -> Self {
        Self {
            service: self.service.clone(),
            local: self.local.clone(),
            external: self.external.clone(),
        }
    }
}

impl<L, E, const N: usize> PartialEq for Channel<L, E, N> {
    fn eq(&self, other: &Self) -> bool {
        self.service == other.service
            && TerminalHandle::ptr_eq(&self.local, &other.local)
            && TerminalHandle::ptr_eq(&self.external, &other.external)
    }
}

impl<L, E, const N: usize> Eq for Channel<L, E, N> {}

impl<L, E, const N: usize> fmt::Debug for Channel<L, E, N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("service", &self.service)
            .field("local_index", &self.local.pool_index())
            .field("external_index", &self.external.pool_index())
            .finish()
    }
}

//! Bounded set of channels, one per service.

use super::{Channel, ChannelError, ServiceDescription, Terminal, TerminalPools};
use crate::defaults::MAX_CHANNEL_NUMBER;
use crate::observability::{
    TracingConfig, instrument_channel, record_channel_discarded, trace_channel_discarded,
};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Registry sized for [`MAX_CHANNEL_NUMBER`] channels.
pub type DefaultChannelRegistry<L, E> = ChannelRegistry<L, E, MAX_CHANNEL_NUMBER>;

/// The channels a gateway currently serves.
///
/// Holds at most `N` channels, the capacity of its terminal pools. The mutex
/// guards only this process-local list; terminals and their pools are
/// lock-free.
pub struct ChannelRegistry<L, E, const N: usize> {
    pools: TerminalPools<L, E, N>,
    channels: Mutex<Vec<Channel<L, E, N>>>,
    tracing: TracingConfig,
}

impl<L: Terminal, E: Terminal, const N: usize> ChannelRegistry<L, E, N> {
    /// Create an empty registry allocating terminals from `pools`.
    pub fn new(pools: TerminalPools<L, E, N>) -> Self {
        Self {
            pools,
            channels: Mutex::new(Vec::with_capacity(N)),
            tracing: TracingConfig::default(),
        }
    }

    /// Set which spans channel creation and discard run in.
    pub fn with_tracing(mut self, tracing: TracingConfig) -> Self {
        self.tracing = tracing;
        self
    }

    fn span(&self, service: &ServiceDescription) -> Option<tracing::span::EnteredSpan> {
        self.tracing
            .channel_spans
            .then(|| instrument_channel(&service.to_string()))
    }

    fn channels(&self) -> MutexGuard<'_, Vec<Channel<L, E, N>>> {
        self.channels.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Return the channel for `service`, creating it if needed.
    ///
    /// Terminals are opened without holding the registry lock, so
    /// [`Terminal::open`] may call back into this registry. Two concurrent
    /// adds of the same service both open terminals; the loser's are dropped
    /// and it returns the winner's channel.
    pub fn add_channel(
        &self,
        service: &ServiceDescription,
        local_options: &L::Options,
        external_options: &E::Options,
    ) -> Result<Channel<L, E, N>, ChannelError> {
        let _span = self.span(service);
        if let Some(existing) = self.find_channel(service) {
            return Ok(existing);
        }

        let created = Channel::create(
            service.clone(),
            &self.pools,
            local_options,
            external_options,
        );

        let mut channels = self.channels();
        if let Some(existing) = channels
            .iter()
            .find(|channel| channel.service_description() == service)
        {
            let existing = existing.clone();
            drop(channels);
            // Terminals drop outside the lock
            drop(created);
            return Ok(existing);
        }

        let channel = created?;
        channels.push(channel.clone());
        Ok(channel)
    }

    /// The channel for `service`, if any.
    pub fn find_channel(&self, service: &ServiceDescription) -> Option<Channel<L, E, N>> {
        self.channels()
            .iter()
            .find(|channel| channel.service_description() == service)
            .cloned()
    }

    /// Remove the channel for `service`.
    ///
    /// Its terminals are released once no other handle to them remains.
    pub fn discard_channel(&self, service: &ServiceDescription) -> Result<(), ChannelError> {
        let _span = self.span(service);
        let removed = {
            let mut channels = self.channels();
            let position = channels
                .iter()
                .position(|channel| channel.service_description() == service)
                .ok_or(ChannelError::DoesNotExist)?;
            channels.remove(position)
        };

        let service_name = service.to_string();
        trace_channel_discarded(&service_name);
        record_channel_discarded(&service_name);
        // Terminals drop outside the lock
        drop(removed);
        Ok(())
    }

    /// Call `f` on every channel, in creation order.
    pub fn for_each_channel<F>(&self, mut f: F)
    where
        F: FnMut(&Channel<L, E, N>),
    {
        for channel in self.channels().iter() {
            f(channel);
        }
    }

    /// Number of channels.
    pub fn len(&self) -> usize {
        self.channels().len()
    }

    /// Returns true if there are no channels.
    pub fn is_empty(&self) -> bool {
        self.channels().is_empty()
    }

    /// The pools terminals are allocated from.
    pub fn pools(&self) -> &TerminalPools<L, E, N> {
        &self.pools
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, OnceLock};

    #[derive(Debug)]
    struct Named(String);

    impl Terminal for Named {
        type Options = ();

        fn open(service: &ServiceDescription, _options: &()) -> Self {
            Named(service.to_string())
        }
    }

    fn service(name: &str) -> ServiceDescription {
        ServiceDescription::new(name, "i", "e")
    }

    #[test]
    fn test_add_is_idempotent() {
        let registry = ChannelRegistry::<Named, Named, 4>::new(TerminalPools::new());

        let first = registry.add_channel(&service("a"), &(), &()).unwrap();
        let again = registry.add_channel(&service("a"), &(), &()).unwrap();

        assert_eq!(first, again);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.pools().local().size(), 1);
    }

    #[test]
    fn test_find_and_discard() {
        let registry = ChannelRegistry::<Named, Named, 4>::new(TerminalPools::new());
        registry.add_channel(&service("a"), &(), &()).unwrap();
        registry.add_channel(&service("b"), &(), &()).unwrap();

        let found = registry.find_channel(&service("b")).unwrap();
        assert_eq!(found.local_terminal().0, "b/i/e");
        assert!(registry.find_channel(&service("c")).is_none());

        registry.discard_channel(&service("a")).unwrap();
        assert_eq!(
            registry.discard_channel(&service("a")),
            Err(ChannelError::DoesNotExist)
        );
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.pools().local().size(), 1);
    }

    #[test]
    fn test_capacity_bounded_by_pools() {
        let registry = ChannelRegistry::<Named, Named, 2>::new(TerminalPools::new());
        registry.add_channel(&service("a"), &(), &()).unwrap();
        registry.add_channel(&service("b"), &(), &()).unwrap();

        assert_eq!(
            registry.add_channel(&service("c"), &(), &()).err(),
            Some(ChannelError::ObjectPoolFull)
        );
        assert_eq!(registry.len(), 2);
    }

    /// Options carrying the registry the terminal is opened for.
    type RegistryCell = Arc<OnceLock<Arc<ChannelRegistry<Inspector, Named, 4>>>>;

    /// Terminal that looks at its registry while being opened.
    #[derive(Debug)]
    struct Inspector {
        channels_seen: usize,
    }

    impl Terminal for Inspector {
        type Options = RegistryCell;

        fn open(service: &ServiceDescription, registry: &RegistryCell) -> Self {
            let registry = registry.get().expect("registry set before adding");
            assert!(registry.find_channel(service).is_none());
            Self {
                channels_seen: registry.len(),
            }
        }
    }

    #[test]
    fn test_open_may_use_registry() {
        let cell: RegistryCell = Arc::new(OnceLock::new());
        let registry = Arc::new(ChannelRegistry::<Inspector, Named, 4>::new(
            TerminalPools::new(),
        ));
        assert!(cell.set(Arc::clone(&registry)).is_ok());

        let first = registry.add_channel(&service("a"), &cell, &()).unwrap();
        let second = registry.add_channel(&service("b"), &cell, &()).unwrap();
        assert_eq!(first.local_terminal().channels_seen, 0);
        assert_eq!(second.local_terminal().channels_seen, 1);

        // Already present: no terminal is opened
        let again = registry.add_channel(&service("a"), &cell, &()).unwrap();
        assert_eq!(again, first);
        assert_eq!(registry.pools().local().size(), 2);
    }

    #[test]
    fn test_for_each_channel_in_order() {
        let registry = ChannelRegistry::<Named, Named, 4>::new(TerminalPools::new())
            .with_tracing(TracingConfig::none());
        for name in ["x", "y", "z"] {
            registry.add_channel(&service(name), &(), &()).unwrap();
        }

        let mut seen = Vec::new();
        registry.for_each_channel(|channel| seen.push(channel.service_description().service().to_string()));
        assert_eq!(seen, vec!["x", "y", "z"]);
        assert!(!registry.is_empty());
    }
}

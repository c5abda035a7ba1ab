//! Service identity used to key channels.

use std::fmt;

/// Identifies a service by service, instance and event name.
///
/// Channels treat it as an opaque key; ordering and hashing follow the three
/// fields in declaration order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ServiceDescription {
    service: String,
    instance: String,
    event: String,
}

impl ServiceDescription {
    /// Create a service description.
    pub fn new(
        service: impl Into<String>,
        instance: impl Into<String>,
        event: impl Into<String>,
    ) -> Self {
        Self {
            service: service.into(),
            instance: instance.into(),
            event: event.into(),
        }
    }

    /// The service name.
    pub fn service(&self) -> &str {
        &self.service
    }

    /// The instance name.
    pub fn instance(&self) -> &str {
        &self.instance
    }

    /// The event name.
    pub fn event(&self) -> &str {
        &self.event
    }
}

impl fmt::Display for ServiceDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.service, self.instance, self.event)
    }
}

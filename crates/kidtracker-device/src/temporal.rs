use std::time::{Duration, Instant};

/// A value stamped with the moment it was created.
///
/// Used for everything that expires: welcome jobs waiting for an offline
/// watch and commands waiting for token confirmation.
#[derive(Debug, Clone)]
pub struct Temporal<T> {
    value: T,
    created: Instant,
}

impl<T> Temporal<T> {
    pub fn new(value: T) -> Self {
        Self::with_created(value, Instant::now())
    }

    pub fn with_created(value: T, created: Instant) -> Self {
        Self { value, created }
    }

    pub fn value(&self) -> &T {
        &self.value
    }

    pub fn into_value(self) -> T {
        self.value
    }

    pub fn age(&self) -> Duration {
        self.created.elapsed()
    }

    /// Expired once strictly more than `ttl` has passed since creation.
    pub fn is_expired(&self, ttl: Duration) -> bool {
        self.age() > ttl
    }
}

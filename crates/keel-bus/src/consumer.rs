//! # Consumers
//!
//! Subscribers are identified by the [`ConsumerRef`] they were registered
//! with: subscribing the same `Arc` twice is the same consumer, two `Arc`s
//! wrapping equal closures are not.

use std::fmt;
use std::sync::Arc;

/// A subscriber callback.
///
/// Returning `Err` (or panicking) is reported to the bus's exception sink;
/// the consumer stays subscribed.
pub trait Consumer<M>: Send + Sync {
    fn accept(&self, message: &M) -> anyhow::Result<()>;

    /// Name used in failure reports.
    fn label(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

impl<M, F> Consumer<M> for F
where
    F: Fn(&M) -> anyhow::Result<()> + Send + Sync,
{
    fn accept(&self, message: &M) -> anyhow::Result<()> {
        self(message)
    }
}

/// Shared handle to a consumer; identity is the allocation.
pub type ConsumerRef<M> = Arc<dyn Consumer<M>>;

/// Wrap a closure as a [`ConsumerRef`].
pub fn consumer<M, F>(f: F) -> ConsumerRef<M>
where
    M: 'static,
    F: Fn(&M) -> anyhow::Result<()> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Wrap a closure as a [`ConsumerRef`] reported under `label`.
pub fn named<M, F>(label: impl Into<String>, f: F) -> ConsumerRef<M>
where
    M: 'static,
    F: Fn(&M) -> anyhow::Result<()> + Send + Sync + 'static,
{
    Arc::new(Named {
        label: label.into(),
        f,
    })
}

struct Named<F> {
    label: String,
    f: F,
}

impl<M, F> Consumer<M> for Named<F>
where
    F: Fn(&M) -> anyhow::Result<()> + Send + Sync,
{
    fn accept(&self, message: &M) -> anyhow::Result<()> {
        (self.f)(message)
    }

    fn label(&self) -> &str {
        &self.label
    }
}

impl<F> fmt::Debug for Named<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Named").field("label", &self.label).finish()
    }
}

/// Whether two handles refer to the same consumer.
#[must_use]
pub fn same_consumer<M: ?Sized, N: ?Sized>(a: &Arc<M>, b: &Arc<N>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

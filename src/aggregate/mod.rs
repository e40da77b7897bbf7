//! Aggregate module
//!
//! Aggregate Root pattern for event sourcing: state is a pure fold over
//! the event history, commands are validated against that state.

pub mod account;

pub use account::{Account, AccountStatus};

/// Aggregate trait that all aggregates must implement
pub trait Aggregate: Sized + Default {
    /// The type of events this aggregate handles
    type Event;

    /// Get the aggregate type name (for storage)
    fn aggregate_type() -> &'static str;

    /// Get the aggregate ID
    fn id(&self) -> uuid::Uuid;

    /// Get the current version (number of events applied)
    fn version(&self) -> i64;

    /// Apply an event to update the aggregate state
    fn apply(self, event: Self::Event) -> Self;
}

/// Reconstitute an aggregate by folding its event history in version
/// order. Returns `None` for an empty history: the aggregate does not
/// exist until its first event.
pub fn load_from_history<A, I>(events: I) -> Option<A>
where
    A: Aggregate,
    I: IntoIterator<Item = A::Event>,
{
    let mut state: Option<A> = None;
    for event in events {
        state = Some(state.unwrap_or_default().apply(event));
    }
    state
}

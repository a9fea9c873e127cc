// Adapters layer: concrete implementations of the domain ports (document store, notification delivery).

pub mod memory_store;
pub mod notifier;

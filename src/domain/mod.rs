// Domain layer: core models and ports (interfaces). Concrete stores and notifiers live in adapters.

pub mod model;
pub mod ports;

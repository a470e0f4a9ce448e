// ABOUTME: Component runtime view merging backend containers with the component's commands

pub mod view;

pub use view::{ComponentRuntimeView, RuntimeError};

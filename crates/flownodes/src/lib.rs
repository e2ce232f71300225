//! Standard action library
//!
//! Collection of built-in action runners for common operations

mod debug;
mod script;
mod time;
mod transform;

pub use debug::DebugRunner;
pub use script::ScriptRunner;
pub use time::DelayRunner;
pub use transform::{JsonParseRunner, JsonStringifyRunner};
use flowruntime::ActionRegistry;

use std::sync::Arc;

/// Register all standard runners with a registry
pub fn register_all(registry: &mut ActionRegistry) {
    registry.register("script", Arc::new(ScriptRunner));
    registry.register("debug.log", Arc::new(DebugRunner));
    registry.register("time.delay", Arc::new(DelayRunner));
    registry.register("transform.json_parse", Arc::new(JsonParseRunner));
    registry.register("transform.json_stringify", Arc::new(JsonStringifyRunner));
}

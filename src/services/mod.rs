//! Services - decision logic and workers
//!
//! - `classifier` - Matches detected faces against the roster
//! - `cooldown` - Per-identity unlock and global deny cooldown registry
//! - `decision` - Per-camera vote buffer and cooldown gate
//! - `stream` - Per-camera worker driving a decision engine
//! - `command_worker` - Async access command publisher
//! - `actuator` - Lock state machine and feedback for the actuator process

pub mod actuator;
pub mod classifier;
pub mod command_worker;
pub mod cooldown;
pub mod decision;
pub mod stream;

// Re-export commonly used types
pub use classifier::MatchClassifier;
pub use command_worker::{create_command_worker, CommandSender, CommandWorker};
pub use cooldown::{CooldownRegistry, SharedCooldownRegistry};
pub use decision::{DecisionEngine, DecisionPolicy};
pub use stream::{create_stream_worker, StreamControl, StreamHandle, StreamWorker};

//! Domain models - core access decision types and wire payloads
//!
//! This module contains the canonical data types used throughout the system:
//! - `types` - identities, match candidates, classified frames, access commands
//! - `payload` - flat JSON payloads carried on the motion/access/status/frame topics

pub mod payload;
pub mod types;

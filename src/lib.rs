//! Jarvis - voice and vision companion for a PiCar robot
//!
//! This library provides the pieces the `jarvis` binary wires together:
//! - Voice processing (wake word, VAD capture, STT, TTS, playback)
//! - Streaming dialogue with a chat model, including actions and memory
//! - Movement actions, safety modes and remote control
//! - Autonomous exploration with camera novelty detection
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                    Coordinator                       │
//! │  session modes │ failure counter │ remote control    │
//! └───────┬──────────────┬──────────────────┬───────────┘
//!         │              │                  │
//! ┌───────▼──────┐ ┌─────▼──────┐ ┌─────────▼──────────┐
//! │    Voice     │ │  Dialogue  │ │ Actions/Exploration │
//! │ wake/VAD/STT │ │ LLM/memory │ │  hardware/vision    │
//! │   TTS/cues   │ │  protocol  │ │       LED           │
//! └──────────────┘ └────────────┘ └────────────────────┘
//! ```

pub mod actions;
pub mod config;
pub mod coordinator;
pub mod dialogue;
pub mod error;
pub mod exploration;
pub mod hardware;
pub mod led;
pub mod memory;
pub mod persona;
pub mod session;
pub mod shutdown;
pub mod vision;
pub mod voice;

pub use actions::{Action, Dispatcher};
pub use config::Config;
pub use coordinator::{Coordinator, Exit, Hardware, Parts, Vision};
pub use dialogue::{DialogueEngine, ParsedResponse, Turn};
pub use error::{Error, Result};
pub use memory::MemoryStore;
pub use persona::{Persona, SystemEvent};
pub use session::{Mode, RobotSession};

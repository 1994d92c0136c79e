pub mod crossfade;
pub mod deck;
pub mod decoder;
pub mod engine;
pub mod mixer;
pub mod output;

pub use crossfade::DeckId;
pub use engine::{AnnouncementOptions, AnnouncementOutcome, DeckEngine, EngineEvent};
pub use output::{AudioOutput, CpalOutput, DeckSnapshot};

//! Research backends for Gapwise gap filling.
//!
//! - [`WebDocsBackend`]: free tier; web search + documentation page extraction
//! - [`CompletionResearchBackend`]: premium tier; asks a completion model
//! - [`ResearchRouter`]: priority-aware backend order with retry and fallback

pub mod completion;
pub mod extract;
pub mod fetch;
pub mod router;
pub mod web;

pub use completion::{COMPLETION_BACKEND_NAME, CompletionResearchBackend};
pub use router::{ResearchRouter, RoutedResearch};
pub use web::{WEB_BACKEND_NAME, WebDocsBackend};

//! quill drives a story from a one-paragraph premise to a full manuscript.
//!
//! A run plans the story, outlines its chapters, then loops over them:
//! draft, review against a quality gate, rewrite with feedback when the gate
//! rejects, edit, and commit. A bounded narrative context carries what the
//! next chapter needs to know.

pub mod audit;
pub mod backend;
pub mod config;
pub mod context;
pub mod errors;
pub mod gate;
pub mod model;
pub mod orchestrator;
pub mod stages;

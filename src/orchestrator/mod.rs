pub mod events;
pub mod result;
pub mod runner;
pub mod state;

pub use events::{ChannelSink, EventLevel, EventSink, FanoutSink, NullSink, RunEvent, TracingSink};
pub use result::{CommittedChapter, RunResult, RunStatistics, RunStatus, StageStats};
pub use runner::{ChapterLoop, DEFAULT_TARGET_WORDS, LoopConfig};
pub use state::{ChapterPhase, ProgressSnapshot, RunPhase};

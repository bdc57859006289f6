//! Host audio surfaces: the playback element and the analysis graph.
//!
//! The host (browser bridge, native shell, test harness) implements these
//! traits. Every method takes `&self` so an element can be shared between the
//! reconciler, the analyzer and the delayed-stop probe.

use crate::error::Result;
use std::fmt;
use std::sync::Arc;

/// Stable identity of a media element or inbound track.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MediaId(pub String);

impl fmt::Display for MediaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MediaId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

/// How much media data the element holds, mirroring HTML `readyState`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ReadyState {
    HaveNothing = 0,
    HaveMetadata = 1,
    HaveCurrentData = 2,
    HaveFutureData = 3,
    HaveEnoughData = 4,
}

impl ReadyState {
    /// Whether the element holds data for the current playback position.
    #[must_use]
    pub fn has_data(self) -> bool {
        self >= Self::HaveCurrentData
    }
}

/// The element that physically plays assistant audio.
pub trait MediaElement: Send + Sync + 'static {
    fn id(&self) -> MediaId;
    fn paused(&self) -> bool;
    /// Playback position in seconds.
    fn current_time(&self) -> f64;
    fn ready_state(&self) -> ReadyState;
    fn set_muted(&self, muted: bool);
    fn pause(&self);
    /// Drop any audio queued for playback.
    fn clear_queue(&self);
}

/// Shared media element handle.
pub type SharedMedia = Arc<dyn MediaElement>;

/// An analysis node attached to a source; yields time-domain samples.
pub trait AudioTap: Send + Sync + 'static {
    /// Fill `buf` with the most recent samples in `[-1, 1]` and return the
    /// number written.
    fn read_time_domain(&self, buf: &mut [f32]) -> usize;
}

/// Host audio graph able to attach analysis nodes to media.
///
/// Platforms forbid attaching two source nodes to the same element, so
/// callers go through [`SourceNodeCache`](crate::analyzer::SourceNodeCache).
pub trait AudioGraph: Send + Sync + 'static {
    /// Create the source + analysis node for `media`.
    ///
    /// # Errors
    ///
    /// Returns [`VoxError::Analyzer`](crate::error::VoxError::Analyzer) when
    /// the graph cannot be built.
    fn create_source(&self, media: &MediaId) -> Result<Arc<dyn AudioTap>>;
}

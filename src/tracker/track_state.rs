use std::fmt;

use serde::{Deserialize, Serialize};

/// Tracking session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TrackState {
    /// Full-frame re-detection with no prior location
    #[default]
    Search,
    /// Incremental tracking of a confirmed location
    Track,
    /// Local re-detection around the last known location
    Lost,
    /// Full-frame re-detection that keeps session continuity
    Reacquire,
}

impl TrackState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Search => "SEARCH",
            Self::Track => "TRACK",
            Self::Lost => "LOST",
            Self::Reacquire => "REACQUIRE",
        }
    }

    /// Coarse health classification for the presentation layer.
    pub fn health(&self) -> Health {
        match self {
            Self::Track => Health::Tracking,
            Self::Search => Health::Searching,
            Self::Lost | Self::Reacquire => Health::Degraded,
        }
    }
}

impl fmt::Display for TrackState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a consumer needs to render without inferring from missing updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Health {
    Tracking,
    Searching,
    Degraded,
}

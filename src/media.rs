//! Lightweight media stream and track handles
//!
//! These are identifiers the session hands to the transport; the transport
//! owns the actual media machinery.

use uuid::Uuid;

/// Kind of a media track
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    /// Audio track
    Audio,
    /// Video track
    Video,
}

/// Handle for a single media track
#[derive(Debug, Clone)]
pub struct MediaTrack {
    /// Unique track identifier
    pub id: String,

    /// Track kind
    pub kind: TrackKind,
}

impl MediaTrack {
    /// Create a track handle with a fresh id
    pub fn new(kind: TrackKind) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
        }
    }
}

/// Handle for a group of tracks sharing one stream id
#[derive(Debug, Clone)]
pub struct MediaStream {
    /// Unique stream identifier
    pub id: String,

    /// Tracks belonging to this stream
    pub tracks: Vec<MediaTrack>,
}

impl MediaStream {
    /// Create an empty stream with a fresh id
    pub fn new() -> Self {
        Self::with_id(Uuid::new_v4().to_string())
    }

    /// Create an empty stream with a known id
    pub fn with_id(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            tracks: Vec::new(),
        }
    }

    /// Add a track to this stream
    pub fn add_track(&mut self, track: MediaTrack) {
        self.tracks.push(track);
    }
}

impl Default for MediaStream {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_ids_are_unique() {
        let a = MediaTrack::new(TrackKind::Audio);
        let b = MediaTrack::new(TrackKind::Audio);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_stream_collects_tracks() {
        let mut stream = MediaStream::new();
        stream.add_track(MediaTrack::new(TrackKind::Audio));
        stream.add_track(MediaTrack::new(TrackKind::Video));
        assert_eq!(stream.tracks.len(), 2);
    }
}

use serde::{Deserialize, Serialize};

/// The five indices an identity may hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum StreamType {
    /// Everything relevant to the identity
    Feed,
    /// Activities posted by connections
    Connection,
    /// Activities of spaces the identity is a member of
    MySpaces,
    /// A space's own stream
    SpaceStream,
    /// Activities the identity posted or took part in
    MyActivities,
}

impl StreamType {
    pub const ALL: [StreamType; 5] = [
        StreamType::Feed,
        StreamType::Connection,
        StreamType::MySpaces,
        StreamType::SpaceStream,
        StreamType::MyActivities,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StreamType::Feed => "feed",
            StreamType::Connection => "connection",
            StreamType::MySpaces => "my_spaces",
            StreamType::SpaceStream => "space_stream",
            StreamType::MyActivities => "my_activities",
        }
    }

    /// Index into per-identity slot tables.
    pub(crate) fn ordinal(&self) -> usize {
        match self {
            StreamType::Feed => 0,
            StreamType::Connection => 1,
            StreamType::MySpaces => 2,
            StreamType::SpaceStream => 3,
            StreamType::MyActivities => 4,
        }
    }

    /// Streams on which a reader purges activities of spaces it left.
    pub fn checks_space_membership(&self) -> bool {
        matches!(self, StreamType::Feed | StreamType::Connection)
    }
}

impl std::fmt::Display for StreamType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

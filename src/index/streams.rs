//! Per-identity bundle of stream indices and the stream-type dispatch table.

use super::stream_index::StreamIndex;
use crate::model::StreamType;

/// All indices of one identity. Each one is created on first write.
#[derive(Debug, Clone, Default)]
pub struct IdentityStreams {
    feed: Option<StreamIndex>,
    connections: Option<StreamIndex>,
    my_spaces: Option<StreamIndex>,
    space: Option<StreamIndex>,
    owner: Option<StreamIndex>,
    /// Timestamp of the newest activity received through a connection
    pub latest_activity_time: Option<i64>,
}

/// Selector/creator pair for one stream type.
struct StreamSlot {
    select: fn(&IdentityStreams) -> Option<&StreamIndex>,
    select_mut: fn(&mut IdentityStreams) -> Option<&mut StreamIndex>,
    create: fn(&mut IdentityStreams) -> &mut StreamIndex,
}

macro_rules! slot {
    ($field:ident) => {{
        fn select(s: &IdentityStreams) -> Option<&StreamIndex> {
            s.$field.as_ref()
        }
        fn select_mut(s: &mut IdentityStreams) -> Option<&mut StreamIndex> {
            s.$field.as_mut()
        }
        fn create(s: &mut IdentityStreams) -> &mut StreamIndex {
            s.$field.get_or_insert_with(StreamIndex::new)
        }
        StreamSlot {
            select,
            select_mut,
            create,
        }
    }};
}

/// Indexed by `StreamType::ordinal`.
const SLOTS: [StreamSlot; 5] = [
    slot!(feed),
    slot!(connections),
    slot!(my_spaces),
    slot!(space),
    slot!(owner),
];

impl IdentityStreams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, stream: StreamType) -> Option<&StreamIndex> {
        (SLOTS[stream.ordinal()].select)(self)
    }

    pub fn get_mut(&mut self, stream: StreamType) -> Option<&mut StreamIndex> {
        (SLOTS[stream.ordinal()].select_mut)(self)
    }

    pub fn get_or_create(&mut self, stream: StreamType) -> &mut StreamIndex {
        (SLOTS[stream.ordinal()].create)(self)
    }

    /// Existing indices with their type.
    pub fn iter(&self) -> impl Iterator<Item = (StreamType, &StreamIndex)> + '_ {
        StreamType::ALL
            .into_iter()
            .filter_map(move |t| self.get(t).map(|index| (t, index)))
    }
}

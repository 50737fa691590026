use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use tracing::info;

use taskgate_provider_core::{ChannelContext, RegisteredChannel, TaskAdaptor};

use crate::provider::ChannelAdaptor;

/// Channel id to bound adaptor. Readers take a lock-free snapshot; a reload
/// swaps the whole map.
#[derive(Debug)]
pub struct AdaptorRegistry {
    channels: ArcSwap<HashMap<i64, RegisteredChannel>>,
}

impl Default for AdaptorRegistry {
    fn default() -> Self {
        Self {
            channels: ArcSwap::from_pointee(HashMap::new()),
        }
    }
}

impl AdaptorRegistry {
    pub fn from_channels(channels: impl IntoIterator<Item = ChannelContext>) -> Self {
        let registry = Self::default();
        registry.apply_channels(channels);
        registry
    }

    /// Replace the snapshot. A later entry with a repeated id wins.
    pub fn apply_channels(&self, channels: impl IntoIterator<Item = ChannelContext>) {
        let mut map = HashMap::new();
        for channel in channels {
            let adaptor = ChannelAdaptor::for_channel(&channel);
            info!(
                event = "channel_registered",
                channel_id = channel.channel_id,
                provider = %adaptor.channel_name(),
                name = %channel.name
            );
            map.insert(
                channel.channel_id,
                RegisteredChannel {
                    context: Arc::new(channel),
                    adaptor: Arc::new(adaptor),
                },
            );
        }
        self.channels.store(Arc::new(map));
    }

    pub fn get(&self, channel_id: i64) -> Option<RegisteredChannel> {
        self.channels.load().get(&channel_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.channels.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.load().is_empty()
    }

    pub fn channel_ids(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.channels.load().keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

//! Searcher that replays a fixed list of announcements.
//!
//! Used by the daemon for devices listed in the config file, and anywhere a
//! network searcher is not available.

use anyhow::Result;
use async_trait::async_trait;
use devgate::discovery::{QueryKind, Searcher, ServiceAnnouncement};
use futures::stream::BoxStream;

/// Service type answered to root-device queries
pub const ROOT_DEVICE_TYPE: &str = "upnp:rootdevice";

pub struct StaticSearcher {
    announcements: Vec<ServiceAnnouncement>,
}

impl StaticSearcher {
    pub fn new(announcements: Vec<ServiceAnnouncement>) -> Self {
        Self { announcements }
    }

    pub fn len(&self) -> usize {
        self.announcements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.announcements.is_empty()
    }
}

#[async_trait]
impl Searcher for StaticSearcher {
    async fn start_discovery(
        &self,
        query: QueryKind,
    ) -> Result<BoxStream<'static, ServiceAnnouncement>> {
        let replies: Vec<ServiceAnnouncement> = match query {
            QueryKind::All => self.announcements.clone(),
            QueryKind::RootDevices => self
                .announcements
                .iter()
                .filter(|a| a.service_type == ROOT_DEVICE_TYPE)
                .cloned()
                .collect(),
        };
        Ok(Box::pin(tokio_stream::iter(replies)))
    }
}

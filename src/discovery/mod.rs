//! Discovery dispatch: routes service announcements to the single
//! highest-priority family that claims them.

mod registry;

pub use registry::{DiscoveryConfig, DiscoveryRegistry, SearchOutcome};

use crate::worker::QueueSender;
use anyhow::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::fmt;

/// One service advertised by a device on the network.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceAnnouncement {
    pub serial_number: String,
    pub service_type: String,
    /// Description URL of the service
    pub location: String,
    /// Address the announcement came from
    pub remote_address: String,
}

/// Scope of a discovery query.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum QueryKind {
    /// Root devices only; some families answer nothing else
    RootDevices,
    All,
}

impl QueryKind {
    /// Search target sent on the wire for this query.
    pub fn search_target(self) -> &'static str {
        match self {
            QueryKind::RootDevices => "upnp:rootdevice",
            QueryKind::All => "ssdp:all",
        }
    }
}

impl fmt::Display for QueryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.search_target())
    }
}

/// Lower-level discovery primitive: send a query, receive announcements.
///
/// Dropping the returned stream stops the query.
#[async_trait]
pub trait Searcher: Send + Sync {
    async fn start_discovery(
        &self,
        query: QueryKind,
    ) -> Result<BoxStream<'static, ServiceAnnouncement>>;
}

/// Queue-like consumer of claimed announcements. Must not block.
pub trait AnnouncementSink: Send + Sync {
    fn accept(&self, announcement: ServiceAnnouncement);
}

impl AnnouncementSink for QueueSender<ServiceAnnouncement> {
    fn accept(&self, announcement: ServiceAnnouncement) {
        QueueSender::accept(self, announcement);
    }
}

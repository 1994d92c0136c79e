pub mod announcer;
pub mod client;
pub mod remote;

pub use announcer::{AnnouncementAsset, AnnouncementGateway, AnnouncementKind, AnnouncementRequest, HttpAnnouncer};
pub use client::{CommandFeed, FeedMessage};
pub use remote::{Command, CommandAction, CommandIntake};

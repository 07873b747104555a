//! Repository layer for data access

pub mod campaigns;
pub mod jobs;
pub mod notifications;

pub use campaigns::{CampaignRepository, DbCampaignRepository, InMemoryCampaignRepository};
pub use jobs::{DbJobRepository, InMemoryJobRepository, JobRepository};
pub use notifications::{
    DbNotificationRepository, InMemoryNotificationRepository, NotificationRepository,
};

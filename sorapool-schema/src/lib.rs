pub mod broker;
pub mod sora;

pub use broker::{
    BrokerEnvelope, BrokerErrorBody, GroupItem, OpenData, OpenedProfileItem, PagedData,
    ProfileListItem, code,
};
pub use sora::{
    CreateVideoRequest, DraftItem, DraftsPage, NfCheckPayload, RateLimitAndCreditBalance,
    SessionPayload, SessionUser, SubscriptionPayload, SubscriptionPlan,
};

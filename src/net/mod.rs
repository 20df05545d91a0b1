//! Peer-facing networking: host normalization, bounded fan-out, and
//! inbound rate limiting

pub mod fanout;
pub mod host;
pub mod ratelimit;

pub use fanout::{
    Broadcast, BroadcastBody, Delivery, DeliveryResult, Method, NetEvent, Network, PeerResolver,
};
pub use host::normalize_host;
pub use ratelimit::{AbuseReport, LimitKind, RateDecision, RateLimitConfig, RateLimiter};

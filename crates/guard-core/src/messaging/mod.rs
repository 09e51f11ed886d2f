//! Outbound Bot API surface used by moderation (delete, admin lookup) and by the error
//! reporter (plain-text report chunks).

pub mod port;
pub mod throttled;

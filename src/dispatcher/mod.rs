//! Event routing between the push channel and in-process consumers.

mod event;
mod registry;

pub use event::{names, Event, FrameError};
pub use registry::{
    DispatchReport, DispatcherStats, DispatcherStatsSnapshot, EventDispatcher, EventHandler,
    HandlerResult, Subscription, SubscriptionId,
};

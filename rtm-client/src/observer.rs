//! Observer capabilities supplied by the application.
//!
//! Every method has a no-op default, so observers implement only what they
//! care about. All callbacks run on the client's event-loop task: do not
//! block in them for long, and do not call back into synchronous client
//! wrappers from them.

use rtm_core::types::{ErrorBody, SubscriptionData};

/// State-change callbacks for the client supervisor.
pub trait ClientObserver: Send {
    fn on_enter_stopped(&mut self) {}
    fn on_leave_stopped(&mut self) {}
    fn on_enter_connecting(&mut self) {}
    fn on_leave_connecting(&mut self) {}
    fn on_enter_connected(&mut self) {}
    fn on_leave_connected(&mut self) {}
    fn on_enter_awaiting(&mut self) {}
    fn on_leave_awaiting(&mut self) {}
    fn on_enter_stopping(&mut self) {}
    fn on_leave_stopping(&mut self) {}

    /// Terminal; no callback ever follows it.
    fn on_enter_disposed(&mut self) {}

    /// The server fast-forwarded a subscription past dropped messages.
    fn on_fast_forward(&mut self, _channel: &str) {}

    /// A failure with no more specific callback to land on.
    fn on_internal_error(&mut self, _payload: &str) {}
}

/// Per-subscription callbacks.
///
/// `on_subscription_data` is how applications actually see messages; the
/// rest report the subscription's lifecycle.
pub trait SubscriptionObserver: Send {
    fn on_created(&mut self) {}
    fn on_deleted(&mut self) {}

    fn on_enter_unsubscribed(&mut self) {}
    fn on_leave_unsubscribed(&mut self) {}
    fn on_enter_subscribing(&mut self) {}
    fn on_leave_subscribing(&mut self) {}
    fn on_enter_subscribed(&mut self) {}
    fn on_leave_subscribed(&mut self) {}
    fn on_enter_unsubscribing(&mut self) {}
    fn on_leave_unsubscribing(&mut self) {}
    fn on_enter_failed(&mut self, _reason: &str) {}
    fn on_leave_failed(&mut self) {}

    fn on_subscription_data(&mut self, _data: &SubscriptionData) {}
    fn on_subscription_error(&mut self, _error: &ErrorBody) {}
}

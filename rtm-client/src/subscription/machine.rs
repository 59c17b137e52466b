//! The per-channel subscription transition table.
//!
//! Expressed as a pure function over `(state, event, guards)` so the table
//! can be unit-tested without any I/O. The driver in the parent module owns
//! the mutable pieces (position, observers, retarget slot) and applies the
//! returned effects.

/// Lifecycle states of one subscription.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum State {
    Unsubscribed,
    Subscribing,
    Subscribed,
    Unsubscribing,
    /// Terminal until the user re-subscribes or unsubscribes.
    Failed,
    /// The subscription no longer exists; the client drops it.
    Deleted,
}

/// What the user currently wants from this subscription.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Intent {
    /// Keep it subscribed
    Linked,
    /// Tear down and re-establish with the latched retarget slot
    Cycle,
    /// Tear down for good
    Unlinked,
}

/// Inputs that drive the machine.
#[derive(Clone, Debug)]
pub enum Event {
    Connect,
    Disconnect,
    /// The user changed the intent; re-evaluate.
    ModeChange,
    SubscribeOk { position: Option<String> },
    SubscribeError { reason: String },
    UnsubscribeOk,
    UnsubscribeError,
    ChannelError { error: String, reason: Option<String> },
}

/// Guard conditions sampled at transition time.
#[derive(Copy, Clone, Debug)]
pub struct Guards {
    pub connected: bool,
    pub intent: Intent,
    /// The delivery mode tracks position without requesting fast-forward,
    /// so `out_of_sync` cannot be recovered by re-subscribing.
    pub fatal_on_out_of_sync: bool,
}

/// Side effects the driver must apply, in order, before entering the next
/// state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Effect {
    SendSubscribe,
    SendUnsubscribe,
    UpdatePosition(String),
    ClearPosition,
    LatchError(String),
    /// Swap the retarget slot in: old observer is deleted, the latched one
    /// created, intent returns to Linked.
    CompleteCycle,
    /// Drop a pending cycle without executing it (unsubscribe was refused).
    AbandonCycle,
    /// Final teardown notification for the current observer.
    FireDeleted,
}

/// One transition: target state, effects, and whether the driver should
/// immediately re-evaluate the intent (a deferred `ModeChange`).
#[derive(Clone, Debug)]
pub struct Step {
    pub next: State,
    pub effects: Vec<Effect>,
    pub revisit: bool,
}

impl Step {
    fn stay(state: State) -> Self {
        Self { next: state, effects: Vec::new(), revisit: false }
    }

    fn to(next: State, effects: Vec<Effect>) -> Self {
        Self { next, effects, revisit: false }
    }

    fn revisit(next: State, effects: Vec<Effect>) -> Self {
        Self { next, effects, revisit: true }
    }
}

const OUT_OF_SYNC: &str = "out_of_sync";

pub fn step(state: State, event: &Event, g: Guards) -> Step {
    use State::*;

    if state == Deleted {
        return Step::stay(state);
    }

    match (state, event) {
        // A disconnect silently resets the lifecycle; no unsubscribe is
        // sent. The revisit settles unlinked/cycle intents immediately and
        // resubscription happens on the next Connect.
        (Unsubscribed, Event::Disconnect) => Step::stay(Unsubscribed),
        (_, Event::Disconnect) => Step::revisit(Unsubscribed, Vec::new()),

        (Unsubscribed, Event::Connect | Event::ModeChange) => settle(g),

        (Subscribing, Event::SubscribeOk { position }) => {
            let effects = match position {
                Some(p) => vec![Effect::UpdatePosition(p.clone())],
                None => Vec::new(),
            };
            Step { next: Subscribed, effects, revisit: true }
        }
        (Subscribing, Event::SubscribeError { reason }) => {
            Step::to(Failed, vec![Effect::LatchError(reason.clone())])
        }
        (Subscribing | Unsubscribing, Event::ChannelError { error, reason }) => {
            // an in-flight request will still be acknowledged; only a fatal
            // error moves the machine
            if g.fatal_on_out_of_sync && error == OUT_OF_SYNC {
                Step::to(Failed, fatal_effects(error, reason))
            } else {
                Step::to(state, retire_position(error))
            }
        }

        (Subscribed, Event::ModeChange) if g.intent != Intent::Linked => {
            Step::to(Unsubscribing, vec![Effect::SendUnsubscribe])
        }
        (Subscribed, Event::ChannelError { error, reason }) => {
            if g.fatal_on_out_of_sync && error == OUT_OF_SYNC {
                Step::to(Failed, fatal_effects(error, reason))
            } else {
                let mut effects = retire_position(error);
                effects.push(Effect::SendSubscribe);
                Step::to(Subscribing, effects)
            }
        }

        (Unsubscribing, Event::UnsubscribeOk) => Step::revisit(Unsubscribed, Vec::new()),
        // The server refused to let go; stay subscribed and drop any
        // pending cycle rather than retrying on our own.
        (Unsubscribing, Event::UnsubscribeError) => {
            Step::to(Subscribed, vec![Effect::AbandonCycle])
        }

        (Failed, Event::ModeChange) => match g.intent {
            Intent::Linked => Step::stay(Failed),
            Intent::Unlinked => Step::to(Deleted, vec![Effect::FireDeleted]),
            Intent::Cycle => {
                if g.connected {
                    Step::to(Subscribing, vec![Effect::CompleteCycle, Effect::SendSubscribe])
                } else {
                    Step::to(Unsubscribed, vec![Effect::CompleteCycle])
                }
            }
        },

        _ => Step::stay(state),
    }
}

/// Evaluate the intent from Unsubscribed.
fn settle(g: Guards) -> Step {
    use State::*;
    match g.intent {
        Intent::Unlinked => Step::to(Deleted, vec![Effect::FireDeleted]),
        Intent::Cycle => {
            if g.connected {
                Step::to(Subscribing, vec![Effect::CompleteCycle, Effect::SendSubscribe])
            } else {
                Step::to(Unsubscribed, vec![Effect::CompleteCycle])
            }
        }
        Intent::Linked => {
            if g.connected {
                Step::to(Subscribing, vec![Effect::SendSubscribe])
            } else {
                Step::stay(Unsubscribed)
            }
        }
    }
}

fn retire_position(error: &str) -> Vec<Effect> {
    if error == OUT_OF_SYNC {
        vec![Effect::ClearPosition]
    } else {
        Vec::new()
    }
}

fn fatal_effects(error: &str, reason: &Option<String>) -> Vec<Effect> {
    let mut effects = retire_position(error);
    let described = match reason {
        Some(reason) => format!("{error}: {reason}"),
        None => error.to_string(),
    };
    effects.push(Effect::LatchError(described));
    effects
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guards(connected: bool, intent: Intent) -> Guards {
        Guards { connected, intent, fatal_on_out_of_sync: false }
    }

    fn advanced(connected: bool, intent: Intent) -> Guards {
        Guards { connected, intent, fatal_on_out_of_sync: true }
    }

    fn channel_error(error: &str) -> Event {
        Event::ChannelError { error: error.to_string(), reason: None }
    }

    #[test]
    fn connects_subscribe_when_linked() {
        let s = step(State::Unsubscribed, &Event::Connect, guards(true, Intent::Linked));
        assert_eq!(s.next, State::Subscribing);
        assert_eq!(s.effects, vec![Effect::SendSubscribe]);

        // not connected: nothing to do yet
        let s = step(State::Unsubscribed, &Event::ModeChange, guards(false, Intent::Linked));
        assert_eq!(s.next, State::Unsubscribed);
        assert!(s.effects.is_empty());
    }

    #[test]
    fn subscribe_ok_updates_position_and_revisits_intent() {
        let ev = Event::SubscribeOk { position: Some("1:2".to_string()) };
        let s = step(State::Subscribing, &ev, guards(true, Intent::Linked));
        assert_eq!(s.next, State::Subscribed);
        assert_eq!(s.effects, vec![Effect::UpdatePosition("1:2".to_string())]);
        assert!(s.revisit);
    }

    #[test]
    fn subscribe_error_latches_and_fails() {
        let ev = Event::SubscribeError { reason: "invalid_format".to_string() };
        let s = step(State::Subscribing, &ev, guards(true, Intent::Linked));
        assert_eq!(s.next, State::Failed);
        assert_eq!(s.effects, vec![Effect::LatchError("invalid_format".to_string())]);
    }

    #[test]
    fn recoverable_channel_error_resubscribes() {
        let s = step(State::Subscribed, &channel_error("expired"), guards(true, Intent::Linked));
        assert_eq!(s.next, State::Subscribing);
        assert_eq!(s.effects, vec![Effect::SendSubscribe]);
    }

    #[test]
    fn out_of_sync_is_recoverable_with_fast_forward() {
        // Reliable mode: fast-forward requested, so out_of_sync resubscribes
        // but the stale position is retired first
        let s = step(State::Subscribed, &channel_error("out_of_sync"), guards(true, Intent::Linked));
        assert_eq!(s.next, State::Subscribing);
        assert_eq!(s.effects, vec![Effect::ClearPosition, Effect::SendSubscribe]);
    }

    #[test]
    fn out_of_sync_is_fatal_without_fast_forward() {
        let s =
            step(State::Subscribed, &channel_error("out_of_sync"), advanced(true, Intent::Linked));
        assert_eq!(s.next, State::Failed);
        assert_eq!(
            s.effects,
            vec![Effect::ClearPosition, Effect::LatchError("out_of_sync".to_string())]
        );

        // other errors remain recoverable even in Advanced mode
        let s = step(State::Subscribed, &channel_error("expired"), advanced(true, Intent::Linked));
        assert_eq!(s.next, State::Subscribing);
    }

    #[test]
    fn mode_change_while_subscribed_unsubscribes() {
        for intent in [Intent::Cycle, Intent::Unlinked] {
            let s = step(State::Subscribed, &Event::ModeChange, guards(true, intent));
            assert_eq!(s.next, State::Unsubscribing);
            assert_eq!(s.effects, vec![Effect::SendUnsubscribe]);
        }
        let s = step(State::Subscribed, &Event::ModeChange, guards(true, Intent::Linked));
        assert_eq!(s.next, State::Subscribed);
    }

    #[test]
    fn unsubscribe_ok_settles_by_intent() {
        let s = step(State::Unsubscribing, &Event::UnsubscribeOk, guards(true, Intent::Unlinked));
        assert_eq!(s.next, State::Unsubscribed);
        assert!(s.revisit);

        let s = step(State::Unsubscribed, &Event::ModeChange, guards(true, Intent::Unlinked));
        assert_eq!(s.next, State::Deleted);
        assert_eq!(s.effects, vec![Effect::FireDeleted]);

        let s = step(State::Unsubscribed, &Event::ModeChange, guards(true, Intent::Cycle));
        assert_eq!(s.next, State::Subscribing);
        assert_eq!(s.effects, vec![Effect::CompleteCycle, Effect::SendSubscribe]);
    }

    #[test]
    fn unsubscribe_error_stays_subscribed() {
        let s = step(State::Unsubscribing, &Event::UnsubscribeError, guards(true, Intent::Cycle));
        assert_eq!(s.next, State::Subscribed);
        assert_eq!(s.effects, vec![Effect::AbandonCycle]);
        assert!(!s.revisit);
    }

    #[test]
    fn disconnect_resets_without_unsubscribing() {
        for state in [State::Subscribing, State::Subscribed, State::Unsubscribing, State::Failed] {
            let s = step(state, &Event::Disconnect, guards(false, Intent::Linked));
            assert_eq!(s.next, State::Unsubscribed);
            assert!(s.effects.is_empty(), "no request on disconnect from {state:?}");
        }
    }

    #[test]
    fn failed_is_terminal_until_user_action() {
        for ev in [channel_error("out_of_sync"), Event::SubscribeOk { position: None }] {
            let s = step(State::Failed, &ev, advanced(true, Intent::Linked));
            assert_eq!(s.next, State::Failed);
            assert!(s.effects.is_empty());
        }

        // explicit unsubscribe deletes
        let s = step(State::Failed, &Event::ModeChange, advanced(true, Intent::Unlinked));
        assert_eq!(s.next, State::Deleted);

        // explicit re-subscribe retargets and retries
        let s = step(State::Failed, &Event::ModeChange, advanced(true, Intent::Cycle));
        assert_eq!(s.next, State::Subscribing);
        assert_eq!(s.effects, vec![Effect::CompleteCycle, Effect::SendSubscribe]);
    }

    #[test]
    fn deleted_ignores_everything() {
        for ev in [Event::Connect, Event::Disconnect, Event::ModeChange, Event::UnsubscribeOk] {
            let s = step(State::Deleted, &ev, guards(true, Intent::Unlinked));
            assert_eq!(s.next, State::Deleted);
            assert!(s.effects.is_empty());
        }
    }
}

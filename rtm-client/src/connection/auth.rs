//! The per-connection authentication sub-state-machine.
//!
//! `Idle → HandshakeSent → AuthenticateSent → Idle`, with outcome `Done` or
//! `Error`. The connection feeds `auth/*` replies in here; the flow tells
//! it what to send next. Reply handling and new auth requests interleave on
//! the same task, so no locking is needed.

use std::sync::Arc;

use rtm_core::{
    auth::{AuthDelegate, AuthError, AuthOutcome},
    types::Pdu,
};
use serde_json::Value;
use tracing::debug;

/// Receives the terminal outcome of one auth flow.
pub type AuthCallback = Box<dyn FnOnce(AuthOutcome) + Send>;

/// An `auth/*` reply PDU, decoded for the flow.
#[derive(Clone, Debug)]
pub(crate) enum AuthReply {
    HandshakeOk(Value),
    AuthenticateOk,
    Error(String),
}

impl AuthReply {
    pub(crate) fn from_pdu(pdu: &Pdu) -> Self {
        match pdu.action.as_str() {
            "auth/handshake/ok" => {
                let data = pdu
                    .body
                    .as_ref()
                    .and_then(|b| b.get("data"))
                    .cloned()
                    .unwrap_or(Value::Null);
                AuthReply::HandshakeOk(data)
            }
            "auth/authenticate/ok" => AuthReply::AuthenticateOk,
            _ => {
                let reason = pdu
                    .body
                    .as_ref()
                    .and_then(|b| b.get("reason").or_else(|| b.get("error")))
                    .and_then(Value::as_str)
                    .unwrap_or("authentication failed");
                AuthReply::Error(reason.to_string())
            }
        }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
enum AuthState {
    #[default]
    Idle,
    HandshakeSent,
    AuthenticateSent,
}

/// What the connection must do after feeding a reply to the flow.
#[derive(Debug)]
pub(crate) enum AuthStep {
    /// Send `auth/authenticate` with these credentials
    SendAuthenticate { method: String, credentials: Value },
    /// The flow finished (callback already fired) or consumed the reply
    Settled,
    /// No flow was in flight for this reply
    Unexpected,
}

#[derive(Default)]
pub(crate) struct AuthFlow {
    state: AuthState,
    delegate: Option<Arc<dyn AuthDelegate>>,
    callback: Option<AuthCallback>,
}

impl AuthFlow {
    pub(crate) fn is_idle(&self) -> bool {
        self.state == AuthState::Idle
    }

    pub(crate) fn begin(&mut self, delegate: Arc<dyn AuthDelegate>, callback: AuthCallback) {
        debug!(method = delegate.method(), "starting auth flow");
        self.state = AuthState::HandshakeSent;
        self.delegate = Some(delegate);
        self.callback = Some(callback);
    }

    pub(crate) fn advance(&mut self, reply: AuthReply) -> AuthStep {
        if self.state == AuthState::Idle {
            return AuthStep::Unexpected;
        }

        match (self.state, reply) {
            (AuthState::HandshakeSent, AuthReply::HandshakeOk(data)) => {
                let delegate = self.delegate.clone();
                let delegate = match delegate {
                    Some(delegate) => delegate,
                    None => {
                        self.finish(AuthOutcome::Error(AuthError::Rejected(
                            "auth flow lost its delegate".to_string(),
                        )));
                        return AuthStep::Settled;
                    }
                };
                match delegate.credentials(&data) {
                    Ok(credentials) => {
                        self.state = AuthState::AuthenticateSent;
                        AuthStep::SendAuthenticate {
                            method: delegate.method().to_string(),
                            credentials,
                        }
                    }
                    Err(e) => {
                        self.finish(AuthOutcome::Error(e));
                        AuthStep::Settled
                    }
                }
            }
            (AuthState::AuthenticateSent, AuthReply::AuthenticateOk) => {
                self.finish(AuthOutcome::Done);
                AuthStep::Settled
            }
            (_, AuthReply::Error(reason)) => {
                self.finish(AuthOutcome::Error(AuthError::Rejected(reason)));
                AuthStep::Settled
            }
            (state, reply) => {
                debug!(?state, ?reply, "out-of-order auth reply");
                self.finish(AuthOutcome::Error(AuthError::Rejected(
                    "out-of-order auth reply".to_string(),
                )));
                AuthStep::Settled
            }
        }
    }

    pub(crate) fn abort(&mut self, error: AuthError) {
        if !self.is_idle() {
            self.finish(AuthOutcome::Error(error));
        }
    }

    fn finish(&mut self, outcome: AuthOutcome) {
        debug!(?outcome, "auth flow finished");
        self.state = AuthState::Idle;
        self.delegate = None;
        if let Some(callback) = self.callback.take() {
            callback(outcome);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rtm_core::auth::RoleSecretAuthDelegate;
    use serde_json::json;
    use std::sync::Mutex;

    fn collect() -> (AuthCallback, Arc<Mutex<Vec<AuthOutcome>>>) {
        let outcomes = Arc::new(Mutex::new(Vec::new()));
        let sink = outcomes.clone();
        (Box::new(move |o| sink.lock().unwrap().push(o)), outcomes)
    }

    fn delegate() -> Arc<dyn AuthDelegate> {
        Arc::new(RoleSecretAuthDelegate::new("role", "sekret"))
    }

    #[test]
    fn happy_path_reaches_done() {
        let mut flow = AuthFlow::default();
        let (cb, outcomes) = collect();
        flow.begin(delegate(), cb);

        let step = flow.advance(AuthReply::HandshakeOk(json!({"nonce": "n0nce"})));
        match step {
            AuthStep::SendAuthenticate { method, credentials } => {
                assert_eq!(method, "role_secret");
                assert_eq!(credentials, json!({"hash": "SJoKafBz8fMIA8t8OWYAXw=="}));
            }
            other => panic!("expected SendAuthenticate, got {other:?}"),
        }

        assert!(matches!(flow.advance(AuthReply::AuthenticateOk), AuthStep::Settled));
        assert_eq!(*outcomes.lock().unwrap(), vec![AuthOutcome::Done]);
        assert!(flow.is_idle());
    }

    #[test]
    fn server_rejection_surfaces_via_callback() {
        let mut flow = AuthFlow::default();
        let (cb, outcomes) = collect();
        flow.begin(delegate(), cb);

        flow.advance(AuthReply::Error("authentication_failed".to_string()));
        assert_eq!(
            *outcomes.lock().unwrap(),
            vec![AuthOutcome::Error(AuthError::Rejected("authentication_failed".to_string()))]
        );
        assert!(flow.is_idle());
    }

    #[test]
    fn missing_nonce_fails_without_sending_credentials() {
        let mut flow = AuthFlow::default();
        let (cb, outcomes) = collect();
        flow.begin(delegate(), cb);

        let step = flow.advance(AuthReply::HandshakeOk(json!({})));
        assert!(matches!(step, AuthStep::Settled));
        assert_eq!(
            *outcomes.lock().unwrap(),
            vec![AuthOutcome::Error(AuthError::MissingNonce)]
        );
    }

    #[test]
    fn replies_with_no_flow_are_unexpected() {
        let mut flow = AuthFlow::default();
        assert!(matches!(flow.advance(AuthReply::AuthenticateOk), AuthStep::Unexpected));
    }
}

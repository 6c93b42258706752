//! Transport-agnostic request correlation and dispatch
//!
//! An [`RpcHandler`] owns two tables: the calls it is waiting on, keyed by
//! correlation token, and the functions it exposes by name. It never talks
//! to a socket directly. Every outbound envelope goes through an
//! [`EnvelopeSink`] supplied by the caller, so one handler can outlive the
//! transports it is bound to.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::error::{BridgeError, CallError, TransportError};
use crate::protocol::{Envelope, generate_token};

/// Anything that can transmit an envelope to the remote side
pub trait EnvelopeSink: Send + Sync {
    /// Hand one envelope to the underlying transport
    fn send(&self, envelope: &Envelope) -> Result<(), TransportError>;

    /// Send and report the connection generation that carried the envelope
    ///
    /// Sinks that do not track connections report `None`.
    fn send_tracked(&self, envelope: &Envelope) -> Result<Option<u64>, TransportError> {
        self.send(envelope).map(|()| None)
    }
}

impl<F> EnvelopeSink for F
where
    F: Fn(&Envelope) -> Result<(), TransportError> + Send + Sync,
{
    fn send(&self, envelope: &Envelope) -> Result<(), TransportError> {
        self(envelope)
    }
}

/// Future returned by a registered handler function
pub type HandlerFuture = BoxFuture<'static, anyhow::Result<Value>>;

/// Future returned by [`RpcHandler::call`]
pub type CallFuture = BoxFuture<'static, Result<Value, CallError>>;

type HandlerFn = Arc<dyn Fn(Vec<Value>) -> HandlerFuture + Send + Sync>;

type Settlement = Result<Value, CallError>;

/// Policy for calls that never receive a response
///
/// The default waits forever, which is how peers of this protocol have
/// always behaved. Setting a timeout makes stale calls reject with
/// [`CallError::TimedOut`] and frees their outstanding entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallPolicy {
    pub timeout: Option<Duration>,
}

impl CallPolicy {
    /// Reject calls that have not settled within `timeout`
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
        }
    }
}

/// What [`RpcHandler::handle_message`] did with an envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handled {
    /// A success response settled an outstanding call
    Resolved,
    /// A failure response settled an outstanding call
    Rejected,
    /// A response matched no outstanding call and was ignored
    Unmatched,
    /// A request ran and a success response was sent
    Answered,
    /// A request's handler failed and a failure response was sent
    Failed,
}

#[derive(Default)]
struct HandlerState {
    outstanding: HashMap<String, oneshot::Sender<Settlement>>,
    handlers: HashMap<String, HandlerFn>,
}

/// Request/response correlation engine
///
/// Cloning is cheap and every clone shares the same tables.
#[derive(Clone, Default)]
pub struct RpcHandler {
    state: Arc<Mutex<HandlerState>>,
    policy: CallPolicy,
}

fn lock(state: &Mutex<HandlerState>) -> MutexGuard<'_, HandlerState> {
    // Neither table is left half-updated by a panicking holder
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl RpcHandler {
    /// Create a handler that waits forever for responses
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a handler with an explicit call policy
    pub fn with_policy(policy: CallPolicy) -> Self {
        Self {
            state: Arc::default(),
            policy,
        }
    }

    /// Register `func` as the implementation of remote method `name`
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::DuplicateHandler`] if `name` is already taken.
    pub fn handle<F, Fut>(&self, name: impl Into<String>, func: F) -> Result<(), BridgeError>
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        let name = name.into();
        let mut state = lock(&self.state);
        if state.handlers.contains_key(&name) {
            return Err(BridgeError::DuplicateHandler(name));
        }
        let func: HandlerFn = Arc::new(move |args| func(args).boxed());
        state.handlers.insert(name, func);
        Ok(())
    }

    /// Remove the registration for `name`, if any
    pub fn unhandle(&self, name: &str) {
        lock(&self.state).handlers.remove(name);
    }

    /// Whether a function is registered under `name`
    pub fn is_handled(&self, name: &str) -> bool {
        lock(&self.state).handlers.contains_key(name)
    }

    /// Number of calls still waiting for a response
    pub fn outstanding_calls(&self) -> usize {
        lock(&self.state).outstanding.len()
    }

    /// Invoke `name` on the remote side
    ///
    /// The request is registered and handed to `sender` before this
    /// function returns, so dropping the returned future does not cancel
    /// the remote call. The future settles when a response with the same
    /// token reaches [`RpcHandler::handle_message`].
    pub fn call(&self, name: &str, sender: &dyn EnvelopeSink, args: Vec<Value>) -> CallFuture {
        let (tx, rx) = oneshot::channel();

        let request_id = {
            let mut state = lock(&self.state);
            let mut token = generate_token();
            while state.outstanding.contains_key(&token) {
                token = generate_token();
            }
            state.outstanding.insert(token.clone(), tx);
            token
        };

        let envelope = Envelope::Request {
            request_id: request_id.clone(),
            name: name.to_string(),
            args,
        };
        debug!(method = %name, token = %request_id, "sending request");

        let sent = sender.send(&envelope);
        if sent.is_err() {
            lock(&self.state).outstanding.remove(&request_id);
        }

        let state = Arc::clone(&self.state);
        let timeout = self.policy.timeout;

        async move {
            sent?;
            let settled = match timeout {
                None => rx.await,
                Some(limit) => match tokio::time::timeout(limit, rx).await {
                    Ok(settled) => settled,
                    Err(_) => {
                        lock(&state).outstanding.remove(&request_id);
                        warn!(token = %request_id, "call timed out");
                        return Err(CallError::TimedOut { token: request_id });
                    }
                },
            };
            settled.unwrap_or(Err(CallError::Abandoned))
        }
        .boxed()
    }

    /// Invoke `name` and decode the result into `R`
    pub fn call_as<R>(
        &self,
        name: &str,
        sender: &dyn EnvelopeSink,
        args: Vec<Value>,
    ) -> BoxFuture<'static, Result<R, CallError>>
    where
        R: DeserializeOwned + Send + 'static,
    {
        let pending = self.call(name, sender, args);
        async move {
            let value = pending.await?;
            Ok(serde_json::from_value(value)?)
        }
        .boxed()
    }

    /// Process one inbound envelope
    ///
    /// Responses settle the matching outstanding call at most once.
    /// Requests run the registered function with `pre_args` followed by the
    /// request's own arguments, then send exactly one response through
    /// `sender`.
    ///
    /// # Errors
    ///
    /// [`BridgeError::UnknownMethod`] when a request names an unregistered
    /// method (no response is sent), and [`BridgeError::Transport`] when
    /// the response could not be sent.
    pub async fn handle_message(
        &self,
        envelope: Envelope,
        sender: &dyn EnvelopeSink,
        pre_args: Vec<Value>,
    ) -> Result<Handled, BridgeError> {
        match envelope {
            Envelope::Success {
                response_id,
                result,
            } => Ok(self.settle(&response_id, Ok(result))),
            Envelope::Failure { response_id, error } => {
                Ok(self.settle(&response_id, Err(CallError::Failed { error })))
            }
            Envelope::Request {
                request_id,
                name,
                args,
            } => {
                let func = lock(&self.state).handlers.get(&name).cloned();
                let Some(func) = func else {
                    warn!(method = %name, "missing RPC handler");
                    return Err(BridgeError::UnknownMethod(name));
                };

                let mut call_args = pre_args;
                call_args.extend(args);

                match func(call_args).await {
                    Ok(result) => {
                        sender.send(&Envelope::success(request_id, result))?;
                        Ok(Handled::Answered)
                    }
                    Err(err) => {
                        warn!(method = %name, error = %err, "RPC handler failed");
                        sender.send(&Envelope::failure(request_id))?;
                        Ok(Handled::Failed)
                    }
                }
            }
        }
    }

    fn settle(&self, token: &str, settlement: Settlement) -> Handled {
        let Some(waiter) = lock(&self.state).outstanding.remove(token) else {
            debug!(token = %token, "response for unknown call ignored");
            return Handled::Unmatched;
        };

        let handled = if settlement.is_ok() {
            Handled::Resolved
        } else {
            Handled::Rejected
        };

        if waiter.send(settlement).is_err() {
            debug!(token = %token, "caller stopped waiting before the response arrived");
        }
        handled
    }
}

/// Extract positional argument `idx` of a request as `T`
///
/// A missing argument is read as `null`, so optional parameters can be
/// declared as `Option<T>`.
pub fn arg<T: DeserializeOwned>(args: &[Value], idx: usize) -> anyhow::Result<T> {
    let value = args.get(idx).cloned().unwrap_or(Value::Null);
    serde_json::from_value(value)
        .map_err(|e| anyhow::anyhow!("argument {} has the wrong type: {}", idx, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Default)]
    struct Recorder {
        sent: Mutex<Vec<Envelope>>,
    }

    impl Recorder {
        fn take(&self) -> Vec<Envelope> {
            std::mem::take(&mut *self.sent.lock().unwrap())
        }
    }

    impl EnvelopeSink for Recorder {
        fn send(&self, envelope: &Envelope) -> Result<(), TransportError> {
            self.sent.lock().unwrap().push(envelope.clone());
            Ok(())
        }
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let rpc = RpcHandler::new();
        rpc.handle("echo", |_| async { Ok(Value::Null) }).unwrap();
        let err = rpc.handle("echo", |_| async { Ok(Value::Null) }).unwrap_err();
        assert!(matches!(err, BridgeError::DuplicateHandler(name) if name == "echo"));
    }

    #[test]
    fn test_unhandle_allows_reregistration() {
        let rpc = RpcHandler::new();
        rpc.handle("echo", |_| async { Ok(Value::Null) }).unwrap();
        rpc.unhandle("echo");
        assert!(!rpc.is_handled("echo"));
        rpc.handle("echo", |_| async { Ok(Value::Null) }).unwrap();
        assert!(rpc.is_handled("echo"));
    }

    #[test]
    fn test_unhandle_absent_is_noop() {
        let rpc = RpcHandler::new();
        rpc.unhandle("missing");
        assert!(!rpc.is_handled("missing"));
    }

    #[tokio::test]
    async fn test_request_is_sent_before_await() {
        let rpc = RpcHandler::new();
        let sink = Recorder::default();
        let _pending = rpc.call("ping", &sink, vec![json!(1)]);

        let sent = sink.take();
        assert_eq!(sent.len(), 1);
        match &sent[0] {
            Envelope::Request { name, args, .. } => {
                assert_eq!(name, "ping");
                assert_eq!(args, &vec![json!(1)]);
            }
            other => panic!("expected request, got {:?}", other),
        }
        assert_eq!(rpc.outstanding_calls(), 1);
    }

    #[tokio::test]
    async fn test_success_response_resolves_call() {
        let rpc = RpcHandler::new();
        let sink = Recorder::default();
        let pending = rpc.call("ping", &sink, vec![]);
        let token = sink.take()[0].token().to_string();

        let handled = rpc
            .handle_message(Envelope::success(token, json!(false)), &sink, vec![])
            .await
            .unwrap();
        assert_eq!(handled, Handled::Resolved);
        assert_eq!(pending.await.unwrap(), json!(false));
        assert_eq!(rpc.outstanding_calls(), 0);
    }

    #[tokio::test]
    async fn test_failure_response_rejects_call() {
        let rpc = RpcHandler::new();
        let sink = Recorder::default();
        let pending = rpc.call("ping", &sink, vec![]);
        let token = sink.take()[0].token().to_string();

        let handled = rpc
            .handle_message(Envelope::failure(token), &sink, vec![])
            .await
            .unwrap();
        assert_eq!(handled, Handled::Rejected);
        assert!(matches!(pending.await, Err(CallError::Failed { error: None })));
    }

    #[tokio::test]
    async fn test_duplicate_response_is_ignored() {
        let rpc = RpcHandler::new();
        let sink = Recorder::default();
        let pending = rpc.call("ping", &sink, vec![]);
        let token = sink.take()[0].token().to_string();

        let first = rpc
            .handle_message(Envelope::success(token.clone(), json!(1)), &sink, vec![])
            .await
            .unwrap();
        let second = rpc
            .handle_message(Envelope::success(token, json!(2)), &sink, vec![])
            .await
            .unwrap();

        assert_eq!(first, Handled::Resolved);
        assert_eq!(second, Handled::Unmatched);
        assert_eq!(pending.await.unwrap(), json!(1));
    }

    #[tokio::test]
    async fn test_response_after_caller_dropped() {
        let rpc = RpcHandler::new();
        let sink = Recorder::default();
        drop(rpc.call("ping", &sink, vec![]));
        let token = sink.take()[0].token().to_string();

        let handled = rpc
            .handle_message(Envelope::success(token, json!(1)), &sink, vec![])
            .await
            .unwrap();
        assert_eq!(handled, Handled::Resolved);
        assert_eq!(rpc.outstanding_calls(), 0);
    }

    #[tokio::test]
    async fn test_pre_args_come_first() {
        let rpc = RpcHandler::new();
        rpc.handle("who", |args| async move { Ok(Value::Array(args)) })
            .unwrap();
        let sink = Recorder::default();

        let request = Envelope::Request {
            request_id: "t1".to_string(),
            name: "who".to_string(),
            args: vec![json!("a"), json!("b")],
        };
        let handled = rpc
            .handle_message(request, &sink, vec![json!("conn-7")])
            .await
            .unwrap();
        assert_eq!(handled, Handled::Answered);
        assert_eq!(
            sink.take(),
            vec![Envelope::success("t1", json!(["conn-7", "a", "b"]))]
        );
    }

    #[tokio::test]
    async fn test_handler_error_sends_opaque_failure() {
        let rpc = RpcHandler::new();
        rpc.handle("boom", |_| async { Err(anyhow::anyhow!("secret detail")) })
            .unwrap();
        let sink = Recorder::default();

        let request = Envelope::Request {
            request_id: "t9".to_string(),
            name: "boom".to_string(),
            args: vec![],
        };
        let handled = rpc.handle_message(request, &sink, vec![]).await.unwrap();
        assert_eq!(handled, Handled::Failed);
        assert_eq!(sink.take(), vec![Envelope::failure("t9")]);
    }

    #[tokio::test]
    async fn test_unknown_method_sends_nothing() {
        let rpc = RpcHandler::new();
        let sink = Recorder::default();
        let request = Envelope::Request {
            request_id: "t1".to_string(),
            name: "nope".to_string(),
            args: vec![],
        };
        let err = rpc.handle_message(request, &sink, vec![]).await.unwrap_err();
        assert!(matches!(err, BridgeError::UnknownMethod(name) if name == "nope"));
        assert!(sink.take().is_empty());
    }

    #[tokio::test]
    async fn test_send_failure_rejects_immediately() {
        let rpc = RpcHandler::new();
        let down =
            |_: &Envelope| -> Result<(), TransportError> { Err(TransportError::NotConnected) };
        let result = rpc.call("ping", &down, vec![]).await;
        assert!(matches!(
            result,
            Err(CallError::Transport(TransportError::NotConnected))
        ));
        assert_eq!(rpc.outstanding_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_policy_rejects_stale_call() {
        let rpc = RpcHandler::with_policy(CallPolicy::with_timeout(Duration::from_secs(5)));
        let sink = Recorder::default();
        let result = rpc.call("ping", &sink, vec![]).await;
        assert!(matches!(result, Err(CallError::TimedOut { .. })));
        assert_eq!(rpc.outstanding_calls(), 0);
    }

    #[tokio::test]
    async fn test_call_as_decodes_result() {
        let rpc = RpcHandler::new();
        let sink = Recorder::default();
        let pending = rpc.call_as::<Vec<u32>>("nums", &sink, vec![]);
        let token = sink.take()[0].token().to_string();

        rpc.handle_message(Envelope::success(token, json!([1, 2, 3])), &sink, vec![])
            .await
            .unwrap();
        assert_eq!(pending.await.unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_call_as_reports_decode_error() {
        let rpc = RpcHandler::new();
        let sink = Recorder::default();
        let pending = rpc.call_as::<u32>("nums", &sink, vec![]);
        let token = sink.take()[0].token().to_string();

        rpc.handle_message(Envelope::success(token, json!("three")), &sink, vec![])
            .await
            .unwrap();
        assert!(matches!(pending.await, Err(CallError::Decode(_))));
    }

    #[test]
    fn test_arg_extraction() {
        let args = vec![json!("obs"), json!(3)];
        let ns: String = arg(&args, 0).unwrap();
        let n: u32 = arg(&args, 1).unwrap();
        let missing: Option<String> = arg(&args, 2).unwrap();
        assert_eq!(ns, "obs");
        assert_eq!(n, 3);
        assert!(missing.is_none());
        assert!(arg::<u32>(&args, 0).is_err());
    }
}

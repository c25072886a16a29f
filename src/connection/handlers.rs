//! Client-side method handlers invoked by the server.
//!
//! Handlers are stored type-erased: each one decodes its own positional
//! arguments and produces a JSON value. Every matching handler runs in its own
//! task, so a slow or failing handler never blocks the inbound loop or its
//! siblings.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, warn};

use super::session::Session;
use crate::arguments::FromArguments;
use crate::error::{Result, SignalRError};
use crate::protocol::{Completion, Invocation};

/// Error type returned by handler callbacks.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

pub(crate) const NO_RESULT_PROVIDED: &str = "Client did not provide a result.";

/// Why a handler did not produce a value.
#[derive(Debug, thiserror::Error)]
pub(crate) enum HandlerFailure {
    #[error("{0}")]
    Arguments(SignalRError),
    #[error("{0}")]
    Callback(HandlerError),
    #[error("{0}")]
    Result(serde_json::Error),
    #[error("{0}")]
    Panicked(String),
}

type ErasedHandler =
    Arc<dyn Fn(Vec<Value>) -> BoxFuture<'static, Result<Value, HandlerFailure>> + Send + Sync>;

#[derive(Default)]
struct MethodHandlers {
    plain: Vec<(u64, ErasedHandler)>,
    with_result: Option<(u64, ErasedHandler)>,
}

impl MethodHandlers {
    fn is_empty(&self) -> bool {
        self.plain.is_empty() && self.with_result.is_none()
    }
}

#[derive(Default)]
struct RegistryInner {
    methods: RwLock<HashMap<String, MethodHandlers>>,
    next_id: AtomicU64,
}

impl RegistryInner {
    fn remove(&self, target: &str, id: u64) {
        let mut methods = self.methods.write().unwrap_or_else(PoisonError::into_inner);
        let Some(handlers) = methods.get_mut(target) else {
            return;
        };
        handlers.plain.retain(|(handler_id, _)| *handler_id != id);
        if handlers.with_result.as_ref().is_some_and(|(handler_id, _)| *handler_id == id) {
            handlers.with_result = None;
        }
        if handlers.is_empty() {
            methods.remove(target);
        }
    }
}

/// Handlers registered on a connection, keyed by case-sensitive method name.
#[derive(Clone, Default)]
pub(crate) struct HandlerRegistry {
    inner: Arc<RegistryInner>,
}

/// Snapshot of the handlers matching one incoming invocation.
#[derive(Default)]
pub(crate) struct MatchedHandlers {
    plain: Vec<ErasedHandler>,
    with_result: Option<ErasedHandler>,
}

impl HandlerRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn next_id(&self) -> u64 {
        self.inner.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn registration(&self, target: &str, id: u64) -> Registration {
        Registration {
            target: target.to_string(),
            id,
            registry: Arc::downgrade(&self.inner),
        }
    }

    pub(crate) fn add<A, F, Fut>(&self, target: &str, callback: F) -> Registration
    where
        A: FromArguments + Send + 'static,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        let callback = Arc::new(callback);
        let handler: ErasedHandler = Arc::new(move |arguments| {
            let callback = callback.clone();
            Box::pin(async move {
                let arguments = A::from_arguments(arguments).map_err(HandlerFailure::Arguments)?;
                callback(arguments).await.map_err(HandlerFailure::Callback)?;
                Ok(Value::Null)
            })
        });

        let id = self.next_id();
        self.inner
            .methods
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(target.to_string())
            .or_default()
            .plain
            .push((id, handler));
        self.registration(target, id)
    }

    pub(crate) fn add_with_result<A, R, F, Fut>(&self, target: &str, callback: F) -> Result<Registration>
    where
        A: FromArguments + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, HandlerError>> + Send + 'static,
    {
        let callback = Arc::new(callback);
        let handler: ErasedHandler = Arc::new(move |arguments| {
            let callback = callback.clone();
            Box::pin(async move {
                let arguments = A::from_arguments(arguments).map_err(HandlerFailure::Arguments)?;
                let result = callback(arguments).await.map_err(HandlerFailure::Callback)?;
                serde_json::to_value(result).map_err(HandlerFailure::Result)
            })
        });

        let mut methods = self.inner.methods.write().unwrap_or_else(PoisonError::into_inner);
        let handlers = methods.entry(target.to_string()).or_default();
        if handlers.with_result.is_some() {
            return Err(SignalRError::DuplicateResultHandler(target.to_string()));
        }
        let id = self.next_id();
        handlers.with_result = Some((id, handler));
        Ok(self.registration(target, id))
    }

    /// Removes every handler for `target`.
    pub(crate) fn remove_all(&self, target: &str) {
        self.inner
            .methods
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(target);
    }

    pub(crate) fn lookup(&self, target: &str) -> MatchedHandlers {
        let methods = self.inner.methods.read().unwrap_or_else(PoisonError::into_inner);
        match methods.get(target) {
            Some(handlers) => MatchedHandlers {
                plain: handlers.plain.iter().map(|(_, h)| h.clone()).collect(),
                with_result: handlers.with_result.as_ref().map(|(_, h)| h.clone()),
            },
            None => MatchedHandlers::default(),
        }
    }
}

/// Handle to a single registered handler.
///
/// Dropping the handle keeps the handler registered; call [`Registration::remove`]
/// to unregister it.
#[derive(Debug)]
pub struct Registration {
    target: String,
    id: u64,
    registry: Weak<RegistryInner>,
}

impl Registration {
    /// Method name the handler is registered for.
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Unregisters exactly this handler.
    pub fn remove(self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(&self.target, self.id);
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "Handler panicked".to_string()
    }
}

async fn run_isolated(handler: ErasedHandler, arguments: Vec<Value>) -> Result<Value, HandlerFailure> {
    match AssertUnwindSafe(handler(arguments)).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => Err(HandlerFailure::Panicked(panic_message(payload.as_ref()))),
    }
}

fn reply(session: &Session, completion: Completion) {
    if let Err(e) = session.send_message(&completion.into()) {
        debug!(error = %e, "Dropping handler completion");
    }
}

/// Runs the matched handlers for an invocation and sends back at most one
/// completion.
pub(crate) fn dispatch(session: &Arc<Session>, invocation: Invocation, matched: MatchedHandlers) {
    let (target, arguments, invocation_id) = invocation.into_parts();

    if matched.plain.is_empty() && matched.with_result.is_none() && invocation_id.is_none() {
        warn!(target = %target, "No handler registered for method");
        return;
    }

    for handler in matched.plain {
        let target = target.clone();
        let arguments = arguments.clone();
        tokio::spawn(async move {
            if let Err(e) = run_isolated(handler, arguments).await {
                error!(target = %target, error = %e, "Handler failed");
            }
        });
    }

    match (matched.with_result, invocation_id) {
        (Some(handler), Some(invocation_id)) => {
            let session = session.clone();
            tokio::spawn(async move {
                let completion = match run_isolated(handler, arguments).await {
                    Ok(result) => Completion::Resulted {
                        invocation_id,
                        result,
                    },
                    Err(e) => {
                        error!(target = %target, error = %e, "Result handler failed");
                        Completion::Error {
                            invocation_id,
                            error: e.to_string(),
                        }
                    }
                };
                reply(&session, completion);
            });
        }
        (Some(handler), None) => {
            tokio::spawn(async move {
                match run_isolated(handler, arguments).await {
                    Ok(_) => warn!(
                        target = %target,
                        "Result handler returned a value but the server did not request one; discarding it"
                    ),
                    Err(e) => error!(target = %target, error = %e, "Result handler failed"),
                }
            });
        }
        (None, Some(invocation_id)) => {
            warn!(target = %target, "Server requested a result but no result handler is registered");
            reply(
                session,
                Completion::Error {
                    invocation_id,
                    error: NO_RESULT_PROVIDED.to_string(),
                },
            );
        }
        (None, None) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn noop_registry() -> HandlerRegistry {
        let registry = HandlerRegistry::new();
        registry.add("Send", |_: (String,)| async { Ok(()) });
        registry
    }

    #[test]
    fn duplicate_result_handler_is_rejected() {
        let registry = HandlerRegistry::new();
        registry
            .add_with_result("Add", |(a, b): (i32, i32)| async move { Ok(a + b) })
            .unwrap();
        let err = registry
            .add_with_result("Add", |(a,): (i32,)| async move { Ok(a) })
            .unwrap_err();
        assert!(matches!(err, SignalRError::DuplicateResultHandler(ref t) if t == "Add"));
    }

    #[test]
    fn result_handler_can_be_replaced_after_removal() {
        let registry = HandlerRegistry::new();
        let first = registry
            .add_with_result("Add", |_: ()| async { Ok(1) })
            .unwrap();
        first.remove();
        assert!(registry.add_with_result("Add", |_: ()| async { Ok(2) }).is_ok());
    }

    #[test]
    fn plain_handlers_do_not_block_a_result_handler() {
        let registry = noop_registry();
        registry.add("Send", |_: (String,)| async { Ok(()) });
        assert!(registry.add_with_result("Send", |_: ()| async { Ok(0) }).is_ok());

        let matched = registry.lookup("Send");
        assert_eq!(matched.plain.len(), 2);
        assert!(matched.with_result.is_some());
    }

    #[test]
    fn method_names_are_case_sensitive() {
        let registry = noop_registry();
        assert!(registry.lookup("send").plain.is_empty());
        assert_eq!(registry.lookup("Send").plain.len(), 1);
    }

    #[test]
    fn remove_only_drops_its_own_handler() {
        let registry = HandlerRegistry::new();
        let first = registry.add("Send", |_: ()| async { Ok(()) });
        registry.add("Send", |_: ()| async { Ok(()) });
        assert_eq!(first.target(), "Send");

        first.remove();
        assert_eq!(registry.lookup("Send").plain.len(), 1);

        registry.remove_all("Send");
        assert!(registry.lookup("Send").plain.is_empty());
    }

    #[tokio::test]
    async fn handler_receives_decoded_arguments() {
        let registry = HandlerRegistry::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        registry.add("Add", move |(a, b): (i32, i32)| {
            let counter = counter.clone();
            async move {
                counter.fetch_add((a + b) as usize, Ordering::SeqCst);
                Ok(())
            }
        });

        let handler = registry.lookup("Add").plain.remove(0);
        let result = run_isolated(handler, vec![Value::from(2), Value::from(3)]).await;
        assert_eq!(result.unwrap(), Value::Null);
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn argument_decode_failure_is_reported() {
        let registry = HandlerRegistry::new();
        registry
            .add_with_result("Add", |(a,): (i32,)| async move { Ok(a) })
            .unwrap();

        let handler = registry.lookup("Add").with_result.unwrap();
        let err = run_isolated(handler, vec![Value::from("not int")])
            .await
            .unwrap_err();
        assert!(matches!(err, HandlerFailure::Arguments(_)));
        assert!(err.to_string().starts_with("Failed to decode argument 0"));
    }

    #[tokio::test]
    async fn callback_error_message_is_preserved() {
        let registry = HandlerRegistry::new();
        registry
            .add_with_result("Fail", |_: ()| async { Err::<i32, _>(HandlerError::from("Custom error.")) })
            .unwrap();

        let handler = registry.lookup("Fail").with_result.unwrap();
        let err = run_isolated(handler, Vec::new()).await.unwrap_err();
        assert_eq!(err.to_string(), "Custom error.");
    }

    #[tokio::test]
    async fn panicking_handler_is_contained() {
        let registry = HandlerRegistry::new();
        registry.add("Boom", |(explode,): (bool,)| async move {
            if explode {
                panic!("kaboom");
            }
            Ok(())
        });

        let handler = registry.lookup("Boom").plain.remove(0);
        let err = run_isolated(handler, vec![Value::Bool(true)]).await.unwrap_err();
        assert!(matches!(err, HandlerFailure::Panicked(ref m) if m == "kaboom"));
    }
}

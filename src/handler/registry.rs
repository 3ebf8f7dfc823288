//! Handler registry for dispatching requests by method name.
//!
//! Handlers are registered with their typed input and output; the registry
//! wraps them so dispatch works on raw request bodies. Params are decoded
//! with the server's codec and results encoded with it, so the server only
//! ever moves bytes.
//!
//! # Example
//!
//! ```ignore
//! use peerwire::handler::HandlerRegistry;
//!
//! let mut registry = HandlerRegistry::<MsgPackCodec>::new();
//!
//! registry.register_unary("echo", |value: serde_json::Value| async move { Ok(value) });
//! registry.register_stream("count", |n: u32| {
//!     futures::stream::iter((0..n).map(Ok))
//! });
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::codec::{Codec, MsgPackCodec, Params};
use crate::error::{Result, RpcError, INVALID_PARAMS};

/// Encoded result of a unary handler.
pub type HandlerFuture = BoxFuture<'static, Result<Vec<u8>>>;

/// Encoded items of a streaming handler.
pub type HandlerStream = BoxStream<'static, Result<Vec<u8>>>;

/// A method returning one value.
pub trait UnaryHandler<C: Codec>: Send + Sync + 'static {
    /// Decode params from `body` and start the handler.
    ///
    /// # Errors
    ///
    /// Returns an `INVALID_PARAMS` application error if the params do not
    /// decode into the handler's input type.
    fn call(&self, body: &[u8]) -> Result<HandlerFuture>;
}

/// A method returning a lazy sequence of values.
pub trait StreamHandler<C: Codec>: Send + Sync + 'static {
    /// Decode params from `body` and start the handler.
    fn call(&self, body: &[u8]) -> Result<HandlerStream>;
}

fn decode_params<C: Codec, T: DeserializeOwned>(body: &[u8]) -> Result<T> {
    C::decode::<Params<T>>(body)
        .map(|p| p.params)
        .map_err(|e| RpcError::application(INVALID_PARAMS, format!("Invalid params: {}", e)))
}

/// Wrapper that decodes params and encodes the result of a typed unary
/// handler.
pub struct TypedUnary<F, T, R, Fut> {
    handler: F,
    _phantom: PhantomData<fn(T) -> (R, Fut)>,
}

impl<F, T, R, Fut> TypedUnary<F, T, R, Fut> {
    /// Create a new typed handler.
    pub fn new(handler: F) -> Self {
        Self {
            handler,
            _phantom: PhantomData,
        }
    }
}

impl<C, F, T, R, Fut> UnaryHandler<C> for TypedUnary<F, T, R, Fut>
where
    C: Codec,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    Fut: Future<Output = Result<R>> + Send + 'static,
{
    fn call(&self, body: &[u8]) -> Result<HandlerFuture> {
        let params: T = decode_params::<C, T>(body)?;
        let fut = (self.handler)(params);
        Ok(Box::pin(async move {
            let value = fut.await?;
            C::encode(&value)
        }))
    }
}

/// Wrapper that decodes params and encodes each item of a typed streaming
/// handler.
pub struct TypedStream<F, T, R, S> {
    handler: F,
    _phantom: PhantomData<fn(T) -> (R, S)>,
}

impl<F, T, R, S> TypedStream<F, T, R, S> {
    /// Create a new typed handler.
    pub fn new(handler: F) -> Self {
        Self {
            handler,
            _phantom: PhantomData,
        }
    }
}

impl<C, F, T, R, S> StreamHandler<C> for TypedStream<F, T, R, S>
where
    C: Codec,
    F: Fn(T) -> S + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    S: Stream<Item = Result<R>> + Send + 'static,
{
    fn call(&self, body: &[u8]) -> Result<HandlerStream> {
        let params: T = decode_params::<C, T>(body)?;
        let items = (self.handler)(params);
        Ok(items
            .map(|item| item.and_then(|value| C::encode(&value)))
            .boxed())
    }
}

/// Entry for a registered method.
pub enum MethodEntry<C: Codec> {
    /// Answered with a single Response.
    Unary(Box<dyn UnaryHandler<C>>),
    /// Answered with StreamItems and a StreamEnd.
    Stream(Box<dyn StreamHandler<C>>),
}

impl<C: Codec> MethodEntry<C> {
    /// Whether this entry is a streaming method.
    pub fn is_stream(&self) -> bool {
        matches!(self, MethodEntry::Stream(_))
    }
}

/// Registry mapping method names to handlers.
pub struct HandlerRegistry<C: Codec = MsgPackCodec> {
    methods: HashMap<String, MethodEntry<C>>,
}

impl<C: Codec> HandlerRegistry<C> {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            methods: HashMap::new(),
        }
    }

    /// Register a unary method. A later registration under the same name
    /// replaces the earlier one.
    pub fn register_unary<F, T, R, Fut>(&mut self, name: &str, handler: F)
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        T: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        Fut: Future<Output = Result<R>> + Send + 'static,
    {
        let typed = TypedUnary::<F, T, R, Fut>::new(handler);
        self.methods
            .insert(name.to_string(), MethodEntry::Unary(Box::new(typed)));
    }

    /// Register a streaming method.
    pub fn register_stream<F, T, R, S>(&mut self, name: &str, handler: F)
    where
        F: Fn(T) -> S + Send + Sync + 'static,
        T: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        S: Stream<Item = Result<R>> + Send + 'static,
    {
        let typed = TypedStream::<F, T, R, S>::new(handler);
        self.methods
            .insert(name.to_string(), MethodEntry::Stream(Box::new(typed)));
    }

    /// Look up a method by name.
    pub fn get(&self, name: &str) -> Option<&MethodEntry<C>> {
        self.methods.get(name)
    }

    /// Whether a method is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.methods.contains_key(name)
    }

    /// Names of all registered methods.
    pub fn method_names(&self) -> impl Iterator<Item = &str> {
        self.methods.keys().map(String::as_str)
    }

    /// Number of registered methods.
    pub fn len(&self) -> usize {
        self.methods.len()
    }

    /// Whether no methods are registered.
    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}

impl<C: Codec> Default for HandlerRegistry<C> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{JsonCodec, RequestEnvelope};
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Add {
        a: i64,
        b: i64,
    }

    fn body<C: Codec, P: Serialize>(method: &str, params: &P) -> Vec<u8> {
        C::encode(&RequestEnvelope { method, params }).unwrap()
    }

    #[test]
    fn test_registry_new_is_empty() {
        let registry = HandlerRegistry::<MsgPackCodec>::new();
        assert!(registry.is_empty());
        assert!(registry.get("anything").is_none());
    }

    #[test]
    fn test_register_kinds() {
        let mut registry = HandlerRegistry::<MsgPackCodec>::new();
        registry.register_unary("add", |p: Add| async move { Ok(p.a + p.b) });
        registry.register_stream("count", |n: u32| futures::stream::iter((0..n).map(Ok)));

        assert_eq!(registry.len(), 2);
        assert!(!registry.get("add").unwrap().is_stream());
        assert!(registry.get("count").unwrap().is_stream());

        let mut names: Vec<_> = registry.method_names().collect();
        names.sort();
        assert_eq!(names, vec!["add", "count"]);
    }

    #[tokio::test]
    async fn test_unary_decodes_and_encodes() {
        let mut registry = HandlerRegistry::<MsgPackCodec>::new();
        registry.register_unary("add", |p: Add| async move { Ok(p.a + p.b) });

        let MethodEntry::Unary(handler) = registry.get("add").unwrap() else {
            panic!("expected unary");
        };
        let out = handler
            .call(&body::<MsgPackCodec, _>("add", &Add { a: 2, b: 3 }))
            .unwrap()
            .await
            .unwrap();
        assert_eq!(MsgPackCodec::decode::<i64>(&out).unwrap(), 5);
    }

    #[tokio::test]
    async fn test_stream_items_are_encoded() {
        let mut registry = HandlerRegistry::<JsonCodec>::new();
        registry.register_stream("count", |n: u32| futures::stream::iter((0..n).map(Ok)));

        let MethodEntry::Stream(handler) = registry.get("count").unwrap() else {
            panic!("expected stream");
        };
        let items: Vec<_> = handler
            .call(&body::<JsonCodec, _>("count", &3u32))
            .unwrap()
            .collect()
            .await;
        let decoded: Vec<u32> = items
            .into_iter()
            .map(|i| JsonCodec::decode(&i.unwrap()).unwrap())
            .collect();
        assert_eq!(decoded, vec![0, 1, 2]);
    }

    #[test]
    fn test_bad_params_are_invalid_params() {
        let mut registry = HandlerRegistry::<MsgPackCodec>::new();
        registry.register_unary("add", |p: Add| async move { Ok(p.a + p.b) });

        let MethodEntry::Unary(handler) = registry.get("add").unwrap() else {
            panic!("expected unary");
        };
        let err = match handler.call(&body::<MsgPackCodec, _>("add", &"not a struct")) {
            Err(e) => e,
            Ok(_) => panic!("expected decode failure"),
        };
        assert_eq!(err.code(), INVALID_PARAMS);
    }

    #[tokio::test]
    async fn test_handler_error_passes_through() {
        let mut registry = HandlerRegistry::<MsgPackCodec>::new();
        registry.register_unary("fail", |_: ()| async move {
            Err::<(), _>(RpcError::application(42, "nope"))
        });

        let MethodEntry::Unary(handler) = registry.get("fail").unwrap() else {
            panic!("expected unary");
        };
        let err = handler
            .call(&body::<MsgPackCodec, _>("fail", &()))
            .unwrap()
            .await
            .unwrap_err();
        assert_eq!(err.code(), 42);
    }
}

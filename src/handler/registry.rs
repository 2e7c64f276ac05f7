//! Handler registry for dispatching calls by full method name.
//!
//! Each registered method is stored as a [`Handler`], which wraps the
//! application's typed function in one of four shapes (unary, client
//! streaming, server streaming, duplex streaming). A handler reads its
//! request(s) from the call, runs the function, and returns the serialized
//! response for single-response methods or `None` for streaming ones.
//!
//! # Example
//!
//! ```ignore
//! use pipe_rpc::handler::HandlerRegistry;
//! use pipe_rpc::{Method, MethodType};
//!
//! let echo = Method::<Request, Response>::msgpack(MethodType::Unary, "Test", "Echo");
//! let mut registry = HandlerRegistry::new();
//! registry.add_unary(&echo, |request: Request, _ctx| async move {
//!     Ok(Response { value: request.value })
//! });
//! ```

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;

use super::PipeCallContext;
use crate::codec::Marshaller;
use crate::error::Result;
use crate::method::{Method, MethodType};
use crate::stream::{MessageReader, ResponseStreamWriter};

/// Boxed future for handler results.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A registered method, type-erased.
pub(crate) trait Handler: Send + Sync + 'static {
    fn method_type(&self) -> MethodType;

    /// Serve one call; `Some` carries the single serialized response.
    fn call(&self, ctx: PipeCallContext) -> BoxFuture<'static, Result<Option<Bytes>>>;
}

struct Marshallers<Req, Resp> {
    request: Arc<dyn Marshaller<Req>>,
    response: Arc<dyn Marshaller<Resp>>,
}

impl<Req, Resp> Marshallers<Req, Resp> {
    fn of(method: &Method<Req, Resp>) -> Self {
        Self {
            request: Arc::clone(method.request_marshaller()),
            response: Arc::clone(method.response_marshaller()),
        }
    }

    fn reader(&self, ctx: &PipeCallContext) -> MessageReader<Req> {
        ctx.connection().request_reader(Arc::clone(&self.request))
    }

    fn writer(&self, ctx: &PipeCallContext) -> ResponseStreamWriter<Resp> {
        ResponseStreamWriter::new(Arc::clone(ctx.connection()), Arc::clone(&self.response))
    }
}

struct UnaryHandler<F, Req, Resp, Fut> {
    handler: Arc<F>,
    marshallers: Marshallers<Req, Resp>,
    _phantom: PhantomData<fn(Req) -> Fut>,
}

impl<F, Req, Resp, Fut> Handler for UnaryHandler<F, Req, Resp, Fut>
where
    F: Fn(Req, PipeCallContext) -> Fut + Send + Sync + 'static,
    Req: Send + 'static,
    Resp: Send + 'static,
    Fut: Future<Output = Result<Resp>> + Send + 'static,
{
    fn method_type(&self) -> MethodType {
        MethodType::Unary
    }

    fn call(&self, ctx: PipeCallContext) -> BoxFuture<'static, Result<Option<Bytes>>> {
        let handler = Arc::clone(&self.handler);
        let requests = self.marshallers.reader(&ctx);
        let response = Arc::clone(&self.marshallers.response);
        Box::pin(async move {
            let request = requests.read_next_message().await?;
            let reply = handler(request, ctx).await?;
            response.serialize(&reply).map(Some)
        })
    }
}

struct ClientStreamingHandler<F, Req, Resp, Fut> {
    handler: Arc<F>,
    marshallers: Marshallers<Req, Resp>,
    _phantom: PhantomData<fn(Req) -> Fut>,
}

impl<F, Req, Resp, Fut> Handler for ClientStreamingHandler<F, Req, Resp, Fut>
where
    F: Fn(MessageReader<Req>, PipeCallContext) -> Fut + Send + Sync + 'static,
    Req: Send + 'static,
    Resp: Send + 'static,
    Fut: Future<Output = Result<Resp>> + Send + 'static,
{
    fn method_type(&self) -> MethodType {
        MethodType::ClientStreaming
    }

    fn call(&self, ctx: PipeCallContext) -> BoxFuture<'static, Result<Option<Bytes>>> {
        let requests = self.marshallers.reader(&ctx);
        let response = Arc::clone(&self.marshallers.response);
        let reply = (self.handler)(requests, ctx);
        Box::pin(async move { response.serialize(&reply.await?).map(Some) })
    }
}

struct ServerStreamingHandler<F, Req, Resp, Fut> {
    handler: Arc<F>,
    marshallers: Marshallers<Req, Resp>,
    _phantom: PhantomData<fn(Req) -> Fut>,
}

impl<F, Req, Resp, Fut> Handler for ServerStreamingHandler<F, Req, Resp, Fut>
where
    F: Fn(Req, ResponseStreamWriter<Resp>, PipeCallContext) -> Fut + Send + Sync + 'static,
    Req: Send + 'static,
    Resp: Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    fn method_type(&self) -> MethodType {
        MethodType::ServerStreaming
    }

    fn call(&self, ctx: PipeCallContext) -> BoxFuture<'static, Result<Option<Bytes>>> {
        let handler = Arc::clone(&self.handler);
        let requests = self.marshallers.reader(&ctx);
        let responses = self.marshallers.writer(&ctx);
        Box::pin(async move {
            let request = requests.read_next_message().await?;
            handler(request, responses, ctx).await?;
            Ok(None)
        })
    }
}

struct DuplexStreamingHandler<F, Req, Resp, Fut> {
    handler: Arc<F>,
    marshallers: Marshallers<Req, Resp>,
    _phantom: PhantomData<fn(Req) -> Fut>,
}

impl<F, Req, Resp, Fut> Handler for DuplexStreamingHandler<F, Req, Resp, Fut>
where
    F: Fn(MessageReader<Req>, ResponseStreamWriter<Resp>, PipeCallContext) -> Fut
        + Send
        + Sync
        + 'static,
    Req: Send + 'static,
    Resp: Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    fn method_type(&self) -> MethodType {
        MethodType::DuplexStreaming
    }

    fn call(&self, ctx: PipeCallContext) -> BoxFuture<'static, Result<Option<Bytes>>> {
        let requests = self.marshallers.reader(&ctx);
        let responses = self.marshallers.writer(&ctx);
        let done = (self.handler)(requests, responses, ctx);
        Box::pin(async move {
            done.await?;
            Ok(None)
        })
    }
}

/// Registry mapping full method names to handlers.
///
/// Registering a second handler under the same name replaces the first.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn Handler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a unary handler: one request in, one response out.
    pub fn add_unary<Req, Resp, F, Fut>(&mut self, method: &Method<Req, Resp>, handler: F)
    where
        F: Fn(Req, PipeCallContext) -> Fut + Send + Sync + 'static,
        Req: Send + 'static,
        Resp: Send + 'static,
        Fut: Future<Output = Result<Resp>> + Send + 'static,
    {
        self.insert(
            method,
            UnaryHandler {
                handler: Arc::new(handler),
                marshallers: Marshallers::of(method),
                _phantom: PhantomData,
            },
        );
    }

    /// Register a client-streaming handler: a request stream in, one
    /// response out.
    pub fn add_client_streaming<Req, Resp, F, Fut>(&mut self, method: &Method<Req, Resp>, handler: F)
    where
        F: Fn(MessageReader<Req>, PipeCallContext) -> Fut + Send + Sync + 'static,
        Req: Send + 'static,
        Resp: Send + 'static,
        Fut: Future<Output = Result<Resp>> + Send + 'static,
    {
        self.insert(
            method,
            ClientStreamingHandler {
                handler: Arc::new(handler),
                marshallers: Marshallers::of(method),
                _phantom: PhantomData,
            },
        );
    }

    /// Register a server-streaming handler: one request in, responses
    /// written to the stream.
    pub fn add_server_streaming<Req, Resp, F, Fut>(&mut self, method: &Method<Req, Resp>, handler: F)
    where
        F: Fn(Req, ResponseStreamWriter<Resp>, PipeCallContext) -> Fut + Send + Sync + 'static,
        Req: Send + 'static,
        Resp: Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.insert(
            method,
            ServerStreamingHandler {
                handler: Arc::new(handler),
                marshallers: Marshallers::of(method),
                _phantom: PhantomData,
            },
        );
    }

    pub fn add_duplex_streaming<Req, Resp, F, Fut>(&mut self, method: &Method<Req, Resp>, handler: F)
    where
        F: Fn(MessageReader<Req>, ResponseStreamWriter<Resp>, PipeCallContext) -> Fut
            + Send
            + Sync
            + 'static,
        Req: Send + 'static,
        Resp: Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.insert(
            method,
            DuplexStreamingHandler {
                handler: Arc::new(handler),
                marshallers: Marshallers::of(method),
                _phantom: PhantomData,
            },
        );
    }

    fn insert<Req, Resp>(&mut self, method: &Method<Req, Resp>, handler: impl Handler) {
        if handler.method_type() != method.method_type() {
            tracing::warn!(
                "Registering {:?} handler for {:?} method '{}'",
                handler.method_type(),
                method.method_type(),
                method.full_name()
            );
        }
        self.handlers
            .insert(method.full_name().to_string(), Arc::new(handler));
    }

    pub(crate) fn get(&self, method_full_name: &str) -> Option<Arc<dyn Handler>> {
        self.handlers.get(method_full_name).cloned()
    }

    pub fn contains(&self, method_full_name: &str) -> bool {
        self.handlers.contains_key(method_full_name)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("methods", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unary() -> Method<i32, i32> {
        Method::msgpack(MethodType::Unary, "Test", "Echo")
    }

    fn server_streaming() -> Method<i32, i32> {
        Method::msgpack(MethodType::ServerStreaming, "Test", "Count")
    }

    #[test]
    fn test_lookup_by_full_name() {
        let mut registry = HandlerRegistry::new();
        registry.add_unary(&unary(), |v: i32, _ctx| async move { Ok(v) });
        registry.add_server_streaming(&server_streaming(), |_: i32, _out, _ctx| async move { Ok(()) });

        assert_eq!(registry.len(), 2);
        assert!(registry.contains("/Test/Echo"));
        assert_eq!(
            registry.get("/Test/Count").map(|h| h.method_type()),
            Some(MethodType::ServerStreaming)
        );
    }

    #[test]
    fn test_handler_not_found() {
        let registry = HandlerRegistry::new();
        assert!(registry.is_empty());
        assert!(registry.get("/Test/Missing").is_none());
    }

    #[test]
    fn test_reregistering_replaces() {
        let mut registry = HandlerRegistry::new();
        registry.add_unary(&unary(), |v: i32, _ctx| async move { Ok(v) });
        registry.add_client_streaming(&unary(), |_requests, _ctx| async move { Ok(0) });

        assert_eq!(registry.len(), 1);
        assert_eq!(
            registry.get("/Test/Echo").map(|h| h.method_type()),
            Some(MethodType::ClientStreaming)
        );
    }
}

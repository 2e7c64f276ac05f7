//! Method descriptors shared by clients and servers.

use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::codec::{Marshaller, MsgPackCodec};

/// Streaming shape of a method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodType {
    Unary,
    ClientStreaming,
    ServerStreaming,
    DuplexStreaming,
}

impl MethodType {
    /// Whether the client sends more than one message.
    pub fn is_request_streaming(self) -> bool {
        matches!(self, MethodType::ClientStreaming | MethodType::DuplexStreaming)
    }

    /// Whether the server sends more than one message.
    pub fn is_response_streaming(self) -> bool {
        matches!(self, MethodType::ServerStreaming | MethodType::DuplexStreaming)
    }
}

/// A callable method: its full name, shape, and message marshallers.
///
/// The full name is `/{service}/{method}` and is what travels in
/// `RequestInit`.
pub struct Method<Req, Resp> {
    method_type: MethodType,
    full_name: String,
    request_marshaller: Arc<dyn Marshaller<Req>>,
    response_marshaller: Arc<dyn Marshaller<Resp>>,
}

impl<Req, Resp> Method<Req, Resp> {
    pub fn new(
        method_type: MethodType,
        service: &str,
        name: &str,
        request_marshaller: impl Marshaller<Req> + 'static,
        response_marshaller: impl Marshaller<Resp> + 'static,
    ) -> Self {
        Self {
            method_type,
            full_name: format!("/{}/{}", service, name),
            request_marshaller: Arc::new(request_marshaller),
            response_marshaller: Arc::new(response_marshaller),
        }
    }

    #[inline]
    pub fn method_type(&self) -> MethodType {
        self.method_type
    }

    #[inline]
    pub fn full_name(&self) -> &str {
        &self.full_name
    }

    pub fn request_marshaller(&self) -> &Arc<dyn Marshaller<Req>> {
        &self.request_marshaller
    }

    pub fn response_marshaller(&self) -> &Arc<dyn Marshaller<Resp>> {
        &self.response_marshaller
    }
}

impl<Req, Resp> Method<Req, Resp>
where
    Req: Serialize + DeserializeOwned + 'static,
    Resp: Serialize + DeserializeOwned + 'static,
{
    /// Method whose request and response are MessagePack-encoded serde types.
    pub fn msgpack(method_type: MethodType, service: &str, name: &str) -> Self {
        Self::new(method_type, service, name, MsgPackCodec, MsgPackCodec)
    }
}

impl<Req, Resp> Clone for Method<Req, Resp> {
    fn clone(&self) -> Self {
        Self {
            method_type: self.method_type,
            full_name: self.full_name.clone(),
            request_marshaller: Arc::clone(&self.request_marshaller),
            response_marshaller: Arc::clone(&self.response_marshaller),
        }
    }
}

impl<Req, Resp> fmt::Debug for Method<Req, Resp> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Method")
            .field("method_type", &self.method_type)
            .field("full_name", &self.full_name)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use crate::codec::RawCodec;

    #[test]
    fn test_full_name() {
        let method: Method<i32, i32> = Method::msgpack(MethodType::Unary, "Test", "SimpleUnary");
        assert_eq!(method.full_name(), "/Test/SimpleUnary");
        assert_eq!(method.clone().method_type(), MethodType::Unary);
    }

    #[test]
    fn test_streaming_shape() {
        assert!(!MethodType::Unary.is_request_streaming());
        assert!(MethodType::ClientStreaming.is_request_streaming());
        assert!(MethodType::DuplexStreaming.is_response_streaming());
        assert!(!MethodType::ClientStreaming.is_response_streaming());
    }

    #[test]
    fn test_raw_method_marshallers() {
        let method: Method<Bytes, Bytes> =
            Method::new(MethodType::Unary, "Raw", "Echo", RawCodec, RawCodec);
        let payload = method
            .request_marshaller()
            .serialize(&Bytes::from_static(b"abc"))
            .unwrap();
        assert_eq!(&payload[..], b"abc");
    }
}

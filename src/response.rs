//! The [`Response`] returned from a successful [`crate::executor::RequestExecutor`] call.

use std::time::Duration;

use futures::Stream;
use http::HeaderMap;

use crate::error::RequestError;

/// Which transport actually served the response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolTag {
    H1,
    H2,
}

/// Capability interface over a response body: consumers depend on this
/// trait, not a concrete `Fixed`/`Chunked`/`H2Stream` type.
#[async_trait::async_trait]
pub trait BodyReader: Send {
    async fn read_all(&mut self) -> Result<bytes::Bytes, RequestError>;

    async fn read_text(&mut self) -> Result<String, RequestError> {
        let bytes = self.read_all().await?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| RequestError::protocol(self.request_id(), format!("invalid utf-8 body: {e}")))
    }

    /// Stream of body chunks in wire order, without buffering the whole body.
    fn stream_chunks(self: Box<Self>) -> std::pin::Pin<Box<dyn Stream<Item = Result<bytes::Bytes, RequestError>> + Send>>;

    fn request_id(&self) -> crate::ids::RequestId;
}

/// Decode a body as JSON. A free function rather than a `BodyReader` method
/// so the trait stays object-safe — a generic method would rule out
/// `Box<dyn BodyReader>`.
pub async fn read_json<T: serde::de::DeserializeOwned>(body: &mut dyn BodyReader) -> Result<T, RequestError> {
    let bytes = body.read_all().await?;
    serde_json::from_slice(&bytes).map_err(|e| RequestError::protocol(body.request_id(), format!("invalid json body: {e}")))
}

/// A body already fully received into one buffer (`Content-Length` framing,
/// or a fully-drained chunked body).
pub struct FixedBody {
    data: Option<bytes::Bytes>,
    id: crate::ids::RequestId,
}

impl FixedBody {
    pub fn new(data: bytes::Bytes, id: crate::ids::RequestId) -> Self {
        Self { data: Some(data), id }
    }
}

#[async_trait::async_trait]
impl BodyReader for FixedBody {
    async fn read_all(&mut self) -> Result<bytes::Bytes, RequestError> {
        Ok(self.data.take().unwrap_or_default())
    }

    fn stream_chunks(
        self: Box<Self>,
    ) -> std::pin::Pin<Box<dyn Stream<Item = Result<bytes::Bytes, RequestError>> + Send>> {
        let chunk = self.data.unwrap_or_default();
        Box::pin(futures::stream::once(async move { Ok(chunk) }))
    }

    fn request_id(&self) -> crate::ids::RequestId {
        self.id
    }
}

/// A streamed body (HTTP/1.1 chunked transfer, or an HTTP/2 DATA stream)
/// drained from a bounded channel fed by the owning connection.
pub struct ChannelBody {
    receiver: tokio::sync::mpsc::Receiver<Result<bytes::Bytes, RequestError>>,
    id: crate::ids::RequestId,
}

impl ChannelBody {
    pub fn new(
        receiver: tokio::sync::mpsc::Receiver<Result<bytes::Bytes, RequestError>>,
        id: crate::ids::RequestId,
    ) -> Self {
        Self { receiver, id }
    }
}

#[async_trait::async_trait]
impl BodyReader for ChannelBody {
    async fn read_all(&mut self) -> Result<bytes::Bytes, RequestError> {
        let mut buf = bytes::BytesMut::new();
        while let Some(chunk) = self.receiver.recv().await {
            buf.extend_from_slice(&chunk?);
        }
        Ok(buf.freeze())
    }

    fn stream_chunks(
        mut self: Box<Self>,
    ) -> std::pin::Pin<Box<dyn Stream<Item = Result<bytes::Bytes, RequestError>> + Send>> {
        Box::pin(async_stream::stream! {
            while let Some(chunk) = self.receiver.recv().await {
                yield chunk;
            }
        })
    }

    fn request_id(&self) -> crate::ids::RequestId {
        self.id
    }
}

/// An HTTP response. Body access is lazy via [`BodyReader`]; closing the
/// body handle (dropping it) releases the owning connection back to the
/// pool (H1) or closes the stream (H2), per §4.9's executor step 6.
pub struct Response {
    status: http::StatusCode,
    reason: String,
    headers: HeaderMap,
    body: Box<dyn BodyReader>,
    elapsed: Duration,
    protocol: ProtocolTag,
    final_url: http::Uri,
}

impl Response {
    pub fn new(
        status: http::StatusCode,
        reason: String,
        headers: HeaderMap,
        body: Box<dyn BodyReader>,
        elapsed: Duration,
        protocol: ProtocolTag,
        final_url: http::Uri,
    ) -> Self {
        Self {
            status,
            reason,
            headers,
            body,
            elapsed,
            protocol,
            final_url,
        }
    }

    pub fn status(&self) -> http::StatusCode {
        self.status
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body_mut(&mut self) -> &mut (dyn BodyReader + 'static) {
        &mut *self.body
    }

    pub fn into_body(self) -> Box<dyn BodyReader> {
        self.body
    }

    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    pub fn protocol(&self) -> ProtocolTag {
        self.protocol
    }

    pub fn final_url(&self) -> &http::Uri {
        &self.final_url
    }

    /// Raise `HTTPError` for 4xx/5xx statuses; a no-op for everything else.
    pub fn raise_for_status(&self, id: crate::ids::RequestId) -> Result<(), RequestError> {
        if self.status.is_client_error() || self.status.is_server_error() {
            Err(RequestError::http(id, self.status.as_u16(), self.reason.clone()))
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::RequestIdGenerator;

    #[tokio::test]
    async fn fixed_body_read_all_returns_bytes() {
        let id = RequestIdGenerator::new().next_id();
        let mut body = FixedBody::new(bytes::Bytes::from_static(b"hi"), id);
        assert_eq!(body.read_all().await.unwrap(), bytes::Bytes::from_static(b"hi"));
    }

    #[tokio::test]
    async fn fixed_body_read_text() {
        let id = RequestIdGenerator::new().next_id();
        let mut body = FixedBody::new(bytes::Bytes::from_static(b"hello"), id);
        assert_eq!(body.read_text().await.unwrap(), "hello");
    }

    #[tokio::test]
    async fn read_json_decodes_through_trait_object() {
        let id = RequestIdGenerator::new().next_id();
        let mut body: Box<dyn BodyReader> = Box::new(FixedBody::new(bytes::Bytes::from_static(b"[1,2,3]"), id));
        let values: Vec<u32> = read_json(&mut *body).await.unwrap();
        assert_eq!(values, vec![1, 2, 3]);
    }

    #[test]
    fn raise_for_status_is_ok_for_2xx() {
        let id = RequestIdGenerator::new().next_id();
        let body = FixedBody::new(bytes::Bytes::new(), id);
        let response = Response::new(
            http::StatusCode::OK,
            "OK".into(),
            HeaderMap::new(),
            Box::new(body),
            Duration::from_millis(1),
            ProtocolTag::H1,
            "http://example.com/".parse().unwrap(),
        );
        assert!(response.raise_for_status(id).is_ok());
    }

    #[test]
    fn raise_for_status_errors_for_5xx() {
        let id = RequestIdGenerator::new().next_id();
        let body = FixedBody::new(bytes::Bytes::new(), id);
        let response = Response::new(
            http::StatusCode::SERVICE_UNAVAILABLE,
            "Service Unavailable".into(),
            HeaderMap::new(),
            Box::new(body),
            Duration::from_millis(1),
            ProtocolTag::H1,
            "http://example.com/".parse().unwrap(),
        );
        assert!(response.raise_for_status(id).unwrap_err().is_server_error());
    }
}

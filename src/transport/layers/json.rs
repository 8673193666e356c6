use crate::transport::{Outgoing, RawPayload};
use std::{future::Future, pin::Pin};
use tower::{Layer, Service};

/// Tower `Service` wrapper that serializes messages to JSON.
///
/// Converts any message type `M` implementing `serde::Serialize` into a
/// `RawPayload` holding the JSON bytes before passing it to the inner
/// service. Field naming is whatever the message's serde attributes say;
/// every message in this crate uses lower camel case.
#[derive(Clone)]
pub struct JsonService<T> {
    inner: T,
}

impl<T, M> Service<Outgoing<M>> for JsonService<T>
where
    M: serde::Serialize + Send + 'static,
    T: Service<Outgoing<RawPayload>> + Clone + Send + 'static,
    <T as Service<Outgoing<RawPayload>>>::Error: Into<tower::BoxError>,
    T::Future: Send + 'static,
{
    type Response = T::Response;
    type Error = tower::BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(
        &mut self,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(Into::into)
    }

    fn call(&mut self, req: Outgoing<M>) -> Self::Future {
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            let bytes = serde_json::to_vec(&req.message)?;
            let outgoing = Outgoing {
                queue: req.queue,
                message: RawPayload(bytes),
            };

            inner.call(outgoing).await.map_err(Into::into)
        })
    }
}

/// Tower `Layer` that applies `JsonService` to a service stack.
pub struct JsonLayer;

impl<S> Layer<S> for JsonLayer {
    type Service = JsonService<S>;

    fn layer(&self, service: S) -> Self::Service {
        JsonService { inner: service }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{InMemory, Transport};
    use tower::ServiceExt;

    #[derive(serde::Serialize)]
    #[serde(rename_all = "camelCase")]
    struct Sample {
        page_count: u32,
    }

    #[tokio::test]
    async fn serializes_before_sending() {
        let sender: InMemory<RawPayload> = InMemory::default();
        let transport = Transport::new(sender.clone()).layer(JsonLayer);

        transport
            .oneshot(Outgoing::new("books", Sample { page_count: 12 }))
            .await
            .unwrap();

        let sent = sender.sent_messages().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].queue, "books");
        assert_eq!(sent[0].message.0, br#"{"pageCount":12}"#.to_vec());
    }
}

// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The gRPC transport shared by generated service clients.

use crate::Result;
use crate::call_options::{CallOptions, Metadata};
use crate::error::Error;
use crate::error::rpc::{Code, Status};
use crate::rpc_call::{AttemptOptions, Invocation, RpcCall};
use std::sync::Arc;
use tonic::transport::{Channel, ClientTlsConfig, Endpoint};

/// A callable that merges authentication metadata into the per-attempt
/// request metadata.
///
/// Updaters run on every attempt, so short-lived tokens are refreshed across
/// retries. Errors propagate through the attempt and, carrying no status,
/// are never retried.
pub type MetadataUpdater = Arc<dyn Fn(&mut Metadata) -> Result<()> + Send + Sync>;

/// Credential sources that can produce a [MetadataUpdater].
pub trait UpdaterCredentials: Send + Sync {
    fn updater(&self) -> MetadataUpdater;
}

/// The credential forms accepted when building a [ServiceStub].
///
/// Classification happens once, at construction; each variant fixes how the
/// channel is built and whether per-attempt metadata is updated:
///
/// * `Channel` adopts a prebuilt channel verbatim. The endpoint argument is
///   ignored, including its validation.
/// * `ChannelCredentials` builds a channel with the given TLS configuration.
/// * `Insecure` builds a plaintext channel, for local servers and tests.
/// * `CallCredentials` builds a channel with the default TLS configuration
///   and applies the updater to every attempt's metadata.
///
/// ```
/// use gapic_common::service_stub::Credentials;
/// let credentials = Credentials::try_from("this_channel_is_insecure")?;
/// assert!(matches!(credentials, Credentials::Insecure));
/// # Ok::<(), gapic_common::error::Error>(())
/// ```
#[derive(Clone)]
pub enum Credentials {
    Channel(Channel),
    ChannelCredentials(ClientTlsConfig),
    Insecure,
    CallCredentials(MetadataUpdater),
}

impl Credentials {
    /// Wraps a bare metadata-updating callable.
    pub fn from_updater<F>(updater: F) -> Self
    where
        F: Fn(&mut Metadata) -> Result<()> + Send + Sync + 'static,
    {
        Self::CallCredentials(Arc::new(updater))
    }

    /// Wraps a credential source.
    pub fn from_credentials<C>(credentials: &C) -> Self
    where
        C: UpdaterCredentials + ?Sized,
    {
        Self::CallCredentials(credentials.updater())
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Channel(_) => f.debug_tuple("Channel").finish(),
            Self::ChannelCredentials(tls) => f.debug_tuple("ChannelCredentials").field(tls).finish(),
            Self::Insecure => f.debug_tuple("Insecure").finish(),
            Self::CallCredentials(_) => f.debug_tuple("CallCredentials").finish(),
        }
    }
}

impl From<Channel> for Credentials {
    fn from(value: Channel) -> Self {
        Self::Channel(value)
    }
}

impl From<ClientTlsConfig> for Credentials {
    fn from(value: ClientTlsConfig) -> Self {
        Self::ChannelCredentials(value)
    }
}

impl TryFrom<&str> for Credentials {
    type Error = Error;

    /// Accepts the insecure-channel aliases. Any other string is an error.
    fn try_from(value: &str) -> Result<Self> {
        match value {
            "insecure" | "this_channel_is_insecure" => Ok(Self::Insecure),
            _ => Err(Error::invalid_argument(StubError::UnsupportedCredentials(
                value.to_string(),
            ))),
        }
    }
}

#[derive(Debug, thiserror::Error)]
enum StubError {
    #[error("unsupported credentials value {0:?}")]
    UnsupportedCredentials(String),
    #[error("the endpoint must not be empty")]
    EmptyEndpoint,
}

/// Owns the channel and credentials for one service, and dispatches method
/// calls through [RpcCall].
///
/// Construction performs no I/O: the channel connects lazily on the first
/// attempt. It must run within a tokio runtime, as the lazy channel
/// registers with the executor. Configuration problems (an empty or
/// malformed endpoint, an unsupported credentials value) are reported as
/// [invalid argument][Error::is_invalid_argument] errors before any request
/// is sent.
///
/// Stubs are cheap to clone and safe to share across tasks; concurrent calls
/// multiplex over the one channel.
#[derive(Clone)]
pub struct ServiceStub {
    inner: tonic::client::Grpc<Channel>,
    updater: Option<MetadataUpdater>,
}

impl ServiceStub {
    /// Creates a stub for `endpoint` with the given credentials.
    ///
    /// `credentials` takes anything convertible to [Credentials]; string
    /// forms go through `Credentials::try_from` first.
    pub fn new<C: Into<Credentials>>(endpoint: &str, credentials: C) -> Result<Self> {
        let (channel, updater) = match credentials.into() {
            Credentials::Channel(channel) => (channel, None),
            Credentials::ChannelCredentials(tls) => (Self::make_channel(endpoint, Some(tls))?, None),
            Credentials::Insecure => (Self::make_channel(endpoint, None)?, None),
            Credentials::CallCredentials(updater) => {
                let tls = ClientTlsConfig::new().with_native_roots();
                (Self::make_channel(endpoint, Some(tls))?, Some(updater))
            }
        };
        Ok(Self {
            inner: tonic::client::Grpc::new(channel),
            updater,
        })
    }

    fn make_channel(endpoint: &str, tls: Option<ClientTlsConfig>) -> Result<Channel> {
        if endpoint.is_empty() {
            return Err(Error::invalid_argument(StubError::EmptyEndpoint));
        }
        let mut endpoint =
            Endpoint::from_shared(endpoint.to_string()).map_err(Error::invalid_argument)?;
        if let Some(tls) = tls {
            endpoint = endpoint.tls_config(tls).map_err(Error::invalid_argument)?;
        }
        tracing::debug!("creating lazy channel for {}", endpoint.uri());
        Ok(endpoint.connect_lazy())
    }

    /// Executes `method` with retries per `options` and returns the response.
    ///
    /// `method` is the full gRPC path, e.g. `"/google.example.v1.Echo/Ping"`.
    pub async fn call_rpc<Request, Response>(
        &self,
        method: &str,
        request: Request,
        options: &CallOptions,
    ) -> Result<Response>
    where
        Request: prost::Message + Clone + 'static,
        Response: prost::Message + Default + 'static,
    {
        self.call_rpc_with(method, request, options, |response, _metadata| response)
            .await
    }

    /// Like [call_rpc][ServiceStub::call_rpc], passing the response and its
    /// trailing metadata through `handler`.
    pub async fn call_rpc_with<Request, Response, U, H>(
        &self,
        method: &str,
        request: Request,
        options: &CallOptions,
        handler: H,
    ) -> Result<U>
    where
        Request: prost::Message + Clone + 'static,
        Response: prost::Message + Default + 'static,
        H: FnMut(Response, Metadata) -> U,
    {
        let path = http::uri::PathAndQuery::try_from(method).map_err(Error::invalid_argument)?;
        let inner = self.inner.clone();
        let updater = self.updater.clone();
        let stub_method = async move |request: Request, attempt: AttemptOptions| {
            Self::request_attempt::<Request, Response>(
                &mut inner.clone(),
                updater.as_ref(),
                path.clone(),
                request,
                attempt,
            )
            .await
        };
        RpcCall::new(stub_method)
            .call_with(request, options, handler)
            .await
    }

    /// Makes a single request attempt.
    async fn request_attempt<Request, Response>(
        inner: &mut tonic::client::Grpc<Channel>,
        updater: Option<&MetadataUpdater>,
        path: http::uri::PathAndQuery,
        request: Request,
        attempt: AttemptOptions,
    ) -> Result<Invocation<Response>>
    where
        Request: prost::Message + 'static,
        Response: prost::Message + Default + 'static,
    {
        let mut metadata = attempt.metadata().clone();
        if let Some(updater) = updater {
            (*updater)(&mut metadata)?;
        }
        let headers = to_header_map(&metadata)?;
        let metadata = tonic::metadata::MetadataMap::from_headers(headers);
        let mut request = tonic::Request::from_parts(metadata, tonic::Extensions::new(), request);
        if let Some(timeout) = attempt.timeout() {
            request.set_timeout(timeout);
        }
        let codec = tonic::codec::ProstCodec::default();
        inner.ready().await.map_err(Error::transport)?;
        let response: tonic::Response<Response> =
            inner.unary(request, path, codec).await.map_err(to_error)?;
        let (metadata, response, _extensions) = response.into_parts();
        Ok(Invocation::Response(response, from_metadata_map(&metadata)))
    }
}

impl std::fmt::Debug for ServiceStub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceStub")
            .field("inner", &self.inner)
            .field("updater", &self.updater.as_ref().map(|_| ".."))
            .finish()
    }
}

/// Maps a gRPC status into the crate error, preserving the code and message
/// and keeping the transport's status as the source.
fn to_error(status: tonic::Status) -> Error {
    let payload = Status::default()
        .set_code(Code::from(status.code() as i32))
        .set_message(status.message());
    Error::service_full(payload, status)
}

fn to_header_map(metadata: &Metadata) -> Result<http::HeaderMap> {
    let mut headers = http::HeaderMap::with_capacity(metadata.len());
    for (key, value) in metadata {
        let name =
            http::header::HeaderName::try_from(key.as_str()).map_err(Error::invalid_argument)?;
        let value =
            http::header::HeaderValue::try_from(value.as_str()).map_err(Error::invalid_argument)?;
        headers.append(name, value);
    }
    Ok(headers)
}

fn from_metadata_map(metadata: &tonic::metadata::MetadataMap) -> Metadata {
    metadata
        .iter()
        .filter_map(|entry| match entry {
            tonic::metadata::KeyAndValueRef::Ascii(key, value) => value
                .to_str()
                .ok()
                .map(|v| (key.as_str().to_string(), v.to_string())),
            tonic::metadata::KeyAndValueRef::Binary(..) => None,
        })
        .collect()
}

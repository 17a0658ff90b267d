// Copyright 2024-2025 Golem Cloud
//
// Licensed under the Golem Source License v1.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://license.golem.cloud/LICENSE
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

pub mod api {
    use std::time::Instant;
    use tracing::Span;

    /// Classification of API error responses for request recording. Expected
    /// errors (client mistakes) log at info, unexpected ones at error.
    pub trait TraceErrorKind {
        fn trace_error_kind(&self) -> &'static str;

        fn is_expected(&self) -> bool {
            true
        }
    }

    /// A per-request recording handle created by `recorded_http_api_request!`.
    /// Handlers run inside `span` and finish with [`Self::result`].
    pub struct RecordedHttpApiRequest {
        pub span: Span,
        api_name: &'static str,
        start: Instant,
    }

    impl RecordedHttpApiRequest {
        pub fn new(api_name: &'static str, span: Span) -> Self {
            Self {
                span,
                api_name,
                start: Instant::now(),
            }
        }

        pub fn result<T, E: TraceErrorKind>(self, result: Result<T, E>) -> Result<T, E> {
            let elapsed_ms = self.start.elapsed().as_millis() as u64;
            self.span.in_scope(|| match &result {
                Ok(_) => {
                    tracing::debug!(api = self.api_name, elapsed_ms, "API request succeeded");
                }
                Err(error) if error.is_expected() => {
                    tracing::info!(
                        api = self.api_name,
                        elapsed_ms,
                        error_kind = error.trace_error_kind(),
                        "API request failed"
                    );
                }
                Err(error) => {
                    tracing::error!(
                        api = self.api_name,
                        elapsed_ms,
                        error_kind = error.trace_error_kind(),
                        "API request failed"
                    );
                }
            });
            result
        }
    }
}

#[macro_export]
macro_rules! recorded_http_api_request {
    ($api_name:expr $(, $key:ident = $value:expr)* $(,)?) => {
        $crate::metrics::api::RecordedHttpApiRequest::new(
            $api_name,
            ::tracing::info_span!(
                "api_request",
                api = $api_name
                $(, $key = ::tracing::field::display(&$value))*
            ),
        )
    };
}

//! Request classification.

use assetkit_net::Request;
use http::Method;
use serde::Serialize;

/// Why a request is left to the network untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PassthroughReason {
    /// Only GET requests are cacheable.
    NonGet,
    /// Path is under the API prefix.
    Api,
}

/// How the worker treats a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RequestClass {
    /// Not intercepted; the bucket is never touched.
    Passthrough(PassthroughReason),
    /// Page load: network first, cache as fallback.
    Navigation,
    /// Subresource: cache first, network on miss.
    StaticAsset,
}

/// Classify a request. Pure function of method, path and mode.
pub fn classify(request: &Request, api_prefix: &str) -> RequestClass {
    if request.method != Method::GET {
        return RequestClass::Passthrough(PassthroughReason::NonGet);
    }
    if request.url.path().starts_with(api_prefix) {
        return RequestClass::Passthrough(PassthroughReason::Api);
    }
    if request.is_navigation() {
        RequestClass::Navigation
    } else {
        RequestClass::StaticAsset
    }
}

// src/test_support.rs

use once_cell::sync::Lazy;
use spin_sdk::http::{Method, Request, Response};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use crate::ipinfo::{GeoApiResponse, GeoLookup};

#[derive(Default)]
pub(crate) struct InMemoryStore {
    map: Mutex<HashMap<String, Vec<u8>>>,
}

impl crate::kv::KeyValueStore for InMemoryStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, ()> {
        let map = self
            .map
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(map.get(key).cloned())
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<(), ()> {
        let mut map = self
            .map
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        map.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), ()> {
        let mut map = self
            .map
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        map.remove(key);
        Ok(())
    }
}

/// Scripted geo lookup. Counts calls so cache tests can assert whether the
/// upstream was consulted.
pub(crate) struct StubGeoLookup {
    response: Option<GeoApiResponse>,
    calls: Mutex<usize>,
}

impl StubGeoLookup {
    pub(crate) fn with_org(org: &str) -> Self {
        StubGeoLookup {
            response: Some(GeoApiResponse {
                city: "Testville".to_string(),
                region: "Test Region".to_string(),
                country: "US".to_string(),
                org: org.to_string(),
                ..Default::default()
            }),
            calls: Mutex::new(0),
        }
    }

    pub(crate) fn failing() -> Self {
        StubGeoLookup {
            response: None,
            calls: Mutex::new(0),
        }
    }

    pub(crate) fn calls(&self) -> usize {
        *self
            .calls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl GeoLookup for StubGeoLookup {
    fn lookup(&self, ip: &str, _timeout_seconds: u64) -> Result<GeoApiResponse, String> {
        let mut calls = self
            .calls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *calls += 1;
        match &self.response {
            Some(resp) => {
                let mut resp = resp.clone();
                if resp.ip.is_empty() {
                    resp.ip = ip.to_string();
                }
                Ok(resp)
            }
            None => Err("stubbed lookup failure".to_string()),
        }
    }
}

static ENV_MUTEX: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

/// Serializes tests that mutate process environment variables.
pub(crate) fn lock_env() -> MutexGuard<'static, ()> {
    ENV_MUTEX
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub(crate) fn request_with_headers(path: &str, headers: &[(&str, &str)]) -> Request {
    request_with_method_and_headers(Method::Get, path, headers)
}

pub(crate) fn request_with_method_and_headers(
    method: Method,
    path: &str,
    headers: &[(&str, &str)],
) -> Request {
    let mut builder = Request::builder();
    builder.method(method).uri(path);
    for (key, value) in headers {
        builder.header(*key, *value);
    }
    builder.build()
}

pub(crate) fn request_with_body(
    method: Method,
    path: &str,
    headers: &[(&str, &str)],
    body: &str,
) -> Request {
    let mut builder = Request::builder();
    builder.method(method).uri(path);
    for (key, value) in headers {
        builder.header(*key, *value);
    }
    builder.body(body.as_bytes().to_vec());
    builder.build()
}

pub(crate) fn has_header(resp: &Response, name: &str) -> bool {
    resp.headers()
        .any(|(key, _)| key.eq_ignore_ascii_case(name))
}
